//! Strongly typed file and container identifiers.
//!
//! The two identifier spaces are distinct and non-interchangeable; mixing
//! them up is a compile error rather than a runtime surprise. The value `0`
//! is reserved for "absent" and is rejected by every lookup path without
//! contacting any backend.
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileIdentifier(u64);

impl FileIdentifier {
    /// Explicit on purpose: conversions to/from `u64` should only happen at
    /// serialization boundaries.
    pub const fn new(val: u64) -> Self {
        Self(val)
    }
    pub const fn underlying(&self) -> u64 {
        self.0
    }
    /// `0` marks an absent file.
    pub const fn is_absent(&self) -> bool {
        self.0 == 0
    }
}

impl std::fmt::Display for FileIdentifier {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "file #{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContainerIdentifier(u64);

impl ContainerIdentifier {
    pub const fn new(val: u64) -> Self {
        Self(val)
    }
    pub const fn underlying(&self) -> u64 {
        self.0
    }
    pub const fn is_absent(&self) -> bool {
        self.0 == 0
    }
    /// Container `1` is the filesystem root; its parent is itself.
    pub const fn root() -> Self {
        Self(1)
    }
}

impl std::fmt::Display for ContainerIdentifier {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "container #{}", self.0)
    }
}

/// Locality hints co-locate sibling entries in the backend's ordered hash:
/// entries of one directory sort next to each other when keyed by
/// `big-endian(parent) ':' name`.
pub struct LocalityHint;

impl LocalityHint {
    pub fn build(parent: ContainerIdentifier, name: &str) -> Vec<u8> {
        let mut out = Vec::with_capacity(8 + 1 + name.len());
        out.extend_from_slice(&parent.underlying().to_be_bytes());
        out.push(b':');
        out.extend_from_slice(name.as_bytes());
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn locality_hint_injective() {
        // (parent, name) pairs that would collide under naive string
        // concatenation must stay distinct.
        let pairs = [
            (ContainerIdentifier::new(1), "a:b"),
            (ContainerIdentifier::new(1), "ab"),
            (ContainerIdentifier::new(258), "x"),
            (ContainerIdentifier::new(2), "x"),
            (ContainerIdentifier::new(0x3a), "x"),
        ];
        let hints: std::collections::BTreeSet<_> = pairs
            .iter()
            .map(|(p, n)| LocalityHint::build(*p, n))
            .collect();
        assert_eq!(hints.len(), pairs.len());
    }

    #[test]
    fn locality_hint_orders_siblings_together() {
        let parent = ContainerIdentifier::new(77);
        let other = ContainerIdentifier::new(78);
        let a = LocalityHint::build(parent, "a");
        let b = LocalityHint::build(parent, "z");
        let c = LocalityHint::build(other, "a");
        assert!(a < b && b < c);
    }

    #[test]
    fn absent_ids() {
        assert!(FileIdentifier::new(0).is_absent());
        assert!(!FileIdentifier::new(42).is_absent());
        assert_eq!(ContainerIdentifier::root().underlying(), 1);
    }
}
