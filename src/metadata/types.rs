//! Typed file and container metadata, and the checksummed blob codec.
//!
//! Backend blobs are the bincode encoding of the struct followed by a
//! CRC32 (little endian) over the payload. Maps serialize from `BTreeMap`s
//! so encoding is deterministic: serialize → deserialize → serialize is
//! byte-identical, and any bit flip fails the checksum rather than
//! producing silently wrong metadata.
use std::collections::BTreeMap;
use std::time::SystemTime;

use bytes::Bytes;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::error::{DecodeError, Error};
use crate::ids::{ContainerIdentifier, FileIdentifier};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileMetadata {
    pub id: FileIdentifier,
    pub container: ContainerIdentifier,
    pub name: String,
    pub size: u64,
    pub uid: u32,
    pub gid: u32,
    pub layout_id: u32,
    pub flags: u16,
    pub ctime: SystemTime,
    pub mtime: SystemTime,
    /// Opaque content checksum owned by the storage layer.
    pub checksum: Vec<u8>,
    /// Current storage locations; duplicate-free.
    pub locations: Vec<u32>,
    /// Locations a previous unlink left behind.
    pub unlink_locations: Vec<u32>,
    /// Symlink target; non-empty iff this entry is a symbolic link.
    pub link: String,
    pub xattrs: BTreeMap<String, String>,
}

impl FileMetadata {
    pub fn new(id: FileIdentifier, container: ContainerIdentifier, name: impl Into<String>) -> Self {
        let now = SystemTime::now();
        Self {
            id,
            container,
            name: name.into(),
            size: 0,
            uid: 0,
            gid: 0,
            layout_id: 0,
            flags: 0,
            ctime: now,
            mtime: now,
            checksum: Vec::new(),
            locations: Vec::new(),
            unlink_locations: Vec::new(),
            link: String::new(),
            xattrs: BTreeMap::new(),
        }
    }

    pub fn is_link(&self) -> bool {
        !self.link.is_empty()
    }

    pub fn add_location(&mut self, location: u32) {
        if !self.locations.contains(&location) {
            self.locations.push(location);
        }
    }

    /// Structural invariants checked before anything is written back.
    pub fn validate(&self) -> Result<(), Error> {
        if self.name.is_empty() {
            return Err(Error::InvalidArgument("file metadata with empty name"));
        }
        if has_duplicates(&self.locations) || has_duplicates(&self.unlink_locations) {
            return Err(Error::InvalidArgument("duplicate storage locations"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerMetadata {
    pub id: ContainerIdentifier,
    pub parent: ContainerIdentifier,
    pub name: String,
    pub uid: u32,
    pub gid: u32,
    pub mode: u32,
    pub flags: u16,
    pub ctime: SystemTime,
    pub mtime: SystemTime,
    /// Propagated modification time of the subtree.
    pub tmtime: SystemTime,
    /// Accumulated subtree size.
    pub tree_size: u64,
    pub xattrs: BTreeMap<String, String>,
    /// Child files by name.
    pub files: BTreeMap<String, FileIdentifier>,
    /// Child containers by name.
    pub containers: BTreeMap<String, ContainerIdentifier>,
}

impl ContainerMetadata {
    pub fn new(id: ContainerIdentifier, parent: ContainerIdentifier, name: impl Into<String>) -> Self {
        let now = SystemTime::now();
        Self {
            id,
            parent,
            name: name.into(),
            uid: 0,
            gid: 0,
            mode: 0o755,
            flags: 0,
            ctime: now,
            mtime: now,
            tmtime: now,
            tree_size: 0,
            xattrs: BTreeMap::new(),
            files: BTreeMap::new(),
            containers: BTreeMap::new(),
        }
    }

    pub fn is_root(&self) -> bool {
        self.id == ContainerIdentifier::root()
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.name.is_empty() && !self.is_root() {
            return Err(Error::InvalidArgument("container metadata with empty name"));
        }
        if self.is_root() && self.parent != self.id {
            return Err(Error::InvalidArgument("root container must be its own parent"));
        }
        Ok(())
    }
}

fn has_duplicates(v: &[u32]) -> bool {
    let mut seen = std::collections::BTreeSet::new();
    v.iter().any(|x| !seen.insert(*x))
}

/// Encode a metadata payload with a trailing CRC32.
pub fn encode_blob<T: Serialize>(value: &T) -> Result<Bytes, Error> {
    let mut payload =
        bincode::serialize(value).map_err(|e| DecodeError::Payload(e.to_string()))?;
    let crc = crc32fast::hash(&payload);
    payload.extend_from_slice(&crc.to_le_bytes());
    Ok(payload.into())
}

/// Decode a checksummed blob; a checksum mismatch is surfaced, never
/// repaired.
pub fn decode_blob<T: DeserializeOwned>(blob: &[u8]) -> Result<T, Error> {
    if blob.len() < 4 {
        return Err(DecodeError::Truncated.into());
    }
    let (payload, tail) = blob.split_at(blob.len() - 4);
    let stored = u32::from_le_bytes(tail.try_into().unwrap());
    if crc32fast::hash(payload) != stored {
        return Err(Error::ChecksumMismatch);
    }
    bincode::deserialize(payload).map_err(|e| DecodeError::Payload(e.to_string()).into())
}
