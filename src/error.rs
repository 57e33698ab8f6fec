//! Caching core error taxonomy.
use std::sync::Arc;

use crate::remote::RemoteStatus;

/// Main error type.
///
/// Errors are cloneable so they can travel through shared (coalesced)
/// futures: every caller attached to the same staged retrieval observes the
/// same failure.
#[derive(thiserror::Error, Debug, Clone)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("already exists: {0}")]
    AlreadyExists(String),
    /// Cookie mismatch on attach. Non-fatal: the attach is granted, the
    /// cached content has been invalidated.
    #[error("stale cached content (cookie mismatch)")]
    Stale,
    #[error("transient remote failure: {0}")]
    TransientRemote(RemoteStatus),
    #[error("fatal remote failure: {0}")]
    FatalRemote(RemoteStatus),
    /// The per-file journal cap would be exceeded and the caller declined to
    /// block on the flusher.
    #[error("journal quota exceeded")]
    QuotaExceeded,
    #[error("checksum mismatch in serialized metadata")]
    ChecksumMismatch,
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    #[error("I/O failure: {source}")]
    Io {
        #[source]
        source: Arc<std::io::Error>,
    },
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),
    #[error("executor failure: {0}")]
    Executor(String),
}

impl From<std::io::Error> for Error {
    fn from(source: std::io::Error) -> Self {
        Self::Io {
            source: Arc::new(source),
        }
    }
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::AlreadyExists(_) => ErrorKind::AlreadyExists,
            Error::Stale => ErrorKind::Stale,
            Error::TransientRemote(_) => ErrorKind::TransientRemote,
            Error::FatalRemote(_) => ErrorKind::FatalRemote,
            Error::QuotaExceeded => ErrorKind::QuotaExceeded,
            Error::ChecksumMismatch => ErrorKind::ChecksumMismatch,
            Error::InvalidArgument(_) => ErrorKind::InvalidArgument,
            Error::Io { .. } | Error::Decode(_) | Error::Executor(_) => ErrorKind::Internal,
        }
    }

    /// Remote status attached to the error, if any.
    pub fn remote_status(&self) -> Option<&RemoteStatus> {
        match self {
            Error::TransientRemote(st) | Error::FatalRemote(st) => Some(st),
            _ => None,
        }
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }
}

/// Uniform error classification, decoupled from payload details.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    AlreadyExists,
    Stale,
    TransientRemote,
    FatalRemote,
    QuotaExceeded,
    ChecksumMismatch,
    InvalidArgument,
    Internal,
}

/// Metadata blob decoding error.
#[derive(thiserror::Error, Debug, Clone)]
pub enum DecodeError {
    #[error("blob too short for checksum frame")]
    Truncated,
    #[error("payload deserialization failed: {0}")]
    Payload(String),
    #[error("non UTF-8 name in backend response")]
    Utf8,
    #[error("malformed decimal identifier in backend response")]
    Ascii,
}
