//! Narrow interfaces to the remote collaborators.
//!
//! The caching core talks to two external services: a key/value metadata
//! store and a request/response file service. Both are consumed through the
//! traits below; their wire protocols are out of scope. Tests plug in
//! in-memory implementations with operation counters.
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::error::Error;

/// Pub/sub channel carrying file invalidation messages (decimal ASCII ids).
pub const CHANNEL_FILE_INVALIDATION: &str = "fscache-md-invalidate-files";
/// Pub/sub channel carrying container invalidation messages.
pub const CHANNEL_CONTAINER_INVALIDATION: &str = "fscache-md-invalidate-containers";

bitflags::bitflags! {
    /// Open flags understood by the remote file service.
    pub struct OpenFlags: u32 {
        const READ     = 1 << 0;
        const WRITE    = 1 << 1;
        const CREATE   = 1 << 2;
        const TRUNCATE = 1 << 3;
        const APPEND   = 1 << 4;
    }
}

/// Status code classification of a remote file operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    Ok,
    ConnectionError,
    SocketTimeout,
    OperationExpired,
    SocketDisconnected,
    NoServer,
    FsError,
    IoError,
    NotFound,
    PermissionDenied,
    InvalidRequest,
    Error,
}

impl StatusCode {
    /// Errors worth a reopen attempt: the server may come back, or another
    /// replica may answer.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StatusCode::ConnectionError
                | StatusCode::SocketTimeout
                | StatusCode::OperationExpired
                | StatusCode::SocketDisconnected
                | StatusCode::NoServer
                | StatusCode::FsError
                | StatusCode::IoError
        )
    }
}

/// Typed status of a remote file operation: code, errno and a human
/// readable line, plus an optional server-suggested redirection target.
#[derive(Debug, Clone)]
pub struct RemoteStatus {
    pub code: StatusCode,
    pub errno: i32,
    pub message: String,
    pub redirect: Option<String>,
}

impl RemoteStatus {
    pub fn ok() -> Self {
        Self {
            code: StatusCode::Ok,
            errno: 0,
            message: String::new(),
            redirect: None,
        }
    }
    pub fn error(code: StatusCode, message: impl Into<String>) -> Self {
        Self {
            code,
            errno: 0,
            message: message.into(),
            redirect: None,
        }
    }
    pub fn with_errno(mut self, errno: i32) -> Self {
        self.errno = errno;
        self
    }
    pub fn redirect_to(target: impl Into<String>) -> Self {
        Self {
            redirect: Some(target.into()),
            ..Self::ok()
        }
    }
    pub fn is_ok(&self) -> bool {
        self.code == StatusCode::Ok && self.redirect.is_none()
    }
    pub fn should_retry(&self) -> bool {
        self.code.is_transient()
    }

    /// Map a failed status into the error taxonomy; `None` when ok.
    pub fn to_error(&self) -> Option<Error> {
        if self.is_ok() {
            return None;
        }
        Some(if self.code == StatusCode::NotFound {
            Error::NotFound(self.message.clone())
        } else if self.should_retry() {
            Error::TransientRemote(self.clone())
        } else {
            Error::FatalRemote(self.clone())
        })
    }
}

impl std::fmt::Display for RemoteStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "[{:?} errno={} {:?}]",
            self.code, self.errno, self.message
        )
    }
}

/// Asynchronous remote file handle, as exposed by the storage service
/// client. One instance backs one `FileProxy`.
///
/// All operations carry a per-call timeout; expiry must surface as a status
/// with `StatusCode::OperationExpired`, never as a silent no-op.
#[async_trait::async_trait]
pub trait RemoteFile: Send + Sync + 'static {
    async fn open(
        &self,
        url: &str,
        flags: OpenFlags,
        mode: u32,
        timeout: Duration,
    ) -> RemoteStatus;
    /// Read up to `buf.len()` bytes at `offset`; returns the status and the
    /// number of bytes placed in `buf` (short on EOF).
    async fn read(&self, offset: u64, buf: &mut [u8], timeout: Duration) -> (RemoteStatus, u32);
    async fn write(&self, offset: u64, data: &[u8], timeout: Duration) -> RemoteStatus;
    async fn truncate(&self, size: u64, timeout: Duration) -> RemoteStatus;
    async fn sync(&self, timeout: Duration) -> RemoteStatus;
    async fn close(&self, timeout: Duration) -> RemoteStatus;
}

/// Key/value metadata store client.
///
/// Besides plain keys the store offers hash objects and an ordered hash
/// whose fields sort bytewise; the fetcher keys the latter with locality
/// hints so sibling entries are co-located. Fields are raw bytes (locality
/// hints embed a big-endian id). The write-side operations (`set`, `hset`,
/// `hdel`) belong to the owning metadata service; the caching core only
/// reads and subscribes.
#[async_trait::async_trait]
pub trait MetadataStore: Send + Sync + 'static {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, Error>;
    async fn set(&self, key: &str, value: Bytes) -> Result<(), Error>;
    async fn hget(&self, key: &str, field: &[u8]) -> Result<Option<Bytes>, Error>;
    async fn hset(&self, key: &str, field: &[u8], value: Bytes) -> Result<(), Error>;
    async fn hlen(&self, key: &str) -> Result<u64, Error>;
    async fn hdel(&self, key: &str, field: &[u8]) -> Result<bool, Error>;
    /// All `(field, value)` pairs of a hash, in field order.
    async fn hgetall(&self, key: &str) -> Result<Vec<(Bytes, Bytes)>, Error>;
    /// Subscribe to a pub/sub channel; messages arrive on the receiver until
    /// the store client goes away.
    async fn subscribe(&self, channel: &str) -> Result<mpsc::Receiver<Bytes>, Error>;
}
