//! Asynchronous write chunks.
//!
//! A write handler wraps a pooled buffer carrying the payload of one
//! remote write. Handlers are registered in the proxy's in-flight map
//! keyed by their address and either submitted directly or parked in the
//! write queue for batched submission.
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::pools::PooledBuffer;
use crate::remote::RemoteStatus;

pub type WriteHandler = Arc<WriteChunk>;

#[derive(Debug)]
pub struct WriteChunk {
    offset: u64,
    timeout: Duration,
    buffer: Mutex<Option<PooledBuffer>>,
    len: AtomicUsize,
    done: AtomicBool,
    status: Mutex<RemoteStatus>,
    pub(crate) notify: Notify,
    created: tokio::time::Instant,
}

impl WriteChunk {
    pub(crate) fn new(offset: u64, timeout: Duration, buffer: PooledBuffer) -> WriteHandler {
        Arc::new(Self {
            offset,
            timeout,
            len: AtomicUsize::new(buffer.len()),
            buffer: Mutex::new(Some(buffer)),
            done: AtomicBool::new(false),
            status: Mutex::new(RemoteStatus::ok()),
            notify: Notify::new(),
            created: tokio::time::Instant::now(),
        })
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }
    pub fn timeout(&self) -> Duration {
        self.timeout
    }
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
    pub fn done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }
    pub fn status(&self) -> RemoteStatus {
        self.status.lock().clone()
    }
    pub fn age(&self) -> Duration {
        self.created.elapsed()
    }

    /// Copy the payload into the pooled buffer.
    pub fn copy_from(&self, data: &[u8]) {
        let mut buffer = self.buffer.lock();
        if let Some(buf) = buffer.as_mut() {
            buf.fill_from(data);
            self.len.store(data.len(), Ordering::Release);
        }
    }

    /// Mutable access to the payload buffer, e.g. to read journal content
    /// straight into it.
    pub fn with_buffer_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let mut buffer = self.buffer.lock();
        let buf = buffer.as_mut().expect("write buffer already taken");
        f(buf.as_mut_slice())
    }

    /// Detach the buffer for submission; dropping the returned buffer hands
    /// it back to its pool.
    pub(crate) fn take_buffer(&self) -> Option<PooledBuffer> {
        self.buffer.lock().take()
    }

    pub(crate) fn complete(&self, status: RemoteStatus) {
        *self.status.lock() = status;
        self.done.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    /// Block until the write completed; returns its status.
    pub async fn wait(&self) -> RemoteStatus {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.done() {
                return self.status();
            }
            let _ = tokio::time::timeout(std::time::Duration::from_millis(25), notified).await;
        }
    }

    /// Identity key of this chunk in the in-flight maps.
    pub fn addr(&self) -> usize {
        self as *const Self as usize
    }
}
