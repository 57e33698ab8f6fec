//! Pooled byte buffers with in-flight accounting and back-pressure.
//!
//! Write and read-ahead buffers come out of bounded pools so a burst of
//! asynchronous I/O cannot run the client out of memory. A pool tracks the
//! bytes and buffer count currently in flight; acquisitions beyond the caps
//! park the caller until completions return buffers.
use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::*;

/// Hard cap on in-flight buffer count, guarding the remote protocol's
/// request-id space.
const MAX_INFLIGHT_BUFFERS: usize = 16384;
/// Poll period while parked on a saturated pool.
const ACQUIRE_POLL: Duration = Duration::from_millis(100);
/// Blocked-acquisition age after which the grace window opens.
const GRACE_AFTER: Duration = Duration::from_secs(200);
/// Length of the grace window during which the byte cap is doubled.
const GRACE_WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug)]
struct PoolInner {
    queue: VecDeque<Vec<u8>>,
    queued_bytes: usize,
    inflight_bytes: usize,
    inflight_buffers: usize,
    /// Doubled byte cap until this instant; recovers buffer starvation when
    /// a failed remote handle still references pending buffers.
    grace_until: Option<tokio::time::Instant>,
    xoff: u64,
    nobuf: u64,
}

#[derive(Debug)]
pub struct BufferPool {
    name: &'static str,
    /// Buffers below this capacity are not worth pooling.
    nominal: usize,
    max_pooled: usize,
    max_inflight_bytes: usize,
    inner: Mutex<PoolInner>,
    weak: Weak<BufferPool>,
}

impl BufferPool {
    pub fn new(
        name: &'static str,
        max_pooled: usize,
        nominal: usize,
        max_inflight_bytes: usize,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            name,
            nominal,
            max_pooled,
            max_inflight_bytes,
            inner: Mutex::new(PoolInner {
                queue: VecDeque::new(),
                queued_bytes: 0,
                inflight_bytes: 0,
                inflight_buffers: 0,
                grace_until: None,
                xoff: 0,
                nobuf: 0,
            }),
            weak: weak.clone(),
        })
    }

    fn arc(&self) -> Arc<Self> {
        self.weak.upgrade().expect("pool alive while borrowed")
    }

    /// Blocking acquisition: parks until the pool has room, polling every
    /// 100 ms. After 200 s on one acquisition a 60 s grace window doubles
    /// the byte cap to break buffer-starvation dead-locks.
    pub async fn acquire(&self, size: usize) -> PooledBuffer {
        let started = tokio::time::Instant::now();
        loop {
            {
                let mut inner = self.inner.lock();
                if let Some(data) = self.take(&mut inner, size) {
                    return PooledBuffer {
                        data,
                        pool: self.arc(),
                    };
                }
                inner.xoff += 1;
                let blocked = started.elapsed();
                if blocked >= GRACE_AFTER && inner.grace_until.is_none() {
                    inner.grace_until = Some(tokio::time::Instant::now() + GRACE_WINDOW);
                    warn!(
                        pool = self.name,
                        blocked_s = blocked.as_secs(),
                        inflight_bytes = inner.inflight_bytes,
                        inflight_buffers = inner.inflight_buffers,
                        "granting grace buffers to break starvation"
                    );
                }
            }
            tokio::time::sleep(ACQUIRE_POLL).await;
        }
    }

    /// Non-blocking acquisition; `None` when the pool is saturated.
    pub fn try_acquire(&self, size: usize) -> Option<PooledBuffer> {
        let mut inner = self.inner.lock();
        match self.take(&mut inner, size) {
            Some(data) => Some(PooledBuffer {
                data,
                pool: self.arc(),
            }),
            None => {
                inner.nobuf += 1;
                None
            }
        }
    }

    fn take(&self, inner: &mut PoolInner, size: usize) -> Option<Vec<u8>> {
        let byte_cap = match inner.grace_until {
            Some(until) if tokio::time::Instant::now() < until => 2 * self.max_inflight_bytes,
            Some(_) => {
                inner.grace_until = None;
                self.max_inflight_bytes
            }
            None => self.max_inflight_bytes,
        };
        if inner.inflight_bytes >= byte_cap || inner.inflight_buffers >= MAX_INFLIGHT_BUFFERS {
            if inner.inflight_bytes >= byte_cap {
                debug!(
                    pool = self.name,
                    inflight = inner.inflight_bytes,
                    cap = byte_cap,
                    "in-flight bytes exceed pool cap"
                );
            }
            return None;
        }
        inner.inflight_buffers += 1;
        let data = if inner.queue.is_empty() || size > self.nominal {
            vec![0u8; size]
        } else {
            let mut data = inner.queue.pop_front().unwrap();
            inner.queued_bytes -= data.capacity();
            data.resize(size, 0);
            data
        };
        inner.inflight_bytes += data.capacity();
        Some(data)
    }

    fn release(&self, data: Vec<u8>) {
        let mut inner = self.inner.lock();
        inner.inflight_bytes = inner.inflight_bytes.saturating_sub(data.capacity());
        debug_assert!(inner.inflight_buffers > 0, "pool refcount underflow");
        inner.inflight_buffers = inner.inflight_buffers.saturating_sub(1);
        if inner.queue.len() >= self.max_pooled || data.capacity() < self.nominal {
            return;
        }
        let mut data = data;
        // zeroed before reuse
        data.clear();
        data.resize(self.nominal, 0);
        data.shrink_to_fit();
        inner.queued_bytes += data.capacity();
        inner.queue.push_back(data);
    }

    pub fn inflight_bytes(&self) -> usize {
        self.inner.lock().inflight_bytes
    }
    pub fn inflight_buffers(&self) -> usize {
        self.inner.lock().inflight_buffers
    }
    pub fn queued_bytes(&self) -> usize {
        self.inner.lock().queued_bytes
    }
    /// Number of times an acquisition had to park.
    pub fn xoff(&self) -> u64 {
        self.inner.lock().xoff
    }
    /// Number of non-blocking acquisitions that came back empty.
    pub fn nobuf(&self) -> u64 {
        self.inner.lock().nobuf
    }
}

/// A buffer checked out of a [`BufferPool`]; returns itself on drop.
pub struct PooledBuffer {
    data: Vec<u8>,
    pool: Arc<BufferPool>,
}

impl PooledBuffer {
    pub fn len(&self) -> usize {
        self.data.len()
    }
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }
    pub fn resize(&mut self, len: usize) {
        self.data.resize(len, 0);
    }
    /// Replace the buffer contents.
    pub fn fill_from(&mut self, src: &[u8]) {
        self.data.resize(src.len(), 0);
        self.data.copy_from_slice(src);
    }
}

impl std::ops::Deref for PooledBuffer {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        &self.data
    }
}
impl std::ops::DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        self.pool.release(std::mem::take(&mut self.data));
    }
}

impl std::fmt::Debug for PooledBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "PooledBuffer[{}]", self.data.len())
    }
}
