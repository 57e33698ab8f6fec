//! Asynchronous read chunks and read-ahead strategy state.
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::config::ReadAheadStrategy;
use crate::pools::PooledBuffer;
use crate::remote::RemoteStatus;

pub type ReadHandler = Arc<ReadChunk>;

/// Default bound on speculative fetch positions (64 TiB).
pub(crate) const DEFAULT_MAX_READAHEAD_POSITION: u64 = 64 << 40;

/// One speculative (or explicitly prepared) remote read.
#[derive(Debug)]
pub struct ReadChunk {
    offset: u64,
    size: usize,
    buffer: Mutex<Option<PooledBuffer>>,
    filled: AtomicUsize,
    done: AtomicBool,
    eof: AtomicBool,
    status: Mutex<RemoteStatus>,
    pub(crate) notify: Notify,
    created: tokio::time::Instant,
}

impl ReadChunk {
    pub(crate) fn new(offset: u64, size: usize, buffer: PooledBuffer) -> ReadHandler {
        Arc::new(Self {
            offset,
            size,
            buffer: Mutex::new(Some(buffer)),
            filled: AtomicUsize::new(0),
            done: AtomicBool::new(false),
            eof: AtomicBool::new(false),
            status: Mutex::new(RemoteStatus::ok()),
            notify: Notify::new(),
            created: tokio::time::Instant::now(),
        })
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }
    pub fn len(&self) -> usize {
        self.size
    }
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }
    pub fn end(&self) -> u64 {
        self.offset + self.size as u64
    }
    pub fn done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }
    pub fn eof(&self) -> bool {
        self.eof.load(Ordering::Acquire)
    }
    pub fn filled(&self) -> usize {
        self.filled.load(Ordering::Acquire)
    }
    pub fn status(&self) -> RemoteStatus {
        self.status.lock().clone()
    }
    pub fn age(&self) -> Duration {
        self.created.elapsed()
    }

    /// Whether `off` falls inside this chunk's window.
    pub fn matches(&self, off: u64) -> bool {
        off >= self.offset && off < self.end()
    }

    /// Copy fulfilled bytes starting at user offset `off` into `out`;
    /// returns the number of bytes copied.
    pub fn copy_to(&self, off: u64, out: &mut [u8]) -> usize {
        debug_assert!(self.done());
        let buffer = self.buffer.lock();
        let buf = match buffer.as_ref() {
            Some(b) => b,
            None => return 0,
        };
        if off < self.offset {
            return 0;
        }
        let start = (off - self.offset) as usize;
        let filled = self.filled.load(Ordering::Acquire);
        if start >= filled {
            return 0;
        }
        let n = out.len().min(filled - start);
        out[..n].copy_from_slice(&buf.as_slice()[start..start + n]);
        n
    }

    pub(crate) fn take_buffer(&self) -> Option<PooledBuffer> {
        self.buffer.lock().take()
    }

    pub(crate) fn restore_buffer(&self, buffer: PooledBuffer) {
        *self.buffer.lock() = Some(buffer);
    }

    pub(crate) fn complete(&self, status: RemoteStatus, filled: usize) {
        self.filled.store(filled, Ordering::Release);
        self.eof
            .store(status.is_ok() && filled < self.size, Ordering::Release);
        *self.status.lock() = status;
        self.done.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    /// Identity key of this chunk in the in-flight maps.
    pub fn addr(&self) -> usize {
        self as *const Self as usize
    }
}

/// Strategy state and hit accounting of one proxy's read-ahead.
#[derive(Debug)]
pub(crate) struct ReadAhead {
    pub strategy: ReadAheadStrategy,
    pub min: u64,
    pub nominal: u64,
    pub max: u64,
    pub blocks_max: usize,
    pub sparse_ratio: f64,
    pub disabled: bool,
    /// End of the last user read.
    pub position: u64,
    /// Next speculative fetch offset.
    pub next_pos: u64,
    pub seq_hits: u64,
    /// Speculation never reaches past this position.
    pub max_position: u64,
    /// All bytes returned to the user.
    pub total_bytes: u64,
    /// Bytes fetched speculatively.
    pub ra_bytes: u64,
    /// Subset of `ra_bytes` actually consumed by the user.
    pub ra_hit_bytes: u64,
}

impl Default for ReadAhead {
    fn default() -> Self {
        Self {
            strategy: ReadAheadStrategy::None,
            min: 4 * 1024,
            nominal: 256 * 1024,
            max: 1024 * 1024,
            blocks_max: 16,
            sparse_ratio: 0.0,
            disabled: false,
            position: 0,
            next_pos: 0,
            seq_hits: 0,
            max_position: DEFAULT_MAX_READAHEAD_POSITION,
            total_bytes: 0,
            ra_bytes: 0,
            ra_hit_bytes: 0,
        }
    }
}

impl ReadAhead {
    /// Plan speculative fetches for a user read of `[offset, offset+size)`.
    /// `live_chunks` is the number of read chunks currently alive,
    /// `covered` whether the offset falls into one of them.
    ///
    /// Static: keep up to `blocks_max` nominal-sized blocks ahead of the
    /// user position. Dynamic: double the block on consecutive sequential
    /// hits up to `max`, halve towards `min` on a miss, and disable
    /// permanently once the hit ratio of a sparse pattern drops below
    /// `sparse_ratio`.
    pub fn plan(
        &mut self,
        offset: u64,
        size: u64,
        live_chunks: usize,
        covered: bool,
    ) -> Vec<(u64, u64)> {
        if self.strategy == ReadAheadStrategy::None || self.disabled {
            return Vec::new();
        }
        let sequential = offset == self.position || covered;
        if sequential {
            self.seq_hits += 1;
            if self.strategy == ReadAheadStrategy::Dynamic && self.seq_hits > 1 {
                self.nominal = (self.nominal * 2).min(self.max);
            }
        } else {
            self.seq_hits = 0;
            if self.strategy == ReadAheadStrategy::Dynamic {
                self.nominal = (self.nominal / 2).max(self.min);
            }
            if self.sparse_ratio > 0.0 && self.ra_bytes > 8 * self.nominal {
                let hit_ratio = self.ra_hit_bytes as f64 / self.ra_bytes as f64;
                if hit_ratio < self.sparse_ratio {
                    tracing::info!(
                        hit_ratio,
                        sparse_ratio = self.sparse_ratio,
                        "sparse access pattern, disabling read-ahead"
                    );
                    self.disabled = true;
                    return Vec::new();
                }
            }
            // resync the window behind the new position
            self.next_pos = offset + size;
        }
        self.next_pos = self.next_pos.max(offset + size);
        let window_end = (offset + size + self.nominal * self.blocks_max as u64)
            .min(self.max_position);
        let mut plan = Vec::new();
        let mut live = live_chunks;
        while self.next_pos < window_end && live < self.blocks_max {
            let len = self.nominal.min(self.max_position - self.next_pos);
            if len == 0 {
                break;
            }
            plan.push((self.next_pos, len));
            self.next_pos += len;
            live += 1;
        }
        plan
    }

    pub fn efficiency(&self) -> f64 {
        if self.total_bytes == 0 {
            0.0
        } else {
            self.ra_hit_bytes as f64 / self.total_bytes as f64
        }
    }

    pub fn volume_efficiency(&self) -> f64 {
        if self.ra_bytes == 0 {
            0.0
        } else {
            self.ra_hit_bytes as f64 / self.ra_bytes as f64
        }
    }
}
