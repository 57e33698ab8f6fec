//! Asynchronous remote file proxy.
//!
//! A [`FileProxy`] is one open connection to a remote file. It layers a
//! fully asynchronous, coalescing I/O surface on top of the raw
//! [`RemoteFile`] handle: a retry-capable open/close state machine, an
//! ordered write dispatcher with a batching queue, adaptive read-ahead
//! with hit accounting, and housekeeping that parks overdue in-flight
//! chunks in a process-wide orphan bin so a dead proxy can still be torn
//! down.
pub mod fuzz;
pub mod read;
pub mod write;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime};

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;
use tracing::*;

pub use fuzz::Fuzzing;
pub use read::{ReadChunk, ReadHandler};
pub use write::{WriteChunk, WriteHandler};

use crate::config::{CacheConfig, ReadAheadStrategy};
use crate::error::Error;
use crate::pools::BufferPool;
use crate::remote::{OpenFlags, RemoteFile, RemoteStatus, StatusCode};
use crate::stats::{IoMark, IoStat, IoStatSummary};

use read::ReadAhead;

/// Number of retained protocol log lines per proxy.
const PROTOCOL_LINES: usize = 128;
/// Default age after which an in-flight chunk without a callback is moved
/// into the orphan bin.
const DEFAULT_CHUNK_TIMEOUT: Duration = Duration::from_secs(300);
/// Wait slice while polling chunk completion.
const WAIT_SLICE: Duration = Duration::from_millis(25);
/// In-flight write chunk count considered excessive.
const MAX_WRITES_IN_FLIGHT: usize = 1024;

/// Proxy open-state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyState {
    Closed,
    Opening,
    Open,
    WaitWrite,
    Closing,
    Failed,
    CloseFailed,
}

impl ProxyState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProxyState::Closed => "closed",
            ProxyState::Opening => "opening",
            ProxyState::Open => "open",
            ProxyState::WaitWrite => "waitwrite",
            ProxyState::Closing => "closing",
            ProxyState::Failed => "failed",
            ProxyState::CloseFailed => "closefailed",
        }
    }
}

impl std::fmt::Display for ProxyState {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rolling log of recent protocol events, bounded in length.
#[derive(Debug, Default)]
pub struct Protocol {
    messages: Mutex<VecDeque<(SystemTime, String)>>,
}

impl Protocol {
    pub fn add(&self, line: impl Into<String>) {
        let mut messages = self.messages.lock();
        if messages.len() == PROTOCOL_LINES {
            messages.pop_front();
        }
        messages.push_back((SystemTime::now(), line.into()));
    }

    pub fn dump(&self) -> String {
        use std::fmt::Write;
        let messages = self.messages.lock();
        let mut out = String::new();
        for (at, line) in messages.iter() {
            let secs = at
                .duration_since(SystemTime::UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs();
            let _ = writeln!(out, "{} {}", secs, line);
        }
        out
    }

    fn clone_messages(&self) -> VecDeque<(SystemTime, String)> {
        self.messages.lock().clone()
    }

    fn inherit(&self, other: &Protocol) {
        *self.messages.lock() = other.clone_messages();
    }
}

/// In-flight chunk whose callback never arrived in time; parked process
/// wide so the owning proxy can be destroyed.
#[derive(Debug)]
pub enum Orphan {
    Read(ReadHandler),
    Write(WriteHandler),
}

impl Orphan {
    fn done(&self) -> bool {
        match self {
            Orphan::Read(c) => c.done(),
            Orphan::Write(c) => c.done(),
        }
    }
}

/// Counters of the proxy recovery machinery, keyed by event name.
#[derive(Debug, Default)]
pub struct RecoveryStats {
    counters: Mutex<std::collections::BTreeMap<&'static str, u64>>,
}

impl RecoveryStats {
    pub fn inc(&self, key: &'static str) {
        *self.counters.lock().entry(key).or_insert(0) += 1;
    }

    pub fn get(&self, key: &str) -> u64 {
        self.counters.lock().get(key).copied().unwrap_or(0)
    }

    pub fn dump(&self) -> String {
        use std::fmt::Write;
        let counters = self.counters.lock();
        let mut out = String::new();
        for (key, value) in counters.iter() {
            let _ = writeln!(out, "{}={}", key, value);
        }
        out
    }
}

/// Shared context of all proxies: the three buffer pools (write,
/// read-ahead, cache I/O), the orphan bin, the chunk timeout, recovery
/// counters and the fuzzing knobs. Created once at startup and passed down
/// through the handle constructors.
#[derive(Debug)]
pub struct ProxyContext {
    pub wr_buffers: Arc<BufferPool>,
    pub ra_buffers: Arc<BufferPool>,
    pub io_buffers: Arc<BufferPool>,
    pub chunk_timeout: Duration,
    pub fuzz: Fuzzing,
    pub recovery: RecoveryStats,
    orphans: Mutex<Vec<Orphan>>,
    proxies: AtomicI64,
}

impl ProxyContext {
    pub fn new(config: &CacheConfig) -> Arc<Self> {
        Self::with_chunk_timeout(config, DEFAULT_CHUNK_TIMEOUT)
    }

    pub fn with_chunk_timeout(config: &CacheConfig, chunk_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            wr_buffers: BufferPool::new(
                "write",
                128,
                128 * 1024,
                config.max_inflight_write_bytes,
            ),
            ra_buffers: BufferPool::new(
                "readahead",
                128,
                config.readahead_nominal.max(4096) as usize,
                config.max_inflight_readahead_bytes,
            ),
            io_buffers: BufferPool::new(
                "io",
                128,
                256 * 1024,
                config.max_inflight_write_bytes,
            ),
            chunk_timeout,
            fuzz: Fuzzing::default(),
            recovery: RecoveryStats::default(),
            orphans: Mutex::new(Vec::new()),
            proxies: AtomicI64::new(0),
        })
    }

    pub(crate) fn adopt(&self, orphan: Orphan) {
        warn!("parking orphaned in-flight chunk");
        self.orphans.lock().push(orphan);
    }

    pub fn orphan_count(&self) -> usize {
        self.orphans.lock().len()
    }

    /// Drop orphans whose callbacks eventually arrived; returns how many
    /// are still pending.
    pub fn reap_orphans(&self) -> usize {
        let mut orphans = self.orphans.lock();
        orphans.retain(|o| !o.done());
        orphans.len()
    }

    pub fn spawn_reaper(self: Arc<Self>, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        let this = self;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(Duration::from_secs(5)) => {
                        let left = this.reap_orphans();
                        if left > 0 {
                            debug!(left, "orphan chunks still pending");
                        }
                    }
                }
            }
        })
    }

    /// Number of live proxies sharing this context.
    pub fn proxies(&self) -> i64 {
        self.proxies.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone)]
struct OpenParams {
    url: String,
    flags: OpenFlags,
    mode: u32,
    timeout: Duration,
}

#[derive(Debug)]
struct StateCell {
    state: ProxyState,
    since: tokio::time::Instant,
    status: RemoteStatus,
}

pub struct FileProxy {
    ctx: Arc<ProxyContext>,
    remote: Arc<dyn RemoteFile>,
    ino: u64,
    state: Mutex<StateCell>,
    open_notify: Notify,
    write_notify: Notify,
    read_notify: Notify,
    params: Mutex<Option<OpenParams>>,
    chunks_w: Mutex<FxHashMap<usize, WriteHandler>>,
    chunks_r: Mutex<FxHashMap<usize, ReadHandler>>,
    write_queue: Mutex<VecDeque<WriteHandler>>,
    dispatch: Mutex<Option<mpsc::UnboundedSender<WriteHandler>>>,
    wq_direct: AtomicU64,
    wq_scheduled: AtomicU64,
    close_after_write: Mutex<Option<Duration>>,
    ra: Mutex<ReadAhead>,
    write_state: Mutex<RemoteStatus>,
    read_state: Mutex<RemoteStatus>,
    attached: AtomicUsize,
    reads_in_flight: AtomicI64,
    protocol: Protocol,
    stats_rd: IoStat,
    stats_wr: IoStat,
    weak: Weak<FileProxy>,
}

impl FileProxy {
    pub fn new(ctx: Arc<ProxyContext>, remote: Arc<dyn RemoteFile>, ino: u64) -> Arc<Self> {
        ctx.proxies.fetch_add(1, Ordering::Relaxed);
        Arc::new_cyclic(|weak| Self {
            ctx,
            remote,
            ino,
            state: Mutex::new(StateCell {
                state: ProxyState::Closed,
                since: tokio::time::Instant::now(),
                status: RemoteStatus::ok(),
            }),
            open_notify: Notify::new(),
            write_notify: Notify::new(),
            read_notify: Notify::new(),
            params: Mutex::new(None),
            chunks_w: Mutex::new(FxHashMap::default()),
            chunks_r: Mutex::new(FxHashMap::default()),
            write_queue: Mutex::new(VecDeque::new()),
            dispatch: Mutex::new(None),
            wq_direct: AtomicU64::new(0),
            wq_scheduled: AtomicU64::new(0),
            close_after_write: Mutex::new(None),
            ra: Mutex::new(ReadAhead::default()),
            write_state: Mutex::new(RemoteStatus::ok()),
            read_state: Mutex::new(RemoteStatus::ok()),
            attached: AtomicUsize::new(0),
            reads_in_flight: AtomicI64::new(0),
            protocol: Protocol::default(),
            stats_rd: IoStat::new(Duration::from_secs(60)),
            stats_wr: IoStat::new(Duration::from_secs(60)),
            weak: weak.clone(),
        })
    }

    fn arc(&self) -> Arc<Self> {
        self.weak.upgrade().expect("proxy alive while borrowed")
    }

    /// Recovery constructor: a fresh proxy against a replacement remote
    /// handle, inheriting the old proxy's write queue, attach count and
    /// protocol log.
    pub fn reopen_from(old: &Arc<FileProxy>, remote: Arc<dyn RemoteFile>) -> Arc<Self> {
        let fresh = Self::new(old.ctx.clone(), remote, old.ino);
        fresh.inherit_write_queue(old);
        fresh.inherit_attached(old);
        fresh.protocol.inherit(&old.protocol);
        *fresh.params.lock() = old.params.lock().clone();
        fresh
    }

    pub fn ino(&self) -> u64 {
        self.ino
    }

    pub fn context(&self) -> &Arc<ProxyContext> {
        &self.ctx
    }

    pub fn protocol(&self) -> &Protocol {
        &self.protocol
    }

    pub fn url(&self) -> Option<String> {
        self.params.lock().as_ref().map(|p| p.url.clone())
    }

    // ---- state machine ---------------------------------------------------

    fn set_state(&self, new: ProxyState, status: Option<RemoteStatus>) {
        let mut cell = self.state.lock();
        cell.state = new;
        cell.since = tokio::time::Instant::now();
        if let Some(status) = status {
            cell.status = status;
        }
        drop(cell);
        self.protocol.add(new.as_str());
    }

    pub fn state(&self) -> ProxyState {
        self.state.lock().state
    }

    /// Seconds since the last state transition.
    pub fn state_age(&self) -> f64 {
        self.state.lock().since.elapsed().as_secs_f64()
    }

    pub fn opening_state(&self) -> RemoteStatus {
        self.state.lock().status.clone()
    }

    /// Transient open failures are worth a reopen; everything else is
    /// fatal.
    pub fn opening_state_should_retry(&self) -> bool {
        self.state.lock().status.should_retry()
    }

    pub fn is_opening(&self) -> bool {
        self.state() == ProxyState::Opening
    }
    pub fn is_open(&self) -> bool {
        matches!(self.state(), ProxyState::Open | ProxyState::WaitWrite)
    }
    pub fn is_closing(&self) -> bool {
        self.state() == ProxyState::Closing
    }
    pub fn is_closed(&self) -> bool {
        self.state() == ProxyState::Closed
    }
    pub fn is_waitwrite(&self) -> bool {
        self.state() == ProxyState::WaitWrite
    }

    // ---- reference counting ----------------------------------------------

    pub fn attach(&self) {
        self.attached.fetch_add(1, Ordering::AcqRel);
    }

    pub fn detach(&self) -> usize {
        let prev = self.attached.fetch_sub(1, Ordering::AcqRel);
        assert!(prev > 0, "proxy detach without attach");
        prev - 1
    }

    pub fn attached(&self) -> usize {
        self.attached.load(Ordering::Acquire)
    }

    pub fn inherit_attached(&self, other: &FileProxy) {
        self.attached.store(other.attached(), Ordering::Release);
    }

    pub fn inherit_write_queue(&self, other: &FileProxy) {
        let mut theirs = other.write_queue.lock();
        let mut ours = self.write_queue.lock();
        let mut their_chunks = other.chunks_w.lock();
        for handler in theirs.drain(..) {
            their_chunks.remove(&handler.addr());
            ours.push_back(handler);
        }
    }

    // ---- open ------------------------------------------------------------

    /// Submit the remote open and return immediately; completion flips the
    /// state to `Open` or `Failed` and wakes [`Self::wait_open`] callers.
    pub fn open_async(
        &self,
        url: impl Into<String>,
        flags: OpenFlags,
        mode: u32,
        timeout: Duration,
    ) -> Result<(), Error> {
        let params = OpenParams {
            url: url.into(),
            flags,
            mode,
            timeout,
        };
        *self.params.lock() = Some(params.clone());
        self.submit_open(params)
    }

    /// Re-issue the open with the stored parameters, for error recovery.
    pub fn reopen_async(&self) -> Result<(), Error> {
        let params = self
            .params
            .lock()
            .clone()
            .ok_or(Error::InvalidArgument("reopen before open"))?;
        self.protocol.add("reopen");
        self.ctx.recovery.inc("recover:n");
        self.submit_open(params)
    }

    fn submit_open(&self, params: OpenParams) -> Result<(), Error> {
        self.set_state(ProxyState::Opening, Some(RemoteStatus::ok()));
        if let Some(status) = self.ctx.fuzz.open_submit() {
            self.set_state(ProxyState::Failed, Some(status.clone()));
            self.open_notify.notify_waiters();
            return Err(status.to_error().unwrap());
        }
        let weak = self.weak.clone();
        let remote = self.remote.clone();
        tokio::spawn(async move {
            let mut status = remote
                .open(&params.url, params.flags, params.mode, params.timeout)
                .await;
            // honor one server-suggested redirection
            if let Some(target) = status.redirect.take() {
                debug!(%target, "open redirected");
                status = remote
                    .open(&target, params.flags, params.mode, params.timeout)
                    .await;
            }
            let Some(proxy) = weak.upgrade() else { return };
            let status = proxy.ctx.fuzz.open_return(status);
            if status.is_ok() {
                proxy.protocol.add(format!("url='{}'", params.url));
                proxy.set_state(ProxyState::Open, Some(status));
            } else {
                warn!(ino = proxy.ino, %status, "open failed");
                proxy.set_state(ProxyState::Failed, Some(status));
            }
            proxy.open_notify.notify_waiters();
        });
        Ok(())
    }

    /// Block until the state leaves `Opening`; returns the remote status.
    pub async fn wait_open(&self) -> RemoteStatus {
        loop {
            let notified = self.open_notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let cell = self.state.lock();
                if cell.state != ProxyState::Opening {
                    return cell.status.clone();
                }
            }
            notified.await;
        }
    }

    // ---- write path ------------------------------------------------------

    /// Allocate a write handler wrapping a pooled buffer; parks on the
    /// buffer pool when the write pipeline is saturated.
    pub async fn write_async_prepare(
        &self,
        size: usize,
        offset: u64,
        timeout: Duration,
    ) -> WriteHandler {
        let buffer = self.ctx.wr_buffers.acquire(size).await;
        WriteChunk::new(offset, timeout, buffer)
    }

    /// Copy `data` into the handler and submit the remote write. Writes
    /// submitted on one task reach the remote service in issue order.
    pub fn write_async(&self, data: &[u8], handler: WriteHandler) -> Result<(), Error> {
        handler.copy_from(data);
        self.chunks_w.lock().insert(handler.addr(), handler.clone());
        self.wq_direct.fetch_add(1, Ordering::Relaxed);
        self.submit_write(handler)
    }

    /// Queue the handler for batched submission via
    /// [`Self::collect_writes`].
    pub fn schedule_write_async(&self, handler: WriteHandler) -> Result<(), Error> {
        self.chunks_w.lock().insert(handler.addr(), handler.clone());
        self.wq_scheduled.fetch_add(1, Ordering::Relaxed);
        self.write_queue.lock().push_back(handler);
        self.write_notify.notify_waiters();
        Ok(())
    }

    /// Drain the write queue into the dispatcher, preserving order.
    pub fn collect_writes(&self) -> Result<(), Error> {
        let drained: Vec<_> = self.write_queue.lock().drain(..).collect();
        for handler in drained {
            self.submit_write(handler)?;
        }
        Ok(())
    }

    fn submit_write(&self, handler: WriteHandler) -> Result<(), Error> {
        let tx = self.dispatcher();
        tx.send(handler)
            .map_err(|_| Error::Executor("write dispatcher gone".into()))
    }

    /// The per-proxy dispatcher serializes remote writes so they arrive in
    /// submission order.
    fn dispatcher(&self) -> mpsc::UnboundedSender<WriteHandler> {
        let mut guard = self.dispatch.lock();
        if let Some(tx) = guard.as_ref() {
            if !tx.is_closed() {
                return tx.clone();
            }
        }
        let (tx, mut rx) = mpsc::unbounded_channel::<WriteHandler>();
        let weak = self.weak.clone();
        let remote = self.remote.clone();
        tokio::spawn(async move {
            while let Some(chunk) = rx.recv().await {
                let len = chunk.len();
                let buffer = chunk.take_buffer();
                let status = match &buffer {
                    Some(buf) => {
                        remote
                            .write(chunk.offset(), &buf.as_slice()[..len], chunk.timeout())
                            .await
                    }
                    None => RemoteStatus::error(StatusCode::Error, "write buffer missing"),
                };
                // hand the buffer back to the pool before signalling
                drop(buffer);
                chunk.complete(status.clone());
                if let Some(proxy) = weak.upgrade() {
                    proxy.finish_write(&chunk, status, len);
                }
            }
        });
        *guard = Some(tx.clone());
        tx
    }

    fn finish_write(&self, chunk: &WriteHandler, status: RemoteStatus, len: usize) {
        self.chunks_w.lock().remove(&chunk.addr());
        if status.is_ok() {
            self.stats_wr.add(IoMark::now(len as u64));
        } else {
            warn!(ino = self.ino, %status, offset = chunk.offset(), "write failed");
            self.protocol.add(format!("write-error {}", status));
            *self.write_state.lock() = status;
        }
        let drained =
            self.chunks_w.lock().is_empty() && self.write_queue.lock().is_empty();
        if drained {
            {
                let mut cell = self.state.lock();
                if cell.state == ProxyState::WaitWrite {
                    cell.state = ProxyState::Open;
                    cell.since = tokio::time::Instant::now();
                }
            }
            if let Some(timeout) = self.close_after_write.lock().take() {
                let proxy = self.arc();
                tokio::spawn(async move {
                    let _ = proxy.close_async(timeout);
                });
            }
        }
        self.write_notify.notify_waiters();
    }

    pub fn outstanding_writes(&self) -> bool {
        !self.chunks_w.lock().is_empty() || !self.write_queue.lock().is_empty()
    }

    pub fn has_too_many_writes_in_flight(&self) -> bool {
        self.chunks_w.lock().len() > MAX_WRITES_IN_FLIGHT
    }

    /// Fraction of writes that went through the batching queue rather than
    /// direct submission.
    pub fn scheduled_submission_fraction(&self) -> f64 {
        let direct = self.wq_direct.load(Ordering::Relaxed);
        let scheduled = self.wq_scheduled.load(Ordering::Relaxed);
        if direct + scheduled == 0 {
            0.0
        } else {
            scheduled as f64 / (direct + scheduled) as f64
        }
    }

    /// Block until all in-flight and queued writes have completed; overdue
    /// chunks are parked in the orphan bin so the wait terminates.
    pub async fn wait_write(&self) -> RemoteStatus {
        let has_writes = !self.chunks_w.lock().is_empty();
        if has_writes {
            let mut cell = self.state.lock();
            if cell.state == ProxyState::Open {
                cell.state = ProxyState::WaitWrite;
                cell.since = tokio::time::Instant::now();
            }
        }
        loop {
            let notified = self.write_notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            self.sweep_orphans();
            if !self.outstanding_writes() {
                let mut cell = self.state.lock();
                if cell.state == ProxyState::WaitWrite {
                    cell.state = ProxyState::Open;
                    cell.since = tokio::time::Instant::now();
                }
                return self.write_state.lock().clone();
            }
            let _ = tokio::time::timeout(WAIT_SLICE, notified).await;
        }
    }

    pub fn write_state(&self) -> RemoteStatus {
        self.write_state.lock().clone()
    }

    /// Arm an automatic close once the write queue drains.
    pub fn close_after_write(&self, timeout: Duration) {
        *self.close_after_write.lock() = Some(timeout);
        self.protocol.add("close-after-write armed");
    }

    pub fn close_after_write_armed(&self) -> bool {
        self.close_after_write.lock().is_some()
    }

    /// Remote truncate ordered after every outstanding write.
    pub async fn truncate_after_writes(&self, size: u64) -> Result<(), Error> {
        let st = self.wait_write().await;
        if let Some(e) = st.to_error() {
            return Err(e);
        }
        let timeout = self
            .params
            .lock()
            .as_ref()
            .map(|p| p.timeout)
            .unwrap_or(Duration::ZERO);
        match self.remote.truncate(size, timeout).await.to_error() {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }

    pub async fn sync(&self, timeout: Duration) -> RemoteStatus {
        self.remote.sync(timeout).await
    }

    // ---- read path -------------------------------------------------------

    /// Allocate a read-ahead buffer; `blocking` selects pool back-pressure
    /// behavior.
    pub async fn read_async_prepare(
        &self,
        offset: u64,
        size: usize,
        blocking: bool,
    ) -> Option<ReadHandler> {
        let buffer = if blocking {
            Some(self.ctx.ra_buffers.acquire(size).await)
        } else {
            self.ctx.ra_buffers.try_acquire(size)
        }?;
        Some(ReadChunk::new(offset, size, buffer))
    }

    /// Launch a speculative fetch for the handler's window.
    pub fn preread_async(
        &self,
        handler: ReadHandler,
        timeout: Duration,
    ) -> Result<(), Error> {
        self.chunks_r.lock().insert(handler.addr(), handler.clone());
        self.reads_in_flight.fetch_add(1, Ordering::AcqRel);
        let weak = self.weak.clone();
        let remote = self.remote.clone();
        tokio::spawn(async move {
            let mut buffer = handler.take_buffer();
            let (status, n) = match buffer.as_mut() {
                Some(buf) => remote.read(handler.offset(), buf.as_mut_slice(), timeout).await,
                None => (
                    RemoteStatus::error(StatusCode::Error, "read buffer missing"),
                    0,
                ),
            };
            if let Some(buf) = buffer {
                handler.restore_buffer(buf);
            }
            let status = match weak.upgrade() {
                Some(proxy) => proxy.ctx.fuzz.read_return(status),
                None => status,
            };
            handler.complete(status.clone(), n as usize);
            if let Some(proxy) = weak.upgrade() {
                proxy.reads_in_flight.fetch_sub(1, Ordering::AcqRel);
                if !status.is_ok() {
                    *proxy.read_state.lock() = status;
                }
                proxy.read_notify.notify_waiters();
            }
        });
        Ok(())
    }

    /// Block until the handler's fetch completed; returns its status.
    pub async fn wait_read(&self, handler: &ReadHandler) -> RemoteStatus {
        loop {
            let notified = handler.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if handler.done() {
                return handler.status();
            }
            let _ = tokio::time::timeout(WAIT_SLICE, notified).await;
        }
    }

    /// Copy the fulfilled window into the user buffer.
    pub async fn read_async(
        &self,
        handler: &ReadHandler,
        buf: &mut [u8],
    ) -> Result<usize, Error> {
        let status = self.wait_read(handler).await;
        if let Some(e) = status.to_error() {
            return Err(e);
        }
        Ok(handler.copy_to(handler.offset(), buf))
    }

    /// Non-blocking completion poll.
    pub fn done_async(&self, handler: &ReadHandler) -> bool {
        handler.done()
    }

    pub fn reads_in_flight(&self) -> i64 {
        self.reads_in_flight.load(Ordering::Acquire)
    }

    /// Synchronous read: serves what it can from the read-ahead window,
    /// issues speculation for the strategy, and fetches the remainder
    /// directly from the remote service.
    pub async fn read(
        &self,
        offset: u64,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<(RemoteStatus, usize), Error> {
        let size = buf.len();
        // drop windows the reader has moved past; they can no longer serve
        // a forward read and would pin the block budget
        {
            let mut chunks = self.chunks_r.lock();
            let stale: Vec<usize> = chunks
                .iter()
                .filter(|(_, c)| c.done() && c.end() <= offset)
                .map(|(k, _)| *k)
                .collect();
            for key in stale {
                chunks.remove(&key);
            }
        }
        // plan speculation before serving, so the window keeps moving
        let covered = self.covering_chunk(offset).is_some();
        let live = self.chunks_r.lock().len();
        let (plan, newly_disabled) = {
            let mut ra = self.ra.lock();
            let was_disabled = ra.disabled;
            let plan = ra.plan(offset, size as u64, live, covered);
            (plan, ra.disabled && !was_disabled)
        };
        if newly_disabled {
            self.drop_read_ahead();
        }
        for (off, len) in plan {
            // back-pressure: skip speculation when the pool is saturated
            if let Some(handler) = self.read_async_prepare(off, len as usize, false).await {
                self.preread_async(handler, timeout)?;
                self.ra.lock().ra_bytes += len;
            }
        }

        // serve from the read-ahead window
        let mut filled = 0usize;
        let mut pos = offset;
        let mut eof = false;
        while filled < size {
            let Some(chunk) = self.covering_chunk(pos) else { break };
            let status = self.wait_read(&chunk).await;
            if !status.is_ok() {
                self.chunks_r.lock().remove(&chunk.addr());
                break;
            }
            let n = chunk.copy_to(pos, &mut buf[filled..]);
            if n == 0 {
                // the chunk ended before our position: EOF inside window
                self.chunks_r.lock().remove(&chunk.addr());
                if chunk.eof() {
                    eof = true;
                }
                break;
            }
            self.ra.lock().ra_hit_bytes += n as u64;
            filled += n;
            pos += n as u64;
            if pos >= chunk.end() || chunk.eof() {
                if chunk.eof() {
                    eof = true;
                }
                self.chunks_r.lock().remove(&chunk.addr());
                if chunk.eof() {
                    break;
                }
            }
        }

        // remainder straight from the remote
        let mut status = RemoteStatus::ok();
        if filled < size && !eof {
            let (st, n) = self.remote.read(pos, &mut buf[filled..], timeout).await;
            if st.is_ok() {
                filled += n as usize;
            } else {
                *self.read_state.lock() = st.clone();
                self.protocol.add(format!("read-error {}", st));
            }
            status = st;
        }

        {
            let mut ra = self.ra.lock();
            ra.total_bytes += filled as u64;
            ra.position = offset + filled as u64;
        }
        self.stats_rd.add(IoMark::now(filled as u64));
        Ok((status, filled))
    }

    fn covering_chunk(&self, pos: u64) -> Option<ReadHandler> {
        self.chunks_r
            .lock()
            .values()
            .filter(|c| c.matches(pos))
            .min_by_key(|c| c.offset())
            .cloned()
    }

    /// Abandon the read-ahead window; chunks still in flight move to the
    /// orphan bin.
    pub fn drop_read_ahead(&self) {
        let dropped: Vec<_> = self.chunks_r.lock().drain().map(|(_, c)| c).collect();
        for chunk in dropped {
            if !chunk.done() {
                self.ctx.adopt(Orphan::Read(chunk));
            }
        }
    }

    pub fn read_state(&self) -> RemoteStatus {
        self.read_state.lock().clone()
    }

    // ---- read-ahead configuration & accounting ---------------------------

    pub fn set_readahead_strategy(
        &self,
        strategy: ReadAheadStrategy,
        min: u64,
        nominal: u64,
        max: u64,
        blocks_max: usize,
        sparse_ratio: f64,
    ) {
        let mut ra = self.ra.lock();
        ra.strategy = strategy;
        ra.min = min;
        ra.nominal = nominal;
        ra.max = max;
        ra.blocks_max = blocks_max;
        ra.sparse_ratio = sparse_ratio;
        ra.disabled = false;
        ra.seq_hits = 0;
    }

    pub fn set_readahead_maximum_position(&self, pos: u64) {
        self.ra.lock().max_position = pos;
    }

    pub fn readahead_maximum_position(&self) -> u64 {
        self.ra.lock().max_position
    }

    pub fn readahead_nominal(&self) -> u64 {
        self.ra.lock().nominal
    }

    pub fn readahead_disabled(&self) -> bool {
        self.ra.lock().disabled
    }

    pub fn total_bytes(&self) -> u64 {
        self.ra.lock().total_bytes
    }

    pub fn ra_bytes(&self) -> u64 {
        self.ra.lock().ra_bytes
    }

    pub fn ra_hit_bytes(&self) -> u64 {
        self.ra.lock().ra_hit_bytes
    }

    /// `ra_hit_bytes / total_bytes`; never exceeds 1.
    pub fn readahead_efficiency(&self) -> f64 {
        self.ra.lock().efficiency()
    }

    /// `ra_hit_bytes / ra_bytes`.
    pub fn readahead_volume_efficiency(&self) -> f64 {
        self.ra.lock().volume_efficiency()
    }

    // ---- close -----------------------------------------------------------

    /// Submit the close; outstanding writes drain first.
    pub fn close_async(&self, timeout: Duration) -> Result<(), Error> {
        self.set_state(ProxyState::Closing, None);
        let proxy = self.arc();
        tokio::spawn(async move {
            let write_status = proxy.wait_write().await;
            // restore: wait_write flips WaitWrite back, we are closing
            proxy.set_state(ProxyState::Closing, None);
            let status = proxy.remote.close(timeout).await;
            if status.is_ok() && write_status.is_ok() {
                proxy.set_state(ProxyState::Closed, Some(status));
            } else {
                let worst = if status.is_ok() { write_status } else { status };
                warn!(ino = proxy.ino, status = %worst, "close failed");
                proxy.set_state(ProxyState::CloseFailed, Some(worst));
            }
            proxy.open_notify.notify_waiters();
        });
        Ok(())
    }

    /// Block until the state leaves `Closing`.
    pub async fn wait_close(&self) -> RemoteStatus {
        loop {
            let notified = self.open_notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let cell = self.state.lock();
                if cell.state != ProxyState::Closing {
                    return cell.status.clone();
                }
            }
            notified.await;
        }
    }

    pub async fn close(&self, timeout: Duration) -> RemoteStatus {
        if let Err(e) = self.close_async(timeout) {
            return RemoteStatus::error(StatusCode::Error, e.to_string());
        }
        self.wait_close().await
    }

    // ---- housekeeping & telemetry ----------------------------------------

    /// Collect all pending work: writes drain, reads complete or orphan.
    pub async fn collect(&self) {
        self.wait_write().await;
        let deadline = tokio::time::Instant::now() + self.ctx.chunk_timeout;
        loop {
            self.sweep_orphans();
            let pending = self
                .chunks_r
                .lock()
                .values()
                .any(|c| !c.done());
            if !pending {
                return;
            }
            if tokio::time::Instant::now() >= deadline {
                self.drop_read_ahead();
                return;
            }
            tokio::time::sleep(WAIT_SLICE).await;
        }
    }

    /// Move chunks past the chunk timeout into the process-wide orphan bin.
    fn sweep_orphans(&self) {
        let timeout = self.ctx.chunk_timeout;
        {
            let mut chunks = self.chunks_w.lock();
            let expired: Vec<usize> = chunks
                .iter()
                .filter(|(_, c)| !c.done() && c.age() > timeout)
                .map(|(k, _)| *k)
                .collect();
            for key in expired {
                if let Some(chunk) = chunks.remove(&key) {
                    self.ctx.adopt(Orphan::Write(chunk));
                }
            }
        }
        {
            let mut chunks = self.chunks_r.lock();
            let expired: Vec<usize> = chunks
                .iter()
                .filter(|(_, c)| !c.done() && c.age() > timeout)
                .map(|(k, _)| *k)
                .collect();
            for key in expired {
                if let Some(chunk) = chunks.remove(&key) {
                    self.ctx.adopt(Orphan::Read(chunk));
                }
            }
        }
    }

    pub fn had_failures(&self) -> Option<String> {
        let write = self.write_state.lock();
        if !write.is_ok() {
            return Some(write.message.clone());
        }
        let read = self.read_state.lock();
        if !read.is_ok() {
            return Some(read.message.clone());
        }
        if matches!(self.state(), ProxyState::Failed | ProxyState::CloseFailed) {
            return Some(self.state.lock().status.message.clone());
        }
        None
    }

    /// Telemetry snapshot of the recent I/O of this proxy.
    pub fn io_summary(&self) -> Result<IoStatSummary, Error> {
        IoStatSummary::collect(&self.stats_rd, &self.stats_wr)
    }

    pub fn dump(&self) -> String {
        let ra = self.ra.lock();
        format!(
            "ino={:#x} state={} age={:.3}s attached={} w-inflight={} r-inflight={} \
             total={} ra={} ra-hits={} eff={:.4} vol-eff={:.4}\n{}",
            self.ino,
            self.state(),
            self.state_age(),
            self.attached(),
            self.chunks_w.lock().len(),
            self.reads_in_flight(),
            ra.total_bytes,
            ra.ra_bytes,
            ra.ra_hit_bytes,
            ra.efficiency(),
            ra.volume_efficiency(),
            self.protocol.dump()
        )
    }
}

impl Drop for FileProxy {
    fn drop(&mut self) {
        self.ctx.proxies.fetch_sub(1, Ordering::Relaxed);
        let ra = self.ra.lock();
        debug!(
            ino = self.ino,
            efficiency = ra.efficiency(),
            volume_efficiency = ra.volume_efficiency(),
            total_bytes = ra.total_bytes,
            ra_bytes = ra.ra_bytes,
            ra_hit_bytes = ra.ra_hit_bytes,
            "proxy dropped"
        );
    }
}

impl std::fmt::Debug for FileProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("FileProxy")
            .field("ino", &self.ino)
            .field("state", &self.state())
            .field("attached", &self.attached())
            .finish()
    }
}
