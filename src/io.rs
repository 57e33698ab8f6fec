//! Per-inode I/O composite.
//!
//! An [`IoHandle`] bundles the cache tiers of one file: the optional data
//! cache, the optional write journal, and the remote proxies. The
//! `"default"` proxy serves foreground I/O; additional keys appear during
//! error recovery when replicas are opened.
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use tokio_util::sync::CancellationToken;
use tracing::*;

use crate::cache::{DataCache, JournalCache, JournalSyncer};
use crate::error::Error;
use crate::proxy::FileProxy;
use crate::remote::RemoteFile;

/// Key of the primary proxy used by foreground operations.
pub const DEFAULT_PROXY: &str = "default";

/// Synchronous journal replay target backed by a remote proxy: every
/// record is written and awaited in order, the truncate after all of them.
pub struct ProxySyncer {
    proxy: Arc<FileProxy>,
    timeout: Duration,
}

impl ProxySyncer {
    pub fn new(proxy: Arc<FileProxy>, timeout: Duration) -> Self {
        Self { proxy, timeout }
    }
}

#[async_trait::async_trait]
impl JournalSyncer for ProxySyncer {
    async fn write(&self, offset: u64, data: &[u8]) -> Result<(), Error> {
        let handler = self
            .proxy
            .write_async_prepare(data.len(), offset, self.timeout)
            .await;
        self.proxy.write_async(data, handler.clone())?;
        match handler.wait().await.to_error() {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }

    async fn truncate(&self, size: u64) -> Result<(), Error> {
        self.proxy.truncate_after_writes(size).await
    }
}

pub struct IoHandle {
    ino: u64,
    file: RwLock<Option<Arc<DataCache>>>,
    journal: RwLock<Option<Arc<JournalCache>>>,
    proxies_ro: Mutex<FxHashMap<String, Arc<FileProxy>>>,
    proxies_rw: Mutex<FxHashMap<String, Arc<FileProxy>>>,
    caching: AtomicBool,
    attached: AtomicUsize,
}

impl IoHandle {
    pub fn new(ino: u64) -> Self {
        Self {
            ino,
            file: RwLock::new(None),
            journal: RwLock::new(None),
            proxies_ro: Mutex::new(FxHashMap::default()),
            proxies_rw: Mutex::new(FxHashMap::default()),
            caching: AtomicBool::new(true),
            attached: AtomicUsize::new(0),
        }
    }

    pub fn ino(&self) -> u64 {
        self.ino
    }

    pub fn attach(&self) -> usize {
        self.attached.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn detach(&self) -> usize {
        let prev = self.attached.fetch_sub(1, Ordering::AcqRel);
        assert!(prev > 0, "io handle detach without attach");
        prev - 1
    }

    pub fn attached(&self) -> usize {
        self.attached.load(Ordering::Acquire)
    }

    pub fn set_file(&self, cache: DataCache) {
        *self.file.write() = Some(Arc::new(cache));
    }

    pub fn file(&self) -> Option<Arc<DataCache>> {
        self.file.read().clone()
    }

    pub fn set_journal(&self, journal: JournalCache) {
        *self.journal.write() = Some(Arc::new(journal));
    }

    pub fn journal(&self) -> Option<Arc<JournalCache>> {
        self.journal.read().clone()
    }

    /// Drop both local cache tiers; subsequent I/O goes straight through
    /// the proxies.
    pub fn disable_caches(&self) {
        info!(ino = self.ino, "disabling local caches");
        *self.file.write() = None;
        *self.journal.write() = None;
        self.caching.store(false, Ordering::Release);
    }

    pub fn is_caching(&self) -> bool {
        self.caching.load(Ordering::Acquire)
    }

    pub fn set_proxy_ro(&self, id: impl Into<String>, proxy: Arc<FileProxy>) {
        self.proxies_ro.lock().insert(id.into(), proxy);
    }

    pub fn set_proxy_rw(&self, id: impl Into<String>, proxy: Arc<FileProxy>) {
        self.proxies_rw.lock().insert(id.into(), proxy);
    }

    /// The default read-only proxy.
    pub fn proxy_ro(&self) -> Option<Arc<FileProxy>> {
        self.proxies_ro.lock().get(DEFAULT_PROXY).cloned()
    }

    /// The default read-write proxy.
    pub fn proxy_rw(&self) -> Option<Arc<FileProxy>> {
        self.proxies_rw.lock().get(DEFAULT_PROXY).cloned()
    }

    pub fn proxy_ro_by_id(&self, id: &str) -> Option<Arc<FileProxy>> {
        self.proxies_ro.lock().get(id).cloned()
    }

    pub fn proxy_rw_by_id(&self, id: &str) -> Option<Arc<FileProxy>> {
        self.proxies_rw.lock().get(id).cloned()
    }

    pub fn all_proxies_rw(&self) -> Vec<Arc<FileProxy>> {
        self.proxies_rw.lock().values().cloned().collect()
    }

    pub fn erase_proxy_ro(&self, id: &str) -> bool {
        self.proxies_ro.lock().remove(id).is_some()
    }

    pub fn erase_proxy_rw(&self, id: &str) -> bool {
        self.proxies_rw.lock().remove(id).is_some()
    }

    /// Replay the journal into the default read-write proxy.
    pub async fn flush_journal(&self) -> Result<(), Error> {
        let journal = match self.journal() {
            Some(j) => j,
            None => return Ok(()),
        };
        let proxy = self
            .proxy_rw()
            .ok_or(Error::InvalidArgument("no read-write proxy attached"))?;
        if journal.entries().await == 0 && journal.truncate_size().await.is_none() {
            return Ok(());
        }
        if journal.first_flush().await {
            journal.done_flush().await;
        }
        journal.remote_sync_async(&proxy).await
    }

    /// Recover the default read-write proxy after a transient failure: a
    /// fresh proxy against the replacement remote handle inherits the
    /// write queue and ref-count, reopens, resubmits the inherited writes
    /// and replays the journal.
    pub async fn recover_rw(&self, remote: Arc<dyn RemoteFile>) -> Result<Arc<FileProxy>, Error> {
        let old = self
            .proxy_rw()
            .ok_or(Error::InvalidArgument("no read-write proxy to recover"))?;
        old.context().recovery.inc("recover:write:n");
        let fresh = FileProxy::reopen_from(&old, remote);
        fresh.reopen_async()?;
        let status = fresh.wait_open().await;
        if let Some(e) = status.to_error() {
            fresh.context().recovery.inc("recover:write:reopen:failed");
            return Err(e);
        }
        fresh.context().recovery.inc("recover:write:reopen:success");
        fresh.collect_writes()?;
        self.set_proxy_rw(DEFAULT_PROXY, fresh.clone());
        if let Some(journal) = self.journal() {
            journal.remote_sync_async(&fresh).await?;
            fresh.context().recovery.inc("recover:write:journalflush:success");
        }
        info!(ino = self.ino, "recovered read-write proxy");
        Ok(fresh)
    }

    /// Background journal flusher draining pending writes periodically.
    pub fn spawn_flusher(
        self: Arc<Self>,
        period: Duration,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let this = self;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(period) => {}
                }
                if let Err(e) = this.flush_journal().await {
                    warn!(ino = this.ino, %e, "journal flush failed, will retry");
                }
            }
        })
    }
}

impl std::fmt::Debug for IoHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("IoHandle")
            .field("ino", &self.ino)
            .field("attached", &self.attached())
            .field("caching", &self.is_caching())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;

    #[test]
    fn caches_can_be_disabled() {
        let io = IoHandle::new(7);
        io.set_file(DataCache::Memory(MemoryCache::new()));
        assert!(io.file().is_some());
        assert!(io.is_caching());
        io.disable_caches();
        assert!(io.file().is_none());
        assert!(io.journal().is_none());
        assert!(!io.is_caching());
    }

    #[test]
    fn attach_detach() {
        let io = IoHandle::new(7);
        assert_eq!(io.attach(), 1);
        assert_eq!(io.attach(), 2);
        assert_eq!(io.detach(), 1);
        assert_eq!(io.detach(), 0);
    }
}
