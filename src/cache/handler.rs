//! Process-wide cache bookkeeping.
//!
//! The [`CacheHandler`] is an explicit context object created at startup:
//! it owns the global cache configuration, the inode map of I/O handles,
//! the directory cleaners with their leveler tasks, and the shared
//! [`ProxyContext`] (buffer pools, orphan bin, fuzz knobs) handed down to
//! every proxy. Besides constructing handles it orchestrates the tier
//! lifecycle: attach-on-open with cookie validation across tiers,
//! detach-on-close with removal of idle handles, whole-file invalidation,
//! and a sweep that drains every attached journal.
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tokio_util::sync::CancellationToken;
use tracing::*;

pub use crate::proxy::ProxyContext;

use crate::cache::journal::{HEADER_LEN, JOURNAL_SUFFIX};
use crate::cache::{AttachStatus, DataCache, DiskCache, JournalCache, MemoryCache};
use crate::cleaner::DirCleaner;
use crate::config::CacheConfig;
use crate::error::Error;
use crate::io::IoHandle;

/// Occupancy gauge across the cache tiers and shared pools.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CacheHandlerStats {
    pub handles: usize,
    pub cache_bytes: i64,
    pub cache_files: i64,
    pub journal_bytes: i64,
    pub journal_files: i64,
    pub write_buffer_bytes: usize,
    pub readahead_buffer_bytes: usize,
    pub orphan_chunks: usize,
    pub proxies: i64,
}

pub struct CacheHandler {
    config: CacheConfig,
    contents: Mutex<FxHashMap<u64, Arc<IoHandle>>>,
    cache_cleaner: Option<Arc<DirCleaner>>,
    journal_cleaner: Option<Arc<DirCleaner>>,
    ctx: Arc<ProxyContext>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

/// Reject configurations that cannot work before any file is touched.
fn validate(config: &CacheConfig) -> Result<(), Error> {
    if config.location.as_os_str().is_empty() {
        return Err(Error::InvalidArgument("cache.location not configured"));
    }
    if !config.in_memory() && config.per_file_bytes == 0 {
        return Err(Error::InvalidArgument(
            "cache.per_file_bytes must be non-zero for the disk tier",
        ));
    }
    if config.journaled() {
        if config.journal_location == config.location {
            return Err(Error::InvalidArgument(
                "journal.location must differ from cache.location",
            ));
        }
        if config.journal_per_file_bytes <= HEADER_LEN {
            return Err(Error::InvalidArgument(
                "journal.per_file_bytes below the record header size",
            ));
        }
        if config.journal_total_bytes != 0
            && config.journal_per_file_bytes > config.journal_total_bytes
        {
            warn!(
                per_file = config.journal_per_file_bytes,
                total = config.journal_total_bytes,
                "one journal can exceed the journal tree cap"
            );
        }
    }
    if config.total_bytes != 0 && config.per_file_bytes > config.total_bytes {
        warn!(
            per_file = config.per_file_bytes,
            total = config.total_bytes,
            "one cache file can exceed the cache tree cap"
        );
    }
    Ok(())
}

/// A root we cannot write to would fail on the first attach; fail startup
/// instead.
fn probe_writable(root: &Path) -> Result<(), Error> {
    let probe = root.join(".write-probe");
    std::fs::write(&probe, b"")?;
    std::fs::remove_file(&probe)?;
    Ok(())
}

impl CacheHandler {
    /// Validate the configuration and roots, apply clean-on-startup, and
    /// start the background workers (levelers, orphan reaper).
    pub fn init(config: CacheConfig) -> Result<Arc<Self>, Error> {
        validate(&config)?;
        std::fs::create_dir_all(&config.location)?;
        probe_writable(&config.location)?;
        let cache_cleaner = Some(DirCleaner::new(
            &config.location,
            "",
            config.total_bytes,
            config.total_inodes,
        ));
        let journal_cleaner = if config.journaled() {
            std::fs::create_dir_all(&config.journal_location)?;
            probe_writable(&config.journal_location)?;
            Some(DirCleaner::new(
                &config.journal_location,
                JOURNAL_SUFFIX,
                config.journal_total_bytes,
                config.journal_total_inodes,
            ))
        } else {
            None
        };
        if config.journal_clean_on_startup {
            if let Some(cleaner) = &journal_cleaner {
                info!(path = %config.journal_location.display(), "cleaning journal on startup");
                cleaner.clean_all();
            }
            if let Some(cleaner) = &cache_cleaner {
                info!(path = %config.location.display(), "cleaning cache on startup");
                cleaner.clean_all();
            }
        }
        let cancel = CancellationToken::new();
        let ctx = ProxyContext::new(&config);
        let mut tasks = Vec::new();
        for cleaner in [&cache_cleaner, &journal_cleaner].into_iter().flatten() {
            tasks.push(cleaner.clone().spawn_leveler(cancel.clone()));
        }
        tasks.push(ctx.clone().spawn_reaper(cancel.clone()));
        let handler = Arc::new(Self {
            config,
            contents: Mutex::new(FxHashMap::default()),
            cache_cleaner,
            journal_cleaner,
            ctx,
            cancel,
            tasks: Mutex::new(tasks),
        });
        handler.logconfig();
        Ok(handler)
    }

    /// Log the effective configuration once at startup.
    pub fn logconfig(&self) {
        info!(
            cache_type = ?self.config.cache_type,
            location = %self.config.location.display(),
            total_bytes = self.config.total_bytes,
            total_inodes = self.config.total_inodes,
            per_file_bytes = self.config.per_file_bytes,
            "data cache configured"
        );
        if self.config.journaled() {
            info!(
                location = %self.config.journal_location.display(),
                total_bytes = self.config.journal_total_bytes,
                total_inodes = self.config.journal_total_inodes,
                per_file_bytes = self.config.journal_per_file_bytes,
                clean_on_startup = self.config.journal_clean_on_startup,
                "journal configured"
            );
        }
        info!(
            strategy = ?self.config.readahead_strategy,
            min = self.config.readahead_min,
            nominal = self.config.readahead_nominal,
            max = self.config.readahead_max,
            blocks_max = self.config.readahead_blocks_max,
            sparse_ratio = self.config.readahead_sparse_ratio,
            "read-ahead configured"
        );
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn context(&self) -> &Arc<ProxyContext> {
        &self.ctx
    }

    pub fn in_memory(&self) -> bool {
        self.config.in_memory()
    }

    pub fn journaled(&self) -> bool {
        self.config.journaled()
    }

    pub fn journal_cleaner(&self) -> Option<&Arc<DirCleaner>> {
        self.journal_cleaner.as_ref()
    }

    pub fn cache_cleaner(&self) -> Option<&Arc<DirCleaner>> {
        self.cache_cleaner.as_ref()
    }

    /// The handle for `ino`, constructing it with the configured cache
    /// tiers on first use.
    pub fn get(&self, ino: u64) -> Arc<IoHandle> {
        let mut contents = self.contents.lock();
        if let Some(handle) = contents.get(&ino) {
            return handle.clone();
        }
        let handle = Arc::new(IoHandle::new(ino));
        if self.in_memory() {
            handle.set_file(DataCache::Memory(MemoryCache::new()));
        } else {
            handle.set_file(DataCache::Disk(
                DiskCache::new(ino, &self.config.location, self.config.per_file_bytes)
                    .with_buffers(self.ctx.io_buffers.clone()),
            ));
        }
        if self.journaled() {
            handle.set_journal(JournalCache::new(
                ino,
                &self.config.journal_location,
                self.config.journal_per_file_bytes,
                self.journal_cleaner.clone(),
            ));
        }
        contents.insert(ino, handle.clone());
        handle
    }

    /// Remove the handle once the last holder released it.
    pub fn rm(&self, ino: u64) {
        let mut contents = self.contents.lock();
        if let Some(handle) = contents.get(&ino) {
            if handle.attached() == 0 {
                contents.remove(&ino);
            } else {
                debug!(ino, attached = handle.attached(), "rm deferred, handle busy");
            }
        }
    }

    fn lookup(&self, ino: u64) -> Option<Arc<IoHandle>> {
        self.contents.lock().get(&ino).cloned()
    }

    /// Open all configured tiers of a file under the session cookie.
    ///
    /// The attach is granted even when a tier had to invalidate stale
    /// content; the combined status tells the caller. Each successful open
    /// must be paired with one [`Self::close`].
    pub async fn open(
        &self,
        ino: u64,
        cookie: &str,
    ) -> Result<(Arc<IoHandle>, AttachStatus), Error> {
        let handle = self.get(ino);
        let mut status = AttachStatus::Clean;
        if let Some(file) = handle.file() {
            if file.attach(cookie)?.is_stale() {
                status = AttachStatus::Stale;
            }
        }
        if let Some(journal) = handle.journal() {
            if journal.attach().await?.is_stale() {
                status = AttachStatus::Stale;
            }
        }
        handle.attach();
        if status.is_stale() {
            info!(ino, cookie, "attached with stale cached content");
        }
        Ok((handle, status))
    }

    /// Release one holder of the file; the handle and its tiers close when
    /// the last one leaves.
    pub async fn close(&self, ino: u64) -> Result<(), Error> {
        let handle = self
            .lookup(ino)
            .ok_or_else(|| Error::not_found(format!("no open handle for inode {:#x}", ino)))?;
        if let Some(file) = handle.file() {
            file.detach()?;
        }
        if let Some(journal) = handle.journal() {
            journal.detach().await?;
        }
        if handle.detach() == 0 {
            self.rm(ino);
        }
        Ok(())
    }

    /// Drop the locally cached content of a file: the data tier is
    /// truncated away and the journal invalidated. Remote state is
    /// untouched. A file that is not currently open is a no-op.
    pub async fn invalidate(&self, ino: u64) -> Result<(), Error> {
        let Some(handle) = self.lookup(ino) else {
            return Ok(());
        };
        if let Some(file) = handle.file() {
            file.reset()?;
        }
        if let Some(journal) = handle.journal() {
            journal.truncate(0, true).await?;
        }
        info!(ino, "invalidated cached content");
        Ok(())
    }

    /// Drain every attached journal into its default read-write proxy.
    /// Returns how many journals were flushed; failures are logged and the
    /// entries stay on disk for the next sweep.
    pub async fn flush_all(&self) -> usize {
        let handles: Vec<_> = self.contents.lock().values().cloned().collect();
        let mut flushed = 0;
        for handle in handles {
            if handle.journal().is_none() {
                continue;
            }
            match handle.flush_journal().await {
                Ok(()) => flushed += 1,
                Err(e) => {
                    warn!(ino = handle.ino(), %e, "journal flush failed, entries kept");
                }
            }
        }
        flushed
    }

    pub fn size(&self) -> usize {
        self.contents.lock().len()
    }

    /// Occupancy snapshot across handles, cleaner trees, buffer pools and
    /// the orphan bin.
    pub fn stats(&self) -> CacheHandlerStats {
        let (cache_bytes, cache_files) = self
            .cache_cleaner
            .as_ref()
            .map(|c| c.totals())
            .unwrap_or((0, 0));
        let (journal_bytes, journal_files) = self
            .journal_cleaner
            .as_ref()
            .map(|c| c.totals())
            .unwrap_or((0, 0));
        CacheHandlerStats {
            handles: self.size(),
            cache_bytes,
            cache_files,
            journal_bytes,
            journal_files,
            write_buffer_bytes: self.ctx.wr_buffers.inflight_bytes(),
            readahead_buffer_bytes: self.ctx.ra_buffers.inflight_bytes(),
            orphan_chunks: self.ctx.orphan_count(),
            proxies: self.ctx.proxies(),
        }
    }

    /// Stop background workers and wait for them.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
    }
}

impl std::fmt::Debug for CacheHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("CacheHandler")
            .field("entries", &self.size())
            .field("in_memory", &self.in_memory())
            .field("journaled", &self.journaled())
            .finish()
    }
}
