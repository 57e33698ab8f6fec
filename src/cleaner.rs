//! Background trimmer for an on-disk cache directory tree.
//!
//! Keeps a suffix-filtered view of the tree ordered by mtime and deletes
//! the oldest files when byte or inode caps are exceeded. A leveler task
//! re-checks every 15 seconds, falls back to a full purge when the
//! partition runs out of space, and rescans from scratch once an hour.
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::*;

/// Leveler wake-up period.
const LEVEL_PERIOD: Duration = Duration::from_secs(15);
/// Every this many leveler rounds a full rescan is forced (one hour).
const FORCED_SCAN_ROUNDS: u64 = 60 * 60 / 15;
/// Free-space fraction below which the whole cache is purged.
const FREE_SPACE_PANIC: f64 = 0.05;

#[derive(Debug, Clone)]
struct FileInfo {
    path: PathBuf,
    size: u64,
}

#[derive(Debug, Default)]
struct TreeInfo {
    /// mtime-ordered; the tiebreaker keeps same-second files distinct.
    by_mtime: BTreeMap<(SystemTime, u64), FileInfo>,
    total_size: i64,
    total_files: i64,
}

/// Size/inode deltas another subsystem has already applied to the tree
/// (journal creations and deletions), letting the leveler throttle without
/// a full rescan.
#[derive(Debug, Default)]
pub struct ExternalTree {
    bytes: AtomicI64,
    files: AtomicI64,
}

impl ExternalTree {
    pub fn change(&self, bytes: i64, files: i64) {
        self.bytes.fetch_add(bytes, Ordering::Relaxed);
        self.files.fetch_add(files, Ordering::Relaxed);
    }
    pub fn bytes(&self) -> i64 {
        self.bytes.load(Ordering::Relaxed)
    }
    pub fn files(&self) -> i64 {
        self.files.load(Ordering::Relaxed)
    }
    fn reset(&self) {
        self.bytes.store(0, Ordering::Relaxed);
        self.files.store(0, Ordering::Relaxed);
    }
}

#[derive(Debug)]
pub struct DirCleaner {
    root: PathBuf,
    suffix: String,
    max_size: i64,
    max_files: i64,
    tree: Mutex<TreeInfo>,
    external: ExternalTree,
}

impl DirCleaner {
    /// Caps of zero disable the corresponding limit.
    pub fn new(
        root: impl Into<PathBuf>,
        suffix: impl Into<String>,
        max_size: u64,
        max_files: u64,
    ) -> Arc<Self> {
        Arc::new(Self {
            root: root.into(),
            suffix: suffix.into(),
            max_size: max_size as i64,
            max_files: max_files as i64,
            tree: Mutex::new(TreeInfo::default()),
            external: ExternalTree::default(),
        })
    }

    pub fn external(&self) -> &ExternalTree {
        &self.external
    }

    fn matches(&self, path: &Path) -> bool {
        if self.suffix.is_empty() {
            return true;
        }
        path.to_string_lossy().ends_with(&self.suffix)
    }

    fn walk(&self, dir: &Path, out: &mut TreeInfo, seq: &mut u64) {
        let entries = match std::fs::read_dir(dir) {
            Ok(e) => e,
            Err(e) => {
                if e.kind() != std::io::ErrorKind::NotFound {
                    error!(path = %dir.display(), %e, "read_dir failed");
                }
                return;
            }
        };
        for entry in entries.flatten() {
            let path = entry.path();
            // hidden entries are skipped
            if entry
                .file_name()
                .to_string_lossy()
                .starts_with('.')
            {
                continue;
            }
            let meta = match entry.metadata() {
                Ok(m) => m,
                // files can get cleaned while we scan
                Err(_) => continue,
            };
            if meta.is_dir() {
                self.walk(&path, out, seq);
            } else if meta.is_file() && self.matches(&path) {
                let mtime = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
                *seq += 1;
                out.total_files += 1;
                out.total_size += meta.len() as i64;
                out.by_mtime.insert(
                    (mtime, *seq),
                    FileInfo {
                        path,
                        size: meta.len(),
                    },
                );
            }
        }
    }

    /// Rebuild the mtime map from the filesystem; resets external hints.
    pub fn scan_all(&self) {
        let mut fresh = TreeInfo::default();
        let mut seq = 0;
        self.walk(&self.root, &mut fresh, &mut seq);
        debug!(path = %self.root.display(), files = fresh.total_files,
               size = fresh.total_size, "scanned cache tree");
        *self.tree.lock() = fresh;
        self.external.reset();
    }

    /// Unconditionally delete every matching file under the root.
    pub fn clean_all(&self) {
        self.scan_all();
        let mut tree = self.tree.lock();
        info!(path = %self.root.display(), files = tree.total_files,
              size = tree.total_size, "purging cache tree");
        for info in tree.by_mtime.values() {
            if let Err(e) = std::fs::remove_file(&info.path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    error!(path = %info.path.display(), %e, "unlink failed");
                }
            }
        }
        tree.by_mtime.clear();
        tree.total_files = 0;
        tree.total_size = 0;
        self.external.reset();
    }

    /// Delete oldest files while either cap is exceeded. Without `force`,
    /// the scan is skipped entirely when the cached totals plus the
    /// external hints are below the caps.
    pub fn trim(&self, force: bool) {
        if !force {
            let tree = self.tree.lock();
            let size = tree.total_size + self.external.bytes();
            let files = tree.total_files + self.external.files();
            drop(tree);
            let size_ok = self.max_size == 0 || size <= self.max_size;
            let files_ok = self.max_files == 0 || files <= self.max_files;
            if size_ok && files_ok {
                return;
            }
        }
        self.scan_all();
        let mut tree = self.tree.lock();
        while let Some((key, info)) = tree.by_mtime.iter().next().map(|(k, v)| (*k, v.clone())) {
            let size_ok = self.max_size == 0 || tree.total_size <= self.max_size;
            let files_ok = self.max_files == 0 || tree.total_files <= self.max_files;
            if size_ok && files_ok {
                break;
            }
            info!(path = %info.path.display(), size = info.size, "trimming cache file");
            match std::fs::remove_file(&info.path) {
                Ok(()) => {
                    tree.total_size -= info.size as i64;
                    tree.total_files -= 1;
                }
                Err(e) => {
                    error!(path = %info.path.display(), %e, "failed to unlink cache file");
                }
            }
            tree.by_mtime.remove(&key);
        }
    }

    pub fn totals(&self) -> (i64, i64) {
        let tree = self.tree.lock();
        (tree.total_size, tree.total_files)
    }

    fn statvfs(&self) -> Option<(u64, u64)> {
        let path = std::ffi::CString::new(self.root.as_os_str().to_string_lossy().as_bytes()).ok()?;
        let mut sfs: libc::statvfs = unsafe { std::mem::zeroed() };
        if unsafe { libc::statvfs(path.as_ptr(), &mut sfs) } != 0 {
            return None;
        }
        let free = sfs.f_bavail as u64 * sfs.f_bsize as u64;
        let total = sfs.f_blocks as u64 * sfs.f_frsize as u64;
        Some((free, total))
    }

    /// Background leveler: every 15 s check the partition and trim; purge
    /// everything when free space drops below 5%; force a full rescan once
    /// an hour.
    pub fn spawn_leveler(self: Arc<Self>, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        let this = self;
        tokio::spawn(async move {
            let mut round: u64 = 0;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(LEVEL_PERIOD) => {}
                }
                let mut panic_clean = false;
                if let Some((free, total)) = this.statvfs() {
                    if total > 0 {
                        let freep = free as f64 / total as f64;
                        debug!(path = %this.root.display(), free, total,
                               filled = 100.0 * (1.0 - freep), "partition status");
                        if freep < FREE_SPACE_PANIC {
                            warn!(path = %this.root.display(), free, total,
                                  "less than 5% free space, cleaning cache");
                            panic_clean = true;
                        }
                    }
                }
                let this2 = this.clone();
                let forced = round % FORCED_SCAN_ROUNDS == 0;
                // filesystem work off the executor threads
                let _ = tokio::task::spawn_blocking(move || {
                    if panic_clean {
                        this2.clean_all();
                    } else {
                        this2.trim(forced);
                    }
                })
                .await;
                round += 1;
            }
        })
    }
}
