//! Per-file write journal.
//!
//! Every write lands in a local journal file before (or while) it travels
//! to the remote service, so crash recovery can replay pending writes and
//! reads observe their own writes even when the remote write has not
//! completed yet.
//!
//! On-disk layout: sequential records, each a 16-byte header
//! `(offset: u64 LE, size: u64 LE)` followed by `size` payload bytes. The
//! file only grows within a session; an in-memory [`IntervalTree`] maps
//! `[offset, offset+size)` in user-file byte space to the journal-file
//! position of the record header.
use std::fs::File;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{Notify, RwLock};
use tracing::*;

use crate::cleaner::DirCleaner;
use crate::error::Error;
use crate::interval::IntervalTree;
use crate::proxy::FileProxy;

use super::AttachStatus;

/// Journal record header length: offset + size, little endian.
pub const HEADER_LEN: u64 = 16;

/// Suffix of journal files under the journal root; the cleaner trims on it.
pub const JOURNAL_SUFFIX: &str = ".jc";

/// Retries when the per-file directory level was swept away between path
/// creation and open.
const ATTACH_RETRIES: usize = 10;

/// Poll period for writers parked on the journal cap.
const CAP_POLL: Duration = Duration::from_millis(100);

/// Injected target for the synchronous replay path: issues sequential
/// writes (and a final truncate) against the remote service.
#[async_trait::async_trait]
pub trait JournalSyncer: Send + Sync {
    async fn write(&self, offset: u64, data: &[u8]) -> Result<(), Error>;
    async fn truncate(&self, size: u64) -> Result<(), Error>;
}

/// One journal-covered chunk of the user file.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub offset: u64,
    pub data: Bytes,
}

#[derive(Debug, Default)]
struct JournalState {
    file: Option<Arc<File>>,
    /// `[user offset, user offset + size)` -> journal position of the header.
    journal: IntervalTree<u64>,
    /// Allocated journal length (headers + payloads).
    cachesize: u64,
    /// Deferred truncation of the user file; `None` when unset or dropped
    /// by cache invalidation.
    truncatesize: Option<u64>,
    max_offset: u64,
    attached: usize,
    flushed: u64,
    /// File length seen at attach, for cleaner delta reporting.
    attach_size: u64,
}

pub struct JournalCache {
    ino: u64,
    root: PathBuf,
    /// Per-file journal cap; writers block once the journal is this large.
    max_size: u64,
    cleaner: Option<Arc<DirCleaner>>,
    state: RwLock<JournalState>,
    /// Signalled when the flusher drains entries and cap space frees up.
    space: Notify,
}

impl JournalCache {
    pub fn new(
        ino: u64,
        root: impl Into<PathBuf>,
        max_size: u64,
        cleaner: Option<Arc<DirCleaner>>,
    ) -> Self {
        Self {
            ino,
            root: root.into(),
            max_size,
            cleaner,
            state: RwLock::new(JournalState::default()),
            space: Notify::new(),
        }
    }

    /// Journal files hash into 4096 low-bits buckets, unlike the data cache
    /// bucketing; the divergence is intentional (journals are fewer and
    /// short-lived).
    pub fn location(root: &Path, ino: u64) -> PathBuf {
        let bucket = if ino > 0x0fff_ffff {
            (ino >> 28) % 4096
        } else {
            ino % 4096
        };
        root.join(format!("{:03X}", bucket))
            .join(format!("{:08X}{}", ino, JOURNAL_SUFFIX))
    }

    fn path(&self, mkpath: bool) -> Result<PathBuf, Error> {
        let path = Self::location(&self.root, self.ino);
        if mkpath {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
        }
        Ok(path)
    }

    /// Open (creating) the journal file and rebuild the interval index from
    /// any existing content. The directory level is re-created on demand:
    /// the cleaner may sweep it between two opens.
    pub async fn attach(&self) -> Result<AttachStatus, Error> {
        let mut st = self.state.write().await;
        if st.attached == 0 && st.file.is_none() {
            let mut path = self.path(true)?;
            let existing = std::fs::metadata(&path).map(|m| m.len()).ok();
            if existing.is_none() {
                if let Some(cleaner) = &self.cleaner {
                    cleaner.external().change(0, 1);
                }
            }
            let mut tries = 0;
            let file = loop {
                match File::options().read(true).write(true).create(true).open(&path) {
                    Ok(f) => break f,
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                        tries += 1;
                        if tries >= ATTACH_RETRIES {
                            return Err(e.into());
                        }
                        path = self.path(true)?;
                    }
                    Err(e) => return Err(e.into()),
                }
            };
            let file = Arc::new(file);
            st.attach_size = existing.unwrap_or(0);
            st.cachesize = read_journal(&file, &mut st.journal)?;
            st.max_offset = st.journal.max_high();
            st.file = Some(file);
            debug!(ino = self.ino, entries = st.journal.len(),
                   size = st.cachesize, "attached journal");
        }
        st.attached += 1;
        Ok(AttachStatus::Clean)
    }

    pub async fn detach(&self) -> Result<(), Error> {
        let mut st = self.state.write().await;
        assert!(st.attached > 0, "detach without attach");
        st.attached -= 1;
        if st.attached == 0 {
            if let (Some(cleaner), Some(file)) = (&self.cleaner, &st.file) {
                let len = file.metadata().map(|m| m.len()).unwrap_or(0);
                cleaner
                    .external()
                    .change(len as i64 - st.attach_size as i64, 0);
            }
            st.file = None;
        }
        Ok(())
    }

    pub async fn unlink(&self) -> Result<(), Error> {
        let path = self.path(false)?;
        if let Ok(meta) = std::fs::metadata(&path) {
            std::fs::remove_file(&path)?;
            if let Some(cleaner) = &self.cleaner {
                cleaner.external().change(-(meta.len() as i64), -1);
            }
        }
        Ok(())
    }

    /// Whether `count` more journal bytes fit under the cap.
    pub async fn fits(&self, count: u64) -> bool {
        let st = self.state.read().await;
        self.max_size >= st.cachesize + count
    }

    pub async fn size(&self) -> u64 {
        self.state.read().await.cachesize
    }

    pub async fn max_offset(&self) -> u64 {
        self.state.read().await.max_offset
    }

    pub async fn truncate_size(&self) -> Option<u64> {
        self.state.read().await.truncatesize
    }

    pub async fn entries(&self) -> usize {
        self.state.read().await.journal.len()
    }

    pub async fn first_flush(&self) -> bool {
        self.state.read().await.flushed == 0
    }

    pub async fn done_flush(&self) {
        self.state.write().await.flushed += 1;
    }

    /// Read journal-covered bytes of `[offset, offset + buf.len())`.
    ///
    /// Bytes with no journal entry are left untouched; the caller layers
    /// the result over the data cache and/or the remote tier. A pending
    /// truncation clips the effective range.
    pub async fn pread(&self, buf: &mut [u8], offset: u64) -> Result<usize, Error> {
        let st = self.state.read().await;
        let file = match &st.file {
            Some(f) => f.clone(),
            None => return Ok(0),
        };
        let count = buf.len() as u64;
        let mut bytes_read: u64 = 0;
        let mut pos = offset;
        for span in st.journal.query(offset, offset + count) {
            if span.low <= pos && pos < span.high {
                let cacheoff = span.value + HEADER_LEN + (pos - span.low);
                let want = (span.high - pos).min(count - bytes_read) as usize;
                let start = bytes_read as usize;
                file.read_exact_at(&mut buf[start..start + want], cacheoff)?;
                bytes_read += want as u64;
                pos += want as u64;
                if bytes_read >= count {
                    break;
                }
            }
        }
        if let Some(t) = st.truncatesize {
            if offset >= t {
                return Ok(0);
            }
            if offset + bytes_read > t {
                return Ok((t - offset) as usize);
            }
        }
        Ok(bytes_read as usize)
    }

    /// Record a write.
    ///
    /// Regions already journalled are overwritten in place inside the
    /// existing records (in ascending journal order); uncovered leftovers
    /// are appended as fresh records. Blocks while the journal cap is
    /// exhausted until the flusher frees space.
    pub async fn pwrite(&self, buf: &[u8], offset: u64) -> Result<usize, Error> {
        self.pwrite_opts(buf, offset, true).await
    }

    /// Non-blocking variant: fails with [`Error::QuotaExceeded`] instead of
    /// parking on the cap.
    pub async fn pwrite_opts(
        &self,
        buf: &[u8],
        offset: u64,
        blocking: bool,
    ) -> Result<usize, Error> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            {
                let mut st = self.state.write().await;
                if st.cachesize < self.max_size {
                    return self.do_pwrite(&mut st, buf, offset);
                }
            }
            if !blocking {
                return Err(Error::QuotaExceeded);
            }
            let _ = tokio::time::timeout(CAP_POLL, self.space.notified()).await;
        }
    }

    fn do_pwrite(
        &self,
        st: &mut JournalState,
        buf: &[u8],
        offset: u64,
    ) -> Result<usize, Error> {
        let file = st
            .file
            .clone()
            .ok_or(Error::InvalidArgument("journal not attached"))?;
        let count = buf.len() as u64;
        let end = offset + count;

        // Segments of the incoming write not covered by existing records.
        let mut leftovers: Vec<(u64, u64)> = vec![(offset, end)];
        // In-place updates: (journal payload position, range in `buf`).
        let mut updates: Vec<(u64, std::ops::Range<usize>)> = Vec::new();
        for span in st.journal.query_owned(offset, end) {
            let mut next = Vec::with_capacity(leftovers.len() + 1);
            for (lo, hi) in leftovers {
                let ilo = lo.max(span.low);
                let ihi = hi.min(span.high);
                if ilo >= ihi {
                    next.push((lo, hi));
                    continue;
                }
                updates.push((
                    span.value + HEADER_LEN + (ilo - span.low),
                    (ilo - offset) as usize..(ihi - offset) as usize,
                ));
                if lo < ilo {
                    next.push((lo, ilo));
                }
                if ihi < hi {
                    next.push((ihi, hi));
                }
            }
            leftovers = next;
        }

        // updates batched in ascending journal offset
        updates.sort_by_key(|(pos, _)| *pos);
        for (pos, range) in updates {
            file.write_all_at(&buf[range], pos)?;
        }

        leftovers.sort_by_key(|(lo, _)| *lo);
        for (lo, hi) in leftovers {
            let size = hi - lo;
            let mut header = [0u8; HEADER_LEN as usize];
            header[..8].copy_from_slice(&lo.to_le_bytes());
            header[8..].copy_from_slice(&size.to_le_bytes());
            file.write_all_at(&header, st.cachesize)?;
            file.write_all_at(
                &buf[(lo - offset) as usize..(hi - offset) as usize],
                st.cachesize + HEADER_LEN,
            )?;
            st.journal.insert(lo, hi, st.cachesize);
            st.cachesize += HEADER_LEN + size;
        }

        if let Some(t) = st.truncatesize {
            // the write went past the pending truncation mark
            if end > t {
                st.truncatesize = Some(end);
            }
        }
        st.max_offset = st.max_offset.max(end);
        Ok(buf.len())
    }

    /// Record a truncation of the user file.
    ///
    /// A non-zero size only sets the deferred mark: reads are clipped, but
    /// recorded entries stay valid for later overlapping writes. Size zero
    /// drops the journal; `invalidate` distinguishes cache invalidation
    /// (mark unset) from a real truncate-to-zero (mark kept at 0).
    pub async fn truncate(&self, size: u64, invalidate: bool) -> Result<(), Error> {
        let mut st = self.state.write().await;
        if size > 0 {
            st.truncatesize = Some(size);
            st.max_offset = size;
            return Ok(());
        }
        st.truncatesize = if invalidate { None } else { Some(0) };
        st.max_offset = 0;
        st.journal.clear();
        st.cachesize = 0;
        if let Some(file) = &st.file {
            let len = file.metadata().map(|m| m.len()).unwrap_or(0);
            file.set_len(0)?;
            if let Some(cleaner) = &self.cleaner {
                cleaner
                    .external()
                    .change(len as i64 - st.attach_size as i64, 0);
            }
            st.attach_size = 0;
        }
        self.space.notify_waiters();
        Ok(())
    }

    pub async fn sync(&self) -> Result<(), Error> {
        let st = self.state.read().await;
        if let Some(file) = &st.file {
            file.sync_data()?;
        }
        Ok(())
    }

    /// Synchronous replay: hand every record to the syncer in ascending
    /// user-file order, the deferred truncate last. On success the tree is
    /// cleared and the journal file truncated to zero; on failure the
    /// entries stay on disk for the next attempt.
    pub async fn remote_sync(&self, syncer: &dyn JournalSyncer) -> Result<(), Error> {
        let mut st = self.state.write().await;
        let file = st
            .file
            .clone()
            .ok_or(Error::InvalidArgument("journal not attached"))?;
        let result = async {
            let entries: Vec<_> = st
                .journal
                .iter()
                .map(|s| (s.low, s.high, *s.value))
                .collect();
            for (low, high, pos) in entries {
                let mut data = vec![0u8; (high - low) as usize];
                file.read_exact_at(&mut data, pos + HEADER_LEN)?;
                syncer.write(low, &data).await?;
            }
            if let Some(t) = st.truncatesize {
                syncer.truncate(t).await?;
            }
            Ok::<_, Error>(())
        }
        .await;
        match result {
            Ok(()) => {
                st.journal.clear();
                debug!(ino = self.ino, truncate = ?st.truncatesize, "journal replayed");
                file.set_len(0)?;
                st.cachesize = 0;
                self.space.notify_waiters();
                Ok(())
            }
            Err(e) => {
                warn!(ino = self.ino, %e, "journal replay failed, entries kept");
                self.space.notify_waiters();
                Err(e)
            }
        }
    }

    /// Asynchronous replay: schedule one proxy write per record, submit the
    /// batch in order, then the deferred truncate. Any scheduling failure
    /// aborts and leaves the journal intact.
    pub async fn remote_sync_async(&self, proxy: &Arc<FileProxy>) -> Result<(), Error> {
        let mut st = self.state.write().await;
        let file = st
            .file
            .clone()
            .ok_or(Error::InvalidArgument("journal not attached"))?;
        let result = async {
            let entries: Vec<_> = st
                .journal
                .iter()
                .map(|s| (s.low, s.high, *s.value))
                .collect();
            for (low, high, pos) in entries {
                let size = (high - low) as usize;
                let handler = proxy.write_async_prepare(size, low, Duration::ZERO).await;
                handler.with_buffer_mut(|b| file.read_exact_at(b, pos + HEADER_LEN))?;
                proxy.schedule_write_async(handler)?;
            }
            proxy.collect_writes()?;
            if let Some(t) = st.truncatesize.take() {
                proxy.truncate_after_writes(t).await?;
            }
            Ok::<_, Error>(())
        }
        .await;
        match result {
            Ok(()) => {
                st.journal.clear();
                file.set_len(0)?;
                st.cachesize = 0;
                self.space.notify_waiters();
                Ok(())
            }
            Err(e) => {
                warn!(ino = self.ino, %e, "async journal replay failed");
                self.space.notify_waiters();
                Err(e)
            }
        }
    }

    /// Drop all state and content, keeping the file attached.
    pub async fn reset(&self) -> Result<(), Error> {
        let mut st = self.state.write().await;
        st.journal.clear();
        if let Some(file) = &st.file {
            file.set_len(0)?;
        }
        st.cachesize = 0;
        st.max_offset = 0;
        st.truncatesize = None;
        self.space.notify_waiters();
        Ok(())
    }

    /// Rename the journal aside for offline inspection.
    pub async fn rescue(&self, dst: Option<&Path>) -> Result<PathBuf, Error> {
        let path = self.path(false)?;
        let dst = dst
            .map(|p| p.to_owned())
            .unwrap_or_else(|| path.with_extension("jc.recover"));
        std::fs::rename(&path, &dst)?;
        warn!(ino = self.ino, dst = %dst.display(), "rescued journal");
        Ok(dst)
    }

    /// Journal-covered chunks overlapping `[offset, offset + size)`, with
    /// their payload bytes, clamped to the range.
    pub async fn get_chunks(&self, offset: u64, size: u64) -> Result<Vec<Chunk>, Error> {
        let st = self.state.read().await;
        let file = match &st.file {
            Some(f) => f.clone(),
            None => return Ok(Vec::new()),
        };
        let mut out = Vec::new();
        for span in st.journal.query(offset, offset + size) {
            let lo = span.low.max(offset);
            let hi = span.high.min(offset + size);
            let mut data = vec![0u8; (hi - lo) as usize];
            file.read_exact_at(&mut data, span.value + HEADER_LEN + (lo - span.low))?;
            out.push(Chunk {
                offset: lo,
                data: data.into(),
            });
        }
        Ok(out)
    }

    pub async fn dump(&self) -> String {
        use itertools::Itertools;
        let st = self.state.read().await;
        let entries = st
            .journal
            .iter()
            .map(|span| format!("  [{}, {}) @ {}", span.low, span.high, span.value))
            .join("\n");
        format!(
            "ino={:#x} size={} entries={} truncate={:?} max_offset={}\n{}",
            self.ino,
            st.cachesize,
            st.journal.len(),
            st.truncatesize,
            st.max_offset,
            entries
        )
    }
}

/// Sequentially decode record headers, skipping payloads, and rebuild the
/// interval index. Returns the allocated journal length.
fn read_journal(file: &File, journal: &mut IntervalTree<u64>) -> Result<u64, Error> {
    journal.clear();
    let len = file.metadata()?.len();
    let mut pos = 0u64;
    let mut header = [0u8; HEADER_LEN as usize];
    while pos + HEADER_LEN <= len {
        file.read_exact_at(&mut header, pos)?;
        let offset = u64::from_le_bytes(header[..8].try_into().unwrap());
        let size = u64::from_le_bytes(header[8..].try_into().unwrap());
        if size == 0 || pos + HEADER_LEN + size > len || journal.overlaps(offset, offset + size) {
            // torn tail record; everything before it stays valid
            warn!(pos, size, "corrupt journal record, stopping recovery");
            break;
        }
        journal.insert(offset, offset + size, pos);
        pos += HEADER_LEN + size;
    }
    Ok(pos)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn journal(dir: &Path, cap: u64) -> JournalCache {
        JournalCache::new(0xabc, dir, cap, None)
    }

    #[tokio::test]
    async fn read_your_writes_with_overlaps() {
        let dir = tempfile::tempdir().unwrap();
        let j = journal(dir.path(), 1 << 20);
        j.attach().await.unwrap();
        j.pwrite(&[1u8; 100], 0).await.unwrap();
        j.pwrite(&[2u8; 100], 50).await.unwrap();
        j.pwrite(&[3u8; 10], 60).await.unwrap();
        let mut buf = [0u8; 150];
        assert_eq!(j.pread(&mut buf, 0).await.unwrap(), 150);
        assert!(buf[..50].iter().all(|b| *b == 1));
        assert!(buf[50..60].iter().all(|b| *b == 2));
        assert!(buf[60..70].iter().all(|b| *b == 3));
        assert!(buf[70..150].iter().all(|b| *b == 2));
    }

    #[tokio::test]
    async fn overlapping_writes_stay_disjoint() {
        let dir = tempfile::tempdir().unwrap();
        let j = journal(dir.path(), 1 << 20);
        j.attach().await.unwrap();
        // partial overlaps: [0,4096), [2048,6144), [1024,5120)
        j.pwrite(&vec![0xAA; 4096], 0).await.unwrap();
        j.pwrite(&vec![0xBB; 4096], 2048).await.unwrap();
        j.pwrite(&vec![0xCC; 4096], 1024).await.unwrap();
        assert!(j.entries().await <= 3);
        let mut buf = vec![0u8; 6144];
        assert_eq!(j.pread(&mut buf, 0).await.unwrap(), 6144);
        assert!(buf[..1024].iter().all(|b| *b == 0xAA));
        assert!(buf[1024..5120].iter().all(|b| *b == 0xCC));
        assert!(buf[5120..].iter().all(|b| *b == 0xBB));
    }

    #[tokio::test]
    async fn uncovered_bytes_left_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let j = journal(dir.path(), 1 << 20);
        j.attach().await.unwrap();
        j.pwrite(&[5u8; 10], 100).await.unwrap();
        let mut buf = [0x77u8; 40];
        // range starts before the covered interval: nothing is read
        assert_eq!(j.pread(&mut buf, 80).await.unwrap(), 0);
        assert!(buf.iter().all(|b| *b == 0x77));
    }

    #[tokio::test]
    async fn truncate_clips_reads() {
        let dir = tempfile::tempdir().unwrap();
        let j = journal(dir.path(), 1 << 20);
        j.attach().await.unwrap();
        j.pwrite(&[9u8; 100], 0).await.unwrap();
        j.truncate(40, false).await.unwrap();
        let mut buf = [0u8; 100];
        assert_eq!(j.pread(&mut buf, 0).await.unwrap(), 40);
        assert_eq!(j.pread(&mut buf, 40).await.unwrap(), 0);
        assert_eq!(j.pread(&mut buf, 60).await.unwrap(), 0);
        // a later write past the mark raises it
        j.pwrite(&[8u8; 10], 60).await.unwrap();
        assert_eq!(j.truncate_size().await, Some(70));
    }

    #[tokio::test]
    async fn invalidate_vs_truncate_to_zero() {
        let dir = tempfile::tempdir().unwrap();
        let j = journal(dir.path(), 1 << 20);
        j.attach().await.unwrap();
        j.pwrite(&[1u8; 16], 0).await.unwrap();
        j.truncate(0, false).await.unwrap();
        assert_eq!(j.truncate_size().await, Some(0));
        assert_eq!(j.size().await, 0);
        j.pwrite(&[1u8; 16], 0).await.unwrap();
        j.truncate(0, true).await.unwrap();
        assert_eq!(j.truncate_size().await, None);
        assert_eq!(j.entries().await, 0);
    }

    #[tokio::test]
    async fn attach_recovers_existing_journal() {
        let dir = tempfile::tempdir().unwrap();
        {
            let j = journal(dir.path(), 1 << 20);
            j.attach().await.unwrap();
            j.pwrite(&[3u8; 32], 64).await.unwrap();
            j.pwrite(&[4u8; 32], 256).await.unwrap();
            j.detach().await.unwrap();
        }
        let j = journal(dir.path(), 1 << 20);
        j.attach().await.unwrap();
        assert_eq!(j.entries().await, 2);
        assert_eq!(j.size().await, 2 * (HEADER_LEN + 32));
        let mut buf = [0u8; 32];
        assert_eq!(j.pread(&mut buf, 64).await.unwrap(), 32);
        assert!(buf.iter().all(|b| *b == 3));
    }

    struct CollectingSyncer {
        writes: parking_lot::Mutex<Vec<(u64, Vec<u8>)>>,
        truncates: parking_lot::Mutex<Vec<u64>>,
        fail: bool,
    }
    #[async_trait::async_trait]
    impl JournalSyncer for CollectingSyncer {
        async fn write(&self, offset: u64, data: &[u8]) -> Result<(), Error> {
            if self.fail {
                return Err(Error::TransientRemote(crate::remote::RemoteStatus::error(
                    crate::remote::StatusCode::ConnectionError,
                    "down",
                )));
            }
            self.writes.lock().push((offset, data.to_vec()));
            Ok(())
        }
        async fn truncate(&self, size: u64) -> Result<(), Error> {
            self.truncates.lock().push(size);
            Ok(())
        }
    }

    #[tokio::test]
    async fn remote_sync_replays_and_clears() {
        let dir = tempfile::tempdir().unwrap();
        let j = journal(dir.path(), 1 << 20);
        j.attach().await.unwrap();
        j.pwrite(&[1u8; 512], 0).await.unwrap();
        j.pwrite(&[2u8; 512], 4096).await.unwrap();
        j.truncate(8192, false).await.unwrap();
        let syncer = CollectingSyncer {
            writes: Default::default(),
            truncates: Default::default(),
            fail: false,
        };
        j.remote_sync(&syncer).await.unwrap();
        let writes = syncer.writes.lock();
        assert_eq!(writes.len(), 2);
        assert_eq!(writes[0].0, 0);
        assert_eq!(writes[1].0, 4096);
        assert_eq!(*syncer.truncates.lock(), vec![8192]);
        assert_eq!(j.entries().await, 0);
        assert_eq!(j.size().await, 0);
        let path = JournalCache::location(dir.path(), 0xabc);
        assert_eq!(std::fs::metadata(path).unwrap().len(), 0);
    }

    #[tokio::test]
    async fn failed_replay_keeps_entries() {
        let dir = tempfile::tempdir().unwrap();
        let j = journal(dir.path(), 1 << 20);
        j.attach().await.unwrap();
        j.pwrite(&[1u8; 512], 0).await.unwrap();
        let syncer = CollectingSyncer {
            writes: Default::default(),
            truncates: Default::default(),
            fail: true,
        };
        assert!(j.remote_sync(&syncer).await.is_err());
        assert_eq!(j.entries().await, 1);
        assert!(j.size().await > 0);
    }

    #[tokio::test]
    async fn cap_rejects_nonblocking_writer() {
        let dir = tempfile::tempdir().unwrap();
        let j = journal(dir.path(), 64);
        j.attach().await.unwrap();
        j.pwrite(&[0u8; 64], 0).await.unwrap();
        assert!(matches!(
            j.pwrite_opts(&[0u8; 8], 100, false).await,
            Err(Error::QuotaExceeded)
        ));
    }

    #[tokio::test]
    async fn capped_writer_unblocks_after_replay() {
        let dir = tempfile::tempdir().unwrap();
        let j = Arc::new(journal(dir.path(), 64));
        j.attach().await.unwrap();
        j.pwrite(&[0u8; 64], 0).await.unwrap();
        let j2 = j.clone();
        let writer = tokio::spawn(async move { j2.pwrite(&[1u8; 8], 100).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!writer.is_finished());
        let syncer = CollectingSyncer {
            writes: Default::default(),
            truncates: Default::default(),
            fail: false,
        };
        j.remote_sync(&syncer).await.unwrap();
        assert_eq!(writer.await.unwrap().unwrap(), 8);
    }

    #[tokio::test]
    async fn chunks_are_clamped() {
        let dir = tempfile::tempdir().unwrap();
        let j = journal(dir.path(), 1 << 20);
        j.attach().await.unwrap();
        j.pwrite(&[6u8; 100], 0).await.unwrap();
        let chunks = j.get_chunks(40, 20).await.unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].offset, 40);
        assert_eq!(chunks[0].data.len(), 20);
    }
}
