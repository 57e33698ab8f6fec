//! End-to-end scenarios across the cache tiers, the journal and the
//! proxy.
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use fscache_async::cache::journal::HEADER_LEN;
use fscache_async::cache::{AttachStatus, JournalCache, JournalSyncer};
use fscache_async::cleaner::DirCleaner;
use fscache_async::{
    CacheConfig, CacheHandler, CacheKind, Error, FileProxy, IoHandle, OpenFlags, ProxyContext,
    RemoteFile, RemoteStatus,
};

#[derive(Default)]
struct RecordingRemote {
    writes: Mutex<Vec<(u64, Vec<u8>)>>,
    truncates: Mutex<Vec<u64>>,
}

#[async_trait::async_trait]
impl RemoteFile for RecordingRemote {
    async fn open(
        &self,
        _url: &str,
        _flags: OpenFlags,
        _mode: u32,
        _timeout: Duration,
    ) -> RemoteStatus {
        RemoteStatus::ok()
    }
    async fn read(&self, _offset: u64, _buf: &mut [u8], _timeout: Duration) -> (RemoteStatus, u32) {
        (RemoteStatus::ok(), 0)
    }
    async fn write(&self, offset: u64, data: &[u8], _timeout: Duration) -> RemoteStatus {
        self.writes.lock().push((offset, data.to_vec()));
        RemoteStatus::ok()
    }
    async fn truncate(&self, size: u64, _timeout: Duration) -> RemoteStatus {
        self.truncates.lock().push(size);
        RemoteStatus::ok()
    }
    async fn sync(&self, _timeout: Duration) -> RemoteStatus {
        RemoteStatus::ok()
    }
    async fn close(&self, _timeout: Duration) -> RemoteStatus {
        RemoteStatus::ok()
    }
}

struct CountingSyncer {
    writes: Mutex<Vec<(u64, Vec<u8>)>>,
}

#[async_trait::async_trait]
impl JournalSyncer for CountingSyncer {
    async fn write(&self, offset: u64, data: &[u8]) -> Result<(), Error> {
        self.writes.lock().push((offset, data.to_vec()));
        Ok(())
    }
    async fn truncate(&self, _size: u64) -> Result<(), Error> {
        Ok(())
    }
}

/// Journal replay scenario: three 4 KiB writes at offsets {0, 2048, 1024}
/// with partial overlaps.
#[tokio::test]
async fn journal_replay_covers_range_without_overlap() {
    // tests race on the global subscriber
    let _ = fscache_async::logging::init(false);
    let dir = tempfile::tempdir().unwrap();
    let journal = JournalCache::new(0x77, dir.path(), 128 * 1024 * 1024, None);
    journal.attach().await.unwrap();

    journal.pwrite(&vec![0xA0; 4096], 0).await.unwrap();
    journal.pwrite(&vec![0xB0; 4096], 2048).await.unwrap();
    journal.pwrite(&vec![0xC0; 4096], 1024).await.unwrap();

    // at most three disjoint entries covering [0, 6144)
    assert!(journal.entries().await <= 3);
    assert_eq!(journal.max_offset().await, 6144);

    // read-your-writes, last-write-wins
    let mut buf = vec![0u8; 6144];
    assert_eq!(journal.pread(&mut buf, 0).await.unwrap(), 6144);
    assert!(buf[..1024].iter().all(|b| *b == 0xA0));
    assert!(buf[1024..5120].iter().all(|b| *b == 0xC0));
    assert!(buf[5120..6144].iter().all(|b| *b == 0xB0));

    // one backend write per entry, tree cleared, file truncated
    let entries = journal.entries().await;
    let syncer = CountingSyncer {
        writes: Mutex::new(Vec::new()),
    };
    journal.remote_sync(&syncer).await.unwrap();
    let writes = syncer.writes.lock();
    assert_eq!(writes.len(), entries);
    // replayed in ascending user-file offset, covering the full range
    let mut covered = 0;
    for (offset, data) in writes.iter() {
        assert_eq!(*offset, covered);
        covered += data.len() as u64;
    }
    assert_eq!(covered, 6144);
    drop(writes);
    assert_eq!(journal.entries().await, 0);
    assert_eq!(journal.size().await, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn journal_async_replay_through_proxy() {
    let dir = tempfile::tempdir().unwrap();
    let journal = JournalCache::new(0x78, dir.path(), 128 * 1024 * 1024, None);
    journal.attach().await.unwrap();
    journal.pwrite(&vec![1u8; 1000], 0).await.unwrap();
    journal.pwrite(&vec![2u8; 1000], 5000).await.unwrap();
    journal.truncate(6000, false).await.unwrap();

    let remote = Arc::new(RecordingRemote::default());
    let ctx = ProxyContext::new(&CacheConfig::default());
    let proxy = FileProxy::new(ctx, remote.clone(), 0x78);
    proxy
        .open_async("root://mock//f", OpenFlags::WRITE, 0, Duration::ZERO)
        .unwrap();
    assert!(proxy.wait_open().await.is_ok());

    journal.remote_sync_async(&proxy).await.unwrap();
    let writes = remote.writes.lock();
    assert_eq!(writes.len(), 2);
    assert_eq!(writes[0].0, 0);
    assert!(writes[0].1.iter().all(|b| *b == 1));
    assert_eq!(writes[1].0, 5000);
    assert!(writes[1].1.iter().all(|b| *b == 2));
    // the deferred truncate went out last
    assert_eq!(*remote.truncates.lock(), vec![6000]);
    assert_eq!(journal.entries().await, 0);
    assert_eq!(journal.truncate_size().await, None);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn io_handle_flushes_journal_into_default_proxy() {
    let dir = tempfile::tempdir().unwrap();
    let io = Arc::new(IoHandle::new(0x79));
    io.set_journal(JournalCache::new(0x79, dir.path(), 128 * 1024 * 1024, None));
    io.journal().unwrap().attach().await.unwrap();
    io.journal().unwrap().pwrite(&[3u8; 64], 128).await.unwrap();

    // no rw proxy: flushing is an error, the journal stays intact
    assert!(io.flush_journal().await.is_err());
    assert_eq!(io.journal().unwrap().entries().await, 1);

    let remote = Arc::new(RecordingRemote::default());
    let ctx = ProxyContext::new(&CacheConfig::default());
    let proxy = FileProxy::new(ctx, remote.clone(), 0x79);
    proxy
        .open_async("root://mock//f", OpenFlags::WRITE, 0, Duration::ZERO)
        .unwrap();
    assert!(proxy.wait_open().await.is_ok());
    io.set_proxy_rw(fscache_async::io::DEFAULT_PROXY, proxy);

    io.flush_journal().await.unwrap();
    assert_eq!(remote.writes.lock().len(), 1);
    assert_eq!(io.journal().unwrap().entries().await, 0);
}

/// Cookie mismatch scenario through the cache handler's disk tier.
#[tokio::test]
async fn cookie_mismatch_invalidates_disk_cache() {
    let dir = tempfile::tempdir().unwrap();
    let config = CacheConfig {
        cache_type: CacheKind::Disk,
        location: dir.path().join("cache"),
        per_file_bytes: 4 * 1024 * 1024,
        ..Default::default()
    };
    let handler = CacheHandler::init(config).unwrap();
    let handle = handler.get(0x1001);
    let cache = handle.file().unwrap();

    assert!(matches!(cache.attach("A").unwrap(), AttachStatus::Clean));
    let payload = vec![0x5Au8; 1024 * 1024];
    assert_eq!(cache.pwrite(&payload, 0).unwrap(), payload.len());
    assert_eq!(cache.size().unwrap(), 1024 * 1024);
    cache.detach().unwrap();

    let status = cache.attach("B").unwrap();
    assert!(status.is_stale());
    assert_eq!(cache.size().unwrap(), 0);
    assert_eq!(cache.cookie().unwrap().unwrap(), "B");
    cache.detach().unwrap();
    handler.shutdown().await;
}

/// Cleaner scenario: fill the cache root beyond its byte cap and let a
/// non-forced trim delete oldest-mtime files first.
#[tokio::test]
async fn trim_deletes_oldest_until_below_cap() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    for (i, age) in (0..8u64).map(|i| (i, 800 - i * 100)) {
        let path = root.join(format!("{:03X}", i)).join(format!("f{}.jc", i));
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, vec![0u8; 1000]).unwrap();
        let f = std::fs::File::options().write(true).open(&path).unwrap();
        f.set_modified(std::time::SystemTime::now() - Duration::from_secs(age))
            .unwrap();
    }
    let cleaner = DirCleaner::new(root, ".jc", 4000, 0);
    cleaner.scan_all();
    // over the cap: external hints alone tell the leveler to act
    cleaner.trim(false);
    let (size, files) = cleaner.totals();
    assert!(size <= 4000);
    assert_eq!(files, 4);
    // the oldest four (largest ages) are gone, the newest four remain
    for i in 0..4u64 {
        assert!(!root.join(format!("{:03X}", i)).join(format!("f{}.jc", i)).exists());
    }
    for i in 4..8u64 {
        assert!(root.join(format!("{:03X}", i)).join(format!("f{}.jc", i)).exists());
    }
}

#[tokio::test]
async fn journal_files_feed_cleaner_hints() {
    let dir = tempfile::tempdir().unwrap();
    let cleaner = DirCleaner::new(dir.path(), ".jc", 0, 0);
    let journal = JournalCache::new(0x42, dir.path(), 1 << 20, Some(cleaner.clone()));
    journal.attach().await.unwrap();
    assert_eq!(cleaner.external().files(), 1);
    journal.pwrite(&[1u8; 100], 0).await.unwrap();
    journal.detach().await.unwrap();
    assert_eq!(cleaner.external().bytes(), (HEADER_LEN + 100) as i64);
    journal.unlink().await.unwrap();
    assert_eq!(cleaner.external().files(), 0);
    assert_eq!(cleaner.external().bytes(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn background_flusher_drains_journal() {
    let dir = tempfile::tempdir().unwrap();
    let io = Arc::new(IoHandle::new(0x80));
    io.set_journal(JournalCache::new(0x80, dir.path(), 1 << 20, None));
    io.journal().unwrap().attach().await.unwrap();

    let remote = Arc::new(RecordingRemote::default());
    let ctx = ProxyContext::new(&CacheConfig::default());
    let proxy = FileProxy::new(ctx, remote.clone(), 0x80);
    proxy
        .open_async("root://mock//f", OpenFlags::WRITE, 0, Duration::ZERO)
        .unwrap();
    assert!(proxy.wait_open().await.is_ok());
    io.set_proxy_rw(fscache_async::io::DEFAULT_PROXY, proxy);

    let cancel = tokio_util::sync::CancellationToken::new();
    let flusher = io.clone().spawn_flusher(Duration::from_millis(20), cancel.clone());
    io.journal().unwrap().pwrite(&[9u8; 32], 0).await.unwrap();
    for _ in 0..100 {
        if io.journal().unwrap().entries().await == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(io.journal().unwrap().entries().await, 0);
    assert_eq!(remote.writes.lock().len(), 1);
    cancel.cancel();
    flusher.await.unwrap();
}

/// Randomized read-your-writes property: arbitrary overlapping writes
/// against the journal behave like writes into a flat buffer.
#[tokio::test]
async fn journal_matches_reference_model_under_random_writes() {
    use rand::{Rng, SeedableRng};
    let mut rng = rand::rngs::StdRng::seed_from_u64(0x5EED);
    let dir = tempfile::tempdir().unwrap();
    let journal = JournalCache::new(0x90, dir.path(), 128 * 1024 * 1024, None);
    journal.attach().await.unwrap();

    const SPAN: usize = 64 * 1024;
    let mut model = vec![0u8; SPAN];
    let mut written = vec![false; SPAN];
    for _ in 0..200 {
        let offset = rng.gen_range(0..SPAN - 1);
        let len = rng.gen_range(1..(SPAN - offset).min(4096));
        let fill: u8 = rng.gen();
        let data = vec![fill; len];
        journal.pwrite(&data, offset as u64).await.unwrap();
        model[offset..offset + len].copy_from_slice(&data);
        written[offset..offset + len].iter_mut().for_each(|w| *w = true);
    }

    // journal-covered bytes must match the model exactly
    let chunks = journal.get_chunks(0, SPAN as u64).await.unwrap();
    let mut covered = vec![false; SPAN];
    for chunk in chunks {
        let start = chunk.offset as usize;
        assert_eq!(&chunk.data[..], &model[start..start + chunk.data.len()]);
        covered[start..start + chunk.data.len()]
            .iter_mut()
            .for_each(|c| *c = true);
    }
    assert_eq!(covered, written);

    // a full-range pread stops at the first uncovered hole
    let mut buf = vec![0u8; SPAN];
    let n = journal.pread(&mut buf, 0).await.unwrap();
    assert_eq!(&buf[..n], &model[..n]);
}

/// Synchronous replay through a proxy-backed syncer.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn proxy_syncer_replays_in_order() {
    use fscache_async::io::ProxySyncer;
    let dir = tempfile::tempdir().unwrap();
    let journal = JournalCache::new(0x91, dir.path(), 1 << 20, None);
    journal.attach().await.unwrap();
    journal.pwrite(&[4u8; 256], 0).await.unwrap();
    journal.pwrite(&[5u8; 256], 1024).await.unwrap();
    journal.truncate(2048, false).await.unwrap();

    let remote = Arc::new(RecordingRemote::default());
    let ctx = ProxyContext::new(&CacheConfig::default());
    let proxy = FileProxy::new(ctx, remote.clone(), 0x91);
    proxy
        .open_async("root://mock//f", OpenFlags::WRITE, 0, Duration::ZERO)
        .unwrap();
    assert!(proxy.wait_open().await.is_ok());

    let syncer = ProxySyncer::new(proxy, Duration::ZERO);
    journal.remote_sync(&syncer).await.unwrap();
    let writes = remote.writes.lock();
    assert_eq!(writes.len(), 2);
    assert_eq!((writes[0].0, writes[0].1.len()), (0, 256));
    assert_eq!((writes[1].0, writes[1].1.len()), (1024, 256));
    assert_eq!(*remote.truncates.lock(), vec![2048]);
    assert_eq!(journal.entries().await, 0);
}

/// Proxy recovery: the replacement inherits pending writes and the journal
/// is replayed against it.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn io_handle_recovers_rw_proxy() {
    let dir = tempfile::tempdir().unwrap();
    let io = Arc::new(IoHandle::new(0x92));
    io.set_journal(JournalCache::new(0x92, dir.path(), 1 << 20, None));
    io.journal().unwrap().attach().await.unwrap();
    io.journal().unwrap().pwrite(&[6u8; 128], 0).await.unwrap();

    let dead = Arc::new(RecordingRemote::default());
    let ctx = ProxyContext::new(&CacheConfig::default());
    let proxy = FileProxy::new(ctx, dead.clone(), 0x92);
    proxy
        .open_async("root://mock//f", OpenFlags::WRITE, 0, Duration::ZERO)
        .unwrap();
    assert!(proxy.wait_open().await.is_ok());
    proxy.attach();
    // a write parked in the batching queue when the connection died
    let handler = proxy.write_async_prepare(64, 4096, Duration::ZERO).await;
    handler.copy_from(&[7u8; 64]);
    proxy.schedule_write_async(handler).unwrap();
    io.set_proxy_rw(fscache_async::io::DEFAULT_PROXY, proxy.clone());

    let replacement = Arc::new(RecordingRemote::default());
    let fresh = io.recover_rw(replacement.clone()).await.unwrap();
    assert!(fresh.wait_write().await.is_ok());
    assert_eq!(fresh.attached(), 1);
    let writes = replacement.writes.lock();
    // inherited queue write plus the journal replay
    assert_eq!(writes.len(), 2);
    assert_eq!(writes[0].0, 4096);
    assert_eq!(writes[1].0, 0);
    assert!(dead.writes.lock().is_empty());
    assert_eq!(io.journal().unwrap().entries().await, 0);
}

/// The handler-wide sweep drains every attached journal that has a
/// read-write proxy and leaves the others for the next round.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn handler_flush_all_drains_attached_journals() {
    let dir = tempfile::tempdir().unwrap();
    let config = CacheConfig {
        cache_type: CacheKind::Memory,
        location: dir.path().join("cache"),
        journal_location: dir.path().join("journal"),
        ..Default::default()
    };
    let handler = CacheHandler::init(config).unwrap();

    let (with_proxy, _) = handler.open(0xA1, "s").await.unwrap();
    with_proxy.journal().unwrap().pwrite(&[1u8; 64], 0).await.unwrap();
    let remote = Arc::new(RecordingRemote::default());
    let proxy = FileProxy::new(handler.context().clone(), remote.clone(), 0xA1);
    proxy
        .open_async("root://mock//a", OpenFlags::WRITE, 0, Duration::ZERO)
        .unwrap();
    assert!(proxy.wait_open().await.is_ok());
    with_proxy.set_proxy_rw(fscache_async::io::DEFAULT_PROXY, proxy);

    // a second file with pending writes but no proxy: flush fails, kept
    let (orphaned, _) = handler.open(0xA2, "s").await.unwrap();
    orphaned.journal().unwrap().pwrite(&[2u8; 64], 0).await.unwrap();

    assert_eq!(handler.flush_all().await, 1);
    assert_eq!(with_proxy.journal().unwrap().entries().await, 0);
    assert_eq!(orphaned.journal().unwrap().entries().await, 1);
    assert_eq!(remote.writes.lock().len(), 1);

    handler.close(0xA1).await.unwrap();
    handler.close(0xA2).await.unwrap();
    handler.shutdown().await;
}
