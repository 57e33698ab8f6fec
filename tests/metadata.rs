//! Metadata provider tests against an in-memory store with operation
//! counters.
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{mpsc, Barrier};

use fscache_async::error::DecodeError;
use fscache_async::metadata::fetcher::keys;
use fscache_async::metadata::{encode_blob, ContainerMetadata, FileMetadata, MetadataFetcher};
use fscache_async::{
    ContainerIdentifier, Error, FileIdentifier, MetadataConfig, MetadataProvider, MetadataStore,
    MetadataProviderShard,
};

#[derive(Default)]
struct MockStore {
    kv: Mutex<BTreeMap<String, Bytes>>,
    hashes: Mutex<BTreeMap<String, BTreeMap<Vec<u8>, Bytes>>>,
    subscribers: Mutex<BTreeMap<String, Vec<mpsc::Sender<Bytes>>>>,
    hget_count: AtomicUsize,
    hgetall_count: AtomicUsize,
    delay: Option<Duration>,
}

impl MockStore {
    fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Default::default()
        }
    }

    async fn publish(&self, channel: &str, payload: &[u8]) {
        let senders = self.subscribers.lock().get(channel).cloned().unwrap_or_default();
        for tx in senders {
            tx.send(Bytes::copy_from_slice(payload)).await.unwrap();
        }
    }

    fn hgets(&self) -> usize {
        self.hget_count.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl MetadataStore for MockStore {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, Error> {
        Ok(self.kv.lock().get(key).cloned())
    }
    async fn set(&self, key: &str, value: Bytes) -> Result<(), Error> {
        self.kv.lock().insert(key.to_owned(), value);
        Ok(())
    }
    async fn hget(&self, key: &str, field: &[u8]) -> Result<Option<Bytes>, Error> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.hget_count.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .hashes
            .lock()
            .get(key)
            .and_then(|h| h.get(field))
            .cloned())
    }
    async fn hset(&self, key: &str, field: &[u8], value: Bytes) -> Result<(), Error> {
        self.hashes
            .lock()
            .entry(key.to_owned())
            .or_default()
            .insert(field.to_vec(), value);
        Ok(())
    }
    async fn hlen(&self, key: &str) -> Result<u64, Error> {
        Ok(self.hashes.lock().get(key).map(|h| h.len() as u64).unwrap_or(0))
    }
    async fn hdel(&self, key: &str, field: &[u8]) -> Result<bool, Error> {
        Ok(self
            .hashes
            .lock()
            .get_mut(key)
            .map(|h| h.remove(field).is_some())
            .unwrap_or(false))
    }
    async fn hgetall(&self, key: &str) -> Result<Vec<(Bytes, Bytes)>, Error> {
        self.hgetall_count.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .hashes
            .lock()
            .get(key)
            .map(|h| {
                h.iter()
                    .map(|(k, v)| (Bytes::copy_from_slice(k), v.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }
    async fn subscribe(&self, channel: &str) -> Result<mpsc::Receiver<Bytes>, Error> {
        let (tx, rx) = mpsc::channel(16);
        self.subscribers
            .lock()
            .entry(channel.to_owned())
            .or_default()
            .push(tx);
        Ok(rx)
    }
}

async fn put_file(store: &MockStore, md: &FileMetadata) {
    store
        .hset(
            keys::file_md(),
            &keys::id_field(md.id.underlying()),
            encode_blob(md).unwrap(),
        )
        .await
        .unwrap();
    store
        .hset(
            keys::file_index(),
            &fscache_async::LocalityHint::build(md.container, &md.name),
            md.id.underlying().to_string().into(),
        )
        .await
        .unwrap();
    store
        .hset(
            &keys::sub_files(md.container),
            md.name.as_bytes(),
            md.id.underlying().to_string().into(),
        )
        .await
        .unwrap();
}

async fn put_container(store: &MockStore, md: &ContainerMetadata) {
    store
        .hset(
            keys::container_md(),
            &keys::id_field(md.id.underlying()),
            encode_blob(md).unwrap(),
        )
        .await
        .unwrap();
}

fn file(id: u64, parent: u64, name: &str) -> FileMetadata {
    let mut md = FileMetadata::new(
        FileIdentifier::new(id),
        ContainerIdentifier::new(parent),
        name,
    );
    md.size = 1000 + id;
    md
}

#[tokio::test]
async fn zero_fid_rejected_without_backend_call() {
    let store = Arc::new(MockStore::default());
    let shard = MetadataProviderShard::new(store.clone(), 100, 100);
    let err = shard.retrieve_file(FileIdentifier::new(0)).await.unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));
    assert_eq!(store.hgets(), 0);

    // and uniformly at the provider entry points
    let provider = MetadataProvider::new(MetadataConfig::default(), {
        let store = store.clone();
        move |_| store.clone() as Arc<dyn MetadataStore>
    });
    assert!(matches!(
        provider.retrieve_file(FileIdentifier::new(0)).await,
        Err(Error::NotFound(_))
    ));
    assert!(matches!(
        provider.retrieve_container(ContainerIdentifier::new(0)).await,
        Err(Error::NotFound(_))
    ));
    assert!(!provider.has_file(FileIdentifier::new(0)).await.unwrap());
    assert_eq!(store.hgets(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_retrievals_coalesce() {
    let store = Arc::new(MockStore::with_delay(Duration::from_millis(50)));
    put_file(&store, &file(42, 1, "x")).await;
    let shard = MetadataProviderShard::new(store.clone(), 100, 100);

    let barrier = Arc::new(Barrier::new(2));
    let mut tasks = Vec::new();
    for _ in 0..2 {
        let shard = shard.clone();
        let barrier = barrier.clone();
        tasks.push(tokio::spawn(async move {
            barrier.wait().await;
            shard.retrieve_file(FileIdentifier::new(42)).await.unwrap()
        }));
    }
    let a = tasks.remove(0).await.unwrap();
    let b = tasks.remove(0).await.unwrap();
    // one backend GET, pointer-equal results
    assert_eq!(store.hgets(), 1);
    assert!(Arc::ptr_eq(&a, &b));
    assert_eq!(a.size, 1042);

    // a third call after completion hits the LRU
    let c = shard.retrieve_file(FileIdentifier::new(42)).await.unwrap();
    assert!(Arc::ptr_eq(&a, &c));
    assert_eq!(store.hgets(), 1);
    assert_eq!(shard.file_cache_stats().occupancy, 1);
    assert_eq!(shard.file_cache_stats().in_flight, 0);
}

#[tokio::test]
async fn failed_retrieval_clears_inflight_and_retries() {
    let store = Arc::new(MockStore::default());
    let shard = MetadataProviderShard::new(store.clone(), 100, 100);
    // miss: not in the backend
    assert!(shard.retrieve_file(FileIdentifier::new(9)).await.is_err());
    assert_eq!(shard.file_cache_stats().in_flight, 0);
    // after the backend catches up, the next caller succeeds
    put_file(&store, &file(9, 1, "late")).await;
    let md = shard.retrieve_file(FileIdentifier::new(9)).await.unwrap();
    assert_eq!(md.name, "late");
}

#[tokio::test]
async fn container_retrieval_combines_three_requests() {
    let store = Arc::new(MockStore::default());
    let mut cont = ContainerMetadata::new(
        ContainerIdentifier::new(5),
        ContainerIdentifier::root(),
        "photos",
    );
    // the stored blob does not carry the child maps
    cont.files.clear();
    cont.containers.clear();
    put_container(&store, &cont).await;
    put_file(&store, &file(100, 5, "a.jpg")).await;
    put_file(&store, &file(101, 5, "b.jpg")).await;
    store
        .hset(
            &keys::sub_containers(ContainerIdentifier::new(5)),
            b"2024",
            Bytes::from_static(b"6"),
        )
        .await
        .unwrap();

    let shard = MetadataProviderShard::new(store.clone(), 100, 100);
    let md = shard
        .retrieve_container(ContainerIdentifier::new(5))
        .await
        .unwrap();
    assert_eq!(md.name, "photos");
    assert_eq!(md.files.len(), 2);
    assert_eq!(md.files["a.jpg"], FileIdentifier::new(100));
    assert_eq!(md.containers["2024"], ContainerIdentifier::new(6));
}

#[tokio::test]
async fn tombstone_returns_not_found_without_backend() {
    let store = Arc::new(MockStore::default());
    let provider = MetadataProvider::new(MetadataConfig::default(), {
        let store = store.clone();
        move |_| store.clone() as Arc<dyn MetadataStore>
    });
    let id = FileIdentifier::new(7);
    provider.insert_file(id, Arc::new(file(7, 1, "doomed")));
    assert!(provider.retrieve_file(id).await.is_ok());
    provider.tombstone_file(id);
    let err = provider.retrieve_file(id).await.unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));
    assert_eq!(store.hgets(), 0);
    // dropping outright clears the tombstone too
    assert!(provider.drop_cached_file(id));
    assert!(!provider.drop_cached_file(id));
}

#[tokio::test]
async fn inserted_entries_skip_the_backend() {
    let store = Arc::new(MockStore::default());
    let shard = MetadataProviderShard::new(store.clone(), 100, 100);
    let md = Arc::new(file(55, 1, "local"));
    shard.insert_file(FileIdentifier::new(55), md.clone());
    let got = shard.retrieve_file(FileIdentifier::new(55)).await.unwrap();
    assert!(Arc::ptr_eq(&md, &got));
    assert_eq!(store.hgets(), 0);
}

#[tokio::test]
async fn lru_evicts_least_recently_used() {
    let store = Arc::new(MockStore::default());
    let shard = MetadataProviderShard::new(store.clone(), 2, 2);
    for id in 1..=3u64 {
        put_file(&store, &file(id, 1, &format!("f{}", id))).await;
        shard.retrieve_file(FileIdentifier::new(id)).await.unwrap();
    }
    assert_eq!(shard.file_cache_stats().occupancy, 2);
    let before = store.hgets();
    // id=1 was evicted, its retrieval goes back to the backend
    shard.retrieve_file(FileIdentifier::new(1)).await.unwrap();
    assert_eq!(store.hgets(), before + 1);
}

#[tokio::test]
async fn by_name_lookups_use_the_locality_index() {
    let store = Arc::new(MockStore::default());
    put_file(&store, &file(300, 12, "notes.txt")).await;
    let provider = MetadataProvider::new(MetadataConfig::default(), {
        let store = store.clone();
        move |_| store.clone() as Arc<dyn MetadataStore>
    });
    let id = provider
        .get_file_id_by_name(ContainerIdentifier::new(12), "notes.txt")
        .await
        .unwrap();
    assert_eq!(id, FileIdentifier::new(300));
    assert!(matches!(
        provider
            .get_file_id_by_name(ContainerIdentifier::new(12), "missing")
            .await,
        Err(Error::NotFound(_))
    ));
}

#[tokio::test]
async fn batched_prefetch_returns_one_future_per_child() {
    let raw = Arc::new(MockStore::default());
    for (id, name) in [(1u64, "a"), (2, "b"), (3, "c")] {
        put_file(&raw, &file(id, 9, name)).await;
    }
    let store: Arc<dyn MetadataStore> = raw.clone();
    let children =
        MetadataFetcher::get_files_in_container(&store, ContainerIdentifier::new(9))
            .await
            .unwrap();
    assert_eq!(children.len(), 3);
    // ordered by name
    let names: Vec<_> = children.iter().map(|(n, _)| n.clone()).collect();
    assert_eq!(names, vec!["a", "b", "c"]);
    for (name, fut) in children {
        let md = fut.await.unwrap();
        assert_eq!(md.name, name);
    }
    assert_eq!(
        MetadataFetcher::count_files(raw.as_ref(), ContainerIdentifier::new(9))
            .await
            .unwrap(),
        3
    );
}

#[tokio::test]
async fn corrupted_blob_surfaces_checksum_mismatch() {
    let store = Arc::new(MockStore::default());
    let md = file(77, 1, "fragile");
    let mut blob = encode_blob(&md).unwrap().to_vec();
    let idx = blob.len() / 2;
    blob[idx] ^= 0x01;
    store
        .hset(keys::file_md(), &keys::id_field(77), blob.into())
        .await
        .unwrap();
    let shard = MetadataProviderShard::new(store.clone(), 100, 100);
    let err = shard.retrieve_file(FileIdentifier::new(77)).await.unwrap_err();
    assert!(matches!(err, Error::ChecksumMismatch), "{:?}", err);
}

#[tokio::test]
async fn malformed_map_ids_are_decode_errors() {
    let store = Arc::new(MockStore::default());
    store
        .hset(
            &keys::sub_files(ContainerIdentifier::new(4)),
            b"weird",
            Bytes::from_static(b"not-a-number"),
        )
        .await
        .unwrap();
    let err = MetadataFetcher::get_file_map(store.as_ref(), ContainerIdentifier::new(4))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Decode(DecodeError::Ascii)));
}

#[tokio::test]
async fn refresh_listener_drops_invalidated_entries() {
    let store = Arc::new(MockStore::default());
    put_file(&store, &file(64, 1, "hot")).await;
    let provider = MetadataProvider::new(MetadataConfig::default(), {
        let store = store.clone();
        move |_| store.clone() as Arc<dyn MetadataStore>
    });
    provider
        .start_refresh_listener(store.clone())
        .await
        .unwrap();
    provider.retrieve_file(FileIdentifier::new(64)).await.unwrap();
    let before = store.hgets();

    store
        .publish(fscache_async::remote::CHANNEL_FILE_INVALIDATION, b"64")
        .await;
    // the listener runs asynchronously
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(provider.file_cache_stats().occupancy, 0);
    provider.retrieve_file(FileIdentifier::new(64)).await.unwrap();
    assert!(store.hgets() > before);
    provider.stop_refresh_listener().await;
}

#[tokio::test]
async fn shard_stats_aggregate() {
    let store = Arc::new(MockStore::default());
    let provider = MetadataProvider::new(MetadataConfig::default(), {
        let store = store.clone();
        move |_| store.clone() as Arc<dyn MetadataStore>
    });
    for id in 1..=20u64 {
        provider.insert_file(FileIdentifier::new(id), Arc::new(file(id, 1, "s")));
    }
    let stats = provider.file_cache_stats();
    assert_eq!(stats.occupancy, 20);
    assert!(stats.capacity >= 20);
    assert_eq!(stats.in_flight, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn prefetch_warms_a_directory() {
    let store = Arc::new(MockStore::default());
    let mut cont = ContainerMetadata::new(
        ContainerIdentifier::new(30),
        ContainerIdentifier::root(),
        "bulk",
    );
    cont.files.clear();
    cont.containers.clear();
    put_container(&store, &cont).await;
    for id in 31..=35u64 {
        put_file(&store, &file(id, 30, &format!("f{}", id))).await;
    }
    let provider = MetadataProvider::new(MetadataConfig::default(), {
        let store = store.clone();
        move |_| store.clone() as Arc<dyn MetadataStore>
    });
    let staged = provider
        .prefetch_container(ContainerIdentifier::new(30))
        .await
        .unwrap();
    assert_eq!(staged, 5);
    // wait until the staged retrievals settle into the LRU
    for _ in 0..100 {
        if provider.file_cache_stats().occupancy == 5 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let before = store.hgets();
    for id in 31..=35u64 {
        provider.retrieve_file(FileIdentifier::new(id)).await.unwrap();
    }
    // all five were already warm
    assert_eq!(store.hgets(), before);
}

#[tokio::test]
async fn batched_directory_fetch_keeps_per_child_outcomes() {
    let raw = Arc::new(MockStore::default());
    for (id, name) in [(40u64, "a"), (41, "b"), (43, "d")] {
        put_file(&raw, &file(id, 20, name)).await;
    }
    // child "c" is listed but its blob is gone
    raw.hset(
        &keys::sub_files(ContainerIdentifier::new(20)),
        b"c",
        Bytes::from_static(b"42"),
    )
    .await
    .unwrap();
    let store: Arc<dyn MetadataStore> = raw.clone();
    let children = MetadataFetcher::fetch_files_in_container(&store, ContainerIdentifier::new(20))
        .await
        .unwrap();
    let names: Vec<_> = children.iter().map(|(n, _)| n.as_str()).collect();
    assert_eq!(names, vec!["a", "b", "c", "d"]);
    for (name, outcome) in &children {
        match name.as_str() {
            "c" => assert!(matches!(outcome, Err(Error::NotFound(_)))),
            _ => assert_eq!(outcome.as_ref().unwrap().name, *name),
        }
    }
}

#[tokio::test]
async fn batched_existence_probe() {
    let raw = Arc::new(MockStore::default());
    put_file(&raw, &file(50, 1, "here")).await;
    let store: Arc<dyn MetadataStore> = raw.clone();
    let ids = [
        FileIdentifier::new(50),
        FileIdentifier::new(51),
        FileIdentifier::new(0),
    ];
    assert_eq!(
        MetadataFetcher::files_exist(&store, &ids).await.unwrap(),
        vec![true, false, false]
    );
}

#[tokio::test]
async fn by_name_two_step_verifies_the_index() {
    let store = Arc::new(MockStore::default());
    put_file(&store, &file(60, 14, "good")).await;
    let md = MetadataFetcher::get_file_by_name(store.as_ref(), ContainerIdentifier::new(14), "good")
        .await
        .unwrap();
    assert_eq!(md.id, FileIdentifier::new(60));

    // dangling index entry: the id resolves but the blob is gone
    store
        .hset(
            keys::file_index(),
            &keys::name_field(ContainerIdentifier::new(14), "gone"),
            Bytes::from_static(b"61"),
        )
        .await
        .unwrap();
    assert!(matches!(
        MetadataFetcher::get_file_by_name(store.as_ref(), ContainerIdentifier::new(14), "gone")
            .await,
        Err(Error::NotFound(_))
    ));

    // index pointing at a blob with another parent/name is a fatal
    // backend inconsistency
    store
        .hset(
            keys::file_index(),
            &keys::name_field(ContainerIdentifier::new(14), "liar"),
            Bytes::from_static(b"60"),
        )
        .await
        .unwrap();
    assert!(matches!(
        MetadataFetcher::get_file_by_name(store.as_ref(), ContainerIdentifier::new(14), "liar")
            .await,
        Err(Error::FatalRemote(_))
    ));
}

#[tokio::test]
async fn malformed_names_and_parents_rejected_without_backend() {
    let store = Arc::new(MockStore::default());
    for bad in ["", "a/b", ".", ".."] {
        assert!(matches!(
            MetadataFetcher::get_file_id_by_name(
                store.as_ref(),
                ContainerIdentifier::new(1),
                bad
            )
            .await,
            Err(Error::InvalidArgument(_))
        ));
    }
    assert!(matches!(
        MetadataFetcher::get_file_map(store.as_ref(), ContainerIdentifier::new(0)).await,
        Err(Error::NotFound(_))
    ));
    assert!(matches!(
        MetadataFetcher::count_files(store.as_ref(), ContainerIdentifier::new(0)).await,
        Err(Error::NotFound(_))
    ));
    assert_eq!(store.hgets(), 0);
}

#[tokio::test]
async fn mismatched_blob_identity_is_fatal() {
    let store = Arc::new(MockStore::default());
    // a blob stored under the wrong field
    let md = file(70, 1, "shifty");
    store
        .hset(keys::file_md(), &keys::id_field(71), encode_blob(&md).unwrap())
        .await
        .unwrap();
    assert!(matches!(
        MetadataFetcher::get_file(store.as_ref(), FileIdentifier::new(71)).await,
        Err(Error::FatalRemote(_))
    ));
}

#[tokio::test]
async fn provider_by_name_retrieval_lands_in_the_cache() {
    let store = Arc::new(MockStore::default());
    put_file(&store, &file(80, 16, "cached.txt")).await;
    let provider = MetadataProvider::new(MetadataConfig::default(), {
        let store = store.clone();
        move |_| store.clone() as Arc<dyn MetadataStore>
    });
    let md = provider
        .retrieve_file_by_name(ContainerIdentifier::new(16), "cached.txt")
        .await
        .unwrap();
    assert_eq!(md.id, FileIdentifier::new(80));
    // the blob fetch went through the shard once; the id lookup stays
    // index-only on a repeat
    let before = store.hgets();
    let again = provider
        .retrieve_file_by_name(ContainerIdentifier::new(16), "cached.txt")
        .await
        .unwrap();
    assert!(Arc::ptr_eq(&md, &again));
    assert_eq!(store.hgets(), before + 1); // one index hget, no blob fetch
}
