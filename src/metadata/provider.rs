//! Sharded metadata provider and the invalidation refresh listener.
use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHasher;
use std::hash::{Hash, Hasher};
use tokio_util::sync::CancellationToken;
use tracing::*;

use crate::config::MetadataConfig;
use crate::error::Error;
use crate::ids::{ContainerIdentifier, FileIdentifier};
use crate::remote::{
    MetadataStore, CHANNEL_CONTAINER_INVALIDATION, CHANNEL_FILE_INVALIDATION,
};

use super::fetcher::MetadataFetcher;
use super::shard::{CacheStatistics, MetadataProviderShard};
use super::types::{ContainerMetadata, FileMetadata};

/// Fixed shard count; lookups fan out by a stable hash of the identifier.
pub const METADATA_SHARDS: usize = 16;

/// Sharded, asynchronous, read-through metadata cache.
///
/// Each shard owns its own backend client (constructed through the store
/// factory), partitioning contention. Continuations run on the ambient
/// tokio runtime, which must outlive the provider and its store clients;
/// shards drop before the refresh listener's store by field order.
pub struct MetadataProvider {
    shards: Vec<Arc<MetadataProviderShard>>,
    refresh: Mutex<Option<RefreshListener>>,
    config: MetadataConfig,
    weak: std::sync::Weak<MetadataProvider>,
}

impl MetadataProvider {
    /// `store_factory(i)` yields the backend client of shard `i`, in the
    /// same way the reader-pool factories construct per-pool backends.
    pub fn new(
        config: MetadataConfig,
        store_factory: impl crate::StoreFactory,
    ) -> Arc<Self> {
        let per_shard_files = (config.file_cache_entries / METADATA_SHARDS).max(1);
        let per_shard_containers = (config.container_cache_entries / METADATA_SHARDS).max(1);
        let shards = (0..METADATA_SHARDS)
            .map(|i| {
                MetadataProviderShard::new(
                    store_factory(i),
                    per_shard_files,
                    per_shard_containers,
                )
            })
            .collect();
        Arc::new_cyclic(|weak| Self {
            shards,
            refresh: Mutex::new(None),
            config,
            weak: weak.clone(),
        })
    }

    pub fn config(&self) -> &MetadataConfig {
        &self.config
    }

    fn shard_of(&self, id: u64) -> &Arc<MetadataProviderShard> {
        let mut hasher = FxHasher::default();
        id.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) % self.shards.len()]
    }

    pub fn file_shard(&self, id: FileIdentifier) -> &Arc<MetadataProviderShard> {
        self.shard_of(id.underlying())
    }

    pub fn container_shard(&self, id: ContainerIdentifier) -> &Arc<MetadataProviderShard> {
        self.shard_of(id.underlying())
    }

    pub async fn retrieve_file(&self, id: FileIdentifier) -> Result<Arc<FileMetadata>, Error> {
        if id.is_absent() {
            return Err(Error::not_found(format!("{} (fid=0 is illegal)", id)));
        }
        self.file_shard(id).retrieve_file(id).await
    }

    pub async fn retrieve_container(
        &self,
        id: ContainerIdentifier,
    ) -> Result<Arc<ContainerMetadata>, Error> {
        if id.is_absent() {
            return Err(Error::not_found(format!("{} (cid=0 is illegal)", id)));
        }
        self.container_shard(id).retrieve_container(id).await
    }

    pub async fn has_file(&self, id: FileIdentifier) -> Result<bool, Error> {
        if id.is_absent() {
            return Ok(false);
        }
        self.file_shard(id).has_file(id).await
    }

    pub async fn get_file_id_by_name(
        &self,
        parent: ContainerIdentifier,
        name: &str,
    ) -> Result<FileIdentifier, Error> {
        let shard = self.container_shard(parent);
        MetadataFetcher::get_file_id_by_name(shard.store().as_ref(), parent, name).await
    }

    pub async fn get_container_id_by_name(
        &self,
        parent: ContainerIdentifier,
        name: &str,
    ) -> Result<ContainerIdentifier, Error> {
        let shard = self.container_shard(parent);
        MetadataFetcher::get_container_id_by_name(shard.store().as_ref(), parent, name).await
    }

    /// By-name retrieval through the cache: resolve the id via the
    /// locality index, then go through the owning shard so concurrent
    /// callers coalesce and the result lands in the LRU.
    pub async fn retrieve_file_by_name(
        &self,
        parent: ContainerIdentifier,
        name: &str,
    ) -> Result<Arc<FileMetadata>, Error> {
        let id = self.get_file_id_by_name(parent, name).await?;
        self.retrieve_file(id).await
    }

    pub async fn retrieve_container_by_name(
        &self,
        parent: ContainerIdentifier,
        name: &str,
    ) -> Result<Arc<ContainerMetadata>, Error> {
        let id = self.get_container_id_by_name(parent, name).await?;
        self.retrieve_container(id).await
    }

    pub fn insert_file(&self, id: FileIdentifier, md: Arc<FileMetadata>) {
        self.file_shard(id).insert_file(id, md);
    }

    pub fn insert_container(&self, id: ContainerIdentifier, md: Arc<ContainerMetadata>) {
        self.container_shard(id).insert_container(id, md);
    }

    pub fn tombstone_file(&self, id: FileIdentifier) {
        self.file_shard(id).tombstone_file(id);
    }

    pub fn tombstone_container(&self, id: ContainerIdentifier) {
        self.container_shard(id).tombstone_container(id);
    }

    pub fn drop_cached_file(&self, id: FileIdentifier) -> bool {
        self.file_shard(id).drop_cached_file(id)
    }

    pub fn drop_cached_container(&self, id: ContainerIdentifier) -> bool {
        self.container_shard(id).drop_cached_container(id)
    }

    pub fn file_cache_stats(&self) -> CacheStatistics {
        self.shards
            .iter()
            .map(|s| s.file_cache_stats())
            .fold(CacheStatistics::default(), fold_stats)
    }

    pub fn container_cache_stats(&self) -> CacheStatistics {
        self.shards
            .iter()
            .map(|s| s.container_cache_stats())
            .fold(CacheStatistics::default(), fold_stats)
    }

    /// Warm the cache for a whole directory: retrieve the container and
    /// stage one retrieval per child file and sub-container. Children
    /// already cached or in flight coalesce for free. Returns the number of
    /// staged children.
    pub async fn prefetch_container(&self, id: ContainerIdentifier) -> Result<usize, Error> {
        let md = self.retrieve_container(id).await?;
        let this = self
            .weak
            .upgrade()
            .ok_or_else(|| Error::Executor("provider gone".into()))?;
        let mut staged = 0;
        for &fid in md.files.values() {
            let provider = this.clone();
            tokio::spawn(async move {
                if let Err(e) = provider.retrieve_file(fid).await {
                    debug!(%fid, %e, "child prefetch failed");
                }
            });
            staged += 1;
        }
        for &cid in md.containers.values() {
            let provider = this.clone();
            tokio::spawn(async move {
                if let Err(e) = provider.retrieve_container(cid).await {
                    debug!(%cid, %e, "child prefetch failed");
                }
            });
            staged += 1;
        }
        Ok(staged)
    }

    /// Subscribe to the backend invalidation channels; incoming ids drop
    /// the corresponding LRU entries so the next read re-fetches.
    pub async fn start_refresh_listener(
        &self,
        store: Arc<dyn MetadataStore>,
    ) -> Result<(), Error> {
        let cancel = CancellationToken::new();
        let mut files = store.subscribe(CHANNEL_FILE_INVALIDATION).await?;
        let mut containers = store.subscribe(CHANNEL_CONTAINER_INVALIDATION).await?;
        let provider = self.weak.clone();
        let task = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        msg = files.recv() => {
                            let Some(msg) = msg else { return };
                            let Some(provider) = provider.upgrade() else { return };
                            match parse_ascii_id(&msg) {
                                Some(id) => {
                                    debug!(id, "file invalidation");
                                    provider.drop_cached_file(FileIdentifier::new(id));
                                }
                                None => warn!("malformed file invalidation payload"),
                            }
                        }
                        msg = containers.recv() => {
                            let Some(msg) = msg else { return };
                            let Some(provider) = provider.upgrade() else { return };
                            match parse_ascii_id(&msg) {
                                Some(id) => {
                                    debug!(id, "container invalidation");
                                    provider.drop_cached_container(ContainerIdentifier::new(id));
                                }
                                None => warn!("malformed container invalidation payload"),
                            }
                        }
                    }
                }
            })
        };
        *self.refresh.lock() = Some(RefreshListener {
            cancel,
            task,
            _store: store,
        });
        Ok(())
    }

    pub async fn stop_refresh_listener(&self) {
        let listener = self.refresh.lock().take();
        if let Some(listener) = listener {
            listener.cancel.cancel();
            let _ = listener.task.await;
        }
    }
}

/// Decimal ASCII identifier payload of an invalidation message.
fn parse_ascii_id(raw: &[u8]) -> Option<u64> {
    std::str::from_utf8(raw).ok()?.trim().parse().ok()
}

fn fold_stats(mut acc: CacheStatistics, s: CacheStatistics) -> CacheStatistics {
    acc.occupancy += s.occupancy;
    acc.capacity += s.capacity;
    acc.in_flight += s.in_flight;
    acc
}

struct RefreshListener {
    cancel: CancellationToken,
    task: tokio::task::JoinHandle<()>,
    /// Keeps the subscribed client alive for the listener's lifetime.
    _store: Arc<dyn MetadataStore>,
}

impl std::fmt::Debug for MetadataProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("MetadataProvider")
            .field("shards", &self.shards.len())
            .field("files", &self.file_cache_stats())
            .field("containers", &self.container_cache_stats())
            .finish()
    }
}
