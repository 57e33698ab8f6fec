//! One shard of the metadata provider.
//!
//! A shard coalesces concurrent retrievals of the same identifier into a
//! single backend request: the first caller stages a shared future in the
//! in-flight map, later callers attach to it, and every one of them
//! observes the same (pointer-equal) metadata object. Resolved entries
//! move into a per-shard LRU; failures clear the staging entry so the next
//! caller retries the backend instead of latching onto a dead future.
use std::num::NonZeroUsize;
use std::sync::Arc;

use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use lru::LruCache;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tracing::*;

use crate::error::Error;
use crate::ids::{ContainerIdentifier, FileIdentifier};
use crate::remote::MetadataStore;

use super::fetcher::MetadataFetcher;
use super::types::{ContainerMetadata, FileMetadata};

type SharedRetrieval<T> = Shared<BoxFuture<'static, Result<Arc<T>, Error>>>;

/// LRU slot: either live metadata or a deletion tombstone that keeps
/// concurrent lookups from resurrecting a just-removed entry.
#[derive(Debug, Clone)]
enum Slot<T> {
    Present(Arc<T>),
    Tombstone,
}

/// Cache occupancy snapshot of one shard.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStatistics {
    pub occupancy: usize,
    pub capacity: usize,
    pub in_flight: usize,
}

struct ShardInner {
    inflight_files: FxHashMap<FileIdentifier, SharedRetrieval<FileMetadata>>,
    inflight_containers: FxHashMap<ContainerIdentifier, SharedRetrieval<ContainerMetadata>>,
    files: LruCache<FileIdentifier, Slot<FileMetadata>>,
    containers: LruCache<ContainerIdentifier, Slot<ContainerMetadata>>,
}

pub struct MetadataProviderShard {
    store: Arc<dyn MetadataStore>,
    inner: Mutex<ShardInner>,
    weak: std::sync::Weak<MetadataProviderShard>,
}

impl MetadataProviderShard {
    pub fn new(
        store: Arc<dyn MetadataStore>,
        file_cache_entries: usize,
        container_cache_entries: usize,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            store,
            inner: Mutex::new(ShardInner {
                inflight_files: FxHashMap::default(),
                inflight_containers: FxHashMap::default(),
                files: LruCache::new(nonzero(file_cache_entries)),
                containers: LruCache::new(nonzero(container_cache_entries)),
            }),
            weak: weak.clone(),
        })
    }

    fn arc(&self) -> Arc<Self> {
        self.weak.upgrade().expect("shard alive while borrowed")
    }

    pub fn store(&self) -> &Arc<dyn MetadataStore> {
        &self.store
    }

    /// Retrieve file metadata, served from (in order): the in-flight map,
    /// the LRU, or a freshly staged backend fetch.
    pub async fn retrieve_file(&self, id: FileIdentifier) -> Result<Arc<FileMetadata>, Error> {
        if id.is_absent() {
            warn!("attempted to retrieve fid=0");
            return Err(Error::not_found(format!("{} (fid=0 is illegal)", id)));
        }
        let staged = {
            let mut inner = self.inner.lock();
            if let Some(fut) = inner.inflight_files.get(&id) {
                fut.clone()
            } else if let Some(slot) = inner.files.get(&id) {
                return match slot {
                    Slot::Present(md) => Ok(md.clone()),
                    Slot::Tombstone => Err(Error::not_found(format!(
                        "{} (found deletion tombstone)",
                        id
                    ))),
                };
            } else {
                let fut = self.stage_file(id);
                inner.inflight_files.insert(id, fut.clone());
                fut
            }
        };
        // the shard mutex is released before awaiting
        staged.await
    }

    fn stage_file(&self, id: FileIdentifier) -> SharedRetrieval<FileMetadata> {
        let store = self.store.clone();
        // run on the provider executor so continuations do not execute on
        // the backend client's thread
        let task = tokio::spawn(async move { MetadataFetcher::get_file(store.as_ref(), id).await });
        let shard = self.arc();
        async move {
            let outcome = match task.await {
                Ok(Ok(md)) => Ok(Arc::new(md)),
                Ok(Err(e)) => Err(e),
                Err(join) => Err(Error::Executor(join.to_string())),
            };
            let mut inner = shard.inner.lock();
            inner.inflight_files.remove(&id);
            match outcome {
                Ok(md) => {
                    inner.files.put(id, Slot::Present(md.clone()));
                    Ok(md)
                }
                Err(e) => Err(e),
            }
        }
        .boxed()
        .shared()
    }

    /// Retrieve container metadata: blob, file map and container map are
    /// fetched in parallel and combined into one object.
    pub async fn retrieve_container(
        &self,
        id: ContainerIdentifier,
    ) -> Result<Arc<ContainerMetadata>, Error> {
        if id.is_absent() {
            warn!("attempted to retrieve cid=0");
            return Err(Error::not_found(format!("{} (cid=0 is illegal)", id)));
        }
        let staged = {
            let mut inner = self.inner.lock();
            if let Some(fut) = inner.inflight_containers.get(&id) {
                fut.clone()
            } else if let Some(slot) = inner.containers.get(&id) {
                return match slot {
                    Slot::Present(md) => Ok(md.clone()),
                    Slot::Tombstone => Err(Error::not_found(format!(
                        "{} (found deletion tombstone)",
                        id
                    ))),
                };
            } else {
                let fut = self.stage_container(id);
                inner.inflight_containers.insert(id, fut.clone());
                fut
            }
        };
        staged.await
    }

    fn stage_container(&self, id: ContainerIdentifier) -> SharedRetrieval<ContainerMetadata> {
        let store = self.store.clone();
        let task = tokio::spawn(async move {
            let (mut md, files, containers) = futures::future::try_join3(
                MetadataFetcher::get_container(store.as_ref(), id),
                MetadataFetcher::get_file_map(store.as_ref(), id),
                MetadataFetcher::get_container_map(store.as_ref(), id),
            )
            .await?;
            md.files = files;
            md.containers = containers;
            Ok::<_, Error>(md)
        });
        let shard = self.arc();
        async move {
            let outcome = match task.await {
                Ok(Ok(md)) => Ok(Arc::new(md)),
                Ok(Err(e)) => Err(e),
                Err(join) => Err(Error::Executor(join.to_string())),
            };
            let mut inner = shard.inner.lock();
            inner.inflight_containers.remove(&id);
            match outcome {
                Ok(md) => {
                    inner.containers.put(id, Slot::Present(md.clone()));
                    Ok(md)
                }
                Err(e) => Err(e),
            }
        }
        .boxed()
        .shared()
    }

    pub async fn has_file(&self, id: FileIdentifier) -> Result<bool, Error> {
        MetadataFetcher::file_exists(self.store.as_ref(), id).await
    }

    /// Place a locally created entry directly into the LRU, skipping the
    /// backend.
    pub fn insert_file(&self, id: FileIdentifier, md: Arc<FileMetadata>) {
        self.inner.lock().files.put(id, Slot::Present(md));
    }

    pub fn insert_container(&self, id: ContainerIdentifier, md: Arc<ContainerMetadata>) {
        self.inner.lock().containers.put(id, Slot::Present(md));
    }

    /// Mark an entry deleted: concurrent lookups observe *not-found*
    /// instead of stale metadata.
    pub fn tombstone_file(&self, id: FileIdentifier) {
        self.inner.lock().files.put(id, Slot::Tombstone);
    }

    pub fn tombstone_container(&self, id: ContainerIdentifier) {
        self.inner.lock().containers.put(id, Slot::Tombstone);
    }

    /// Remove an entry outright; returns whether it was cached.
    pub fn drop_cached_file(&self, id: FileIdentifier) -> bool {
        self.inner.lock().files.pop(&id).is_some()
    }

    pub fn drop_cached_container(&self, id: ContainerIdentifier) -> bool {
        self.inner.lock().containers.pop(&id).is_some()
    }

    pub fn set_file_cache_entries(&self, entries: usize) {
        self.inner.lock().files.resize(nonzero(entries));
    }

    pub fn set_container_cache_entries(&self, entries: usize) {
        self.inner.lock().containers.resize(nonzero(entries));
    }

    pub fn file_cache_stats(&self) -> CacheStatistics {
        let inner = self.inner.lock();
        CacheStatistics {
            occupancy: inner.files.len(),
            capacity: inner.files.cap().get(),
            in_flight: inner.inflight_files.len(),
        }
    }

    pub fn container_cache_stats(&self) -> CacheStatistics {
        let inner = self.inner.lock();
        CacheStatistics {
            occupancy: inner.containers.len(),
            capacity: inner.containers.cap().get(),
            in_flight: inner.inflight_containers.len(),
        }
    }
}

fn nonzero(n: usize) -> NonZeroUsize {
    NonZeroUsize::new(n.max(1)).unwrap()
}

impl std::fmt::Debug for MetadataProviderShard {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("MetadataProviderShard")
            .field("files", &self.file_cache_stats())
            .field("containers", &self.container_cache_stats())
            .finish()
    }
}
