#![doc = include_str!("../README.md")]

pub mod cache;
pub mod cleaner;
pub mod config;
pub mod error;
pub mod ids;
pub mod interval;
pub mod io;
pub mod logging;
pub mod metadata;
pub mod pools;
pub mod proxy;
pub mod remote;
pub mod stats;

use std::sync::Arc;

pub use cache::{AttachStatus, CacheHandler, DataCache, JournalCache, ProxyContext};
pub use config::{CacheConfig, CacheKind, MetadataConfig, ReadAheadStrategy};
pub use error::{Error, ErrorKind};
pub use ids::{ContainerIdentifier, FileIdentifier, LocalityHint};
pub use io::IoHandle;
pub use metadata::{MetadataProvider, MetadataProviderShard};
pub use proxy::{FileProxy, ProxyState};
pub use remote::{MetadataStore, OpenFlags, RemoteFile, RemoteStatus, StatusCode};

trait_set::trait_set! {
    /// Convenience trait alias
    pub trait StoreFactory = Fn(usize) -> Arc<dyn MetadataStore> + Send + Sync + 'static;
}
