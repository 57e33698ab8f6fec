//! Typed configuration surface of the caching core.
//!
//! Keys follow the dotted names of the service configuration
//! (`cache.location`, `journal.per_file_bytes`, ...). Parsing configuration
//! files or command lines is the embedder's business; these structs only
//! define the recognized options and their defaults.
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheKind {
    Memory,
    Disk,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ReadAheadStrategy {
    #[default]
    None,
    Static,
    Dynamic,
}

impl ReadAheadStrategy {
    pub fn from_name(name: &str) -> Self {
        match name {
            "static" => Self::Static,
            "dynamic" => Self::Dynamic,
            _ => Self::None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    #[serde(rename = "cache.type")]
    pub cache_type: CacheKind,
    #[serde(rename = "cache.location")]
    pub location: PathBuf,
    /// Total size of the on-disk block cache; trimmed by the leveler.
    #[serde(rename = "cache.total_bytes")]
    pub total_bytes: u64,
    #[serde(rename = "cache.total_inodes")]
    pub total_inodes: u64,
    /// Per-file prefix cap of the block cache.
    #[serde(rename = "cache.per_file_bytes")]
    pub per_file_bytes: u64,

    #[serde(rename = "journal.location")]
    pub journal_location: PathBuf,
    #[serde(rename = "journal.total_bytes")]
    pub journal_total_bytes: u64,
    #[serde(rename = "journal.total_inodes")]
    pub journal_total_inodes: u64,
    #[serde(rename = "journal.per_file_bytes")]
    pub journal_per_file_bytes: u64,
    #[serde(rename = "journal.clean_on_startup")]
    pub journal_clean_on_startup: bool,

    #[serde(rename = "readahead.strategy")]
    pub readahead_strategy: ReadAheadStrategy,
    /// Minimum read-ahead block size when re-enabling.
    #[serde(rename = "readahead.min")]
    pub readahead_min: u64,
    /// Nominal (initial) read-ahead block size.
    #[serde(rename = "readahead.nominal")]
    pub readahead_nominal: u64,
    /// Maximum read-ahead block size for the dynamic strategy.
    #[serde(rename = "readahead.max")]
    pub readahead_max: u64,
    #[serde(rename = "readahead.blocks_max")]
    pub readahead_blocks_max: usize,
    /// Hit ratio below which read-ahead is permanently disabled on a sparse
    /// access pattern (0 disables the check).
    #[serde(rename = "readahead.sparse_ratio")]
    pub readahead_sparse_ratio: f64,

    /// Cap on bytes held by in-flight write buffers.
    #[serde(skip)]
    pub max_inflight_write_bytes: usize,
    /// Cap on bytes held by in-flight read-ahead buffers.
    #[serde(skip)]
    pub max_inflight_readahead_bytes: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cache_type: CacheKind::Disk,
            location: PathBuf::new(),
            total_bytes: 1024 * 1024 * 1024,
            total_inodes: 64 * 1024,
            per_file_bytes: 2 * 1024 * 1024,
            journal_location: PathBuf::new(),
            journal_total_bytes: 2 * 1024 * 1024 * 1024,
            journal_total_inodes: 64 * 1024,
            journal_per_file_bytes: 128 * 1024 * 1024,
            journal_clean_on_startup: false,
            readahead_strategy: ReadAheadStrategy::None,
            readahead_min: 4 * 1024,
            readahead_nominal: 256 * 1024,
            readahead_max: 1024 * 1024,
            readahead_blocks_max: 16,
            readahead_sparse_ratio: 0.0,
            max_inflight_write_bytes: 1024 * 1024 * 1024,
            max_inflight_readahead_bytes: 1024 * 1024 * 1024,
        }
    }
}

impl CacheConfig {
    pub fn journaled(&self) -> bool {
        self.journal_location.as_os_str().len() > 0
    }
    pub fn in_memory(&self) -> bool {
        self.cache_type == CacheKind::Memory
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetadataConfig {
    #[serde(rename = "metadata.container_cache_entries")]
    pub container_cache_entries: usize,
    #[serde(rename = "metadata.file_cache_entries")]
    pub file_cache_entries: usize,
    /// Advisory: the embedding process sizes the tokio runtime with this.
    #[serde(rename = "metadata.executor_threads")]
    pub executor_threads: usize,
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self {
            container_cache_entries: 300_000,
            file_cache_entries: 3_000_000,
            executor_threads: 16,
        }
    }
}
