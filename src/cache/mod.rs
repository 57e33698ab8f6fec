//! Per-file cache tiers.
//!
//! The data tier is a tagged variant over the memory and disk caches, so
//! call sites dispatch statically on the configured cache type. The write
//! journal is a separate tier with its own module.
pub mod disk;
pub mod handler;
pub mod journal;
pub mod memory;

use std::path::Path;

pub use disk::DiskCache;
pub use handler::{CacheHandler, CacheHandlerStats, ProxyContext};
pub use journal::{JournalCache, JournalSyncer};
pub use memory::MemoryCache;

use crate::error::Error;

/// Xattr key under which the session cookie is persisted with a cached
/// file.
pub const CACHE_COOKIE_XATTR: &str = "user.eos.cache.cookie";

/// Outcome of attaching to a cache tier.
///
/// `Stale` is informational: the attach succeeded, but the previously
/// cached content did not belong to this session and has been dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachStatus {
    Clean,
    Stale,
}

impl AttachStatus {
    pub fn is_stale(&self) -> bool {
        matches!(self, AttachStatus::Stale)
    }
}

/// Data cache facade over the configured tier.
#[derive(Debug)]
pub enum DataCache {
    Memory(MemoryCache),
    Disk(DiskCache),
}

impl DataCache {
    pub fn attach(&self, cookie: &str) -> Result<AttachStatus, Error> {
        match self {
            DataCache::Memory(c) => c.attach(cookie),
            DataCache::Disk(c) => c.attach(cookie),
        }
    }

    pub fn detach(&self) -> Result<(), Error> {
        match self {
            DataCache::Memory(c) => c.detach(),
            DataCache::Disk(c) => c.detach(),
        }
    }

    pub fn pread(&self, buf: &mut [u8], offset: u64) -> Result<usize, Error> {
        match self {
            DataCache::Memory(c) => c.pread(buf, offset),
            DataCache::Disk(c) => c.pread(buf, offset),
        }
    }

    pub fn pwrite(&self, buf: &[u8], offset: u64) -> Result<usize, Error> {
        match self {
            DataCache::Memory(c) => c.pwrite(buf, offset),
            DataCache::Disk(c) => c.pwrite(buf, offset),
        }
    }

    pub fn truncate(&self, size: u64) -> Result<(), Error> {
        match self {
            DataCache::Memory(c) => c.truncate(size),
            DataCache::Disk(c) => c.truncate(size),
        }
    }

    pub fn sync(&self) -> Result<(), Error> {
        match self {
            DataCache::Memory(c) => c.sync(),
            DataCache::Disk(c) => c.sync(),
        }
    }

    pub fn size(&self) -> Result<u64, Error> {
        match self {
            DataCache::Memory(c) => Ok(c.size()),
            DataCache::Disk(c) => c.size(),
        }
    }

    pub fn set_attr(&self, key: &str, value: &str) -> Result<(), Error> {
        match self {
            DataCache::Memory(c) => c.set_attr(key, value),
            DataCache::Disk(c) => c.set_attr(key, value),
        }
    }

    pub fn attr(&self, key: &str) -> Result<Option<String>, Error> {
        match self {
            DataCache::Memory(c) => Ok(c.attr(key)),
            DataCache::Disk(c) => c.attr(key),
        }
    }

    pub fn set_cookie(&self, cookie: &str) -> Result<(), Error> {
        self.set_attr(CACHE_COOKIE_XATTR, cookie)
    }

    pub fn cookie(&self) -> Result<Option<String>, Error> {
        self.attr(CACHE_COOKIE_XATTR)
    }

    pub fn unlink(&self) -> Result<(), Error> {
        match self {
            DataCache::Memory(c) => {
                c.reset();
                Ok(())
            }
            DataCache::Disk(c) => c.unlink(),
        }
    }

    pub fn rescue(&self, dst: Option<&Path>) -> Result<(), Error> {
        match self {
            DataCache::Memory(_) => Ok(()),
            DataCache::Disk(c) => c.rescue(dst).map(|_| ()),
        }
    }

    pub fn reset(&self) -> Result<(), Error> {
        match self {
            DataCache::Memory(c) => {
                c.reset();
                Ok(())
            }
            DataCache::Disk(c) => c.reset(),
        }
    }
}
