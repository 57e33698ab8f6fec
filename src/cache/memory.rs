//! In-memory per-file data cache.
use std::collections::BTreeMap;

use parking_lot::RwLock;

use crate::error::Error;

use super::AttachStatus;

/// Random-access byte buffer with sparse-file semantics plus an xattr map.
/// Concurrent readers are allowed; writers exclude everything else.
#[derive(Debug, Default)]
pub struct MemoryCache {
    state: RwLock<MemoryState>,
}

#[derive(Debug, Default)]
struct MemoryState {
    data: Vec<u8>,
    xattrs: BTreeMap<String, String>,
    attached: usize,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach is a no-op for the memory tier; it still counts holders.
    pub fn attach(&self, _cookie: &str) -> Result<AttachStatus, Error> {
        self.state.write().attached += 1;
        Ok(AttachStatus::Clean)
    }

    pub fn detach(&self) -> Result<(), Error> {
        let mut state = self.state.write();
        assert!(state.attached > 0, "detach without attach");
        state.attached -= 1;
        Ok(())
    }

    pub fn pread(&self, buf: &mut [u8], offset: u64) -> Result<usize, Error> {
        let state = self.state.read();
        let offset = offset as usize;
        if offset >= state.data.len() {
            return Ok(0);
        }
        let n = buf.len().min(state.data.len() - offset);
        buf[..n].copy_from_slice(&state.data[offset..offset + n]);
        Ok(n)
    }

    /// Writing past the end extends the buffer like a sparse file.
    pub fn pwrite(&self, buf: &[u8], offset: u64) -> Result<usize, Error> {
        let mut state = self.state.write();
        let offset = offset as usize;
        let end = offset + buf.len();
        if end > state.data.len() {
            state.data.resize(end, 0);
        }
        state.data[offset..end].copy_from_slice(buf);
        Ok(buf.len())
    }

    /// Shrink or zero-fill extend.
    pub fn truncate(&self, size: u64) -> Result<(), Error> {
        self.state.write().data.resize(size as usize, 0);
        Ok(())
    }

    pub fn sync(&self) -> Result<(), Error> {
        Ok(())
    }

    pub fn size(&self) -> u64 {
        self.state.read().data.len() as u64
    }

    pub fn set_attr(&self, key: &str, value: &str) -> Result<(), Error> {
        self.state
            .write()
            .xattrs
            .insert(key.to_owned(), value.to_owned());
        Ok(())
    }

    pub fn attr(&self, key: &str) -> Option<String> {
        self.state.read().xattrs.get(key).cloned()
    }

    pub fn reset(&self) {
        let mut state = self.state.write();
        state.data.clear();
        state.xattrs.clear();
    }
}
