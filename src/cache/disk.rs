//! On-disk per-file data cache.
//!
//! One cache file per inode under the configured root, capped to a prefix
//! of the remote file: reads and writes beyond the cap are silently clipped
//! so a small local disk can still serve the hot head of large files. The
//! session cookie is persisted with the file; a mismatch on attach
//! invalidates the content.
use std::fs::File;
use std::os::unix::fs::FileExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::*;

use crate::error::Error;
use crate::pools::{BufferPool, PooledBuffer};

use super::{AttachStatus, CACHE_COOKIE_XATTR};

#[derive(Debug, Default)]
struct DiskState {
    file: Option<Arc<File>>,
    attached: usize,
}

#[derive(Debug)]
pub struct DiskCache {
    ino: u64,
    root: PathBuf,
    /// Prefix cap: bytes past this offset are never cached.
    max_size: u64,
    buffers: Option<Arc<BufferPool>>,
    state: Mutex<DiskState>,
}

impl DiskCache {
    pub fn new(ino: u64, root: impl Into<PathBuf>, max_size: u64) -> Self {
        Self {
            ino,
            root: root.into(),
            max_size,
            buffers: None,
            state: Mutex::new(DiskState::default()),
        }
    }

    /// Attach the shared I/O buffer pool used by [`Self::peek_read`].
    pub fn with_buffers(mut self, buffers: Arc<BufferPool>) -> Self {
        self.buffers = Some(buffers);
        self
    }

    /// Two-level bucketing keeps directory fan-out bounded.
    pub fn location(root: &Path, ino: u64) -> PathBuf {
        root.join(format!("{:08x}", ino / 10000))
            .join(format!("{:08X}", ino))
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

    fn file(&self) -> Result<Arc<File>, Error> {
        self.state
            .lock()
            .file
            .clone()
            .ok_or(Error::InvalidArgument("disk cache not attached"))
    }

    /// First attach opens (creating) the cache file and validates the
    /// cookie; further attaches only bump the ref-count. On mismatch the
    /// content is truncated away, the new cookie stored, and the caller
    /// told the cache was stale.
    pub fn attach(&self, cookie: &str) -> Result<AttachStatus, Error> {
        let mut state = self.state.lock();
        let mut status = AttachStatus::Clean;
        if state.attached == 0 && state.file.is_none() {
            let path = self.path(true)?;
            let file = Arc::new(
                File::options()
                    .read(true)
                    .write(true)
                    .create(true)
                    .open(&path)?,
            );
            let stored = read_cookie(&file, &path);
            match stored {
                Some(stored) if stored != cookie => {
                    debug!(ino = self.ino, old = %stored, new = %cookie,
                           "cookie mismatch, invalidating disk cache");
                    file.set_len(0)?;
                    write_cookie(&file, &path, cookie)?;
                    status = AttachStatus::Stale;
                }
                Some(_) => {}
                None => write_cookie(&file, &path, cookie)?,
            }
            state.file = Some(file);
        }
        state.attached += 1;
        Ok(status)
    }

    pub fn detach(&self) -> Result<(), Error> {
        let mut state = self.state.lock();
        assert!(state.attached > 0, "detach without attach");
        state.attached -= 1;
        if state.attached == 0 {
            state.file = None;
        }
        Ok(())
    }

    pub fn pread(&self, buf: &mut [u8], offset: u64) -> Result<usize, Error> {
        if offset >= self.max_size {
            return Ok(0);
        }
        let n = clip(buf.len(), offset, self.max_size);
        Ok(self.file()?.read_at(&mut buf[..n], offset)?)
    }

    /// Read the prefix-capped range into a pooled buffer instead of a
    /// caller-provided one; dropping the buffer hands it back to the pool.
    pub async fn peek_read(&self, count: usize, offset: u64) -> Result<PooledBuffer, Error> {
        let pool = self
            .buffers
            .as_ref()
            .ok_or(Error::InvalidArgument("disk cache has no buffer pool"))?;
        let file = self.file()?;
        if offset >= self.max_size {
            return Ok(pool.acquire(0).await);
        }
        let n = clip(count, offset, self.max_size);
        let mut buf = pool.acquire(n).await;
        let read = file.read_at(buf.as_mut_slice(), offset)?;
        buf.resize(read);
        Ok(buf)
    }

    pub fn pwrite(&self, buf: &[u8], offset: u64) -> Result<usize, Error> {
        if offset >= self.max_size {
            return Ok(0);
        }
        let n = clip(buf.len(), offset, self.max_size);
        self.file()?.write_all_at(&buf[..n], offset)?;
        Ok(n)
    }

    pub fn truncate(&self, size: u64) -> Result<(), Error> {
        Ok(self.file()?.set_len(size.min(self.max_size))?)
    }

    pub fn sync(&self) -> Result<(), Error> {
        Ok(self.file()?.sync_data()?)
    }

    pub fn size(&self) -> Result<u64, Error> {
        Ok(self.file()?.metadata()?.len())
    }

    pub fn set_attr(&self, key: &str, value: &str) -> Result<(), Error> {
        let file = self.file()?;
        set_xattr(&file, &self.path(false)?, key, value)
    }

    pub fn attr(&self, key: &str) -> Result<Option<String>, Error> {
        let file = self.file()?;
        Ok(get_xattr(&file, &self.path(false)?, key))
    }

    pub fn set_cookie(&self, cookie: &str) -> Result<(), Error> {
        self.set_attr(CACHE_COOKIE_XATTR, cookie)
    }

    pub fn cookie(&self) -> Result<Option<String>, Error> {
        self.attr(CACHE_COOKIE_XATTR)
    }

    pub fn unlink(&self) -> Result<(), Error> {
        let path = self.path(false)?;
        std::fs::remove_file(&path)?;
        let _ = std::fs::remove_file(sidecar(&path));
        Ok(())
    }

    /// Rename a corrupted cache file aside for offline inspection.
    pub fn rescue(&self, dst: Option<&Path>) -> Result<PathBuf, Error> {
        let path = self.path(false)?;
        let dst = dst
            .map(|p| p.to_owned())
            .unwrap_or_else(|| path.with_extension("recover"));
        std::fs::rename(&path, &dst)?;
        warn!(ino = self.ino, dst = %dst.display(), "rescued cache file");
        Ok(dst)
    }

    pub fn reset(&self) -> Result<(), Error> {
        self.truncate(0)
    }
}

fn clip(len: usize, offset: u64, cap: u64) -> usize {
    if offset + len as u64 > cap {
        (cap - offset) as usize
    } else {
        len
    }
}

fn sidecar(path: &Path) -> PathBuf {
    path.with_extension("cookie")
}

// Cookie storage: xattr on the cache file, with a sidecar fallback for
// filesystems without user xattr support.

fn set_xattr(file: &File, path: &Path, key: &str, value: &str) -> Result<(), Error> {
    let ckey = std::ffi::CString::new(key).map_err(|_| Error::InvalidArgument("NUL in key"))?;
    let rc = unsafe {
        libc::fsetxattr(
            file.as_raw_fd(),
            ckey.as_ptr(),
            value.as_ptr() as *const libc::c_void,
            value.len(),
            0,
        )
    };
    if rc == 0 {
        return Ok(());
    }
    let err = std::io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ENOTSUP) {
        std::fs::write(sidecar(path), format!("{}={}", key, value))?;
        return Ok(());
    }
    Err(err.into())
}

fn get_xattr(file: &File, path: &Path, key: &str) -> Option<String> {
    let ckey = std::ffi::CString::new(key).ok()?;
    let mut buf = vec![0u8; 4096];
    let n = unsafe {
        libc::fgetxattr(
            file.as_raw_fd(),
            ckey.as_ptr(),
            buf.as_mut_ptr() as *mut libc::c_void,
            buf.len(),
        )
    };
    if n >= 0 {
        buf.truncate(n as usize);
        return String::from_utf8(buf).ok();
    }
    let err = std::io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ENOTSUP) {
        let line = std::fs::read_to_string(sidecar(path)).ok()?;
        let (k, v) = line.split_once('=')?;
        if k == key {
            return Some(v.to_owned());
        }
    }
    None
}

fn read_cookie(file: &File, path: &Path) -> Option<String> {
    get_xattr(file, path, CACHE_COOKIE_XATTR)
}

fn write_cookie(file: &File, path: &Path, cookie: &str) -> Result<(), Error> {
    set_xattr(file, path, CACHE_COOKIE_XATTR, cookie)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache(max: u64) -> (tempfile::TempDir, DiskCache) {
        let dir = tempfile::tempdir().unwrap();
        let c = DiskCache::new(0x42, dir.path(), max);
        (dir, c)
    }

    #[test]
    fn bucketed_location() {
        let p = DiskCache::location(Path::new("/r"), 123456);
        assert_eq!(p, Path::new("/r/0000000c/0001E240"));
    }

    #[test]
    fn prefix_cap_clips_both_directions() {
        let (_d, c) = cache(1024);
        c.attach("a").unwrap();
        // write inside, across, and past the cap
        assert_eq!(c.pwrite(&[1u8; 512], 0).unwrap(), 512);
        assert_eq!(c.pwrite(&[2u8; 512], 768).unwrap(), 256);
        assert_eq!(c.pwrite(&[3u8; 16], 2048).unwrap(), 0);
        assert!(c.size().unwrap() <= 1024);
        let mut buf = [0u8; 512];
        assert_eq!(c.pread(&mut buf, 768).unwrap(), 256);
        assert_eq!(buf[0], 2);
        assert_eq!(c.pread(&mut buf, 1024).unwrap(), 0);
        c.detach().unwrap();
    }

    #[test]
    fn cookie_mismatch_invalidates() {
        let (_d, c) = cache(2 * 1024 * 1024);
        assert!(matches!(c.attach("A").unwrap(), AttachStatus::Clean));
        c.pwrite(&[7u8; 1024 * 1024], 0).unwrap();
        c.detach().unwrap();

        assert!(matches!(c.attach("A").unwrap(), AttachStatus::Clean));
        assert_eq!(c.size().unwrap(), 1024 * 1024);
        c.detach().unwrap();

        // new session cookie: content dropped, new cookie stored
        assert!(matches!(c.attach("B").unwrap(), AttachStatus::Stale));
        assert_eq!(c.size().unwrap(), 0);
        assert_eq!(c.cookie().unwrap().unwrap(), "B");
        c.detach().unwrap();
    }

    #[test]
    fn refcounted_open() {
        let (_d, c) = cache(1024);
        c.attach("x").unwrap();
        c.attach("y").unwrap(); // second attach does not re-validate
        c.pwrite(b"z", 0).unwrap();
        c.detach().unwrap();
        // still open for the remaining holder
        let mut buf = [0u8; 1];
        assert_eq!(c.pread(&mut buf, 0).unwrap(), 1);
        c.detach().unwrap();
        assert!(c.pread(&mut buf, 0).is_err());
    }

    #[tokio::test]
    async fn peek_read_uses_pooled_buffers() {
        let dir = tempfile::tempdir().unwrap();
        let pool = crate::pools::BufferPool::new("io-test", 8, 1024, 1 << 20);
        let c = DiskCache::new(0x42, dir.path(), 1024).with_buffers(pool.clone());
        c.attach("x").unwrap();
        c.pwrite(&[0x11; 600], 0).unwrap();
        let buf = c.peek_read(512, 100).await.unwrap();
        assert_eq!(buf.len(), 500);
        assert!(buf.as_slice().iter().all(|b| *b == 0x11));
        assert_eq!(pool.inflight_buffers(), 1);
        drop(buf);
        assert_eq!(pool.inflight_buffers(), 0);
        // past the cap: empty buffer
        let buf = c.peek_read(16, 4096).await.unwrap();
        assert!(buf.is_empty());
    }

    #[test]
    fn rescue_moves_file_aside() {
        let (dir, c) = cache(1024);
        c.attach("x").unwrap();
        c.pwrite(b"data", 0).unwrap();
        let dst = c.rescue(None).unwrap();
        assert!(dst.exists());
        assert!(!DiskCache::location(dir.path(), 0x42).exists());
    }
}
