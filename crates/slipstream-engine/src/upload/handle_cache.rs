//! Shared upload file handles
//!
//! Concurrent uploads of the same file share one OS handle: the cache maps
//! a real path to a weak reference, so the handle closes when the last
//! upload drops it. Reads are positioned (`pread`-style) and never seek, so
//! readers at different offsets do not disturb each other.

use std::collections::HashMap;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::debug;

/// One open file shared between uploads
pub struct SharedFileHandle {
    file: File,
    path: PathBuf,
}

impl SharedFileHandle {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read at an absolute offset without moving any cursor
    pub fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        #[cfg(unix)]
        {
            use std::os::unix::fs::FileExt;
            self.file.read_at(buf, offset)
        }
        #[cfg(windows)]
        {
            use std::os::windows::fs::FileExt;
            self.file.seek_read(buf, offset)
        }
    }
}

/// Path-keyed cache of live handles
pub struct HandleCache {
    handles: Mutex<HashMap<PathBuf, Weak<SharedFileHandle>>>,
}

impl HandleCache {
    pub fn new() -> Self {
        Self {
            handles: Mutex::new(HashMap::new()),
        }
    }

    /// Open a file for shared reading, reusing a live handle when one exists
    pub fn open_shared(&self, path: &Path) -> io::Result<Arc<SharedFileHandle>> {
        let mut handles = self.handles.lock();

        if let Some(weak) = handles.get(path) {
            if let Some(live) = weak.upgrade() {
                debug!("Reusing shared handle for {:?}", path);
                return Ok(live);
            }
        }

        let file = File::open(path)?;
        let handle = Arc::new(SharedFileHandle {
            file,
            path: path.to_path_buf(),
        });
        handles.insert(path.to_path_buf(), Arc::downgrade(&handle));

        // opportunistically drop entries whose handle already closed
        handles.retain(|_, weak| weak.strong_count() > 0);
        Ok(handle)
    }

    /// Live handle count
    pub fn len(&self) -> usize {
        self.handles
            .lock()
            .values()
            .filter(|w| w.strong_count() > 0)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for HandleCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_handles_are_shared() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("file.bin");
        std::fs::write(&path, b"0123456789").unwrap();

        let cache = HandleCache::new();
        let a = cache.open_shared(&path).unwrap();
        let b = cache.open_shared(&path).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_positioned_reads_are_independent() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("file.bin");
        std::fs::write(&path, b"0123456789").unwrap();

        let cache = HandleCache::new();
        let handle = cache.open_shared(&path).unwrap();

        let mut head = [0u8; 3];
        let mut tail = [0u8; 3];
        handle.read_at(&mut tail, 7).unwrap();
        handle.read_at(&mut head, 0).unwrap();
        assert_eq!(&head, b"012");
        assert_eq!(&tail, b"789");
    }

    #[test]
    fn test_handle_closes_with_last_reference() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("file.bin");
        std::fs::write(&path, b"x").unwrap();

        let cache = HandleCache::new();
        let handle = cache.open_shared(&path).unwrap();
        assert_eq!(cache.len(), 1);

        drop(handle);
        assert_eq!(cache.len(), 0);

        // a fresh open creates a new handle
        let again = cache.open_shared(&path).unwrap();
        assert_eq!(again.path(), path);
    }

    #[test]
    fn test_missing_file() {
        let cache = HandleCache::new();
        assert!(cache.open_shared(Path::new("/no/such/file")).is_err());
    }
}
