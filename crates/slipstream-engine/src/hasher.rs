//! Hasher work items, queues, and the per-file hashing routine
//!
//! Each hasher owns a queue of work items sorted by lowercase path and a
//! refcount of the storage devices those items live on; the pool uses the
//! device map to keep one spindle from being hammered by several threads.
//! The per-file routine streams the file through the tree hasher, honors the
//! throughput throttle, and verifies CRC32 against an SFV sidecar when one
//! lists the file.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use tracing::debug;

use slipstream_core::tth::calc_block_size;
use slipstream_core::{HashErrorKind, HashedFile, TigerTree, TigerTreeHasher};

use crate::file_reader::FileReader;
use crate::sfv::SfvReader;

/// A file queued for hashing
#[derive(Clone, Debug)]
pub struct WorkItem {
    pub path: PathBuf,
    pub path_lower: String,
    pub size: i64,
    pub device: u64,
}

/// Aggregated hashing statistics; directory stats roll up into session stats
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HasherStats {
    pub files_hashed: u64,
    pub size_hashed: u64,
    pub hash_time_ms: u64,
}

impl HasherStats {
    pub fn add_file(&mut self, size: i64, duration: Duration) {
        self.files_hashed += 1;
        self.size_hashed += size.max(0) as u64;
        self.hash_time_ms += duration.as_millis() as u64;
    }

    pub fn merge(&mut self, other: &HasherStats) {
        self.files_hashed += other.files_hashed;
        self.size_hashed += other.size_hashed;
        self.hash_time_ms += other.hash_time_ms;
    }

    /// Average throughput in bytes per second
    pub fn speed(&self) -> u64 {
        if self.hash_time_ms == 0 {
            0
        } else {
            self.size_hashed * 1000 / self.hash_time_ms
        }
    }
}

/// One hasher's queue and accounting, guarded by the pool lock
#[derive(Default)]
pub struct HasherQueue {
    items: Vec<WorkItem>,
    devices: HashMap<u64, u32>,
    pub bytes_left: i64,
    pub bytes_added: i64,
    pub files_added: u64,
    pub running: bool,
    pub current_file: Option<PathBuf>,
    pub last_speed: u64,
}

impl HasherQueue {
    /// Insert sorted by lowercase path; duplicates are rejected
    pub fn push(&mut self, item: WorkItem) -> bool {
        match self
            .items
            .binary_search_by(|probe| probe.path_lower.cmp(&item.path_lower))
        {
            Ok(_) => false,
            Err(pos) => {
                *self.devices.entry(item.device).or_insert(0) += 1;
                self.bytes_left += item.size;
                self.bytes_added += item.size;
                self.files_added += 1;
                self.items.insert(pos, item);
                true
            }
        }
    }

    pub fn pop(&mut self) -> Option<WorkItem> {
        if self.items.is_empty() {
            None
        } else {
            Some(self.items.remove(0))
        }
    }

    pub fn has_file(&self, path_lower: &str) -> bool {
        self.items
            .binary_search_by(|probe| probe.path_lower.as_str().cmp(path_lower))
            .is_ok()
    }

    pub fn has_device(&self, device: u64) -> bool {
        self.devices.contains_key(&device)
    }

    pub fn has_devices(&self) -> bool {
        !self.devices.is_empty()
    }

    pub fn remove_device(&mut self, device: u64) {
        if let Some(count) = self.devices.get_mut(&device) {
            *count -= 1;
            if *count == 0 {
                self.devices.remove(&device);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Drop queued items under a base directory; returns how many went
    pub fn remove_under(&mut self, base: &Path) -> usize {
        let mut removed = 0;
        self.items.retain(|item| {
            if item.path.starts_with(base) {
                removed += 1;
                false
            } else {
                true
            }
        });
        if removed > 0 {
            // rebuild device refcounts and byte accounting from what is left
            self.devices.clear();
            self.bytes_left = 0;
            for item in &self.items {
                *self.devices.entry(item.device).or_insert(0) += 1;
                self.bytes_left += item.size;
            }
        }
        removed
    }

    pub fn clear(&mut self) {
        self.items.clear();
        self.devices.clear();
        self.bytes_left = 0;
        self.bytes_added = 0;
        self.files_added = 0;
        self.last_speed = 0;
    }
}

/// Outcome of hashing a single file
pub type HashOutcome = Result<(HashedFile, TigerTree), (HashErrorKind, String)>;

/// Hash one file, throttled to `max_speed` bytes/s when nonzero.
///
/// `keep_going` is polled between chunks; returning false abandons the file
/// without reporting an error (shutdown and stop-hashing paths).
pub fn hash_one(
    item: &WorkItem,
    sfv: &SfvReader,
    max_speed: u64,
    mut keep_going: impl FnMut() -> bool,
) -> Option<HashOutcome> {
    let metadata = match std::fs::metadata(&item.path) {
        Ok(md) => md,
        Err(e) => return Some(Err((HashErrorKind::Io, e.to_string()))),
    };

    let size = metadata.len();
    let mtime = match metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
    {
        Some(d) => d.as_secs(),
        None => {
            return Some(Err((
                HashErrorKind::Io,
                "invalid modification date".to_string(),
            )))
        }
    };

    let file_name = item
        .path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let expected_crc = sfv.crc_for(&file_name);

    let mut tree_hasher = TigerTreeHasher::new(calc_block_size(size));
    let mut crc = expected_crc.map(|_| crc32fast::Hasher::new());

    let mut last_read = Instant::now();
    let mut aborted = false;

    let read = FileReader::new().read(&item.path, |chunk| {
        if max_speed > 0 {
            // pace reads so sustained throughput stays at the ceiling
            let min_time = Duration::from_millis(chunk.len() as u64 * 1000 / max_speed);
            let elapsed = last_read.elapsed();
            if elapsed < min_time {
                std::thread::sleep(min_time - elapsed);
            }
            last_read = Instant::now();
        }

        tree_hasher.update(chunk);
        if let Some(crc) = crc.as_mut() {
            crc.update(chunk);
        }

        if !keep_going() {
            aborted = true;
            return false;
        }
        true
    });

    if let Err(e) = read {
        return Some(Err((HashErrorKind::Io, e.to_string())));
    }
    if aborted {
        debug!("Hashing of {:?} abandoned", item.path);
        return None;
    }

    if let (Some(crc), Some(expected)) = (crc, expected_crc) {
        let actual = crc.finalize();
        if actual != expected {
            return Some(Err((
                HashErrorKind::Crc,
                format!("CRC32 mismatch (expected {expected:08X}, got {actual:08X})"),
            )));
        }
    }

    let tree = tree_hasher.finalize();
    let file = HashedFile::new(tree.root(), mtime, size as i64);
    Some(Ok((file, tree)))
}

/// Storage device identity for locality-aware dispatch
pub fn device_id(path: &Path) -> u64 {
    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;
        match std::fs::metadata(path) {
            Ok(md) => md.dev(),
            Err(_) => path
                .parent()
                .and_then(|parent| std::fs::metadata(parent).ok())
                .map(|md| md.dev())
                .unwrap_or(0),
        }
    }
    #[cfg(not(unix))]
    {
        let _ = path;
        0
    }
}

/// Seconds since the epoch for a metadata timestamp
pub fn mtime_secs(metadata: &std::fs::Metadata) -> u64 {
    metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Current time in seconds since the epoch
pub fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn item(path: &Path, size: i64) -> WorkItem {
        WorkItem {
            path: path.to_path_buf(),
            path_lower: path.to_string_lossy().to_lowercase(),
            size,
            device: 1,
        }
    }

    #[test]
    fn test_queue_sorted_dedup() {
        let mut q = HasherQueue::default();
        assert!(q.push(item(Path::new("/b/file2"), 10)));
        assert!(q.push(item(Path::new("/a/file1"), 20)));
        assert!(!q.push(item(Path::new("/A/FILE1"), 20)), "duplicate by lowercase path");

        assert_eq!(q.len(), 2);
        assert_eq!(q.bytes_left, 30);
        assert_eq!(q.pop().unwrap().path, PathBuf::from("/a/file1"));
    }

    #[test]
    fn test_queue_device_refcounts() {
        let mut q = HasherQueue::default();
        let mut a = item(Path::new("/a"), 1);
        a.device = 7;
        let mut b = item(Path::new("/b"), 1);
        b.device = 7;
        q.push(a);
        q.push(b);
        assert!(q.has_device(7));

        q.remove_device(7);
        assert!(q.has_device(7));
        q.remove_device(7);
        assert!(!q.has_device(7));
    }

    #[test]
    fn test_remove_under() {
        let mut q = HasherQueue::default();
        q.push(item(Path::new("/keep/x"), 5));
        q.push(item(Path::new("/drop/y"), 6));
        q.push(item(Path::new("/drop/z"), 7));

        assert_eq!(q.remove_under(Path::new("/drop")), 2);
        assert_eq!(q.len(), 1);
        assert_eq!(q.bytes_left, 5);
    }

    #[test]
    fn test_hash_one_small_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("file.bin");
        std::fs::write(&path, b"hello hasher").unwrap();

        let wi = item(&path, 12);
        let (fi, tree) = hash_one(&wi, &SfvReader::default(), 0, || true)
            .unwrap()
            .unwrap();
        assert_eq!(fi.size, 12);
        assert_eq!(fi.root, tree.root());
        assert_eq!(tree.root(), TigerTree::hash_buffer(b"hello hasher").root());
    }

    #[test]
    fn test_hash_one_crc_mismatch() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("file.bin");
        std::fs::write(&path, b"payload").unwrap();
        std::fs::write(dir.path().join("checks.sfv"), "file.bin 00000000\n").unwrap();

        let sfv = SfvReader::load(dir.path());
        let wi = item(&path, 7);
        let err = hash_one(&wi, &sfv, 0, || true).unwrap().unwrap_err();
        assert_eq!(err.0, HashErrorKind::Crc);
    }

    #[test]
    fn test_hash_one_crc_match() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("file.bin");
        std::fs::write(&path, b"payload").unwrap();

        let mut crc = crc32fast::Hasher::new();
        crc.update(b"payload");
        std::fs::write(
            dir.path().join("checks.sfv"),
            format!("file.bin {:08X}\n", crc.finalize()),
        )
        .unwrap();

        let sfv = SfvReader::load(dir.path());
        let wi = item(&path, 7);
        assert!(hash_one(&wi, &sfv, 0, || true).unwrap().is_ok());
    }

    #[test]
    fn test_hash_one_missing_file() {
        let wi = item(Path::new("/no/such/file"), 1);
        let err = hash_one(&wi, &SfvReader::default(), 0, || true)
            .unwrap()
            .unwrap_err();
        assert_eq!(err.0, HashErrorKind::Io);
    }

    #[test]
    fn test_hash_one_abandoned() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("file.bin");
        std::fs::write(&path, vec![1u8; 4096]).unwrap();

        let wi = item(&path, 4096);
        assert!(hash_one(&wi, &SfvReader::default(), 0, || false).is_none());
    }
}
