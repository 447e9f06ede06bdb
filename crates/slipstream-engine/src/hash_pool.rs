//! Hasher pool with device-aware dispatch
//!
//! A bounded set of worker threads, each owning a sorted queue of files on
//! the storage devices it already touches. One mutex guards all queues;
//! workers hash off-lock and only reacquire it to dequeue and to settle
//! accounting.
//!
//! # Dispatch
//! 1. A sole idle hasher is always reused.
//! 2. Otherwise prefer the least-loaded hasher already on the file's device;
//!    small files (≤ 10 MiB) pile onto it while it has under 200 MiB queued.
//! 3. Below the thread cap, a new hasher is created with the lowest unused id.
//! 4. At the cap, the globally least-loaded hasher takes the file.
//!
//! Duplicates are collapsed by lowercase path across all queues. Hasher 0 is
//! permanent; higher ids retire when their queue drains.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, warn};

use slipstream_core::{text, HashErrorKind, HashedFile, HashingConfig, TigerTree};

use crate::hasher::{device_id, hash_one, HasherQueue, HasherStats, WorkItem};
use crate::sfv::SfvReader;

/// Files at or below this size reuse a busy same-device hasher
const REUSE_FILE_SIZE: i64 = 10 * 1024 * 1024;

/// ...as long as that hasher has no more than this queued
const REUSE_QUEUE_BYTES: i64 = 200 * 1024 * 1024;

/// Notifications emitted by the pool
#[derive(Clone, Debug)]
pub enum HashEvent {
    FileHashed {
        path: PathBuf,
        file: HashedFile,
        tree: TigerTree,
        hasher_id: usize,
    },
    FileFailed {
        path: PathBuf,
        kind: HashErrorKind,
        message: String,
        hasher_id: usize,
    },
    DirectoryHashed {
        path: PathBuf,
        stats: HasherStats,
        hasher_id: usize,
    },
    HasherFinished {
        directories: usize,
        stats: HasherStats,
        hasher_id: usize,
    },
}

/// Aggregate queue snapshot
#[derive(Clone, Debug, Default)]
pub struct HasherPoolStats {
    pub hasher_count: usize,
    pub files_left: usize,
    pub bytes_left: i64,
    pub files_added: u64,
    pub bytes_added: i64,
    pub speed: u64,
    pub current_files: Vec<PathBuf>,
}

struct PoolState {
    queues: BTreeMap<usize, HasherQueue>,
    handles: Vec<JoinHandle<()>>,
}

struct PoolInner {
    max_threads: usize,
    per_volume: usize,
    max_speed_bytes: u64,
    verify_sfv: bool,
    state: Mutex<PoolState>,
    work_cv: Condvar,
    paused: AtomicBool,
    pause_lock: Mutex<()>,
    pause_cv: Condvar,
    shutdown: AtomicBool,
    subscribers: Mutex<Vec<Sender<HashEvent>>>,
}

impl PoolInner {
    fn emit(&self, event: HashEvent) {
        let mut subs = self.subscribers.lock();
        subs.retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Block while the pool is paused; wakes on resume or shutdown
    fn wait_if_paused(&self) {
        if !self.paused.load(Ordering::Relaxed) {
            return;
        }
        let mut guard = self.pause_lock.lock();
        while self.paused.load(Ordering::Relaxed) && !self.shutdown.load(Ordering::Relaxed) {
            self.pause_cv.wait(&mut guard);
        }
    }

    fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }
}

/// The hasher pool; cheap to clone into subsystems that enqueue work
#[derive(Clone)]
pub struct HasherPool {
    inner: Arc<PoolInner>,
}

impl HasherPool {
    pub fn new(config: &HashingConfig) -> Self {
        let max_threads = if config.max_hashing_threads == 0 {
            std::thread::available_parallelism().map_or(1, |n| n.get())
        } else {
            config.max_hashing_threads
        };

        let inner = Arc::new(PoolInner {
            max_threads,
            per_volume: config.hashers_per_volume,
            max_speed_bytes: config.max_hash_speed * 1024 * 1024,
            verify_sfv: config.verify_sfv,
            state: Mutex::new(PoolState {
                queues: BTreeMap::new(),
                handles: Vec::new(),
            }),
            work_cv: Condvar::new(),
            paused: AtomicBool::new(false),
            pause_lock: Mutex::new(()),
            pause_cv: Condvar::new(),
            shutdown: AtomicBool::new(false),
            subscribers: Mutex::new(Vec::new()),
        });

        let pool = Self { inner };
        // hasher 0 exists for the lifetime of the pool
        {
            let mut st = pool.inner.state.lock();
            pool.spawn_hasher(&mut st, 0);
        }
        pool
    }

    /// Receive pool events; every subscriber sees every event
    pub fn subscribe(&self) -> Receiver<HashEvent> {
        let (tx, rx) = unbounded();
        self.inner.subscribers.lock().push(tx);
        rx
    }

    /// Queue a file for hashing. Returns false if it is already queued on
    /// any hasher or the pool is shutting down.
    pub fn hash_file(&self, path: &Path, size: i64) -> bool {
        if self.inner.is_shutdown() {
            return false;
        }

        let path_lower = text::to_lower(&path.to_string_lossy());
        let device = device_id(path);

        let mut st = self.inner.state.lock();
        if st.queues.values().any(|q| q.has_file(&path_lower)) {
            return false;
        }

        let id = self.pick_hasher(&mut st, size, device);
        let queue = st.queues.get_mut(&id).expect("picked hasher exists");
        let added = queue.push(WorkItem {
            path: path.to_path_buf(),
            path_lower,
            size,
            device,
        });

        if added {
            debug!("Hasher #{id} takes {:?} ({} bytes)", path, size);
            self.inner.work_cv.notify_all();
        }
        added
    }

    fn pick_hasher(&self, st: &mut PoolState, size: i64, device: u64) -> usize {
        // the sole hasher, when idle, always takes the work
        if st.queues.len() == 1 {
            let (&id, queue) = st.queues.iter().next().expect("one queue");
            if !queue.has_devices() {
                return id;
            }
        }

        let total_exceeded = st.queues.len() >= self.inner.max_threads;

        let volume_ids: Vec<usize> = st
            .queues
            .iter()
            .filter(|(_, q)| q.has_device(device))
            .map(|(&id, _)| id)
            .collect();

        if !volume_ids.is_empty() {
            let least_loaded = volume_ids
                .iter()
                .copied()
                .min_by_key(|id| st.queues[id].bytes_left)
                .expect("nonempty");
            let volume_exceeded =
                self.inner.per_volume > 0 && volume_ids.len() >= self.inner.per_volume;
            let reuse_existing = size <= REUSE_FILE_SIZE
                && st.queues[&least_loaded].bytes_left <= REUSE_QUEUE_BYTES;

            if total_exceeded || volume_exceeded || reuse_existing {
                return least_loaded;
            }
        } else if total_exceeded {
            return Self::least_loaded(st);
        }

        if !total_exceeded {
            let id = (0usize..).find(|i| !st.queues.contains_key(i)).expect("free id");
            info!("Creating hasher #{id}");
            self.spawn_hasher(st, id);
            return id;
        }

        Self::least_loaded(st)
    }

    fn least_loaded(st: &PoolState) -> usize {
        *st.queues
            .iter()
            .min_by_key(|(_, q)| q.bytes_left)
            .map(|(id, _)| id)
            .expect("pool has hashers")
    }

    fn spawn_hasher(&self, st: &mut PoolState, id: usize) {
        st.queues.insert(id, HasherQueue::default());
        let inner = Arc::clone(&self.inner);
        let handle = std::thread::Builder::new()
            .name(format!("hasher-{id}"))
            .spawn(move || worker_loop(&inner, id))
            .expect("spawn hasher thread");
        st.handles.push(handle);
    }

    /// Suspend all hashers between chunks; they hold no locks while paused
    pub fn pause(&self) {
        self.inner.paused.store(true, Ordering::Relaxed);
    }

    pub fn resume(&self) {
        self.inner.paused.store(false, Ordering::Relaxed);
        let _guard = self.inner.pause_lock.lock();
        self.inner.pause_cv.notify_all();
    }

    pub fn is_paused(&self) -> bool {
        self.inner.paused.load(Ordering::Relaxed)
    }

    /// Drop queued files under a directory; files mid-hash finish normally
    pub fn stop_hashing(&self, base: &Path) -> usize {
        let mut st = self.inner.state.lock();
        let removed: usize = st.queues.values_mut().map(|q| q.remove_under(base)).sum();
        if removed > 0 {
            info!("Dropped {removed} queued files under {:?}", base);
        }
        removed
    }

    pub fn stats(&self) -> HasherPoolStats {
        let st = self.inner.state.lock();
        let mut out = HasherPoolStats {
            hasher_count: st.queues.len(),
            ..Default::default()
        };
        for queue in st.queues.values() {
            out.files_left += queue.len() + usize::from(queue.running);
            out.bytes_left += queue.bytes_left;
            out.files_added += queue.files_added;
            out.bytes_added += queue.bytes_added;
            if queue.running {
                out.speed += queue.last_speed;
                if let Some(path) = &queue.current_file {
                    out.current_files.push(path.clone());
                }
            }
        }
        out
    }

    /// Graceful, idempotent shutdown: abort in-flight hashing, wake and join
    /// every worker
    pub fn shutdown(&self) {
        if self.inner.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }

        self.resume();
        let handles = {
            let mut st = self.inner.state.lock();
            self.inner.work_cv.notify_all();
            std::mem::take(&mut st.handles)
        };
        for handle in handles {
            if handle.join().is_err() {
                warn!("A hasher thread panicked during shutdown");
            }
        }
        // closing the event channels lets subscriber threads drain and exit
        self.inner.subscribers.lock().clear();
        debug!("Hasher pool shut down");
    }
}

fn worker_loop(inner: &Arc<PoolInner>, id: usize) {
    let mut dir_stats = HasherStats::default();
    let mut total_stats = HasherStats::default();
    let mut dirs_hashed = 0usize;
    let mut processed_since_finish = 0u64;
    let mut current_dir: Option<PathBuf> = None;
    let mut sfv = SfvReader::default();

    loop {
        if inner.is_shutdown() {
            return;
        }
        inner.wait_if_paused();

        let item = {
            let mut st = inner.state.lock();
            match st.queues.get_mut(&id) {
                Some(queue) => {
                    let item = queue.pop();
                    if let Some(wi) = &item {
                        queue.running = true;
                        queue.current_file = Some(wi.path.clone());
                    } else {
                        queue.running = false;
                        queue.current_file = None;
                    }
                    item
                }
                None => return,
            }
        };

        let Some(item) = item else {
            // queue drained: flush stats, then retire or sleep
            if let Some(dir) = current_dir.take() {
                flush_directory(inner, id, &dir, &mut dir_stats, &mut total_stats, &mut dirs_hashed);
            }
            if processed_since_finish > 0 {
                info!(
                    "Hasher #{id} finished: {} files, {} bytes",
                    total_stats.files_hashed, total_stats.size_hashed
                );
                inner.emit(HashEvent::HasherFinished {
                    directories: dirs_hashed,
                    stats: total_stats,
                    hasher_id: id,
                });
                total_stats = HasherStats::default();
                dirs_hashed = 0;
                processed_since_finish = 0;
            }

            let mut st = inner.state.lock();
            let Some(queue) = st.queues.get(&id) else { return };
            if queue.is_empty() {
                if inner.is_shutdown() {
                    return;
                }
                if id != 0 {
                    debug!("Hasher #{id} retiring");
                    st.queues.remove(&id);
                    return;
                }
                inner.work_cv.wait(&mut st);
            }
            continue;
        };

        let parent = item.path.parent().map(Path::to_path_buf).unwrap_or_default();
        if current_dir.as_deref() != Some(parent.as_path()) {
            if let Some(prev) = current_dir.take() {
                flush_directory(inner, id, &prev, &mut dir_stats, &mut total_stats, &mut dirs_hashed);
            }
            current_dir = Some(parent.clone());
            sfv = if inner.verify_sfv {
                SfvReader::load(&parent)
            } else {
                SfvReader::default()
            };
        }

        let started = Instant::now();
        let outcome = hash_one(&item, &sfv, inner.max_speed_bytes, || {
            inner.wait_if_paused();
            !inner.is_shutdown()
        });
        let duration = started.elapsed();
        processed_since_finish += 1;

        // settle accounting before reporting
        {
            let mut st = inner.state.lock();
            if let Some(queue) = st.queues.get_mut(&id) {
                queue.remove_device(item.device);
                queue.bytes_left = (queue.bytes_left - item.size).max(0);
                if duration.as_millis() > 0 {
                    queue.last_speed =
                        (item.size.max(0) as u64 * 1000) / duration.as_millis() as u64;
                }
            }
        }

        match outcome {
            Some(Ok((file, tree))) => {
                dir_stats.add_file(file.size, duration);
                debug!("Hashed {:?} ({} bytes)", item.path, file.size);
                inner.emit(HashEvent::FileHashed {
                    path: item.path,
                    file,
                    tree,
                    hasher_id: id,
                });
            }
            Some(Err((kind, message))) => {
                warn!("Hashing {:?} failed ({}): {}", item.path, kind.as_str(), message);
                inner.emit(HashEvent::FileFailed {
                    path: item.path,
                    kind,
                    message,
                    hasher_id: id,
                });
            }
            None => {
                // abandoned mid-file; shutdown check at loop top
            }
        }
    }
}

/// Report a finished directory and roll its stats into the session totals
fn flush_directory(
    inner: &PoolInner,
    id: usize,
    dir: &Path,
    dir_stats: &mut HasherStats,
    total_stats: &mut HasherStats,
    dirs_hashed: &mut usize,
) {
    if dir_stats.files_hashed == 0 {
        return;
    }
    total_stats.merge(dir_stats);
    inner.emit(HashEvent::DirectoryHashed {
        path: dir.to_path_buf(),
        stats: *dir_stats,
        hasher_id: id,
    });
    *dirs_hashed += 1;
    *dir_stats = HasherStats::default();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::tempdir;

    fn default_pool() -> HasherPool {
        HasherPool::new(&HashingConfig {
            max_hashing_threads: 2,
            hashers_per_volume: 1,
            max_hash_speed: 0,
            verify_sfv: true,
        })
    }

    fn wait_for_hash(rx: &Receiver<HashEvent>) -> (PathBuf, HashedFile) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while Instant::now() < deadline {
            match rx.recv_timeout(Duration::from_millis(200)) {
                Ok(HashEvent::FileHashed { path, file, .. }) => return (path, file),
                Ok(_) => continue,
                Err(_) => continue,
            }
        }
        panic!("no FileHashed event");
    }

    #[test]
    fn test_hash_file_end_to_end() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("track.mp3");
        std::fs::write(&path, vec![0x61u8; 3000]).unwrap();

        let pool = default_pool();
        let rx = pool.subscribe();
        assert!(pool.hash_file(&path, 3000));

        let (hashed_path, file) = wait_for_hash(&rx);
        assert_eq!(hashed_path, path);
        assert_eq!(file.size, 3000);
        assert_eq!(file.root, TigerTree::hash_buffer(&vec![0x61u8; 3000]).root());

        pool.shutdown();
    }

    #[test]
    fn test_duplicate_paths_collapse() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("file.bin");
        std::fs::write(&path, b"data").unwrap();

        let pool = default_pool();
        pool.pause();
        assert!(pool.hash_file(&path, 4));
        assert!(!pool.hash_file(&path, 4));
        pool.shutdown();
    }

    #[test]
    fn test_failed_file_reported_once() {
        let pool = default_pool();
        let rx = pool.subscribe();
        assert!(pool.hash_file(Path::new("/no/such/file.bin"), 100));

        let deadline = Instant::now() + Duration::from_secs(10);
        let mut failures = 0;
        while Instant::now() < deadline {
            match rx.recv_timeout(Duration::from_millis(100)) {
                Ok(HashEvent::FileFailed { kind, .. }) => {
                    assert_eq!(kind, HashErrorKind::Io);
                    failures += 1;
                }
                Ok(HashEvent::HasherFinished { .. }) => break,
                _ => {}
            }
        }
        assert_eq!(failures, 1);
        pool.shutdown();
    }

    #[test]
    fn test_pause_blocks_progress() {
        let dir = tempdir().unwrap();
        let pool = default_pool();
        pool.pause();

        let path = dir.path().join("file.bin");
        std::fs::write(&path, vec![1u8; 100_000]).unwrap();

        let rx = pool.subscribe();
        assert!(pool.hash_file(&path, 100_000));

        // paused pool must not deliver results
        assert!(rx.recv_timeout(Duration::from_millis(300)).is_err());

        pool.resume();
        let (hashed, _) = wait_for_hash(&rx);
        assert_eq!(hashed, path);
        pool.shutdown();
    }

    #[test]
    fn test_stop_hashing_drops_queued() {
        let dir = tempdir().unwrap();
        let pool = default_pool();
        pool.pause();

        for i in 0..4 {
            let path = dir.path().join(format!("f{i}.bin"));
            std::fs::write(&path, b"x").unwrap();
            pool.hash_file(&path, 1);
        }

        // current file (if any) keeps going, queued ones are dropped
        let removed = pool.stop_hashing(dir.path());
        assert!(removed >= 3, "removed {removed}");
        pool.resume();
        pool.shutdown();
    }

    #[test]
    fn test_shutdown_idempotent() {
        let pool = default_pool();
        pool.shutdown();
        pool.shutdown();
    }

    #[test]
    fn test_stats_accounting() {
        let dir = tempdir().unwrap();
        let pool = default_pool();
        pool.pause();

        let path = dir.path().join("file.bin");
        std::fs::write(&path, vec![1u8; 500]).unwrap();
        pool.hash_file(&path, 500);

        let stats = pool.stats();
        assert_eq!(stats.files_left, 1);
        assert_eq!(stats.bytes_left, 500);
        assert_eq!(stats.files_added, 1);

        pool.shutdown();
    }
}
