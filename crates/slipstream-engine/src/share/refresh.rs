//! Refresh scheduling and filesystem walking
//!
//! One worker thread executes refresh tasks in FIFO order. For each task
//! path the worker scans the filesystem off-lock, probing the hashed-file
//! store for every file: records that still match size and mtime enter the
//! shadow subtree immediately, everything else goes to the hasher pool and
//! joins the index when its hash completes. The finished shadow subtree is
//! swapped in per-root under the exclusive lock.
//!
//! A companion thread drains hasher events: completed hashes are written to
//! the store and inserted into the live index.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex};
use regex::Regex;
use thiserror::Error;
use tracing::{debug, info, warn};

use slipstream_core::{text, DualName, RefreshKind, RefreshState, ShareConfig, TthValue};

use crate::hash_pool::{HashEvent, HasherPool};
use crate::hasher::mtime_secs;
use crate::store::HashStore;

use super::cache::ShareCache;
use super::{RootId, ShareIndex, Subtree};

/// A queued refresh request
#[derive(Clone, Debug)]
pub struct RefreshTask {
    pub kind: RefreshKind,
    pub paths: Vec<PathBuf>,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RefreshError {
    #[error("path is not inside any share root: {0:?}")]
    NotShared(PathBuf),

    #[error("refresh scheduler is shut down")]
    ShutDown,
}

/// Name patterns excluded from the share
pub struct SkipList {
    patterns: Vec<Regex>,
}

impl SkipList {
    pub fn from_config(config: &ShareConfig) -> Self {
        let patterns = config
            .skip_list
            .iter()
            .filter_map(|entry| {
                let pattern = if config.skip_list_regex {
                    format!("(?i)^(?:{entry})$")
                } else {
                    format!("(?i)^{}$", glob_to_regex(entry))
                };
                match Regex::new(&pattern) {
                    Ok(re) => Some(re),
                    Err(e) => {
                        warn!("Ignoring bad skip-list entry {:?}: {}", entry, e);
                        None
                    }
                }
            })
            .collect();
        Self { patterns }
    }

    pub fn matches(&self, name: &str) -> bool {
        self.patterns.iter().any(|re| re.is_match(name))
    }
}

fn glob_to_regex(glob: &str) -> String {
    let mut out = String::with_capacity(glob.len() * 2);
    for c in glob.chars() {
        match c {
            '*' => out.push_str(".*"),
            '?' => out.push('.'),
            c => out.push_str(&regex::escape(&c.to_string())),
        }
    }
    out
}

/// What one scan pass saw
#[derive(Debug, Default, Clone, Copy)]
struct WalkStats {
    files_indexed: usize,
    files_queued: usize,
    dirs: usize,
    skipped: usize,
}

/// Intermediate scan result; pruning happens here before the arena is built
struct ScanDir {
    name: String,
    mtime: u64,
    dirs: Vec<ScanDir>,
    files: Vec<ScanFile>,
}

struct ScanFile {
    name: String,
    size: i64,
    mtime: u64,
    tth: TthValue,
}

struct RefresherInner {
    index: Arc<ShareIndex>,
    store: Arc<HashStore>,
    pool: HasherPool,
    config: ShareConfig,
    skip: SkipList,
    cache: ShareCache,
    queue: Mutex<VecDeque<RefreshTask>>,
    work_cv: Condvar,
    abort: AtomicBool,
    shutdown: AtomicBool,
}

/// The refresh scheduler; owns the share worker and hash-event threads
pub struct ShareRefresher {
    inner: Arc<RefresherInner>,
    worker: Mutex<Option<JoinHandle<()>>>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl ShareRefresher {
    pub fn new(
        index: Arc<ShareIndex>,
        store: Arc<HashStore>,
        pool: HasherPool,
        config: ShareConfig,
        config_dir: &Path,
    ) -> Self {
        let skip = SkipList::from_config(&config);
        let hash_events = pool.subscribe();
        index
            .list_cache
            .set_interval(std::time::Duration::from_secs(
                config.file_list_refresh_minutes * 60,
            ));

        let inner = Arc::new(RefresherInner {
            index,
            store,
            pool,
            config,
            skip,
            cache: ShareCache::new(config_dir),
            queue: Mutex::new(VecDeque::new()),
            work_cv: Condvar::new(),
            abort: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
        });

        let worker = {
            let inner = Arc::clone(&inner);
            std::thread::Builder::new()
                .name("share-worker".into())
                .spawn(move || worker_loop(&inner))
                .expect("spawn share worker")
        };
        let listener = {
            let inner = Arc::clone(&inner);
            std::thread::Builder::new()
                .name("hash-listener".into())
                .spawn(move || hash_listener_loop(&inner, hash_events))
                .expect("spawn hash listener")
        };

        Self {
            inner,
            worker: Mutex::new(Some(worker)),
            listener: Mutex::new(Some(listener)),
        }
    }

    /// Queue a refresh of specific paths. Paths already queued are dropped;
    /// affected roots move to `Pending`.
    pub fn refresh_paths(
        &self,
        kind: RefreshKind,
        paths: Vec<PathBuf>,
    ) -> Result<usize, RefreshError> {
        if self.inner.shutdown.load(Ordering::Relaxed) {
            return Err(RefreshError::ShutDown);
        }

        // validate everything before touching any root state
        let mut validated = Vec::with_capacity(paths.len());
        for path in paths {
            match self.inner.index.root_for_path(&path) {
                Some((root_id, _)) => validated.push((root_id, path)),
                None => return Err(RefreshError::NotShared(path)),
            }
        }

        let mut accepted = Vec::new();
        for (root_id, path) in validated {
            let queue = self.inner.queue.lock();
            let duplicate = queue
                .iter()
                .flat_map(|task| task.paths.iter())
                .any(|queued| queued == &path);
            drop(queue);
            if duplicate {
                debug!("Refresh of {:?} already queued, dropping", path);
                continue;
            }

            self.inner.index.set_refresh_state(root_id, RefreshState::Pending);
            accepted.push(path);
        }

        let count = accepted.len();
        if count > 0 {
            let mut queue = self.inner.queue.lock();
            queue.push_back(RefreshTask { kind, paths: accepted });
            self.inner.work_cv.notify_one();
        }
        Ok(count)
    }

    /// Queue a refresh of every root
    pub fn refresh_all(&self, kind: RefreshKind) -> Result<usize, RefreshError> {
        let paths: Vec<PathBuf> = self
            .inner
            .index
            .roots()
            .into_iter()
            .map(|info| info.path)
            .collect();
        if paths.is_empty() {
            return Ok(0);
        }
        self.refresh_paths(kind, paths)
    }

    /// Load valid share caches, returning the paths that still need a real
    /// refresh (no cache, or the filesystem moved on)
    pub fn load_startup_cache(&self) -> Vec<PathBuf> {
        let mut stale = Vec::new();
        for info in self.inner.index.roots() {
            let cached = self.inner.cache.load_root(info.id);
            let usable = cached.and_then(|cached| {
                if cached.path != info.path {
                    return None;
                }
                let live_mtime = std::fs::metadata(&info.path).ok().map(|md| mtime_secs(&md))?;
                (live_mtime == cached.root_mtime).then_some(cached)
            });

            match usable {
                Some(cached) => {
                    info!("Share cache hit for {:?}", info.path);
                    self.inner.index.install_subtree(info.id, cached.tree);
                    // the cache we just loaded still matches the disk file
                    self.clear_cache_dirty(info.id);
                }
                None => stale.push(info.path),
            }
        }
        stale
    }

    fn clear_cache_dirty(&self, root_id: RootId) {
        let mut inner = self.inner.index.inner.write();
        if let Some(root) = inner.roots.get_mut(&root_id) {
            root.cache_dirty = false;
        }
    }

    /// Write cache files for every dirty root
    pub fn save_caches(&self) {
        save_dirty_caches(&self.inner);
    }

    /// Abort all outstanding refresh work (shutdown path)
    pub fn abort_refresh(&self) {
        self.inner.abort.store(true, Ordering::Relaxed);
        self.inner.queue.lock().clear();
    }

    pub fn queued_tasks(&self) -> usize {
        self.inner.queue.lock().len()
    }

    /// Graceful, idempotent shutdown
    pub fn shutdown(&self) {
        if self.inner.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        self.abort_refresh();
        self.inner.work_cv.notify_all();

        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
        // the listener exits when the pool closes its event channel
        self.inner.pool.shutdown();
        if let Some(handle) = self.listener.lock().take() {
            let _ = handle.join();
        }
    }
}

fn worker_loop(inner: &Arc<RefresherInner>) {
    loop {
        let task = {
            let mut queue = inner.queue.lock();
            loop {
                if inner.shutdown.load(Ordering::Relaxed) {
                    return;
                }
                if let Some(task) = queue.pop_front() {
                    break task;
                }
                inner.work_cv.wait(&mut queue);
            }
        };

        inner.abort.store(false, Ordering::Relaxed);
        debug!("Running {:?} refresh of {} paths", task.kind, task.paths.len());

        for path in &task.paths {
            if inner.abort.load(Ordering::Relaxed) || inner.shutdown.load(Ordering::Relaxed) {
                break;
            }
            refresh_one_path(inner, path);
        }

        save_dirty_caches(inner);
    }
}

fn refresh_one_path(inner: &Arc<RefresherInner>, path: &Path) {
    let Some((root_id, root_path)) = inner.index.root_for_path(path) else {
        debug!("Refresh path {:?} no longer shared, skipping", path);
        return;
    };

    inner.index.set_refresh_state(root_id, RefreshState::Running);
    let started = std::time::Instant::now();
    let mut stats = WalkStats::default();
    let mut queued = Vec::new();

    // scan the requested directory off-lock
    let scanned = scan_directory(inner, path, &mut stats, &mut queued);
    let Some(scanned) = scanned else {
        info!("Refresh of {:?} aborted", path);
        inner.index.set_refresh_state(root_id, RefreshState::Normal);
        return;
    };

    let new_tree = if path == root_path {
        let virtual_name = {
            let idx = inner.index.inner.read();
            idx.roots[&root_id].virtual_name.clone()
        };
        let mut tree = Subtree::new(virtual_name, scanned.mtime);
        flatten_scan(&scanned, &mut tree, Subtree::ROOT);
        tree
    } else {
        // partial refresh: rebuild the root arena with the scanned subtree
        // spliced over the old one
        let rel_parts: Vec<String> = path
            .strip_prefix(&root_path)
            .map(|rel| {
                rel.components()
                    .map(|c| text::to_lower(&c.as_os_str().to_string_lossy()))
                    .collect()
            })
            .unwrap_or_default();

        let old_tree = {
            let idx = inner.index.inner.read();
            idx.roots[&root_id].tree.clone()
        };

        match splice_subtree(&old_tree, &rel_parts, &scanned) {
            Some(tree) => tree,
            None => {
                // the refreshed directory is new to the index; walk the
                // whole root instead
                debug!("Splice target {:?} unknown, walking whole root", path);
                let mut full_stats = WalkStats::default();
                queued.clear();
                let Some(full) = scan_directory(inner, &root_path, &mut full_stats, &mut queued)
                else {
                    inner.index.set_refresh_state(root_id, RefreshState::Normal);
                    return;
                };
                stats = full_stats;
                let mut tree = Subtree::new(
                    old_tree.dirs[Subtree::ROOT as usize].name.clone(),
                    full.mtime,
                );
                flatten_scan(&full, &mut tree, Subtree::ROOT);
                tree
            }
        }
    };

    inner.index.install_subtree(root_id, new_tree);

    // files whose hash completed while the shadow tree was being built have
    // a store record by now; pick them up so the swap cannot lose them
    for queued_path in queued {
        let lower = text::to_lower(&queued_path.to_string_lossy());
        if let Ok(Some(known)) = inner.store.get_file_info(&lower) {
            inner.index.add_hashed_file(&queued_path, &known);
        }
    }

    info!(
        "Refreshed {:?}: {} files indexed, {} queued for hashing, {} dirs, {} skipped ({} ms)",
        path,
        stats.files_indexed,
        stats.files_queued,
        stats.dirs,
        stats.skipped,
        started.elapsed().as_millis()
    );
}

/// Walk one directory recursively, recording files handed to the hasher;
/// None when aborted mid-scan
fn scan_directory(
    inner: &Arc<RefresherInner>,
    fs_path: &Path,
    stats: &mut WalkStats,
    queued: &mut Vec<PathBuf>,
) -> Option<ScanDir> {
    if inner.abort.load(Ordering::Relaxed) || inner.shutdown.load(Ordering::Relaxed) {
        return None;
    }

    let name = fs_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let mtime = std::fs::metadata(fs_path).map(|md| mtime_secs(&md)).unwrap_or(0);

    let mut out = ScanDir {
        name,
        mtime,
        dirs: Vec::new(),
        files: Vec::new(),
    };
    stats.dirs += 1;

    let entries = match std::fs::read_dir(fs_path) {
        Ok(entries) => entries,
        Err(e) => {
            warn!("Cannot read {:?}: {}", fs_path, e);
            return Some(out);
        }
    };

    for entry in entries.flatten() {
        let entry_path = entry.path();
        let entry_name = entry.file_name().to_string_lossy().into_owned();

        if !inner.config.share_hidden && entry_name.starts_with('.') {
            stats.skipped += 1;
            continue;
        }
        if inner.skip.matches(&entry_name) {
            stats.skipped += 1;
            continue;
        }

        let Ok(md) = entry.metadata() else {
            stats.skipped += 1;
            continue;
        };

        if md.is_dir() {
            let child = scan_directory(inner, &entry_path, stats, queued)?;
            let empty = child.dirs.is_empty() && child.files.is_empty();
            if empty && inner.config.skip_empty_directories {
                stats.skipped += 1;
            } else {
                out.dirs.push(child);
            }
        } else if md.is_file() {
            let size = md.len() as i64;
            if inner.config.max_file_size_shared > 0
                && md.len() > inner.config.max_file_size_shared
            {
                stats.skipped += 1;
                continue;
            }

            let mtime = mtime_secs(&md);
            let path_lower = text::to_lower(&entry_path.to_string_lossy());
            match inner.store.check_tth(&path_lower, size, mtime) {
                Some(known) => {
                    stats.files_indexed += 1;
                    out.files.push(ScanFile {
                        name: entry_name,
                        size,
                        mtime,
                        tth: known.root,
                    });
                }
                None => {
                    // joins the index when the hash completes
                    if inner.pool.hash_file(&entry_path, size) {
                        stats.files_queued += 1;
                    }
                    queued.push(entry_path);
                }
            }
        }
    }

    Some(out)
}

fn flatten_scan(scan: &ScanDir, tree: &mut Subtree, dir: u32) {
    for file in &scan.files {
        tree.add_file(
            dir,
            DualName::new(file.name.clone()),
            file.size,
            file.mtime,
            file.tth,
        );
    }
    for child in &scan.dirs {
        let id = tree.add_dir(dir, DualName::new(child.name.clone()), child.mtime);
        flatten_scan(child, tree, id);
    }
}

/// Rebuild a root arena with `replacement` spliced in at `parts` (lowercase
/// components relative to the root). None when the target path's ancestry is
/// not present in the old tree.
fn splice_subtree(old: &Subtree, parts: &[String], replacement: &ScanDir) -> Option<Subtree> {
    if parts.is_empty() {
        return None;
    }
    // the ancestry (everything above the replaced dir) must exist
    let mut probe = Subtree::ROOT;
    for part in &parts[..parts.len() - 1] {
        probe = old.find_child_dir(probe, part)?;
    }

    let mut tree = Subtree::new(
        old.dirs[Subtree::ROOT as usize].name.clone(),
        old.dirs[Subtree::ROOT as usize].mtime,
    );
    copy_with_replacement(old, Subtree::ROOT, parts, replacement, &mut tree, Subtree::ROOT);
    Some(tree)
}

fn copy_with_replacement(
    old: &Subtree,
    old_dir: u32,
    parts: &[String],
    replacement: &ScanDir,
    tree: &mut Subtree,
    new_dir: u32,
) {
    let node = &old.dirs[old_dir as usize];
    for &f in &node.files {
        let file = &old.files[f as usize];
        tree.add_file(new_dir, file.name.clone(), file.size, file.mtime, file.tth);
    }

    let mut replaced = false;
    for &d in &node.dirs {
        let child = &old.dirs[d as usize];
        if parts.first().map(String::as_str) == Some(child.name.lower()) {
            if parts.len() == 1 {
                let id = tree.add_dir(
                    new_dir,
                    DualName::new(replacement.name.clone()),
                    replacement.mtime,
                );
                flatten_scan(replacement, tree, id);
                replaced = true;
            } else {
                let id = tree.add_dir(new_dir, child.name.clone(), child.mtime);
                copy_with_replacement(old, d, &parts[1..], replacement, tree, id);
            }
        } else {
            let id = tree.add_dir(new_dir, child.name.clone(), child.mtime);
            copy_plain(old, d, tree, id);
        }
    }

    // the refreshed directory may be brand new under an existing parent
    if parts.len() == 1 && !replaced {
        let id = tree.add_dir(
            new_dir,
            DualName::new(replacement.name.clone()),
            replacement.mtime,
        );
        flatten_scan(replacement, tree, id);
    }
}

fn copy_plain(old: &Subtree, old_dir: u32, tree: &mut Subtree, new_dir: u32) {
    let node = &old.dirs[old_dir as usize];
    for &f in &node.files {
        let file = &old.files[f as usize];
        tree.add_file(new_dir, file.name.clone(), file.size, file.mtime, file.tth);
    }
    for &d in &node.dirs {
        let child = &old.dirs[d as usize];
        let id = tree.add_dir(new_dir, child.name.clone(), child.mtime);
        copy_plain(old, d, tree, id);
    }
}

fn save_dirty_caches(inner: &Arc<RefresherInner>) {
    let dirty: Vec<RootId> = {
        let idx = inner.index.inner.read();
        idx.roots
            .values()
            .filter(|root| root.cache_dirty)
            .map(|root| root.id)
            .collect()
    };

    for root_id in dirty {
        let idx = inner.index.inner.read();
        let Some(root) = idx.roots.get(&root_id) else {
            continue;
        };
        if let Err(e) = inner.cache.save_root(root) {
            warn!("Share cache write failed for root {}: {}", root_id, e);
            continue;
        }
        drop(idx);
        let mut idx = inner.index.inner.write();
        if let Some(root) = idx.roots.get_mut(&root_id) {
            root.cache_dirty = false;
        }
    }
}

fn hash_listener_loop(inner: &Arc<RefresherInner>, rx: crossbeam_channel::Receiver<HashEvent>) {
    for event in rx {
        match event {
            HashEvent::FileHashed { path, file, tree, .. } => {
                let path_lower = text::to_lower(&path.to_string_lossy());
                if let Err(e) = inner.store.add_hashed_file(&path_lower, &tree, &file) {
                    warn!("Could not persist hash for {:?}: {}", path, e);
                    continue;
                }
                inner.index.add_hashed_file(&path, &file);
            }
            HashEvent::FileFailed { path, kind, message, .. } => {
                warn!("File left unshared after hash failure {:?}: {} ({})", path, message, kind.as_str());
            }
            HashEvent::DirectoryHashed { path, stats, .. } => {
                debug!(
                    "Directory hashed {:?}: {} files, {} bytes",
                    path, stats.files_hashed, stats.size_hashed
                );
            }
            HashEvent::HasherFinished { directories, stats, hasher_id } => {
                info!(
                    "Hasher {} finished {} directories ({} files, {} bytes, {} ms)",
                    hasher_id, directories, stats.files_hashed, stats.size_hashed, stats.hash_time_ms
                );
                save_dirty_caches(inner);
            }
        }
        if inner.shutdown.load(Ordering::Relaxed) {
            break;
        }
    }
}
