//! Share monitoring
//!
//! Watches share roots for filesystem changes and schedules partial
//! refreshes. Raw watcher events are coalesced per parent directory; a
//! directory is handed to the refresh callback once it has been quiet for
//! the configured delay. Watcher overflow falls back to a full refresh of
//! everything watched, and failed registrations are retried periodically.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, Sender};
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, info, warn};

use slipstream_core::MonitoringConfig;

/// Normalized change notifications, mostly for observability; refresh
/// scheduling happens internally
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MonitorEvent {
    Created(PathBuf),
    Modified(PathBuf),
    Renamed { from: PathBuf, to: PathBuf },
    Removed(PathBuf),
    /// The OS queue overflowed; the affected roots get a full refresh
    Overflow,
    /// A root could not be watched and joined the failed set
    Failed { path: PathBuf, reason: String },
}

#[derive(Error, Debug)]
pub enum MonitorError {
    #[error("could not watch {path:?}: {reason}")]
    RegisterFailed { path: PathBuf, reason: String },
}

type RefreshCallback = dyn Fn(Vec<PathBuf>) + Send + Sync;

struct MonitorInner {
    watcher: Mutex<Option<RecommendedWatcher>>,
    watched: Mutex<HashSet<PathBuf>>,
    failed: Mutex<HashSet<PathBuf>>,
    /// dir → last observed activity
    pending: Mutex<HashMap<PathBuf, Instant>>,
    delay: Duration,
    retry: Duration,
    on_refresh: Box<RefreshCallback>,
    subscribers: Mutex<Vec<Sender<MonitorEvent>>>,
    shutdown: AtomicBool,
}

impl MonitorInner {
    fn emit(&self, event: MonitorEvent) {
        let mut subs = self.subscribers.lock();
        subs.retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Record activity for the parent directory of a changed path
    fn touch(&self, path: &Path) {
        let bucket = path.parent().unwrap_or(path).to_path_buf();
        self.pending.lock().insert(bucket, Instant::now());
    }

    /// Submit refresh tasks for every bucket that has gone quiet
    fn flush_quiet(&self) {
        let due: Vec<PathBuf> = {
            let mut pending = self.pending.lock();
            let now = Instant::now();
            let due: Vec<PathBuf> = pending
                .iter()
                .filter(|(_, last)| now.duration_since(**last) >= self.delay)
                .map(|(dir, _)| dir.clone())
                .collect();
            for dir in &due {
                pending.remove(dir);
            }
            due
        };

        if !due.is_empty() {
            debug!("Monitor flushing {} quiet directories", due.len());
            (self.on_refresh)(due);
        }
    }

    /// Retry watch registration for failed roots
    fn retry_failed(&self) {
        let candidates: Vec<PathBuf> = self.failed.lock().iter().cloned().collect();
        if candidates.is_empty() {
            return;
        }

        let mut watcher_guard = self.watcher.lock();
        let Some(watcher) = watcher_guard.as_mut() else {
            return;
        };

        for path in candidates {
            match watcher.watch(&path, RecursiveMode::Recursive) {
                Ok(()) => {
                    info!("Monitoring restored for {:?}", path);
                    self.failed.lock().remove(&path);
                    self.watched.lock().insert(path.clone());
                    // events were lost while unwatched
                    (self.on_refresh)(vec![path]);
                }
                Err(e) => {
                    debug!("Monitor retry for {:?} still failing: {}", path, e);
                }
            }
        }
    }

    fn handle_notify(&self, result: Result<notify::Event, notify::Error>) {
        let event = match result {
            Ok(event) => event,
            Err(e) => {
                warn!("Watcher error: {}", e);
                return;
            }
        };

        if event.need_rescan() {
            warn!("Watcher overflow, scheduling full refresh of watched roots");
            self.emit(MonitorEvent::Overflow);
            let roots: Vec<PathBuf> = self.watched.lock().iter().cloned().collect();
            self.pending.lock().clear();
            (self.on_refresh)(roots);
            return;
        }

        use notify::event::{EventKind, ModifyKind, RenameMode};
        match event.kind {
            EventKind::Create(_) => {
                for path in &event.paths {
                    self.touch(path);
                    self.emit(MonitorEvent::Created(path.clone()));
                }
            }
            EventKind::Remove(_) => {
                for path in &event.paths {
                    self.touch(path);
                    self.emit(MonitorEvent::Removed(path.clone()));
                }
            }
            EventKind::Modify(ModifyKind::Name(RenameMode::Both))
                if event.paths.len() == 2 =>
            {
                let from = event.paths[0].clone();
                let to = event.paths[1].clone();
                self.touch(&from);
                self.touch(&to);
                self.emit(MonitorEvent::Renamed { from, to });
            }
            EventKind::Modify(_) => {
                for path in &event.paths {
                    self.touch(path);
                    self.emit(MonitorEvent::Modified(path.clone()));
                }
            }
            _ => {}
        }
    }
}

/// Watches share roots and schedules debounced refreshes
pub struct ShareMonitor {
    inner: Arc<MonitorInner>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl ShareMonitor {
    /// Create the monitor; `on_refresh` receives directories that settled
    /// down and should be partially refreshed
    pub fn new(
        config: &MonitoringConfig,
        on_refresh: impl Fn(Vec<PathBuf>) + Send + Sync + 'static,
    ) -> Self {
        let (raw_tx, raw_rx) = unbounded();

        let inner = Arc::new(MonitorInner {
            watcher: Mutex::new(None),
            watched: Mutex::new(HashSet::new()),
            failed: Mutex::new(HashSet::new()),
            pending: Mutex::new(HashMap::new()),
            delay: Duration::from_secs(config.delay_secs),
            retry: Duration::from_secs(config.failed_retry_secs.max(1)),
            on_refresh: Box::new(on_refresh),
            subscribers: Mutex::new(Vec::new()),
            shutdown: AtomicBool::new(false),
        });

        let watcher = notify::recommended_watcher(move |res| {
            let _ = raw_tx.send(res);
        });
        match watcher {
            Ok(w) => *inner.watcher.lock() = Some(w),
            Err(e) => warn!("Filesystem watcher unavailable: {}", e),
        }

        let dispatcher = {
            let inner = Arc::clone(&inner);
            std::thread::Builder::new()
                .name("share-monitor".into())
                .spawn(move || dispatcher_loop(&inner, raw_rx))
                .expect("spawn monitor dispatcher")
        };

        Self {
            inner,
            dispatcher: Mutex::new(Some(dispatcher)),
        }
    }

    /// Receive normalized monitor events
    pub fn subscribe(&self) -> Receiver<MonitorEvent> {
        let (tx, rx) = unbounded();
        self.inner.subscribers.lock().push(tx);
        rx
    }

    /// Watch a root recursively; failure moves it to the failed set
    pub fn add_directory(&self, path: &Path) -> Result<(), MonitorError> {
        let mut watcher_guard = self.inner.watcher.lock();
        let Some(watcher) = watcher_guard.as_mut() else {
            let reason = "no watcher backend".to_string();
            self.inner.failed.lock().insert(path.to_path_buf());
            return Err(MonitorError::RegisterFailed {
                path: path.to_path_buf(),
                reason,
            });
        };

        match watcher.watch(path, RecursiveMode::Recursive) {
            Ok(()) => {
                self.inner.watched.lock().insert(path.to_path_buf());
                info!("Monitoring {:?}", path);
                Ok(())
            }
            Err(e) => {
                let reason = e.to_string();
                warn!("Monitoring registration failed for {:?}: {}", path, reason);
                self.inner.failed.lock().insert(path.to_path_buf());
                self.inner.emit(MonitorEvent::Failed {
                    path: path.to_path_buf(),
                    reason: reason.clone(),
                });
                Err(MonitorError::RegisterFailed {
                    path: path.to_path_buf(),
                    reason,
                })
            }
        }
    }

    pub fn remove_directory(&self, path: &Path) -> bool {
        let mut watcher_guard = self.inner.watcher.lock();
        let removed = self.inner.watched.lock().remove(path);
        self.inner.failed.lock().remove(path);
        if removed {
            if let Some(watcher) = watcher_guard.as_mut() {
                let _ = watcher.unwatch(path);
            }
        }
        removed
    }

    /// Stop watching everything; returns how many roots were watched
    pub fn clear(&self) -> usize {
        let paths: Vec<PathBuf> = self.inner.watched.lock().iter().cloned().collect();
        for path in &paths {
            self.remove_directory(path);
        }
        self.inner.failed.lock().clear();
        self.inner.pending.lock().clear();
        paths.len()
    }

    pub fn failed_paths(&self) -> Vec<PathBuf> {
        self.inner.failed.lock().iter().cloned().collect()
    }

    pub fn watched_paths(&self) -> Vec<PathBuf> {
        self.inner.watched.lock().iter().cloned().collect()
    }

    /// Drop every watch under a removed device or mount
    pub fn device_removed(&self, mount: &Path) {
        let doomed: Vec<PathBuf> = self
            .inner
            .watched
            .lock()
            .iter()
            .filter(|p| p.starts_with(mount))
            .cloned()
            .collect();

        for path in doomed {
            warn!("Device removed, dropping monitor for {:?}", path);
            self.remove_directory(&path);
            self.inner.failed.lock().insert(path);
        }
        self.inner
            .pending
            .lock()
            .retain(|dir, _| !dir.starts_with(mount));
    }

    pub fn shutdown(&self) {
        if self.inner.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        // dropping the watcher closes the raw channel and ends the thread
        *self.inner.watcher.lock() = None;
        if let Some(handle) = self.dispatcher.lock().take() {
            let _ = handle.join();
        }
    }
}

fn dispatcher_loop(
    inner: &Arc<MonitorInner>,
    raw_rx: Receiver<Result<notify::Event, notify::Error>>,
) {
    let mut last_retry = Instant::now();

    loop {
        if inner.shutdown.load(Ordering::Relaxed) {
            return;
        }

        match raw_rx.recv_timeout(Duration::from_millis(250)) {
            Ok(result) => inner.handle_notify(result),
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => {}
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => return,
        }

        inner.flush_quiet();

        if last_retry.elapsed() >= inner.retry {
            last_retry = Instant::now();
            inner.retry_failed();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;
    use tempfile::tempdir;

    fn config(delay_secs: u64) -> MonitoringConfig {
        MonitoringConfig {
            enabled: true,
            delay_secs,
            failed_retry_secs: 1,
        }
    }

    fn wait_until(mut pred: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(15);
        while Instant::now() < deadline {
            if pred() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(50));
        }
        false
    }

    #[test]
    fn test_change_triggers_debounced_refresh() {
        let share = tempdir().unwrap();
        let refreshed: Arc<StdMutex<Vec<PathBuf>>> = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::clone(&refreshed);

        let monitor = ShareMonitor::new(&config(0), move |paths| {
            sink.lock().unwrap().extend(paths);
        });
        monitor.add_directory(share.path()).unwrap();

        // give the recursive watch a moment to arm before changing anything
        std::thread::sleep(Duration::from_millis(300));
        std::fs::write(share.path().join("new-file.bin"), b"data").unwrap();

        let canonical_share = share.path().canonicalize().unwrap();
        let hit = wait_until(|| {
            refreshed
                .lock()
                .unwrap()
                .iter()
                .any(|p| p.starts_with(&canonical_share) || p.starts_with(share.path()))
        });
        assert!(hit, "expected a refresh for the changed directory");

        monitor.shutdown();
    }

    #[test]
    fn test_failed_registration_lands_in_failed_set() {
        let monitor = ShareMonitor::new(&config(1), |_| {});
        let missing = PathBuf::from("/definitely/not/here");

        assert!(monitor.add_directory(&missing).is_err());
        assert_eq!(monitor.failed_paths(), vec![missing]);

        monitor.shutdown();
    }

    #[test]
    fn test_remove_and_clear() {
        let share = tempdir().unwrap();
        let monitor = ShareMonitor::new(&config(30), |_| {});

        monitor.add_directory(share.path()).unwrap();
        assert_eq!(monitor.watched_paths().len(), 1);

        assert!(monitor.remove_directory(share.path()));
        assert!(!monitor.remove_directory(share.path()));
        assert!(monitor.watched_paths().is_empty());

        monitor.add_directory(share.path()).unwrap();
        assert_eq!(monitor.clear(), 1);
        assert!(monitor.watched_paths().is_empty());

        monitor.shutdown();
    }

    #[test]
    fn test_device_removed_flushes_watches() {
        let share = tempdir().unwrap();
        let monitor = ShareMonitor::new(&config(30), |_| {});
        monitor.add_directory(share.path()).unwrap();

        monitor.device_removed(share.path().parent().unwrap());
        assert!(monitor.watched_paths().is_empty());
        assert_eq!(monitor.failed_paths().len(), 1);

        monitor.shutdown();
    }
}
