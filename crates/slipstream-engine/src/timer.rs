//! Tick scheduling
//!
//! One thread drives the second and minute cadences of the upload
//! dispatcher. Callbacks take only the locks they need and never block the
//! ticker for long; a slow callback delays subsequent ticks rather than
//! stacking them.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::debug;

use crate::upload::UploadDispatcher;

/// Drives periodic dispatcher work; stops on shutdown or drop
pub struct Ticker {
    stop: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Ticker {
    /// Spawn the timer thread
    pub fn start(dispatcher: UploadDispatcher) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);

        let handle = std::thread::Builder::new()
            .name("tick-timer".into())
            .spawn(move || {
                let mut seconds = 0u64;
                while !flag.load(Ordering::Relaxed) {
                    std::thread::sleep(Duration::from_secs(1));
                    if flag.load(Ordering::Relaxed) {
                        break;
                    }
                    dispatcher.second_tick();
                    seconds += 1;
                    if seconds % 60 == 0 {
                        dispatcher.minute_tick();
                    }
                }
                debug!("Ticker stopped");
            })
            .expect("spawn tick timer");

        Self {
            stop,
            handle: Mutex::new(Some(handle)),
        }
    }

    pub fn shutdown(&self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Ticker {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
    }
}
