use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, warn};

use super::CacheSet;
use crate::backend::BackendSlot;

/// Background write-back of aged dirty blocks.
pub struct Flusher {
    shutdown: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Flusher {
    /// Start a thread that wakes every `interval` and writes back blocks that
    /// have been dirty for at least `max_age`.
    pub fn start(
        caches: CacheSet,
        backend: BackendSlot,
        interval: Duration,
        max_age: Duration,
    ) -> std::io::Result<Self> {
        let shutdown = Arc::new(AtomicBool::new(false));
        let stop = Arc::clone(&shutdown);
        let handle = std::thread::Builder::new()
            .name("dfs-flusher".to_string())
            .spawn(move || {
                debug!(
                    "Flush thread started, interval={:?}, max_age={:?}",
                    interval, max_age
                );
                while !stop.load(Ordering::Relaxed) {
                    // Sleep in short ticks so we notice the shutdown flag promptly.
                    let mut remaining = interval;
                    let tick = Duration::from_millis(100);
                    while remaining > Duration::ZERO {
                        if stop.load(Ordering::Relaxed) {
                            break;
                        }
                        let sleep_time = remaining.min(tick);
                        std::thread::sleep(sleep_time);
                        remaining = remaining.saturating_sub(sleep_time);
                    }
                    if stop.load(Ordering::Relaxed) {
                        break;
                    }
                    let flushed = caches.flush_aged(max_age, &*backend.current());
                    if flushed > 0 {
                        debug!("Flush thread wrote back {} blocks", flushed);
                    }
                }
                debug!("Flush thread shutting down");
            })?;
        Ok(Self {
            shutdown,
            handle: Some(handle),
        })
    }

    /// Signal the thread and wait for it to exit.
    pub fn stop(mut self) {
        self.halt();
    }

    fn halt(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("Flush thread panicked");
            }
        }
    }
}

impl Drop for Flusher {
    fn drop(&mut self) {
        self.halt();
    }
}
