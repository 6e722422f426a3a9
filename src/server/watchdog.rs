//! Idle/ownership watchdog.
//!
//! A periodic task (a tokio interval, not a busy loop) that asks the
//! server to shut down when the connection has been idle too long or
//! when the filesystem ownership marker disappears. The serve loop
//! records activity; the watchdog only observes.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tokio::sync::Notify;
use tokio::task::JoinHandle;

/// Last-activity clock shared between the serve loop and the watchdog.
#[derive(Debug)]
pub struct ActivityTracker {
    last: Mutex<Instant>,
}

impl ActivityTracker {
    pub fn new() -> Self {
        Self {
            last: Mutex::new(Instant::now()),
        }
    }

    pub fn touch(&self) {
        *self.last.lock().expect("activity clock poisoned") = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last.lock().expect("activity clock poisoned").elapsed()
    }
}

impl Default for ActivityTracker {
    fn default() -> Self {
        Self::new()
    }
}

pub struct Watchdog {
    shutdown: Arc<Notify>,
    handle: JoinHandle<()>,
}

impl Watchdog {
    /// Start watching. With neither an idle timeout nor an owner file
    /// the task exits immediately and the watchdog never fires.
    pub fn spawn(
        activity: Arc<ActivityTracker>,
        idle_timeout: Option<Duration>,
        owner_file: Option<PathBuf>,
    ) -> Self {
        let shutdown = Arc::new(Notify::new());
        let notify = Arc::clone(&shutdown);

        let handle = tokio::spawn(async move {
            if idle_timeout.is_none() && owner_file.is_none() {
                return;
            }
            let period = idle_timeout
                .map(|t| (t / 4).max(Duration::from_millis(10)))
                .unwrap_or(Duration::from_secs(1));
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;

                if let Some(timeout) = idle_timeout {
                    if activity.idle_for() >= timeout {
                        tracing::info!(idle = ?activity.idle_for(), "idle timeout reached");
                        notify.notify_one();
                        return;
                    }
                }
                if let Some(marker) = &owner_file {
                    if !marker.exists() {
                        tracing::info!(marker = %marker.display(), "ownership marker gone");
                        notify.notify_one();
                        return;
                    }
                }
            }
        });

        Self { shutdown, handle }
    }

    /// Resolves when the watchdog decides the server should exit.
    pub async fn shut_down(&self) {
        self.shutdown.notified().await;
    }

    pub fn abort(self) {
        self.handle.abort();
    }
}
