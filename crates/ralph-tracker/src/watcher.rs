//! Tracker change watcher.
//!
//! Polls the tracker's persistence file and tells the engine when someone
//! else changed it. Two cadences: `live` while the file is reachable and
//! recently changing, `fallback` while it is unreachable or idle. Bursts are
//! coalesced: one poll produces at most one change notification, so
//! consumers never see more than one in-flight refresh per poll.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

/// Cadence and staleness thresholds.
#[derive(Debug, Clone)]
pub struct WatcherConfig {
    pub live_interval: Duration,
    pub fallback_interval: Duration,
    /// Reachable but unchanged for this long → stale cadence.
    pub stale_after: Duration,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            live_interval: Duration::from_secs(1),
            fallback_interval: Duration::from_secs(5),
            stale_after: Duration::from_secs(30),
        }
    }
}

/// Reported connection quality.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatcherStatus {
    Live,
    Fallback,
    Stale,
}

impl WatcherStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Live => "live",
            Self::Fallback => "fallback",
            Self::Stale => "stale",
        }
    }
}

pub type ChangeCallback = Arc<dyn Fn() + Send + Sync>;
pub type StatusCallback = Arc<dyn Fn(WatcherStatus, u64, &str) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileStamp {
    modified: Option<SystemTime>,
    len: u64,
}

fn stamp(path: &PathBuf) -> Option<FileStamp> {
    let meta = std::fs::metadata(path).ok()?;
    Some(FileStamp {
        modified: meta.modified().ok(),
        len: meta.len(),
    })
}

pub struct TrackerChangeWatcher {
    handle: JoinHandle<()>,
    shutdown: watch::Sender<bool>,
}

impl TrackerChangeWatcher {
    /// Start polling `path`. Callbacks fire on the watcher task.
    pub fn spawn(
        path: PathBuf,
        config: WatcherConfig,
        on_change: ChangeCallback,
        on_status_change: StatusCallback,
    ) -> Self {
        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            let mut last_stamp = stamp(&path);
            let mut last_change = tokio::time::Instant::now();
            let mut status: Option<WatcherStatus> = None;

            loop {
                let current = stamp(&path);
                let changed = match (&last_stamp, &current) {
                    (Some(a), Some(b)) => a != b,
                    (None, Some(_)) => true,
                    _ => false,
                };
                if changed {
                    last_change = tokio::time::Instant::now();
                    last_stamp = current;
                    on_change();
                }

                let (next_status, reason) = if current.is_none() {
                    (WatcherStatus::Fallback, "store unreachable")
                } else if last_change.elapsed() >= config.stale_after {
                    (WatcherStatus::Stale, "store idle")
                } else {
                    (WatcherStatus::Live, "store reachable")
                };
                let interval = match next_status {
                    WatcherStatus::Live => config.live_interval,
                    _ => config.fallback_interval,
                };

                if status != Some(next_status) {
                    debug!(
                        category = "tracker.watch",
                        status = next_status.as_str(),
                        interval_ms = interval.as_millis() as u64,
                        reason,
                        "Watcher status change"
                    );
                    on_status_change(next_status, interval.as_millis() as u64, reason);
                    status = Some(next_status);
                }

                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = shutdown_rx.changed() => break,
                }
            }
        });

        Self { handle, shutdown }
    }

    /// Stop the watcher task.
    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
    }

    pub async fn join(self) {
        self.stop();
        let _ = self.handle.await;
    }
}
