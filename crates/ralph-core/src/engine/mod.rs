//! The execution engines and their supporting state machines.

pub mod agent_state;
pub mod coordinator;
pub mod main_sync;
pub mod merge_queue;
pub mod parallel;
pub mod prompt;
pub mod recovery;
pub mod sequential;
pub mod state;
pub mod subagents;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::watch;

use ralph_agent::Interrupter;

/// Cloneable control surface shared with the CLI and signal handlers.
///
/// `stop` is cooperative: the sequential loop checks between iterations and
/// the coordinator stops dispatching while in-flight workers finish.
/// `interrupt` kills the currently running subprocess.
#[derive(Clone)]
pub struct EngineControl {
    shutdown: Arc<watch::Sender<bool>>,
    pause: Arc<AtomicBool>,
    interrupter: Arc<Mutex<Option<Interrupter>>>,
}

impl Default for EngineControl {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineControl {
    pub fn new() -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            shutdown: Arc::new(shutdown),
            pause: Arc::new(AtomicBool::new(false)),
            interrupter: Arc::new(Mutex::new(None)),
        }
    }

    /// Request a cooperative stop. `send_replace` so the flag sticks even
    /// when no receiver is currently subscribed.
    pub fn stop(&self) {
        self.shutdown.send_replace(true);
    }

    pub fn is_stopping(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Subscribe to the stop signal (used by long cancellable waits).
    pub fn shutdown_receiver(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    pub fn pause(&self) {
        self.pause.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.pause.store(false, Ordering::SeqCst);
    }

    pub fn is_paused(&self) -> bool {
        self.pause.load(Ordering::SeqCst)
    }

    /// Signal the running agent subprocess, when one is active.
    pub fn interrupt(&self) {
        let slot = self.interrupter.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(interrupter) = slot.as_ref() {
            interrupter.interrupt();
        }
    }

    pub(crate) fn set_interrupter(&self, interrupter: Option<Interrupter>) {
        *self.interrupter.lock().unwrap_or_else(|e| e.into_inner()) = interrupter;
    }

    /// Sleep that aborts early on stop. Returns `false` when stopping.
    pub async fn cancellable_sleep(&self, delay: std::time::Duration) -> bool {
        if self.is_stopping() {
            return false;
        }
        let mut shutdown = self.shutdown.subscribe();
        tokio::select! {
            _ = tokio::time::sleep(delay) => true,
            _ = shutdown.changed() => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_stop_cancels_sleep() {
        let control = EngineControl::new();
        let waiter = control.clone();
        let handle =
            tokio::spawn(async move { waiter.cancellable_sleep(Duration::from_secs(60)).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        control.stop();
        assert!(!handle.await.unwrap());
        assert!(control.is_stopping());
    }

    #[tokio::test]
    async fn test_pause_resume() {
        let control = EngineControl::new();
        assert!(!control.is_paused());
        control.pause();
        assert!(control.is_paused());
        control.resume();
        assert!(!control.is_paused());
    }
}
