//! Engine events and the fan-out event bus.
//!
//! Every observable state change becomes one [`EngineEvent`]. The bus is a
//! single publisher with registered listeners; a listener panic is isolated
//! so one bad subscriber can never stall the engine. Serialized names are
//! the wire names used in the JSONL logs and by the UI bridge.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use serde::{Deserialize, Serialize};
use tracing::warn;

use ralph_tracker::Task;

/// Which engine flavor is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineMode {
    Sequential,
    Parallel,
}

/// Why the engine stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    Completed,
    NoTasks,
    MaxIterations,
    Stopped,
    Error,
}

/// Terminal status of one iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IterationStatus {
    Completed,
    Failed,
    Interrupted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// Why the active agent changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SwitchReason {
    Fallback,
    Primary,
}

/// Phase attached to failure events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Execution,
    Merge,
    Sync,
    Recovery,
    Validation,
}

/// Everything the engine can tell the outside world.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event")]
pub enum EngineEvent {
    #[serde(rename = "engine:started")]
    EngineStarted {
        total_tasks: usize,
        max_iterations: u64,
        mode: EngineMode,
    },
    #[serde(rename = "engine:stopped")]
    EngineStopped {
        reason: StopReason,
        total_iterations: u64,
        tasks_completed: usize,
    },
    #[serde(rename = "engine:paused")]
    EnginePaused,
    #[serde(rename = "engine:resumed")]
    EngineResumed,

    #[serde(rename = "task:selected")]
    TaskSelected { task: Task, iteration: u64 },
    #[serde(rename = "task:activated")]
    TaskActivated { task_id: String },
    #[serde(rename = "task:completed")]
    TaskCompleted { task_id: String, iteration: u64 },
    #[serde(rename = "task:blocked")]
    TaskBlocked { task_id: String, reason: String },
    #[serde(rename = "task:reopened")]
    TaskReopened { task_id: String, reason: String },
    #[serde(rename = "task:skipped")]
    TaskSkipped { task_id: String, reason: String },

    #[serde(rename = "iteration:started")]
    IterationStarted { iteration: u64, task_id: String },
    #[serde(rename = "iteration:completed")]
    IterationCompleted {
        iteration: u64,
        task_id: String,
        status: IterationStatus,
        promise_complete: bool,
        task_completed: bool,
    },
    #[serde(rename = "iteration:failed")]
    IterationFailed {
        iteration: u64,
        task_id: String,
        error: String,
    },
    #[serde(rename = "iteration:rate-limited")]
    IterationRateLimited {
        agent: String,
        attempt: u32,
        delay_ms: u64,
        used_retry_after: bool,
        iteration: u64,
    },
    #[serde(rename = "iteration:commit-recovery")]
    CommitRecovery {
        task_id: String,
        attempt: u32,
        max_retries: u32,
        reason: String,
        changed_files: Vec<String>,
        iteration: u64,
    },

    #[serde(rename = "agent:output")]
    AgentOutput {
        stream: OutputStream,
        chunk: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        worker_id: Option<String>,
    },
    #[serde(rename = "agent:switched")]
    AgentSwitched {
        from: String,
        to: String,
        reason: SwitchReason,
    },
    #[serde(rename = "agent:recovery-attempted")]
    AgentRecoveryAttempted { agent: String, success: bool },
    #[serde(rename = "agent:all-limited")]
    AgentAllLimited { agents: Vec<String> },
    #[serde(rename = "subagent:update")]
    SubagentUpdate {
        id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        status: String,
    },

    #[serde(rename = "main-sync-succeeded")]
    MainSyncSucceeded { commit: String, updated: bool },
    #[serde(rename = "main-sync-failed")]
    MainSyncFailed { reason: String },
    #[serde(rename = "main-sync-retrying")]
    MainSyncRetrying { attempt: u32, delay_ms: u64 },
    #[serde(rename = "main-sync-alert")]
    MainSyncAlert { pending_tasks: usize, message: String },

    #[serde(rename = "parallel:merge-queued")]
    MergeQueued {
        task_id: String,
        worker_id: String,
        commit: String,
    },
    #[serde(rename = "parallel:merge-succeeded")]
    MergeSucceeded { task_id: String, commit: String },
    #[serde(rename = "parallel:merge-failed")]
    MergeFailed {
        task_id: String,
        commit: String,
        reason: String,
    },
    #[serde(rename = "parallel:task-claimed")]
    TaskClaimed {
        task_id: String,
        worker_id: String,
        iteration: u64,
    },
    #[serde(rename = "parallel:worker-started")]
    WorkerStarted { worker_id: String, task_id: String },
    #[serde(rename = "parallel:worker-finished")]
    WorkerFinished {
        worker_id: String,
        task_id: String,
        completed: bool,
    },

    #[serde(rename = "all:complete")]
    AllComplete,
    #[serde(rename = "tracker:status")]
    TrackerStatus {
        status: String,
        interval_ms: u64,
        reason: String,
    },
    #[serde(rename = "engine:error")]
    EngineError {
        phase: Phase,
        #[serde(skip_serializing_if = "Option::is_none")]
        task_id: Option<String>,
        reason: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        iteration: Option<u64>,
    },
}

impl EngineEvent {
    /// Wire name, identical to the serde tag.
    pub fn name(&self) -> &'static str {
        match self {
            Self::EngineStarted { .. } => "engine:started",
            Self::EngineStopped { .. } => "engine:stopped",
            Self::EnginePaused => "engine:paused",
            Self::EngineResumed => "engine:resumed",
            Self::TaskSelected { .. } => "task:selected",
            Self::TaskActivated { .. } => "task:activated",
            Self::TaskCompleted { .. } => "task:completed",
            Self::TaskBlocked { .. } => "task:blocked",
            Self::TaskReopened { .. } => "task:reopened",
            Self::TaskSkipped { .. } => "task:skipped",
            Self::IterationStarted { .. } => "iteration:started",
            Self::IterationCompleted { .. } => "iteration:completed",
            Self::IterationFailed { .. } => "iteration:failed",
            Self::IterationRateLimited { .. } => "iteration:rate-limited",
            Self::CommitRecovery { .. } => "iteration:commit-recovery",
            Self::AgentOutput { .. } => "agent:output",
            Self::AgentSwitched { .. } => "agent:switched",
            Self::AgentRecoveryAttempted { .. } => "agent:recovery-attempted",
            Self::AgentAllLimited { .. } => "agent:all-limited",
            Self::SubagentUpdate { .. } => "subagent:update",
            Self::MainSyncSucceeded { .. } => "main-sync-succeeded",
            Self::MainSyncFailed { .. } => "main-sync-failed",
            Self::MainSyncRetrying { .. } => "main-sync-retrying",
            Self::MainSyncAlert { .. } => "main-sync-alert",
            Self::MergeQueued { .. } => "parallel:merge-queued",
            Self::MergeSucceeded { .. } => "parallel:merge-succeeded",
            Self::MergeFailed { .. } => "parallel:merge-failed",
            Self::TaskClaimed { .. } => "parallel:task-claimed",
            Self::WorkerStarted { .. } => "parallel:worker-started",
            Self::WorkerFinished { .. } => "parallel:worker-finished",
            Self::AllComplete => "all:complete",
            Self::TrackerStatus { .. } => "tracker:status",
            Self::EngineError { .. } => "engine:error",
        }
    }

    /// Task id carried by the event, when there is one.
    pub fn task_id(&self) -> Option<&str> {
        match self {
            Self::TaskSelected { task, .. } => Some(task.id.as_str()),
            Self::TaskActivated { task_id }
            | Self::TaskCompleted { task_id, .. }
            | Self::TaskBlocked { task_id, .. }
            | Self::TaskReopened { task_id, .. }
            | Self::TaskSkipped { task_id, .. }
            | Self::IterationStarted { task_id, .. }
            | Self::IterationCompleted { task_id, .. }
            | Self::IterationFailed { task_id, .. }
            | Self::CommitRecovery { task_id, .. }
            | Self::MergeQueued { task_id, .. }
            | Self::MergeSucceeded { task_id, .. }
            | Self::MergeFailed { task_id, .. }
            | Self::TaskClaimed { task_id, .. }
            | Self::WorkerStarted { task_id, .. }
            | Self::WorkerFinished { task_id, .. } => Some(task_id.as_str()),
            Self::EngineError { task_id, .. } => task_id.as_deref(),
            _ => None,
        }
    }
}

pub type Listener = Arc<dyn Fn(&EngineEvent) + Send + Sync>;

type ListenerMap = Mutex<HashMap<u64, Listener>>;

/// Fan-out publisher. Subscriptions deregister on drop.
#[derive(Clone, Default)]
pub struct EventBus {
    listeners: Arc<ListenerMap>,
    next_id: Arc<AtomicU64>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener; keep the returned subscription alive for as long
    /// as events should be delivered.
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&EngineEvent) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, Arc::new(listener));
        Subscription {
            listeners: Arc::downgrade(&self.listeners),
            id,
        }
    }

    /// Publish one event to every listener. A panicking listener is logged
    /// and skipped; delivery to the others continues.
    pub fn emit(&self, event: EngineEvent) {
        let snapshot: Vec<(u64, Listener)> = {
            let listeners = self.listeners.lock().unwrap_or_else(|e| e.into_inner());
            listeners.iter().map(|(id, l)| (*id, Arc::clone(l))).collect()
        };
        for (id, listener) in snapshot {
            let result = catch_unwind(AssertUnwindSafe(|| listener(&event)));
            if result.is_err() {
                warn!(
                    category = "events",
                    listener = id,
                    event = event.name(),
                    "Event listener panicked; continuing"
                );
            }
        }
    }

    pub fn listener_count(&self) -> usize {
        self.listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}

/// Disposer handle returned by [`EventBus::subscribe`].
pub struct Subscription {
    listeners: Weak<ListenerMap>,
    id: u64,
}

impl Subscription {
    /// Deregister now instead of waiting for drop.
    pub fn dispose(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(listeners) = self.listeners.upgrade() {
            listeners
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&self.id);
        }
    }
}
