//! Engine state: the single mutable snapshot readers observe.
//!
//! Only the engine task mutates state, through [`StateHandle::update`];
//! everything else gets copies via [`StateHandle::snapshot`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use ralph_agent::AgentResult;
use ralph_tracker::Task;

use crate::events::{IterationStatus, SwitchReason};

/// Engine lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineStatus {
    Idle,
    Running,
    Pausing,
    Paused,
    Stopping,
    Stopped,
    Error,
    Complete,
}

/// Which agent is currently executing, and why.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActiveAgent {
    pub plugin: String,
    pub reason: SwitchReason,
    pub since: DateTime<Utc>,
}

/// Rate-limit bookkeeping surfaced to the UI.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitState {
    pub primary_agent: String,
    pub limited_at: Option<DateTime<Utc>>,
    pub fallback_agent: Option<String>,
}

/// Last known state of one subagent, projected from parser events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubagentState {
    pub id: String,
    pub name: Option<String>,
    pub status: String,
    pub updated_at: DateTime<Utc>,
}

/// Record of one iteration. Retries get fresh, strictly increasing numbers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IterationResult {
    pub iteration: u64,
    pub status: IterationStatus,
    pub task: Task,
    pub agent_result: Option<AgentResult>,
    pub task_completed: bool,
    pub promise_complete: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// The engine's observable state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineState {
    pub status: EngineStatus,
    pub current_iteration: u64,
    pub current_task: Option<Task>,
    pub total_tasks: usize,
    pub tasks_completed: usize,
    pub iterations: Vec<IterationResult>,
    pub started_at: Option<DateTime<Utc>>,
    pub subagents: HashMap<String, SubagentState>,
    pub active_agent: Option<ActiveAgent>,
    pub rate_limit: Option<RateLimitState>,
    pub tracker_realtime_status: Option<String>,
}

impl Default for EngineState {
    fn default() -> Self {
        Self {
            status: EngineStatus::Idle,
            current_iteration: 0,
            current_task: None,
            total_tasks: 0,
            tasks_completed: 0,
            iterations: Vec::new(),
            started_at: None,
            subagents: HashMap::new(),
            active_agent: None,
            rate_limit: None,
            tracker_realtime_status: None,
        }
    }
}

/// Shared handle: one writer, snapshot readers.
#[derive(Clone, Default)]
pub struct StateHandle {
    inner: Arc<Mutex<EngineState>>,
}

impl StateHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy-on-read snapshot for external observers.
    pub fn snapshot(&self) -> EngineState {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Mutate under the lock. Only the owning engine task calls this.
    pub fn update<R>(&self, f: impl FnOnce(&mut EngineState) -> R) -> R {
        let mut state = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut state)
    }

    /// Advance and return the next iteration number. Strictly increasing
    /// within a run; retries never reuse a number.
    pub fn next_iteration(&self) -> u64 {
        self.update(|state| {
            state.current_iteration += 1;
            state.current_iteration
        })
    }

    pub fn record_iteration(&self, result: IterationResult) {
        self.update(|state| {
            if result.task_completed {
                state.tasks_completed += 1;
            }
            state.iterations.push(result);
        });
    }
}
