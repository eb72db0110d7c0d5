//! Worktree record types.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Health of one registered worktree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorktreeHealth {
    Active,
    Locked,
    /// Registered but the directory is gone.
    Stale,
    Prunable,
}

/// One worktree as seen by `list`/`health_summary`.
#[derive(Debug, Clone)]
pub struct WorktreeRecord {
    pub path: PathBuf,
    pub branch: Option<String>,
    pub commit: String,
    pub locked: bool,
    pub lock_reason: Option<String>,
    pub health: WorktreeHealth,
}

/// Counts per health state. The main checkout is excluded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HealthSummary {
    pub active: usize,
    pub locked: usize,
    pub stale: usize,
    pub prunable: usize,
}

impl HealthSummary {
    pub fn total(&self) -> usize {
        self.active + self.locked + self.stale + self.prunable
    }
}

/// Request to create one worker worktree.
#[derive(Debug, Clone)]
pub struct CreateWorktreeRequest {
    pub worker_id: String,
    pub base_ref: String,
    pub lock_reason: Option<String>,
}

impl CreateWorktreeRequest {
    pub fn new(worker_id: impl Into<String>, base_ref: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            base_ref: base_ref.into(),
            lock_reason: None,
        }
    }

    pub fn locked(mut self, reason: impl Into<String>) -> Self {
        self.lock_reason = Some(reason.into());
        self
    }
}

/// A successfully created worker worktree.
#[derive(Debug, Clone)]
pub struct WorkerWorktree {
    pub worker_id: String,
    pub path: PathBuf,
    pub branch: String,
    pub commit: String,
}
