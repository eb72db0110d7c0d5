//! The Tracker capability trait.

use std::path::PathBuf;

use async_trait::async_trait;

use crate::error::Result;
use crate::task::{Task, TaskStatus};

/// Static metadata describing a tracker backend.
#[derive(Debug, Clone)]
pub struct TrackerMeta {
    /// Stable plugin id (e.g. "beads", "json"). Used to gate event logs.
    pub id: String,
    pub name: String,
}

/// Filter for task queries.
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    /// Match any of these statuses; empty means all.
    pub statuses: Vec<TaskStatus>,
    /// Task ids to exclude (skipped or in-flight).
    pub exclude_ids: Vec<String>,
}

impl TaskFilter {
    pub fn with_statuses(statuses: &[TaskStatus]) -> Self {
        Self {
            statuses: statuses.to_vec(),
            exclude_ids: Vec::new(),
        }
    }

    pub fn excluding(mut self, ids: impl IntoIterator<Item = String>) -> Self {
        self.exclude_ids.extend(ids);
        self
    }
}

/// Result of an atomic claim attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    Claimed,
    /// Another worker holds the task.
    Contended,
    /// Backend has no claim support; callers fall back to a status
    /// transition.
    Unsupported,
}

/// Result of a release attempt. Release support is optional.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    Released,
    Unsupported,
}

/// Capability interface implemented by every tracker backend.
///
/// Mutations are serialized by the backend; concurrent reads are allowed.
#[async_trait]
pub trait Tracker: Send + Sync {
    fn meta(&self) -> TrackerMeta;

    /// Refresh cached state from the backing store.
    async fn sync(&self) -> Result<()>;

    async fn get_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>>;

    /// The next task the engine should work on, honoring the filter.
    async fn get_next_task(&self, filter: &TaskFilter) -> Result<Option<Task>>;

    async fn update_task_status(&self, id: &str, status: TaskStatus) -> Result<()>;

    async fn complete_task(&self, id: &str, reason: &str) -> Result<()>;

    /// True when no open or in-progress tasks remain.
    async fn is_complete(&self) -> Result<bool>;

    /// Atomically assign a task to a worker.
    async fn claim_task(&self, _id: &str, _worker_id: &str) -> Result<ClaimOutcome> {
        Ok(ClaimOutcome::Unsupported)
    }

    /// Release a previously claimed task.
    async fn release_task(&self, _id: &str, _reason: &str) -> Result<ReleaseOutcome> {
        Ok(ReleaseOutcome::Unsupported)
    }

    /// Record that a task's commits await integration-branch sync.
    async fn mark_task_pending_main(
        &self,
        id: &str,
        commit_count: usize,
        commits: &[String],
    ) -> Result<()>;

    /// Clear the pending-main annotation.
    async fn clear_pending_main(&self, id: &str, reason: &str) -> Result<()>;

    /// Prompt template owned by the tracker, when it has one.
    fn template(&self) -> Option<String> {
        None
    }

    /// Product-requirements context appended to prompts, when available.
    fn prd_context(&self) -> Option<String> {
        None
    }

    /// Path of the backing store, for the change watcher.
    fn persistence_path(&self) -> Option<PathBuf> {
        None
    }
}
