//! JSON-file tracker backend.
//!
//! File-backed [`Tracker`]: a single `tasks.json` document, rewritten
//! atomically on every mutation. Small enough for tests, real enough to
//! drive the engine end to end.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;

use crate::capability::{ClaimOutcome, ReleaseOutcome, TaskFilter, Tracker, TrackerMeta};
use crate::error::{Result, TrackerError};
use crate::task::{PendingMain, Task, TaskStatus};

/// Sibling file holding an optional prompt template.
const TEMPLATE_FILE: &str = "prompt-template.md";

#[derive(Debug, Default, Serialize, Deserialize)]
struct Store {
    #[serde(default)]
    tasks: Vec<Task>,
}

pub struct JsonTracker {
    path: PathBuf,
    store: Mutex<Store>,
    template: Option<String>,
    prd_context: Option<String>,
}

impl JsonTracker {
    /// Open (or create) a tracker store at the given path.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let store = Self::read_store(&path)?;
        let template = path
            .parent()
            .map(|dir| dir.join(TEMPLATE_FILE))
            .and_then(|p| std::fs::read_to_string(p).ok());
        let prd_context = path
            .parent()
            .map(|dir| dir.join("prd.md"))
            .and_then(|p| std::fs::read_to_string(p).ok());
        Ok(Self {
            path,
            store: Mutex::new(store),
            template,
            prd_context,
        })
    }

    /// Seed the store with tasks, replacing any existing content.
    pub async fn seed(&self, tasks: Vec<Task>) -> Result<()> {
        let mut store = self.store.lock().await;
        store.tasks = tasks;
        self.persist(&store)
    }

    fn read_store(path: &Path) -> Result<Store> {
        if !path.exists() {
            return Ok(Store::default());
        }
        let content =
            std::fs::read_to_string(path).map_err(|e| TrackerError::PersistenceRead {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?;
        serde_json::from_str(&content).map_err(|e| TrackerError::PersistenceRead {
            path: path.display().to_string(),
            reason: e.to_string(),
        })
    }

    fn persist(&self, store: &Store) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(store)?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, format!("{json}\n")).map_err(|e| TrackerError::PersistenceWrite {
            path: tmp.display().to_string(),
            reason: e.to_string(),
        })?;
        std::fs::rename(&tmp, &self.path).map_err(|e| TrackerError::PersistenceWrite {
            path: self.path.display().to_string(),
            reason: e.to_string(),
        })
    }

    fn matches(task: &Task, filter: &TaskFilter) -> bool {
        if !filter.statuses.is_empty() && !filter.statuses.contains(&task.status) {
            return false;
        }
        !filter.exclude_ids.iter().any(|id| id == &task.id)
    }
}

#[async_trait]
impl Tracker for JsonTracker {
    fn meta(&self) -> TrackerMeta {
        TrackerMeta {
            id: "json".to_string(),
            name: "JSON file tracker".to_string(),
        }
    }

    async fn sync(&self) -> Result<()> {
        let fresh = Self::read_store(&self.path)?;
        let mut store = self.store.lock().await;
        *store = fresh;
        Ok(())
    }

    async fn get_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>> {
        let store = self.store.lock().await;
        Ok(store
            .tasks
            .iter()
            .filter(|t| Self::matches(t, filter))
            .cloned()
            .collect())
    }

    async fn get_next_task(&self, filter: &TaskFilter) -> Result<Option<Task>> {
        let store = self.store.lock().await;

        // Resume in-flight work before starting anything new.
        if let Some(task) = store
            .tasks
            .iter()
            .find(|t| t.status == TaskStatus::InProgress && Self::matches(t, filter))
        {
            return Ok(Some(task.clone()));
        }

        let mut open: Vec<&Task> = store
            .tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Open && Self::matches(t, filter))
            .collect();
        open.sort_by(|a, b| {
            b.priority
                .unwrap_or(0)
                .cmp(&a.priority.unwrap_or(0))
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(open.first().map(|t| (*t).clone()))
    }

    async fn update_task_status(&self, id: &str, status: TaskStatus) -> Result<()> {
        let mut store = self.store.lock().await;
        let task = store
            .tasks
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or_else(|| TrackerError::TaskNotFound { id: id.to_string() })?;
        debug!(
            category = "tracker",
            task = id,
            from = %task.status,
            to = %status,
            "Task status change"
        );
        task.status = status;
        if status != TaskStatus::InProgress {
            task.metadata.remove("assignee");
        }
        self.persist(&store)
    }

    async fn complete_task(&self, id: &str, reason: &str) -> Result<()> {
        let mut store = self.store.lock().await;
        let task = store
            .tasks
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or_else(|| TrackerError::TaskNotFound { id: id.to_string() })?;
        task.status = TaskStatus::Completed;
        task.metadata.remove("assignee");
        task.metadata.insert(
            "completion_reason".to_string(),
            serde_json::Value::String(reason.to_string()),
        );
        self.persist(&store)
    }

    async fn is_complete(&self) -> Result<bool> {
        let store = self.store.lock().await;
        Ok(!store
            .tasks
            .iter()
            .any(|t| matches!(t.status, TaskStatus::Open | TaskStatus::InProgress)))
    }

    async fn claim_task(&self, id: &str, worker_id: &str) -> Result<ClaimOutcome> {
        let mut store = self.store.lock().await;
        let task = store
            .tasks
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or_else(|| TrackerError::TaskNotFound { id: id.to_string() })?;

        match task.status {
            TaskStatus::Open => {
                task.status = TaskStatus::InProgress;
                task.metadata.insert(
                    "assignee".to_string(),
                    serde_json::Value::String(worker_id.to_string()),
                );
                self.persist(&store)?;
                Ok(ClaimOutcome::Claimed)
            }
            _ => Ok(ClaimOutcome::Contended),
        }
    }

    async fn release_task(&self, id: &str, reason: &str) -> Result<ReleaseOutcome> {
        let mut store = self.store.lock().await;
        let task = store
            .tasks
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or_else(|| TrackerError::TaskNotFound { id: id.to_string() })?;
        debug!(category = "tracker", task = id, reason, "Task released");
        task.status = TaskStatus::Open;
        task.metadata.remove("assignee");
        self.persist(&store)?;
        Ok(ReleaseOutcome::Released)
    }

    async fn mark_task_pending_main(
        &self,
        id: &str,
        commit_count: usize,
        commits: &[String],
    ) -> Result<()> {
        let mut store = self.store.lock().await;
        let task = store
            .tasks
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or_else(|| TrackerError::TaskNotFound { id: id.to_string() })?;
        task.metadata.insert(
            "pending_main".to_string(),
            serde_json::to_value(PendingMain {
                commit_count,
                commits: commits.to_vec(),
            })?,
        );
        self.persist(&store)
    }

    async fn clear_pending_main(&self, id: &str, reason: &str) -> Result<()> {
        let mut store = self.store.lock().await;
        let task = store
            .tasks
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or_else(|| TrackerError::TaskNotFound { id: id.to_string() })?;
        debug!(category = "tracker", task = id, reason, "Pending-main cleared");
        task.metadata.remove("pending_main");
        self.persist(&store)
    }

    fn template(&self) -> Option<String> {
        self.template.clone()
    }

    fn prd_context(&self) -> Option<String> {
        self.prd_context.clone()
    }

    fn persistence_path(&self) -> Option<PathBuf> {
        Some(self.path.clone())
    }
}
