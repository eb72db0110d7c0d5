//! Task data model shared between trackers and the engine.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Lifecycle status of a tracked task.
///
/// Only the engine writes `in_progress`; a task it abandons (skip, abort,
/// interrupt) must be reset to `open`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Open,
    InProgress,
    Completed,
    Blocked,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Blocked => "blocked",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A tracked unit of work, as supplied by a tracker backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<i32>,
    /// Opaque backend extras. Known keys: `impact_plan`, `pending_main`,
    /// `assignee`.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, Value>,
}

impl Task {
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            description: String::new(),
            status: TaskStatus::Open,
            priority: None,
            metadata: HashMap::new(),
        }
    }

    /// The structured impact plan, when the backend supplied one.
    pub fn impact_plan(&self) -> Option<ImpactPlan> {
        let value = self.metadata.get("impact_plan")?;
        serde_json::from_value(value.clone()).ok()
    }

    /// The pending-main annotation, when present.
    pub fn pending_main(&self) -> Option<PendingMain> {
        let value = self.metadata.get("pending_main")?;
        serde_json::from_value(value.clone()).ok()
    }
}

/// A rename the task intends to perform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenameEntry {
    pub from: String,
    pub to: String,
}

/// Structured declaration of the files a task intends to touch and the
/// validation checks it expects to pass. Rendered as a required table inside
/// parallel prompts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ImpactPlan {
    pub create: Vec<String>,
    pub modify: Vec<String>,
    pub delete: Vec<String>,
    pub rename: Vec<RenameEntry>,
    pub expected_checks: Vec<String>,
    pub module_tags: Vec<String>,
}

impl ImpactPlan {
    pub fn is_empty(&self) -> bool {
        self.create.is_empty()
            && self.modify.is_empty()
            && self.delete.is_empty()
            && self.rename.is_empty()
    }

    /// All (path, change) pairs, in render order.
    pub fn entries(&self) -> Vec<(String, String)> {
        let mut entries = Vec::new();
        for path in &self.create {
            entries.push((path.clone(), "create".to_string()));
        }
        for path in &self.modify {
            entries.push((path.clone(), "modify".to_string()));
        }
        for path in &self.delete {
            entries.push((path.clone(), "delete".to_string()));
        }
        for rename in &self.rename {
            entries.push((
                format!("{} -> {}", rename.from, rename.to),
                "rename".to_string(),
            ));
        }
        entries
    }
}

/// Annotation for tasks whose work is committed locally but not yet
/// fast-forwarded onto the integration branch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingMain {
    pub commit_count: usize,
    pub commits: Vec<String>,
}
