//! Resume-time reconciliation.
//!
//! A task marked completed is only trusted if a commit mentioning its id is
//! an ancestor of the integration branch. Anything else either gets
//! reopened or recorded as a dry-run finding.

use std::fmt::Write as _;
use std::sync::Arc;

use tracing::info;

use ralph_tracker::{TaskFilter, TaskStatus, Tracker};

use crate::error::Result;
use crate::git::Repository;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileDisposition {
    /// A commit for the task is an ancestor of the integration branch.
    Verified,
    Reopened,
    /// Would have been reopened, but `should_reopen` was off.
    SkippedDryRun,
}

#[derive(Debug, Clone)]
pub struct ReconcileAction {
    pub task_id: String,
    pub title: String,
    pub disposition: ReconcileDisposition,
    pub detail: String,
}

#[derive(Debug, Clone, Default)]
pub struct ReconcileReport {
    pub actions: Vec<ReconcileAction>,
}

impl ReconcileReport {
    pub fn verified(&self) -> usize {
        self.count(ReconcileDisposition::Verified)
    }

    pub fn reopened(&self) -> usize {
        self.count(ReconcileDisposition::Reopened)
    }

    fn count(&self, disposition: ReconcileDisposition) -> usize {
        self.actions
            .iter()
            .filter(|a| a.disposition == disposition)
            .count()
    }

    /// Human-readable summary for the CLI.
    pub fn render(&self) -> String {
        if self.actions.is_empty() {
            return "Reconciliation: no completed tasks to verify.\n".to_string();
        }
        let mut out = format!(
            "Reconciliation: {} verified, {} reopened, {} skipped (dry run)\n",
            self.verified(),
            self.reopened(),
            self.count(ReconcileDisposition::SkippedDryRun),
        );
        for action in &self.actions {
            let marker = match action.disposition {
                ReconcileDisposition::Verified => "ok",
                ReconcileDisposition::Reopened => "reopened",
                ReconcileDisposition::SkippedDryRun => "dry-run",
            };
            let _ = writeln!(
                out,
                "  [{marker}] {} {} — {}",
                action.task_id, action.title, action.detail
            );
        }
        out
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ReconcileOptions {
    pub should_reopen: bool,
}

/// Verify each completed task against the integration branch.
pub async fn reconcile(
    repo: &Repository,
    tracker: &Arc<dyn Tracker>,
    integration_branch: &str,
    opts: ReconcileOptions,
) -> Result<ReconcileReport> {
    let completed = tracker
        .get_tasks(&TaskFilter::with_statuses(&[TaskStatus::Completed]))
        .await?;

    let mut report = ReconcileReport::default();
    for task in completed {
        let commits = repo.log_grep_all(&task.id).await?;

        let mut verified_by = None;
        for commit in &commits {
            if repo.is_ancestor(commit, integration_branch).await? {
                verified_by = Some(commit.clone());
                break;
            }
        }

        let action = match verified_by {
            Some(commit) => ReconcileAction {
                task_id: task.id.clone(),
                title: task.title.clone(),
                disposition: ReconcileDisposition::Verified,
                detail: format!("commit {} is on {}", &commit[..12.min(commit.len())], integration_branch),
            },
            None => {
                let detail = if commits.is_empty() {
                    "no commit mentions this task".to_string()
                } else {
                    format!(
                        "{} commit(s) found but none on {}",
                        commits.len(),
                        integration_branch
                    )
                };
                if opts.should_reopen {
                    tracker
                        .update_task_status(&task.id, TaskStatus::Open)
                        .await?;
                    info!(
                        category = "reconcile",
                        task = task.id.as_str(),
                        "Completed task reopened"
                    );
                    ReconcileAction {
                        task_id: task.id.clone(),
                        title: task.title.clone(),
                        disposition: ReconcileDisposition::Reopened,
                        detail,
                    }
                } else {
                    ReconcileAction {
                        task_id: task.id.clone(),
                        title: task.title.clone(),
                        disposition: ReconcileDisposition::SkippedDryRun,
                        detail,
                    }
                }
            }
        };
        report.actions.push(action);
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{commit_file, init_repo};
    use ralph_tracker::{JsonTracker, Task};

    async fn tracker_with(dir: &std::path::Path, tasks: Vec<Task>) -> Arc<dyn Tracker> {
        let tracker = Arc::new(JsonTracker::open(dir.join("tasks.json")).unwrap());
        tracker.seed(tasks).await.unwrap();
        tracker
    }

    fn completed(id: &str, title: &str) -> Task {
        let mut task = Task::new(id, title);
        task.status = TaskStatus::Completed;
        task
    }

    #[tokio::test]
    async fn test_verified_task_untouched() {
        let temp = tempfile::TempDir::new().unwrap();
        let repo = init_repo(temp.path()).await;
        commit_file(&repo, temp.path(), "a.txt", "a", "T1: add a").await;

        let tracker = tracker_with(temp.path(), vec![completed("T1", "Add a")]).await;
        let report = reconcile(
            &repo,
            &tracker,
            "main",
            ReconcileOptions {
                should_reopen: true,
            },
        )
        .await
        .unwrap();

        assert_eq!(report.verified(), 1);
        assert_eq!(report.reopened(), 0);
        let tasks = tracker
            .get_tasks(&TaskFilter::default())
            .await
            .unwrap();
        assert_eq!(tasks[0].status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn test_unverified_task_reopened() {
        let temp = tempfile::TempDir::new().unwrap();
        let repo = init_repo(temp.path()).await;

        let tracker = tracker_with(temp.path(), vec![completed("T9", "Ghost work")]).await;
        let report = reconcile(
            &repo,
            &tracker,
            "main",
            ReconcileOptions {
                should_reopen: true,
            },
        )
        .await
        .unwrap();

        assert_eq!(report.reopened(), 1);
        let tasks = tracker.get_tasks(&TaskFilter::default()).await.unwrap();
        assert_eq!(tasks[0].status, TaskStatus::Open);
        assert!(report.render().contains("no commit mentions this task"));
    }

    #[tokio::test]
    async fn test_dry_run_records_only() {
        let temp = tempfile::TempDir::new().unwrap();
        let repo = init_repo(temp.path()).await;

        let tracker = tracker_with(temp.path(), vec![completed("T9", "Ghost work")]).await;
        let report = reconcile(&repo, &tracker, "main", ReconcileOptions::default())
            .await
            .unwrap();

        assert_eq!(report.reopened(), 0);
        assert_eq!(report.actions.len(), 1);
        assert_eq!(
            report.actions[0].disposition,
            ReconcileDisposition::SkippedDryRun
        );
        let tasks = tracker.get_tasks(&TaskFilter::default()).await.unwrap();
        assert_eq!(tasks[0].status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn test_commit_off_branch_not_verified() {
        let temp = tempfile::TempDir::new().unwrap();
        let repo = init_repo(temp.path()).await;
        let main_head = repo.head_commit().await.unwrap();

        // Commit mentioning the task exists only on a side branch.
        crate::process::git_ok(temp.path(), &["checkout", "-b", "side", &main_head])
            .await
            .unwrap();
        commit_file(&repo, temp.path(), "b.txt", "b", "T5: stranded work").await;
        crate::process::git_ok(temp.path(), &["checkout", "main"])
            .await
            .unwrap();

        let tracker = tracker_with(temp.path(), vec![completed("T5", "Stranded")]).await;
        let report = reconcile(
            &repo,
            &tracker,
            "main",
            ReconcileOptions {
                should_reopen: true,
            },
        )
        .await
        .unwrap();

        assert_eq!(report.reopened(), 1);
        assert!(report.render().contains("none on main"));
    }
}
