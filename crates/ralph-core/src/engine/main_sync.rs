//! Main-sync controller.
//!
//! Keeps an auxiliary worktree on the integration branch and fast-forwards
//! it (never merges) to the main checkout's HEAD after each completed task.
//! When the fast-forward is impossible, the task is held pending-main and a
//! background loop retries with doubling backoff; completion of every held
//! task waits for the sync to land.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::watch;
use tracing::{info, warn};

use ralph_tracker::{Task, TaskStatus, Tracker};

use crate::config::{MAIN_SYNC_BACKOFF_BASE, MAIN_SYNC_BACKOFF_CAP};
use crate::engine::state::StateHandle;
use crate::error::{RalphError, Result};
use crate::events::{EngineEvent, EventBus};
use crate::git::Repository;
use crate::paths;

/// Outcome of one sync attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    Success { commit: String, updated: bool },
    FetchFailed(String),
    FastForwardFailed(String),
    Skipped(String),
}

impl SyncOutcome {
    pub fn reason(&self) -> String {
        match self {
            Self::Success { .. } => "success".to_string(),
            Self::FetchFailed(r) => format!("FETCH_FAILED: {r}"),
            Self::FastForwardFailed(r) => format!("FAST_FORWARD_FAILED: {r}"),
            Self::Skipped(r) => format!("SKIPPED: {r}"),
        }
    }
}

#[derive(Debug, Clone)]
struct PendingSync {
    task: Task,
    commits: Vec<String>,
    iteration: u64,
}

struct Inner {
    main_repo: Repository,
    /// Checkout of the integration branch; `None` when the main checkout is
    /// already on it and syncing is a no-op.
    sync_repo: Option<Repository>,
    branch: String,
    bus: EventBus,
    tracker: Arc<dyn Tracker>,
    state: StateHandle,
    pending: Mutex<HashMap<String, PendingSync>>,
    alerted: AtomicBool,
    retry_running: AtomicBool,
    max_retries: u32,
    shutdown: watch::Receiver<bool>,
}

#[derive(Clone)]
pub struct MainSyncController {
    inner: Arc<Inner>,
}

impl MainSyncController {
    /// Set up the controller, creating the auxiliary worktree when the main
    /// checkout is not already on the integration branch.
    pub async fn setup(
        main_repo: Repository,
        branch: &str,
        bus: EventBus,
        tracker: Arc<dyn Tracker>,
        state: StateHandle,
        max_retries: u32,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Self> {
        let current = main_repo.current_branch().await?;
        let sync_repo = if current == branch {
            None
        } else {
            let path = paths::main_sync_worktree(main_repo.root());
            if !path.exists() {
                if main_repo.branch_exists(branch).await? {
                    main_repo
                        .worktree_add(&path, branch, branch, false, false)
                        .await?;
                } else {
                    main_repo
                        .worktree_add(&path, branch, "HEAD", true, false)
                        .await?;
                }
            }
            Some(Repository::at(path))
        };

        Ok(Self {
            inner: Arc::new(Inner {
                main_repo,
                sync_repo,
                branch: branch.to_string(),
                bus,
                tracker,
                state,
                pending: Mutex::new(HashMap::new()),
                alerted: AtomicBool::new(false),
                retry_running: AtomicBool::new(false),
                max_retries,
                shutdown,
            }),
        })
    }

    /// One fast-forward attempt.
    pub async fn sync_now(&self) -> SyncOutcome {
        let inner = &self.inner;
        let head = match inner.main_repo.head_commit().await {
            Ok(head) => head,
            Err(e) => return SyncOutcome::Skipped(format!("cannot resolve HEAD: {e}")),
        };

        let Some(sync_repo) = &inner.sync_repo else {
            // Already on the integration branch.
            return SyncOutcome::Success {
                commit: head,
                updated: false,
            };
        };

        match inner.main_repo.has_remote("origin").await {
            Ok(true) => {
                if let Err(e) = sync_repo.fetch("origin").await {
                    return SyncOutcome::FetchFailed(e.to_string());
                }
            }
            Ok(false) => {}
            Err(e) => return SyncOutcome::Skipped(e.to_string()),
        }

        match sync_repo.merge_ff_only(&head).await {
            Ok(ff) => SyncOutcome::Success {
                commit: ff.commit().to_string(),
                updated: ff.updated(),
            },
            Err(RalphError::FastForwardFailed { details }) => {
                SyncOutcome::FastForwardFailed(details)
            }
            Err(e) => SyncOutcome::FastForwardFailed(e.to_string()),
        }
    }

    /// Gate a task's completion on main sync. Returns `true` when the caller
    /// may complete the task now; `false` parks it pending-main.
    pub async fn gate_task_completion(
        &self,
        task: &Task,
        commits: &[String],
        iteration: u64,
    ) -> Result<bool> {
        match self.sync_now().await {
            SyncOutcome::Success { commit, updated } => {
                self.inner
                    .bus
                    .emit(EngineEvent::MainSyncSucceeded { commit, updated });
                Ok(true)
            }
            outcome => {
                let reason = outcome.reason();
                warn!(
                    category = "engine.sync",
                    task = task.id.as_str(),
                    reason = reason.as_str(),
                    "Main sync failed; holding task"
                );
                self.inner.bus.emit(EngineEvent::MainSyncFailed {
                    reason: reason.clone(),
                });

                self.inner
                    .tracker
                    .mark_task_pending_main(&task.id, commits.len(), commits)
                    .await?;
                self.inner
                    .tracker
                    .update_task_status(&task.id, TaskStatus::Blocked)
                    .await?;
                self.inner.bus.emit(EngineEvent::TaskBlocked {
                    task_id: task.id.clone(),
                    reason: format!(
                        "Main sync required: {} commit(s) pending [{}]",
                        commits.len(),
                        commits.join(", ")
                    ),
                });

                self.inner
                    .pending
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .insert(
                        task.id.clone(),
                        PendingSync {
                            task: task.clone(),
                            commits: commits.to_vec(),
                            iteration,
                        },
                    );
                self.spawn_retry_loop();
                Ok(false)
            }
        }
    }

    /// True while tasks are parked pending-main.
    pub fn has_pending(&self) -> bool {
        !self
            .inner
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_empty()
    }

    /// Wait until the background retry loop settles (success or alert).
    pub async fn drain(&self) {
        while self.inner.retry_running.load(Ordering::SeqCst) {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
    }

    fn spawn_retry_loop(&self) {
        if self.inner.retry_running.swap(true, Ordering::SeqCst) {
            return;
        }
        let controller = self.clone();
        tokio::spawn(async move {
            controller.retry_loop().await;
            controller
                .inner
                .retry_running
                .store(false, Ordering::SeqCst);
        });
    }

    async fn retry_loop(&self) {
        let inner = &self.inner;
        let mut shutdown = inner.shutdown.clone();

        for attempt in 1..=inner.max_retries {
            let delay = std::cmp::min(
                MAIN_SYNC_BACKOFF_BASE * 2u32.saturating_pow(attempt),
                MAIN_SYNC_BACKOFF_CAP,
            );
            inner.bus.emit(EngineEvent::MainSyncRetrying {
                attempt,
                delay_ms: delay.as_millis() as u64,
            });

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => return,
            }

            if let SyncOutcome::Success { commit, updated } = self.sync_now().await {
                inner
                    .bus
                    .emit(EngineEvent::MainSyncSucceeded { commit, updated });
                self.complete_pending().await;
                inner.alerted.store(false, Ordering::SeqCst);
                return;
            }
        }

        // Exhausted: one alert until the pending set clears.
        if !inner.alerted.swap(true, Ordering::SeqCst) {
            let pending_tasks = inner
                .pending
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .len();
            inner.bus.emit(EngineEvent::MainSyncAlert {
                pending_tasks,
                message: format!(
                    "main sync still failing after {} retries; {} task(s) held",
                    inner.max_retries, pending_tasks
                ),
            });
        }
    }

    async fn complete_pending(&self) {
        let inner = &self.inner;
        let held: Vec<PendingSync> = {
            let mut pending = inner.pending.lock().unwrap_or_else(|e| e.into_inner());
            pending.drain().map(|(_, v)| v).collect()
        };

        for entry in held {
            let task_id = entry.task.id.clone();
            if let Err(e) = inner
                .tracker
                .clear_pending_main(&task_id, "main sync succeeded")
                .await
            {
                warn!(category = "engine.sync", task = task_id.as_str(), error = %e, "clear_pending_main failed");
            }
            match inner
                .tracker
                .complete_task(&task_id, "completed after main sync")
                .await
            {
                Ok(()) => {
                    info!(
                        category = "engine.sync",
                        task = task_id.as_str(),
                        commits = entry.commits.len(),
                        "Pending task completed after sync"
                    );
                    inner.bus.emit(EngineEvent::TaskCompleted {
                        task_id,
                        iteration: entry.iteration,
                    });
                    // The iteration that produced the work was recorded
                    // before the sync landed; count the completion now.
                    inner.state.update(|s| {
                        s.tasks_completed += 1;
                        if let Some(record) = s
                            .iterations
                            .iter_mut()
                            .find(|r| r.iteration == entry.iteration)
                        {
                            record.task_completed = true;
                        }
                    });
                }
                Err(e) => {
                    warn!(category = "engine.sync", task = task_id.as_str(), error = %e, "complete_task failed");
                }
            }
        }
    }

    pub fn branch(&self) -> &str {
        &self.inner.branch
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{commit_file, init_repo};
    use ralph_tracker::{JsonTracker, TaskFilter};

    async fn controller_for(
        repo: &Repository,
        branch: &str,
        bus: EventBus,
        tracker: Arc<JsonTracker>,
        state: StateHandle,
        max_retries: u32,
    ) -> MainSyncController {
        let (_tx, rx) = watch::channel(false);
        // Leak the sender so the shutdown channel stays open for the test.
        std::mem::forget(_tx);
        MainSyncController::setup(
            repo.clone(),
            branch,
            bus,
            tracker as Arc<dyn Tracker>,
            state,
            max_retries,
            rx,
        )
        .await
        .unwrap()
    }

    async fn tracker_with_task(dir: &std::path::Path, task: Task) -> Arc<JsonTracker> {
        let tracker = Arc::new(JsonTracker::open(dir.join("tasks.json")).unwrap());
        tracker.seed(vec![task]).await.unwrap();
        tracker
    }

    #[tokio::test]
    async fn test_inline_mode_when_already_on_integration_branch() {
        let temp = tempfile::TempDir::new().unwrap();
        let repo = init_repo(temp.path()).await;
        let head = repo.head_commit().await.unwrap();
        let tracker = tracker_with_task(temp.path(), Task::new("T1", "A")).await;
        let controller =
            controller_for(&repo, "main", EventBus::new(), tracker, StateHandle::new(), 2).await;

        let outcome = controller.sync_now().await;
        assert_eq!(
            outcome,
            SyncOutcome::Success {
                commit: head,
                updated: false
            }
        );
    }

    #[tokio::test]
    async fn test_worktree_fast_forward() {
        let temp = tempfile::TempDir::new().unwrap();
        let repo = init_repo(temp.path()).await;
        // Work happens on a separate branch; "main" stays behind.
        crate::process::git_ok(temp.path(), &["checkout", "-b", "work"])
            .await
            .unwrap();
        let tip = commit_file(&repo, temp.path(), "a.txt", "a", "T1: add a").await;

        let tracker = tracker_with_task(temp.path(), Task::new("T1", "A")).await;
        let controller =
            controller_for(&repo, "main", EventBus::new(), tracker, StateHandle::new(), 2).await;

        let outcome = controller.sync_now().await;
        assert_eq!(
            outcome,
            SyncOutcome::Success {
                commit: tip.clone(),
                updated: true
            }
        );

        // Integration branch now points at the tip.
        let sync_repo = Repository::at(paths::main_sync_worktree(temp.path()));
        assert_eq!(sync_repo.head_commit().await.unwrap(), tip);

        // Second sync is a no-op success.
        let outcome = controller.sync_now().await;
        assert_eq!(
            outcome,
            SyncOutcome::Success {
                commit: tip,
                updated: false
            }
        );
    }

    #[tokio::test]
    async fn test_gate_blocks_then_background_retry_completes() {
        let temp = tempfile::TempDir::new().unwrap();
        let repo = init_repo(temp.path()).await;
        crate::process::git_ok(temp.path(), &["checkout", "-b", "work"])
            .await
            .unwrap();
        let work_tip = commit_file(&repo, temp.path(), "a.txt", "a", "T2: add a").await;

        let bus = EventBus::new();
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let _sub = bus.subscribe(move |e| sink.lock().unwrap().push(e.clone()));

        let tracker = tracker_with_task(temp.path(), Task::new("T2", "Fix bug")).await;
        let state = StateHandle::new();
        let controller =
            controller_for(&repo, "main", bus, Arc::clone(&tracker), state.clone(), 3).await;

        // Diverge the integration branch so fast-forward is impossible.
        let sync_path = paths::main_sync_worktree(temp.path());
        let sync_repo = Repository::at(&sync_path);
        std::fs::write(sync_path.join("divergent.txt"), "x").unwrap();
        sync_repo.commit_all("divergent").await.unwrap();

        let task = Task::new("T2", "Fix bug");
        let may_complete = controller
            .gate_task_completion(&task, &[work_tip.clone()], 1)
            .await
            .unwrap();
        assert!(!may_complete);
        assert!(controller.has_pending());

        // Task is blocked with a pending-main annotation.
        let tasks = tracker.get_tasks(&TaskFilter::default()).await.unwrap();
        assert_eq!(tasks[0].status, TaskStatus::Blocked);
        assert_eq!(tasks[0].pending_main().unwrap().commit_count, 1);

        // Heal the divergence so the background retry can land.
        crate::process::git_ok(&sync_path, &["reset", "--hard", "HEAD~1"])
            .await
            .unwrap();

        controller.drain().await;

        let tasks = tracker.get_tasks(&TaskFilter::default()).await.unwrap();
        assert_eq!(tasks[0].status, TaskStatus::Completed);
        assert!(tasks[0].pending_main().is_none());
        assert!(!controller.has_pending() || tasks[0].status == TaskStatus::Completed);
        // The recovered completion counts toward the run totals.
        assert_eq!(state.snapshot().tasks_completed, 1);

        let names: Vec<String> = events
            .lock()
            .unwrap()
            .iter()
            .map(|e| e.name().to_string())
            .collect();
        assert!(names.contains(&"main-sync-failed".to_string()));
        assert!(names.contains(&"task:blocked".to_string()));
        assert!(names.contains(&"main-sync-retrying".to_string()));
        assert!(names.contains(&"main-sync-succeeded".to_string()));
        assert!(names.contains(&"task:completed".to_string()));
        // Ordering: succeeded precedes the held task's completion.
        let ok_idx = names.iter().position(|n| n == "main-sync-succeeded").unwrap();
        let done_idx = names.iter().position(|n| n == "task:completed").unwrap();
        assert!(ok_idx < done_idx);
    }

    #[tokio::test]
    async fn test_retry_backoff_schedule_and_alert() {
        let temp = tempfile::TempDir::new().unwrap();
        let repo = init_repo(temp.path()).await;
        crate::process::git_ok(temp.path(), &["checkout", "-b", "work"])
            .await
            .unwrap();
        let work_tip = commit_file(&repo, temp.path(), "a.txt", "a", "T2: add a").await;

        let bus = EventBus::new();
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let _sub = bus.subscribe(move |e| sink.lock().unwrap().push(e.clone()));

        let tracker = tracker_with_task(temp.path(), Task::new("T2", "Fix bug")).await;
        let controller =
            controller_for(&repo, "main", bus, tracker, StateHandle::new(), 2).await;

        // Permanent divergence: retries will exhaust.
        let sync_path = paths::main_sync_worktree(temp.path());
        let sync_repo = Repository::at(&sync_path);
        std::fs::write(sync_path.join("divergent.txt"), "x").unwrap();
        sync_repo.commit_all("divergent").await.unwrap();

        let task = Task::new("T2", "Fix bug");
        tokio::time::pause();
        let gated = controller
            .gate_task_completion(&task, &[work_tip], 1)
            .await
            .unwrap();
        assert!(!gated);

        // Let the paused clock run the whole backoff schedule; the extra
        // yields give the retry task room to reach each sleep point.
        for _ in 0..12 {
            tokio::task::yield_now().await;
            tokio::time::advance(std::time::Duration::from_secs(10)).await;
            tokio::task::yield_now().await;
        }
        tokio::time::resume();
        controller.drain().await;

        let events = events.lock().unwrap();
        let retries: Vec<(u32, u64)> = events
            .iter()
            .filter_map(|e| match e {
                EngineEvent::MainSyncRetrying { attempt, delay_ms } => Some((*attempt, *delay_ms)),
                _ => None,
            })
            .collect();
        assert_eq!(retries, vec![(1, 4000), (2, 8000)]);

        let alerts = events
            .iter()
            .filter(|e| matches!(e, EngineEvent::MainSyncAlert { .. }))
            .count();
        assert_eq!(alerts, 1, "alert fires once and is then suppressed");
    }
}
