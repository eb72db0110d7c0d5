//! Merge queue: serialized cherry-picks onto the integration working tree.
//!
//! A single worker task owns the integration checkout. Each entry is one
//! commit from one worker; conflicts go through the auto-resolver (ephemeral
//! merge worktree, then a tightly scoped agent run) before the engine gives
//! up on them. Same-task commits are enqueued oldest-first and the task's
//! pending count gates its completion.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use ralph_agent::{Agent, ExecuteOptions};
use ralph_tracker::Task;

use crate::engine::prompt::contains_completion_sentinel;
use crate::error::{RalphError, Result};
use crate::events::{EngineEvent, EventBus};
use crate::git::Repository;
use crate::paths;

/// One commit awaiting integration.
#[derive(Debug, Clone)]
pub struct MergeEntry {
    pub task: Task,
    pub worker_id: String,
    pub commit: String,
    pub iteration: u64,
}

/// Result handed back to the coordinator per entry.
#[derive(Debug, Clone)]
pub struct MergeOutcome {
    pub task_id: String,
    pub worker_id: String,
    pub commit: String,
    pub iteration: u64,
    pub success: bool,
    pub reason: Option<String>,
    /// Merges still queued for the same task after this one.
    pub remaining_for_task: usize,
}

pub struct MergeQueue {
    tx: Option<mpsc::UnboundedSender<MergeEntry>>,
    pending_counts: Arc<Mutex<HashMap<String, usize>>>,
    handle: JoinHandle<()>,
}

impl MergeQueue {
    /// Spawn the serial merge worker over the integration checkout.
    pub fn spawn(
        repo: Repository,
        bus: EventBus,
        resolver_agent: Option<Arc<dyn Agent>>,
        outcome_tx: mpsc::UnboundedSender<MergeOutcome>,
    ) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<MergeEntry>();
        let pending_counts: Arc<Mutex<HashMap<String, usize>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let counts = Arc::clone(&pending_counts);

        let handle = tokio::spawn(async move {
            while let Some(entry) = rx.recv().await {
                bus.emit(EngineEvent::MergeQueued {
                    task_id: entry.task.id.clone(),
                    worker_id: entry.worker_id.clone(),
                    commit: entry.commit.clone(),
                });

                let result = process_entry(&repo, resolver_agent.as_ref(), &entry).await;

                let remaining = {
                    let mut counts = counts.lock().unwrap_or_else(|e| e.into_inner());
                    let slot = counts.entry(entry.task.id.clone()).or_insert(1);
                    *slot = slot.saturating_sub(1);
                    let remaining = *slot;
                    if remaining == 0 {
                        counts.remove(&entry.task.id);
                    }
                    remaining
                };

                let outcome = match result {
                    Ok(()) => {
                        info!(
                            category = "engine.merge",
                            task = entry.task.id.as_str(),
                            commit = entry.commit.as_str(),
                            "Merge succeeded"
                        );
                        bus.emit(EngineEvent::MergeSucceeded {
                            task_id: entry.task.id.clone(),
                            commit: entry.commit.clone(),
                        });
                        MergeOutcome {
                            task_id: entry.task.id.clone(),
                            worker_id: entry.worker_id.clone(),
                            commit: entry.commit.clone(),
                            iteration: entry.iteration,
                            success: true,
                            reason: None,
                            remaining_for_task: remaining,
                        }
                    }
                    Err(e) => {
                        warn!(
                            category = "engine.merge",
                            task = entry.task.id.as_str(),
                            commit = entry.commit.as_str(),
                            error = %e,
                            "Merge failed"
                        );
                        bus.emit(EngineEvent::MergeFailed {
                            task_id: entry.task.id.clone(),
                            commit: entry.commit.clone(),
                            reason: e.to_string(),
                        });
                        MergeOutcome {
                            task_id: entry.task.id.clone(),
                            worker_id: entry.worker_id.clone(),
                            commit: entry.commit.clone(),
                            iteration: entry.iteration,
                            success: false,
                            reason: Some(e.to_string()),
                            remaining_for_task: remaining,
                        }
                    }
                };
                let _ = outcome_tx.send(outcome);
            }
        });

        Self {
            tx: Some(tx),
            pending_counts,
            handle,
        }
    }

    /// Queue every commit of one task, oldest first (callers pass
    /// `rev-list --reverse` order).
    pub fn enqueue_task_commits(
        &self,
        task: &Task,
        worker_id: &str,
        commits: &[String],
        iteration: u64,
    ) {
        {
            let mut counts = self
                .pending_counts
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            *counts.entry(task.id.clone()).or_insert(0) += commits.len();
        }
        if let Some(tx) = &self.tx {
            for commit in commits {
                let _ = tx.send(MergeEntry {
                    task: task.clone(),
                    worker_id: worker_id.to_string(),
                    commit: commit.clone(),
                    iteration,
                });
            }
        }
    }

    /// Merges still pending for a task.
    pub fn remaining_for(&self, task_id: &str) -> usize {
        self.pending_counts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(task_id)
            .copied()
            .unwrap_or(0)
    }

    /// Close the queue and wait for the tail of entries to drain.
    pub async fn shutdown(mut self) {
        self.tx.take();
        let _ = self.handle.await;
    }
}

async fn process_entry(
    repo: &Repository,
    resolver_agent: Option<&Arc<dyn Agent>>,
    entry: &MergeEntry,
) -> Result<()> {
    if !repo.is_clean_filtered().await? {
        return Err(RalphError::DirtyWorkingTree {
            path: repo.root().to_path_buf(),
        });
    }

    match repo.cherry_pick(&entry.commit).await {
        Ok(()) => Ok(()),
        Err(RalphError::CherryPickConflict { .. }) => {
            repo.cherry_pick_abort().await?;
            let resolved = resolve_conflict(repo, resolver_agent, entry).await?;
            let applied = repo.cherry_pick(&resolved.commit).await;
            // The ephemeral branch only exists to keep the commit reachable.
            let _ = crate::process::run_git(repo.root(), &["branch", "-D", &resolved.branch]).await;
            applied
        }
        Err(e) => {
            repo.cherry_pick_abort().await?;
            Err(e)
        }
    }
}

/// Commit produced by the auto-resolver, plus the branch keeping it alive.
struct ResolvedPick {
    commit: String,
    branch: String,
}

/// Conflict auto-resolver: re-attempt the pick in an ephemeral `merge-*`
/// worktree; if it still conflicts, hand the worktree to an agent with a
/// scoped resolve prompt. Returns the commit to apply to the main checkout.
async fn resolve_conflict(
    repo: &Repository,
    resolver_agent: Option<&Arc<dyn Agent>>,
    entry: &MergeEntry,
) -> Result<ResolvedPick> {
    let short: String = entry.commit.chars().take(8).collect();
    let wt_path = paths::worktrees_dir(repo.root()).join(format!("merge-{short}"));
    let branch = format!("merge/{short}-{}", Utc::now().timestamp_millis());

    // Anything left at the path from a prior run is removed first.
    let _ = repo.worktree_remove(&wt_path, true).await;
    if wt_path.exists() {
        let _ = tokio::fs::remove_dir_all(&wt_path).await;
    }

    let base = repo.head_commit().await?;
    repo.worktree_add(&wt_path, &branch, &base, true, true)
        .await?;
    let wt_repo = Repository::at(&wt_path);

    let result = resolve_in_worktree(&wt_repo, resolver_agent, entry, &base).await;

    // The merge worktree is always removed; the commit survives via its
    // branch until the main-checkout pick lands.
    let _ = repo.worktree_remove(&wt_path, true).await;
    if wt_path.exists() {
        let _ = tokio::fs::remove_dir_all(&wt_path).await;
    }
    let resolved = result?;
    debug!(
        category = "engine.merge",
        commit = entry.commit.as_str(),
        resolved = resolved.as_str(),
        "Conflict resolved in merge worktree"
    );
    Ok(ResolvedPick {
        commit: resolved,
        branch,
    })
}

async fn resolve_in_worktree(
    wt_repo: &Repository,
    resolver_agent: Option<&Arc<dyn Agent>>,
    entry: &MergeEntry,
    base: &str,
) -> Result<String> {
    if wt_repo.cherry_pick(&entry.commit).await.is_ok() {
        return wt_repo.head_commit().await;
    }

    let Some(agent) = resolver_agent else {
        let _ = wt_repo.cherry_pick_abort().await;
        return Err(RalphError::MergeFailed {
            commit: entry.commit.clone(),
            reason: "cherry-pick conflict and no resolver agent configured".to_string(),
        });
    };

    let conflicting = wt_repo.unmerged_paths().await?;
    let prompt = conflict_prompt(&entry.task, &entry.commit, &conflicting);
    let handle = agent.execute(
        &prompt,
        &[],
        ExecuteOptions {
            cwd: wt_repo.root().to_path_buf(),
            ..Default::default()
        },
    )?;
    let result = handle.wait().await?;

    let unmerged = wt_repo.unmerged_paths().await?;
    if !contains_completion_sentinel(&result.stdout) || !unmerged.is_empty() {
        let _ = wt_repo.cherry_pick_abort().await;
        return Err(RalphError::MergeFailed {
            commit: entry.commit.clone(),
            reason: format!(
                "resolver agent left {} unmerged path(s)",
                unmerged.len()
            ),
        });
    }

    // The agent may have finished the pick itself; only continue when the
    // worktree still sits on the base commit.
    if wt_repo.head_commit().await? == base {
        wt_repo.cherry_pick_continue().await?;
    }
    let resolved = wt_repo.head_commit().await?;
    if resolved == base {
        return Err(RalphError::MergeFailed {
            commit: entry.commit.clone(),
            reason: "resolver agent produced no commit".to_string(),
        });
    }
    Ok(resolved)
}

fn conflict_prompt(task: &Task, commit: &str, conflicting: &[String]) -> String {
    let mut prompt = format!(
        "A cherry-pick of commit {commit} for task {} (\"{}\") stopped on conflicts.\n\n\
         Conflicting files:\n",
        task.id, task.title
    );
    for file in conflicting {
        prompt.push_str(&format!("- {file}\n"));
    }
    prompt.push_str(
        "\nResolve only these conflicts, keeping both sides' intent. Remove every conflict \
         marker, `git add` the resolved files, and run `git cherry-pick --continue`. Do not \
         touch unrelated files, do not push, and when the pick is finished output \
         `<promise>COMPLETE</promise>`.\n",
    );
    prompt
}
