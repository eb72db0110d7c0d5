//! Worktree manager
//!
//! Creates, validates, and tears down per-worker worktrees. Creation is
//! pessimistic: any prior state at the target path is cleaned up first, the
//! add is retried with force, and the result is validated against the
//! expected branch and commit before a worker is allowed near it.

use std::path::{Path, PathBuf};

use chrono::Utc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::error::{RalphError, Result};
use crate::git::Repository;
use crate::paths;

use super::shim::install_shims;
use super::types::{
    CreateWorktreeRequest, HealthSummary, WorkerWorktree, WorktreeHealth, WorktreeRecord,
};

#[derive(Clone)]
pub struct WorktreeManager {
    repo: Repository,
    cwd: PathBuf,
}

impl WorktreeManager {
    pub fn new(repo: Repository) -> Self {
        let cwd = repo.root().to_path_buf();
        Self { repo, cwd }
    }

    /// Create every requested worktree concurrently. Any member failure
    /// fails the batch; already-created members are left for cleanup via
    /// `remove_worktree`.
    pub async fn create_worktrees(
        &self,
        requests: Vec<CreateWorktreeRequest>,
    ) -> Result<Vec<WorkerWorktree>> {
        let mut set = JoinSet::new();
        for request in requests {
            let manager = self.clone();
            set.spawn(async move { manager.create_worktree(request).await });
        }

        let mut created = Vec::new();
        let mut first_error = None;
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(Ok(worktree)) => created.push(worktree),
                Ok(Err(e)) => first_error = first_error.or(Some(e)),
                Err(e) => {
                    first_error =
                        first_error.or(Some(RalphError::Internal(format!("join error: {e}"))))
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => {
                created.sort_by(|a, b| a.worker_id.cmp(&b.worker_id));
                Ok(created)
            }
        }
    }

    /// Create one worker worktree at `worktrees/<worker_id>`.
    pub async fn create_worktree(&self, request: CreateWorktreeRequest) -> Result<WorkerWorktree> {
        let base_commit = self.repo.resolve_ref(&request.base_ref).await?;
        let branch = format!("worker/{}/{}", request.worker_id, Utc::now().timestamp_millis());
        let path = paths::worker_worktree(&self.cwd, &request.worker_id);

        self.cleanup_prior_state(&path).await;

        let new_branch = !self.repo.branch_exists(&branch).await?;
        let mut attempt = self
            .repo
            .worktree_add(&path, &branch, &base_commit, new_branch, false)
            .await;

        if attempt.is_err() {
            debug!(
                category = "worktree",
                path = %path.display(),
                "Worktree add failed, retrying with force"
            );
            attempt = self
                .repo
                .worktree_add(&path, &branch, &base_commit, new_branch, true)
                .await;
        }
        if attempt.is_err() {
            self.cleanup_prior_state(&path).await;
            attempt = self
                .repo
                .worktree_add(&path, &branch, &base_commit, new_branch, true)
                .await;
        }
        attempt?;

        self.validate(&path, &branch, &base_commit).await?;

        install_shims(&path)?;

        if let Some(reason) = &request.lock_reason {
            self.repo.worktree_lock(&path, Some(reason)).await?;
        }

        info!(
            category = "worktree",
            operation = "create",
            worker = request.worker_id.as_str(),
            branch = branch.as_str(),
            path = %path.display(),
            "Worker worktree created"
        );

        Ok(WorkerWorktree {
            worker_id: request.worker_id,
            path,
            branch,
            commit: base_commit,
        })
    }

    /// Re-read the worktree's branch and commit; destroy it on mismatch.
    pub async fn validate(
        &self,
        path: &Path,
        expected_branch: &str,
        expected_commit: &str,
    ) -> Result<()> {
        let wt_repo = Repository::at(path);
        let observed_branch = wt_repo.current_branch().await.unwrap_or_default();
        let observed_commit = wt_repo.head_commit().await.unwrap_or_default();

        if observed_branch == expected_branch && observed_commit == expected_commit {
            return Ok(());
        }

        warn!(
            category = "worktree",
            path = %path.display(),
            expected_branch,
            expected_commit,
            observed_branch = observed_branch.as_str(),
            observed_commit = observed_commit.as_str(),
            "Worktree validation failed, destroying"
        );
        let _ = self.repo.worktree_remove(path, true).await;
        let _ = tokio::fs::remove_dir_all(path).await;

        Err(RalphError::WorktreeValidationFailed {
            path: path.to_path_buf(),
            expected_branch: expected_branch.to_string(),
            expected_commit: expected_commit.to_string(),
            observed_branch,
            observed_commit,
        })
    }

    /// Remove a worker's worktree. `skip_git_remove` limits this to the
    /// directory (used when git already forgot the worktree).
    pub async fn remove_worktree(&self, worker_id: &str, skip_git_remove: bool) -> Result<()> {
        let path = paths::worker_worktree(&self.cwd, worker_id);
        let _ = self.repo.worktree_unlock(&path).await;
        if !skip_git_remove {
            if let Err(e) = self.repo.worktree_remove(&path, true).await {
                debug!(
                    category = "worktree",
                    path = %path.display(),
                    error = %e,
                    "git worktree remove failed, pruning instead"
                );
            }
        }
        let _ = self.repo.worktree_prune().await;
        if path.exists() {
            tokio::fs::remove_dir_all(&path).await?;
        }
        Ok(())
    }

    pub async fn lock(&self, worker_id: &str, reason: &str) -> Result<()> {
        let path = paths::worker_worktree(&self.cwd, worker_id);
        self.repo.worktree_lock(&path, Some(reason)).await
    }

    pub async fn unlock(&self, worker_id: &str) -> Result<()> {
        let path = paths::worker_worktree(&self.cwd, worker_id);
        self.repo.worktree_unlock(&path).await
    }

    pub async fn prune(&self) -> Result<()> {
        self.repo.worktree_prune().await
    }

    /// List worktrees with derived health. The main checkout is excluded.
    pub async fn list(&self) -> Result<Vec<WorktreeRecord>> {
        let infos = self.repo.worktree_list().await?;
        let main_root = dunce::canonicalize(&self.cwd).unwrap_or_else(|_| self.cwd.clone());

        let mut records = Vec::new();
        for info in infos {
            let canonical = dunce::canonicalize(&info.path).unwrap_or_else(|_| info.path.clone());
            if canonical == main_root {
                continue;
            }

            let health = if info.is_prunable {
                WorktreeHealth::Prunable
            } else if info.is_locked {
                WorktreeHealth::Locked
            } else if !info.path.exists() {
                WorktreeHealth::Stale
            } else {
                WorktreeHealth::Active
            };

            records.push(WorktreeRecord {
                path: info.path,
                branch: info.branch,
                commit: info.head,
                locked: info.is_locked,
                lock_reason: info.lock_reason,
                health,
            });
        }
        Ok(records)
    }

    pub async fn health_summary(&self) -> Result<HealthSummary> {
        let mut summary = HealthSummary::default();
        for record in self.list().await? {
            match record.health {
                WorktreeHealth::Active => summary.active += 1,
                WorktreeHealth::Locked => summary.locked += 1,
                WorktreeHealth::Stale => summary.stale += 1,
                WorktreeHealth::Prunable => summary.prunable += 1,
            }
        }
        Ok(summary)
    }

    /// Best-effort teardown of whatever is at the target path. All three git
    /// ops run concurrently and every failure is tolerated.
    async fn cleanup_prior_state(&self, path: &Path) {
        let (unlock, remove, prune) = tokio::join!(
            self.repo.worktree_unlock(path),
            self.repo.worktree_remove(path, true),
            self.repo.worktree_prune(),
        );
        for result in [unlock, remove, prune] {
            if let Err(e) = result {
                debug!(
                    category = "worktree",
                    path = %path.display(),
                    error = %e,
                    "Tolerated cleanup failure"
                );
            }
        }
        if path.exists() {
            let _ = tokio::fs::remove_dir_all(path).await;
        }
    }
}
