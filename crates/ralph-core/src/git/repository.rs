//! Repository handle: porcelain parsing and the git operations the engine
//! needs (status, cherry-pick, fast-forward, worktree management, ancestry).

use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{RalphError, Result};
use crate::paths;
use crate::process::{git_ok, run_git, CommandOutput};

/// One `git status --porcelain` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEntry {
    pub code: String,
    pub path: String,
}

/// One `git worktree list --porcelain` entry.
#[derive(Debug, Clone, Default)]
pub struct WorktreeInfo {
    pub path: PathBuf,
    pub head: String,
    pub branch: Option<String>,
    pub is_bare: bool,
    pub is_detached: bool,
    pub is_locked: bool,
    pub lock_reason: Option<String>,
    pub is_prunable: bool,
}

/// Outcome of a fast-forward-only merge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FastForward {
    Updated { commit: String },
    AlreadyUpToDate { commit: String },
}

impl FastForward {
    pub fn commit(&self) -> &str {
        match self {
            Self::Updated { commit } | Self::AlreadyUpToDate { commit } => commit,
        }
    }

    pub fn updated(&self) -> bool {
        matches!(self, Self::Updated { .. })
    }
}

/// A git repository rooted at a working directory.
#[derive(Debug, Clone)]
pub struct Repository {
    root: PathBuf,
}

impl Repository {
    /// Wrap an existing checkout without validation (e.g. worktrees the
    /// caller just created).
    pub fn at(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Resolve the repository containing `path`, failing outside a repo.
    pub async fn discover(path: &Path) -> Result<Self> {
        let output = run_git(path, &["rev-parse", "--show-toplevel"]).await?;
        if !output.success() {
            return Err(RalphError::NotAGitRepository {
                path: path.to_path_buf(),
            });
        }
        Ok(Self {
            root: PathBuf::from(output.stdout_trimmed()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub async fn current_branch(&self) -> Result<String> {
        let output = git_ok(&self.root, &["rev-parse", "--abbrev-ref", "HEAD"]).await?;
        Ok(output.stdout_trimmed())
    }

    pub async fn head_commit(&self) -> Result<String> {
        let output = git_ok(&self.root, &["rev-parse", "HEAD"]).await?;
        Ok(output.stdout_trimmed())
    }

    /// Resolve any ref to a commit sha.
    pub async fn resolve_ref(&self, name: &str) -> Result<String> {
        let spec = format!("{name}^{{commit}}");
        let output = run_git(&self.root, &["rev-parse", "--verify", "--quiet", &spec]).await?;
        if output.success() {
            Ok(output.stdout_trimmed())
        } else {
            Err(RalphError::RefNotFound {
                name: name.to_string(),
            })
        }
    }

    pub async fn branch_exists(&self, name: &str) -> Result<bool> {
        let spec = format!("refs/heads/{name}");
        let output = run_git(&self.root, &["show-ref", "--verify", "--quiet", &spec]).await?;
        Ok(output.success())
    }

    /// Parse `git status --porcelain`.
    pub async fn status(&self) -> Result<Vec<StatusEntry>> {
        let output = git_ok(&self.root, &["status", "--porcelain"]).await?;
        Ok(parse_status(&output.stdout))
    }

    /// Changed paths, with the engine's own state directories filtered out.
    pub async fn changed_files_filtered(&self) -> Result<Vec<String>> {
        let entries = self.status().await?;
        Ok(entries
            .into_iter()
            .filter(|e| !paths::is_excluded(&e.path))
            .map(|e| e.path)
            .collect())
    }

    /// A tree containing only excluded paths counts as clean.
    pub async fn is_clean_filtered(&self) -> Result<bool> {
        Ok(self.changed_files_filtered().await?.is_empty())
    }

    /// Stage everything and commit. Returns the new commit sha.
    pub async fn commit_all(&self, message: &str) -> Result<String> {
        git_ok(&self.root, &["add", "-A"]).await?;
        git_ok(&self.root, &["commit", "-m", message, "--no-verify"]).await?;
        self.head_commit().await
    }

    /// Stage and commit everything except the engine's own state paths.
    /// Used for auto-committing leftovers a worker forgot.
    pub async fn commit_all_filtered(&self, message: &str) -> Result<String> {
        let mut args: Vec<String> = vec!["add".into(), "-A".into(), "--".into(), ".".into()];
        for excluded in paths::DIRTY_EXCLUDES {
            args.push(format!(":(exclude){}", excluded.trim_end_matches('/')));
        }
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        git_ok(&self.root, &arg_refs).await?;
        git_ok(&self.root, &["commit", "-m", message, "--no-verify"]).await?;
        self.head_commit().await
    }

    /// Commits in `base..head`, oldest first.
    pub async fn rev_list_range(&self, base: &str, head: &str) -> Result<Vec<String>> {
        let range = format!("{base}..{head}");
        let output = git_ok(&self.root, &["rev-list", "--reverse", &range]).await?;
        Ok(output
            .stdout
            .lines()
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty())
            .collect())
    }

    /// First line of a commit message.
    pub async fn commit_subject(&self, commit: &str) -> Result<String> {
        let output = git_ok(&self.root, &["log", "-1", "--format=%s", commit]).await?;
        Ok(output.stdout_trimmed())
    }

    pub async fn cherry_pick(&self, commit: &str) -> Result<()> {
        let output = run_git(&self.root, &["cherry-pick", commit]).await?;
        if output.success() {
            return Ok(());
        }
        Err(RalphError::CherryPickConflict {
            commit: commit.to_string(),
            details: details_of(&output),
        })
    }

    pub async fn cherry_pick_abort(&self) -> Result<()> {
        // Tolerated failure: there may be no pick in progress.
        let _ = run_git(&self.root, &["cherry-pick", "--abort"]).await?;
        Ok(())
    }

    pub async fn cherry_pick_continue(&self) -> Result<()> {
        let output = run_git(
            &self.root,
            &["-c", "core.editor=true", "cherry-pick", "--continue"],
        )
        .await?;
        if output.success() {
            Ok(())
        } else {
            Err(RalphError::GitOperationFailed {
                operation: "cherry-pick --continue".to_string(),
                details: details_of(&output),
            })
        }
    }

    /// Paths still carrying conflict markers.
    pub async fn unmerged_paths(&self) -> Result<Vec<String>> {
        let output = git_ok(&self.root, &["diff", "--name-only", "--diff-filter=U"]).await?;
        Ok(output
            .stdout
            .lines()
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty())
            .collect())
    }

    /// Fast-forward-only merge of `commit` into the current branch.
    pub async fn merge_ff_only(&self, commit: &str) -> Result<FastForward> {
        let before = self.head_commit().await?;
        let output = run_git(&self.root, &["merge", "--ff-only", commit]).await?;
        if !output.success() {
            return Err(RalphError::FastForwardFailed {
                details: details_of(&output),
            });
        }
        let after = self.head_commit().await?;
        if after == before {
            Ok(FastForward::AlreadyUpToDate { commit: after })
        } else {
            Ok(FastForward::Updated { commit: after })
        }
    }

    pub async fn fetch(&self, remote: &str) -> Result<()> {
        let output = run_git(&self.root, &["fetch", remote]).await?;
        if output.success() {
            Ok(())
        } else {
            Err(RalphError::FetchFailed {
                details: details_of(&output),
            })
        }
    }

    pub async fn has_remote(&self, remote: &str) -> Result<bool> {
        let output = run_git(&self.root, &["remote", "get-url", remote]).await?;
        Ok(output.success())
    }

    pub async fn is_ancestor(&self, commit: &str, reference: &str) -> Result<bool> {
        let output = run_git(
            &self.root,
            &["merge-base", "--is-ancestor", commit, reference],
        )
        .await?;
        Ok(output.success())
    }

    /// Commits anywhere in the repository whose message mentions `needle`.
    pub async fn log_grep_all(&self, needle: &str) -> Result<Vec<String>> {
        let grep = format!("--grep={needle}");
        let output = git_ok(&self.root, &["log", "--all", &grep, "--format=%H"]).await?;
        Ok(output
            .stdout
            .lines()
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty())
            .collect())
    }

    // --- worktree operations -------------------------------------------

    pub async fn worktree_add(
        &self,
        path: &Path,
        branch: &str,
        base: &str,
        new_branch: bool,
        force: bool,
    ) -> Result<()> {
        let path_str = path.display().to_string();
        let mut args: Vec<&str> = vec!["worktree", "add"];
        if force {
            args.push("-f");
        }
        if new_branch {
            args.extend(["-b", branch, path_str.as_str(), base]);
        } else {
            args.extend([path_str.as_str(), branch]);
        }
        let output = run_git(&self.root, &args).await?;
        if output.success() {
            debug!(
                category = "git",
                path = %path.display(),
                branch,
                "Worktree added"
            );
            Ok(())
        } else {
            Err(RalphError::WorktreeCreateFailed {
                reason: details_of(&output),
            })
        }
    }

    pub async fn worktree_remove(&self, path: &Path, force: bool) -> Result<()> {
        let path_str = path.display().to_string();
        let mut args: Vec<&str> = vec!["worktree", "remove"];
        if force {
            args.push("--force");
        }
        args.push(&path_str);
        let output = run_git(&self.root, &args).await?;
        if output.success() {
            Ok(())
        } else {
            Err(RalphError::WorktreeRemoveFailed {
                reason: details_of(&output),
            })
        }
    }

    pub async fn worktree_lock(&self, path: &Path, reason: Option<&str>) -> Result<()> {
        let path_str = path.display().to_string();
        let mut args: Vec<&str> = vec!["worktree", "lock"];
        if let Some(reason) = reason {
            args.extend(["--reason", reason]);
        }
        args.push(&path_str);
        git_ok(&self.root, &args).await.map(|_| ())
    }

    pub async fn worktree_unlock(&self, path: &Path) -> Result<()> {
        let path_str = path.display().to_string();
        // Tolerated failure: the worktree may not be locked.
        let _ = run_git(&self.root, &["worktree", "unlock", &path_str]).await?;
        Ok(())
    }

    pub async fn worktree_prune(&self) -> Result<()> {
        let _ = run_git(&self.root, &["worktree", "prune"]).await?;
        Ok(())
    }

    pub async fn worktree_list(&self) -> Result<Vec<WorktreeInfo>> {
        let output = git_ok(&self.root, &["worktree", "list", "--porcelain"]).await?;
        Ok(parse_worktree_list(&output.stdout))
    }
}

fn details_of(output: &CommandOutput) -> String {
    let err = output.stderr.trim();
    if err.is_empty() {
        output.stdout.trim().to_string()
    } else {
        err.to_string()
    }
}

fn parse_status(stdout: &str) -> Vec<StatusEntry> {
    let mut entries = Vec::new();
    for line in stdout.lines() {
        if line.len() < 4 {
            continue;
        }
        let code = line[..2].to_string();
        let rest = &line[3..];
        // Renames are reported as "old -> new"; the new path is what matters.
        let path = rest
            .rsplit_once(" -> ")
            .map(|(_, new)| new)
            .unwrap_or(rest)
            .trim_matches('"')
            .to_string();
        entries.push(StatusEntry { code, path });
    }
    entries
}

fn parse_worktree_list(stdout: &str) -> Vec<WorktreeInfo> {
    let mut worktrees = Vec::new();
    let mut current: Option<WorktreeInfo> = None;

    for line in stdout.lines() {
        if let Some(path) = line.strip_prefix("worktree ") {
            if let Some(wt) = current.take() {
                worktrees.push(wt);
            }
            current = Some(WorktreeInfo {
                path: PathBuf::from(path),
                ..Default::default()
            });
        } else if let Some(ref mut wt) = current {
            if let Some(head) = line.strip_prefix("HEAD ") {
                wt.head = head.to_string();
            } else if let Some(branch) = line.strip_prefix("branch ") {
                wt.branch = Some(
                    branch
                        .strip_prefix("refs/heads/")
                        .unwrap_or(branch)
                        .to_string(),
                );
            } else if line == "bare" {
                wt.is_bare = true;
            } else if line == "detached" {
                wt.is_detached = true;
            } else if line == "locked" || line.starts_with("locked ") {
                wt.is_locked = true;
                wt.lock_reason = line
                    .strip_prefix("locked ")
                    .map(|r| r.trim().to_string())
                    .filter(|r| !r.is_empty());
            } else if line == "prunable" || line.starts_with("prunable ") {
                wt.is_prunable = true;
            }
        }
    }
    if let Some(wt) = current {
        worktrees.push(wt);
    }
    worktrees
}
