//! On-disk layout under the working directory.
//!
//! Everything the engine persists lives in `.ralph-tui/`; worker worktrees
//! live in `worktrees/`. The commit-recovery and merge preconditions treat
//! these (plus `.beads/`) as invisible when deciding whether a tree is dirty.

use std::path::{Path, PathBuf};

pub const STATE_DIR: &str = ".ralph-tui";
pub const WORKTREES_DIR: &str = "worktrees";

/// Paths excluded from dirty-tree checks.
pub const DIRTY_EXCLUDES: &[&str] = &[".beads/", ".ralph-tui/", "worktrees/"];

pub fn state_dir(cwd: &Path) -> PathBuf {
    cwd.join(STATE_DIR)
}

pub fn lock_file(cwd: &Path) -> PathBuf {
    state_dir(cwd).join("ralph.lock")
}

pub fn tracker_events_log(cwd: &Path) -> PathBuf {
    state_dir(cwd).join("tracker-events.jsonl")
}

pub fn iterations_dir(cwd: &Path) -> PathBuf {
    state_dir(cwd).join("iterations")
}

pub fn iteration_dir(cwd: &Path, iteration: u64) -> PathBuf {
    iterations_dir(cwd).join(iteration.to_string())
}

pub fn progress_file(cwd: &Path) -> PathBuf {
    state_dir(cwd).join("progress.md")
}

pub fn shim_bin_dir(worktree: &Path) -> PathBuf {
    worktree.join(STATE_DIR).join("bin")
}

pub fn worktrees_dir(cwd: &Path) -> PathBuf {
    cwd.join(WORKTREES_DIR)
}

pub fn worker_worktree(cwd: &Path, worker_id: &str) -> PathBuf {
    worktrees_dir(cwd).join(worker_id)
}

pub fn main_sync_worktree(cwd: &Path) -> PathBuf {
    worktrees_dir(cwd).join("main-sync")
}

/// True when a porcelain path falls under one of the excluded prefixes.
pub fn is_excluded(path: &str) -> bool {
    let normalized = path.trim_start_matches("./");
    DIRTY_EXCLUDES
        .iter()
        .any(|prefix| normalized.starts_with(prefix) || normalized == prefix.trim_end_matches('/'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout() {
        let cwd = Path::new("/work");
        assert_eq!(lock_file(cwd), PathBuf::from("/work/.ralph-tui/ralph.lock"));
        assert_eq!(
            iteration_dir(cwd, 3),
            PathBuf::from("/work/.ralph-tui/iterations/3")
        );
        assert_eq!(
            worker_worktree(cwd, "worker-1"),
            PathBuf::from("/work/worktrees/worker-1")
        );
    }

    #[test]
    fn test_exclusions() {
        assert!(is_excluded(".ralph-tui/progress.md"));
        assert!(is_excluded(".beads/db.sqlite"));
        assert!(is_excluded("worktrees/worker-0/src/main.rs"));
        assert!(is_excluded(".ralph-tui"));
        assert!(!is_excluded("src/main.rs"));
        assert!(!is_excluded("worktrees.rs"));
    }
}
