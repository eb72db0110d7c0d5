//! Shared fixtures for unit tests.

use std::path::Path;

use crate::git::Repository;
use crate::process::run_git;

/// Initialize a repository with one seed commit on `main`.
pub async fn init_repo(dir: &Path) -> Repository {
    for args in [
        vec!["init", "-b", "main"],
        vec!["config", "user.email", "test@example.com"],
        vec!["config", "user.name", "Test"],
        vec!["config", "commit.gpgsign", "false"],
    ] {
        let out = run_git(dir, &args).await.unwrap();
        assert!(out.success(), "git {args:?} failed: {}", out.stderr);
    }
    std::fs::write(dir.join("seed.txt"), "seed\n").unwrap();
    let repo = Repository::at(dir);
    repo.commit_all("initial").await.unwrap();
    repo
}

/// Commit a file with given content in `dir`, returning the sha.
pub async fn commit_file(repo: &Repository, dir: &Path, name: &str, content: &str, message: &str) -> String {
    std::fs::write(dir.join(name), content).unwrap();
    repo.commit_all(message).await.unwrap()
}

/// Stage-and-commit synchronously; usable from scripted-agent side effects,
/// which run outside an async context.
pub fn git_commit_all_sync(cwd: &Path, message: &str) {
    for args in [
        vec!["add", "-A"],
        vec!["commit", "-m", message, "--no-verify"],
    ] {
        let out = std::process::Command::new("git")
            .args(&args)
            .current_dir(cwd)
            .output()
            .unwrap();
        assert!(
            out.status.success(),
            "git {args:?} failed: {}",
            String::from_utf8_lossy(&out.stderr)
        );
    }
}
