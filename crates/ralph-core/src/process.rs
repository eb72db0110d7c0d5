//! Subprocess helpers for git and other external commands.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;

use crate::error::{RalphError, Result};

/// Default timeout for short helper subprocesses.
pub const HELPER_TIMEOUT: Duration = Duration::from_secs(5);

/// Captured output of one subprocess run.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    pub fn stdout_trimmed(&self) -> String {
        self.stdout.trim().to_string()
    }
}

/// Run `git <args>` in `cwd`, returning the captured output. Errors only on
/// spawn failure; callers inspect the exit code.
pub async fn run_git(cwd: &Path, args: &[&str]) -> Result<CommandOutput> {
    run_command(cwd, "git", args, None).await
}

/// Run `git <args>` and fail with a structured error on nonzero exit.
pub async fn git_ok(cwd: &Path, args: &[&str]) -> Result<CommandOutput> {
    let output = run_git(cwd, args).await?;
    if output.success() {
        Ok(output)
    } else {
        Err(RalphError::GitOperationFailed {
            operation: args.join(" "),
            details: pick_details(&output),
        })
    }
}

/// Run an arbitrary command with an optional timeout. A timed-out process is
/// killed and reported as exit code -1 with a marker in stderr.
pub async fn run_command(
    cwd: &Path,
    program: &str,
    args: &[&str],
    timeout: Option<Duration>,
) -> Result<CommandOutput> {
    let mut cmd = Command::new(program);
    cmd.args(args)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let fut = cmd.output();
    let output = match timeout {
        Some(limit) => match tokio::time::timeout(limit, fut).await {
            Ok(result) => result,
            Err(_) => {
                return Ok(CommandOutput {
                    stdout: String::new(),
                    stderr: format!("{program} timed out after {}s", limit.as_secs()),
                    exit_code: -1,
                })
            }
        },
        None => fut.await,
    };

    let output = output.map_err(|e| {
        if program == "git" && e.kind() == std::io::ErrorKind::NotFound {
            RalphError::GitNotFound
        } else {
            RalphError::Io(e)
        }
    })?;

    Ok(CommandOutput {
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        exit_code: output.status.code().unwrap_or(-1),
    })
}

fn pick_details(output: &CommandOutput) -> String {
    let err = output.stderr.trim();
    if err.is_empty() {
        output.stdout.trim().to_string()
    } else {
        err.to_string()
    }
}
