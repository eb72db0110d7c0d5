//! Single-instance lock
//!
//! One live engine per working directory. The lock is a pretty-printed JSON
//! file naming the owning pid; liveness is decided by the pid alone, the
//! timestamp is diagnostic. A periodic sweep removes locks whose pid is no
//! longer running.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{RalphError, Result};
use crate::paths;

/// Sweep cadence for dead-pid locks.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Locks older than this are reported as suspicious, never auto-deleted
/// while their pid is alive.
const STALE_AGE_HOURS: i64 = 24;

/// Contents of `.ralph-tui/ralph.lock`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockInfo {
    pub pid: u32,
    pub session_id: String,
    pub acquired_at: DateTime<Utc>,
    pub cwd: PathBuf,
    pub hostname: String,
}

/// Decision hook for cleaning a dead lock when running interactively.
pub type CleanupPrompt = Box<dyn Fn(&LockInfo) -> bool + Send + Sync>;

/// Options for [`InstanceLock::acquire`].
#[derive(Default)]
pub struct AcquireOptions {
    /// Overwrite even a live lock.
    pub force: bool,
    /// Auto-clean dead locks without prompting.
    pub non_interactive: bool,
    /// Prompt invoked for dead locks in interactive mode; `None` behaves
    /// like non-interactive.
    pub confirm_cleanup: Option<CleanupPrompt>,
}

/// Held single-instance lock. Releasing (or dropping) deletes the file.
#[derive(Debug)]
pub struct InstanceLock {
    path: PathBuf,
    info: LockInfo,
    released: bool,
}

impl InstanceLock {
    /// Acquire the lock for `cwd`, honoring stale-lock recovery rules.
    pub fn acquire(cwd: &Path, session_id: &str, opts: AcquireOptions) -> Result<Self> {
        let path = paths::lock_file(cwd);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        // Advisory flock serializes the read-check-write sequence against a
        // second acquire racing on the same host. Held only for this call;
        // liveness itself is decided by the pid in the file.
        let guard_path = path.with_extension("lock.guard");
        let guard = std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .open(&guard_path)?;
        guard.lock_exclusive()?;
        let _guard = guard;

        if path.exists() {
            match read_lock(&path) {
                Ok(existing) => Self::handle_existing(cwd, &path, existing, &opts)?,
                Err(e) => {
                    if opts.force || opts.non_interactive {
                        warn!(
                            category = "lock",
                            path = %path.display(),
                            error = %e,
                            "Replacing unreadable lock file"
                        );
                    } else {
                        return Err(e);
                    }
                }
            }
        }

        let info = LockInfo {
            pid: std::process::id(),
            session_id: session_id.to_string(),
            acquired_at: Utc::now(),
            cwd: cwd.to_path_buf(),
            hostname: hostname(),
        };
        write_lock(&path, &info)?;
        info!(
            category = "lock",
            pid = info.pid,
            session = session_id,
            "Instance lock acquired"
        );

        Ok(Self {
            path,
            info,
            released: false,
        })
    }

    fn handle_existing(
        cwd: &Path,
        path: &Path,
        existing: LockInfo,
        opts: &AcquireOptions,
    ) -> Result<()> {
        let age_hours = (Utc::now() - existing.acquired_at).num_hours();
        if age_hours >= STALE_AGE_HOURS {
            // Old timestamps are logged only; a live pid always wins.
            warn!(
                category = "lock",
                pid = existing.pid,
                age_hours,
                "Lock file is old; liveness decided by pid"
            );
        }

        if existing.pid == std::process::id() {
            debug!(category = "lock", "Re-acquiring our own lock");
            return Ok(());
        }

        if pid_alive(existing.pid) {
            if opts.force {
                warn!(
                    category = "lock",
                    pid = existing.pid,
                    "Force-overwriting live lock"
                );
                return Ok(());
            }
            return Err(RalphError::LockContention {
                pid: existing.pid,
                cwd: cwd.to_path_buf(),
            });
        }

        // Dead pid: clean up, possibly after asking.
        if !opts.non_interactive && !opts.force {
            if let Some(confirm) = &opts.confirm_cleanup {
                if !confirm(&existing) {
                    return Err(RalphError::LockContention {
                        pid: existing.pid,
                        cwd: cwd.to_path_buf(),
                    });
                }
            }
        }
        warn!(
            category = "lock",
            pid = existing.pid,
            path = %path.display(),
            "Removing stale lock from dead process"
        );
        Ok(())
    }

    pub fn info(&self) -> &LockInfo {
        &self.info
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Delete the lock file. Safe to call more than once; also runs on drop
    /// so every exit path releases.
    pub fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!(category = "lock", "Instance lock released"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(category = "lock", error = %e, "Failed to remove lock file"),
        }
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        self.release();
    }
}

/// Remove the lock at `cwd` if its owner is dead. Returns whether a lock
/// was deleted. Live-pid locks are never deleted here, regardless of age.
pub fn sweep(cwd: &Path) -> bool {
    let path = paths::lock_file(cwd);
    if !path.exists() {
        return false;
    }
    match read_lock(&path) {
        Ok(info) if !pid_alive(info.pid) => {
            info!(
                category = "lock",
                pid = info.pid,
                "Sweep removed dead-pid lock"
            );
            std::fs::remove_file(&path).is_ok()
        }
        Ok(_) => false,
        Err(e) => {
            debug!(category = "lock", error = %e, "Sweep skipped unreadable lock");
            false
        }
    }
}

/// Spawn the periodic dead-lock sweeper.
pub fn spawn_sweeper(cwd: PathBuf, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(SWEEP_INTERVAL) => {
                    sweep(&cwd);
                }
                _ = shutdown.changed() => break,
            }
        }
    })
}

fn read_lock(path: &Path) -> Result<LockInfo> {
    let content = std::fs::read_to_string(path).map_err(|e| RalphError::LockUnreadable {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    serde_json::from_str(&content).map_err(|e| RalphError::LockUnreadable {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

fn write_lock(path: &Path, info: &LockInfo) -> Result<()> {
    let json = serde_json::to_string_pretty(info)?;
    std::fs::write(path, format!("{json}\n"))?;
    Ok(())
}

/// Whether a pid refers to a running process.
#[cfg(unix)]
pub fn pid_alive(pid: u32) -> bool {
    let result = unsafe { libc::kill(pid as libc::pid_t, 0) };
    if result == 0 {
        return true;
    }
    // EPERM means the process exists but belongs to someone else.
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
pub fn pid_alive(_pid: u32) -> bool {
    // Without a cheap liveness probe, never steal a lock automatically.
    true
}

fn hostname() -> String {
    #[cfg(unix)]
    {
        let mut buf = [0u8; 256];
        let result = unsafe { libc::gethostname(buf.as_mut_ptr() as *mut libc::c_char, buf.len()) };
        if result == 0 {
            let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
            if let Ok(name) = std::str::from_utf8(&buf[..end]) {
                if !name.is_empty() {
                    return name.to_string();
                }
            }
        }
    }
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .unwrap_or_else(|_| "unknown".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A pid that cannot exist on Linux (beyond default pid_max).
    const DEAD_PID: u32 = 4_190_000;

    fn seed_lock(cwd: &Path, pid: u32) {
        let info = LockInfo {
            pid,
            session_id: "other".to_string(),
            acquired_at: Utc::now(),
            cwd: cwd.to_path_buf(),
            hostname: "elsewhere".to_string(),
        };
        let path = paths::lock_file(cwd);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        write_lock(&path, &info).unwrap();
    }

    #[test]
    fn test_acquire_writes_pretty_json() {
        let temp = tempfile::TempDir::new().unwrap();
        let lock =
            InstanceLock::acquire(temp.path(), "session-1", AcquireOptions::default()).unwrap();
        let content = std::fs::read_to_string(lock.path()).unwrap();
        assert!(content.contains('\n'), "lock json should be pretty-printed");
        let parsed: LockInfo = serde_json::from_str(&content).unwrap();
        assert_eq!(parsed.pid, std::process::id());
        assert_eq!(parsed.session_id, "session-1");
        // Spec'd field spelling on disk.
        assert!(content.contains("\"sessionId\""));
        assert!(content.contains("\"acquiredAt\""));
    }

    #[test]
    fn test_release_deletes_file() {
        let temp = tempfile::TempDir::new().unwrap();
        let mut lock =
            InstanceLock::acquire(temp.path(), "session-1", AcquireOptions::default()).unwrap();
        let path = lock.path().to_path_buf();
        assert!(path.exists());
        lock.release();
        assert!(!path.exists());
    }

    #[test]
    fn test_drop_releases() {
        let temp = tempfile::TempDir::new().unwrap();
        let path;
        {
            let lock =
                InstanceLock::acquire(temp.path(), "session-1", AcquireOptions::default()).unwrap();
            path = lock.path().to_path_buf();
        }
        assert!(!path.exists());
    }

    #[test]
    fn test_live_lock_contention() {
        let temp = tempfile::TempDir::new().unwrap();
        // pid 1 is always alive.
        seed_lock(temp.path(), 1);
        let err = InstanceLock::acquire(temp.path(), "session-2", AcquireOptions::default())
            .unwrap_err();
        assert_eq!(err.code(), "E7001");
    }

    #[test]
    fn test_force_overwrites_live_lock() {
        let temp = tempfile::TempDir::new().unwrap();
        seed_lock(temp.path(), 1);
        let lock = InstanceLock::acquire(
            temp.path(),
            "session-2",
            AcquireOptions {
                force: true,
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(lock.info().session_id, "session-2");
    }

    #[test]
    fn test_dead_lock_auto_cleaned_non_interactive() {
        let temp = tempfile::TempDir::new().unwrap();
        seed_lock(temp.path(), DEAD_PID);
        let lock = InstanceLock::acquire(
            temp.path(),
            "session-2",
            AcquireOptions {
                non_interactive: true,
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(lock.info().pid, std::process::id());
    }

    #[test]
    fn test_dead_lock_interactive_prompt_declined() {
        let temp = tempfile::TempDir::new().unwrap();
        seed_lock(temp.path(), DEAD_PID);
        let err = InstanceLock::acquire(
            temp.path(),
            "session-2",
            AcquireOptions {
                confirm_cleanup: Some(Box::new(|_| false)),
                ..Default::default()
            },
        )
        .unwrap_err();
        assert_eq!(err.code(), "E7001");
    }

    #[test]
    fn test_dead_lock_interactive_prompt_accepted() {
        let temp = tempfile::TempDir::new().unwrap();
        seed_lock(temp.path(), DEAD_PID);
        let lock = InstanceLock::acquire(
            temp.path(),
            "session-2",
            AcquireOptions {
                confirm_cleanup: Some(Box::new(|info| {
                    assert_eq!(info.pid, DEAD_PID);
                    true
                })),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(lock.info().session_id, "session-2");
    }

    #[test]
    fn test_sweep_removes_only_dead_locks() {
        let temp = tempfile::TempDir::new().unwrap();
        seed_lock(temp.path(), DEAD_PID);
        assert!(sweep(temp.path()));
        assert!(!paths::lock_file(temp.path()).exists());

        seed_lock(temp.path(), 1);
        assert!(!sweep(temp.path()));
        assert!(paths::lock_file(temp.path()).exists());
    }

    #[test]
    fn test_reacquire_same_process() {
        let temp = tempfile::TempDir::new().unwrap();
        let _first =
            InstanceLock::acquire(temp.path(), "session-1", AcquireOptions::default()).unwrap();
        // Same pid may re-acquire (crash-recovery within one process).
        let second =
            InstanceLock::acquire(temp.path(), "session-2", AcquireOptions::default()).unwrap();
        assert_eq!(second.info().session_id, "session-2");
    }
}
