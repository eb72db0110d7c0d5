//! Logger initialization and retention cleanup.
//!
//! JSON Lines to a daily-rolling file under `.ralph-tui/logs/`, with an
//! optional console layer in debug mode.

use std::path::{Path, PathBuf};

use chrono::{Duration, Utc};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

/// Logger configuration
#[derive(Debug, Clone)]
pub struct LogConfig {
    pub log_dir: PathBuf,
    pub debug: bool,
    pub retention_days: u32,
}

impl LogConfig {
    pub fn for_cwd(cwd: &Path, debug: bool, retention_days: u32) -> Self {
        Self {
            log_dir: ralph_core::paths::state_dir(cwd).join("logs"),
            debug,
            retention_days,
        }
    }
}

/// Initialize the logger with JSON Lines file output.
pub fn init_logger(config: &LogConfig) -> std::io::Result<()> {
    std::fs::create_dir_all(&config.log_dir)?;

    let file_appender =
        RollingFileAppender::new(Rotation::DAILY, config.log_dir.clone(), "ralph.jsonl");

    let file_layer = fmt::layer()
        .json()
        .with_span_events(FmtSpan::CLOSE)
        .with_writer(file_appender)
        .with_ansi(false);

    let console_layer = config.debug.then(|| {
        fmt::layer()
            .with_target(true)
            .with_writer(std::io::stderr)
    });

    // RUST_LOG takes precedence when present.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if config.debug {
            EnvFilter::new("ralph=debug,info")
        } else {
            EnvFilter::new("ralph=info,warn")
        }
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .with(console_layer)
        .try_init()
        .ok(); // Ignore if already initialized

    Ok(())
}

/// Remove log files older than the retention window. Returns how many were
/// deleted.
pub fn cleanup_old_logs(log_dir: &Path, retention_days: u32) -> std::io::Result<usize> {
    if !log_dir.exists() {
        return Ok(0);
    }

    let cutoff = Utc::now() - Duration::days(retention_days as i64);
    let mut removed = 0;

    for entry in std::fs::read_dir(log_dir)? {
        let entry = entry?;
        let path = entry.path();
        let is_log = path
            .file_name()
            .and_then(|n| n.to_str())
            .map(|n| n.starts_with("ralph.jsonl"))
            .unwrap_or(false);
        if !is_log {
            continue;
        }
        if let Ok(modified) = entry.metadata().and_then(|m| m.modified()) {
            let modified: chrono::DateTime<Utc> = modified.into();
            if modified < cutoff && std::fs::remove_file(&path).is_ok() {
                removed += 1;
            }
        }
    }

    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cleanup_ignores_foreign_files() {
        let temp = tempfile::TempDir::new().unwrap();
        std::fs::write(temp.path().join("ralph.jsonl.2020-01-01"), "old").unwrap();
        std::fs::write(temp.path().join("keep.txt"), "keep").unwrap();

        // Files were just created, so nothing is past retention.
        let removed = cleanup_old_logs(temp.path(), 7).unwrap();
        assert_eq!(removed, 0);
        assert!(temp.path().join("keep.txt").exists());
    }

    #[test]
    fn test_cleanup_missing_dir_is_noop() {
        let temp = tempfile::TempDir::new().unwrap();
        let removed = cleanup_old_logs(&temp.path().join("absent"), 7).unwrap();
        assert_eq!(removed, 0);
    }
}
