//! Append-only writers: JSONL event logs, per-iteration artifacts, and the
//! human progress log.
//!
//! Every writer swallows its own failures. Logging must never take the
//! engine down, so errors degrade to a `warn!` and nothing else.

use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde_json::json;
use tracing::warn;

use crate::engine::state::IterationResult;
use crate::events::EngineEvent;
use crate::paths;

/// One-line-per-event JSONL file.
pub struct JsonlWriter {
    path: PathBuf,
}

impl JsonlWriter {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Append one JSON value as a line. Failures are swallowed.
    pub fn append(&self, value: &serde_json::Value) {
        if let Err(e) = self.try_append(value) {
            warn!(category = "logs", path = %self.path.display(), error = %e, "JSONL append failed");
        }
    }

    fn try_append(&self, value: &serde_json::Value) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        let line = serde_json::to_string(value)?;
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")
    }
}

/// Tracker event log, gated on a tracker plugin id filter.
pub struct TrackerEventLog {
    writer: JsonlWriter,
    plugin_id: String,
    filter: Option<String>,
}

impl TrackerEventLog {
    pub fn new(cwd: &Path, plugin_id: &str, filter: Option<String>) -> Self {
        Self {
            writer: JsonlWriter::new(paths::tracker_events_log(cwd)),
            plugin_id: plugin_id.to_string(),
            filter,
        }
    }

    /// Record one engine event, unless the filter excludes this plugin.
    pub fn log(&self, event: &EngineEvent) {
        if let Some(filter) = &self.filter {
            if filter != &self.plugin_id {
                return;
            }
        }
        let mut value = match serde_json::to_value(event) {
            Ok(value) => value,
            Err(e) => {
                warn!(category = "logs", error = %e, "Event serialization failed");
                return;
            }
        };
        if let Some(obj) = value.as_object_mut() {
            obj.insert("at".to_string(), json!(Utc::now().to_rfc3339()));
            obj.insert("plugin".to_string(), json!(self.plugin_id));
        }
        self.writer.append(&value);
    }
}

/// Human-readable progress file appended once per iteration. Agents are
/// told never to commit it; it lives under the excluded state dir.
pub struct ProgressLog {
    path: PathBuf,
}

impl ProgressLog {
    pub fn new(cwd: &Path) -> Self {
        Self {
            path: paths::progress_file(cwd),
        }
    }

    pub fn append_entry(&self, iteration: u64, task_id: &str, title: &str, summary: &str) {
        let entry = format!(
            "## Iteration {iteration} — {}\n\n- task: {task_id} — {title}\n- {summary}\n\n",
            Utc::now().format("%Y-%m-%d %H:%M:%S UTC"),
        );
        if let Err(e) = self.try_append(&entry) {
            warn!(category = "logs", path = %self.path.display(), error = %e, "Progress append failed");
        }
    }

    /// Tail of the progress file for prompt context.
    pub fn recent(&self, max_chars: usize) -> Option<String> {
        let content = std::fs::read_to_string(&self.path).ok()?;
        let trimmed = content.trim_end();
        if trimmed.is_empty() {
            return None;
        }
        let chars = trimmed.chars().count();
        if chars <= max_chars {
            Some(trimmed.to_string())
        } else {
            Some(trimmed.chars().skip(chars - max_chars).collect())
        }
    }

    fn try_append(&self, entry: &str) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(entry.as_bytes())
    }
}

/// Per-iteration artifact directory under `.ralph-tui/iterations/<n>/`.
pub struct IterationArtifacts {
    cwd: PathBuf,
}

impl IterationArtifacts {
    pub fn new(cwd: &Path) -> Self {
        Self {
            cwd: cwd.to_path_buf(),
        }
    }

    /// Persist one iteration: the structured result, raw output, an optional
    /// subagent trace, and an optional agent-switch summary.
    pub fn write(
        &self,
        result: &IterationResult,
        subagent_trace: Option<&[String]>,
        completion_summary: Option<&str>,
    ) {
        if let Err(e) = self.try_write(result, subagent_trace, completion_summary) {
            warn!(
                category = "logs",
                iteration = result.iteration,
                error = %e,
                "Iteration artifact write failed"
            );
        }
    }

    fn try_write(
        &self,
        result: &IterationResult,
        subagent_trace: Option<&[String]>,
        completion_summary: Option<&str>,
    ) -> std::io::Result<()> {
        let dir = paths::iteration_dir(&self.cwd, result.iteration);
        std::fs::create_dir_all(&dir)?;

        let json = serde_json::to_string_pretty(result)?;
        std::fs::write(dir.join("result.json"), format!("{json}\n"))?;

        if let Some(agent_result) = &result.agent_result {
            std::fs::write(dir.join("stdout.txt"), &agent_result.stdout)?;
            std::fs::write(dir.join("stderr.txt"), &agent_result.stderr)?;
        }
        if let Some(trace) = subagent_trace {
            if !trace.is_empty() {
                std::fs::write(dir.join("subagents.jsonl"), format!("{}\n", trace.join("\n")))?;
            }
        }
        if let Some(summary) = completion_summary {
            std::fs::write(dir.join("summary.txt"), format!("{summary}\n"))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::IterationStatus;
    use ralph_tracker::Task;

    #[test]
    fn test_jsonl_one_object_per_line() {
        let temp = tempfile::TempDir::new().unwrap();
        let writer = JsonlWriter::new(temp.path().join("log.jsonl"));
        writer.append(&json!({"a": 1}));
        writer.append(&json!({"b": 2}));

        let content = std::fs::read_to_string(temp.path().join("log.jsonl")).unwrap();
        assert!(content.ends_with('\n'));
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        for line in lines {
            serde_json::from_str::<serde_json::Value>(line).unwrap();
        }
    }

    #[test]
    fn test_jsonl_failure_is_swallowed() {
        // Parent is a file, so creating the log dir must fail.
        let temp = tempfile::TempDir::new().unwrap();
        std::fs::write(temp.path().join("blocked"), "file").unwrap();
        let writer = JsonlWriter::new(temp.path().join("blocked").join("log.jsonl"));
        writer.append(&json!({"a": 1}));
    }

    #[test]
    fn test_tracker_log_filter_gate() {
        let temp = tempfile::TempDir::new().unwrap();
        let event = EngineEvent::AllComplete;

        let log = TrackerEventLog::new(temp.path(), "json", Some("beads".to_string()));
        log.log(&event);
        assert!(!paths::tracker_events_log(temp.path()).exists());

        let log = TrackerEventLog::new(temp.path(), "json", Some("json".to_string()));
        log.log(&event);
        let content = std::fs::read_to_string(paths::tracker_events_log(temp.path())).unwrap();
        let value: serde_json::Value = serde_json::from_str(content.lines().next().unwrap()).unwrap();
        assert_eq!(value["event"], "all:complete");
        assert_eq!(value["plugin"], "json");
        assert!(value["at"].is_string());
    }

    #[test]
    fn test_progress_append_and_recent() {
        let temp = tempfile::TempDir::new().unwrap();
        let progress = ProgressLog::new(temp.path());
        assert!(progress.recent(1000).is_none());

        progress.append_entry(1, "T1", "Add README", "completed");
        progress.append_entry(2, "T2", "Fix bug", "rate-limited, retried");

        let recent = progress.recent(10_000).unwrap();
        assert!(recent.contains("Iteration 1"));
        assert!(recent.contains("T2 — Fix bug"));

        let short = progress.recent(20).unwrap();
        assert_eq!(short.chars().count(), 20);
    }

    #[test]
    fn test_iteration_artifacts_layout() {
        let temp = tempfile::TempDir::new().unwrap();
        let artifacts = IterationArtifacts::new(temp.path());
        let now = Utc::now();
        let result = IterationResult {
            iteration: 4,
            status: IterationStatus::Completed,
            task: Task::new("T1", "Add README"),
            agent_result: Some(ralph_agent::AgentResult {
                stdout: "did things\n".to_string(),
                stderr: String::new(),
                exit_code: 0,
                duration_ms: 5,
                started_at: now,
                ended_at: now,
                status: ralph_agent::ExecutionStatus::Completed,
                interrupted: false,
            }),
            task_completed: true,
            promise_complete: true,
            error: None,
        };

        artifacts.write(
            &result,
            Some(&[r#"{"type":"subagent","id":"sa-1"}"#.to_string()]),
            Some("switched claude -> opencode (fallback)"),
        );

        let dir = paths::iteration_dir(temp.path(), 4);
        assert!(dir.join("result.json").exists());
        assert_eq!(
            std::fs::read_to_string(dir.join("stdout.txt")).unwrap(),
            "did things\n"
        );
        assert!(dir.join("subagents.jsonl").exists());
        assert!(std::fs::read_to_string(dir.join("summary.txt"))
            .unwrap()
            .contains("fallback"));
    }

    #[test]
    fn test_iteration_artifacts_omit_optional_files() {
        let temp = tempfile::TempDir::new().unwrap();
        let artifacts = IterationArtifacts::new(temp.path());
        let result = IterationResult {
            iteration: 1,
            status: IterationStatus::Failed,
            task: Task::new("T1", "A"),
            agent_result: None,
            task_completed: false,
            promise_complete: false,
            error: Some("boom".to_string()),
        };
        artifacts.write(&result, None, None);

        let dir = paths::iteration_dir(temp.path(), 1);
        assert!(dir.join("result.json").exists());
        assert!(!dir.join("stdout.txt").exists());
        assert!(!dir.join("subagents.jsonl").exists());
        assert!(!dir.join("summary.txt").exists());
    }
}
