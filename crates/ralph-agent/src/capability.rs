//! The Agent capability trait and execution types.
//!
//! An [`Agent`] wraps one coding-agent CLI family (claude, opencode, droid,
//! or a custom binary). The engine holds agents as `Arc<dyn Agent>` so the
//! primary instance survives fallback switches and can be reprobed later.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::error::{AgentError, Result};

/// Callback invoked with raw output chunks as the agent produces them.
pub type OutputCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Identifier of an agent plugin family.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentId {
    Claude,
    Opencode,
    Droid,
    /// An operator-supplied binary registered at runtime.
    Custom(String),
}

impl AgentId {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Claude => "claude",
            Self::Opencode => "opencode",
            Self::Droid => "droid",
            Self::Custom(name) => name.as_str(),
        }
    }

    /// Parse an id string; unknown names become [`AgentId::Custom`].
    pub fn parse(s: &str) -> Self {
        match s {
            "claude" => Self::Claude,
            "opencode" => Self::Opencode,
            "droid" => Self::Droid,
            other => Self::Custom(other.to_string()),
        }
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Static metadata describing an agent plugin.
#[derive(Debug, Clone)]
pub struct AgentMeta {
    pub id: AgentId,
    pub supports_subagent_tracing: bool,
}

/// Result of probing whether the agent binary is usable at all.
#[derive(Debug, Clone)]
pub struct DetectOutcome {
    pub available: bool,
    pub error: Option<String>,
}

/// Sandbox behavior requested for agent subprocesses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SandboxMode {
    Off,
    ReadOnly,
    WorkspaceWrite,
}

/// What an agent needs from its sandbox to function.
#[derive(Debug, Clone, Copy, Default)]
pub struct SandboxRequirements {
    pub needs_network: bool,
    pub writes_outside_cwd: bool,
}

/// Initialization options applied once per agent instance.
#[derive(Debug, Clone, Default)]
pub struct AgentOptions {
    pub model: Option<String>,
    pub extra_flags: Vec<String>,
}

/// Per-execution options. Output callbacks receive raw chunks; agents that
/// emit structured events additionally stream them as JSON lines to
/// `on_jsonl_message` when `subagent_tracing` is enabled.
#[derive(Clone, Default)]
pub struct ExecuteOptions {
    pub cwd: PathBuf,
    pub flags: Vec<String>,
    pub env: HashMap<String, String>,
    pub sandbox: Option<SandboxMode>,
    pub timeout: Option<Duration>,
    pub subagent_tracing: bool,
    pub on_stdout: Option<OutputCallback>,
    pub on_stderr: Option<OutputCallback>,
    pub on_jsonl_message: Option<OutputCallback>,
}

impl fmt::Debug for ExecuteOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecuteOptions")
            .field("cwd", &self.cwd)
            .field("flags", &self.flags)
            .field("sandbox", &self.sandbox)
            .field("timeout", &self.timeout)
            .field("subagent_tracing", &self.subagent_tracing)
            .finish_non_exhaustive()
    }
}

/// Terminal status of one agent execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Completed,
    Failed,
    Interrupted,
}

/// Everything the engine learns from one agent run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub duration_ms: u64,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub status: ExecutionStatus,
    pub interrupted: bool,
}

impl AgentResult {
    pub fn succeeded(&self) -> bool {
        self.status == ExecutionStatus::Completed && self.exit_code == 0
    }
}

/// Handle used to interrupt a running execution from another task.
#[derive(Clone)]
pub struct Interrupter {
    notify: Arc<Notify>,
}

impl Interrupter {
    pub fn interrupt(&self) {
        self.notify.notify_one();
    }
}

/// A running agent execution: await [`ExecutionHandle::wait`] for the result,
/// or signal [`ExecutionHandle::interrupt`] to kill the subprocess.
pub struct ExecutionHandle {
    join: JoinHandle<AgentResult>,
    interrupt: Arc<Notify>,
}

impl ExecutionHandle {
    pub fn new(join: JoinHandle<AgentResult>, interrupt: Arc<Notify>) -> Self {
        Self { join, interrupt }
    }

    /// A cloneable interrupter usable while `wait` is pending elsewhere.
    pub fn interrupter(&self) -> Interrupter {
        Interrupter {
            notify: Arc::clone(&self.interrupt),
        }
    }

    pub fn interrupt(&self) {
        self.interrupt.notify_one();
    }

    pub async fn wait(self) -> Result<AgentResult> {
        self.join.await.map_err(|e| AgentError::ExecutionFailed {
            reason: format!("execution task aborted: {e}"),
        })
    }
}

/// Capability interface implemented by every agent plugin.
#[async_trait]
pub trait Agent: Send + Sync {
    /// Static metadata (plugin id, tracing support).
    fn meta(&self) -> AgentMeta;

    /// Check whether the agent binary is present and runnable.
    async fn detect(&self) -> DetectOutcome;

    /// Validate a model name. Returns `Some(reason)` when invalid.
    fn validate_model(&self, model: &str) -> Option<String>;

    /// Apply per-instance options (model, extra flags).
    async fn initialize(&self, options: &AgentOptions) -> Result<()>;

    /// Start one execution. The returned handle owns the subprocess.
    fn execute(
        &self,
        prompt: &str,
        context_files: &[PathBuf],
        opts: ExecuteOptions,
    ) -> Result<ExecutionHandle>;

    /// Release any per-instance resources.
    async fn dispose(&self) -> Result<()>;

    /// Sandbox needs declared by the plugin.
    fn sandbox_requirements(&self) -> SandboxRequirements;
}

/// Resolve an agent binary on PATH, for detect() implementations.
pub fn resolve_binary(binary: &str) -> DetectOutcome {
    match which::which(binary) {
        Ok(_) => DetectOutcome {
            available: true,
            error: None,
        },
        Err(e) => DetectOutcome {
            available: false,
            error: Some(format!("{binary}: {e}")),
        },
    }
}

/// Helper for plugins that read context files into the prompt preamble.
pub fn read_context_files(files: &[PathBuf], cwd: &Path) -> Vec<(PathBuf, String)> {
    let mut out = Vec::new();
    for file in files {
        let path = if file.is_absolute() {
            file.clone()
        } else {
            cwd.join(file)
        };
        if let Ok(content) = std::fs::read_to_string(&path) {
            out.push((file.clone(), content));
        }
    }
    out
}
