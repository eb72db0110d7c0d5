//! Scripted agent used by engine tests.
//!
//! Plays back a queue of canned outcomes, optionally running a side effect
//! in the execution cwd first (e.g. committing a file the way a real agent
//! would). Prompts are recorded for assertions.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Notify;

use crate::capability::{
    Agent, AgentId, AgentMeta, AgentOptions, AgentResult, DetectOutcome, ExecuteOptions,
    ExecutionHandle, ExecutionStatus, SandboxRequirements,
};
use crate::error::Result;

pub type SideEffect = Arc<dyn Fn(&Path) + Send + Sync>;

/// One canned execution result.
#[derive(Clone)]
pub struct ScriptedOutcome {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub delay: Duration,
    pub side_effect: Option<SideEffect>,
}

impl ScriptedOutcome {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: String::new(),
            exit_code: 0,
            delay: Duration::ZERO,
            side_effect: None,
        }
    }

    /// A run that claims completion via the sentinel.
    pub fn complete(stdout: impl Into<String>) -> Self {
        let mut stdout = stdout.into();
        stdout.push_str("\n<promise>COMPLETE</promise>\n");
        Self::ok(stdout)
    }

    pub fn failed(stderr: impl Into<String>) -> Self {
        Self {
            stdout: String::new(),
            stderr: stderr.into(),
            exit_code: 1,
            delay: Duration::ZERO,
            side_effect: None,
        }
    }

    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::failed(message)
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_side_effect<F>(mut self, effect: F) -> Self
    where
        F: Fn(&Path) + Send + Sync + 'static,
    {
        self.side_effect = Some(Arc::new(effect));
        self
    }
}

/// Queue-driven [`Agent`] implementation for tests.
pub struct ScriptedAgent {
    id: AgentId,
    outcomes: Mutex<VecDeque<ScriptedOutcome>>,
    prompts: Arc<Mutex<Vec<String>>>,
    available: bool,
}

impl ScriptedAgent {
    pub fn new(id: AgentId) -> Self {
        Self {
            id,
            outcomes: Mutex::new(VecDeque::new()),
            prompts: Arc::new(Mutex::new(Vec::new())),
            available: true,
        }
    }

    pub fn unavailable(mut self) -> Self {
        self.available = false;
        self
    }

    pub fn with_outcome(self, outcome: ScriptedOutcome) -> Self {
        self.push_outcome(outcome);
        self
    }

    pub fn push_outcome(&self, outcome: ScriptedOutcome) {
        self.outcomes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(outcome);
    }

    /// Prompts seen so far, in execution order.
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Shared handle to the prompt log, for assertions after the agent moved.
    pub fn prompt_log(&self) -> Arc<Mutex<Vec<String>>> {
        Arc::clone(&self.prompts)
    }
}

#[async_trait]
impl Agent for ScriptedAgent {
    fn meta(&self) -> AgentMeta {
        AgentMeta {
            id: self.id.clone(),
            supports_subagent_tracing: false,
        }
    }

    async fn detect(&self) -> DetectOutcome {
        DetectOutcome {
            available: self.available,
            error: (!self.available).then(|| "scripted as unavailable".to_string()),
        }
    }

    fn validate_model(&self, _model: &str) -> Option<String> {
        None
    }

    async fn initialize(&self, _options: &AgentOptions) -> Result<()> {
        Ok(())
    }

    fn execute(
        &self,
        prompt: &str,
        _context_files: &[PathBuf],
        opts: ExecuteOptions,
    ) -> Result<ExecutionHandle> {
        self.prompts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(prompt.to_string());

        let outcome = self
            .outcomes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
            .unwrap_or_else(|| ScriptedOutcome::ok(""));

        let interrupt = Arc::new(Notify::new());
        let interrupt_task = Arc::clone(&interrupt);
        let join = tokio::spawn(async move {
            let started_at = Utc::now();
            let mut interrupted = false;
            if !outcome.delay.is_zero() {
                tokio::select! {
                    _ = tokio::time::sleep(outcome.delay) => {}
                    _ = interrupt_task.notified() => interrupted = true,
                }
            }

            if !interrupted {
                if let Some(effect) = &outcome.side_effect {
                    effect(&opts.cwd);
                }
                if let Some(cb) = &opts.on_stdout {
                    for line in outcome.stdout.lines() {
                        cb(line);
                    }
                }
                if let Some(cb) = &opts.on_stderr {
                    for line in outcome.stderr.lines() {
                        cb(line);
                    }
                }
            }

            AgentResult {
                stdout: if interrupted { String::new() } else { outcome.stdout },
                stderr: if interrupted { String::new() } else { outcome.stderr },
                exit_code: if interrupted { -1 } else { outcome.exit_code },
                duration_ms: outcome.delay.as_millis() as u64,
                started_at,
                ended_at: Utc::now(),
                status: if interrupted {
                    ExecutionStatus::Interrupted
                } else if outcome.exit_code == 0 {
                    ExecutionStatus::Completed
                } else {
                    ExecutionStatus::Failed
                },
                interrupted,
            }
        });

        Ok(ExecutionHandle::new(join, interrupt))
    }

    async fn dispose(&self) -> Result<()> {
        Ok(())
    }

    fn sandbox_requirements(&self) -> SandboxRequirements {
        SandboxRequirements::default()
    }
}
