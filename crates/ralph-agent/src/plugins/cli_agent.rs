//! Generic CLI-backed agent plugin.
//!
//! All built-in agent families shell out to a headless CLI; the differences
//! are flag spelling, prompt delivery, and model naming rules, captured in a
//! [`CliAgentSpec`] per family.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::capability::{
    resolve_binary, Agent, AgentId, AgentMeta, AgentOptions, AgentResult, DetectOutcome,
    ExecuteOptions, ExecutionHandle, ExecutionStatus, OutputCallback, SandboxRequirements,
};
use crate::error::{AgentError, Result};

/// How the prompt reaches the CLI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptStyle {
    /// Appended as the final positional argument.
    Arg,
    /// Written to the child's stdin, then stdin is closed.
    Stdin,
}

/// Model naming rule enforced by `validate_model`.
#[derive(Debug, Clone)]
pub enum ModelRule {
    AnyNonEmpty,
    /// Must start with one of these prefixes.
    Prefixes(&'static [&'static str]),
    /// Must be `provider/model`.
    ProviderSlash,
}

/// Static description of one CLI agent family.
#[derive(Debug, Clone)]
pub struct CliAgentSpec {
    pub id: AgentId,
    pub binary: &'static str,
    pub base_args: &'static [&'static str],
    pub model_flag: Option<&'static str>,
    /// Extra flags appended when subagent tracing is requested.
    pub tracing_args: &'static [&'static str],
    pub prompt_style: PromptStyle,
    pub model_rule: ModelRule,
    pub supports_subagent_tracing: bool,
    pub requirements: SandboxRequirements,
}

impl CliAgentSpec {
    pub fn claude() -> Self {
        Self {
            id: AgentId::Claude,
            binary: "claude",
            base_args: &["--print", "--dangerously-skip-permissions"],
            model_flag: Some("--model"),
            tracing_args: &["--output-format", "stream-json", "--verbose"],
            prompt_style: PromptStyle::Arg,
            model_rule: ModelRule::Prefixes(&["claude-", "sonnet", "opus", "haiku"]),
            supports_subagent_tracing: true,
            requirements: SandboxRequirements {
                needs_network: true,
                writes_outside_cwd: false,
            },
        }
    }

    pub fn opencode() -> Self {
        Self {
            id: AgentId::Opencode,
            binary: "opencode",
            base_args: &["run"],
            model_flag: Some("--model"),
            tracing_args: &["--print-logs"],
            prompt_style: PromptStyle::Arg,
            model_rule: ModelRule::ProviderSlash,
            supports_subagent_tracing: false,
            requirements: SandboxRequirements {
                needs_network: true,
                writes_outside_cwd: true,
            },
        }
    }

    pub fn droid() -> Self {
        Self {
            id: AgentId::Droid,
            binary: "droid",
            base_args: &["exec"],
            model_flag: Some("--model"),
            tracing_args: &[],
            prompt_style: PromptStyle::Stdin,
            model_rule: ModelRule::AnyNonEmpty,
            supports_subagent_tracing: false,
            requirements: SandboxRequirements {
                needs_network: true,
                writes_outside_cwd: false,
            },
        }
    }
}

/// An agent plugin backed by a headless CLI binary.
pub struct CliAgent {
    spec: CliAgentSpec,
    options: Mutex<AgentOptions>,
}

impl CliAgent {
    pub fn new(spec: CliAgentSpec) -> Self {
        Self {
            spec,
            options: Mutex::new(AgentOptions::default()),
        }
    }

    fn build_args(&self, opts: &ExecuteOptions, prompt: &str) -> Vec<String> {
        let mut args: Vec<String> = self.spec.base_args.iter().map(|s| s.to_string()).collect();

        let options = self.options.lock().unwrap_or_else(|e| e.into_inner());
        if let (Some(flag), Some(model)) = (self.spec.model_flag, options.model.as_ref()) {
            args.push(flag.to_string());
            args.push(model.clone());
        }
        args.extend(options.extra_flags.iter().cloned());
        drop(options);

        if opts.subagent_tracing && self.spec.supports_subagent_tracing {
            args.extend(self.spec.tracing_args.iter().map(|s| s.to_string()));
        }
        args.extend(opts.flags.iter().cloned());

        if self.spec.prompt_style == PromptStyle::Arg {
            args.push(prompt.to_string());
        }
        args
    }
}

#[async_trait]
impl Agent for CliAgent {
    fn meta(&self) -> AgentMeta {
        AgentMeta {
            id: self.spec.id.clone(),
            supports_subagent_tracing: self.spec.supports_subagent_tracing,
        }
    }

    async fn detect(&self) -> DetectOutcome {
        resolve_binary(self.spec.binary)
    }

    fn validate_model(&self, model: &str) -> Option<String> {
        let model = model.trim();
        if model.is_empty() {
            return Some("model name is empty".to_string());
        }
        match &self.spec.model_rule {
            ModelRule::AnyNonEmpty => None,
            ModelRule::Prefixes(prefixes) => {
                if prefixes.iter().any(|p| model.starts_with(p)) {
                    None
                } else {
                    Some(format!(
                        "unknown model '{}' (expected one of the {} families)",
                        model,
                        prefixes.join(", ")
                    ))
                }
            }
            ModelRule::ProviderSlash => {
                if model.contains('/') {
                    None
                } else {
                    Some(format!("model '{model}' must be 'provider/model'"))
                }
            }
        }
    }

    async fn initialize(&self, options: &AgentOptions) -> Result<()> {
        if let Some(model) = &options.model {
            if let Some(reason) = self.validate_model(model) {
                return Err(AgentError::InvalidModel {
                    agent: self.spec.id.to_string(),
                    reason,
                });
            }
        }
        let mut slot = self.options.lock().unwrap_or_else(|e| e.into_inner());
        *slot = options.clone();
        Ok(())
    }

    fn execute(
        &self,
        prompt: &str,
        context_files: &[PathBuf],
        opts: ExecuteOptions,
    ) -> Result<ExecutionHandle> {
        let mut full_prompt = String::new();
        for (path, content) in crate::capability::read_context_files(context_files, &opts.cwd) {
            full_prompt.push_str(&format!("<context file=\"{}\">\n", path.display()));
            full_prompt.push_str(&content);
            full_prompt.push_str("\n</context>\n\n");
        }
        full_prompt.push_str(prompt);

        let args = self.build_args(&opts, &full_prompt);
        let mut cmd = Command::new(self.spec.binary);
        cmd.args(&args)
            .current_dir(&opts.cwd)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(if self.spec.prompt_style == PromptStyle::Stdin {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .kill_on_drop(true);
        for (key, value) in &opts.env {
            cmd.env(key, value);
        }

        let stdin_payload =
            (self.spec.prompt_style == PromptStyle::Stdin).then(|| full_prompt.clone());

        debug!(
            category = "agent.exec",
            agent = %self.spec.id,
            cwd = %opts.cwd.display(),
            "Launching agent subprocess"
        );

        let interrupt = Arc::new(Notify::new());
        let join = tokio::spawn(run_subprocess(
            cmd,
            stdin_payload,
            opts,
            Arc::clone(&interrupt),
        ));
        Ok(ExecutionHandle::new(join, interrupt))
    }

    async fn dispose(&self) -> Result<()> {
        Ok(())
    }

    fn sandbox_requirements(&self) -> SandboxRequirements {
        self.spec.requirements
    }
}

struct StreamSink {
    collected: Arc<Mutex<String>>,
    callback: Option<OutputCallback>,
    jsonl: Option<OutputCallback>,
}

async fn pump_stream<R>(reader: Option<R>, sink: StreamSink)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let Some(reader) = reader else { return };
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        {
            let mut collected = sink.collected.lock().unwrap_or_else(|e| e.into_inner());
            collected.push_str(&line);
            collected.push('\n');
        }
        if let Some(cb) = &sink.callback {
            cb(&line);
        }
        if let Some(jsonl) = &sink.jsonl {
            let trimmed = line.trim_start();
            if trimmed.starts_with('{') {
                jsonl(trimmed);
            }
        }
    }
}

async fn run_subprocess(
    mut cmd: Command,
    stdin_payload: Option<String>,
    opts: ExecuteOptions,
    interrupt: Arc<Notify>,
) -> AgentResult {
    let started_at = Utc::now();
    let start = Instant::now();

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => {
            return AgentResult {
                stdout: String::new(),
                stderr: format!("failed to spawn agent: {e}"),
                exit_code: -1,
                duration_ms: 0,
                started_at,
                ended_at: Utc::now(),
                status: ExecutionStatus::Failed,
                interrupted: false,
            }
        }
    };

    if let Some(payload) = stdin_payload {
        if let Some(mut stdin) = child.stdin.take() {
            if let Err(e) = stdin.write_all(payload.as_bytes()).await {
                warn!(category = "agent.exec", error = %e, "Failed to write prompt to stdin");
            }
            // Dropping stdin closes the pipe so the agent sees EOF.
        }
    }

    let collected_out = Arc::new(Mutex::new(String::new()));
    let collected_err = Arc::new(Mutex::new(String::new()));

    let out_task = tokio::spawn(pump_stream(
        child.stdout.take(),
        StreamSink {
            collected: Arc::clone(&collected_out),
            callback: opts.on_stdout.clone(),
            jsonl: opts
                .subagent_tracing
                .then(|| opts.on_jsonl_message.clone())
                .flatten(),
        },
    ));
    let err_task = tokio::spawn(pump_stream(
        child.stderr.take(),
        StreamSink {
            collected: Arc::clone(&collected_err),
            callback: opts.on_stderr.clone(),
            jsonl: None,
        },
    ));

    enum WaitEnd {
        Exited(Option<std::process::ExitStatus>),
        Interrupted,
        TimedOut,
    }

    let end = tokio::select! {
        status = child.wait() => WaitEnd::Exited(status.ok()),
        _ = interrupt.notified() => WaitEnd::Interrupted,
        _ = sleep_or_forever(opts.timeout) => WaitEnd::TimedOut,
    };

    let mut interrupted = false;
    let mut timed_out = false;
    let status = match end {
        WaitEnd::Exited(status) => status,
        WaitEnd::Interrupted => {
            interrupted = true;
            let _ = child.start_kill();
            child.wait().await.ok()
        }
        WaitEnd::TimedOut => {
            timed_out = true;
            let _ = child.start_kill();
            child.wait().await.ok()
        }
    };

    let _ = out_task.await;
    let _ = err_task.await;

    let stdout = collected_out.lock().unwrap_or_else(|e| e.into_inner()).clone();
    let mut stderr = collected_err.lock().unwrap_or_else(|e| e.into_inner()).clone();
    if timed_out {
        stderr.push_str("\nagent execution timed out\n");
    }

    let exit_code = status.and_then(|s| s.code()).unwrap_or(-1);
    let status = if interrupted {
        ExecutionStatus::Interrupted
    } else if exit_code == 0 && !timed_out {
        ExecutionStatus::Completed
    } else {
        ExecutionStatus::Failed
    };

    AgentResult {
        stdout,
        stderr,
        exit_code,
        duration_ms: start.elapsed().as_millis() as u64,
        started_at,
        ended_at: Utc::now(),
        status,
        interrupted,
    }
}

async fn sleep_or_forever(timeout: Option<Duration>) {
    match timeout {
        Some(d) => tokio::time::sleep(d).await,
        None => std::future::pending().await,
    }
}
