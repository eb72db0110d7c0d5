//! Sequential engine: one agent, one task at a time, in the main checkout.
//!
//! The loop integrates every failure policy: error strategies, rate-limit
//! backoff with the fallback chain, commit recovery after dirty completion
//! signals, and main-sync gating before a task may complete.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{info, warn};

use ralph_agent::envelope::{build_env, prepare_dirs, EnvelopeContext};
use ralph_agent::{AgentResult, ExecuteOptions, ExecutionSample, ExecutionStatus};
use ralph_tracker::{TaskFilter, TaskStatus, Tracker};
use ralph_tracker::Task;

use crate::config::Settings;
use crate::engine::agent_state::{AgentSlot, AgentStateMachine};
use crate::engine::main_sync::MainSyncController;
use crate::engine::prompt::{contains_completion_sentinel, PromptBuilder};
use crate::engine::recovery::{CommitRecovery, RecoveryOutcome};
use crate::engine::state::{EngineState, EngineStatus, IterationResult, StateHandle};
use crate::engine::subagents::SubagentTracker;
use crate::engine::EngineControl;
use crate::error::{RalphError, Result};
use crate::events::{
    EngineEvent, EngineMode, EventBus, IterationStatus, OutputStream, StopReason, SwitchReason,
};
use crate::git::Repository;
use crate::logs::{IterationArtifacts, ProgressLog};
use crate::paths;

/// Everything a sequential engine needs to run.
pub struct EngineDeps {
    pub repo: Repository,
    pub tracker: Arc<dyn Tracker>,
    pub primary: AgentSlot,
    pub fallbacks: Vec<AgentSlot>,
    pub bus: EventBus,
    pub settings: Settings,
}

enum SingleOutcome {
    Done,
    RateLimited { retry_after: Option<u64> },
    Interrupted,
}

enum IterFlow {
    Continue,
    Abort,
}

pub struct SequentialEngine {
    repo: Repository,
    cwd: PathBuf,
    tracker: Arc<dyn Tracker>,
    agents: AgentStateMachine,
    bus: EventBus,
    state: StateHandle,
    settings: Settings,
    prompt_builder: PromptBuilder,
    main_sync: MainSyncController,
    progress: ProgressLog,
    artifacts: IterationArtifacts,
    subagents: SubagentTracker,
    control: EngineControl,
    skipped: HashSet<String>,
    /// Raw JSONL trace lines observed during the current iteration.
    trace: Arc<Mutex<Vec<String>>>,
}

impl SequentialEngine {
    pub async fn new(deps: EngineDeps) -> Result<Self> {
        let cwd = deps.repo.root().to_path_buf();
        let bus = deps.bus;
        let state = StateHandle::new();
        let control = EngineControl::new();

        let main_sync = MainSyncController::setup(
            deps.repo.clone(),
            &deps.settings.engine.integration_branch,
            bus.clone(),
            Arc::clone(&deps.tracker),
            state.clone(),
            deps.settings.engine.main_sync_max_retries,
            control.shutdown_receiver(),
        )
        .await?;

        let agents = AgentStateMachine::new(
            deps.primary,
            deps.fallbacks,
            bus.clone(),
            deps.settings.engine.base_backoff_ms,
        );

        let prompt_builder =
            PromptBuilder::new(deps.tracker.template(), deps.tracker.prd_context());

        Ok(Self {
            repo: deps.repo,
            progress: ProgressLog::new(&cwd),
            artifacts: IterationArtifacts::new(&cwd),
            subagents: SubagentTracker::new(state.clone(), bus.clone()),
            cwd,
            tracker: deps.tracker,
            agents,
            bus,
            state,
            settings: deps.settings,
            prompt_builder,
            main_sync,
            control,
            skipped: HashSet::new(),
            trace: Arc::new(Mutex::new(Vec::new())),
        })
    }

    /// Control surface for the CLI / signal handlers.
    pub fn control(&self) -> EngineControl {
        self.control.clone()
    }

    pub fn state(&self) -> StateHandle {
        self.state.clone()
    }

    /// Drive the loop to completion. Returns the final state snapshot.
    pub async fn run(&mut self) -> Result<EngineState> {
        let total = self
            .tracker
            .get_tasks(&TaskFilter::with_statuses(&[
                TaskStatus::Open,
                TaskStatus::InProgress,
            ]))
            .await?
            .len();

        self.state.update(|s| {
            s.status = EngineStatus::Running;
            s.started_at = Some(chrono::Utc::now());
            s.total_tasks = total;
        });
        self.sync_agent_state();
        self.bus.emit(EngineEvent::EngineStarted {
            total_tasks: total,
            max_iterations: self.settings.engine.max_iterations,
            mode: EngineMode::Sequential,
        });

        let stop_reason = self.main_loop().await?;

        // Let any pending-main retries settle before declaring the run over.
        if self.main_sync.has_pending() && !self.control.is_stopping() {
            self.main_sync.drain().await;
        }

        let (iterations, completed) = self
            .state
            .update(|s| (s.current_iteration, s.tasks_completed));
        if stop_reason == StopReason::Completed {
            self.bus.emit(EngineEvent::AllComplete);
        }
        self.bus.emit(EngineEvent::EngineStopped {
            reason: stop_reason,
            total_iterations: iterations,
            tasks_completed: completed,
        });
        self.state.update(|s| {
            s.status = match stop_reason {
                StopReason::Completed => EngineStatus::Complete,
                StopReason::Error => EngineStatus::Error,
                _ => EngineStatus::Stopped,
            };
            s.current_task = None;
        });

        info!(
            category = "engine",
            reason = ?stop_reason,
            iterations,
            completed,
            "Engine stopped"
        );
        Ok(self.state.snapshot())
    }

    async fn main_loop(&mut self) -> Result<StopReason> {
        loop {
            if self.control.is_stopping() {
                self.state.update(|s| s.status = EngineStatus::Stopping);
                return Ok(StopReason::Stopped);
            }
            if self.control.is_paused() {
                self.honor_pause().await;
                continue;
            }

            // Probe the primary between iterations while on a fallback.
            if self.settings.engine.recover_primary_between_iterations
                && self.agents.reason() == SwitchReason::Fallback
            {
                self.agents.try_recover_primary(&self.cwd).await;
                self.sync_agent_state();
            }

            let max = self.settings.engine.max_iterations;
            if max > 0 && self.state.snapshot().current_iteration >= max {
                return Ok(StopReason::MaxIterations);
            }

            if self.tracker.is_complete().await? {
                return Ok(StopReason::Completed);
            }

            let filter = TaskFilter::with_statuses(&[TaskStatus::Open, TaskStatus::InProgress])
                .excluding(self.skipped.iter().cloned());
            let Some(task) = self.tracker.get_next_task(&filter).await? else {
                // Only skipped tasks remain.
                return Ok(StopReason::NoTasks);
            };

            let is_new_task = self
                .state
                .snapshot()
                .current_task
                .map(|t| t.id != task.id)
                .unwrap_or(true);
            if is_new_task {
                self.agents.clear_task_limits();
            }
            self.state.update(|s| s.current_task = Some(task.clone()));

            let iteration = self.state.next_iteration();
            self.bus.emit(EngineEvent::TaskSelected {
                task: task.clone(),
                iteration,
            });

            match self.run_iteration_with_error_handling(&task, iteration).await? {
                IterFlow::Continue => {}
                IterFlow::Abort => return Ok(StopReason::Error),
            }
        }
    }

    async fn honor_pause(&self) {
        self.state.update(|s| s.status = EngineStatus::Pausing);
        self.bus.emit(EngineEvent::EnginePaused);
        self.state.update(|s| s.status = EngineStatus::Paused);
        while self.control.is_paused() && !self.control.is_stopping() {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        if !self.control.is_stopping() {
            self.state.update(|s| s.status = EngineStatus::Running);
            self.bus.emit(EngineEvent::EngineResumed);
        }
    }

    /// One task attempt, including rate-limit retries and the error
    /// strategy. Each retry advances to a fresh iteration number.
    async fn run_iteration_with_error_handling(
        &mut self,
        task: &Task,
        first_iteration: u64,
    ) -> Result<IterFlow> {
        let mut iteration = first_iteration;
        let mut rate_limit_attempts: u32 = 0;
        let mut error_retries: u32 = 0;

        loop {
            match self.run_single_iteration(task, iteration).await {
                Ok(SingleOutcome::Done) => return Ok(IterFlow::Continue),
                Ok(SingleOutcome::Interrupted) => {
                    self.reset_task_to_open(task, "interrupted").await;
                    return Ok(IterFlow::Continue);
                }
                Ok(SingleOutcome::RateLimited { retry_after }) => {
                    rate_limit_attempts += 1;
                    let (delay_ms, used_retry_after) =
                        self.agents.backoff_delay(rate_limit_attempts, retry_after);
                    self.bus.emit(EngineEvent::IterationRateLimited {
                        agent: self.agents.active().id.to_string(),
                        attempt: rate_limit_attempts,
                        delay_ms,
                        used_retry_after,
                        iteration,
                    });
                    self.agents.mark_active_limited();
                    self.sync_agent_state();

                    if !self
                        .control
                        .cancellable_sleep(Duration::from_millis(delay_ms))
                        .await
                    {
                        return Ok(IterFlow::Continue);
                    }

                    if rate_limit_attempts >= self.settings.engine.max_retries {
                        match self.agents.switch_to_fallback() {
                            Some(_) => {
                                rate_limit_attempts = 0;
                                self.sync_agent_state();
                            }
                            None => {
                                self.agents.emit_all_limited();
                                self.control.pause();
                                return Ok(IterFlow::Continue);
                            }
                        }
                    }
                    iteration = self.state.next_iteration();
                }
                Err(e) => {
                    warn!(
                        category = "engine",
                        task = task.id.as_str(),
                        iteration,
                        error = %e,
                        "Iteration failed"
                    );
                    self.bus.emit(EngineEvent::IterationFailed {
                        iteration,
                        task_id: task.id.clone(),
                        error: e.to_string(),
                    });
                    self.bus.emit(EngineEvent::EngineError {
                        phase: crate::events::Phase::Execution,
                        task_id: Some(task.id.clone()),
                        reason: e.to_string(),
                        iteration: Some(iteration),
                    });

                    match self.settings.engine.error_strategy {
                        crate::config::ErrorStrategy::Retry => {
                            error_retries += 1;
                            if error_retries <= self.settings.engine.max_retries {
                                let delay =
                                    Duration::from_millis(self.settings.engine.retry_delay_ms);
                                if !self.control.cancellable_sleep(delay).await {
                                    return Ok(IterFlow::Continue);
                                }
                                iteration = self.state.next_iteration();
                                continue;
                            }
                            self.skip_task(task, "retries exhausted").await;
                            return Ok(IterFlow::Continue);
                        }
                        crate::config::ErrorStrategy::Skip => {
                            self.skip_task(task, &e.to_string()).await;
                            return Ok(IterFlow::Continue);
                        }
                        crate::config::ErrorStrategy::Abort => {
                            self.reset_task_to_open(task, "aborted").await;
                            return Ok(IterFlow::Abort);
                        }
                    }
                }
            }
        }
    }

    async fn run_single_iteration(
        &mut self,
        task: &Task,
        iteration: u64,
    ) -> Result<SingleOutcome> {
        self.tracker
            .update_task_status(&task.id, TaskStatus::InProgress)
            .await?;
        self.bus.emit(EngineEvent::TaskActivated {
            task_id: task.id.clone(),
        });

        let recent = self.progress.recent(2000);
        let prompt = self
            .prompt_builder
            .build_sequential(task, recent.as_deref());

        self.bus.emit(EngineEvent::IterationStarted {
            iteration,
            task_id: task.id.clone(),
        });

        self.trace.lock().unwrap_or_else(|e| e.into_inner()).clear();
        let agent_at_start = self.agents.active().id.clone();
        let head_before = self.repo.head_commit().await?;

        let slot = self.agents.active().clone();
        let exec_opts = self.main_exec_opts(&slot.id);
        let handle = slot.agent.execute(&prompt, &[], exec_opts)?;
        self.control.set_interrupter(Some(handle.interrupter()));
        let result = handle.wait().await?;
        self.control.set_interrupter(None);

        if result.interrupted || result.status == ExecutionStatus::Interrupted {
            self.record_iteration(task, iteration, IterationStatus::Interrupted, result, false, false);
            return Ok(SingleOutcome::Interrupted);
        }

        let detection = self.agents.detector().detect(ExecutionSample {
            stdout: &result.stdout,
            stderr: &result.stderr,
            exit_code: result.exit_code,
            agent_id: &slot.id,
        });
        if detection.is_rate_limit {
            return Ok(SingleOutcome::RateLimited {
                retry_after: detection.retry_after,
            });
        }

        if result.exit_code != 0 {
            return Err(RalphError::IterationFailed {
                reason: crate::engine::prompt::output_tail(&result.stderr, 10, 800),
            });
        }

        let promise_complete = contains_completion_sentinel(&result.stdout);
        let mut task_completed = false;

        if promise_complete {
            let recovery = CommitRecovery {
                repo: &self.repo,
                bus: &self.bus,
                task,
                iteration,
            };
            let outcome = recovery
                .run(
                    &slot.agent,
                    &prompt,
                    &result.stdout,
                    self.main_exec_opts(&slot.id),
                )
                .await?;

            match outcome {
                RecoveryOutcome::Clean | RecoveryOutcome::Recovered { .. } => {
                    let commits = self
                        .repo
                        .rev_list_range(&head_before, "HEAD")
                        .await
                        .unwrap_or_default();
                    if self
                        .main_sync
                        .gate_task_completion(task, &commits, iteration)
                        .await?
                    {
                        self.tracker
                            .complete_task(&task.id, "completion signal received")
                            .await?;
                        self.bus.emit(EngineEvent::TaskCompleted {
                            task_id: task.id.clone(),
                            iteration,
                        });
                        task_completed = true;
                    }
                }
                RecoveryOutcome::Exhausted {
                    attempts,
                    changed_files,
                } => {
                    self.tracker
                        .update_task_status(&task.id, TaskStatus::Blocked)
                        .await?;
                    self.bus.emit(EngineEvent::TaskBlocked {
                        task_id: task.id.clone(),
                        reason: format!(
                            "commit recovery failed after {attempts} attempt(s); {} file(s) left uncommitted",
                            changed_files.len()
                        ),
                    });
                }
            }
        }

        let switched = self.agents.active().id != agent_at_start;
        let summary = switched.then(|| {
            format!(
                "agent switched during iteration: {} -> {}",
                agent_at_start,
                self.agents.active().id
            )
        });

        self.finish_iteration(
            task,
            iteration,
            result,
            promise_complete,
            task_completed,
            summary,
        );
        Ok(SingleOutcome::Done)
    }

    fn finish_iteration(
        &mut self,
        task: &Task,
        iteration: u64,
        result: AgentResult,
        promise_complete: bool,
        task_completed: bool,
        completion_summary: Option<String>,
    ) {
        let record = IterationResult {
            iteration,
            status: IterationStatus::Completed,
            task: task.clone(),
            agent_result: Some(result),
            task_completed,
            promise_complete,
            error: None,
        };

        let trace: Vec<String> = {
            let lines = self.trace.lock().unwrap_or_else(|e| e.into_inner());
            lines.clone()
        };
        self.artifacts.write(
            &record,
            (!trace.is_empty()).then_some(trace.as_slice()),
            completion_summary.as_deref(),
        );
        self.progress.append_entry(
            iteration,
            &task.id,
            &task.title,
            if task_completed {
                "completed"
            } else if promise_complete {
                "completion signalled, held back"
            } else {
                "in progress"
            },
        );
        self.state.record_iteration(record);

        self.bus.emit(EngineEvent::IterationCompleted {
            iteration,
            task_id: task.id.clone(),
            status: IterationStatus::Completed,
            promise_complete,
            task_completed,
        });
    }

    fn record_iteration(
        &mut self,
        task: &Task,
        iteration: u64,
        status: IterationStatus,
        result: AgentResult,
        promise_complete: bool,
        task_completed: bool,
    ) {
        let record = IterationResult {
            iteration,
            status,
            task: task.clone(),
            agent_result: Some(result),
            task_completed,
            promise_complete,
            error: None,
        };
        self.artifacts.write(&record, None, None);
        self.state.record_iteration(record);
        self.bus.emit(EngineEvent::IterationCompleted {
            iteration,
            task_id: task.id.clone(),
            status,
            promise_complete,
            task_completed,
        });
    }

    async fn skip_task(&mut self, task: &Task, reason: &str) {
        self.bus.emit(EngineEvent::TaskSkipped {
            task_id: task.id.clone(),
            reason: reason.to_string(),
        });
        self.reset_task_to_open(task, reason).await;
        self.skipped.insert(task.id.clone());
    }

    /// A task the engine walks away from is never left `in_progress`.
    async fn reset_task_to_open(&self, task: &Task, reason: &str) {
        if let Err(e) = self.tracker.release_task(&task.id, reason).await {
            warn!(category = "engine", task = task.id.as_str(), error = %e, "release_task failed");
        }
        if let Err(e) = self
            .tracker
            .update_task_status(&task.id, TaskStatus::Open)
            .await
        {
            warn!(category = "engine", task = task.id.as_str(), error = %e, "status reset failed");
        }
        self.bus.emit(EngineEvent::TaskReopened {
            task_id: task.id.clone(),
            reason: reason.to_string(),
        });
    }

    fn main_exec_opts(&self, agent_id: &ralph_agent::AgentId) -> ExecuteOptions {
        let ctx = EnvelopeContext {
            agent_id: agent_id.clone(),
            cwd: self.cwd.clone(),
            state_dir: paths::state_dir(&self.cwd),
            shim_dir: None,
        };
        prepare_dirs(&ctx);
        let env = build_env(&ctx);

        let bus_out = self.bus.clone();
        let bus_err = self.bus.clone();
        let trace = Arc::clone(&self.trace);
        let subagents = self.subagents.clone();
        let tracing_supported = self.agents.active().agent.meta().supports_subagent_tracing;

        ExecuteOptions {
            cwd: self.cwd.clone(),
            flags: Vec::new(),
            env,
            sandbox: None,
            timeout: self.settings.agent_timeout(),
            subagent_tracing: self.settings.agent.subagent_tracing && tracing_supported,
            on_stdout: Some(Arc::new(move |chunk: &str| {
                bus_out.emit(EngineEvent::AgentOutput {
                    stream: OutputStream::Stdout,
                    chunk: chunk.to_string(),
                    worker_id: None,
                });
            })),
            on_stderr: Some(Arc::new(move |chunk: &str| {
                bus_err.emit(EngineEvent::AgentOutput {
                    stream: OutputStream::Stderr,
                    chunk: chunk.to_string(),
                    worker_id: None,
                });
            })),
            on_jsonl_message: Some(Arc::new(move |line: &str| {
                trace
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .push(line.to_string());
                subagents.observe(line);
            })),
        }
    }

    fn sync_agent_state(&self) {
        let active = self.agents.active_agent_state();
        let rate_limit = self.agents.rate_limit_state();
        self.state.update(|s| {
            s.active_agent = Some(active);
            s.rate_limit = Some(rate_limit);
        });
    }
}
