//! Parallel coordinator: dispatches ready tasks to idle workers and owns the
//! worker lifecycle.
//!
//! Workers never share state. Each one exclusively owns its worktree, its
//! agent instance, and its busy flag (transitioned only here); coordination
//! flows through the tracker (claims), the merge queue, and the event bus.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{info, warn};

use ralph_agent::envelope::{build_env, prepare_dirs, EnvelopeContext};
use ralph_agent::{Agent, AgentResult, ExecuteOptions};
use ralph_tracker::{ClaimOutcome, Task, TaskFilter, TaskStatus, Tracker};

use crate::config::Settings;
use crate::engine::main_sync::MainSyncController;
use crate::engine::merge_queue::{MergeOutcome, MergeQueue};
use crate::engine::prompt::{commit_message, contains_completion_sentinel, PromptBuilder};
use crate::engine::state::{IterationResult, StateHandle};
use crate::engine::EngineControl;
use crate::error::Result;
use crate::events::{EngineEvent, EventBus, IterationStatus, OutputStream};
use crate::git::Repository;
use crate::paths;
use crate::worktree::{CreateWorktreeRequest, WorkerWorktree, WorktreeManager};

/// Fresh agent instances per owner, behind the registry.
pub type AgentFactory = Arc<dyn Fn() -> Arc<dyn Agent> + Send + Sync>;

pub struct CoordinatorDeps {
    pub repo: Repository,
    pub tracker: Arc<dyn Tracker>,
    pub bus: EventBus,
    pub settings: Settings,
    pub agent_factory: AgentFactory,
    pub state: StateHandle,
    pub control: EngineControl,
    pub main_sync: MainSyncController,
}

struct Worker {
    worker_id: String,
    worktree: WorkerWorktree,
    agent: Arc<dyn Agent>,
    busy: bool,
    base_commit: String,
}

struct WorkerDone {
    worker_index: usize,
    task: Task,
    iteration: u64,
    result: std::result::Result<AgentResult, String>,
}

struct TaskProgress {
    task: Task,
    iteration: u64,
    commits: Vec<String>,
    failed: bool,
}

pub struct ParallelCoordinator {
    repo: Repository,
    tracker: Arc<dyn Tracker>,
    bus: EventBus,
    settings: Settings,
    agent_factory: AgentFactory,
    state: StateHandle,
    control: EngineControl,
    main_sync: MainSyncController,
    prompt_builder: PromptBuilder,
    workers: Vec<Worker>,
    in_flight: HashSet<String>,
    merging: HashMap<String, TaskProgress>,
    done_tx: mpsc::UnboundedSender<WorkerDone>,
    done_rx: mpsc::UnboundedReceiver<WorkerDone>,
}

impl ParallelCoordinator {
    pub fn new(deps: CoordinatorDeps) -> Self {
        let (done_tx, done_rx) = mpsc::unbounded_channel();
        let prompt_builder =
            PromptBuilder::new(deps.tracker.template(), deps.tracker.prd_context());
        Self {
            repo: deps.repo,
            tracker: deps.tracker,
            bus: deps.bus,
            settings: deps.settings,
            agent_factory: deps.agent_factory,
            state: deps.state,
            control: deps.control,
            main_sync: deps.main_sync,
            prompt_builder,
            workers: Vec::new(),
            in_flight: HashSet::new(),
            merging: HashMap::new(),
            done_tx,
            done_rx,
        }
    }

    /// Run the dispatch loop until no worker is busy and no open or
    /// in-progress task remains.
    pub async fn run(&mut self) -> Result<()> {
        self.create_workers().await?;

        let (merge_tx, mut merge_rx) = mpsc::unbounded_channel::<MergeOutcome>();
        let merge_queue = MergeQueue::spawn(
            self.repo.clone(),
            self.bus.clone(),
            Some((self.agent_factory)()),
            merge_tx,
        );

        loop {
            while let Ok(done) = self.done_rx.try_recv() {
                self.handle_worker_done(done, &merge_queue).await;
            }
            while let Ok(outcome) = merge_rx.try_recv() {
                self.handle_merge_outcome(outcome).await;
            }

            if self.control.is_stopping() {
                if !self.any_busy() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
                continue;
            }
            if self.control.is_paused() {
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            }

            let Some(idle) = self.workers.iter().position(|w| !w.busy) else {
                tokio::time::sleep(Duration::from_millis(50)).await;
                continue;
            };

            let filter = TaskFilter::with_statuses(&[TaskStatus::Open])
                .excluding(self.in_flight.iter().cloned());
            let next = self.tracker.get_next_task(&filter).await?;
            let Some(task) = next else {
                if self.finished().await? {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            };

            if !self.claim(&task, idle).await? {
                tokio::time::sleep(Duration::from_millis(50)).await;
                continue;
            }
            self.dispatch(idle, task).await?;
        }

        merge_queue.shutdown().await;
        self.teardown_workers().await;
        Ok(())
    }

    async fn create_workers(&mut self) -> Result<()> {
        let manager = WorktreeManager::new(self.repo.clone());
        let requests: Vec<CreateWorktreeRequest> = (0..self.settings.engine.max_workers)
            .map(|i| {
                CreateWorktreeRequest::new(format!("worker-{i}"), "HEAD").locked("ralph worker")
            })
            .collect();
        let worktrees = manager.create_worktrees(requests).await?;

        for worktree in worktrees {
            let base_commit = worktree.commit.clone();
            self.workers.push(Worker {
                worker_id: worktree.worker_id.clone(),
                worktree,
                agent: (self.agent_factory)(),
                busy: false,
                base_commit,
            });
        }
        info!(
            category = "engine.parallel",
            workers = self.workers.len(),
            "Worker pool ready"
        );
        Ok(())
    }

    async fn teardown_workers(&mut self) {
        let manager = WorktreeManager::new(self.repo.clone());
        for worker in &self.workers {
            if let Err(e) = manager.remove_worktree(&worker.worker_id, false).await {
                warn!(
                    category = "engine.parallel",
                    worker = worker.worker_id.as_str(),
                    error = %e,
                    "Worktree teardown failed"
                );
            }
        }
        self.workers.clear();
    }

    fn any_busy(&self) -> bool {
        self.workers.iter().any(|w| w.busy)
    }

    /// Exit condition: nothing running, nothing merging, nothing left to do.
    async fn finished(&self) -> Result<bool> {
        if self.any_busy() || !self.merging.is_empty() {
            return Ok(false);
        }
        let remaining = self
            .tracker
            .get_tasks(&TaskFilter::with_statuses(&[
                TaskStatus::Open,
                TaskStatus::InProgress,
            ]))
            .await?;
        Ok(remaining.is_empty())
    }

    async fn claim(&mut self, task: &Task, worker_index: usize) -> Result<bool> {
        let worker_id = self.workers[worker_index].worker_id.clone();
        let claimed = match self.tracker.claim_task(&task.id, &worker_id).await? {
            ClaimOutcome::Claimed => true,
            ClaimOutcome::Contended => false,
            ClaimOutcome::Unsupported => self
                .tracker
                .update_task_status(&task.id, TaskStatus::InProgress)
                .await
                .is_ok(),
        };
        Ok(claimed)
    }

    async fn dispatch(&mut self, worker_index: usize, task: Task) -> Result<()> {
        let iteration = self.state.next_iteration();
        {
            let worker = &mut self.workers[worker_index];
            worker.busy = true;
            let wt_repo = Repository::at(&worker.worktree.path);
            worker.base_commit = wt_repo.head_commit().await?;
        }
        let worker_id = self.workers[worker_index].worker_id.clone();

        self.in_flight.insert(task.id.clone());
        self.bus.emit(EngineEvent::TaskClaimed {
            task_id: task.id.clone(),
            worker_id: worker_id.clone(),
            iteration,
        });
        self.bus.emit(EngineEvent::WorkerStarted {
            worker_id,
            task_id: task.id.clone(),
        });

        let prompt = self.prompt_builder.build_parallel(&task);
        let exec_opts = self.worker_exec_opts(&self.workers[worker_index]);
        let agent = Arc::clone(&self.workers[worker_index].agent);
        let done_tx = self.done_tx.clone();

        tokio::spawn(async move {
            let result = match agent.execute(&prompt, &[], exec_opts) {
                Ok(handle) => handle.wait().await.map_err(|e| e.to_string()),
                Err(e) => Err(e.to_string()),
            };
            let _ = done_tx.send(WorkerDone {
                worker_index,
                task,
                iteration,
                result,
            });
        });
        Ok(())
    }

    fn worker_exec_opts(&self, worker: &Worker) -> ExecuteOptions {
        let agent_id = worker.agent.meta().id;
        let ctx = EnvelopeContext {
            agent_id,
            cwd: worker.worktree.path.clone(),
            state_dir: paths::state_dir(&worker.worktree.path),
            shim_dir: Some(paths::shim_bin_dir(&worker.worktree.path)),
        };
        prepare_dirs(&ctx);
        let env = build_env(&ctx);

        let bus_out = self.bus.clone();
        let bus_err = self.bus.clone();
        let id_out = worker.worker_id.clone();
        let id_err = worker.worker_id.clone();

        ExecuteOptions {
            cwd: worker.worktree.path.clone(),
            flags: Vec::new(),
            env,
            sandbox: None,
            timeout: self.settings.agent_timeout(),
            subagent_tracing: false,
            on_stdout: Some(Arc::new(move |chunk: &str| {
                bus_out.emit(EngineEvent::AgentOutput {
                    stream: OutputStream::Stdout,
                    chunk: chunk.to_string(),
                    worker_id: Some(id_out.clone()),
                });
            })),
            on_stderr: Some(Arc::new(move |chunk: &str| {
                bus_err.emit(EngineEvent::AgentOutput {
                    stream: OutputStream::Stderr,
                    chunk: chunk.to_string(),
                    worker_id: Some(id_err.clone()),
                });
            })),
            on_jsonl_message: None,
        }
    }

    async fn handle_worker_done(&mut self, done: WorkerDone, merge_queue: &MergeQueue) {
        let (worker_id, worktree_path) = {
            let worker = &mut self.workers[done.worker_index];
            worker.busy = false;
            (worker.worker_id.clone(), worker.worktree.path.clone())
        };

        let completed = matches!(&done.result, Ok(r) if r.exit_code == 0 && contains_completion_sentinel(&r.stdout));
        self.bus.emit(EngineEvent::WorkerFinished {
            worker_id: worker_id.clone(),
            task_id: done.task.id.clone(),
            completed,
        });

        let agent_result = done.result.as_ref().ok().cloned();
        self.state.record_iteration(IterationResult {
            iteration: done.iteration,
            status: if completed {
                IterationStatus::Completed
            } else {
                IterationStatus::Failed
            },
            task: done.task.clone(),
            agent_result,
            task_completed: false,
            promise_complete: completed,
            error: done.result.as_ref().err().cloned(),
        });

        if !completed {
            let reason = match &done.result {
                Ok(r) => format!("worker finished without completion signal (exit {})", r.exit_code),
                Err(e) => format!("worker execution failed: {e}"),
            };
            self.reopen(&done.task, &reason).await;
            return;
        }

        match self
            .collect_commits(&worktree_path, done.worker_index, &done.task)
            .await
        {
            Ok(commits) if commits.is_empty() => {
                self.complete_after_sync(done.task.clone(), Vec::new(), done.iteration)
                    .await;
                self.in_flight.remove(&done.task.id);
            }
            Ok(commits) => {
                self.merging.insert(
                    done.task.id.clone(),
                    TaskProgress {
                        task: done.task.clone(),
                        iteration: done.iteration,
                        commits: commits.clone(),
                        failed: false,
                    },
                );
                merge_queue.enqueue_task_commits(&done.task, &worker_id, &commits, done.iteration);
            }
            Err(e) => {
                self.reopen(&done.task, &format!("commit collection failed: {e}"))
                    .await;
            }
        }
    }

    /// Auto-commit leftovers in the worker worktree, then list the task's
    /// commits oldest-first for the merge queue.
    async fn collect_commits(
        &mut self,
        worktree_path: &std::path::Path,
        worker_index: usize,
        task: &Task,
    ) -> Result<Vec<String>> {
        let wt_repo = Repository::at(worktree_path);
        if !wt_repo.is_clean_filtered().await? {
            let message = commit_message(&task.id, &task.title);
            wt_repo.commit_all_filtered(&message).await?;
        }
        let base = self.workers[worker_index].base_commit.clone();
        let commits = wt_repo.rev_list_range(&base, "HEAD").await?;
        self.workers[worker_index].base_commit = wt_repo.head_commit().await?;
        Ok(commits)
    }

    async fn handle_merge_outcome(&mut self, outcome: MergeOutcome) {
        if let Some(progress) = self.merging.get_mut(&outcome.task_id) {
            if !outcome.success {
                progress.failed = true;
            }
        }
        if outcome.remaining_for_task > 0 {
            return;
        }
        let Some(progress) = self.merging.remove(&outcome.task_id) else {
            return;
        };
        self.in_flight.remove(&outcome.task_id);

        if progress.failed {
            self.reopen(&progress.task, "merge failed; work preserved on worker branch")
                .await;
            return;
        }
        self.complete_after_sync(progress.task, progress.commits, progress.iteration)
            .await;
    }

    async fn complete_after_sync(&mut self, task: Task, commits: Vec<String>, iteration: u64) {
        let gated = match self
            .main_sync
            .gate_task_completion(&task, &commits, iteration)
            .await
        {
            Ok(gated) => gated,
            Err(e) => {
                warn!(category = "engine.parallel", task = task.id.as_str(), error = %e, "Main sync gating failed");
                false
            }
        };
        if !gated {
            return;
        }

        if let Err(e) = self
            .tracker
            .complete_task(&task.id, "all commits merged")
            .await
        {
            warn!(category = "engine.parallel", task = task.id.as_str(), error = %e, "complete_task failed");
            return;
        }
        self.bus.emit(EngineEvent::TaskCompleted {
            task_id: task.id.clone(),
            iteration,
        });
        self.state.update(|s| {
            s.tasks_completed += 1;
            if let Some(record) = s.iterations.iter_mut().find(|r| r.iteration == iteration) {
                record.task_completed = true;
            }
        });
    }

    async fn reopen(&mut self, task: &Task, reason: &str) {
        self.in_flight.remove(&task.id);
        if let Err(e) = self.tracker.release_task(&task.id, reason).await {
            warn!(category = "engine.parallel", task = task.id.as_str(), error = %e, "release_task failed");
        }
        if let Err(e) = self
            .tracker
            .update_task_status(&task.id, TaskStatus::Open)
            .await
        {
            warn!(category = "engine.parallel", task = task.id.as_str(), error = %e, "status reset failed");
        }
        self.bus.emit(EngineEvent::TaskReopened {
            task_id: task.id.clone(),
            reason: reason.to_string(),
        });
    }
}
