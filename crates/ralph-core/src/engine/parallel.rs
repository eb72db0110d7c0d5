//! Parallel engine: a thin façade over the coordinator that publishes the
//! unified engine event stream and aggregates run totals.

use std::sync::Arc;

use tracing::info;

use ralph_tracker::{TaskFilter, TaskStatus, Tracker};

use crate::config::Settings;
use crate::engine::coordinator::{AgentFactory, CoordinatorDeps, ParallelCoordinator};
use crate::engine::main_sync::MainSyncController;
use crate::engine::state::{EngineState, EngineStatus, StateHandle};
use crate::engine::EngineControl;
use crate::error::Result;
use crate::events::{EngineEvent, EngineMode, EventBus, StopReason};
use crate::git::Repository;

pub struct ParallelEngineDeps {
    pub repo: Repository,
    pub tracker: Arc<dyn Tracker>,
    pub bus: EventBus,
    pub settings: Settings,
    pub agent_factory: AgentFactory,
}

pub struct ParallelEngine {
    coordinator: ParallelCoordinator,
    tracker: Arc<dyn Tracker>,
    bus: EventBus,
    state: StateHandle,
    control: EngineControl,
    settings: Settings,
    main_sync: MainSyncController,
}

impl ParallelEngine {
    pub async fn new(deps: ParallelEngineDeps) -> Result<Self> {
        let state = StateHandle::new();
        let control = EngineControl::new();

        let main_sync = MainSyncController::setup(
            deps.repo.clone(),
            &deps.settings.engine.integration_branch,
            deps.bus.clone(),
            Arc::clone(&deps.tracker),
            state.clone(),
            deps.settings.engine.main_sync_max_retries,
            control.shutdown_receiver(),
        )
        .await?;

        let coordinator = ParallelCoordinator::new(CoordinatorDeps {
            repo: deps.repo,
            tracker: Arc::clone(&deps.tracker),
            bus: deps.bus.clone(),
            settings: deps.settings.clone(),
            agent_factory: deps.agent_factory,
            state: state.clone(),
            control: control.clone(),
            main_sync: main_sync.clone(),
        });

        Ok(Self {
            coordinator,
            tracker: deps.tracker,
            bus: deps.bus,
            state,
            control,
            settings: deps.settings,
            main_sync,
        })
    }

    pub fn control(&self) -> EngineControl {
        self.control.clone()
    }

    pub fn state(&self) -> StateHandle {
        self.state.clone()
    }

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
        self.bus.emit(EngineEvent::EngineStarted {
            total_tasks: total,
            max_iterations: self.settings.engine.max_iterations,
            mode: EngineMode::Parallel,
        });

        let run_result = self.coordinator.run().await;

        if self.main_sync.has_pending() && !self.control.is_stopping() {
            self.main_sync.drain().await;
        }

        let stop_reason = match &run_result {
            Err(_) => StopReason::Error,
            Ok(()) if self.control.is_stopping() => StopReason::Stopped,
            Ok(()) => {
                if self.tracker.is_complete().await.unwrap_or(false) {
                    StopReason::Completed
                } else {
                    StopReason::NoTasks
                }
            }
        };

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
        });

        info!(
            category = "engine.parallel",
            reason = ?stop_reason,
            iterations,
            completed,
            "Parallel engine stopped"
        );
        run_result?;
        Ok(self.state.snapshot())
    }
}
