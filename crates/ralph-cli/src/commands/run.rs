//! `ralph run`: lock, reconcile, build the engine, drive it to completion.

use std::io::{IsTerminal, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tracing::{info, warn};

use ralph_agent::plugins::{CliAgent, CliAgentSpec};
use ralph_agent::{Agent, AgentId, AgentOptions, AgentRegistry};
use ralph_core::engine::agent_state::AgentSlot;
use ralph_core::engine::coordinator::AgentFactory;
use ralph_core::engine::EngineControl;
use ralph_core::lock::{self, AcquireOptions, InstanceLock, LockInfo};
use ralph_core::logs::TrackerEventLog;
use ralph_core::reconcile::{reconcile, ReconcileOptions};
use ralph_core::{
    EngineDeps, EngineState, EngineStatus, EventBus, ParallelEngine, ParallelEngineDeps,
    RalphError, Repository, SequentialEngine, Settings,
};
use ralph_tracker::{Tracker, TrackerChangeWatcher, TrackerRegistry, WatcherConfig};

use crate::cli::RunArgs;
use crate::logging::{cleanup_old_logs, init_logger, LogConfig};

/// Window in which a second Ctrl-C forces exit.
const FORCE_QUIT_WINDOW: Duration = Duration::from_secs(2);

enum Engine {
    Sequential(SequentialEngine),
    Parallel(ParallelEngine),
}

impl Engine {
    fn control(&self) -> EngineControl {
        match self {
            Self::Sequential(engine) => engine.control(),
            Self::Parallel(engine) => engine.control(),
        }
    }

    fn state(&self) -> ralph_core::engine::state::StateHandle {
        match self {
            Self::Sequential(engine) => engine.state(),
            Self::Parallel(engine) => engine.state(),
        }
    }

    async fn run(&mut self) -> ralph_core::Result<EngineState> {
        match self {
            Self::Sequential(engine) => engine.run().await,
            Self::Parallel(engine) => engine.run().await,
        }
    }
}

pub async fn run(cwd: PathBuf, debug: bool, args: RunArgs) -> i32 {
    match try_run(cwd, debug, args).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e}");
            1
        }
    }
}

async fn try_run(cwd: PathBuf, debug: bool, args: RunArgs) -> ralph_core::Result<i32> {
    let mut settings = Settings::load(&cwd)?;
    apply_overrides(&mut settings, &args);
    settings.validate()?;

    let log_config = LogConfig::for_cwd(&cwd, debug, settings.logging.retention_days);
    init_logger(&log_config)?;
    match cleanup_old_logs(&log_config.log_dir, log_config.retention_days) {
        Ok(removed) if removed > 0 => {
            info!(category = "logging", removed, "Removed old log files")
        }
        Ok(_) => {}
        Err(e) => warn!(category = "logging", error = %e, "Log cleanup failed"),
    }

    let repo = Repository::discover(&cwd).await?;
    let cwd = repo.root().to_path_buf();
    let session_id = uuid::Uuid::new_v4().to_string();

    let mut lock = InstanceLock::acquire(
        &cwd,
        &session_id,
        AcquireOptions {
            force: args.force,
            non_interactive: args.non_interactive || !std::io::stdin().is_terminal(),
            confirm_cleanup: Some(Box::new(prompt_stale_lock_cleanup)),
        },
    )?;

    let (sweeper_shutdown, sweeper_rx) = watch::channel(false);
    let sweeper = lock::spawn_sweeper(cwd.clone(), sweeper_rx);

    let result = run_engine(&cwd, repo, settings, &args).await;

    let _ = sweeper_shutdown.send(true);
    sweeper.abort();
    lock.release();

    result
}

async fn run_engine(
    cwd: &Path,
    repo: Repository,
    settings: Settings,
    args: &RunArgs,
) -> ralph_core::Result<i32> {
    let bus = EventBus::new();

    // Agents: the primary must be present and accept the model before the
    // engine starts; fallbacks are best-effort.
    let registry = Arc::new(AgentRegistry::builtin());
    let primary_id = AgentId::parse(&settings.agent.id);
    let agent_options = AgentOptions {
        model: settings.agent.model.clone(),
        extra_flags: Vec::new(),
    };
    let primary = build_agent(&registry, &primary_id, &agent_options).await?;

    let mut fallbacks = Vec::new();
    for name in &settings.agent.fallbacks {
        let id = AgentId::parse(name);
        match build_agent(&registry, &id, &agent_options).await {
            Ok(slot) => fallbacks.push(slot),
            Err(e) => warn!(category = "cli", agent = name.as_str(), error = %e, "Fallback agent unavailable; skipping"),
        }
    }

    // Tracker + change watcher + tracker event log.
    let tracker = TrackerRegistry::builtin().create(&settings.tracker.id, cwd)?;
    let plugin_id = tracker.meta().id;
    let event_log = Arc::new(TrackerEventLog::new(
        cwd,
        &plugin_id,
        settings.logging.tracker_events_plugin.clone(),
    ));
    let log_sub = {
        let event_log = Arc::clone(&event_log);
        bus.subscribe(move |event| event_log.log(event))
    };

    // Resume-time reconciliation before any new work starts.
    let report = reconcile(
        &repo,
        &tracker,
        &settings.engine.integration_branch,
        ReconcileOptions {
            should_reopen: args.reopen_unverified,
        },
    )
    .await?;
    print!("{}", report.render());

    let mut engine = build_engine(
        repo,
        Arc::clone(&tracker),
        registry,
        primary_id,
        primary,
        fallbacks,
        bus.clone(),
        settings,
    )
    .await?;
    let control = engine.control();
    spawn_signal_handler(control, ralph_core::paths::lock_file(cwd));

    let watcher = tracker.persistence_path().map(|path| {
        let sync_tracker = Arc::clone(&tracker);
        let status_bus = bus.clone();
        let engine_state = engine.state();
        TrackerChangeWatcher::spawn(
            path,
            WatcherConfig::default(),
            Arc::new(move || {
                let tracker = Arc::clone(&sync_tracker);
                tokio::spawn(async move {
                    if let Err(e) = tracker.sync().await {
                        warn!(category = "tracker.watch", error = %e, "Tracker refresh failed");
                    }
                });
            }),
            Arc::new(move |status, interval_ms, reason| {
                engine_state
                    .update(|s| s.tracker_realtime_status = Some(status.as_str().to_string()));
                status_bus.emit(ralph_core::EngineEvent::TrackerStatus {
                    status: status.as_str().to_string(),
                    interval_ms,
                    reason: reason.to_string(),
                });
            }),
        )
    });

    let state = engine.run().await?;

    if let Some(watcher) = watcher {
        watcher.join().await;
    }
    drop(log_sub);

    print_summary(&state);
    Ok(match state.status {
        EngineStatus::Complete | EngineStatus::Stopped => 0,
        _ => 1,
    })
}

#[allow(clippy::too_many_arguments)]
async fn build_engine(
    repo: Repository,
    tracker: Arc<dyn Tracker>,
    registry: Arc<AgentRegistry>,
    primary_id: AgentId,
    primary: AgentSlot,
    fallbacks: Vec<AgentSlot>,
    bus: EventBus,
    settings: Settings,
) -> ralph_core::Result<Engine> {
    if settings.engine.max_workers > 1 {
        // Fresh agent instance per worker; the id was validated when the
        // primary was built.
        let factory: AgentFactory = Arc::new(move || {
            registry
                .create(&primary_id)
                .unwrap_or_else(|_| Arc::new(CliAgent::new(CliAgentSpec::claude())))
        });
        Ok(Engine::Parallel(
            ParallelEngine::new(ParallelEngineDeps {
                repo,
                tracker,
                bus,
                settings,
                agent_factory: factory,
            })
            .await?,
        ))
    } else {
        Ok(Engine::Sequential(
            SequentialEngine::new(EngineDeps {
                repo,
                tracker,
                primary,
                fallbacks,
                bus,
                settings,
            })
            .await?,
        ))
    }
}

async fn build_agent(
    registry: &AgentRegistry,
    id: &AgentId,
    options: &AgentOptions,
) -> ralph_core::Result<AgentSlot> {
    let agent: Arc<dyn Agent> = registry.create(id)?;

    let detection = agent.detect().await;
    if !detection.available {
        return Err(RalphError::AgentUnavailable {
            agent: id.to_string(),
            reason: detection
                .error
                .unwrap_or_else(|| "binary not found".to_string()),
        });
    }

    agent.initialize(options).await?;
    Ok(AgentSlot {
        id: id.clone(),
        agent,
    })
}

fn apply_overrides(settings: &mut Settings, args: &RunArgs) {
    if let Some(agent) = &args.agent {
        settings.agent.id = agent.clone();
    }
    if let Some(model) = &args.model {
        settings.agent.model = Some(model.clone());
    }
    if let Some(workers) = args.workers {
        settings.engine.max_workers = workers;
    }
    if let Some(max_iterations) = args.max_iterations {
        settings.engine.max_iterations = max_iterations;
    }
}

fn prompt_stale_lock_cleanup(info: &LockInfo) -> bool {
    eprint!(
        "Found a stale lock from pid {} ({} on {}). Remove it and continue? [y/N] ",
        info.pid,
        info.acquired_at.format("%Y-%m-%d %H:%M:%S UTC"),
        info.hostname
    );
    let _ = std::io::stderr().flush();
    let mut answer = String::new();
    if std::io::stdin().read_line(&mut answer).is_err() {
        return false;
    }
    matches!(answer.trim().to_lowercase().as_str(), "y" | "yes")
}

/// First Ctrl-C requests a cooperative stop; a second within the window
/// forces exit. Even the forced path deletes the lock file first.
fn spawn_signal_handler(control: EngineControl, lock_path: std::path::PathBuf) {
    tokio::spawn(async move {
        let mut last: Option<Instant> = None;
        loop {
            if tokio::signal::ctrl_c().await.is_err() {
                return;
            }
            let now = Instant::now();
            if last
                .map(|t| now.duration_since(t) < FORCE_QUIT_WINDOW)
                .unwrap_or(false)
            {
                eprintln!("\nForced exit.");
                let _ = std::fs::remove_file(&lock_path);
                std::process::exit(130);
            }
            last = Some(now);
            eprintln!("\nStopping after the current iteration (Ctrl-C again to force quit)...");
            control.stop();
        }
    });
}

fn print_summary(state: &EngineState) {
    println!(
        "\nRun finished: {} iteration(s), {}/{} task(s) completed.",
        state.current_iteration, state.tasks_completed, state.total_tasks
    );
    for record in &state.iterations {
        let marker = match (&record.status, record.task_completed) {
            (_, true) => "done",
            (ralph_core::events::IterationStatus::Completed, false) => "progress",
            (ralph_core::events::IterationStatus::Interrupted, _) => "interrupted",
            _ => "failed",
        };
        println!(
            "  [{marker}] iteration {} — {} {}",
            record.iteration, record.task.id, record.task.title
        );
    }
}
