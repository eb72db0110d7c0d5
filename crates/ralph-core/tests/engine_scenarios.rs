//! End-to-end engine scenarios against real git repositories, with scripted
//! agents standing in for the coding-agent CLIs.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ralph_agent::testing::{ScriptedAgent, ScriptedOutcome};
use ralph_agent::AgentId;
use ralph_core::engine::agent_state::AgentSlot;
use ralph_core::engine::state::EngineStatus;
use ralph_core::events::{EngineEvent, StopReason, SwitchReason};
use ralph_core::{EngineDeps, EventBus, Repository, SequentialEngine, Settings};
use ralph_tracker::{JsonTracker, Task, TaskFilter, TaskStatus, Tracker};

async fn init_repo(dir: &Path) -> Repository {
    for args in [
        vec!["init", "-b", "main"],
        vec!["config", "user.email", "test@example.com"],
        vec!["config", "user.name", "Test"],
        vec!["config", "commit.gpgsign", "false"],
    ] {
        let out = std::process::Command::new("git")
            .args(&args)
            .current_dir(dir)
            .output()
            .unwrap();
        assert!(out.status.success(), "git {args:?} failed");
    }
    std::fs::write(dir.join("seed.txt"), "seed\n").unwrap();
    git_commit_all(dir, "initial");
    Repository::at(dir)
}

fn git_commit_all(cwd: &Path, message: &str) {
    for args in [
        vec!["add", "-A"],
        vec!["commit", "-m", message, "--no-verify"],
    ] {
        let out = std::process::Command::new("git")
            .args(&args)
            .current_dir(cwd)
            .output()
            .unwrap();
        assert!(
            out.status.success(),
            "git {args:?} failed: {}",
            String::from_utf8_lossy(&out.stderr)
        );
    }
}

async fn tracker_with(dir: &Path, tasks: Vec<Task>) -> Arc<JsonTracker> {
    let tracker = Arc::new(JsonTracker::open(dir.join(".ralph-tui").join("tasks.json")).unwrap());
    tracker.seed(tasks).await.unwrap();
    tracker
}

fn record_events(bus: &EventBus) -> (Arc<Mutex<Vec<EngineEvent>>>, ralph_core::events::Subscription) {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    let sub = bus.subscribe(move |e| sink.lock().unwrap().push(e.clone()));
    (events, sub)
}

fn names(events: &Arc<Mutex<Vec<EngineEvent>>>) -> Vec<String> {
    events
        .lock()
        .unwrap()
        .iter()
        .map(|e| e.name().to_string())
        .collect()
}

fn slot(id: AgentId, agent: ScriptedAgent) -> AgentSlot {
    AgentSlot {
        id,
        agent: Arc::new(agent),
    }
}

fn settings() -> Settings {
    let mut settings = Settings::default();
    settings.engine.max_retries = 2;
    settings.engine.base_backoff_ms = 10;
    settings.engine.retry_delay_ms = 10;
    settings
}

async fn engine_with(
    repo: Repository,
    tracker: Arc<JsonTracker>,
    primary: AgentSlot,
    fallbacks: Vec<AgentSlot>,
    bus: EventBus,
    settings: Settings,
) -> SequentialEngine {
    SequentialEngine::new(EngineDeps {
        repo,
        tracker: tracker as Arc<dyn Tracker>,
        primary,
        fallbacks,
        bus,
        settings,
    })
    .await
    .unwrap()
}

/// Happy path: one task, agent commits and signals completion.
#[tokio::test]
async fn test_happy_path_single_task() {
    let temp = tempfile::TempDir::new().unwrap();
    let repo = init_repo(temp.path()).await;
    let tracker = tracker_with(temp.path(), vec![Task::new("T1", "Add README")]).await;

    let agent = ScriptedAgent::new(AgentId::Claude).with_outcome(
        ScriptedOutcome::complete("done").with_side_effect(|cwd| {
            std::fs::write(cwd.join("README.md"), "# readme\n").unwrap();
            git_commit_all(cwd, "T1: Add README");
        }),
    );

    let bus = EventBus::new();
    let (events, _sub) = record_events(&bus);
    let mut engine = engine_with(
        repo,
        Arc::clone(&tracker),
        slot(AgentId::Claude, agent),
        vec![],
        bus,
        settings(),
    )
    .await;

    let state = engine.run().await.unwrap();
    assert_eq!(state.status, EngineStatus::Complete);
    assert_eq!(state.tasks_completed, 1);
    assert_eq!(state.current_iteration, 1);

    let tasks = tracker.get_tasks(&TaskFilter::default()).await.unwrap();
    assert_eq!(tasks[0].status, TaskStatus::Completed);

    let names = names(&events);
    let expected_order = [
        "engine:started",
        "task:selected",
        "task:activated",
        "iteration:started",
        "agent:output",
        "main-sync-succeeded",
        "task:completed",
        "iteration:completed",
        "all:complete",
        "engine:stopped",
    ];
    let mut cursor = 0;
    for expected in expected_order {
        let found = names[cursor..].iter().position(|n| n == expected);
        assert!(found.is_some(), "missing {expected} after index {cursor} in {names:?}");
        cursor += found.unwrap() + 1;
    }

    // Artifacts and progress landed under the state dir.
    assert!(temp
        .path()
        .join(".ralph-tui/iterations/1/result.json")
        .exists());
    assert!(temp.path().join(".ralph-tui/progress.md").exists());

    match events.lock().unwrap().last().unwrap() {
        EngineEvent::EngineStopped {
            reason,
            total_iterations,
            tasks_completed,
        } => {
            assert_eq!(*reason, StopReason::Completed);
            assert_eq!(*total_iterations, 1);
            assert_eq!(*tasks_completed, 1);
        }
        other => panic!("unexpected terminal event {other:?}"),
    };
}

/// Rate limit on the primary twice, then fallback succeeds.
#[tokio::test]
async fn test_rate_limit_fallback_chain() {
    let temp = tempfile::TempDir::new().unwrap();
    let repo = init_repo(temp.path()).await;
    let tracker = tracker_with(temp.path(), vec![Task::new("T1", "Add README")]).await;

    let primary = ScriptedAgent::new(AgentId::Claude)
        .with_outcome(ScriptedOutcome::rate_limited(
            "rate limit exceeded, try again in 1 seconds",
        ))
        .with_outcome(ScriptedOutcome::rate_limited(
            "rate limit exceeded, try again in 1 seconds",
        ));
    let fallback = ScriptedAgent::new(AgentId::Opencode).with_outcome(
        ScriptedOutcome::complete("done").with_side_effect(|cwd| {
            std::fs::write(cwd.join("README.md"), "# readme\n").unwrap();
            git_commit_all(cwd, "T1: Add README");
        }),
    );

    let bus = EventBus::new();
    let (events, _sub) = record_events(&bus);
    tokio::time::pause();
    let mut engine = engine_with(
        repo,
        Arc::clone(&tracker),
        slot(AgentId::Claude, primary),
        vec![slot(AgentId::Opencode, fallback)],
        bus,
        settings(),
    )
    .await;
    let state = engine.run().await.unwrap();
    tokio::time::resume();

    assert_eq!(state.status, EngineStatus::Complete);
    assert_eq!(state.tasks_completed, 1);
    // Two rate-limited iterations plus the successful one on the fallback.
    assert_eq!(state.current_iteration, 3);

    let recorded = events.lock().unwrap().clone();
    let rate_limits: Vec<(String, u32, u64, bool)> = recorded
        .iter()
        .filter_map(|e| match e {
            EngineEvent::IterationRateLimited {
                agent,
                attempt,
                delay_ms,
                used_retry_after,
                ..
            } => Some((agent.clone(), *attempt, *delay_ms, *used_retry_after)),
            _ => None,
        })
        .collect();
    assert_eq!(
        rate_limits,
        vec![
            ("claude".to_string(), 1, 1000, true),
            ("claude".to_string(), 2, 1000, true),
        ]
    );

    let switch = recorded
        .iter()
        .find_map(|e| match e {
            EngineEvent::AgentSwitched { from, to, reason } => {
                Some((from.clone(), to.clone(), *reason))
            }
            _ => None,
        })
        .unwrap();
    assert_eq!(
        switch,
        (
            "claude".to_string(),
            "opencode".to_string(),
            SwitchReason::Fallback
        )
    );

    let tasks = tracker.get_tasks(&TaskFilter::default()).await.unwrap();
    assert_eq!(tasks[0].status, TaskStatus::Completed);
}

/// A rate limit without a retry-after hint falls back to the exponential
/// schedule (base * 3^attempt) and retries on the same agent while the
/// budget lasts.
#[tokio::test]
async fn test_rate_limit_exponential_backoff_without_hint() {
    let temp = tempfile::TempDir::new().unwrap();
    let repo = init_repo(temp.path()).await;
    let tracker = tracker_with(temp.path(), vec![Task::new("T1", "Add README")]).await;

    let agent = ScriptedAgent::new(AgentId::Claude)
        .with_outcome(ScriptedOutcome::rate_limited("quota exceeded"))
        .with_outcome(ScriptedOutcome::complete("done").with_side_effect(|cwd| {
            std::fs::write(cwd.join("README.md"), "# readme\n").unwrap();
            git_commit_all(cwd, "T1: Add README");
        }));

    let bus = EventBus::new();
    let (events, _sub) = record_events(&bus);
    tokio::time::pause();
    let mut engine = engine_with(
        repo,
        Arc::clone(&tracker),
        slot(AgentId::Claude, agent),
        vec![],
        bus,
        settings(),
    )
    .await;
    let state = engine.run().await.unwrap();
    tokio::time::resume();

    assert_eq!(state.status, EngineStatus::Complete);
    assert_eq!(state.current_iteration, 2);

    let rate_limits: Vec<(u32, u64, bool)> = events
        .lock()
        .unwrap()
        .iter()
        .filter_map(|e| match e {
            EngineEvent::IterationRateLimited {
                attempt,
                delay_ms,
                used_retry_after,
                ..
            } => Some((*attempt, *delay_ms, *used_retry_after)),
            _ => None,
        })
        .collect();
    // base_backoff_ms = 10 in the test settings: first retry waits 10 * 3^1.
    assert_eq!(rate_limits, vec![(1, 30, false)]);
    // No switch: the same agent retried within its budget.
    assert!(!events
        .lock()
        .unwrap()
        .iter()
        .any(|e| matches!(e, EngineEvent::AgentSwitched { .. })));
}

/// Completion signal with a dirty tree: recovery prompt re-invokes the
/// agent, which commits, and the task completes.
#[tokio::test]
async fn test_commit_recovery_success() {
    let temp = tempfile::TempDir::new().unwrap();
    let repo = init_repo(temp.path()).await;
    let tracker = tracker_with(temp.path(), vec![Task::new("T1", "Add README")]).await;

    let agent = ScriptedAgent::new(AgentId::Claude)
        .with_outcome(
            // Claims completion but forgets to commit two files.
            ScriptedOutcome::complete("changed things").with_side_effect(|cwd| {
                std::fs::write(cwd.join("README.md"), "# readme\n").unwrap();
                std::fs::write(cwd.join("NOTES.md"), "notes\n").unwrap();
            }),
        )
        .with_outcome(
            ScriptedOutcome::complete("committed").with_side_effect(|cwd| {
                git_commit_all(cwd, "T1: Add README and notes");
            }),
        );
    let prompt_log = agent.prompt_log();

    let bus = EventBus::new();
    let (events, _sub) = record_events(&bus);
    let mut engine = engine_with(
        repo,
        Arc::clone(&tracker),
        slot(AgentId::Claude, agent),
        vec![],
        bus,
        settings(),
    )
    .await;
    let state = engine.run().await.unwrap();

    assert_eq!(state.status, EngineStatus::Complete);
    assert_eq!(state.tasks_completed, 1);

    let recorded = events.lock().unwrap().clone();
    let recovery = recorded
        .iter()
        .find_map(|e| match e {
            EngineEvent::CommitRecovery {
                attempt,
                max_retries,
                changed_files,
                ..
            } => Some((*attempt, *max_retries, changed_files.clone())),
            _ => None,
        })
        .unwrap();
    assert_eq!(recovery.0, 1);
    assert_eq!(recovery.1, 1);
    assert_eq!(recovery.2.len(), 2);

    // The recovery prompt listed both files and a stdout tail.
    let prompts = prompt_log.lock().unwrap();
    assert_eq!(prompts.len(), 2);
    assert!(prompts[1].contains("README.md"));
    assert!(prompts[1].contains("NOTES.md"));
    assert!(prompts[1].contains("changed things"));

    let tasks = tracker.get_tasks(&TaskFilter::default()).await.unwrap();
    assert_eq!(tasks[0].status, TaskStatus::Completed);
}

/// Recovery exhaustion blocks the task instead of completing it.
#[tokio::test]
async fn test_commit_recovery_exhaustion_blocks_task() {
    let temp = tempfile::TempDir::new().unwrap();
    let repo = init_repo(temp.path()).await;
    let tracker = tracker_with(temp.path(), vec![Task::new("T1", "Add README")]).await;

    let agent = ScriptedAgent::new(AgentId::Claude)
        .with_outcome(ScriptedOutcome::complete("dirty").with_side_effect(|cwd| {
            std::fs::write(cwd.join("left.rs"), "x").unwrap();
        }))
        // The recovery attempt also fails to commit.
        .with_outcome(ScriptedOutcome::complete("still dirty"));

    let bus = EventBus::new();
    let (events, _sub) = record_events(&bus);
    let mut engine = engine_with(
        repo,
        Arc::clone(&tracker),
        slot(AgentId::Claude, agent),
        vec![],
        bus,
        settings(),
    )
    .await;
    let state = engine.run().await.unwrap();

    assert_eq!(state.tasks_completed, 0);
    let tasks = tracker.get_tasks(&TaskFilter::default()).await.unwrap();
    assert_eq!(tasks[0].status, TaskStatus::Blocked);

    let recorded = events.lock().unwrap().clone();
    let blocked = recorded
        .iter()
        .find_map(|e| match e {
            EngineEvent::TaskBlocked { reason, .. } => Some(reason.clone()),
            _ => None,
        })
        .unwrap();
    assert!(blocked.contains("commit recovery failed after 1 attempt"));
}

/// Skip strategy: a failing agent reopens the task and the engine moves on.
#[tokio::test]
async fn test_skip_strategy_resets_task_to_open() {
    let temp = tempfile::TempDir::new().unwrap();
    let repo = init_repo(temp.path()).await;
    let tracker = tracker_with(
        temp.path(),
        vec![Task::new("T1", "Broken"), Task::new("T2", "Works")],
    )
    .await;

    let agent = ScriptedAgent::new(AgentId::Claude)
        .with_outcome(ScriptedOutcome::failed("compile error"))
        .with_outcome(ScriptedOutcome::complete("ok").with_side_effect(|cwd| {
            std::fs::write(cwd.join("fix.txt"), "fixed\n").unwrap();
            git_commit_all(cwd, "T2: works");
        }));

    let mut config = settings();
    config.engine.error_strategy = ralph_core::config::ErrorStrategy::Skip;

    let bus = EventBus::new();
    let (events, _sub) = record_events(&bus);
    let mut engine = engine_with(
        repo,
        Arc::clone(&tracker),
        slot(AgentId::Claude, agent),
        vec![],
        bus,
        config,
    )
    .await;
    let state = engine.run().await.unwrap();

    // T1 skipped (back to open), T2 completed; run ends with NoTasks since a
    // skipped task remains.
    assert_eq!(state.tasks_completed, 1);
    let tasks = tracker.get_tasks(&TaskFilter::default()).await.unwrap();
    let t1 = tasks.iter().find(|t| t.id == "T1").unwrap();
    let t2 = tasks.iter().find(|t| t.id == "T2").unwrap();
    assert_eq!(t1.status, TaskStatus::Open, "skipped task is never left in_progress");
    assert_eq!(t2.status, TaskStatus::Completed);

    let names = names(&events);
    assert!(names.contains(&"task:skipped".to_string()));
    assert!(names.contains(&"iteration:failed".to_string()));
    match events.lock().unwrap().last().unwrap() {
        EngineEvent::EngineStopped { reason, .. } => {
            assert_eq!(*reason, StopReason::NoTasks)
        }
        other => panic!("unexpected terminal event {other:?}"),
    };
}

/// Abort strategy stops the engine with an error after resetting the task.
#[tokio::test]
async fn test_abort_strategy() {
    let temp = tempfile::TempDir::new().unwrap();
    let repo = init_repo(temp.path()).await;
    let tracker = tracker_with(temp.path(), vec![Task::new("T1", "Broken")]).await;

    let agent =
        ScriptedAgent::new(AgentId::Claude).with_outcome(ScriptedOutcome::failed("boom"));

    let mut config = settings();
    config.engine.error_strategy = ralph_core::config::ErrorStrategy::Abort;

    let bus = EventBus::new();
    let (events, _sub) = record_events(&bus);
    let mut engine = engine_with(
        repo,
        Arc::clone(&tracker),
        slot(AgentId::Claude, agent),
        vec![],
        bus,
        config,
    )
    .await;
    let state = engine.run().await.unwrap();

    assert_eq!(state.status, EngineStatus::Error);
    let tasks = tracker.get_tasks(&TaskFilter::default()).await.unwrap();
    assert_eq!(tasks[0].status, TaskStatus::Open);

    match events.lock().unwrap().last().unwrap() {
        EngineEvent::EngineStopped { reason, .. } => assert_eq!(*reason, StopReason::Error),
        other => panic!("unexpected terminal event {other:?}"),
    };
}

/// Retry strategy: failures retry on fresh iteration numbers, then succeed.
#[tokio::test]
async fn test_retry_strategy_uses_fresh_iterations() {
    let temp = tempfile::TempDir::new().unwrap();
    let repo = init_repo(temp.path()).await;
    let tracker = tracker_with(temp.path(), vec![Task::new("T1", "Flaky")]).await;

    let agent = ScriptedAgent::new(AgentId::Claude)
        .with_outcome(ScriptedOutcome::failed("transient"))
        .with_outcome(ScriptedOutcome::complete("ok").with_side_effect(|cwd| {
            std::fs::write(cwd.join("f.txt"), "f\n").unwrap();
            git_commit_all(cwd, "T1: flaky fixed");
        }));

    let bus = EventBus::new();
    let mut engine = engine_with(
        repo,
        Arc::clone(&tracker),
        slot(AgentId::Claude, agent),
        vec![],
        bus,
        settings(),
    )
    .await;
    let state = engine.run().await.unwrap();

    assert_eq!(state.status, EngineStatus::Complete);
    assert_eq!(state.current_iteration, 2, "retry advanced the iteration");
    let numbers: Vec<u64> = state.iterations.iter().map(|r| r.iteration).collect();
    let mut sorted = numbers.clone();
    sorted.sort_unstable();
    sorted.dedup();
    assert_eq!(numbers.len(), sorted.len(), "no iteration number reused");
}

/// `max_iterations` bounds the run even when work remains.
#[tokio::test]
async fn test_max_iterations_bound() {
    let temp = tempfile::TempDir::new().unwrap();
    let repo = init_repo(temp.path()).await;
    let tracker = tracker_with(temp.path(), vec![Task::new("T1", "Endless")]).await;

    // Never signals completion; the task stays in progress.
    let agent = ScriptedAgent::new(AgentId::Claude)
        .with_outcome(ScriptedOutcome::ok("poking around"))
        .with_outcome(ScriptedOutcome::ok("still poking"));

    let mut config = settings();
    config.engine.max_iterations = 2;

    let bus = EventBus::new();
    let (events, _sub) = record_events(&bus);
    let mut engine = engine_with(
        repo,
        Arc::clone(&tracker),
        slot(AgentId::Claude, agent),
        vec![],
        bus,
        config,
    )
    .await;
    let state = engine.run().await.unwrap();

    assert_eq!(state.current_iteration, 2);
    match events.lock().unwrap().last().unwrap() {
        EngineEvent::EngineStopped { reason, .. } => {
            assert_eq!(*reason, StopReason::MaxIterations)
        }
        other => panic!("unexpected terminal event {other:?}"),
    };
}

/// Stop mid-execution interrupts the agent and resets the task to open.
#[tokio::test]
async fn test_stop_interrupts_and_reopens() {
    let temp = tempfile::TempDir::new().unwrap();
    let repo = init_repo(temp.path()).await;
    let tracker = tracker_with(temp.path(), vec![Task::new("T1", "Slow")]).await;

    let agent = ScriptedAgent::new(AgentId::Claude)
        .with_outcome(ScriptedOutcome::ok("never finishes").with_delay(Duration::from_secs(30)));

    let bus = EventBus::new();
    let mut engine = engine_with(
        repo,
        Arc::clone(&tracker),
        slot(AgentId::Claude, agent),
        vec![],
        bus,
        settings(),
    )
    .await;
    let control = engine.control();

    let stopper = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        control.stop();
        // also interrupt the in-flight subprocess
    });
    let control2 = engine.control();
    let interrupter = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(150)).await;
        control2.interrupt();
    });

    let state = engine.run().await.unwrap();
    stopper.await.unwrap();
    interrupter.await.unwrap();

    assert_eq!(state.status, EngineStatus::Stopped);
    let tasks = tracker.get_tasks(&TaskFilter::default()).await.unwrap();
    assert_eq!(
        tasks[0].status,
        TaskStatus::Open,
        "interrupted task must be reset to open"
    );
}
