//! Commit-recovery loop.
//!
//! Runs only when the agent claimed completion but left a dirty tree (after
//! filtering the engine's own state paths). The agent is re-prompted with
//! the changed files and a bounded tail of its own output; retries are
//! bounded by [`COMMIT_RECOVERY_MAX_RETRIES`].

use std::sync::Arc;

use tracing::{info, warn};

use ralph_agent::{Agent, ExecuteOptions};
use ralph_tracker::Task;

use crate::config::COMMIT_RECOVERY_MAX_RETRIES;
use crate::engine::prompt::build_recovery_prompt;
use crate::error::Result;
use crate::events::{EngineEvent, EventBus};
use crate::git::Repository;

/// Outcome of one recovery pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryOutcome {
    /// The tree was already clean; nothing to recover.
    Clean,
    Recovered {
        attempts: u32,
    },
    Exhausted {
        attempts: u32,
        changed_files: Vec<String>,
    },
}

pub struct CommitRecovery<'a> {
    pub repo: &'a Repository,
    pub bus: &'a EventBus,
    pub task: &'a Task,
    pub iteration: u64,
}

impl CommitRecovery<'_> {
    /// Drive the bounded re-prompt loop until the tree is clean or retries
    /// run out.
    pub async fn run(
        &self,
        agent: &Arc<dyn Agent>,
        original_prompt: &str,
        stdout: &str,
        exec_opts: ExecuteOptions,
    ) -> Result<RecoveryOutcome> {
        let mut changed = self.repo.changed_files_filtered().await?;
        if changed.is_empty() {
            return Ok(RecoveryOutcome::Clean);
        }

        for attempt in 1..=COMMIT_RECOVERY_MAX_RETRIES {
            info!(
                category = "engine.recovery",
                task = self.task.id.as_str(),
                attempt,
                files = changed.len(),
                "Attempting commit recovery"
            );
            self.bus.emit(EngineEvent::CommitRecovery {
                task_id: self.task.id.clone(),
                attempt,
                max_retries: COMMIT_RECOVERY_MAX_RETRIES,
                reason: "uncommitted changes".to_string(),
                changed_files: changed.clone(),
                iteration: self.iteration,
            });

            let prompt = build_recovery_prompt(original_prompt, &changed, stdout);
            let handle = agent.execute(&prompt, &[], exec_opts.clone())?;
            let result = handle.wait().await?;
            if result.interrupted {
                break;
            }

            changed = self.repo.changed_files_filtered().await?;
            if changed.is_empty() {
                return Ok(RecoveryOutcome::Recovered { attempts: attempt });
            }
        }

        warn!(
            category = "engine.recovery",
            task = self.task.id.as_str(),
            remaining = changed.len(),
            "Commit recovery exhausted"
        );
        Ok(RecoveryOutcome::Exhausted {
            attempts: COMMIT_RECOVERY_MAX_RETRIES,
            changed_files: changed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::init_repo;
    use ralph_agent::testing::{ScriptedAgent, ScriptedOutcome};
    use ralph_agent::AgentId;
    use std::sync::Mutex;

    fn exec_opts(cwd: &std::path::Path) -> ExecuteOptions {
        ExecuteOptions {
            cwd: cwd.to_path_buf(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_clean_tree_short_circuits() {
        let temp = tempfile::TempDir::new().unwrap();
        let repo = init_repo(temp.path()).await;
        let task = Task::new("T1", "A");
        let bus = EventBus::new();
        let recovery = CommitRecovery {
            repo: &repo,
            bus: &bus,
            task: &task,
            iteration: 1,
        };

        let agent: Arc<dyn Agent> = Arc::new(ScriptedAgent::new(AgentId::Claude));
        let outcome = recovery
            .run(&agent, "p", "", exec_opts(temp.path()))
            .await
            .unwrap();
        assert_eq!(outcome, RecoveryOutcome::Clean);
    }

    #[tokio::test]
    async fn test_recovery_commits_and_succeeds() {
        let temp = tempfile::TempDir::new().unwrap();
        let repo = init_repo(temp.path()).await;
        // The agent "forgot" to commit these.
        std::fs::write(temp.path().join("left.rs"), "left").unwrap();
        std::fs::write(temp.path().join("over.rs"), "over").unwrap();

        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let bus = EventBus::new();
        let _sub = bus.subscribe(move |e| sink.lock().unwrap().push(e.clone()));

        let task = Task::new("T1", "A");
        let recovery = CommitRecovery {
            repo: &repo,
            bus: &bus,
            task: &task,
            iteration: 3,
        };

        let agent = ScriptedAgent::new(AgentId::Claude).with_outcome(
            ScriptedOutcome::complete("committed now").with_side_effect(|cwd| {
                crate::test_support::git_commit_all_sync(cwd, "T1: finish work");
            }),
        );
        let prompt_log = agent.prompt_log();
        let agent: Arc<dyn Agent> = Arc::new(agent);

        let outcome = recovery
            .run(
                &agent,
                "original prompt",
                "tail line",
                exec_opts(temp.path()),
            )
            .await
            .unwrap();
        assert_eq!(outcome, RecoveryOutcome::Recovered { attempts: 1 });

        // Event carries both changed files and the bounded retry budget.
        let events = events.lock().unwrap();
        match &events[0] {
            EngineEvent::CommitRecovery {
                attempt,
                max_retries,
                changed_files,
                reason,
                ..
            } => {
                assert_eq!(*attempt, 1);
                assert_eq!(*max_retries, COMMIT_RECOVERY_MAX_RETRIES);
                assert_eq!(changed_files.len(), 2);
                assert_eq!(reason, "uncommitted changes");
            }
            other => panic!("unexpected event {other:?}"),
        }

        // The recovery prompt names the files and the stdout tail.
        let prompts = prompt_log.lock().unwrap();
        assert!(prompts[0].contains("left.rs"));
        assert!(prompts[0].contains("over.rs"));
        assert!(prompts[0].contains("tail line"));
    }

    #[tokio::test]
    async fn test_recovery_exhausts() {
        let temp = tempfile::TempDir::new().unwrap();
        let repo = init_repo(temp.path()).await;
        std::fs::write(temp.path().join("left.rs"), "left").unwrap();

        let task = Task::new("T1", "A");
        let bus = EventBus::new();
        let recovery = CommitRecovery {
            repo: &repo,
            bus: &bus,
            task: &task,
            iteration: 1,
        };

        // Agent claims completion but never commits.
        let agent: Arc<dyn Agent> = Arc::new(
            ScriptedAgent::new(AgentId::Claude).with_outcome(ScriptedOutcome::complete("sure")),
        );
        let outcome = recovery
            .run(&agent, "p", "", exec_opts(temp.path()))
            .await
            .unwrap();
        match outcome {
            RecoveryOutcome::Exhausted {
                attempts,
                changed_files,
            } => {
                assert_eq!(attempts, COMMIT_RECOVERY_MAX_RETRIES);
                assert_eq!(changed_files, vec!["left.rs"]);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }
}
