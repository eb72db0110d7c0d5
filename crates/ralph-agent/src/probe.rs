//! Recovery probe: a minimal, short-timeout invocation used to test whether
//! a rate limit has lifted before switching back to the primary agent.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::capability::{Agent, ExecuteOptions, ExecutionStatus};
use crate::rate_limit::{ExecutionSample, RateLimitDetector};

/// Probe subprocesses are killed after this long.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

const PROBE_PROMPT: &str = "Reply with the single word OK and nothing else.";

#[derive(Debug, Clone)]
pub struct ProbeOutcome {
    /// The probe ran and did not match a rate-limit signature.
    pub clear: bool,
    pub message: Option<String>,
}

/// Run the probe against an agent. Any execution failure that does not look
/// like a rate limit is treated as clear: the real iteration will surface it.
pub async fn probe_agent(
    agent: &Arc<dyn Agent>,
    cwd: &Path,
    detector: &RateLimitDetector,
) -> ProbeOutcome {
    let opts = ExecuteOptions {
        cwd: cwd.to_path_buf(),
        timeout: Some(PROBE_TIMEOUT),
        ..Default::default()
    };

    let handle = match agent.execute(PROBE_PROMPT, &[], opts) {
        Ok(handle) => handle,
        Err(e) => {
            return ProbeOutcome {
                clear: false,
                message: Some(e.to_string()),
            }
        }
    };

    let result = match handle.wait().await {
        Ok(result) => result,
        Err(e) => {
            return ProbeOutcome {
                clear: false,
                message: Some(e.to_string()),
            }
        }
    };

    let agent_id = agent.meta().id;
    let detection = detector.detect(ExecutionSample {
        stdout: &result.stdout,
        stderr: &result.stderr,
        exit_code: result.exit_code,
        agent_id: &agent_id,
    });

    debug!(
        category = "agent.probe",
        agent = %agent_id,
        status = ?result.status,
        rate_limited = detection.is_rate_limit,
        "Recovery probe finished"
    );

    if detection.is_rate_limit {
        return ProbeOutcome {
            clear: false,
            message: detection.message,
        };
    }

    ProbeOutcome {
        clear: result.status != ExecutionStatus::Interrupted,
        message: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::AgentId;
    use crate::testing::{ScriptedAgent, ScriptedOutcome};

    #[tokio::test]
    async fn test_probe_clear_on_success() {
        let agent = ScriptedAgent::new(AgentId::Claude).with_outcome(ScriptedOutcome::ok("OK"));
        let agent: Arc<dyn Agent> = Arc::new(agent);
        let temp = tempfile::TempDir::new().unwrap();
        let outcome = probe_agent(&agent, temp.path(), &RateLimitDetector::new()).await;
        assert!(outcome.clear);
    }

    #[tokio::test]
    async fn test_probe_blocked_on_rate_limit() {
        let agent = ScriptedAgent::new(AgentId::Claude)
            .with_outcome(ScriptedOutcome::failed("rate limit exceeded, try again in 60 seconds"));
        let agent: Arc<dyn Agent> = Arc::new(agent);
        let temp = tempfile::TempDir::new().unwrap();
        let outcome = probe_agent(&agent, temp.path(), &RateLimitDetector::new()).await;
        assert!(!outcome.clear);
        assert!(outcome.message.unwrap().contains("rate limit"));
    }
}
