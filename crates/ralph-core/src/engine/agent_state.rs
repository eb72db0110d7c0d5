//! Agent-state machine: active agent, rate-limit state, fallback chain,
//! primary recovery.
//!
//! The primary agent instance is kept across fallback switches so the
//! recovery probe can re-test it between iterations.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::info;

use ralph_agent::probe::probe_agent;
use ralph_agent::{Agent, AgentId, RateLimitDetector};

use crate::engine::state::{ActiveAgent, RateLimitState};
use crate::events::{EngineEvent, EventBus, SwitchReason};

/// One agent instance with its id.
#[derive(Clone)]
pub struct AgentSlot {
    pub id: AgentId,
    pub agent: Arc<dyn Agent>,
}

pub struct AgentStateMachine {
    primary: AgentSlot,
    fallbacks: Vec<AgentSlot>,
    /// `None` = primary, `Some(i)` = fallbacks[i].
    active: Option<usize>,
    since: DateTime<Utc>,
    limited_at: Option<DateTime<Utc>>,
    /// Agent ids rate-limited while working the current task.
    rate_limited_for_task: HashSet<String>,
    bus: EventBus,
    detector: RateLimitDetector,
    base_backoff_ms: u64,
}

impl AgentStateMachine {
    pub fn new(
        primary: AgentSlot,
        fallbacks: Vec<AgentSlot>,
        bus: EventBus,
        base_backoff_ms: u64,
    ) -> Self {
        Self {
            primary,
            fallbacks,
            active: None,
            since: Utc::now(),
            limited_at: None,
            rate_limited_for_task: HashSet::new(),
            bus,
            detector: RateLimitDetector::new(),
            base_backoff_ms,
        }
    }

    pub fn detector(&self) -> &RateLimitDetector {
        &self.detector
    }

    pub fn active(&self) -> &AgentSlot {
        match self.active {
            None => &self.primary,
            Some(i) => &self.fallbacks[i],
        }
    }

    pub fn reason(&self) -> SwitchReason {
        if self.active.is_none() {
            SwitchReason::Primary
        } else {
            SwitchReason::Fallback
        }
    }

    /// Backoff for a retry attempt (1-based): `base_backoff_ms * 3^attempt`.
    /// A server-provided retry-after always wins over the exponential
    /// schedule.
    pub fn backoff_delay(&self, attempt: u32, retry_after: Option<u64>) -> (u64, bool) {
        match retry_after {
            Some(seconds) => (seconds * 1000, true),
            None => {
                let exp = attempt.min(10);
                (self.base_backoff_ms * 3u64.pow(exp), false)
            }
        }
    }

    /// Record that the active agent hit a rate limit on the current task.
    pub fn mark_active_limited(&mut self) {
        self.rate_limited_for_task
            .insert(self.active().id.as_str().to_string());
        self.limited_at = Some(Utc::now());
    }

    /// Move to the next fallback that has not itself been limited for this
    /// task. Returns the new agent id, or `None` when the chain is spent.
    pub fn switch_to_fallback(&mut self) -> Option<AgentId> {
        let from = self.active().id.clone();
        let next = self.fallbacks.iter().position(|slot| {
            !self
                .rate_limited_for_task
                .contains(slot.id.as_str())
        })?;

        self.active = Some(next);
        self.since = Utc::now();
        let to = self.fallbacks[next].id.clone();
        info!(
            category = "agent.state",
            from = %from,
            to = %to,
            "Switching to fallback agent"
        );
        self.bus.emit(EngineEvent::AgentSwitched {
            from: from.to_string(),
            to: to.to_string(),
            reason: SwitchReason::Fallback,
        });
        Some(to)
    }

    /// Emit the all-limited event; the engine pauses after this.
    pub fn emit_all_limited(&self) {
        let mut agents: Vec<String> = self.rate_limited_for_task.iter().cloned().collect();
        agents.sort();
        self.bus.emit(EngineEvent::AgentAllLimited { agents });
    }

    /// Probe the primary between iterations. Never runs while the primary is
    /// already active. On a clear probe, switches back and clears the
    /// per-task limited set.
    pub async fn try_recover_primary(&mut self, cwd: &Path) -> bool {
        if self.active.is_none() {
            return false;
        }

        let outcome = probe_agent(&self.primary.agent, cwd, &self.detector).await;
        self.bus.emit(EngineEvent::AgentRecoveryAttempted {
            agent: self.primary.id.to_string(),
            success: outcome.clear,
        });
        if !outcome.clear {
            return false;
        }

        let from = self.active().id.clone();
        self.active = None;
        self.since = Utc::now();
        self.limited_at = None;
        self.rate_limited_for_task.clear();
        info!(
            category = "agent.state",
            from = %from,
            to = %self.primary.id,
            "Primary agent recovered"
        );
        self.bus.emit(EngineEvent::AgentSwitched {
            from: from.to_string(),
            to: self.primary.id.to_string(),
            reason: SwitchReason::Primary,
        });
        true
    }

    /// Forget per-task rate limits when moving on to a different task.
    pub fn clear_task_limits(&mut self) {
        self.rate_limited_for_task.clear();
    }

    pub fn active_agent_state(&self) -> ActiveAgent {
        ActiveAgent {
            plugin: self.active().id.to_string(),
            reason: self.reason(),
            since: self.since,
        }
    }

    pub fn rate_limit_state(&self) -> RateLimitState {
        RateLimitState {
            primary_agent: self.primary.id.to_string(),
            limited_at: self.limited_at,
            fallback_agent: self.active.map(|i| self.fallbacks[i].id.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ralph_agent::testing::{ScriptedAgent, ScriptedOutcome};
    use std::sync::Mutex;

    fn slot(id: AgentId, agent: ScriptedAgent) -> AgentSlot {
        AgentSlot {
            id,
            agent: Arc::new(agent),
        }
    }

    fn machine_with_fallback(bus: EventBus) -> AgentStateMachine {
        AgentStateMachine::new(
            slot(AgentId::Claude, ScriptedAgent::new(AgentId::Claude)),
            vec![slot(AgentId::Opencode, ScriptedAgent::new(AgentId::Opencode))],
            bus,
            1000,
        )
    }

    #[test]
    fn test_backoff_prefers_retry_after() {
        let machine = machine_with_fallback(EventBus::new());
        assert_eq!(machine.backoff_delay(1, Some(7)), (7000, true));
        // Without a hint the schedule is base * 3^attempt, attempt 1-based.
        assert_eq!(machine.backoff_delay(1, None), (3000, false));
        assert_eq!(machine.backoff_delay(2, None), (9000, false));
        assert_eq!(machine.backoff_delay(3, None), (27000, false));
    }

    #[test]
    fn test_fallback_switch_emits_event() {
        let bus = EventBus::new();
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let _sub = bus.subscribe(move |e| sink.lock().unwrap().push(e.clone()));

        let mut machine = machine_with_fallback(bus);
        assert_eq!(machine.reason(), SwitchReason::Primary);

        machine.mark_active_limited();
        let to = machine.switch_to_fallback().unwrap();
        assert_eq!(to, AgentId::Opencode);
        assert_eq!(machine.reason(), SwitchReason::Fallback);
        assert_eq!(machine.active().id, AgentId::Opencode);

        let events = events.lock().unwrap();
        match &events[0] {
            EngineEvent::AgentSwitched { from, to, reason } => {
                assert_eq!(from, "claude");
                assert_eq!(to, "opencode");
                assert_eq!(*reason, SwitchReason::Fallback);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_no_fallback_left() {
        let mut machine = machine_with_fallback(EventBus::new());
        machine.mark_active_limited();
        machine.switch_to_fallback().unwrap();
        machine.mark_active_limited();
        assert!(machine.switch_to_fallback().is_none());

        let state = machine.rate_limit_state();
        assert_eq!(state.primary_agent, "claude");
        assert_eq!(state.fallback_agent.as_deref(), Some("opencode"));
        assert!(state.limited_at.is_some());
    }

    #[tokio::test]
    async fn test_recovery_never_runs_on_primary() {
        let mut machine = machine_with_fallback(EventBus::new());
        let temp = tempfile::TempDir::new().unwrap();
        assert!(!machine.try_recover_primary(temp.path()).await);
    }

    #[tokio::test]
    async fn test_recovery_success_restores_primary() {
        let bus = EventBus::new();
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let _sub = bus.subscribe(move |e| sink.lock().unwrap().push(e.clone()));

        let primary = ScriptedAgent::new(AgentId::Claude).with_outcome(ScriptedOutcome::ok("OK"));
        let mut machine = AgentStateMachine::new(
            slot(AgentId::Claude, primary),
            vec![slot(AgentId::Opencode, ScriptedAgent::new(AgentId::Opencode))],
            bus,
            1000,
        );
        machine.mark_active_limited();
        machine.switch_to_fallback().unwrap();

        let temp = tempfile::TempDir::new().unwrap();
        assert!(machine.try_recover_primary(temp.path()).await);
        assert_eq!(machine.reason(), SwitchReason::Primary);
        assert!(machine.rate_limit_state().fallback_agent.is_none());

        let names: Vec<&str> = {
            let events = events.lock().unwrap();
            events.iter().map(|e| e.name()).collect::<Vec<_>>()
        };
        assert_eq!(
            names,
            vec![
                "agent:switched",
                "agent:recovery-attempted",
                "agent:switched"
            ]
        );
    }

    #[tokio::test]
    async fn test_recovery_blocked_by_rate_limit() {
        let primary = ScriptedAgent::new(AgentId::Claude)
            .with_outcome(ScriptedOutcome::rate_limited("rate limit, try again in 60 seconds"));
        let mut machine = AgentStateMachine::new(
            slot(AgentId::Claude, primary),
            vec![slot(AgentId::Opencode, ScriptedAgent::new(AgentId::Opencode))],
            EventBus::new(),
            1000,
        );
        machine.mark_active_limited();
        machine.switch_to_fallback().unwrap();

        let temp = tempfile::TempDir::new().unwrap();
        assert!(!machine.try_recover_primary(temp.path()).await);
        assert_eq!(machine.reason(), SwitchReason::Fallback);
    }

    #[test]
    fn test_clear_task_limits_allows_fallback_again() {
        let mut machine = machine_with_fallback(EventBus::new());
        machine.mark_active_limited();
        machine.switch_to_fallback().unwrap();
        machine.mark_active_limited();
        assert!(machine.switch_to_fallback().is_none());

        machine.clear_task_limits();
        assert!(machine.switch_to_fallback().is_some());
    }
}
