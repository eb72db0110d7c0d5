//! Subagent trace projection.
//!
//! Agents that support tracing stream structured JSON lines; the engine
//! subscribes to that channel and projects the lines into its own snapshot
//! (no back-pointers between parser and engine). Unknown shapes are ignored.

use chrono::Utc;
use serde_json::Value;

use crate::engine::state::{StateHandle, SubagentState};
use crate::events::{EngineEvent, EventBus};

/// One parsed subagent observation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubagentEvent {
    pub id: String,
    pub name: Option<String>,
    pub status: String,
}

/// Parse one JSONL line into a subagent observation, if it is one.
///
/// Two shapes are recognized: a literal `{"type":"subagent",...}` event, and
/// claude-style `tool_use`/`tool_result` blocks for the `Task` tool.
pub fn parse_subagent_event(line: &str) -> Option<SubagentEvent> {
    let value: Value = serde_json::from_str(line.trim()).ok()?;

    if value.get("type").and_then(Value::as_str) == Some("subagent") {
        return Some(SubagentEvent {
            id: value.get("id")?.as_str()?.to_string(),
            name: value
                .get("name")
                .and_then(Value::as_str)
                .map(str::to_string),
            status: value
                .get("status")
                .and_then(Value::as_str)
                .unwrap_or("running")
                .to_string(),
        });
    }

    let content = value.get("message")?.get("content")?.as_array()?;
    for block in content {
        match block.get("type").and_then(Value::as_str) {
            Some("tool_use") if block.get("name").and_then(Value::as_str) == Some("Task") => {
                return Some(SubagentEvent {
                    id: block.get("id")?.as_str()?.to_string(),
                    name: block
                        .get("input")
                        .and_then(|i| i.get("description"))
                        .and_then(Value::as_str)
                        .map(str::to_string),
                    status: "started".to_string(),
                });
            }
            Some("tool_result") => {
                if let Some(id) = block.get("tool_use_id").and_then(Value::as_str) {
                    return Some(SubagentEvent {
                        id: id.to_string(),
                        name: None,
                        status: "completed".to_string(),
                    });
                }
            }
            _ => {}
        }
    }
    None
}

/// Projects parsed observations into engine state and the event stream.
#[derive(Clone)]
pub struct SubagentTracker {
    state: StateHandle,
    bus: EventBus,
}

impl SubagentTracker {
    pub fn new(state: StateHandle, bus: EventBus) -> Self {
        Self { state, bus }
    }

    /// Feed one raw JSONL line from the agent.
    pub fn observe(&self, line: &str) {
        let Some(event) = parse_subagent_event(line) else {
            return;
        };

        let known = self.state.update(|state| {
            let known = state.subagents.contains_key(&event.id);
            // tool_result lines carry ids for every tool; only complete the
            // subagents we saw start.
            if event.status == "completed" && !known {
                return false;
            }
            let entry = state
                .subagents
                .entry(event.id.clone())
                .or_insert_with(|| SubagentState {
                    id: event.id.clone(),
                    name: None,
                    status: String::new(),
                    updated_at: Utc::now(),
                });
            if let Some(name) = &event.name {
                entry.name = Some(name.clone());
            }
            entry.status = event.status.clone();
            entry.updated_at = Utc::now();
            true
        });

        if known {
            self.bus.emit(EngineEvent::SubagentUpdate {
                id: event.id,
                name: event.name,
                status: event.status,
            });
        }
    }

    /// Whether any subagent activity was observed this run.
    pub fn any_observed(&self) -> bool {
        self.state.update(|state| !state.subagents.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_generic_subagent_line() {
        let event = parse_subagent_event(
            r#"{"type":"subagent","id":"sa-1","name":"explore","status":"started"}"#,
        )
        .unwrap();
        assert_eq!(event.id, "sa-1");
        assert_eq!(event.name.as_deref(), Some("explore"));
        assert_eq!(event.status, "started");
    }

    #[test]
    fn test_parse_claude_task_tool_use() {
        let line = r#"{"type":"assistant","message":{"content":[{"type":"tool_use","id":"toolu_1","name":"Task","input":{"description":"scan tests"}}]}}"#;
        let event = parse_subagent_event(line).unwrap();
        assert_eq!(event.id, "toolu_1");
        assert_eq!(event.name.as_deref(), Some("scan tests"));
        assert_eq!(event.status, "started");
    }

    #[test]
    fn test_parse_ignores_other_tools_and_junk() {
        let other_tool = r#"{"type":"assistant","message":{"content":[{"type":"tool_use","id":"toolu_2","name":"Bash","input":{}}]}}"#;
        assert!(parse_subagent_event(other_tool).is_none());
        assert!(parse_subagent_event("not json").is_none());
        assert!(parse_subagent_event(r#"{"type":"result"}"#).is_none());
    }

    #[test]
    fn test_tracker_projects_lifecycle() {
        let state = StateHandle::new();
        let tracker = SubagentTracker::new(state.clone(), EventBus::new());

        tracker.observe(
            r#"{"type":"assistant","message":{"content":[{"type":"tool_use","id":"toolu_1","name":"Task","input":{"description":"scan"}}]}}"#,
        );
        assert!(tracker.any_observed());
        let snap = state.snapshot();
        assert_eq!(snap.subagents["toolu_1"].status, "started");

        tracker.observe(
            r#"{"type":"user","message":{"content":[{"type":"tool_result","tool_use_id":"toolu_1"}]}}"#,
        );
        let snap = state.snapshot();
        assert_eq!(snap.subagents["toolu_1"].status, "completed");
    }

    #[test]
    fn test_tool_result_for_unknown_id_ignored() {
        let state = StateHandle::new();
        let tracker = SubagentTracker::new(state.clone(), EventBus::new());
        tracker.observe(
            r#"{"type":"user","message":{"content":[{"type":"tool_result","tool_use_id":"toolu_9"}]}}"#,
        );
        assert!(state.snapshot().subagents.is_empty());
    }
}
