//! Event bridge: batches engine events into UI store actions.
//!
//! Agent-output deltas are coalesced on a flush timer so a chatty agent
//! cannot melt the UI dispatch path; retained output is capped with a
//! sliding tail. Store dispatch is fault-isolated per store.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::events::{EngineEvent, EventBus, OutputStream, Subscription};

/// Default flush cadence for coalesced output.
pub const FLUSH_INTERVAL: Duration = Duration::from_millis(50);

/// Sliding cap on retained agent output, in bytes.
pub const OUTPUT_CAP_BYTES: usize = 500_000;

/// Actions dispatched into UI stores. Deliberately free of timestamps so
/// replaying an event stream yields identical store state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum UiAction {
    /// Coalesced output appended since the last flush.
    AppendOutput {
        stream: OutputStream,
        chunk: String,
        worker_id: Option<String>,
    },
    EngineStatus {
        event: String,
    },
    TaskChanged {
        task_id: String,
        change: String,
        detail: String,
    },
    IterationChanged {
        iteration: u64,
        event: String,
    },
    AgentChanged {
        detail: String,
    },
    Alert {
        message: String,
    },
}

/// One UI store. Implementations live in the terminal UI; tests use
/// recording stubs.
pub trait UiStore: Send + Sync {
    fn name(&self) -> &str;
    fn dispatch(&self, action: &UiAction);
}

struct OutputBuffer {
    stream: OutputStream,
    worker_id: Option<String>,
    buffer: String,
}

pub struct EventBridge {
    tx: mpsc::UnboundedSender<EngineEvent>,
    handle: JoinHandle<()>,
    subscription: Option<Subscription>,
}

impl EventBridge {
    /// Attach the bridge to a bus and start its flush loop.
    pub fn attach(bus: &EventBus, stores: Vec<Arc<dyn UiStore>>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let feeder = tx.clone();
        let subscription = bus.subscribe(move |event| {
            let _ = feeder.send(event.clone());
        });
        let handle = tokio::spawn(run_bridge(rx, stores));
        Self {
            tx,
            handle,
            subscription: Some(subscription),
        }
    }

    /// Replay support: push one event directly, bypassing a live bus.
    pub fn push(&self, event: EngineEvent) {
        let _ = self.tx.send(event);
    }

    /// Detach from the bus and flush the remainder.
    pub async fn shutdown(mut self) {
        self.subscription.take();
        drop(self.tx);
        let _ = self.handle.await;
    }
}

async fn run_bridge(mut rx: mpsc::UnboundedReceiver<EngineEvent>, stores: Vec<Arc<dyn UiStore>>) {
    let mut pending: Vec<OutputBuffer> = Vec::new();
    let mut retained: usize = 0;
    // First tick lands one full interval out; an immediate tick would split
    // the first coalesced batch.
    let mut interval =
        tokio::time::interval_at(tokio::time::Instant::now() + FLUSH_INTERVAL, FLUSH_INTERVAL);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            event = rx.recv() => {
                match event {
                    Some(EngineEvent::AgentOutput { stream, chunk, worker_id }) => {
                        buffer_output(&mut pending, &mut retained, stream, chunk, worker_id);
                    }
                    Some(event) => {
                        // Output must land before the event that follows it.
                        flush_output(&stores, &mut pending);
                        for action in map_event(&event) {
                            dispatch(&stores, &action);
                        }
                    }
                    None => {
                        flush_output(&stores, &mut pending);
                        break;
                    }
                }
            }
            _ = interval.tick() => {
                flush_output(&stores, &mut pending);
            }
        }
    }
}

fn buffer_output(
    pending: &mut Vec<OutputBuffer>,
    retained: &mut usize,
    stream: OutputStream,
    chunk: String,
    worker_id: Option<String>,
) {
    *retained += chunk.len() + 1;
    let slot = pending
        .iter_mut()
        .find(|b| b.stream == stream && b.worker_id == worker_id);
    match slot {
        Some(buffer) => {
            buffer.buffer.push('\n');
            buffer.buffer.push_str(&chunk);
        }
        None => pending.push(OutputBuffer {
            stream,
            worker_id,
            buffer: chunk,
        }),
    }

    // Sliding tail: drop oldest bytes once past the cap.
    while *retained > OUTPUT_CAP_BYTES {
        let Some(first) = pending.first_mut() else { break };
        let overflow = *retained - OUTPUT_CAP_BYTES;
        if first.buffer.len() <= overflow {
            *retained -= first.buffer.len();
            pending.remove(0);
        } else {
            let mut cut = overflow;
            while !first.buffer.is_char_boundary(cut) {
                cut += 1;
            }
            first.buffer.drain(..cut);
            *retained -= cut;
        }
    }
}

fn flush_output(stores: &[Arc<dyn UiStore>], pending: &mut Vec<OutputBuffer>) {
    for buffer in pending.drain(..) {
        dispatch(
            stores,
            &UiAction::AppendOutput {
                stream: buffer.stream,
                chunk: buffer.buffer,
                worker_id: buffer.worker_id,
            },
        );
    }
}

/// Map one engine event to its UI actions.
fn map_event(event: &EngineEvent) -> Vec<UiAction> {
    let mut actions = Vec::new();
    match event {
        EngineEvent::AgentOutput { .. } => {}
        EngineEvent::EngineStarted { .. }
        | EngineEvent::EngineStopped { .. }
        | EngineEvent::EnginePaused
        | EngineEvent::EngineResumed
        | EngineEvent::AllComplete => actions.push(UiAction::EngineStatus {
            event: event.name().to_string(),
        }),
        EngineEvent::IterationStarted { iteration, .. }
        | EngineEvent::IterationCompleted { iteration, .. }
        | EngineEvent::IterationFailed { iteration, .. }
        | EngineEvent::IterationRateLimited { iteration, .. }
        | EngineEvent::CommitRecovery { iteration, .. } => {
            actions.push(UiAction::IterationChanged {
                iteration: *iteration,
                event: event.name().to_string(),
            })
        }
        EngineEvent::AgentSwitched { from, to, reason } => actions.push(UiAction::AgentChanged {
            detail: format!("{from} -> {to} ({reason:?})"),
        }),
        EngineEvent::AgentRecoveryAttempted { agent, success } => {
            actions.push(UiAction::AgentChanged {
                detail: format!("recovery probe on {agent}: success={success}"),
            })
        }
        EngineEvent::AgentAllLimited { agents } => actions.push(UiAction::Alert {
            message: format!("all agents rate-limited: {}", agents.join(", ")),
        }),
        EngineEvent::MainSyncAlert { message, .. } => actions.push(UiAction::Alert {
            message: message.clone(),
        }),
        EngineEvent::EngineError { reason, .. } => actions.push(UiAction::Alert {
            message: reason.clone(),
        }),
        other => {
            if let Some(task_id) = other.task_id() {
                actions.push(UiAction::TaskChanged {
                    task_id: task_id.to_string(),
                    change: other.name().to_string(),
                    detail: detail_of(other),
                });
            } else {
                actions.push(UiAction::EngineStatus {
                    event: other.name().to_string(),
                });
            }
        }
    }
    actions
}

fn detail_of(event: &EngineEvent) -> String {
    match event {
        EngineEvent::TaskBlocked { reason, .. }
        | EngineEvent::TaskReopened { reason, .. }
        | EngineEvent::TaskSkipped { reason, .. } => reason.clone(),
        EngineEvent::MergeFailed { reason, .. } => reason.clone(),
        EngineEvent::MergeQueued { commit, .. } | EngineEvent::MergeSucceeded { commit, .. } => {
            commit.clone()
        }
        _ => String::new(),
    }
}

/// Dispatch with fault isolation: a panicking store is logged and skipped,
/// and never prevents the remaining stores from updating.
fn dispatch(stores: &[Arc<dyn UiStore>], action: &UiAction) {
    for store in stores {
        let result = catch_unwind(AssertUnwindSafe(|| store.dispatch(action)));
        if result.is_err() {
            warn!(
                category = "bridge",
                store = store.name(),
                "UI store panicked on dispatch; continuing"
            );
        }
    }
}
