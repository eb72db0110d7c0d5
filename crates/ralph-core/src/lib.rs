//! ralph-core: the autonomous agent-execution engine.
//!
//! Drives coding agents against a tracker-owned task queue, isolates
//! parallel work in per-worker git worktrees, serializes integration
//! through a merge queue, and survives rate limits, dirty trees, merge
//! conflicts, and stale locks. The terminal UI consumes the event stream
//! through the [`bridge`]; nothing in here renders anything.

pub mod bridge;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod git;
pub mod lock;
pub mod logs;
pub mod paths;
pub mod process;
pub mod reconcile;
pub mod worktree;

#[cfg(test)]
pub(crate) mod test_support;

pub use config::Settings;
pub use engine::parallel::{ParallelEngine, ParallelEngineDeps};
pub use engine::sequential::{EngineDeps, SequentialEngine};
pub use engine::state::{EngineState, EngineStatus};
pub use engine::EngineControl;
pub use error::{RalphError, Result};
pub use events::{EngineEvent, EventBus};
pub use git::Repository;
pub use lock::{AcquireOptions, InstanceLock};
