//! Agent capability layer for the ralph execution engine.
//!
//! The engine never talks to a concrete coding-agent CLI directly. It goes
//! through the [`Agent`] trait, constructed via the [`AgentRegistry`], and the
//! execution envelope in [`envelope`] that isolates each run's environment.

pub mod capability;
pub mod envelope;
pub mod error;
pub mod plugins;
pub mod probe;
pub mod rate_limit;
pub mod testing;

pub use capability::{
    Agent, AgentId, AgentMeta, AgentOptions, AgentResult, DetectOutcome, ExecuteOptions,
    ExecutionHandle, ExecutionStatus, Interrupter, OutputCallback, SandboxMode,
    SandboxRequirements,
};
pub use error::{AgentError, Result};
pub use plugins::AgentRegistry;
pub use rate_limit::{Detection, ExecutionSample, RateLimitDetector};
