//! Error types for ralph-agent
//!
//! Error codes follow the workspace convention:
//! - E4xxx: Agent launch and execution errors

use thiserror::Error;

/// Result type alias using AgentError
pub type Result<T> = std::result::Result<T, AgentError>;

/// Main error type for ralph-agent
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("[E4001] Agent not found: {name}")]
    AgentNotFound { name: String },

    #[error("[E4002] Agent binary not available: {binary}: {reason}")]
    BinaryUnavailable { binary: String, reason: String },

    #[error("[E4003] Invalid model for agent {agent}: {reason}")]
    InvalidModel { agent: String, reason: String },

    #[error("[E4004] Agent launch failed: {name}: {reason}")]
    LaunchFailed { name: String, reason: String },

    #[error("[E4005] Agent execution failed: {reason}")]
    ExecutionFailed { reason: String },

    #[error("[E4006] Sandbox conflict for agent {agent}: {reason}")]
    SandboxConflict { agent: String, reason: String },

    #[error("[E4901] IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl AgentError {
    /// Get the error code as a string (e.g., "E4001")
    pub fn code(&self) -> &'static str {
        match self {
            Self::AgentNotFound { .. } => "E4001",
            Self::BinaryUnavailable { .. } => "E4002",
            Self::InvalidModel { .. } => "E4003",
            Self::LaunchFailed { .. } => "E4004",
            Self::ExecutionFailed { .. } => "E4005",
            Self::SandboxConflict { .. } => "E4006",
            Self::Io(_) => "E4901",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_and_display() {
        let err = AgentError::AgentNotFound {
            name: "claude".to_string(),
        };
        assert_eq!(err.code(), "E4001");
        assert!(err.to_string().contains("[E4001]"));
        assert!(err.to_string().contains("claude"));
    }
}
