//! Error types for ralph-tracker
//!
//! Error codes follow the workspace convention:
//! - E5xxx: Tracker errors

use thiserror::Error;

/// Result type alias using TrackerError
pub type Result<T> = std::result::Result<T, TrackerError>;

/// Main error type for ralph-tracker
#[derive(Error, Debug)]
pub enum TrackerError {
    #[error("[E5001] Task not found: {id}")]
    TaskNotFound { id: String },

    #[error("[E5002] Tracker backend not found: {id}")]
    BackendNotFound { id: String },

    #[error("[E5003] Tracker persistence read failed: {path}: {reason}")]
    PersistenceRead { path: String, reason: String },

    #[error("[E5004] Tracker persistence write failed: {path}: {reason}")]
    PersistenceWrite { path: String, reason: String },

    #[error("[E5005] Invalid task transition for {id}: {from} -> {to}")]
    InvalidTransition {
        id: String,
        from: String,
        to: String,
    },

    #[error("[E5901] IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("[E5902] JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl TrackerError {
    /// Get the error code as a string (e.g., "E5001")
    pub fn code(&self) -> &'static str {
        match self {
            Self::TaskNotFound { .. } => "E5001",
            Self::BackendNotFound { .. } => "E5002",
            Self::PersistenceRead { .. } => "E5003",
            Self::PersistenceWrite { .. } => "E5004",
            Self::InvalidTransition { .. } => "E5005",
            Self::Io(_) => "E5901",
            Self::Json(_) => "E5902",
        }
    }
}
