//! Error types for ralph-core
//!
//! Error codes are categorized as follows:
//! - E1xxx: Git operation errors
//! - E2xxx: Worktree operation errors
//! - E3xxx: Configuration errors
//! - E6xxx: Engine errors
//! - E7xxx: Instance lock errors
//! - E9xxx: Generic errors
//!
//! Agent (E4xxx) and tracker (E5xxx) errors are wrapped from their crates.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias using RalphError
pub type Result<T> = std::result::Result<T, RalphError>;

/// Main error type for ralph-core
#[derive(Error, Debug)]
pub enum RalphError {
    // E1xxx: Git operation errors
    #[error("[E1001] Not a git repository: {path}")]
    NotAGitRepository { path: PathBuf },

    #[error("[E1002] Git command failed: {operation}: {details}")]
    GitOperationFailed { operation: String, details: String },

    #[error("[E1003] Git executable not found")]
    GitNotFound,

    #[error("[E1004] Ref not found: {name}")]
    RefNotFound { name: String },

    #[error("[E1005] Cherry-pick conflict for {commit}: {details}")]
    CherryPickConflict { commit: String, details: String },

    #[error("[E1006] Fast-forward not possible: {details}")]
    FastForwardFailed { details: String },

    #[error("[E1007] Fetch failed: {details}")]
    FetchFailed { details: String },

    #[error("[E1008] Working tree is dirty: {path}")]
    DirtyWorkingTree { path: PathBuf },

    // E2xxx: Worktree operation errors
    #[error("[E2001] Worktree not found: {path}")]
    WorktreeNotFound { path: PathBuf },

    #[error("[E2002] Failed to create worktree: {reason}")]
    WorktreeCreateFailed { reason: String },

    #[error("[E2003] Failed to remove worktree: {reason}")]
    WorktreeRemoveFailed { reason: String },

    #[error("[E2004] Worktree validation failed at {path}: expected {expected_branch}@{expected_commit}, observed {observed_branch}@{observed_commit}")]
    WorktreeValidationFailed {
        path: PathBuf,
        expected_branch: String,
        expected_commit: String,
        observed_branch: String,
        observed_commit: String,
    },

    // E3xxx: Configuration errors
    #[error("[E3001] Configuration parse error: {reason}")]
    ConfigParseError { reason: String },

    #[error("[E3002] Invalid configuration value: {key} = {value}: {reason}")]
    ConfigInvalidValue {
        key: String,
        value: String,
        reason: String,
    },

    #[error("[E3003] Agent unavailable: {agent}: {reason}")]
    AgentUnavailable { agent: String, reason: String },

    // E6xxx: Engine errors
    #[error("[E6001] Engine already running")]
    EngineAlreadyRunning,

    #[error("[E6002] Iteration failed: {reason}")]
    IterationFailed { reason: String },

    #[error("[E6003] Merge failed for commit {commit}: {reason}")]
    MergeFailed { commit: String, reason: String },

    #[error("[E6004] Main sync failed: {reason}")]
    MainSyncFailed { reason: String },

    #[error("[E6005] Commit recovery exhausted for task {task_id} after {attempts} attempt(s)")]
    CommitRecoveryExhausted { task_id: String, attempts: u32 },

    // E7xxx: Instance lock errors
    #[error("[E7001] Another instance is running (pid {pid}) in {cwd}")]
    LockContention { pid: u32, cwd: PathBuf },

    #[error("[E7002] Lock file unreadable: {path}: {reason}")]
    LockUnreadable { path: PathBuf, reason: String },

    // Wrapped capability errors
    #[error(transparent)]
    Agent(#[from] ralph_agent::AgentError),

    #[error(transparent)]
    Tracker(#[from] ralph_tracker::TrackerError),

    // Generic errors
    #[error("[E9001] IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("[E9002] JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("[E9003] Internal error: {0}")]
    Internal(String),
}

impl RalphError {
    /// Get the error code as a string (e.g., "E1002")
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotAGitRepository { .. } => "E1001",
            Self::GitOperationFailed { .. } => "E1002",
            Self::GitNotFound => "E1003",
            Self::RefNotFound { .. } => "E1004",
            Self::CherryPickConflict { .. } => "E1005",
            Self::FastForwardFailed { .. } => "E1006",
            Self::FetchFailed { .. } => "E1007",
            Self::DirtyWorkingTree { .. } => "E1008",
            Self::WorktreeNotFound { .. } => "E2001",
            Self::WorktreeCreateFailed { .. } => "E2002",
            Self::WorktreeRemoveFailed { .. } => "E2003",
            Self::WorktreeValidationFailed { .. } => "E2004",
            Self::ConfigParseError { .. } => "E3001",
            Self::ConfigInvalidValue { .. } => "E3002",
            Self::AgentUnavailable { .. } => "E3003",
            Self::EngineAlreadyRunning => "E6001",
            Self::IterationFailed { .. } => "E6002",
            Self::MergeFailed { .. } => "E6003",
            Self::MainSyncFailed { .. } => "E6004",
            Self::CommitRecoveryExhausted { .. } => "E6005",
            Self::LockContention { .. } => "E7001",
            Self::LockUnreadable { .. } => "E7002",
            Self::Agent(e) => e.code(),
            Self::Tracker(e) => e.code(),
            Self::Io(_) => "E9001",
            Self::Json(_) => "E9002",
            Self::Internal(_) => "E9003",
        }
    }

    /// Fatal errors abort startup; everything else becomes an event.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::NotAGitRepository { .. }
                | Self::GitNotFound
                | Self::ConfigParseError { .. }
                | Self::ConfigInvalidValue { .. }
                | Self::AgentUnavailable { .. }
                | Self::EngineAlreadyRunning
                | Self::LockContention { .. }
        )
    }
}
