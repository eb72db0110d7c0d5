//! Engine configuration.
//!
//! Settings load from `ralph.toml` in the working directory, with defaults
//! for everything; validation happens before the engine starts so a bad
//! config never produces a half-running engine.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{RalphError, Result};

/// Config file name in the working directory.
pub const CONFIG_FILE: &str = "ralph.toml";

/// Bounded commit-recovery retries after a dirty completion.
pub const COMMIT_RECOVERY_MAX_RETRIES: u32 = 1;

/// Main-sync retry backoff: 2s doubling, capped at 30s.
pub const MAIN_SYNC_BACKOFF_BASE: Duration = Duration::from_secs(2);
pub const MAIN_SYNC_BACKOFF_CAP: Duration = Duration::from_secs(30);

/// How the sequential engine reacts to a failed iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorStrategy {
    Retry,
    Skip,
    Abort,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSettings {
    /// Primary agent plugin id.
    pub id: String,
    pub model: Option<String>,
    /// Ordered fallback chain tried when the current agent is rate-limited.
    pub fallbacks: Vec<String>,
    pub sandbox: Option<String>,
    /// 0 disables the per-execution timeout.
    pub timeout_secs: u64,
    pub subagent_tracing: bool,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            id: "claude".to_string(),
            model: None,
            fallbacks: Vec::new(),
            sandbox: None,
            timeout_secs: 0,
            subagent_tracing: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// 0 means run until the tracker reports complete or no tasks remain.
    pub max_iterations: u64,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub base_backoff_ms: u64,
    pub error_strategy: ErrorStrategy,
    pub max_workers: usize,
    pub recover_primary_between_iterations: bool,
    pub integration_branch: String,
    pub main_sync_max_retries: u32,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            max_iterations: 0,
            max_retries: 3,
            retry_delay_ms: 2000,
            base_backoff_ms: 1000,
            error_strategy: ErrorStrategy::Retry,
            max_workers: 1,
            recover_primary_between_iterations: true,
            integration_branch: "main".to_string(),
            main_sync_max_retries: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerSettings {
    pub id: String,
}

impl Default for TrackerSettings {
    fn default() -> Self {
        Self {
            id: "json".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    pub debug: bool,
    pub retention_days: u32,
    /// When set, tracker events are logged only for this plugin id.
    pub tracker_events_plugin: Option<String>,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            debug: false,
            retention_days: 7,
            tracker_events_plugin: None,
        }
    }
}

/// Root settings document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub agent: AgentSettings,
    pub engine: EngineSettings,
    pub tracker: TrackerSettings,
    pub logging: LoggingSettings,
}

impl Settings {
    /// Load settings from `<cwd>/ralph.toml`, falling back to defaults when
    /// the file is absent.
    pub fn load(cwd: &Path) -> Result<Self> {
        let path = cwd.join(CONFIG_FILE);
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(&path)?;
        let settings: Settings =
            toml::from_str(&content).map_err(|e| RalphError::ConfigParseError {
                reason: format!("{}: {e}", path.display()),
            })?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        if self.engine.max_workers == 0 {
            return Err(RalphError::ConfigInvalidValue {
                key: "engine.max_workers".to_string(),
                value: "0".to_string(),
                reason: "at least one worker is required".to_string(),
            });
        }
        if self.agent.id.trim().is_empty() {
            return Err(RalphError::ConfigInvalidValue {
                key: "agent.id".to_string(),
                value: self.agent.id.clone(),
                reason: "agent id must not be empty".to_string(),
            });
        }
        if self.engine.integration_branch.trim().is_empty() {
            return Err(RalphError::ConfigInvalidValue {
                key: "engine.integration_branch".to_string(),
                value: self.engine.integration_branch.clone(),
                reason: "integration branch must not be empty".to_string(),
            });
        }
        Ok(())
    }

    pub fn agent_timeout(&self) -> Option<Duration> {
        (self.agent.timeout_secs > 0).then(|| Duration::from_secs(self.agent.timeout_secs))
    }
}
