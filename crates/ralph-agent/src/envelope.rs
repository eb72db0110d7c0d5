//! Execution envelope: per-run environment isolation.
//!
//! Every agent subprocess runs with a curated environment so it cannot leak
//! state into the operator's home directory, trip git hooks, or reach the
//! task database from inside a worker worktree.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::capability::AgentId;
use crate::error::Result;

/// Env var that opts out of writing the stripped opencode config.
pub const OPENCODE_SAFE_CONFIG_VAR: &str = "RALPH_TUI_OPENCODE_SAFE_CONFIG";

/// Env var set inside worker worktrees to disable the task database CLI.
pub const DISABLE_BD_VAR: &str = "RALPH_TUI_DISABLE_BD";

/// Inputs for building one execution environment.
#[derive(Debug, Clone)]
pub struct EnvelopeContext {
    pub agent_id: AgentId,
    /// Working directory the agent will run in.
    pub cwd: PathBuf,
    /// The run's `.ralph-tui` state directory (under the main checkout).
    pub state_dir: PathBuf,
    /// Set for worker worktrees: also disables `bd` and prepends the shim dir.
    pub shim_dir: Option<PathBuf>,
}

/// Build the environment overrides for one agent execution.
pub fn build_env(ctx: &EnvelopeContext) -> HashMap<String, String> {
    let mut env = HashMap::new();

    // Agents must never write into the operator's real home.
    env.insert("HOME".to_string(), path_str(&ctx.cwd));

    let tmp_dir = ctx.state_dir.join("tmp").join(ctx.agent_id.as_str());
    for var in ["TMPDIR", "TMP", "TEMP", "BUN_TMPDIR"] {
        env.insert(var.to_string(), path_str(&tmp_dir));
    }

    // Git hooks stay off under automation.
    env.insert("HUSKY".to_string(), "0".to_string());
    env.insert("HUSKY_SKIP_HOOKS".to_string(), "1".to_string());

    if ctx.agent_id == AgentId::Opencode {
        let base = ctx.state_dir.join("opencode");
        env.insert("XDG_DATA_HOME".to_string(), path_str(&base.join("data")));
        env.insert("XDG_CACHE_HOME".to_string(), path_str(&base.join("cache")));
        env.insert("XDG_STATE_HOME".to_string(), path_str(&base.join("state")));
        env.insert("XDG_CONFIG_HOME".to_string(), path_str(&base.join("config")));
    }

    if let Some(shim_dir) = &ctx.shim_dir {
        env.insert(DISABLE_BD_VAR.to_string(), "1".to_string());
        let path = std::env::var("PATH").unwrap_or_default();
        let sep = if cfg!(windows) { ";" } else { ":" };
        env.insert(
            "PATH".to_string(),
            format!("{}{}{}", path_str(shim_dir), sep, path),
        );
    }

    env
}

/// Create the directories the envelope points at and seed the stripped
/// opencode config. Failures are tolerated: the agent still launches, it
/// just falls back to its own defaults.
pub fn prepare_dirs(ctx: &EnvelopeContext) {
    let mut dirs = vec![ctx.state_dir.join("tmp").join(ctx.agent_id.as_str())];
    if ctx.agent_id == AgentId::Opencode {
        let base = ctx.state_dir.join("opencode");
        for leaf in ["data", "cache", "state", "config"] {
            dirs.push(base.join(leaf));
        }
    }
    for dir in dirs {
        if let Err(e) = std::fs::create_dir_all(&dir) {
            warn!(category = "agent.env", dir = %dir.display(), error = %e, "Failed to prepare envelope dir");
        }
    }

    // The redirected XDG_CONFIG_HOME starts empty; give opencode a config
    // with MCP servers and plugins stripped unless the operator opted out.
    if ctx.agent_id == AgentId::Opencode {
        if let Err(e) = write_opencode_safe_config(&ctx.state_dir) {
            warn!(category = "agent.env", error = %e, "Failed to write opencode safe config");
        }
    }
}

/// Write a stripped opencode config that disables MCP servers and plugins,
/// unless the operator opted out with `RALPH_TUI_OPENCODE_SAFE_CONFIG=0`.
pub fn write_opencode_safe_config(state_dir: &Path) -> Result<Option<PathBuf>> {
    if std::env::var(OPENCODE_SAFE_CONFIG_VAR).as_deref() == Ok("0") {
        return Ok(None);
    }

    let config_dir = state_dir.join("opencode").join("config").join("opencode");
    std::fs::create_dir_all(&config_dir)?;
    let path = config_dir.join("opencode.json");
    let config = serde_json::json!({
        "$schema": "https://opencode.ai/config.json",
        "mcp": {},
        "plugin": [],
        "autoupdate": false,
    });
    std::fs::write(&path, format!("{:#}\n", config))?;
    Ok(Some(path))
}

fn path_str(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn ctx(agent_id: AgentId, shim: bool) -> (TempDir, EnvelopeContext) {
        let temp = TempDir::new().unwrap();
        let cwd = temp.path().to_path_buf();
        let state_dir = cwd.join(".ralph-tui");
        let shim_dir = shim.then(|| state_dir.join("bin"));
        (
            temp,
            EnvelopeContext {
                agent_id,
                cwd,
                state_dir,
                shim_dir,
            },
        )
    }

    #[test]
    fn test_home_and_tmp_redirected() {
        let (_temp, ctx) = ctx(AgentId::Claude, false);
        let env = build_env(&ctx);
        assert_eq!(env.get("HOME").unwrap(), &path_str(&ctx.cwd));
        for var in ["TMPDIR", "TMP", "TEMP", "BUN_TMPDIR"] {
            assert!(env.get(var).unwrap().contains("claude"));
        }
        assert_eq!(env.get("HUSKY").unwrap(), "0");
        assert_eq!(env.get("HUSKY_SKIP_HOOKS").unwrap(), "1");
    }

    #[test]
    fn test_xdg_redirect_only_for_opencode() {
        let (_temp, claude_ctx) = ctx(AgentId::Claude, false);
        assert!(!build_env(&claude_ctx).contains_key("XDG_DATA_HOME"));

        let (_temp, oc_ctx) = ctx(AgentId::Opencode, false);
        let env = build_env(&oc_ctx);
        for var in [
            "XDG_DATA_HOME",
            "XDG_CACHE_HOME",
            "XDG_STATE_HOME",
            "XDG_CONFIG_HOME",
        ] {
            assert!(env.get(var).unwrap().contains("opencode"));
        }
    }

    #[test]
    fn test_worker_worktree_markers() {
        let (_temp, ctx) = ctx(AgentId::Droid, true);
        let env = build_env(&ctx);
        assert_eq!(env.get(DISABLE_BD_VAR).unwrap(), "1");
        let path = env.get("PATH").unwrap();
        assert!(path.starts_with(&path_str(ctx.shim_dir.as_ref().unwrap())));
    }

    #[test]
    fn test_safe_config_written() {
        let temp = TempDir::new().unwrap();
        let path = write_opencode_safe_config(temp.path()).unwrap();
        let path = path.expect("config should be written by default");
        let content = std::fs::read_to_string(path).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&content).unwrap();
        assert!(parsed["mcp"].as_object().unwrap().is_empty());
        assert!(parsed["plugin"].as_array().unwrap().is_empty());
        assert_eq!(parsed["autoupdate"], false);
    }

    #[test]
    fn test_prepare_dirs_seeds_safe_config_for_opencode_only() {
        let (_temp, oc_ctx) = ctx(AgentId::Opencode, false);
        prepare_dirs(&oc_ctx);
        assert!(oc_ctx
            .state_dir
            .join("opencode/config/opencode/opencode.json")
            .exists());
        for leaf in ["data", "cache", "state", "config"] {
            assert!(oc_ctx.state_dir.join("opencode").join(leaf).exists());
        }

        let (_temp, claude_ctx) = ctx(AgentId::Claude, false);
        prepare_dirs(&claude_ctx);
        assert!(!claude_ctx.state_dir.join("opencode").exists());
        assert!(claude_ctx.state_dir.join("tmp/claude").exists());
    }
}
