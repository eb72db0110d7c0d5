//! Per-worktree command shims.
//!
//! Worker worktrees get a `bd` shim early on PATH so agents cannot mutate
//! the task database from inside a worktree; all task state flows through
//! the tracker owned by the engine.

use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::paths;

const BD_SHIM: &str = "#!/bin/sh\necho \"bd is disabled in worker worktrees\" >&2\nexit 1\n";

/// Install shims into a worktree. Returns the shim bin directory, which the
/// execution envelope prepends to PATH.
pub fn install_shims(worktree: &Path) -> Result<PathBuf> {
    let bin_dir = paths::shim_bin_dir(worktree);
    std::fs::create_dir_all(&bin_dir)?;

    let bd = bin_dir.join("bd");
    std::fs::write(&bd, BD_SHIM)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&bd, std::fs::Permissions::from_mode(0o755))?;
    }

    Ok(bin_dir)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shim_installed_and_executable() {
        let temp = tempfile::TempDir::new().unwrap();
        let bin_dir = install_shims(temp.path()).unwrap();
        let bd = bin_dir.join("bd");
        assert!(bd.exists());
        let content = std::fs::read_to_string(&bd).unwrap();
        assert!(content.contains("bd is disabled in worker worktrees"));
        assert!(content.contains("exit 1"));

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&bd).unwrap().permissions().mode();
            assert_ne!(mode & 0o111, 0, "shim must be executable");
        }
    }
}
