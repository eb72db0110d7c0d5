//! Git plumbing used by the engine.
//!
//! All mutations go through the `git` CLI; the engine never links a git
//! library. Output parsing sticks to porcelain formats.

mod repository;

pub use repository::{FastForward, Repository, StatusEntry, WorktreeInfo};
