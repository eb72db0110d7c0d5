//! Tracker capability layer for the ralph execution engine.
//!
//! The engine consumes task state through the [`Tracker`] trait; concrete
//! backends (beads, sqlite, hosted issue trackers) register factories in the
//! [`TrackerRegistry`]. A JSON-file backend ships in-tree and doubles as the
//! test tracker.

pub mod capability;
pub mod error;
pub mod json_tracker;
pub mod registry;
pub mod task;
pub mod watcher;

pub use capability::{ClaimOutcome, ReleaseOutcome, TaskFilter, Tracker, TrackerMeta};
pub use error::{Result, TrackerError};
pub use json_tracker::JsonTracker;
pub use registry::TrackerRegistry;
pub use task::{ImpactPlan, PendingMain, RenameEntry, Task, TaskStatus};
pub use watcher::{TrackerChangeWatcher, WatcherConfig, WatcherStatus};
