//! Tracker backend registry.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::capability::Tracker;
use crate::error::{Result, TrackerError};
use crate::json_tracker::JsonTracker;

/// Factory producing a tracker rooted at the given working directory.
pub type TrackerFactory = Box<dyn Fn(&Path) -> Result<Arc<dyn Tracker>> + Send + Sync>;

pub struct TrackerRegistry {
    factories: HashMap<String, TrackerFactory>,
}

impl TrackerRegistry {
    pub fn empty() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Registry pre-populated with the built-in JSON-file backend.
    pub fn builtin() -> Self {
        let mut registry = Self::empty();
        registry.register("json", |cwd| {
            Ok(Arc::new(JsonTracker::open(default_store_path(cwd))?))
        });
        registry
    }

    pub fn register<F>(&mut self, id: impl Into<String>, factory: F)
    where
        F: Fn(&Path) -> Result<Arc<dyn Tracker>> + Send + Sync + 'static,
    {
        self.factories.insert(id.into(), Box::new(factory));
    }

    pub fn create(&self, id: &str, cwd: &Path) -> Result<Arc<dyn Tracker>> {
        let factory = self
            .factories
            .get(id)
            .ok_or_else(|| TrackerError::BackendNotFound { id: id.to_string() })?;
        factory(cwd)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.factories.contains_key(id)
    }
}

/// Default location of the JSON backend's store under a working directory.
pub fn default_store_path(cwd: &Path) -> PathBuf {
    cwd.join(".ralph-tui").join("tasks.json")
}
