//! Agent plugin registry.
//!
//! Construction stays behind a registry mapping id to factory, so the engine
//! never names a concrete plugin type.

mod cli_agent;

pub use cli_agent::{CliAgent, CliAgentSpec, ModelRule, PromptStyle};

use std::collections::HashMap;
use std::sync::Arc;

use crate::capability::{Agent, AgentId};
use crate::error::{AgentError, Result};

/// Factory producing a fresh agent instance for one owner (engine or worker).
pub type AgentFactory = Box<dyn Fn() -> Arc<dyn Agent> + Send + Sync>;

pub struct AgentRegistry {
    factories: HashMap<AgentId, AgentFactory>,
}

impl AgentRegistry {
    pub fn empty() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Registry pre-populated with the built-in CLI families.
    pub fn builtin() -> Self {
        let mut registry = Self::empty();
        registry.register(AgentId::Claude, || {
            Arc::new(CliAgent::new(CliAgentSpec::claude()))
        });
        registry.register(AgentId::Opencode, || {
            Arc::new(CliAgent::new(CliAgentSpec::opencode()))
        });
        registry.register(AgentId::Droid, || {
            Arc::new(CliAgent::new(CliAgentSpec::droid()))
        });
        registry
    }

    pub fn register<F>(&mut self, id: AgentId, factory: F)
    where
        F: Fn() -> Arc<dyn Agent> + Send + Sync + 'static,
    {
        self.factories.insert(id, Box::new(factory));
    }

    /// Instantiate a fresh agent for the given id.
    pub fn create(&self, id: &AgentId) -> Result<Arc<dyn Agent>> {
        let factory = self
            .factories
            .get(id)
            .ok_or_else(|| AgentError::AgentNotFound {
                name: id.to_string(),
            })?;
        Ok(factory())
    }

    pub fn contains(&self, id: &AgentId) -> bool {
        self.factories.contains_key(id)
    }

    pub fn ids(&self) -> Vec<AgentId> {
        let mut ids: Vec<AgentId> = self.factories.keys().cloned().collect();
        ids.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_families_registered() {
        let registry = AgentRegistry::builtin();
        assert!(registry.contains(&AgentId::Claude));
        assert!(registry.contains(&AgentId::Opencode));
        assert!(registry.contains(&AgentId::Droid));
        assert!(!registry.contains(&AgentId::Custom("aider".to_string())));
    }

    #[test]
    fn test_create_unknown_fails() {
        let registry = AgentRegistry::builtin();
        let err = match registry.create(&AgentId::Custom("missing".to_string())) {
            Err(e) => e,
            Ok(_) => panic!("expected error"),
        };
        assert_eq!(err.code(), "E4001");
    }

    #[test]
    fn test_custom_registration() {
        let mut registry = AgentRegistry::builtin();
        let id = AgentId::Custom("scripted".to_string());
        let register_id = id.clone();
        registry.register(id.clone(), move || {
            Arc::new(crate::testing::ScriptedAgent::new(register_id.clone()))
        });
        let agent = registry.create(&id).unwrap();
        assert_eq!(agent.meta().id, id);
    }
}
