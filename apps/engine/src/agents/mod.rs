//! Concrete agents and the id-based registry used for plan and batch
//! dispatch.
//!
//! The registry is built once at process start and passed by reference;
//! dispatch is a lookup, never a hardcoded switch.

pub mod compatibility;
pub mod enrich;
pub mod prompts;
pub mod tailor;

use std::collections::HashMap;
use std::sync::Arc;

use crate::errors::EngineError;
use crate::runtime::{ErasedAgent, Registered};

pub use compatibility::{CompatibilityAgent, CompatibilityInput, CompatibilityResult};
pub use enrich::{EnrichAgent, EnrichInput, EnrichedRecord};
pub use tailor::{TailorAgent, TailorInput, TailoredDocument};

#[derive(Default)]
pub struct AgentRegistry {
    agents: HashMap<&'static str, Arc<dyn ErasedAgent>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The standard agent set.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry
            .register(Arc::new(Registered(CompatibilityAgent)))
            .expect("default registry ids are unique");
        registry
            .register(Arc::new(Registered(TailorAgent)))
            .expect("default registry ids are unique");
        registry
            .register(Arc::new(Registered(EnrichAgent)))
            .expect("default registry ids are unique");
        registry
    }

    pub fn register(&mut self, agent: Arc<dyn ErasedAgent>) -> Result<(), EngineError> {
        let id = agent.id();
        if self.agents.contains_key(id) {
            return Err(EngineError::InvalidInput(format!(
                "agent id '{id}' registered twice"
            )));
        }
        self.agents.insert(id, agent);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn ErasedAgent>> {
        self.agents.get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.agents.contains_key(id)
    }

    pub fn ids(&self) -> Vec<&'static str> {
        let mut ids: Vec<&'static str> = self.agents.keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}
