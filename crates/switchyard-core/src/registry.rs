use std::collections::HashMap;
use std::sync::Arc;

use switchyard_types::AgentDefinition;

/// Immutable agent catalog, loaded once at startup.
///
/// The router reads snapshots of this registry; the registry knows nothing
/// about the router, which keeps the dependency one-way.
#[derive(Clone)]
pub struct AgentRegistry {
    agents: Arc<Vec<AgentDefinition>>,
    by_id: Arc<HashMap<String, usize>>,
}

impl AgentRegistry {
    pub fn new(agents: Vec<AgentDefinition>) -> Self {
        let by_id = agents
            .iter()
            .enumerate()
            .map(|(idx, agent)| (agent.agent_id.clone(), idx))
            .collect();
        Self {
            agents: Arc::new(agents),
            by_id: Arc::new(by_id),
        }
    }

    pub fn get(&self, agent_id: &str) -> Option<&AgentDefinition> {
        self.by_id.get(agent_id).map(|idx| &self.agents[*idx])
    }

    /// Cheap shared snapshot for routing.
    pub fn snapshot(&self) -> Arc<Vec<AgentDefinition>> {
        self.agents.clone()
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}
