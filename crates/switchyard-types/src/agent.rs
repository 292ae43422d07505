use serde::{Deserialize, Serialize};

/// Broad capability class of an agent, used for intent matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentKind {
    Coordinator,
    Developer,
    Security,
    Data,
    Generic,
}

impl AgentKind {
    pub fn as_str(self) -> &'static str {
        match self {
            AgentKind::Coordinator => "coordinator",
            AgentKind::Developer => "developer",
            AgentKind::Security => "security",
            AgentKind::Data => "data",
            AgentKind::Generic => "generic",
        }
    }
}

/// A named invocation target backed by a model, with a declared skill set.
///
/// Definitions are loaded from configuration at startup and are immutable for
/// the lifetime of the process; consumers read `Arc` snapshots.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentDefinition {
    pub agent_id: String,
    pub kind: AgentKind,
    /// Model name resolved against the pricing table and backend registry.
    pub model: String,
    #[serde(default)]
    pub skills: Vec<String>,
    /// Ordered fallback agents tried when this one is unavailable.
    #[serde(default)]
    pub backup_agent_ids: Vec<String>,
}
