use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Immutable record of one billable invocation. Appended to the cost log;
/// never mutated after write.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostEvent {
    pub timestamp: DateTime<Utc>,
    pub project_id: String,
    pub agent_id: String,
    pub model: String,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub cost_usd: f64,
    pub request_id: String,
}
