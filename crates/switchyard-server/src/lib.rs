use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use switchyard_core::{Dispatcher, EventBus, GatewayConfig};
use switchyard_gates::{BudgetGate, QuotaGate};
use switchyard_ledger::CostLedger;
use switchyard_observability::AlertLog;
use switchyard_resilience::{ActivityTable, BreakerRegistry};
use switchyard_workflow::WorkflowEngine;

mod http;

pub use http::serve;

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

pub fn build_id() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

/// Everything a handler can reach. Cheap to clone; heavy members are shared
/// behind `Arc`.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<GatewayConfig>,
    pub dispatcher: Arc<Dispatcher>,
    pub workflows: Arc<WorkflowEngine>,
    pub breakers: BreakerRegistry,
    pub activity: ActivityTable,
    pub ledger: Arc<CostLedger>,
    pub alerts: Arc<AlertLog>,
    pub budget: Arc<BudgetGate>,
    pub quota: QuotaGate,
    pub events: EventBus,
    pub started_at_ms: u64,
}

impl AppState {
    pub fn api_token(&self) -> Option<&str> {
        self.config
            .server
            .api_token
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
    }
}
