use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Which budget tier rejected an admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetTier {
    PerTask,
    Daily,
    Monthly,
}

impl BudgetTier {
    pub fn as_str(self) -> &'static str {
        match self {
            BudgetTier::PerTask => "per_task",
            BudgetTier::Daily => "daily",
            BudgetTier::Monthly => "monthly",
        }
    }
}

impl std::fmt::Display for BudgetTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Closed taxonomy of observable failure kinds.
///
/// Every upstream shape is mapped into one of these exactly once at the
/// boundary where it is observed; downstream code matches on variants, never
/// on message strings.
#[derive(Debug, Clone, Error)]
pub enum DispatchError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("quota exceeded: {reason}")]
    QuotaReject {
        reason: String,
        limit: u64,
        current: u64,
    },

    #[error("budget exceeded at {gate} gate: {detail}")]
    BudgetReject {
        gate: BudgetTier,
        detail: String,
        current_spend: f64,
        limit: f64,
        remaining_budget: f64,
    },

    #[error("no agent available for this request")]
    NoAgentAvailable,

    #[error("circuit open for agent {agent_id}")]
    CircuitOpen { agent_id: String },

    #[error("back-end rate limited")]
    RateLimit { retry_after_secs: Option<u64> },

    #[error("deadline exceeded")]
    Timeout,

    #[error("upstream back-end error: {0}")]
    UpstreamError(String),

    #[error("back-end authentication failed")]
    AuthError,

    #[error("request cancelled")]
    Cancelled,

    #[error("internal error: {0}")]
    Internal(String),
}

impl DispatchError {
    /// Stable machine-readable kind for wire responses and alerts.
    pub fn kind(&self) -> &'static str {
        match self {
            DispatchError::InvalidInput(_) => "invalid_input",
            DispatchError::QuotaReject { .. } => "quota_reject",
            DispatchError::BudgetReject { .. } => "budget_reject",
            DispatchError::NoAgentAvailable => "no_agent_available",
            DispatchError::CircuitOpen { .. } => "circuit_open",
            DispatchError::RateLimit { .. } => "rate_limit",
            DispatchError::Timeout => "timeout",
            DispatchError::UpstreamError(_) => "upstream_error",
            DispatchError::AuthError => "auth_error",
            DispatchError::Cancelled => "cancelled",
            DispatchError::Internal(_) => "internal",
        }
    }

    /// True for conditions where the dispatcher may try a routed fallback
    /// agent. Budget and auth failures are deliberately excluded.
    pub fn allows_fallback(&self) -> bool {
        matches!(
            self,
            DispatchError::CircuitOpen { .. } | DispatchError::NoAgentAvailable
        )
    }
}

pub type Result<T> = std::result::Result<T, DispatchError>;
