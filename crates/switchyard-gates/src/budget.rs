//! Pre-admission budget control.
//!
//! Three tiers are evaluated in order (per-task, daily, monthly) against a
//! fresh snapshot derived from the cost ledger. The gate never blocks on
//! external I/O: ledger reads are local file scans. Dollar accounting across
//! concurrent admissions is deliberately not linearizable; post-call
//! reconciliation trips a per-project HALT when actual spend crosses the
//! hard ceiling, which closes the loop.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::warn;

use switchyard_ledger::CostLedger;
use switchyard_types::{BudgetTier, DispatchError, PricingTable, TokenEstimate};

/// Global tier limits. These are configuration, not policy: the shipped
/// values are placeholders every deployment is expected to override.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetLimits {
    #[serde(default = "default_per_task_usd")]
    pub per_task_usd: f64,
    #[serde(default = "default_daily_usd")]
    pub daily_usd: f64,
    #[serde(default = "default_monthly_usd")]
    pub monthly_usd: f64,
    /// Fraction of a tier at which admissions log a warning (non-blocking).
    #[serde(default = "default_warn_ratio")]
    pub warn_ratio: f64,
    /// Fraction of the daily/monthly limit at which reconciliation halts
    /// the project outright.
    #[serde(default = "default_halt_ratio")]
    pub halt_ratio: f64,
}

fn default_per_task_usd() -> f64 {
    1.0
}
fn default_daily_usd() -> f64 {
    20.0
}
fn default_monthly_usd() -> f64 {
    200.0
}
fn default_warn_ratio() -> f64 {
    0.8
}
fn default_halt_ratio() -> f64 {
    1.0
}

impl Default for BudgetLimits {
    fn default() -> Self {
        Self {
            per_task_usd: default_per_task_usd(),
            daily_usd: default_daily_usd(),
            monthly_usd: default_monthly_usd(),
            warn_ratio: default_warn_ratio(),
            halt_ratio: default_halt_ratio(),
        }
    }
}

/// Per-project overrides; any unset field falls back to the global limit.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProjectBudgetOverrides {
    pub per_task_usd: Option<f64>,
    pub daily_usd: Option<f64>,
    pub monthly_usd: Option<f64>,
}

#[derive(Debug, Clone, Copy)]
struct EffectiveLimits {
    per_task: f64,
    daily: f64,
    monthly: f64,
}

/// Outcome of one gate evaluation. `Warn` admits the request.
#[derive(Debug, Clone, PartialEq)]
pub enum GateDecision {
    Approve,
    Warn {
        tier: BudgetTier,
        current_spend: f64,
        limit: f64,
    },
    Reject {
        tier: BudgetTier,
        detail: String,
        current_spend: f64,
        limit: f64,
        remaining_budget: f64,
    },
}

impl GateDecision {
    pub fn admits(&self) -> bool {
        !matches!(self, GateDecision::Reject { .. })
    }

    /// Convert a rejection into the wire error; approvals map to `None`.
    pub fn into_error(self) -> Option<DispatchError> {
        match self {
            GateDecision::Reject {
                tier,
                detail,
                current_spend,
                limit,
                remaining_budget,
            } => Some(DispatchError::BudgetReject {
                gate: tier,
                detail,
                current_spend,
                limit,
                remaining_budget,
            }),
            _ => None,
        }
    }
}

/// View of a project's budget for the quotas API.
#[derive(Debug, Clone, Serialize)]
pub struct BudgetStatus {
    pub project_id: String,
    pub daily_spend: f64,
    pub daily_limit: f64,
    pub monthly_spend: f64,
    pub monthly_limit: f64,
    pub per_task_limit: f64,
    pub halted: bool,
}

pub struct BudgetGate {
    limits: BudgetLimits,
    overrides: HashMap<String, ProjectBudgetOverrides>,
    pricing: PricingTable,
    ledger: Arc<CostLedger>,
    halted: RwLock<HashSet<String>>,
}

impl BudgetGate {
    pub fn new(
        limits: BudgetLimits,
        overrides: HashMap<String, ProjectBudgetOverrides>,
        pricing: PricingTable,
        ledger: Arc<CostLedger>,
    ) -> Self {
        Self {
            limits,
            overrides,
            pricing,
            ledger,
            halted: RwLock::new(HashSet::new()),
        }
    }

    fn effective(&self, project_id: &str) -> EffectiveLimits {
        let overrides = self.overrides.get(project_id);
        EffectiveLimits {
            per_task: overrides
                .and_then(|o| o.per_task_usd)
                .unwrap_or(self.limits.per_task_usd),
            daily: overrides
                .and_then(|o| o.daily_usd)
                .unwrap_or(self.limits.daily_usd),
            monthly: overrides
                .and_then(|o| o.monthly_usd)
                .unwrap_or(self.limits.monthly_usd),
        }
    }

    pub fn estimate_cost(&self, model: &str, estimate: TokenEstimate) -> f64 {
        self.pricing.cost(model, estimate.input, estimate.output)
    }

    /// Evaluate the three tiers in order against a fresh snapshot.
    pub async fn check(
        &self,
        project_id: &str,
        model: &str,
        estimate: TokenEstimate,
    ) -> switchyard_types::Result<GateDecision> {
        if self.halted.read().await.contains(project_id) {
            return Ok(GateDecision::Reject {
                tier: BudgetTier::Daily,
                detail: "project halted after spend reconciliation".to_string(),
                current_spend: 0.0,
                limit: 0.0,
                remaining_budget: 0.0,
            });
        }

        let limits = self.effective(project_id);
        let estimated = self.estimate_cost(model, estimate);
        let now = Utc::now();

        if estimated > limits.per_task {
            return Ok(GateDecision::Reject {
                tier: BudgetTier::PerTask,
                detail: format!(
                    "estimated cost ${:.4} exceeds the per-task limit",
                    estimated
                ),
                current_spend: estimated,
                limit: limits.per_task,
                remaining_budget: 0.0,
            });
        }

        let daily = self
            .ledger
            .daily_spend(project_id, now)
            .map_err(|e| DispatchError::Internal(e.to_string()))?;
        if daily + estimated > limits.daily {
            return Ok(GateDecision::Reject {
                tier: BudgetTier::Daily,
                detail: format!(
                    "daily spend ${:.4} plus estimate ${:.4} exceeds the daily limit",
                    daily, estimated
                ),
                current_spend: daily,
                limit: limits.daily,
                remaining_budget: (limits.daily - daily).max(0.0),
            });
        }

        let monthly = self
            .ledger
            .monthly_spend(project_id, now)
            .map_err(|e| DispatchError::Internal(e.to_string()))?;
        if monthly + estimated > limits.monthly {
            return Ok(GateDecision::Reject {
                tier: BudgetTier::Monthly,
                detail: format!(
                    "monthly spend ${:.4} plus estimate ${:.4} exceeds the monthly limit",
                    monthly, estimated
                ),
                current_spend: monthly,
                limit: limits.monthly,
                remaining_budget: (limits.monthly - monthly).max(0.0),
            });
        }

        let warn_ratio = self.limits.warn_ratio;
        for (tier, spend, limit) in [
            (BudgetTier::PerTask, estimated, limits.per_task),
            (BudgetTier::Daily, daily + estimated, limits.daily),
            (BudgetTier::Monthly, monthly + estimated, limits.monthly),
        ] {
            if limit > 0.0 && spend > limit * warn_ratio {
                warn!(
                    project = project_id,
                    tier = tier.as_str(),
                    spend,
                    limit,
                    "budget warning threshold crossed"
                );
                return Ok(GateDecision::Warn {
                    tier,
                    current_spend: spend,
                    limit,
                });
            }
        }

        Ok(GateDecision::Approve)
    }

    /// Post-call verification against actual ledger spend. Trips the HALT
    /// flag when the hard ceiling is crossed and reports which tier did it.
    pub async fn reconcile(&self, project_id: &str) -> switchyard_types::Result<Option<BudgetTier>> {
        let limits = self.effective(project_id);
        let now = Utc::now();
        let daily = self
            .ledger
            .daily_spend(project_id, now)
            .map_err(|e| DispatchError::Internal(e.to_string()))?;
        let monthly = self
            .ledger
            .monthly_spend(project_id, now)
            .map_err(|e| DispatchError::Internal(e.to_string()))?;

        let tripped = if daily >= limits.daily * self.limits.halt_ratio {
            Some(BudgetTier::Daily)
        } else if monthly >= limits.monthly * self.limits.halt_ratio {
            Some(BudgetTier::Monthly)
        } else {
            None
        };

        if let Some(tier) = tripped {
            let inserted = self.halted.write().await.insert(project_id.to_string());
            if inserted {
                warn!(
                    project = project_id,
                    tier = tier.as_str(),
                    "budget reconciliation halted project"
                );
            }
        }
        Ok(tripped)
    }

    pub async fn is_halted(&self, project_id: &str) -> bool {
        self.halted.read().await.contains(project_id)
    }

    pub async fn status(&self, project_id: &str) -> switchyard_types::Result<BudgetStatus> {
        let limits = self.effective(project_id);
        let now = Utc::now();
        let daily = self
            .ledger
            .daily_spend(project_id, now)
            .map_err(|e| DispatchError::Internal(e.to_string()))?;
        let monthly = self
            .ledger
            .monthly_spend(project_id, now)
            .map_err(|e| DispatchError::Internal(e.to_string()))?;
        Ok(BudgetStatus {
            project_id: project_id.to_string(),
            daily_spend: daily,
            daily_limit: limits.daily,
            monthly_spend: monthly,
            monthly_limit: limits.monthly,
            per_task_limit: limits.per_task,
            halted: self.is_halted(project_id).await,
        })
    }
}
