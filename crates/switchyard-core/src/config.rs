//! The gateway configuration tree.
//!
//! One structured document supplies agents, model pricing, per-project
//! overrides, gate limits, breaker/retry/heartbeat policy, and the router's
//! keyword tables. Every knob has a serde default, so an empty file is a
//! runnable dev configuration.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use switchyard_gates::{BudgetLimits, ProjectBudgetOverrides, QuotaLimits};
use switchyard_providers::BackendConfig;
use switchyard_resilience::{BreakerConfig, HeartbeatConfig, RetryPolicy};
use switchyard_router::RouterConfig;
use switchyard_types::{
    AgentDefinition, AgentKind, ModelBackendInfo, ModelPricing, PricingTable, RateLimitInfo,
    DEFAULT_GATEWAY_HOST, DEFAULT_GATEWAY_PORT,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Bearer token required on every API call when set.
    #[serde(default)]
    pub api_token: Option<String>,
}

fn default_host() -> String {
    DEFAULT_GATEWAY_HOST.to_string()
}
fn default_port() -> u16 {
    DEFAULT_GATEWAY_PORT
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            api_token: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LedgerConfig {
    /// Cost log location; relative paths resolve against the state dir.
    #[serde(default)]
    pub path: Option<String>,
    /// fsync every append; durability over throughput.
    #[serde(default)]
    pub sync_on_append: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AlertsConfig {
    /// Alert log location; relative paths resolve against the state dir.
    #[serde(default)]
    pub path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EstimateConfig {
    /// Assumed completion size when the caller supplies no estimate.
    #[serde(default = "default_output_tokens")]
    pub default_output_tokens: u64,
}

fn default_output_tokens() -> u64 {
    512
}

impl Default for EstimateConfig {
    fn default() -> Self {
        Self {
            default_output_tokens: default_output_tokens(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default = "default_agents")]
    pub agents: Vec<AgentDefinition>,
    #[serde(default = "default_models")]
    pub models: Vec<ModelBackendInfo>,
    /// Safe-medium price applied to models missing from `models`.
    #[serde(default = "default_fallback_pricing")]
    pub fallback_pricing: ModelPricing,
    #[serde(default)]
    pub backends: Vec<BackendConfig>,
    #[serde(default)]
    pub budget: BudgetLimits,
    /// Per-project budget overrides keyed by project id.
    #[serde(default)]
    pub projects: HashMap<String, ProjectBudgetOverrides>,
    #[serde(default)]
    pub quota: QuotaLimits,
    #[serde(default)]
    pub breaker: BreakerConfig,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,
    #[serde(default)]
    pub router: RouterConfig,
    #[serde(default)]
    pub ledger: LedgerConfig,
    #[serde(default)]
    pub alerts: AlertsConfig,
    #[serde(default)]
    pub estimate: EstimateConfig,
    #[serde(default = "default_log_retention_days")]
    pub log_retention_days: u64,
}

fn default_log_retention_days() -> u64 {
    14
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            agents: default_agents(),
            models: default_models(),
            fallback_pricing: default_fallback_pricing(),
            backends: Vec::new(),
            budget: BudgetLimits::default(),
            projects: HashMap::new(),
            quota: QuotaLimits::default(),
            breaker: BreakerConfig::default(),
            retry: RetryPolicy::default(),
            heartbeat: HeartbeatConfig::default(),
            router: RouterConfig::default(),
            ledger: LedgerConfig::default(),
            alerts: AlertsConfig::default(),
            estimate: EstimateConfig::default(),
            log_retention_days: default_log_retention_days(),
        }
    }
}

impl GatewayConfig {
    /// Read the configuration file, falling back to full defaults when it
    /// does not exist yet.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse {}", path.display()))
    }

    pub fn pricing_table(&self) -> PricingTable {
        PricingTable::new(self.models.clone(), self.fallback_pricing)
    }

    /// Resolve a configured path against the state directory, keeping
    /// absolute overrides as-is.
    pub fn resolve_path(state_dir: &Path, configured: Option<&str>, default_name: &str) -> PathBuf {
        match configured {
            Some(path) if Path::new(path).is_absolute() => PathBuf::from(path),
            Some(path) => state_dir.join(path),
            None => state_dir.join(default_name),
        }
    }
}

fn default_fallback_pricing() -> ModelPricing {
    ModelPricing {
        input_usd_per_1k_tokens: 0.003,
        output_usd_per_1k_tokens: 0.015,
    }
}

fn default_models() -> Vec<ModelBackendInfo> {
    vec![
        ModelBackendInfo {
            name: "fast-small".to_string(),
            pricing: ModelPricing {
                input_usd_per_1k_tokens: 0.0005,
                output_usd_per_1k_tokens: 0.002,
            },
            context_window: 32_000,
            rate_limit: RateLimitInfo {
                rpm: 600,
                tpm: 400_000,
            },
        },
        ModelBackendInfo {
            name: "balanced-medium".to_string(),
            pricing: ModelPricing {
                input_usd_per_1k_tokens: 0.003,
                output_usd_per_1k_tokens: 0.015,
            },
            context_window: 128_000,
            rate_limit: RateLimitInfo {
                rpm: 300,
                tpm: 200_000,
            },
        },
        ModelBackendInfo {
            name: "deep-large".to_string(),
            pricing: ModelPricing {
                input_usd_per_1k_tokens: 0.01,
                output_usd_per_1k_tokens: 0.05,
            },
            context_window: 200_000,
            rate_limit: RateLimitInfo {
                rpm: 120,
                tpm: 100_000,
            },
        },
    ]
}

fn default_agents() -> Vec<AgentDefinition> {
    vec![
        AgentDefinition {
            agent_id: "coordinator".to_string(),
            kind: AgentKind::Coordinator,
            model: "fast-small".to_string(),
            skills: vec![
                "general".to_string(),
                "planning".to_string(),
                "coordination".to_string(),
            ],
            backup_agent_ids: vec!["generalist".to_string()],
        },
        AgentDefinition {
            agent_id: "developer".to_string(),
            kind: AgentKind::Developer,
            model: "deep-large".to_string(),
            skills: vec![
                "development".to_string(),
                "architecture".to_string(),
                "refactor".to_string(),
                "distributed".to_string(),
                "consensus".to_string(),
                "scalab".to_string(),
                "optimiz".to_string(),
            ],
            backup_agent_ids: vec!["generalist".to_string()],
        },
        AgentDefinition {
            agent_id: "security-analyst".to_string(),
            kind: AgentKind::Security,
            model: "balanced-medium".to_string(),
            skills: vec!["security".to_string(), "audit".to_string()],
            backup_agent_ids: vec!["developer".to_string()],
        },
        AgentDefinition {
            agent_id: "data-engineer".to_string(),
            kind: AgentKind::Data,
            model: "balanced-medium".to_string(),
            skills: vec!["database".to_string(), "sql".to_string()],
            backup_agent_ids: vec!["developer".to_string()],
        },
        AgentDefinition {
            agent_id: "generalist".to_string(),
            kind: AgentKind::Generic,
            model: "fast-small".to_string(),
            skills: vec!["general".to_string()],
            backup_agent_ids: Vec::new(),
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn missing_file_yields_defaults() {
        let temp = tempdir().unwrap();
        let config = GatewayConfig::load(&temp.path().join("config.json")).unwrap();
        assert!(!config.agents.is_empty());
        assert_eq!(config.server.port, DEFAULT_GATEWAY_PORT);
    }

    #[test]
    fn partial_file_fills_in_defaults() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("config.json");
        fs::write(
            &path,
            r#"{"server": {"port": 9999}, "budget": {"daily_usd": 5.0}}"#,
        )
        .unwrap();
        let config = GatewayConfig::load(&path).unwrap();
        assert_eq!(config.server.port, 9999);
        assert!((config.budget.daily_usd - 5.0).abs() < f64::EPSILON);
        // Untouched sections keep their defaults.
        assert_eq!(config.breaker.failure_threshold, 5);
        assert_eq!(config.retry.max_attempts, 3);
    }

    #[test]
    fn relative_paths_resolve_against_state_dir() {
        let state = Path::new("/var/lib/switchyard");
        assert_eq!(
            GatewayConfig::resolve_path(state, None, "costs.jsonl"),
            PathBuf::from("/var/lib/switchyard/costs.jsonl")
        );
        assert_eq!(
            GatewayConfig::resolve_path(state, Some("ledger/costs.jsonl"), "x"),
            PathBuf::from("/var/lib/switchyard/ledger/costs.jsonl")
        );
        assert_eq!(
            GatewayConfig::resolve_path(state, Some("/srv/costs.jsonl"), "x"),
            PathBuf::from("/srv/costs.jsonl")
        );
    }

    #[test]
    fn bad_json_is_an_error() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("config.json");
        fs::write(&path, "{not json").unwrap();
        assert!(GatewayConfig::load(&path).is_err());
    }
}
