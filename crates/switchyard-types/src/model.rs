use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Dollar price per 1000 tokens, split by direction.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelPricing {
    pub input_usd_per_1k_tokens: f64,
    pub output_usd_per_1k_tokens: f64,
}

impl ModelPricing {
    /// Cost of a single call: `tokens/1000 · price` per direction.
    pub fn cost(&self, tokens_in: u64, tokens_out: u64) -> f64 {
        tokens_in as f64 / 1000.0 * self.input_usd_per_1k_tokens
            + tokens_out as f64 / 1000.0 * self.output_usd_per_1k_tokens
    }

    /// Single comparable number for cost tie-breaking between models.
    pub fn blended_per_1k(&self) -> f64 {
        (self.input_usd_per_1k_tokens + self.output_usd_per_1k_tokens) / 2.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitInfo {
    pub rpm: u32,
    pub tpm: u32,
}

/// Static description of one model back-end. Immutable after load.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelBackendInfo {
    pub name: String,
    pub pricing: ModelPricing,
    pub context_window: u32,
    pub rate_limit: RateLimitInfo,
}

/// Typed pricing lookup keyed by model name.
///
/// Unknown models fall back to a configured safe-medium price rather than
/// being treated as free.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PricingTable {
    #[serde(default)]
    models: HashMap<String, ModelBackendInfo>,
    fallback: ModelPricing,
}

impl PricingTable {
    pub fn new(models: Vec<ModelBackendInfo>, fallback: ModelPricing) -> Self {
        Self {
            models: models.into_iter().map(|m| (m.name.clone(), m)).collect(),
            fallback,
        }
    }

    pub fn model(&self, name: &str) -> Option<&ModelBackendInfo> {
        self.models.get(name)
    }

    pub fn pricing(&self, model: &str) -> ModelPricing {
        self.models
            .get(model)
            .map(|m| m.pricing)
            .unwrap_or(self.fallback)
    }

    pub fn cost(&self, model: &str, tokens_in: u64, tokens_out: u64) -> f64 {
        self.pricing(model).cost(tokens_in, tokens_out)
    }

    pub fn blended_per_1k(&self, model: &str) -> f64 {
        self.pricing(model).blended_per_1k()
    }
}

impl Default for PricingTable {
    fn default() -> Self {
        Self {
            models: HashMap::new(),
            // Safe-medium default applied to unknown models.
            fallback: ModelPricing {
                input_usd_per_1k_tokens: 0.003,
                output_usd_per_1k_tokens: 0.015,
            },
        }
    }
}
