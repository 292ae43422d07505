//! Agent selection.
//!
//! Scoring blends intent affinity (0.6), skill match (0.3), and breaker
//! availability (0.1), with a recency penalty when the same agent served the
//! same session within the last minute. Cost never enters the score; among
//! equal scores the agent with the cheaper model ranks first.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;

use switchyard_types::{
    AgentDefinition, AgentKind, Complexity, DispatchError, Intent, PricingTable, RoutingDecision,
};

use crate::cache::DecisionCache;
use crate::complexity::assess_complexity;
use crate::config::RouterConfig;
use crate::intent::infer_intent;

/// Narrow read-only view of breaker state. The router never owns or mutates
/// breakers; it only reads a score.
#[async_trait]
pub trait AvailabilityView: Send + Sync {
    /// 1.0 fully available, 0.0 unavailable.
    async fn availability(&self, agent_id: &str) -> f64;
}

/// Default view for contexts without breakers (offline routing, tests).
pub struct FullyAvailable;

#[async_trait]
impl AvailabilityView for FullyAvailable {
    async fn availability(&self, _agent_id: &str) -> f64 {
        1.0
    }
}

pub struct Router {
    config: RouterConfig,
    pricing: PricingTable,
    availability: Arc<dyn AvailabilityView>,
    cache: DecisionCache,
    /// session_key -> (agent_id, when) for the recency penalty.
    recent: RwLock<HashMap<String, (String, Instant)>>,
}

impl Router {
    pub fn new(
        config: RouterConfig,
        pricing: PricingTable,
        availability: Arc<dyn AvailabilityView>,
    ) -> Self {
        let cache = DecisionCache::new(Duration::from_secs(config.cache_ttl_secs));
        Self {
            config,
            pricing,
            availability,
            cache,
            recent: RwLock::new(HashMap::new()),
        }
    }

    fn min_confidence(&self, complexity: Complexity) -> f64 {
        match complexity {
            Complexity::High => self.config.min_confidence_high,
            Complexity::Medium => self.config.min_confidence_medium,
            Complexity::Low => self.config.min_confidence_low,
        }
    }

    /// Pick one agent (plus ranked fallback) for a query.
    pub async fn route(
        &self,
        query: &str,
        session_key: &str,
        history_turns: usize,
        agents: &[AgentDefinition],
    ) -> switchyard_types::Result<RoutingDecision> {
        if query.trim().is_empty() {
            return Err(DispatchError::InvalidInput("empty query".to_string()));
        }

        if let Some(cached) = self.cache.get(session_key, query).await {
            debug!(session = session_key, "routing decision served from cache");
            return Ok(cached);
        }

        if agents.is_empty() {
            return Err(DispatchError::NoAgentAvailable);
        }

        let assessment =
            assess_complexity(query, history_turns, &self.config.keywords, &self.config.weights);
        let intent = infer_intent(query, &self.config.keywords);

        let mut required_skills = vec![intent.as_str().to_string()];
        for keyword in &assessment.matched_high {
            let skill = keyword.trim_end_matches('*').to_string();
            if !required_skills.contains(&skill) {
                required_skills.push(skill);
            }
        }

        let recent_agent = {
            let recent = self.recent.read().await;
            recent.get(session_key).and_then(|(agent, at)| {
                (at.elapsed() <= Duration::from_secs(self.config.recency_window_secs))
                    .then(|| agent.clone())
            })
        };

        let mut scored = Vec::with_capacity(agents.len());
        for agent in agents {
            let affinity = intent_affinity(agent.kind, intent);
            let skill_ratio = skill_match_ratio(&agent.skills, &required_skills);
            let availability = self.availability.availability(&agent.agent_id).await;
            let mut score = 0.6 * affinity + 0.3 * skill_ratio + 0.1 * availability;
            if recent_agent.as_deref() == Some(agent.agent_id.as_str()) {
                score *= self.config.recency_penalty;
            }
            scored.push((score, agent));
        }

        // Deterministic order: score, then cheaper model, then id.
        scored.sort_by(|(score_a, agent_a), (score_b, agent_b)| {
            score_b
                .partial_cmp(score_a)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| {
                    self.pricing
                        .blended_per_1k(&agent_a.model)
                        .partial_cmp(&self.pricing.blended_per_1k(&agent_b.model))
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .then_with(|| agent_a.agent_id.cmp(&agent_b.agent_id))
        });

        let floor = self.min_confidence(assessment.complexity);
        let (top_score, chosen) = match scored.first() {
            Some((score, agent)) if *score >= floor => (*score, *agent),
            _ => return Err(DispatchError::NoAgentAvailable),
        };

        let fallback_agent_id = scored
            .get(1)
            .map(|(_, agent)| agent.agent_id.clone())
            .or_else(|| chosen.backup_agent_ids.first().cloned());

        // Confidence grows as the score leaves the uncertain middle band.
        let band_distance = f64::from(assessment.score.abs_diff(50)) / 100.0;
        let confidence = (top_score * (0.5 + band_distance)).clamp(0.0, 1.0);

        let decision = RoutingDecision {
            chosen_agent_id: chosen.agent_id.clone(),
            complexity: assessment.complexity,
            complexity_score: assessment.score,
            confidence,
            intent,
            required_skills,
            fallback_agent_id,
            reason: format!(
                "intent={} complexity={} score={} agent_score={:.2}",
                intent.as_str(),
                match assessment.complexity {
                    Complexity::Low => "low",
                    Complexity::Medium => "medium",
                    Complexity::High => "high",
                },
                assessment.score,
                top_score
            ),
        };

        self.recent.write().await.insert(
            session_key.to_string(),
            (chosen.agent_id.clone(), Instant::now()),
        );
        self.cache.put(session_key, query, decision.clone()).await;
        Ok(decision)
    }
}

fn intent_affinity(kind: AgentKind, intent: Intent) -> f64 {
    match (intent, kind) {
        (Intent::Security, AgentKind::Security) => 1.0,
        (Intent::Development, AgentKind::Developer) => 1.0,
        (Intent::Planning, AgentKind::Coordinator) => 1.0,
        (Intent::Database, AgentKind::Data) => 1.0,
        (Intent::General, AgentKind::Coordinator) => 1.0,
        (_, AgentKind::Generic) => 0.5,
        (Intent::General, _) => 0.4,
        _ => 0.2,
    }
}

fn skill_match_ratio(agent_skills: &[String], required: &[String]) -> f64 {
    if required.is_empty() {
        return 1.0;
    }
    let matched = required
        .iter()
        .filter(|skill| {
            agent_skills
                .iter()
                .any(|s| s.eq_ignore_ascii_case(skill))
        })
        .count();
    matched as f64 / required.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use switchyard_types::{ModelBackendInfo, ModelPricing, RateLimitInfo};

    fn agent(id: &str, kind: AgentKind, model: &str, skills: &[&str]) -> AgentDefinition {
        AgentDefinition {
            agent_id: id.to_string(),
            kind,
            model: model.to_string(),
            skills: skills.iter().map(|s| s.to_string()).collect(),
            backup_agent_ids: Vec::new(),
        }
    }

    fn fleet() -> Vec<AgentDefinition> {
        vec![
            agent("coord-1", AgentKind::Coordinator, "fast-small", &["general", "planning"]),
            agent(
                "dev-1",
                AgentKind::Developer,
                "deep-large",
                &["development", "architecture", "distributed", "consensus", "refactor", "scalab"],
            ),
            agent("sec-1", AgentKind::Security, "deep-large", &["security", "audit"]),
        ]
    }

    fn pricing() -> PricingTable {
        PricingTable::new(
            vec![
                ModelBackendInfo {
                    name: "fast-small".into(),
                    pricing: ModelPricing {
                        input_usd_per_1k_tokens: 0.0005,
                        output_usd_per_1k_tokens: 0.002,
                    },
                    context_window: 32_000,
                    rate_limit: RateLimitInfo { rpm: 600, tpm: 200_000 },
                },
                ModelBackendInfo {
                    name: "deep-large".into(),
                    pricing: ModelPricing {
                        input_usd_per_1k_tokens: 0.01,
                        output_usd_per_1k_tokens: 0.05,
                    },
                    context_window: 200_000,
                    rate_limit: RateLimitInfo { rpm: 120, tpm: 80_000 },
                },
            ],
            ModelPricing {
                input_usd_per_1k_tokens: 0.003,
                output_usd_per_1k_tokens: 0.015,
            },
        )
    }

    fn router() -> Router {
        Router::new(RouterConfig::default(), pricing(), Arc::new(FullyAvailable))
    }

    #[tokio::test]
    async fn greeting_routes_to_coordinator() {
        let router = router();
        let decision = router
            .route("hi, thanks!", "session-1", 0, &fleet())
            .await
            .unwrap();
        assert_eq!(decision.chosen_agent_id, "coord-1");
        assert!(decision.complexity_score <= 30);
        assert_eq!(decision.complexity, Complexity::Low);
    }

    #[tokio::test]
    async fn high_complexity_routes_to_developer_with_confidence() {
        let router = router();
        let decision = router
            .route(
                "refactor the scalable consensus architecture across the distributed pipeline",
                "session-2",
                0,
                &fleet(),
            )
            .await
            .unwrap();
        assert_eq!(decision.chosen_agent_id, "dev-1");
        assert!(decision.complexity_score >= 70);
        assert!(decision.confidence >= 0.5, "confidence {}", decision.confidence);
        assert!(decision.fallback_agent_id.is_some());
    }

    #[tokio::test]
    async fn identical_query_within_ttl_is_cache_identical() {
        let router = router();
        let first = router
            .route("fix the bug in the build pipeline", "session-3", 0, &fleet())
            .await
            .unwrap();
        let second = router
            .route("fix the bug in the build pipeline", "session-3", 0, &fleet())
            .await
            .unwrap();
        assert_eq!(
            serde_json::to_vec(&first).unwrap(),
            serde_json::to_vec(&second).unwrap()
        );
    }

    #[tokio::test]
    async fn recency_penalty_rotates_equal_agents() {
        let router = router();
        let twins = vec![
            agent("dev-a", AgentKind::Developer, "fast-small", &["development"]),
            agent("dev-b", AgentKind::Developer, "fast-small", &["development"]),
        ];
        let first = router
            .route("implement the api endpoint", "session-4", 0, &twins)
            .await
            .unwrap();
        assert_eq!(first.chosen_agent_id, "dev-a");
        let second = router
            .route("implement the api function", "session-4", 0, &twins)
            .await
            .unwrap();
        assert_eq!(second.chosen_agent_id, "dev-b");
    }

    #[tokio::test]
    async fn cost_breaks_score_ties() {
        let router = router();
        let twins = vec![
            agent("dev-pricey", AgentKind::Developer, "deep-large", &["development"]),
            agent("dev-thrifty", AgentKind::Developer, "fast-small", &["development"]),
        ];
        let decision = router
            .route("implement the api endpoint", "session-5", 0, &twins)
            .await
            .unwrap();
        assert_eq!(decision.chosen_agent_id, "dev-thrifty");
    }

    #[tokio::test]
    async fn empty_query_is_invalid_input() {
        let router = router();
        let err = router.route("   ", "session-6", 0, &fleet()).await.unwrap_err();
        assert!(matches!(err, DispatchError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn no_candidates_is_no_agent_available() {
        let router = router();
        let err = router
            .route("implement the api endpoint", "session-7", 0, &[])
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::NoAgentAvailable));
    }

    #[tokio::test]
    async fn confidence_floor_rejects_weak_matches() {
        let router = router();
        // High-complexity query with only a poorly matched agent on offer.
        let weak = vec![agent("data-1", AgentKind::Data, "fast-small", &["database"])];
        let err = router
            .route(
                "refactor the scalable consensus architecture across the distributed pipeline",
                "session-8",
                0,
                &weak,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::NoAgentAvailable));
    }
}
