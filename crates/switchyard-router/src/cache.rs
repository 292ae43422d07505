//! TTL'd routing-decision cache.
//!
//! Keyed by a stable hash of (session_key, query). Within the TTL the
//! identical decision is served back, byte for byte. Writes replace whole
//! entries; there are no compound updates.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};
use tokio::sync::RwLock;

use switchyard_types::RoutingDecision;

const MAX_ENTRIES: usize = 4_096;

pub struct DecisionCache {
    ttl: Duration,
    entries: RwLock<HashMap<String, (Instant, RoutingDecision)>>,
}

impl DecisionCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: RwLock::new(HashMap::new()),
        }
    }

    fn key(session_key: &str, query: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(session_key.as_bytes());
        hasher.update([0]);
        hasher.update(query.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    pub async fn get(&self, session_key: &str, query: &str) -> Option<RoutingDecision> {
        if self.ttl.is_zero() {
            return None;
        }
        let key = Self::key(session_key, query);
        let entries = self.entries.read().await;
        let (stored_at, decision) = entries.get(&key)?;
        if stored_at.elapsed() > self.ttl {
            return None;
        }
        Some(decision.clone())
    }

    pub async fn put(&self, session_key: &str, query: &str, decision: RoutingDecision) {
        if self.ttl.is_zero() {
            return;
        }
        let key = Self::key(session_key, query);
        let mut entries = self.entries.write().await;
        if entries.len() >= MAX_ENTRIES {
            let ttl = self.ttl;
            entries.retain(|_, (stored_at, _)| stored_at.elapsed() <= ttl);
            if entries.len() >= MAX_ENTRIES {
                entries.clear();
            }
        }
        entries.insert(key, (Instant::now(), decision));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use switchyard_types::{Complexity, Intent};

    fn decision(agent: &str) -> RoutingDecision {
        RoutingDecision {
            chosen_agent_id: agent.to_string(),
            complexity: Complexity::Medium,
            complexity_score: 42,
            confidence: 0.6,
            intent: Intent::Development,
            required_skills: vec!["development".to_string()],
            fallback_agent_id: None,
            reason: "test".to_string(),
        }
    }

    #[tokio::test]
    async fn hit_within_ttl_returns_identical_bytes() {
        let cache = DecisionCache::new(Duration::from_secs(300));
        let stored = decision("dev-1");
        cache.put("session", "query", stored.clone()).await;

        let fetched = cache.get("session", "query").await.unwrap();
        assert_eq!(
            serde_json::to_vec(&stored).unwrap(),
            serde_json::to_vec(&fetched).unwrap()
        );
    }

    #[tokio::test]
    async fn different_session_is_a_miss() {
        let cache = DecisionCache::new(Duration::from_secs(300));
        cache.put("session-a", "query", decision("dev-1")).await;
        assert!(cache.get("session-b", "query").await.is_none());
    }

    #[tokio::test]
    async fn zero_ttl_disables_the_cache() {
        let cache = DecisionCache::new(Duration::ZERO);
        cache.put("session", "query", decision("dev-1")).await;
        assert!(cache.get("session", "query").await.is_none());
    }
}
