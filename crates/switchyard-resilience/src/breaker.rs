//! Per-agent circuit breaker.
//!
//! Protects model back-ends from repeated doomed calls. When an agent keeps
//! failing, its circuit opens and admissions fail fast instead of tying up
//! workers on calls that will not succeed.
//!
//! State machine:
//!
//! ```text
//! Closed ──(threshold failures in window)──► Open
//!   ▲                                          │
//!   └──(probe success)──── HalfOpen ◄──(half-open timeout elapsed)──┘
//! ```
//!
//! HalfOpen admits exactly one probe. Admission and probe claim happen in a
//! single critical section, so two concurrent callers can never both hold
//! the probe.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half_open"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Failures within the window before the circuit opens.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Sliding window over which failures are counted, in seconds.
    #[serde(default = "default_failure_window_sec")]
    pub failure_window_sec: u64,
    /// How long the circuit stays Open before a HalfOpen probe is allowed,
    /// in seconds.
    #[serde(default = "default_half_open_timeout_sec")]
    pub half_open_timeout_sec: u64,
}

fn default_failure_threshold() -> u32 {
    5
}
fn default_failure_window_sec() -> u64 {
    60
}
fn default_half_open_timeout_sec() -> u64 {
    30
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            failure_window_sec: default_failure_window_sec(),
            half_open_timeout_sec: default_half_open_timeout_sec(),
        }
    }
}

impl BreakerConfig {
    fn failure_window(&self) -> Duration {
        Duration::from_secs(self.failure_window_sec)
    }

    fn half_open_timeout(&self) -> Duration {
        Duration::from_secs(self.half_open_timeout_sec)
    }
}

/// Outcome of an admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Proceed. `probe` is set when this call is the single HalfOpen probe;
    /// its verdict (or release) decides the next transition.
    Allowed { probe: bool },
    /// Fail fast without touching the back-end.
    Rejected { state: CircuitState },
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failures: VecDeque<Instant>,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

impl BreakerInner {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failures: VecDeque::new(),
            opened_at: None,
            probe_in_flight: false,
        }
    }

    fn prune(&mut self, window: Duration, now: Instant) {
        while let Some(first) = self.failures.front() {
            if now.duration_since(*first) > window {
                self.failures.pop_front();
            } else {
                break;
            }
        }
    }
}

/// Observable snapshot for the health API.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub agent_id: String,
    pub state: CircuitState,
    pub recent_failures: usize,
    pub open_for_secs: Option<u64>,
}

/// Breaker for one agent. All transitions run under a single mutex so no
/// observer can see a torn state.
pub struct AgentBreaker {
    agent_id: String,
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl AgentBreaker {
    pub fn new(agent_id: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            agent_id: agent_id.into(),
            config,
            inner: Mutex::new(BreakerInner::new()),
        }
    }

    /// Admission check and probe claim in one critical section.
    pub async fn admit(&self) -> Admission {
        let now = Instant::now();
        let mut inner = self.inner.lock().await;
        match inner.state {
            CircuitState::Closed => {
                inner.prune(self.config.failure_window(), now);
                Admission::Allowed { probe: false }
            }
            CircuitState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|at| now.duration_since(at))
                    .unwrap_or_default();
                if elapsed >= self.config.half_open_timeout() {
                    info!(agent = %self.agent_id, "circuit breaker Open -> HalfOpen (probe)");
                    inner.state = CircuitState::HalfOpen;
                    inner.probe_in_flight = true;
                    Admission::Allowed { probe: true }
                } else {
                    Admission::Rejected {
                        state: CircuitState::Open,
                    }
                }
            }
            CircuitState::HalfOpen => {
                if inner.probe_in_flight {
                    // A probe is already out; everyone else is treated as Open.
                    Admission::Rejected {
                        state: CircuitState::HalfOpen,
                    }
                } else {
                    inner.probe_in_flight = true;
                    Admission::Allowed { probe: true }
                }
            }
        }
    }

    pub async fn on_success(&self, probe: bool) {
        let mut inner = self.inner.lock().await;
        if probe && inner.state == CircuitState::HalfOpen {
            info!(agent = %self.agent_id, "circuit breaker HalfOpen -> Closed (recovered)");
            inner.state = CircuitState::Closed;
            inner.failures.clear();
            inner.opened_at = None;
            inner.probe_in_flight = false;
        }
    }

    /// Record a failure. Returns `true` when this failure transitioned the
    /// circuit to Open, so the caller can raise a threshold alert exactly
    /// once per opening.
    pub async fn on_failure(&self, probe: bool) -> bool {
        let now = Instant::now();
        let mut inner = self.inner.lock().await;
        match inner.state {
            CircuitState::Closed => {
                inner.failures.push_back(now);
                inner.prune(self.config.failure_window(), now);
                if inner.failures.len() >= self.config.failure_threshold as usize {
                    warn!(
                        agent = %self.agent_id,
                        failures = inner.failures.len(),
                        "circuit breaker Closed -> Open (threshold reached)"
                    );
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(now);
                    return true;
                }
                false
            }
            CircuitState::HalfOpen => {
                if probe {
                    warn!(agent = %self.agent_id, "circuit breaker HalfOpen -> Open (probe failed)");
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(now);
                    inner.probe_in_flight = false;
                }
                false
            }
            CircuitState::Open => false,
        }
    }

    /// Release a claimed probe slot without a verdict; taken on the
    /// cancellation path so HalfOpen cannot deadlock on an abandoned probe.
    pub async fn release_probe(&self) {
        let mut inner = self.inner.lock().await;
        if inner.state == CircuitState::HalfOpen {
            inner.probe_in_flight = false;
        }
    }

    /// Operator override: force Closed and clear history.
    pub async fn reset(&self) {
        let mut inner = self.inner.lock().await;
        if inner.state != CircuitState::Closed {
            info!(agent = %self.agent_id, "circuit breaker force-closed by operator");
        }
        *inner = BreakerInner::new();
    }

    pub async fn state(&self) -> CircuitState {
        self.inner.lock().await.state
    }

    pub async fn snapshot(&self) -> BreakerSnapshot {
        let now = Instant::now();
        let mut inner = self.inner.lock().await;
        inner.prune(self.config.failure_window(), now);
        BreakerSnapshot {
            agent_id: self.agent_id.clone(),
            state: inner.state,
            recent_failures: inner.failures.len(),
            open_for_secs: inner
                .opened_at
                .filter(|_| inner.state == CircuitState::Open)
                .map(|at| now.duration_since(at).as_secs()),
        }
    }
}

/// Process-wide map of per-agent breakers, created lazily on first use.
#[derive(Clone)]
pub struct BreakerRegistry {
    config: BreakerConfig,
    breakers: Arc<RwLock<HashMap<String, Arc<AgentBreaker>>>>,
}

impl BreakerRegistry {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            breakers: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn breaker(&self, agent_id: &str) -> Arc<AgentBreaker> {
        if let Some(breaker) = self.breakers.read().await.get(agent_id) {
            return breaker.clone();
        }
        let mut breakers = self.breakers.write().await;
        breakers
            .entry(agent_id.to_string())
            .or_insert_with(|| Arc::new(AgentBreaker::new(agent_id, self.config.clone())))
            .clone()
    }

    pub async fn state(&self, agent_id: &str) -> Option<CircuitState> {
        let breaker = self.breakers.read().await.get(agent_id).cloned()?;
        Some(breaker.state().await)
    }

    /// Routing availability weight: Closed counts fully, HalfOpen half,
    /// Open not at all.
    pub async fn availability_score(&self, agent_id: &str) -> f64 {
        match self.state(agent_id).await {
            None | Some(CircuitState::Closed) => 1.0,
            Some(CircuitState::HalfOpen) => 0.5,
            Some(CircuitState::Open) => 0.0,
        }
    }

    pub async fn all_snapshots(&self) -> Vec<BreakerSnapshot> {
        let breakers = self
            .breakers
            .read()
            .await
            .values()
            .cloned()
            .collect::<Vec<_>>();
        let mut snapshots = Vec::with_capacity(breakers.len());
        for breaker in breakers {
            snapshots.push(breaker.snapshot().await);
        }
        snapshots.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        snapshots
    }

    /// Operator reset. Returns `false` when the agent has no breaker yet.
    pub async fn reset(&self, agent_id: &str) -> bool {
        let Some(breaker) = self.breakers.read().await.get(agent_id).cloned() else {
            return false;
        };
        breaker.reset().await;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_config() -> BreakerConfig {
        BreakerConfig {
            failure_threshold: 3,
            failure_window_sec: 60,
            half_open_timeout_sec: 0,
        }
    }

    #[tokio::test]
    async fn starts_closed_and_admits() {
        let breaker = AgentBreaker::new("dev-1", fast_config());
        assert_eq!(breaker.state().await, CircuitState::Closed);
        assert_eq!(breaker.admit().await, Admission::Allowed { probe: false });
    }

    #[tokio::test]
    async fn opens_after_threshold_within_window() {
        let breaker = AgentBreaker::new("dev-1", BreakerConfig {
            half_open_timeout_sec: 3600,
            ..fast_config()
        });
        assert!(!breaker.on_failure(false).await);
        assert!(!breaker.on_failure(false).await);
        assert_eq!(breaker.state().await, CircuitState::Closed);
        // The opening failure is reported exactly once.
        assert!(breaker.on_failure(false).await);
        assert_eq!(breaker.state().await, CircuitState::Open);
        assert_eq!(
            breaker.admit().await,
            Admission::Rejected {
                state: CircuitState::Open
            }
        );
    }

    #[tokio::test]
    async fn half_open_allows_exactly_one_probe() {
        let breaker = Arc::new(AgentBreaker::new("dev-1", fast_config()));
        for _ in 0..3 {
            breaker.on_failure(false).await;
        }
        // half_open_timeout is zero, so the next admission set probes.
        let mut allowed = 0;
        let mut handles = Vec::new();
        for _ in 0..8 {
            let breaker = breaker.clone();
            handles.push(tokio::spawn(async move { breaker.admit().await }));
        }
        for handle in handles {
            if let Admission::Allowed { probe } = handle.await.unwrap() {
                assert!(probe);
                allowed += 1;
            }
        }
        assert_eq!(allowed, 1);
    }

    #[tokio::test]
    async fn probe_success_closes_and_resets_window() {
        let breaker = AgentBreaker::new("dev-1", fast_config());
        for _ in 0..3 {
            breaker.on_failure(false).await;
        }
        let Admission::Allowed { probe } = breaker.admit().await else {
            panic!("expected probe admission");
        };
        breaker.on_success(probe).await;
        assert_eq!(breaker.state().await, CircuitState::Closed);
        assert_eq!(breaker.snapshot().await.recent_failures, 0);
    }

    #[tokio::test]
    async fn probe_failure_reopens() {
        let breaker = AgentBreaker::new("dev-1", fast_config());
        for _ in 0..3 {
            breaker.on_failure(false).await;
        }
        let Admission::Allowed { probe } = breaker.admit().await else {
            panic!("expected probe admission");
        };
        breaker.on_failure(probe).await;
        assert_eq!(breaker.state().await, CircuitState::Open);
    }

    #[tokio::test]
    async fn released_probe_can_be_reclaimed() {
        let breaker = AgentBreaker::new("dev-1", fast_config());
        for _ in 0..3 {
            breaker.on_failure(false).await;
        }
        assert!(matches!(
            breaker.admit().await,
            Admission::Allowed { probe: true }
        ));
        // Second caller sees the slot taken.
        assert!(matches!(breaker.admit().await, Admission::Rejected { .. }));
        breaker.release_probe().await;
        assert!(matches!(
            breaker.admit().await,
            Admission::Allowed { probe: true }
        ));
    }

    #[tokio::test]
    async fn registry_reset_forces_closed() {
        let registry = BreakerRegistry::new(fast_config());
        let breaker = registry.breaker("dev-1").await;
        for _ in 0..3 {
            breaker.on_failure(false).await;
        }
        assert_eq!(registry.state("dev-1").await, Some(CircuitState::Open));
        assert!(registry.reset("dev-1").await);
        assert_eq!(registry.state("dev-1").await, Some(CircuitState::Closed));
        assert!(!registry.reset("never-seen").await);
    }
}
