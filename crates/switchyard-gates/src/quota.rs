//! Concurrency and queue-depth admission control, independent of cost.
//!
//! Slots are RAII permits: dropping a permit releases the slot, so a request
//! that fails anywhere downstream cannot leak capacity. Queue depth and the
//! per-project cap are checked at admission; the per-agent cap is enforced
//! by the invoker once routing has picked a target.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use switchyard_types::DispatchError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaLimits {
    /// Upper bound on admitted-and-unfinished requests process-wide.
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: u64,
    #[serde(default = "default_per_project_concurrent")]
    pub per_project_concurrent: u64,
    #[serde(default = "default_per_agent_concurrent")]
    pub per_agent_concurrent: u64,
}

fn default_max_queue_size() -> u64 {
    256
}
fn default_per_project_concurrent() -> u64 {
    16
}
fn default_per_agent_concurrent() -> u64 {
    8
}

impl Default for QuotaLimits {
    fn default() -> Self {
        Self {
            max_queue_size: default_max_queue_size(),
            per_project_concurrent: default_per_project_concurrent(),
            per_agent_concurrent: default_per_agent_concurrent(),
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    total_active: u64,
    per_project: HashMap<String, u64>,
    per_agent: HashMap<String, u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct QuotaStatus {
    pub active_total: u64,
    pub active_for_project: u64,
    pub max_queue_size: u64,
    pub per_project_concurrent: u64,
    pub per_agent_concurrent: u64,
}

#[derive(Debug, Clone)]
pub struct QuotaGate {
    limits: QuotaLimits,
    counters: Arc<Mutex<Counters>>,
}

impl QuotaGate {
    pub fn new(limits: QuotaLimits) -> Self {
        Self {
            limits,
            counters: Arc::new(Mutex::new(Counters::default())),
        }
    }

    /// Admission check for one request: queue depth, then per-project cap.
    /// Rejections are immediate; retrying is the caller's business.
    pub fn admit(&self, project_id: &str) -> switchyard_types::Result<RequestPermit> {
        let mut counters = self.counters.lock().unwrap_or_else(|e| e.into_inner());
        if counters.total_active >= self.limits.max_queue_size {
            return Err(DispatchError::QuotaReject {
                reason: "pending queue is full".to_string(),
                limit: self.limits.max_queue_size,
                current: counters.total_active,
            });
        }
        let project_active = counters
            .per_project
            .get(project_id)
            .copied()
            .unwrap_or_default();
        if project_active >= self.limits.per_project_concurrent {
            return Err(DispatchError::QuotaReject {
                reason: format!("project {} concurrency limit reached", project_id),
                limit: self.limits.per_project_concurrent,
                current: project_active,
            });
        }
        counters.total_active += 1;
        *counters
            .per_project
            .entry(project_id.to_string())
            .or_default() += 1;
        Ok(RequestPermit {
            gate: self.clone(),
            project_id: project_id.to_string(),
        })
    }

    /// Per-agent slot, claimed by the invoker once the target is known.
    pub fn agent_permit(&self, agent_id: &str) -> switchyard_types::Result<AgentPermit> {
        let mut counters = self.counters.lock().unwrap_or_else(|e| e.into_inner());
        let agent_active = counters.per_agent.get(agent_id).copied().unwrap_or_default();
        if agent_active >= self.limits.per_agent_concurrent {
            return Err(DispatchError::QuotaReject {
                reason: format!("agent {} concurrency limit reached", agent_id),
                limit: self.limits.per_agent_concurrent,
                current: agent_active,
            });
        }
        *counters.per_agent.entry(agent_id.to_string()).or_default() += 1;
        Ok(AgentPermit {
            gate: self.clone(),
            agent_id: agent_id.to_string(),
        })
    }

    pub fn status(&self, project_id: &str) -> QuotaStatus {
        let counters = self.counters.lock().unwrap_or_else(|e| e.into_inner());
        QuotaStatus {
            active_total: counters.total_active,
            active_for_project: counters
                .per_project
                .get(project_id)
                .copied()
                .unwrap_or_default(),
            max_queue_size: self.limits.max_queue_size,
            per_project_concurrent: self.limits.per_project_concurrent,
            per_agent_concurrent: self.limits.per_agent_concurrent,
        }
    }

    fn release_request(&self, project_id: &str) {
        let mut counters = self.counters.lock().unwrap_or_else(|e| e.into_inner());
        counters.total_active = counters.total_active.saturating_sub(1);
        if let Some(count) = counters.per_project.get_mut(project_id) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                counters.per_project.remove(project_id);
            }
        }
    }

    fn release_agent(&self, agent_id: &str) {
        let mut counters = self.counters.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(count) = counters.per_agent.get_mut(agent_id) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                counters.per_agent.remove(agent_id);
            }
        }
    }
}

/// Held for the lifetime of one admitted request.
#[derive(Debug)]
pub struct RequestPermit {
    gate: QuotaGate,
    project_id: String,
}

impl Drop for RequestPermit {
    fn drop(&mut self) {
        self.gate.release_request(&self.project_id);
    }
}

/// Held for the duration of one agent invocation.
pub struct AgentPermit {
    gate: QuotaGate,
    agent_id: String,
}

impl Drop for AgentPermit {
    fn drop(&mut self) {
        self.gate.release_agent(&self.agent_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits(queue: u64, project: u64, agent: u64) -> QuotaLimits {
        QuotaLimits {
            max_queue_size: queue,
            per_project_concurrent: project,
            per_agent_concurrent: agent,
        }
    }

    #[test]
    fn queue_depth_is_enforced() {
        let gate = QuotaGate::new(limits(2, 10, 10));
        let _a = gate.admit("alpha").unwrap();
        let _b = gate.admit("beta").unwrap();
        let err = gate.admit("gamma").unwrap_err();
        assert!(matches!(err, DispatchError::QuotaReject { .. }));
    }

    #[test]
    fn per_project_cap_is_enforced() {
        let gate = QuotaGate::new(limits(10, 1, 10));
        let _a = gate.admit("alpha").unwrap();
        assert!(gate.admit("alpha").is_err());
        // Other projects are unaffected.
        assert!(gate.admit("beta").is_ok());
    }

    #[test]
    fn dropping_a_permit_frees_the_slot() {
        let gate = QuotaGate::new(limits(1, 1, 1));
        let permit = gate.admit("alpha").unwrap();
        assert!(gate.admit("alpha").is_err());
        drop(permit);
        assert!(gate.admit("alpha").is_ok());
    }

    #[test]
    fn per_agent_cap_is_enforced_and_released() {
        let gate = QuotaGate::new(limits(10, 10, 1));
        let permit = gate.agent_permit("dev-1").unwrap();
        assert!(gate.agent_permit("dev-1").is_err());
        assert!(gate.agent_permit("dev-2").is_ok());
        drop(permit);
        assert!(gate.agent_permit("dev-1").is_ok());
    }

    #[test]
    fn status_reports_active_counts() {
        let gate = QuotaGate::new(limits(10, 10, 10));
        let _a = gate.admit("alpha").unwrap();
        let _b = gate.admit("alpha").unwrap();
        let status = gate.status("alpha");
        assert_eq!(status.active_total, 2);
        assert_eq!(status.active_for_project, 2);
        assert_eq!(gate.status("beta").active_for_project, 0);
    }
}
