//! In-flight invocation supervision.
//!
//! Every invocation registers an activity entry; the monitor is a single
//! periodic actor that scans the table, warns once per stale episode, and
//! force-cancels activities that exceed the hard timeout. Scans take the
//! table lock only briefly and emit alerts after releasing it, so one stuck
//! agent cannot delay supervision of the others.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use switchyard_observability::AlertLog;
use switchyard_types::{Alert, AlertLevel};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    #[serde(default = "default_check_interval_sec")]
    pub check_interval_sec: u64,
    /// Warn once per episode after this much silence.
    #[serde(default = "default_stale_after_sec")]
    pub stale_after_sec: u64,
    /// Cancel and unregister after this much total runtime.
    #[serde(default = "default_timeout_after_sec")]
    pub timeout_after_sec: u64,
}

fn default_check_interval_sec() -> u64 {
    30
}
fn default_stale_after_sec() -> u64 {
    300
}
fn default_timeout_after_sec() -> u64 {
    1_800
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            check_interval_sec: default_check_interval_sec(),
            stale_after_sec: default_stale_after_sec(),
            timeout_after_sec: default_timeout_after_sec(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivityState {
    Running,
    Idle,
}

#[derive(Debug)]
struct ActivityEntry {
    agent_id: String,
    task_id: String,
    started_at: Instant,
    last_activity_at: Instant,
    state: ActivityState,
    stale_notified: bool,
    cancel: CancellationToken,
}

#[derive(Debug, Clone, Serialize)]
pub struct ActivitySnapshot {
    pub activity_id: u64,
    pub agent_id: String,
    pub task_id: String,
    pub state: ActivityState,
    pub running_for_secs: u64,
    pub idle_for_secs: u64,
}

/// Process-wide table of in-flight invocations. O(1) register/unregister
/// under a single lock.
#[derive(Clone, Default)]
pub struct ActivityTable {
    inner: Arc<RwLock<HashMap<u64, ActivityEntry>>>,
    next_id: Arc<AtomicU64>,
}

impl ActivityTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(
        &self,
        agent_id: impl Into<String>,
        task_id: impl Into<String>,
    ) -> ActivityHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        let now = Instant::now();
        let entry = ActivityEntry {
            agent_id: agent_id.into(),
            task_id: task_id.into(),
            started_at: now,
            last_activity_at: now,
            state: ActivityState::Running,
            stale_notified: false,
            cancel: cancel.clone(),
        };
        self.inner.write().await.insert(id, entry);
        ActivityHandle {
            id,
            table: self.clone(),
            cancel,
        }
    }

    async fn touch(&self, id: u64) {
        let mut inner = self.inner.write().await;
        if let Some(entry) = inner.get_mut(&id) {
            entry.last_activity_at = Instant::now();
            entry.state = ActivityState::Running;
            entry.stale_notified = false;
        }
    }

    async fn set_idle(&self, id: u64) {
        let mut inner = self.inner.write().await;
        if let Some(entry) = inner.get_mut(&id) {
            entry.state = ActivityState::Idle;
        }
    }

    /// Remove an entry. Safe to call any number of times.
    pub async fn unregister(&self, id: u64) -> bool {
        self.inner.write().await.remove(&id).is_some()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }

    pub async fn snapshot(&self) -> Vec<ActivitySnapshot> {
        let now = Instant::now();
        let inner = self.inner.read().await;
        let mut out = inner
            .iter()
            .map(|(id, entry)| ActivitySnapshot {
                activity_id: *id,
                agent_id: entry.agent_id.clone(),
                task_id: entry.task_id.clone(),
                state: entry.state,
                running_for_secs: now.duration_since(entry.started_at).as_secs(),
                idle_for_secs: now.duration_since(entry.last_activity_at).as_secs(),
            })
            .collect::<Vec<_>>();
        out.sort_by_key(|s| s.activity_id);
        out
    }
}

/// Registration handle held by the invoker for the duration of one call.
pub struct ActivityHandle {
    id: u64,
    table: ActivityTable,
    cancel: CancellationToken,
}

impl ActivityHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Token cancelled by the monitor when this activity times out.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Refresh the heartbeat; also clears a standing stale notification so
    /// the next stale episode warns again.
    pub async fn touch(&self) {
        self.table.touch(self.id).await;
    }

    /// Mark the activity idle (e.g. while waiting out a retry backoff).
    pub async fn idle(&self) {
        self.table.set_idle(self.id).await;
    }

    pub async fn unregister(&self) -> bool {
        self.table.unregister(self.id).await
    }
}

struct ScanVerdicts {
    stale: Vec<(u64, String, String, u64)>,
    timed_out: Vec<(u64, String, String, u64, CancellationToken)>,
}

/// The periodic actor. Owns no activity state; it only observes the shared
/// table and emits alerts.
pub struct HeartbeatMonitor {
    table: ActivityTable,
    config: HeartbeatConfig,
    alerts: Arc<AlertLog>,
}

impl HeartbeatMonitor {
    pub fn new(table: ActivityTable, config: HeartbeatConfig, alerts: Arc<AlertLog>) -> Self {
        Self {
            table,
            config,
            alerts,
        }
    }

    /// Start the scan loop. The returned handle is aborted on shutdown.
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        let interval = Duration::from_secs(self.config.check_interval_sec.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                self.scan().await;
            }
        })
    }

    /// One supervision pass over the activity table.
    pub async fn scan(&self) {
        let verdicts = self.collect_verdicts().await;

        for (id, agent_id, task_id, idle_secs) in &verdicts.stale {
            debug!(activity = id, agent = %agent_id, "stale activity");
            let alert = Alert::new(
                AlertLevel::Warning,
                "heartbeat",
                format!("agent {} has been silent for {}s", agent_id, idle_secs),
            )
            .with_details(json!({
                "agent_id": agent_id,
                "task_id": task_id,
                "idle_secs": idle_secs,
            }));
            if let Err(err) = self.alerts.emit(&alert) {
                error!(error = %err, "failed to persist stale alert");
            }
        }

        for (id, agent_id, task_id, running_secs, cancel) in verdicts.timed_out {
            let alert = Alert::new(
                AlertLevel::Critical,
                "heartbeat",
                format!(
                    "agent {} exceeded the {}s activity timeout; cancelling",
                    agent_id, self.config.timeout_after_sec
                ),
            )
            .with_details(json!({
                "agent_id": agent_id,
                "task_id": task_id,
                "running_secs": running_secs,
                "activity_id": id,
            }));
            if let Err(err) = self.alerts.emit(&alert) {
                error!(error = %err, "failed to persist timeout alert");
            }
            cancel.cancel();
        }
    }

    async fn collect_verdicts(&self) -> ScanVerdicts {
        let now = Instant::now();
        let stale_after = Duration::from_secs(self.config.stale_after_sec);
        let timeout_after = Duration::from_secs(self.config.timeout_after_sec);

        let mut verdicts = ScanVerdicts {
            stale: Vec::new(),
            timed_out: Vec::new(),
        };

        let mut inner = self.table.inner.write().await;
        let mut remove = Vec::new();
        for (id, entry) in inner.iter_mut() {
            let running = now.duration_since(entry.started_at);
            if running >= timeout_after {
                remove.push(*id);
                verdicts.timed_out.push((
                    *id,
                    entry.agent_id.clone(),
                    entry.task_id.clone(),
                    running.as_secs(),
                    entry.cancel.clone(),
                ));
                continue;
            }
            let idle = now.duration_since(entry.last_activity_at);
            if idle >= stale_after && !entry.stale_notified {
                entry.stale_notified = true;
                verdicts.stale.push((
                    *id,
                    entry.agent_id.clone(),
                    entry.task_id.clone(),
                    idle.as_secs(),
                ));
            }
        }
        for id in remove {
            inner.remove(&id);
        }
        verdicts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn alert_log(dir: &std::path::Path) -> Arc<AlertLog> {
        Arc::new(AlertLog::new(dir.join("alerts.jsonl")).unwrap())
    }

    #[tokio::test]
    async fn stale_warns_once_per_episode() {
        let temp = tempdir().unwrap();
        let alerts = alert_log(temp.path());
        let table = ActivityTable::new();
        let monitor = HeartbeatMonitor::new(
            table.clone(),
            HeartbeatConfig {
                check_interval_sec: 30,
                stale_after_sec: 0,
                timeout_after_sec: 3_600,
            },
            alerts.clone(),
        );

        let handle = table.register("dev-1", "task-1").await;

        monitor.scan().await;
        monitor.scan().await;
        assert_eq!(alerts.recent(10).unwrap().len(), 1);

        // Activity resumes, then goes stale again: a second episode warns.
        handle.touch().await;
        monitor.scan().await;
        assert_eq!(alerts.recent(10).unwrap().len(), 2);

        handle.unregister().await;
    }

    #[tokio::test]
    async fn timeout_cancels_and_unregisters() {
        let temp = tempdir().unwrap();
        let alerts = alert_log(temp.path());
        let table = ActivityTable::new();
        let monitor = HeartbeatMonitor::new(
            table.clone(),
            HeartbeatConfig {
                check_interval_sec: 30,
                stale_after_sec: 0,
                timeout_after_sec: 0,
            },
            alerts.clone(),
        );

        let handle = table.register("dev-1", "task-1").await;
        let cancel = handle.cancellation();

        monitor.scan().await;

        assert!(cancel.is_cancelled());
        assert!(table.is_empty().await);
        let recent = alerts.recent(10).unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].level, AlertLevel::Critical);

        // Forced unregister already removed the entry; the invoker's own
        // unregister is a no-op.
        assert!(!handle.unregister().await);
    }

    #[tokio::test]
    async fn unregister_is_idempotent() {
        let table = ActivityTable::new();
        let handle = table.register("dev-1", "task-1").await;
        assert!(handle.unregister().await);
        assert!(!handle.unregister().await);
        assert!(table.is_empty().await);
    }

    #[tokio::test]
    async fn snapshot_reports_states() {
        let table = ActivityTable::new();
        let a = table.register("dev-1", "task-1").await;
        let b = table.register("sec-1", "task-2").await;
        b.idle().await;

        let snapshot = table.snapshot().await;
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].state, ActivityState::Running);
        assert_eq!(snapshot[1].state, ActivityState::Idle);

        a.unregister().await;
        b.unregister().await;
    }
}
