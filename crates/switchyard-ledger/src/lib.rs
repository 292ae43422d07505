//! Durable append-only record of billable invocations.
//!
//! The log is newline-delimited JSON. Appends are serialized behind a writer
//! lock; readers scan a snapshot of the file and never block writers for
//! longer than one append. Aggregates are recomputed from the log on read; a
//! small bounded cache holds recently computed windows and is invalidated
//! wholesale on every append, so a reader can never observe a stale sum.

use std::collections::{HashMap, VecDeque};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::sync::Mutex;

use chrono::{DateTime, Datelike, Duration, Utc};
use serde::Serialize;
use thiserror::Error;

use switchyard_types::CostEvent;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("cost log io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("cost log serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Filter for ledger scans. All fields are conjunctive.
#[derive(Debug, Clone, Default)]
pub struct CostQuery {
    pub since: Option<DateTime<Utc>>,
    pub project_id: Option<String>,
    pub agent_id: Option<String>,
    /// Matches events whose `request_id` starts with this prefix; used to
    /// attribute spend to a workflow execution.
    pub request_prefix: Option<String>,
}

/// Aggregated view for the costs API.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CostSummary {
    pub total_usd: f64,
    pub event_count: usize,
    pub by_project: HashMap<String, f64>,
    pub by_agent: HashMap<String, f64>,
    pub by_model: HashMap<String, f64>,
}

const WINDOW_CACHE_CAP: usize = 64;

struct WindowCache {
    entries: HashMap<String, f64>,
    order: VecDeque<String>,
}

impl WindowCache {
    fn new() -> Self {
        Self {
            entries: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    fn get(&self, key: &str) -> Option<f64> {
        self.entries.get(key).copied()
    }

    fn put(&mut self, key: String, value: f64) {
        if self.entries.insert(key.clone(), value).is_none() {
            self.order.push_back(key);
            while self.order.len() > WINDOW_CACHE_CAP {
                if let Some(evicted) = self.order.pop_front() {
                    self.entries.remove(&evicted);
                }
            }
        }
    }

    fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }
}

pub struct CostLedger {
    path: PathBuf,
    /// fsync after every append when set; durability over throughput.
    sync_on_append: bool,
    writer: Mutex<()>,
    cache: Mutex<WindowCache>,
}

impl CostLedger {
    pub fn new(path: impl Into<PathBuf>, sync_on_append: bool) -> Result<Self, LedgerError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        Ok(Self {
            path,
            sync_on_append,
            writer: Mutex::new(()),
            cache: Mutex::new(WindowCache::new()),
        })
    }

    /// Append one event. Returns only after the line is written (and synced
    /// when configured), so any event whose append returned is visible to
    /// every subsequent reader.
    pub fn append(&self, event: &CostEvent) -> Result<(), LedgerError> {
        let line = serde_json::to_string(event)?;
        let guard = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{}", line)?;
        if self.sync_on_append {
            file.sync_all()?;
        }
        drop(guard);
        self.cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        Ok(())
    }

    /// Scan the log with the given filter. Lines that fail to parse are
    /// skipped rather than failing the whole read.
    pub fn query(&self, query: &CostQuery) -> Result<Vec<CostEvent>, LedgerError> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let file = File::open(&self.path)?;
        let reader = BufReader::new(file);
        let mut events = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let Ok(event) = serde_json::from_str::<CostEvent>(&line) else {
                continue;
            };
            if let Some(since) = query.since {
                if event.timestamp < since {
                    continue;
                }
            }
            if let Some(project) = &query.project_id {
                if &event.project_id != project {
                    continue;
                }
            }
            if let Some(agent) = &query.agent_id {
                if &event.agent_id != agent {
                    continue;
                }
            }
            if let Some(prefix) = &query.request_prefix {
                if !event.request_id.starts_with(prefix.as_str()) {
                    continue;
                }
            }
            events.push(event);
        }
        Ok(events)
    }

    /// Events within the trailing window of `seconds`.
    pub fn window(&self, seconds: i64, query: &CostQuery) -> Result<Vec<CostEvent>, LedgerError> {
        let mut query = query.clone();
        query.since = Some(Utc::now() - Duration::seconds(seconds));
        self.query(&query)
    }

    /// Spend for `project_id` on the UTC calendar day of `now`.
    pub fn daily_spend(&self, project_id: &str, now: DateTime<Utc>) -> Result<f64, LedgerError> {
        let key = format!("daily:{}:{}", project_id, now.date_naive());
        if let Some(hit) = self
            .cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&key)
        {
            return Ok(hit);
        }
        let spend = self.fold_spend(project_id, |ts| ts.date_naive() == now.date_naive())?;
        self.cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .put(key, spend);
        Ok(spend)
    }

    /// Spend for `project_id` in the UTC calendar month of `now`.
    pub fn monthly_spend(&self, project_id: &str, now: DateTime<Utc>) -> Result<f64, LedgerError> {
        let key = format!("monthly:{}:{}-{}", project_id, now.year(), now.month());
        if let Some(hit) = self
            .cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&key)
        {
            return Ok(hit);
        }
        let spend = self.fold_spend(project_id, |ts| {
            ts.year() == now.year() && ts.month() == now.month()
        })?;
        self.cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .put(key, spend);
        Ok(spend)
    }

    /// Total dollars attributed to one workflow execution via its
    /// request-id prefix.
    pub fn execution_cost(&self, request_prefix: &str) -> Result<f64, LedgerError> {
        let events = self.query(&CostQuery {
            request_prefix: Some(request_prefix.to_string()),
            ..CostQuery::default()
        })?;
        Ok(events.iter().map(|e| e.cost_usd).sum())
    }

    pub fn summary(&self) -> Result<CostSummary, LedgerError> {
        let events = self.query(&CostQuery::default())?;
        let mut summary = CostSummary {
            event_count: events.len(),
            ..CostSummary::default()
        };
        for event in events {
            summary.total_usd += event.cost_usd;
            *summary.by_project.entry(event.project_id).or_insert(0.0) += event.cost_usd;
            *summary.by_agent.entry(event.agent_id).or_insert(0.0) += event.cost_usd;
            *summary.by_model.entry(event.model).or_insert(0.0) += event.cost_usd;
        }
        Ok(summary)
    }

    fn fold_spend(
        &self,
        project_id: &str,
        in_window: impl Fn(DateTime<Utc>) -> bool,
    ) -> Result<f64, LedgerError> {
        let events = self.query(&CostQuery {
            project_id: Some(project_id.to_string()),
            ..CostQuery::default()
        })?;
        Ok(events
            .iter()
            .filter(|e| in_window(e.timestamp))
            .map(|e| e.cost_usd)
            .sum())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn event(project: &str, agent: &str, cost: f64, request_id: &str) -> CostEvent {
        CostEvent {
            timestamp: Utc::now(),
            project_id: project.to_string(),
            agent_id: agent.to_string(),
            model: "fast-small".to_string(),
            tokens_in: 100,
            tokens_out: 50,
            cost_usd: cost,
            request_id: request_id.to_string(),
        }
    }

    #[test]
    fn append_then_query_round_trip() {
        let temp = tempdir().unwrap();
        let ledger = CostLedger::new(temp.path().join("costs.jsonl"), false).unwrap();

        ledger.append(&event("alpha", "dev-1", 0.10, "r1")).unwrap();
        ledger.append(&event("alpha", "sec-1", 0.25, "r2")).unwrap();
        ledger.append(&event("beta", "dev-1", 0.40, "r3")).unwrap();

        let all = ledger.query(&CostQuery::default()).unwrap();
        assert_eq!(all.len(), 3);

        let alpha = ledger
            .query(&CostQuery {
                project_id: Some("alpha".into()),
                ..CostQuery::default()
            })
            .unwrap();
        assert_eq!(alpha.len(), 2);

        let dev = ledger
            .query(&CostQuery {
                agent_id: Some("dev-1".into()),
                ..CostQuery::default()
            })
            .unwrap();
        assert_eq!(dev.len(), 2);
    }

    #[test]
    fn daily_spend_matches_event_sum() {
        let temp = tempdir().unwrap();
        let ledger = CostLedger::new(temp.path().join("costs.jsonl"), false).unwrap();

        ledger.append(&event("alpha", "dev-1", 0.10, "r1")).unwrap();
        ledger.append(&event("alpha", "dev-1", 0.15, "r2")).unwrap();

        let spend = ledger.daily_spend("alpha", Utc::now()).unwrap();
        assert!((spend - 0.25).abs() < 1e-9);

        // Cache must not survive an append.
        ledger.append(&event("alpha", "dev-1", 0.75, "r3")).unwrap();
        let spend = ledger.daily_spend("alpha", Utc::now()).unwrap();
        assert!((spend - 1.0).abs() < 1e-9);
    }

    #[test]
    fn monthly_spend_excludes_other_months() {
        let temp = tempdir().unwrap();
        let ledger = CostLedger::new(temp.path().join("costs.jsonl"), false).unwrap();

        let mut old = event("alpha", "dev-1", 5.0, "r-old");
        old.timestamp = Utc::now() - Duration::days(62);
        ledger.append(&old).unwrap();
        ledger.append(&event("alpha", "dev-1", 0.5, "r-new")).unwrap();

        let spend = ledger.monthly_spend("alpha", Utc::now()).unwrap();
        assert!((spend - 0.5).abs() < 1e-9);
    }

    #[test]
    fn execution_cost_sums_by_request_prefix() {
        let temp = tempdir().unwrap();
        let ledger = CostLedger::new(temp.path().join("costs.jsonl"), false).unwrap();

        ledger
            .append(&event("alpha", "dev-1", 0.10, "exec-9:t1:0"))
            .unwrap();
        ledger
            .append(&event("alpha", "dev-1", 0.20, "exec-9:t2:0"))
            .unwrap();
        ledger
            .append(&event("alpha", "dev-1", 0.99, "exec-other:t1:0"))
            .unwrap();

        let cost = ledger.execution_cost("exec-9:").unwrap();
        assert!((cost - 0.30).abs() < 1e-9);
    }

    #[test]
    fn summary_groups_by_dimension() {
        let temp = tempdir().unwrap();
        let ledger = CostLedger::new(temp.path().join("costs.jsonl"), false).unwrap();

        ledger.append(&event("alpha", "dev-1", 0.10, "r1")).unwrap();
        ledger.append(&event("beta", "sec-1", 0.30, "r2")).unwrap();

        let summary = ledger.summary().unwrap();
        assert_eq!(summary.event_count, 2);
        assert!((summary.total_usd - 0.40).abs() < 1e-9);
        assert!((summary.by_project["alpha"] - 0.10).abs() < 1e-9);
        assert!((summary.by_agent["sec-1"] - 0.30).abs() < 1e-9);
    }
}
