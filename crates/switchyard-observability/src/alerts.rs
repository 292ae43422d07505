use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::sync::Mutex;

use thiserror::Error;
use tracing::{error, warn};

use switchyard_types::{Alert, AlertLevel};

#[derive(Debug, Error)]
pub enum AlertLogError {
    #[error("alert log io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("alert log serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Durable append-only alert log: newline-delimited JSON at a configured
/// path, mirrored to `tracing` at the matching level.
///
/// Cheaply cloneable is not needed; holders share it behind `Arc`.
pub struct AlertLog {
    path: PathBuf,
    writer: Mutex<()>,
}

impl AlertLog {
    pub fn new(path: impl Into<PathBuf>) -> Result<Self, AlertLogError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        Ok(Self {
            path,
            writer: Mutex::new(()),
        })
    }

    /// Append one alert. Appends are serialized behind the writer lock so
    /// concurrent emitters never interleave lines.
    pub fn emit(&self, alert: &Alert) -> Result<(), AlertLogError> {
        match alert.level {
            AlertLevel::Warning => warn!(
                component = %alert.component,
                message = %alert.message,
                "alert"
            ),
            AlertLevel::Critical => error!(
                component = %alert.component,
                message = %alert.message,
                "alert"
            ),
        }

        let line = serde_json::to_string(alert)?;
        let guard = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{}", line)?;
        drop(guard);
        Ok(())
    }

    /// Most recent `limit` alerts, newest last.
    pub fn recent(&self, limit: usize) -> Result<Vec<Alert>, AlertLogError> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let file = File::open(&self.path)?;
        let reader = BufReader::new(file);
        let mut alerts = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            if let Ok(alert) = serde_json::from_str::<Alert>(&line) {
                alerts.push(alert);
            }
        }
        if alerts.len() > limit {
            alerts = alerts.split_off(alerts.len() - limit);
        }
        Ok(alerts)
    }
}
