// Persistence for workflow definitions and executions.
//
// Executions live one JSON file per execution, replaced atomically
// (temp-file-then-rename) on every state change. Each execution also owns a
// plain-text log file that the API can tail.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use chrono::Utc;
use thiserror::Error;
use tracing::warn;

use crate::types::{ExecutionStatus, WorkflowDefinition, WorkflowExecution};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("workflow store io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("workflow store serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("workflow definition parse error in {path}: {message}")]
    DefinitionParse { path: String, message: String },
    #[error("execution not found: {0}")]
    NotFound(String),
}

pub struct ExecutionStore {
    base_dir: PathBuf,
}

impl ExecutionStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let base_dir = base_dir.into();
        fs::create_dir_all(&base_dir)?;
        Ok(Self { base_dir })
    }

    fn execution_path(&self, execution_id: &str) -> PathBuf {
        self.base_dir.join(format!("{}.json", execution_id))
    }

    fn log_path(&self, execution_id: &str) -> PathBuf {
        self.base_dir.join(format!("{}.log", execution_id))
    }

    /// Atomic replace of the execution record.
    pub fn save(&self, execution: &WorkflowExecution) -> Result<(), StoreError> {
        let path = self.execution_path(&execution.execution_id);
        let content = serde_json::to_string_pretty(execution)?;
        atomic_write(&path, &content)
    }

    pub fn load(&self, execution_id: &str) -> Result<WorkflowExecution, StoreError> {
        let path = self.execution_path(execution_id);
        if !path.exists() {
            return Err(StoreError::NotFound(execution_id.to_string()));
        }
        let content = fs::read_to_string(&path)?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn list(&self) -> Result<Vec<WorkflowExecution>, StoreError> {
        let mut executions = Vec::new();
        for entry in fs::read_dir(&self.base_dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let content = fs::read_to_string(&path)?;
            match serde_json::from_str::<WorkflowExecution>(&content) {
                Ok(execution) => executions.push(execution),
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "skipping unreadable execution record");
                }
            }
        }
        executions.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        Ok(executions)
    }

    /// Startup recovery: every execution persisted as `running` belonged to
    /// a dead process. Reclassify each as `failed` with reason
    /// `interrupted` and return them for the recovery query. Recovery is
    /// report-only; nothing is restarted here.
    pub fn recover_interrupted(&self) -> Result<Vec<WorkflowExecution>, StoreError> {
        let mut recovered = Vec::new();
        for mut execution in self.list()? {
            if execution.status != ExecutionStatus::Running {
                continue;
            }
            execution.status = ExecutionStatus::Failed;
            execution.failure_reason = Some("interrupted".to_string());
            execution.ended_at = Some(Utc::now());
            self.save(&execution)?;
            self.append_log(&execution.execution_id, "recovery: marked interrupted")?;
            recovered.push(execution);
        }
        Ok(recovered)
    }

    pub fn append_log(&self, execution_id: &str, line: &str) -> Result<(), StoreError> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.log_path(execution_id))?;
        writeln!(file, "{} {}", Utc::now().to_rfc3339(), line)?;
        Ok(())
    }

    /// Last `max_lines` log lines, newline-joined.
    pub fn read_log_tail(&self, execution_id: &str, max_lines: usize) -> Result<String, StoreError> {
        let path = self.log_path(execution_id);
        if !path.exists() {
            return Ok(String::new());
        }
        let file = File::open(&path)?;
        let reader = BufReader::new(file);
        let mut lines = Vec::new();
        for line in reader.lines() {
            lines.push(line?);
        }
        if lines.len() > max_lines {
            lines = lines.split_off(lines.len() - max_lines);
        }
        Ok(lines.join("\n"))
    }
}

/// Load workflow definitions from a directory of `.yaml`/`.yml`/`.json`
/// files. Missing directory means no definitions, not an error.
pub fn load_definitions(dir: &Path) -> Result<Vec<WorkflowDefinition>, StoreError> {
    let mut definitions = Vec::new();
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(definitions),
        Err(err) => return Err(err.into()),
    };
    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
            continue;
        };
        let content = fs::read_to_string(&path)?;
        let parsed = match ext {
            "yaml" | "yml" => serde_yaml::from_str::<WorkflowDefinition>(&content)
                .map_err(|e| StoreError::DefinitionParse {
                    path: path.display().to_string(),
                    message: e.to_string(),
                })?,
            "json" => serde_json::from_str::<WorkflowDefinition>(&content)
                .map_err(|e| StoreError::DefinitionParse {
                    path: path.display().to_string(),
                    message: e.to_string(),
                })?,
            _ => continue,
        };
        definitions.push(parsed);
    }
    definitions.sort_by(|a, b| a.id.cmp(&b.id));
    Ok(definitions)
}

/// Atomic write using temp file and rename.
fn atomic_write(path: &Path, content: &str) -> Result<(), StoreError> {
    let temp_path = path.with_extension("tmp");
    fs::write(&temp_path, content)?;
    fs::rename(&temp_path, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{TaskKind, TaskSpec};
    use serde_json::json;
    use tempfile::tempdir;

    fn definition() -> WorkflowDefinition {
        WorkflowDefinition {
            id: "wf-1".into(),
            name: "test".into(),
            tasks: vec![TaskSpec {
                id: "t1".into(),
                name: None,
                kind: TaskKind::Webhook {
                    url: "http://127.0.0.1:9/hook".into(),
                    body: None,
                },
                retry_count: 0,
                timeout_seconds: 5,
                skip_on_error: false,
            }],
        }
    }

    #[test]
    fn save_load_round_trip() {
        let temp = tempdir().unwrap();
        let store = ExecutionStore::new(temp.path()).unwrap();
        let execution = WorkflowExecution::new("e-1".into(), &definition(), json!({"k": "v"}));

        store.save(&execution).unwrap();
        let loaded = store.load("e-1").unwrap();
        assert_eq!(loaded.execution_id, "e-1");
        assert_eq!(loaded.status, ExecutionStatus::Running);
        assert_eq!(loaded.context, json!({"k": "v"}));
    }

    #[test]
    fn load_missing_is_not_found() {
        let temp = tempdir().unwrap();
        let store = ExecutionStore::new(temp.path()).unwrap();
        assert!(matches!(
            store.load("nope"),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn recovery_marks_running_as_interrupted() {
        let temp = tempdir().unwrap();
        let store = ExecutionStore::new(temp.path()).unwrap();

        let running = WorkflowExecution::new("e-running".into(), &definition(), json!({}));
        store.save(&running).unwrap();

        let mut done = WorkflowExecution::new("e-done".into(), &definition(), json!({}));
        done.status = ExecutionStatus::Completed;
        store.save(&done).unwrap();

        let recovered = store.recover_interrupted().unwrap();
        assert_eq!(recovered.len(), 1);
        assert_eq!(recovered[0].execution_id, "e-running");
        assert_eq!(recovered[0].status, ExecutionStatus::Failed);
        assert_eq!(recovered[0].failure_reason.as_deref(), Some("interrupted"));

        // The change is durable, and completed executions are untouched.
        assert_eq!(store.load("e-running").unwrap().status, ExecutionStatus::Failed);
        assert_eq!(store.load("e-done").unwrap().status, ExecutionStatus::Completed);
    }

    #[test]
    fn log_tail_returns_last_lines() {
        let temp = tempdir().unwrap();
        let store = ExecutionStore::new(temp.path()).unwrap();
        for i in 0..10 {
            store.append_log("e-1", &format!("line {}", i)).unwrap();
        }
        let tail = store.read_log_tail("e-1", 3).unwrap();
        let lines: Vec<&str> = tail.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[2].ends_with("line 9"));
    }

    #[test]
    fn definitions_load_from_yaml_and_json() {
        let temp = tempdir().unwrap();
        fs::write(
            temp.path().join("a.yaml"),
            "id: wf-a\nname: A\ntasks:\n  - id: t1\n    type: webhook\n    url: http://127.0.0.1:9/a\n",
        )
        .unwrap();
        fs::write(
            temp.path().join("b.json"),
            serde_json::to_string(&definition()).unwrap(),
        )
        .unwrap();
        fs::write(temp.path().join("notes.txt"), "ignored").unwrap();

        let definitions = load_definitions(temp.path()).unwrap();
        assert_eq!(definitions.len(), 2);
        assert_eq!(definitions[0].id, "wf-1");
        assert_eq!(definitions[1].id, "wf-a");
    }
}
