// Workflow data model: immutable definitions and persisted executions.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

fn default_timeout_seconds() -> u64 {
    300
}

/// Type-specific payload of one task.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskKind {
    /// Call a named agent with a templated prompt. `{{context.key}}` and
    /// `{{tasks.<id>.output}}` interpolate from the execution.
    AgentCall { agent_id: String, prompt: String },
    /// Outbound HTTP request; a non-2xx response is a task failure.
    HttpCall {
        method: String,
        url: String,
        #[serde(default)]
        body: Option<Value>,
        #[serde(default)]
        headers: HashMap<String, String>,
    },
    /// Evaluate a restricted boolean expression against the execution
    /// context and jump to the selected task.
    Conditional {
        condition: String,
        next_task: String,
        #[serde(default)]
        else_task: Option<String>,
    },
    /// Nested tasks run concurrently; the step completes when all children
    /// terminate. Children never abort their siblings.
    Parallel { tasks: Vec<TaskSpec> },
    /// Fire-and-forget HTTP POST.
    Webhook {
        url: String,
        #[serde(default)]
        body: Option<Value>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(flatten)]
    pub kind: TaskKind,
    /// Additional attempts after the first failure.
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
    /// Record a terminal failure and keep going instead of failing the
    /// whole execution.
    #[serde(default)]
    pub skip_on_error: bool,
}

/// Immutable once loaded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub id: String,
    pub name: String,
    pub tasks: Vec<TaskSpec>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    /// Never ran: bypassed by a conditional branch.
    Skipped,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskExecution {
    pub task_id: String,
    pub status: TaskStatus,
    pub attempts: u32,
    #[serde(default)]
    pub output: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
}

impl TaskExecution {
    pub fn pending(task_id: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            status: TaskStatus::Pending,
            attempts: 0,
            output: None,
            error: None,
            started_at: None,
            ended_at: None,
        }
    }
}

/// A running (or finished) instance of a definition. Persisted atomically on
/// every task state transition so a crash can be detected on restart.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowExecution {
    pub execution_id: String,
    pub definition_id: String,
    pub status: ExecutionStatus,
    #[serde(default)]
    pub context: Value,
    pub task_executions: HashMap<String, TaskExecution>,
    pub total_cost_usd: f64,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub failure_reason: Option<String>,
}

impl WorkflowExecution {
    pub fn new(execution_id: String, definition: &WorkflowDefinition, context: Value) -> Self {
        let mut task_executions = HashMap::new();
        collect_pending(&definition.tasks, &mut task_executions);
        Self {
            execution_id,
            definition_id: definition.id.clone(),
            status: ExecutionStatus::Running,
            context,
            task_executions,
            total_cost_usd: 0.0,
            started_at: Utc::now(),
            ended_at: None,
            failure_reason: None,
        }
    }

    pub fn task(&self, task_id: &str) -> Option<&TaskExecution> {
        self.task_executions.get(task_id)
    }
}

fn collect_pending(tasks: &[TaskSpec], out: &mut HashMap<String, TaskExecution>) {
    for task in tasks {
        out.insert(task.id.clone(), TaskExecution::pending(&task.id));
        if let TaskKind::Parallel { tasks: children } = &task.kind {
            collect_pending(children, out);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn definition_round_trips_through_yaml() {
        let yaml = r#"
id: triage
name: Incident triage
tasks:
  - id: classify
    type: agent_call
    agent_id: coord-1
    prompt: "Classify: {{context.incident}}"
    retry_count: 1
  - id: branch
    type: conditional
    condition: "tasks.classify.output.content == 'urgent'"
    next_task: notify
  - id: notify
    type: webhook
    url: http://127.0.0.1:9/hook
    skip_on_error: true
"#;
        let definition: WorkflowDefinition = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(definition.tasks.len(), 3);
        assert!(matches!(definition.tasks[0].kind, TaskKind::AgentCall { .. }));
        assert_eq!(definition.tasks[0].retry_count, 1);
        assert_eq!(definition.tasks[0].timeout_seconds, 300);
        assert!(definition.tasks[2].skip_on_error);
    }

    #[test]
    fn new_execution_indexes_nested_parallel_children() {
        let definition = WorkflowDefinition {
            id: "wf".into(),
            name: "wf".into(),
            tasks: vec![TaskSpec {
                id: "group".into(),
                name: None,
                kind: TaskKind::Parallel {
                    tasks: vec![
                        TaskSpec {
                            id: "child-a".into(),
                            name: None,
                            kind: TaskKind::Webhook {
                                url: "http://127.0.0.1:9/a".into(),
                                body: None,
                            },
                            retry_count: 0,
                            timeout_seconds: 10,
                            skip_on_error: false,
                        },
                        TaskSpec {
                            id: "child-b".into(),
                            name: None,
                            kind: TaskKind::Webhook {
                                url: "http://127.0.0.1:9/b".into(),
                                body: None,
                            },
                            retry_count: 0,
                            timeout_seconds: 10,
                            skip_on_error: false,
                        },
                    ],
                },
                retry_count: 0,
                timeout_seconds: 60,
                skip_on_error: false,
            }],
        };
        let execution = WorkflowExecution::new("e-1".into(), &definition, json!({}));
        assert_eq!(execution.task_executions.len(), 3);
        assert_eq!(
            execution.task("child-b").unwrap().status,
            TaskStatus::Pending
        );
    }
}
