// Workflow execution.
//
// Tasks run in definition order; conditionals jump forward by task id;
// parallel groups join all children before the group resolves. Execution
// state is persisted atomically on every task transition so a crash is
// recoverable as `interrupted` on the next start.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt};
use regex::Regex;
use serde_json::{json, Value};
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use switchyard_ledger::CostLedger;
use switchyard_types::{DispatchError, TokenUsage};

use crate::condition::{evaluate_condition, lookup};
use crate::store::{ExecutionStore, StoreError};
use crate::types::{
    ExecutionStatus, TaskKind, TaskSpec, TaskStatus, WorkflowDefinition, WorkflowExecution,
};

/// Result of one agent call made on behalf of a workflow task.
#[derive(Debug, Clone)]
pub struct AgentTaskOutput {
    pub agent_id: String,
    pub content: String,
    pub tokens: TokenUsage,
}

/// Narrow contract through which the engine reaches the invoker. The engine
/// never depends on routing or breaker internals; cost attribution flows
/// back through the ledger keyed by `request_id`.
#[async_trait]
pub trait TaskAgentCaller: Send + Sync {
    async fn call_agent(
        &self,
        agent_id: &str,
        prompt: &str,
        request_id: &str,
        cancel: &CancellationToken,
    ) -> switchyard_types::Result<AgentTaskOutput>;
}

const ENGINE_RETRY_PAUSE: Duration = Duration::from_millis(250);

struct TaskOutcome {
    status: TaskStatus,
    output: Option<Value>,
    error: Option<String>,
}

/// Shared mutable execution state with persist-on-transition semantics.
struct ExecState {
    store: Arc<ExecutionStore>,
    inner: Mutex<WorkflowExecution>,
}

impl ExecState {
    async fn mutate<F: FnOnce(&mut WorkflowExecution)>(&self, f: F) -> Result<(), StoreError> {
        let mut exec = self.inner.lock().await;
        f(&mut exec);
        self.store.save(&exec)
    }

    async fn task_status(&self, task_id: &str) -> Option<TaskStatus> {
        self.inner
            .lock()
            .await
            .task(task_id)
            .map(|t| t.status)
    }

    /// Evaluation scope for conditions and prompt templates.
    async fn scope(&self) -> Value {
        let exec = self.inner.lock().await;
        let mut tasks = serde_json::Map::new();
        for (id, task) in &exec.task_executions {
            tasks.insert(
                id.clone(),
                json!({
                    "status": task.status,
                    "output": task.output.clone().unwrap_or(Value::Null),
                }),
            );
        }
        json!({
            "context": exec.context.clone(),
            "tasks": Value::Object(tasks),
        })
    }
}

pub struct WorkflowEngine {
    definitions: RwLock<HashMap<String, WorkflowDefinition>>,
    store: Arc<ExecutionStore>,
    ledger: Arc<CostLedger>,
    caller: Arc<dyn TaskAgentCaller>,
    http: reqwest::Client,
    active: RwLock<HashMap<String, CancellationToken>>,
    recovered: RwLock<Vec<WorkflowExecution>>,
    template: Regex,
}

impl WorkflowEngine {
    pub fn new(
        store: Arc<ExecutionStore>,
        ledger: Arc<CostLedger>,
        caller: Arc<dyn TaskAgentCaller>,
    ) -> Self {
        Self {
            definitions: RwLock::new(HashMap::new()),
            store,
            ledger,
            caller,
            http: reqwest::Client::new(),
            active: RwLock::new(HashMap::new()),
            recovered: RwLock::new(Vec::new()),
            template: Regex::new(r"\{\{\s*([A-Za-z0-9_.\-]+)\s*\}\}")
                .unwrap_or_else(|_| unreachable!("template pattern is static")),
        }
    }

    pub async fn register_definition(&self, definition: WorkflowDefinition) {
        self.definitions
            .write()
            .await
            .insert(definition.id.clone(), definition);
    }

    pub async fn register_definitions(&self, definitions: Vec<WorkflowDefinition>) {
        for definition in definitions {
            self.register_definition(definition).await;
        }
    }

    pub async fn list_definitions(&self) -> Vec<WorkflowDefinition> {
        let mut definitions = self
            .definitions
            .read()
            .await
            .values()
            .cloned()
            .collect::<Vec<_>>();
        definitions.sort_by(|a, b| a.id.cmp(&b.id));
        definitions
    }

    /// Startup recovery pass. Must run before the dispatcher starts taking
    /// requests; interrupted executions are reported, never restarted.
    pub async fn recover_on_startup(&self) -> Result<usize, StoreError> {
        let recovered = self.store.recover_interrupted()?;
        let count = recovered.len();
        if count > 0 {
            warn!(count, "marked interrupted workflow executions as failed");
        }
        *self.recovered.write().await = recovered;
        Ok(count)
    }

    pub async fn recovered(&self) -> Vec<WorkflowExecution> {
        self.recovered.read().await.clone()
    }

    /// Start an execution in the background and return its initial snapshot.
    pub async fn start(
        self: &Arc<Self>,
        definition_id: &str,
        context: Value,
    ) -> switchyard_types::Result<WorkflowExecution> {
        let definition = self
            .definitions
            .read()
            .await
            .get(definition_id)
            .cloned()
            .ok_or_else(|| {
                DispatchError::InvalidInput(format!("unknown workflow `{}`", definition_id))
            })?;

        let execution_id = format!("wfx-{}", Uuid::new_v4());
        let execution = WorkflowExecution::new(execution_id.clone(), &definition, context);
        self.store
            .save(&execution)
            .map_err(|e| DispatchError::Internal(e.to_string()))?;

        let cancel = CancellationToken::new();
        self.active
            .write()
            .await
            .insert(execution_id.clone(), cancel.clone());

        let engine = self.clone();
        let snapshot = execution.clone();
        tokio::spawn(async move {
            engine.run(definition, execution, cancel).await;
        });
        Ok(snapshot)
    }

    /// Run an execution to completion inline and return the final record.
    pub async fn execute(
        self: &Arc<Self>,
        definition_id: &str,
        context: Value,
    ) -> switchyard_types::Result<WorkflowExecution> {
        let snapshot = self.start(definition_id, context).await?;
        let execution_id = snapshot.execution_id.clone();
        loop {
            tokio::time::sleep(Duration::from_millis(20)).await;
            if !self.active.read().await.contains_key(&execution_id) {
                break;
            }
        }
        self.status(&execution_id)
            .await
            .ok_or_else(|| DispatchError::Internal("execution record vanished".to_string()))
    }

    pub async fn status(&self, execution_id: &str) -> Option<WorkflowExecution> {
        self.store.load(execution_id).ok()
    }

    pub async fn logs(&self, execution_id: &str, max_lines: usize) -> Result<String, StoreError> {
        self.store.read_log_tail(execution_id, max_lines)
    }

    /// Cooperative cancel. Returns whether a running execution was signalled.
    pub async fn cancel(&self, execution_id: &str) -> bool {
        if let Some(token) = self.active.read().await.get(execution_id) {
            token.cancel();
            return true;
        }
        false
    }

    async fn run(
        self: Arc<Self>,
        definition: WorkflowDefinition,
        execution: WorkflowExecution,
        cancel: CancellationToken,
    ) {
        let execution_id = execution.execution_id.clone();
        let state = ExecState {
            store: self.store.clone(),
            inner: Mutex::new(execution),
        };
        self.log(&execution_id, &format!("execution started for workflow {}", definition.id));

        let mut idx = 0;
        let mut outcome_status = ExecutionStatus::Completed;
        let mut failure_reason = None;

        while idx < definition.tasks.len() {
            if cancel.is_cancelled() {
                outcome_status = ExecutionStatus::Cancelled;
                failure_reason = Some("cancelled".to_string());
                break;
            }

            let task = &definition.tasks[idx];
            if state.task_status(&task.id).await == Some(TaskStatus::Skipped) {
                idx += 1;
                continue;
            }

            let outcome = self
                .run_task(task, &state, &execution_id, &cancel)
                .await;

            if cancel.is_cancelled() {
                outcome_status = ExecutionStatus::Cancelled;
                failure_reason = Some("cancelled".to_string());
                break;
            }

            if let TaskKind::Conditional { .. } = &task.kind {
                if outcome.status == TaskStatus::Completed {
                    let target = outcome
                        .output
                        .as_ref()
                        .and_then(|o| o.get("next_task"))
                        .and_then(|t| t.as_str())
                        .map(str::to_string);
                    if let Some(target) = target {
                        match definition.tasks.iter().position(|t| t.id == target) {
                            Some(t_idx) if t_idx > idx => {
                                let skipped: Vec<String> = definition.tasks[idx + 1..t_idx]
                                    .iter()
                                    .map(|t| t.id.clone())
                                    .collect();
                                if !skipped.is_empty() {
                                    let ok = state
                                        .mutate(|exec| {
                                            for id in &skipped {
                                                if let Some(t) = exec.task_executions.get_mut(id) {
                                                    t.status = TaskStatus::Skipped;
                                                }
                                            }
                                        })
                                        .await;
                                    if let Err(err) = ok {
                                        error!(error = %err, "failed to persist skip transitions");
                                    }
                                }
                                idx = t_idx;
                                continue;
                            }
                            Some(_) => {
                                outcome_status = ExecutionStatus::Failed;
                                failure_reason = Some(format!(
                                    "conditional {} targets earlier task {}",
                                    task.id, target
                                ));
                                break;
                            }
                            None => {
                                outcome_status = ExecutionStatus::Failed;
                                failure_reason = Some(format!(
                                    "conditional {} targets unknown task {}",
                                    task.id, target
                                ));
                                break;
                            }
                        }
                    }
                    idx += 1;
                    continue;
                }
            }

            if outcome.status == TaskStatus::Failed && !task.skip_on_error {
                outcome_status = ExecutionStatus::Failed;
                failure_reason = outcome
                    .error
                    .clone()
                    .or_else(|| Some(format!("task {} failed", task.id)));
                break;
            }

            idx += 1;
        }

        let total_cost = self
            .ledger
            .execution_cost(&format!("{}:", execution_id))
            .unwrap_or_else(|err| {
                error!(error = %err, "failed to aggregate execution cost");
                0.0
            });

        let persisted = state
            .mutate(|exec| {
                exec.status = outcome_status;
                exec.failure_reason = failure_reason.clone();
                exec.total_cost_usd = total_cost;
                exec.ended_at = Some(chrono::Utc::now());
            })
            .await;
        if let Err(err) = persisted {
            error!(error = %err, "failed to persist final execution state");
        }

        self.log(
            &execution_id,
            &format!(
                "execution finished status={:?} cost_usd={:.6}",
                outcome_status, total_cost
            ),
        );
        self.active.write().await.remove(&execution_id);
    }

    fn run_task<'a>(
        &'a self,
        task: &'a TaskSpec,
        state: &'a ExecState,
        execution_id: &'a str,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, TaskOutcome> {
        async move {
            if let Err(err) = state
                .mutate(|exec| {
                    if let Some(t) = exec.task_executions.get_mut(&task.id) {
                        t.status = TaskStatus::Running;
                        t.started_at = Some(chrono::Utc::now());
                    }
                })
                .await
            {
                error!(error = %err, task = %task.id, "failed to persist task start");
            }
            self.log(execution_id, &format!("task {} started", task.id));

            let outcome = match &task.kind {
                TaskKind::Parallel { tasks } => {
                    let children = tasks
                        .iter()
                        .map(|child| self.run_task(child, state, execution_id, cancel));
                    let results = futures::future::join_all(children).await;
                    // The group fails only if a child that was not allowed
                    // to fail did. Siblings always run to termination.
                    let blocking_failure = tasks.iter().zip(results.iter()).find(|(child, r)| {
                        r.status == TaskStatus::Failed && !child.skip_on_error
                    });
                    match blocking_failure {
                        Some((child, result)) => TaskOutcome {
                            status: TaskStatus::Failed,
                            output: None,
                            error: Some(
                                result
                                    .error
                                    .clone()
                                    .unwrap_or_else(|| format!("child {} failed", child.id)),
                            ),
                        },
                        None => TaskOutcome {
                            status: TaskStatus::Completed,
                            output: Some(json!({
                                "children": tasks.iter().map(|t| t.id.clone()).collect::<Vec<_>>(),
                            })),
                            error: None,
                        },
                    }
                }
                _ => self.run_leaf(task, state, execution_id, cancel).await,
            };

            if let Err(err) = state
                .mutate(|exec| {
                    if let Some(t) = exec.task_executions.get_mut(&task.id) {
                        t.status = outcome.status;
                        t.output = outcome.output.clone();
                        t.error = outcome.error.clone();
                        t.ended_at = Some(chrono::Utc::now());
                    }
                })
                .await
            {
                error!(error = %err, task = %task.id, "failed to persist task result");
            }
            self.log(
                execution_id,
                &format!("task {} finished status={:?}", task.id, outcome.status),
            );
            outcome
        }
        .boxed()
    }

    /// Attempt loop for non-parallel tasks.
    async fn run_leaf(
        &self,
        task: &TaskSpec,
        state: &ExecState,
        execution_id: &str,
        cancel: &CancellationToken,
    ) -> TaskOutcome {
        let max_attempts = task.retry_count + 1;
        let timeout = Duration::from_secs(task.timeout_seconds.max(1));
        let mut last_error = String::new();

        for attempt in 0..max_attempts {
            if cancel.is_cancelled() {
                return TaskOutcome {
                    status: TaskStatus::Failed,
                    output: None,
                    error: Some("cancelled".to_string()),
                };
            }
            if attempt > 0 {
                tokio::time::sleep(ENGINE_RETRY_PAUSE).await;
            }
            if let Err(err) = state
                .mutate(|exec| {
                    if let Some(t) = exec.task_executions.get_mut(&task.id) {
                        t.attempts = attempt + 1;
                    }
                })
                .await
            {
                error!(error = %err, task = %task.id, "failed to persist attempt count");
            }

            let attempt_result = tokio::time::timeout(
                timeout,
                self.attempt(task, state, execution_id, attempt, cancel),
            )
            .await;

            match attempt_result {
                Ok(Ok(output)) => {
                    return TaskOutcome {
                        status: TaskStatus::Completed,
                        output: Some(output),
                        error: None,
                    };
                }
                Ok(Err(message)) => {
                    warn!(task = %task.id, attempt = attempt + 1, error = %message, "task attempt failed");
                    last_error = message;
                }
                Err(_) => {
                    warn!(task = %task.id, attempt = attempt + 1, "task attempt timed out");
                    last_error = format!("timed out after {}s", task.timeout_seconds);
                }
            }
        }

        TaskOutcome {
            status: TaskStatus::Failed,
            output: None,
            error: Some(last_error),
        }
    }

    /// One attempt of a leaf task.
    async fn attempt(
        &self,
        task: &TaskSpec,
        state: &ExecState,
        execution_id: &str,
        attempt: u32,
        cancel: &CancellationToken,
    ) -> Result<Value, String> {
        match &task.kind {
            TaskKind::AgentCall { agent_id, prompt } => {
                let scope = state.scope().await;
                let rendered = self.render_template(prompt, &scope);
                let request_id = format!("{}:{}:{}", execution_id, task.id, attempt);
                let output = self
                    .caller
                    .call_agent(agent_id, &rendered, &request_id, cancel)
                    .await
                    .map_err(|e| e.to_string())?;
                Ok(json!({
                    "agent": output.agent_id,
                    "content": output.content,
                    "tokens": { "input": output.tokens.input, "output": output.tokens.output },
                }))
            }
            TaskKind::HttpCall {
                method,
                url,
                body,
                headers,
            } => {
                let method = reqwest::Method::from_bytes(method.to_uppercase().as_bytes())
                    .map_err(|_| format!("invalid http method `{}`", method))?;
                let mut request = self.http.request(method, url);
                for (name, value) in headers {
                    request = request.header(name, value);
                }
                if let Some(body) = body {
                    request = request.json(body);
                }
                let response = request.send().await.map_err(|e| e.to_string())?;
                let status = response.status();
                let text = response.text().await.unwrap_or_default();
                let body = serde_json::from_str::<Value>(&text)
                    .unwrap_or(Value::String(text));
                if !status.is_success() {
                    return Err(format!("http status {}", status));
                }
                Ok(json!({ "status": status.as_u16(), "body": body }))
            }
            TaskKind::Conditional {
                condition,
                next_task,
                else_task,
            } => {
                let scope = state.scope().await;
                let result =
                    evaluate_condition(condition, &scope).map_err(|e| e.to_string())?;
                let chosen = if result {
                    Some(next_task.clone())
                } else {
                    else_task.clone()
                };
                Ok(json!({ "result": result, "next_task": chosen }))
            }
            TaskKind::Webhook { url, body } => {
                let client = self.http.clone();
                let url = url.clone();
                let body = body.clone().unwrap_or(Value::Null);
                tokio::spawn(async move {
                    if let Err(err) = client.post(&url).json(&body).send().await {
                        warn!(url = %url, error = %err, "webhook delivery failed");
                    }
                });
                Ok(json!({ "dispatched": true }))
            }
            TaskKind::Parallel { .. } => Err("parallel groups have no single attempt".to_string()),
        }
    }

    /// Replace `{{path}}` placeholders from the evaluation scope. String
    /// values insert raw; other values insert as compact JSON; missing
    /// paths insert nothing.
    fn render_template(&self, template: &str, scope: &Value) -> String {
        self.template
            .replace_all(template, |caps: &regex::Captures<'_>| {
                let value = lookup(scope, &caps[1]);
                match value {
                    Value::Null => String::new(),
                    Value::String(s) => s,
                    other => other.to_string(),
                }
            })
            .into_owned()
    }

    fn log(&self, execution_id: &str, line: &str) {
        if let Err(err) = self.store.append_log(execution_id, line) {
            error!(error = %err, "failed to append execution log");
        }
        info!(execution = execution_id, "{}", line);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as StdHashMap;
    use std::sync::Mutex as StdMutex;
    use tempfile::tempdir;

    struct ScriptedCaller {
        /// agent_id -> number of failures before success; absent means
        /// always succeed.
        failures: StdMutex<StdHashMap<String, u32>>,
        always_fail: Vec<String>,
        prompts: StdMutex<Vec<(String, String)>>,
        delay: Option<Duration>,
    }

    impl ScriptedCaller {
        fn ok() -> Self {
            Self {
                failures: StdMutex::new(StdHashMap::new()),
                always_fail: Vec::new(),
                prompts: StdMutex::new(Vec::new()),
                delay: None,
            }
        }

        fn failing(agents: &[&str]) -> Self {
            Self {
                always_fail: agents.iter().map(|a| a.to_string()).collect(),
                ..Self::ok()
            }
        }

        fn flaky(agent: &str, failures: u32) -> Self {
            let caller = Self::ok();
            caller
                .failures
                .lock()
                .unwrap()
                .insert(agent.to_string(), failures);
            caller
        }

        fn slow(delay: Duration) -> Self {
            Self {
                delay: Some(delay),
                ..Self::ok()
            }
        }
    }

    #[async_trait]
    impl TaskAgentCaller for ScriptedCaller {
        async fn call_agent(
            &self,
            agent_id: &str,
            prompt: &str,
            _request_id: &str,
            cancel: &CancellationToken,
        ) -> switchyard_types::Result<AgentTaskOutput> {
            if let Some(delay) = self.delay {
                tokio::select! {
                    _ = cancel.cancelled() => return Err(DispatchError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            self.prompts
                .lock()
                .unwrap()
                .push((agent_id.to_string(), prompt.to_string()));
            if self.always_fail.iter().any(|a| a == agent_id) {
                return Err(DispatchError::UpstreamError("scripted failure".into()));
            }
            let mut failures = self.failures.lock().unwrap();
            if let Some(remaining) = failures.get_mut(agent_id) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(DispatchError::UpstreamError("scripted flake".into()));
                }
            }
            Ok(AgentTaskOutput {
                agent_id: agent_id.to_string(),
                content: format!("reply from {}", agent_id),
                tokens: TokenUsage { input: 10, output: 5 },
            })
        }
    }

    fn agent_task(id: &str, agent: &str, prompt: &str) -> TaskSpec {
        TaskSpec {
            id: id.to_string(),
            name: None,
            kind: TaskKind::AgentCall {
                agent_id: agent.to_string(),
                prompt: prompt.to_string(),
            },
            retry_count: 0,
            timeout_seconds: 10,
            skip_on_error: false,
        }
    }

    fn engine_with(caller: Arc<dyn TaskAgentCaller>) -> (tempfile::TempDir, Arc<WorkflowEngine>) {
        let temp = tempdir().unwrap();
        let store = Arc::new(ExecutionStore::new(temp.path().join("executions")).unwrap());
        let ledger =
            Arc::new(CostLedger::new(temp.path().join("costs.jsonl"), false).unwrap());
        (temp, Arc::new(WorkflowEngine::new(store, ledger, caller)))
    }

    #[tokio::test]
    async fn sequential_tasks_complete_with_templating() {
        let caller = Arc::new(ScriptedCaller::ok());
        let (_temp, engine) = engine_with(caller.clone());
        engine
            .register_definition(WorkflowDefinition {
                id: "wf".into(),
                name: "wf".into(),
                tasks: vec![
                    agent_task("draft", "dev-1", "Draft: {{context.topic}}"),
                    agent_task("polish", "dev-2", "Polish: {{tasks.draft.output.content}}"),
                ],
            })
            .await;

        let result = engine
            .execute("wf", json!({"topic": "release notes"}))
            .await
            .unwrap();

        assert_eq!(result.status, ExecutionStatus::Completed);
        assert_eq!(result.task("draft").unwrap().status, TaskStatus::Completed);
        assert_eq!(result.task("polish").unwrap().status, TaskStatus::Completed);

        let prompts = caller.prompts.lock().unwrap();
        assert_eq!(prompts[0].1, "Draft: release notes");
        assert_eq!(prompts[1].1, "Polish: reply from dev-1");
    }

    #[tokio::test]
    async fn hard_failure_stops_downstream_tasks() {
        let caller = Arc::new(ScriptedCaller::failing(&["dev-1"]));
        let (_temp, engine) = engine_with(caller.clone());
        engine
            .register_definition(WorkflowDefinition {
                id: "wf".into(),
                name: "wf".into(),
                tasks: vec![
                    agent_task("first", "dev-1", "p1"),
                    agent_task("second", "dev-2", "p2"),
                ],
            })
            .await;

        let result = engine.execute("wf", json!({})).await.unwrap();

        assert_eq!(result.status, ExecutionStatus::Failed);
        assert_eq!(result.task("first").unwrap().status, TaskStatus::Failed);
        assert_eq!(result.task("second").unwrap().status, TaskStatus::Pending);
        // The downstream agent was never called.
        let prompts = caller.prompts.lock().unwrap();
        assert!(prompts.iter().all(|(agent, _)| agent != "dev-2"));
    }

    #[tokio::test]
    async fn skip_on_error_records_failure_and_continues() {
        let caller = Arc::new(ScriptedCaller::failing(&["dev-1"]));
        let (_temp, engine) = engine_with(caller);
        let mut first = agent_task("first", "dev-1", "p1");
        first.skip_on_error = true;
        engine
            .register_definition(WorkflowDefinition {
                id: "wf".into(),
                name: "wf".into(),
                tasks: vec![first, agent_task("second", "dev-2", "p2")],
            })
            .await;

        let result = engine.execute("wf", json!({})).await.unwrap();

        assert_eq!(result.status, ExecutionStatus::Completed);
        assert_eq!(result.task("first").unwrap().status, TaskStatus::Failed);
        assert_eq!(result.task("second").unwrap().status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn parallel_group_tolerates_skippable_child_failure() {
        let caller = Arc::new(ScriptedCaller::failing(&["flaky"]));
        let (_temp, engine) = engine_with(caller);
        let mut failing_child = agent_task("t2", "flaky", "p");
        failing_child.skip_on_error = true;
        engine
            .register_definition(WorkflowDefinition {
                id: "wf".into(),
                name: "wf".into(),
                tasks: vec![TaskSpec {
                    id: "group".into(),
                    name: None,
                    kind: TaskKind::Parallel {
                        tasks: vec![
                            agent_task("t1", "dev-1", "p"),
                            failing_child,
                            agent_task("t3", "dev-3", "p"),
                        ],
                    },
                    retry_count: 0,
                    timeout_seconds: 30,
                    skip_on_error: false,
                }],
            })
            .await;

        let result = engine.execute("wf", json!({})).await.unwrap();

        assert_eq!(result.status, ExecutionStatus::Completed);
        assert_eq!(result.task("t1").unwrap().status, TaskStatus::Completed);
        assert_eq!(result.task("t2").unwrap().status, TaskStatus::Failed);
        assert_eq!(result.task("t3").unwrap().status, TaskStatus::Completed);
        assert_eq!(result.task("group").unwrap().status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn parallel_group_fails_on_blocking_child() {
        let caller = Arc::new(ScriptedCaller::failing(&["flaky"]));
        let (_temp, engine) = engine_with(caller);
        engine
            .register_definition(WorkflowDefinition {
                id: "wf".into(),
                name: "wf".into(),
                tasks: vec![TaskSpec {
                    id: "group".into(),
                    name: None,
                    kind: TaskKind::Parallel {
                        tasks: vec![
                            agent_task("t1", "dev-1", "p"),
                            agent_task("t2", "flaky", "p"),
                        ],
                    },
                    retry_count: 0,
                    timeout_seconds: 30,
                    skip_on_error: false,
                }],
            })
            .await;

        let result = engine.execute("wf", json!({})).await.unwrap();

        assert_eq!(result.status, ExecutionStatus::Failed);
        // The sibling still ran to completion.
        assert_eq!(result.task("t1").unwrap().status, TaskStatus::Completed);
        assert_eq!(result.task("t2").unwrap().status, TaskStatus::Failed);
    }

    #[tokio::test]
    async fn conditional_jump_skips_intermediate_tasks() {
        let caller = Arc::new(ScriptedCaller::ok());
        let (_temp, engine) = engine_with(caller.clone());
        engine
            .register_definition(WorkflowDefinition {
                id: "wf".into(),
                name: "wf".into(),
                tasks: vec![
                    agent_task("classify", "coord-1", "classify it"),
                    TaskSpec {
                        id: "branch".into(),
                        name: None,
                        kind: TaskKind::Conditional {
                            condition: "tasks.classify.output.content == 'reply from coord-1'"
                                .into(),
                            next_task: "final".into(),
                            else_task: None,
                        },
                        retry_count: 0,
                        timeout_seconds: 10,
                        skip_on_error: false,
                    },
                    agent_task("middle", "dev-1", "should not run"),
                    agent_task("final", "dev-2", "wrap up"),
                ],
            })
            .await;

        let result = engine.execute("wf", json!({})).await.unwrap();

        assert_eq!(result.status, ExecutionStatus::Completed);
        assert_eq!(result.task("middle").unwrap().status, TaskStatus::Skipped);
        assert_eq!(result.task("final").unwrap().status, TaskStatus::Completed);
        let prompts = caller.prompts.lock().unwrap();
        assert!(prompts.iter().all(|(agent, _)| agent != "dev-1"));
    }

    #[tokio::test]
    async fn retry_count_grants_additional_attempts() {
        let caller = Arc::new(ScriptedCaller::flaky("dev-1", 2));
        let (_temp, engine) = engine_with(caller);
        let mut task = agent_task("only", "dev-1", "p");
        task.retry_count = 2;
        engine
            .register_definition(WorkflowDefinition {
                id: "wf".into(),
                name: "wf".into(),
                tasks: vec![task],
            })
            .await;

        let result = engine.execute("wf", json!({})).await.unwrap();

        assert_eq!(result.status, ExecutionStatus::Completed);
        let task = result.task("only").unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.attempts, 3);
    }

    #[tokio::test]
    async fn cancel_stops_a_running_execution() {
        let caller = Arc::new(ScriptedCaller::slow(Duration::from_secs(30)));
        let (_temp, engine) = engine_with(caller);
        engine
            .register_definition(WorkflowDefinition {
                id: "wf".into(),
                name: "wf".into(),
                tasks: vec![agent_task("slow", "dev-1", "p")],
            })
            .await;

        let snapshot = engine.start("wf", json!({})).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(engine.cancel(&snapshot.execution_id).await);

        // Wait for the run loop to wind down.
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            if !engine
                .active
                .read()
                .await
                .contains_key(&snapshot.execution_id)
            {
                break;
            }
        }
        let result = engine.status(&snapshot.execution_id).await.unwrap();
        assert_eq!(result.status, ExecutionStatus::Cancelled);
    }

    #[tokio::test]
    async fn unknown_definition_is_invalid_input() {
        let caller = Arc::new(ScriptedCaller::ok());
        let (_temp, engine) = engine_with(caller);
        let err = engine.execute("missing", json!({})).await.unwrap_err();
        assert!(matches!(err, DispatchError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn recovery_surfaces_interrupted_executions() {
        let caller = Arc::new(ScriptedCaller::ok());
        let temp = tempdir().unwrap();
        let store = Arc::new(ExecutionStore::new(temp.path().join("executions")).unwrap());
        let ledger =
            Arc::new(CostLedger::new(temp.path().join("costs.jsonl"), false).unwrap());

        // Simulate a crash: a running execution persisted by a dead process.
        let definition = WorkflowDefinition {
            id: "wf".into(),
            name: "wf".into(),
            tasks: vec![agent_task("t1", "dev-1", "p")],
        };
        let orphan = WorkflowExecution::new("wfx-orphan".into(), &definition, json!({}));
        store.save(&orphan).unwrap();

        let engine = Arc::new(WorkflowEngine::new(store, ledger, caller));
        let count = engine.recover_on_startup().await.unwrap();
        assert_eq!(count, 1);

        let recovered = engine.recovered().await;
        assert_eq!(recovered.len(), 1);
        assert_eq!(recovered[0].execution_id, "wfx-orphan");
        assert_eq!(recovered[0].status, ExecutionStatus::Failed);
        assert_eq!(recovered[0].failure_reason.as_deref(), Some("interrupted"));
    }
}
