use std::convert::Infallible;
use std::net::SocketAddr;

use axum::extract::{Path, Query, Request, State};
use axum::http::{header, HeaderMap, Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use futures::Stream;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use uuid::Uuid;

use switchyard_types::{DispatchError, DispatchRequest, TokenEstimate};

use crate::AppState;

#[derive(Debug, Deserialize)]
struct ChatInput {
    content: String,
    #[serde(default)]
    agent_id: Option<String>,
    #[serde(default)]
    project_id: Option<String>,
    #[serde(default)]
    session_key: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RouteInput {
    query: String,
    #[serde(default)]
    session_key: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ExecuteWorkflowInput {
    workflow_id: String,
    #[serde(default)]
    context: Option<Value>,
    #[serde(default)]
    project_id: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct AlertsQuery {
    limit: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
struct LogsQuery {
    lines: Option<usize>,
}

/// Map the closed failure taxonomy onto HTTP status codes. Budget (402) and
/// quota (429) rejections stay distinguishable from upstream failures.
fn error_status(error: &DispatchError) -> StatusCode {
    match error {
        DispatchError::InvalidInput(_) => StatusCode::BAD_REQUEST,
        DispatchError::QuotaReject { .. } => StatusCode::TOO_MANY_REQUESTS,
        DispatchError::BudgetReject { .. } => StatusCode::PAYMENT_REQUIRED,
        DispatchError::NoAgentAvailable => StatusCode::SERVICE_UNAVAILABLE,
        DispatchError::CircuitOpen { .. } => StatusCode::SERVICE_UNAVAILABLE,
        DispatchError::RateLimit { .. } => StatusCode::TOO_MANY_REQUESTS,
        DispatchError::Timeout => StatusCode::GATEWAY_TIMEOUT,
        DispatchError::UpstreamError(_) => StatusCode::BAD_GATEWAY,
        DispatchError::AuthError => StatusCode::BAD_GATEWAY,
        DispatchError::Cancelled => StatusCode::REQUEST_TIMEOUT,
        DispatchError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Error payload: kind, message, and the relevant numbers for gate
/// rejections. Never internal paths or backtraces.
fn error_body(error: &DispatchError) -> Value {
    let mut body = json!({
        "kind": error.kind(),
        "message": error.to_string(),
    });
    match error {
        DispatchError::BudgetReject {
            gate,
            detail,
            current_spend,
            limit,
            remaining_budget,
        } => {
            body["gate"] = json!(gate.as_str());
            body["detail"] = json!(detail);
            body["current_spend"] = json!(current_spend);
            body["limit"] = json!(limit);
            body["remaining_budget"] = json!(remaining_budget);
        }
        DispatchError::QuotaReject {
            reason,
            limit,
            current,
        } => {
            body["reason"] = json!(reason);
            body["limit"] = json!(limit);
            body["current"] = json!(current);
        }
        DispatchError::RateLimit { retry_after_secs } => {
            body["retry_after_secs"] = json!(retry_after_secs);
        }
        _ => {}
    }
    json!({ "error": body })
}

fn error_response(error: &DispatchError) -> Response {
    (error_status(error), Json(error_body(error))).into_response()
}

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok", "version": crate::build_id() }))
}

async fn chat(State(state): State<AppState>, Json(input): Json<ChatInput>) -> Response {
    let request = DispatchRequest {
        request_id: Uuid::new_v4().to_string(),
        project_id: input.project_id.unwrap_or_else(|| "default".to_string()),
        session_key: input
            .session_key
            .unwrap_or_else(|| Uuid::new_v4().to_string()),
        prompt: input.content,
        conversation_history: Vec::new(),
        agent_hint: input.agent_id,
        budget_estimate_tokens: None,
    };
    match state
        .dispatcher
        .dispatch(request, CancellationToken::new())
        .await
    {
        Ok(reply) => Json(json!({
            "agent": reply.agent,
            "model": reply.model,
            "response": reply.response,
            "tokens": { "input": reply.tokens.input, "output": reply.tokens.output },
            "session_key": reply.session_key,
        }))
        .into_response(),
        Err(err) => error_response(&err),
    }
}

async fn route(State(state): State<AppState>, Json(input): Json<RouteInput>) -> Response {
    let session_key = input.session_key.unwrap_or_else(|| "anonymous".to_string());
    match state
        .dispatcher
        .route_only(&input.query, &session_key, 0)
        .await
    {
        Ok(decision) => Json(decision).into_response(),
        Err(err) => error_response(&err),
    }
}

async fn execute_workflow(
    State(state): State<AppState>,
    Json(input): Json<ExecuteWorkflowInput>,
) -> Response {
    let project_id = input.project_id.unwrap_or_else(|| "workflows".to_string());

    // Workflows pass the same admission gates as single requests; per-step
    // spend is reconciled afterwards through the ledger.
    let _permit = match state.quota.admit(&project_id) {
        Ok(permit) => permit,
        Err(err) => return error_response(&err),
    };
    let estimate = TokenEstimate {
        input: 2_000,
        output: state.config.estimate.default_output_tokens,
    };
    match state.budget.check(&project_id, "", estimate).await {
        Ok(decision) => {
            if let Some(reject) = decision.into_error() {
                return error_response(&reject);
            }
        }
        Err(err) => return error_response(&err),
    }

    match state
        .workflows
        .start(&input.workflow_id, input.context.unwrap_or_else(|| json!({})))
        .await
    {
        Ok(execution) => Json(json!({
            "execution_id": execution.execution_id,
            "status": execution.status,
        }))
        .into_response(),
        Err(err) => error_response(&err),
    }
}

async fn workflow_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Response {
    match state.workflows.status(&id).await {
        Some(execution) => Json(execution).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": { "kind": "not_found", "message": "unknown execution" } })),
        )
            .into_response(),
    }
}

async fn workflow_logs(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<LogsQuery>,
) -> Response {
    match state.workflows.logs(&id, query.lines.unwrap_or(200)).await {
        Ok(tail) => tail.into_response(),
        Err(err) => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": { "kind": "not_found", "message": err.to_string() } })),
        )
            .into_response(),
    }
}

async fn cancel_workflow(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let cancelled = state.workflows.cancel(&id).await;
    Json(json!({ "cancelled": cancelled }))
}

async fn recovered_workflows(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.workflows.recovered().await)
}

async fn detailed_health(State(state): State<AppState>) -> impl IntoResponse {
    let mut system = sysinfo::System::new();
    system.refresh_memory();
    let disks = sysinfo::Disks::new_with_refreshed_list();
    let disk = disks.list().first().map(|d| {
        json!({
            "total_bytes": d.total_space(),
            "available_bytes": d.available_space(),
        })
    });

    Json(json!({
        "status": "ok",
        "version": crate::build_id(),
        "uptime_ms": crate::now_ms().saturating_sub(state.started_at_ms),
        "memory": {
            "total_bytes": system.total_memory(),
            "used_bytes": system.used_memory(),
        },
        "disk": disk,
        "circuit_breakers": state.breakers.all_snapshots().await,
        "active_invocations": state.activity.snapshot().await,
    }))
}

async fn breaker_states(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.breakers.all_snapshots().await)
}

async fn reset_breaker(
    State(state): State<AppState>,
    Path(agent): Path<String>,
) -> impl IntoResponse {
    let reset = state.breakers.reset(&agent).await;
    Json(json!({ "agent_id": agent, "reset": reset }))
}

async fn recent_alerts(
    State(state): State<AppState>,
    Query(query): Query<AlertsQuery>,
) -> Response {
    match state.alerts.recent(query.limit.unwrap_or(50)) {
        Ok(alerts) => Json(alerts).into_response(),
        Err(err) => {
            let internal = DispatchError::Internal(err.to_string());
            error_response(&internal)
        }
    }
}

async fn quota_status(
    State(state): State<AppState>,
    Path(project): Path<String>,
) -> Response {
    match state.budget.status(&project).await {
        Ok(budget) => Json(json!({
            "budget": budget,
            "quota": state.quota.status(&project),
        }))
        .into_response(),
        Err(err) => error_response(&err),
    }
}

async fn cost_summary(State(state): State<AppState>) -> Response {
    match state.ledger.summary() {
        Ok(summary) => Json(summary).into_response(),
        Err(err) => {
            let internal = DispatchError::Internal(err.to_string());
            error_response(&internal)
        }
    }
}

async fn events(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let stream = BroadcastStream::new(state.events.subscribe()).filter_map(|item| {
        let event = item.ok()?;
        let data = serde_json::to_string(&event).ok()?;
        Some(Ok(Event::default().event(event.event_type).data(data)))
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

async fn auth_gate(State(state): State<AppState>, request: Request, next: Next) -> Response {
    if request.method() == Method::OPTIONS {
        return next.run(request).await;
    }
    if request.uri().path() == "/health" {
        return next.run(request).await;
    }
    let Some(expected) = state.api_token().map(str::to_string) else {
        return next.run(request).await;
    };
    if extract_request_token(request.headers()).as_deref() == Some(expected.as_str()) {
        return next.run(request).await;
    }
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({
            "error": {
                "kind": "unauthorized",
                "message": "missing or invalid API token",
            }
        })),
    )
        .into_response()
}

fn extract_request_token(headers: &HeaderMap) -> Option<String> {
    if let Some(token) = headers
        .get("x-switchyard-token")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
    {
        return Some(token.to_string());
    }

    let auth = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())?;
    let trimmed = auth.trim();
    let bearer = trimmed
        .strip_prefix("Bearer ")
        .or_else(|| trimmed.strip_prefix("bearer "))?;
    let token = bearer.trim();
    if token.is_empty() {
        None
    } else {
        Some(token.to_string())
    }
}

pub fn app_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route("/api/chat", post(chat))
        .route("/api/route", post(route))
        .route("/api/workflows/execute", post(execute_workflow))
        .route("/api/workflows/recovered", get(recovered_workflows))
        .route("/api/workflows/{id}/status", get(workflow_status))
        .route("/api/workflows/{id}/logs", get(workflow_logs))
        .route("/api/workflows/{id}", delete(cancel_workflow))
        .route("/api/health/detailed", get(detailed_health))
        .route("/api/health/circuit-breakers", get(breaker_states))
        .route(
            "/api/health/circuit-breakers/{agent}/reset",
            post(reset_breaker),
        )
        .route("/api/health/alerts", get(recent_alerts))
        .route("/api/quotas/status/{project}", get(quota_status))
        .route("/api/costs/summary", get(cost_summary))
        .route("/api/events", get(events))
        .layer(middleware::from_fn_with_state(state.clone(), auth_gate))
        .layer(cors)
        .with_state(state)
}

pub async fn serve(addr: SocketAddr, state: AppState) -> anyhow::Result<()> {
    let app = app_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("switchyard gateway listening on http://{}", addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if tokio::signal::ctrl_c().await.is_err() {
                futures::future::pending::<()>().await;
            }
        })
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use axum::body::Body;
    use chrono::Utc;
    use tower::ServiceExt;

    use switchyard_core::{
        AgentInvoker, AgentRegistry, BreakerAvailability, Dispatcher, EstimateConfig, EventBus,
        GatewayConfig, InvokerTaskCaller,
    };
    use switchyard_gates::{BudgetGate, BudgetLimits, QuotaGate, QuotaLimits};
    use switchyard_ledger::CostLedger;
    use switchyard_observability::AlertLog;
    use switchyard_providers::BackendRegistry;
    use switchyard_resilience::{ActivityTable, BreakerRegistry, RetryPolicy};
    use switchyard_router::Router as AgentRouter;
    use switchyard_types::CostEvent;
    use switchyard_workflow::{ExecutionStore, WorkflowEngine};

    fn state_with(config: GatewayConfig, seed_spend: &[(&str, f64)]) -> (tempfile::TempDir, AppState) {
        let temp = tempfile::tempdir().unwrap();
        let config = Arc::new(config);
        let ledger =
            Arc::new(CostLedger::new(temp.path().join("costs.jsonl"), false).unwrap());
        for (project, cost) in seed_spend {
            ledger
                .append(&CostEvent {
                    timestamp: Utc::now(),
                    project_id: project.to_string(),
                    agent_id: "seed".into(),
                    model: "fast-small".into(),
                    tokens_in: 1,
                    tokens_out: 1,
                    cost_usd: *cost,
                    request_id: "seed".into(),
                })
                .unwrap();
        }
        let alerts = Arc::new(AlertLog::new(temp.path().join("alerts.jsonl")).unwrap());
        let breakers = BreakerRegistry::new(config.breaker.clone());
        let activity = ActivityTable::new();
        let quota = QuotaGate::new(QuotaLimits::default());
        let events = EventBus::new();
        let registry = AgentRegistry::new(config.agents.clone());
        let invoker = Arc::new(AgentInvoker::new(
            // No backends configured: the static in-process backend answers.
            BackendRegistry::new(&[]),
            breakers.clone(),
            activity.clone(),
            RetryPolicy {
                max_attempts: 1,
                base_delay_ms: 1,
                max_delay_ms: 10,
                attempt_timeout_ms: 5_000,
                retry_validation: false,
            },
            config.pricing_table(),
            ledger.clone(),
            quota.clone(),
            alerts.clone(),
            events.clone(),
        ));
        let budget = Arc::new(BudgetGate::new(
            config.budget.clone(),
            config.projects.clone(),
            config.pricing_table(),
            ledger.clone(),
        ));
        let router = Arc::new(AgentRouter::new(
            config.router.clone(),
            config.pricing_table(),
            Arc::new(BreakerAvailability::new(breakers.clone())),
        ));
        let dispatcher = Arc::new(Dispatcher::new(
            registry.clone(),
            router,
            quota.clone(),
            budget.clone(),
            invoker.clone(),
            EstimateConfig::default(),
            events.clone(),
        ));
        let store = Arc::new(ExecutionStore::new(temp.path().join("executions")).unwrap());
        let caller = Arc::new(InvokerTaskCaller::new(
            invoker,
            registry,
            "workflows".to_string(),
        ));
        let workflows = Arc::new(WorkflowEngine::new(store, ledger.clone(), caller));

        let state = AppState {
            config,
            dispatcher,
            workflows,
            breakers,
            activity,
            ledger,
            alerts,
            budget,
            quota,
            events,
            started_at_ms: crate::now_ms(),
        };
        (temp, state)
    }

    async fn body_json(response: Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), 1_048_576)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn liveness_is_open() {
        let (_temp, state) = state_with(GatewayConfig::default(), &[]);
        let app = app_router(state);
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn configured_token_guards_the_api() {
        let mut config = GatewayConfig::default();
        config.server.api_token = Some("secret-token".to_string());
        let (_temp, state) = state_with(config, &[]);
        let app = app_router(state);

        let denied = app
            .clone()
            .oneshot(
                axum::http::Request::builder()
                    .uri("/api/costs/summary")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(denied.status(), StatusCode::UNAUTHORIZED);

        let allowed = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/api/costs/summary")
                    .header("authorization", "Bearer secret-token")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(allowed.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn chat_round_trip_returns_agent_and_tokens() {
        let (_temp, state) = state_with(GatewayConfig::default(), &[]);
        let app = app_router(state);
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/api/chat")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"content": "hi, thanks!"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["agent"], "coordinator");
        assert!(body["tokens"]["input"].as_u64().unwrap() > 0);
        assert!(body["session_key"].is_string());
    }

    #[tokio::test]
    async fn budget_rejection_maps_to_402_with_gate() {
        let mut config = GatewayConfig::default();
        config.budget = BudgetLimits {
            per_task_usd: 5.0,
            daily_usd: 20.0,
            monthly_usd: 1_000.0,
            ..BudgetLimits::default()
        };
        let (_temp, state) = state_with(config, &[("alpha", 19.999)]);
        let app = app_router(state);
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/api/chat")
                    .header("content-type", "application/json")
                    .body(Body::from(
                        r#"{"content": "please summarize every incident report we have on file from the last quarter in detail", "project_id": "alpha"}"#,
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::PAYMENT_REQUIRED);
        let body = body_json(response).await;
        assert_eq!(body["error"]["kind"], "budget_reject");
        assert_eq!(body["error"]["gate"], "daily");
        assert!(body["error"]["remaining_budget"].is_number());
    }

    #[tokio::test]
    async fn unknown_execution_is_404() {
        let (_temp, state) = state_with(GatewayConfig::default(), &[]);
        let app = app_router(state);
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/api/workflows/wfx-missing/status")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn status_mapping_is_closed_over_the_taxonomy() {
        let cases: Vec<(DispatchError, StatusCode)> = vec![
            (
                DispatchError::InvalidInput("x".into()),
                StatusCode::BAD_REQUEST,
            ),
            (
                DispatchError::QuotaReject {
                    reason: "full".into(),
                    limit: 1,
                    current: 1,
                },
                StatusCode::TOO_MANY_REQUESTS,
            ),
            (DispatchError::NoAgentAvailable, StatusCode::SERVICE_UNAVAILABLE),
            (
                DispatchError::CircuitOpen {
                    agent_id: "a".into(),
                },
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (DispatchError::Timeout, StatusCode::GATEWAY_TIMEOUT),
            (
                DispatchError::RateLimit {
                    retry_after_secs: None,
                },
                StatusCode::TOO_MANY_REQUESTS,
            ),
            (DispatchError::AuthError, StatusCode::BAD_GATEWAY),
        ];
        for (error, status) in cases {
            assert_eq!(error_status(&error), status, "{:?}", error);
        }
    }
}
