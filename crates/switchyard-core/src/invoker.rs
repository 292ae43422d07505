//! The composed call path around one agent invocation.
//!
//! Middleware order: circuit breaker admission, per-agent quota slot,
//! heartbeat registration, retry-wrapped backend call (touching the
//! heartbeat on each attempt), then cost recording and breaker signalling.
//! Every invocation resolves to exactly one of success-with-cost-recorded
//! or a classified failure.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use switchyard_gates::QuotaGate;
use switchyard_ledger::CostLedger;
use switchyard_observability::AlertLog;
use switchyard_providers::{BackendCall, BackendError, BackendErrorKind, BackendRegistry};
use switchyard_resilience::{
    run_with_retry, ActivityTable, Admission, BreakerRegistry, ErrorClass, RetryError, RetryPolicy,
};
use switchyard_types::{
    Alert, AlertLevel, AgentDefinition, CostEvent, DispatchError, DispatchRequest, PricingTable,
    TokenUsage,
};
use switchyard_workflow::{AgentTaskOutput, TaskAgentCaller};

use crate::event_bus::{EventBus, GatewayEvent};
use crate::registry::AgentRegistry;

/// Map the providers' closed error kinds onto the retry taxonomy.
fn classify_backend_error(error: &BackendError) -> ErrorClass {
    match error.kind {
        BackendErrorKind::RateLimited => ErrorClass::RateLimit {
            retry_after_secs: error.retry_after_secs,
        },
        BackendErrorKind::Server => ErrorClass::ServerError,
        BackendErrorKind::Timeout => ErrorClass::Timeout,
        BackendErrorKind::Connection => ErrorClass::Connection,
        BackendErrorKind::Validation => ErrorClass::Validation,
        BackendErrorKind::Auth => ErrorClass::Auth,
        BackendErrorKind::NotFound => ErrorClass::NotFound,
        BackendErrorKind::Unknown => ErrorClass::Unknown,
    }
}

/// Translate a terminal backend failure into the public taxonomy.
fn map_backend_error(error: BackendError) -> DispatchError {
    match error.kind {
        BackendErrorKind::RateLimited => DispatchError::RateLimit {
            retry_after_secs: error.retry_after_secs,
        },
        BackendErrorKind::Timeout => DispatchError::Timeout,
        BackendErrorKind::Auth => DispatchError::AuthError,
        BackendErrorKind::Validation => DispatchError::InvalidInput(error.message),
        BackendErrorKind::Server
        | BackendErrorKind::Connection
        | BackendErrorKind::NotFound
        | BackendErrorKind::Unknown => DispatchError::UpstreamError(error.message),
    }
}

#[derive(Debug, Clone)]
pub struct InvokeOutcome {
    pub agent_id: String,
    pub model: String,
    pub content: String,
    pub usage: TokenUsage,
}

pub struct AgentInvoker {
    backends: BackendRegistry,
    breakers: BreakerRegistry,
    activity: ActivityTable,
    retry: RetryPolicy,
    pricing: PricingTable,
    ledger: Arc<CostLedger>,
    quota: QuotaGate,
    alerts: Arc<AlertLog>,
    events: EventBus,
}

impl AgentInvoker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        backends: BackendRegistry,
        breakers: BreakerRegistry,
        activity: ActivityTable,
        retry: RetryPolicy,
        pricing: PricingTable,
        ledger: Arc<CostLedger>,
        quota: QuotaGate,
        alerts: Arc<AlertLog>,
        events: EventBus,
    ) -> Self {
        Self {
            backends,
            breakers,
            activity,
            retry,
            pricing,
            ledger,
            quota,
            alerts,
            events,
        }
    }

    pub fn breakers(&self) -> &BreakerRegistry {
        &self.breakers
    }

    pub fn activity(&self) -> &ActivityTable {
        &self.activity
    }

    pub async fn invoke(
        &self,
        agent: &AgentDefinition,
        request: &DispatchRequest,
        cancel: CancellationToken,
    ) -> switchyard_types::Result<InvokeOutcome> {
        let breaker = self.breakers.breaker(&agent.agent_id).await;
        let probe = match breaker.admit().await {
            Admission::Allowed { probe } => probe,
            Admission::Rejected { .. } => {
                return Err(DispatchError::CircuitOpen {
                    agent_id: agent.agent_id.clone(),
                });
            }
        };

        let _agent_permit = match self.quota.agent_permit(&agent.agent_id) {
            Ok(permit) => permit,
            Err(err) => {
                if probe {
                    breaker.release_probe().await;
                }
                return Err(err);
            }
        };

        let handle = Arc::new(
            self.activity
                .register(&agent.agent_id, &request.request_id)
                .await,
        );
        let heartbeat_cancel = handle.cancellation();

        // One token observed inside attempts; fed by both the caller's
        // cancellation and a heartbeat-declared timeout.
        let combined = CancellationToken::new();
        let forwarder = {
            let combined = combined.clone();
            let caller = cancel.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = caller.cancelled() => {}
                    _ = heartbeat_cancel.cancelled() => {}
                }
                combined.cancel();
            })
        };

        let backend = match self.backends.backend_for(&agent.model) {
            Ok(backend) => backend,
            Err(err) => {
                forwarder.abort();
                if probe {
                    breaker.release_probe().await;
                }
                handle.unregister().await;
                return Err(DispatchError::Internal(err.to_string()));
            }
        };

        let op = {
            let backend = backend.clone();
            let combined = combined.clone();
            let handle = handle.clone();
            let base_call = BackendCall {
                model: agent.model.clone(),
                prompt: request.prompt.clone(),
                conversation: request.conversation_history.clone(),
                timeout: std::time::Duration::ZERO,
            };
            move |attempt: switchyard_resilience::Attempt| {
                let backend = backend.clone();
                let combined = combined.clone();
                let handle = handle.clone();
                let mut call = base_call.clone();
                call.timeout = attempt.timeout;
                async move {
                    handle.touch().await;
                    let result = backend.invoke(&call, &combined).await;
                    if result.is_err() {
                        // Waiting out a backoff; the heartbeat should not
                        // count it as activity.
                        handle.idle().await;
                    }
                    result
                }
            }
        };

        let result = run_with_retry(&self.retry, &combined, classify_backend_error, op).await;
        forwarder.abort();

        let outcome = match result {
            Ok(reply) => {
                let cost = self
                    .pricing
                    .cost(&agent.model, reply.usage.input, reply.usage.output);
                let event = CostEvent {
                    timestamp: Utc::now(),
                    project_id: request.project_id.clone(),
                    agent_id: agent.agent_id.clone(),
                    model: agent.model.clone(),
                    tokens_in: reply.usage.input,
                    tokens_out: reply.usage.output,
                    cost_usd: cost,
                    request_id: request.request_id.clone(),
                };
                match self.ledger.append(&event) {
                    Ok(()) => {
                        breaker.on_success(probe).await;
                        self.events.publish(GatewayEvent::new(
                            "invocation.completed",
                            json!({
                                "agent_id": agent.agent_id,
                                "request_id": request.request_id,
                                "cost_usd": cost,
                            }),
                        ));
                        debug!(agent = %agent.agent_id, cost_usd = cost, "invocation completed");
                        Ok(InvokeOutcome {
                            agent_id: agent.agent_id.clone(),
                            model: agent.model.clone(),
                            content: reply.content,
                            usage: reply.usage,
                        })
                    }
                    Err(err) => {
                        // The call went through but no cost event exists, so
                        // this must surface as a failure, not a success.
                        error!(error = %err, "failed to record cost event");
                        breaker.on_success(probe).await;
                        Err(DispatchError::Internal(format!(
                            "cost recording failed: {}",
                            err
                        )))
                    }
                }
            }
            Err(RetryError::Cancelled) => {
                if probe {
                    breaker.release_probe().await;
                }
                Err(DispatchError::Cancelled)
            }
            Err(RetryError::Failed { error, attempts }) => {
                let tripped = breaker.on_failure(probe).await;
                if tripped {
                    let alert = Alert::new(
                        AlertLevel::Warning,
                        "circuit_breaker",
                        format!("circuit opened for agent {}", agent.agent_id),
                    )
                    .with_details(json!({
                        "agent_id": agent.agent_id,
                        "last_error": error.to_string(),
                        "attempts": attempts,
                    }));
                    if let Err(err) = self.alerts.emit(&alert) {
                        error!(error = %err, "failed to persist breaker alert");
                    }
                }
                self.events.publish(GatewayEvent::new(
                    "invocation.failed",
                    json!({
                        "agent_id": agent.agent_id,
                        "request_id": request.request_id,
                        "attempts": attempts,
                    }),
                ));
                Err(map_backend_error(error))
            }
        };

        handle.unregister().await;
        outcome
    }
}

/// The workflow engine's view of the invoker: one agent call per task
/// attempt, with cost attributed through the caller-supplied request id.
pub struct InvokerTaskCaller {
    invoker: Arc<AgentInvoker>,
    registry: AgentRegistry,
    project_id: String,
}

impl InvokerTaskCaller {
    pub fn new(invoker: Arc<AgentInvoker>, registry: AgentRegistry, project_id: String) -> Self {
        Self {
            invoker,
            registry,
            project_id,
        }
    }
}

#[async_trait]
impl TaskAgentCaller for InvokerTaskCaller {
    async fn call_agent(
        &self,
        agent_id: &str,
        prompt: &str,
        request_id: &str,
        cancel: &CancellationToken,
    ) -> switchyard_types::Result<AgentTaskOutput> {
        let agent = self
            .registry
            .get(agent_id)
            .ok_or_else(|| DispatchError::InvalidInput(format!("unknown agent `{}`", agent_id)))?
            .clone();
        let request = DispatchRequest {
            request_id: request_id.to_string(),
            project_id: self.project_id.clone(),
            session_key: format!("workflow:{}", request_id),
            prompt: prompt.to_string(),
            conversation_history: Vec::new(),
            agent_hint: Some(agent_id.to_string()),
            budget_estimate_tokens: None,
        };
        let outcome = self.invoker.invoke(&agent, &request, cancel.clone()).await?;
        Ok(AgentTaskOutput {
            agent_id: outcome.agent_id,
            content: outcome.content,
            tokens: outcome.usage,
        })
    }
}

/// Router-facing availability read over breaker state.
pub struct BreakerAvailability {
    breakers: BreakerRegistry,
}

impl BreakerAvailability {
    pub fn new(breakers: BreakerRegistry) -> Self {
        Self { breakers }
    }
}

#[async_trait]
impl switchyard_router::AvailabilityView for BreakerAvailability {
    async fn availability(&self, agent_id: &str) -> f64 {
        self.breakers.availability_score(agent_id).await
    }
}
