//! One request's lifecycle, end to end.
//!
//! Admission order is fixed: quota gate, then budget gate against a token
//! estimate, then routing, then invocation. A request rejected by a gate
//! never reaches the router or a backend. Fallback invocation happens only
//! for circuit-open and no-agent conditions; budget and auth failures
//! propagate as-is. After the call returns, spend reconciliation runs in
//! the background and can halt the project.

use std::sync::Arc;

use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use switchyard_gates::{BudgetGate, QuotaGate};
use switchyard_providers::approx_tokens;
use switchyard_router::Router;
use switchyard_types::{
    AgentDefinition, DispatchError, DispatchReply, DispatchRequest, RoutingDecision, TokenEstimate,
};

use crate::config::EstimateConfig;
use crate::event_bus::{EventBus, GatewayEvent};
use crate::invoker::AgentInvoker;
use crate::registry::AgentRegistry;

pub struct Dispatcher {
    registry: AgentRegistry,
    router: Arc<Router>,
    quota: QuotaGate,
    budget: Arc<BudgetGate>,
    invoker: Arc<AgentInvoker>,
    estimate: EstimateConfig,
    events: EventBus,
}

impl Dispatcher {
    pub fn new(
        registry: AgentRegistry,
        router: Arc<Router>,
        quota: QuotaGate,
        budget: Arc<BudgetGate>,
        invoker: Arc<AgentInvoker>,
        estimate: EstimateConfig,
        events: EventBus,
    ) -> Self {
        Self {
            registry,
            router,
            quota,
            budget,
            invoker,
            estimate,
            events,
        }
    }

    pub fn quota(&self) -> &QuotaGate {
        &self.quota
    }

    pub fn budget(&self) -> &Arc<BudgetGate> {
        &self.budget
    }

    /// Pure routing decision, no gates, no invocation.
    pub async fn route_only(
        &self,
        query: &str,
        session_key: &str,
        history_turns: usize,
    ) -> switchyard_types::Result<RoutingDecision> {
        let agents = self.registry.snapshot();
        self.router
            .route(query, session_key, history_turns, &agents)
            .await
    }

    fn estimate_tokens(&self, request: &DispatchRequest) -> TokenEstimate {
        if let Some(estimate) = request.budget_estimate_tokens {
            return estimate;
        }
        let history: u64 = request
            .conversation_history
            .iter()
            .map(|turn| approx_tokens(&turn.content))
            .sum();
        TokenEstimate {
            input: approx_tokens(&request.prompt) + history,
            output: self.estimate.default_output_tokens,
        }
    }

    /// The model the budget estimate is priced against. Routing has not run
    /// yet, so only an explicit agent hint can narrow this; otherwise the
    /// safe-medium fallback price applies.
    fn estimate_model(&self, request: &DispatchRequest) -> String {
        request
            .agent_hint
            .as_deref()
            .and_then(|hint| self.registry.get(hint))
            .map(|agent| agent.model.clone())
            .unwrap_or_default()
    }

    pub async fn dispatch(
        &self,
        request: DispatchRequest,
        cancel: CancellationToken,
    ) -> switchyard_types::Result<DispatchReply> {
        if request.prompt.trim().is_empty() {
            return Err(DispatchError::InvalidInput("empty prompt".to_string()));
        }

        // Quota first: a rejected request must hold no capacity at all.
        let _permit = self.quota.admit(&request.project_id)?;

        let estimate = self.estimate_tokens(&request);
        let decision = self
            .budget
            .check(&request.project_id, &self.estimate_model(&request), estimate)
            .await?;
        if let Some(reject) = decision.into_error() {
            self.events.publish(GatewayEvent::new(
                "request.rejected",
                json!({
                    "request_id": request.request_id,
                    "project_id": request.project_id,
                    "kind": reject.kind(),
                }),
            ));
            return Err(reject);
        }

        let (chosen, fallback_id) = self.select_agents(&request).await?;
        debug!(
            request = %request.request_id,
            agent = %chosen.agent_id,
            "request routed"
        );

        let result = self
            .invoker
            .invoke(&chosen, &request, cancel.clone())
            .await;

        let result = match result {
            Err(err) if err.allows_fallback() => match &fallback_id {
                Some(fallback_id) => match self.registry.get(fallback_id) {
                    Some(fallback) => {
                        warn!(
                            request = %request.request_id,
                            primary = %chosen.agent_id,
                            fallback = %fallback.agent_id,
                            "primary agent unavailable, invoking fallback"
                        );
                        self.invoker.invoke(fallback, &request, cancel).await
                    }
                    None => Err(err),
                },
                None => Err(err),
            },
            other => other,
        };

        // Post-call reconciliation closes the non-linearizable admission
        // window by halting the project when actual spend crossed the
        // ceiling.
        let budget = self.budget.clone();
        let project_id = request.project_id.clone();
        tokio::spawn(async move {
            if let Err(err) = budget.reconcile(&project_id).await {
                warn!(error = %err, project = %project_id, "budget reconciliation failed");
            }
        });

        let outcome = result?;
        Ok(DispatchReply {
            agent: outcome.agent_id,
            model: outcome.model,
            response: outcome.content,
            tokens: outcome.usage,
            session_key: request.session_key,
        })
    }

    /// Resolve the target agent and its fallback: either the caller's hint
    /// (with its configured backups) or a fresh routing decision.
    async fn select_agents(
        &self,
        request: &DispatchRequest,
    ) -> switchyard_types::Result<(AgentDefinition, Option<String>)> {
        if let Some(hint) = &request.agent_hint {
            let agent = self
                .registry
                .get(hint)
                .ok_or_else(|| {
                    DispatchError::InvalidInput(format!("unknown agent `{}`", hint))
                })?
                .clone();
            let fallback = agent.backup_agent_ids.first().cloned();
            return Ok((agent, fallback));
        }

        let agents = self.registry.snapshot();
        let decision = self
            .router
            .route(
                &request.prompt,
                &request.session_key,
                request.conversation_history.len(),
                &agents,
            )
            .await?;
        let chosen = self
            .registry
            .get(&decision.chosen_agent_id)
            .ok_or_else(|| {
                DispatchError::Internal(format!(
                    "router chose unknown agent `{}`",
                    decision.chosen_agent_id
                ))
            })?
            .clone();
        Ok((chosen, decision.fallback_agent_id))
    }
}
