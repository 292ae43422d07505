use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub role: String,
    pub content: String,
}

/// Token estimate supplied with (or derived for) a request before invocation.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TokenEstimate {
    pub input: u64,
    pub output: u64,
}

/// Actual token consumption reported by a back-end.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input: u64,
    pub output: u64,
}

/// One inbound request, owned by the handling dispatcher flow until it exits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchRequest {
    pub request_id: String,
    pub project_id: String,
    pub session_key: String,
    pub prompt: String,
    #[serde(default)]
    pub conversation_history: Vec<ConversationTurn>,
    #[serde(default)]
    pub agent_hint: Option<String>,
    #[serde(default)]
    pub budget_estimate_tokens: Option<TokenEstimate>,
}

impl DispatchRequest {
    pub fn new(project_id: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            request_id: Uuid::new_v4().to_string(),
            project_id: project_id.into(),
            session_key: Uuid::new_v4().to_string(),
            prompt: prompt.into(),
            conversation_history: Vec::new(),
            agent_hint: None,
            budget_estimate_tokens: None,
        }
    }
}

/// Successful dispatch result returned to the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchReply {
    pub agent: String,
    pub model: String,
    pub response: String,
    pub tokens: TokenUsage,
    pub session_key: String,
}
