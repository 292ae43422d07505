use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use switchyard_types::{ConversationTurn, TokenUsage};

/// What a back-end call failed as, mapped from the upstream shape exactly
/// once at this boundary. Downstream retry policy matches on this, never on
/// message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendErrorKind {
    /// Provider signalled rate limiting (HTTP 429).
    RateLimited,
    /// Provider 5xx.
    Server,
    /// The attempt deadline elapsed.
    Timeout,
    /// Transport-level failure before a response arrived.
    Connection,
    /// Provider 4xx other than auth/not-found.
    Validation,
    /// HTTP 401/403.
    Auth,
    /// HTTP 404.
    NotFound,
    /// Anything that did not fit the closed classes above.
    Unknown,
}

#[derive(Debug, Clone, Error)]
#[error("{kind:?}: {message}")]
pub struct BackendError {
    pub kind: BackendErrorKind,
    pub message: String,
    /// Provider-supplied Retry-After, when present on a 429.
    pub retry_after_secs: Option<u64>,
}

impl BackendError {
    pub fn new(kind: BackendErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retry_after_secs: None,
        }
    }

    fn from_status(status: u16, message: String, retry_after_secs: Option<u64>) -> Self {
        let kind = match status {
            429 => BackendErrorKind::RateLimited,
            401 | 403 => BackendErrorKind::Auth,
            404 => BackendErrorKind::NotFound,
            400..=499 => BackendErrorKind::Validation,
            500..=599 => BackendErrorKind::Server,
            _ => BackendErrorKind::Unknown,
        };
        Self {
            kind,
            message,
            retry_after_secs,
        }
    }
}

impl From<reqwest::Error> for BackendError {
    fn from(err: reqwest::Error) -> Self {
        let kind = if err.is_timeout() {
            BackendErrorKind::Timeout
        } else if err.is_connect() {
            BackendErrorKind::Connection
        } else {
            BackendErrorKind::Unknown
        };
        Self {
            kind,
            message: err.to_string(),
            retry_after_secs: None,
        }
    }
}

/// One outbound call to a model back-end.
#[derive(Debug, Clone)]
pub struct BackendCall {
    pub model: String,
    pub prompt: String,
    pub conversation: Vec<ConversationTurn>,
    /// Per-attempt deadline; the retry executor doubles this on a timeout
    /// retry.
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct BackendReply {
    pub content: String,
    pub usage: TokenUsage,
}

/// The opaque invocation contract. Back-ends are call targets only; the
/// control plane never looks inside them.
#[async_trait]
pub trait ModelBackend: Send + Sync {
    fn id(&self) -> &str;
    /// Model names this back-end serves; empty means "any".
    fn models(&self) -> Vec<String>;
    async fn invoke(
        &self,
        call: &BackendCall,
        cancel: &CancellationToken,
    ) -> Result<BackendReply, BackendError>;
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct BackendConfig {
    pub id: String,
    pub url: Option<String>,
    pub api_key: Option<String>,
    #[serde(default)]
    pub models: Vec<String>,
}

/// Holds the configured back-ends and resolves a model name to one of them.
#[derive(Clone)]
pub struct BackendRegistry {
    backends: Vec<Arc<dyn ModelBackend>>,
    by_model: HashMap<String, usize>,
}

impl BackendRegistry {
    pub fn new(configs: &[BackendConfig]) -> Self {
        let mut backends: Vec<Arc<dyn ModelBackend>> = Vec::new();
        for config in configs {
            backends.push(Arc::new(OpenAiCompatibleBackend::from_config(config)));
        }
        if backends.is_empty() {
            backends.push(Arc::new(StaticBackend::default()));
        }
        let mut by_model = HashMap::new();
        for (idx, backend) in backends.iter().enumerate() {
            for model in backend.models() {
                by_model.entry(model).or_insert(idx);
            }
        }
        Self { backends, by_model }
    }

    /// Registry with explicit back-end instances; used by tests and
    /// embedders that bring their own transport.
    pub fn with_backends(backends: Vec<Arc<dyn ModelBackend>>) -> Self {
        let mut by_model = HashMap::new();
        for (idx, backend) in backends.iter().enumerate() {
            for model in backend.models() {
                by_model.entry(model).or_insert(idx);
            }
        }
        Self { backends, by_model }
    }

    /// The back-end serving `model`, falling back to the first configured
    /// back-end when no explicit mapping exists.
    pub fn backend_for(&self, model: &str) -> Result<Arc<dyn ModelBackend>, BackendError> {
        if let Some(idx) = self.by_model.get(model) {
            return Ok(self.backends[*idx].clone());
        }
        self.backends.first().cloned().ok_or_else(|| {
            BackendError::new(BackendErrorKind::Unknown, "no back-end configured")
        })
    }

    pub fn backend_ids(&self) -> Vec<String> {
        self.backends.iter().map(|b| b.id().to_string()).collect()
    }
}

/// OpenAI-compatible chat-completions back-end over reqwest.
pub struct OpenAiCompatibleBackend {
    id: String,
    base_url: String,
    api_key: Option<String>,
    models: Vec<String>,
    client: Client,
}

impl OpenAiCompatibleBackend {
    pub fn from_config(config: &BackendConfig) -> Self {
        Self {
            id: config.id.clone(),
            base_url: normalize_base(
                config
                    .url
                    .as_deref()
                    .unwrap_or("http://127.0.0.1:11434/v1"),
            ),
            api_key: config
                .api_key
                .as_deref()
                .filter(|key| !is_placeholder_api_key(key))
                .map(str::to_string),
            models: config.models.clone(),
            client: Client::new(),
        }
    }
}

#[async_trait]
impl ModelBackend for OpenAiCompatibleBackend {
    fn id(&self) -> &str {
        &self.id
    }

    fn models(&self) -> Vec<String> {
        self.models.clone()
    }

    async fn invoke(
        &self,
        call: &BackendCall,
        cancel: &CancellationToken,
    ) -> Result<BackendReply, BackendError> {
        let url = format!("{}/chat/completions", self.base_url);
        let mut messages = call
            .conversation
            .iter()
            .map(|turn| json!({"role": turn.role, "content": turn.content}))
            .collect::<Vec<_>>();
        messages.push(json!({"role": "user", "content": call.prompt}));

        let mut req = self
            .client
            .post(url)
            .timeout(call.timeout)
            .json(&json!({
                "model": call.model,
                "messages": messages,
                "stream": false,
            }));
        if let Some(api_key) = &self.api_key {
            req = req.bearer_auth(api_key);
        }

        let response = tokio::select! {
            _ = cancel.cancelled() => {
                return Err(BackendError::new(
                    BackendErrorKind::Timeout,
                    "call cancelled before response",
                ));
            }
            result = req.send() => result?,
        };

        let status = response.status();
        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok());

        let value: serde_json::Value = response.json().await?;

        if !status.is_success() {
            let detail = extract_error_detail(&value)
                .unwrap_or_else(|| format!("back-end request failed with status {}", status));
            return Err(BackendError::from_status(
                status.as_u16(),
                detail,
                retry_after,
            ));
        }

        let content = extract_text(&value).ok_or_else(|| {
            BackendError::new(
                BackendErrorKind::Unknown,
                format!("back-end returned no completion content for model `{}`", call.model),
            )
        })?;

        Ok(BackendReply {
            content,
            usage: extract_usage(&value),
        })
    }
}

/// In-process back-end used when nothing is configured. Deterministic and
/// offline; token usage is approximated from text length.
#[derive(Default)]
pub struct StaticBackend;

#[async_trait]
impl ModelBackend for StaticBackend {
    fn id(&self) -> &str {
        "static"
    }

    fn models(&self) -> Vec<String> {
        Vec::new()
    }

    async fn invoke(
        &self,
        call: &BackendCall,
        _cancel: &CancellationToken,
    ) -> Result<BackendReply, BackendError> {
        let content = format!("[{}] {}", call.model, call.prompt);
        Ok(BackendReply {
            usage: TokenUsage {
                input: approx_tokens(&call.prompt),
                output: approx_tokens(&content),
            },
            content,
        })
    }
}

/// Rough prompt-length token heuristic shared with the dispatcher's
/// pre-admission estimate.
pub fn approx_tokens(text: &str) -> u64 {
    (text.len() as u64 / 4).max(1)
}

fn normalize_base(url: &str) -> String {
    url.trim_end_matches('/').to_string()
}

fn is_placeholder_api_key(value: &str) -> bool {
    let trimmed = value.trim();
    trimmed.is_empty()
        || trimmed.eq_ignore_ascii_case("x")
        || trimmed.eq_ignore_ascii_case("placeholder")
}

fn extract_error_detail(value: &serde_json::Value) -> Option<String> {
    value
        .get("error")
        .and_then(|e| e.get("message"))
        .and_then(|m| m.as_str())
        .map(str::to_string)
}

fn extract_text(value: &serde_json::Value) -> Option<String> {
    value
        .get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("message"))
        .and_then(|m| m.get("content"))
        .and_then(|t| t.as_str())
        .map(str::to_string)
}

fn extract_usage(value: &serde_json::Value) -> TokenUsage {
    let usage = value.get("usage");
    TokenUsage {
        input: usage
            .and_then(|u| u.get("prompt_tokens"))
            .and_then(|t| t.as_u64())
            .unwrap_or(0),
        output: usage
            .and_then(|u| u.get("completion_tokens"))
            .and_then(|t| t.as_u64())
            .unwrap_or(0),
    }
}
