use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::Stream;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::config::{ModelConfig, ModelOverride, ProviderKind};
use crate::error::ProviderError;

pub mod anthropic_provider;
pub mod openai_provider;
pub mod streaming;

pub use anthropic_provider::AnthropicAdapter;
pub use openai_provider::OpenAiAdapter;
pub use streaming::{resume_chunks, simulate_stream};

/// Inbound generation request, as handed to the gateway
#[derive(Debug, Clone, Default)]
pub struct GenerateRequest {
    pub prompt: String,
    pub system_prompt: Option<String>,
    pub config_override: Option<ModelOverride>,
    pub cancel: Option<CancellationToken>,
    pub stream: bool,
}

impl GenerateRequest {
    pub fn new(prompt: &str) -> Self {
        Self {
            prompt: prompt.to_string(),
            ..Default::default()
        }
    }

    pub fn with_system_prompt(mut self, system_prompt: &str) -> Self {
        self.system_prompt = Some(system_prompt.to_string());
        self
    }

    pub fn with_override(mut self, config_override: ModelOverride) -> Self {
        self.config_override = Some(config_override);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn streaming(mut self) -> Self {
        self.stream = true;
        self
    }

    /// Resolve against a provider's model defaults
    pub fn for_provider(&self, defaults: &ModelConfig) -> ProviderRequest {
        ProviderRequest {
            prompt: self.prompt.clone(),
            system_prompt: self.system_prompt.clone(),
            model: defaults.merged(self.config_override.as_ref()),
        }
    }
}

/// Request bound to one provider with its final model parameters
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderRequest {
    pub prompt: String,
    pub system_prompt: Option<String>,
    pub model: ModelConfig,
}

/// Token usage statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

impl TokenUsage {
    pub fn new(prompt_tokens: u32, completion_tokens: u32) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }

    /// Rough 4-chars-per-token estimate for vendors that omit usage
    pub fn estimated(prompt: &str, completion: &str) -> Self {
        Self::new(estimate_tokens(prompt), estimate_tokens(completion))
    }
}

pub fn estimate_tokens(text: &str) -> u32 {
    (text.chars().count() as u32).div_ceil(4)
}

/// Response object from providers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerateResponse {
    pub content: String,
    pub provider: ProviderKind,
    pub model: String,
    pub usage: TokenUsage,
    pub finish_reason: String,
    pub request_id: String,
    pub processing_time: Duration,
}

/// One element of an incremental response.
///
/// `content` is everything produced so far; `delta` is what this chunk
/// added. The last chunk of every stream has `done == true`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamChunk {
    pub content: String,
    pub delta: String,
    pub done: bool,
}

impl StreamChunk {
    pub fn partial(content: &str, delta: &str) -> Self {
        Self {
            content: content.to_string(),
            delta: delta.to_string(),
            done: false,
        }
    }

    pub fn finished(content: &str) -> Self {
        Self {
            content: content.to_string(),
            delta: String::new(),
            done: true,
        }
    }
}

pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<StreamChunk, ProviderError>> + Send>>;

/// Health snapshot owned by an adapter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterHealth {
    pub healthy: bool,
    pub last_checked: Option<DateTime<Utc>>,
}

impl Default for AdapterHealth {
    fn default() -> Self {
        Self {
            healthy: true,
            last_checked: None,
        }
    }
}

/// Interior-mutable health flag; only the owning adapter writes it
#[derive(Debug, Default)]
pub struct HealthCell {
    inner: RwLock<AdapterHealth>,
}

impl HealthCell {
    pub fn snapshot(&self) -> AdapterHealth {
        *self.inner.read()
    }

    pub fn mark(&self, healthy: bool) {
        let mut health = self.inner.write();
        health.healthy = healthy;
        health.last_checked = Some(Utc::now());
    }

    /// Record the side effects of a failed call
    pub fn observe(&self, error: &ProviderError) {
        if matches!(error, ProviderError::Auth { .. }) {
            self.mark(false);
        }
    }
}

/// Unified provider contract
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn kind(&self) -> ProviderKind;

    fn health(&self) -> AdapterHealth;

    /// Single-shot completion. Must validate before touching the network
    /// and abort the upstream call when `cancel` fires.
    async fn make_request(
        &self,
        request: &ProviderRequest,
        cancel: CancellationToken,
    ) -> Result<GenerateResponse, ProviderError>;

    /// Streaming completion (simulated for adapters without a native channel)
    async fn make_stream_request(
        &self,
        request: &ProviderRequest,
        cancel: CancellationToken,
    ) -> Result<ChunkStream, ProviderError> {
        let response = self.make_request(request, cancel.clone()).await?;
        Ok(simulate_stream(response.content, cancel))
    }

    /// Cheapest possible probe; never fails, updates `health()`
    async fn check_health(&self) -> bool;

    fn name(&self) -> String {
        self.kind().to_string()
    }
}

/// Validate request before execution
pub fn validate_request(request: &ProviderRequest) -> Result<(), ProviderError> {
    if request.prompt.trim().is_empty() {
        return Err(ProviderError::Validation("prompt must not be empty".to_string()));
    }
    request.model.validate().map_err(ProviderError::Validation)
}

/// Turn a non-success HTTP response into a classified error
pub(crate) async fn error_from_response(
    provider: ProviderKind,
    response: reqwest::Response,
) -> ProviderError {
    let status = response.status().as_u16();
    let retry_after = response
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs);
    let body = response.text().await.unwrap_or_default();
    ProviderError::from_status(provider, status, body, retry_after)
}
