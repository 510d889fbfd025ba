use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures::{FutureExt, StreamExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::streaming::{native_stream, SseEvent};
use super::{
    error_from_response, validate_request, AdapterHealth, ChunkStream, GenerateResponse, HealthCell,
    ProviderAdapter, ProviderRequest, TokenUsage,
};
use crate::config::{ProviderKind, RoutingPolicy};
use crate::error::ProviderError;

const OPENAI_ENDPOINT: &str = "https://api.openai.com/v1";
const GROQ_ENDPOINT: &str = "https://api.groq.com/openai/v1";
const HEALTH_PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Adapter for OpenAI-compatible chat completion APIs (OpenAI, Groq)
#[derive(Debug, Clone)]
pub struct OpenAiAdapter {
    kind: ProviderKind,
    api_key: String,
    endpoint: String,
    client: Client,
    health: Arc<HealthCell>,
    stream_idle_timeout: Duration,
    stream_fallback_timeout: Duration,
}

impl OpenAiAdapter {
    pub fn new(kind: ProviderKind, api_key: String, endpoint: Option<String>) -> Result<Self> {
        let default_endpoint = match kind {
            ProviderKind::OpenAi => OPENAI_ENDPOINT,
            ProviderKind::Groq => GROQ_ENDPOINT,
            ProviderKind::Claude => {
                return Err(anyhow!("{} does not speak the chat completions protocol", kind))
            }
        };
        if api_key.is_empty() {
            return Err(anyhow!("{} API key cannot be empty", kind));
        }

        // No total timeout: the router bounds each attempt, streams are
        // bounded per read and their fallback request separately.
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| anyhow!("Failed to create HTTP client: {}", e))?;

        Ok(Self {
            kind,
            api_key,
            endpoint: endpoint
                .unwrap_or_else(|| default_endpoint.to_string())
                .trim_end_matches('/')
                .to_string(),
            client,
            health: Arc::new(HealthCell::default()),
            stream_idle_timeout: Duration::from_secs(30),
            stream_fallback_timeout: RoutingPolicy::DEFAULT_TIMEOUT,
        })
    }

    pub fn with_stream_idle_timeout(mut self, timeout: Duration) -> Self {
        self.stream_idle_timeout = timeout;
        self
    }

    /// Bound on the blocking request issued when a native stream breaks
    pub fn with_stream_fallback_timeout(mut self, timeout: Duration) -> Self {
        self.stream_fallback_timeout = timeout;
        self
    }

    fn chat_request(&self, request: &ProviderRequest, stream: bool) -> ChatRequest {
        let mut messages = Vec::new();
        if let Some(system_prompt) = &request.system_prompt {
            messages.push(ChatMessage {
                role: "system".to_string(),
                content: system_prompt.clone(),
            });
        }
        messages.push(ChatMessage {
            role: "user".to_string(),
            content: request.prompt.clone(),
        });

        ChatRequest {
            model: request.model.model.clone(),
            messages,
            max_tokens: Some(request.model.max_tokens),
            temperature: Some(request.model.temperature),
            stream: Some(stream),
        }
    }

    async fn post(&self, body: &ChatRequest) -> Result<reqwest::Response, ProviderError> {
        let response = self
            .client
            .post(format!("{}/chat/completions", self.endpoint))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(body)
            .send()
            .await
            .map_err(|e| ProviderError::from_transport(self.kind, &e))?;

        if !response.status().is_success() {
            let err = error_from_response(self.kind, response).await;
            error!(provider = %self.kind, "API error: {}", err);
            return Err(err);
        }
        Ok(response)
    }

    async fn complete(&self, request: &ProviderRequest) -> Result<GenerateResponse, ProviderError> {
        let start_time = Instant::now();

        info!(
            provider = %self.kind,
            model = %request.model.model,
            "🚀 Sending request: {}",
            request.prompt.chars().take(50).collect::<String>()
        );

        let response = self.post(&self.chat_request(request, false)).await?;
        let body: ChatResponse = response.json().await.map_err(|e| ProviderError::Unknown {
            provider: self.kind,
            message: format!("malformed response body: {}", e),
        })?;
        let elapsed = start_time.elapsed();

        let choice = body.choices.into_iter().next().ok_or_else(|| ProviderError::Unknown {
            provider: self.kind,
            message: "response contained no choices".to_string(),
        })?;
        let content = choice.message.content.unwrap_or_default();

        let usage = match body.usage {
            Some(usage) => TokenUsage::new(usage.prompt_tokens, usage.completion_tokens),
            // Fallback estimation if usage not provided
            None => TokenUsage::estimated(&request.prompt, &content),
        };

        info!(
            provider = %self.kind,
            duration_ms = elapsed.as_millis() as u64,
            "✅ Received response: {} tokens",
            usage.total_tokens
        );

        Ok(GenerateResponse {
            content,
            provider: self.kind,
            model: body.model.unwrap_or_else(|| request.model.model.clone()),
            usage,
            finish_reason: choice.finish_reason.unwrap_or_else(|| "stop".to_string()),
            request_id: body.id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            processing_time: elapsed,
        })
    }
}

#[async_trait]
impl ProviderAdapter for OpenAiAdapter {
    fn kind(&self) -> ProviderKind {
        self.kind
    }

    fn health(&self) -> AdapterHealth {
        self.health.snapshot()
    }

    async fn make_request(
        &self,
        request: &ProviderRequest,
        cancel: CancellationToken,
    ) -> Result<GenerateResponse, ProviderError> {
        validate_request(request)?;

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ProviderError::Cancelled),
            result = self.complete(request) => result,
        };
        if let Err(e) = &result {
            self.health.observe(e);
        }
        result
    }

    async fn make_stream_request(
        &self,
        request: &ProviderRequest,
        cancel: CancellationToken,
    ) -> Result<ChunkStream, ProviderError> {
        validate_request(request)?;

        let body = self.chat_request(request, true);
        let opened = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ProviderError::Cancelled),
            opened = self.post(&body) => opened,
        };
        let response = match opened {
            Ok(response) => response,
            Err(e) => {
                self.health.observe(&e);
                return Err(e);
            }
        };
        debug!(provider = %self.kind, "Stream opened");

        let adapter = self.clone();
        let retry_request = request.clone();
        let retry_cancel = cancel.clone();
        Ok(native_stream(
            self.kind,
            response.bytes_stream().map(|read| read.map(|b| b.to_vec())).boxed(),
            parse_chat_event,
            self.stream_idle_timeout,
            self.stream_fallback_timeout,
            cancel,
            Box::new(move || {
                async move { adapter.make_request(&retry_request, retry_cancel).await }.boxed()
            }),
        ))
    }

    async fn check_health(&self) -> bool {
        let start_time = Instant::now();
        let probe = ChatRequest {
            model: self.kind.default_model_config().model,
            messages: vec![ChatMessage {
                role: "user".to_string(),
                content: "test".to_string(),
            }],
            max_tokens: Some(1),
            temperature: Some(0.0),
            stream: Some(false),
        };

        let healthy = match tokio::time::timeout(HEALTH_PROBE_TIMEOUT, self.post(&probe)).await {
            Ok(Ok(_)) => {
                debug!(provider = %self.kind, "Health check: HEALTHY ({:?})", start_time.elapsed());
                true
            }
            Ok(Err(e)) => {
                error!(provider = %self.kind, "Health check failed: {}", e);
                false
            }
            Err(_) => {
                error!(provider = %self.kind, "Health check timed out after {:?}", HEALTH_PROBE_TIMEOUT);
                false
            }
        };
        self.health.mark(healthy);
        healthy
    }
}

fn parse_chat_event(payload: &str) -> SseEvent {
    if payload.trim() == "[DONE]" {
        return SseEvent::Done;
    }
    match serde_json::from_str::<ChatStreamEvent>(payload) {
        Ok(event) => {
            if let Some(err) = event.error {
                return SseEvent::Error(err.message.unwrap_or_else(|| "unknown stream error".into()));
            }
            event
                .choices
                .into_iter()
                .next()
                .and_then(|choice| choice.delta.content)
                .map(SseEvent::Delta)
                .unwrap_or(SseEvent::Skip)
        }
        Err(_) => SseEvent::Skip,
    }
}

// Chat completions request/response types
#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream: Option<bool>,
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    id: Option<String>,
    model: Option<String>,
    choices: Vec<ChatChoice>,
    usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatResponseMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct ChatStreamEvent {
    #[serde(default)]
    choices: Vec<ChatStreamChoice>,
    error: Option<ChatStreamError>,
}

#[derive(Debug, Deserialize)]
struct ChatStreamChoice {
    delta: ChatDelta,
}

#[derive(Debug, Deserialize)]
struct ChatDelta {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatStreamError {
    message: Option<String>,
}
