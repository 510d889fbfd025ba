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

const ANTHROPIC_ENDPOINT: &str = "https://api.anthropic.com";
const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Adapter for the Anthropic messages API
#[derive(Debug, Clone)]
pub struct AnthropicAdapter {
    api_key: String,
    endpoint: String,
    client: Client,
    health: Arc<HealthCell>,
    stream_idle_timeout: Duration,
    stream_fallback_timeout: Duration,
}

impl AnthropicAdapter {
    pub fn new(api_key: String, endpoint: Option<String>) -> Result<Self> {
        if api_key.is_empty() {
            return Err(anyhow!("Anthropic API key cannot be empty"));
        }

        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| anyhow!("Failed to create HTTP client: {}", e))?;

        Ok(Self {
            api_key,
            endpoint: endpoint
                .unwrap_or_else(|| ANTHROPIC_ENDPOINT.to_string())
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

    fn messages_request(&self, request: &ProviderRequest, stream: bool) -> MessagesRequest {
        MessagesRequest {
            model: request.model.model.clone(),
            max_tokens: request.model.max_tokens,
            // System prompt is a top-level field, not a message
            system: request.system_prompt.clone(),
            messages: vec![MessagesEntry {
                role: "user".to_string(),
                content: request.prompt.clone(),
            }],
            temperature: Some(request.model.temperature),
            stream,
        }
    }

    async fn post(&self, body: &MessagesRequest) -> Result<reqwest::Response, ProviderError> {
        let response = self
            .client
            .post(format!("{}/v1/messages", self.endpoint))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("Content-Type", "application/json")
            .json(body)
            .send()
            .await
            .map_err(|e| ProviderError::from_transport(ProviderKind::Claude, &e))?;

        if !response.status().is_success() {
            let err = error_from_response(ProviderKind::Claude, response).await;
            error!(provider = "claude", "API error: {}", err);
            return Err(err);
        }
        Ok(response)
    }

    async fn complete(&self, request: &ProviderRequest) -> Result<GenerateResponse, ProviderError> {
        let start_time = Instant::now();

        info!(
            provider = "claude",
            model = %request.model.model,
            "🚀 Sending request: {}",
            request.prompt.chars().take(50).collect::<String>()
        );

        let response = self.post(&self.messages_request(request, false)).await?;
        let body: MessagesResponse = response.json().await.map_err(|e| ProviderError::Unknown {
            provider: ProviderKind::Claude,
            message: format!("malformed response body: {}", e),
        })?;
        let elapsed = start_time.elapsed();

        let content: String = body
            .content
            .iter()
            .filter(|block| block.block_type == "text")
            .filter_map(|block| block.text.as_deref())
            .collect();

        let usage = match body.usage {
            Some(usage) => TokenUsage::new(usage.input_tokens, usage.output_tokens),
            None => TokenUsage::estimated(&request.prompt, &content),
        };

        info!(
            provider = "claude",
            duration_ms = elapsed.as_millis() as u64,
            "✅ Received response: {} tokens",
            usage.total_tokens
        );

        Ok(GenerateResponse {
            content,
            provider: ProviderKind::Claude,
            model: body.model.unwrap_or_else(|| request.model.model.clone()),
            usage,
            finish_reason: body.stop_reason.unwrap_or_else(|| "end_turn".to_string()),
            request_id: body.id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            processing_time: elapsed,
        })
    }
}

#[async_trait]
impl ProviderAdapter for AnthropicAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Claude
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

        let body = self.messages_request(request, true);
        let opened = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ProviderError::Cancelled),
            opened = self.post(&body) => opened,
        };
        let response = opened.map_err(|e| {
            self.health.observe(&e);
            e
        })?;
        debug!(provider = "claude", "Stream opened");

        let adapter = self.clone();
        let retry_request = request.clone();
        let retry_cancel = cancel.clone();
        Ok(native_stream(
            ProviderKind::Claude,
            response.bytes_stream().map(|read| read.map(|b| b.to_vec())).boxed(),
            parse_message_event,
            self.stream_idle_timeout,
            self.stream_fallback_timeout,
            cancel,
            Box::new(move || {
                async move { adapter.make_request(&retry_request, retry_cancel).await }.boxed()
            }),
        ))
    }

    async fn check_health(&self) -> bool {
        let probe = MessagesRequest {
            model: ProviderKind::Claude.default_model_config().model,
            max_tokens: 1,
            system: None,
            messages: vec![MessagesEntry {
                role: "user".to_string(),
                content: "test".to_string(),
            }],
            temperature: Some(0.0),
            stream: false,
        };

        let healthy = match tokio::time::timeout(Duration::from_secs(10), self.post(&probe)).await {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                error!(provider = "claude", "Health check failed: {}", e);
                false
            }
            Err(_) => {
                error!(provider = "claude", "Health check timed out");
                false
            }
        };
        self.health.mark(healthy);
        healthy
    }
}

/// Messages API streams typed events; only text deltas carry content
fn parse_message_event(payload: &str) -> SseEvent {
    let Ok(event) = serde_json::from_str::<StreamEvent>(payload) else {
        return SseEvent::Skip;
    };
    match event.event_type.as_str() {
        "content_block_delta" => event
            .delta
            .and_then(|delta| delta.text)
            .map(SseEvent::Delta)
            .unwrap_or(SseEvent::Skip),
        "message_stop" => SseEvent::Done,
        "error" => SseEvent::Error(
            event
                .error
                .and_then(|e| e.message)
                .unwrap_or_else(|| "unknown stream error".to_string()),
        ),
        _ => SseEvent::Skip,
    }
}

// Messages API request/response types
#[derive(Debug, Serialize)]
struct MessagesRequest {
    model: String,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    messages: Vec<MessagesEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    stream: bool,
}

#[derive(Debug, Serialize)]
struct MessagesEntry {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    id: Option<String>,
    model: Option<String>,
    content: Vec<ContentBlock>,
    usage: Option<MessagesUsage>,
    stop_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    block_type: String,
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MessagesUsage {
    input_tokens: u32,
    output_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct StreamEvent {
    #[serde(rename = "type")]
    event_type: String,
    delta: Option<StreamDelta>,
    error: Option<StreamError>,
}

#[derive(Debug, Deserialize)]
struct StreamDelta {
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamError {
    message: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::{GenerateRequest, StreamChunk};
    use futures::TryStreamExt;
    use mockito::{Matcher, Server};

    const MESSAGE: &str = r#"{
        "id": "msg_01",
        "type": "message",
        "model": "claude-3-haiku-20240307",
        "content": [{"type": "text", "text": "Bonjour"}],
        "stop_reason": "end_turn",
        "usage": {"input_tokens": 9, "output_tokens": 3}
    }"#;

    fn request(prompt: &str) -> ProviderRequest {
        GenerateRequest::new(prompt)
            .with_system_prompt("be brief")
            .for_provider(&ProviderKind::Claude.default_model_config())
    }

    #[tokio::test]
    async fn test_completion_uses_vendor_headers() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/messages")
            .match_header("x-api-key", "test-api-key")
            .match_header("anthropic-version", ANTHROPIC_VERSION)
            .match_body(Matcher::PartialJsonString(r#"{"system": "be brief", "stream": false}"#.into()))
            .with_status(200)
            .with_body(MESSAGE)
            .create_async()
            .await;

        let claude = AnthropicAdapter::new("test-api-key".into(), Some(server.url())).unwrap();
        let response = claude
            .make_request(&request("Say hello"), CancellationToken::new())
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(response.content, "Bonjour");
        assert_eq!(response.provider, ProviderKind::Claude);
        assert_eq!(response.usage.total_tokens, 12);
        assert_eq!(response.finish_reason, "end_turn");
    }

    #[tokio::test]
    async fn test_overloaded_is_transient() {
        let mut server = Server::new_async().await;
        server
            .mock("POST", "/v1/messages")
            .with_status(529)
            .with_body(r#"{"type":"error","error":{"type":"overloaded_error"}}"#)
            .create_async()
            .await;

        let claude = AnthropicAdapter::new("k".into(), Some(server.url())).unwrap();
        let err = claude
            .make_request(&request("hi"), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert!(matches!(err, ProviderError::Transient { .. }));
    }

    #[tokio::test]
    async fn test_forbidden_marks_unhealthy() {
        let mut server = Server::new_async().await;
        server
            .mock("POST", "/v1/messages")
            .with_status(403)
            .create_async()
            .await;

        let claude = AnthropicAdapter::new("k".into(), Some(server.url())).unwrap();
        let err = claude
            .make_request(&request("hi"), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Auth { .. }));
        assert!(!claude.health().healthy);
    }

    #[tokio::test]
    async fn test_temperature_bound_is_provider_specific() {
        let claude = AnthropicAdapter::new("k".into(), Some("http://127.0.0.1:9".into())).unwrap();
        let mut req = request("hi");
        req.model.temperature = 1.5;
        let err = claude.make_request(&req, CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, ProviderError::Validation(_)));
    }

    #[tokio::test]
    async fn test_native_streaming_events() {
        let mut server = Server::new_async().await;
        let sse = concat!(
            "event: message_start\n",
            "data: {\"type\":\"message_start\",\"message\":{}}\n\n",
            "event: content_block_delta\n",
            "data: {\"type\":\"content_block_delta\",\"delta\":{\"type\":\"text_delta\",\"text\":\"Hi \"}}\n\n",
            "event: content_block_delta\n",
            "data: {\"type\":\"content_block_delta\",\"delta\":{\"type\":\"text_delta\",\"text\":\"you\"}}\n\n",
            "event: message_stop\n",
            "data: {\"type\":\"message_stop\"}\n\n",
        );
        server
            .mock("POST", "/v1/messages")
            .with_status(200)
            .with_header("content-type", "text/event-stream")
            .with_body(sse)
            .create_async()
            .await;

        let claude = AnthropicAdapter::new("k".into(), Some(server.url())).unwrap();
        let chunks: Vec<StreamChunk> = claude
            .make_stream_request(&request("hi"), CancellationToken::new())
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();

        assert_eq!(
            chunks,
            vec![
                StreamChunk::partial("Hi ", "Hi "),
                StreamChunk::partial("Hi you", "you"),
                StreamChunk::finished("Hi you"),
            ]
        );
    }

    #[test]
    fn test_parse_error_event() {
        assert_eq!(
            parse_message_event(r#"{"type":"error","error":{"message":"Overloaded"}}"#),
            SseEvent::Error("Overloaded".into())
        );
        assert_eq!(parse_message_event(r#"{"type":"ping"}"#), SseEvent::Skip);
    }
}
