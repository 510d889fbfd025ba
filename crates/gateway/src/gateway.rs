//! Gateway facade: quota admission, circuit breaking, routing, cost
//! reconciliation and usage telemetry for one inbound call.

use anyhow::Result;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::circuit_breaker::{CircuitBreaker, CircuitPermit};
use crate::config::{GatewayConfig, ProviderKind};
use crate::error::{ErrorKind, GatewayError, GatewayResult};
use crate::identity::{IdentityContext, IdentityKey, TrustTier};
use crate::pricing::PricingTable;
use crate::providers::{ChunkStream, GenerateRequest, GenerateResponse, StreamChunk, TokenUsage};
use crate::quota::{CeilingStatus, QuotaGrant, QuotaTracker};
use crate::registry::ProviderRegistry;
use crate::router::RequestRouter;
use crate::settings::TomlSettings;
use crate::usage::{TracingUsageRecorder, UsageRecord, UsageRecorder};

/// Quota and breaker state unseen for this long is dropped
pub const IDLE_EVICTION: Duration = Duration::from_secs(24 * 60 * 60);

/// Successful single-shot call
#[derive(Debug, Clone)]
pub struct Generated {
    pub response: GenerateResponse,
    pub quota: QuotaGrant,
    pub cost_cents: u64,
}

/// Successfully opened stream
pub struct GeneratedStream {
    pub provider: ProviderKind,
    pub quota: QuotaGrant,
    pub stream: ChunkStream,
}

pub struct AiGateway {
    router: Arc<RequestRouter>,
    quota: Arc<QuotaTracker>,
    breaker: Arc<CircuitBreaker>,
    pricing: Arc<PricingTable>,
    recorder: Arc<dyn UsageRecorder>,
}

impl AiGateway {
    pub fn new(router: RequestRouter, quota: QuotaTracker, breaker: CircuitBreaker) -> Self {
        Self {
            router: Arc::new(router),
            quota: Arc::new(quota),
            breaker: Arc::new(breaker),
            pricing: Arc::new(PricingTable::default()),
            recorder: Arc::new(TracingUsageRecorder),
        }
    }

    /// Wire every component from configuration
    pub fn from_config(config: &GatewayConfig) -> Result<Self> {
        let registry = ProviderRegistry::from_credentials(&config.providers, config.stream_idle_timeout)?;
        let mut router = RequestRouter::new(Arc::new(registry));
        if let Some(policy) = &config.routing {
            router = router.with_policy(policy.clone());
        }
        if let Some(path) = &config.settings_file {
            router = router.with_settings(Arc::new(TomlSettings::new(path)));
        }

        info!("🚀 AI gateway configured");
        Ok(Self::new(
            router,
            QuotaTracker::new(config.quota.clone()),
            CircuitBreaker::new(config.circuit.clone()),
        ))
    }

    pub fn with_pricing(mut self, pricing: PricingTable) -> Self {
        self.pricing = Arc::new(pricing);
        self
    }

    pub fn with_recorder(mut self, recorder: Arc<dyn UsageRecorder>) -> Self {
        self.recorder = recorder;
        self
    }

    pub fn router(&self) -> &RequestRouter {
        &self.router
    }

    pub fn quota(&self) -> &QuotaTracker {
        &self.quota
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Quota peek, breaker, then the quota charge. All of it happens before
    /// any provider is contacted; a call the breaker refuses costs no quota.
    async fn admit(
        &self,
        key: &IdentityKey,
        tier: TrustTier,
        operation: &str,
        request: &GenerateRequest,
    ) -> GatewayResult<(QuotaGrant, CircuitPermit)> {
        let policy = self.router.current_policy().await?;
        let primary = request.for_provider(&policy.model_config(policy.primary));
        let estimate = self.pricing.estimate_cents(&primary.model, &request.prompt);

        self.quota
            .check(key, tier, true, estimate)
            .map_err(GatewayError::QuotaExceeded)?;
        let permit = self
            .breaker
            .admit(key, operation)
            .map_err(GatewayError::CircuitOpen)?;
        // The window may have filled up since the peek
        match self.quota.admit(key, tier, true, estimate) {
            Ok(grant) => Ok((grant, permit)),
            Err(denial) => {
                self.breaker.release_trial(key, operation, permit);
                Err(GatewayError::QuotaExceeded(denial))
            }
        }
    }

    /// Feed a failed call to the breaker, or hand back its trial when the
    /// failure is not the downstream's fault
    fn settle_failure(&self, key: &IdentityKey, operation: &str, permit: CircuitPermit, error: &GatewayError) {
        if error.counts_toward_circuit() {
            self.breaker.record_failure(key, operation);
        } else {
            self.breaker.release_trial(key, operation, permit);
        }
    }

    /// Full control flow for one generation call
    pub async fn generate(
        &self,
        context: &IdentityContext,
        client_ip: IpAddr,
        operation: &str,
        request: GenerateRequest,
    ) -> GatewayResult<Generated> {
        let key = IdentityKey::resolve(context, client_ip);
        let (grant, permit) = self.admit(&key, context.trust_tier, operation, &request).await?;

        let started = Instant::now();
        let result = self.router.dispatch(&request).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok(response) => {
                let cost_cents = self.price(&request, &response).await;
                self.quota.reconcile(&key, cost_cents);
                self.breaker.record_success(&key, operation);
                self.recorder.record(UsageRecord {
                    identity: key,
                    operation: operation.to_string(),
                    provider: Some(response.provider),
                    model: Some(response.model.clone()),
                    usage: response.usage,
                    cost_cents,
                    duration_ms,
                    success: true,
                    error_kind: None,
                });
                Ok(Generated {
                    response,
                    quota: grant,
                    cost_cents,
                })
            }
            Err(e) => {
                self.settle_failure(&key, operation, permit, &e);
                self.recorder.record(UsageRecord {
                    identity: key,
                    operation: operation.to_string(),
                    provider: None,
                    model: None,
                    usage: TokenUsage::default(),
                    cost_cents: 0,
                    duration_ms,
                    success: false,
                    error_kind: Some(e.kind()),
                });
                Err(e)
            }
        }
    }

    /// Streaming variant. Cost and breaker outcome are settled when the
    /// stream finishes, fails, or is dropped.
    pub async fn generate_stream(
        &self,
        context: &IdentityContext,
        client_ip: IpAddr,
        operation: &str,
        request: GenerateRequest,
    ) -> GatewayResult<GeneratedStream> {
        let key = IdentityKey::resolve(context, client_ip);
        let (grant, permit) = self.admit(&key, context.trust_tier, operation, &request).await?;

        let started = Instant::now();
        let (provider, stream) = match self.router.dispatch_stream(&request).await {
            Ok(opened) => opened,
            Err(e) => {
                self.settle_failure(&key, operation, permit, &e);
                self.recorder.record(UsageRecord {
                    identity: key,
                    operation: operation.to_string(),
                    provider: None,
                    model: None,
                    usage: TokenUsage::default(),
                    cost_cents: 0,
                    duration_ms: started.elapsed().as_millis() as u64,
                    success: false,
                    error_kind: Some(e.kind()),
                });
                return Err(e);
            }
        };

        let policy = self.router.current_policy().await?;
        let model = request.for_provider(&policy.model_config(provider)).model.model;
        let mut settlement = StreamSettlement {
            key,
            operation: operation.to_string(),
            provider,
            model,
            prompt: request.prompt.clone(),
            started,
            permit,
            quota: self.quota.clone(),
            breaker: self.breaker.clone(),
            pricing: self.pricing.clone(),
            recorder: self.recorder.clone(),
            settled: false,
        };

        let stream = stream.map(move |item| {
            match &item {
                Ok(chunk) if chunk.done => settlement.finish(chunk),
                Err(e) => settlement.fail(e.kind(), e.counts_toward_circuit()),
                Ok(_) => {}
            }
            item
        });

        Ok(GeneratedStream {
            provider,
            quota: grant,
            stream: Box::pin(stream),
        })
    }

    async fn price(&self, request: &GenerateRequest, response: &GenerateResponse) -> u64 {
        // Price by the configured model; vendors often echo a dated variant
        let model = match self.router.current_policy().await {
            Ok(policy) => request.for_provider(&policy.model_config(response.provider)).model.model,
            Err(_) => response.model.clone(),
        };
        self.pricing.cost_cents(response.provider, &model, &response.usage)
    }

    /// Periodically drop quota windows and breakers idle for 24h
    pub fn spawn_eviction_task(&self, interval: Duration) -> JoinHandle<()> {
        let quota = self.quota.clone();
        let breaker = self.breaker.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let windows = quota.evict_idle(IDLE_EVICTION);
                let circuits = breaker.evict_idle(IDLE_EVICTION);
                if windows + circuits > 0 {
                    info!("🧹 Evicted {} quota windows and {} circuit states", windows, circuits);
                }
            }
        })
    }
}

struct StreamSettlement {
    key: IdentityKey,
    operation: String,
    provider: ProviderKind,
    model: String,
    prompt: String,
    started: Instant,
    permit: CircuitPermit,
    quota: Arc<QuotaTracker>,
    breaker: Arc<CircuitBreaker>,
    pricing: Arc<PricingTable>,
    recorder: Arc<dyn UsageRecorder>,
    settled: bool,
}

impl StreamSettlement {
    fn finish(&mut self, last: &StreamChunk) {
        if std::mem::replace(&mut self.settled, true) {
            return;
        }
        // Streams carry no vendor usage block; estimate from the text
        let usage = TokenUsage::estimated(&self.prompt, &last.content);
        let cost_cents = self.pricing.cost_cents(self.provider, &self.model, &usage);
        self.quota.reconcile(&self.key, cost_cents);
        self.breaker.record_success(&self.key, &self.operation);
        self.emit(usage, cost_cents, None);
    }

    fn fail(&mut self, kind: ErrorKind, counts: bool) {
        if std::mem::replace(&mut self.settled, true) {
            return;
        }
        if counts {
            self.breaker.record_failure(&self.key, &self.operation);
        } else {
            self.breaker.release_trial(&self.key, &self.operation, self.permit);
        }
        self.emit(TokenUsage::default(), 0, Some(kind));
    }

    fn emit(&self, usage: TokenUsage, cost_cents: u64, error_kind: Option<ErrorKind>) {
        self.recorder.record(UsageRecord {
            identity: self.key.clone(),
            operation: self.operation.clone(),
            provider: Some(self.provider),
            model: Some(self.model.clone()),
            usage,
            cost_cents,
            duration_ms: self.started.elapsed().as_millis() as u64,
            success: error_kind.is_none(),
            error_kind,
        });
    }
}

impl Drop for StreamSettlement {
    fn drop(&mut self) {
        if !self.settled {
            debug!(identity = %self.key, "Stream dropped before completion");
            self.fail(ErrorKind::Cancelled, false);
        }
    }
}

/// Ceiling block of an admission error payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CeilingBody {
    pub limit: u64,
    pub remaining: u64,
    pub reset_at: DateTime<Utc>,
}

impl From<&CeilingStatus> for CeilingBody {
    fn from(status: &CeilingStatus) -> Self {
        Self {
            limit: status.limit,
            remaining: status.remaining,
            reset_at: status.reset_at,
        }
    }
}

/// Structured payload for admission denials, rendered by the HTTP layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionErrorBody {
    pub error: String,
    pub message: String,
    pub retry_after_seconds: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ceiling: Option<CeilingBody>,
}

impl AdmissionErrorBody {
    /// Status code and payload for quota (429) and circuit (503) denials;
    /// `None` for every other error
    pub fn from_error(error: &GatewayError) -> Option<(u16, Self)> {
        match error {
            GatewayError::QuotaExceeded(denial) => Some((
                429,
                Self {
                    error: "quota_exceeded".to_string(),
                    message: denial.to_string(),
                    retry_after_seconds: ceil_secs(denial.retry_after),
                    ceiling: Some(CeilingBody::from(&denial.ceiling)),
                },
            )),
            GatewayError::CircuitOpen(denial) => Some((
                503,
                Self {
                    error: "circuit_open".to_string(),
                    message: denial.to_string(),
                    retry_after_seconds: ceil_secs(denial.retry_after),
                    ceiling: None,
                },
            )),
            _ => None,
        }
    }
}

fn ceil_secs(duration: Duration) -> u64 {
    duration.as_secs() + u64::from(duration.subsec_nanos() > 0)
}

/// `X-RateLimit-*` headers for the request ceiling and `X-AI-RateLimit-*`
/// for the AI-call ceiling
pub fn rate_limit_headers(grant: &QuotaGrant) -> Vec<(&'static str, String)> {
    let mut headers = ceiling_headers(
        ["X-RateLimit-Limit", "X-RateLimit-Remaining", "X-RateLimit-Reset"],
        &grant.requests,
    );
    if let Some(ai) = &grant.ai_calls {
        headers.extend(ceiling_headers(
            ["X-AI-RateLimit-Limit", "X-AI-RateLimit-Remaining", "X-AI-RateLimit-Reset"],
            ai,
        ));
    }
    headers
}

/// Headers accompanying a denial: the exhausted ceiling plus `Retry-After`
pub fn denial_headers(error: &GatewayError) -> Vec<(&'static str, String)> {
    match error {
        GatewayError::QuotaExceeded(denial) => {
            let mut headers = ceiling_headers(
                ["X-RateLimit-Limit", "X-RateLimit-Remaining", "X-RateLimit-Reset"],
                &denial.ceiling,
            );
            headers.push(("Retry-After", ceil_secs(denial.retry_after).to_string()));
            headers
        }
        GatewayError::CircuitOpen(denial) => {
            vec![("Retry-After", ceil_secs(denial.retry_after).to_string())]
        }
        _ => Vec::new(),
    }
}

fn ceiling_headers(names: [&'static str; 3], status: &CeilingStatus) -> Vec<(&'static str, String)> {
    vec![
        (names[0], status.limit.to_string()),
        (names[1], status.remaining.to_string()),
        (names[2], status.reset_at.timestamp().to_string()),
    ]
}
