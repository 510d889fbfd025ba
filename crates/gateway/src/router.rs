//! Ordered attempt-and-fallback dispatch across registered providers.
//!
//! Each candidate from the routing policy gets up to `max_attempts` tries
//! with exponential backoff between them. Every try races the adapter call
//! against the per-attempt timeout and the caller's cancellation; the
//! attempt's child token is cancelled as soon as the try is lost, so a slow
//! upstream call never outlives its attempt. Candidates are strictly
//! sequential and a provider is never revisited within one dispatch.

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{ProviderKind, RoutingPolicy};
use crate::error::{GatewayError, GatewayResult, ProviderError};
use crate::providers::{ChunkStream, GenerateRequest, GenerateResponse};
use crate::registry::{HealthReport, ProviderRegistry};
use crate::settings::SettingsStore;

/// Per-provider attempt statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderStats {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub avg_latency_ms: f64,
    pub last_error: Option<String>,
}

pub struct RequestRouter {
    registry: Arc<ProviderRegistry>,
    settings: Option<Arc<dyn SettingsStore>>,
    static_policy: Option<RoutingPolicy>,
    cached: RwLock<Option<Arc<RoutingPolicy>>>,
    stats: Mutex<HashMap<ProviderKind, ProviderStats>>,
}

impl RequestRouter {
    pub fn new(registry: Arc<ProviderRegistry>) -> Self {
        info!(
            "🏗️ Request router initialised with {} providers",
            registry.len()
        );
        Self {
            registry,
            settings: None,
            static_policy: None,
            cached: RwLock::new(None),
            stats: Mutex::new(HashMap::new()),
        }
    }

    /// Consult a settings collaborator for the routing policy
    pub fn with_settings(mut self, settings: Arc<dyn SettingsStore>) -> Self {
        self.settings = Some(settings);
        self
    }

    /// Policy used when no settings collaborator is attached (or it fails)
    pub fn with_policy(mut self, policy: RoutingPolicy) -> Self {
        self.static_policy = Some(policy);
        self
    }

    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.registry
    }

    /// Routing policy in effect, fetched once and cached until `refresh`
    pub async fn current_policy(&self) -> GatewayResult<Arc<RoutingPolicy>> {
        if let Some(policy) = self.cached.read().clone() {
            return Ok(policy);
        }

        if let Some(settings) = &self.settings {
            match settings.get_routing_policy().await {
                Ok(policy) => {
                    policy.validate().map_err(GatewayError::Configuration)?;
                    let policy = Arc::new(policy);
                    *self.cached.write() = Some(policy.clone());
                    debug!("Routing policy cached from settings");
                    return Ok(policy);
                }
                // Not cached: the next dispatch asks the settings store again
                Err(e) => warn!("Settings unavailable, using built-in routing: {:#}", e),
            }
        }

        let policy = match &self.static_policy {
            Some(policy) => policy.clone(),
            None => RoutingPolicy::default_for(&self.registry.registered())
                .ok_or_else(|| GatewayError::Configuration("no providers configured".to_string()))?,
        };
        let policy = Arc::new(policy);
        if self.settings.is_none() {
            *self.cached.write() = Some(policy.clone());
        }
        Ok(policy)
    }

    /// Invalidate the cached policy; the next dispatch re-fetches it
    pub async fn refresh(&self) {
        *self.cached.write() = None;
        if let Some(settings) = &self.settings {
            settings.invalidate().await;
        }
        info!("🔄 Routing policy cache invalidated");
    }

    /// Route a request through `[primary] + fallbacks` until one succeeds
    pub async fn dispatch(&self, request: &GenerateRequest) -> GatewayResult<GenerateResponse> {
        let policy = self.current_policy().await?;
        let parent = request.cancel.clone().unwrap_or_default();
        let started = Instant::now();
        let mut last_error = None;
        let mut all_rejected = true;

        for provider in policy.candidates() {
            if parent.is_cancelled() {
                return Err(GatewayError::Cancelled);
            }
            match self.attempt(provider, request, &policy, &parent).await {
                Ok(response) => {
                    info!(
                        provider = %provider,
                        duration_ms = started.elapsed().as_millis() as u64,
                        "✅ Dispatch completed"
                    );
                    return Ok(response);
                }
                Err(ProviderError::Cancelled) => return Err(GatewayError::Cancelled),
                Err(e) => {
                    warn!(provider = %provider, "❌ Provider failed, moving to next candidate: {}", e);
                    all_rejected &= matches!(e, ProviderError::Validation(_));
                    last_error = Some(e);
                }
            }
        }

        Err(self.exhausted(last_error, all_rejected))
    }

    /// Open a chunk stream on the first candidate that accepts it
    pub async fn dispatch_stream(&self, request: &GenerateRequest) -> GatewayResult<(ProviderKind, ChunkStream)> {
        let policy = self.current_policy().await?;
        let parent = request.cancel.clone().unwrap_or_default();
        let mut last_error = None;
        let mut all_rejected = true;

        for provider in policy.candidates() {
            if parent.is_cancelled() {
                return Err(GatewayError::Cancelled);
            }
            match self.attempt_stream(provider, request, &policy, &parent).await {
                Ok(stream) => {
                    info!(provider = %provider, "✅ Stream established");
                    return Ok((provider, stream));
                }
                Err(ProviderError::Cancelled) => return Err(GatewayError::Cancelled),
                Err(e) => {
                    warn!(provider = %provider, "❌ Stream failed to open, moving to next candidate: {}", e);
                    all_rejected &= matches!(e, ProviderError::Validation(_));
                    last_error = Some(e);
                }
            }
        }

        Err(self.exhausted(last_error, all_rejected))
    }

    /// Try one provider with retries and backoff
    pub async fn attempt(
        &self,
        provider: ProviderKind,
        request: &GenerateRequest,
        policy: &RoutingPolicy,
        parent: &CancellationToken,
    ) -> Result<GenerateResponse, ProviderError> {
        let adapter = self
            .registry
            .get(provider)
            .ok_or(ProviderError::NotRegistered(provider))?;
        let bound = request.for_provider(&policy.model_config(provider));

        self.with_retries(provider, policy, parent, |token| adapter.make_request(&bound, token))
            .await
    }

    async fn attempt_stream(
        &self,
        provider: ProviderKind,
        request: &GenerateRequest,
        policy: &RoutingPolicy,
        parent: &CancellationToken,
    ) -> Result<ChunkStream, ProviderError> {
        let adapter = self
            .registry
            .get(provider)
            .ok_or(ProviderError::NotRegistered(provider))?;
        let bound = request.for_provider(&policy.model_config(provider));

        self.with_retries(provider, policy, parent, |token| adapter.make_stream_request(&bound, token))
            .await
    }

    async fn with_retries<T, F, Fut>(
        &self,
        provider: ProviderKind,
        policy: &RoutingPolicy,
        parent: &CancellationToken,
        mut call: F,
    ) -> Result<T, ProviderError>
    where
        F: FnMut(CancellationToken) -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let max_attempts = policy.retry.max_attempts.max(1);
        let timeout = policy.timeout_per_attempt;
        let mut attempt = 1;

        loop {
            let started = Instant::now();
            let token = parent.child_token();

            let outcome = tokio::select! {
                biased;
                _ = parent.cancelled() => Err(ProviderError::Cancelled),
                result = call(token.clone()) => result,
                _ = sleep(timeout) => Err(ProviderError::Timeout { provider, after: timeout }),
            };
            if outcome.is_err() {
                // The losing upstream call observes this and stops
                token.cancel();
            }
            self.record_attempt(provider, started.elapsed(), outcome.as_ref().err());

            let error = match outcome {
                Ok(value) => {
                    debug!(provider = %provider, attempt, "Attempt succeeded");
                    return Ok(value);
                }
                Err(e) => e,
            };

            if !error.is_retryable() || attempt >= max_attempts {
                if attempt >= max_attempts {
                    error!(provider = %provider, "💥 All {} attempts failed: {}", max_attempts, error);
                }
                return Err(error);
            }

            let mut delay = policy.retry.backoff_for(attempt);
            if let ProviderError::RateLimited {
                retry_after: Some(hint),
                ..
            } = &error
            {
                delay = delay.max(*hint).min(policy.retry.max_backoff);
            }
            warn!(
                provider = %provider,
                attempt,
                "Attempt failed: {}. Retrying in {:?}",
                error,
                delay
            );

            tokio::select! {
                biased;
                _ = parent.cancelled() => return Err(ProviderError::Cancelled),
                _ = sleep(delay) => {}
            }
            attempt += 1;
        }
    }

    /// Final error once every candidate failed. When each provider rejected
    /// the request itself, the caller gets a plain validation error.
    fn exhausted(&self, last_error: Option<ProviderError>, all_rejected: bool) -> GatewayError {
        match last_error {
            Some(ProviderError::Validation(message)) if all_rejected => {
                warn!("Request rejected by every provider: {}", message);
                GatewayError::Validation(message)
            }
            Some(e) => {
                error!("💥 All providers failed, last error: {}", e);
                GatewayError::all_failed(e)
            }
            None => GatewayError::Configuration("routing policy has no candidates".to_string()),
        }
    }

    fn record_attempt(&self, provider: ProviderKind, latency: Duration, error: Option<&ProviderError>) {
        let mut stats = self.stats.lock();
        let entry = stats.entry(provider).or_default();
        entry.total_requests += 1;
        match error {
            None => {
                entry.successful_requests += 1;
                let n = entry.successful_requests as f64;
                entry.avg_latency_ms = (entry.avg_latency_ms * (n - 1.0) + latency.as_millis() as f64) / n;
            }
            Some(e) => {
                entry.failed_requests += 1;
                entry.last_error = Some(e.to_string());
            }
        }
    }

    pub fn provider_stats(&self) -> HashMap<ProviderKind, ProviderStats> {
        self.stats.lock().clone()
    }

    pub async fn health_check(&self) -> HealthReport {
        self.registry.health_check().await
    }

    /// Human readable status report
    pub fn status_report(&self) -> String {
        let mut report = String::from("📊 Provider status:\n");
        let stats = self.stats.lock();
        for (kind, health) in self.registry.health_status().providers {
            let s = stats.get(&kind).cloned().unwrap_or_default();
            let success_rate = if s.total_requests > 0 {
                s.successful_requests as f64 / s.total_requests as f64 * 100.0
            } else {
                0.0
            };
            report.push_str(&format!(
                "  {} [{}]: {} requests, {:.1}% success, {:.0}ms avg\n",
                kind,
                if health.healthy { "healthy" } else { "unhealthy" },
                s.total_requests,
                success_rate,
                s.avg_latency_ms
            ));
        }
        report
    }
}
