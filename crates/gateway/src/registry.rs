//! Provider Registry - the set of configured adapters and their health

use anyhow::Result;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::{ProviderCredentials, ProviderKind};
use crate::providers::{AdapterHealth, AnthropicAdapter, OpenAiAdapter, ProviderAdapter};

/// Aggregate health across registered adapters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    /// All healthy, some healthy, or none (an empty registry is unhealthy)
    pub fn aggregate(flags: impl IntoIterator<Item = bool>) -> Self {
        let (mut total, mut healthy) = (0usize, 0usize);
        for flag in flags {
            total += 1;
            if flag {
                healthy += 1;
            }
        }
        match healthy {
            0 => HealthStatus::Unhealthy,
            h if h == total => HealthStatus::Healthy,
            _ => HealthStatus::Degraded,
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Unhealthy => "unhealthy",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub providers: Vec<(ProviderKind, AdapterHealth)>,
}

/// Registered adapters, in registration order
#[derive(Default, Clone)]
pub struct ProviderRegistry {
    adapters: Vec<Arc<dyn ProviderAdapter>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build adapters for every provider that has credentials. Providers
    /// without a key are skipped, never an error.
    pub fn from_credentials(credentials: &[ProviderCredentials], stream_idle_timeout: Duration) -> Result<Self> {
        let mut registry = Self::new();
        for creds in credentials {
            if creds.api_key.trim().is_empty() {
                warn!("No API key for {}, adapter disabled", creds.kind);
                continue;
            }
            let adapter: Arc<dyn ProviderAdapter> = match creds.kind {
                ProviderKind::OpenAi | ProviderKind::Groq => Arc::new(
                    OpenAiAdapter::new(creds.kind, creds.api_key.clone(), creds.base_url.clone())?
                        .with_stream_idle_timeout(stream_idle_timeout),
                ),
                ProviderKind::Claude => Arc::new(
                    AnthropicAdapter::new(creds.api_key.clone(), creds.base_url.clone())?
                        .with_stream_idle_timeout(stream_idle_timeout),
                ),
            };
            registry.register(adapter);
        }
        info!("📋 Provider registry ready: {:?}", registry.registered());
        Ok(registry)
    }

    /// Register an adapter; a second adapter for the same provider replaces
    /// the first but keeps its position.
    pub fn register(&mut self, adapter: Arc<dyn ProviderAdapter>) {
        let kind = adapter.kind();
        if let Some(slot) = self.adapters.iter_mut().find(|a| a.kind() == kind) {
            debug!("Replacing adapter for {}", kind);
            *slot = adapter;
        } else {
            debug!("Registering adapter for {}", kind);
            self.adapters.push(adapter);
        }
    }

    pub fn with(mut self, adapter: Arc<dyn ProviderAdapter>) -> Self {
        self.register(adapter);
        self
    }

    pub fn get(&self, kind: ProviderKind) -> Option<Arc<dyn ProviderAdapter>> {
        self.adapters.iter().find(|a| a.kind() == kind).cloned()
    }

    pub fn registered(&self) -> Vec<ProviderKind> {
        self.adapters.iter().map(|a| a.kind()).collect()
    }

    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }

    /// Last known health without contacting any provider
    pub fn health_status(&self) -> HealthReport {
        let providers: Vec<_> = self.adapters.iter().map(|a| (a.kind(), a.health())).collect();
        HealthReport {
            status: HealthStatus::aggregate(providers.iter().map(|(_, h)| h.healthy)),
            providers,
        }
    }

    /// Probe every adapter concurrently
    pub async fn health_check(&self) -> HealthReport {
        let results = join_all(self.adapters.iter().map(|a| a.check_health())).await;
        for (adapter, healthy) in self.adapters.iter().zip(&results) {
            if !healthy {
                warn!("❌ {} failed its health probe", adapter.kind());
            }
        }
        let report = self.health_status();
        info!("Health check complete: {}", report.status);
        report
    }
}

impl fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("providers", &self.registered())
            .finish()
    }
}
