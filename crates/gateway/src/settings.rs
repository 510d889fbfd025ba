//! Routing policy sources.
//!
//! The router asks a `SettingsStore` for its policy and caches the answer
//! until `RequestRouter::refresh` is called.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

use crate::config::{ModelConfig, ProviderKind, RetryPolicy, RoutingPolicy};

#[async_trait]
pub trait SettingsStore: Send + Sync {
    async fn get_routing_policy(&self) -> Result<RoutingPolicy>;

    /// Drop anything the store itself cached
    async fn invalidate(&self) {}
}

/// Fixed in-memory policy, replaceable at runtime
#[derive(Debug)]
pub struct StaticSettings {
    policy: RwLock<RoutingPolicy>,
}

impl StaticSettings {
    pub fn new(policy: RoutingPolicy) -> Self {
        Self {
            policy: RwLock::new(policy),
        }
    }

    /// Replace the stored policy; routers see it after their next refresh
    pub fn replace(&self, policy: RoutingPolicy) {
        *self.policy.write() = policy;
    }
}

#[async_trait]
impl SettingsStore for StaticSettings {
    async fn get_routing_policy(&self) -> Result<RoutingPolicy> {
        Ok(self.policy.read().clone())
    }
}

/// Routing policy as written in a TOML settings file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingPolicyFile {
    pub primary: ProviderKind,
    #[serde(default)]
    pub fallbacks: Vec<ProviderKind>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub retry: RetryFile,
    #[serde(default)]
    pub models: HashMap<String, ModelFile>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryFile {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_backoff_ms")]
    pub base_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default)]
    pub jitter: bool,
}

impl Default for RetryFile {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_backoff_ms: default_base_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            jitter: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelFile {
    pub model: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

fn default_timeout_secs() -> u64 {
    RoutingPolicy::DEFAULT_TIMEOUT.as_secs()
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_backoff_ms() -> u64 {
    1000
}

fn default_max_backoff_ms() -> u64 {
    RetryPolicy::default().max_backoff.as_millis() as u64
}

impl RoutingPolicyFile {
    pub fn into_policy(self) -> Result<RoutingPolicy> {
        let mut policy = RoutingPolicy::new(self.primary, self.fallbacks)
            .with_timeout(Duration::from_secs(self.timeout_secs))
            .with_retry(
                RetryPolicy::new(self.retry.max_attempts, Duration::from_millis(self.retry.base_backoff_ms))
                    .with_max_backoff(Duration::from_millis(self.retry.max_backoff_ms))
                    .with_jitter(self.retry.jitter),
            );

        for (name, model) in self.models {
            let provider: ProviderKind = name.parse()?;
            let mut config: ModelConfig = provider.default_model_config();
            if let Some(name) = model.model {
                config.model = name;
            }
            if let Some(temperature) = model.temperature {
                config.temperature = temperature;
            }
            if let Some(max_tokens) = model.max_tokens {
                config.max_tokens = max_tokens;
            }
            policy = policy.with_model(config);
        }

        policy
            .validate()
            .map_err(|e| anyhow!("Invalid routing policy: {}", e))?;
        Ok(policy)
    }
}

/// Reads the routing policy from a TOML file on every fetch
#[derive(Debug, Clone)]
pub struct TomlSettings {
    path: PathBuf,
}

impl TomlSettings {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl SettingsStore for TomlSettings {
    async fn get_routing_policy(&self) -> Result<RoutingPolicy> {
        let raw = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("Failed to read settings file {}", self.path.display()))?;
        let file: RoutingPolicyFile = toml::from_str(&raw)
            .with_context(|| format!("Failed to parse settings file {}", self.path.display()))?;
        debug!("Loaded routing settings from {}", self.path.display());
        let policy = file.into_policy()?;
        info!(
            "📖 Routing policy: primary={} fallbacks={:?}",
            policy.primary, policy.fallbacks
        );
        Ok(policy)
    }
}
