//! Gateway configuration: provider identities, model defaults, routing and
//! retry policy, plus loading everything from the environment.

use anyhow::{anyhow, Context, Result};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

use crate::circuit_breaker::CircuitBreakerConfig;
use crate::quota::QuotaCeilings;

/// Closed set of upstream providers the gateway knows how to talk to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ProviderKind {
    #[serde(rename = "openai")]
    OpenAi,
    #[serde(rename = "claude", alias = "anthropic")]
    Claude,
    #[serde(rename = "groq")]
    Groq,
}

/// Per-provider bounds a `ModelConfig` must respect
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModelLimits {
    pub max_temperature: f32,
    pub max_output_tokens: u32,
}

impl ProviderKind {
    pub const ALL: [ProviderKind; 3] = [ProviderKind::OpenAi, ProviderKind::Claude, ProviderKind::Groq];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::OpenAi => "openai",
            ProviderKind::Claude => "claude",
            ProviderKind::Groq => "groq",
        }
    }

    pub fn limits(&self) -> ModelLimits {
        match self {
            ProviderKind::OpenAi => ModelLimits {
                max_temperature: 2.0,
                max_output_tokens: 16_384,
            },
            ProviderKind::Claude => ModelLimits {
                max_temperature: 1.0,
                max_output_tokens: 8_192,
            },
            ProviderKind::Groq => ModelLimits {
                max_temperature: 2.0,
                max_output_tokens: 8_192,
            },
        }
    }

    /// Built-in model defaults, used when the routing policy supplies none
    pub fn default_model_config(&self) -> ModelConfig {
        let model = match self {
            ProviderKind::OpenAi => "gpt-4o-mini",
            ProviderKind::Claude => "claude-3-haiku-20240307",
            ProviderKind::Groq => "llama-3.1-8b-instant",
        };
        ModelConfig {
            provider: *self,
            model: model.to_string(),
            temperature: 0.7,
            max_tokens: 1000,
        }
    }

    fn env_prefix(&self) -> &'static str {
        match self {
            ProviderKind::OpenAi => "OPENAI",
            ProviderKind::Claude => "ANTHROPIC",
            ProviderKind::Groq => "GROQ",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "openai" => Ok(ProviderKind::OpenAi),
            "claude" | "anthropic" => Ok(ProviderKind::Claude),
            "groq" => Ok(ProviderKind::Groq),
            other => Err(anyhow!("Unknown provider: {}", other)),
        }
    }
}

/// Model parameters for one provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub provider: ProviderKind,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
}

/// Request-level tweaks layered on top of a provider's `ModelConfig`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelOverride {
    pub model: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

impl ModelConfig {
    /// Check the config against the provider's bounds
    pub fn validate(&self) -> std::result::Result<(), String> {
        let limits = self.provider.limits();

        if self.model.trim().is_empty() {
            return Err(format!("{}: model name must not be empty", self.provider));
        }
        if !self.temperature.is_finite()
            || self.temperature < 0.0
            || self.temperature > limits.max_temperature
        {
            return Err(format!(
                "{}: temperature {} outside 0.0-{}",
                self.provider, self.temperature, limits.max_temperature
            ));
        }
        if self.max_tokens == 0 || self.max_tokens > limits.max_output_tokens {
            return Err(format!(
                "{}: max_tokens {} outside 1-{}",
                self.provider, self.max_tokens, limits.max_output_tokens
            ));
        }
        Ok(())
    }

    pub fn merged(&self, request_override: Option<&ModelOverride>) -> ModelConfig {
        let mut merged = self.clone();
        if let Some(o) = request_override {
            if let Some(model) = &o.model {
                merged.model = model.clone();
            }
            if let Some(temperature) = o.temperature {
                merged.temperature = temperature;
            }
            if let Some(max_tokens) = o.max_tokens {
                merged.max_tokens = max_tokens;
            }
        }
        merged
    }
}

/// Retry behaviour applied to each provider candidate
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts per provider, including the first one
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    /// Adds +-10% noise to each delay
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
            jitter: false,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_backoff: Duration) -> Self {
        Self {
            max_attempts,
            base_backoff,
            ..Default::default()
        }
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn with_max_backoff(mut self, max_backoff: Duration) -> Self {
        self.max_backoff = max_backoff;
        self
    }

    /// Delay slept after the failed attempt `attempt` (1-based):
    /// `base_backoff * 2^(attempt-1)`, capped at `max_backoff`.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let base_ms = self.base_backoff.as_millis() as f64;
        let delay_ms = (base_ms * 2f64.powi(exponent as i32)).min(self.max_backoff.as_millis() as f64);

        let delay_ms = if self.jitter && delay_ms > 0.0 {
            let range = delay_ms * 0.1;
            (delay_ms + rand::thread_rng().gen_range(-range..range)).max(0.0)
        } else {
            delay_ms
        };

        Duration::from_millis(delay_ms as u64)
    }
}

/// Ordered routing configuration consumed by the router
#[derive(Debug, Clone, PartialEq)]
pub struct RoutingPolicy {
    pub primary: ProviderKind,
    pub fallbacks: Vec<ProviderKind>,
    pub timeout_per_attempt: Duration,
    pub retry: RetryPolicy,
    pub provider_defaults: HashMap<ProviderKind, ModelConfig>,
}

impl RoutingPolicy {
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

    pub fn new(primary: ProviderKind, fallbacks: Vec<ProviderKind>) -> Self {
        Self {
            primary,
            fallbacks,
            timeout_per_attempt: Self::DEFAULT_TIMEOUT,
            retry: RetryPolicy::default(),
            provider_defaults: HashMap::new(),
        }
    }

    /// Built-in policy: first registered provider is primary, the rest are
    /// fallbacks in registration order.
    pub fn default_for(registered: &[ProviderKind]) -> Option<Self> {
        let (primary, rest) = registered.split_first()?;
        Some(Self::new(*primary, rest.to_vec()))
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_per_attempt = timeout;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_model(mut self, config: ModelConfig) -> Self {
        self.provider_defaults.insert(config.provider, config);
        self
    }

    /// `[primary] + fallbacks`, dropping repeats so a provider is never
    /// revisited within one dispatch
    pub fn candidates(&self) -> Vec<ProviderKind> {
        let mut ordered = Vec::with_capacity(self.fallbacks.len() + 1);
        ordered.push(self.primary);
        for provider in &self.fallbacks {
            if !ordered.contains(provider) {
                ordered.push(*provider);
            }
        }
        ordered
    }

    pub fn model_config(&self, provider: ProviderKind) -> ModelConfig {
        self.provider_defaults
            .get(&provider)
            .cloned()
            .unwrap_or_else(|| provider.default_model_config())
    }

    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.retry.max_attempts == 0 {
            return Err("retry.max_attempts must be at least 1".to_string());
        }
        if self.timeout_per_attempt.is_zero() {
            return Err("timeout_per_attempt must be greater than zero".to_string());
        }
        if self.retry.base_backoff > self.retry.max_backoff {
            return Err(format!(
                "retry.base_backoff ({:?}) exceeds retry.max_backoff ({:?})",
                self.retry.base_backoff, self.retry.max_backoff
            ));
        }
        for (provider, config) in &self.provider_defaults {
            if config.provider != *provider {
                return Err(format!(
                    "model config for {} is tagged with {}",
                    provider, config.provider
                ));
            }
            config.validate()?;
        }
        Ok(())
    }
}

/// Credentials and endpoint for one upstream provider
#[derive(Debug, Clone)]
pub struct ProviderCredentials {
    pub kind: ProviderKind,
    pub api_key: String,
    pub base_url: Option<String>,
}

/// Top-level configuration for building a gateway
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub providers: Vec<ProviderCredentials>,
    /// Explicit routing; `None` means the router derives its default
    pub routing: Option<RoutingPolicy>,
    /// TOML file consulted on each policy fetch; wins over `routing`
    pub settings_file: Option<PathBuf>,
    pub circuit: CircuitBreakerConfig,
    pub quota: QuotaCeilings,
    pub stream_idle_timeout: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            providers: Vec::new(),
            routing: None,
            settings_file: None,
            circuit: CircuitBreakerConfig::default(),
            quota: QuotaCeilings::default(),
            stream_idle_timeout: Duration::from_secs(30),
        }
    }
}

impl GatewayConfig {
    /// Load configuration from the process environment (and `.env`)
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok(); // Загружаем .env если есть

        let mut config = GatewayConfig::default();

        for kind in ProviderKind::ALL {
            let prefix = kind.env_prefix();
            match env::var(format!("{}_API_KEY", prefix)) {
                Ok(api_key) if !api_key.trim().is_empty() => {
                    config.providers.push(ProviderCredentials {
                        kind,
                        api_key,
                        base_url: env::var(format!("{}_BASE_URL", prefix)).ok(),
                    });
                    info!("✅ Credentials found for {}", kind);
                }
                _ => debug!("{}_API_KEY not set, {} disabled", prefix, kind),
            }
        }

        let registered: Vec<ProviderKind> = config.providers.iter().map(|p| p.kind).collect();

        let primary: Option<ProviderKind> = env_parse("AI_GATEWAY_PRIMARY")?;
        let fallbacks = match env::var("AI_GATEWAY_FALLBACKS") {
            Ok(raw) => Some(
                raw.split(',')
                    .filter(|s| !s.trim().is_empty())
                    .map(ProviderKind::from_str)
                    .collect::<Result<Vec<_>>>()
                    .context("AI_GATEWAY_FALLBACKS")?,
            ),
            Err(_) => None,
        };

        let base = match primary {
            Some(primary) => Some(RoutingPolicy::new(primary, fallbacks.unwrap_or_default())),
            None => RoutingPolicy::default_for(&registered).map(|mut policy| {
                if let Some(fallbacks) = fallbacks {
                    policy.fallbacks = fallbacks;
                }
                policy
            }),
        };

        if let Some(mut policy) = base {
            if let Some(secs) = env_parse::<u64>("AI_GATEWAY_TIMEOUT_SECS")? {
                policy.timeout_per_attempt = Duration::from_secs(secs);
            }
            if let Some(attempts) = env_parse::<u32>("AI_GATEWAY_MAX_ATTEMPTS")? {
                policy.retry.max_attempts = attempts;
            }
            if let Some(ms) = env_parse::<u64>("AI_GATEWAY_BASE_BACKOFF_MS")? {
                policy.retry.base_backoff = Duration::from_millis(ms);
            }
            if let Some(ms) = env_parse::<u64>("AI_GATEWAY_MAX_BACKOFF_MS")? {
                policy.retry.max_backoff = Duration::from_millis(ms);
            }
            for kind in ProviderKind::ALL {
                if let Ok(model) = env::var(format!("{}_MODEL", kind.env_prefix())) {
                    let mut model_config = policy.model_config(kind);
                    model_config.model = model;
                    policy.provider_defaults.insert(kind, model_config);
                }
            }
            policy
                .validate()
                .map_err(|e| anyhow!("Invalid routing policy: {}", e))?;
            config.routing = Some(policy);
        }

        if let Some(threshold) = env_parse::<u32>("AI_GATEWAY_CIRCUIT_THRESHOLD")? {
            config.circuit.failure_threshold = threshold;
        }
        if let Some(secs) = env_parse::<u64>("AI_GATEWAY_CIRCUIT_COOLDOWN_SECS")? {
            config.circuit.cooldown = Duration::from_secs(secs);
        }
        config.settings_file = env::var("AI_GATEWAY_SETTINGS_FILE").ok().map(PathBuf::from);

        config
            .quota
            .validate()
            .map_err(|e| anyhow!("Invalid quota ceilings: {}", e))?;

        Ok(config)
    }
}

fn env_parse<T>(name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| anyhow!("{} has invalid value {:?}: {}", name, raw, e)),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_candidates_skip_primary_duplicates() {
        let policy = RoutingPolicy::new(
            ProviderKind::OpenAi,
            vec![ProviderKind::Claude, ProviderKind::OpenAi, ProviderKind::Groq],
        );
        assert_eq!(
            policy.candidates(),
            vec![ProviderKind::OpenAi, ProviderKind::Claude, ProviderKind::Groq]
        );
    }

    #[test]
    fn test_backoff_doubles_per_attempt() {
        let retry = RetryPolicy::new(4, Duration::from_millis(100));
        assert_eq!(retry.backoff_for(1), Duration::from_millis(100));
        assert_eq!(retry.backoff_for(2), Duration::from_millis(200));
        assert_eq!(retry.backoff_for(3), Duration::from_millis(400));
    }

    #[test]
    fn test_backoff_is_capped() {
        let retry = RetryPolicy::new(10, Duration::from_secs(1)).with_max_backoff(Duration::from_secs(5));
        assert_eq!(retry.backoff_for(8), Duration::from_secs(5));
    }

    #[test]
    fn test_jitter_stays_within_ten_percent() {
        let retry = RetryPolicy::new(3, Duration::from_millis(1000)).with_jitter(true);
        for _ in 0..50 {
            let delay = retry.backoff_for(1).as_millis();
            assert!((900..=1100).contains(&delay), "delay {} out of range", delay);
        }
    }

    #[test]
    fn test_model_override_merge() {
        let base = ProviderKind::OpenAi.default_model_config();
        let merged = base.merged(Some(&ModelOverride {
            model: None,
            temperature: Some(0.1),
            max_tokens: Some(42),
        }));
        assert_eq!(merged.model, "gpt-4o-mini");
        assert_eq!(merged.temperature, 0.1);
        assert_eq!(merged.max_tokens, 42);
    }

    #[test]
    fn test_model_config_validation_uses_provider_limits() {
        let mut config = ProviderKind::Claude.default_model_config();
        assert!(config.validate().is_ok());

        config.temperature = 1.5;
        assert!(config.validate().is_err());

        let mut config = ProviderKind::OpenAi.default_model_config();
        config.temperature = 1.5;
        assert!(config.validate().is_ok());
        config.max_tokens = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_policy_validation() {
        let policy = RoutingPolicy::new(ProviderKind::OpenAi, vec![])
            .with_retry(RetryPolicy::new(0, Duration::from_secs(1)));
        assert!(policy.validate().is_err());

        let mut mislabeled = ProviderKind::Groq.default_model_config();
        mislabeled.provider = ProviderKind::OpenAi;
        let mut policy = RoutingPolicy::new(ProviderKind::OpenAi, vec![]);
        policy.provider_defaults.insert(ProviderKind::Groq, mislabeled);
        assert!(policy.validate().is_err());

        let policy = RoutingPolicy::new(ProviderKind::OpenAi, vec![])
            .with_retry(RetryPolicy::new(3, Duration::from_secs(120)));
        assert!(policy.validate().unwrap_err().contains("max_backoff"));
    }

    #[test]
    fn test_default_policy_from_registration_order() {
        let policy =
            RoutingPolicy::default_for(&[ProviderKind::Claude, ProviderKind::Groq]).unwrap();
        assert_eq!(policy.primary, ProviderKind::Claude);
        assert_eq!(policy.fallbacks, vec![ProviderKind::Groq]);
        assert_eq!(policy.timeout_per_attempt, Duration::from_secs(30));
        assert_eq!(policy.retry.max_attempts, 3);
        assert_eq!(policy.retry.base_backoff, Duration::from_secs(1));
        assert!(RoutingPolicy::default_for(&[]).is_none());
    }

    #[test]
    fn test_provider_kind_parsing() {
        assert_eq!("anthropic".parse::<ProviderKind>().unwrap(), ProviderKind::Claude);
        assert_eq!(" OpenAI ".parse::<ProviderKind>().unwrap(), ProviderKind::OpenAi);
        assert!("gemini".parse::<ProviderKind>().is_err());
    }
}
