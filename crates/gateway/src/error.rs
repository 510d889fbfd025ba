use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::circuit_breaker::CircuitDenial;
use crate::config::ProviderKind;
use crate::quota::QuotaDenial;

/// Failure of a single call against one upstream provider.
///
/// Adapters normalize vendor payloads and transport failures into this
/// taxonomy; the router decides retry and fallback from it.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProviderError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("{provider} authentication failed: {message}")]
    Auth {
        provider: ProviderKind,
        message: String,
    },

    #[error("{provider} rate limited: {message}")]
    RateLimited {
        provider: ProviderKind,
        message: String,
        retry_after: Option<Duration>,
    },

    #[error("{provider} transient failure: {message}")]
    Transient {
        provider: ProviderKind,
        message: String,
    },

    #[error("{provider} request timed out after {after:?}")]
    Timeout {
        provider: ProviderKind,
        after: Duration,
    },

    #[error("Request cancelled")]
    Cancelled,

    #[error("Provider not registered: {0}")]
    NotRegistered(ProviderKind),

    #[error("{provider} error: {message}")]
    Unknown {
        provider: ProviderKind,
        message: String,
    },
}

/// Flat error classification used in telemetry records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    Auth,
    RateLimited,
    Transient,
    Timeout,
    Cancelled,
    NotRegistered,
    Unknown,
    Configuration,
    QuotaExceeded,
    CircuitOpen,
}

impl ProviderError {
    /// Map an upstream HTTP status and body onto the taxonomy
    pub fn from_status(
        provider: ProviderKind,
        status: u16,
        body: String,
        retry_after: Option<Duration>,
    ) -> Self {
        let message = format!("HTTP {}: {}", status, body);
        match status {
            401 | 403 => Self::Auth { provider, message },
            429 => Self::RateLimited {
                provider,
                message,
                retry_after,
            },
            408 | 500..=599 => Self::Transient { provider, message },
            400 | 422 => Self::Validation(format!("{} rejected request: {}", provider, message)),
            _ => Self::Unknown { provider, message },
        }
    }

    /// Classify a transport level failure from reqwest
    pub fn from_transport(provider: ProviderKind, error: &reqwest::Error) -> Self {
        if error.is_timeout() || error.is_connect() {
            Self::Transient {
                provider,
                message: error.to_string(),
            }
        } else if let Some(status) = error.status() {
            Self::from_status(provider, status.as_u16(), error.to_string(), None)
        } else {
            Self::Unknown {
                provider,
                message: error.to_string(),
            }
        }
    }

    /// Whether another attempt against the same provider may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. }
                | Self::Transient { .. }
                | Self::Timeout { .. }
                | Self::Unknown { .. }
        )
    }

    /// Client-side problems never trip a circuit breaker
    pub fn counts_toward_circuit(&self) -> bool {
        !matches!(self, Self::Validation(_) | Self::Cancelled)
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::Auth { .. } => ErrorKind::Auth,
            Self::RateLimited { .. } => ErrorKind::RateLimited,
            Self::Transient { .. } => ErrorKind::Transient,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::NotRegistered(_) => ErrorKind::NotRegistered,
            Self::Unknown { .. } => ErrorKind::Unknown,
        }
    }
}

/// Errors surfaced by the gateway to its caller
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Quota exceeded: {0}")]
    QuotaExceeded(QuotaDenial),

    #[error("Circuit open: {0}")]
    CircuitOpen(CircuitDenial),

    /// Every candidate failed; carries the last provider's error
    #[error("All providers failed: {message}")]
    AllProvidersFailed {
        message: String,
        last_error: Box<ProviderError>,
    },

    #[error("Request cancelled")]
    Cancelled,
}

impl GatewayError {
    pub fn all_failed(last_error: ProviderError) -> Self {
        Self::AllProvidersFailed {
            message: last_error.to_string(),
            last_error: Box::new(last_error),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Configuration(_) => ErrorKind::Configuration,
            Self::Validation(_) => ErrorKind::Validation,
            Self::QuotaExceeded(_) => ErrorKind::QuotaExceeded,
            Self::CircuitOpen(_) => ErrorKind::CircuitOpen,
            Self::AllProvidersFailed { last_error, .. } => last_error.kind(),
            Self::Cancelled => ErrorKind::Cancelled,
        }
    }

    /// Whether this outcome should be recorded as a breaker failure
    pub fn counts_toward_circuit(&self) -> bool {
        match self {
            Self::AllProvidersFailed { last_error, .. } => last_error.counts_toward_circuit(),
            Self::Configuration(_) => true,
            _ => false,
        }
    }
}

pub type GatewayResult<T> = Result<T, GatewayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        let p = ProviderKind::OpenAi;
        assert!(matches!(
            ProviderError::from_status(p, 401, "bad key".into(), None),
            ProviderError::Auth { .. }
        ));
        assert!(matches!(
            ProviderError::from_status(p, 429, "slow down".into(), Some(Duration::from_secs(3))),
            ProviderError::RateLimited {
                retry_after: Some(_),
                ..
            }
        ));
        assert!(matches!(
            ProviderError::from_status(p, 503, "overloaded".into(), None),
            ProviderError::Transient { .. }
        ));
        assert!(matches!(
            ProviderError::from_status(p, 400, "bad".into(), None),
            ProviderError::Validation(_)
        ));
        assert!(matches!(
            ProviderError::from_status(p, 418, "teapot".into(), None),
            ProviderError::Unknown { .. }
        ));
    }

    #[test]
    fn test_retry_and_circuit_predicates() {
        let auth = ProviderError::Auth {
            provider: ProviderKind::Claude,
            message: "nope".into(),
        };
        assert!(!auth.is_retryable());
        assert!(auth.counts_toward_circuit());

        let validation = ProviderError::Validation("empty prompt".into());
        assert!(!validation.is_retryable());
        assert!(!validation.counts_toward_circuit());

        let timeout = ProviderError::Timeout {
            provider: ProviderKind::Groq,
            after: Duration::from_secs(1),
        };
        assert!(timeout.is_retryable());
        assert!(timeout.counts_toward_circuit());
    }

    #[test]
    fn test_aggregate_error_carries_last_message() {
        let err = GatewayError::all_failed(ProviderError::Transient {
            provider: ProviderKind::Claude,
            message: "HTTP 502: upstream".into(),
        });
        assert!(err.to_string().contains("HTTP 502: upstream"));
        assert_eq!(err.kind(), ErrorKind::Transient);
        assert!(err.counts_toward_circuit());
    }
}
