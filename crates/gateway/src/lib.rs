//! Resilient multi-provider AI request gateway.
//!
//! Inbound calls pass quota admission and a per-operation circuit breaker,
//! then the router tries the configured providers in order with retries,
//! backoff and per-attempt timeouts. Actual cost is reconciled into the
//! caller's quota window and every call is reported to a usage recorder.

pub mod circuit_breaker;
pub mod clock;
pub mod config;
pub mod error;
pub mod gateway;
pub mod identity;
pub mod logging;
pub mod pricing;
pub mod providers;
pub mod quota;
pub mod registry;
pub mod router;
pub mod settings;
pub mod store;
pub mod usage;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerState, CircuitDenial, CircuitPermit};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{
    GatewayConfig, ModelConfig, ModelOverride, ProviderCredentials, ProviderKind, RetryPolicy,
    RoutingPolicy,
};
pub use error::{ErrorKind, GatewayError, GatewayResult, ProviderError};
pub use gateway::{
    denial_headers, rate_limit_headers, AdmissionErrorBody, AiGateway, Generated, GeneratedStream,
};
pub use identity::{IdentityContext, IdentityKey, TrustTier};
pub use logging::{init_logging, LoggingConfig};
pub use pricing::PricingTable;
pub use providers::{
    AdapterHealth, ChunkStream, GenerateRequest, GenerateResponse, ProviderAdapter, ProviderRequest,
    StreamChunk, TokenUsage,
};
pub use quota::{QuotaCeiling, QuotaCeilings, QuotaDenial, QuotaGrant, QuotaTracker};
pub use registry::{HealthReport, HealthStatus, ProviderRegistry};
pub use router::{ProviderStats, RequestRouter};
pub use settings::{SettingsStore, StaticSettings, TomlSettings};
pub use usage::{ChannelUsageRecorder, TracingUsageRecorder, UsageRecord, UsageRecorder};

pub use tokio_util::sync::CancellationToken;
