use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::ProviderKind;
use crate::error::ErrorKind;
use crate::identity::IdentityKey;
use crate::providers::TokenUsage;

/// Telemetry for one completed gateway call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub identity: IdentityKey,
    pub operation: String,
    pub provider: Option<ProviderKind>,
    pub model: Option<String>,
    pub usage: TokenUsage,
    pub cost_cents: u64,
    pub duration_ms: u64,
    pub success: bool,
    pub error_kind: Option<ErrorKind>,
}

/// Fire-and-forget telemetry sink. Implementations must not block.
pub trait UsageRecorder: Send + Sync {
    fn record(&self, record: UsageRecord);
}

/// Emits each record as a structured log line
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingUsageRecorder;

impl UsageRecorder for TracingUsageRecorder {
    fn record(&self, record: UsageRecord) {
        if record.success {
            info!(
                target: "gateway::usage",
                identity = %record.identity,
                operation = %record.operation,
                provider = record.provider.map(|p| p.as_str()).unwrap_or("-"),
                model = record.model.as_deref().unwrap_or("-"),
                tokens = record.usage.total_tokens,
                cost_cents = record.cost_cents,
                duration_ms = record.duration_ms,
                "📊 AI usage recorded"
            );
        } else {
            warn!(
                target: "gateway::usage",
                identity = %record.identity,
                operation = %record.operation,
                error_kind = ?record.error_kind,
                duration_ms = record.duration_ms,
                "📊 AI call failed"
            );
        }
    }
}

/// Hands records to an external consumer over an unbounded channel
#[derive(Debug, Clone)]
pub struct ChannelUsageRecorder {
    tx: mpsc::UnboundedSender<UsageRecord>,
}

impl ChannelUsageRecorder {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<UsageRecord>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl UsageRecorder for ChannelUsageRecorder {
    fn record(&self, record: UsageRecord) {
        if self.tx.send(record).is_err() {
            debug!("Usage receiver dropped, record discarded");
        }
    }
}
