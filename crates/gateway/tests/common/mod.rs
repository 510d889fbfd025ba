#![allow(dead_code)]

use async_trait::async_trait;
use gateway::providers::{validate_request, HealthCell};
use gateway::{
    AdapterHealth, CancellationToken, GenerateResponse, ProviderAdapter, ProviderError, ProviderKind,
    ProviderRegistry, ProviderRequest, RequestRouter, RetryPolicy, RoutingPolicy, TokenUsage,
};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// One scripted outcome for a call
#[derive(Debug, Clone)]
pub enum Step {
    Reply(&'static str),
    Fail(ProviderError),
    /// Never completes unless the attempt token is cancelled
    Hang,
    /// Plays the inner step after a delay
    Slow(Duration, Box<Step>),
}

/// Adapter that plays back a script of outcomes and records every call
pub struct ScriptedAdapter {
    kind: ProviderKind,
    script: Mutex<VecDeque<Step>>,
    fallback: Step,
    calls: AtomicUsize,
    tokens: Mutex<Vec<CancellationToken>>,
    health: HealthCell,
}

impl ScriptedAdapter {
    pub fn new(kind: ProviderKind, script: Vec<Step>) -> Arc<Self> {
        Self::with_fallback(kind, script, Step::Reply("default reply"))
    }

    /// `fallback` is played once the script runs out
    pub fn with_fallback(kind: ProviderKind, script: Vec<Step>, fallback: Step) -> Arc<Self> {
        Arc::new(Self {
            kind,
            script: Mutex::new(script.into()),
            fallback,
            calls: AtomicUsize::new(0),
            tokens: Mutex::new(Vec::new()),
            health: HealthCell::default(),
        })
    }

    pub fn always_failing(kind: ProviderKind) -> Arc<Self> {
        Self::with_fallback(kind, vec![], Step::Fail(transient(kind, "always down")))
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Tokens handed to each call, in call order
    pub fn tokens(&self) -> Vec<CancellationToken> {
        self.tokens.lock().clone()
    }
}

#[async_trait]
impl ProviderAdapter for ScriptedAdapter {
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
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.tokens.lock().push(cancel.clone());
        validate_request(request)?;

        let mut step = self.script.lock().pop_front().unwrap_or_else(|| self.fallback.clone());
        if let Step::Slow(delay, inner) = step {
            tokio::select! {
                _ = cancel.cancelled() => return Err(ProviderError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
            step = *inner;
        }
        match step {
            Step::Reply(content) => Ok(GenerateResponse {
                content: content.to_string(),
                provider: self.kind,
                model: request.model.model.clone(),
                usage: TokenUsage::new(100, 50),
                finish_reason: "stop".to_string(),
                request_id: format!("{}-{}", self.kind, self.calls()),
                processing_time: Duration::from_millis(5),
            }),
            Step::Fail(error) => {
                self.health.observe(&error);
                Err(error)
            }
            Step::Hang | Step::Slow(..) => {
                cancel.cancelled().await;
                Err(ProviderError::Cancelled)
            }
        }
    }

    async fn check_health(&self) -> bool {
        let healthy = self.health.snapshot().healthy;
        self.health.mark(healthy);
        healthy
    }
}

pub fn transient(provider: ProviderKind, message: &str) -> ProviderError {
    ProviderError::Transient {
        provider,
        message: message.to_string(),
    }
}

pub fn policy(primary: ProviderKind, fallbacks: Vec<ProviderKind>) -> RoutingPolicy {
    RoutingPolicy::new(primary, fallbacks).with_retry(RetryPolicy::new(3, Duration::from_secs(1)))
}

pub fn router(adapters: &[Arc<ScriptedAdapter>], policy: RoutingPolicy) -> RequestRouter {
    let mut registry = ProviderRegistry::new();
    for adapter in adapters {
        registry.register(adapter.clone());
    }
    RequestRouter::new(Arc::new(registry)).with_policy(policy)
}
