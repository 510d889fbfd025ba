use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::clock::{elapsed_between, Clock, SystemClock};
use crate::identity::IdentityKey;
use crate::store::{DashMapStore, StateStore};

/// Observable breaker state. `HalfOpen` is not stored: it is an open
/// breaker whose cooldown has elapsed and whose single trial is in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CircuitBreakerState {
    Closed,   // Normal operation
    Open,     // Failing, rejecting requests
    HalfOpen, // One trial call admitted
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub cooldown: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,               // Open after 5 consecutive failures
            cooldown: Duration::from_secs(60), // Wait 1 minute before the trial call
        }
    }
}

/// Breaker bookkeeping for one (identity, operation) pair
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitState {
    pub open: bool,
    pub opened_at: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub trial_started_at: Option<DateTime<Utc>>,
    pub last_seen: DateTime<Utc>,
}

impl CircuitState {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            open: false,
            opened_at: None,
            consecutive_failures: 0,
            trial_started_at: None,
            last_seen: now,
        }
    }

    fn observed_state(&self) -> CircuitBreakerState {
        match (self.open, self.trial_started_at) {
            (false, _) => CircuitBreakerState::Closed,
            (true, Some(_)) => CircuitBreakerState::HalfOpen,
            (true, None) => CircuitBreakerState::Open,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CircuitKey {
    pub identity: IdentityKey,
    pub operation: String,
}

impl CircuitKey {
    pub fn new(identity: &IdentityKey, operation: &str) -> Self {
        Self {
            identity: identity.clone(),
            operation: operation.to_string(),
        }
    }
}

/// Returned when the breaker refuses a call
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitDenial {
    pub operation: String,
    pub retry_after: Duration,
}

impl fmt::Display for CircuitDenial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "operation '{}' is temporarily unavailable, retry in {}s",
            self.operation,
            self.retry_after.as_secs().max(1)
        )
    }
}

/// Proof of admission. A trial permit identifies the half-open trial it
/// started, so only that call can hand the trial back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitPermit {
    Closed,
    Trial(DateTime<Utc>),
}

/// Failure-counting breakers keyed by (identity, operation)
pub struct CircuitBreaker<S = DashMapStore<CircuitKey, CircuitState>>
where
    S: StateStore<CircuitKey, CircuitState>,
{
    store: S,
    config: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: CircuitBreakerConfig, clock: Arc<dyn Clock>) -> Self {
        Self::with_store(DashMapStore::new(), config, clock)
    }
}

impl<S> CircuitBreaker<S>
where
    S: StateStore<CircuitKey, CircuitState>,
{
    pub fn with_store(store: S, config: CircuitBreakerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            config,
            clock,
        }
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Check if a call should be allowed
    pub fn admit(&self, identity: &IdentityKey, operation: &str) -> Result<CircuitPermit, CircuitDenial> {
        let now = self.clock.now();
        let cooldown = self.config.cooldown;
        let key = CircuitKey::new(identity, operation);

        self.store.with_entry(
            &key,
            || CircuitState::new(now),
            |state| {
                state.last_seen = now;
                if !state.open {
                    return Ok(CircuitPermit::Closed);
                }

                let opened_at = *state.opened_at.get_or_insert(now);
                let since_open = elapsed_between(opened_at, now);
                if since_open < cooldown {
                    debug!(identity = %identity, operation, "⭕ Circuit breaker OPEN - blocking request");
                    return Err(CircuitDenial {
                        operation: operation.to_string(),
                        retry_after: cooldown - since_open,
                    });
                }

                // Cooldown over: admit exactly one trial. A trial that never
                // reported back is replaced after another cooldown.
                if let Some(trial_started) = state.trial_started_at {
                    let since_trial = elapsed_between(trial_started, now);
                    if since_trial < cooldown {
                        debug!(identity = %identity, operation, "Circuit breaker HALF_OPEN - trial in flight");
                        return Err(CircuitDenial {
                            operation: operation.to_string(),
                            retry_after: cooldown - since_trial,
                        });
                    }
                }

                info!(identity = %identity, operation, "🔄 Circuit breaker HALF_OPEN - admitting trial call");
                state.trial_started_at = Some(now);
                Ok(CircuitPermit::Trial(now))
            },
        )
    }

    /// Give back a trial whose outcome says nothing about the downstream
    /// (validation error, cancellation). The failure run is left untouched
    /// and the next caller may start a new trial straight away.
    pub fn release_trial(&self, identity: &IdentityKey, operation: &str, permit: CircuitPermit) {
        let CircuitPermit::Trial(started_at) = permit else {
            return;
        };
        let key = CircuitKey::new(identity, operation);
        self.store.with_entry(
            &key,
            || CircuitState::new(started_at),
            |state| {
                if state.open && state.trial_started_at == Some(started_at) {
                    debug!(identity = %identity, operation, "Circuit breaker - trial released without outcome");
                    state.trial_started_at = None;
                }
            },
        );
    }

    pub fn record_outcome(&self, identity: &IdentityKey, operation: &str, success: bool) {
        if success {
            self.record_success(identity, operation);
        } else {
            self.record_failure(identity, operation);
        }
    }

    /// Record successful call; closes the breaker and clears the failure run
    pub fn record_success(&self, identity: &IdentityKey, operation: &str) {
        let now = self.clock.now();
        let key = CircuitKey::new(identity, operation);
        self.store.with_entry(
            &key,
            || CircuitState::new(now),
            |state| {
                if state.open {
                    info!(identity = %identity, operation, "✅ Circuit breaker - recovery successful, moving to CLOSED");
                } else if state.consecutive_failures > 0 {
                    debug!(
                        identity = %identity,
                        operation,
                        "Circuit breaker - resetting failure count from {}",
                        state.consecutive_failures
                    );
                }
                state.open = false;
                state.opened_at = None;
                state.trial_started_at = None;
                state.consecutive_failures = 0;
                state.last_seen = now;
            },
        );
    }

    /// Record failed call
    pub fn record_failure(&self, identity: &IdentityKey, operation: &str) {
        let now = self.clock.now();
        let threshold = self.config.failure_threshold;
        let key = CircuitKey::new(identity, operation);
        self.store.with_entry(
            &key,
            || CircuitState::new(now),
            |state| {
                state.consecutive_failures = state.consecutive_failures.saturating_add(1);
                state.last_seen = now;

                let trial_failed = state.open && state.trial_started_at.is_some();
                if state.consecutive_failures >= threshold && (!state.open || trial_failed) {
                    if trial_failed {
                        warn!(identity = %identity, operation, "🚨 Circuit breaker - trial failed, back to OPEN state");
                    } else {
                        warn!(
                            identity = %identity,
                            operation,
                            "🚨 Circuit breaker OPENING - {} consecutive failures",
                            state.consecutive_failures
                        );
                    }
                    state.open = true;
                    state.opened_at = Some(now);
                    state.trial_started_at = None;
                } else {
                    debug!(
                        identity = %identity,
                        operation,
                        "Circuit breaker - failure {}/{}",
                        state.consecutive_failures,
                        threshold
                    );
                }
            },
        );
    }

    pub fn state(&self, identity: &IdentityKey, operation: &str) -> CircuitBreakerState {
        self.store
            .get(&CircuitKey::new(identity, operation))
            .map(|state| state.observed_state())
            .unwrap_or(CircuitBreakerState::Closed)
    }

    pub fn consecutive_failures(&self, identity: &IdentityKey, operation: &str) -> u32 {
        self.store
            .get(&CircuitKey::new(identity, operation))
            .map(|state| state.consecutive_failures)
            .unwrap_or(0)
    }

    /// Get current state info
    pub fn state_info(&self, identity: &IdentityKey, operation: &str) -> String {
        let Some(state) = self.store.get(&CircuitKey::new(identity, operation)) else {
            return "CLOSED (failures: 0)".to_string();
        };
        match state.observed_state() {
            CircuitBreakerState::Closed => format!("CLOSED (failures: {})", state.consecutive_failures),
            CircuitBreakerState::Open => {
                let remaining = state
                    .opened_at
                    .map(|at| self.config.cooldown.saturating_sub(elapsed_between(at, self.clock.now())))
                    .unwrap_or(self.config.cooldown);
                format!("OPEN (recovery in: {:?})", remaining)
            }
            CircuitBreakerState::HalfOpen => "HALF_OPEN (trial in flight)".to_string(),
        }
    }

    /// Forget breakers not touched within `max_idle`
    pub fn evict_idle(&self, max_idle: Duration) -> usize {
        let now = self.clock.now();
        self.store
            .retain(|_, state| elapsed_between(state.last_seen, now) < max_idle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn breaker(threshold: u32, cooldown: Duration) -> (CircuitBreaker, ManualClock) {
        let clock = ManualClock::default();
        let cb = CircuitBreaker::with_clock(
            CircuitBreakerConfig {
                failure_threshold: threshold,
                cooldown,
            },
            Arc::new(clock.clone()),
        );
        (cb, clock)
    }

    #[test]
    fn test_circuit_breaker_flow() {
        let (cb, clock) = breaker(3, Duration::from_millis(100));
        let id = IdentityKey::User("u".into());

        // Initially closed
        assert_eq!(cb.state(&id, "op"), CircuitBreakerState::Closed);
        assert!(cb.admit(&id, "op").is_ok());

        cb.record_failure(&id, "op");
        cb.record_failure(&id, "op");
        assert_eq!(cb.state(&id, "op"), CircuitBreakerState::Closed);

        cb.record_failure(&id, "op"); // Should open
        assert_eq!(cb.state(&id, "op"), CircuitBreakerState::Open);
        assert!(cb.admit(&id, "op").is_err());

        clock.advance(Duration::from_millis(150));
        assert!(cb.admit(&id, "op").is_ok()); // Should be half-open now
        assert_eq!(cb.state(&id, "op"), CircuitBreakerState::HalfOpen);

        // Success should close
        cb.record_success(&id, "op");
        assert_eq!(cb.state(&id, "op"), CircuitBreakerState::Closed);
        assert_eq!(cb.consecutive_failures(&id, "op"), 0);
    }

    #[test]
    fn test_denial_reports_remaining_cooldown() {
        let (cb, clock) = breaker(1, Duration::from_secs(30));
        let id = IdentityKey::User("u".into());
        cb.record_failure(&id, "op");
        clock.advance(Duration::from_secs(12));

        let denial = cb.admit(&id, "op").unwrap_err();
        assert_eq!(denial.retry_after, Duration::from_secs(18));
        assert_eq!(denial.operation, "op");
    }

    #[test]
    fn test_only_one_trial_while_half_open() {
        let (cb, clock) = breaker(2, Duration::from_secs(10));
        let id = IdentityKey::User("u".into());
        cb.record_failure(&id, "op");
        cb.record_failure(&id, "op");
        clock.advance(Duration::from_secs(10));

        assert!(cb.admit(&id, "op").is_ok());
        assert!(cb.admit(&id, "op").is_err());

        // An abandoned trial is replaced after another cooldown
        clock.advance(Duration::from_secs(10));
        assert!(cb.admit(&id, "op").is_ok());
    }

    #[test]
    fn test_failed_trial_reopens() {
        let (cb, clock) = breaker(2, Duration::from_secs(10));
        let id = IdentityKey::User("u".into());
        cb.record_failure(&id, "op");
        cb.record_failure(&id, "op");
        clock.advance(Duration::from_secs(11));

        assert!(cb.admit(&id, "op").is_ok());
        cb.record_failure(&id, "op");
        assert_eq!(cb.state(&id, "op"), CircuitBreakerState::Open);

        let denial = cb.admit(&id, "op").unwrap_err();
        assert_eq!(denial.retry_after, Duration::from_secs(10));
    }

    #[test]
    fn test_success_resets_failure_run() {
        let (cb, _clock) = breaker(3, Duration::from_secs(10));
        let id = IdentityKey::User("u".into());
        cb.record_failure(&id, "op");
        cb.record_failure(&id, "op");
        cb.record_success(&id, "op");
        cb.record_failure(&id, "op");
        cb.record_failure(&id, "op");
        assert_eq!(cb.state(&id, "op"), CircuitBreakerState::Closed);
        assert_eq!(cb.consecutive_failures(&id, "op"), 2);
    }

    #[test]
    fn test_operations_and_identities_are_isolated() {
        let (cb, _clock) = breaker(1, Duration::from_secs(10));
        let a = IdentityKey::User("a".into());
        let b = IdentityKey::User("b".into());
        cb.record_failure(&a, "analysis");

        assert!(cb.admit(&a, "analysis").is_err());
        assert!(cb.admit(&a, "summary").is_ok());
        assert!(cb.admit(&b, "analysis").is_ok());
    }

    #[test]
    fn test_state_info_strings() {
        let (cb, _clock) = breaker(1, Duration::from_secs(60));
        let id = IdentityKey::User("u".into());
        assert_eq!(cb.state_info(&id, "op"), "CLOSED (failures: 0)");
        cb.record_failure(&id, "op");
        assert!(cb.state_info(&id, "op").starts_with("OPEN"));
    }

    #[test]
    fn test_released_trial_lets_the_next_caller_in() {
        let (cb, clock) = breaker(2, Duration::from_secs(10));
        let id = IdentityKey::User("u".into());
        cb.record_failure(&id, "op");
        cb.record_failure(&id, "op");
        clock.advance(Duration::from_secs(10));

        let permit = cb.admit(&id, "op").unwrap();
        assert!(matches!(permit, CircuitPermit::Trial(_)));
        assert!(cb.admit(&id, "op").is_err());

        cb.release_trial(&id, "op", permit);
        assert_eq!(cb.state(&id, "op"), CircuitBreakerState::Open);
        assert_eq!(cb.consecutive_failures(&id, "op"), 2);
        assert!(matches!(cb.admit(&id, "op"), Ok(CircuitPermit::Trial(_))));
    }

    #[test]
    fn test_stale_permit_does_not_release_a_newer_trial() {
        let (cb, clock) = breaker(1, Duration::from_secs(10));
        let id = IdentityKey::User("u".into());
        cb.record_failure(&id, "op");
        clock.advance(Duration::from_secs(10));
        let abandoned = cb.admit(&id, "op").unwrap();

        clock.advance(Duration::from_secs(10));
        let current = cb.admit(&id, "op").unwrap();
        assert_ne!(abandoned, current);

        cb.release_trial(&id, "op", abandoned);
        assert_eq!(cb.state(&id, "op"), CircuitBreakerState::HalfOpen);
        cb.release_trial(&id, "op", CircuitPermit::Closed);
        assert_eq!(cb.state(&id, "op"), CircuitBreakerState::HalfOpen);
    }
}
