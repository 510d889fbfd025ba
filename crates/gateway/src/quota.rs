//! Per-identity hourly quota accounting.
//!
//! Each identity owns one `QuotaWindow` counting requests, AI calls and
//! accumulated cost. Windows reset lazily: the first access after the hour
//! has elapsed zeroes the counters and restarts the window at `now`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::clock::{elapsed_between, Clock, SystemClock};
use crate::identity::{IdentityKey, TrustTier};
use crate::store::{DashMapStore, StateStore};

pub const QUOTA_WINDOW: Duration = Duration::from_secs(60 * 60);

/// Hourly limits for one trust tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaCeiling {
    pub hourly_requests: u32,
    pub hourly_ai_calls: u32,
    pub hourly_cost_cents: u64,
}

impl QuotaCeiling {
    pub const fn new(hourly_requests: u32, hourly_ai_calls: u32, hourly_cost_cents: u64) -> Self {
        Self {
            hourly_requests,
            hourly_ai_calls,
            hourly_cost_cents,
        }
    }

    fn strictly_below(&self, other: &QuotaCeiling) -> bool {
        self.hourly_requests < other.hourly_requests
            && self.hourly_ai_calls < other.hourly_ai_calls
            && self.hourly_cost_cents < other.hourly_cost_cents
    }

    fn at_most(&self, other: &QuotaCeiling) -> bool {
        self.hourly_requests <= other.hourly_requests
            && self.hourly_ai_calls <= other.hourly_ai_calls
            && self.hourly_cost_cents <= other.hourly_cost_cents
    }
}

/// Ceiling table: one entry per trust tier plus the IP-keyed ceiling used
/// for unauthenticated traffic
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuotaCeilings {
    pub none: QuotaCeiling,
    pub basic: QuotaCeiling,
    pub verified: QuotaCeiling,
    pub anonymous: QuotaCeiling,
}

impl Default for QuotaCeilings {
    fn default() -> Self {
        Self {
            none: QuotaCeiling::new(100, 10, 50),
            basic: QuotaCeiling::new(500, 25, 200),
            verified: QuotaCeiling::new(2000, 100, 1000),
            anonymous: QuotaCeiling::new(50, 5, 25),
        }
    }
}

impl QuotaCeilings {
    pub fn for_tier(&self, tier: TrustTier) -> QuotaCeiling {
        match tier {
            TrustTier::None => self.none,
            TrustTier::Basic => self.basic,
            TrustTier::Verified => self.verified,
        }
    }

    /// IP keys ignore the tier entirely
    pub fn for_key(&self, key: &IdentityKey, tier: TrustTier) -> QuotaCeiling {
        match key {
            IdentityKey::User(_) => self.for_tier(tier),
            IdentityKey::Ip(_) => self.anonymous,
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if !self.none.strictly_below(&self.basic) {
            return Err("tier 'none' must be strictly below 'basic' on every limit".to_string());
        }
        if !self.basic.strictly_below(&self.verified) {
            return Err("tier 'basic' must be strictly below 'verified' on every limit".to_string());
        }
        if !self.anonymous.at_most(&self.none) {
            return Err("anonymous ceiling must not exceed tier 'none'".to_string());
        }
        Ok(())
    }
}

/// Counters for one identity within the current hour
#[derive(Debug, Clone, PartialEq)]
pub struct QuotaWindow {
    pub requests: u32,
    pub ai_calls: u32,
    pub cost_cents: u64,
    pub window_start: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

impl QuotaWindow {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            requests: 0,
            ai_calls: 0,
            cost_cents: 0,
            window_start: now,
            last_seen: now,
        }
    }

    fn roll(&mut self, now: DateTime<Utc>, length: Duration) {
        if elapsed_between(self.window_start, now) >= length {
            self.requests = 0;
            self.ai_calls = 0;
            self.cost_cents = 0;
            self.window_start = now;
        }
        self.last_seen = now;
    }

    fn window_end(&self, length: Duration) -> DateTime<Utc> {
        self.window_start + chrono::Duration::from_std(length).unwrap_or_else(|_| chrono::Duration::hours(1))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuotaDimension {
    Requests,
    AiCalls,
    Cost,
}

impl fmt::Display for QuotaDimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            QuotaDimension::Requests => "hourly request",
            QuotaDimension::AiCalls => "hourly AI call",
            QuotaDimension::Cost => "hourly cost",
        })
    }
}

/// Limit, headroom and reset time for one counter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CeilingStatus {
    pub limit: u64,
    pub remaining: u64,
    pub reset_at: DateTime<Utc>,
}

/// Returned when an admission check fails
#[derive(Debug, Clone, PartialEq)]
pub struct QuotaDenial {
    pub dimension: QuotaDimension,
    pub retry_after: Duration,
    pub ceiling: CeilingStatus,
}

impl fmt::Display for QuotaDenial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} limit of {} reached, retry in {}s",
            self.dimension,
            self.ceiling.limit,
            self.retry_after.as_secs()
        )
    }
}

/// Headroom after a successful admission, used for rate limit headers
#[derive(Debug, Clone, PartialEq)]
pub struct QuotaGrant {
    pub requests: CeilingStatus,
    pub ai_calls: Option<CeilingStatus>,
}

/// Hourly request/AI-call/cost accounting keyed by identity
pub struct QuotaTracker<S = DashMapStore<IdentityKey, QuotaWindow>>
where
    S: StateStore<IdentityKey, QuotaWindow>,
{
    store: S,
    ceilings: QuotaCeilings,
    clock: Arc<dyn Clock>,
    window: Duration,
}

impl QuotaTracker {
    pub fn new(ceilings: QuotaCeilings) -> Self {
        Self::with_clock(ceilings, Arc::new(SystemClock))
    }

    pub fn with_clock(ceilings: QuotaCeilings, clock: Arc<dyn Clock>) -> Self {
        Self::with_store(DashMapStore::new(), ceilings, clock)
    }
}

impl<S> QuotaTracker<S>
where
    S: StateStore<IdentityKey, QuotaWindow>,
{
    pub fn with_store(store: S, ceilings: QuotaCeilings, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            ceilings,
            clock,
            window: QUOTA_WINDOW,
        }
    }

    pub fn ceilings(&self) -> &QuotaCeilings {
        &self.ceilings
    }

    /// Admission check. Counts the request (and AI call) on success; cost is
    /// only ever added through `reconcile`.
    pub fn admit(
        &self,
        key: &IdentityKey,
        tier: TrustTier,
        is_ai_call: bool,
        estimated_cost_cents: u64,
    ) -> Result<QuotaGrant, QuotaDenial> {
        let decision = self.decide(key, tier, is_ai_call, estimated_cost_cents, true);
        match &decision {
            Ok(_) => debug!(identity = %key, is_ai_call, "quota admitted"),
            Err(denial) => warn!(identity = %key, reason = %denial, "🚫 quota denied"),
        }
        decision
    }

    /// Same ceilings as `admit` without counting anything
    pub fn check(
        &self,
        key: &IdentityKey,
        tier: TrustTier,
        is_ai_call: bool,
        estimated_cost_cents: u64,
    ) -> Result<QuotaGrant, QuotaDenial> {
        self.decide(key, tier, is_ai_call, estimated_cost_cents, false)
    }

    fn decide(
        &self,
        key: &IdentityKey,
        tier: TrustTier,
        is_ai_call: bool,
        estimated_cost_cents: u64,
        charge: bool,
    ) -> Result<QuotaGrant, QuotaDenial> {
        let now = self.clock.now();
        let ceiling = self.ceilings.for_key(key, tier);
        let length = self.window;

        self.store.with_entry(
            key,
            || QuotaWindow::new(now),
            |window| {
                window.roll(now, length);
                let reset_at = window.window_end(length);
                let retry_after = elapsed_between(now, reset_at);

                let deny = |dimension, limit: u64, used: u64| QuotaDenial {
                    dimension,
                    retry_after,
                    ceiling: CeilingStatus {
                        limit,
                        remaining: limit.saturating_sub(used),
                        reset_at,
                    },
                };

                if window.requests >= ceiling.hourly_requests {
                    return Err(deny(
                        QuotaDimension::Requests,
                        ceiling.hourly_requests as u64,
                        window.requests as u64,
                    ));
                }
                if is_ai_call {
                    if window.ai_calls >= ceiling.hourly_ai_calls {
                        return Err(deny(
                            QuotaDimension::AiCalls,
                            ceiling.hourly_ai_calls as u64,
                            window.ai_calls as u64,
                        ));
                    }
                    if window.cost_cents.saturating_add(estimated_cost_cents) > ceiling.hourly_cost_cents {
                        return Err(deny(
                            QuotaDimension::Cost,
                            ceiling.hourly_cost_cents,
                            window.cost_cents,
                        ));
                    }
                }

                // A peek reports the headroom this call would leave
                let requests = window.requests + 1;
                let ai_calls = window.ai_calls + u32::from(is_ai_call);
                if charge {
                    window.requests = requests;
                    window.ai_calls = ai_calls;
                }

                Ok(QuotaGrant {
                    requests: CeilingStatus {
                        limit: ceiling.hourly_requests as u64,
                        remaining: (ceiling.hourly_requests - requests) as u64,
                        reset_at,
                    },
                    ai_calls: is_ai_call.then(|| CeilingStatus {
                        limit: ceiling.hourly_ai_calls as u64,
                        remaining: (ceiling.hourly_ai_calls - ai_calls) as u64,
                        reset_at,
                    }),
                })
            },
        )
    }

    /// Add the vendor-reported cost of a completed call to the window
    pub fn reconcile(&self, key: &IdentityKey, actual_cost_cents: u64) {
        let now = self.clock.now();
        let length = self.window;
        let total = self.store.with_entry(
            key,
            || QuotaWindow::new(now),
            |window| {
                window.roll(now, length);
                window.cost_cents = window.cost_cents.saturating_add(actual_cost_cents);
                window.cost_cents
            },
        );
        debug!(identity = %key, actual_cost_cents, total_cost_cents = total, "quota reconciled");
    }

    pub fn window(&self, key: &IdentityKey) -> Option<QuotaWindow> {
        self.store.get(key)
    }

    /// Drop windows for identities not seen within `max_idle`
    pub fn evict_idle(&self, max_idle: Duration) -> usize {
        let now = self.clock.now();
        let evicted = self
            .store
            .retain(|_, window| elapsed_between(window.last_seen, now) < max_idle);
        if evicted > 0 {
            debug!(evicted, "evicted idle quota windows");
        }
        evicted
    }

    pub fn tracked_identities(&self) -> usize {
        self.store.len()
    }
}
