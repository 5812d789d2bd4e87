//! Rate limiter bounding outbound calls per endpoint class.
//!
//! Callers block in [`RateLimiter::acquire`] until a slot is free under the
//! endpoint's `{requests, period}` budget, for at most the configured max
//! wait. Counter store failures are fail-open: the call is admitted and the
//! failure is logged.

mod errors;
mod pacer;
mod store;

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::Deserialize;
use serde_json::json;
use tokio::time::Instant;

pub use errors::{RateLimitError, StoreError};
pub use pacer::Pacer;
pub use store::{Admission, CounterStore, DbCounterStore, MemoryCounterStore};

use crate::entity::event_status::EventPriority;
use crate::entity::marketplace::Marketplace;
use crate::events::{EventBus, TriggerOptions};

/// Event emitted whenever a caller gives up waiting for a slot.
pub const RATE_LIMIT_EXCEEDED_EVENT: &str = "api.rate_limit_exceeded";

/// Default bound on how long `acquire` may block.
pub const DEFAULT_MAX_WAIT: Duration = Duration::from_secs(30);

/// `{requests, period}` budget for one endpoint class.
///
/// Deserializes from `{ requests = 50, period_secs = 10 }` or
/// `{ requests = 50, period_ms = 10000 }`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "RawBudget")]
pub struct RateBudget {
    pub requests: u32,
    pub period: Duration,
}

#[derive(Deserialize)]
struct RawBudget {
    requests: u32,
    #[serde(default)]
    period_secs: Option<u64>,
    #[serde(default)]
    period_ms: Option<u64>,
}

impl TryFrom<RawBudget> for RateBudget {
    type Error = String;

    fn try_from(raw: RawBudget) -> Result<Self, Self::Error> {
        let period = match (raw.period_ms, raw.period_secs) {
            (Some(ms), _) => Duration::from_millis(ms),
            (None, Some(secs)) => Duration::from_secs(secs),
            (None, None) => return Err("rate budget needs period_secs or period_ms".to_string()),
        };
        if raw.requests == 0 || period.is_zero() {
            return Err("rate budget requests and period must be positive".to_string());
        }
        Ok(RateBudget::new(raw.requests, period))
    }
}

impl RateBudget {
    pub const fn new(requests: u32, period: Duration) -> Self {
        Self { requests, period }
    }

    pub const fn per_second(requests: u32) -> Self {
        Self::new(requests, Duration::from_secs(1))
    }

    pub fn period_ms(&self) -> i64 {
        self.period.as_millis() as i64
    }
}

/// A rate-limited endpoint class, e.g. Trendyol `products.create` for one seller.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EndpointClass {
    pub marketplace: Marketplace,
    pub tenant_id: Option<String>,
    pub name: String,
}

impl EndpointClass {
    pub fn new(marketplace: Marketplace, tenant_id: Option<&str>, name: impl Into<String>) -> Self {
        Self {
            marketplace,
            tenant_id: tenant_id.map(str::to_string),
            name: name.into(),
        }
    }

    /// Counter key shared by every worker limiting this class.
    pub fn key(&self) -> String {
        match &self.tenant_id {
            Some(tenant) => format!("{}:{}:{}", self.marketplace, tenant, self.name),
            None => format!("{}:{}", self.marketplace, self.name),
        }
    }

    fn pacer_key(&self) -> String {
        match &self.tenant_id {
            Some(tenant) => format!("{}:{}", self.marketplace, tenant),
            None => self.marketplace.to_string(),
        }
    }
}

/// Limits applied to one `acquire` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimitPolicy {
    pub budget: RateBudget,
    pub max_wait: Duration,
    /// Optional steady pacing across all endpoint classes of a marketplace.
    pub max_rps: Option<u32>,
}

impl LimitPolicy {
    pub fn new(budget: RateBudget) -> Self {
        Self {
            budget,
            max_wait: DEFAULT_MAX_WAIT,
            max_rps: None,
        }
    }

    #[must_use]
    pub fn with_max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = max_wait;
        self
    }

    #[must_use]
    pub fn with_max_rps(mut self, max_rps: Option<u32>) -> Self {
        self.max_rps = max_rps;
        self
    }
}

/// Proof that a slot was taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Permit {
    pub waited: Duration,
    /// Slots left in the trailing period; `None` when the store failed open.
    pub remaining: Option<u32>,
}

/// The rate limiter shared by every executor in the process.
pub struct RateLimiter {
    store: Arc<dyn CounterStore>,
    pacers: DashMap<String, Pacer>,
    events: Option<Arc<EventBus>>,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn CounterStore>) -> Self {
        Self {
            store,
            pacers: DashMap::new(),
            events: None,
        }
    }

    /// Limiter backed by a process-local store.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryCounterStore::new()))
    }

    /// Emit `api.rate_limit_exceeded` on rejection through `bus`.
    #[must_use]
    pub fn with_event_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.events = Some(bus);
        self
    }

    /// Block until `class` may issue one call, or fail with `RateLimited`.
    pub async fn acquire(
        &self,
        class: &EndpointClass,
        policy: &LimitPolicy,
    ) -> Result<Permit, RateLimitError> {
        let started = Instant::now();
        let deadline = started + policy.max_wait;
        let key = class.key();

        if let Some(rps) = policy.max_rps {
            let pacer = self.pacer_for(class, rps);
            if tokio::time::timeout_at(deadline, pacer.wait()).await.is_err() {
                return Err(self.reject(class, policy, Duration::from_secs(1)).await);
            }
        }

        loop {
            match self.store.try_acquire(&key, &policy.budget).await {
                Ok(Admission::Granted { remaining }) => {
                    let waited = started.elapsed();
                    tracing::debug!(key = %key, remaining, waited_ms = waited.as_millis() as u64, "Rate limit slot acquired");
                    return Ok(Permit {
                        waited,
                        remaining: Some(remaining),
                    });
                }
                Ok(Admission::Denied { retry_after }) => {
                    let retry_after = retry_after.max(Duration::from_millis(1));
                    if Instant::now() + retry_after > deadline {
                        return Err(self.reject(class, policy, retry_after).await);
                    }
                    tracing::debug!(key = %key, wait_ms = retry_after.as_millis() as u64, "Rate limit budget exhausted, waiting");
                    tokio::time::sleep(retry_after).await;
                }
                Err(e) => {
                    tracing::warn!(key = %key, "Rate limit store unavailable, admitting call: {}", e);
                    return Ok(Permit {
                        waited: started.elapsed(),
                        remaining: None,
                    });
                }
            }
        }
    }

    fn pacer_for(&self, class: &EndpointClass, rps: u32) -> Pacer {
        let key = class.pacer_key();
        if let Some(pacer) = self.pacers.get(&key)
            && pacer.rps() == rps
        {
            return pacer.clone();
        }
        let pacer = Pacer::new(rps);
        self.pacers.insert(key, pacer.clone());
        pacer
    }

    async fn reject(
        &self,
        class: &EndpointClass,
        policy: &LimitPolicy,
        retry_after: Duration,
    ) -> RateLimitError {
        let key = class.key();
        tracing::warn!(
            key = %key,
            retry_after_ms = retry_after.as_millis() as u64,
            "Rate limit wait would exceed {:?}, rejecting call",
            policy.max_wait
        );

        if let Some(bus) = &self.events {
            let payload = json!({
                "marketplace": class.marketplace,
                "tenant_id": class.tenant_id,
                "endpoint": class.name,
                "key": key,
                "limit": policy.budget.requests,
                "period_ms": policy.budget.period_ms(),
                "retry_after_ms": retry_after.as_millis() as u64,
            });
            let options = TriggerOptions::queued().with_priority(EventPriority::High);
            if let Err(e) = bus.trigger(RATE_LIMIT_EXCEEDED_EVENT, payload, options).await {
                tracing::warn!(key = %key, "Failed to emit {}: {}", RATE_LIMIT_EXCEEDED_EVENT, e);
            }
        }

        RateLimitError::RateLimited { key, retry_after }
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("pacers", &self.pacers.len())
            .field("events", &self.events.is_some())
            .finish()
    }
}
