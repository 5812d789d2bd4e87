use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use super::backoff::BackoffTable;
use super::errors::ListenerError;
use crate::entity::event_status::{DispatchMode, EventPriority};

/// An event as seen by a handler.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub name: String,
    pub payload: Value,
    pub priority: EventPriority,
    /// Set for queued delivery.
    pub queue_id: Option<Uuid>,
    /// 1-based delivery attempt.
    pub attempt: u32,
}

/// A registered handler, looked up by name from listener registrations.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &Event) -> Result<(), ListenerError>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(Event) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), ListenerError>> + Send + 'static,
{
    async fn handle(&self, event: &Event) -> Result<(), ListenerError> {
        (self.0)(event.clone()).await
    }
}

/// Wrap an async closure as a handler.
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn EventHandler>
where
    F: Fn(Event) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), ListenerError>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// Options accepted by `trigger`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerOptions {
    pub mode: DispatchMode,
    pub priority: EventPriority,
    /// Queued delivery only: earliest delivery is `now + delay`.
    pub delay: Duration,
    /// Queued delivery only: overrides the bus default.
    pub max_attempts: Option<u32>,
}

impl Default for TriggerOptions {
    fn default() -> Self {
        Self::inline()
    }
}

impl TriggerOptions {
    /// Run listeners in the caller and return their results.
    pub fn inline() -> Self {
        Self {
            mode: DispatchMode::Sync,
            priority: EventPriority::Normal,
            delay: Duration::ZERO,
            max_attempts: None,
        }
    }

    /// Persist the event and return its queue id.
    pub fn queued() -> Self {
        Self {
            mode: DispatchMode::Async,
            ..Self::inline()
        }
    }

    pub fn with_mode(mut self, mode: DispatchMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_priority(mut self, priority: EventPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }
}

/// Outcome of one listener invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, serde::Deserialize)]
pub struct ListenerOutcome {
    pub listener_id: i64,
    pub handler: String,
    pub success: bool,
    pub error: Option<String>,
    pub duration_ms: u64,
}

/// Aggregate result of an inline dispatch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DispatchReport {
    pub listeners_called: usize,
    #[serde(rename = "execution_time_ms", serialize_with = "as_millis")]
    pub execution_time: Duration,
    pub results: Vec<ListenerOutcome>,
}

fn as_millis<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
}

impl DispatchReport {
    pub fn all_succeeded(&self) -> bool {
        self.results.iter().all(|r| r.success)
    }

    pub fn failures(&self) -> impl Iterator<Item = &ListenerOutcome> {
        self.results.iter().filter(|r| !r.success)
    }
}

/// What `trigger` returns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerOutcome {
    Queued { queue_id: Uuid },
    Dispatched(DispatchReport),
}

impl TriggerOutcome {
    pub fn queue_id(&self) -> Option<Uuid> {
        match self {
            TriggerOutcome::Queued { queue_id } => Some(*queue_id),
            TriggerOutcome::Dispatched(_) => None,
        }
    }

    pub fn report(&self) -> Option<&DispatchReport> {
        match self {
            TriggerOutcome::Dispatched(report) => Some(report),
            TriggerOutcome::Queued { .. } => None,
        }
    }
}

/// Counters for one `process_queue` pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueRunStats {
    pub claimed: usize,
    pub completed: usize,
    pub retried: usize,
    pub failed: usize,
    /// Envelopes whose delivery could not be settled. They stay claimed until
    /// stale-claim recovery returns them to the queue.
    pub errors: Vec<String>,
}

/// Rows removed by `prune`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PruneReport {
    pub envelopes: u64,
    pub history: u64,
    pub api_logs: u64,
}

/// Event bus tunables.
#[derive(Debug, Clone)]
pub struct EventBusConfig {
    /// Sleep between worker passes when the queue is idle.
    pub poll_interval: Duration,
    /// Max envelopes claimed per pass.
    pub claim_batch: u64,
    /// Waiting this long raises an envelope one priority tier.
    pub aging_interval: Duration,
    pub default_max_attempts: u32,
    /// `processing` envelopes older than this are considered abandoned.
    pub claim_timeout: Duration,
    pub queue_retention: Duration,
    pub history_retention: Duration,
    pub api_log_retention: Duration,
    pub backoff: BackoffTable,
}

const DAY: Duration = Duration::from_secs(24 * 60 * 60);

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            claim_batch: 10,
            aging_interval: Duration::from_secs(300),
            default_max_attempts: 3,
            claim_timeout: Duration::from_secs(600),
            queue_retention: 7 * DAY,
            history_retention: 30 * DAY,
            api_log_retention: 30 * DAY,
            backoff: BackoffTable::default(),
        }
    }
}
