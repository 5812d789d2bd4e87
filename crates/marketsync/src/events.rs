//! Event bus: listener registry, inline and queued dispatch.
//!
//! One [`EventBus`] is constructed per process and shared via `Arc`. Handlers
//! are registered by name; listener registrations live in the database and
//! refer to handlers by that name.
//!
//! Queued events move through `pending -> processing -> {completed | failed |
//! retry}`. A retry becomes claimable again at `now + backoff(attempts)`
//! until `attempts >= max_attempts`, after which the envelope is terminally
//! `failed` until replayed.

mod backoff;
mod dispatch;
mod errors;
mod history;
mod listeners;
mod queue;
mod types;
mod worker;

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::Utc;
use sea_orm::DatabaseConnection;
use serde_json::Value;
use tokio::sync::Notify;
use uuid::Uuid;

pub use backoff::{Backoff, BackoffPolicy, BackoffTable};
pub use errors::{EventError, ListenerError, Result};
pub use history::{EventStat, EventStats};
pub use listeners::{ListenerSpec, conditions_match, lookup_path, pattern_matches};
pub use queue::QueueCounts;
pub use types::{
    DispatchReport, Event, EventBusConfig, EventHandler, ListenerOutcome, PruneReport,
    QueueRunStats, TriggerOptions, TriggerOutcome, handler_fn,
};
pub use worker::{QueueWorker, WorkerReport};

use crate::entity::dispatch_history::Model as DispatchHistoryModel;
use crate::entity::event_envelope::Model as EventEnvelopeModel;
use crate::entity::event_listener::Model as EventListenerModel;
use crate::entity::event_status::DispatchMode;

/// Process-wide event bus.
pub struct EventBus {
    db: Arc<DatabaseConnection>,
    config: EventBusConfig,
    handlers: RwLock<HashMap<String, Arc<dyn EventHandler>>>,
    wake: Notify,
}

impl EventBus {
    pub fn new(db: Arc<DatabaseConnection>, config: EventBusConfig) -> Self {
        Self {
            db,
            config,
            handlers: RwLock::new(HashMap::new()),
            wake: Notify::new(),
        }
    }

    pub fn config(&self) -> &EventBusConfig {
        &self.config
    }

    /// Add `handler` to the handler table under `name`, replacing any previous entry.
    pub fn register_handler(&self, name: impl Into<String>, handler: Arc<dyn EventHandler>) {
        let name = name.into();
        tracing::debug!(handler = %name, "Registered event handler");
        self.handlers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name, handler);
    }

    pub fn handler(&self, name: &str) -> Option<Arc<dyn EventHandler>> {
        self.handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
    }

    pub fn handler_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Register a listener. Idempotent per `(event_name, handler)`; re-adding a
    /// deactivated listener reactivates it.
    pub async fn add_listener(&self, spec: &ListenerSpec) -> Result<EventListenerModel> {
        let listener = listeners::add(&self.db, spec).await?;
        tracing::debug!(event = %spec.event_name, handler = %spec.handler, "Listener registered");
        Ok(listener)
    }

    /// Deactivate a listener; its history is kept.
    pub async fn remove_listener(&self, event_name: &str, handler: &str) -> Result<bool> {
        listeners::remove(&self.db, event_name, handler).await
    }

    /// Active listeners for `event_name` in invocation order.
    pub async fn listeners_for(&self, event_name: &str) -> Result<Vec<EventListenerModel>> {
        listeners::active_for(&self.db, event_name).await
    }

    pub async fn all_listeners(&self) -> Result<Vec<EventListenerModel>> {
        listeners::all(&self.db).await
    }

    /// Trigger an event.
    ///
    /// Inline mode runs the matching listeners now and returns their results.
    /// Queued mode persists an envelope, wakes the worker, and returns the
    /// queue id.
    pub async fn trigger(
        &self,
        name: &str,
        payload: Value,
        options: TriggerOptions,
    ) -> Result<TriggerOutcome> {
        match options.mode {
            DispatchMode::Sync => {
                let report = self.dispatch_inline(name, payload, options).await?;
                Ok(TriggerOutcome::Dispatched(report))
            }
            DispatchMode::Async => {
                let max_attempts = options
                    .max_attempts
                    .unwrap_or(self.config.default_max_attempts);
                let envelope = queue::enqueue(
                    &self.db,
                    name,
                    payload,
                    options.priority,
                    options.delay,
                    max_attempts,
                )
                .await?;
                tracing::debug!(event = %name, queue_id = %envelope.id, priority = %options.priority, "Event queued");
                self.wake.notify_one();
                Ok(TriggerOutcome::Queued {
                    queue_id: envelope.id,
                })
            }
        }
    }

    /// Claim due envelopes and deliver them, highest effective priority first.
    pub async fn process_queue(&self) -> Result<QueueRunStats> {
        let now = Utc::now().fixed_offset();
        let claimed = queue::claim_due(
            &self.db,
            now,
            self.config.claim_batch.max(1),
            self.config.aging_interval,
        )
        .await?;

        let mut stats = QueueRunStats {
            claimed: claimed.len(),
            ..Default::default()
        };
        for envelope in claimed {
            let queue_id = envelope.id;
            match self.deliver(envelope).await {
                Ok(dispatch::Delivery::Completed) => stats.completed += 1,
                Ok(dispatch::Delivery::Retrying) => stats.retried += 1,
                Err(e @ EventError::QueueExhausted { .. }) => {
                    tracing::warn!("{}", e);
                    stats.failed += 1;
                }
                Err(e) => {
                    tracing::warn!(queue_id = %queue_id, "Could not settle envelope: {}", e);
                    stats.errors.push(format!("{}: {}", queue_id, e));
                }
            }
        }

        if stats.claimed > 0 {
            tracing::info!(
                claimed = stats.claimed,
                completed = stats.completed,
                retried = stats.retried,
                failed = stats.failed,
                errors = stats.errors.len(),
                "Processed event queue"
            );
        }
        Ok(stats)
    }

    /// Return abandoned `processing` envelopes to `retry`.
    pub async fn recover_stale(&self) -> Result<u64> {
        let recovered = queue::recover_stale(&self.db, self.config.claim_timeout).await?;
        if recovered > 0 {
            tracing::warn!(recovered, "Recovered abandoned event claims");
            self.wake.notify_one();
        }
        Ok(recovered)
    }

    /// Reset a terminally failed envelope for another round of delivery.
    pub async fn replay(&self, queue_id: Uuid) -> Result<EventEnvelopeModel> {
        let envelope = queue::replay(&self.db, queue_id).await?;
        tracing::info!(queue_id = %queue_id, event = %envelope.name, "Replaying failed event");
        self.wake.notify_one();
        Ok(envelope)
    }

    /// Delete terminal envelopes, history and API call logs past retention.
    pub async fn prune(&self) -> Result<PruneReport> {
        let now = Utc::now().fixed_offset();
        let envelopes =
            queue::prune(&self.db, queue::before(now, self.config.queue_retention)).await?;
        let history =
            history::prune(&self.db, queue::before(now, self.config.history_retention))
                .await?;
        let api_logs = crate::executor::prune_call_logs(
            &self.db,
            queue::before(now, self.config.api_log_retention),
        )
        .await?;

        let report = PruneReport {
            envelopes,
            history,
            api_logs,
        };
        tracing::info!(?report, "Pruned event data");
        Ok(report)
    }

    pub async fn envelope(&self, queue_id: Uuid) -> Result<Option<EventEnvelopeModel>> {
        queue::find(&self.db, queue_id).await
    }

    pub async fn history_for(&self, queue_id: Uuid) -> Result<Vec<DispatchHistoryModel>> {
        history::for_envelope(&self.db, queue_id).await
    }

    pub async fn queue_counts(&self) -> Result<QueueCounts> {
        queue::counts(&self.db).await
    }

    /// Per-event dispatch statistics over the trailing `timeframe`.
    pub async fn get_stats(&self, timeframe: Duration) -> Result<EventStats> {
        history::stats(&self.db, timeframe).await
    }

    /// Wake the worker without waiting for the poll interval.
    pub fn wake(&self) {
        self.wake.notify_one();
    }

    pub(crate) async fn wait_for_work(&self, timeout: Duration) {
        let _ = tokio::time::timeout(timeout, self.wake.notified()).await;
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("config", &self.config)
            .field("handlers", &self.handler_names())
            .finish()
    }
}
