//! Listener invocation for inline and queued delivery.

use std::collections::BTreeSet;

use chrono::Utc;
use serde_json::Value;
use tokio::time::Instant;

use super::errors::{EventError, ListenerError, Result};
use super::types::{DispatchReport, Event, ListenerOutcome, TriggerOptions};
use super::{EventBus, history, listeners, queue};
use crate::entity::event_envelope::Model as EventEnvelopeModel;
use crate::entity::event_listener::Model as EventListenerModel;
use crate::entity::event_status::DispatchMode;

/// Where a queued envelope ended up after one delivery pass.
pub(super) enum Delivery {
    Completed,
    Retrying,
}

fn panic_message(err: tokio::task::JoinError) -> String {
    if !err.is_panic() {
        return err.to_string();
    }
    let panic = err.into_panic();
    panic
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

impl EventBus {
    async fn matching_listeners(&self, name: &str, payload: &Value) -> Result<Vec<EventListenerModel>> {
        Ok(listeners::active_for(&self.db, name)
            .await?
            .into_iter()
            .filter(|l| listeners::conditions_match(&l.conditions, payload))
            .collect())
    }

    /// Run one listener on its own task so a panic is contained like an error.
    async fn invoke(&self, event: &Event, listener: &EventListenerModel) -> ListenerOutcome {
        let started = Instant::now();
        let result = match self.handler(&listener.handler) {
            None => Err(ListenerError::MissingHandler(listener.handler.clone())),
            Some(handler) => {
                let event = event.clone();
                tokio::spawn(async move { handler.handle(&event).await })
                    .await
                    .unwrap_or_else(|e| Err(ListenerError::Panicked(panic_message(e))))
            }
        };

        if let Err(e) = &result {
            tracing::warn!(
                event = %event.name,
                handler = %listener.handler,
                listener_id = listener.id,
                "Listener failed: {}",
                e
            );
        }

        ListenerOutcome {
            listener_id: listener.id,
            handler: listener.handler.clone(),
            success: result.is_ok(),
            error: result.err().map(|e| e.to_string()),
            duration_ms: started.elapsed().as_millis() as u64,
        }
    }

    async fn invoke_all(&self, event: &Event, listeners: &[EventListenerModel]) -> Vec<ListenerOutcome> {
        let mut outcomes = Vec::with_capacity(listeners.len());
        for listener in listeners {
            outcomes.push(self.invoke(event, listener).await);
        }
        outcomes
    }

    pub(super) async fn dispatch_inline(
        &self,
        name: &str,
        payload: Value,
        options: TriggerOptions,
    ) -> Result<DispatchReport> {
        let started = Instant::now();
        let listeners = self.matching_listeners(name, &payload).await?;
        let event = Event {
            name: name.to_string(),
            payload,
            priority: options.priority,
            queue_id: None,
            attempt: 1,
        };

        let results = self.invoke_all(&event, &listeners).await;
        let execution_time = started.elapsed();

        if let Err(e) = history::record(
            &self.db,
            None,
            name,
            DispatchMode::Sync,
            &event.payload,
            &results,
            execution_time,
        )
        .await
        {
            tracing::warn!(event = %name, "Failed to record dispatch history: {}", e);
        }

        Ok(DispatchReport {
            listeners_called: results.len(),
            execution_time,
            results,
        })
    }

    /// Deliver a claimed envelope to every matching listener still owed it.
    pub(super) async fn deliver(&self, envelope: EventEnvelopeModel) -> Result<Delivery> {
        let started = Instant::now();
        let mut delivered: BTreeSet<i64> = envelope.delivered_listener_ids().into_iter().collect();
        let pending: Vec<EventListenerModel> = self
            .matching_listeners(&envelope.name, &envelope.payload)
            .await?
            .into_iter()
            .filter(|l| !delivered.contains(&l.id))
            .collect();

        let event = Event {
            name: envelope.name.clone(),
            payload: envelope.payload.clone(),
            priority: envelope.priority,
            queue_id: Some(envelope.id),
            attempt: (envelope.attempts + 1).max(1) as u32,
        };
        let results = self.invoke_all(&event, &pending).await;
        delivered.extend(results.iter().filter(|r| r.success).map(|r| r.listener_id));
        let delivered: Vec<i64> = delivered.into_iter().collect();

        history::record(
            &self.db,
            Some(envelope.id),
            &envelope.name,
            DispatchMode::Async,
            &envelope.payload,
            &results,
            started.elapsed(),
        )
        .await?;

        let failures: Vec<String> = results
            .iter()
            .filter(|r| !r.success)
            .map(|r| format!("{}: {}", r.handler, r.error.as_deref().unwrap_or("failed")))
            .collect();

        if failures.is_empty() {
            if !queue::mark_completed(&self.db, &envelope, &delivered).await? {
                tracing::warn!(queue_id = %envelope.id, "Lost claim before completion");
            }
            tracing::debug!(queue_id = %envelope.id, event = %envelope.name, listeners = results.len(), "Event delivered");
            return Ok(Delivery::Completed);
        }

        let error = failures.join("; ");
        let attempts = envelope.attempts + 1;
        if attempts >= envelope.max_attempts {
            queue::mark_failed(&self.db, &envelope, &delivered, &error).await?;
            return Err(EventError::QueueExhausted {
                id: envelope.id,
                name: envelope.name,
                attempts,
                last_error: error,
            });
        }

        let delay = self.config.backoff.delay(&envelope.name, attempts as u32);
        let scheduled_at = Utc::now().fixed_offset() + queue::to_chrono(delay);
        queue::mark_retry(&self.db, &envelope, &delivered, &error, scheduled_at).await?;
        tracing::warn!(
            queue_id = %envelope.id,
            event = %envelope.name,
            attempts,
            retry_in_secs = delay.as_secs(),
            "Event delivery failed, scheduled retry: {}",
            error
        );
        Ok(Delivery::Retrying)
    }
}

#[cfg(all(test, feature = "sqlite", feature = "migrate"))]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::entity::event_status::{EventPriority, EventStatus};
    use crate::events::{
        Backoff, BackoffTable, EventBusConfig, ListenerSpec, TriggerOutcome, handler_fn,
    };

    fn config() -> EventBusConfig {
        EventBusConfig {
            backoff: BackoffTable::new(Arc::new(Backoff::Constant { delay_secs: 0 })),
            ..Default::default()
        }
    }

    async fn bus() -> EventBus {
        let db = crate::db::connect_and_migrate("sqlite::memory:").await.unwrap();
        EventBus::new(Arc::new(db), config())
    }

    fn counting(counter: Arc<AtomicUsize>) -> Arc<dyn crate::events::EventHandler> {
        handler_fn(move |_event| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
    }

    fn failing() -> Arc<dyn crate::events::EventHandler> {
        handler_fn(|_event| async { Err(ListenerError::failed("listener exploded")) })
    }

    #[tokio::test]
    async fn inline_dispatch_isolates_failing_listener() {
        let bus = bus().await;
        let calls = Arc::new(AtomicUsize::new(0));
        bus.register_handler("ok", counting(Arc::clone(&calls)));
        bus.register_handler("bad", failing());
        bus.add_listener(&ListenerSpec::new("order.created", "bad").with_priority(10))
            .await
            .unwrap();
        bus.add_listener(&ListenerSpec::new("order.created", "ok"))
            .await
            .unwrap();

        let outcome = bus
            .trigger("order.created", json!({"id": 1}), TriggerOptions::inline())
            .await
            .unwrap();
        let report = outcome.report().unwrap();

        assert_eq!(report.listeners_called, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(report.results[0].handler, "bad");
        assert_eq!(
            report.results[0].error.as_deref(),
            Some("listener exploded")
        );
        assert!(report.results[1].success);
    }

    #[tokio::test]
    async fn panicking_listener_is_contained() {
        let bus = bus().await;
        let calls = Arc::new(AtomicUsize::new(0));
        bus.register_handler(
            "panics",
            handler_fn(|event: Event| async move {
                if event.name == "anything" {
                    panic!("handler bug");
                }
                Ok::<(), ListenerError>(())
            }),
        );
        bus.register_handler("ok", counting(Arc::clone(&calls)));
        bus.add_listener(&ListenerSpec::new("*", "panics")).await.unwrap();
        bus.add_listener(&ListenerSpec::new("*", "ok")).await.unwrap();

        let outcome = bus
            .trigger("anything", json!({}), TriggerOptions::inline())
            .await
            .unwrap();
        let report = outcome.report().unwrap();
        assert_eq!(report.failures().count(), 1);
        assert!(report.results[0].error.as_deref().unwrap().contains("handler bug"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn conditions_filter_listeners() {
        let bus = bus().await;
        let calls = Arc::new(AtomicUsize::new(0));
        bus.register_handler("trendyol_only", counting(Arc::clone(&calls)));
        bus.add_listener(
            &ListenerSpec::new("product.synced", "trendyol_only")
                .with_condition("marketplace", json!("trendyol")),
        )
        .await
        .unwrap();

        for marketplace in ["n11", "trendyol"] {
            bus.trigger(
                "product.synced",
                json!({"marketplace": marketplace}),
                TriggerOptions::inline(),
            )
            .await
            .unwrap();
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn missing_handler_is_reported_as_listener_error() {
        let bus = bus().await;
        bus.add_listener(&ListenerSpec::new("x", "ghost")).await.unwrap();

        let outcome = bus
            .trigger("x", json!({}), TriggerOptions::inline())
            .await
            .unwrap();
        let report = outcome.report().unwrap();
        assert!(!report.all_succeeded());
        assert!(report.results[0].error.as_deref().unwrap().contains("ghost"));
    }

    #[tokio::test]
    async fn retries_only_listeners_still_owed_delivery() {
        let bus = bus().await;
        let ok_calls = Arc::new(AtomicUsize::new(0));
        let flaky_calls = Arc::new(AtomicUsize::new(0));
        bus.register_handler("ok", counting(Arc::clone(&ok_calls)));
        let flaky_counter = Arc::clone(&flaky_calls);
        bus.register_handler(
            "flaky",
            handler_fn(move |_event| {
                let counter = Arc::clone(&flaky_counter);
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err(ListenerError::failed("first try fails"))
                    } else {
                        Ok(())
                    }
                }
            }),
        );
        bus.add_listener(&ListenerSpec::new("order.paid", "ok")).await.unwrap();
        bus.add_listener(&ListenerSpec::new("order.paid", "flaky"))
            .await
            .unwrap();

        let queue_id = bus
            .trigger("order.paid", json!({}), TriggerOptions::queued())
            .await
            .unwrap()
            .queue_id()
            .unwrap();

        let first = bus.process_queue().await.unwrap();
        assert_eq!(first.retried, 1);
        tokio::time::sleep(Duration::from_millis(20)).await;
        let second = bus.process_queue().await.unwrap();
        assert_eq!(second.completed, 1);

        assert_eq!(ok_calls.load(Ordering::SeqCst), 1);
        assert_eq!(flaky_calls.load(Ordering::SeqCst), 2);
        let envelope = bus.envelope(queue_id).await.unwrap().unwrap();
        assert_eq!(envelope.status, EventStatus::Completed);
        assert_eq!(envelope.attempts, 2);
        assert_eq!(bus.history_for(queue_id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn unsettled_envelope_does_not_abort_the_pass() {
        use sea_orm::ConnectionTrait;

        let db = Arc::new(crate::db::connect_and_migrate("sqlite::memory:").await.unwrap());
        let bus = EventBus::new(Arc::clone(&db), config());
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        // Losing the history table makes every delivery fail to record.
        bus.register_handler(
            "drop_history",
            handler_fn(move |_event| {
                let db = Arc::clone(&db);
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    db.execute_unprepared("DROP TABLE IF EXISTS dispatch_history")
                        .await
                        .map_err(|e| ListenerError::failed(e.to_string()))?;
                    Ok(())
                }
            }),
        );
        bus.add_listener(&ListenerSpec::new("order.*", "drop_history"))
            .await
            .unwrap();

        let mut ids = Vec::new();
        for name in ["order.created", "order.paid"] {
            ids.push(
                bus.trigger(name, json!({}), TriggerOptions::queued())
                    .await
                    .unwrap()
                    .queue_id()
                    .unwrap(),
            );
        }

        let stats = bus.process_queue().await.unwrap();
        assert_eq!(stats.claimed, 2);
        assert_eq!(stats.errors.len(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        for id in ids {
            let envelope = bus.envelope(id).await.unwrap().unwrap();
            assert_eq!(envelope.status, EventStatus::Processing);
        }
    }

    #[tokio::test]
    async fn queued_trigger_returns_queue_id_without_running_listeners() {
        let bus = bus().await;
        let calls = Arc::new(AtomicUsize::new(0));
        bus.register_handler("ok", counting(Arc::clone(&calls)));
        bus.add_listener(&ListenerSpec::new("order.created", "ok"))
            .await
            .unwrap();

        let outcome = bus
            .trigger(
                "order.created",
                json!({}),
                TriggerOptions::queued().with_priority(EventPriority::High),
            )
            .await
            .unwrap();
        assert!(matches!(outcome, TriggerOutcome::Queued { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(bus.queue_counts().await.unwrap().pending, 1);
    }
}
