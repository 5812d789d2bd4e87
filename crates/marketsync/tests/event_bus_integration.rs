//! Integration tests for the event bus queue.
//!
//! These drive the bus through its public API against an in-memory SQLite
//! database, the way a host process would.
//!
//! Key scenarios tested:
//! - Higher priority envelopes are delivered first regardless of age
//! - An always-failing listener exhausts its attempts and is never reprocessed
//! - A failed envelope can be replayed by an operator
//! - A queued `order.created` completes with one history record
//! - The background worker drains the queue and stops on shutdown

#![cfg(all(feature = "sqlite", feature = "migrate"))]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use marketsync::connect_and_migrate;
use marketsync::entity::event_status::{EventPriority, EventStatus};
use marketsync::events::{
    Backoff, BackoffTable, EventBus, EventBusConfig, EventHandler, ListenerError, ListenerOutcome,
    ListenerSpec, QueueWorker, TriggerOptions, handler_fn,
};
use serde_json::json;

/// Upper bound for anything that should finish promptly.
const FAST_TIMEOUT: Duration = Duration::from_secs(5);

/// Bus with immediate retries so exhaustion can be driven pass by pass.
async fn setup_bus(claim_batch: u64) -> Arc<EventBus> {
    let db = connect_and_migrate("sqlite::memory:")
        .await
        .expect("Failed to create test database");
    let config = EventBusConfig {
        claim_batch,
        poll_interval: Duration::from_millis(20),
        backoff: BackoffTable::new(Arc::new(Backoff::Constant { delay_secs: 0 })),
        ..Default::default()
    };
    Arc::new(EventBus::new(Arc::new(db), config))
}

/// Handler that appends the event name to `log`.
fn recording(log: Arc<Mutex<Vec<String>>>) -> Arc<dyn EventHandler> {
    handler_fn(move |event| {
        let log = Arc::clone(&log);
        async move {
            log.lock().unwrap().push(event.name);
            Ok(())
        }
    })
}

#[tokio::test]
async fn test_critical_envelope_dispatches_before_older_normal_one() {
    let bus = setup_bus(1).await;
    let log = Arc::new(Mutex::new(Vec::new()));
    bus.register_handler("record", recording(Arc::clone(&log)));
    bus.add_listener(&ListenerSpec::new("*", "record"))
        .await
        .unwrap();

    bus.trigger(
        "b.normal",
        json!({}),
        TriggerOptions::queued().with_priority(EventPriority::Normal),
    )
    .await
    .unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    bus.trigger(
        "a.critical",
        json!({}),
        TriggerOptions::queued().with_priority(EventPriority::Critical),
    )
    .await
    .unwrap();

    // One envelope per pass makes the claim order observable.
    assert_eq!(bus.process_queue().await.unwrap().completed, 1);
    assert_eq!(bus.process_queue().await.unwrap().completed, 1);

    assert_eq!(*log.lock().unwrap(), vec!["a.critical", "b.normal"]);
}

#[tokio::test]
async fn test_same_priority_is_first_in_first_out() {
    let bus = setup_bus(10).await;
    let log = Arc::new(Mutex::new(Vec::new()));
    bus.register_handler("record", recording(Arc::clone(&log)));
    bus.add_listener(&ListenerSpec::new("order.*", "record"))
        .await
        .unwrap();

    for name in ["order.created", "order.paid", "order.shipped"] {
        bus.trigger(name, json!({}), TriggerOptions::queued())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    bus.process_queue().await.unwrap();

    assert_eq!(
        *log.lock().unwrap(),
        vec!["order.created", "order.paid", "order.shipped"]
    );
}

#[tokio::test]
async fn test_always_failing_listener_exhausts_attempts() {
    let bus = setup_bus(10).await;
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    bus.register_handler(
        "broken",
        handler_fn(move |_event| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(ListenerError::failed("downstream rejected the event"))
            }
        }),
    );
    bus.add_listener(&ListenerSpec::new("stock.changed", "broken"))
        .await
        .unwrap();

    let queue_id = bus
        .trigger(
            "stock.changed",
            json!({"sku": "SKU-1"}),
            TriggerOptions::queued().with_max_attempts(3),
        )
        .await
        .unwrap()
        .queue_id()
        .unwrap();

    let mut failed = 0;
    for _ in 0..6 {
        failed += bus.process_queue().await.unwrap().failed;
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    assert_eq!(failed, 1);
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    let envelope = bus.envelope(queue_id).await.unwrap().unwrap();
    assert_eq!(envelope.status, EventStatus::Failed);
    assert_eq!(envelope.attempts, 3);
    assert!(
        envelope
            .last_error
            .as_deref()
            .unwrap()
            .contains("downstream rejected")
    );
    assert_eq!(bus.history_for(queue_id).await.unwrap().len(), 3);
    assert_eq!(bus.queue_counts().await.unwrap().failed, 1);

    // Terminal envelopes stay put until an operator replays them.
    assert_eq!(bus.process_queue().await.unwrap().claimed, 0);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_replay_gives_failed_envelope_a_fresh_start() {
    let bus = setup_bus(10).await;
    let healthy = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&healthy);
    bus.register_handler(
        "gated",
        handler_fn(move |_event| {
            let flag = Arc::clone(&flag);
            async move {
                if flag.load(Ordering::SeqCst) {
                    Ok(())
                } else {
                    Err(ListenerError::failed("warehouse offline"))
                }
            }
        }),
    );
    bus.add_listener(&ListenerSpec::new("order.created", "gated"))
        .await
        .unwrap();

    let queue_id = bus
        .trigger(
            "order.created",
            json!({"order_id": 7}),
            TriggerOptions::queued().with_max_attempts(1),
        )
        .await
        .unwrap()
        .queue_id()
        .unwrap();
    assert_eq!(bus.process_queue().await.unwrap().failed, 1);

    healthy.store(true, Ordering::SeqCst);
    let replayed = bus.replay(queue_id).await.unwrap();
    assert_eq!(replayed.status, EventStatus::Pending);
    assert_eq!(replayed.attempts, 0);

    assert_eq!(bus.process_queue().await.unwrap().completed, 1);
    let envelope = bus.envelope(queue_id).await.unwrap().unwrap();
    assert_eq!(envelope.status, EventStatus::Completed);
}

#[tokio::test]
async fn test_order_created_completes_with_one_history_record() {
    let bus = setup_bus(10).await;
    let log = Arc::new(Mutex::new(Vec::new()));
    bus.register_handler("notify_warehouse", recording(Arc::clone(&log)));
    let listener = bus
        .add_listener(&ListenerSpec::new("order.created", "notify_warehouse"))
        .await
        .unwrap();

    let queue_id = bus
        .trigger(
            "order.created",
            json!({"order_id": 42, "marketplace": "trendyol"}),
            TriggerOptions::queued().with_priority(EventPriority::High),
        )
        .await
        .unwrap()
        .queue_id()
        .unwrap();

    let queued = bus.envelope(queue_id).await.unwrap().unwrap();
    assert_eq!(queued.status, EventStatus::Pending);
    assert_eq!(queued.priority, EventPriority::High);

    let stats = bus.process_queue().await.unwrap();
    assert_eq!(stats.claimed, 1);
    assert_eq!(stats.completed, 1);

    let envelope = bus.envelope(queue_id).await.unwrap().unwrap();
    assert_eq!(envelope.status, EventStatus::Completed);
    assert!(envelope.claimed_at.is_some());
    assert!(envelope.completed_at.is_some());
    assert_eq!(envelope.delivered_listener_ids(), vec![listener.id]);

    let history = bus.history_for(queue_id).await.unwrap();
    assert_eq!(history.len(), 1);
    assert!(history[0].success);
    let outcomes: Vec<ListenerOutcome> =
        serde_json::from_value(history[0].listeners.clone()).unwrap();
    assert_eq!(outcomes.len(), 1);
    assert_eq!(outcomes[0].handler, "notify_warehouse");
    assert_eq!(outcomes[0].listener_id, listener.id);

    assert_eq!(*log.lock().unwrap(), vec!["order.created"]);

    let stats = bus.get_stats(Duration::from_secs(3600)).await.unwrap();
    assert_eq!(stats.total_dispatched(), 1);
}

#[tokio::test]
async fn test_inline_dispatch_reports_failing_sibling() {
    let bus = setup_bus(10).await;
    let log = Arc::new(Mutex::new(Vec::new()));
    bus.register_handler("audit", recording(Arc::clone(&log)));
    bus.register_handler(
        "crm",
        handler_fn(|_event| async { Err(ListenerError::failed("crm timeout")) }),
    );
    bus.add_listener(&ListenerSpec::new("order.cancelled", "crm").with_priority(5))
        .await
        .unwrap();
    bus.add_listener(&ListenerSpec::new("order.cancelled", "audit"))
        .await
        .unwrap();

    let outcome = bus
        .trigger("order.cancelled", json!({}), TriggerOptions::inline())
        .await
        .unwrap();
    let report = outcome.report().unwrap();

    assert_eq!(report.listeners_called, 2);
    assert_eq!(*log.lock().unwrap(), vec!["order.cancelled"]);
    let failures: Vec<_> = report.failures().collect();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].handler, "crm");
    assert_eq!(failures[0].error.as_deref(), Some("crm timeout"));
}

#[tokio::test]
async fn test_worker_drains_queue_and_stops_on_shutdown() {
    let bus = setup_bus(10).await;
    let log = Arc::new(Mutex::new(Vec::new()));
    bus.register_handler("record", recording(Arc::clone(&log)));
    bus.add_listener(&ListenerSpec::new("product.*", "record"))
        .await
        .unwrap();

    let shutdown = Arc::new(AtomicBool::new(false));
    let worker = QueueWorker::spawn(Arc::clone(&bus), Arc::clone(&shutdown));

    for i in 0..5 {
        bus.trigger(
            "product.synced",
            json!({"local_id": i}),
            TriggerOptions::queued(),
        )
        .await
        .unwrap();
    }

    let drained = tokio::time::timeout(FAST_TIMEOUT, async {
        loop {
            if bus.queue_counts().await.unwrap().completed == 5 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(drained.is_ok(), "worker did not drain the queue in time");

    let report = tokio::time::timeout(FAST_TIMEOUT, worker.stop())
        .await
        .expect("worker did not stop in time");
    assert!(report.errors.is_empty(), "worker errors: {:?}", report.errors);
    assert!(report.panic_info.is_none());
    assert_eq!(report.completed, 5);
    assert_eq!(log.lock().unwrap().len(), 5);
}
