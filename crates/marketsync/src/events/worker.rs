//! Background worker that drains the event queue.
//!
//! ```ignore
//! let shutdown = Arc::new(AtomicBool::new(false));
//! let worker = QueueWorker::spawn(Arc::clone(&bus), Arc::clone(&shutdown));
//! // ...
//! let report = worker.stop().await;
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::task::JoinHandle;
use tokio::time::{Instant, interval_at};

use super::EventBus;
use super::types::QueueRunStats;

/// Totals accumulated over a worker's lifetime.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
#[must_use = "WorkerReport may contain errors that should be checked"]
pub struct WorkerReport {
    pub passes: u64,
    pub completed: usize,
    pub retried: usize,
    pub failed: usize,
    pub recovered: u64,
    /// Errors from aborted passes and unsettled envelopes; the worker keeps
    /// running after each.
    pub errors: Vec<String>,
    /// Panic message if the worker task panicked.
    pub panic_info: Option<String>,
}

impl WorkerReport {
    fn absorb(&mut self, stats: QueueRunStats) {
        self.passes += 1;
        self.completed += stats.completed;
        self.retried += stats.retried;
        self.failed += stats.failed;
        self.errors.extend(stats.errors);
    }
}

/// Handle to a spawned queue worker.
pub struct QueueWorker {
    bus: Arc<EventBus>,
    shutdown: Arc<AtomicBool>,
    handle: JoinHandle<WorkerReport>,
}

impl QueueWorker {
    /// Spawn a worker that processes the queue until `shutdown` is set.
    ///
    /// The worker sleeps for the bus poll interval when idle, waking early when
    /// a queued trigger or replay notifies the bus. Abandoned claims are
    /// recovered every half claim timeout.
    pub fn spawn(bus: Arc<EventBus>, shutdown: Arc<AtomicBool>) -> Self {
        let task_bus = Arc::clone(&bus);
        let task_shutdown = Arc::clone(&shutdown);
        let handle = tokio::spawn(async move { run(task_bus, task_shutdown).await });
        Self {
            bus,
            shutdown,
            handle,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Request shutdown and wait for the current pass to finish.
    pub async fn stop(self) -> WorkerReport {
        self.shutdown.store(true, Ordering::SeqCst);
        self.bus.wake();
        self.join().await
    }

    /// Wait for the worker to exit on its own (shutdown flag set elsewhere).
    pub async fn join(self) -> WorkerReport {
        match self.handle.await {
            Ok(report) => report,
            Err(e) => {
                tracing::error!("Queue worker panicked: {}", e);
                WorkerReport {
                    panic_info: Some(e.to_string()),
                    ..Default::default()
                }
            }
        }
    }
}

async fn run(bus: Arc<EventBus>, shutdown: Arc<AtomicBool>) -> WorkerReport {
    let mut report = WorkerReport::default();
    let poll_interval = bus.config().poll_interval;
    let recover_every = (bus.config().claim_timeout / 2).max(poll_interval);
    let mut recover_tick = interval_at(Instant::now() + recover_every, recover_every);

    tracing::info!(
        poll_ms = poll_interval.as_millis() as u64,
        "Event queue worker started"
    );

    if let Ok(recovered) = bus.recover_stale().await {
        report.recovered += recovered;
    }

    while !shutdown.load(Ordering::SeqCst) {
        let idle = match bus.process_queue().await {
            Ok(stats) => {
                let idle = stats.claimed == 0;
                report.absorb(stats);
                idle
            }
            Err(e) => {
                tracing::warn!("Event queue pass failed: {}", e);
                report.errors.push(e.to_string());
                true
            }
        };

        if shutdown.load(Ordering::SeqCst) {
            break;
        }

        if idle {
            tokio::select! {
                biased;
                _ = recover_tick.tick() => {
                    match bus.recover_stale().await {
                        Ok(recovered) => report.recovered += recovered,
                        Err(e) => {
                            tracing::warn!("Claim recovery failed: {}", e);
                            report.errors.push(e.to_string());
                        }
                    }
                }
                _ = bus.wait_for_work(poll_interval) => {}
            }
        }
    }

    tracing::info!(
        passes = report.passes,
        completed = report.completed,
        retried = report.retried,
        failed = report.failed,
        "Event queue worker stopped"
    );
    report
}

#[cfg(all(test, feature = "sqlite", feature = "migrate"))]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::events::{EventBusConfig, ListenerSpec, TriggerOptions, handler_fn};

    #[tokio::test]
    async fn worker_drains_queue_and_stops() {
        let db = crate::db::connect_and_migrate("sqlite::memory:").await.unwrap();
        let bus = Arc::new(EventBus::new(
            Arc::new(db),
            EventBusConfig {
                poll_interval: Duration::from_millis(20),
                ..Default::default()
            },
        ));
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        bus.register_handler(
            "count",
            handler_fn(move |_event| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }),
        );
        bus.add_listener(&ListenerSpec::new("order.*", "count"))
            .await
            .unwrap();

        let worker = QueueWorker::spawn(Arc::clone(&bus), Arc::new(AtomicBool::new(false)));
        for i in 0..3 {
            bus.trigger("order.created", json!({"id": i}), TriggerOptions::queued())
                .await
                .unwrap();
        }

        let deadline = Instant::now() + Duration::from_secs(5);
        while calls.load(Ordering::SeqCst) < 3 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let report = worker.stop().await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(report.completed, 3);
        assert!(report.errors.is_empty());
        assert_eq!(bus.queue_counts().await.unwrap().completed, 3);
    }
}
