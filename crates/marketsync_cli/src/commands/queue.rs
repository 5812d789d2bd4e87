//! `marketsync queue` - drive and maintain the asynchronous event queue.

use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use clap::Subcommand;
use console::style;
use marketsync::events::QueueWorker;
use marketsync::settings::Settings;
use uuid::Uuid;

use super::shared::Engine;

#[derive(Debug, Clone, Subcommand)]
pub(crate) enum QueueAction {
    /// Run the queue worker until Ctrl+C
    Work,
    /// Run a single processing pass and exit
    Process,
    /// Reset a failed envelope so it is delivered again
    Replay {
        /// Queue id printed by `trigger` or found in the logs
        queue_id: Uuid,
    },
    /// Return envelopes abandoned by a crashed worker to the queue
    Recover,
    /// Delete finished envelopes, history and API call logs past retention
    Prune,
}

pub(crate) async fn handle_queue(
    action: QueueAction,
    settings: Settings,
    database_url: &str,
    shutdown: Arc<AtomicBool>,
) -> Result<(), Box<dyn std::error::Error>> {
    let engine = Engine::without_catalog(settings, database_url).await?;
    let bus = &engine.bus;

    match action {
        QueueAction::Work => {
            tracing::info!(
                poll_interval_ms = bus.config().poll_interval.as_millis() as u64,
                "Queue worker started"
            );

            let worker = QueueWorker::spawn(Arc::clone(bus), shutdown);
            let report = worker.join().await;

            println!(
                "Worker stopped after {} passes: {} completed, {} retried, {} failed, {} recovered",
                report.passes, report.completed, report.retried, report.failed, report.recovered
            );
            for error in &report.errors {
                println!("  {} {}", style("✗").red(), error);
            }
            if let Some(panic) = report.panic_info {
                return Err(format!("Queue worker panicked: {}", panic).into());
            }
        }
        QueueAction::Process => {
            let stats = bus.process_queue().await?;
            println!(
                "Claimed {}: {} completed, {} scheduled for retry, {} failed",
                stats.claimed, stats.completed, stats.retried, stats.failed
            );
            for error in &stats.errors {
                println!("  {} {}", style("✗").red(), error);
            }
        }
        QueueAction::Replay { queue_id } => {
            let envelope = bus.replay(queue_id).await?;
            println!(
                "{} Replaying {} ({}), {} of {} attempts available",
                style("✓").green(),
                envelope.id,
                envelope.name,
                envelope.max_attempts - envelope.attempts,
                envelope.max_attempts
            );
        }
        QueueAction::Recover => {
            let recovered = bus.recover_stale().await?;
            println!("Recovered {} abandoned envelope(s).", recovered);
        }
        QueueAction::Prune => {
            let report = bus.prune().await?;
            println!(
                "Pruned {} envelope(s), {} history record(s), {} API call log(s).",
                report.envelopes, report.history, report.api_logs
            );
        }
    }

    Ok(())
}
