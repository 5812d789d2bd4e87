//! `marketsync stats` - event dispatch statistics.

use std::time::Duration;

use marketsync::events::EventStat;
use marketsync::settings::Settings;
use tabled::Tabled;

use super::shared::Engine;
use super::{OutputFormat, print_json, print_table};

#[derive(Tabled)]
struct StatRow {
    #[tabled(rename = "Event")]
    event: String,
    #[tabled(rename = "Dispatched")]
    dispatched: u64,
    #[tabled(rename = "Failed")]
    failed: u64,
    #[tabled(rename = "Listener calls")]
    listeners: u64,
    #[tabled(rename = "Avg ms")]
    avg_ms: u64,
    #[tabled(rename = "Max ms")]
    max_ms: u64,
}

impl From<&EventStat> for StatRow {
    fn from(stat: &EventStat) -> Self {
        Self {
            event: stat.event_name.clone(),
            dispatched: stat.dispatched,
            failed: stat.failed,
            listeners: stat.listeners_invoked,
            avg_ms: stat.avg_execution_ms,
            max_ms: stat.max_execution_ms,
        }
    }
}

pub(crate) async fn handle_stats(
    hours: u64,
    output: OutputFormat,
    settings: Settings,
    database_url: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let engine = Engine::without_catalog(settings, database_url).await?;
    let stats = engine.bus.get_stats(timeframe(hours)).await?;

    match output {
        OutputFormat::Json => print_json(&stats)?,
        OutputFormat::Table => {
            println!("Events dispatched in the last {} hour(s):", hours.max(1));
            print_table(
                stats.events.iter().map(StatRow::from).collect(),
                "No events dispatched.",
            );
            let q = &stats.queue;
            println!(
                "Queue: {} pending, {} processing, {} retry, {} failed, {} completed",
                q.pending, q.processing, q.retry, q.failed, q.completed
            );
        }
    }
    Ok(())
}

/// Look-back window for `--hours`, at least one hour.
fn timeframe(hours: u64) -> Duration {
    Duration::from_secs(hours.max(1).saturating_mul(3600))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeframe_saturates_instead_of_overflowing() {
        assert_eq!(timeframe(0), Duration::from_secs(3600));
        assert_eq!(timeframe(24), Duration::from_secs(24 * 3600));
        assert_eq!(timeframe(u64::MAX), Duration::from_secs(u64::MAX));
    }
}
