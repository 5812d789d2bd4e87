//! `marketsync trigger` - emit an event by hand or from a webhook relay.

use std::time::Duration;

use clap::Args;
use console::style;
use marketsync::entity::event_status::EventPriority;
use marketsync::events::{TriggerOptions, TriggerOutcome};
use marketsync::settings::Settings;
use serde_json::Value;
use tabled::Tabled;

use super::shared::Engine;
use super::{OutputFormat, print_json, print_table};

#[derive(Tabled)]
struct OutcomeRow {
    #[tabled(rename = "Handler")]
    handler: String,
    #[tabled(rename = "Result")]
    result: String,
    #[tabled(rename = "Error")]
    error: String,
    #[tabled(rename = "ms")]
    duration_ms: u64,
}

#[derive(Debug, Clone, Args)]
pub(crate) struct TriggerArgs {
    /// Event name, e.g. `order.created`
    event: String,

    /// JSON payload (default `{}`)
    payload: Option<String>,

    /// Run listeners now instead of queueing the event
    #[arg(short, long)]
    inline: bool,

    /// Queue priority (low, normal, high, critical)
    #[arg(short, long, default_value = "normal")]
    priority: EventPriority,

    /// Delay before the event becomes claimable
    #[arg(short, long)]
    delay_secs: Option<u64>,

    /// Attempts before the envelope is terminally failed
    #[arg(short = 'm', long)]
    max_attempts: Option<u32>,

    /// Output format
    #[arg(short, long, value_enum, default_value_t = OutputFormat::Table)]
    output: OutputFormat,
}

pub(crate) async fn handle_trigger(
    args: TriggerArgs,
    settings: Settings,
    database_url: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let payload: Value = match &args.payload {
        Some(raw) => serde_json::from_str(raw).map_err(|e| format!("Payload is not valid JSON: {}", e))?,
        None => Value::Object(Default::default()),
    };

    let mut options = if args.inline {
        TriggerOptions::inline()
    } else {
        TriggerOptions::queued()
    }
    .with_priority(args.priority);
    if let Some(secs) = args.delay_secs {
        options = options.with_delay(Duration::from_secs(secs));
    }
    if let Some(max_attempts) = args.max_attempts {
        options = options.with_max_attempts(max_attempts);
    }

    let engine = Engine::without_catalog(settings, database_url).await?;
    match engine.bus.trigger(&args.event, payload, options).await? {
        TriggerOutcome::Queued { queue_id } => match args.output {
            OutputFormat::Json => print_json(&serde_json::json!({ "queue_id": queue_id }))?,
            OutputFormat::Table => println!("{} Queued {} as {}", style("✓").green(), args.event, queue_id),
        },
        TriggerOutcome::Dispatched(report) => match args.output {
            OutputFormat::Json => print_json(&report)?,
            OutputFormat::Table => {
                println!(
                    "Called {} listener(s) in {}ms",
                    report.listeners_called,
                    report.execution_time.as_millis()
                );
                print_table(
                    report
                        .results
                        .iter()
                        .map(|r| OutcomeRow {
                            handler: r.handler.clone(),
                            result: if r.success {
                                style("ok").green().to_string()
                            } else {
                                style("failed").red().to_string()
                            },
                            error: r.error.clone().unwrap_or_default(),
                            duration_ms: r.duration_ms,
                        })
                        .collect(),
                    "No listeners matched.",
                );
            }
        },
    }
    Ok(())
}
