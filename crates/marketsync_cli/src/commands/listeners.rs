//! `marketsync listeners` - inspect and edit listener registrations.

use clap::Subcommand;
use console::style;
use marketsync::events::ListenerSpec;
use marketsync::settings::Settings;
use serde_json::Value;
use tabled::Tabled;

use super::shared::Engine;
use super::{OutputFormat, print_json, print_table};

#[derive(Debug, Clone, Subcommand)]
pub(crate) enum ListenerAction {
    /// List registered listeners and available handlers
    List {
        /// Output format
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Table)]
        output: OutputFormat,
    },
    /// Register a handler for an event name, `*`, or a `prefix.*` pattern
    Add {
        event: String,
        handler: String,
        /// Higher priority listeners run first
        #[arg(short, long, default_value_t = 0)]
        priority: i32,
        /// Only run when the payload matches, e.g. `--when marketplace=trendyol`
        #[arg(short, long = "when", value_parser = parse_condition)]
        conditions: Vec<(String, Value)>,
    },
    /// Deactivate a listener; its dispatch history is kept
    Remove { event: String, handler: String },
}

#[derive(Tabled)]
struct ListenerRow {
    #[tabled(rename = "ID")]
    id: i64,
    #[tabled(rename = "Event")]
    event: String,
    #[tabled(rename = "Handler")]
    handler: String,
    #[tabled(rename = "Priority")]
    priority: i32,
    #[tabled(rename = "Active")]
    active: String,
    #[tabled(rename = "Conditions")]
    conditions: String,
}

/// Parse `path=value`, reading the value as JSON when it parses and as a string otherwise.
fn parse_condition(raw: &str) -> Result<(String, Value), String> {
    let (path, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected PATH=VALUE, got '{}'", raw))?;
    if path.is_empty() {
        return Err("condition path is empty".to_string());
    }
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((path.to_string(), value))
}

pub(crate) async fn handle_listeners(
    action: ListenerAction,
    settings: Settings,
    database_url: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let engine = Engine::without_catalog(settings, database_url).await?;
    let bus = &engine.bus;

    match action {
        ListenerAction::List { output } => {
            let listeners = bus.all_listeners().await?;
            match output {
                OutputFormat::Json => print_json(&listeners)?,
                OutputFormat::Table => {
                    let rows = listeners
                        .into_iter()
                        .map(|l| ListenerRow {
                            id: l.id,
                            event: l.event_name,
                            handler: l.handler,
                            priority: l.priority,
                            active: if l.active {
                                style("yes").green().to_string()
                            } else {
                                style("no").dim().to_string()
                            },
                            conditions: match l.conditions.as_object() {
                                Some(map) if !map.is_empty() => l.conditions.to_string(),
                                _ => String::new(),
                            },
                        })
                        .collect();
                    print_table(rows, "No listeners registered.");
                    println!("Handlers: {}", bus.handler_names().join(", "));
                }
            }
        }
        ListenerAction::Add {
            event,
            handler,
            priority,
            conditions,
        } => {
            if !bus.handler_names().contains(&handler) {
                println!(
                    "{} No handler named '{}' in this process; deliveries will fail until one is registered.",
                    style("⚠").yellow(),
                    handler
                );
            }
            let mut spec = ListenerSpec::new(event, handler).with_priority(priority);
            for (path, value) in conditions {
                spec = spec.with_condition(path, value);
            }
            let listener = bus.add_listener(&spec).await?;
            println!(
                "{} Listener {} registered: {} -> {}",
                style("✓").green(),
                listener.id,
                listener.event_name,
                listener.handler
            );
        }
        ListenerAction::Remove { event, handler } => {
            if bus.remove_listener(&event, &handler).await? {
                println!("{} Listener {} -> {} deactivated", style("✓").green(), event, handler);
            } else {
                return Err(format!("No active listener {} -> {}", event, handler).into());
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn condition_values_parse_as_json_or_string() {
        assert_eq!(
            parse_condition("marketplace=trendyol").unwrap(),
            ("marketplace".to_string(), json!("trendyol"))
        );
        assert_eq!(
            parse_condition("order.total=150").unwrap(),
            ("order.total".to_string(), json!(150))
        );
        assert_eq!(
            parse_condition("flags.express=true").unwrap(),
            ("flags.express".to_string(), json!(true))
        );
    }

    #[test]
    fn condition_requires_path_and_separator() {
        assert!(parse_condition("marketplace").is_err());
        assert!(parse_condition("=trendyol").is_err());
    }
}
