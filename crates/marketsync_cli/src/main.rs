//! Marketsync CLI - host process for the marketplace sync engine.

mod commands;
mod progress;
mod shutdown;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use console::Term;
use tracing_subscriber::EnvFilter;

use crate::commands::OutputFormat;
use crate::commands::listeners::ListenerAction;
use crate::commands::queue::QueueAction;
use crate::commands::sync::SyncArgs;
use crate::commands::trigger::TriggerArgs;

#[derive(Parser)]
#[command(name = "marketsync")]
#[command(version)]
#[command(about = "Keep catalog and orders in sync with external marketplaces")]
#[command(
    long_about = "Marketsync pushes local catalog entities to marketplaces (Trendyol, N11, \
Amazon, eBay, Hepsiburada, Ozon) within each marketplace's rate limits, remembers what \
it created so re-runs are idempotent, and delivers sync events to registered listeners \
through a persistent queue."
)]
#[command(after_long_help = r#"EXAMPLES
    Sync three products to Trendyol:
        $ marketsync sync trendyol product 101 102 103 --catalog catalog.json

    Sync every product in the catalog to all configured marketplaces:
        $ marketsync sync all product --catalog catalog.json

    Run the event queue worker:
        $ marketsync queue work

    Queue an event from a webhook relay:
        $ marketsync trigger order.created '{"order_id": 42}' --priority high

    Check integration health (non-zero exit when unhealthy):
        $ marketsync health

CONFIGURATION
    Marketsync reads configuration from, later overriding earlier:
      1. Built-in marketplace defaults
      2. ~/.config/marketsync/config.toml (or $XDG_CONFIG_HOME/marketsync/config.toml)
      3. ./marketsync.toml
      4. Environment variables (MARKETSYNC_* prefix, nested with __)
      5. .env file in current directory (loaded into the environment)

ENVIRONMENT VARIABLES
    MARKETSYNC_DATABASE__URL    Database connection string (default: ~/.local/state/marketsync/marketsync.db)
    MARKETSYNC_CATALOG          Catalog file used by `sync`
    MARKETSYNC_MARKETPLACES__TRENDYOL__AUTH__PASSWORD
                                Example credential override
    RUST_LOG                    Log filter (default: marketsync=info,marketsync_cli=info)
"#)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run database migrations
    #[cfg(feature = "migrate")]
    Migrate {
        #[command(subcommand)]
        action: MigrateAction,
    },
    /// Sync entities from a catalog file to a marketplace
    Sync(SyncArgs),
    /// Drive and maintain the event queue
    Queue {
        #[command(subcommand)]
        action: QueueAction,
    },
    /// Trigger an event
    Trigger(TriggerArgs),
    /// Show integration health
    Health {
        /// Marketplace to check (default: every configured marketplace)
        marketplace: Option<String>,

        /// Tenant whose credentials to check
        #[arg(short = 't', long)]
        tenant: Option<String>,

        /// Output format
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Table)]
        output: OutputFormat,
    },
    /// Show event dispatch statistics
    Stats {
        /// Timeframe in hours
        #[arg(long, default_value_t = 24)]
        hours: u64,

        /// Output format
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Table)]
        output: OutputFormat,
    },
    /// Manage event listeners (lists them by default)
    Listeners {
        #[command(subcommand)]
        action: Option<ListenerAction>,
    },
    /// Generate shell completion scripts
    Completions {
        /// Shell to generate completions for
        shell: clap_complete::Shell,
    },
    /// Generate man page(s)
    Man {
        /// Output directory for man pages (prints to stdout if not specified)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[cfg(feature = "migrate")]
#[derive(Subcommand)]
enum MigrateAction {
    /// Apply all pending migrations
    Up,
    /// Rollback the last migration
    Down,
    /// Show migration status
    Status,
    /// Drop all tables and reapply migrations
    Fresh {
        /// Confirm that queue, history and mappings will be lost
        #[arg(long)]
        yes: bool,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    let shutdown = shutdown::setup_shutdown_handler();

    // Progress bars own the terminal; keep library chatter to warnings there.
    let default_filter = if Term::stdout().is_term() {
        "marketsync=warn,marketsync_cli=info"
    } else {
        "marketsync=info,marketsync_cli=info"
    };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    // Handle commands that don't require database access first
    match &cli.command {
        Commands::Completions { shell } => {
            commands::meta::handle_completions(*shell)?;
            return Ok(());
        }
        Commands::Man { output } => {
            commands::meta::handle_man(output.clone())?;
            return Ok(());
        }
        _ => {}
    }

    let settings = marketsync::Settings::load();
    let database_url = settings
        .database_url()
        .ok_or("Could not determine a database URL; set MARKETSYNC_DATABASE__URL")?;
    ensure_sqlite_dir(&database_url)?;

    match cli.command {
        #[cfg(feature = "migrate")]
        Commands::Migrate { action } => {
            commands::migrate::handle_migrate(action, &database_url).await?;
        }
        Commands::Sync(args) => {
            commands::sync::handle_sync(args, settings, &database_url, shutdown).await?;
        }
        Commands::Queue { action } => {
            commands::queue::handle_queue(action, settings, &database_url, shutdown).await?;
        }
        Commands::Trigger(args) => {
            commands::trigger::handle_trigger(args, settings, &database_url).await?;
        }
        Commands::Health {
            marketplace,
            tenant,
            output,
        } => {
            commands::health::handle_health(marketplace, tenant, output, settings, &database_url)
                .await?;
        }
        Commands::Stats { hours, output } => {
            commands::stats::handle_stats(hours, output, settings, &database_url).await?;
        }
        Commands::Listeners { action } => {
            let action = action.unwrap_or(ListenerAction::List {
                output: OutputFormat::Table,
            });
            commands::listeners::handle_listeners(action, settings, &database_url).await?;
        }
        Commands::Completions { .. } | Commands::Man { .. } => {}
    }

    Ok(())
}

/// Create the parent directory of a SQLite database file.
fn ensure_sqlite_dir(database_url: &str) -> std::io::Result<()> {
    if !database_url.starts_with("sqlite://") {
        return Ok(());
    }
    let db_path = database_url.trim_start_matches("sqlite://");
    // Strip query parameters (e.g., ?mode=rwc) before path operations
    let db_path = db_path.split('?').next().unwrap_or(db_path);
    let db_path = std::path::Path::new(db_path);

    if db_path.is_relative() && !db_path.as_os_str().is_empty() {
        tracing::warn!(
            "Database path '{}' is relative - behavior depends on current directory. \
             Consider using an absolute path.",
            db_path.display()
        );
    }

    if let Some(parent) = db_path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }
    Ok(())
}
