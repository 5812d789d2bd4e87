//! `marketsync sync` - push catalog entities to marketplaces.
//!
//! Desired state comes from a JSON catalog file shaped like
//! `{"product": [{"local_id": "1", "natural_key": "SKU-1", "state": {...},
//! "marketplaces": {"trendyol": {...overrides}}}]}`.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use clap::Args;
use console::style;
use marketsync::entity::entity_kind::EntityKind;
use marketsync::settings::Settings;
use marketsync::sync::{CatalogSource, MarketplaceSyncResult, SyncRequest, SyncResult};
use serde::Serialize;
use tabled::Tabled;

use super::shared::{Engine, auth_context};
use super::{OutputFormat, print_json, print_table, truncate};
use crate::progress::ProgressReporter;

#[derive(Debug, Clone, Args)]
pub(crate) struct SyncArgs {
    /// Marketplace name (trendyol, n11, amazon, ebay, hepsiburada, ozon), or
    /// `all` for every configured marketplace
    marketplace: String,

    /// Entity kind (product, order, stock, price)
    kind: EntityKind,

    /// Local ids to sync (defaults to every id of this kind in the catalog)
    ids: Vec<String>,

    /// Catalog file with the desired entity state
    #[arg(short = 'c', long, env = "MARKETSYNC_CATALOG")]
    catalog: PathBuf,

    /// Tenant whose credentials and overrides to use
    #[arg(short = 't', long)]
    tenant: Option<String>,

    /// Output format
    #[arg(short, long, value_enum, default_value_t = OutputFormat::Table)]
    output: OutputFormat,
}

#[derive(Tabled)]
struct RunRow {
    #[tabled(rename = "Marketplace")]
    marketplace: String,
    #[tabled(rename = "Requested")]
    requested: usize,
    #[tabled(rename = "Synced")]
    synced: usize,
    #[tabled(rename = "Unchanged")]
    unchanged: usize,
    #[tabled(rename = "Pending")]
    pending: usize,
    #[tabled(rename = "Errors")]
    errors: String,
}

#[derive(Tabled)]
struct ErrorRow {
    #[tabled(rename = "Marketplace")]
    marketplace: String,
    #[tabled(rename = "Local ID")]
    local_id: String,
    #[tabled(rename = "Natural key")]
    natural_key: String,
    #[tabled(rename = "Kind")]
    kind: String,
    #[tabled(rename = "Retries")]
    retries: usize,
    #[tabled(rename = "Message")]
    message: String,
}

#[derive(Serialize)]
struct RunReport<'a> {
    marketplace: String,
    result: Option<&'a SyncResult>,
    error: Option<String>,
}

pub(crate) async fn handle_sync(
    args: SyncArgs,
    settings: Settings,
    database_url: &str,
    shutdown: Arc<AtomicBool>,
) -> Result<(), Box<dyn std::error::Error>> {
    let catalog = load_catalog(&args.catalog)?;
    let ids = if args.ids.is_empty() {
        catalog.ids(args.kind)
    } else {
        args.ids.clone()
    };
    if ids.is_empty() {
        return Err(format!(
            "No {} entities in {}",
            args.kind,
            args.catalog.display()
        )
        .into());
    }

    let marketplaces: Vec<String> = if args.marketplace == "all" {
        settings
            .configured_marketplaces()
            .iter()
            .map(|m| m.to_string())
            .collect()
    } else {
        vec![args.marketplace.clone()]
    };
    if marketplaces.is_empty() {
        return Err("No marketplaces are configured".into());
    }
    let requests = marketplaces
        .iter()
        .map(|m| {
            let ctx = auth_context(m, args.tenant.as_deref())?;
            Ok(SyncRequest::new(ctx, args.kind, ids.clone()))
        })
        .collect::<Result<Vec<_>, Box<dyn std::error::Error>>>()?;

    let engine = Engine::build(settings, database_url, Arc::new(catalog)).await?;

    let runs = if requests.len() == 1 {
        let reporter = Arc::new(ProgressReporter::new());
        let callback = reporter.as_callback();
        let request = requests.into_iter().next().ok_or("no sync request")?;
        let result = engine
            .orchestrator
            .sync(&request, &shutdown, Some(&callback))
            .await;
        reporter.finish();
        vec![MarketplaceSyncResult { request, result }]
    } else {
        engine.orchestrator.sync_many(requests, shutdown).await
    };

    render(&runs, args.output)?;

    let failed_runs = runs.iter().filter(|r| r.result.is_err()).count();
    if failed_runs > 0 {
        return Err(format!("{} of {} sync runs failed", failed_runs, runs.len()).into());
    }
    Ok(())
}

fn load_catalog(path: &Path) -> Result<CatalogSource, Box<dyn std::error::Error>> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| format!("Failed to read catalog {}: {}", path.display(), e))?;
    let value: serde_json::Value = serde_json::from_str(&raw)
        .map_err(|e| format!("Catalog {} is not valid JSON: {}", path.display(), e))?;
    Ok(CatalogSource::from_json(&value)?)
}

fn render(runs: &[MarketplaceSyncResult], output: OutputFormat) -> Result<(), Box<dyn std::error::Error>> {
    if let OutputFormat::Json = output {
        let report: Vec<RunReport<'_>> = runs
            .iter()
            .map(|run| RunReport {
                marketplace: run.request.ctx.to_string(),
                result: run.result.as_ref().ok(),
                error: run.result.as_ref().err().map(|e| e.to_string()),
            })
            .collect();
        return print_json(&report);
    }

    let mut rows = Vec::new();
    let mut errors = Vec::new();
    for run in runs {
        let marketplace = run.request.ctx.to_string();
        match &run.result {
            Ok(result) => {
                rows.push(RunRow {
                    marketplace: marketplace.clone(),
                    requested: result.requested,
                    synced: result.synced,
                    unchanged: result.unchanged,
                    pending: result.pending,
                    errors: if result.error_count() > 0 {
                        style(result.error_count()).red().to_string()
                    } else {
                        "0".to_string()
                    },
                });
                errors.extend(result.errors.iter().map(|e| ErrorRow {
                    marketplace: marketplace.clone(),
                    local_id: e.local_id.clone(),
                    natural_key: e.natural_key.clone().unwrap_or_default(),
                    kind: e.kind.clone(),
                    retries: e.retries,
                    message: truncate(&e.message, 60),
                }));
                if result.cancelled {
                    println!(
                        "{} {} cancelled, {} entities skipped",
                        style("⚠").yellow(),
                        marketplace,
                        result.skipped
                    );
                }
            }
            Err(e) => println!("{} {}: {}", style("✗").red(), marketplace, e),
        }
    }

    print_table(rows, "No sync runs completed.");
    if !errors.is_empty() {
        println!();
        print_table(errors, "");
    }
    Ok(())
}
