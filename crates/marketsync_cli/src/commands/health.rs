//! `marketsync health` - integration health per marketplace.

use console::style;
use marketsync::settings::Settings;
use marketsync::sync::{HealthReport, HealthStatus};
use tabled::Tabled;

use super::shared::{Engine, auth_context};
use super::{OutputFormat, print_json, print_table, truncate};

#[derive(Tabled)]
struct HealthRow {
    #[tabled(rename = "Marketplace")]
    marketplace: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Calls (1h)")]
    calls: u64,
    #[tabled(rename = "Error rate")]
    error_rate: String,
    #[tabled(rename = "Mapping errors")]
    mapping_errors: u64,
    #[tabled(rename = "Pending")]
    pending: u64,
    #[tabled(rename = "Failed events")]
    failed_events: u64,
    #[tabled(rename = "Issues")]
    issues: String,
}

impl From<&HealthReport> for HealthRow {
    fn from(report: &HealthReport) -> Self {
        let status = match report.status {
            HealthStatus::Healthy => style(report.status).green(),
            HealthStatus::Degraded => style(report.status).yellow(),
            HealthStatus::Unhealthy => style(report.status).red(),
        };
        let marketplace = match &report.tenant_id {
            Some(tenant) => format!("{}/{}", report.marketplace, tenant),
            None => report.marketplace.to_string(),
        };
        Self {
            marketplace,
            status: status.to_string(),
            calls: report.calls.total,
            error_rate: format!("{:.1}%", report.calls.error_rate() * 100.0),
            mapping_errors: report.mapping_errors,
            pending: report.pending_mappings,
            failed_events: report.failed_events,
            issues: report
                .issues
                .iter()
                .map(|i| truncate(i, 70))
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

/// Check one marketplace, or every configured one when `marketplace` is `None`.
///
/// Fails when any checked integration is unhealthy, so cron and monitoring
/// wrappers can alert on the exit status.
pub(crate) async fn handle_health(
    marketplace: Option<String>,
    tenant: Option<String>,
    output: OutputFormat,
    settings: Settings,
    database_url: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let targets: Vec<String> = match marketplace {
        Some(m) => vec![m],
        None => settings
            .configured_marketplaces()
            .iter()
            .map(|m| m.to_string())
            .collect(),
    };
    if targets.is_empty() {
        return Err("No marketplaces are configured".into());
    }

    let engine = Engine::without_catalog(settings, database_url).await?;
    let mut reports = Vec::with_capacity(targets.len());
    for target in &targets {
        let ctx = auth_context(target, tenant.as_deref())?;
        reports.push(engine.orchestrator.get_health(&ctx).await?);
    }

    match output {
        OutputFormat::Json => print_json(&reports)?,
        OutputFormat::Table => print_table(
            reports.iter().map(HealthRow::from).collect(),
            "No marketplaces checked.",
        ),
    }

    let unhealthy = reports
        .iter()
        .filter(|r| r.status == HealthStatus::Unhealthy)
        .count();
    if unhealthy > 0 {
        return Err(format!("{} integration(s) unhealthy", unhealthy).into());
    }
    Ok(())
}
