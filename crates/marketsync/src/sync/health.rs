//! Marketplace integration health.

use std::time::Duration;

use chrono::Utc;
use serde::Serialize;

use super::errors::Result;
use crate::entity::marketplace::Marketplace;
use crate::entity::sync_status::SyncStatus;
use crate::events::EventBus;
use crate::executor::{AuthContext, CallSummary, RequestExecutor, call_summary};
use crate::reconcile::mapping;

/// Overall verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Degraded => write!(f, "degraded"),
            HealthStatus::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

/// Limits that turn observations into issues.
#[derive(Debug, Clone, PartialEq)]
pub struct HealthThresholds {
    /// Window of API calls inspected.
    pub window: Duration,
    /// Error rate at which the integration is degraded.
    pub degraded_error_rate: f64,
    /// Error rate at which it is unhealthy.
    pub unhealthy_error_rate: f64,
    /// Calls needed before the error rate counts.
    pub min_calls: u64,
    /// Pending tasks untouched for this long are reported as stale.
    pub stale_task_age: Duration,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(3600),
            degraded_error_rate: 0.1,
            unhealthy_error_rate: 0.5,
            min_calls: 5,
            stale_task_age: Duration::from_secs(3600),
        }
    }
}

/// Result of a health check.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthReport {
    pub marketplace: Marketplace,
    pub tenant_id: Option<String>,
    pub status: HealthStatus,
    pub issues: Vec<String>,
    pub calls: CallSummary,
    pub mapping_errors: u64,
    pub pending_mappings: u64,
    pub stale_tasks: u64,
    /// Envelopes in terminal `failed`, process wide.
    pub failed_events: u64,
}

impl HealthReport {
    fn raise(&mut self, status: HealthStatus, issue: String) {
        self.status = self.status.max(status);
        self.issues.push(issue);
    }
}

/// Inspect configuration, recent calls, mappings and the event queue.
pub async fn check(
    executor: &RequestExecutor,
    events: &EventBus,
    ctx: &AuthContext,
    thresholds: &HealthThresholds,
) -> Result<HealthReport> {
    let marketplace = ctx.marketplace;
    let db = executor.db();
    let now = Utc::now().fixed_offset();
    let since = now - chrono::Duration::from_std(thresholds.window).unwrap_or_default();
    let stale_before =
        now - chrono::Duration::from_std(thresholds.stale_task_age).unwrap_or_default();

    let calls = call_summary(db, marketplace, ctx.tenant_id.as_deref(), since).await?;
    let mut report = HealthReport {
        marketplace,
        tenant_id: ctx.tenant_id.clone(),
        status: HealthStatus::Healthy,
        issues: Vec::new(),
        mapping_errors: mapping::count_by_status(db, marketplace, SyncStatus::Error).await?,
        pending_mappings: mapping::count_by_status(db, marketplace, SyncStatus::Pending).await?,
        stale_tasks: mapping::count_stale_tasks(db, marketplace, stale_before).await?,
        failed_events: events.queue_counts().await?.failed,
        calls,
    };

    match executor
        .config_provider()
        .marketplace_config(marketplace, ctx.tenant_id.as_deref())
    {
        None => report.raise(
            HealthStatus::Unhealthy,
            format!("{} is not configured or disabled", ctx),
        ),
        Some(config) => {
            let missing = config.auth.missing_credentials();
            if !missing.is_empty() {
                report.raise(
                    HealthStatus::Unhealthy,
                    format!("missing credentials: {}", missing.join(", ")),
                );
            }
        }
    }

    if report.calls.auth_failures > 0 {
        report.raise(
            HealthStatus::Unhealthy,
            format!(
                "{} authentication failures in the last {} minutes",
                report.calls.auth_failures,
                thresholds.window.as_secs() / 60
            ),
        );
    }
    if report.calls.total >= thresholds.min_calls {
        let rate = report.calls.error_rate();
        let status = if rate >= thresholds.unhealthy_error_rate {
            Some(HealthStatus::Unhealthy)
        } else if rate >= thresholds.degraded_error_rate {
            Some(HealthStatus::Degraded)
        } else {
            None
        };
        if let Some(status) = status {
            let mut issue = format!(
                "API error rate {:.0}% ({} of {} calls)",
                rate * 100.0,
                report.calls.failed,
                report.calls.total
            );
            if let Some(last) = &report.calls.last_error {
                issue.push_str(&format!("; last error: {}", last));
            }
            report.raise(status, issue);
        }
    }
    if report.mapping_errors > 0 {
        report.raise(
            HealthStatus::Degraded,
            format!("{} entities in error state", report.mapping_errors),
        );
    }
    if report.stale_tasks > 0 {
        report.raise(
            HealthStatus::Degraded,
            format!(
                "{} marketplace tasks pending for over {} minutes",
                report.stale_tasks,
                thresholds.stale_task_age.as_secs() / 60
            ),
        );
    }
    if report.failed_events > 0 {
        report.raise(
            HealthStatus::Degraded,
            format!("{} events failed delivery and need replay", report.failed_events),
        );
    }

    tracing::debug!(marketplace = %ctx, status = %report.status, issues = report.issues.len(), "Health checked");
    Ok(report)
}
