//! Append-only API call log.

use chrono::{DateTime, FixedOffset, Utc};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, DbErr, EntityTrait, PaginatorTrait,
    QueryFilter, QueryOrder, Set,
};
use serde::Serialize;
use serde_json::{Map, Value, json};

use super::errors::ExecutorError;
use crate::entity::api_call_log::{ActiveModel, Column, Entity as ApiCallLog, Model};
use crate::entity::marketplace::Marketplace;
use crate::http::HttpHeaders;

const REDACTED: &str = "[redacted]";
const SENSITIVE_HEADER_PARTS: [&str; 6] = ["authorization", "cookie", "secret", "token", "password", "key"];

fn is_sensitive(name: &str) -> bool {
    let name = name.to_ascii_lowercase();
    SENSITIVE_HEADER_PARTS.iter().any(|part| name.contains(part))
}

/// Headers as a JSON object with credential values replaced.
pub fn redact_headers(headers: &HttpHeaders) -> Value {
    let map: Map<String, Value> = headers
        .iter()
        .map(|(k, v)| {
            let value = if is_sensitive(k) { REDACTED } else { v.as_str() };
            (k.clone(), Value::String(value.to_string()))
        })
        .collect();
    Value::Object(map)
}

/// A call log row being assembled while the call runs.
#[derive(Debug, Clone)]
pub(crate) struct CallLogEntry {
    pub marketplace: Marketplace,
    pub tenant_id: Option<String>,
    pub endpoint: String,
    pub method: String,
    pub url: String,
    pub request: Value,
    pub response: Option<Value>,
    pub http_status: Option<u16>,
}

impl CallLogEntry {
    pub async fn insert(
        self,
        db: &DatabaseConnection,
        outcome: Result<(), &ExecutorError>,
        latency_ms: i64,
    ) -> Result<Model, DbErr> {
        let model = ActiveModel {
            marketplace: Set(self.marketplace),
            tenant_id: Set(self.tenant_id),
            endpoint: Set(self.endpoint),
            method: Set(self.method),
            url: Set(self.url),
            request: Set(self.request),
            response: Set(self.response),
            http_status: Set(self.http_status.map(i32::from)),
            latency_ms: Set(latency_ms),
            success: Set(outcome.is_ok()),
            error_kind: Set(outcome.err().map(|e| e.kind().to_string())),
            error: Set(outcome.err().map(|e| e.to_string())),
            created_at: Set(Utc::now().fixed_offset()),
            ..Default::default()
        };
        model.insert(db).await
    }
}

/// Request snapshot stored with each call.
pub(crate) fn request_snapshot(headers: &HttpHeaders, payload: Option<&Value>) -> Value {
    json!({
        "headers": redact_headers(headers),
        "body": payload,
    })
}

/// Delete call logs created before `cutoff`.
pub async fn prune_call_logs(
    db: &DatabaseConnection,
    cutoff: DateTime<FixedOffset>,
) -> Result<u64, DbErr> {
    let result = ApiCallLog::delete_many()
        .filter(Column::CreatedAt.lt(cutoff))
        .exec(db)
        .await?;
    Ok(result.rows_affected)
}

/// Call counts for one marketplace over a window.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CallSummary {
    pub total: u64,
    pub failed: u64,
    pub auth_failures: u64,
    pub last_error: Option<String>,
}

impl CallSummary {
    /// Fraction of failed calls, 0.0 when there were none.
    pub fn error_rate(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.failed as f64 / self.total as f64
        }
    }
}

/// Summarize calls made since `since`.
pub async fn call_summary(
    db: &DatabaseConnection,
    marketplace: Marketplace,
    tenant_id: Option<&str>,
    since: DateTime<FixedOffset>,
) -> Result<CallSummary, DbErr> {
    let scoped = || {
        let query = ApiCallLog::find()
            .filter(Column::Marketplace.eq(marketplace))
            .filter(Column::CreatedAt.gte(since));
        match tenant_id {
            Some(tenant) => query.filter(Column::TenantId.eq(tenant)),
            None => query,
        }
    };

    let total = scoped().count(db).await?;
    let failed = scoped().filter(Column::Success.eq(false)).count(db).await?;
    let auth_failures = scoped().filter(Column::ErrorKind.eq("auth")).count(db).await?;
    let last_error = scoped()
        .filter(Column::Success.eq(false))
        .order_by_desc(Column::CreatedAt)
        .order_by_desc(Column::Id)
        .one(db)
        .await?
        .and_then(|m| m.error);

    Ok(CallSummary {
        total,
        failed,
        auth_failures,
        last_error,
    })
}

/// Most recent calls, newest first.
pub async fn recent_calls(
    db: &DatabaseConnection,
    marketplace: Marketplace,
    limit: u64,
) -> Result<Vec<Model>, DbErr> {
    use sea_orm::QuerySelect;

    ApiCallLog::find()
        .filter(Column::Marketplace.eq(marketplace))
        .order_by_desc(Column::Id)
        .limit(limit)
        .all(db)
        .await
}
