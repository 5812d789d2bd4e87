//! Dispatch history and statistics.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, FixedOffset, Utc};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder, Set,
};
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use super::errors::Result;
use super::queue::{self, QueueCounts};
use super::types::ListenerOutcome;
use crate::entity::dispatch_history::{ActiveModel, Column, Entity as DispatchHistory, Model};
use crate::entity::event_status::DispatchMode;

/// Append one history record.
pub async fn record(
    db: &DatabaseConnection,
    queue_id: Option<Uuid>,
    event_name: &str,
    mode: DispatchMode,
    payload: &Value,
    outcomes: &[ListenerOutcome],
    execution_time: Duration,
) -> Result<Model> {
    let model = ActiveModel {
        queue_id: Set(queue_id),
        event_name: Set(event_name.to_string()),
        mode: Set(mode),
        payload: Set(payload.clone()),
        listeners: Set(serde_json::to_value(outcomes)?),
        success: Set(outcomes.iter().all(|o| o.success)),
        execution_time_ms: Set(execution_time.as_millis() as i64),
        created_at: Set(Utc::now().fixed_offset()),
        ..Default::default()
    };
    Ok(model.insert(db).await?)
}

/// History for one queued envelope, oldest first.
pub async fn for_envelope(db: &DatabaseConnection, queue_id: Uuid) -> Result<Vec<Model>> {
    Ok(DispatchHistory::find()
        .filter(Column::QueueId.eq(queue_id))
        .order_by_asc(Column::Id)
        .all(db)
        .await?)
}

/// Delete history recorded before `cutoff`.
pub async fn prune(db: &DatabaseConnection, cutoff: DateTime<FixedOffset>) -> Result<u64> {
    let result = DispatchHistory::delete_many()
        .filter(Column::CreatedAt.lt(cutoff))
        .exec(db)
        .await?;
    Ok(result.rows_affected)
}

/// Per-event aggregate over a timeframe.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EventStat {
    pub event_name: String,
    pub dispatched: u64,
    pub failed: u64,
    pub listeners_invoked: u64,
    pub avg_execution_ms: u64,
    pub max_execution_ms: u64,
}

/// Result of `get_stats`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EventStats {
    pub since: DateTime<FixedOffset>,
    pub events: Vec<EventStat>,
    pub queue: QueueCounts,
}

impl EventStats {
    pub fn total_dispatched(&self) -> u64 {
        self.events.iter().map(|e| e.dispatched).sum()
    }
}

/// Aggregate history recorded within `timeframe` plus current queue counts.
pub async fn stats(db: &DatabaseConnection, timeframe: Duration) -> Result<EventStats> {
    let since = queue::before(Utc::now().fixed_offset(), timeframe);
    let rows = DispatchHistory::find()
        .filter(Column::CreatedAt.gte(since))
        .all(db)
        .await?;

    let mut totals: BTreeMap<String, (EventStat, u64)> = BTreeMap::new();
    for row in rows {
        let (stat, total_ms) = totals.entry(row.event_name.clone()).or_insert_with(|| {
            (
                EventStat {
                    event_name: row.event_name.clone(),
                    ..Default::default()
                },
                0,
            )
        });
        let elapsed = row.execution_time_ms.max(0) as u64;
        stat.dispatched += 1;
        if !row.success {
            stat.failed += 1;
        }
        stat.listeners_invoked += row.listeners.as_array().map_or(0, |l| l.len() as u64);
        stat.max_execution_ms = stat.max_execution_ms.max(elapsed);
        *total_ms += elapsed;
    }

    let events = totals
        .into_values()
        .map(|(mut stat, total_ms)| {
            stat.avg_execution_ms = total_ms / stat.dispatched.max(1);
            stat
        })
        .collect();

    Ok(EventStats {
        since,
        events,
        queue: queue::counts(db).await?,
    })
}

#[cfg(all(test, feature = "sqlite", feature = "migrate"))]
mod tests {
    use super::*;
    use serde_json::json;

    fn outcome(success: bool) -> ListenerOutcome {
        ListenerOutcome {
            listener_id: 1,
            handler: "h".to_string(),
            success,
            error: (!success).then(|| "boom".to_string()),
            duration_ms: 1,
        }
    }

    #[tokio::test]
    async fn stats_aggregate_per_event() {
        let db = crate::db::connect_and_migrate("sqlite::memory:").await.unwrap();
        let payload = json!({});
        for (name, ok, ms) in [
            ("order.created", true, 10),
            ("order.created", false, 30),
            ("product.synced", true, 5),
        ] {
            record(
                &db,
                None,
                name,
                DispatchMode::Sync,
                &payload,
                &[outcome(ok)],
                Duration::from_millis(ms),
            )
            .await
            .unwrap();
        }

        let stats = stats(&db, Duration::from_secs(3600)).await.unwrap();
        assert_eq!(stats.total_dispatched(), 3);
        let orders = &stats.events[0];
        assert_eq!(orders.event_name, "order.created");
        assert_eq!(orders.dispatched, 2);
        assert_eq!(orders.failed, 1);
        assert_eq!(orders.avg_execution_ms, 20);
        assert_eq!(orders.max_execution_ms, 30);
        assert_eq!(stats.events[1].listeners_invoked, 1);

        let all_time = super::stats(&db, Duration::MAX).await.unwrap();
        assert_eq!(all_time.total_dispatched(), 3);
    }

    #[tokio::test]
    async fn record_marks_failure_when_any_listener_failed() {
        let db = crate::db::connect_and_migrate("sqlite::memory:").await.unwrap();
        let queue_id = Uuid::new_v4();
        let row = record(
            &db,
            Some(queue_id),
            "order.created",
            DispatchMode::Async,
            &json!({"id": 1}),
            &[outcome(true), outcome(false)],
            Duration::from_millis(3),
        )
        .await
        .unwrap();
        assert!(!row.success);
        assert_eq!(for_envelope(&db, queue_id).await.unwrap().len(), 1);
    }
}
