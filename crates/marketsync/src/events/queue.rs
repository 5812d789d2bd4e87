//! Persistent envelope queue.
//!
//! Every state transition is a conditional `UPDATE` on the status the caller
//! expects, so two workers can never both own an envelope.

use std::collections::HashSet;
use std::time::Duration;

use chrono::{DateTime, FixedOffset, Utc};
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, PaginatorTrait, QueryFilter,
    QueryOrder, QuerySelect, Set,
};
use serde::Serialize;
use serde_json::{Value, json};
use uuid::Uuid;

use super::errors::{EventError, Result};
use crate::entity::event_envelope::{ActiveModel, Column, Entity as EventEnvelope, Model};
use crate::entity::event_status::{DispatchMode, EventPriority, EventStatus};

const CLAIMABLE: [EventStatus; 2] = [EventStatus::Pending, EventStatus::Retry];

pub(crate) fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX)
}

/// `now - duration`, clamped to the earliest representable instant.
pub(crate) fn before(now: DateTime<FixedOffset>, duration: Duration) -> DateTime<FixedOffset> {
    now.checked_sub_signed(to_chrono(duration))
        .unwrap_or_else(|| DateTime::<Utc>::MIN_UTC.fixed_offset())
}

/// Persist a new pending envelope.
pub async fn enqueue(
    db: &DatabaseConnection,
    name: &str,
    payload: Value,
    priority: EventPriority,
    delay: Duration,
    max_attempts: u32,
) -> Result<Model> {
    let now = Utc::now().fixed_offset();
    let model = ActiveModel {
        id: Set(Uuid::new_v4()),
        name: Set(name.to_string()),
        payload: Set(payload),
        mode: Set(DispatchMode::Async),
        priority: Set(priority),
        status: Set(EventStatus::Pending),
        scheduled_at: Set(now + to_chrono(delay)),
        attempts: Set(0),
        max_attempts: Set(max_attempts.max(1) as i32),
        delivered_to: Set(json!([])),
        last_error: Set(None),
        claimed_at: Set(None),
        completed_at: Set(None),
        created_at: Set(now),
    };
    Ok(model.insert(db).await?)
}

pub async fn find(db: &DatabaseConnection, id: Uuid) -> Result<Option<Model>> {
    Ok(EventEnvelope::find_by_id(id).one(db).await?)
}

/// Priority used for claim ordering: one tier higher per `aging_interval`
/// spent waiting since the envelope became due, capped at critical.
pub fn effective_rank(
    envelope: &Model,
    now: DateTime<FixedOffset>,
    aging_interval: Duration,
) -> i32 {
    let base = envelope.priority.rank();
    if aging_interval.is_zero() {
        return base;
    }
    let waited = (now - envelope.scheduled_at).to_std().unwrap_or_default();
    let bumps = waited.as_secs() / aging_interval.as_secs().max(1);
    let bumps = i32::try_from(bumps).unwrap_or(i32::MAX);
    base.saturating_add(bumps).min(EventPriority::Critical.rank())
}

/// Atomically claim up to `limit` due envelopes, highest effective priority first.
///
/// Candidates are the top of the queue by stored priority plus the longest
/// waiting envelopes, so aged low-priority work is always considered.
pub async fn claim_due(
    db: &DatabaseConnection,
    now: DateTime<FixedOffset>,
    limit: u64,
    aging_interval: Duration,
) -> Result<Vec<Model>> {
    let due = || {
        EventEnvelope::find()
            .filter(Column::Status.is_in(CLAIMABLE))
            .filter(Column::ScheduledAt.lte(now))
    };

    let by_priority = due()
        .order_by_desc(Column::Priority)
        .order_by_asc(Column::CreatedAt)
        .limit(limit)
        .all(db)
        .await?;
    let by_age = due()
        .order_by_asc(Column::ScheduledAt)
        .limit(limit)
        .all(db)
        .await?;

    let mut seen = HashSet::new();
    let mut candidates: Vec<Model> = by_priority
        .into_iter()
        .chain(by_age)
        .filter(|m| seen.insert(m.id))
        .collect();
    candidates.sort_by(|a, b| {
        effective_rank(b, now, aging_interval)
            .cmp(&effective_rank(a, now, aging_interval))
            .then(a.created_at.cmp(&b.created_at))
    });

    let mut claimed = Vec::new();
    for mut candidate in candidates {
        if claimed.len() as u64 >= limit {
            break;
        }
        let result = EventEnvelope::update_many()
            .col_expr(Column::Status, Expr::value(EventStatus::Processing))
            .col_expr(Column::ClaimedAt, Expr::value(now))
            .filter(Column::Id.eq(candidate.id))
            .filter(Column::Status.is_in(CLAIMABLE))
            .exec(db)
            .await?;
        if result.rows_affected == 1 {
            candidate.status = EventStatus::Processing;
            candidate.claimed_at = Some(now);
            claimed.push(candidate);
        }
    }
    Ok(claimed)
}

/// `processing -> completed`.
pub async fn mark_completed(
    db: &DatabaseConnection,
    envelope: &Model,
    delivered: &[i64],
) -> Result<bool> {
    let now = Utc::now().fixed_offset();
    let result = EventEnvelope::update_many()
        .col_expr(Column::Status, Expr::value(EventStatus::Completed))
        .col_expr(Column::Attempts, Expr::value(envelope.attempts + 1))
        .col_expr(Column::DeliveredTo, Expr::value(json!(delivered)))
        .col_expr(Column::LastError, Expr::value(Option::<String>::None))
        .col_expr(Column::CompletedAt, Expr::value(now))
        .filter(Column::Id.eq(envelope.id))
        .filter(Column::Status.eq(EventStatus::Processing))
        .exec(db)
        .await?;
    Ok(result.rows_affected == 1)
}

/// `processing -> retry` at `scheduled_at`.
pub async fn mark_retry(
    db: &DatabaseConnection,
    envelope: &Model,
    delivered: &[i64],
    error: &str,
    scheduled_at: DateTime<FixedOffset>,
) -> Result<bool> {
    let result = EventEnvelope::update_many()
        .col_expr(Column::Status, Expr::value(EventStatus::Retry))
        .col_expr(Column::Attempts, Expr::value(envelope.attempts + 1))
        .col_expr(Column::DeliveredTo, Expr::value(json!(delivered)))
        .col_expr(Column::LastError, Expr::value(error))
        .col_expr(Column::ScheduledAt, Expr::value(scheduled_at))
        .filter(Column::Id.eq(envelope.id))
        .filter(Column::Status.eq(EventStatus::Processing))
        .exec(db)
        .await?;
    Ok(result.rows_affected == 1)
}

/// `processing -> failed` (terminal).
pub async fn mark_failed(
    db: &DatabaseConnection,
    envelope: &Model,
    delivered: &[i64],
    error: &str,
) -> Result<bool> {
    let now = Utc::now().fixed_offset();
    let result = EventEnvelope::update_many()
        .col_expr(Column::Status, Expr::value(EventStatus::Failed))
        .col_expr(Column::Attempts, Expr::value(envelope.attempts + 1))
        .col_expr(Column::DeliveredTo, Expr::value(json!(delivered)))
        .col_expr(Column::LastError, Expr::value(error))
        .col_expr(Column::CompletedAt, Expr::value(now))
        .filter(Column::Id.eq(envelope.id))
        .filter(Column::Status.eq(EventStatus::Processing))
        .exec(db)
        .await?;
    Ok(result.rows_affected == 1)
}

/// Return envelopes stuck in `processing` for longer than `claim_timeout` to `retry`.
pub async fn recover_stale(db: &DatabaseConnection, claim_timeout: Duration) -> Result<u64> {
    let now = Utc::now().fixed_offset();
    let cutoff = before(now, claim_timeout);
    let result = EventEnvelope::update_many()
        .col_expr(Column::Status, Expr::value(EventStatus::Retry))
        .col_expr(Column::ScheduledAt, Expr::value(now))
        .col_expr(Column::LastError, Expr::value("claim expired before completion"))
        .filter(Column::Status.eq(EventStatus::Processing))
        .filter(Column::ClaimedAt.lt(cutoff))
        .exec(db)
        .await?;
    Ok(result.rows_affected)
}

/// Reset a terminally failed envelope to `pending` with zero attempts.
pub async fn replay(db: &DatabaseConnection, id: Uuid) -> Result<Model> {
    let envelope = find(db, id).await?.ok_or(EventError::NotFound(id))?;
    if envelope.status != EventStatus::Failed {
        return Err(EventError::NotReplayable {
            id,
            status: envelope.status,
        });
    }

    let now = Utc::now().fixed_offset();
    let result = EventEnvelope::update_many()
        .col_expr(Column::Status, Expr::value(EventStatus::Pending))
        .col_expr(Column::Attempts, Expr::value(0))
        .col_expr(Column::ScheduledAt, Expr::value(now))
        .col_expr(Column::CompletedAt, Expr::value(Option::<DateTime<FixedOffset>>::None))
        .col_expr(Column::ClaimedAt, Expr::value(Option::<DateTime<FixedOffset>>::None))
        .filter(Column::Id.eq(id))
        .filter(Column::Status.eq(EventStatus::Failed))
        .exec(db)
        .await?;
    if result.rows_affected != 1 {
        return Err(EventError::NotReplayable {
            id,
            status: EventStatus::Pending,
        });
    }

    find(db, id).await?.ok_or(EventError::NotFound(id))
}

/// Delete terminal envelopes that finished before `cutoff`.
pub async fn prune(db: &DatabaseConnection, cutoff: DateTime<FixedOffset>) -> Result<u64> {
    let result = EventEnvelope::delete_many()
        .filter(Column::Status.is_in([EventStatus::Completed, EventStatus::Failed]))
        .filter(Column::CompletedAt.lt(cutoff))
        .exec(db)
        .await?;
    Ok(result.rows_affected)
}

/// Envelope counts by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueCounts {
    pub pending: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
    pub retry: u64,
}

pub async fn counts(db: &DatabaseConnection) -> Result<QueueCounts> {
    let count = |status: EventStatus| {
        EventEnvelope::find()
            .filter(Column::Status.eq(status))
            .count(db)
    };
    Ok(QueueCounts {
        pending: count(EventStatus::Pending).await?,
        processing: count(EventStatus::Processing).await?,
        completed: count(EventStatus::Completed).await?,
        failed: count(EventStatus::Failed).await?,
        retry: count(EventStatus::Retry).await?,
    })
}
