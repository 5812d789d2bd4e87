//! Sliding-log counter stores.
//!
//! Each key keeps the admission times of the calls made within the trailing
//! period. A call is admitted only while fewer than `budget.requests` entries
//! remain in the log, so no trailing period of any alignment ever holds more
//! than `budget.requests` admissions.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use sea_orm::sea_query::{Expr, OnConflict};
use sea_orm::{ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, Set};
use serde_json::json;
use tokio::time::Instant;

use super::RateBudget;
use super::errors::StoreError;
use crate::entity::rate_limit_counter::{
    ActiveModel as CounterActiveModel, Column as CounterColumn, Entity as Counter,
};

/// Result of asking a store for one slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Slot taken; `remaining` slots are left in the trailing period.
    Granted { remaining: u32 },
    /// Budget exhausted; the oldest counted call leaves the period after
    /// `retry_after`.
    Denied { retry_after: Duration },
}

/// Shared storage for rate-limit logs.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Atomically take one slot for `key` under `budget`.
    async fn try_acquire(&self, key: &str, budget: &RateBudget) -> Result<Admission, StoreError>;
}

/// Process-local store.
///
/// Uses the tokio clock, so paused-time tests control expiry.
#[derive(Debug, Default)]
pub struct MemoryCounterStore {
    logs: DashMap<String, VecDeque<Instant>>,
}

impl MemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop keys whose newest admission is older than `period`.
    pub fn evict_expired(&self, period: Duration) {
        let now = Instant::now();
        self.logs.retain(|_, log| {
            log.back()
                .is_some_and(|newest| now.duration_since(*newest) < period)
        });
    }

    pub fn len(&self) -> usize {
        self.logs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.logs.is_empty()
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn try_acquire(&self, key: &str, budget: &RateBudget) -> Result<Admission, StoreError> {
        let now = Instant::now();
        let mut entry = self.logs.entry(key.to_string()).or_default();
        let log = entry.value_mut();

        while log
            .front()
            .is_some_and(|oldest| now.duration_since(*oldest) >= budget.period)
        {
            log.pop_front();
        }

        let used = log.len();
        let limit = budget.requests as usize;
        if used < limit {
            log.push_back(now);
            return Ok(Admission::Granted {
                remaining: (limit - used - 1) as u32,
            });
        }

        // The call that frees a slot for us is the one `limit` places from the end.
        let oldest = log.get(used - limit).copied().unwrap_or(now);
        let frees_at = oldest + budget.period;
        Ok(Admission::Denied {
            retry_after: frees_at.saturating_duration_since(now),
        })
    }
}

/// Store shared by every worker using the same database.
///
/// Each admission rewrites the key's log with a conditional `UPDATE` keyed on
/// the revision the caller read; losing a race re-reads the row.
#[derive(Debug, Clone)]
pub struct DbCounterStore {
    db: Arc<DatabaseConnection>,
}

const MAX_CAS_ATTEMPTS: usize = 16;

impl DbCounterStore {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    async fn open_log(
        &self,
        key: &str,
        budget: &RateBudget,
        now_ms: i64,
    ) -> Result<bool, StoreError> {
        let model = CounterActiveModel {
            key: Set(key.to_string()),
            count: Set(1),
            window_start: Set(now_ms),
            limit: Set(budget.requests as i32),
            period_ms: Set(budget.period_ms()),
            hits: Set(json!([now_ms])),
            revision: Set(0),
            updated_at: Set(Utc::now().fixed_offset()),
        };
        let inserted = Counter::insert(model)
            .on_conflict(OnConflict::column(CounterColumn::Key).do_nothing().to_owned())
            .exec_without_returning(self.db.as_ref())
            .await?;
        Ok(inserted == 1)
    }

    async fn write_log(
        &self,
        key: &str,
        budget: &RateBudget,
        hits: &[i64],
        observed_revision: i64,
    ) -> Result<bool, StoreError> {
        let oldest = hits.first().copied().unwrap_or_default();
        let result = Counter::update_many()
            .col_expr(CounterColumn::Hits, Expr::value(json!(hits)))
            .col_expr(CounterColumn::Count, Expr::value(hits.len() as i32))
            .col_expr(CounterColumn::WindowStart, Expr::value(oldest))
            .col_expr(CounterColumn::Limit, Expr::value(budget.requests as i32))
            .col_expr(CounterColumn::PeriodMs, Expr::value(budget.period_ms()))
            .col_expr(
                CounterColumn::Revision,
                Expr::col(CounterColumn::Revision).add(1),
            )
            .col_expr(CounterColumn::UpdatedAt, Expr::value(Utc::now().fixed_offset()))
            .filter(CounterColumn::Key.eq(key))
            .filter(CounterColumn::Revision.eq(observed_revision))
            .exec(self.db.as_ref())
            .await?;
        Ok(result.rows_affected == 1)
    }
}

#[async_trait]
impl CounterStore for DbCounterStore {
    async fn try_acquire(&self, key: &str, budget: &RateBudget) -> Result<Admission, StoreError> {
        let period_ms = budget.period_ms();
        let limit = budget.requests as usize;

        for _ in 0..MAX_CAS_ATTEMPTS {
            let now_ms = Utc::now().timestamp_millis();
            let row = Counter::find_by_id(key.to_string())
                .one(self.db.as_ref())
                .await?;

            let Some(row) = row else {
                if self.open_log(key, budget, now_ms).await? {
                    return Ok(Admission::Granted {
                        remaining: budget.requests.saturating_sub(1),
                    });
                }
                continue;
            };

            let mut hits = row.live_hits(now_ms, period_ms);
            let used = hits.len();
            if used >= limit {
                let frees_at = hits.get(used - limit).copied().unwrap_or(now_ms) + period_ms;
                return Ok(Admission::Denied {
                    retry_after: Duration::from_millis((frees_at - now_ms).max(1) as u64),
                });
            }

            hits.push(now_ms);
            if self.write_log(key, budget, &hits, row.revision).await? {
                return Ok(Admission::Granted {
                    remaining: (limit - used - 1) as u32,
                });
            }
        }

        Err(StoreError::Contention(key.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn budget(requests: u32, secs: u64) -> RateBudget {
        RateBudget::new(requests, Duration::from_secs(secs))
    }

    fn denied_for(admission: Admission) -> Duration {
        match admission {
            Admission::Denied { retry_after } => retry_after,
            other => panic!("expected denial, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn memory_store_admits_up_to_budget_then_denies() {
        let store = MemoryCounterStore::new();
        let b = budget(2, 10);

        assert_eq!(
            store.try_acquire("k", &b).await.unwrap(),
            Admission::Granted { remaining: 1 }
        );
        assert_eq!(
            store.try_acquire("k", &b).await.unwrap(),
            Admission::Granted { remaining: 0 }
        );

        tokio::time::advance(Duration::from_secs(4)).await;
        assert_eq!(
            denied_for(store.try_acquire("k", &b).await.unwrap()),
            Duration::from_secs(6)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn memory_store_frees_slots_after_period() {
        let store = MemoryCounterStore::new();
        let b = budget(1, 5);

        store.try_acquire("k", &b).await.unwrap();
        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(
            store.try_acquire("k", &b).await.unwrap(),
            Admission::Granted { remaining: 0 }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn memory_store_counts_calls_across_the_period_boundary() {
        let store = MemoryCounterStore::new();
        let b = budget(3, 10);

        store.try_acquire("k", &b).await.unwrap();
        tokio::time::advance(Duration::from_millis(9_900)).await;
        for _ in 0..2 {
            assert!(matches!(
                store.try_acquire("k", &b).await.unwrap(),
                Admission::Granted { .. }
            ));
        }

        // The call at t=0 has left the trailing period; the two at 9.9s have not.
        tokio::time::advance(Duration::from_millis(100)).await;
        assert_eq!(
            store.try_acquire("k", &b).await.unwrap(),
            Admission::Granted { remaining: 0 }
        );
        assert_eq!(
            denied_for(store.try_acquire("k", &b).await.unwrap()),
            Duration::from_millis(9_900)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn memory_store_keys_are_independent_and_evictable() {
        let store = MemoryCounterStore::new();
        let b = budget(1, 5);

        store.try_acquire("a", &b).await.unwrap();
        assert!(matches!(
            store.try_acquire("b", &b).await.unwrap(),
            Admission::Granted { .. }
        ));
        assert_eq!(store.len(), 2);

        tokio::time::advance(Duration::from_secs(6)).await;
        store.evict_expired(Duration::from_secs(5));
        assert!(store.is_empty());
    }

    #[cfg(all(feature = "sqlite", feature = "migrate"))]
    #[tokio::test]
    async fn db_store_enforces_budget_within_period() {
        let db = crate::db::connect_and_migrate("sqlite::memory:").await.unwrap();
        let store = DbCounterStore::new(Arc::new(db));
        let b = budget(3, 60);

        for expected in [2, 1, 0] {
            assert_eq!(
                store.try_acquire("trendyol:products", &b).await.unwrap(),
                Admission::Granted {
                    remaining: expected
                }
            );
        }
        let retry_after = denied_for(store.try_acquire("trendyol:products", &b).await.unwrap());
        assert!(retry_after <= Duration::from_secs(60));
        assert!(retry_after > Duration::from_secs(50));
    }

    #[cfg(all(feature = "sqlite", feature = "migrate"))]
    #[tokio::test]
    async fn db_store_frees_slot_after_period() {
        let db = crate::db::connect_and_migrate("sqlite::memory:").await.unwrap();
        let store = DbCounterStore::new(Arc::new(db));
        let b = RateBudget::new(1, Duration::from_millis(150));

        assert!(matches!(
            store.try_acquire("k", &b).await.unwrap(),
            Admission::Granted { .. }
        ));
        assert!(matches!(
            store.try_acquire("k", &b).await.unwrap(),
            Admission::Denied { .. }
        ));

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(matches!(
            store.try_acquire("k", &b).await.unwrap(),
            Admission::Granted { .. }
        ));
    }

    #[cfg(all(feature = "sqlite", feature = "migrate"))]
    #[tokio::test]
    async fn db_store_counts_calls_across_the_period_boundary() {
        let db = crate::db::connect_and_migrate("sqlite::memory:").await.unwrap();
        let store = DbCounterStore::new(Arc::new(db));
        let b = RateBudget::new(2, Duration::from_millis(1_000));

        store.try_acquire("k", &b).await.unwrap();
        tokio::time::sleep(Duration::from_millis(600)).await;
        store.try_acquire("k", &b).await.unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;

        // Only the first call has aged out; the second still occupies a slot.
        assert!(matches!(
            store.try_acquire("k", &b).await.unwrap(),
            Admission::Granted { remaining: 0 }
        ));
        let retry_after = denied_for(store.try_acquire("k", &b).await.unwrap());
        assert!(retry_after <= Duration::from_millis(500));
    }
}
