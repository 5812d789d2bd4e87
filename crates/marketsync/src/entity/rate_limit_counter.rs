//! RateLimitCounter entity - shared sliding-log request counters.
//!
//! One row per rate-limit key (`<marketplace>:<endpoint class>`). `hits` holds
//! the epoch-millisecond timestamps of the calls admitted within the trailing
//! period; `revision` increases on every write so compare-and-swap updates can
//! detect a concurrent writer.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "rate_limit_counters")]
pub struct Model {
    /// Counter key.
    #[sea_orm(primary_key, auto_increment = false)]
    pub key: String,

    /// Calls admitted in the trailing period as of the last write.
    pub count: i32,

    /// Oldest admitted call still in the log, epoch milliseconds.
    pub window_start: i64,

    /// Budget the log was last written with.
    pub limit: i32,

    /// Trailing period in milliseconds.
    pub period_ms: i64,

    /// Admission timestamps, epoch milliseconds, oldest first.
    #[sea_orm(column_type = "Json")]
    pub hits: Json,

    pub revision: i64,

    pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    /// Admission timestamps still inside a trailing `period_ms` at `now_ms`.
    ///
    /// Entries that are not integers are dropped.
    pub fn live_hits(&self, now_ms: i64, period_ms: i64) -> Vec<i64> {
        let mut hits: Vec<i64> = self
            .hits
            .as_array()
            .map(|values| values.iter().filter_map(|v| v.as_i64()).collect())
            .unwrap_or_default();
        hits.retain(|t| now_ms - t < period_ms);
        hits.sort_unstable();
        hits
    }
}
