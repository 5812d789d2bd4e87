//! Event envelope state machine and delivery metadata enums.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Envelope lifecycle: `pending -> processing -> {completed | failed | retry}`,
/// with `retry` becoming claimable again once `scheduled_at` has passed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, EnumIter, DeriveActiveEnum, Serialize, Deserialize)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::None)")]
#[serde(rename_all = "lowercase")]
pub enum EventStatus {
    #[sea_orm(string_value = "pending")]
    Pending,
    #[sea_orm(string_value = "processing")]
    Processing,
    #[sea_orm(string_value = "completed")]
    Completed,
    #[sea_orm(string_value = "failed")]
    Failed,
    #[sea_orm(string_value = "retry")]
    Retry,
}

impl EventStatus {
    /// Terminal states are never claimed again without a manual replay.
    pub fn is_terminal(&self) -> bool {
        matches!(self, EventStatus::Completed | EventStatus::Failed)
    }
}

impl std::fmt::Display for EventStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EventStatus::Pending => "pending",
            EventStatus::Processing => "processing",
            EventStatus::Completed => "completed",
            EventStatus::Failed => "failed",
            EventStatus::Retry => "retry",
        };
        f.write_str(s)
    }
}

/// Event priority, stored as an integer so the queue can order by it.
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    EnumIter,
    DeriveActiveEnum,
    Serialize,
    Deserialize,
)]
#[sea_orm(rs_type = "i32", db_type = "Integer")]
#[serde(rename_all = "lowercase")]
pub enum EventPriority {
    #[sea_orm(num_value = 0)]
    Low,
    #[default]
    #[sea_orm(num_value = 1)]
    Normal,
    #[sea_orm(num_value = 2)]
    High,
    #[sea_orm(num_value = 3)]
    Critical,
}

impl EventPriority {
    pub fn rank(&self) -> i32 {
        *self as i32
    }

    /// Inverse of [`rank`](Self::rank), clamping out-of-range values.
    pub fn from_rank(rank: i32) -> Self {
        match rank {
            i32::MIN..=0 => EventPriority::Low,
            1 => EventPriority::Normal,
            2 => EventPriority::High,
            _ => EventPriority::Critical,
        }
    }
}

impl std::fmt::Display for EventPriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EventPriority::Low => "low",
            EventPriority::Normal => "normal",
            EventPriority::High => "high",
            EventPriority::Critical => "critical",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for EventPriority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "low" => Ok(EventPriority::Low),
            "normal" => Ok(EventPriority::Normal),
            "high" => Ok(EventPriority::High),
            "critical" => Ok(EventPriority::Critical),
            _ => Err(format!("Unknown event priority: {}", s)),
        }
    }
}

/// How an event is delivered.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, EnumIter, DeriveActiveEnum, Serialize,
    Deserialize,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::None)")]
#[serde(rename_all = "lowercase")]
pub enum DispatchMode {
    /// Listeners run inline in the caller.
    #[default]
    #[sea_orm(string_value = "sync")]
    Sync,
    /// The event is queued and delivered by the worker.
    #[sea_orm(string_value = "async")]
    Async,
}
