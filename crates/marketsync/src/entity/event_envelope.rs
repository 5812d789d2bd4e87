//! EventEnvelope entity - durable unit of the asynchronous event queue.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

use crate::entity::event_status::{DispatchMode, EventPriority, EventStatus};

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "event_queue")]
pub struct Model {
    /// Queue id returned by `trigger`.
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    pub name: String,

    #[sea_orm(column_type = "Json")]
    pub payload: Json,

    pub mode: DispatchMode,

    pub priority: EventPriority,

    pub status: EventStatus,

    /// Earliest time the envelope may be claimed.
    pub scheduled_at: DateTimeWithTimeZone,

    pub attempts: i32,

    pub max_attempts: i32,

    /// Listener ids that already received the event successfully.
    #[sea_orm(column_type = "Json")]
    pub delivered_to: Json,

    #[sea_orm(column_type = "Text", nullable)]
    pub last_error: Option<String>,

    /// Set when a worker claims the envelope.
    pub claimed_at: Option<DateTimeWithTimeZone>,

    pub completed_at: Option<DateTimeWithTimeZone>,

    pub created_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    /// Listener ids recorded in `delivered_to`.
    pub fn delivered_listener_ids(&self) -> Vec<i64> {
        self.delivered_to
            .as_array()
            .map(|ids| ids.iter().filter_map(|v| v.as_i64()).collect())
            .unwrap_or_default()
    }

    pub fn is_exhausted(&self) -> bool {
        self.attempts >= self.max_attempts
    }
}
