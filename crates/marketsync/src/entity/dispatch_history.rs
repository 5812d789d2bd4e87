//! DispatchHistory entity - append-only record of every dispatched event.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

use crate::entity::event_status::DispatchMode;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "dispatch_history")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,

    /// Envelope this record belongs to (async dispatch only).
    pub queue_id: Option<Uuid>,

    pub event_name: String,

    pub mode: DispatchMode,

    #[sea_orm(column_type = "Json")]
    pub payload: Json,

    /// Listeners invoked with their outcomes.
    #[sea_orm(column_type = "Json")]
    pub listeners: Json,

    pub success: bool,

    pub execution_time_ms: i64,

    pub created_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
