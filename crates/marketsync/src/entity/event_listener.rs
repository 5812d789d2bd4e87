//! EventListener entity - registration of a named handler for an event.
//!
//! Rows are deactivated rather than deleted. The auto-increment id is the
//! registration order used to break priority ties.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "event_listeners")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,

    /// Event name, `*`, or a `prefix.*` pattern.
    pub event_name: String,

    /// Key into the handler table.
    pub handler: String,

    pub priority: i32,

    pub active: bool,

    /// Dot-path to expected value map matched against the payload.
    #[sea_orm(column_type = "Json")]
    pub conditions: Json,

    pub created_at: DateTimeWithTimeZone,

    pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
