//! RemoteEntityMapping entity - links a local entity to its marketplace twin.
//!
//! `(marketplace, natural_key)` is unique, and so is
//! `(marketplace, entity_kind, local_id)`: a local entity maps to at most one
//! remote entity per marketplace.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

use crate::entity::entity_kind::EntityKind;
use crate::entity::marketplace::Marketplace;
use crate::entity::sync_status::SyncStatus;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "remote_entity_mappings")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    pub marketplace: Marketplace,

    pub entity_kind: EntityKind,

    /// Local (backend) identifier.
    pub local_id: String,

    /// Marketplace-scoped business key (SKU, barcode, offer id).
    pub natural_key: String,

    /// Remote identifier, once the marketplace has confirmed the entity.
    pub remote_id: Option<String>,

    /// Asynchronous marketplace task awaiting confirmation.
    pub task_id: Option<String>,

    pub sync_status: SyncStatus,

    /// SHA-256 of the last state the marketplace accepted.
    pub state_hash: Option<String>,

    /// Last state the marketplace accepted.
    #[sea_orm(column_type = "Json", nullable)]
    pub last_state: Option<Json>,

    pub last_sync_at: Option<DateTimeWithTimeZone>,

    #[sea_orm(column_type = "Text", nullable)]
    pub error_message: Option<String>,

    /// Consecutive failed reconciliations.
    pub attempts: i32,

    pub created_at: DateTimeWithTimeZone,

    pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    /// A task id is outstanding and has not been resolved yet.
    pub fn has_open_task(&self) -> bool {
        self.sync_status == SyncStatus::Pending && self.task_id.is_some()
    }
}
