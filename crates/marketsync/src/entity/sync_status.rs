//! Reconciliation status of a remote entity mapping.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, EnumIter, DeriveActiveEnum, Serialize, Deserialize)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::None)")]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    /// Submitted, awaiting confirmation of an asynchronous marketplace task.
    #[sea_orm(string_value = "pending")]
    Pending,
    /// Remote entity matches the last submitted state.
    #[sea_orm(string_value = "synced")]
    Synced,
    /// Last reconciliation failed; `error_message` holds the reason.
    #[sea_orm(string_value = "error")]
    Error,
}

impl std::fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncStatus::Pending => write!(f, "pending"),
            SyncStatus::Synced => write!(f, "synced"),
            SyncStatus::Error => write!(f, "error"),
        }
    }
}
