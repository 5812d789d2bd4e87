//! ApiCallLog entity - append-only record of every executed marketplace call.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

use crate::entity::marketplace::Marketplace;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "api_call_logs")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,

    pub marketplace: Marketplace,

    pub tenant_id: Option<String>,

    /// Endpoint class (e.g. `products.create`).
    pub endpoint: String,

    pub method: String,

    #[sea_orm(column_type = "Text")]
    pub url: String,

    /// Request snapshot with credentials redacted.
    #[sea_orm(column_type = "Json")]
    pub request: Json,

    #[sea_orm(column_type = "Json", nullable)]
    pub response: Option<Json>,

    pub http_status: Option<i32>,

    pub latency_ms: i64,

    pub success: bool,

    /// Error kind (`auth`, `rate_limited`, `transient_network`, ...).
    pub error_kind: Option<String>,

    #[sea_orm(column_type = "Text", nullable)]
    pub error: Option<String>,

    pub created_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
