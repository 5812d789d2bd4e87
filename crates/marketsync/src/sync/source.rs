//! Where the orchestrator reads desired entity state from.

use std::collections::HashMap;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Deserialize;
use serde_json::Value;

use super::errors::{Result, SyncError};
use crate::entity::entity_kind::EntityKind;
use crate::entity::marketplace::Marketplace;
use crate::reconcile::DesiredEntity;

/// Supplies the desired state of local entities.
///
/// Ids that the source does not know are simply left out of the result; the
/// orchestrator reports them as `not_found`.
#[async_trait]
pub trait EntitySource: Send + Sync {
    async fn load(
        &self,
        marketplace: Marketplace,
        kind: EntityKind,
        ids: &[String],
    ) -> Result<Vec<DesiredEntity>>;
}

/// One catalog record as read from JSON.
#[derive(Debug, Clone, Deserialize)]
struct CatalogRecord {
    local_id: String,
    natural_key: String,
    #[serde(default)]
    state: Value,
    /// Per-marketplace state overrides, merged over `state`.
    #[serde(default)]
    marketplaces: HashMap<Marketplace, Value>,
}

/// In-process entity catalog.
///
/// Loaded from JSON shaped as `{ "product": [ { "local_id", "natural_key",
/// "state", "marketplaces": { "ozon": {...} } } ] }`.
#[derive(Debug, Default)]
pub struct CatalogSource {
    records: DashMap<(EntityKind, String), CatalogRecord>,
}

impl CatalogSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_json(catalog: &Value) -> Result<Self> {
        let source = Self::new();
        let Some(kinds) = catalog.as_object() else {
            return Err(SyncError::source_error("catalog must be a JSON object"));
        };
        for (kind, records) in kinds {
            let kind: EntityKind = kind.parse().map_err(SyncError::Source)?;
            let records: Vec<CatalogRecord> = serde_json::from_value(records.clone())
                .map_err(|e| SyncError::source_error(format!("invalid {} records: {}", kind, e)))?;
            for record in records {
                source.records.insert((kind, record.local_id.clone()), record);
            }
        }
        Ok(source)
    }

    /// Add or replace an entity.
    pub fn insert(&self, kind: EntityKind, entity: DesiredEntity) {
        self.records.insert(
            (kind, entity.local_id.clone()),
            CatalogRecord {
                local_id: entity.local_id,
                natural_key: entity.natural_key,
                state: entity.state,
                marketplaces: HashMap::new(),
            },
        );
    }

    /// Local ids known for `kind`, sorted.
    pub fn ids(&self, kind: EntityKind) -> Vec<String> {
        let mut ids: Vec<String> = self
            .records
            .iter()
            .filter(|r| r.key().0 == kind)
            .map(|r| r.key().1.clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

fn merge(base: &Value, overlay: &Value) -> Value {
    match (base, overlay) {
        (Value::Object(base), Value::Object(overlay)) => {
            let mut merged = base.clone();
            for (key, value) in overlay {
                let next = match merged.get(key) {
                    Some(existing) => merge(existing, value),
                    None => value.clone(),
                };
                merged.insert(key.clone(), next);
            }
            Value::Object(merged)
        }
        (_, Value::Null) => base.clone(),
        (_, overlay) => overlay.clone(),
    }
}

#[async_trait]
impl EntitySource for CatalogSource {
    async fn load(
        &self,
        marketplace: Marketplace,
        kind: EntityKind,
        ids: &[String],
    ) -> Result<Vec<DesiredEntity>> {
        Ok(ids
            .iter()
            .filter_map(|id| self.records.get(&(kind, id.clone())))
            .map(|record| {
                let state = match record.marketplaces.get(&marketplace) {
                    Some(overlay) => merge(&record.state, overlay),
                    None => record.state.clone(),
                };
                DesiredEntity::new(record.natural_key.clone(), record.local_id.clone(), state)
            })
            .collect())
    }
}
