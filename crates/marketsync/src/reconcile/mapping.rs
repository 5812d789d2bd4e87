//! Persistence for `remote_entity_mappings`.

use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, DbErr, EntityTrait, PaginatorTrait,
    QueryFilter, QueryOrder, Set, SqlErr,
};
use serde_json::Value;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::entity::entity_kind::EntityKind;
use crate::entity::marketplace::Marketplace;
use crate::entity::remote_entity_mapping::{
    ActiveModel, Column, Entity as RemoteEntityMapping, Model,
};
use crate::entity::sync_status::SyncStatus;

/// Hex SHA-256 of the canonical JSON encoding of `state`.
///
/// Object keys are written in sorted order, so equal states hash equally
/// regardless of the order they were built in.
pub fn state_hash(state: &Value) -> String {
    let mut canonical = String::new();
    write_canonical(state, &mut canonical);
    let digest = Sha256::digest(canonical.as_bytes());
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key.as_str()], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// Find a mapping by its natural key.
pub async fn find_by_key(
    db: &DatabaseConnection,
    marketplace: Marketplace,
    natural_key: &str,
) -> Result<Option<Model>, DbErr> {
    RemoteEntityMapping::find()
        .filter(Column::Marketplace.eq(marketplace))
        .filter(Column::NaturalKey.eq(natural_key))
        .one(db)
        .await
}

/// Find a mapping by local id.
pub async fn find_by_local_id(
    db: &DatabaseConnection,
    marketplace: Marketplace,
    kind: EntityKind,
    local_id: &str,
) -> Result<Option<Model>, DbErr> {
    RemoteEntityMapping::find()
        .filter(Column::Marketplace.eq(marketplace))
        .filter(Column::EntityKind.eq(kind))
        .filter(Column::LocalId.eq(local_id))
        .one(db)
        .await
}

/// Mappings waiting on an asynchronous marketplace task, oldest first.
pub async fn find_open_tasks(
    db: &DatabaseConnection,
    marketplace: Marketplace,
    kind: EntityKind,
) -> Result<Vec<Model>, DbErr> {
    RemoteEntityMapping::find()
        .filter(Column::Marketplace.eq(marketplace))
        .filter(Column::EntityKind.eq(kind))
        .filter(Column::SyncStatus.eq(SyncStatus::Pending))
        .filter(Column::TaskId.is_not_null())
        .order_by_asc(Column::UpdatedAt)
        .all(db)
        .await
}

/// Mapping counts by status for one marketplace.
pub async fn count_by_status(
    db: &DatabaseConnection,
    marketplace: Marketplace,
    status: SyncStatus,
) -> Result<u64, DbErr> {
    RemoteEntityMapping::find()
        .filter(Column::Marketplace.eq(marketplace))
        .filter(Column::SyncStatus.eq(status))
        .count(db)
        .await
}

/// Pending task mappings not touched since `before`.
pub async fn count_stale_tasks(
    db: &DatabaseConnection,
    marketplace: Marketplace,
    before: chrono::DateTime<chrono::FixedOffset>,
) -> Result<u64, DbErr> {
    RemoteEntityMapping::find()
        .filter(Column::Marketplace.eq(marketplace))
        .filter(Column::SyncStatus.eq(SyncStatus::Pending))
        .filter(Column::TaskId.is_not_null())
        .filter(Column::UpdatedAt.lt(before))
        .count(db)
        .await
}

/// Delete the mapping for a natural key.
pub async fn delete_by_key(
    db: &DatabaseConnection,
    marketplace: Marketplace,
    natural_key: &str,
) -> Result<u64, DbErr> {
    let result = RemoteEntityMapping::delete_many()
        .filter(Column::Marketplace.eq(marketplace))
        .filter(Column::NaturalKey.eq(natural_key))
        .exec(db)
        .await?;
    Ok(result.rows_affected)
}

/// What a reconciliation learned about one entity.
#[derive(Debug, Clone)]
pub(crate) enum Change<'a> {
    /// The marketplace holds `state` under `remote_id`.
    Synced { remote_id: &'a str, state: &'a Value },
    /// The marketplace accepted `state` into task `task_id`.
    Submitted { task_id: &'a str, state: &'a Value },
    /// The attempt failed; the last accepted state is kept.
    Failed { message: &'a str },
}

/// Identity of the entity being written.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Target<'a> {
    pub marketplace: Marketplace,
    pub kind: EntityKind,
    pub natural_key: &'a str,
    pub local_id: &'a str,
}

fn apply(model: &mut ActiveModel, existing: Option<&Model>, change: &Change<'_>) {
    let now = Utc::now().fixed_offset();
    model.updated_at = Set(now);
    match change {
        Change::Synced { remote_id, state } => {
            model.remote_id = Set(Some((*remote_id).to_string()));
            model.task_id = Set(None);
            model.sync_status = Set(SyncStatus::Synced);
            model.state_hash = Set(Some(state_hash(state)));
            model.last_state = Set(Some((*state).clone()));
            model.last_sync_at = Set(Some(now));
            model.error_message = Set(None);
            model.attempts = Set(0);
        }
        Change::Submitted { task_id, state } => {
            model.task_id = Set(Some((*task_id).to_string()));
            model.sync_status = Set(SyncStatus::Pending);
            model.state_hash = Set(Some(state_hash(state)));
            model.last_state = Set(Some((*state).clone()));
            model.error_message = Set(None);
            model.attempts = Set(0);
        }
        Change::Failed { message } => {
            model.task_id = Set(None);
            model.sync_status = Set(SyncStatus::Error);
            model.error_message = Set(Some((*message).to_string()));
            model.attempts = Set(existing.map_or(0, |m| m.attempts) + 1);
        }
    }
}

/// Record `change` against the mapping for `target`, inserting it if needed.
///
/// A concurrent insert for the same natural key from another process is
/// resolved by reloading and updating the winner's row.
pub(crate) async fn record(
    db: &DatabaseConnection,
    target: Target<'_>,
    existing: Option<&Model>,
    change: &Change<'_>,
) -> Result<Model, DbErr> {
    if let Some(existing) = existing {
        return update(db, target, existing, change).await;
    }

    let now = Utc::now().fixed_offset();
    let mut model = ActiveModel {
        id: Set(Uuid::new_v4()),
        marketplace: Set(target.marketplace),
        entity_kind: Set(target.kind),
        local_id: Set(target.local_id.to_string()),
        natural_key: Set(target.natural_key.to_string()),
        remote_id: Set(None),
        task_id: Set(None),
        sync_status: Set(SyncStatus::Pending),
        state_hash: Set(None),
        last_state: Set(None),
        last_sync_at: Set(None),
        error_message: Set(None),
        attempts: Set(0),
        created_at: Set(now),
        updated_at: Set(now),
    };
    apply(&mut model, None, change);

    match model.insert(db).await {
        Ok(model) => Ok(model),
        Err(e) if matches!(e.sql_err(), Some(SqlErr::UniqueConstraintViolation(_))) => {
            tracing::debug!(
                marketplace = %target.marketplace,
                natural_key = %target.natural_key,
                "Mapping inserted concurrently, updating existing row"
            );
            let winner = find_by_key(db, target.marketplace, target.natural_key)
                .await?
                .ok_or(e)?;
            update(db, target, &winner, change).await
        }
        Err(e) => Err(e),
    }
}

async fn update(
    db: &DatabaseConnection,
    target: Target<'_>,
    existing: &Model,
    change: &Change<'_>,
) -> Result<Model, DbErr> {
    let mut model: ActiveModel = existing.clone().into();
    if existing.natural_key != target.natural_key {
        model.natural_key = Set(target.natural_key.to_string());
    }
    if existing.local_id != target.local_id {
        model.local_id = Set(target.local_id.to_string());
    }
    apply(&mut model, Some(existing), change);
    model.update(db).await
}
