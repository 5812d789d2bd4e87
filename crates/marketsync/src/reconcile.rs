//! Entity reconciler: idempotent local to remote mapping.
//!
//! Each upsert looks up the `(marketplace, natural_key)` mapping, decides
//! between create, update and no-op by comparing the desired state hash with
//! the last accepted one, and records the outcome on the mapping row. Writes
//! for one key are serialized through an in-process keyed lock; the unique
//! index on the mapping table covers other processes.

mod adapter;
mod errors;
pub mod mapping;

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use sea_orm::DbErr;
use serde_json::Value;

pub use adapter::{
    AdapterSpec, EndpointSpec, EntityAdapter, ItemAck, JsonEntityAdapter, TaskStatus, WriteAck,
    WriteItem,
};
pub use errors::{ReconcileError, Result};
pub use mapping::state_hash;

use crate::entity::entity_kind::EntityKind;
use crate::entity::marketplace::Marketplace;
use crate::entity::remote_entity_mapping::Model as Mapping;
use crate::entity::sync_status::SyncStatus;
use crate::executor::{AuthContext, RequestExecutor};
use crate::locks::KeyedLocks;
use crate::settings::MarketplaceConfig;
use mapping::{Change, Target};

/// A local entity in the state the marketplace should hold.
#[derive(Debug, Clone, PartialEq)]
pub struct DesiredEntity {
    pub natural_key: String,
    pub local_id: String,
    pub state: Value,
}

impl DesiredEntity {
    pub fn new(natural_key: impl Into<String>, local_id: impl Into<String>, state: Value) -> Self {
        Self {
            natural_key: natural_key.into(),
            local_id: local_id.into(),
            state,
        }
    }
}

/// What an upsert did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// Created and confirmed synchronously.
    Created { remote_id: String },
    /// Updated and confirmed synchronously.
    Updated { remote_id: String },
    /// Accepted into an asynchronous marketplace task.
    Submitted { task_id: String },
    /// Already in the desired state; no call was made.
    Unchanged { remote_id: Option<String> },
    /// An earlier submission of the same state is still being processed.
    StillPending { task_id: String },
}

impl UpsertOutcome {
    /// The marketplace holds the desired state.
    pub fn is_synced(&self) -> bool {
        matches!(
            self,
            Self::Created { .. } | Self::Updated { .. } | Self::Unchanged { .. }
        )
    }

    pub fn remote_id(&self) -> Option<&str> {
        match self {
            Self::Created { remote_id } | Self::Updated { remote_id } => Some(remote_id),
            Self::Unchanged { remote_id } => remote_id.as_deref(),
            _ => None,
        }
    }
}

/// Per-item result of [`Reconciler::upsert_batch`].
#[derive(Debug)]
pub struct BatchItemResult {
    pub natural_key: String,
    pub local_id: String,
    pub result: Result<UpsertOutcome>,
}

/// A pending mapping whose task finished during [`Reconciler::poll_pending`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedItem {
    pub natural_key: String,
    pub local_id: String,
    pub remote_id: Option<String>,
    /// Set when the task rejected the item.
    pub error: Option<String>,
}

/// Summary of one [`Reconciler::poll_pending`] pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PollReport {
    /// Distinct tasks queried.
    pub checked: usize,
    pub synced: usize,
    pub failed: usize,
    pub still_pending: usize,
    pub resolved: Vec<ResolvedItem>,
}

enum TaskCheck {
    /// The adapter cannot query task status.
    Unsupported,
    Running,
    /// Mappings rewritten from the task result, by natural key.
    Resolved(HashMap<String, Mapping>),
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum WriteKind {
    Create,
    Update,
}

/// Item scheduled for a write, with its position in the caller's batch.
struct Planned {
    index: usize,
    existing: Option<Mapping>,
    item: WriteItem,
}

/// Reconciles local entities against marketplaces.
pub struct Reconciler {
    executor: Arc<RequestExecutor>,
    locks: KeyedLocks<(Marketplace, String)>,
    adapters: RwLock<HashMap<(Marketplace, EntityKind), Arc<dyn EntityAdapter>>>,
}

impl Reconciler {
    pub fn new(executor: Arc<RequestExecutor>) -> Self {
        Self {
            executor,
            locks: KeyedLocks::new(),
            adapters: RwLock::new(HashMap::new()),
        }
    }

    pub fn executor(&self) -> &Arc<RequestExecutor> {
        &self.executor
    }

    /// Use `adapter` instead of the configured one for `(marketplace, kind)`.
    pub fn register_adapter(
        &self,
        marketplace: Marketplace,
        kind: EntityKind,
        adapter: Arc<dyn EntityAdapter>,
    ) {
        self.adapters
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert((marketplace, kind), adapter);
    }

    fn adapter(&self, config: &MarketplaceConfig, kind: EntityKind) -> Arc<dyn EntityAdapter> {
        let registered = self
            .adapters
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&(config.marketplace, kind))
            .cloned();
        registered.unwrap_or_else(|| Arc::new(JsonEntityAdapter::new(config.adapter_for(kind))))
    }

    /// Current mapping for a natural key.
    pub async fn mapping(
        &self,
        marketplace: Marketplace,
        natural_key: &str,
    ) -> Result<Option<Mapping>> {
        Ok(mapping::find_by_key(self.executor.db(), marketplace, natural_key).await?)
    }

    /// Drop the mapping for a natural key so the next upsert creates again.
    pub async fn forget(&self, marketplace: Marketplace, natural_key: &str) -> Result<bool> {
        let _guard = self
            .locks
            .lock((marketplace, natural_key.to_string()))
            .await;
        let deleted = mapping::delete_by_key(self.executor.db(), marketplace, natural_key).await?;
        Ok(deleted > 0)
    }

    /// Bring one entity to its desired state.
    pub async fn upsert(
        &self,
        ctx: &AuthContext,
        kind: EntityKind,
        entity: &DesiredEntity,
    ) -> Result<UpsertOutcome> {
        let mut results = self
            .upsert_batch(ctx, kind, std::slice::from_ref(entity))
            .await?;
        match results.pop() {
            Some(item) => item.result,
            None => Err(ReconcileError::Adapter("upsert produced no result".to_string())),
        }
    }

    /// Bring several entities of one kind to their desired state.
    ///
    /// All natural keys are locked for the duration. Creates and updates are
    /// grouped into as few calls as the adapter allows, bounded by the
    /// marketplace batch limit. Results are returned in input order; only
    /// configuration and mapping store errors fail the whole batch.
    pub async fn upsert_batch(
        &self,
        ctx: &AuthContext,
        kind: EntityKind,
        entities: &[DesiredEntity],
    ) -> Result<Vec<BatchItemResult>> {
        let config = self.executor.marketplace_config(ctx)?;
        let adapter = self.adapter(&config, kind);
        let marketplace = config.marketplace;
        let db = self.executor.db();

        let mut results: Vec<Option<Result<UpsertOutcome>>> =
            entities.iter().map(|_| None).collect();

        let mut seen = HashSet::new();
        for (index, entity) in entities.iter().enumerate() {
            if !seen.insert(entity.natural_key.as_str()) {
                results[index] = Some(Err(ReconcileError::DuplicateKey(
                    entity.natural_key.clone(),
                )));
            }
        }

        let _guards = self
            .locks
            .lock_many(
                entities
                    .iter()
                    .map(|e| (marketplace, e.natural_key.clone())),
            )
            .await;

        let mut existing: Vec<Option<Mapping>> = Vec::with_capacity(entities.len());
        for (index, entity) in entities.iter().enumerate() {
            if results[index].is_some() {
                existing.push(None);
                continue;
            }
            let found = match mapping::find_by_key(db, marketplace, &entity.natural_key).await? {
                Some(found) => Some(found),
                None => {
                    mapping::find_by_local_id(db, marketplace, kind, &entity.local_id).await?
                }
            };
            existing.push(found);
        }

        // Settle open tasks before deciding what to write.
        let mut tasks: HashMap<String, Vec<Mapping>> = HashMap::new();
        for found in existing.iter().flatten() {
            if found.has_open_task()
                && let Some(task_id) = &found.task_id
            {
                tasks.entry(task_id.clone()).or_default().push(found.clone());
            }
        }
        let mut running: HashSet<String> = HashSet::new();
        let mut unsupported: HashSet<String> = HashSet::new();
        for (task_id, members) in tasks {
            match self
                .check_task(&config, adapter.as_ref(), &task_id, &members)
                .await
            {
                Ok(TaskCheck::Running) => {
                    running.insert(task_id);
                }
                Ok(TaskCheck::Unsupported) => {
                    unsupported.insert(task_id);
                }
                Ok(TaskCheck::Resolved(updated)) => {
                    for slot in existing.iter_mut() {
                        if let Some(found) = slot
                            && let Some(model) = updated.get(&found.natural_key)
                        {
                            *found = model.clone();
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        marketplace = %marketplace,
                        task_id = %task_id,
                        "Could not query task status: {}",
                        e
                    );
                    running.insert(task_id);
                }
            }
        }

        let mut creates = Vec::new();
        let mut updates = Vec::new();
        for (index, entity) in entities.iter().enumerate() {
            if results[index].is_some() {
                continue;
            }
            let found = existing[index].take();
            let desired_hash = state_hash(&entity.state);
            let same_state = found
                .as_ref()
                .is_some_and(|m| m.state_hash.as_deref() == Some(desired_hash.as_str()));

            // An open task whose outcome is unknown may still create the
            // entity, so it is never submitted a second time.
            if let Some(m) = &found
                && let Some(task_id) = m.task_id.as_ref().filter(|_| m.has_open_task())
                && (running.contains(task_id)
                    || (unsupported.contains(task_id) && (same_state || m.remote_id.is_none())))
            {
                results[index] = Some(Ok(UpsertOutcome::StillPending {
                    task_id: task_id.clone(),
                }));
                continue;
            }
            if let Some(m) = &found
                && m.sync_status == SyncStatus::Synced
                && same_state
            {
                results[index] = Some(Ok(UpsertOutcome::Unchanged {
                    remote_id: m.remote_id.clone(),
                }));
                continue;
            }

            let remote_id = found.as_ref().and_then(|m| m.remote_id.clone());
            let planned = Planned {
                index,
                item: WriteItem {
                    natural_key: entity.natural_key.clone(),
                    local_id: entity.local_id.clone(),
                    remote_id: remote_id.clone(),
                    state: entity.state.clone(),
                },
                existing: found,
            };
            if remote_id.is_some() {
                updates.push(planned);
            } else {
                creates.push(planned);
            }
        }

        let chunk = if adapter.supports_batch() {
            config.batch_limit.max(1)
        } else {
            1
        };
        for (write, planned) in [(WriteKind::Create, creates), (WriteKind::Update, updates)] {
            let mut planned = planned.into_iter().peekable();
            while planned.peek().is_some() {
                let group: Vec<Planned> = planned.by_ref().take(chunk).collect();
                for (index, result) in self
                    .write(&config, adapter.as_ref(), kind, write, group)
                    .await
                {
                    results[index] = Some(result);
                }
            }
        }

        Ok(entities
            .iter()
            .zip(results)
            .map(|(entity, result)| BatchItemResult {
                natural_key: entity.natural_key.clone(),
                local_id: entity.local_id.clone(),
                result: result.unwrap_or_else(|| {
                    Err(ReconcileError::Adapter("item was not processed".to_string()))
                }),
            })
            .collect())
    }

    /// Issue one create or update call and record each item's outcome.
    async fn write(
        &self,
        config: &MarketplaceConfig,
        adapter: &dyn EntityAdapter,
        kind: EntityKind,
        write: WriteKind,
        group: Vec<Planned>,
    ) -> Vec<(usize, Result<UpsertOutcome>)> {
        let items: Vec<WriteItem> = group.iter().map(|p| p.item.clone()).collect();
        let request = match write {
            WriteKind::Create => adapter.create_request(&items),
            WriteKind::Update => adapter.update_request(&items),
        };
        let ack = match request {
            Ok(request) => match self.executor.execute_with(config, &request).await {
                Ok(response) => adapter.parse_write(&items, &response),
                Err(e) => Err(ReconcileError::Executor(e)),
            },
            Err(e) => Err(e),
        };

        let mut results = Vec::with_capacity(group.len());
        match ack {
            Err(e) => {
                tracing::warn!(
                    marketplace = %config.marketplace,
                    kind = %kind,
                    items = group.len(),
                    error_kind = e.kind(),
                    "Write failed: {}",
                    e
                );
                let message = e.to_string();
                for planned in &group {
                    let change = Change::Failed { message: &message };
                    let outcome = self.record(config, kind, planned, &change).await;
                    results.push((planned.index, outcome.and(Err(clone_error(&e)))));
                }
            }
            Ok(WriteAck::Task { task_id }) => {
                tracing::debug!(
                    marketplace = %config.marketplace,
                    kind = %kind,
                    task_id = %task_id,
                    items = group.len(),
                    "Write accepted as asynchronous task"
                );
                for planned in &group {
                    let change = Change::Submitted {
                        task_id: &task_id,
                        state: &planned.item.state,
                    };
                    let outcome = self.record(config, kind, planned, &change).await.map(|_| {
                        UpsertOutcome::Submitted {
                            task_id: task_id.clone(),
                        }
                    });
                    results.push((planned.index, outcome));
                }
            }
            Ok(WriteAck::Items(mut acks)) => {
                for planned in &group {
                    let key = &planned.item.natural_key;
                    let ack = acks.remove(key).unwrap_or_else(|| ItemAck::Rejected {
                        message: "not acknowledged by marketplace".to_string(),
                    });
                    let outcome = match ack {
                        ItemAck::Synced { remote_id } => {
                            let change = Change::Synced {
                                remote_id: &remote_id,
                                state: &planned.item.state,
                            };
                            self.record(config, kind, planned, &change)
                                .await
                                .map(|_| match write {
                                    WriteKind::Create => UpsertOutcome::Created {
                                        remote_id: remote_id.clone(),
                                    },
                                    WriteKind::Update => UpsertOutcome::Updated {
                                        remote_id: remote_id.clone(),
                                    },
                                })
                        }
                        ItemAck::Rejected { message } => {
                            tracing::debug!(
                                marketplace = %config.marketplace,
                                natural_key = %key,
                                "Item rejected: {}",
                                message
                            );
                            let change = Change::Failed { message: &message };
                            self.record(config, kind, planned, &change).await.and(Err(
                                ReconcileError::Rejected {
                                    natural_key: key.clone(),
                                    message: message.clone(),
                                },
                            ))
                        }
                    };
                    results.push((planned.index, outcome));
                }
            }
        }
        results
    }

    async fn record(
        &self,
        config: &MarketplaceConfig,
        kind: EntityKind,
        planned: &Planned,
        change: &Change<'_>,
    ) -> Result<Mapping> {
        let target = Target {
            marketplace: config.marketplace,
            kind,
            natural_key: &planned.item.natural_key,
            local_id: &planned.item.local_id,
        };
        Ok(mapping::record(self.executor.db(), target, planned.existing.as_ref(), change).await?)
    }

    /// Query one task and, once it has finished, rewrite its mappings.
    async fn check_task(
        &self,
        config: &MarketplaceConfig,
        adapter: &dyn EntityAdapter,
        task_id: &str,
        members: &[Mapping],
    ) -> Result<TaskCheck> {
        let Some(request) = adapter.task_status_request(task_id) else {
            return Ok(TaskCheck::Unsupported);
        };
        let response = self.executor.execute_with(config, &request).await?;
        let status = adapter.parse_task_status(&response)?;

        let db = self.executor.db();
        let mut updated = HashMap::new();
        match status {
            TaskStatus::Running => return Ok(TaskCheck::Running),
            TaskStatus::Failed { message } => {
                tracing::info!(
                    marketplace = %config.marketplace,
                    task_id = %task_id,
                    "Marketplace task failed: {}",
                    message
                );
                let message = ReconcileError::TaskFailed {
                    task_id: task_id.to_string(),
                    message,
                }
                .to_string();
                for member in members {
                    let model = mapping::record(
                        db,
                        target_of(member),
                        Some(member),
                        &Change::Failed { message: &message },
                    )
                    .await?;
                    updated.insert(model.natural_key.clone(), model);
                }
            }
            TaskStatus::Done(mut acks) => {
                for member in members {
                    let ack = acks
                        .remove(&member.natural_key)
                        .unwrap_or_else(|| ItemAck::Synced {
                            remote_id: member
                                .remote_id
                                .clone()
                                .unwrap_or_else(|| member.natural_key.clone()),
                        });
                    let state = member.last_state.clone().unwrap_or(Value::Null);
                    let model = match &ack {
                        ItemAck::Synced { remote_id } => {
                            mapping::record(
                                db,
                                target_of(member),
                                Some(member),
                                &Change::Synced {
                                    remote_id,
                                    state: &state,
                                },
                            )
                            .await?
                        }
                        ItemAck::Rejected { message } => {
                            mapping::record(
                                db,
                                target_of(member),
                                Some(member),
                                &Change::Failed { message },
                            )
                            .await?
                        }
                    };
                    updated.insert(model.natural_key.clone(), model);
                }
            }
        }
        Ok(TaskCheck::Resolved(updated))
    }

    /// Resolve every open marketplace task for `kind`.
    ///
    /// Mappings whose task finished become `synced` or `error`; the rest stay
    /// `pending`. Status query failures leave the mappings untouched.
    pub async fn poll_pending(&self, ctx: &AuthContext, kind: EntityKind) -> Result<PollReport> {
        let config = self.executor.marketplace_config(ctx)?;
        let adapter = self.adapter(&config, kind);
        let marketplace = config.marketplace;
        let db = self.executor.db();

        let mut tasks: HashMap<String, Vec<String>> = HashMap::new();
        for open in mapping::find_open_tasks(db, marketplace, kind).await? {
            if let Some(task_id) = open.task_id {
                tasks.entry(task_id).or_default().push(open.natural_key);
            }
        }

        let mut report = PollReport::default();
        for (task_id, keys) in tasks {
            let _guards = self
                .locks
                .lock_many(keys.iter().map(|k| (marketplace, k.clone())))
                .await;

            let mut members = Vec::with_capacity(keys.len());
            for key in &keys {
                if let Some(m) = mapping::find_by_key(db, marketplace, key).await?
                    && m.has_open_task()
                    && m.task_id.as_deref() == Some(task_id.as_str())
                {
                    members.push(m);
                }
            }
            if members.is_empty() {
                continue;
            }

            report.checked += 1;
            match self
                .check_task(&config, adapter.as_ref(), &task_id, &members)
                .await
            {
                Ok(TaskCheck::Resolved(updated)) => {
                    for model in updated.into_values() {
                        let error = (model.sync_status != SyncStatus::Synced)
                            .then(|| model.error_message.clone().unwrap_or_default());
                        if error.is_some() {
                            report.failed += 1;
                        } else {
                            report.synced += 1;
                        }
                        report.resolved.push(ResolvedItem {
                            natural_key: model.natural_key,
                            local_id: model.local_id,
                            remote_id: model.remote_id,
                            error,
                        });
                    }
                }
                Ok(TaskCheck::Running) | Ok(TaskCheck::Unsupported) => {
                    report.still_pending += members.len();
                }
                Err(e) => {
                    tracing::warn!(
                        marketplace = %marketplace,
                        task_id = %task_id,
                        "Could not query task status: {}",
                        e
                    );
                    report.still_pending += members.len();
                }
            }
        }

        if report.checked > 0 {
            tracing::info!(
                marketplace = %marketplace,
                kind = %kind,
                tasks = report.checked,
                synced = report.synced,
                failed = report.failed,
                still_pending = report.still_pending,
                "Polled marketplace tasks"
            );
        }
        Ok(report)
    }
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("executor", &self.executor)
            .field("locked_keys", &self.locks.len())
            .finish_non_exhaustive()
    }
}

fn target_of(model: &Mapping) -> Target<'_> {
    Target {
        marketplace: model.marketplace,
        kind: model.entity_kind,
        natural_key: &model.natural_key,
        local_id: &model.local_id,
    }
}

/// `ReconcileError` is not `Clone` because of `DbErr`; one failed call is
/// reported to every item it carried.
fn clone_error(error: &ReconcileError) -> ReconcileError {
    match error {
        ReconcileError::Executor(e) => ReconcileError::Executor(e.clone()),
        ReconcileError::Rejected {
            natural_key,
            message,
        } => ReconcileError::Rejected {
            natural_key: natural_key.clone(),
            message: message.clone(),
        },
        ReconcileError::TaskFailed { task_id, message } => ReconcileError::TaskFailed {
            task_id: task_id.clone(),
            message: message.clone(),
        },
        ReconcileError::DuplicateKey(key) => ReconcileError::DuplicateKey(key.clone()),
        ReconcileError::Adapter(message) => ReconcileError::Adapter(message.clone()),
        ReconcileError::Database(e) => ReconcileError::Database(DbErr::Custom(e.to_string())),
    }
}

#[cfg(all(test, feature = "sqlite", feature = "migrate"))]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::executor::ExecutorError;
    use crate::http::mock::MockTransport;
    use crate::http::{HttpMethod, HttpResponse};
    use crate::rate_limit::RateLimiter;
    use crate::settings::Settings;

    const CONFIG: &str = r#"
        [marketplaces.trendyol]
        base_url = "https://shop.test"
        auth = { scheme = "none" }
        batch_limit = 1

        [marketplaces.trendyol.adapters.price]
        create = { endpoint = "prices", method = "POST", path = "/prices" }
        task_id_pointer = "/task_id"

        [marketplaces.hepsiburada]
        base_url = "https://hb.test"
        auth = { scheme = "none" }
        batch_limit = 50
    "#;

    async fn reconciler() -> (Arc<Reconciler>, MockTransport) {
        let db = crate::db::connect_and_migrate("sqlite::memory:").await.unwrap();
        let transport = MockTransport::new();
        let executor = RequestExecutor::new(
            Arc::new(db),
            Arc::new(Settings::from_toml_str(CONFIG).unwrap()),
            Arc::new(transport.clone()),
            Arc::new(RateLimiter::in_memory()),
        );
        (Arc::new(Reconciler::new(Arc::new(executor))), transport)
    }

    fn trendyol() -> AuthContext {
        AuthContext::new(Marketplace::Trendyol)
    }

    fn hepsiburada() -> AuthContext {
        AuthContext::new(Marketplace::Hepsiburada)
    }

    fn product(key: &str, price: u32) -> DesiredEntity {
        DesiredEntity::new(key, format!("local-{}", key), json!({"price": price}))
    }

    fn created(id: &str) -> HttpResponse {
        HttpResponse::json(201, &json!({"id": id}))
    }

    #[tokio::test]
    async fn test_identical_upserts_call_once() {
        let (reconciler, transport) = reconciler().await;
        transport.push_response(HttpMethod::Post, "https://shop.test/products", created("R-1"));

        let first = reconciler
            .upsert(&trendyol(), EntityKind::Product, &product("SKU-1", 10))
            .await
            .unwrap();
        let second = reconciler
            .upsert(&trendyol(), EntityKind::Product, &product("SKU-1", 10))
            .await
            .unwrap();

        assert_eq!(
            first,
            UpsertOutcome::Created {
                remote_id: "R-1".to_string()
            }
        );
        assert_eq!(
            second,
            UpsertOutcome::Unchanged {
                remote_id: Some("R-1".to_string())
            }
        );
        assert_eq!(transport.requests().len(), 1);
    }

    #[tokio::test]
    async fn test_changed_state_updates_remote() {
        let (reconciler, transport) = reconciler().await;
        transport.push_response(HttpMethod::Post, "https://shop.test/products", created("R-1"));
        transport.push_response(
            HttpMethod::Put,
            "https://shop.test/products/R-1",
            HttpResponse::json(200, &json!({"id": "R-1"})),
        );

        reconciler
            .upsert(&trendyol(), EntityKind::Product, &product("SKU-1", 10))
            .await
            .unwrap();
        let outcome = reconciler
            .upsert(&trendyol(), EntityKind::Product, &product("SKU-1", 12))
            .await
            .unwrap();
        assert_eq!(
            outcome,
            UpsertOutcome::Updated {
                remote_id: "R-1".to_string()
            }
        );

        let mapping = reconciler
            .mapping(Marketplace::Trendyol, "SKU-1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(mapping.last_state, Some(json!({"price": 12})));
        assert_eq!(mapping.sync_status, SyncStatus::Synced);
    }

    #[tokio::test]
    async fn test_concurrent_upserts_create_once() {
        let (reconciler, transport) = reconciler().await;
        transport.set_delay(Duration::from_millis(50));
        transport.set_fallback(|_| HttpResponse::json(201, &json!({"id": "R-1"})));

        let a = {
            let reconciler = Arc::clone(&reconciler);
            tokio::spawn(async move {
                reconciler
                    .upsert(&trendyol(), EntityKind::Product, &product("SKU-1", 10))
                    .await
            })
        };
        let b = {
            let reconciler = Arc::clone(&reconciler);
            tokio::spawn(async move {
                reconciler
                    .upsert(&trendyol(), EntityKind::Product, &product("SKU-1", 10))
                    .await
            })
        };
        let (a, b) = (a.await.unwrap().unwrap(), b.await.unwrap().unwrap());

        assert_eq!(transport.requests_matching("/products").len(), 1);
        let created = [&a, &b]
            .iter()
            .filter(|o| matches!(o, UpsertOutcome::Created { .. }))
            .count();
        assert_eq!(created, 1);
        assert!(a.is_synced() && b.is_synced());
    }

    #[tokio::test]
    async fn test_remote_rejection_is_persisted_and_not_retried() {
        let (reconciler, transport) = reconciler().await;
        transport.push_response(
            HttpMethod::Post,
            "https://shop.test/products",
            HttpResponse::json(422, &json!({"message": "invalid category"})),
        );

        let err = reconciler
            .upsert(&trendyol(), EntityKind::Product, &product("SKU-1", 10))
            .await
            .unwrap_err();
        assert!(!err.is_retryable());
        assert!(matches!(
            err,
            ReconcileError::Executor(ExecutorError::RemoteApi { code: 422, .. })
        ));
        assert_eq!(transport.requests().len(), 1);

        let mapping = reconciler
            .mapping(Marketplace::Trendyol, "SKU-1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(mapping.sync_status, SyncStatus::Error);
        assert_eq!(mapping.attempts, 1);
        assert!(
            mapping
                .error_message
                .as_deref()
                .unwrap()
                .contains("invalid category")
        );

        // The next run writes again and clears the error.
        transport.push_response(HttpMethod::Post, "https://shop.test/products", created("R-2"));
        reconciler
            .upsert(&trendyol(), EntityKind::Product, &product("SKU-1", 10))
            .await
            .unwrap();
        let mapping = reconciler
            .mapping(Marketplace::Trendyol, "SKU-1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(mapping.sync_status, SyncStatus::Synced);
        assert_eq!(mapping.error_message, None);
        assert_eq!(mapping.attempts, 0);
    }

    #[tokio::test]
    async fn test_batch_task_then_poll() {
        let (reconciler, transport) = reconciler().await;
        transport.push_response(
            HttpMethod::Post,
            "https://hb.test/products/batch",
            HttpResponse::json(200, &json!({"task_id": "T-1"})),
        );
        transport.push_response(
            HttpMethod::Get,
            "https://hb.test/tasks/T-1",
            HttpResponse::json(200, &json!({"status": "RUNNING"})),
        );
        transport.push_response(
            HttpMethod::Get,
            "https://hb.test/tasks/T-1",
            HttpResponse::json(
                200,
                &json!({
                    "status": "COMPLETED",
                    "results": [
                        {"natural_key": "A", "id": "R-A"},
                        {"natural_key": "B", "error": "missing brand"}
                    ]
                }),
            ),
        );

        let entities = [product("A", 1), product("B", 2)];
        let results = reconciler
            .upsert_batch(&hepsiburada(), EntityKind::Product, &entities)
            .await
            .unwrap();
        assert_eq!(results.len(), 2);
        for item in &results {
            assert_eq!(
                item.result.as_ref().unwrap(),
                &UpsertOutcome::Submitted {
                    task_id: "T-1".to_string()
                }
            );
        }

        // While the task runs nothing is re-created.
        let again = reconciler
            .upsert(&hepsiburada(), EntityKind::Product, &product("A", 1))
            .await
            .unwrap();
        assert_eq!(
            again,
            UpsertOutcome::StillPending {
                task_id: "T-1".to_string()
            }
        );
        assert_eq!(transport.requests_matching("/products/batch").len(), 1);

        let report = reconciler
            .poll_pending(&hepsiburada(), EntityKind::Product)
            .await
            .unwrap();
        assert_eq!(report.checked, 1);
        assert_eq!(report.synced, 1);
        assert_eq!(report.failed, 1);

        let a = reconciler
            .mapping(Marketplace::Hepsiburada, "A")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(a.sync_status, SyncStatus::Synced);
        assert_eq!(a.remote_id.as_deref(), Some("R-A"));
        let b = reconciler
            .mapping(Marketplace::Hepsiburada, "B")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(b.sync_status, SyncStatus::Error);
        assert_eq!(b.error_message.as_deref(), Some("missing brand"));
    }

    #[tokio::test]
    async fn test_untrackable_task_is_not_resubmitted_on_change() {
        let (reconciler, transport) = reconciler().await;
        transport.push_response(
            HttpMethod::Post,
            "https://shop.test/prices",
            HttpResponse::json(200, &json!({"task_id": "T-1"})),
        );

        let first = reconciler
            .upsert(&trendyol(), EntityKind::Price, &product("SKU-1", 10))
            .await
            .unwrap();
        assert_eq!(
            first,
            UpsertOutcome::Submitted {
                task_id: "T-1".to_string()
            }
        );

        let changed = reconciler
            .upsert(&trendyol(), EntityKind::Price, &product("SKU-1", 11))
            .await
            .unwrap();
        assert_eq!(
            changed,
            UpsertOutcome::StillPending {
                task_id: "T-1".to_string()
            }
        );
        assert_eq!(transport.requests_matching("/prices").len(), 1);

        let mapping = reconciler
            .mapping(Marketplace::Trendyol, "SKU-1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(mapping.sync_status, SyncStatus::Pending);
        assert_eq!(mapping.task_id.as_deref(), Some("T-1"));
    }

    #[tokio::test]
    async fn test_batch_groups_creates_and_flags_duplicates() {
        let (reconciler, transport) = reconciler().await;
        transport.push_response(
            HttpMethod::Post,
            "https://hb.test/products/batch",
            HttpResponse::json(
                200,
                &json!({"results": [
                    {"natural_key": "A", "id": "R-A"},
                    {"natural_key": "B", "id": "R-B"}
                ]}),
            ),
        );

        let entities = [product("A", 1), product("B", 2), product("A", 3)];
        let results = reconciler
            .upsert_batch(&hepsiburada(), EntityKind::Product, &entities)
            .await
            .unwrap();

        assert!(matches!(
            results[0].result,
            Ok(UpsertOutcome::Created { .. })
        ));
        assert!(matches!(
            results[1].result,
            Ok(UpsertOutcome::Created { .. })
        ));
        assert!(matches!(
            results[2].result,
            Err(ReconcileError::DuplicateKey(_))
        ));
        assert_eq!(transport.requests().len(), 1);
        let body: Value = serde_json::from_slice(&transport.requests()[0].body).unwrap();
        assert_eq!(body["items"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_transient_failure_is_retryable() {
        let (reconciler, transport) = reconciler().await;
        transport.push_response(
            HttpMethod::Post,
            "https://shop.test/products",
            HttpResponse::json(503, &json!({})),
        );
        let err = reconciler
            .upsert(&trendyol(), EntityKind::Product, &product("SKU-1", 10))
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_forget_allows_recreate() {
        let (reconciler, transport) = reconciler().await;
        transport.set_fallback(|_| HttpResponse::json(201, &json!({"id": "R-1"})));
        reconciler
            .upsert(&trendyol(), EntityKind::Product, &product("SKU-1", 10))
            .await
            .unwrap();
        assert!(reconciler.forget(Marketplace::Trendyol, "SKU-1").await.unwrap());
        let outcome = reconciler
            .upsert(&trendyol(), EntityKind::Product, &product("SKU-1", 10))
            .await
            .unwrap();
        assert!(matches!(outcome, UpsertOutcome::Created { .. }));
        assert_eq!(transport.requests().len(), 2);
    }
}
