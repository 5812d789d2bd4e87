//! Sync request and result types.

use serde::Serialize;

use crate::entity::entity_kind::EntityKind;
use crate::entity::event_status::DispatchMode;
use crate::entity::marketplace::Marketplace;
use crate::executor::AuthContext;

/// Default number of marketplace runs executed concurrently by `sync_many`.
pub const DEFAULT_CONCURRENCY: usize = 4;

/// Emitted once per run.
pub const SYNC_COMPLETED_EVENT: &str = "sync.completed";

/// `<kind>.synced`, emitted per entity the marketplace confirmed.
pub fn synced_event(kind: EntityKind) -> String {
    format!("{}.synced", kind)
}

/// `<kind>.sync_failed`, emitted per entity that failed.
pub fn sync_failed_event(kind: EntityKind) -> String {
    format!("{}.sync_failed", kind)
}

/// Orchestrator tunables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncOptions {
    /// Concurrent marketplace runs in `sync_many`.
    pub concurrency: usize,
    /// How per-entity and run events are delivered.
    pub event_mode: DispatchMode,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            event_mode: DispatchMode::Async,
        }
    }
}

/// One marketplace run: sync `ids` of `kind` to `ctx`'s marketplace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncRequest {
    pub ctx: AuthContext,
    pub kind: EntityKind,
    /// Local entity ids.
    pub ids: Vec<String>,
}

impl SyncRequest {
    pub fn new(ctx: AuthContext, kind: EntityKind, ids: Vec<String>) -> Self {
        Self { ctx, kind, ids }
    }

    pub fn marketplace(&self) -> Marketplace {
        self.ctx.marketplace
    }
}

/// One entity that did not reach the marketplace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntityError {
    pub local_id: String,
    pub natural_key: Option<String>,
    /// Stable error kind (`remote_api`, `transient_network`, `not_found`, ...).
    pub kind: String,
    pub message: String,
    /// Retry attempts made before giving up.
    pub retries: usize,
}

/// Aggregate result of one run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncResult {
    /// Entities requested.
    pub requested: usize,
    /// Created or updated and confirmed.
    pub synced: usize,
    /// Already in the desired state; no call made.
    pub unchanged: usize,
    /// Accepted into an asynchronous marketplace task.
    pub pending: usize,
    /// Not attempted because the run was cancelled.
    pub skipped: usize,
    /// Earlier tasks that finished during this run.
    pub tasks_synced: usize,
    pub tasks_failed: usize,
    pub cancelled: bool,
    pub errors: Vec<EntityError>,
}

impl SyncResult {
    pub fn error_count(&self) -> usize {
        self.errors.len()
    }

    /// Entities confirmed in the desired state, changed or not.
    pub fn synced_count(&self) -> usize {
        self.synced + self.unchanged
    }
}

/// Result of one run in `sync_many`.
#[derive(Debug)]
pub struct MarketplaceSyncResult {
    pub request: SyncRequest,
    pub result: super::Result<SyncResult>,
}
