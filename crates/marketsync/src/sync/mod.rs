//! Sync orchestration across marketplaces.
//!
//! # Module Structure
//!
//! - [`Orchestrator`] - runs sync jobs: `sync()`, `sync_many()`, `get_health()`
//! - [`EntitySource`] - where desired entity state comes from
//! - [`RetryConfig`] - backoff for transient failures
//! - [`SyncProgress`] - progress callbacks for hosts
//!
//! # Example
//!
//! ```ignore
//! use marketsync::sync::{Orchestrator, SyncRequest};
//!
//! let request = SyncRequest::new(AuthContext::new(Marketplace::Trendyol), EntityKind::Product, ids);
//! let result = orchestrator.sync(&request, &cancel, None).await?;
//! println!("{} synced, {} errors", result.synced_count(), result.error_count());
//! ```

mod errors;
pub mod health;
mod orchestrator;
mod progress;
mod retry;
mod source;
mod types;

pub use errors::{Result, SyncError};
pub use health::{HealthReport, HealthStatus, HealthThresholds};
pub use orchestrator::Orchestrator;
pub use progress::{ProgressCallback, SyncProgress, emit};
pub use retry::RetryConfig;
pub use source::{CatalogSource, EntitySource};
pub use types::{
    DEFAULT_CONCURRENCY, EntityError, MarketplaceSyncResult, SYNC_COMPLETED_EVENT, SyncOptions,
    SyncRequest, SyncResult, sync_failed_event, synced_event,
};
