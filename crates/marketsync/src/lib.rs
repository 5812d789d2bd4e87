//! Marketsync - marketplace synchronization and event dispatch.
//!
//! This library keeps local catalog and order entities in sync with external
//! marketplaces (Trendyol, N11, Amazon, eBay, Hepsiburada, Ozon) and notifies
//! other subsystems about what happened through a persistent event bus.
//!
//! The pieces, bottom up:
//!
//! - [`rate_limit`] - per endpoint class `{requests, period}` budgets
//! - [`executor`] - authenticated, rate-limited, logged marketplace calls
//! - [`reconcile`] - idempotent local to remote entity mapping
//! - [`events`] - listener registry with inline and queued dispatch
//! - [`sync`] - batches entities through the reconciler and emits events
//!
//! # Features
//!
//! - `sqlite` / `postgres` - database backends
//! - `migrate` - schema migrations and [`connect_and_migrate`]
//! - `http` - the reqwest transport
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use marketsync::{connect_and_migrate, Settings};
//!
//! let settings = Settings::load();
//! let db = Arc::new(connect_and_migrate(&settings.database_url().unwrap()).await?);
//! let bus = Arc::new(EventBus::new(Arc::clone(&db), settings.events.to_bus_config()));
//! let limiter = Arc::new(RateLimiter::in_memory().with_event_bus(Arc::clone(&bus)));
//! let executor = Arc::new(RequestExecutor::new(db, Arc::new(settings), transport, limiter));
//! let reconciler = Arc::new(Reconciler::new(executor));
//! ```

pub mod db;
pub mod entity;
pub mod events;
pub mod executor;
pub mod http;
pub mod locks;
pub mod rate_limit;
pub mod reconcile;
pub mod settings;
pub mod sync;

#[cfg(feature = "migrate")]
pub mod migration;

pub use db::connect;
#[cfg(feature = "migrate")]
pub use db::connect_and_migrate;
pub use entity::prelude::*;
pub use events::{EventBus, EventBusConfig, EventError, ListenerError, TriggerOptions};
pub use executor::{ApiRequest, ApiResponse, AuthContext, ExecutorError, RequestExecutor};
pub use rate_limit::{RateBudget, RateLimitError, RateLimiter};
pub use reconcile::{DesiredEntity, ReconcileError, Reconciler, UpsertOutcome};
pub use settings::{ConfigProvider, MarketplaceConfig, Settings};
pub use sync::{Orchestrator, SyncError, SyncRequest, SyncResult};
