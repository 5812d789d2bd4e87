//! Engine wiring shared by the commands.
//!
//! One process builds one [`Engine`]: the database connection, the event
//! bus with its handler table and configured listeners, the rate limiter,
//! the request executor, the reconciler and the orchestrator.

use std::sync::Arc;
use std::time::Duration;

use marketsync::entity::marketplace::Marketplace;
use marketsync::events::{EventBus, EventHandler, ListenerSpec, handler_fn};
use marketsync::executor::{AuthContext, RequestExecutor};
use marketsync::http::HttpTransport;
use marketsync::rate_limit::{DbCounterStore, MemoryCounterStore, RateLimiter};
use marketsync::reconcile::Reconciler;
use marketsync::settings::{CounterStoreKind, Settings};
use marketsync::sync::{CatalogSource, EntitySource, Orchestrator};
use sea_orm::DatabaseConnection;

/// Connect timeout for marketplace HTTP connections.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Name of the built-in handler that writes events to the log.
pub(crate) const LOG_HANDLER: &str = "log";

pub(crate) struct Engine {
    pub(crate) db: Arc<DatabaseConnection>,
    pub(crate) bus: Arc<EventBus>,
    pub(crate) orchestrator: Arc<Orchestrator>,
}

impl Engine {
    /// Build the engine over `source`.
    ///
    /// Listeners from the `[[listeners]]` config sections are registered (or
    /// refreshed) on every start.
    pub(crate) async fn build(
        settings: Settings,
        database_url: &str,
        source: Arc<dyn EntitySource>,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let db = Arc::new(connect(database_url).await?);

        let bus = Arc::new(EventBus::new(Arc::clone(&db), settings.events.to_bus_config()));
        register_builtin_handlers(&bus);
        for listener in &settings.listeners {
            let mut spec = ListenerSpec::new(&listener.event, &listener.handler)
                .with_priority(listener.priority);
            for (path, expected) in &listener.conditions {
                spec = spec.with_condition(path, expected.clone());
            }
            bus.add_listener(&spec).await?;
            tracing::debug!(event = %listener.event, handler = %listener.handler, "Registered configured listener");
        }

        let limiter = match settings.rate_limiter.store {
            CounterStoreKind::Database => RateLimiter::new(Arc::new(DbCounterStore::new(Arc::clone(&db)))),
            CounterStoreKind::Memory => RateLimiter::new(Arc::new(MemoryCounterStore::new())),
        }
        .with_event_bus(Arc::clone(&bus));

        let options = settings.sync.to_options();
        let executor = Arc::new(RequestExecutor::new(
            Arc::clone(&db),
            Arc::new(settings),
            transport()?,
            Arc::new(limiter),
        ));
        let orchestrator = Arc::new(Orchestrator::new(
            Arc::new(Reconciler::new(executor)),
            Arc::clone(&bus),
            source,
            options,
        ));

        Ok(Self {
            db,
            bus,
            orchestrator,
        })
    }

    /// Engine for commands that never load entities.
    pub(crate) async fn without_catalog(
        settings: Settings,
        database_url: &str,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        Self::build(settings, database_url, Arc::new(CatalogSource::new())).await
    }
}

#[cfg(feature = "migrate")]
async fn connect(database_url: &str) -> Result<DatabaseConnection, sea_orm::DbErr> {
    marketsync::connect_and_migrate(database_url).await
}

#[cfg(not(feature = "migrate"))]
async fn connect(database_url: &str) -> Result<DatabaseConnection, sea_orm::DbErr> {
    marketsync::connect(database_url).await
}

#[cfg(feature = "http")]
fn transport() -> Result<Arc<dyn HttpTransport>, Box<dyn std::error::Error>> {
    use marketsync::http::reqwest_transport::ReqwestTransport;

    Ok(Arc::new(ReqwestTransport::with_connect_timeout(CONNECT_TIMEOUT)?))
}

#[cfg(not(feature = "http"))]
fn transport() -> Result<Arc<dyn HttpTransport>, Box<dyn std::error::Error>> {
    let _ = CONNECT_TIMEOUT;
    Err("marketsync was built without the `http` feature; marketplace calls are unavailable".into())
}

fn register_builtin_handlers(bus: &EventBus) {
    bus.register_handler(LOG_HANDLER, log_handler());
}

/// Handler that records every event it receives at info level.
fn log_handler() -> Arc<dyn EventHandler> {
    handler_fn(|event| async move {
        tracing::info!(
            event = %event.name,
            priority = %event.priority,
            queue_id = ?event.queue_id,
            attempt = event.attempt,
            payload = %event.payload,
            "Event received"
        );
        Ok(())
    })
}

/// Parse `marketplace` and build its auth context.
pub(crate) fn auth_context(
    marketplace: &str,
    tenant: Option<&str>,
) -> Result<AuthContext, Box<dyn std::error::Error>> {
    let marketplace: Marketplace = marketplace.parse()?;
    Ok(match tenant {
        Some(tenant) => AuthContext::for_tenant(marketplace, tenant),
        None => AuthContext::new(marketplace),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_context_parses_marketplace_and_tenant() {
        let ctx = auth_context("trendyol", Some("acme")).unwrap();
        assert_eq!(ctx.marketplace, Marketplace::Trendyol);
        assert_eq!(ctx.tenant_id.as_deref(), Some("acme"));

        assert!(auth_context("etsy", None).is_err());
    }
}
