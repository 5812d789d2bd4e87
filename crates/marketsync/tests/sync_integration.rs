//! Integration tests for sync runs against a scripted marketplace.
//!
//! Every test wires the full stack (settings, limiter, executor, reconciler,
//! event bus, orchestrator) on an in-memory SQLite database and a
//! `MockTransport`, and runs on real time so rate limit waits are observable.
//!
//! Key scenarios tested:
//! - A tight budget delays the third call until the first leaves the period
//! - Re-running a sync with unchanged state makes no remote calls
//! - Concurrent runs over the same entities create each one exactly once
//! - Limiters in separate workers share one database budget

#![cfg(all(feature = "sqlite", feature = "migrate"))]

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

use marketsync::connect_and_migrate;
use marketsync::entity::entity_kind::EntityKind;
use marketsync::entity::event_status::DispatchMode;
use marketsync::entity::marketplace::Marketplace;
use marketsync::entity::sync_status::SyncStatus;
use marketsync::events::{EventBus, EventBusConfig, ListenerSpec, handler_fn};
use marketsync::executor::{AuthContext, RequestExecutor};
use marketsync::http::mock::MockTransport;
use marketsync::http::{HttpRequest, HttpResponse};
use marketsync::rate_limit::{DbCounterStore, EndpointClass, LimitPolicy, RateBudget, RateLimiter};
use marketsync::reconcile::{DesiredEntity, Reconciler};
use marketsync::settings::Settings;
use marketsync::sync::{CatalogSource, Orchestrator, SyncOptions, SyncRequest};
use sea_orm::DatabaseConnection;
use serde_json::{Value, json};
use tokio::sync::Mutex;

/// Maximum time any sync run should take in tests.
/// If exceeded, there's likely a hang in the limiter or the reconciler.
const SYNC_TIMEOUT: Duration = Duration::from_secs(15);

/// Two requests per second, one entity per call.
const TIGHT_BUDGET: &str = r#"
    [marketplaces.trendyol]
    base_url = "https://shop.test"
    auth = { scheme = "none" }
    batch_limit = 1
    max_wait_secs = 10
    default_budget = { requests = 2, period_secs = 1 }
"#;

/// Generous budget so only the reconciler's locking is under test.
const OPEN_BUDGET: &str = r#"
    [marketplaces.hepsiburada]
    base_url = "https://hb.test"
    auth = { scheme = "none" }
    batch_limit = 1
    default_budget = { requests = 1000, period_secs = 1 }
"#;

struct Stack {
    db: Arc<DatabaseConnection>,
    orchestrator: Arc<Orchestrator>,
    transport: MockTransport,
    emitted: Arc<Mutex<Vec<String>>>,
}

async fn setup_stack(config: &str, entities: usize) -> Stack {
    let db = Arc::new(
        connect_and_migrate("sqlite::memory:")
            .await
            .expect("Failed to create test database"),
    );
    let settings = Settings::from_toml_str(config).expect("Invalid test config");
    let transport = MockTransport::new();
    transport.set_fallback(echo_created);

    let bus = Arc::new(EventBus::new(Arc::clone(&db), EventBusConfig::default()));
    let emitted = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&emitted);
    bus.register_handler(
        "collect",
        handler_fn(move |event| {
            let seen = Arc::clone(&seen);
            async move {
                seen.lock().await.push(event.name);
                Ok(())
            }
        }),
    );
    bus.add_listener(&ListenerSpec::new("*", "collect"))
        .await
        .unwrap();

    let limiter = Arc::new(RateLimiter::new(Arc::new(DbCounterStore::new(
        Arc::clone(&db),
    ))));
    let executor = Arc::new(RequestExecutor::new(
        Arc::clone(&db),
        Arc::new(settings),
        Arc::new(transport.clone()),
        limiter,
    ));

    let source = Arc::new(CatalogSource::new());
    for i in 1..=entities {
        source.insert(
            EntityKind::Product,
            DesiredEntity::new(
                format!("SKU-{:03}", i),
                i.to_string(),
                json!({"title": format!("Product {}", i), "price": 10 * i}),
            ),
        );
    }

    let orchestrator = Arc::new(Orchestrator::new(
        Arc::new(Reconciler::new(executor)),
        bus,
        source,
        SyncOptions {
            event_mode: DispatchMode::Sync,
            ..Default::default()
        },
    ));

    Stack {
        db,
        orchestrator,
        transport,
        emitted,
    }
}

/// Marketplace stand-in: acknowledges a create with an id derived from the key.
fn echo_created(request: &HttpRequest) -> HttpResponse {
    let body: Value = serde_json::from_slice(&request.body).unwrap_or(Value::Null);
    match body["natural_key"].as_str() {
        Some(key) => HttpResponse::json(201, &json!({"id": format!("R-{}", key)})),
        None => HttpResponse::json(400, &json!({"message": "natural_key missing"})),
    }
}

fn product_request(marketplace: Marketplace, count: usize) -> SyncRequest {
    SyncRequest::new(
        AuthContext::new(marketplace),
        EntityKind::Product,
        (1..=count).map(|i| i.to_string()).collect(),
    )
}

#[tokio::test]
async fn test_tight_budget_delays_third_call_and_syncs_everything() {
    let stack = setup_stack(TIGHT_BUDGET, 5).await;
    let request = product_request(Marketplace::Trendyol, 5);

    let result = tokio::time::timeout(
        SYNC_TIMEOUT,
        stack
            .orchestrator
            .sync(&request, &AtomicBool::new(false), None),
    )
    .await
    .expect("sync timed out")
    .unwrap();

    assert_eq!(result.requested, 5);
    assert_eq!(result.synced_count() + result.error_count(), 5);
    assert_eq!(result.error_count(), 0, "errors: {:?}", result.errors);

    let times = stack.transport.request_times();
    assert_eq!(times.len(), 5);
    assert!(
        times[1].duration_since(times[0]) < Duration::from_millis(500),
        "second call should not wait"
    );
    assert!(
        times[2].duration_since(times[0]) >= Duration::from_millis(900),
        "third call went out after {:?}",
        times[2].duration_since(times[0])
    );

    let reconciler = stack.orchestrator.reconciler();
    let mut remote_ids = HashSet::new();
    for i in 1..=5 {
        let key = format!("SKU-{:03}", i);
        let mapping = reconciler
            .mapping(Marketplace::Trendyol, &key)
            .await
            .unwrap()
            .expect("mapping missing");
        assert!(matches!(
            mapping.sync_status,
            SyncStatus::Synced | SyncStatus::Error
        ));
        let remote_id = mapping.remote_id.expect("remote id missing");
        assert_eq!(remote_id, format!("R-{}", key));
        assert!(remote_ids.insert(remote_id), "duplicate remote id for {}", key);
    }

    let emitted = stack.emitted.lock().await;
    assert_eq!(
        emitted.iter().filter(|n| *n == "product.synced").count(),
        5
    );
    assert_eq!(emitted.last().map(String::as_str), Some("sync.completed"));
}

#[tokio::test]
async fn test_resync_with_unchanged_state_makes_no_calls() {
    let stack = setup_stack(OPEN_BUDGET, 3).await;
    let request = product_request(Marketplace::Hepsiburada, 3);
    let cancel = AtomicBool::new(false);

    let first = stack
        .orchestrator
        .sync(&request, &cancel, None)
        .await
        .unwrap();
    assert_eq!(first.synced, 3);
    assert_eq!(stack.transport.requests().len(), 3);

    let second = stack
        .orchestrator
        .sync(&request, &cancel, None)
        .await
        .unwrap();
    assert_eq!(second.synced, 0);
    assert_eq!(second.unchanged, 3);
    assert_eq!(second.error_count(), 0);
    assert_eq!(stack.transport.requests().len(), 3);
    assert!(
        stack
            .transport
            .requests()
            .iter()
            .all(|r| r.url == "https://hb.test/products")
    );
}

#[tokio::test]
async fn test_concurrent_runs_create_each_entity_once() {
    let stack = setup_stack(OPEN_BUDGET, 4).await;
    stack.transport.set_delay(Duration::from_millis(50));

    let requests = vec![
        product_request(Marketplace::Hepsiburada, 4),
        product_request(Marketplace::Hepsiburada, 4),
    ];
    let results = tokio::time::timeout(
        SYNC_TIMEOUT,
        stack
            .orchestrator
            .sync_many(requests, Arc::new(AtomicBool::new(false))),
    )
    .await
    .expect("sync_many timed out");

    assert_eq!(results.len(), 2);
    let mut created = 0;
    let mut unchanged = 0;
    for run in &results {
        let result = run.result.as_ref().unwrap();
        assert_eq!(result.error_count(), 0, "errors: {:?}", result.errors);
        created += result.synced;
        unchanged += result.unchanged;
    }
    assert_eq!(created, 4);
    assert_eq!(unchanged, 4);

    let creates = stack.transport.requests_matching("/products");
    assert_eq!(creates.len(), 4);
    let keys: HashSet<String> = creates
        .iter()
        .map(|r| {
            let body: Value = serde_json::from_slice(&r.body).unwrap();
            body["natural_key"].as_str().unwrap().to_string()
        })
        .collect();
    assert_eq!(keys.len(), 4);
}

#[tokio::test]
async fn test_limiters_in_separate_workers_share_one_budget() {
    let stack = setup_stack(OPEN_BUDGET, 0).await;
    let first = Arc::new(RateLimiter::new(Arc::new(DbCounterStore::new(
        Arc::clone(&stack.db),
    ))));
    let second = Arc::new(RateLimiter::new(Arc::new(DbCounterStore::new(
        Arc::clone(&stack.db),
    ))));
    let class = EndpointClass::new(Marketplace::Ozon, Some("acme"), "stocks.update");
    let policy = LimitPolicy::new(RateBudget::new(2, Duration::from_secs(1)))
        .with_max_wait(Duration::from_secs(10));

    let mut handles = Vec::new();
    for limiter in [&first, &first, &second, &second] {
        let limiter = Arc::clone(limiter);
        let class = class.clone();
        handles.push(tokio::spawn(async move {
            let permit = limiter.acquire(&class, &policy).await.unwrap();
            assert!(permit.remaining.is_some(), "store failed open");
            tokio::time::Instant::now()
        }));
    }

    let mut times = Vec::new();
    for handle in handles {
        times.push(
            tokio::time::timeout(SYNC_TIMEOUT, handle)
                .await
                .expect("acquire timed out")
                .unwrap(),
        );
    }
    times.sort();

    for (i, start) in times.iter().enumerate() {
        let in_window = times[i..]
            .iter()
            .filter(|t| t.duration_since(*start) < Duration::from_millis(900))
            .count();
        assert!(in_window <= 2, "{} calls within one period", in_window);
    }
    assert!(times[3].duration_since(times[0]) >= Duration::from_millis(900));
}
