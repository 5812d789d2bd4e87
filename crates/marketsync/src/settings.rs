//! Layered configuration and the [`ConfigProvider`] seam.
//!
//! Sources, later overriding earlier:
//! 1. Built-in marketplace defaults (auth scheme, body format, batch limit, budget)
//! 2. XDG config file (`~/.config/marketsync/config.toml`)
//! 3. Local config file (`./marketsync.toml`)
//! 4. Environment variables prefixed with `MARKETSYNC_`, nested with `__`
//!    (e.g. `MARKETSYNC_MARKETPLACES__TRENDYOL__AUTH__PASSWORD`)
//!
//! Example:
//! ```toml
//! [database]
//! url = "sqlite:///var/lib/marketsync/marketsync.db?mode=rwc"
//!
//! [marketplaces.trendyol]
//! batch_limit = 500
//! auth = { username = "api-user", password = "secret" }
//! default_budget = { requests = 50, period_secs = 10 }
//! rate_limits.products = { requests = 20, period_secs = 10 }
//!
//! [tenants.acme.marketplaces.trendyol]
//! auth = { username = "acme-user", password = "acme-secret" }
//!
//! [events]
//! backoff = { strategy = "exponential", base_secs = 30, max_secs = 3600 }
//!
//! [[events.backoff_overrides]]
//! pattern = "order.*"
//! policy = { strategy = "constant", delay_secs = 60 }
//! ```

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use config::{Config as ConfigBuilder, Environment, File, FileFormat};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::entity::entity_kind::EntityKind;
use crate::entity::event_status::DispatchMode;
use crate::entity::marketplace::Marketplace;
use crate::events::{Backoff, BackoffTable, EventBusConfig};
use crate::rate_limit::{DEFAULT_MAX_WAIT, LimitPolicy, RateBudget};
use crate::reconcile::AdapterSpec;
use crate::sync::SyncOptions;

const APP_NAME: &str = "marketsync";

/// Source of credentials and tunables.
pub trait ConfigProvider: Send + Sync {
    /// Raw lookup by dotted key, e.g. `sync.concurrency`.
    fn get(&self, key: &str) -> Option<String>;

    /// Effective configuration for a marketplace, with tenant overrides
    /// applied. `None` when the marketplace is not configured or disabled.
    fn marketplace_config(
        &self,
        marketplace: Marketplace,
        tenant_id: Option<&str>,
    ) -> Option<MarketplaceConfig>;
}

/// Request/response body encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BodyFormat {
    #[default]
    Json,
    Xml,
}

/// Authentication scheme name as written in config.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthKind {
    None,
    Basic,
    #[serde(rename = "oauth2")]
    OAuth2,
    ApiKey,
}

/// Resolved authentication scheme with its credentials.
#[derive(Clone, PartialEq, Eq)]
pub enum AuthScheme {
    None,
    Basic {
        username: String,
        password: String,
    },
    /// Refresh-token grant against `token_url`.
    OAuth2 {
        token_url: String,
        client_id: String,
        client_secret: String,
        refresh_token: String,
        scope: Option<String>,
    },
    /// Static headers sent with every request.
    ApiKey { headers: BTreeMap<String, String> },
}

impl AuthScheme {
    pub fn kind(&self) -> AuthKind {
        match self {
            AuthScheme::None => AuthKind::None,
            AuthScheme::Basic { .. } => AuthKind::Basic,
            AuthScheme::OAuth2 { .. } => AuthKind::OAuth2,
            AuthScheme::ApiKey { .. } => AuthKind::ApiKey,
        }
    }

    /// Names of required credentials that are empty.
    pub fn missing_credentials(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        match self {
            AuthScheme::None => {}
            AuthScheme::Basic { username, password } => {
                if username.is_empty() {
                    missing.push("username");
                }
                if password.is_empty() {
                    missing.push("password");
                }
            }
            AuthScheme::OAuth2 {
                token_url,
                client_id,
                client_secret,
                refresh_token,
                ..
            } => {
                for (name, value) in [
                    ("token_url", token_url),
                    ("client_id", client_id),
                    ("client_secret", client_secret),
                    ("refresh_token", refresh_token),
                ] {
                    if value.is_empty() {
                        missing.push(name);
                    }
                }
            }
            AuthScheme::ApiKey { headers } => {
                if headers.is_empty() || headers.values().any(|v| v.is_empty()) {
                    missing.push("headers");
                }
            }
        }
        missing
    }
}

impl std::fmt::Debug for AuthScheme {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut s = f.debug_struct("AuthScheme");
        s.field("kind", &self.kind());
        if let AuthScheme::ApiKey { headers } = self {
            s.field("headers", &headers.keys().collect::<Vec<_>>());
        }
        s.finish_non_exhaustive()
    }
}

/// `[marketplaces.<name>.auth]` section. Every field is optional so that
/// tenant sections can override single credentials.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct AuthSettings {
    pub scheme: Option<AuthKind>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub token_url: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub refresh_token: Option<String>,
    pub scope: Option<String>,
    pub headers: BTreeMap<String, String>,
}

impl AuthSettings {
    fn overlay(self, base: AuthSettings) -> AuthSettings {
        let mut headers = base.headers;
        headers.extend(self.headers);
        AuthSettings {
            scheme: self.scheme.or(base.scheme),
            username: self.username.or(base.username),
            password: self.password.or(base.password),
            token_url: self.token_url.or(base.token_url),
            client_id: self.client_id.or(base.client_id),
            client_secret: self.client_secret.or(base.client_secret),
            refresh_token: self.refresh_token.or(base.refresh_token),
            scope: self.scope.or(base.scope),
            headers,
        }
    }

    fn resolve(self) -> AuthScheme {
        match self.scheme.unwrap_or(AuthKind::None) {
            AuthKind::None => AuthScheme::None,
            AuthKind::Basic => AuthScheme::Basic {
                username: self.username.unwrap_or_default(),
                password: self.password.unwrap_or_default(),
            },
            AuthKind::OAuth2 => AuthScheme::OAuth2 {
                token_url: self.token_url.unwrap_or_default(),
                client_id: self.client_id.unwrap_or_default(),
                client_secret: self.client_secret.unwrap_or_default(),
                refresh_token: self.refresh_token.unwrap_or_default(),
                scope: self.scope,
            },
            AuthKind::ApiKey => AuthScheme::ApiKey {
                headers: self.headers,
            },
        }
    }
}

/// One `[marketplaces.<name>]` or `[tenants.<id>.marketplaces.<name>]` section.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct MarketplaceSettings {
    pub enabled: Option<bool>,
    pub base_url: Option<String>,
    pub auth: AuthSettings,
    pub body_format: Option<BodyFormat>,
    /// Root element name for XML request bodies.
    pub xml_root: Option<String>,
    pub batch_limit: Option<usize>,
    pub default_budget: Option<RateBudget>,
    pub rate_limits: BTreeMap<String, RateBudget>,
    pub max_rps: Option<u32>,
    pub timeout_secs: Option<u64>,
    pub max_wait_secs: Option<u64>,
    pub max_retries: Option<usize>,
    pub retry_min_delay_ms: Option<u64>,
    pub retry_max_delay_ms: Option<u64>,
    /// Static headers added to every request.
    pub headers: BTreeMap<String, String>,
    /// Entity adapters keyed by entity kind (`product`, `order`, ...).
    pub adapters: BTreeMap<String, AdapterSpec>,
}

impl MarketplaceSettings {
    /// Fields set in `self` win; maps are merged key by key.
    fn overlay(self, base: MarketplaceSettings) -> MarketplaceSettings {
        let mut rate_limits = base.rate_limits;
        rate_limits.extend(self.rate_limits);
        let mut headers = base.headers;
        headers.extend(self.headers);
        let mut adapters = base.adapters;
        adapters.extend(self.adapters);
        MarketplaceSettings {
            enabled: self.enabled.or(base.enabled),
            base_url: self.base_url.or(base.base_url),
            auth: self.auth.overlay(base.auth),
            body_format: self.body_format.or(base.body_format),
            xml_root: self.xml_root.or(base.xml_root),
            batch_limit: self.batch_limit.or(base.batch_limit),
            default_budget: self.default_budget.or(base.default_budget),
            rate_limits,
            max_rps: self.max_rps.or(base.max_rps),
            timeout_secs: self.timeout_secs.or(base.timeout_secs),
            max_wait_secs: self.max_wait_secs.or(base.max_wait_secs),
            max_retries: self.max_retries.or(base.max_retries),
            retry_min_delay_ms: self.retry_min_delay_ms.or(base.retry_min_delay_ms),
            retry_max_delay_ms: self.retry_max_delay_ms.or(base.retry_max_delay_ms),
            headers,
            adapters,
        }
    }
}

/// Built-in defaults for each marketplace's documented API surface.
pub fn builtin_defaults(marketplace: Marketplace) -> MarketplaceSettings {
    let auth = |scheme: AuthKind| AuthSettings {
        scheme: Some(scheme),
        ..Default::default()
    };
    let (base_url, auth, body_format, batch_limit, budget) = match marketplace {
        Marketplace::Trendyol => (
            "https://api.trendyol.com/sapigw",
            auth(AuthKind::Basic),
            BodyFormat::Json,
            1000,
            RateBudget::new(50, Duration::from_secs(10)),
        ),
        Marketplace::N11 => (
            "https://api.n11.com/ws",
            auth(AuthKind::ApiKey),
            BodyFormat::Xml,
            1,
            RateBudget::per_second(10),
        ),
        Marketplace::Amazon => (
            "https://sellingpartnerapi-eu.amazon.com",
            AuthSettings {
                token_url: Some("https://api.amazon.com/auth/o2/token".to_string()),
                ..auth(AuthKind::OAuth2)
            },
            BodyFormat::Json,
            1,
            RateBudget::per_second(5),
        ),
        Marketplace::Ebay => (
            "https://api.ebay.com",
            AuthSettings {
                token_url: Some("https://api.ebay.com/identity/v1/oauth2/token".to_string()),
                ..auth(AuthKind::OAuth2)
            },
            BodyFormat::Json,
            25,
            RateBudget::per_second(50),
        ),
        Marketplace::Hepsiburada => (
            "https://mpop.hepsiburada.com",
            auth(AuthKind::Basic),
            BodyFormat::Json,
            1000,
            RateBudget::new(100, Duration::from_secs(60)),
        ),
        Marketplace::Ozon => (
            "https://api-seller.ozon.ru",
            auth(AuthKind::ApiKey),
            BodyFormat::Json,
            100,
            RateBudget::per_second(10),
        ),
    };

    MarketplaceSettings {
        enabled: Some(true),
        base_url: Some(base_url.to_string()),
        auth,
        body_format: Some(body_format),
        xml_root: (body_format == BodyFormat::Xml).then(|| "request".to_string()),
        batch_limit: Some(batch_limit),
        default_budget: Some(budget),
        ..Default::default()
    }
}

/// Effective configuration for one marketplace (and optional tenant).
#[derive(Debug, Clone, PartialEq)]
pub struct MarketplaceConfig {
    pub marketplace: Marketplace,
    pub tenant_id: Option<String>,
    pub base_url: String,
    pub auth: AuthScheme,
    pub body_format: BodyFormat,
    pub xml_root: String,
    pub batch_limit: usize,
    pub default_budget: RateBudget,
    pub rate_limits: BTreeMap<String, RateBudget>,
    pub max_rps: Option<u32>,
    pub timeout: Duration,
    pub max_wait: Duration,
    pub max_retries: usize,
    pub retry_min_delay: Duration,
    pub retry_max_delay: Duration,
    pub headers: BTreeMap<String, String>,
    pub adapters: BTreeMap<String, AdapterSpec>,
}

impl MarketplaceConfig {
    fn from_settings(
        marketplace: Marketplace,
        tenant_id: Option<&str>,
        settings: MarketplaceSettings,
    ) -> Option<Self> {
        let builtin = builtin_defaults(marketplace);
        let settings = settings.overlay(builtin);
        if settings.enabled == Some(false) {
            return None;
        }
        Some(Self {
            marketplace,
            tenant_id: tenant_id.map(str::to_string),
            base_url: settings.base_url?.trim_end_matches('/').to_string(),
            auth: settings.auth.resolve(),
            body_format: settings.body_format.unwrap_or_default(),
            xml_root: settings.xml_root.unwrap_or_else(|| "request".to_string()),
            batch_limit: settings.batch_limit.unwrap_or(1).max(1),
            default_budget: settings
                .default_budget
                .unwrap_or(RateBudget::per_second(1)),
            rate_limits: settings.rate_limits,
            max_rps: settings.max_rps.filter(|rps| *rps > 0),
            timeout: Duration::from_secs(settings.timeout_secs.unwrap_or(30)),
            max_wait: settings
                .max_wait_secs
                .map_or(DEFAULT_MAX_WAIT, Duration::from_secs),
            max_retries: settings.max_retries.unwrap_or(3),
            retry_min_delay: Duration::from_millis(settings.retry_min_delay_ms.unwrap_or(500)),
            retry_max_delay: Duration::from_millis(settings.retry_max_delay_ms.unwrap_or(30_000)),
            headers: settings.headers,
            adapters: settings.adapters,
        })
    }

    /// Budget for an endpoint class, falling back to the marketplace default.
    pub fn budget_for(&self, endpoint: &str) -> RateBudget {
        self.rate_limits
            .get(endpoint)
            .copied()
            .unwrap_or(self.default_budget)
    }

    /// Limiter policy for an endpoint class.
    pub fn limit_policy(&self, endpoint: &str) -> LimitPolicy {
        LimitPolicy::new(self.budget_for(endpoint))
            .with_max_wait(self.max_wait)
            .with_max_rps(self.max_rps)
    }

    /// Adapter for an entity kind, or the generic REST adapter.
    pub fn adapter_for(&self, kind: EntityKind) -> AdapterSpec {
        self.adapters
            .get(kind.as_str())
            .cloned()
            .unwrap_or_else(|| AdapterSpec::generic(kind, self.batch_limit > 1))
    }
}

/// Database configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DatabaseSettings {
    /// Supports `sqlite://` and `postgres://` URLs.
    pub url: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TenantSettings {
    pub marketplaces: BTreeMap<String, MarketplaceSettings>,
}

/// Where rate limit counters live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CounterStoreKind {
    Memory,
    /// Shared by every process using the same database.
    #[default]
    Database,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RateLimiterSettings {
    pub store: CounterStoreKind,
}

/// Event bus tunables.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EventSettings {
    pub poll_interval_ms: u64,
    pub claim_batch: u64,
    pub aging_interval_secs: u64,
    pub default_max_attempts: u32,
    pub claim_timeout_secs: u64,
    pub queue_retention_days: u64,
    pub history_retention_days: u64,
    pub api_log_retention_days: u64,
    pub backoff: Backoff,
    /// Per-event overrides, matched like listener patterns.
    pub backoff_overrides: Vec<BackoffOverride>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BackoffOverride {
    pub pattern: String,
    pub policy: Backoff,
}

impl Default for EventSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
            claim_batch: 10,
            aging_interval_secs: 300,
            default_max_attempts: 3,
            claim_timeout_secs: 600,
            queue_retention_days: 7,
            history_retention_days: 30,
            api_log_retention_days: 30,
            backoff: Backoff::default(),
            backoff_overrides: Vec::new(),
        }
    }
}

impl EventSettings {
    pub fn to_bus_config(&self) -> EventBusConfig {
        let day = |days: u64| Duration::from_secs(days.saturating_mul(24 * 60 * 60));
        let backoff = self.backoff_overrides.iter().fold(
            BackoffTable::new(Arc::new(self.backoff.clone())),
            |table, o| table.with_override(o.pattern.clone(), Arc::new(o.policy.clone())),
        );
        EventBusConfig {
            poll_interval: Duration::from_millis(self.poll_interval_ms.max(10)),
            claim_batch: self.claim_batch.max(1),
            aging_interval: Duration::from_secs(self.aging_interval_secs.max(1)),
            default_max_attempts: self.default_max_attempts.max(1),
            claim_timeout: Duration::from_secs(self.claim_timeout_secs.max(1)),
            queue_retention: day(self.queue_retention_days),
            history_retention: day(self.history_retention_days),
            api_log_retention: day(self.api_log_retention_days),
            backoff,
        }
    }
}

/// Orchestrator defaults.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    /// Concurrent marketplace runs in `sync_many`.
    pub concurrency: usize,
    /// How per-entity sync events are delivered.
    pub event_mode: DispatchMode,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            concurrency: 4,
            event_mode: DispatchMode::Async,
        }
    }
}

impl SyncSettings {
    pub fn to_options(&self) -> SyncOptions {
        SyncOptions {
            concurrency: self.concurrency.max(1),
            event_mode: self.event_mode,
        }
    }
}

/// A listener registered at startup.
#[derive(Debug, Clone, Deserialize)]
pub struct ListenerSettings {
    pub event: String,
    pub handler: String,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub conditions: serde_json::Map<String, Value>,
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub database: DatabaseSettings,
    pub marketplaces: BTreeMap<String, MarketplaceSettings>,
    pub tenants: BTreeMap<String, TenantSettings>,
    pub rate_limiter: RateLimiterSettings,
    pub events: EventSettings,
    pub sync: SyncSettings,
    pub listeners: Vec<ListenerSettings>,
    #[serde(skip)]
    raw: ConfigBuilder,
}

impl Settings {
    /// Load configuration from files and the environment.
    ///
    /// Invalid configuration is logged and replaced by defaults.
    pub fn load() -> Self {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = Self::default_config_path()
            && path.exists()
        {
            tracing::debug!("Loading config from {:?}", path);
            builder = builder.add_source(File::from(path).format(FileFormat::Toml).required(false));
        }

        let local_config = PathBuf::from("marketsync.toml");
        if local_config.exists() {
            tracing::debug!("Loading config from ./marketsync.toml");
            builder = builder.add_source(
                File::from(local_config)
                    .format(FileFormat::Toml)
                    .required(false),
            );
        }

        builder = builder.add_source(
            Environment::with_prefix("MARKETSYNC")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        match builder.build() {
            Ok(raw) => Self::from_config(raw).unwrap_or_else(|e| {
                tracing::warn!("Failed to deserialize config: {}", e);
                Settings::default()
            }),
            Err(e) => {
                tracing::warn!("Failed to build config: {}", e);
                Settings::default()
            }
        }
    }

    /// Parse settings from a TOML document.
    pub fn from_toml_str(toml: &str) -> Result<Self, config::ConfigError> {
        let raw = ConfigBuilder::builder()
            .add_source(File::from_str(toml, FileFormat::Toml))
            .build()?;
        Self::from_config(raw)
    }

    fn from_config(raw: ConfigBuilder) -> Result<Self, config::ConfigError> {
        let mut settings: Settings = raw.clone().try_deserialize()?;
        settings.raw = raw;
        Ok(settings)
    }

    /// Database URL, defaulting to `marketsync.db` in the state directory.
    pub fn database_url(&self) -> Option<String> {
        self.database.url.clone().or_else(|| {
            Self::default_state_dir().map(|state_dir| {
                let db_path = state_dir.join("marketsync.db");
                format!("sqlite://{}?mode=rwc", db_path.display())
            })
        })
    }

    pub fn default_config_path() -> Option<PathBuf> {
        ProjectDirs::from("", "", APP_NAME).map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// `$XDG_STATE_HOME/marketsync`, or the data directory where there is no state dir.
    pub fn default_state_dir() -> Option<PathBuf> {
        ProjectDirs::from("", "", APP_NAME).map(|dirs| {
            dirs.state_dir()
                .map(|p| p.to_path_buf())
                .unwrap_or_else(|| dirs.data_dir().to_path_buf())
        })
    }

    /// Marketplaces with a section in config, in either the default or a tenant section.
    pub fn configured_marketplaces(&self) -> Vec<Marketplace> {
        Marketplace::ALL
            .into_iter()
            .filter(|m| {
                self.marketplaces.contains_key(m.as_str())
                    || self
                        .tenants
                        .values()
                        .any(|t| t.marketplaces.contains_key(m.as_str()))
            })
            .collect()
    }
}

impl ConfigProvider for Settings {
    fn get(&self, key: &str) -> Option<String> {
        self.raw.get_string(key).ok()
    }

    fn marketplace_config(
        &self,
        marketplace: Marketplace,
        tenant_id: Option<&str>,
    ) -> Option<MarketplaceConfig> {
        let base = self.marketplaces.get(marketplace.as_str()).cloned();
        let tenant = tenant_id.and_then(|id| {
            self.tenants
                .get(id)
                .and_then(|t| t.marketplaces.get(marketplace.as_str()))
                .cloned()
        });

        let merged = match (tenant, base) {
            (None, None) => return None,
            (Some(tenant), None) => tenant,
            (None, Some(base)) => base,
            (Some(tenant), Some(base)) => tenant.overlay(base),
        };
        MarketplaceConfig::from_settings(marketplace, tenant_id, merged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        [database]
        url = "sqlite:///tmp/marketsync-test.db"

        [marketplaces.trendyol]
        batch_limit = 500
        max_rps = 5
        auth = { username = "seller", password = "secret" }
        rate_limits.products = { requests = 20, period_secs = 10 }

        [marketplaces.ozon]
        enabled = false

        [marketplaces.amazon]
        auth = { client_id = "cid", client_secret = "cs", refresh_token = "rt" }

        [tenants.acme.marketplaces.trendyol]
        auth = { password = "acme-secret" }
        timeout_secs = 5

        [tenants.acme.marketplaces.n11]
        auth = { headers = { appkey = "k", appsecret = "s" } }

        [events]
        claim_batch = 5
        backoff = { strategy = "constant", delay_secs = 60 }

        [[events.backoff_overrides]]
        pattern = "order.*"
        policy = { strategy = "linear", step_secs = 10 }

        [sync]
        concurrency = 2
        event_mode = "sync"

        [[listeners]]
        event = "order.created"
        handler = "log"
        priority = 5
        conditions = { marketplace = "trendyol" }
    "#;

    #[test]
    fn test_default_settings() {
        let settings = Settings::default();
        assert!(settings.database.url.is_none());
        assert!(settings.marketplaces.is_empty());
        assert_eq!(settings.sync.concurrency, 4);
        assert_eq!(settings.sync.event_mode, DispatchMode::Async);
        assert_eq!(settings.rate_limiter.store, CounterStoreKind::Database);
        assert_eq!(settings.events.default_max_attempts, 3);
    }

    #[test]
    fn test_parses_sections() {
        let settings = Settings::from_toml_str(SAMPLE).unwrap();
        assert_eq!(
            settings.database_url().as_deref(),
            Some("sqlite:///tmp/marketsync-test.db")
        );
        assert_eq!(settings.sync.concurrency, 2);
        assert_eq!(settings.sync.event_mode, DispatchMode::Sync);
        assert_eq!(settings.listeners.len(), 1);
        assert_eq!(settings.listeners[0].priority, 5);
        assert_eq!(
            settings.listeners[0].conditions.get("marketplace"),
            Some(&Value::String("trendyol".to_string()))
        );
        assert_eq!(settings.get("sync.concurrency").as_deref(), Some("2"));
        assert!(settings.get("sync.missing").is_none());
    }

    #[test]
    fn test_marketplace_config_applies_builtin_defaults() {
        let settings = Settings::from_toml_str(SAMPLE).unwrap();
        let config = settings
            .marketplace_config(Marketplace::Trendyol, None)
            .unwrap();

        assert_eq!(config.base_url, "https://api.trendyol.com/sapigw");
        assert_eq!(config.body_format, BodyFormat::Json);
        assert_eq!(config.batch_limit, 500);
        assert_eq!(config.max_rps, Some(5));
        assert_eq!(
            config.auth,
            AuthScheme::Basic {
                username: "seller".to_string(),
                password: "secret".to_string(),
            }
        );
        assert_eq!(
            config.budget_for("products"),
            RateBudget::new(20, Duration::from_secs(10))
        );
        assert_eq!(
            config.budget_for("orders"),
            RateBudget::new(50, Duration::from_secs(10))
        );
    }

    #[test]
    fn test_tenant_overrides_default_section() {
        let settings = Settings::from_toml_str(SAMPLE).unwrap();
        let config = settings
            .marketplace_config(Marketplace::Trendyol, Some("acme"))
            .unwrap();

        assert_eq!(config.tenant_id.as_deref(), Some("acme"));
        assert_eq!(config.timeout, Duration::from_secs(5));
        assert_eq!(
            config.auth,
            AuthScheme::Basic {
                username: "seller".to_string(),
                password: "acme-secret".to_string(),
            }
        );
        // Unknown tenants fall back to the default section.
        let other = settings
            .marketplace_config(Marketplace::Trendyol, Some("other"))
            .unwrap();
        assert_eq!(other.timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_tenant_only_marketplace() {
        let settings = Settings::from_toml_str(SAMPLE).unwrap();
        assert!(settings.marketplace_config(Marketplace::N11, None).is_none());

        let config = settings
            .marketplace_config(Marketplace::N11, Some("acme"))
            .unwrap();
        assert_eq!(config.body_format, BodyFormat::Xml);
        assert_eq!(config.xml_root, "request");
        assert!(config.auth.missing_credentials().is_empty());
    }

    #[test]
    fn test_unconfigured_and_disabled_marketplaces() {
        let settings = Settings::from_toml_str(SAMPLE).unwrap();
        assert!(settings.marketplace_config(Marketplace::Ebay, None).is_none());
        assert!(settings.marketplace_config(Marketplace::Ozon, None).is_none());
        assert_eq!(
            settings.configured_marketplaces(),
            vec![
                Marketplace::Trendyol,
                Marketplace::N11,
                Marketplace::Amazon,
                Marketplace::Ozon
            ]
        );
    }

    #[test]
    fn test_oauth_defaults_and_missing_credentials() {
        let settings = Settings::from_toml_str(SAMPLE).unwrap();
        let config = settings.marketplace_config(Marketplace::Amazon, None).unwrap();
        match &config.auth {
            AuthScheme::OAuth2 { token_url, .. } => {
                assert_eq!(token_url, "https://api.amazon.com/auth/o2/token")
            }
            other => panic!("unexpected auth {:?}", other),
        }
        assert!(config.auth.missing_credentials().is_empty());

        let bare = Settings::from_toml_str("[marketplaces.amazon]\nbatch_limit = 1\n").unwrap();
        let config = bare.marketplace_config(Marketplace::Amazon, None).unwrap();
        assert_eq!(
            config.auth.missing_credentials(),
            vec!["client_id", "client_secret", "refresh_token"]
        );
    }

    #[test]
    fn test_event_settings_build_bus_config() {
        let settings = Settings::from_toml_str(SAMPLE).unwrap();
        let config = settings.events.to_bus_config();
        assert_eq!(config.claim_batch, 5);
        assert_eq!(config.backoff.delay("product.synced", 2), Duration::from_secs(60));
        assert_eq!(config.backoff.delay("order.created", 2), Duration::from_secs(20));
    }

    #[test]
    fn test_auth_debug_hides_secrets() {
        let auth = AuthScheme::Basic {
            username: "seller".to_string(),
            password: "hunter2".to_string(),
        };
        let rendered = format!("{:?}", auth);
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("Basic"));
    }
}
