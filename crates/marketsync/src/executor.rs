//! Request executor: authenticated, rate-limited, logged marketplace calls.
//!
//! Every call goes through the same sequence: resolve marketplace config,
//! obtain auth headers (refreshing an OAuth2 token that is close to expiry),
//! acquire a rate limit slot, send under a hard timeout, classify the
//! outcome, decode the body and write one `api_call_logs` row. The executor
//! itself never retries.

mod auth;
mod call_log;
mod codec;
mod errors;
mod types;

use std::sync::Arc;
use std::time::Duration;

use sea_orm::DatabaseConnection;
use serde_json::Value;
use tokio::time::Instant;

pub use auth::{REFRESH_MARGIN, TokenCache};
pub use call_log::{CallSummary, call_summary, prune_call_logs, recent_calls, redact_headers};
pub use codec::{decode, encode};
pub use errors::{ExecutorError, Result, short_error_message};
pub use types::{ApiRequest, ApiResponse, AuthContext};

use crate::http::{HttpError, HttpHeaders, HttpRequest, HttpResponse, HttpTransport};
use crate::rate_limit::{EndpointClass, RateLimiter};
use crate::settings::{ConfigProvider, MarketplaceConfig};
use call_log::CallLogEntry;

/// Default `Retry-After` when a 429 carries none.
const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(1);

/// Longest `Retry-After` honoured; larger values are clamped to it.
const MAX_RETRY_AFTER: Duration = Duration::from_secs(3600);

/// Executes marketplace calls on behalf of the reconciler and orchestrator.
pub struct RequestExecutor {
    db: Arc<DatabaseConnection>,
    config: Arc<dyn ConfigProvider>,
    transport: Arc<dyn HttpTransport>,
    limiter: Arc<RateLimiter>,
    tokens: TokenCache,
}

impl RequestExecutor {
    pub fn new(
        db: Arc<DatabaseConnection>,
        config: Arc<dyn ConfigProvider>,
        transport: Arc<dyn HttpTransport>,
        limiter: Arc<RateLimiter>,
    ) -> Self {
        Self {
            db,
            config,
            transport,
            limiter,
            tokens: TokenCache::new(),
        }
    }

    pub fn db(&self) -> &DatabaseConnection {
        &self.db
    }

    pub fn config_provider(&self) -> &Arc<dyn ConfigProvider> {
        &self.config
    }

    /// Effective config for `ctx`, or `Config` when the marketplace is not
    /// configured or disabled.
    pub fn marketplace_config(&self, ctx: &AuthContext) -> Result<MarketplaceConfig> {
        self.config
            .marketplace_config(ctx.marketplace, ctx.tenant_id.as_deref())
            .ok_or_else(|| {
                ExecutorError::Config(format!("marketplace {} is not configured", ctx))
            })
    }

    /// Execute one call.
    pub async fn execute(&self, ctx: &AuthContext, request: &ApiRequest) -> Result<ApiResponse> {
        let config = self.marketplace_config(ctx)?;
        self.execute_with(&config, request).await
    }

    /// Execute one call with an already-resolved config.
    pub async fn execute_with(
        &self,
        config: &MarketplaceConfig,
        request: &ApiRequest,
    ) -> Result<ApiResponse> {
        let started = Instant::now();
        let url = request.url(&config.base_url);
        let mut entry = CallLogEntry {
            marketplace: config.marketplace,
            tenant_id: config.tenant_id.clone(),
            endpoint: request.endpoint.clone(),
            method: request.method.to_string(),
            url: url.clone(),
            request: call_log::request_snapshot(&Vec::new(), request.payload.as_ref()),
            response: None,
            http_status: None,
        };

        let result = self.perform(config, request, url, &mut entry).await;
        let latency = started.elapsed();

        match &result {
            Ok(response) => tracing::debug!(
                marketplace = %config.marketplace,
                endpoint = %request.endpoint,
                status = response.status,
                latency_ms = latency.as_millis() as u64,
                "Marketplace call succeeded"
            ),
            Err(e) => tracing::debug!(
                marketplace = %config.marketplace,
                endpoint = %request.endpoint,
                kind = e.kind(),
                latency_ms = latency.as_millis() as u64,
                "Marketplace call failed: {}",
                e
            ),
        }

        let outcome = result.as_ref().map(|_| ());
        if let Err(e) = entry
            .insert(&self.db, outcome, latency.as_millis() as i64)
            .await
        {
            tracing::warn!(
                marketplace = %config.marketplace,
                endpoint = %request.endpoint,
                "Failed to write API call log: {}",
                e
            );
        }
        result
    }

    async fn perform(
        &self,
        config: &MarketplaceConfig,
        request: &ApiRequest,
        url: String,
        entry: &mut CallLogEntry,
    ) -> Result<ApiResponse> {
        let body = match &request.payload {
            Some(payload) => codec::encode(config.body_format, &config.xml_root, payload)?,
            None => Vec::new(),
        };

        let mut headers: HttpHeaders = vec![(
            "Accept".to_string(),
            config.body_format.content_type().to_string(),
        )];
        if request.payload.is_some() {
            headers.push((
                "Content-Type".to_string(),
                config.body_format.content_type().to_string(),
            ));
        }
        headers.extend(config.headers.iter().map(|(k, v)| (k.clone(), v.clone())));
        headers.extend(self.tokens.authorize(self.transport.as_ref(), config).await?);
        entry.request = call_log::request_snapshot(&headers, request.payload.as_ref());

        let class = EndpointClass::new(
            config.marketplace,
            config.tenant_id.as_deref(),
            request.endpoint.clone(),
        );
        self.limiter
            .acquire(&class, &config.limit_policy(&request.endpoint))
            .await?;

        let http_request = HttpRequest {
            method: request.method,
            url,
            headers,
            body,
        };
        let sent = Instant::now();
        let response = match tokio::time::timeout(config.timeout, self.transport.send(http_request)).await
        {
            Err(_) => {
                return Err(ExecutorError::transient(format!(
                    "request timed out after {}s",
                    config.timeout.as_secs_f64()
                )));
            }
            Ok(Err(HttpError::Timeout)) => {
                return Err(ExecutorError::transient("request timed out"));
            }
            Ok(Err(e)) => return Err(ExecutorError::transient(e.to_string())),
            Ok(Ok(response)) => response,
        };
        let latency = sent.elapsed();

        entry.http_status = Some(response.status);
        let decoded = codec::decode(
            config.body_format,
            response.header("Content-Type"),
            &response.body,
        );
        entry.response = Some(match &decoded {
            Ok(value) => value.clone(),
            Err(_) => Value::String(codec::snippet(&response.body, 2000)),
        });

        if let Some(err) = classify_status(config, &response, decoded.as_ref().ok()) {
            if matches!(err, ExecutorError::Auth { .. }) {
                self.tokens
                    .invalidate(config.marketplace, config.tenant_id.as_deref());
            }
            return Err(err);
        }

        Ok(ApiResponse {
            status: response.status,
            headers: response.headers,
            body: decoded?,
            latency,
        })
    }
}

impl std::fmt::Debug for RequestExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestExecutor")
            .field("limiter", &self.limiter)
            .field("tokens", &self.tokens)
            .finish_non_exhaustive()
    }
}

/// Map a non-2xx status to the error taxonomy.
fn classify_status(
    config: &MarketplaceConfig,
    response: &HttpResponse,
    body: Option<&Value>,
) -> Option<ExecutorError> {
    let status = response.status;
    if response.is_success() {
        return None;
    }
    let message = body
        .and_then(error_message)
        .unwrap_or_else(|| codec::snippet(&response.body, 500));

    Some(match status {
        401 | 403 => ExecutorError::auth(config.marketplace, format!("HTTP {}: {}", status, message)),
        429 => ExecutorError::RateLimited {
            retry_after: retry_after(response).unwrap_or(DEFAULT_RETRY_AFTER),
        },
        500.. => ExecutorError::transient(format!("HTTP {}: {}", status, message)),
        _ => ExecutorError::remote(status, message),
    })
}

/// `Retry-After` in delay-seconds form, capped at [`MAX_RETRY_AFTER`].
fn retry_after(response: &HttpResponse) -> Option<Duration> {
    response
        .header("Retry-After")
        .and_then(|v| v.trim().parse::<f64>().ok())
        .filter(|secs| *secs >= 0.0)
        .map(|secs| {
            Duration::try_from_secs_f64(secs)
                .map_or(MAX_RETRY_AFTER, |delay| delay.min(MAX_RETRY_AFTER))
        })
}

/// Pull a human-readable message out of the usual error body shapes.
fn error_message(body: &Value) -> Option<String> {
    const POINTERS: [&str; 7] = [
        "/message",
        "/error/message",
        "/errors/0/message",
        "/error_description",
        "/error",
        "/errors/0",
        "/result/errorMessage",
    ];
    POINTERS
        .iter()
        .filter_map(|p| body.pointer(p))
        .find_map(|v| v.as_str().map(str::to_string))
}
