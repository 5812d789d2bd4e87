//! Authorization headers and the OAuth2 access token cache.

use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use dashmap::DashMap;
use serde::Deserialize;
use tokio::time::Instant;

use super::errors::{ExecutorError, Result};
use crate::entity::marketplace::Marketplace;
use crate::http::{HttpHeaders, HttpMethod, HttpRequest, HttpTransport};
use crate::locks::KeyedLocks;
use crate::settings::{AuthScheme, MarketplaceConfig};

/// Tokens with less than this much lifetime left are refreshed before use.
pub const REFRESH_MARGIN: Duration = Duration::from_secs(60);

const DEFAULT_TOKEN_LIFETIME: Duration = Duration::from_secs(3600);

/// Longest `expires_in` trusted from a token endpoint.
const MAX_TOKEN_LIFETIME: Duration = Duration::from_secs(30 * 24 * 3600);

type TokenKey = (Marketplace, Option<String>);

#[derive(Clone)]
struct CachedToken {
    access_token: String,
    expires_at: Instant,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
}

/// Per `(marketplace, tenant)` token cache.
#[derive(Default)]
pub struct TokenCache {
    tokens: DashMap<TokenKey, CachedToken>,
    refreshing: KeyedLocks<TokenKey>,
}

impl TokenCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Headers that authenticate a request under `config.auth`.
    pub async fn authorize(
        &self,
        transport: &dyn HttpTransport,
        config: &MarketplaceConfig,
    ) -> Result<HttpHeaders> {
        let missing = config.auth.missing_credentials();
        if !missing.is_empty() {
            return Err(ExecutorError::auth(
                config.marketplace,
                format!("missing credentials: {}", missing.join(", ")),
            ));
        }

        match &config.auth {
            AuthScheme::None => Ok(Vec::new()),
            AuthScheme::Basic { username, password } => {
                let encoded = BASE64.encode(format!("{}:{}", username, password));
                Ok(vec![(
                    "Authorization".to_string(),
                    format!("Basic {}", encoded),
                )])
            }
            AuthScheme::ApiKey { headers } => Ok(headers
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()),
            AuthScheme::OAuth2 { .. } => {
                let token = self.bearer(transport, config).await?;
                Ok(vec![(
                    "Authorization".to_string(),
                    format!("Bearer {}", token),
                )])
            }
        }
    }

    /// Drop the cached token after the marketplace rejected it.
    pub fn invalidate(&self, marketplace: Marketplace, tenant_id: Option<&str>) {
        if self
            .tokens
            .remove(&(marketplace, tenant_id.map(str::to_string)))
            .is_some()
        {
            tracing::debug!(marketplace = %marketplace, tenant = ?tenant_id, "Invalidated cached access token");
        }
    }

    fn fresh(&self, key: &TokenKey) -> Option<String> {
        self.tokens
            .get(key)
            .filter(|t| t.expires_at > Instant::now() + REFRESH_MARGIN)
            .map(|t| t.access_token.clone())
    }

    async fn bearer(&self, transport: &dyn HttpTransport, config: &MarketplaceConfig) -> Result<String> {
        let key: TokenKey = (config.marketplace, config.tenant_id.clone());
        if let Some(token) = self.fresh(&key) {
            return Ok(token);
        }

        // One refresh per key; later callers pick up the new token.
        let _guard = self.refreshing.lock(key.clone()).await;
        if let Some(token) = self.fresh(&key) {
            return Ok(token);
        }

        let cached = refresh(transport, config).await?;
        let token = cached.access_token.clone();
        self.tokens.insert(key, cached);
        Ok(token)
    }
}

impl std::fmt::Debug for TokenCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenCache")
            .field("tokens", &self.tokens.len())
            .finish()
    }
}

async fn refresh(transport: &dyn HttpTransport, config: &MarketplaceConfig) -> Result<CachedToken> {
    let AuthScheme::OAuth2 {
        token_url,
        client_id,
        client_secret,
        refresh_token,
        scope,
    } = &config.auth
    else {
        return Err(ExecutorError::Config(
            "token refresh requires oauth2 credentials".to_string(),
        ));
    };

    let mut form = vec![
        ("grant_type", "refresh_token"),
        ("refresh_token", refresh_token.as_str()),
        ("client_id", client_id.as_str()),
        ("client_secret", client_secret.as_str()),
    ];
    if let Some(scope) = scope {
        form.push(("scope", scope.as_str()));
    }
    let body = form
        .iter()
        .map(|(k, v)| format!("{}={}", k, urlencoding::encode(v)))
        .collect::<Vec<_>>()
        .join("&");

    let request = HttpRequest {
        method: HttpMethod::Post,
        url: token_url.clone(),
        headers: vec![
            (
                "Content-Type".to_string(),
                "application/x-www-form-urlencoded".to_string(),
            ),
            ("Accept".to_string(), "application/json".to_string()),
        ],
        body: body.into_bytes(),
    };

    let response = match tokio::time::timeout(config.timeout, transport.send(request)).await {
        Err(_) => return Err(ExecutorError::transient("token refresh timed out")),
        Ok(Err(e)) => return Err(ExecutorError::transient(format!("token refresh failed: {}", e))),
        Ok(Ok(response)) => response,
    };

    if response.status >= 500 {
        return Err(ExecutorError::transient(format!(
            "token endpoint returned {}",
            response.status
        )));
    }
    if !response.is_success() {
        return Err(ExecutorError::auth(
            config.marketplace,
            format!(
                "token refresh rejected with {}: {}",
                response.status,
                super::codec::snippet(&response.body, 200)
            ),
        ));
    }

    let parsed: TokenResponse = serde_json::from_slice(&response.body)
        .map_err(|e| ExecutorError::malformed(format!("invalid token response: {}", e)))?;
    let lifetime = parsed
        .expires_in
        .map_or(DEFAULT_TOKEN_LIFETIME, Duration::from_secs)
        .min(MAX_TOKEN_LIFETIME);

    tracing::debug!(
        marketplace = %config.marketplace,
        tenant = ?config.tenant_id,
        expires_in_secs = lifetime.as_secs(),
        "Refreshed access token"
    );
    Ok(CachedToken {
        access_token: parsed.access_token,
        expires_at: Instant::now() + lifetime,
    })
}
