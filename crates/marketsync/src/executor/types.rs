use std::time::Duration;

use serde_json::Value;

use crate::entity::marketplace::Marketplace;
use crate::http::{HttpHeaders, HttpMethod, header_get};

/// Which marketplace account a call runs as.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AuthContext {
    pub marketplace: Marketplace,
    pub tenant_id: Option<String>,
}

impl AuthContext {
    pub fn new(marketplace: Marketplace) -> Self {
        Self {
            marketplace,
            tenant_id: None,
        }
    }

    pub fn for_tenant(marketplace: Marketplace, tenant_id: impl Into<String>) -> Self {
        Self {
            marketplace,
            tenant_id: Some(tenant_id.into()),
        }
    }
}

impl std::fmt::Display for AuthContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.tenant_id {
            Some(tenant) => write!(f, "{}/{}", self.marketplace, tenant),
            None => write!(f, "{}", self.marketplace),
        }
    }
}

/// One outbound marketplace call.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiRequest {
    /// Endpoint class; selects the rate budget and labels the call log.
    pub endpoint: String,
    pub method: HttpMethod,
    /// Path relative to the marketplace base URL.
    pub path: String,
    pub query: Vec<(String, String)>,
    pub payload: Option<Value>,
}

impl ApiRequest {
    pub fn new(endpoint: impl Into<String>, method: HttpMethod, path: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            method,
            path: path.into(),
            query: Vec::new(),
            payload: None,
        }
    }

    pub fn get(endpoint: impl Into<String>, path: impl Into<String>) -> Self {
        Self::new(endpoint, HttpMethod::Get, path)
    }

    pub fn post(endpoint: impl Into<String>, path: impl Into<String>, payload: Value) -> Self {
        Self::new(endpoint, HttpMethod::Post, path).with_payload(payload)
    }

    pub fn put(endpoint: impl Into<String>, path: impl Into<String>, payload: Value) -> Self {
        Self::new(endpoint, HttpMethod::Put, path).with_payload(payload)
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn with_query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    /// Absolute URL under `base_url`, with the query string encoded.
    pub fn url(&self, base_url: &str) -> String {
        let mut url = if self.path.starts_with("http://") || self.path.starts_with("https://") {
            self.path.clone()
        } else {
            format!(
                "{}/{}",
                base_url.trim_end_matches('/'),
                self.path.trim_start_matches('/')
            )
        };
        if !self.query.is_empty() {
            let query = self
                .query
                .iter()
                .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
                .collect::<Vec<_>>()
                .join("&");
            url.push(if url.contains('?') { '&' } else { '?' });
            url.push_str(&query);
        }
        url
    }
}

/// Normalized successful response.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiResponse {
    pub status: u16,
    pub headers: HttpHeaders,
    /// Decoded JSON or XML body; `null` when empty.
    pub body: Value,
    pub latency: Duration,
}

impl ApiResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        header_get(&self.headers, name)
    }

    /// Look up a JSON pointer (`/items/0/id`) in the body.
    pub fn pointer(&self, pointer: &str) -> Option<&Value> {
        self.body.pointer(pointer)
    }
}
