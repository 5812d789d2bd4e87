//! Transport boundary for all outbound marketplace HTTP I/O.

use async_trait::async_trait;
use thiserror::Error;

/// Minimal HTTP method enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl HttpMethod {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Delete => "DELETE",
        }
    }
}

impl std::fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// HTTP headers represented as key/value pairs.
///
/// Header names are treated case-insensitively by helper functions.
pub type HttpHeaders = Vec<(String, String)>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub method: HttpMethod,
    pub url: String,
    pub headers: HttpHeaders,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: HttpHeaders,
    pub body: Vec<u8>,
}

impl HttpResponse {
    /// Build a response with a JSON body.
    pub fn json(status: u16, body: &serde_json::Value) -> Self {
        Self {
            status,
            headers: vec![("Content-Type".to_string(), "application/json".to_string())],
            body: body.to_string().into_bytes(),
        }
    }

    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        header_get(&self.headers, name)
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

#[derive(Debug, Error)]
pub enum HttpError {
    #[error("http transport error: {0}")]
    Transport(String),

    #[error("http request timed out")]
    Timeout,

    #[error("no mock response registered for {method} {url}")]
    NoMockResponse { method: String, url: String },
}

/// Transport boundary for all HTTP I/O.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, HttpError>;
}

/// Get the first header value matching `name` (case-insensitive).
#[must_use]
pub fn header_get<'a>(headers: &'a HttpHeaders, name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

#[cfg(feature = "http")]
pub mod reqwest_transport {
    use super::*;

    use std::time::Duration as StdDuration;

    /// A real HTTP transport backed by reqwest.
    #[derive(Clone)]
    pub struct ReqwestTransport {
        client: reqwest::Client,
    }

    impl ReqwestTransport {
        pub fn new(client: reqwest::Client) -> Self {
            Self { client }
        }

        /// Build a client whose connect phase is bounded by `connect_timeout`.
        ///
        /// The per-call deadline is enforced by the executor, which knows each
        /// marketplace's configured timeout.
        pub fn with_connect_timeout(connect_timeout: StdDuration) -> Result<Self, HttpError> {
            let client = reqwest::Client::builder()
                .connect_timeout(connect_timeout)
                .user_agent(concat!("marketsync/", env!("CARGO_PKG_VERSION")))
                .build()
                .map_err(|e| HttpError::Transport(e.to_string()))?;
            Ok(Self { client })
        }
    }

    #[async_trait]
    impl HttpTransport for ReqwestTransport {
        async fn send(&self, request: HttpRequest) -> Result<HttpResponse, HttpError> {
            let method = match request.method {
                HttpMethod::Get => reqwest::Method::GET,
                HttpMethod::Post => reqwest::Method::POST,
                HttpMethod::Put => reqwest::Method::PUT,
                HttpMethod::Patch => reqwest::Method::PATCH,
                HttpMethod::Delete => reqwest::Method::DELETE,
            };

            let mut builder = self.client.request(method, &request.url);
            for (k, v) in request.headers {
                builder = builder.header(&k, &v);
            }

            if !request.body.is_empty() {
                builder = builder.body(request.body);
            }

            let resp = builder.send().await.map_err(|e| {
                if e.is_timeout() {
                    HttpError::Timeout
                } else {
                    HttpError::Transport(e.to_string())
                }
            })?;

            let status = resp.status().as_u16();
            let headers: HttpHeaders = resp
                .headers()
                .iter()
                .map(|(name, value)| {
                    (
                        name.as_str().to_string(),
                        value.to_str().unwrap_or_default().to_string(),
                    )
                })
                .collect();

            let body = resp
                .bytes()
                .await
                .map_err(|e| HttpError::Transport(e.to_string()))?
                .to_vec();

            Ok(HttpResponse {
                status,
                headers,
                body,
            })
        }
    }
}

pub mod mock {
    //! In-memory transport: no sockets, no loopback servers.

    use std::collections::{HashMap, VecDeque};
    use std::sync::{Arc, Mutex, MutexGuard};
    use std::time::Duration;

    use super::*;

    type Responder = Arc<dyn Fn(&HttpRequest) -> HttpResponse + Send + Sync>;

    /// Scripted transport.
    ///
    /// Responses registered for a method + URL are returned in FIFO order.
    /// Requests without a scripted response go to the fallback responder, if
    /// one is set. Every request is recorded together with the tokio instant
    /// at which it was sent.
    #[derive(Clone, Default)]
    pub struct MockTransport {
        inner: Arc<Mutex<MockTransportInner>>,
    }

    #[derive(Default)]
    struct MockTransportInner {
        routes: HashMap<(HttpMethod, String), VecDeque<HttpResponse>>,
        fallback: Option<Responder>,
        delay: Duration,
        requests: Vec<(tokio::time::Instant, HttpRequest)>,
    }

    impl MockTransport {
        pub fn new() -> Self {
            Self::default()
        }

        fn lock(&self) -> MutexGuard<'_, MockTransportInner> {
            self.inner.lock().unwrap_or_else(|e| e.into_inner())
        }

        /// Register a response for a method + URL.
        pub fn push_response(
            &self,
            method: HttpMethod,
            url: impl Into<String>,
            response: HttpResponse,
        ) {
            self.lock()
                .routes
                .entry((method, url.into()))
                .or_default()
                .push_back(response);
        }

        /// Answer every unscripted request with `responder`.
        pub fn set_fallback<F>(&self, responder: F)
        where
            F: Fn(&HttpRequest) -> HttpResponse + Send + Sync + 'static,
        {
            self.lock().fallback = Some(Arc::new(responder));
        }

        /// Delay every response by `delay`, simulating a slow marketplace.
        pub fn set_delay(&self, delay: Duration) {
            self.lock().delay = delay;
        }

        #[must_use]
        pub fn requests(&self) -> Vec<HttpRequest> {
            self.lock()
                .requests
                .iter()
                .map(|(_, r)| r.clone())
                .collect()
        }

        /// Requests whose URL contains `fragment`.
        #[must_use]
        pub fn requests_matching(&self, fragment: &str) -> Vec<HttpRequest> {
            self.lock()
                .requests
                .iter()
                .filter(|(_, r)| r.url.contains(fragment))
                .map(|(_, r)| r.clone())
                .collect()
        }

        #[must_use]
        pub fn request_times(&self) -> Vec<tokio::time::Instant> {
            self.lock().requests.iter().map(|(at, _)| *at).collect()
        }
    }

    #[async_trait]
    impl HttpTransport for MockTransport {
        async fn send(&self, request: HttpRequest) -> Result<HttpResponse, HttpError> {
            let (delay, result) = {
                let mut inner = self.lock();
                let key = (request.method, request.url.clone());
                let scripted = inner.routes.get_mut(&key).and_then(|q| q.pop_front());
                let result = match (scripted, inner.fallback.clone()) {
                    (Some(resp), _) => Ok(resp),
                    (None, Some(responder)) => Ok(responder(&request)),
                    (None, None) => Err(HttpError::NoMockResponse {
                        method: key.0.as_str().to_string(),
                        url: key.1,
                    }),
                };
                inner.requests.push((tokio::time::Instant::now(), request));
                (inner.delay, result)
            };

            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            result
        }
    }
}
