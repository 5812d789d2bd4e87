use std::time::Duration;

use thiserror::Error;

use crate::entity::marketplace::Marketplace;
use crate::rate_limit::RateLimitError;

/// Classified failure of one marketplace call.
///
/// The executor never retries; callers decide based on [`is_retryable`].
///
/// [`is_retryable`]: ExecutorError::is_retryable
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExecutorError {
    /// Credentials missing or rejected. Needs an operator.
    #[error("authentication failed for {marketplace}: {message}")]
    Auth {
        marketplace: Marketplace,
        message: String,
    },

    /// Local limiter or remote 429.
    #[error("rate limited; retry after {}ms", retry_after.as_millis())]
    RateLimited { retry_after: Duration },

    /// 5xx, timeout or connection failure.
    #[error("transient network error: {0}")]
    TransientNetwork(String),

    /// Business rejection (4xx).
    #[error("remote API error {code}: {message}")]
    RemoteApi { code: u16, message: String },

    #[error("malformed response: {0}")]
    MalformedResponse(String),

    #[error("failed to encode request body: {0}")]
    Encode(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl ExecutorError {
    #[inline]
    pub fn auth(marketplace: Marketplace, message: impl Into<String>) -> Self {
        Self::Auth {
            marketplace,
            message: message.into(),
        }
    }

    #[inline]
    pub fn transient(message: impl Into<String>) -> Self {
        Self::TransientNetwork(message.into())
    }

    #[inline]
    pub fn remote(code: u16, message: impl Into<String>) -> Self {
        Self::RemoteApi {
            code,
            message: message.into(),
        }
    }

    #[inline]
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::MalformedResponse(message.into())
    }

    /// Worth retrying after a backoff.
    #[inline]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::RateLimited { .. } | Self::TransientNetwork(_))
    }

    /// Stable identifier stored in call logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Auth { .. } => "auth",
            Self::RateLimited { .. } => "rate_limited",
            Self::TransientNetwork(_) => "transient_network",
            Self::RemoteApi { .. } => "remote_api",
            Self::MalformedResponse(_) => "malformed_response",
            Self::Encode(_) => "encode",
            Self::Config(_) => "config",
        }
    }
}

impl From<RateLimitError> for ExecutorError {
    fn from(e: RateLimitError) -> Self {
        Self::RateLimited {
            retry_after: e.retry_after(),
        }
    }
}

/// First line of an error message, for progress output and logs.
#[inline]
pub fn short_error_message(e: &impl std::error::Error) -> String {
    let full = e.to_string();
    full.lines().next().unwrap_or(&full).to_string()
}

pub type Result<T> = std::result::Result<T, ExecutorError>;
