use std::time::Duration;

use thiserror::Error;

/// Errors raised by the rate limiter.
#[derive(Debug, Clone, Error)]
pub enum RateLimitError {
    /// No slot became free within the configured max wait.
    #[error("rate limited on {key}; next slot in {}ms", retry_after.as_millis())]
    RateLimited { key: String, retry_after: Duration },
}

impl RateLimitError {
    pub fn retry_after(&self) -> Duration {
        match self {
            RateLimitError::RateLimited { retry_after, .. } => *retry_after,
        }
    }
}

/// Errors raised by a counter store.
///
/// These never reach callers of the limiter, which fails open on them.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("counter store database error: {0}")]
    Database(#[from] sea_orm::DbErr),

    #[error("counter store contention on {0}")]
    Contention(String),
}
