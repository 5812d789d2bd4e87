use sea_orm::DbErr;
use thiserror::Error;

use crate::executor::ExecutorError;

/// Errors from reconciling one entity.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// The call itself failed; see the executor taxonomy.
    #[error(transparent)]
    Executor(#[from] ExecutorError),

    /// The marketplace accepted the call but rejected this item.
    #[error("{natural_key} rejected by marketplace: {message}")]
    Rejected {
        natural_key: String,
        message: String,
    },

    /// An asynchronous marketplace task finished unsuccessfully.
    #[error("remote task {task_id} failed: {message}")]
    TaskFailed { task_id: String, message: String },

    /// The same natural key appeared twice in one batch.
    #[error("duplicate natural key {0} in batch")]
    DuplicateKey(String),

    #[error("adapter error: {0}")]
    Adapter(String),

    #[error("database error: {0}")]
    Database(#[from] DbErr),
}

impl ReconcileError {
    /// Worth retrying after a backoff. Business rejections never are.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Executor(e) => e.is_retryable(),
            _ => false,
        }
    }

    /// Stable identifier for reports.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Executor(e) => e.kind(),
            Self::Rejected { .. } => "rejected",
            Self::TaskFailed { .. } => "task_failed",
            Self::DuplicateKey(_) => "duplicate_key",
            Self::Adapter(_) => "adapter",
            Self::Database(_) => "database",
        }
    }
}

pub type Result<T> = std::result::Result<T, ReconcileError>;
