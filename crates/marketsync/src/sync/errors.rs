use sea_orm::DbErr;
use thiserror::Error;

use crate::events::EventError;
use crate::executor::ExecutorError;
use crate::reconcile::ReconcileError;

/// Errors that abort a whole sync run. Per-entity failures never do; they are
/// collected in the run's [`SyncResult`](super::SyncResult).
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("{0}")]
    Executor(#[from] ExecutorError),

    #[error("{0}")]
    Reconcile(#[from] ReconcileError),

    #[error("entity source error: {0}")]
    Source(String),

    #[error("event error: {0}")]
    Event(#[from] EventError),

    #[error("database error: {0}")]
    Database(#[from] DbErr),

    /// The worker task running the sync panicked or was aborted.
    #[error("sync task failed: {0}")]
    Task(String),
}

impl SyncError {
    pub fn source_error(message: impl Into<String>) -> Self {
        Self::Source(message.into())
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
