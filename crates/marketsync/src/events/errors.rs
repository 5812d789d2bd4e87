use thiserror::Error;
use uuid::Uuid;

use crate::entity::event_status::EventStatus;

/// Errors raised by the event bus.
#[derive(Debug, Error)]
pub enum EventError {
    #[error("database error: {0}")]
    Database(#[from] sea_orm::DbErr),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("queued event {0} not found")]
    NotFound(Uuid),

    #[error("queued event {id} is {status}; only failed events can be replayed")]
    NotReplayable { id: Uuid, status: EventStatus },

    /// `attempts >= max_attempts`: the envelope is terminally failed and only
    /// a manual replay will deliver it again.
    #[error("queued event {id} ({name}) exhausted after {attempts} attempts: {last_error}")]
    QueueExhausted {
        id: Uuid,
        name: String,
        attempts: i32,
        last_error: String,
    },

    #[error("invalid listener pattern '{0}'")]
    InvalidPattern(String),
}

pub type Result<T> = std::result::Result<T, EventError>;

/// Failure reported by a single listener.
///
/// Listener failures are isolated: they are recorded per listener and never
/// stop sibling listeners from running.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ListenerError {
    #[error("{0}")]
    Failed(String),

    #[error("no handler registered as '{0}'")]
    MissingHandler(String),

    #[error("handler panicked: {0}")]
    Panicked(String),
}

impl ListenerError {
    pub fn failed(message: impl Into<String>) -> Self {
        ListenerError::Failed(message.into())
    }
}
