//! Common re-exports for convenient entity usage.

pub use super::api_call_log::{
    ActiveModel as ApiCallLogActiveModel, Column as ApiCallLogColumn, Entity as ApiCallLog,
    Model as ApiCallLogModel,
};
pub use super::dispatch_history::{
    ActiveModel as DispatchHistoryActiveModel, Column as DispatchHistoryColumn,
    Entity as DispatchHistory, Model as DispatchHistoryModel,
};
pub use super::entity_kind::EntityKind;
pub use super::event_envelope::{
    ActiveModel as EventEnvelopeActiveModel, Column as EventEnvelopeColumn,
    Entity as EventEnvelope, Model as EventEnvelopeModel,
};
pub use super::event_listener::{
    ActiveModel as EventListenerActiveModel, Column as EventListenerColumn,
    Entity as EventListener, Model as EventListenerModel,
};
pub use super::event_status::{DispatchMode, EventPriority, EventStatus};
pub use super::marketplace::Marketplace;
pub use super::rate_limit_counter::{
    ActiveModel as RateLimitCounterActiveModel, Column as RateLimitCounterColumn,
    Entity as RateLimitCounter, Model as RateLimitCounterModel,
};
pub use super::remote_entity_mapping::{
    ActiveModel as RemoteEntityMappingActiveModel, Column as RemoteEntityMappingColumn,
    Entity as RemoteEntityMapping, Model as RemoteEntityMappingModel,
};
pub use super::sync_status::SyncStatus;
