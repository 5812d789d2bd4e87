//! SeaORM entity definitions for the marketsync database schema.

pub mod api_call_log;
pub mod dispatch_history;
pub mod entity_kind;
pub mod event_envelope;
pub mod event_listener;
pub mod event_status;
pub mod marketplace;
pub mod prelude;
pub mod rate_limit_counter;
pub mod remote_entity_mapping;
pub mod sync_status;
