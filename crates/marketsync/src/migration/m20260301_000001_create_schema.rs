//! Initial migration creating the engine's six tables.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        self.create_rate_limit_counters(manager).await?;
        self.create_remote_entity_mappings(manager).await?;
        self.create_event_queue(manager).await?;
        self.create_event_listeners(manager).await?;
        self.create_dispatch_history(manager).await?;
        self.create_api_call_logs(manager).await?;
        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(ApiCallLogs::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(DispatchHistory::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(EventListeners::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(EventQueue::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(RemoteEntityMappings::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(RateLimitCounters::Table).to_owned())
            .await?;
        Ok(())
    }
}

impl Migration {
    async fn create_rate_limit_counters(&self, manager: &SchemaManager<'_>) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(RateLimitCounters::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(RateLimitCounters::Key)
                            .string()
                            .not_null()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(RateLimitCounters::Count)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(RateLimitCounters::WindowStart)
                            .big_integer()
                            .not_null(),
                    )
                    .col(ColumnDef::new(RateLimitCounters::Limit).integer().not_null())
                    .col(
                        ColumnDef::new(RateLimitCounters::PeriodMs)
                            .big_integer()
                            .not_null(),
                    )
                    .col(ColumnDef::new(RateLimitCounters::Hits).json().not_null())
                    .col(
                        ColumnDef::new(RateLimitCounters::Revision)
                            .big_integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(RateLimitCounters::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await
    }

    async fn create_remote_entity_mappings(
        &self,
        manager: &SchemaManager<'_>,
    ) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(RemoteEntityMappings::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(RemoteEntityMappings::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(RemoteEntityMappings::Marketplace)
                            .string()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(RemoteEntityMappings::EntityKind)
                            .string()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(RemoteEntityMappings::LocalId)
                            .string()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(RemoteEntityMappings::NaturalKey)
                            .string()
                            .not_null(),
                    )
                    .col(ColumnDef::new(RemoteEntityMappings::RemoteId).string().null())
                    .col(ColumnDef::new(RemoteEntityMappings::TaskId).string().null())
                    .col(
                        ColumnDef::new(RemoteEntityMappings::SyncStatus)
                            .string()
                            .not_null()
                            .default("pending"),
                    )
                    .col(ColumnDef::new(RemoteEntityMappings::StateHash).string().null())
                    .col(ColumnDef::new(RemoteEntityMappings::LastState).json().null())
                    .col(
                        ColumnDef::new(RemoteEntityMappings::LastSyncAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(RemoteEntityMappings::ErrorMessage)
                            .text()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(RemoteEntityMappings::Attempts)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(RemoteEntityMappings::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(RemoteEntityMappings::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        // Natural key is unique per marketplace
        manager
            .create_index(
                Index::create()
                    .name("idx_mappings_marketplace_natural_key")
                    .table(RemoteEntityMappings::Table)
                    .col(RemoteEntityMappings::Marketplace)
                    .col(RemoteEntityMappings::NaturalKey)
                    .unique()
                    .to_owned(),
            )
            .await?;

        // One remote entity per local entity and marketplace
        manager
            .create_index(
                Index::create()
                    .name("idx_mappings_marketplace_kind_local_id")
                    .table(RemoteEntityMappings::Table)
                    .col(RemoteEntityMappings::Marketplace)
                    .col(RemoteEntityMappings::EntityKind)
                    .col(RemoteEntityMappings::LocalId)
                    .unique()
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_mappings_marketplace_status")
                    .table(RemoteEntityMappings::Table)
                    .col(RemoteEntityMappings::Marketplace)
                    .col(RemoteEntityMappings::SyncStatus)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn create_event_queue(&self, manager: &SchemaManager<'_>) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(EventQueue::Table)
                    .if_not_exists()
                    .col(ColumnDef::new(EventQueue::Id).uuid().not_null().primary_key())
                    .col(ColumnDef::new(EventQueue::Name).string().not_null())
                    .col(ColumnDef::new(EventQueue::Payload).json().not_null())
                    .col(
                        ColumnDef::new(EventQueue::Mode)
                            .string()
                            .not_null()
                            .default("async"),
                    )
                    .col(
                        ColumnDef::new(EventQueue::Priority)
                            .integer()
                            .not_null()
                            .default(1),
                    )
                    .col(
                        ColumnDef::new(EventQueue::Status)
                            .string()
                            .not_null()
                            .default("pending"),
                    )
                    .col(
                        ColumnDef::new(EventQueue::ScheduledAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(EventQueue::Attempts)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(EventQueue::MaxAttempts)
                            .integer()
                            .not_null()
                            .default(3),
                    )
                    .col(
                        ColumnDef::new(EventQueue::DeliveredTo)
                            .json()
                            .not_null()
                            .default(Expr::cust("'[]'")),
                    )
                    .col(ColumnDef::new(EventQueue::LastError).text().null())
                    .col(
                        ColumnDef::new(EventQueue::ClaimedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(EventQueue::CompletedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(EventQueue::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        // Claim scan: due envelopes by status and schedule
        manager
            .create_index(
                Index::create()
                    .name("idx_event_queue_status_scheduled")
                    .table(EventQueue::Table)
                    .col(EventQueue::Status)
                    .col(EventQueue::ScheduledAt)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_event_queue_priority_created")
                    .table(EventQueue::Table)
                    .col((EventQueue::Priority, IndexOrder::Desc))
                    .col(EventQueue::CreatedAt)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn create_event_listeners(&self, manager: &SchemaManager<'_>) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(EventListeners::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(EventListeners::Id)
                            .big_integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(EventListeners::EventName).string().not_null())
                    .col(ColumnDef::new(EventListeners::Handler).string().not_null())
                    .col(
                        ColumnDef::new(EventListeners::Priority)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(EventListeners::Active)
                            .boolean()
                            .not_null()
                            .default(true),
                    )
                    .col(
                        ColumnDef::new(EventListeners::Conditions)
                            .json()
                            .not_null()
                            .default(Expr::cust("'{}'")),
                    )
                    .col(
                        ColumnDef::new(EventListeners::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(EventListeners::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        // One registration per (event, handler)
        manager
            .create_index(
                Index::create()
                    .name("idx_event_listeners_event_handler")
                    .table(EventListeners::Table)
                    .col(EventListeners::EventName)
                    .col(EventListeners::Handler)
                    .unique()
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn create_dispatch_history(&self, manager: &SchemaManager<'_>) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(DispatchHistory::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(DispatchHistory::Id)
                            .big_integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(DispatchHistory::QueueId).uuid().null())
                    .col(ColumnDef::new(DispatchHistory::EventName).string().not_null())
                    .col(ColumnDef::new(DispatchHistory::Mode).string().not_null())
                    .col(ColumnDef::new(DispatchHistory::Payload).json().not_null())
                    .col(ColumnDef::new(DispatchHistory::Listeners).json().not_null())
                    .col(ColumnDef::new(DispatchHistory::Success).boolean().not_null())
                    .col(
                        ColumnDef::new(DispatchHistory::ExecutionTimeMs)
                            .big_integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(DispatchHistory::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_dispatch_history_created")
                    .table(DispatchHistory::Table)
                    .col(DispatchHistory::CreatedAt)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn create_api_call_logs(&self, manager: &SchemaManager<'_>) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(ApiCallLogs::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(ApiCallLogs::Id)
                            .big_integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(ApiCallLogs::Marketplace).string().not_null())
                    .col(ColumnDef::new(ApiCallLogs::TenantId).string().null())
                    .col(ColumnDef::new(ApiCallLogs::Endpoint).string().not_null())
                    .col(ColumnDef::new(ApiCallLogs::Method).string().not_null())
                    .col(ColumnDef::new(ApiCallLogs::Url).text().not_null())
                    .col(ColumnDef::new(ApiCallLogs::Request).json().not_null())
                    .col(ColumnDef::new(ApiCallLogs::Response).json().null())
                    .col(ColumnDef::new(ApiCallLogs::HttpStatus).integer().null())
                    .col(
                        ColumnDef::new(ApiCallLogs::LatencyMs)
                            .big_integer()
                            .not_null()
                            .default(0),
                    )
                    .col(ColumnDef::new(ApiCallLogs::Success).boolean().not_null())
                    .col(ColumnDef::new(ApiCallLogs::ErrorKind).string().null())
                    .col(ColumnDef::new(ApiCallLogs::Error).text().null())
                    .col(
                        ColumnDef::new(ApiCallLogs::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_api_call_logs_marketplace_created")
                    .table(ApiCallLogs::Table)
                    .col(ApiCallLogs::Marketplace)
                    .col(ApiCallLogs::CreatedAt)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }
}

#[derive(DeriveIden)]
#[sea_orm(iden = "rate_limit_counters")]
enum RateLimitCounters {
    Table,
    Key,
    Count,
    WindowStart,
    Limit,
    PeriodMs,
    Hits,
    Revision,
    UpdatedAt,
}

#[derive(DeriveIden)]
#[sea_orm(iden = "remote_entity_mappings")]
enum RemoteEntityMappings {
    Table,
    Id,
    Marketplace,
    EntityKind,
    LocalId,
    NaturalKey,
    RemoteId,
    TaskId,
    SyncStatus,
    StateHash,
    LastState,
    LastSyncAt,
    ErrorMessage,
    Attempts,
    CreatedAt,
    UpdatedAt,
}

#[derive(DeriveIden)]
#[sea_orm(iden = "event_queue")]
enum EventQueue {
    Table,
    Id,
    Name,
    Payload,
    Mode,
    Priority,
    Status,
    ScheduledAt,
    Attempts,
    MaxAttempts,
    DeliveredTo,
    LastError,
    ClaimedAt,
    CompletedAt,
    CreatedAt,
}

#[derive(DeriveIden)]
#[sea_orm(iden = "event_listeners")]
enum EventListeners {
    Table,
    Id,
    EventName,
    Handler,
    Priority,
    Active,
    Conditions,
    CreatedAt,
    UpdatedAt,
}

#[derive(DeriveIden)]
#[sea_orm(iden = "dispatch_history")]
enum DispatchHistory {
    Table,
    Id,
    QueueId,
    EventName,
    Mode,
    Payload,
    Listeners,
    Success,
    ExecutionTimeMs,
    CreatedAt,
}

#[derive(DeriveIden)]
#[sea_orm(iden = "api_call_logs")]
enum ApiCallLogs {
    Table,
    Id,
    Marketplace,
    TenantId,
    Endpoint,
    Method,
    Url,
    Request,
    Response,
    HttpStatus,
    LatencyMs,
    Success,
    ErrorKind,
    Error,
    CreatedAt,
}
