//! Sync orchestrator: drives entity batches through the reconciler.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde_json::{Value, json};
use tokio::sync::Semaphore;

use super::errors::{Result, SyncError};
use super::health::{self, HealthReport, HealthThresholds};
use super::progress::{ProgressCallback, SyncProgress, emit};
use super::retry::RetryConfig;
use super::source::EntitySource;
use super::types::{
    EntityError, MarketplaceSyncResult, SYNC_COMPLETED_EVENT, SyncOptions, SyncRequest,
    SyncResult, sync_failed_event, synced_event,
};
use crate::entity::entity_kind::EntityKind;
use crate::events::{EventBus, TriggerOptions};
use crate::executor::{AuthContext, ExecutorError};
use crate::reconcile::{
    BatchItemResult, DesiredEntity, PollReport, ReconcileError, Reconciler, UpsertOutcome,
};

/// Runs sync jobs and reports their outcome on the event bus.
pub struct Orchestrator {
    reconciler: Arc<Reconciler>,
    events: Arc<EventBus>,
    source: Arc<dyn EntitySource>,
    options: SyncOptions,
}

impl Orchestrator {
    pub fn new(
        reconciler: Arc<Reconciler>,
        events: Arc<EventBus>,
        source: Arc<dyn EntitySource>,
        options: SyncOptions,
    ) -> Self {
        Self {
            reconciler,
            events,
            source,
            options,
        }
    }

    pub fn reconciler(&self) -> &Arc<Reconciler> {
        &self.reconciler
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    /// Sync the requested entities to one marketplace.
    ///
    /// Entities are reconciled in batches of the marketplace batch limit.
    /// Transient failures are retried with exponential backoff up to the
    /// marketplace's `max_retries`. Rejected credentials end the run with an
    /// error after the failing batch; every other failure is recorded and the
    /// run continues. `cancel` is checked between batches.
    #[tracing::instrument(skip_all, fields(marketplace = %request.ctx, kind = %request.kind))]
    pub async fn sync(
        &self,
        request: &SyncRequest,
        cancel: &AtomicBool,
        on_progress: Option<&ProgressCallback>,
    ) -> Result<SyncResult> {
        let ctx = &request.ctx;
        let kind = request.kind;
        let marketplace = ctx.marketplace;
        let config = self.reconciler.executor().marketplace_config(ctx)?;

        let mut result = SyncResult {
            requested: request.ids.len(),
            ..Default::default()
        };
        emit(
            on_progress,
            SyncProgress::Started {
                marketplace,
                kind,
                requested: request.ids.len(),
            },
        );
        tracing::info!(requested = request.ids.len(), "Starting sync run");

        // Earlier asynchronous submissions first, so their mappings are
        // settled before deciding what to write.
        match self.reconciler.poll_pending(ctx, kind).await {
            Ok(report) => {
                self.report_polled(ctx, kind, &report, &mut result).await;
                emit(
                    on_progress,
                    SyncProgress::TasksPolled {
                        marketplace,
                        synced: report.synced,
                        failed: report.failed,
                        still_pending: report.still_pending,
                    },
                );
            }
            Err(e) => tracing::warn!("Could not poll pending tasks: {}", e),
        }

        let entities = self
            .source
            .load(marketplace, kind, &request.ids)
            .await?;
        for id in &request.ids {
            if !entities.iter().any(|e| &e.local_id == id) {
                let error = EntityError {
                    local_id: id.clone(),
                    natural_key: None,
                    kind: "not_found".to_string(),
                    message: format!("{} {} not found in entity source", kind, id),
                    retries: 0,
                };
                self.report_failure(ctx, kind, &error).await;
                result.errors.push(error);
            }
        }

        let retry = RetryConfig::for_marketplace(&config);
        let batch_size = config.batch_limit.max(1);
        let mut processed = 0;
        for (index, batch) in entities.chunks(batch_size).enumerate() {
            if cancel.load(Ordering::SeqCst) {
                result.cancelled = true;
                result.skipped = entities.len() - processed;
                tracing::info!(skipped = result.skipped, "Sync run cancelled");
                emit(
                    on_progress,
                    SyncProgress::Cancelled {
                        marketplace,
                        skipped: result.skipped,
                    },
                );
                break;
            }
            emit(
                on_progress,
                SyncProgress::Batch {
                    marketplace,
                    index,
                    size: batch.len(),
                },
            );

            let items = self
                .reconcile_batch(ctx, kind, batch, retry.clone(), cancel, on_progress)
                .await?;
            let auth_failure = items.iter().find_map(|(item, _)| auth_error(&item.result));
            for (item, retries) in items {
                self.record_item(ctx, kind, item, retries, &mut result, on_progress)
                    .await;
            }
            processed += batch.len();

            // Rejected credentials fail every later call the same way.
            if let Some(error) = auth_failure {
                result.skipped = entities.len() - processed;
                tracing::error!(
                    skipped = result.skipped,
                    errors = result.error_count(),
                    "Credentials rejected, aborting sync run: {}",
                    error
                );
                emit(
                    on_progress,
                    SyncProgress::Finished {
                        marketplace,
                        kind,
                        synced: result.synced_count(),
                        errors: result.error_count(),
                    },
                );
                return Err(SyncError::Executor(error));
            }
        }

        tracing::info!(
            synced = result.synced,
            unchanged = result.unchanged,
            pending = result.pending,
            errors = result.error_count(),
            cancelled = result.cancelled,
            "Sync run finished"
        );
        emit(
            on_progress,
            SyncProgress::Finished {
                marketplace,
                kind,
                synced: result.synced_count(),
                errors: result.error_count(),
            },
        );
        let summary = json!({
            "marketplace": marketplace,
            "tenant_id": ctx.tenant_id,
            "kind": kind,
            "result": result,
        });
        self.emit_event(SYNC_COMPLETED_EVENT, summary).await;
        Ok(result)
    }

    /// Reconcile one batch, retrying retryable failures.
    ///
    /// Returns each item's final result with the number of retries it took.
    async fn reconcile_batch(
        &self,
        ctx: &AuthContext,
        kind: EntityKind,
        batch: &[DesiredEntity],
        retry: RetryConfig,
        cancel: &AtomicBool,
        on_progress: Option<&ProgressCallback>,
    ) -> Result<Vec<(BatchItemResult, usize)>> {
        let mut delays = retry.delays();
        let mut finished = Vec::with_capacity(batch.len());
        let mut pending: Vec<DesiredEntity> = batch.to_vec();
        let mut attempt = 0;

        loop {
            let results = self.reconciler.upsert_batch(ctx, kind, &pending).await?;
            let mut again = Vec::new();
            let mut wait = Duration::ZERO;
            for (entity, item) in pending.iter().zip(results) {
                let retryable = item
                    .result
                    .as_ref()
                    .err()
                    .filter(|e| e.is_retryable())
                    .map(retry_after);
                match retryable {
                    Some(after) => {
                        wait = wait.max(after);
                        again.push((entity.clone(), item));
                    }
                    None => finished.push((item, attempt)),
                }
            }

            if again.is_empty() {
                break;
            }
            let delay = match delays.next() {
                Some(delay) if !cancel.load(Ordering::SeqCst) => delay.max(wait),
                _ => {
                    finished.extend(again.into_iter().map(|(_, item)| (item, attempt)));
                    break;
                }
            };

            attempt += 1;
            tracing::warn!(
                items = again.len(),
                attempt,
                delay_ms = delay.as_millis() as u64,
                "Retrying transient failures"
            );
            emit(
                on_progress,
                SyncProgress::Retrying {
                    marketplace: ctx.marketplace,
                    items: again.len(),
                    attempt,
                    delay,
                },
            );
            tokio::time::sleep(delay).await;
            pending = again.into_iter().map(|(entity, _)| entity).collect();
        }
        Ok(finished)
    }

    async fn record_item(
        &self,
        ctx: &AuthContext,
        kind: EntityKind,
        item: BatchItemResult,
        retries: usize,
        result: &mut SyncResult,
        on_progress: Option<&ProgressCallback>,
    ) {
        let success = item.result.is_ok();
        match item.result {
            Ok(outcome) => {
                let label = match &outcome {
                    UpsertOutcome::Created { .. } => "created",
                    UpsertOutcome::Updated { .. } => "updated",
                    UpsertOutcome::Unchanged { .. } => "unchanged",
                    UpsertOutcome::Submitted { .. } | UpsertOutcome::StillPending { .. } => {
                        "pending"
                    }
                };
                match &outcome {
                    UpsertOutcome::Created { .. } | UpsertOutcome::Updated { .. } => {
                        result.synced += 1
                    }
                    UpsertOutcome::Unchanged { .. } => result.unchanged += 1,
                    UpsertOutcome::Submitted { .. } | UpsertOutcome::StillPending { .. } => {
                        result.pending += 1
                    }
                }
                // Submitted entities are announced once their task resolves.
                if outcome.is_synced() {
                    let payload = entity_payload(
                        ctx,
                        kind,
                        &item.local_id,
                        Some(&item.natural_key),
                        json!({
                            "remote_id": outcome.remote_id(),
                            "outcome": label,
                        }),
                    );
                    self.emit_event(&synced_event(kind), payload).await;
                }
            }
            Err(e) => {
                let error = EntityError {
                    local_id: item.local_id.clone(),
                    natural_key: Some(item.natural_key.clone()),
                    kind: e.kind().to_string(),
                    message: e.to_string(),
                    retries,
                };
                self.report_failure(ctx, kind, &error).await;
                result.errors.push(error);
            }
        }
        emit(
            on_progress,
            SyncProgress::EntityDone {
                marketplace: ctx.marketplace,
                local_id: item.local_id,
                success,
            },
        );
    }

    async fn report_polled(
        &self,
        ctx: &AuthContext,
        kind: EntityKind,
        report: &PollReport,
        result: &mut SyncResult,
    ) {
        result.tasks_synced += report.synced;
        result.tasks_failed += report.failed;
        for item in &report.resolved {
            match &item.error {
                None => {
                    let payload = entity_payload(
                        ctx,
                        kind,
                        &item.local_id,
                        Some(&item.natural_key),
                        json!({"remote_id": item.remote_id, "outcome": "task_completed"}),
                    );
                    self.emit_event(&synced_event(kind), payload).await;
                }
                Some(message) => {
                    let payload = entity_payload(
                        ctx,
                        kind,
                        &item.local_id,
                        Some(&item.natural_key),
                        json!({"error_kind": "task_failed", "error": message}),
                    );
                    self.emit_event(&sync_failed_event(kind), payload).await;
                }
            }
        }
    }

    async fn report_failure(&self, ctx: &AuthContext, kind: EntityKind, error: &EntityError) {
        tracing::debug!(local_id = %error.local_id, kind = %error.kind, "Entity failed: {}", error.message);
        let payload = entity_payload(
            ctx,
            kind,
            &error.local_id,
            error.natural_key.as_deref(),
            json!({
                "error_kind": error.kind,
                "error": error.message,
                "retries": error.retries,
            }),
        );
        self.emit_event(&sync_failed_event(kind), payload).await;
    }

    /// Event delivery problems never fail a sync run.
    async fn emit_event(&self, name: &str, payload: Value) {
        let options = TriggerOptions::default().with_mode(self.options.event_mode);
        if let Err(e) = self.events.trigger(name, payload, options).await {
            tracing::warn!(event = %name, "Failed to emit event: {}", e);
        }
    }

    /// Run several marketplace jobs concurrently, at most
    /// `options.concurrency` at a time. Results are in request order.
    pub async fn sync_many(
        self: &Arc<Self>,
        requests: Vec<SyncRequest>,
        cancel: Arc<AtomicBool>,
    ) -> Vec<MarketplaceSyncResult> {
        if requests.is_empty() {
            return Vec::new();
        }

        let semaphore = Arc::new(Semaphore::new(self.options.concurrency.max(1)));
        let mut handles = Vec::with_capacity(requests.len());
        for request in requests {
            let orchestrator = Arc::clone(self);
            let semaphore = Arc::clone(&semaphore);
            let cancel = Arc::clone(&cancel);
            let task_request = request.clone();
            let handle = tokio::spawn(async move {
                let _permit = match semaphore.acquire().await {
                    Ok(permit) => permit,
                    Err(_) => {
                        return Err(SyncError::Task("semaphore closed unexpectedly".to_string()));
                    }
                };
                orchestrator.sync(&task_request, &cancel, None).await
            });
            handles.push((request, handle));
        }

        let mut results = Vec::with_capacity(handles.len());
        for (request, handle) in handles {
            let result = match handle.await {
                Ok(result) => result,
                Err(e) => Err(SyncError::Task(e.to_string())),
            };
            if let Err(e) = &result {
                tracing::warn!(marketplace = %request.ctx, kind = %request.kind, "Sync run failed: {}", e);
            }
            results.push(MarketplaceSyncResult { request, result });
        }
        results
    }

    /// Health of one marketplace integration.
    pub async fn get_health(&self, ctx: &AuthContext) -> Result<HealthReport> {
        health::check(
            self.reconciler.executor(),
            &self.events,
            ctx,
            &HealthThresholds::default(),
        )
        .await
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

fn auth_error(result: &std::result::Result<UpsertOutcome, ReconcileError>) -> Option<ExecutorError> {
    match result {
        Err(ReconcileError::Executor(error @ ExecutorError::Auth { .. })) => Some(error.clone()),
        _ => None,
    }
}

fn retry_after(error: &ReconcileError) -> Duration {
    match error {
        ReconcileError::Executor(ExecutorError::RateLimited { retry_after }) => *retry_after,
        _ => Duration::ZERO,
    }
}

fn entity_payload(
    ctx: &AuthContext,
    kind: EntityKind,
    local_id: &str,
    natural_key: Option<&str>,
    extra: Value,
) -> Value {
    let mut payload = json!({
        "marketplace": ctx.marketplace,
        "tenant_id": ctx.tenant_id,
        "kind": kind,
        "local_id": local_id,
        "natural_key": natural_key,
    });
    if let (Some(payload), Value::Object(extra)) = (payload.as_object_mut(), extra) {
        payload.extend(extra);
    }
    payload
}
