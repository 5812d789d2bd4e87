use marketsync::sync::SyncProgress;

/// Logging reporter using tracing for structured output.
pub struct LoggingReporter;

impl LoggingReporter {
    pub fn handle(&self, event: SyncProgress) {
        match event {
            SyncProgress::Started {
                marketplace,
                kind,
                requested,
            } => {
                tracing::info!(marketplace = %marketplace, kind = %kind, requested, "Sync started");
            }

            SyncProgress::TasksPolled {
                marketplace,
                synced,
                failed,
                still_pending,
            } => {
                tracing::info!(marketplace = %marketplace, synced, failed, still_pending, "Polled open marketplace tasks");
            }

            SyncProgress::Batch {
                marketplace,
                index,
                size,
            } => {
                tracing::debug!(marketplace = %marketplace, batch = index, size, "Reconciling batch");
            }

            SyncProgress::Retrying {
                marketplace,
                items,
                attempt,
                delay,
            } => {
                tracing::warn!(
                    marketplace = %marketplace,
                    items,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "Retrying transient failures"
                );
            }

            SyncProgress::EntityDone {
                marketplace,
                local_id,
                success,
            } => {
                if success {
                    tracing::debug!(marketplace = %marketplace, local_id = %local_id, "Entity synced");
                } else {
                    tracing::debug!(marketplace = %marketplace, local_id = %local_id, "Entity failed");
                }
            }

            SyncProgress::Cancelled {
                marketplace,
                skipped,
            } => {
                tracing::warn!(marketplace = %marketplace, skipped, "Sync cancelled");
            }

            SyncProgress::Finished {
                marketplace,
                kind,
                synced,
                errors,
            } => {
                tracing::info!(marketplace = %marketplace, kind = %kind, synced, errors, "Sync finished");
            }

            _ => {}
        }
    }
}
