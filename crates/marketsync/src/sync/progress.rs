//! Progress reporting for sync runs.
//!
//! The orchestrator reports what it is doing through an optional callback so
//! that a host (the CLI's progress bars, a job runner) can render it without
//! the engine knowing how.

use std::time::Duration;

use crate::entity::entity_kind::EntityKind;
use crate::entity::marketplace::Marketplace;

/// Progress events emitted during a sync run.
#[derive(Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum SyncProgress {
    /// A run started.
    Started {
        marketplace: Marketplace,
        kind: EntityKind,
        requested: usize,
    },

    /// Open marketplace tasks were polled before writing.
    TasksPolled {
        marketplace: Marketplace,
        synced: usize,
        failed: usize,
        still_pending: usize,
    },

    /// A batch is about to be reconciled.
    Batch {
        marketplace: Marketplace,
        index: usize,
        size: usize,
    },

    /// Retryable failures are being retried after a backoff.
    Retrying {
        marketplace: Marketplace,
        items: usize,
        attempt: usize,
        delay: Duration,
    },

    /// One entity reached a final outcome for this run.
    EntityDone {
        marketplace: Marketplace,
        local_id: String,
        success: bool,
    },

    /// The run was cancelled between batches.
    Cancelled {
        marketplace: Marketplace,
        skipped: usize,
    },

    /// A run finished.
    Finished {
        marketplace: Marketplace,
        kind: EntityKind,
        synced: usize,
        errors: usize,
    },
}

/// Callback for progress updates during sync runs.
pub type ProgressCallback = Box<dyn Fn(SyncProgress) + Send + Sync>;

/// Emit a progress event if a callback is provided.
#[inline]
pub fn emit(on_progress: Option<&ProgressCallback>, event: SyncProgress) {
    if let Some(cb) = on_progress {
        cb(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_emit_with_callback() {
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = Arc::clone(&count);

        let callback: ProgressCallback = Box::new(move |_event| {
            count_clone.fetch_add(1, Ordering::SeqCst);
        });

        emit(
            Some(&callback),
            SyncProgress::Batch {
                marketplace: Marketplace::Ozon,
                index: 0,
                size: 10,
            },
        );
        emit(
            Some(&callback),
            SyncProgress::Cancelled {
                marketplace: Marketplace::Ozon,
                skipped: 3,
            },
        );

        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_emit_without_callback() {
        emit(
            None,
            SyncProgress::Finished {
                marketplace: Marketplace::N11,
                kind: EntityKind::Product,
                synced: 1,
                errors: 0,
            },
        );
    }
}
