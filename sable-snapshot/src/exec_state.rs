//! Shared execution context between a snapshot producer and its driver.

use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};

use thiserror::Error;

use sable_common::ids::Lsn;

/// Failures a snapshot run can report.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SnapshotError {
    /// Pushing a chunk to the consumer failed.
    #[error("snapshot i/o failed: {0}")]
    Io(String),

    /// Incremental sync could not be served because the journal dropped the requested entry.
    #[error("partial sync failed: entry #{requested} was dropped from the buffer, current lsn={current}")]
    PartialSyncDropped {
        /// First LSN the consumer asked for.
        requested: Lsn,
        /// Journal head at the time of the check.
        current: Lsn,
    },

    /// The journal required for streaming mode is not attached.
    #[error("journal is not attached to the slice")]
    JournalMissing,
}

/// Cancellation flag plus error slot shared with the snapshot driver.
///
/// An error stops the producer at its next check; the consumer is then finalized with the
/// cancel flag set.
#[derive(Debug, Clone, Default)]
pub struct ExecutionState {
    cancelled: Arc<AtomicBool>,
    error: Arc<Mutex<Option<SnapshotError>>>,
}

impl ExecutionState {
    /// Creates a running state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the producer may continue.
    #[must_use]
    pub fn is_running(&self) -> bool {
        !self.cancelled.load(Ordering::Acquire)
    }

    /// Requests the producer to stop at its next check.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    /// Records an error and cancels the run. The first error wins.
    pub fn report_error(&self, error: SnapshotError) {
        tracing::error!(%error, "snapshot run failed");
        let mut slot = self
            .error
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if slot.is_none() {
            *slot = Some(error);
        }
        drop(slot);
        self.cancel();
    }

    /// The recorded error, when one was reported.
    #[must_use]
    pub fn error(&self) -> Option<SnapshotError> {
        self.error
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }
}
