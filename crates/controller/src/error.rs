use std::time::Duration;

use vigil_core::WriteError;

/// Successful end states of one sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Already converged, or nothing to reconcile (object gone). No write was issued.
    Unchanged,
    /// One corrective write was accepted.
    Corrected,
}

impl SyncOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncOutcome::Unchanged => "unchanged",
            SyncOutcome::Corrected => "corrected",
        }
    }
}

/// Failed syncs, split by whether retrying can help.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SyncError {
    /// Conflict, throttling or network trouble. Retried with backoff.
    #[error("transient: {0}")]
    Transient(#[source] WriteError),
    /// The object vanished server-side or the write can never be accepted. Not retried.
    #[error("permanent: {0}")]
    Permanent(#[source] WriteError),
}

impl SyncError {
    pub fn is_transient(&self) -> bool { matches!(self, SyncError::Transient(_)) }
}

impl From<WriteError> for SyncError {
    fn from(e: WriteError) -> Self {
        match e {
            WriteError::Conflict(_) | WriteError::Transient(_) => SyncError::Transient(e),
            WriteError::NotFound(_) | WriteError::Invalid(_) => SyncError::Permanent(e),
        }
    }
}

/// Fatal controller failures. Only startup can fail; per-item errors stay inside the workers.
#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    #[error("cache did not sync within {0:?}; refusing to reconcile against a stale cache")]
    CacheSyncTimeout(Duration),
    #[error("change stream ended before the cache synced")]
    SourceEnded,
    #[error("cancelled before the cache synced")]
    Cancelled,
}
