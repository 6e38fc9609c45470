//! Worker loop: pull a key, sync it, settle the queue bookkeeping.

use std::time::Instant;

use metrics::{counter, histogram};
use tracing::{debug, error, warn};
use vigil_core::ObjectKey;
use vigil_queue::WorkQueue;

use crate::error::SyncOutcome;
use crate::sync::Reconciler;

/// What happened to one dequeued item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemOutcome {
    Synced(SyncOutcome),
    /// Transient failure; re-queued with backoff.
    Retrying,
    /// Permanent failure; dropped.
    Dropped,
    /// Key could not be split into an identity; dropped.
    Malformed,
}

impl ItemOutcome {
    fn as_str(&self) -> &'static str {
        match self {
            ItemOutcome::Synced(o) => o.as_str(),
            ItemOutcome::Retrying => "retrying",
            ItemOutcome::Dropped => "dropped",
            ItemOutcome::Malformed => "malformed",
        }
    }
}

async fn handle(queue: &WorkQueue<String>, reconciler: &Reconciler, item: &String) -> ItemOutcome {
    let key = match ObjectKey::parse(item) {
        Ok(k) => k,
        Err(e) => {
            error!(item = %item, error = %e, "dropping malformed work item");
            queue.forget(item);
            return ItemOutcome::Malformed;
        }
    };
    let started = Instant::now();
    let result = reconciler.sync(&key).await;
    histogram!("vigil_sync_duration_seconds", started.elapsed().as_secs_f64());
    match result {
        Ok(outcome) => {
            queue.forget(item);
            debug!(key = %key, outcome = outcome.as_str(), "synced");
            ItemOutcome::Synced(outcome)
        }
        Err(e) if e.is_transient() => {
            warn!(key = %key, error = %e, requeues = queue.num_requeues(item), "sync failed; retrying with backoff");
            queue.add_rate_limited(item.clone());
            ItemOutcome::Retrying
        }
        Err(e) => {
            error!(key = %key, error = %e, "sync failed permanently; dropping");
            queue.forget(item);
            ItemOutcome::Dropped
        }
    }
}

/// Process one item. `None` once the queue is shut down and drained.
pub async fn process_next(queue: &WorkQueue<String>, reconciler: &Reconciler) -> Option<ItemOutcome> {
    let item = queue.get().await?;
    let outcome = handle(queue, reconciler, &item).await;
    queue.done(&item);
    counter!("vigil_sync_total", 1u64, "outcome" => outcome.as_str());
    Some(outcome)
}

/// Tight pull loop; blocks only in `get`.
pub async fn run_worker(id: usize, queue: WorkQueue<String>, reconciler: Reconciler) {
    debug!(worker = id, "worker started");
    while process_next(&queue, &reconciler).await.is_some() {}
    debug!(worker = id, "worker terminating");
}
