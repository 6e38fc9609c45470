//! The sync function: one idempotent reconciliation step for one object.

use std::sync::Arc;

use metrics::counter;
use tracing::{debug, info};
use vigil_core::{ObjectCache, ObjectKey, ObjectWriter};

use crate::error::{SyncError, SyncOutcome};
use crate::policy::Policy;

/// Reads current state from the cache and issues at most one corrective write.
///
/// The triggering event is never consulted, only the cached level, so duplicate, stale or lost
/// notifications all end in the same place.
#[derive(Clone)]
pub struct Reconciler {
    cache: Arc<dyn ObjectCache>,
    writer: Arc<dyn ObjectWriter>,
    policy: Arc<dyn Policy>,
}

impl Reconciler {
    pub fn new(cache: Arc<dyn ObjectCache>, writer: Arc<dyn ObjectWriter>, policy: Arc<dyn Policy>) -> Self {
        Self { cache, writer, policy }
    }

    pub async fn sync(&self, key: &ObjectKey) -> Result<SyncOutcome, SyncError> {
        let Some(current) = self.cache.get(key) else {
            debug!(key = %key, "object not in cache; nothing to reconcile");
            return Ok(SyncOutcome::Unchanged);
        };
        let Some(correction) = self.policy.plan(&current) else {
            return Ok(SyncOutcome::Unchanged);
        };
        // Written against the cached resourceVersion: if the object moved on, this is a conflict.
        let desired = correction.apply(&current);
        match self.writer.update(&desired).await {
            Ok(stored) => {
                counter!("vigil_corrections_total", 1u64);
                info!(key = %key, correction = %correction, rv = ?stored.resource_version, "object corrected");
                Ok(SyncOutcome::Corrected)
            }
            Err(e) => Err(SyncError::from(e)),
        }
    }
}
