//! Lifecycle: start the change stream, wait for the cache, run workers, drain on cancellation.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use vigil_core::{Notification, ObjectWriter};
use vigil_queue::WorkQueue;
use vigil_store::{CacheHandle, SyncWait};

use crate::bridge::NotificationBridge;
use crate::error::ControllerError;
use crate::policy::Policy;
use crate::sync::Reconciler;
use crate::worker::run_worker;

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Queue name, used as a metrics label.
    pub name: String,
    pub workers: usize,
    /// Upper bound on waiting for the initial listing.
    pub sync_timeout: Duration,
    /// Upper bound on waiting for in-flight syncs after cancellation.
    pub shutdown_grace: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            name: "vigil".to_string(),
            workers: 2,
            sync_timeout: Duration::from_secs(60),
            shutdown_grace: Duration::from_secs(30),
        }
    }
}

pub struct Controller {
    config: ControllerConfig,
    cache: CacheHandle,
    notifications: mpsc::UnboundedReceiver<Notification>,
    queue: WorkQueue<String>,
    reconciler: Reconciler,
}

impl Controller {
    pub fn new(
        config: ControllerConfig,
        cache: CacheHandle,
        notifications: mpsc::UnboundedReceiver<Notification>,
        writer: Arc<dyn ObjectWriter>,
        policy: Arc<dyn Policy>,
    ) -> Self {
        let queue = WorkQueue::new(&config.name);
        Self::with_queue(config, cache, notifications, writer, policy, queue)
    }

    /// Like [`new`](Self::new) with a caller-built queue (custom rate limiting).
    pub fn with_queue(
        config: ControllerConfig,
        cache: CacheHandle,
        notifications: mpsc::UnboundedReceiver<Notification>,
        writer: Arc<dyn ObjectWriter>,
        policy: Arc<dyn Policy>,
        queue: WorkQueue<String>,
    ) -> Self {
        let reconciler = Reconciler::new(Arc::new(cache.clone()), writer, policy);
        Self { config, cache, notifications, queue, reconciler }
    }

    pub fn queue(&self) -> WorkQueue<String> { self.queue.clone() }

    /// Run until `cancel` fires.
    ///
    /// `source` is the change stream feeding the cache; it is stopped on cancellation. Fails only
    /// before the cache has synced (timeout, change stream ended, or cancellation), in which case
    /// no worker is started.
    pub async fn run<S>(self, source: S, cancel: CancellationToken) -> Result<(), ControllerError>
    where
        S: Future<Output = ()> + Send + 'static,
    {
        let Controller { config, cache, notifications, queue, reconciler } = self;
        info!(name = %config.name, workers = config.workers, "starting controller");

        let stop = cancel.child_token();
        let source_task = tokio::spawn({
            let stop = stop.clone();
            async move {
                tokio::select! {
                    _ = source => warn!("change stream ended"),
                    _ = stop.cancelled() => {}
                }
            }
        });
        let bridge_task = tokio::spawn(NotificationBridge::new(queue.clone()).run(notifications, stop.clone()));

        let failure = tokio::select! {
            waited = cache.wait_for_sync(config.sync_timeout) => match waited {
                SyncWait::Synced => None,
                SyncWait::TimedOut => Some(ControllerError::CacheSyncTimeout(config.sync_timeout)),
                SyncWait::Closed => Some(ControllerError::SourceEnded),
            },
            _ = cancel.cancelled() => Some(ControllerError::Cancelled),
        };
        if let Some(e) = failure {
            error!(error = %e, "cache failed to sync; not starting workers");
            queue.shutdown();
            stop.cancel();
            let _ = source_task.await;
            let _ = bridge_task.await;
            return Err(e);
        }
        info!(objects = cache.len(), "cache synced; starting workers");

        let mut workers = JoinSet::new();
        for id in 0..config.workers.max(1) {
            workers.spawn(run_worker(id, queue.clone(), reconciler.clone()));
        }

        cancel.cancelled().await;
        info!("shutdown requested; draining workers");
        stop.cancel();
        queue.shutdown();

        let drained = tokio::time::timeout(config.shutdown_grace, async {
            while let Some(res) = workers.join_next().await {
                if let Err(e) = res {
                    error!(error = %e, "worker task failed");
                }
            }
        })
        .await;
        if drained.is_err() {
            warn!(grace = ?config.shutdown_grace, remaining = workers.len(), "workers did not finish in time; aborting");
            workers.abort_all();
        }
        let _ = source_task.await;
        let _ = bridge_task.await;
        info!("controller stopped");
        Ok(())
    }
}
