//! Vigil store: the mirrored cache.
//!
//! A single ingest task applies deltas from the change stream to an identity-keyed map, publishes
//! an immutable snapshot, and only then emits change notifications for the batch, so any key a
//! subscriber is told about can already be read back from the cache.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use metrics::{counter, gauge};
use rustc_hash::FxHashMap;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};
use vigil_core::{CachedObject, Delta, Notification, ObjectCache, ObjectKey};

/// Immutable view of the cache at one epoch.
#[derive(Debug, Default)]
pub struct Snapshot {
    pub epoch: u64,
    pub objects: FxHashMap<ObjectKey, Arc<CachedObject>>,
}

/// How a bounded wait for the initial listing ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncWait {
    Synced,
    TimedOut,
    /// The change stream ended first; the cache can no longer sync.
    Closed,
}

impl SyncWait {
    pub fn is_synced(self) -> bool { self == SyncWait::Synced }
}

/// Applies deltas to the cache contents and reports what changed.
#[derive(Default)]
pub struct CacheBuilder {
    epoch: u64,
    synced: bool,
    objects: FxHashMap<ObjectKey, Arc<CachedObject>>,
}

impl CacheBuilder {
    pub fn new() -> Self { Self::default() }

    pub fn len(&self) -> usize { self.objects.len() }
    pub fn is_empty(&self) -> bool { self.objects.is_empty() }
    pub fn epoch(&self) -> u64 { self.epoch }
    /// True once a full listing (`Delta::Replaced`) has been applied.
    pub fn synced(&self) -> bool { self.synced }

    fn upsert(&mut self, obj: CachedObject, out: &mut Vec<Notification>) {
        let new = Arc::new(obj);
        match self.objects.insert(new.key(), Arc::clone(&new)) {
            Some(old) => out.push(Notification::Updated { old, new }),
            None => out.push(Notification::Added(new)),
        }
    }

    /// Apply a batch and return the notifications it produces, in order.
    pub fn apply(&mut self, batch: Vec<Delta>) -> Vec<Notification> {
        let mut out = Vec::with_capacity(batch.len());
        for d in batch {
            match d {
                Delta::Applied(obj) => self.upsert(obj, &mut out),
                Delta::Deleted(obj) => {
                    // Deletes for unknown objects are still reported; the consumer re-reads state anyway.
                    let gone = self.objects.remove(&obj.key()).unwrap_or_else(|| Arc::new(obj));
                    out.push(Notification::Deleted(gone));
                }
                Delta::Replaced(list) => {
                    let mut previous = std::mem::take(&mut self.objects);
                    for obj in list {
                        let new = Arc::new(obj);
                        let key = new.key();
                        match previous.remove(&key) {
                            Some(old) => out.push(Notification::Updated { old, new: Arc::clone(&new) }),
                            None => out.push(Notification::Added(Arc::clone(&new))),
                        }
                        self.objects.insert(key, new);
                    }
                    // Whatever the relist no longer contains was deleted while we were not watching.
                    let mut stale: Vec<_> = previous.into_values().collect();
                    stale.sort_by(|a, b| a.key().cmp(&b.key()));
                    out.extend(stale.into_iter().map(Notification::Deleted));
                    self.synced = true;
                }
            }
        }
        self.epoch = self.epoch.saturating_add(1);
        out
    }

    /// Re-deliver every cached object as an update to itself.
    pub fn resync(&self) -> Vec<Notification> {
        let mut all: Vec<_> = self.objects.values().cloned().collect();
        all.sort_by(|a, b| a.key().cmp(&b.key()));
        all.into_iter().map(|o| Notification::Updated { old: Arc::clone(&o), new: o }).collect()
    }

    pub fn freeze(&self) -> Arc<Snapshot> {
        Arc::new(Snapshot { epoch: self.epoch, objects: self.objects.clone() })
    }
}

/// Read handle to the cache. Cheap to clone.
#[derive(Clone)]
pub struct CacheHandle {
    snap: Arc<ArcSwap<Snapshot>>,
    epoch_rx: watch::Receiver<u64>,
    synced_rx: watch::Receiver<bool>,
}

impl CacheHandle {
    pub fn current(&self) -> Arc<Snapshot> { self.snap.load_full() }
    pub fn subscribe_epoch(&self) -> watch::Receiver<u64> { self.epoch_rx.clone() }

    /// All cached objects ordered by identity.
    pub fn list(&self) -> Vec<Arc<CachedObject>> {
        let snap = self.snap.load();
        let mut all: Vec<_> = snap.objects.values().cloned().collect();
        all.sort_by(|a, b| a.key().cmp(&b.key()));
        all
    }

    pub fn len(&self) -> usize { self.snap.load().objects.len() }
    pub fn is_empty(&self) -> bool { self.len() == 0 }

    /// Wait up to `timeout` for the initial listing.
    pub async fn wait_for_sync(&self, timeout: Duration) -> SyncWait {
        let mut rx = self.synced_rx.clone();
        let res = tokio::time::timeout(timeout, async { rx.wait_for(|synced| *synced).await.map(|_| ()) }).await;
        match res {
            Ok(Ok(())) => SyncWait::Synced,
            // Sender dropped: the ingest loop stopped before the initial listing arrived.
            Ok(Err(_)) => SyncWait::Closed,
            Err(_) => SyncWait::TimedOut,
        }
    }
}

impl ObjectCache for CacheHandle {
    fn get(&self, key: &ObjectKey) -> Option<Arc<CachedObject>> { self.snap.load().objects.get(key).cloned() }
    fn is_synced(&self) -> bool { *self.synced_rx.borrow() }
}

fn deliver(notify_tx: &mpsc::UnboundedSender<Notification>, notes: Vec<Notification>) {
    for n in notes {
        // Receiver gone means nobody is reconciling any more; keep the cache itself running.
        let _ = notify_tx.send(n);
    }
}

/// Spawn the ingest loop. Returns the delta sender for the change stream, a read handle, and the
/// notification stream. `resync` re-delivers every object periodically once synced.
pub fn spawn_ingest(
    cap: usize,
    resync: Option<Duration>,
) -> (mpsc::Sender<Delta>, CacheHandle, mpsc::UnboundedReceiver<Notification>) {
    let cap = cap.max(1);
    let (tx, mut rx) = mpsc::channel::<Delta>(cap);
    let (notify_tx, notify_rx) = mpsc::unbounded_channel();
    let snap = Arc::new(ArcSwap::from_pointee(Snapshot::default()));
    let (epoch_tx, epoch_rx) = watch::channel(0u64);
    let (synced_tx, synced_rx) = watch::channel(false);
    let snap_clone = Arc::clone(&snap);

    tokio::spawn(async move {
        let mut builder = CacheBuilder::new();
        let mut ticker = resync.filter(|p| !p.is_zero()).map(|p| {
            let mut t = tokio::time::interval_at(tokio::time::Instant::now() + p, p);
            t.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            t
        });
        loop {
            tokio::select! {
                maybe = rx.recv() => {
                    let Some(first) = maybe else {
                        debug!("delta channel closed; exiting ingest loop");
                        break;
                    };
                    let mut batch = vec![first];
                    while batch.len() < cap {
                        match rx.try_recv() {
                            Ok(d) => batch.push(d),
                            Err(_) => break,
                        }
                    }
                    counter!("vigil_cache_deltas_total", batch.len() as u64);
                    let notes = builder.apply(batch);
                    let next = builder.freeze();
                    let epoch = next.epoch;
                    gauge!("vigil_cache_objects", next.objects.len() as f64);
                    snap_clone.store(next);
                    let _ = epoch_tx.send(epoch);
                    if builder.synced() && !*synced_tx.borrow() {
                        info!(objects = builder.len(), "cache synced");
                        synced_tx.send_replace(true);
                    }
                    deliver(&notify_tx, notes);
                }
                _ = async {
                    match ticker.as_mut() {
                        Some(t) => { t.tick().await; }
                        None => std::future::pending::<()>().await,
                    }
                } => {
                    if builder.synced() {
                        debug!(objects = builder.len(), "periodic resync");
                        deliver(&notify_tx, builder.resync());
                    }
                }
            }
        }
        info!("ingest loop stopped");
    });

    (tx, CacheHandle { snap, epoch_rx, synced_rx }, notify_rx)
}
