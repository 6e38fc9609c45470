//! Notification bridge: change notifications in, work-item keys out.

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};
use vigil_core::Notification;
use vigil_queue::WorkQueue;

/// Turns every notification into an `add` of the object's key. Adds, updates and deletes are
/// treated alike; the sync function works out what the current state means.
#[derive(Clone)]
pub struct NotificationBridge {
    queue: WorkQueue<String>,
}

impl NotificationBridge {
    pub fn new(queue: WorkQueue<String>) -> Self { Self { queue } }

    /// Never blocks and never talks to the remote API.
    pub fn handle(&self, n: &Notification) {
        let key = n.object().key().to_string();
        trace!(verb = n.verb(), key = %key, "enqueue");
        self.queue.add(key);
    }

    /// Pump notifications until cancelled or the cache stops publishing.
    pub async fn run(self, mut notifications: mpsc::UnboundedReceiver<Notification>, cancel: CancellationToken) {
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                maybe = notifications.recv() => match maybe {
                    Some(n) => self.handle(&n),
                    None => {
                        debug!("notification stream closed");
                        break;
                    }
                },
            }
        }
        debug!("bridge stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::obj;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn every_notification_kind_enqueues_the_key_once() {
        let queue = WorkQueue::new("bridge");
        let bridge = NotificationBridge::new(queue.clone());
        let o = Arc::new(obj("ns", "a", "1", &[], &[]));
        let c = Arc::new(obj("", "node-1", "1", &[], &[]));

        bridge.handle(&Notification::Added(o.clone()));
        bridge.handle(&Notification::Updated { old: o.clone(), new: o.clone() });
        bridge.handle(&Notification::Deleted(o.clone()));
        bridge.handle(&Notification::Added(c));

        assert_eq!(queue.len(), 2);
        assert_eq!(queue.get().await.as_deref(), Some("ns/a"));
        assert_eq!(queue.get().await.as_deref(), Some("node-1"));
    }

    #[tokio::test]
    async fn run_stops_on_cancel_or_closed_stream() {
        let queue = WorkQueue::new("bridge");
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(NotificationBridge::new(queue.clone()).run(rx, cancel.clone()));

        tx.send(Notification::Added(Arc::new(obj("ns", "a", "1", &[], &[])))).unwrap();
        let item = tokio::time::timeout(Duration::from_secs(1), queue.get()).await.unwrap();
        assert_eq!(item.as_deref(), Some("ns/a"));

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), task).await.unwrap().unwrap();

        let (tx, rx) = mpsc::unbounded_channel::<Notification>();
        let task = tokio::spawn(NotificationBridge::new(queue).run(rx, CancellationToken::new()));
        drop(tx);
        tokio::time::timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
    }
}
