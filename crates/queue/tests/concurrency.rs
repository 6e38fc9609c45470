#![forbid(unsafe_code)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use vigil_queue::{ItemExponentialFailureRateLimiter, WorkQueue};

fn queue() -> WorkQueue<String> {
    WorkQueue::with_rate_limiter(
        "concurrency",
        ItemExponentialFailureRateLimiter::new(Duration::from_millis(1), Duration::from_millis(10)),
    )
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_getters_never_share_an_item() {
    let q = queue();
    let in_flight: Arc<Mutex<HashSet<String>>> = Arc::new(Mutex::new(HashSet::new()));
    let violations = Arc::new(AtomicUsize::new(0));
    let processed = Arc::new(AtomicUsize::new(0));

    let mut workers = Vec::new();
    for _ in 0..8 {
        let q = q.clone();
        let in_flight = Arc::clone(&in_flight);
        let violations = Arc::clone(&violations);
        let processed = Arc::clone(&processed);
        workers.push(tokio::spawn(async move {
            while let Some(key) = q.get().await {
                if !in_flight.lock().unwrap().insert(key.clone()) {
                    violations.fetch_add(1, Ordering::SeqCst);
                }
                tokio::time::sleep(Duration::from_micros(200)).await;
                in_flight.lock().unwrap().remove(&key);
                processed.fetch_add(1, Ordering::SeqCst);
                q.done(&key);
            }
        }));
    }

    // Hammer a small key space so re-adds during processing are common.
    for round in 0..200 {
        for k in 0..5 {
            q.add(format!("ns/obj-{k}"));
        }
        if round % 10 == 0 {
            tokio::task::yield_now().await;
        }
    }

    tokio::time::sleep(Duration::from_millis(100)).await;
    q.shutdown();
    for w in workers {
        tokio::time::timeout(Duration::from_secs(5), w).await.unwrap().unwrap();
    }

    assert_eq!(violations.load(Ordering::SeqCst), 0, "same key handed to two workers");
    assert!(processed.load(Ordering::SeqCst) >= 5);
    assert!(q.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn redirty_during_processing_redelivers_exactly_once() {
    let q = queue();
    q.add("ns/a".to_string());
    let item = q.get().await.unwrap();

    // Many notifications while the worker holds the item collapse into one redelivery.
    for _ in 0..50 {
        q.add(item.clone());
    }
    let other = q.clone();
    let racer = tokio::spawn(async move { tokio::time::timeout(Duration::from_millis(50), other.get()).await });
    assert!(racer.await.unwrap().is_err(), "item must stay invisible while processing");

    q.done(&item);
    assert_eq!(q.get().await.as_deref(), Some("ns/a"));
    q.done(&item);

    let leftover = tokio::time::timeout(Duration::from_millis(50), q.get()).await;
    assert!(leftover.is_err(), "only one redelivery expected");
}
