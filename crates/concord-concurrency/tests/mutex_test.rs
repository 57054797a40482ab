// Integration tests for the distributed mutex
// Exclusion, revision-order fairness, cancellation and try_lock across sessions

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use concord_concurrency::{CancelSignal, LockError, Mutex, MutexState, Session, SessionConfig};
use concord_store::{KvStore, MemoryKvStore, RangeOptions};
use tokio::sync::mpsc;

async fn open(store: &MemoryKvStore) -> Session {
    Session::open_with_config(Arc::new(store.clone()), SessionConfig::with_ttl_secs(30))
        .await
        .unwrap()
}

async fn contenders(store: &MemoryKvStore, prefix: &str) -> usize {
    store.range(prefix, RangeOptions::new()).await.unwrap().kvs.len()
}

/// Wait until `count` lock keys exist under `prefix`
async fn wait_for_contenders(store: &MemoryKvStore, prefix: &str, count: usize) {
    while contenders(store, prefix).await != count {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_mutual_exclusion() {
    let store = MemoryKvStore::new();
    let inside = Arc::new(AtomicUsize::new(0));
    let entered = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for i in 0..8 {
        let store = store.clone();
        let inside = inside.clone();
        let entered = entered.clone();
        handles.push(tokio::spawn(async move {
            let session = open(&store).await;
            let mut mutex = Mutex::with_holder(&session, "/exclusive", format!("client-{}", i));
            let ctx = CancelSignal::never();

            for _ in 0..3 {
                mutex.lock(&ctx).await.unwrap();
                assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                entered.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(2)).await;
                inside.fetch_sub(1, Ordering::SeqCst);
                mutex.unlock().await.unwrap();
            }

            session.close().await.unwrap();
        }));
    }

    for handle in handles {
        handle.await.unwrap();
    }
    assert_eq!(entered.load(Ordering::SeqCst), 24);
    assert_eq!(contenders(&store, "/exclusive/").await, 0);
}

#[tokio::test]
async fn test_waiters_acquire_in_revision_order() {
    let store = MemoryKvStore::new();
    let (order_tx, mut order_rx) = mpsc::unbounded_channel();

    let session_a = open(&store).await;
    let mut a = Mutex::with_holder(&session_a, "/r", "A");
    a.lock(&CancelSignal::never()).await.unwrap();

    let mut waiters = Vec::new();
    for (name, queued) in [("B", 2), ("C", 3)] {
        let store_for_task = store.clone();
        let order_tx = order_tx.clone();
        waiters.push(tokio::spawn(async move {
            let session = open(&store_for_task).await;
            let mut mutex = Mutex::with_holder(&session, "/r", name);
            mutex.lock(&CancelSignal::never()).await.unwrap();
            order_tx.send(name).unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
            mutex.unlock().await.unwrap();
            session.close().await.unwrap();
        }));
        wait_for_contenders(&store, "/r/", queued).await;
    }

    // Nobody gets in while A holds
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(order_rx.try_recv().is_err());

    a.unlock().await.unwrap();
    assert_eq!(order_rx.recv().await, Some("B"));
    assert_eq!(order_rx.recv().await, Some("C"));

    for waiter in waiters {
        waiter.await.unwrap();
    }
    session_a.close().await.unwrap();
    assert_eq!(contenders(&store, "/r/").await, 0);
}

#[tokio::test]
async fn test_cancelled_waiter_removes_key_without_skipping_holder() {
    let store = MemoryKvStore::new();

    let session_a = open(&store).await;
    let mut a = Mutex::new(&session_a, "/r");
    a.lock(&CancelSignal::never()).await.unwrap();

    let session_b = open(&store).await;
    let b_key = format!("/r/{:x}", session_b.lease_id());
    let b_ctx = CancelSignal::new();
    let b = {
        let ctx = b_ctx.clone();
        let session_b = session_b.clone();
        tokio::spawn(async move {
            let mut mutex = Mutex::new(&session_b, "/r");
            let result = mutex.lock(&ctx).await;
            (result, mutex.state())
        })
    };
    wait_for_contenders(&store, "/r/", 2).await;

    let session_c = open(&store).await;
    let c = {
        let session_c = session_c.clone();
        tokio::spawn(async move {
            let mut mutex = Mutex::new(&session_c, "/r");
            mutex.lock(&CancelSignal::never()).await.unwrap();
            mutex
        })
    };
    wait_for_contenders(&store, "/r/", 3).await;

    b_ctx.cancel();
    let (result, state) = b.await.unwrap();
    assert_eq!(result, Err(LockError::Cancelled));
    assert_eq!(state, MutexState::Idle);
    assert!(store.get(&b_key).await.unwrap().is_none());

    // C re-checks after B leaves and keeps waiting behind A
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!c.is_finished());
    assert!(a.is_held());

    a.unlock().await.unwrap();
    let mut c = c.await.unwrap();
    assert!(c.is_held());
    c.unlock().await.unwrap();

    for session in [session_a, session_b, session_c] {
        session.close().await.unwrap();
    }
    assert_eq!(contenders(&store, "/r/").await, 0);
}

#[tokio::test(start_paused = true)]
async fn test_lock_timeout_via_cancel_signal() {
    let store = MemoryKvStore::new();
    let holder_session = open(&store).await;
    let mut holder = Mutex::new(&holder_session, "/r");
    holder.lock(&CancelSignal::never()).await.unwrap();

    let waiter_session = open(&store).await;
    let mut waiter = Mutex::new(&waiter_session, "/r");
    let ctx = CancelSignal::with_timeout(Duration::from_secs(5));
    assert_eq!(waiter.lock(&ctx).await, Err(LockError::Cancelled));
    assert!(store.get(waiter.key()).await.unwrap().is_none());
    assert!(holder.is_held());
}

#[tokio::test]
async fn test_try_lock_does_not_wait() {
    let store = MemoryKvStore::new();
    let session_a = open(&store).await;
    let session_b = open(&store).await;
    let ctx = CancelSignal::never();

    let mut a = Mutex::new(&session_a, "/r");
    let mut b = Mutex::new(&session_b, "/r");

    a.try_lock(&ctx).await.unwrap();
    assert_eq!(b.try_lock(&ctx).await, Err(LockError::WouldBlock));
    assert_eq!(contenders(&store, "/r/").await, 1);

    a.unlock().await.unwrap();
    b.try_lock(&ctx).await.unwrap();
    assert_eq!(a.try_lock(&ctx).await, Err(LockError::WouldBlock));
    b.unlock().await.unwrap();
}

#[tokio::test]
async fn test_distinct_names_do_not_contend() {
    let store = MemoryKvStore::new();
    let session = open(&store).await;
    let ctx = CancelSignal::never();

    let mut first = Mutex::new(&session, "/a");
    let mut second = Mutex::new(&session, "/b");
    first.lock(&ctx).await.unwrap();
    second.try_lock(&ctx).await.unwrap();

    assert!(first.is_held());
    assert!(second.is_held());
    first.unlock().await.unwrap();
    second.unlock().await.unwrap();
}

#[tokio::test]
async fn test_unlock_requires_held() {
    let store = MemoryKvStore::new();
    let session = open(&store).await;
    let mut mutex = Mutex::new(&session, "/r");

    assert_eq!(mutex.unlock().await, Err(LockError::NotHeld));
    mutex.lock(&CancelSignal::never()).await.unwrap();
    mutex.unlock().await.unwrap();
    assert_eq!(mutex.unlock().await, Err(LockError::NotHeld));
}
