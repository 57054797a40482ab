//! Guarded critical sections
//!
//! `with_lock` runs an operation while a mutex is held and releases it on
//! every exit path. The operation receives a [`Fence`]: writes through it are
//! transactions conditioned on the lock key still carrying the create revision
//! it was acquired at, so a holder that lost its lease cannot clobber the
//! next holder's writes.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use bytes::Bytes;
use futures::FutureExt;
use tracing::{debug, warn};

use concord_store::{
    Compare, CompareOp, DeleteResponse, KvStore, PutOptions, PutResponse, Revision, Txn, TxnOp,
    TxnOpResponse, TxnResponse,
};

use crate::context::CancelSignal;
use crate::error::{LockError, Result};
use crate::mutex::Mutex;

/// Write handle bound to one acquisition of a lock
#[derive(Clone)]
pub struct Fence {
    store: Arc<dyn KvStore>,
    lock_key: String,
    revision: Revision,
}

impl Fence {
    pub(crate) fn new(store: Arc<dyn KvStore>, lock_key: String, revision: Revision) -> Self {
        Self {
            store,
            lock_key,
            revision,
        }
    }

    pub fn lock_key(&self) -> &str {
        &self.lock_key
    }

    /// Create revision of the lock key this fence guards
    pub fn revision(&self) -> Revision {
        self.revision
    }

    /// The ownership condition attached to every fenced write
    pub fn compare(&self) -> Compare {
        Compare::create_revision(&self.lock_key, CompareOp::Equal, self.revision)
    }

    /// Put `key` only while the lock is still owned
    pub async fn put(&self, key: &str, value: impl Into<Bytes>) -> Result<PutResponse> {
        let response = self
            .txn(vec![TxnOp::put(key, value, PutOptions::new())])
            .await?;
        match response.responses.into_iter().next() {
            Some(TxnOpResponse::Put(put)) => Ok(put),
            _ => Err(LockError::StoreUnavailable(
                concord_store::StoreError::Unavailable("missing put response".to_string()),
            )),
        }
    }

    /// Delete `key` only while the lock is still owned
    pub async fn delete(&self, key: &str) -> Result<DeleteResponse> {
        let response = self.txn(vec![TxnOp::delete(key)]).await?;
        match response.responses.into_iter().next() {
            Some(TxnOpResponse::Delete(deleted)) => Ok(deleted),
            _ => Err(LockError::StoreUnavailable(
                concord_store::StoreError::Unavailable("missing delete response".to_string()),
            )),
        }
    }

    /// Apply `ops` atomically, only while the lock is still owned
    pub async fn txn(&self, ops: Vec<TxnOp>) -> Result<TxnResponse> {
        let txn = Txn::new().when([self.compare()]).and_then(ops);
        let response = self.store.txn(txn).await?;
        if !response.succeeded {
            metrics::counter!("concord_fenced_writes_total").increment(1);
            warn!(
                "Rejected write fenced by {} at revision {}",
                self.lock_key, self.revision
            );
            return Err(LockError::Fenced {
                key: self.lock_key.clone(),
                revision: self.revision,
            });
        }
        Ok(response)
    }
}

impl std::fmt::Debug for Fence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fence")
            .field("lock_key", &self.lock_key)
            .field("revision", &self.revision)
            .finish()
    }
}

/// Releases the mutex in the background if dropped while still armed
struct HeldGuard<'a> {
    mutex: &'a mut Mutex,
    armed: bool,
}

impl<'a> HeldGuard<'a> {
    fn new(mutex: &'a mut Mutex) -> Self {
        Self { mutex, armed: true }
    }

    async fn release(mut self) -> Result<()> {
        let result = self.mutex.unlock().await;
        self.armed = false;
        result
    }
}

impl Drop for HeldGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }

        let (key, revision) = self.mutex.abandon();
        let store = self.mutex.store().clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                debug!("Scheduling release of {} at revision {}", key, revision);
                handle.spawn(async move {
                    if let Err(e) = store.txn(Mutex::release_txn(&key, revision)).await {
                        warn!("Background release of {} failed: {}", key, e);
                    }
                });
            }
            Err(_) => warn!("No runtime to release {}; it expires with its lease", key),
        }
    }
}

/// Run `operation` while holding `mutex`.
///
/// The mutex is released on success, on error, on panic (the panic resumes
/// after release) and when the session is lost mid-operation, in which case
/// the operation is abandoned and `SessionLost` is returned.
pub async fn with_lock<F, Fut, T, E>(
    mutex: &mut Mutex,
    ctx: &CancelSignal,
    operation: F,
) -> std::result::Result<T, GuardedError<E>>
where
    F: FnOnce(Fence) -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
{
    mutex.lock(ctx).await.map_err(GuardedError::Lock)?;

    let session = mutex.session().clone();
    let guard = HeldGuard::new(mutex);
    let fence = match guard.mutex.fence() {
        Ok(fence) => fence,
        Err(e) => {
            let _ = guard.release().await;
            return Err(GuardedError::Lock(e));
        }
    };

    let outcome = tokio::select! {
        biased;
        _ = session.done() => None,
        result = AssertUnwindSafe(operation(fence)).catch_unwind() => Some(result),
    };

    let released = guard.release().await;
    match outcome {
        None => {
            warn!("Session lost while holding the lock; operation abandoned");
            Err(GuardedError::Lock(LockError::SessionLost))
        }
        Some(Err(panic)) => std::panic::resume_unwind(panic),
        Some(Ok(Ok(value))) => released.map(|_| value).map_err(GuardedError::Lock),
        Some(Ok(Err(e))) => {
            if let Err(release_error) = released {
                warn!("Release after failed operation also failed: {}", release_error);
            }
            Err(GuardedError::Operation(e))
        }
    }
}

/// Error type for guarded operations
#[derive(Debug)]
pub enum GuardedError<E> {
    /// Acquiring, holding or releasing the lock failed
    Lock(LockError),
    /// The operation itself failed
    Operation(E),
}

impl<E> GuardedError<E> {
    pub fn lock_error(&self) -> Option<&LockError> {
        match self {
            GuardedError::Lock(e) => Some(e),
            GuardedError::Operation(_) => None,
        }
    }
}

impl<E: std::fmt::Display> std::fmt::Display for GuardedError<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GuardedError::Lock(e) => write!(f, "Lock failed: {}", e),
            GuardedError::Operation(e) => write!(f, "Operation failed: {}", e),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for GuardedError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            GuardedError::Lock(e) => Some(e),
            GuardedError::Operation(e) => Some(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use concord_store::MemoryKvStore;

    use crate::config::SessionConfig;
    use crate::mutex::MutexState;
    use crate::session::Session;

    async fn session(store: &MemoryKvStore) -> Session {
        Session::open_with_config(Arc::new(store.clone()), SessionConfig::with_ttl_secs(30))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_fenced_put_while_held() {
        let store = MemoryKvStore::new();
        let session = session(&store).await;
        let mut mutex = Mutex::new(&session, "/r");
        mutex.lock(&CancelSignal::never()).await.unwrap();

        let fence = mutex.fence().unwrap();
        assert_eq!(fence.revision(), mutex.header_revision());
        fence.put("/data", "v1").await.unwrap();
        assert_eq!(store.get("/data").await.unwrap().unwrap().value_str(), "v1");

        fence.delete("/data").await.unwrap();
        assert!(store.get("/data").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_fence_rejects_after_lease_loss() {
        let store = MemoryKvStore::new();
        let session = session(&store).await;
        let mut mutex = Mutex::new(&session, "/r");
        mutex.lock(&CancelSignal::never()).await.unwrap();
        let fence = mutex.fence().unwrap();

        store.lease_revoke(session.lease_id()).await.unwrap();
        let err = fence.put("/data", "stale").await.unwrap_err();
        assert!(matches!(err, LockError::Fenced { revision, .. } if revision == fence.revision()));
        assert!(store.get("/data").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_fence_requires_held() {
        let store = MemoryKvStore::new();
        let session = session(&store).await;
        let mutex = Mutex::new(&session, "/r");
        assert_eq!(mutex.fence().err(), Some(LockError::NotHeld));
    }

    #[tokio::test]
    async fn test_with_lock_releases_on_success_and_error() {
        let store = MemoryKvStore::new();
        let session = session(&store).await;
        let mut mutex = Mutex::new(&session, "/r");
        let ctx = CancelSignal::never();

        let value = with_lock(&mut mutex, &ctx, |fence| async move {
            fence.put("/data", "v1").await?;
            Ok::<_, LockError>(42)
        })
        .await
        .unwrap();
        assert_eq!(value, 42);
        assert_eq!(mutex.state(), MutexState::Idle);
        assert!(store.get(mutex.key()).await.unwrap().is_none());

        let err = with_lock(&mut mutex, &ctx, |_fence| async {
            Err::<(), _>(std::io::Error::other("boom"))
        })
        .await
        .unwrap_err();
        assert!(matches!(err, GuardedError::Operation(_)));
        assert_eq!(err.to_string(), "Operation failed: boom");
        assert_eq!(mutex.state(), MutexState::Idle);
        assert!(store.get(mutex.key()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_with_lock_releases_on_panic() {
        let store = MemoryKvStore::new();
        let session = session(&store).await;
        let mut mutex = Mutex::new(&session, "/r");
        let ctx = CancelSignal::never();

        let result = AssertUnwindSafe(with_lock(&mut mutex, &ctx, |_fence| async {
            if true {
                panic!("operation panicked");
            }
            Ok::<(), LockError>(())
        }))
        .catch_unwind()
        .await;

        assert!(result.is_err());
        assert_eq!(mutex.state(), MutexState::Idle);
        assert!(store.range("/r/", Default::default()).await.unwrap().kvs.is_empty());
    }

    #[tokio::test]
    async fn test_with_lock_abandons_on_session_loss() {
        let store = MemoryKvStore::new();
        let session = session(&store).await;
        let mut mutex = Mutex::new(&session, "/r");
        let ctx = CancelSignal::never();

        let closer = session.clone();
        let err = with_lock(&mut mutex, &ctx, |_fence| async move {
            closer.close().await?;
            std::future::pending::<std::result::Result<(), LockError>>().await
        })
        .await
        .unwrap_err();

        assert_eq!(err.lock_error(), Some(&LockError::SessionLost));
        assert_eq!(mutex.state(), MutexState::Invalidated);
        assert!(store.range("/r/", Default::default()).await.unwrap().kvs.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_with_lock_releases_in_background() {
        let store = MemoryKvStore::new();
        let session = session(&store).await;
        let mut mutex = Mutex::new(&session, "/r");
        let ctx = CancelSignal::never();

        let timed_out = tokio::time::timeout(
            Duration::from_secs(1),
            with_lock(&mut mutex, &ctx, |_fence| {
                std::future::pending::<std::result::Result<(), LockError>>()
            }),
        )
        .await;
        assert!(timed_out.is_err());
        assert_eq!(mutex.state(), MutexState::Idle);

        // Let the spawned release run
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(store.get(mutex.key()).await.unwrap().is_none());

        mutex.lock(&ctx).await.unwrap();
        assert!(mutex.is_held());
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_release_spares_reacquired_key() {
        let store = MemoryKvStore::new();
        let session_a = session(&store).await;
        let session_b = session(&store).await;
        let mut a = Mutex::new(&session_a, "/r");
        let ctx = CancelSignal::never();

        let timed_out = tokio::time::timeout(
            Duration::from_secs(1),
            with_lock(&mut a, &ctx, |_fence| {
                std::future::pending::<std::result::Result<(), LockError>>()
            }),
        )
        .await;
        assert!(timed_out.is_err());
        let abandoned_revision = store.get(a.key()).await.unwrap().unwrap().create_revision;

        // Re-acquire before the spawned release gets a chance to run
        a.lock(&ctx).await.unwrap();
        assert!(a.header_revision() > abandoned_revision);

        tokio::time::sleep(Duration::from_millis(10)).await;
        let kv = store.get(a.key()).await.unwrap().unwrap();
        assert_eq!(kv.create_revision, a.header_revision());
        assert!(a.is_held());

        let mut b = Mutex::new(&session_b, "/r");
        assert_eq!(b.try_lock(&ctx).await, Err(LockError::WouldBlock));
    }
}
