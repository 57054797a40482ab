//! Session: one lease plus its keepalive lifecycle
//!
//! A session is the identity under which locks are claimed. It is valid
//! exactly while its lease is `Active`. Close it explicitly to revoke the
//! lease; dropping the last handle only stops the keepalive, after which the
//! store expires the lease on its own.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use concord_store::{KvStore, LeaseId};

use crate::config::SessionConfig;
use crate::error::Result;
use crate::lease::{Lease, LeaseManager, LeaseState};

/// Handle to a lease-backed session. Cheap to clone.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    store: Arc<dyn KvStore>,
    manager: LeaseManager,
    lease: Lease,
    config: SessionConfig,
    keepalive: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl Session {
    /// Open a session with the default configuration
    pub async fn open(store: Arc<dyn KvStore>) -> Result<Self> {
        Self::open_with_config(store, SessionConfig::default()).await
    }

    /// Grant a lease and start keeping it alive
    pub async fn open_with_config(store: Arc<dyn KvStore>, config: SessionConfig) -> Result<Self> {
        let manager = LeaseManager::new(store.clone());
        let lease = manager.create(config.ttl()).await?;
        let keepalive = manager.keep_alive(
            &lease,
            config.keepalive_interval(),
            config.max_keepalive_failures,
        );

        info!(
            "Opened session on lease {:x} (ttl {:?}, keepalive every {:?})",
            lease.id(),
            lease.ttl(),
            config.keepalive_interval()
        );

        Ok(Self {
            inner: Arc::new(SessionInner {
                store,
                manager,
                lease,
                config,
                keepalive: Mutex::new(Some(keepalive)),
                closed: AtomicBool::new(false),
            }),
        })
    }

    /// Revoke the lease and stop keepalive. Idempotent once it succeeds.
    ///
    /// If the store cannot be reached the session stays open, keepalive keeps
    /// running and the error is returned; call `close` again to retry.
    pub async fn close(&self) -> Result<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Ok(());
        }

        if self.inner.lease.is_active() {
            self.inner.manager.revoke(&self.inner.lease).await?;
        }

        if let Some(handle) = self.inner.keepalive.lock().take() {
            handle.abort();
        }
        if !self.inner.closed.swap(true, Ordering::SeqCst) {
            info!("Closed session on lease {:x}", self.inner.lease.id());
        }
        Ok(())
    }

    /// Resolve once the session is lost or closed
    pub async fn done(&self) {
        self.inner.lease.lost().await
    }

    /// A session is valid iff its lease is active
    pub fn is_valid(&self) -> bool {
        self.inner.lease.is_active()
    }

    pub fn lease_id(&self) -> LeaseId {
        self.inner.lease.id()
    }

    pub fn lease_state(&self) -> LeaseState {
        self.inner.lease.state()
    }

    pub fn ttl(&self) -> Duration {
        self.inner.lease.ttl()
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    pub fn store(&self) -> &Arc<dyn KvStore> {
        &self.inner.store
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("lease", &format_args!("{:x}", self.lease_id()))
            .field("state", &self.lease_state())
            .finish()
    }
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        if let Some(handle) = self.keepalive.get_mut().take() {
            handle.abort();
        }
        if !self.closed.load(Ordering::SeqCst) {
            debug!(
                "Session on lease {:x} dropped without close; lease will expire",
                self.lease.id()
            );
        }
    }
}
