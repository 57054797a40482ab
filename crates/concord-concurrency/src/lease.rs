//! Lease manager
//!
//! Grants leases from the store and keeps them alive. A lease moves from
//! `Active` to `Expired` or `Revoked` exactly once; observers are notified
//! through a watch channel, so the "lease lost" signal is delivered at most
//! once and never blocks the keepalive task.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep};
use tracing::{debug, error, info, warn};

use concord_store::{KvStore, LeaseId, StoreError};

use crate::error::{LockError, Result};

/// Lease lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeaseState {
    /// Lease is alive and being renewed
    Active,
    /// Renewal failed or the store dropped the lease
    Expired,
    /// Lease was revoked explicitly
    Revoked,
}

/// A lease granted by the store.
///
/// Clones observe the same state.
#[derive(Clone, Debug)]
pub struct Lease {
    id: LeaseId,
    ttl: Duration,
    state: Arc<watch::Sender<LeaseState>>,
}

impl Lease {
    fn new(id: LeaseId, ttl: Duration) -> Self {
        let (state, _) = watch::channel(LeaseState::Active);
        Self {
            id,
            ttl,
            state: Arc::new(state),
        }
    }

    pub fn id(&self) -> LeaseId {
        self.id
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn state(&self) -> LeaseState {
        *self.state.borrow()
    }

    pub fn is_active(&self) -> bool {
        self.state() == LeaseState::Active
    }

    /// Subscribe to state transitions
    pub fn subscribe(&self) -> watch::Receiver<LeaseState> {
        self.state.subscribe()
    }

    /// Resolve once the lease is no longer active
    pub async fn lost(&self) {
        let mut receiver = self.state.subscribe();
        let _ = receiver
            .wait_for(|state| *state != LeaseState::Active)
            .await;
    }

    /// Leave the `Active` state. Returns false if the lease had already left it.
    pub(crate) fn finish(&self, next: LeaseState) -> bool {
        self.state.send_if_modified(|state| {
            if *state == LeaseState::Active && next != LeaseState::Active {
                *state = next;
                true
            } else {
                false
            }
        })
    }
}

const MIN_KEEPALIVE_PERIOD: Duration = Duration::from_millis(1);

/// Spacing of renewal retries after a failure
fn retry_period(period: Duration, max_failures: u32) -> Duration {
    (period / max_failures.saturating_add(1)).max(MIN_KEEPALIVE_PERIOD)
}

/// Grants, renews and revokes leases against one store
#[derive(Clone)]
pub struct LeaseManager {
    store: Arc<dyn KvStore>,
}

impl LeaseManager {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    /// Request a new lease with the given time-to-live
    pub async fn create(&self, ttl: Duration) -> Result<Lease> {
        if ttl.is_zero() {
            return Err(LockError::InvalidTtl);
        }

        let grant = self.store.lease_grant(ttl).await?;
        info!("Granted lease {:x} (ttl {:?})", grant.id, grant.ttl);
        Ok(Lease::new(grant.id, grant.ttl))
    }

    /// Spawn the renewal loop for `lease`.
    ///
    /// Renews every `period` (clamped to at most ttl/3 by the caller's
    /// config, and to at least 1ms here). After a failed renewal the next
    /// attempt comes after `period / (max_failures + 1)`, so the failure
    /// budget runs out within one period instead of racing the store's ttl.
    /// The lease is declared expired when the store no longer knows it, when
    /// more than `max_failures` consecutive renewals fail, or when a full ttl
    /// has passed since the last renewal the store acknowledged.
    pub fn keep_alive(&self, lease: &Lease, period: Duration, max_failures: u32) -> JoinHandle<()> {
        let store = self.store.clone();
        let lease = lease.clone();
        let period = period.max(MIN_KEEPALIVE_PERIOD);
        let retry = retry_period(period, max_failures);

        tokio::spawn(async move {
            let mut failures = 0u32;
            let mut renewed_at = Instant::now();
            let mut delay = period;

            loop {
                tokio::select! {
                    _ = sleep(delay) => {}
                    _ = lease.lost() => break,
                }

                let sent_at = Instant::now();
                match tokio::time::timeout(delay, store.lease_keep_alive(lease.id)).await {
                    Ok(Ok(Some(_))) => {
                        failures = 0;
                        renewed_at = sent_at;
                        delay = period;
                        debug!("Renewed lease {:x}", lease.id);
                    }
                    Ok(Ok(None)) | Ok(Err(StoreError::LeaseNotFound(_))) => {
                        error!("Lease {:x} no longer exists in the store", lease.id);
                        Self::expire(&lease);
                        break;
                    }
                    Ok(Err(e)) => {
                        failures += 1;
                        delay = retry;
                        metrics::counter!("concord_lease_keepalive_failures_total").increment(1);
                        warn!(
                            "Lease {:x} renewal failed ({} consecutive): {}",
                            lease.id, failures, e
                        );
                    }
                    Err(_) => {
                        failures += 1;
                        delay = retry;
                        metrics::counter!("concord_lease_keepalive_failures_total").increment(1);
                        warn!(
                            "Lease {:x} renewal timed out ({} consecutive)",
                            lease.id, failures
                        );
                    }
                }

                if failures > max_failures || renewed_at.elapsed() >= lease.ttl {
                    error!(
                        "Lease {:x} lost after {} failed renewals",
                        lease.id, failures
                    );
                    Self::expire(&lease);
                    break;
                }
            }

            debug!("Keepalive for lease {:x} stopped", lease.id);
        })
    }

    /// Revoke the lease; the store deletes every key attached to it.
    ///
    /// The lease stays `Active` locally when the store could not be reached,
    /// so the caller may retry.
    pub async fn revoke(&self, lease: &Lease) -> Result<()> {
        match self.store.lease_revoke(lease.id).await {
            Ok(()) => {
                lease.finish(LeaseState::Revoked);
                info!("Revoked lease {:x}", lease.id);
                Ok(())
            }
            // Already gone on the store side: nothing left to revoke
            Err(StoreError::LeaseNotFound(_)) => {
                lease.finish(LeaseState::Revoked);
                Ok(())
            }
            Err(e) => {
                warn!("Failed to revoke lease {:x}: {}", lease.id, e);
                Err(LockError::StoreUnavailable(e))
            }
        }
    }

    fn expire(lease: &Lease) {
        if lease.finish(LeaseState::Expired) {
            metrics::counter!("concord_lease_lost_total").increment(1);
        }
    }
}
