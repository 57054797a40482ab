//! Distributed mutex
//!
//! Fair mutual exclusion over a key prefix. Every contender writes one key
//! `<name>/<lease id in hex>` bound to its session lease; the key with the
//! smallest create revision holds the lock. A waiter watches only its direct
//! predecessor in revision order, so a release wakes exactly one waiter.
//!
//! Crash safety comes from the lease: when a holder's lease expires the store
//! deletes its key, which is a deletion event for the next waiter like any
//! other release.

use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use concord_store::{
    Compare, CompareOp, KeyValue, KvStore, PutOptions, RangeOptions, Revision, StoreError, Txn,
    TxnOp, TxnOpResponse,
};

use crate::context::CancelSignal;
use crate::error::{LockError, Result};
use crate::guard::Fence;
use crate::session::Session;

/// Mutex lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutexState {
    Idle,
    Acquiring,
    Held,
    Releasing,
    /// The owning session was lost; terminal
    Invalidated,
}

/// Outcome of the create-and-list transaction
struct Attempt {
    /// Keys under the prefix, ascending by create revision
    contenders: Vec<KeyValue>,
    /// Store revision the listing was read at
    revision: Revision,
}

/// A named, session-bound distributed mutex. Not reentrant.
///
/// The lock key is derived from the session lease, so every `Mutex` built on
/// the same session and name shares one key: a second instance's `lock`
/// adopts the existing key and reports `Held` alongside the first. Exclusion
/// is between sessions; use one instance per session and name.
pub struct Mutex {
    session: Session,
    name: String,
    prefix: String,
    key: String,
    holder_id: Bytes,
    header_revision: Revision,
    state: MutexState,
    /// Create revision of an abandoned key whose removal is still in flight
    pending_release: Option<Revision>,
}

impl Mutex {
    /// Create a mutex on `name` with an empty holder identifier
    pub fn new(session: &Session, name: impl Into<String>) -> Self {
        Self::with_holder(session, name, "")
    }

    /// Create a mutex whose lock key carries `holder_id` as its value
    pub fn with_holder(
        session: &Session,
        name: impl Into<String>,
        holder_id: impl Into<String>,
    ) -> Self {
        let name = name.into();
        let prefix = format!("{}/", name);
        let key = format!("{}{:x}", prefix, session.lease_id());
        Self {
            session: session.clone(),
            name,
            prefix,
            key,
            holder_id: Bytes::from(holder_id.into()),
            header_revision: 0,
            state: MutexState::Idle,
            pending_release: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The lock key this instance writes
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Create revision of this instance's lock key (0 when not acquired)
    pub fn header_revision(&self) -> Revision {
        self.header_revision
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn state(&self) -> MutexState {
        match self.state {
            MutexState::Acquiring | MutexState::Held if !self.session.is_valid() => {
                MutexState::Invalidated
            }
            state => state,
        }
    }

    pub fn is_held(&self) -> bool {
        self.state() == MutexState::Held
    }

    /// Store-side ownership check, for use as a transaction guard
    pub fn is_owner(&self) -> Compare {
        Compare::create_revision(&self.key, CompareOp::Equal, self.header_revision)
    }

    /// Fencing handle for guarded writes while held
    pub fn fence(&self) -> Result<Fence> {
        match self.state() {
            MutexState::Held => Ok(Fence::new(
                self.store().clone(),
                self.key.clone(),
                self.header_revision,
            )),
            MutexState::Invalidated => Err(LockError::SessionLost),
            _ => Err(LockError::NotHeld),
        }
    }

    /// Acquire the lock, waiting behind earlier contenders.
    ///
    /// Returns `Cancelled` if `ctx` fires while waiting (the key is removed)
    /// and `SessionLost` if the session is lost before the lock is held.
    pub async fn lock(&mut self, ctx: &CancelSignal) -> Result<()> {
        self.begin(ctx)?;
        let started = Instant::now();

        let attempt = match self.try_acquire().await {
            Ok(attempt) => attempt,
            Err(err) => return Err(self.fail(err).await),
        };

        if let Some(predecessor) = self.direct_predecessor(&attempt.contenders) {
            debug!(
                "{} queued at revision {} behind {}",
                self.key, self.header_revision, predecessor.key
            );
            if let Err(err) = self.wait_for_turn(ctx, predecessor, attempt.revision).await {
                return Err(self.fail(err).await);
            }
        }

        self.acquired(started);
        Ok(())
    }

    /// Acquire the lock only if nobody holds it; never waits
    pub async fn try_lock(&mut self, ctx: &CancelSignal) -> Result<()> {
        self.begin(ctx)?;
        let started = Instant::now();

        let attempt = match self.try_acquire().await {
            Ok(attempt) => attempt,
            Err(err) => return Err(self.fail(err).await),
        };

        if self.direct_predecessor(&attempt.contenders).is_some() {
            let deleted = self.store().delete(&self.key).await;
            self.header_revision = 0;
            self.state = MutexState::Idle;
            deleted?;
            debug!("{} would block", self.key);
            return Err(LockError::WouldBlock);
        }

        self.acquired(started);
        Ok(())
    }

    /// Release the lock by deleting this instance's key
    pub async fn unlock(&mut self) -> Result<()> {
        if !matches!(self.state, MutexState::Held | MutexState::Releasing) {
            return Err(LockError::NotHeld);
        }

        self.state = MutexState::Releasing;
        match self.store().delete(&self.key).await {
            Ok(_) => {}
            // The lease is gone, and the key with it
            Err(e) if !self.session.is_valid() => {
                debug!("Ignoring delete failure for {} after session loss: {}", self.key, e);
            }
            Err(e) => {
                self.state = MutexState::Held;
                return Err(e.into());
            }
        }

        self.header_revision = 0;
        self.state = if self.session.is_valid() {
            MutexState::Idle
        } else {
            MutexState::Invalidated
        };
        metrics::counter!("concord_mutex_released_total").increment(1);
        info!("Released {}", self.key);
        Ok(())
    }

    /// Drop local ownership without touching the store.
    ///
    /// Returns the key and the create revision it was held at. The next
    /// acquisition removes that exact key before creating a fresh one, so a
    /// late background release can never hit a newer acquisition.
    pub(crate) fn abandon(&mut self) -> (String, Revision) {
        let revision = self.header_revision;
        self.pending_release = Some(revision);
        self.header_revision = 0;
        self.state = if self.session.is_valid() {
            MutexState::Idle
        } else {
            MutexState::Invalidated
        };
        (self.key.clone(), revision)
    }

    /// Delete `key` only if it still carries `revision` as its create revision
    pub(crate) fn release_txn(key: &str, revision: Revision) -> Txn {
        Txn::new()
            .when([Compare::create_revision(key, CompareOp::Equal, revision)])
            .and_then([TxnOp::delete(key)])
    }

    pub(crate) fn store(&self) -> &Arc<dyn KvStore> {
        self.session.store()
    }

    fn begin(&mut self, ctx: &CancelSignal) -> Result<()> {
        match self.state() {
            MutexState::Idle => {}
            MutexState::Invalidated => return Err(LockError::SessionLost),
            MutexState::Acquiring | MutexState::Held | MutexState::Releasing => {
                return Err(LockError::AlreadyLocked);
            }
        }
        if ctx.is_cancelled() {
            return Err(LockError::Cancelled);
        }
        if !self.session.is_valid() {
            self.state = MutexState::Invalidated;
            return Err(LockError::SessionLost);
        }

        self.state = MutexState::Acquiring;
        Ok(())
    }

    /// Create our key if absent and list every contender, in one transaction
    async fn try_acquire(&mut self) -> Result<Attempt> {
        if let Some(revision) = self.pending_release {
            self.store()
                .txn(Self::release_txn(&self.key, revision))
                .await?;
            self.pending_release = None;
            debug!("Cleared abandoned {} at revision {}", self.key, revision);
        }

        let list = TxnOp::range(&self.prefix, RangeOptions::new());
        let txn = Txn::new()
            .when([Compare::create_revision(&self.key, CompareOp::Equal, 0)])
            .and_then([
                TxnOp::put(
                    &self.key,
                    self.holder_id.clone(),
                    PutOptions::new().with_lease(self.session.lease_id()),
                ),
                list.clone(),
            ])
            .or_else([TxnOp::get(&self.key), list]);

        let response = self.store().txn(txn).await?;

        let revision = if response.succeeded {
            match response.responses.first() {
                Some(TxnOpResponse::Put(put)) => put.revision,
                _ => return Err(malformed("missing put response")),
            }
        } else {
            // Key survived an earlier attempt under this lease: reuse it
            match response.get(0) {
                Some(Some(kv)) => kv.create_revision,
                _ => return Err(malformed("missing lock key")),
            }
        };
        let listing = response
            .range(1)
            .cloned()
            .ok_or_else(|| malformed("missing prefix listing"))?;

        self.header_revision = revision;
        Ok(Attempt {
            contenders: listing.kvs,
            revision: listing.revision,
        })
    }

    /// The live key immediately before ours in revision order
    fn direct_predecessor(&self, contenders: &[KeyValue]) -> Option<KeyValue> {
        contenders
            .iter()
            .filter(|kv| kv.create_revision < self.header_revision)
            .max_by_key(|kv| kv.create_revision)
            .cloned()
    }

    async fn wait_for_turn(
        &self,
        ctx: &CancelSignal,
        mut predecessor: KeyValue,
        mut revision: Revision,
    ) -> Result<()> {
        loop {
            self.wait_delete(ctx, &predecessor.key, revision + 1).await?;

            // An earlier waiter may have left without the holder releasing
            let remaining = self
                .store()
                .range(
                    &self.prefix,
                    RangeOptions::last_created_before(self.header_revision - 1),
                )
                .await?;
            match remaining.kvs.into_iter().next() {
                Some(next) => {
                    debug!("{} now waiting behind {}", self.key, next.key);
                    predecessor = next;
                    revision = remaining.revision;
                }
                None => break,
            }
        }

        // Our own key must have survived the wait
        match self.store().get(&self.key).await? {
            Some(kv) if kv.create_revision == self.header_revision => Ok(()),
            _ => Err(LockError::SessionLost),
        }
    }

    /// Block until `key` is deleted at or after `start_revision`
    async fn wait_delete(&self, ctx: &CancelSignal, key: &str, start_revision: Revision) -> Result<()> {
        let mut events = self.store().watch(key, start_revision).await?;

        loop {
            tokio::select! {
                biased;
                _ = ctx.cancelled() => return Err(LockError::Cancelled),
                _ = self.session.done() => return Err(LockError::SessionLost),
                event = events.next() => match event {
                    Some(Ok(event)) if event.is_delete() => return Ok(()),
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => return Err(e.into()),
                    None => {
                        return Err(LockError::StoreUnavailable(StoreError::Unavailable(
                            format!("watch on {} closed", key),
                        )));
                    }
                },
            }
        }
    }

    fn acquired(&mut self, started: Instant) {
        self.state = MutexState::Held;
        metrics::counter!("concord_mutex_acquired_total").increment(1);
        metrics::histogram!("concord_mutex_wait_seconds").record(started.elapsed().as_secs_f64());
        info!(
            "Acquired {} at revision {} after {:?}",
            self.key,
            self.header_revision,
            started.elapsed()
        );
    }

    /// Settle state after a failed acquisition and pass the error through
    async fn fail(&mut self, err: LockError) -> LockError {
        if err == LockError::SessionLost || !self.session.is_valid() {
            // The store removes the key when the lease expires
            self.header_revision = 0;
            self.state = MutexState::Invalidated;
            return LockError::SessionLost;
        }

        if let Err(e) = self.store().delete(&self.key).await {
            warn!("Failed to remove abandoned lock key {}: {}", self.key, e);
        }
        self.header_revision = 0;
        self.state = MutexState::Idle;
        err
    }
}

impl std::fmt::Debug for Mutex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mutex")
            .field("key", &self.key)
            .field("header_revision", &self.header_revision)
            .field("state", &self.state())
            .finish()
    }
}

fn malformed(what: &str) -> LockError {
    LockError::StoreUnavailable(StoreError::Unavailable(format!(
        "malformed transaction response: {}",
        what
    )))
}
