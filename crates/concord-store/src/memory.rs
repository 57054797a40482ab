//! In-memory reference store
//!
//! A single-process, linearizable implementation of [`KvStore`]. All state
//! lives behind one mutex, so every request observes and produces a total
//! order of revisions. Leases are timed with `tokio::time::Instant`, which
//! makes expiry deterministic under a paused test clock.
//!
//! Expired leases are reaped lazily at the start of every request and,
//! optionally, by a background scanner (see [`MemoryKvStore::with_expiry_scan`])
//! so that watchers observe lease-expiry deletions even when the store is idle.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::time::{Instant, interval};
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tracing::{debug, info};

use crate::error::{Result, StoreError};
use crate::model::*;
use crate::traits::KvStore;

/// Default number of watch events retained for `start_revision` replay
pub const DEFAULT_HISTORY_LIMIT: usize = 1024;

const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// In-memory consensus store
#[derive(Clone)]
pub struct MemoryKvStore {
    inner: Arc<StoreInner>,
}

struct StoreInner {
    state: Mutex<State>,
    events: broadcast::Sender<WatchEvent>,
    available: AtomicBool,
    history_limit: usize,
}

struct State {
    revision: Revision,
    /// Highest revision no longer replayable by watches
    compacted: Revision,
    next_lease: LeaseId,
    kvs: BTreeMap<String, KeyValue>,
    leases: HashMap<LeaseId, LeaseEntry>,
    history: VecDeque<WatchEvent>,
}

struct LeaseEntry {
    ttl: Duration,
    deadline: Instant,
    keys: BTreeSet<String>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::with_history_limit(DEFAULT_HISTORY_LIMIT)
    }

    pub fn with_history_limit(history_limit: usize) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(StoreInner {
                state: Mutex::new(State {
                    revision: 0,
                    compacted: 0,
                    next_lease: 1,
                    kvs: BTreeMap::new(),
                    leases: HashMap::new(),
                    history: VecDeque::new(),
                }),
                events,
                available: AtomicBool::new(true),
                history_limit: history_limit.max(1),
            }),
        }
    }

    /// Start a background task that reaps expired leases every `period`.
    ///
    /// The task stops on its own once every handle to the store is dropped.
    pub fn with_expiry_scan(self, period: Duration) -> Self {
        let weak: Weak<StoreInner> = Arc::downgrade(&self.inner);

        tokio::spawn(async move {
            let mut ticker = interval(period);
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                inner.expire_leases();
            }
        });

        self
    }

    /// Simulate a partition: while unavailable every request fails, but lease
    /// clocks keep running.
    pub fn set_available(&self, available: bool) {
        self.inner.available.store(available, Ordering::SeqCst);
        info!("Memory store availability set to {}", available);
    }

    pub fn is_available(&self) -> bool {
        self.inner.available.load(Ordering::SeqCst)
    }

    /// Current store revision
    pub fn revision(&self) -> Revision {
        self.inner.state.lock().revision
    }

    /// Remaining time before a lease expires, if it is still alive
    pub fn lease_remaining(&self, id: LeaseId) -> Option<Duration> {
        self.inner.expire_leases();
        let state = self.inner.state.lock();
        state
            .leases
            .get(&id)
            .map(|lease| lease.deadline.saturating_duration_since(Instant::now()))
    }

    /// Reap every lease whose deadline has passed
    pub fn expire_leases(&self) {
        self.inner.expire_leases();
    }
}

impl Default for MemoryKvStore {
    fn default() -> Self {
        Self::new()
    }
}

impl StoreInner {
    fn check_available(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("memory store is partitioned".to_string()))
        }
    }

    /// Lock the state after reaping expired leases
    fn begin(&self) -> Result<parking_lot::MutexGuard<'_, State>> {
        self.check_available()?;
        let mut state = self.state.lock();
        self.reap(&mut state);
        Ok(state)
    }

    fn expire_leases(&self) {
        let mut state = self.state.lock();
        self.reap(&mut state);
    }

    fn reap(&self, state: &mut State) {
        let now = Instant::now();
        let mut expired: Vec<LeaseId> = state
            .leases
            .iter()
            .filter(|(_, lease)| lease.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        expired.sort_unstable();

        for id in expired {
            let deleted = self.remove_lease(state, id);
            info!("Lease {:x} expired, deleted {} attached keys", id, deleted);
        }
    }

    /// Drop a lease and every key bound to it at a single revision
    fn remove_lease(&self, state: &mut State, id: LeaseId) -> usize {
        let Some(lease) = state.leases.remove(&id) else {
            return 0;
        };
        if lease.keys.is_empty() {
            return 0;
        }

        state.revision += 1;
        let revision = state.revision;
        let mut deleted = 0;
        for key in lease.keys {
            if let Some(mut kv) = state.kvs.remove(&key) {
                kv.mod_revision = revision;
                self.emit(
                    state,
                    WatchEvent {
                        kind: EventType::Deleted,
                        kv,
                        revision,
                    },
                );
                deleted += 1;
            }
        }
        deleted
    }

    fn emit(&self, state: &mut State, event: WatchEvent) {
        state.history.push_back(event.clone());
        while state.history.len() > self.history_limit {
            if let Some(old) = state.history.pop_front() {
                state.compacted = old.revision;
            }
        }
        // No receivers is fine: nobody is watching
        let _ = self.events.send(event);
    }

    fn apply_put(
        &self,
        state: &mut State,
        key: &str,
        value: Bytes,
        options: &PutOptions,
    ) -> Result<PutResponse> {
        if let Some(lease) = options.lease
            && !state.leases.contains_key(&lease)
        {
            return Err(StoreError::LeaseNotFound(lease));
        }

        let prev_kv = state.kvs.get(key).cloned();
        if options.if_absent && prev_kv.is_some() {
            return Ok(PutResponse {
                revision: state.revision,
                written: false,
                prev_kv,
            });
        }

        state.revision += 1;
        let revision = state.revision;

        if let Some(old_lease) = prev_kv.as_ref().and_then(|kv| kv.lease)
            && Some(old_lease) != options.lease
            && let Some(entry) = state.leases.get_mut(&old_lease)
        {
            entry.keys.remove(key);
        }
        if let Some(lease) = options.lease
            && let Some(entry) = state.leases.get_mut(&lease)
        {
            entry.keys.insert(key.to_string());
        }

        let kv = KeyValue {
            key: key.to_string(),
            value,
            create_revision: prev_kv
                .as_ref()
                .map(|kv| kv.create_revision)
                .unwrap_or(revision),
            mod_revision: revision,
            version: prev_kv.as_ref().map(|kv| kv.version).unwrap_or(0) + 1,
            lease: options.lease,
        };
        state.kvs.insert(key.to_string(), kv.clone());

        let kind = if prev_kv.is_some() {
            EventType::Modified
        } else {
            EventType::Created
        };
        self.emit(
            state,
            WatchEvent {
                kind,
                kv,
                revision,
            },
        );

        Ok(PutResponse {
            revision,
            written: true,
            prev_kv,
        })
    }

    fn apply_delete(&self, state: &mut State, key: &str) -> DeleteResponse {
        let Some(mut kv) = state.kvs.remove(key) else {
            return DeleteResponse {
                deleted: 0,
                revision: state.revision,
                prev_kv: None,
            };
        };

        state.revision += 1;
        let revision = state.revision;
        if let Some(lease) = kv.lease
            && let Some(entry) = state.leases.get_mut(&lease)
        {
            entry.keys.remove(key);
        }

        let prev_kv = kv.clone();
        kv.mod_revision = revision;
        self.emit(
            state,
            WatchEvent {
                kind: EventType::Deleted,
                kv,
                revision,
            },
        );

        DeleteResponse {
            deleted: 1,
            revision,
            prev_kv: Some(prev_kv),
        }
    }

    fn apply_range(state: &State, prefix: &str, options: &RangeOptions) -> RangeResponse {
        let mut kvs: Vec<KeyValue> = state
            .kvs
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(_, kv)| kv)
            .filter(|kv| {
                options
                    .max_create_revision
                    .is_none_or(|max| kv.create_revision <= max)
            })
            .cloned()
            .collect();

        match options.order {
            SortOrder::Ascend => kvs.sort_by_key(|kv| kv.create_revision),
            SortOrder::Descend => kvs.sort_by_key(|kv| std::cmp::Reverse(kv.create_revision)),
        }
        if let Some(limit) = options.limit {
            kvs.truncate(limit);
        }

        RangeResponse {
            kvs,
            revision: state.revision,
        }
    }

    fn evaluate(state: &State, compare: &Compare) -> bool {
        let kv = state.kvs.get(&compare.key);
        match &compare.target {
            CompareTarget::CreateRevision(expected) => {
                let actual = kv.map(|kv| kv.create_revision).unwrap_or(0);
                compare.op.apply(&actual, expected)
            }
            CompareTarget::ModRevision(expected) => {
                let actual = kv.map(|kv| kv.mod_revision).unwrap_or(0);
                compare.op.apply(&actual, expected)
            }
            CompareTarget::Version(expected) => {
                let actual = kv.map(|kv| kv.version).unwrap_or(0);
                compare.op.apply(&actual, expected)
            }
            CompareTarget::Value(expected) => match kv {
                Some(kv) => compare.op.apply(&kv.value, expected),
                None => false,
            },
            CompareTarget::Lease(expected) => {
                let actual = kv.and_then(|kv| kv.lease).unwrap_or(0);
                compare.op.apply(&actual, expected)
            }
        }
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn lease_grant(&self, ttl: Duration) -> Result<LeaseGrant> {
        if ttl.is_zero() {
            return Err(StoreError::InvalidTtl);
        }

        let mut state = self.inner.begin()?;
        let id = state.next_lease;
        state.next_lease += 1;
        state.leases.insert(
            id,
            LeaseEntry {
                ttl,
                deadline: Instant::now() + ttl,
                keys: BTreeSet::new(),
            },
        );
        debug!("Granted lease {:x} with ttl {:?}", id, ttl);

        Ok(LeaseGrant { id, ttl })
    }

    async fn lease_keep_alive(&self, id: LeaseId) -> Result<Option<Duration>> {
        let mut state = self.inner.begin()?;
        Ok(state.leases.get_mut(&id).map(|lease| {
            lease.deadline = Instant::now() + lease.ttl;
            lease.ttl
        }))
    }

    async fn lease_revoke(&self, id: LeaseId) -> Result<()> {
        let mut state = self.inner.begin()?;
        if !state.leases.contains_key(&id) {
            return Err(StoreError::LeaseNotFound(id));
        }
        let deleted = self.inner.remove_lease(&mut state, id);
        debug!("Revoked lease {:x}, deleted {} attached keys", id, deleted);
        Ok(())
    }

    async fn put(&self, key: &str, value: Bytes, options: PutOptions) -> Result<PutResponse> {
        let mut state = self.inner.begin()?;
        self.inner.apply_put(&mut state, key, value, &options)
    }

    async fn get(&self, key: &str) -> Result<Option<KeyValue>> {
        let state = self.inner.begin()?;
        Ok(state.kvs.get(key).cloned())
    }

    async fn range(&self, prefix: &str, options: RangeOptions) -> Result<RangeResponse> {
        let state = self.inner.begin()?;
        Ok(StoreInner::apply_range(&state, prefix, &options))
    }

    async fn delete(&self, key: &str) -> Result<DeleteResponse> {
        let mut state = self.inner.begin()?;
        Ok(self.inner.apply_delete(&mut state, key))
    }

    async fn txn(&self, txn: Txn) -> Result<TxnResponse> {
        let mut state = self.inner.begin()?;

        let succeeded = txn
            .compares
            .iter()
            .all(|compare| StoreInner::evaluate(&state, compare));
        let ops = if succeeded { txn.success } else { txn.failure };

        // Validate up front so a failing put never leaves a partial branch applied
        for op in &ops {
            if let TxnOp::Put {
                options:
                    PutOptions {
                        lease: Some(lease), ..
                    },
                ..
            } = op
                && !state.leases.contains_key(lease)
            {
                return Err(StoreError::LeaseNotFound(*lease));
            }
        }

        let mut responses = Vec::with_capacity(ops.len());
        for op in ops {
            let response = match op {
                TxnOp::Put {
                    key,
                    value,
                    options,
                } => TxnOpResponse::Put(self.inner.apply_put(&mut state, &key, value, &options)?),
                TxnOp::Get(key) => TxnOpResponse::Get(state.kvs.get(&key).cloned()),
                TxnOp::Range { prefix, options } => {
                    TxnOpResponse::Range(StoreInner::apply_range(&state, &prefix, &options))
                }
                TxnOp::Delete(key) => TxnOpResponse::Delete(self.inner.apply_delete(&mut state, &key)),
            };
            responses.push(response);
        }

        Ok(TxnResponse {
            succeeded,
            revision: state.revision,
            responses,
        })
    }

    async fn watch(&self, key: &str, start_revision: Revision) -> Result<WatchStream> {
        let state = self.inner.begin()?;
        let start = if start_revision <= 0 {
            state.revision + 1
        } else {
            start_revision
        };
        if start <= state.compacted {
            return Err(StoreError::Compacted {
                requested: start,
                compacted: state.compacted,
            });
        }

        let replay: Vec<Result<WatchEvent>> = state
            .history
            .iter()
            .filter(|event| event.kv.key == key && event.revision >= start)
            .cloned()
            .map(Ok)
            .collect();
        // Subscribing under the state lock guarantees no gap between replay and live events
        let receiver = self.inner.events.subscribe();
        drop(state);

        let key = key.to_string();
        let live = BroadcastStream::new(receiver).filter_map(move |item| {
            let item = match item {
                Ok(event) if event.kv.key == key && event.revision >= start => Some(Ok(event)),
                Ok(_) => None,
                Err(BroadcastStreamRecvError::Lagged(missed)) => {
                    Some(Err(StoreError::WatchLagged(missed)))
                }
            };
            futures::future::ready(item)
        });

        Ok(futures::stream::iter(replay).chain(live).boxed())
    }
}
