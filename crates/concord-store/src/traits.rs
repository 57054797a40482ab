//! Consensus store boundary trait

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::Result;
use crate::model::*;

/// Linearizable key-value store with leases and watches.
///
/// Every call is assumed atomic and durable once acknowledged. Implementations
/// must delete all keys attached to a lease atomically with the lease's
/// expiry or revocation.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Grant a lease with the requested time-to-live
    async fn lease_grant(&self, ttl: Duration) -> Result<LeaseGrant>;

    /// Renew a lease; `None` means the lease no longer exists
    async fn lease_keep_alive(&self, id: LeaseId) -> Result<Option<Duration>>;

    /// Revoke a lease and delete every key attached to it
    async fn lease_revoke(&self, id: LeaseId) -> Result<()>;

    /// Write a key
    async fn put(&self, key: &str, value: Bytes, options: PutOptions) -> Result<PutResponse>;

    /// Read a single key
    async fn get(&self, key: &str) -> Result<Option<KeyValue>>;

    /// List keys under a prefix ordered by create revision
    async fn range(&self, prefix: &str, options: RangeOptions) -> Result<RangeResponse>;

    /// Delete a single key; deleting an absent key is not an error
    async fn delete(&self, key: &str) -> Result<DeleteResponse>;

    /// Run a guarded transaction
    async fn txn(&self, txn: Txn) -> Result<TxnResponse>;

    /// Watch one key for changes at or after `start_revision`
    async fn watch(&self, key: &str, start_revision: Revision) -> Result<WatchStream>;
}
