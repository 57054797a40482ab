//! Store data model
//!
//! Request and response types spoken across the consensus store boundary.
//! Revisions and lease ids follow the etcd convention of signed 64-bit
//! integers where `0` means "absent".

use std::time::Duration;

use bytes::Bytes;
use futures::stream::BoxStream;

use crate::error::Result;

/// Store-assigned, strictly increasing sequence number identifying write order
pub type Revision = i64;

/// Opaque lease token issued by the store
pub type LeaseId = i64;

/// A single key/value record as stored
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    pub key: String,
    pub value: Bytes,
    /// Revision of the write that created the key (0 = absent)
    pub create_revision: Revision,
    /// Revision of the last write to the key
    pub mod_revision: Revision,
    /// Number of writes since creation
    pub version: i64,
    /// Lease the key is bound to, if any
    pub lease: Option<LeaseId>,
}

impl KeyValue {
    /// Value interpreted as UTF-8 (lossy)
    pub fn value_str(&self) -> String {
        String::from_utf8_lossy(&self.value).into_owned()
    }
}

/// Result of a lease grant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaseGrant {
    pub id: LeaseId,
    pub ttl: Duration,
}

/// Options for a put
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PutOptions {
    /// Attach the key to this lease
    pub lease: Option<LeaseId>,
    /// Only write if the key does not exist yet
    pub if_absent: bool,
}

impl PutOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_lease(mut self, lease: LeaseId) -> Self {
        self.lease = Some(lease);
        self
    }

    pub fn if_absent(mut self) -> Self {
        self.if_absent = true;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutResponse {
    /// Store revision after the request
    pub revision: Revision,
    /// False when `if_absent` was requested and the key already existed
    pub written: bool,
    /// Record before the put, if the key existed
    pub prev_kv: Option<KeyValue>,
}

/// Ordering of range results by create revision
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SortOrder {
    #[default]
    Ascend,
    Descend,
}

/// Options for a prefix range
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RangeOptions {
    /// Only return keys whose create revision is at most this value
    pub max_create_revision: Option<Revision>,
    /// Maximum number of keys to return (after sorting)
    pub limit: Option<usize>,
    pub order: SortOrder,
}

impl RangeOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_create_revision(mut self, revision: Revision) -> Self {
        self.max_create_revision = Some(revision);
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn descending(mut self) -> Self {
        self.order = SortOrder::Descend;
        self
    }

    /// The single key with the largest create revision not above `revision`
    pub fn last_created_before(revision: Revision) -> Self {
        Self::new()
            .with_max_create_revision(revision)
            .descending()
            .with_limit(1)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeResponse {
    /// Matching keys, sorted by create revision
    pub kvs: Vec<KeyValue>,
    /// Store revision the read was served at
    pub revision: Revision,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteResponse {
    /// Number of keys deleted (0 or 1)
    pub deleted: u64,
    pub revision: Revision,
    pub prev_kv: Option<KeyValue>,
}

/// Comparison operator for transaction guards
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Equal,
    NotEqual,
    Greater,
    Less,
}

impl CompareOp {
    pub(crate) fn apply<T: Ord>(self, actual: &T, expected: &T) -> bool {
        match self {
            CompareOp::Equal => actual == expected,
            CompareOp::NotEqual => actual != expected,
            CompareOp::Greater => actual > expected,
            CompareOp::Less => actual < expected,
        }
    }
}

/// Field of a key a transaction guard inspects
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompareTarget {
    CreateRevision(Revision),
    ModRevision(Revision),
    Version(i64),
    Value(Bytes),
    /// Lease the key is attached to (0 = none or absent)
    Lease(LeaseId),
}

/// A transaction guard on one key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Compare {
    pub key: String,
    pub op: CompareOp,
    pub target: CompareTarget,
}

impl Compare {
    pub fn create_revision(key: impl Into<String>, op: CompareOp, revision: Revision) -> Self {
        Self {
            key: key.into(),
            op,
            target: CompareTarget::CreateRevision(revision),
        }
    }

    pub fn mod_revision(key: impl Into<String>, op: CompareOp, revision: Revision) -> Self {
        Self {
            key: key.into(),
            op,
            target: CompareTarget::ModRevision(revision),
        }
    }

    pub fn version(key: impl Into<String>, op: CompareOp, version: i64) -> Self {
        Self {
            key: key.into(),
            op,
            target: CompareTarget::Version(version),
        }
    }

    pub fn value(key: impl Into<String>, op: CompareOp, value: impl Into<Bytes>) -> Self {
        Self {
            key: key.into(),
            op,
            target: CompareTarget::Value(value.into()),
        }
    }

    pub fn lease(key: impl Into<String>, op: CompareOp, lease: LeaseId) -> Self {
        Self {
            key: key.into(),
            op,
            target: CompareTarget::Lease(lease),
        }
    }
}

/// One operation inside a transaction branch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxnOp {
    Put {
        key: String,
        value: Bytes,
        options: PutOptions,
    },
    Get(String),
    Range {
        prefix: String,
        options: RangeOptions,
    },
    Delete(String),
}

impl TxnOp {
    pub fn put(key: impl Into<String>, value: impl Into<Bytes>, options: PutOptions) -> Self {
        TxnOp::Put {
            key: key.into(),
            value: value.into(),
            options,
        }
    }

    pub fn get(key: impl Into<String>) -> Self {
        TxnOp::Get(key.into())
    }

    pub fn range(prefix: impl Into<String>, options: RangeOptions) -> Self {
        TxnOp::Range {
            prefix: prefix.into(),
            options,
        }
    }

    pub fn delete(key: impl Into<String>) -> Self {
        TxnOp::Delete(key.into())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxnOpResponse {
    Put(PutResponse),
    Get(Option<KeyValue>),
    Range(RangeResponse),
    Delete(DeleteResponse),
}

/// Atomic if/then/else over the key space
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Txn {
    pub compares: Vec<Compare>,
    pub success: Vec<TxnOp>,
    pub failure: Vec<TxnOp>,
}

impl Txn {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn when(mut self, compares: impl IntoIterator<Item = Compare>) -> Self {
        self.compares.extend(compares);
        self
    }

    pub fn and_then(mut self, ops: impl IntoIterator<Item = TxnOp>) -> Self {
        self.success.extend(ops);
        self
    }

    pub fn or_else(mut self, ops: impl IntoIterator<Item = TxnOp>) -> Self {
        self.failure.extend(ops);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxnResponse {
    /// Whether every compare held (the success branch ran)
    pub succeeded: bool,
    /// Store revision after the transaction
    pub revision: Revision,
    /// One response per operation of the branch that ran
    pub responses: Vec<TxnOpResponse>,
}

impl TxnResponse {
    /// The `index`-th response if it is a get
    pub fn get(&self, index: usize) -> Option<&Option<KeyValue>> {
        match self.responses.get(index) {
            Some(TxnOpResponse::Get(kv)) => Some(kv),
            _ => None,
        }
    }

    /// The `index`-th response if it is a range
    pub fn range(&self, index: usize) -> Option<&RangeResponse> {
        match self.responses.get(index) {
            Some(TxnOpResponse::Range(range)) => Some(range),
            _ => None,
        }
    }
}

/// Kind of change observed by a watch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Created,
    Modified,
    Deleted,
}

/// A change to a watched key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub kind: EventType,
    /// Record after the change; for deletions the last known record
    pub kv: KeyValue,
    /// Revision at which the change happened
    pub revision: Revision,
}

impl WatchEvent {
    pub fn is_delete(&self) -> bool {
        self.kind == EventType::Deleted
    }
}

/// Stream of changes for one watched key
pub type WatchStream = BoxStream<'static, Result<WatchEvent>>;
