//! Store error types

use crate::model::{LeaseId, Revision};

/// Error returned by a consensus key-value store
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("lease {0:x} not found")]
    LeaseNotFound(LeaseId),

    #[error("lease ttl must be positive")]
    InvalidTtl,

    #[error("revision {requested} has been compacted (compacted up to {compacted})")]
    Compacted {
        requested: Revision,
        compacted: Revision,
    },

    #[error("watch fell behind by {0} events")]
    WatchLagged(u64),

    #[error("request timeout")]
    Timeout,
}

impl StoreError {
    /// Whether retrying the same request later may succeed
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StoreError::Unavailable(_) | StoreError::Timeout | StoreError::WatchLagged(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
