//! Lock and session error types

use concord_store::{Revision, StoreError};

/// Error type for session and mutex operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LockError {
    /// Transient; the caller may retry the whole operation
    #[error("store unavailable: {0}")]
    StoreUnavailable(#[source] StoreError),

    #[error("lease ttl must be positive")]
    InvalidTtl,

    #[error("operation cancelled")]
    Cancelled,

    /// Unrecoverable for the session; open a new one
    #[error("session lost")]
    SessionLost,

    #[error("mutex is not held")]
    NotHeld,

    #[error("mutex is held by another session")]
    WouldBlock,

    #[error("mutex is already locked by this instance")]
    AlreadyLocked,

    /// A guarded write reached the store after the lock key was gone
    #[error("fenced: lock key '{key}' is no longer owned at revision {revision}")]
    Fenced { key: String, revision: Revision },
}

impl LockError {
    /// Whether retrying the operation later may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, LockError::StoreUnavailable(_))
    }
}

impl From<StoreError> for LockError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::LeaseNotFound(_) => LockError::SessionLost,
            StoreError::InvalidTtl => LockError::InvalidTtl,
            other => LockError::StoreUnavailable(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, LockError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(LockError::NotHeld.to_string(), "mutex is not held");
        assert_eq!(
            LockError::WouldBlock.to_string(),
            "mutex is held by another session"
        );

        let err = LockError::Fenced {
            key: "/r/1".to_string(),
            revision: 5,
        };
        assert_eq!(
            err.to_string(),
            "fenced: lock key '/r/1' is no longer owned at revision 5"
        );
    }

    #[test]
    fn test_from_store_error() {
        let err: LockError = StoreError::LeaseNotFound(7).into();
        assert_eq!(err, LockError::SessionLost);

        let err: LockError = StoreError::InvalidTtl.into();
        assert_eq!(err, LockError::InvalidTtl);

        let err: LockError = StoreError::Timeout.into();
        assert!(matches!(err, LockError::StoreUnavailable(StoreError::Timeout)));
        assert!(err.is_retryable());
        assert!(!LockError::Cancelled.is_retryable());
    }
}
