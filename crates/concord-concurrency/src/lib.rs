//! Concord Concurrency - distributed locking on a consensus key-value store
//!
//! This crate provides:
//! - Lease management with background keepalive
//! - Sessions: one lease per client, explicitly opened and closed
//! - A fair, revision-ordered distributed mutex (lock / try_lock / unlock)
//! - Fenced writes and the `with_lock` guarded helper

pub mod config;
pub mod context;
pub mod error;
pub mod guard;
pub mod lease;
pub mod mutex;
pub mod session;

// Re-export commonly used types
pub use config::SessionConfig;
pub use context::CancelSignal;
pub use error::{LockError, Result};
pub use guard::{Fence, GuardedError, with_lock};
pub use lease::{Lease, LeaseManager, LeaseState};
pub use mutex::{Mutex, MutexState};
pub use session::Session;
