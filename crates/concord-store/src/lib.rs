//! Concord Store - consensus key-value store boundary
//!
//! This crate provides:
//! - The `KvStore` trait: leases, put/get/range/delete, guarded transactions
//!   and single-key watches, as consumed by the lock primitives
//! - Request/response model types (revisions, lease ids, compares, events)
//! - `MemoryKvStore`: a linearizable in-process reference implementation with
//!   lease expiry, watch replay and partition simulation

pub mod error;
pub mod memory;
pub mod model;
pub mod traits;

pub use error::{Result, StoreError};
pub use memory::MemoryKvStore;
pub use model::*;
pub use traits::KvStore;
