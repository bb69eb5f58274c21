//! Synchronization primitives.

pub mod lease;

pub use lease::{Lease, LeaseExclusiveGuard, LeaseSharedGuard};
