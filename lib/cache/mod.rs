//! Per-node metadata caching.

/// Access-rights ring cache.
pub mod access;
/// Attribute cache with TTL and transaction ordering.
pub mod attr;

pub use access::{Access, AccessRing};
pub use attr::{AttrCache, AttrError, AttrTimeouts};
