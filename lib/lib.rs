//! driftfs client core.
//!
//! The in-memory half of a stateful network filesystem client: node
//! registry, attribute/access caches, the RPC request engine with NFSv4
//! recovery, directory buffers with cookie caching, and open/lock state
//! tracking. Wire transport lives in the `sunrpc` crate; this crate never
//! sees XDR bodies.

/// Attribute and access-rights caching.
pub mod cache;
/// Directory buffers and the cookie cache.
pub mod dir;
pub mod mount;
/// The node registry and per-node locking.
pub mod node;
/// Request lifecycle, worker pool, and recovery.
pub mod rpc;
/// NFSv4 open-owner / open-file / lock-owner tracking.
pub mod state;
/// Synchronization primitives.
pub mod sync;
