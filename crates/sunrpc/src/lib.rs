//! ONC RPC transport layer for driftfs.
//!
//! This crate owns the wire-facing half of the client: the [`Transport`]
//! trait that the request engine submits pre-built call bodies through, a
//! TCP implementation with record marking, and the identifiers needed to
//! reason about request/reply pairing (procedure numbers, NFS status
//! codes). Argument and reply *bodies* are opaque [`bytes::Bytes`] here —
//! XDR for individual procedures lives with whoever builds the buffers.

pub mod error;
mod proc;
mod record;
mod transport;

pub use error::TransportError;
pub use proc::{NfsProgram, NfsStat, Procedure, NFS_PROGRAM};
pub use transport::{AuthFlavor, RpcCall, RpcReply, TcpTransport, Transport};
