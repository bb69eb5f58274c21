//! Wire-level error types.

use thiserror::Error;

/// Errors raised by a [`Transport`](crate::Transport) implementation.
///
/// These describe transport and RPC-layer failures only. NFS-level status
/// codes travel inside a successful reply as [`NfsStat`](crate::NfsStat) —
/// a reply that decodes cleanly is `Ok` even if the server said `NFSERR_*`.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("I/O error")]
    Io(#[from] std::io::Error),

    #[error("connection closed while {0} calls were outstanding")]
    ConnectionClosed(usize),

    #[error("record exceeds maximum fragment size ({size} > {max})")]
    OversizedRecord { size: usize, max: usize },

    #[error("malformed reply header: {0}")]
    MalformedReply(&'static str),

    #[error("server rejected the call (rpc reject status {0})")]
    Rejected(u32),

    #[error("server does not support the requested program/version")]
    ProgramMismatch,

    #[error("call could not be submitted (connection task gone)")]
    Submit,
}

impl TransportError {
    /// Whether the failure is plausibly transient — the caller may retry
    /// on a fresh connection. Rejections and program mismatches are not.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Io(_) | Self::ConnectionClosed(_) | Self::Submit
        )
    }
}
