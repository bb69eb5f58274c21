//! The request engine: transaction ids, dispatch, retry, and recovery.

/// Request submission, worker pool, and timeout policy.
pub mod engine;
/// NFSv4 state-error recovery gate.
pub mod recovery;
/// Transaction-id allocation.
pub mod xid;

use bitflags::bitflags;
use sunrpc::{NfsStat, TransportError};
use thiserror::Error;

pub use engine::{AsyncPool, Engine, EngineConfig, PoolConfig, RequestOutcome};
pub use recovery::{RecoveryGate, RecoveryHandler};
pub use xid::XidAllocator;

bitflags! {
    /// Per-request behavior flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct RequestFlags: u32 {
        /// Queue for a worker instead of awaiting inline.
        const ASYNC    = 1 << 0;
        /// Bounded retries; timeout surfaces as an error.
        const SOFT     = 1 << 1;
        /// Ignore interruption — unmount-critical requests must complete.
        const NOINTR   = 1 << 2;
        /// Issued by the recovery sequence itself; exempt from the
        /// recovery gate so recovery can make progress.
        const RECOVERY = 1 << 3;
        /// Mount/session setup traffic.
        const SETUP    = 1 << 4;
    }
}

/// The error taxonomy surfaced to callers of the engine.
#[derive(Debug, Error)]
pub enum RpcError {
    /// Transport-level retries exhausted (soft mounts) — transient;
    /// the caller may retry the whole operation later.
    #[error("request timed out after {attempts} attempts")]
    TimedOut { attempts: u32 },

    /// The file handle no longer identifies the file it used to. Not
    /// retried here; the caller may re-resolve the path for a new handle.
    #[error("stale file handle")]
    StaleHandle,

    /// Permission denied. Never retried.
    #[error("permission denied")]
    Permission,

    /// The reply could not be interpreted.
    #[error("malformed reply: {0}")]
    Protocol(&'static str),

    /// A state error the recovery gate handles; carries the exact status
    /// for diagnostics.
    #[error("server state error {0:?}")]
    State(NfsStat),

    /// Recovery ran but the server kept erroring past the restart bound.
    #[error("recovery did not converge after {0} restarts")]
    RestartsExhausted(u32),

    /// The mount is shutting down; nothing new is accepted.
    #[error("mount is shutting down")]
    Unmounted,

    /// The waiting call was interrupted (and the request canceled).
    #[error("operation interrupted")]
    Interrupted,

    /// The transport failed in a way retry policy did not absorb.
    #[error("transport failure")]
    Transport(#[source] TransportError),

    /// Any other server status, surfaced verbatim (name errors etc.).
    #[error("server returned {0:?}")]
    Status(NfsStat),
}

impl RpcError {
    /// Map a reply's NFS status onto the taxonomy. `None` means success.
    #[must_use]
    pub fn from_status(stat: NfsStat) -> Option<Self> {
        match stat {
            NfsStat::Ok => None,
            s if s.is_stale_handle() => Some(Self::StaleHandle),
            NfsStat::Perm | NfsStat::Access => Some(Self::Permission),
            s if s.is_state_error() => Some(Self::State(s)),
            s => Some(Self::Status(s)),
        }
    }

    /// Whether this error must route through mount-wide recovery before
    /// the request can be re-issued.
    #[must_use]
    pub fn should_restart(&self) -> bool {
        matches!(self, Self::State(_))
    }

    /// Transient class: safe to retry without any state repair.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::TimedOut { .. } | Self::Status(NfsStat::Delay) => true,
            Self::Transport(e) => e.is_transient(),
            _ => false,
        }
    }
}
