//! NFSv4 state-error recovery.
//!
//! When the server invalidates client-held state (rebooted, expired the
//! lease, forgot a stateid), every outstanding operation starts failing
//! with a state error at once. The gate makes sure exactly one of them
//! triggers the mount-wide recovery sequence: recovery runs under a state
//! generation id, and an error observed against an older generation is
//! evidence of an already-repaired cause, not a new one.
//!
//! The restart loop is a bounded combinator rather than ad hoc retry
//! sites: the bound and the restart counting live here and nowhere else.

use std::future::Future;
use std::sync::Mutex;

use tokio::sync::Notify;
use tracing::{debug, warn};

use super::RpcError;

/// Drives the actual recovery traffic (renew, reclaim opens/locks).
/// Supplied by the mount; scripted in tests.
pub trait RecoveryHandler: Send + Sync {
    /// Re-establish server-side state. `generation` identifies which
    /// invalidation event is being repaired.
    fn recover(&self, generation: u64) -> impl Future<Output = Result<(), RpcError>> + Send;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Normal,
    Recovering,
}

#[derive(Debug)]
struct GateState {
    phase: Phase,
    /// Bumped after every completed recovery.
    generation: u64,
}

/// Serializes recovery and stamps operations with the state generation.
#[derive(Debug)]
pub struct RecoveryGate {
    state: Mutex<GateState>,
    notify: Notify,
    max_restarts: u32,
}

impl RecoveryGate {
    #[must_use]
    pub fn new(max_restarts: u32) -> Self {
        Self {
            state: Mutex::new(GateState {
                phase: Phase::Normal,
                generation: 0,
            }),
            notify: Notify::new(),
            max_restarts,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, GateState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// The current state generation.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.lock().generation
    }

    /// Wait until no recovery is in progress; returns the generation the
    /// caller's operation should run under.
    pub async fn ready(&self) -> u64 {
        loop {
            let mut notified = std::pin::pin!(self.notify.notified());
            notified.as_mut().enable();
            {
                let st = self.lock();
                if st.phase == Phase::Normal {
                    return st.generation;
                }
            }
            notified.await;
        }
    }

    /// Claim the right to run recovery for a state error observed at
    /// `seen_generation`. Exactly one concurrent caller per generation
    /// gets `true`; an error against an older generation never triggers —
    /// its cause was already repaired.
    fn try_begin(&self, seen_generation: u64) -> bool {
        let mut st = self.lock();
        if st.phase == Phase::Recovering || st.generation != seen_generation {
            return false;
        }
        st.phase = Phase::Recovering;
        true
    }

    /// Finish a recovery claimed via `try_begin`, bumping the generation
    /// and waking everything parked in [`ready`](Self::ready).
    fn finish(&self) {
        {
            let mut st = self.lock();
            st.phase = Phase::Normal;
            st.generation += 1;
        }
        self.notify.notify_waiters();
    }

    /// Run `op` with automatic state-error recovery.
    ///
    /// Each iteration waits out any in-flight recovery, runs `op` under
    /// the current generation, and on a state error triggers recovery
    /// (unless one is already pending for the same cause) and re-issues.
    /// At most `max_restarts` re-issues; then the bound surfaces as
    /// [`RpcError::RestartsExhausted`].
    pub async fn run<H, F, Fut, T>(&self, handler: &H, mut op: F) -> Result<T, RpcError>
    where
        H: RecoveryHandler,
        F: FnMut(u64) -> Fut,
        Fut: Future<Output = Result<T, RpcError>>,
    {
        let mut restarts = 0u32;
        loop {
            let generation = self.ready().await;
            match op(generation).await {
                Err(e) if e.should_restart() => {
                    if restarts >= self.max_restarts {
                        warn!(
                            restarts,
                            error = %e,
                            "state errors persist past the restart bound"
                        );
                        return Err(RpcError::RestartsExhausted(self.max_restarts));
                    }
                    restarts += 1;
                    debug!(restarts, generation, error = %e, "state error, recovering");

                    if self.try_begin(generation) {
                        let result = handler.recover(generation).await;
                        self.finish();
                        if let Err(re) = result {
                            // The next attempt will fail and come back
                            // around; the restart bound still holds.
                            warn!(generation, error = %re, "recovery attempt failed");
                        }
                    }
                    // Someone else is (or was) recovering: loop back to
                    // `ready` and re-issue.
                }
                other => return other,
            }
        }
    }

    /// A guard-style pass for requests that must bypass the gate — the
    /// recovery traffic itself (`RECOVERY`-flagged requests) would
    /// deadlock waiting on the recovery they implement.
    #[must_use]
    pub fn is_recovering(&self) -> bool {
        self.lock().phase == Phase::Recovering
    }
}
