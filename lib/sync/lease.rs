//! Exclusive-or-shared lease for serializing long-lived operations.
//!
//! Several entity kinds (nodes, open-owners, open-files, lock-owners) need
//! a "busy" state that outlives any single critical section: a multi-step
//! operation marks the entity busy, performs RPC round-trips, and releases.
//! This is that primitive, implemented once instead of hand-rolling a
//! flag + wait queue per entity type.
//!
//! Unlike the short-hold per-node mutex, a lease guard may be held across
//! `.await` points. Shared holders coexist; an exclusive holder excludes
//! everyone.

use std::sync::Mutex;

use tokio::sync::Notify;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    Shared(u32),
    Exclusive,
}

/// A shared-or-exclusive busy lease.
#[derive(Debug)]
pub struct Lease {
    state: Mutex<State>,
    notify: Notify,
}

impl Default for Lease {
    fn default() -> Self {
        Self::new()
    }
}

impl Lease {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::Idle),
            notify: Notify::new(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Acquire the lease in shared mode, waiting out any exclusive holder.
    pub async fn acquire_shared(&self) -> LeaseSharedGuard<'_> {
        loop {
            // Register with the Notify *before* checking state, so a
            // release firing between the check and the await is not lost
            // (notify_waiters stores no permit).
            let mut notified = std::pin::pin!(self.notify.notified());
            notified.as_mut().enable();
            {
                let mut st = self.lock();
                match *st {
                    State::Idle => {
                        *st = State::Shared(1);
                        return LeaseSharedGuard { lease: self };
                    }
                    State::Shared(n) => {
                        *st = State::Shared(n + 1);
                        return LeaseSharedGuard { lease: self };
                    }
                    State::Exclusive => {}
                }
            }
            notified.await;
        }
    }

    /// Acquire the lease exclusively, waiting for all holders to drain.
    pub async fn acquire_exclusive(&self) -> LeaseExclusiveGuard<'_> {
        loop {
            let mut notified = std::pin::pin!(self.notify.notified());
            notified.as_mut().enable();
            {
                let mut st = self.lock();
                if *st == State::Idle {
                    *st = State::Exclusive;
                    return LeaseExclusiveGuard { lease: self };
                }
            }
            notified.await;
        }
    }

    /// Take the lease exclusively only if it is currently idle.
    #[must_use]
    pub fn try_exclusive(&self) -> Option<LeaseExclusiveGuard<'_>> {
        let mut st = self.lock();
        if *st == State::Idle {
            *st = State::Exclusive;
            Some(LeaseExclusiveGuard { lease: self })
        } else {
            None
        }
    }

    /// Whether any holder (shared or exclusive) currently exists.
    #[must_use]
    pub fn is_busy(&self) -> bool {
        *self.lock() != State::Idle
    }

    fn release_shared(&self) {
        let mut st = self.lock();
        match *st {
            State::Shared(1) => {
                *st = State::Idle;
                drop(st);
                self.notify.notify_waiters();
            }
            State::Shared(n) => *st = State::Shared(n - 1),
            State::Idle | State::Exclusive => {
                debug_assert!(false, "shared release without shared hold");
            }
        }
    }

    fn release_exclusive(&self) {
        let mut st = self.lock();
        debug_assert_eq!(*st, State::Exclusive, "exclusive release without hold");
        *st = State::Idle;
        drop(st);
        self.notify.notify_waiters();
    }
}

/// Releases one shared hold on drop.
#[derive(Debug)]
pub struct LeaseSharedGuard<'a> {
    lease: &'a Lease,
}

impl Drop for LeaseSharedGuard<'_> {
    fn drop(&mut self) {
        self.lease.release_shared();
    }
}

/// Releases the exclusive hold on drop.
#[derive(Debug)]
pub struct LeaseExclusiveGuard<'a> {
    lease: &'a Lease,
}

impl Drop for LeaseExclusiveGuard<'_> {
    fn drop(&mut self) {
        self.lease.release_exclusive();
    }
}
