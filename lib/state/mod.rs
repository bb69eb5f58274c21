//! NFSv4 open and lock state tracking.
//!
//! The stateful protocol version makes the client responsible for
//! remembering what it holds: which (owner, file) pairs are open with
//! which share modes, which byte ranges are locked, and which of those the
//! server actually knows about (a delegation lets the client open locally
//! without a round-trip). The request engine's recovery logic walks these
//! structures to reclaim state after a server reboot, and close paths
//! consult them to compute the minimal downgrade to send.
//!
//! Every entity kind carries its own [`Lease`] so state-mutating RPCs for
//! one entity serialize without stalling unrelated entities.

use std::sync::{Arc, Mutex};

use rustc_hash::FxHashMap;
use tracing::trace;

use crate::sync::Lease;

/// Share bits used for both access and deny modes. The wire encodes
/// access in {1, 2, 3} and deny in {0, 1, 2, 3}.
pub const SHARE_NONE: u8 = 0;
pub const SHARE_READ: u8 = 1;
pub const SHARE_WRITE: u8 = 2;
pub const SHARE_BOTH: u8 = 3;

/// An NFSv4 state identifier as issued by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Stateid(pub [u8; 16]);

/// Protocol-level identity under which opens are made: one per
/// (credential, process) pair, distinct from OS credentials.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OwnerKey {
    pub uid: u32,
    pub pid: u32,
}

/// What the close path must send to the server, if anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseAction {
    /// Other openers still need the full footprint.
    None,
    /// The remaining footprint shrank; downgrade to it.
    Downgrade { access: u8, deny: u8 },
    /// Nothing remains; close the stateid.
    Close,
}

#[derive(Debug, Default)]
struct OpenCounts {
    /// `counts[access][deny]` — opens the server knows about.
    local: [[u32; 4]; 4],
    /// Opens performed locally under a delegation; the server has no
    /// per-open state for these.
    delegated: [[u32; 4]; 4],
}

impl OpenCounts {
    /// OR of (access, deny) bits over all server-visible opens.
    fn footprint(&self) -> (u8, u8) {
        let mut access = 0u8;
        let mut deny = 0u8;
        for (a, row) in self.local.iter().enumerate() {
            for (d, &count) in row.iter().enumerate() {
                if count > 0 {
                    #[expect(clippy::cast_possible_truncation, reason = "indices are 0..4")]
                    {
                        access |= a as u8;
                        deny |= d as u8;
                    }
                }
            }
        }
        (access, deny)
    }

    fn is_empty(&self) -> bool {
        let flat = |m: &[[u32; 4]; 4]| m.iter().flatten().all(|&c| c == 0);
        flat(&self.local) && flat(&self.delegated)
    }
}

#[derive(Debug, Default)]
struct OpenFileInner {
    counts: OpenCounts,
    stateid: Option<Stateid>,
    /// Recovery gave up on this state; drain must not try to close it.
    lost: bool,
    /// In-progress operations referencing this entity.
    refs: u32,
}

/// Open state for one (node, open-owner) pair.
#[derive(Debug)]
pub struct OpenFile {
    owner: OwnerKey,
    busy: Lease,
    inner: Mutex<OpenFileInner>,
}

impl OpenFile {
    fn new(owner: OwnerKey) -> Self {
        Self {
            owner,
            busy: Lease::new(),
            inner: Mutex::new(OpenFileInner::default()),
        }
    }

    #[must_use]
    pub fn owner(&self) -> OwnerKey {
        self.owner
    }

    /// Serializes state-mutating RPCs for this open-file.
    #[must_use]
    pub fn busy(&self) -> &Lease {
        &self.busy
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, OpenFileInner> {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Record an open. `access` must carry at least one share bit.
    pub fn note_open(&self, access: u8, deny: u8, delegated: bool) {
        debug_assert!(access >= SHARE_READ && access <= SHARE_BOTH);
        debug_assert!(deny <= SHARE_BOTH);
        let mut inner = self.lock();
        let m = if delegated {
            &mut inner.counts.delegated
        } else {
            &mut inner.counts.local
        };
        m[access as usize][deny as usize] += 1;
    }

    /// Record a close and compute what, if anything, must go to the
    /// server. The footprint only considers server-visible opens.
    pub fn note_close(&self, access: u8, deny: u8, delegated: bool) -> CloseAction {
        let mut inner = self.lock();
        let before = inner.counts.footprint();
        let m = if delegated {
            &mut inner.counts.delegated
        } else {
            &mut inner.counts.local
        };
        let slot = &mut m[access as usize][deny as usize];
        debug_assert!(*slot > 0, "close without matching open");
        *slot = slot.saturating_sub(1);

        if delegated {
            // The server never saw this open; nothing to send.
            return CloseAction::None;
        }
        let after = inner.counts.footprint();
        if after == (0, 0) {
            CloseAction::Close
        } else if after != before {
            CloseAction::Downgrade {
                access: after.0,
                deny: after.1,
            }
        } else {
            CloseAction::None
        }
    }

    pub fn set_stateid(&self, stateid: Stateid) {
        self.lock().stateid = Some(stateid);
    }

    #[must_use]
    pub fn stateid(&self) -> Option<Stateid> {
        self.lock().stateid
    }

    /// Mark the server-side state unrecoverable.
    pub fn mark_lost(&self) {
        self.lock().lost = true;
    }

    #[must_use]
    pub fn is_lost(&self) -> bool {
        self.lock().lost
    }

    /// No opens of any kind remain.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().counts.is_empty()
    }
}

/// A held byte-range lock. `end` is exclusive; `u64::MAX` means to EOF.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
    pub exclusive: bool,
}

#[derive(Debug, Default)]
struct LockOwnerInner {
    locks: Vec<ByteRange>,
    stateid: Option<Stateid>,
    lost: bool,
    refs: u32,
}

/// Lock state for one (node, process[, fd]) identity.
#[derive(Debug)]
pub struct LockOwner {
    pid: u32,
    /// Present for fd-scoped (OFD-style) lock owners.
    fd: Option<u64>,
    busy: Lease,
    inner: Mutex<LockOwnerInner>,
}

impl LockOwner {
    fn new(pid: u32, fd: Option<u64>) -> Self {
        Self {
            pid,
            fd,
            busy: Lease::new(),
            inner: Mutex::new(LockOwnerInner::default()),
        }
    }

    #[must_use]
    pub fn pid(&self) -> u32 {
        self.pid
    }

    #[must_use]
    pub fn busy(&self) -> &Lease {
        &self.busy
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LockOwnerInner> {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    pub fn note_locked(&self, range: ByteRange) {
        self.lock().locks.push(range);
    }

    /// Remove a held range. Returns `false` if it was not held.
    pub fn note_unlocked(&self, start: u64, end: u64) -> bool {
        let mut inner = self.lock();
        let before = inner.locks.len();
        inner.locks.retain(|r| !(r.start == start && r.end == end));
        inner.locks.len() != before
    }

    #[must_use]
    pub fn held(&self) -> Vec<ByteRange> {
        self.lock().locks.clone()
    }

    pub fn set_stateid(&self, stateid: Stateid) {
        self.lock().stateid = Some(stateid);
    }

    pub fn mark_lost(&self) {
        self.lock().lost = true;
    }

    #[must_use]
    pub fn is_lost(&self) -> bool {
        self.lock().lost
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().locks.is_empty()
    }
}

/// One best-effort cleanup the teardown driver should issue.
#[derive(Debug)]
pub enum DrainAction {
    /// Close this owner's open stateid.
    Close { owner: OwnerKey, stateid: Stateid },
    /// Release one byte-range lock.
    Unlock {
        pid: u32,
        stateid: Stateid,
        range: ByteRange,
    },
}

/// Per-node open/lock registries.
///
/// Entities are created on first use and destroyed only when their
/// reference count and their open/lock counts are both zero — a caller
/// holding an [`Arc`] mid-operation keeps the entity alive through
/// `release`.
#[derive(Debug, Default)]
pub struct NodeState {
    open_files: Mutex<FxHashMap<OwnerKey, Arc<OpenFile>>>,
    lock_owners: Mutex<FxHashMap<(u32, Option<u64>), Arc<LockOwner>>>,
}

impl NodeState {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn open_files(&self) -> std::sync::MutexGuard<'_, FxHashMap<OwnerKey, Arc<OpenFile>>> {
        self.open_files
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn lock_owners(
        &self,
    ) -> std::sync::MutexGuard<'_, FxHashMap<(u32, Option<u64>), Arc<LockOwner>>> {
        self.lock_owners
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Find or create the open-file for `owner`, taking a reference.
    pub fn open_file(&self, owner: OwnerKey) -> Arc<OpenFile> {
        let mut map = self.open_files();
        let of = Arc::clone(
            map.entry(owner)
                .or_insert_with(|| Arc::new(OpenFile::new(owner))),
        );
        of.lock().refs += 1;
        of
    }

    /// Drop a reference taken by [`open_file`](Self::open_file). The
    /// entity is destroyed once unreferenced and empty.
    pub fn release_open_file(&self, of: &Arc<OpenFile>) {
        let mut map = self.open_files();
        let (refs, empty) = {
            let mut inner = of.lock();
            inner.refs = inner.refs.saturating_sub(1);
            (inner.refs, inner.counts.is_empty())
        };
        if refs == 0 && empty {
            trace!(uid = of.owner.uid, pid = of.owner.pid, "destroying open-file state");
            map.remove(&of.owner);
        }
    }

    /// Find or create the lock-owner for `(pid, fd)`, taking a reference.
    pub fn lock_owner(&self, pid: u32, fd: Option<u64>) -> Arc<LockOwner> {
        let mut map = self.lock_owners();
        let lo = Arc::clone(
            map.entry((pid, fd))
                .or_insert_with(|| Arc::new(LockOwner::new(pid, fd))),
        );
        lo.lock().refs += 1;
        lo
    }

    pub fn release_lock_owner(&self, lo: &Arc<LockOwner>) {
        let mut map = self.lock_owners();
        let (refs, empty) = {
            let mut inner = lo.lock();
            inner.refs = inner.refs.saturating_sub(1);
            (inner.refs, inner.locks.is_empty())
        };
        if refs == 0 && empty {
            trace!(pid = lo.pid, "destroying lock-owner state");
            map.remove(&(lo.pid, lo.fd));
        }
    }

    #[must_use]
    pub fn open_file_count(&self) -> usize {
        self.open_files().len()
    }

    #[must_use]
    pub fn lock_owner_count(&self) -> usize {
        self.lock_owners().len()
    }

    /// Empty both registries and report the best-effort cleanups the
    /// caller should issue: unlocks first, then closes, skipping anything
    /// delegated-only, already lost, or without a stateid.
    ///
    /// With `force` set (the mount is being torn down underneath us) no
    /// actions are produced at all — nothing may block on the network.
    pub fn drain(&self, force: bool) -> Vec<DrainAction> {
        let mut actions = Vec::new();

        let lock_owners: Vec<_> = self.lock_owners().drain().map(|(_, v)| v).collect();
        for lo in lock_owners {
            let inner = lo.lock();
            if force || inner.lost {
                continue;
            }
            if let Some(stateid) = inner.stateid {
                for range in &inner.locks {
                    actions.push(DrainAction::Unlock {
                        pid: lo.pid,
                        stateid,
                        range: *range,
                    });
                }
            }
        }

        let open_files: Vec<_> = self.open_files().drain().map(|(_, v)| v).collect();
        for of in open_files {
            let inner = of.lock();
            if force || inner.lost {
                continue;
            }
            // Delegated-only opens have no server-side open state.
            if inner.counts.local.iter().flatten().all(|&c| c == 0) {
                continue;
            }
            if let Some(stateid) = inner.stateid {
                actions.push(DrainAction::Close {
                    owner: of.owner,
                    stateid,
                });
            }
        }

        actions
    }
}

/// Per-mount open-owner table.
///
/// Open-owners are protocol identities scoped to the mount, not to any
/// one node; open-files reference them by key.
#[derive(Debug, Default)]
pub struct OwnerTable {
    owners: Mutex<FxHashMap<OwnerKey, Arc<OpenOwner>>>,
    next_id: std::sync::atomic::AtomicU64,
}

/// A protocol open-owner: the identity the server sequences opens under.
#[derive(Debug)]
pub struct OpenOwner {
    key: OwnerKey,
    /// Client-chosen owner id presented to the server.
    id: u64,
    busy: Lease,
}

impl OpenOwner {
    #[must_use]
    pub fn key(&self) -> OwnerKey {
        self.key
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub fn busy(&self) -> &Lease {
        &self.busy
    }
}

impl OwnerTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Find or create the open-owner for `key`.
    pub fn open_owner(&self, key: OwnerKey) -> Arc<OpenOwner> {
        let mut owners = self
            .owners
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        Arc::clone(owners.entry(key).or_insert_with(|| {
            let id = self
                .next_id
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            Arc::new(OpenOwner {
                key,
                id,
                busy: Lease::new(),
            })
        }))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.owners
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
