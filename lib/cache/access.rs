//! Per-node access-rights cache.
//!
//! A small fixed ring of `(uid, rights)` entries. Most nodes are only ever
//! touched by one or two uids, so a handful of slots with FIFO replacement
//! beats a real map.

use std::time::{Duration, Instant};

use bitflags::bitflags;

bitflags! {
    /// Rights granted by the server for one uid, as reported by the
    /// ACCESS procedure.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Access: u32 {
        const READ    = 1 << 0;
        const LOOKUP  = 1 << 1;
        const MODIFY  = 1 << 2;
        const EXTEND  = 1 << 3;
        const DELETE  = 1 << 4;
        const EXECUTE = 1 << 5;
    }
}

#[derive(Debug, Clone, Copy)]
struct Slot {
    uid: u32,
    rights: Access,
    stamp: Instant,
}

/// Fixed-capacity ring of cached access verdicts.
#[derive(Debug)]
pub struct AccessRing {
    slots: Box<[Option<Slot>]>,
    next: usize,
}

impl AccessRing {
    /// `capacity` must be non-zero.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "access ring needs at least one slot");
        Self {
            slots: vec![None; capacity].into_boxed_slice(),
            next: 0,
        }
    }

    /// Cached rights for `uid`, if present and younger than `max_age`.
    #[must_use]
    pub fn lookup(&self, uid: u32, max_age: Duration, now: Instant) -> Option<Access> {
        self.slots
            .iter()
            .flatten()
            .find(|s| s.uid == uid)
            .filter(|s| now.duration_since(s.stamp) < max_age)
            .map(|s| s.rights)
    }

    /// Record rights for `uid`.
    ///
    /// An existing entry for the same uid is refreshed in place; otherwise
    /// the current ring slot is overwritten (evicting whatever was there)
    /// and the pointer advances.
    pub fn insert(&mut self, uid: u32, rights: Access, now: Instant) {
        let slot = Slot {
            uid,
            rights,
            stamp: now,
        };
        if let Some(existing) = self.slots.iter_mut().flatten().find(|s| s.uid == uid) {
            *existing = slot;
            return;
        }
        self.slots[self.next] = Some(slot);
        self.next = (self.next + 1) % self.slots.len();
    }

    /// Forget everything; used when the node's attributes are invalidated.
    pub fn clear(&mut self) {
        self.slots.fill(None);
        self.next = 0;
    }
}
