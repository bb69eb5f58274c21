//! Transaction-id allocation.
//!
//! One atomic hands out 64-bit xids packed as a wrap generation (upper 20
//! bits) over a sub-counter (lower 44 bits). A plain `fetch_add` naturally
//! carries sub-counter overflow into the generation; values whose
//! sub-counter reads zero (including the global zero) are skipped, so zero
//! is never issued and a wire-level 32-bit collision after wraparound
//! stays distinguishable by generation.

use std::sync::atomic::{AtomicU64, Ordering};

const SUB_BITS: u32 = 44;
const SUB_MASK: u64 = (1 << SUB_BITS) - 1;

/// Concurrency-safe xid source, one per mount.
#[derive(Debug)]
pub struct XidAllocator {
    next: AtomicU64,
}

impl Default for XidAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl XidAllocator {
    #[must_use]
    pub fn new() -> Self {
        // Zero is reserved; start the sub-counter at 1.
        Self {
            next: AtomicU64::new(1),
        }
    }

    /// Start at an arbitrary packed value. Used by tests to exercise the
    /// wrap boundary without 2^44 allocations.
    #[must_use]
    pub fn starting_at(raw: u64) -> Self {
        Self {
            next: AtomicU64::new(raw),
        }
    }

    /// Allocate the next xid. Strictly increasing across concurrent
    /// callers; never zero; never a value whose sub-counter is zero.
    pub fn allocate(&self) -> u64 {
        loop {
            let xid = self.next.fetch_add(1, Ordering::Relaxed);
            if xid & SUB_MASK != 0 {
                return xid;
            }
            // Sub-counter boundary: this slot is reserved, take the next.
        }
    }

    /// The wrap generation of an xid.
    #[must_use]
    pub fn generation(xid: u64) -> u64 {
        xid >> SUB_BITS
    }

    /// The sub-counter of an xid.
    #[must_use]
    pub fn sequence(xid: u64) -> u64 {
        xid & SUB_MASK
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn never_issues_zero() {
        let alloc = XidAllocator::new();
        assert_ne!(alloc.allocate(), 0);
    }

    #[test]
    fn strictly_increasing_sequentially() {
        let alloc = XidAllocator::new();
        let mut prev = 0;
        for _ in 0..1000 {
            let xid = alloc.allocate();
            assert!(xid > prev, "xids must strictly increase");
            prev = xid;
        }
    }

    #[test]
    fn wrap_bumps_generation_and_skips_zero_sequence() {
        // One below the first wrap boundary.
        let alloc = XidAllocator::starting_at(SUB_MASK);
        let before = alloc.allocate();
        assert_eq!(XidAllocator::generation(before), 0);
        assert_eq!(XidAllocator::sequence(before), SUB_MASK);

        let after = alloc.allocate();
        assert_eq!(XidAllocator::generation(after), 1, "generation rolls");
        assert_eq!(XidAllocator::sequence(after), 1, "sequence restarts at 1");
        assert!(after > before);
    }

    #[tokio::test]
    async fn concurrent_allocation_yields_unique_ids() {
        let alloc = Arc::new(XidAllocator::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let alloc = Arc::clone(&alloc);
            handles.push(tokio::spawn(async move {
                let mut local = Vec::with_capacity(500);
                let mut prev = 0;
                for _ in 0..500 {
                    let xid = alloc.allocate();
                    assert!(xid > prev, "per-task view must be increasing");
                    prev = xid;
                    local.push(xid);
                }
                local
            }));
        }

        let mut all = Vec::new();
        for h in handles {
            all.extend(h.await.expect("task panicked"));
        }
        let count = all.len();
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), count, "no xid may be issued twice");
    }
}
