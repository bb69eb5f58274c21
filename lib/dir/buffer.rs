//! Fixed-capacity blocks of packed directory entries.

use std::ffi::OsString;

/// One directory entry as returned by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub fileid: u64,
    pub name: OsString,
    /// The cookie that resumes enumeration *after* this entry.
    pub cookie: u64,
}

impl DirEntry {
    /// Bytes this entry occupies in a buffer: a fixed header plus the
    /// name, the same accounting the fill path uses for capacity checks.
    #[must_use]
    pub fn packed_len(&self) -> usize {
        // fileid + cookie + length word
        24 + self.name.len()
    }
}

/// A logical block of packed entries.
///
/// Blocks are numbered densely from zero within one directory window. The
/// header records the cookie the block starts at, how full it is, and
/// whether enumeration ends inside it.
#[derive(Debug)]
pub struct DirBuffer {
    block: u64,
    start_cookie: u64,
    capacity: usize,
    used: usize,
    entries: Vec<DirEntry>,
    full: bool,
    eof: bool,
}

impl DirBuffer {
    #[must_use]
    pub fn new(block: u64, start_cookie: u64, capacity: usize) -> Self {
        Self {
            block,
            start_cookie,
            capacity,
            used: 0,
            entries: Vec::new(),
            full: false,
            eof: false,
        }
    }

    #[must_use]
    pub fn block(&self) -> u64 {
        self.block
    }

    #[must_use]
    pub fn start_cookie(&self) -> u64 {
        self.start_cookie
    }

    #[must_use]
    pub fn entries(&self) -> &[DirEntry] {
        &self.entries
    }

    /// Whether the block has no room for further entries.
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.full
    }

    /// Whether enumeration ends in this block.
    #[must_use]
    pub fn is_eof(&self) -> bool {
        self.eof
    }

    /// The cookie that resumes enumeration after this block's last entry,
    /// or the start cookie if the block is empty.
    #[must_use]
    pub fn next_cookie(&self) -> u64 {
        self.entries.last().map_or(self.start_cookie, |e| e.cookie)
    }

    /// Try to pack `entry`. Returns it back if the block is out of space,
    /// marking the block full.
    pub fn push(&mut self, entry: DirEntry) -> Result<(), DirEntry> {
        let len = entry.packed_len();
        if !self.entries.is_empty() && self.used + len > self.capacity {
            self.full = true;
            return Err(entry);
        }
        // A single oversized entry still goes in — a block must make
        // progress even when one name exceeds the nominal capacity.
        self.used += len;
        self.entries.push(entry);
        if self.used >= self.capacity {
            self.full = true;
        }
        Ok(())
    }

    /// Mark enumeration finished inside this block.
    pub fn mark_eof(&mut self) {
        self.eof = true;
        self.full = true;
    }

    /// Whether `cookie` resumes inside this block, i.e. equals the cookie
    /// of one of its entries (enumeration continues with the next entry).
    #[must_use]
    pub fn contains_cookie(&self, cookie: u64) -> bool {
        self.start_cookie == cookie || self.entries.iter().any(|e| e.cookie == cookie)
    }

    /// Same as [`contains_cookie`](Self::contains_cookie) but matching the
    /// low 32 bits only — the truncated-cookie compatibility shim.
    #[must_use]
    pub fn contains_cookie32(&self, cookie32: u32) -> bool {
        let low = |c: u64| (c & 0xffff_ffff) as u32;
        low(self.start_cookie) == cookie32 || self.entries.iter().any(|e| low(e.cookie) == cookie32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(fileid: u64, name: &str, cookie: u64) -> DirEntry {
        DirEntry {
            fileid,
            name: name.into(),
            cookie,
        }
    }

    #[test]
    fn packs_until_capacity_then_rejects() {
        // Each entry: 24 + 4 = 28 bytes; capacity fits exactly two.
        let mut buf = DirBuffer::new(0, 0, 56);
        buf.push(entry(1, "aaaa", 101)).expect("first fits");
        buf.push(entry(2, "bbbb", 102)).expect("second fits");
        assert!(buf.is_full());
        let rejected = buf.push(entry(3, "cccc", 103)).expect_err("no room");
        assert_eq!(rejected.name, OsString::from("cccc"));
        assert_eq!(buf.entries().len(), 2);
    }

    #[test]
    fn oversized_first_entry_is_accepted() {
        let mut buf = DirBuffer::new(0, 0, 16);
        buf.push(entry(1, "a-very-long-name-indeed", 7))
            .expect("a lone oversized entry must still make progress");
        assert!(buf.is_full());
    }

    #[test]
    fn next_cookie_tracks_last_entry() {
        let mut buf = DirBuffer::new(0, 5, 1024);
        assert_eq!(buf.next_cookie(), 5, "empty block resumes at its start");
        buf.push(entry(1, "a", 101)).expect("fits");
        buf.push(entry(2, "b", 102)).expect("fits");
        assert_eq!(buf.next_cookie(), 102);
    }

    #[test]
    fn cookie_membership_includes_start_and_entries() {
        let mut buf = DirBuffer::new(3, 50, 1024);
        buf.push(entry(1, "a", 101)).expect("fits");
        assert!(buf.contains_cookie(50));
        assert!(buf.contains_cookie(101));
        assert!(!buf.contains_cookie(999));
    }

    #[test]
    fn truncated_cookie_matches_low_bits() {
        let mut buf = DirBuffer::new(0, 0, 1024);
        let wide = (7u64 << 32) | 0x1234;
        buf.push(entry(1, "a", wide)).expect("fits");
        assert!(buf.contains_cookie32(0x1234));
        assert!(!buf.contains_cookie(0x1234), "exact match must not alias");
    }
}
