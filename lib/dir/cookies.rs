//! Cookie resolution and the per-directory read window.

use std::future::Future;

use hashlink::LinkedHashMap;
use sunrpc::NfsStat;
use tracing::{debug, trace};

use crate::rpc::RpcError;

use super::buffer::{DirBuffer, DirEntry};

/// Bounded MRU map from resume cookie to logical block number.
///
/// Hits re-insert at the back; overflow evicts the front (oldest). The
/// cache is advisory — a miss falls back to scanning the buffers.
#[derive(Debug)]
pub struct CookieCache {
    map: LinkedHashMap<u64, u64>,
    capacity: usize,
}

impl CookieCache {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "cookie cache needs at least one slot");
        Self {
            map: LinkedHashMap::new(),
            capacity,
        }
    }

    /// Exact 64-bit lookup. A hit refreshes the entry's MRU position.
    pub fn get(&mut self, cookie: u64) -> Option<u64> {
        let block = self.map.remove(&cookie)?;
        self.map.insert(cookie, block);
        Some(block)
    }

    /// Low-32-bit lookup for callers that truncated the cookie. Best
    /// effort: the first entry whose low word matches wins.
    pub fn get_truncated(&mut self, cookie32: u32) -> Option<u64> {
        let full = self
            .map
            .iter()
            .find(|&(&c, _)| (c & 0xffff_ffff) as u32 == cookie32)
            .map(|(&c, _)| c)?;
        self.get(full)
    }

    pub fn insert(&mut self, cookie: u64, block: u64) {
        if self.map.remove(&cookie).is_none() && self.map.len() >= self.capacity {
            self.map.pop_front();
        }
        self.map.insert(cookie, block);
    }

    pub fn clear(&mut self) {
        self.map.clear();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

/// Where a cookie leads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Entries resume in this cached block.
    Block(u64),
    /// Enumeration is complete; no I/O required.
    Eof,
    /// Unknown cookie: start a provisional new block at it.
    Miss,
}

/// Outcome of a fill.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FillOutcome {
    /// The block is ready to read.
    Filled(u64),
    /// The server declared our cookie invalid (directory changed); the
    /// window was dropped and the read should end here.
    InvalidatedEof,
}

/// One page of a directory listing as fetched from the server.
#[derive(Debug, Clone)]
pub struct ReaddirPage {
    pub entries: Vec<DirEntry>,
    pub eof: bool,
}

/// Source of directory pages — the engine in production, a script in
/// tests.
pub trait ReaddirSource: Send + Sync {
    /// Fetch entries starting after `cookie` (0 = from the beginning).
    fn read_dir(&self, cookie: u64)
    -> impl Future<Output = Result<ReaddirPage, RpcError>> + Send;
}

/// Per-directory read window: packed buffers plus cookie routing.
#[derive(Debug)]
pub struct DirWindow {
    buffers: Vec<DirBuffer>,
    cookies: CookieCache,
    /// The server's terminal cookie, once seen. Distinguished from the
    /// cookie cache: resolving it is EOF, not a block.
    eof_cookie: Option<u64>,
    buffer_capacity: usize,
}

impl DirWindow {
    #[must_use]
    pub fn new(buffer_capacity: usize, cookie_cache_capacity: usize) -> Self {
        Self {
            buffers: Vec::new(),
            cookies: CookieCache::new(cookie_cache_capacity),
            eof_cookie: None,
            buffer_capacity,
        }
    }

    /// Route a caller-supplied cookie to cached data.
    ///
    /// Order: cookie 0 → first block; the remembered EOF cookie → done;
    /// exact cookie-cache hit; truncated (32-bit) cache hit; linear scan
    /// of buffers in block order (a hit is promoted into the cache);
    /// truncated scan; otherwise a miss.
    pub fn resolve(&mut self, cookie: u64) -> Resolution {
        if cookie == 0 {
            return Resolution::Block(0);
        }
        if self.eof_cookie == Some(cookie) {
            return Resolution::Eof;
        }
        if let Some(block) = self.cookies.get(cookie) {
            return Resolution::Block(block);
        }

        #[expect(
            clippy::cast_possible_truncation,
            reason = "the truncated-cookie shim is only meaningful for 32-bit values"
        )]
        let cookie32 = (cookie <= u64::from(u32::MAX)).then_some(cookie as u32);
        if let Some(c32) = cookie32
            && let Some(block) = self.cookies.get_truncated(c32)
        {
            debug!(cookie, block, "truncated cookie matched via cache");
            return Resolution::Block(block);
        }

        if let Some(buf) = self.buffers.iter().find(|b| b.contains_cookie(cookie)) {
            let block = buf.block();
            trace!(cookie, block, "cookie found by buffer scan, promoting");
            self.cookies.insert(cookie, block);
            return Resolution::Block(block);
        }
        if let Some(c32) = cookie32
            && let Some(buf) = self.buffers.iter().find(|b| b.contains_cookie32(c32))
        {
            let block = buf.block();
            debug!(cookie, block, "truncated cookie matched via buffer scan");
            self.cookies.insert(cookie, block);
            return Resolution::Block(block);
        }

        Resolution::Miss
    }

    #[must_use]
    pub fn buffer(&self, block: u64) -> Option<&DirBuffer> {
        usize::try_from(block).ok().and_then(|i| self.buffers.get(i))
    }

    #[must_use]
    pub fn eof_cookie(&self) -> Option<u64> {
        self.eof_cookie
    }

    /// Number of entries in the cookie cache.
    ///
    /// Intended for testing only — verifies that scan hits get promoted
    /// into the cache.
    #[doc(hidden)]
    #[must_use]
    pub fn cached_cookie_count(&self) -> usize {
        self.cookies.len()
    }

    /// Drop everything; the next read starts from scratch.
    pub fn invalidate(&mut self) {
        self.buffers.clear();
        self.cookies.clear();
        self.eof_cookie = None;
    }

    /// Ensure `block` is ready to read, fetching pages as needed.
    ///
    /// Filling may create successor blocks: when the target fills
    /// mid-page, the remainder of that response is packed onward and each
    /// new block's start cookie is recorded in the cookie cache.
    pub async fn fill<S: ReaddirSource>(
        &mut self,
        block: u64,
        source: &S,
    ) -> Result<FillOutcome, RpcError> {
        let target = usize::try_from(block)
            .map_err(|_| RpcError::Protocol("directory block out of range"))?;
        if target > self.buffers.len() {
            return Err(RpcError::Protocol("directory block out of range"));
        }

        if target == self.buffers.len() {
            let cookie = self.buffers.last().map_or(0, DirBuffer::next_cookie);
            self.push_buffer(cookie);
        }

        self.fetch_into(target, source).await
    }

    /// Provisional path for unknown cookies: append a new block that
    /// starts at the raw cookie and fill it.
    pub async fn fill_from<S: ReaddirSource>(
        &mut self,
        cookie: u64,
        source: &S,
    ) -> Result<FillOutcome, RpcError> {
        let target = self.buffers.len();
        self.push_buffer(cookie);
        self.fetch_into(target, source).await
    }

    fn push_buffer(&mut self, start_cookie: u64) {
        let block = self.buffers.len() as u64;
        self.buffers
            .push(DirBuffer::new(block, start_cookie, self.buffer_capacity));
        if start_cookie != 0 {
            self.cookies.insert(start_cookie, block);
        }
    }

    async fn fetch_into<S: ReaddirSource>(
        &mut self,
        target: usize,
        source: &S,
    ) -> Result<FillOutcome, RpcError> {
        // Already complete (refetched middle block, or a prior fill).
        if self.buffers[target].is_full() || self.buffers[target].is_eof() {
            return Ok(FillOutcome::Filled(target as u64));
        }

        // An empty block resumes at its start cookie.
        let mut cursor = self.buffers[target].next_cookie();

        loop {
            let page = match source.read_dir(cursor).await {
                Ok(page) => page,
                Err(RpcError::Status(NfsStat::BadCookie)) => {
                    // The directory changed under us and the cookie is
                    // meaningless now. The cookie is opaque, so there is
                    // nothing to repair — drop the window and report a
                    // clean end of stream.
                    debug!(cookie = cursor, "server invalidated cookie, dropping window");
                    self.invalidate();
                    return Ok(FillOutcome::InvalidatedEof);
                }
                Err(e) => return Err(e),
            };

            if page.entries.is_empty() && !page.eof {
                // A server that returns nothing and claims more data
                // would loop us forever on the same cookie.
                return Err(RpcError::Protocol("empty readdir page without eof"));
            }

            let mut current = target;
            for entry in page.entries {
                cursor = entry.cookie;
                let mut pending = Some(entry);
                while let Some(e) = pending.take() {
                    if let Err(rejected) = self.buffers[current].push(e) {
                        // Block filled mid-response: continue in a
                        // successor keyed by the rejected entry's resume
                        // point.
                        let next_start = self.buffers[current].next_cookie();
                        if current + 1 == self.buffers.len() {
                            self.push_buffer(next_start);
                        }
                        current += 1;
                        pending = Some(rejected);
                    }
                }
            }

            if page.eof {
                let last = self.buffers.len() - 1;
                self.buffers[last].mark_eof();
                let terminal = self.buffers[last].next_cookie();
                self.eof_cookie = Some(terminal);
                return Ok(FillOutcome::Filled(target as u64));
            }
            if self.buffers[target].is_full() {
                return Ok(FillOutcome::Filled(target as u64));
            }
            // Target still has room: fetch the next page.
        }
    }
}
