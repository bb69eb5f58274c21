//! Per-node attribute cache.
//!
//! Attributes fetched from the server are trusted only for a bounded time.
//! The TTL adapts: files the client just wrote use the configured minimum
//! (the server copy is about to change), delegated files use the maximum
//! (the server promised not to change them behind our back), and everything
//! else scales with how long the file has been quiescent.
//!
//! Installs are ordered by the transaction id that fetched them, so a
//! reply that was overtaken on the wire can never roll the cache backwards.

use std::time::{Duration, Instant, SystemTime};

use thiserror::Error;
use tracing::trace;

use crate::node::{NodeAttrs, NodeType};

/// How much quiescent time buys one unit of cache lifetime.
const AGE_SCALE: u32 = 10;

/// Lower/upper bounds on the attribute TTL, configured separately for
/// regular files and directories.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttrTimeouts {
    pub min: Duration,
    pub max: Duration,
}

impl AttrTimeouts {
    /// Classic client defaults: 3..60 seconds for files, 30..60 for dirs.
    #[must_use]
    pub fn file_default() -> Self {
        Self {
            min: Duration::from_secs(3),
            max: Duration::from_secs(60),
        }
    }

    #[must_use]
    pub fn dir_default() -> Self {
        Self {
            min: Duration::from_secs(30),
            max: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Error)]
pub enum AttrError {
    /// The server reports a different file type for this handle than the
    /// one we cached — the handle has been reused for a new file. This is
    /// stale-handle class: the caller must re-resolve the path.
    #[error("file type changed on server: cached {cached:?}, observed {observed:?}")]
    TypeChanged {
        cached: NodeType,
        observed: NodeType,
    },
}

/// Cached attribute set for one node, guarded by the node's attr lock.
#[derive(Debug)]
pub struct AttrCache {
    attrs: Option<NodeAttrs>,
    /// `None` means stale: the next consult must revalidate with the
    /// server even if `attrs` still holds data.
    fetched_at: Option<Instant>,
    /// Transaction id of the last installed attribute set.
    last_xid: u64,
    /// Set while the client has locally modified the file and the server
    /// copy is known to be about to change.
    locally_modified: bool,
    /// A delegation or lease is held for this node.
    delegated: bool,
    /// Size floor armed by in-flight extending writes. A concurrent
    /// attribute refresh must not shrink the file below this while writes
    /// are still in flight.
    pending_size: Option<u64>,
}

impl Default for AttrCache {
    fn default() -> Self {
        Self::new()
    }
}

impl AttrCache {
    #[must_use]
    pub fn new() -> Self {
        Self {
            attrs: None,
            fetched_at: None,
            last_xid: 0,
            locally_modified: false,
            delegated: false,
            pending_size: None,
        }
    }

    /// The TTL currently applicable to this cache entry.
    fn ttl(&self, bounds: &AttrTimeouts, attrs: &NodeAttrs) -> Duration {
        if self.delegated {
            return bounds.max;
        }
        if self.locally_modified {
            return bounds.min;
        }
        // Scale with quiescence: a file whose mtime moved recently gets a
        // short TTL, one untouched for ages gets the maximum.
        let age = SystemTime::now()
            .duration_since(attrs.mtime)
            .unwrap_or(Duration::ZERO);
        (age / AGE_SCALE).clamp(bounds.min, bounds.max)
    }

    /// Return the cached attributes if they are still within their TTL.
    /// `None` means the caller must fetch fresh attributes.
    #[must_use]
    pub fn get_cached(&self, bounds: &AttrTimeouts, now: Instant) -> Option<&NodeAttrs> {
        let fetched_at = self.fetched_at?;
        let attrs = self.attrs.as_ref()?;
        if now.duration_since(fetched_at) < self.ttl(bounds, attrs) {
            Some(attrs)
        } else {
            None
        }
    }

    /// Install a freshly fetched attribute set tagged with the transaction
    /// id that produced it.
    ///
    /// A set older than the last installed one is dropped — but the cache
    /// is marked stale rather than kept fresh, since an out-of-order
    /// completion means we cannot be sure which reply reflects reality.
    ///
    /// # Errors
    ///
    /// [`AttrError::TypeChanged`] if the observed file type differs from
    /// the cached one; the cache is invalidated.
    pub fn load(&mut self, mut new: NodeAttrs, xid: u64) -> Result<(), AttrError> {
        let cached_type = self.attrs.as_ref().map(|a| a.ntype);
        if let Some(cached) = cached_type
            && cached != new.ntype
        {
            self.attrs = None;
            self.fetched_at = None;
            return Err(AttrError::TypeChanged {
                cached,
                observed: new.ntype,
            });
        }

        if xid < self.last_xid {
            trace!(
                xid,
                last_xid = self.last_xid,
                "dropping out-of-order attribute update"
            );
            self.fetched_at = None;
            return Ok(());
        }

        if let Some(floor) = self.pending_size {
            new.size = new.size.max(floor);
        }

        self.attrs = Some(new);
        self.last_xid = xid;
        self.fetched_at = Some(Instant::now());
        self.locally_modified = false;
        Ok(())
    }

    /// Drop freshness without discarding data. The next
    /// [`get_cached`](Self::get_cached) reports stale.
    pub fn invalidate(&mut self) {
        self.fetched_at = None;
    }

    /// Record a local modification: shortens the TTL to the configured
    /// minimum until the next server-sourced install.
    pub fn mark_modified(&mut self) {
        self.locally_modified = true;
    }

    pub fn set_delegated(&mut self, delegated: bool) {
        self.delegated = delegated;
    }

    /// Apply a locally known size (e.g. a completed extending write),
    /// without touching freshness bookkeeping for other attributes.
    pub fn update_size_locally(&mut self, size: u64) {
        if let Some(attrs) = &mut self.attrs {
            attrs.size = size;
        }
        self.locally_modified = true;
    }

    /// Arm the deferred-size floor for in-flight extending writes.
    pub fn arm_pending_size(&mut self, size: u64) {
        self.pending_size = Some(self.pending_size.map_or(size, |p| p.max(size)));
    }

    /// Flush the deferred size into the cached attributes. Called at
    /// data-lock transitions.
    pub fn flush_pending_size(&mut self) {
        if let Some(floor) = self.pending_size.take()
            && let Some(attrs) = &mut self.attrs
        {
            attrs.size = attrs.size.max(floor);
        }
    }

    /// Cached attributes regardless of freshness.
    #[must_use]
    pub fn peek(&self) -> Option<&NodeAttrs> {
        self.attrs.as_ref()
    }

    #[must_use]
    pub fn last_xid(&self) -> u64 {
        self.last_xid
    }
}
