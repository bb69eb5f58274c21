//! In-memory file objects and their registry.
//!
//! A [`Node`] is the client's image of one server file, keyed by the
//! opaque file handle the server issued for it. Nodes own their cached
//! attributes, access verdicts, directory window, and (for the stateful
//! protocol version) open/lock state. The [`NodeTable`] maps handles to
//! nodes and guarantees that concurrent lookups for one handle produce
//! exactly one node.

/// Deadlock-free multi-node lock acquisition.
pub mod locking;
/// The handle-keyed node registry.
pub mod registry;

pub use locking::lock_ordered;
pub use registry::{NodeInit, NodeSizing, NodeTable};

use std::ffi::OsString;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant, SystemTime};

use bitflags::bitflags;
use thiserror::Error;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::cache::access::{Access, AccessRing};
use crate::cache::attr::{AttrCache, AttrError, AttrTimeouts};
use crate::dir::DirWindow;
use crate::state::NodeState;
use crate::sync::Lease;

/// Identifies one mount within the process.
pub type MountId = u64;

/// The server's numeric file id (inode number equivalent).
pub type FileId = u64;

/// An opaque server-issued file handle. Cheap to clone; compared and
/// hashed by its bytes.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct FileHandle(Arc<[u8]>);

impl FileHandle {
    #[must_use]
    pub fn new(bytes: impl Into<Arc<[u8]>>) -> Self {
        Self(bytes.into())
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for FileHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fh:")?;
        for b in self.0.iter().take(8) {
            write!(f, "{b:02x}")?;
        }
        if self.0.len() > 8 {
            write!(f, "…")?;
        }
        Ok(())
    }
}

bitflags! {
    /// Unix permission bits as carried in server attributes.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Permissions: u16 {
        const OTHER_EXECUTE = 1 << 0;
        const OTHER_WRITE   = 1 << 1;
        const OTHER_READ    = 1 << 2;

        const GROUP_EXECUTE = 1 << 3;
        const GROUP_WRITE   = 1 << 4;
        const GROUP_READ    = 1 << 5;

        const OWNER_EXECUTE = 1 << 6;
        const OWNER_WRITE   = 1 << 7;
        const OWNER_READ    = 1 << 8;

        const STICKY        = 1 << 9;
        const SETGID        = 1 << 10;
        const SETUID        = 1 << 11;
    }
}

/// The type of the server file behind a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeType {
    Regular,
    Directory,
    Symlink,
    CharDevice,
    BlockDevice,
    NamedPipe,
    Socket,
}

/// One attribute set as fetched from the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeAttrs {
    pub fileid: FileId,
    pub ntype: NodeType,
    pub perm: Permissions,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub atime: SystemTime,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
    /// Server change token; compared monotonically to detect remote
    /// modification without trusting timestamps.
    pub change: u64,
}

/// Name/parent bookkeeping for a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dentry {
    pub parent: FileHandle,
    pub name: OsString,
}

/// A deferred delete: the obscured name an unlinked-but-open file was
/// renamed to, removed for real once the last reference drops.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SillyRename {
    pub parent: FileHandle,
    pub name: OsString,
}

impl SillyRename {
    /// Deterministic obscured name for (fileid, sequence).
    #[must_use]
    pub fn obscured_name(fileid: FileId, seq: u32) -> OsString {
        OsString::from(format!(".nfs{fileid:016x}{seq:04x}"))
    }
}

/// Failure modes of per-node lock acquisition.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum NodeLockError {
    /// The node was removed from the registry; the caller should redo the
    /// lookup rather than retry the lock.
    #[error("node was removed from the registry")]
    Gone,
    /// The lock did not become available in time.
    #[error("timed out waiting for the node lock")]
    Timeout,
}

/// Guard for the short-hold per-node mutex.
pub type NodeGuard = OwnedMutexGuard<()>;

/// One in-memory file object.
pub struct Node {
    mount: MountId,
    handle: FileHandle,
    /// Creation order within the registry; the total order used by
    /// [`lock_ordered`].
    serial: u64,
    fileid: FileId,
    mutex: Arc<AsyncMutex<()>>,
    /// Shared for reads, exclusive for writes/truncation. The only lock
    /// that may be held across an RPC round-trip.
    data: RwLock<()>,
    busy: Lease,
    attr: parking_lot::Mutex<AttrCache>,
    access: parking_lot::Mutex<AccessRing>,
    dentry: parking_lot::Mutex<Option<Dentry>>,
    dir: AsyncMutex<DirWindow>,
    state: NodeState,
    silly: parking_lot::Mutex<Option<SillyRename>>,
    unhashed: AtomicBool,
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("mount", &self.mount)
            .field("handle", &self.handle)
            .field("fileid", &self.fileid)
            .field("serial", &self.serial)
            .finish_non_exhaustive()
    }
}

impl Node {
    pub(crate) fn new(
        mount: MountId,
        handle: FileHandle,
        serial: u64,
        init: NodeInit,
        access_capacity: usize,
        dir_buffer_capacity: usize,
        cookie_cache_capacity: usize,
    ) -> Result<Self, AttrError> {
        let fileid = init.attrs.fileid;
        let mut attr = AttrCache::new();
        attr.load(init.attrs, init.xid)?;
        Ok(Self {
            mount,
            handle,
            serial,
            fileid,
            mutex: Arc::new(AsyncMutex::new(())),
            data: RwLock::new(()),
            busy: Lease::new(),
            attr: parking_lot::Mutex::new(attr),
            access: parking_lot::Mutex::new(AccessRing::new(access_capacity)),
            dentry: parking_lot::Mutex::new(init.parent),
            dir: AsyncMutex::new(DirWindow::new(dir_buffer_capacity, cookie_cache_capacity)),
            state: NodeState::new(),
            silly: parking_lot::Mutex::new(None),
            unhashed: AtomicBool::new(false),
        })
    }

    #[must_use]
    pub fn mount(&self) -> MountId {
        self.mount
    }

    #[must_use]
    pub fn handle(&self) -> &FileHandle {
        &self.handle
    }

    #[must_use]
    pub fn serial(&self) -> u64 {
        self.serial
    }

    #[must_use]
    pub fn fileid(&self) -> FileId {
        self.fileid
    }

    #[must_use]
    pub fn node_type(&self) -> Option<NodeType> {
        self.attr.lock().peek().map(|a| a.ntype)
    }

    // ── Short-hold mutex ────────────────────────────────────────────────

    /// Acquire the per-node mutex. Fails with [`NodeLockError::Gone`] if
    /// the node was unhashed — the caller must redo the lookup, since
    /// this node can no longer be reached through the registry.
    pub async fn lock(&self) -> Result<NodeGuard, NodeLockError> {
        let guard = Arc::clone(&self.mutex).lock_owned().await;
        if self.is_unhashed() {
            return Err(NodeLockError::Gone);
        }
        Ok(guard)
    }

    /// [`lock`](Self::lock) with an upper bound on the wait.
    pub async fn lock_timeout(&self, limit: Duration) -> Result<NodeGuard, NodeLockError> {
        match tokio::time::timeout(limit, self.lock()).await {
            Ok(result) => result,
            Err(_) => Err(NodeLockError::Timeout),
        }
    }

    // ── Busy lease ──────────────────────────────────────────────────────

    /// The long-lived busy lease, orthogonal to [`lock`](Self::lock).
    /// Guards from it may be held across RPC round-trips.
    #[must_use]
    pub fn busy(&self) -> &Lease {
        &self.busy
    }

    // ── Data range lock ─────────────────────────────────────────────────

    /// Take the data lock shared (reads). Pending size updates are
    /// flushed at every acquisition and release.
    pub async fn lock_data_shared(&self) -> DataReadGuard<'_> {
        let guard = self.data.read().await;
        self.flush_pending_size();
        DataReadGuard {
            node: self,
            _guard: guard,
        }
    }

    /// Take the data lock exclusive (writes, truncation).
    pub async fn lock_data_exclusive(&self) -> DataWriteGuard<'_> {
        let guard = self.data.write().await;
        self.flush_pending_size();
        DataWriteGuard {
            node: self,
            _guard: guard,
        }
    }

    fn flush_pending_size(&self) {
        self.attr.lock().flush_pending_size();
    }

    // ── Attributes ──────────────────────────────────────────────────────

    /// Run `f` with the attribute cache held.
    pub fn with_attrs<T>(&self, f: impl FnOnce(&mut AttrCache) -> T) -> T {
        f(&mut self.attr.lock())
    }

    /// Cached attributes if still fresh under `bounds`.
    #[must_use]
    pub fn cached_attrs(&self, bounds: &AttrTimeouts) -> Option<NodeAttrs> {
        self.attr
            .lock()
            .get_cached(bounds, Instant::now())
            .cloned()
    }

    /// Install freshly fetched attributes. A type flip invalidates the
    /// access ring along with the attribute cache.
    pub fn load_attrs(&self, attrs: NodeAttrs, xid: u64) -> Result<(), AttrError> {
        let result = self.attr.lock().load(attrs, xid);
        if result.is_err() {
            self.access.lock().clear();
        }
        result
    }

    /// Drop attribute freshness and all cached access verdicts: rights
    /// derived from attributes we no longer trust are not trustworthy
    /// either.
    pub fn invalidate_attrs(&self) {
        self.attr.lock().invalidate();
        self.access.lock().clear();
    }

    // ── Access cache ────────────────────────────────────────────────────

    #[must_use]
    pub fn access_lookup(&self, uid: u32, max_age: Duration) -> Option<Access> {
        self.access.lock().lookup(uid, max_age, Instant::now())
    }

    pub fn access_insert(&self, uid: u32, rights: Access) {
        self.access.lock().insert(uid, rights, Instant::now());
    }

    // ── Name bookkeeping ────────────────────────────────────────────────

    #[must_use]
    pub fn dentry(&self) -> Option<Dentry> {
        self.dentry.lock().clone()
    }

    pub fn set_dentry(&self, dentry: Option<Dentry>) {
        *self.dentry.lock() = dentry;
    }

    // ── Deferred delete ─────────────────────────────────────────────────

    /// Arm a deferred delete: the file was unlinked while open and has
    /// been renamed to `obscured_name` under `parent`.
    pub fn defer_unlink(&self, parent: FileHandle, obscured_name: OsString) {
        *self.silly.lock() = Some(SillyRename {
            parent,
            name: obscured_name,
        });
    }

    /// Take the deferred-delete record, if armed. The caller issues the
    /// actual remove; calling this drains the record exactly once.
    #[must_use]
    pub fn take_deferred_unlink(&self) -> Option<SillyRename> {
        self.silly.lock().take()
    }

    #[must_use]
    pub fn has_deferred_unlink(&self) -> bool {
        self.silly.lock().is_some()
    }

    // ── Directory window ────────────────────────────────────────────────

    /// The directory read window; meaningful only for directories.
    #[must_use]
    pub fn dir(&self) -> &AsyncMutex<DirWindow> {
        &self.dir
    }

    // ── Open/lock state ─────────────────────────────────────────────────

    #[must_use]
    pub fn state(&self) -> &NodeState {
        &self.state
    }

    // ── Registry linkage ────────────────────────────────────────────────

    #[must_use]
    pub fn is_unhashed(&self) -> bool {
        self.unhashed.load(Ordering::Acquire)
    }

    pub(crate) fn mark_unhashed(&self) {
        self.unhashed.store(true, Ordering::Release);
    }
}

/// Shared data-lock guard; flushes pending size on release.
pub struct DataReadGuard<'a> {
    node: &'a Node,
    _guard: RwLockReadGuard<'a, ()>,
}

impl Drop for DataReadGuard<'_> {
    fn drop(&mut self) {
        self.node.flush_pending_size();
    }
}

/// Exclusive data-lock guard; flushes pending size on release.
pub struct DataWriteGuard<'a> {
    node: &'a Node,
    _guard: RwLockWriteGuard<'a, ()>,
}

impl Drop for DataWriteGuard<'_> {
    fn drop(&mut self) {
        self.node.flush_pending_size();
    }
}

#[cfg(test)]
pub(crate) fn test_attrs(ntype: NodeType, size: u64) -> NodeAttrs {
    NodeAttrs {
        fileid: 7,
        ntype,
        perm: Permissions::OWNER_READ | Permissions::OWNER_WRITE,
        nlink: 1,
        uid: 1000,
        gid: 1000,
        size,
        atime: SystemTime::UNIX_EPOCH,
        mtime: SystemTime::UNIX_EPOCH,
        ctime: SystemTime::UNIX_EPOCH,
        change: 1,
    }
}
