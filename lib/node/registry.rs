//! The handle-keyed node registry.
//!
//! One table per mount. Entries are two-state: `InFlight` while the first
//! finder is constructing the node (concurrent finders wait on a watch
//! channel and re-check), then `Ready`. A failed construction unwinds the
//! insertion so waiters retry creation themselves; a cancelled one is
//! unwound by a drop guard so nobody waits forever on a dead slot.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use scc::HashMap as ConcurrentHashMap;
use tokio::sync::watch;
use tracing::{trace, warn};

use crate::rpc::RpcError;

use super::{Dentry, FileHandle, MountId, Node, NodeAttrs, SillyRename};

/// Everything needed to populate a fresh node.
#[derive(Debug, Clone)]
pub struct NodeInit {
    pub attrs: NodeAttrs,
    /// The transaction id that fetched `attrs`; seeds attribute ordering.
    pub xid: u64,
    pub parent: Option<Dentry>,
}

enum Slot {
    /// Under construction; clone the receiver and wait for the sender to
    /// drop, then re-check the table.
    InFlight(watch::Receiver<()>),
    Ready(Arc<Node>),
}

/// Sizing knobs the table applies to every node it creates.
#[derive(Debug, Clone, Copy)]
pub struct NodeSizing {
    pub access_capacity: usize,
    pub dir_buffer_capacity: usize,
    pub cookie_cache_capacity: usize,
}

impl Default for NodeSizing {
    fn default() -> Self {
        Self {
            access_capacity: 8,
            dir_buffer_capacity: 8192,
            cookie_cache_capacity: 16,
        }
    }
}

/// Handle → node map for one mount.
pub struct NodeTable {
    mount: MountId,
    map: ConcurrentHashMap<FileHandle, Slot>,
    /// Source of node creation serials; defines the lock order.
    serials: AtomicU64,
    /// Sequence for obscured deferred-delete names.
    silly_seq: AtomicU32,
    /// Once set, creation is refused with `Unmounted`.
    teardown: AtomicBool,
    sizing: NodeSizing,
}

/// Removes the `InFlight` slot if the creating future fails or is
/// cancelled before promotion, so waiters retry instead of hanging.
struct CreateGuard<'a> {
    map: &'a ConcurrentHashMap<FileHandle, Slot>,
    handle: &'a FileHandle,
    armed: bool,
}

impl Drop for CreateGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            drop(
                self.map
                    .remove_if(self.handle, |slot| matches!(slot, Slot::InFlight(_))),
            );
        }
    }
}

impl NodeTable {
    #[must_use]
    pub fn new(mount: MountId, sizing: NodeSizing) -> Self {
        Self {
            mount,
            map: ConcurrentHashMap::new(),
            serials: AtomicU64::new(1),
            silly_seq: AtomicU32::new(0),
            teardown: AtomicBool::new(false),
            sizing,
        }
    }

    /// Number of entries, ready and in-flight.
    #[must_use]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Return the ready node for `handle`, or create it with `init`.
    ///
    /// Exactly one creation runs per handle at a time; racing callers
    /// wait on the in-progress one and either observe the node it
    /// produced or, if it failed, retry creation with their own `init`.
    /// The creator's failure surfaces its original error after the
    /// half-constructed entry has been unwound.
    pub async fn find_or_create<F, Fut>(
        &self,
        handle: FileHandle,
        init: F,
    ) -> Result<Arc<Node>, RpcError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<NodeInit, RpcError>> + Send,
    {
        use scc::hash_map::Entry;

        let mut init = Some(init);
        loop {
            if self.teardown.load(Ordering::Acquire) {
                return Err(RpcError::Unmounted);
            }
            match self.map.entry_async(handle.clone()).await {
                Entry::Occupied(occ) => match occ.get() {
                    Slot::Ready(node) => return Ok(Arc::clone(node)),
                    Slot::InFlight(rx) => {
                        let mut rx = rx.clone();
                        drop(occ); // release the shard before waiting
                        // Sender drop wakes us on both success and
                        // failure; the loop re-checks which it was.
                        let _ = rx.changed().await;
                    }
                },
                Entry::Vacant(vac) => {
                    let f = init.take().unwrap_or_else(|| {
                        unreachable!("creation runs at most once per caller")
                    });
                    let (tx, rx) = watch::channel(());
                    vac.insert_entry(Slot::InFlight(rx));
                    let mut guard = CreateGuard {
                        map: &self.map,
                        handle: &handle,
                        armed: true,
                    };

                    match f().await {
                        Ok(seed) => {
                            let serial = self.serials.fetch_add(1, Ordering::Relaxed);
                            let node = Node::new(
                                self.mount,
                                handle.clone(),
                                serial,
                                seed,
                                self.sizing.access_capacity,
                                self.sizing.dir_buffer_capacity,
                                self.sizing.cookie_cache_capacity,
                            )
                            .map_err(|_| {
                                // A fresh cache has no type to mismatch.
                                RpcError::Protocol("inconsistent initial attributes")
                            })?;
                            let node = Arc::new(node);
                            self.map
                                .upsert_async(handle.clone(), Slot::Ready(Arc::clone(&node)))
                                .await;
                            guard.armed = false;
                            drop(tx);
                            trace!(handle = ?handle, serial, "node created");
                            return Ok(node);
                        }
                        Err(e) => {
                            // CreateGuard unwinds the insertion; tx drops
                            // and waiters retry with their own factories.
                            trace!(handle = ?handle, error = %e, "node creation failed");
                            return Err(e);
                        }
                    }
                }
            }
        }
    }

    /// The ready node for `handle`, waiting out an in-flight creation.
    /// `None` if the handle is unknown (or its creation failed).
    pub async fn get(&self, handle: &FileHandle) -> Option<Arc<Node>> {
        loop {
            let rx = self.map.read_async(handle, |_, slot| match slot {
                Slot::Ready(node) => Ok(Arc::clone(node)),
                Slot::InFlight(rx) => Err(rx.clone()),
            });
            match rx.await {
                None => return None,
                Some(Ok(node)) => return Some(node),
                Some(Err(mut rx)) => {
                    let _ = rx.changed().await;
                }
            }
        }
    }

    /// Unhash a ready node so no new lookups can reach it, returning it
    /// for teardown. In-flight entries are left to their creator.
    pub fn remove(&self, handle: &FileHandle) -> Option<Arc<Node>> {
        let removed = self
            .map
            .remove_if(handle, |slot| matches!(slot, Slot::Ready(_)));
        match removed {
            Some((_, Slot::Ready(node))) => {
                node.mark_unhashed();
                trace!(handle = ?handle, "node unhashed");
                Some(node)
            }
            Some((_, Slot::InFlight(_))) => {
                // remove_if_sync's predicate prevents this.
                warn!(handle = ?handle, "removed an in-flight slot");
                None
            }
            None => None,
        }
    }

    /// Refuse all further creation; existing nodes stay reachable for
    /// teardown traversal.
    pub fn begin_teardown(&self) {
        self.teardown.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn is_tearing_down(&self) -> bool {
        self.teardown.load(Ordering::Acquire)
    }

    /// Visit every ready node.
    pub fn for_each(&self, mut f: impl FnMut(&Arc<Node>)) {
        self.map.scan(|_, slot| {
            if let Slot::Ready(node) = slot {
                f(node);
            }
        });
    }

    /// Arm a deferred delete for `node`: generates the obscured name,
    /// records it on the node, and returns it so the caller can issue the
    /// rename.
    pub fn defer_unlink(&self, node: &Node, parent: FileHandle) -> SillyRename {
        let seq = self.silly_seq.fetch_add(1, Ordering::Relaxed);
        let name = SillyRename::obscured_name(node.fileid(), seq);
        node.defer_unlink(parent.clone(), name.clone());
        SillyRename { parent, name }
    }
}

impl std::fmt::Debug for NodeTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeTable")
            .field("mount", &self.mount)
            .field("len", &self.map.len())
            .finish_non_exhaustive()
    }
}
