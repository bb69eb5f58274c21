//! One mounted export: configuration, registry, engine, recovery.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::{Duration, Instant};

use bytes::Bytes;
use rustc_hash::FxHashSet;
use sunrpc::{NfsProgram, Procedure, RpcReply, Transport};
use tracing::info;

use crate::cache::attr::AttrTimeouts;
use crate::node::registry::NodeSizing;
use crate::node::{FileHandle, MountId, Node, NodeTable, NodeType, SillyRename};
use crate::rpc::{
    AsyncPool, Engine, EngineConfig, RecoveryGate, RecoveryHandler, RequestFlags, RpcError,
};
use crate::state::{DrainAction, OwnerTable};

/// Everything the core reads from the configuration surface. The
/// application layer parses files into this; the core never sees TOML.
#[derive(Debug, Clone)]
pub struct MountConfig {
    pub server: String,
    pub export: String,
    pub program: NfsProgram,
    pub file_attrs: AttrTimeouts,
    pub dir_attrs: AttrTimeouts,
    pub sizing: NodeSizing,
    pub engine: EngineConfig,
    /// Bound on automatic re-issues after state-error recovery.
    pub max_restarts: u32,
}

impl MountConfig {
    #[must_use]
    pub fn new(server: impl Into<String>, export: impl Into<String>, program: NfsProgram) -> Self {
        Self {
            server: server.into(),
            export: export.into(),
            program,
            file_attrs: AttrTimeouts::file_default(),
            dir_attrs: AttrTimeouts::dir_default(),
            sizing: NodeSizing::default(),
            engine: EngineConfig::default(),
            max_restarts: 8,
        }
    }
}

const PHASE_MOUNTED: u8 = 0;
const PHASE_UNMOUNTING: u8 = 1;
const PHASE_DEAD: u8 = 2;

/// Snapshot counters for diagnostics.
#[derive(Debug, Clone, Copy)]
pub struct MountStats {
    pub nodes: usize,
    pub outstanding_requests: usize,
    pub open_owners: usize,
}

/// Everything a node teardown needs the caller to finish off.
#[derive(Debug)]
pub struct NodeReclaim {
    /// Deferred delete to complete (remove the obscured name).
    pub deferred_unlink: Option<SillyRename>,
    /// Best-effort close/unlock requests to issue.
    pub actions: Vec<DrainAction>,
}

/// A mounted export.
pub struct Mount<T: Transport> {
    id: MountId,
    config: MountConfig,
    engine: Engine<T>,
    nodes: NodeTable,
    owners: OwnerTable,
    recovery: RecoveryGate,
    phase: AtomicU8,
    /// Handles currently holding a delegation; recovery walks this to
    /// know what must be reclaimed or returned.
    delegations: parking_lot::Mutex<FxHashSet<FileHandle>>,
}

impl<T: Transport> Mount<T> {
    pub fn new(
        id: MountId,
        config: MountConfig,
        transport: Arc<T>,
        pool: Arc<AsyncPool>,
    ) -> Arc<Self> {
        let engine = Engine::new(id, transport, config.engine.clone(), pool);
        let nodes = NodeTable::new(id, config.sizing);
        let recovery = RecoveryGate::new(config.max_restarts);
        Arc::new(Self {
            id,
            config,
            engine,
            nodes,
            owners: OwnerTable::new(),
            recovery,
            phase: AtomicU8::new(PHASE_MOUNTED),
            delegations: parking_lot::Mutex::new(FxHashSet::default()),
        })
    }

    #[must_use]
    pub fn id(&self) -> MountId {
        self.id
    }

    #[must_use]
    pub fn config(&self) -> &MountConfig {
        &self.config
    }

    #[must_use]
    pub fn engine(&self) -> &Engine<T> {
        &self.engine
    }

    #[must_use]
    pub fn nodes(&self) -> &NodeTable {
        &self.nodes
    }

    #[must_use]
    pub fn owners(&self) -> &OwnerTable {
        &self.owners
    }

    #[must_use]
    pub fn recovery(&self) -> &RecoveryGate {
        &self.recovery
    }

    /// The attribute TTL bounds applicable to a node of `ntype`.
    #[must_use]
    pub fn attr_bounds(&self, ntype: NodeType) -> &AttrTimeouts {
        if ntype == NodeType::Directory {
            &self.config.dir_attrs
        } else {
            &self.config.file_attrs
        }
    }

    #[must_use]
    pub fn is_unmounting(&self) -> bool {
        self.phase.load(Ordering::Acquire) != PHASE_MOUNTED
    }

    /// Issue a call, honoring the unmount gate. Requests flagged
    /// `NOINTR` or `SETUP` stay admitted during unmount — teardown
    /// traffic must still flow.
    pub async fn call(
        &self,
        procedure: Procedure,
        args: Bytes,
        flags: RequestFlags,
    ) -> Result<RpcReply, RpcError> {
        if self.is_unmounting()
            && !flags.intersects(RequestFlags::NOINTR | RequestFlags::SETUP)
        {
            return Err(RpcError::Unmounted);
        }
        self.engine.call(procedure, args, flags).await
    }

    /// Issue a stateful call under the recovery gate: state errors
    /// trigger mount-wide recovery through `handler` and bounded
    /// re-issue. Only meaningful for the stateful protocol version;
    /// recovery's own traffic must carry `RECOVERY` and call
    /// [`call`](Self::call) directly.
    pub async fn call_recoverable<H: RecoveryHandler>(
        &self,
        handler: &H,
        procedure: Procedure,
        args: Bytes,
        flags: RequestFlags,
    ) -> Result<RpcReply, RpcError> {
        if self.config.program != NfsProgram::V4 || flags.contains(RequestFlags::RECOVERY) {
            return self.call(procedure, args, flags).await;
        }
        self.recovery
            .run(handler, |_generation| {
                let args = args.clone();
                async move { self.call(procedure, args, flags).await }
            })
            .await
    }

    /// Round-trip the NULL procedure; returns the measured latency.
    pub async fn ping(&self) -> Result<Duration, RpcError> {
        let started = Instant::now();
        self.call(
            Procedure::null(self.config.program),
            Bytes::new(),
            RequestFlags::empty(),
        )
        .await?;
        Ok(started.elapsed())
    }

    /// Record or clear a delegation for `node`, keeping the node's
    /// attribute TTL policy and the mount's reclaim list in step.
    pub fn set_delegated(&self, node: &Node, delegated: bool) {
        node.with_attrs(|cache| cache.set_delegated(delegated));
        let mut held = self.delegations.lock();
        if delegated {
            held.insert(node.handle().clone());
        } else {
            held.remove(node.handle());
        }
    }

    /// Handles currently holding a delegation.
    #[must_use]
    pub fn delegated_handles(&self) -> Vec<FileHandle> {
        self.delegations.lock().iter().cloned().collect()
    }

    /// Tear down one node: unhash it, drain its open/lock state, and
    /// hand back whatever cleanup the caller must issue over the wire.
    /// `force` skips all network cleanup (forced unmount).
    #[must_use]
    pub fn reclaim_node(&self, handle: &FileHandle, force: bool) -> Option<NodeReclaim> {
        let node = self.nodes.remove(handle)?;
        self.delegations.lock().remove(handle);
        let actions = node.state().drain(force || self.is_unmounting());
        // Drain the record either way; under force it dies with the node.
        let deferred = node.take_deferred_unlink();
        Some(NodeReclaim {
            deferred_unlink: if force { None } else { deferred },
            actions,
        })
    }

    /// Enter the unmounting phase: no new nodes, no new plain requests.
    pub fn begin_unmount(&self) {
        self.phase.store(PHASE_UNMOUNTING, Ordering::Release);
        self.nodes.begin_teardown();
        info!(mount = self.id, export = %self.config.export, "unmount started");
    }

    /// Final transition once teardown traffic has drained.
    pub fn mark_dead(&self) {
        self.phase.store(PHASE_DEAD, Ordering::Release);
    }

    #[must_use]
    pub fn stats(&self) -> MountStats {
        MountStats {
            nodes: self.nodes.len(),
            outstanding_requests: self.engine.outstanding(),
            open_owners: self.owners.len(),
        }
    }
}

impl<T: Transport> std::fmt::Debug for Mount<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mount")
            .field("id", &self.id)
            .field("server", &self.config.server)
            .field("export", &self.config.export)
            .finish_non_exhaustive()
    }
}
