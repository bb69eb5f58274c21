//! Deadlock-free acquisition of multiple node locks.
//!
//! Cross-directory operations (rename, link) touch up to four nodes.
//! Acquiring their locks in creation-serial order — the same total order
//! for every caller — makes deadlock impossible regardless of how
//! concurrent operations overlap.

use std::sync::Arc;

use super::{Node, NodeGuard, NodeLockError};

/// Lock every distinct node in `nodes` in ascending serial order.
///
/// Duplicates (the same node appearing in several positions, e.g. a
/// rename within one directory) are locked once. On failure every guard
/// acquired so far is released.
///
/// # Errors
///
/// [`NodeLockError::Gone`] if any node was unhashed; the caller should
/// redo its lookups and retry the whole operation.
pub async fn lock_ordered(nodes: &[&Arc<Node>]) -> Result<Vec<NodeGuard>, NodeLockError> {
    let mut distinct: Vec<&Arc<Node>> = nodes.to_vec();
    distinct.sort_by_key(|n| n.serial());
    distinct.dedup_by_key(|n| n.serial());

    let mut guards = Vec::with_capacity(distinct.len());
    for node in distinct {
        // An error drops `guards`, releasing everything in reverse.
        guards.push(node.lock().await?);
    }
    Ok(guards)
}
