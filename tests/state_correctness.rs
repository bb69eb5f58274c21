#![allow(clippy::unwrap_used, missing_docs)]

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{MockTransport, handle, make_init};
use driftfs::mount::{Mount, MountConfig};
use driftfs::rpc::{AsyncPool, PoolConfig};
use driftfs::state::{
    ByteRange, CloseAction, OwnerKey, SHARE_BOTH, SHARE_NONE, SHARE_READ, SHARE_WRITE, Stateid,
};
use driftfs::node::NodeType;
use driftfs::sync::Lease;
use sunrpc::NfsProgram;

fn mount() -> Arc<Mount<MockTransport>> {
    let config = MountConfig::new("filer:2049", "/export", NfsProgram::V4);
    let pool = AsyncPool::new(PoolConfig {
        max_workers: 2,
        idle: Duration::from_millis(100),
    });
    Mount::new(1, config, MockTransport::always_ok(), pool)
}

const OWNER: OwnerKey = OwnerKey { uid: 1000, pid: 7 };

#[tokio::test]
async fn close_footprint_walkthrough() {
    let mount = mount();
    let node = mount
        .nodes()
        .find_or_create(handle(1), || async { Ok(make_init(NodeType::Regular, 0, 1)) })
        .await
        .expect("create");

    let of = node.state().open_file(OWNER);
    of.note_open(SHARE_READ, SHARE_NONE, false);
    of.note_open(SHARE_BOTH, SHARE_WRITE, false);

    // Dropping the read-write/deny-write opener shrinks both axes.
    assert_eq!(
        of.note_close(SHARE_BOTH, SHARE_WRITE, false),
        CloseAction::Downgrade {
            access: SHARE_READ,
            deny: SHARE_NONE
        }
    );
    // Dropping the last opener closes.
    assert_eq!(
        of.note_close(SHARE_READ, SHARE_NONE, false),
        CloseAction::Close
    );
    node.state().release_open_file(&of);
    assert_eq!(node.state().open_file_count(), 0);
}

#[tokio::test]
async fn busy_lease_serializes_state_mutation() {
    let mount = mount();
    let node = mount
        .nodes()
        .find_or_create(handle(1), || async { Ok(make_init(NodeType::Regular, 0, 1)) })
        .await
        .expect("create");
    let of = node.state().open_file(OWNER);

    let busy = of.busy().acquire_exclusive().await;
    assert!(of.busy().try_exclusive().is_none(), "entity is busy");
    drop(busy);
    assert!(of.busy().try_exclusive().is_some());
    node.state().release_open_file(&of);
}

#[tokio::test]
async fn reclaim_reports_cleanups_and_silly_record() {
    let mount = mount();
    let node = mount
        .nodes()
        .find_or_create(handle(1), || async { Ok(make_init(NodeType::Regular, 0, 1)) })
        .await
        .expect("create");

    let of = node.state().open_file(OWNER);
    of.note_open(SHARE_READ, SHARE_NONE, false);
    of.set_stateid(Stateid([1; 16]));
    node.state().release_open_file(&of);

    let lo = node.state().lock_owner(7, None);
    lo.note_locked(ByteRange {
        start: 0,
        end: 4096,
        exclusive: true,
    });
    lo.set_stateid(Stateid([2; 16]));
    node.state().release_lock_owner(&lo);

    let silly = mount.nodes().defer_unlink(&node, handle(9));

    let reclaim = mount
        .reclaim_node(&handle(1), false)
        .expect("node was present");
    assert_eq!(reclaim.deferred_unlink, Some(silly));
    assert_eq!(
        reclaim.actions.len(),
        2,
        "one unlock and one close to issue"
    );
    assert!(mount.nodes().get(&handle(1)).await.is_none());
}

#[tokio::test]
async fn forced_reclaim_skips_all_network_cleanup() {
    let mount = mount();
    let node = mount
        .nodes()
        .find_or_create(handle(1), || async { Ok(make_init(NodeType::Regular, 0, 1)) })
        .await
        .expect("create");
    let of = node.state().open_file(OWNER);
    of.note_open(SHARE_READ, SHARE_NONE, false);
    of.set_stateid(Stateid([1; 16]));
    node.state().release_open_file(&of);
    mount.nodes().defer_unlink(&node, handle(9));

    let reclaim = mount.reclaim_node(&handle(1), true).expect("present");
    assert!(reclaim.actions.is_empty(), "forced teardown stays local");
    assert!(reclaim.deferred_unlink.is_none());
}

#[tokio::test]
async fn lock_owner_tracks_held_ranges() {
    let mount = mount();
    let node = mount
        .nodes()
        .find_or_create(handle(1), || async { Ok(make_init(NodeType::Regular, 0, 1)) })
        .await
        .expect("create");

    let lo = node.state().lock_owner(7, Some(3));
    lo.note_locked(ByteRange {
        start: 0,
        end: 100,
        exclusive: false,
    });
    lo.note_locked(ByteRange {
        start: 100,
        end: u64::MAX,
        exclusive: true,
    });
    assert_eq!(lo.held().len(), 2);

    assert!(lo.note_unlocked(0, 100));
    assert!(!lo.note_unlocked(0, 100), "already released");
    assert_eq!(lo.held().len(), 1);

    // Still holding a range: release of our reference keeps the entity.
    node.state().release_lock_owner(&lo);
    assert_eq!(node.state().lock_owner_count(), 1);
    assert!(lo.note_unlocked(100, u64::MAX));
    // Re-acquire and release with no locks left: entity dies.
    let again = node.state().lock_owner(7, Some(3));
    node.state().release_lock_owner(&again);
    assert_eq!(node.state().lock_owner_count(), 0);
}

#[tokio::test]
async fn delegations_are_tracked_per_mount() {
    let mount = mount();
    let node = mount
        .nodes()
        .find_or_create(handle(1), || async { Ok(make_init(NodeType::Regular, 0, 1)) })
        .await
        .expect("create");

    mount.set_delegated(&node, true);
    assert_eq!(mount.delegated_handles(), vec![handle(1)]);

    mount.set_delegated(&node, false);
    assert!(mount.delegated_handles().is_empty());

    // Reclaiming a delegated node clears it from the list too.
    mount.set_delegated(&node, true);
    let _ = mount.reclaim_node(&handle(1), true);
    assert!(mount.delegated_handles().is_empty());
}

#[tokio::test]
async fn shared_lease_is_reusable_across_entities() {
    // The same primitive backs nodes, open-files, and lock-owners.
    let lease = Lease::new();
    let a = lease.acquire_shared().await;
    let b = lease.acquire_shared().await;
    assert!(lease.is_busy());
    drop((a, b));
    assert!(!lease.is_busy());
}
