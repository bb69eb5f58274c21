#![allow(clippy::unwrap_used, missing_docs)]

mod common;

use std::time::{Duration, SystemTime};

use common::{handle, make_attrs, make_init};
use driftfs::cache::access::Access;
use driftfs::cache::attr::{AttrError, AttrTimeouts};
use driftfs::node::registry::{NodeSizing, NodeTable};
use driftfs::node::NodeType;

fn table_with_ring(capacity: usize) -> NodeTable {
    NodeTable::new(
        1,
        NodeSizing {
            access_capacity: capacity,
            ..NodeSizing::default()
        },
    )
}

async fn make_node(table: &NodeTable) -> std::sync::Arc<driftfs::node::Node> {
    table
        .find_or_create(handle(1), || async { Ok(make_init(NodeType::Regular, 0, 1)) })
        .await
        .expect("create")
}

#[tokio::test]
async fn stale_transaction_never_regresses_the_cache() {
    // Create with size 0, install size=100 at xid 5, then a stale
    // size=50 completion at xid 3 arrives late.
    let table = table_with_ring(8);
    let node = make_node(&table).await;

    node.load_attrs(make_attrs(NodeType::Regular, 100), 5)
        .expect("xid 5 installs");
    node.load_attrs(make_attrs(NodeType::Regular, 50), 3)
        .expect("stale xid is dropped, not an error");

    let size = node.with_attrs(|cache| cache.peek().map(|a| a.size));
    assert_eq!(size, Some(100), "stale txn must be dropped");
}

#[tokio::test]
async fn fresh_load_within_ttl_is_served_from_cache() {
    let table = table_with_ring(8);
    let node = make_node(&table).await;
    // mtime far in the past: the age-scaled TTL hits the maximum.
    node.load_attrs(make_attrs(NodeType::Regular, 42), 2)
        .expect("load");

    let bounds = AttrTimeouts {
        min: Duration::from_secs(3),
        max: Duration::from_secs(60),
    };
    let cached = node.cached_attrs(&bounds);
    assert_eq!(cached.map(|a| a.size), Some(42));
}

#[tokio::test]
async fn recently_modified_files_expire_at_the_minimum_ttl() {
    let table = table_with_ring(8);
    let node = make_node(&table).await;
    let mut attrs = make_attrs(NodeType::Regular, 42);
    attrs.mtime = SystemTime::now();
    node.load_attrs(attrs, 2).expect("load");

    // A zero minimum makes the fresh-mtime entry stale immediately.
    let bounds = AttrTimeouts {
        min: Duration::ZERO,
        max: Duration::from_secs(60),
    };
    assert!(
        node.cached_attrs(&bounds).is_none(),
        "a just-modified file must not be trusted past the minimum TTL"
    );
}

#[tokio::test]
async fn type_change_reports_stale_handle_class_and_clears_access() {
    let table = table_with_ring(8);
    let node = make_node(&table).await;
    node.access_insert(1000, Access::READ);
    assert!(node.access_lookup(1000, Duration::from_secs(60)).is_some());

    let err = node
        .load_attrs(make_attrs(NodeType::Directory, 0), 9)
        .expect_err("regular file turned directory means handle reuse");
    assert!(matches!(err, AttrError::TypeChanged { .. }));
    assert!(
        node.access_lookup(1000, Duration::from_secs(60)).is_none(),
        "rights derived from a dead handle must not be served"
    );
}

#[tokio::test]
async fn invalidate_clears_access_ring_too() {
    let table = table_with_ring(8);
    let node = make_node(&table).await;
    node.access_insert(1000, Access::READ | Access::LOOKUP);
    node.invalidate_attrs();
    assert!(node.access_lookup(1000, Duration::from_secs(60)).is_none());
}

#[tokio::test]
async fn access_ring_evicts_fifo_at_capacity_four() {
    let table = table_with_ring(4);
    let node = make_node(&table).await;
    for uid in 1..=5 {
        node.access_insert(uid, Access::READ);
    }
    let age = Duration::from_secs(60);
    assert!(
        node.access_lookup(1, age).is_none(),
        "uid 1 is the FIFO victim"
    );
    for uid in 2..=5 {
        assert!(node.access_lookup(uid, age).is_some(), "uid {uid} remains");
    }
}

#[tokio::test]
async fn pending_size_survives_data_lock_round_trip() {
    let table = table_with_ring(8);
    let node = make_node(&table).await;
    node.load_attrs(make_attrs(NodeType::Regular, 100), 2)
        .expect("load");

    // An in-flight extending write arms the floor; a racing refresh with
    // the old size must not shrink the file.
    node.with_attrs(|cache| cache.arm_pending_size(4096));
    node.load_attrs(make_attrs(NodeType::Regular, 100), 3)
        .expect("refresh");
    let size = node.with_attrs(|cache| cache.peek().map(|a| a.size));
    assert_eq!(size, Some(4096));

    // Acquiring the data lock flushes the floor for good.
    let guard = node.lock_data_exclusive().await;
    drop(guard);
    let size = node.with_attrs(|cache| cache.peek().map(|a| a.size));
    assert_eq!(size, Some(4096));
}
