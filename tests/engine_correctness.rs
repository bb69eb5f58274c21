#![allow(clippy::unwrap_used, missing_docs)]

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use bytes::Bytes;
use common::{MockTransport, Scripted};
use driftfs::rpc::{AsyncPool, Engine, EngineConfig, PoolConfig, RequestFlags, RpcError};
use sunrpc::{NfsProgram, NfsStat, Procedure};

fn null_proc() -> Procedure {
    Procedure::null(NfsProgram::V3)
}

fn fast_config(soft: bool, retrans: u32) -> EngineConfig {
    EngineConfig {
        soft,
        retrans,
        timeo: Duration::from_millis(20),
        max_backoff: Duration::from_millis(100),
        unresponsive_after: 2,
    }
}

fn small_pool() -> Arc<AsyncPool> {
    AsyncPool::new(PoolConfig {
        max_workers: 2,
        idle: Duration::from_millis(100),
    })
}

fn engine(transport: Arc<MockTransport>, config: EngineConfig) -> Engine<MockTransport> {
    Engine::new(1, transport, config, small_pool())
}

#[tokio::test]
async fn successful_call_returns_the_reply() {
    let transport = MockTransport::always_ok();
    let engine = engine(Arc::clone(&transport), fast_config(false, 3));
    let reply = engine
        .call(null_proc(), Bytes::new(), RequestFlags::empty())
        .await
        .expect("call succeeds");
    assert_eq!(reply.nfs_status(), NfsStat::Ok);
    assert_eq!(engine.outstanding(), 0, "pending entry removed on completion");
}

#[tokio::test]
async fn xids_are_strictly_increasing_and_never_zero() {
    let transport = MockTransport::always_ok();
    let engine = engine(Arc::clone(&transport), fast_config(false, 3));
    for _ in 0..50 {
        engine
            .call(null_proc(), Bytes::new(), RequestFlags::empty())
            .await
            .expect("call");
    }
    let xids = transport.seen_xids();
    assert_eq!(xids.len(), 50);
    let mut prev = 0;
    for xid in xids {
        assert_ne!(xid, 0, "zero is reserved");
        assert!(xid > prev, "xids must strictly increase per mount");
        prev = xid;
    }
}

#[tokio::test]
async fn soft_mount_timeout_surfaces_after_bounded_retries() {
    let transport = MockTransport::new([Scripted::Hang, Scripted::Hang, Scripted::Hang]);
    let engine = engine(Arc::clone(&transport), fast_config(true, 3));
    let err = engine
        .call(null_proc(), Bytes::new(), RequestFlags::SOFT)
        .await
        .expect_err("soft mount must give up");
    assert!(matches!(err, RpcError::TimedOut { attempts: 3 }));
    assert_eq!(transport.call_count(), 3, "one send per attempt");
    assert!(err.is_transient(), "timeouts are the transient class");
}

#[tokio::test]
async fn hard_mount_retries_through_timeouts_until_success() {
    let transport = MockTransport::new([Scripted::Hang, Scripted::Hang, Scripted::Status(0)]);
    let engine = engine(Arc::clone(&transport), fast_config(false, 3));
    let reply = engine
        .call(null_proc(), Bytes::new(), RequestFlags::empty())
        .await
        .expect("third attempt succeeds");
    assert_eq!(reply.nfs_status(), NfsStat::Ok);
    assert_eq!(transport.call_count(), 3);
}

#[tokio::test]
async fn transient_transport_failures_are_retried() {
    let transport = MockTransport::new([Scripted::Disconnect, Scripted::Status(0)]);
    let engine = engine(Arc::clone(&transport), fast_config(false, 3));
    engine
        .call(null_proc(), Bytes::new(), RequestFlags::empty())
        .await
        .expect("reconnect path retries");
    assert_eq!(transport.call_count(), 2);
}

#[tokio::test]
async fn server_delay_is_retried_with_backoff() {
    let transport = MockTransport::new([Scripted::Status(10008), Scripted::Status(0)]);
    let engine = engine(Arc::clone(&transport), fast_config(false, 3));
    engine
        .call(null_proc(), Bytes::new(), RequestFlags::empty())
        .await
        .expect("delay then success");
    assert_eq!(transport.call_count(), 2);
}

#[tokio::test]
async fn permanent_statuses_are_not_retried() {
    let transport = MockTransport::new([Scripted::Status(13)]);
    let engine = engine(Arc::clone(&transport), fast_config(false, 3));
    let err = engine
        .call(null_proc(), Bytes::new(), RequestFlags::empty())
        .await
        .expect_err("EACCES is permanent");
    assert!(matches!(err, RpcError::Permission));
    assert_eq!(transport.call_count(), 1, "no retry for permission errors");
}

#[tokio::test]
async fn stale_handles_surface_as_their_own_class() {
    let transport = MockTransport::new([Scripted::Status(70)]);
    let engine = engine(Arc::clone(&transport), fast_config(false, 3));
    let err = engine
        .call(null_proc(), Bytes::new(), RequestFlags::empty())
        .await
        .expect_err("stale handle");
    assert!(matches!(err, RpcError::StaleHandle));
}

#[tokio::test]
async fn canceling_a_pending_request_interrupts_the_caller() {
    let transport = MockTransport::new([Scripted::Hang]);
    let engine = engine(Arc::clone(&transport), fast_config(false, 3));

    let call = {
        let engine = engine.clone();
        tokio::spawn(async move {
            engine
                .call(null_proc(), Bytes::new(), RequestFlags::empty())
                .await
        })
    };

    // Wait for the request to land in the pending map.
    for _ in 0..100 {
        if engine.outstanding() == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    let xids = transport.seen_xids();
    assert_eq!(xids.len(), 1);
    assert!(engine.cancel(xids[0]), "request was pending");

    let err = call
        .await
        .expect("task")
        .expect_err("canceled call must not succeed");
    assert!(matches!(err, RpcError::Interrupted));
    assert_eq!(engine.outstanding(), 0);
}

#[tokio::test]
async fn cancel_after_completion_is_a_benign_noop() {
    let transport = MockTransport::always_ok();
    let engine = engine(Arc::clone(&transport), fast_config(false, 3));
    engine
        .call(null_proc(), Bytes::new(), RequestFlags::empty())
        .await
        .expect("call");
    let xids = transport.seen_xids();
    assert!(!engine.cancel(xids[0]), "nothing left to cancel");
}

#[tokio::test]
async fn nointr_requests_cannot_be_canceled() {
    let transport = MockTransport::new([Scripted::Hang, Scripted::Status(0)]);
    let engine = engine(Arc::clone(&transport), fast_config(false, 3));

    let call = {
        let engine = engine.clone();
        tokio::spawn(async move {
            engine
                .call(null_proc(), Bytes::new(), RequestFlags::NOINTR)
                .await
        })
    };

    for _ in 0..100 {
        if engine.outstanding() == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    let xids = transport.seen_xids();
    assert!(
        !engine.cancel(xids[0]),
        "NOINTR requests must survive cancellation attempts"
    );
    call.await
        .expect("task")
        .expect("request completes despite the cancel attempt");
}

#[tokio::test]
async fn async_requests_complete_through_the_worker_pool() {
    let transport = MockTransport::always_ok();
    let engine = engine(Arc::clone(&transport), fast_config(false, 3));
    let (tx, rx) = tokio::sync::oneshot::channel();

    engine.submit_async(null_proc(), Bytes::new(), RequestFlags::empty(), |outcome| {
        let _ = tx.send(outcome.result.map(|r| r.nfs_status()));
    });

    let status = tokio::time::timeout(Duration::from_secs(2), rx)
        .await
        .expect("worker must pick the request up")
        .expect("callback ran")
        .expect("request succeeded");
    assert_eq!(status, NfsStat::Ok);
}

#[tokio::test]
async fn one_worker_drains_queues_of_multiple_mounts() {
    let transport = MockTransport::always_ok();
    let pool = AsyncPool::new(PoolConfig {
        max_workers: 1,
        idle: Duration::from_millis(200),
    });
    let engine_a = Engine::new(1, Arc::clone(&transport), fast_config(false, 3), Arc::clone(&pool));
    let engine_b = Engine::new(2, Arc::clone(&transport), fast_config(false, 3), Arc::clone(&pool));

    let completed = Arc::new(AtomicUsize::new(0));
    for engine in [&engine_a, &engine_b] {
        for _ in 0..5 {
            let completed = Arc::clone(&completed);
            engine.submit_async(null_proc(), Bytes::new(), RequestFlags::empty(), move |_| {
                completed.fetch_add(1, Ordering::SeqCst);
            });
        }
    }

    tokio::time::timeout(Duration::from_secs(5), async {
        while completed.load(Ordering::SeqCst) < 10 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("a single worker must serve both mounts");
    assert!(pool.workers() <= 1, "the pool must respect its bound");
}

#[tokio::test]
async fn idle_workers_retire() {
    let transport = MockTransport::always_ok();
    let pool = AsyncPool::new(PoolConfig {
        max_workers: 4,
        idle: Duration::from_millis(30),
    });
    let engine = Engine::new(1, Arc::clone(&transport), fast_config(false, 3), Arc::clone(&pool));

    let (tx, rx) = tokio::sync::oneshot::channel();
    engine.submit_async(null_proc(), Bytes::new(), RequestFlags::empty(), |_| {
        let _ = tx.send(());
    });
    rx.await.expect("request completed");
    assert!(pool.workers() >= 1, "a worker was spawned on demand");

    tokio::time::timeout(Duration::from_secs(2), async {
        while pool.workers() > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("workers must retire after the idle timeout");
}
