//! Request submission, the async worker pool, and timeout policy.
//!
//! Synchronous callers await their reply inline. Asynchronous requests
//! are queued per mount and drained by a shared pool of worker tasks that
//! is sized on demand: workers spawn when work arrives with nobody idle
//! (up to a maximum) and retire after sitting idle. A worker claims one
//! mount queue's current batch at a time, which both prevents double
//! dispatch and keeps mounts sharing the pool fairly.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU8, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use scc::HashMap as ConcurrentHashMap;
use sunrpc::{NfsStat, Procedure, RpcCall, RpcReply, Transport};
use tokio::sync::{Notify, oneshot};
use tracing::{debug, info, trace, warn};

use crate::node::MountId;

use super::{RequestFlags, RpcError, XidAllocator};

/// Per-mount request policy knobs.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Soft mounts give up after `retrans` attempts; hard mounts retry
    /// forever (subject to interruption).
    pub soft: bool,
    /// Attempt bound for soft mounts.
    pub retrans: u32,
    /// Baseline per-attempt timeout; the live value adapts to measured
    /// round-trip times but never drops below this.
    pub timeo: Duration,
    /// Retry backoff ceiling.
    pub max_backoff: Duration,
    /// Consecutive failed attempts before the mount is declared
    /// unresponsive (operator-visible notice).
    pub unresponsive_after: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            soft: false,
            retrans: 3,
            timeo: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
            unresponsive_after: 2,
        }
    }
}

/// Request lifecycle states, tracked for diagnostics.
const STATE_SENT: u8 = 1;
const STATE_TIMED_OUT: u8 = 2;
const STATE_COMPLETED: u8 = 3;
const STATE_CANCELED: u8 = 4;

struct PendingEntry {
    state: AtomicU8,
    resends: AtomicU32,
    flags: RequestFlags,
    abort: Mutex<Option<oneshot::Sender<()>>>,
}

/// Completion record handed to async callbacks.
pub struct RequestOutcome {
    pub xid: u64,
    pub result: Result<RpcReply, RpcError>,
    /// Times the request was re-sent after its first transmission.
    pub resends: u32,
}

/// Smoothed round-trip estimate; drives the per-attempt timeout.
struct RttEstimate {
    srtt: Duration,
}

impl RttEstimate {
    fn observe(&mut self, sample: Duration) {
        // Classic 7/8 smoothing.
        self.srtt = (self.srtt * 7 + sample) / 8;
    }

    fn attempt_timeout(&self, config: &EngineConfig) -> Duration {
        (self.srtt * 2).clamp(config.timeo, config.max_backoff)
    }
}

struct EngineInner<T: Transport> {
    mount: MountId,
    transport: Arc<T>,
    config: EngineConfig,
    xids: XidAllocator,
    pending: ConcurrentHashMap<u64, Arc<PendingEntry>>,
    rtt: Mutex<RttEstimate>,
    /// Set while the server is considered unresponsive; gates the
    /// operator notices so one outage logs once.
    unresponsive: std::sync::atomic::AtomicBool,
    pool: Arc<AsyncPool>,
}

/// The per-mount request engine. Cheap to clone; clones share state.
pub struct Engine<T: Transport> {
    inner: Arc<EngineInner<T>>,
}

impl<T: Transport> Clone for Engine<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Transport> Engine<T> {
    pub fn new(
        mount: MountId,
        transport: Arc<T>,
        config: EngineConfig,
        pool: Arc<AsyncPool>,
    ) -> Self {
        let rtt = RttEstimate { srtt: config.timeo };
        Self {
            inner: Arc::new(EngineInner {
                mount,
                transport,
                config,
                xids: XidAllocator::new(),
                pending: ConcurrentHashMap::new(),
                rtt: Mutex::new(rtt),
                unresponsive: std::sync::atomic::AtomicBool::new(false),
                pool,
            }),
        }
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Requests currently awaiting a reply.
    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.inner.pending.len()
    }

    /// Cancel a pending request. Returns `true` if it was still pending
    /// and has been canceled; a request that already completed (or was
    /// flagged `NOINTR`) is left alone and `false` is returned.
    pub fn cancel(&self, xid: u64) -> bool {
        let Some((_, entry)) = self
            .inner
            .pending
            .remove_if(&xid, |e| !e.flags.contains(RequestFlags::NOINTR))
        else {
            return false;
        };
        entry.state.store(STATE_CANCELED, Ordering::Release);
        let sender = entry
            .abort
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        if let Some(tx) = sender {
            let _ = tx.send(());
        }
        true
    }

    /// Issue a call and await the reply.
    ///
    /// A reply whose NFS status is an error is classified into the
    /// [`RpcError`] taxonomy; `Ok` always carries a successful reply.
    /// `NOINTR` requests run detached: dropping this future does not
    /// abandon them.
    pub async fn call(
        &self,
        procedure: Procedure,
        args: Bytes,
        flags: RequestFlags,
    ) -> Result<RpcReply, RpcError> {
        if flags.contains(RequestFlags::NOINTR) {
            let inner = Arc::clone(&self.inner);
            let handle =
                tokio::spawn(async move { inner.call_inner(procedure, args, flags).await.0 });
            return match handle.await {
                Ok(result) => result,
                Err(_) => Err(RpcError::Interrupted),
            };
        }
        self.inner.call_inner(procedure, args, flags).await.0
    }

    /// Queue a request for the worker pool. The callback runs in worker
    /// context once the request completes, successfully or not.
    pub fn submit_async(
        &self,
        procedure: Procedure,
        args: Bytes,
        flags: RequestFlags,
        callback: impl FnOnce(RequestOutcome) + Send + 'static,
    ) {
        let inner = Arc::clone(&self.inner);
        let mount = inner.mount;
        let work = Box::pin(async move {
            let (result, resends) = inner
                .call_inner(procedure, args, flags | RequestFlags::ASYNC)
                .await;
            let xid = result.as_ref().map_or(0, |reply| reply.xid);
            callback(RequestOutcome {
                xid,
                result,
                resends,
            });
        });
        self.inner.pool.submit(mount, work);
    }
}

impl<T: Transport> EngineInner<T> {
    /// The retry loop. Returns the result plus how many times the request
    /// was re-sent after its first transmission.
    async fn call_inner(
        &self,
        procedure: Procedure,
        args: Bytes,
        flags: RequestFlags,
    ) -> (Result<RpcReply, RpcError>, u32) {
        let xid = self.xids.allocate();
        let (abort_tx, mut abort_rx) = oneshot::channel();
        let entry = Arc::new(PendingEntry {
            state: AtomicU8::new(STATE_SENT),
            resends: AtomicU32::new(0),
            flags,
            abort: Mutex::new(Some(abort_tx)),
        });
        drop(self.pending.insert(xid, Arc::clone(&entry)));
        // Unwinds the pending entry on every exit path, including
        // cancellation by drop.
        let _unhook = PendingGuard { engine: self, xid };

        let mut attempt = 0u32;
        let mut backoff = self
            .rtt
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .attempt_timeout(&self.config);
        let resends = |a: u32| a.saturating_sub(1);

        loop {
            attempt += 1;
            if attempt > 1 {
                entry.resends.fetch_add(1, Ordering::Relaxed);
                entry.state.store(STATE_SENT, Ordering::Release);
            }
            let started = Instant::now();
            let call = self.transport.call(RpcCall {
                xid,
                procedure,
                body: args.clone(),
            });

            let outcome = tokio::select! {
                result = call => Some(result),
                () = tokio::time::sleep(backoff) => None,
                _ = &mut abort_rx => {
                    return (Err(RpcError::Interrupted), resends(attempt));
                }
            };

            match outcome {
                Some(Ok(reply)) => {
                    self.rtt
                        .lock()
                        .unwrap_or_else(std::sync::PoisonError::into_inner)
                        .observe(started.elapsed());
                    self.mark_responsive();

                    let status = reply.nfs_status();
                    if status == NfsStat::Delay {
                        // The server asked us to back off; counts as an
                        // attempt under the normal retry policy.
                        trace!(xid, "server asked for delay");
                        if self.retries_exhausted(attempt) {
                            return (
                                Err(RpcError::TimedOut { attempts: attempt }),
                                resends(attempt),
                            );
                        }
                        tokio::time::sleep(backoff).await;
                        backoff = (backoff * 2).min(self.config.max_backoff);
                        continue;
                    }

                    entry.state.store(STATE_COMPLETED, Ordering::Release);
                    let result = match RpcError::from_status(status) {
                        None => Ok(reply),
                        Some(e) => {
                            trace!(xid, status = ?status, "call failed with server status");
                            Err(e)
                        }
                    };
                    return (result, resends(attempt));
                }
                Some(Err(e)) if !e.is_transient() => {
                    entry.state.store(STATE_COMPLETED, Ordering::Release);
                    return (Err(RpcError::Transport(e)), resends(attempt));
                }
                Some(Err(e)) => {
                    debug!(xid, attempt, error = %e, "transient transport failure");
                    // The failure was instant (no timeout elapsed); wait
                    // out the backoff before hammering the server again.
                    if !self.retries_exhausted(attempt) {
                        tokio::time::sleep(backoff).await;
                    }
                }
                None => {
                    entry.state.store(STATE_TIMED_OUT, Ordering::Release);
                    debug!(xid, attempt, timeout = ?backoff, "request timed out");
                }
            }

            // Transient failure or timeout: apply retry policy.
            if self.retries_exhausted(attempt) {
                return (
                    Err(RpcError::TimedOut { attempts: attempt }),
                    resends(attempt),
                );
            }
            self.note_unresponsive(attempt);
            backoff = (backoff * 2).min(self.config.max_backoff);
        }
    }

    fn retries_exhausted(&self, attempt: u32) -> bool {
        self.config.soft && attempt >= self.config.retrans
    }

    fn note_unresponsive(&self, attempt: u32) {
        if attempt >= self.config.unresponsive_after
            && !self.unresponsive.swap(true, Ordering::AcqRel)
        {
            warn!(mount = self.mount, "server not responding, still trying");
        }
    }

    fn mark_responsive(&self) {
        if self.unresponsive.swap(false, Ordering::AcqRel) {
            info!(mount = self.mount, "server ok");
        }
    }
}

struct PendingGuard<'a, T: Transport> {
    engine: &'a EngineInner<T>,
    xid: u64,
}

impl<T: Transport> Drop for PendingGuard<'_, T> {
    fn drop(&mut self) {
        drop(self.engine.pending.remove(&self.xid));
    }
}

type Work = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Sizing for the shared worker pool.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_workers: usize,
    /// How long a worker sleeps with no work before retiring.
    pub idle: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_workers: 16,
            idle: Duration::from_secs(30),
        }
    }
}

struct MountQueue {
    queue: Mutex<VecDeque<Work>>,
}

impl MountQueue {
    /// Claim the queue's entire current contents in one step. Claimed
    /// work belongs to exactly one worker, so nothing is dispatched
    /// twice.
    fn claim_batch(&self) -> VecDeque<Work> {
        std::mem::take(
            &mut self
                .queue
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner),
        )
    }

    fn push(&self, work: Work) {
        self.queue
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push_back(work);
    }
}

struct PoolInner {
    config: PoolConfig,
    queues: ConcurrentHashMap<MountId, Arc<MountQueue>>,
    workers: AtomicUsize,
    idle_workers: AtomicUsize,
    queued: AtomicUsize,
    work_available: Notify,
}

/// Shared, demand-sized pool of async request workers.
pub struct AsyncPool {
    inner: Arc<PoolInner>,
}

impl AsyncPool {
    #[must_use]
    pub fn new(config: PoolConfig) -> Arc<Self> {
        Arc::new(Self {
            inner: Arc::new(PoolInner {
                config,
                queues: ConcurrentHashMap::new(),
                workers: AtomicUsize::new(0),
                idle_workers: AtomicUsize::new(0),
                queued: AtomicUsize::new(0),
                work_available: Notify::new(),
            }),
        })
    }

    /// Currently live workers.
    #[must_use]
    pub fn workers(&self) -> usize {
        self.inner.workers.load(Ordering::Acquire)
    }

    /// Requests queued and not yet claimed.
    #[must_use]
    pub fn queued(&self) -> usize {
        self.inner.queued.load(Ordering::Acquire)
    }

    /// Enqueue work for `mount` and make sure someone will run it.
    pub fn submit(&self, mount: MountId, work: Work) {
        let queue = match self.inner.queues.read(&mount, |_, q| Arc::clone(q)) {
            Some(q) => q,
            None => match self.inner.queues.entry(mount) {
                scc::hash_map::Entry::Occupied(occ) => Arc::clone(occ.get()),
                scc::hash_map::Entry::Vacant(vac) => {
                    let q = Arc::new(MountQueue {
                        queue: Mutex::new(VecDeque::new()),
                    });
                    vac.insert_entry(Arc::clone(&q));
                    q
                }
            },
        };
        queue.push(work);
        self.inner.queued.fetch_add(1, Ordering::AcqRel);
        self.inner.work_available.notify_one();
        self.spawn_worker_if_needed();
    }

    fn spawn_worker_if_needed(&self) {
        if self.inner.idle_workers.load(Ordering::Acquire) > 0 {
            return;
        }
        if claim_worker_slot(&self.inner) {
            spawn_worker(Arc::clone(&self.inner));
        }
    }
}

/// Claim a worker slot without exceeding the cap.
fn claim_worker_slot(inner: &PoolInner) -> bool {
    inner
        .workers
        .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
            (n < inner.config.max_workers).then_some(n + 1)
        })
        .is_ok()
}

/// Launch a worker task. A plain fn so `worker_loop` can respawn without
/// embedding its own future type in itself.
fn spawn_worker(inner: Arc<PoolInner>) {
    trace!("spawning async request worker");
    drop(tokio::spawn(async move { worker_loop(inner).await }));
}

async fn worker_loop(inner: Arc<PoolInner>) {
    loop {
        // Drain every mount's queue once per round: a worker claims one
        // mount's batch, runs it to completion, then moves on, so mounts
        // sharing the pool all make progress.
        let mut queues = Vec::new();
        inner.queues.scan(|_, q| {
            queues.push(Arc::clone(q));
        });

        let mut ran = 0usize;
        for queue in queues {
            let batch = queue.claim_batch();
            let n = batch.len();
            if n == 0 {
                continue;
            }
            inner.queued.fetch_sub(n, Ordering::AcqRel);
            ran += n;
            for work in batch {
                work.await;
            }
        }
        if ran > 0 {
            continue;
        }

        // Nothing anywhere: go idle, retire if nothing shows up.
        inner.idle_workers.fetch_add(1, Ordering::AcqRel);
        let notified = inner.work_available.notified();
        let timed_out = tokio::time::timeout(inner.config.idle, notified)
            .await
            .is_err();
        inner.idle_workers.fetch_sub(1, Ordering::AcqRel);

        if timed_out && inner.queued.load(Ordering::Acquire) == 0 {
            inner.workers.fetch_sub(1, Ordering::AcqRel);
            // Work may have raced in between the check and the
            // decrement; it would find no idle worker to wake.
            if inner.queued.load(Ordering::Acquire) > 0 && claim_worker_slot(&inner) {
                spawn_worker(Arc::clone(&inner));
            }
            trace!("async request worker retiring");
            return;
        }
    }
}
