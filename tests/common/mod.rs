#![allow(dead_code, missing_docs, clippy::unwrap_used)]

use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use bytes::{BufMut, Bytes, BytesMut};

use driftfs::dir::{DirEntry, ReaddirPage, ReaddirSource};
use driftfs::node::{FileHandle, NodeAttrs, NodeInit, NodeType, Permissions};
use driftfs::rpc::RpcError;
use sunrpc::{NfsStat, RpcCall, RpcReply, Transport, TransportError};

/// Build a reply body that leads with `status`, as every NFS reply does.
pub fn reply_body(status: u32) -> Bytes {
    let mut buf = BytesMut::new();
    buf.put_u32(status);
    buf.freeze()
}

/// One scripted transport behavior, consumed per call in order.
pub enum Scripted {
    /// Reply with this NFS status code (0 = success).
    Status(u32),
    /// Never respond; the engine's timeout fires.
    Hang,
    /// Fail the call as a dropped connection (transient).
    Disconnect,
}

/// A transport whose replies are scripted, recording every call.
///
/// Once the script runs dry every further call succeeds with status 0.
pub struct MockTransport {
    script: Mutex<VecDeque<Scripted>>,
    calls: Mutex<Vec<RpcCall>>,
}

impl MockTransport {
    pub fn new(script: impl IntoIterator<Item = Scripted>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into_iter().collect()),
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn always_ok() -> Arc<Self> {
        Self::new([])
    }

    /// Xids of every call seen, in arrival order.
    pub fn seen_xids(&self) -> Vec<u64> {
        self.calls.lock().unwrap().iter().map(|c| c.xid).collect()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

impl Transport for MockTransport {
    fn call(&self, call: RpcCall) -> impl Future<Output = Result<RpcReply, TransportError>> + Send {
        let xid = call.xid;
        self.calls.lock().unwrap().push(call);
        let behavior = self.script.lock().unwrap().pop_front();
        async move {
            match behavior {
                None | Some(Scripted::Status(0)) => Ok(RpcReply {
                    xid,
                    body: reply_body(0),
                }),
                Some(Scripted::Status(code)) => Ok(RpcReply {
                    xid,
                    body: reply_body(code),
                }),
                Some(Scripted::Hang) => std::future::pending().await,
                Some(Scripted::Disconnect) => Err(TransportError::ConnectionClosed(1)),
            }
        }
    }
}

/// A scripted page source for directory fills, counting calls.
pub struct ScriptedReaddir {
    pages: Mutex<VecDeque<Result<ReaddirPage, u32>>>,
    calls: AtomicU32,
}

impl ScriptedReaddir {
    pub fn new(pages: impl IntoIterator<Item = Result<ReaddirPage, u32>>) -> Self {
        Self {
            pages: Mutex::new(pages.into_iter().collect()),
            calls: AtomicU32::new(0),
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl ReaddirSource for ScriptedReaddir {
    fn read_dir(
        &self,
        _cookie: u64,
    ) -> impl Future<Output = Result<ReaddirPage, RpcError>> + Send {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let next = self.pages.lock().unwrap().pop_front();
        async move {
            match next {
                Some(Ok(page)) => Ok(page),
                Some(Err(code)) => Err(RpcError::Status(NfsStat::from_code(code))),
                None => Ok(ReaddirPage {
                    entries: Vec::new(),
                    eof: true,
                }),
            }
        }
    }
}

/// Directory entries with predictable cookies: entry `i` resumes at
/// `base + i + 1`.
pub fn entries(base: u64, count: u64) -> Vec<DirEntry> {
    (0..count)
        .map(|i| DirEntry {
            fileid: 1000 + base + i,
            name: format!("entry-{}", base + i).into(),
            cookie: base + i + 1,
        })
        .collect()
}

pub fn make_attrs(ntype: NodeType, size: u64) -> NodeAttrs {
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

pub fn make_init(ntype: NodeType, size: u64, xid: u64) -> NodeInit {
    NodeInit {
        attrs: make_attrs(ntype, size),
        xid,
        parent: None,
    }
}

pub fn handle(byte: u8) -> FileHandle {
    FileHandle::new(vec![byte; 16])
}
