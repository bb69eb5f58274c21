//! The transport trait and its TCP implementation.
//!
//! The TCP transport multiplexes concurrent calls over one connection: a
//! writer task drains an outgoing queue, a reader task reassembles reply
//! records and completes the matching caller through a oneshot channel,
//! keyed by the call's wire xid. Grounded on the one-task-owns-the-socket
//! model; callers never touch the stream directly.

use std::future::Future;
use std::sync::{Arc, Mutex};

use bytes::{BufMut, Bytes, BytesMut};
use rustc_hash::FxHashMap;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::error::TransportError;
use crate::proc::{NFS_PROGRAM, NfsStat, Procedure};
use crate::record;

/// Credential flavor attached to every call.
#[derive(Debug, Clone)]
pub enum AuthFlavor {
    /// No credentials (flavor 0). Enough for NULL pings.
    None,
    /// Classic Unix credentials (flavor 1).
    Sys {
        machine: String,
        uid: u32,
        gid: u32,
        gids: Vec<u32>,
    },
}

/// A call ready for the wire: pre-built argument body plus routing data.
///
/// The xid is the engine's full 64-bit transaction id; only the low 32
/// bits travel on the wire. The engine's wrap generation (upper bits)
/// exists precisely so that wire-level reuse after 2^32 calls stays
/// disambiguated on the client side.
#[derive(Debug, Clone)]
pub struct RpcCall {
    pub xid: u64,
    pub procedure: Procedure,
    pub body: Bytes,
}

/// A decoded, accepted reply.
#[derive(Debug, Clone)]
pub struct RpcReply {
    pub xid: u64,
    pub body: Bytes,
}

impl RpcReply {
    /// Read the leading NFS status word of the reply body.
    ///
    /// Every NFS procedure reply (and every v4 compound) begins with its
    /// status; this is the one piece of body layout the client core needs
    /// for error classification.
    #[must_use]
    pub fn nfs_status(&self) -> NfsStat {
        if self.body.len() < 4 {
            // An empty body is what NULL returns; treat it as success.
            return NfsStat::Ok;
        }
        let code = u32::from_be_bytes([self.body[0], self.body[1], self.body[2], self.body[3]]);
        NfsStat::from_code(code)
    }
}

/// Trait for pluggable RPC transports.
///
/// Uses native `impl Future` in traits — no `async-trait` macro. The
/// client core is generic over this trait, so test doubles script replies
/// without any network.
pub trait Transport: Send + Sync + 'static {
    /// Submit a call and await its paired reply.
    fn call(&self, call: RpcCall) -> impl Future<Output = Result<RpcReply, TransportError>> + Send;
}

type PendingMap = FxHashMap<u32, oneshot::Sender<Result<RpcReply, TransportError>>>;

/// TCP transport with record marking and xid-paired reply dispatch.
pub struct TcpTransport {
    outgoing: mpsc::UnboundedSender<Bytes>,
    pending: Arc<Mutex<PendingMap>>,
    auth: AuthFlavor,
}

impl TcpTransport {
    /// Connect to `addr` and spawn the writer/reader tasks.
    pub async fn connect(addr: &str, auth: AuthFlavor) -> Result<Self, TransportError> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let (read_half, write_half) = stream.into_split();
        Ok(Self::from_halves(read_half, write_half, auth))
    }

    /// Build a transport over arbitrary stream halves. Used by tests with
    /// in-memory duplex streams.
    pub fn from_halves<R, W>(read_half: R, write_half: W, auth: AuthFlavor) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel::<Bytes>();
        let pending: Arc<Mutex<PendingMap>> = Arc::new(Mutex::new(FxHashMap::default()));

        tokio::spawn(writer_task(write_half, rx));
        tokio::spawn(reader_task(read_half, Arc::clone(&pending)));

        Self {
            outgoing: tx,
            pending,
            auth,
        }
    }

    #[expect(
        clippy::cast_possible_truncation,
        reason = "wire xid is defined as the low 32 bits of the engine xid"
    )]
    fn wire_xid(xid: u64) -> u32 {
        xid as u32
    }
}

impl Transport for TcpTransport {
    fn call(&self, call: RpcCall) -> impl Future<Output = Result<RpcReply, TransportError>> + Send {
        let wire_xid = Self::wire_xid(call.xid);
        let frame = encode_call(wire_xid, call.procedure, &self.auth, &call.body);
        let (tx, rx) = oneshot::channel();

        let registered = {
            let mut pending = self
                .pending
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            // A colliding wire xid means the previous call with this low
            // word is still outstanding after a full wrap. Refuse rather
            // than cross wires.
            if pending.contains_key(&wire_xid) {
                false
            } else {
                pending.insert(wire_xid, tx);
                true
            }
        };

        let mut sent = false;
        if registered {
            sent = self.outgoing.send(frame).is_ok();
            if !sent {
                // Writer task is gone; un-register so the slot is not
                // leaked.
                let mut pending = self
                    .pending
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner);
                pending.remove(&wire_xid);
            }
        }
        let full_xid = call.xid;

        async move {
            if !sent {
                return Err(TransportError::Submit);
            }
            match rx.await {
                Ok(Ok(mut reply)) => {
                    // Restore the caller's full 64-bit xid.
                    reply.xid = full_xid;
                    Ok(reply)
                }
                Ok(Err(e)) => Err(e),
                // Reader task dropped the sender: connection torn down.
                Err(_) => Err(TransportError::ConnectionClosed(0)),
            }
        }
    }
}

async fn writer_task<W: AsyncWrite + Unpin>(mut w: W, mut rx: mpsc::UnboundedReceiver<Bytes>) {
    while let Some(frame) = rx.recv().await {
        if let Err(e) = record::write_record(&mut w, &frame).await {
            warn!(error = %e, "rpc writer task stopping");
            return;
        }
    }
}

async fn reader_task<R: AsyncRead + Unpin>(mut r: R, pending: Arc<Mutex<PendingMap>>) {
    loop {
        let rec = match record::read_record(&mut r).await {
            Ok(rec) => rec,
            Err(e) => {
                let mut pending = pending
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner);
                let count = pending.len();
                if count > 0 {
                    debug!(outstanding = count, error = %e, "failing outstanding calls");
                }
                for (_, tx) in pending.drain() {
                    let _ = tx.send(Err(TransportError::ConnectionClosed(count)));
                }
                return;
            }
        };

        match decode_reply(&rec) {
            Ok((wire_xid, result)) => {
                let tx = {
                    let mut pending = pending
                        .lock()
                        .unwrap_or_else(std::sync::PoisonError::into_inner);
                    pending.remove(&wire_xid)
                };
                match tx {
                    Some(tx) => {
                        // A dropped receiver means the caller was
                        // cancelled after the reply arrived; ignore.
                        let _ = tx.send(result);
                    }
                    None => debug!(wire_xid, "reply with no matching call"),
                }
            }
            Err(e) => {
                // A reply we cannot even extract an xid from leaves the
                // stream unusable.
                warn!(error = %e, "undecodable reply record, closing transport");
                let mut pending = pending
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner);
                let count = pending.len();
                for (_, tx) in pending.drain() {
                    let _ = tx.send(Err(TransportError::ConnectionClosed(count)));
                }
                return;
            }
        }
    }
}

const MSG_CALL: u32 = 0;
const MSG_REPLY: u32 = 1;
const RPC_VERSION: u32 = 2;
const REPLY_ACCEPTED: u32 = 0;
const ACCEPT_SUCCESS: u32 = 0;
const ACCEPT_GARBAGE_ARGS: u32 = 4;

fn put_opaque(buf: &mut BytesMut, data: &[u8]) {
    #[expect(
        clippy::cast_possible_truncation,
        reason = "opaque auth fields are tiny (machine names, gid lists)"
    )]
    buf.put_u32(data.len() as u32);
    buf.put_slice(data);
    // XDR pads opaques to 4-byte alignment.
    buf.put_bytes(0, (4 - data.len() % 4) % 4);
}

fn put_auth(buf: &mut BytesMut, auth: &AuthFlavor) {
    match auth {
        AuthFlavor::None => {
            buf.put_u32(0); // AUTH_NONE
            buf.put_u32(0); // zero-length body
        }
        AuthFlavor::Sys {
            machine,
            uid,
            gid,
            gids,
        } => {
            let mut body = BytesMut::new();
            body.put_u32(0); // stamp
            put_opaque(&mut body, machine.as_bytes());
            body.put_u32(*uid);
            body.put_u32(*gid);
            #[expect(clippy::cast_possible_truncation, reason = "gid lists are tiny")]
            body.put_u32(gids.len() as u32);
            for g in gids {
                body.put_u32(*g);
            }
            buf.put_u32(1); // AUTH_SYS
            #[expect(clippy::cast_possible_truncation, reason = "auth body is tiny")]
            buf.put_u32(body.len() as u32);
            buf.put_slice(&body);
        }
    }
}

fn encode_call(wire_xid: u32, procedure: Procedure, auth: &AuthFlavor, body: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(64 + body.len());
    buf.put_u32(wire_xid);
    buf.put_u32(MSG_CALL);
    buf.put_u32(RPC_VERSION);
    buf.put_u32(NFS_PROGRAM);
    buf.put_u32(procedure.program.version());
    buf.put_u32(procedure.number);
    put_auth(&mut buf, auth);
    // Null verifier.
    buf.put_u32(0);
    buf.put_u32(0);
    buf.put_slice(body);
    buf.freeze()
}

/// Decode a reply record down to (wire xid, accepted body or error).
fn decode_reply(rec: &Bytes) -> Result<(u32, Result<RpcReply, TransportError>), TransportError> {
    let word = |i: usize| -> Result<u32, TransportError> {
        let off = i * 4;
        rec.get(off..off + 4)
            .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
            .ok_or(TransportError::MalformedReply("truncated header"))
    };

    let wire_xid = word(0)?;
    if word(1)? != MSG_REPLY {
        return Err(TransportError::MalformedReply("not a reply"));
    }
    let reply_stat = word(2)?;
    if reply_stat != REPLY_ACCEPTED {
        return Ok((wire_xid, Err(TransportError::Rejected(word(3)?))));
    }

    // Accepted: verifier (flavor, opaque) then accept status.
    let verf_len = word(4)? as usize;
    let padded = verf_len.div_ceil(4);
    let accept_word = 5 + padded;
    let accept_stat = word(accept_word)?;
    let result = match accept_stat {
        ACCEPT_SUCCESS => {
            let body_off = (accept_word + 1) * 4;
            Ok(RpcReply {
                xid: u64::from(wire_xid),
                body: rec.slice(body_off.min(rec.len())..),
            })
        }
        ACCEPT_GARBAGE_ARGS => Err(TransportError::MalformedReply("server: garbage args")),
        _ => Err(TransportError::ProgramMismatch),
    };
    Ok((wire_xid, result))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proc::NfsProgram;

    fn encode_reply(wire_xid: u32, nfs_status: u32) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u32(wire_xid);
        buf.put_u32(MSG_REPLY);
        buf.put_u32(REPLY_ACCEPTED);
        buf.put_u32(0); // verf flavor
        buf.put_u32(0); // verf length
        buf.put_u32(ACCEPT_SUCCESS);
        buf.put_u32(nfs_status);
        buf.to_vec()
    }

    #[test]
    fn decode_extracts_xid_and_body() {
        let rec = Bytes::from(encode_reply(7, 70));
        let (xid, result) = decode_reply(&rec).expect("decodable");
        assert_eq!(xid, 7);
        let reply = result.expect("accepted");
        assert_eq!(reply.nfs_status(), NfsStat::Stale);
    }

    #[test]
    fn empty_body_reads_as_ok_status() {
        let reply = RpcReply {
            xid: 1,
            body: Bytes::new(),
        };
        assert_eq!(reply.nfs_status(), NfsStat::Ok);
    }

    #[tokio::test]
    async fn tcp_transport_pairs_reply_with_caller() {
        let (client, server) = tokio::io::duplex(4096);
        let (client_r, client_w) = tokio::io::split(client);
        let transport = TcpTransport::from_halves(client_r, client_w, AuthFlavor::None);

        // Fake server: read one call record, answer with its xid.
        let (mut server_r, mut server_w) = tokio::io::split(server);
        tokio::spawn(async move {
            let call = record::read_record(&mut server_r).await.expect("call");
            let xid = u32::from_be_bytes([call[0], call[1], call[2], call[3]]);
            let reply = encode_reply(xid, 0);
            record::write_record(&mut server_w, &reply)
                .await
                .expect("reply");
        });

        let reply = transport
            .call(RpcCall {
                xid: 42,
                procedure: Procedure::null(NfsProgram::V3),
                body: Bytes::new(),
            })
            .await
            .expect("call should complete");
        assert_eq!(reply.xid, 42, "full 64-bit xid restored");
        assert_eq!(reply.nfs_status(), NfsStat::Ok);
    }

    #[tokio::test]
    async fn connection_drop_fails_outstanding_calls() {
        let (client, server) = tokio::io::duplex(4096);
        let (client_r, client_w) = tokio::io::split(client);
        let transport = TcpTransport::from_halves(client_r, client_w, AuthFlavor::None);

        let call_fut = transport.call(RpcCall {
            xid: 9,
            procedure: Procedure::null(NfsProgram::V3),
            body: Bytes::new(),
        });
        drop(server);

        let err = call_fut.await.expect_err("connection is gone");
        assert!(
            matches!(
                err,
                TransportError::ConnectionClosed(_) | TransportError::Io(_)
            ),
            "unexpected error: {err:?}"
        );
    }
}
