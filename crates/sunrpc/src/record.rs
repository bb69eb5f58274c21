//! Record marking for RPC over TCP.
//!
//! TCP is a byte stream, so each RPC message travels as one or more
//! fragments, each prefixed by a 4-byte header: the high bit marks the
//! final fragment, the low 31 bits carry the fragment length.

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::TransportError;

const LAST_FRAGMENT: u32 = 0x8000_0000;
const LEN_MASK: u32 = 0x7fff_ffff;

/// Upper bound on a single reassembled record. Larger replies indicate a
/// desynchronized stream or a misbehaving server.
pub const MAX_RECORD: usize = 1 << 23;

/// Write `body` as a single final fragment.
pub async fn write_record<W: AsyncWrite + Unpin>(
    w: &mut W,
    body: &[u8],
) -> Result<(), TransportError> {
    if body.len() > MAX_RECORD {
        return Err(TransportError::OversizedRecord {
            size: body.len(),
            max: MAX_RECORD,
        });
    }
    #[expect(
        clippy::cast_possible_truncation,
        reason = "length checked against MAX_RECORD above"
    )]
    let header = LAST_FRAGMENT | body.len() as u32;
    w.write_all(&header.to_be_bytes()).await?;
    w.write_all(body).await?;
    w.flush().await?;
    Ok(())
}

/// Read one complete record, reassembling fragments.
pub async fn read_record<R: AsyncRead + Unpin>(r: &mut R) -> Result<Bytes, TransportError> {
    let mut record = BytesMut::new();
    loop {
        let mut header = [0u8; 4];
        r.read_exact(&mut header).await?;
        let header = u32::from_be_bytes(header);
        let len = (header & LEN_MASK) as usize;

        if record.len() + len > MAX_RECORD {
            return Err(TransportError::OversizedRecord {
                size: record.len() + len,
                max: MAX_RECORD,
            });
        }

        let start = record.len();
        record.resize(start + len, 0);
        r.read_exact(&mut record[start..]).await?;

        if header & LAST_FRAGMENT != 0 {
            return Ok(record.freeze());
        }
    }
}
