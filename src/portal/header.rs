//! Transfer header record sent ahead of every data record on a portal
//! connection: `{op: i32, flags: i32, offset: i64, length: i64}`, all
//! big-endian.

use bytes::{Buf, BufMut, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::utils::{ErrorKind, StrataError};

/// Encoded size of a header.
pub const TRAN_HEADER_LEN: usize = 24;

/// Whole remaining range goes as one record; single thread.
pub const STREAMING_FLAG: i32 = 0x1;

/// Skip the total length check at completion.
pub const NO_CHK_COPY_LEN_FLAG: i32 = 0x2;

const PUT_OPR_CODE: i32 = 1;
const GET_OPR_CODE: i32 = 2;
const DONE_OPR_CODE: i32 = 9999;

/// Operation carried by a header.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum TransferOp {
    /// Server asks the client for bytes of a range.
    Put,
    /// Server announces bytes of a range follow.
    Get,
    /// End of stream on this connection.
    Done,
}

impl TransferOp {
    fn code(self) -> i32 {
        match self {
            TransferOp::Put => PUT_OPR_CODE,
            TransferOp::Get => GET_OPR_CODE,
            TransferOp::Done => DONE_OPR_CODE,
        }
    }

    fn from_code(code: i32) -> Option<Self> {
        match code {
            PUT_OPR_CODE => Some(TransferOp::Put),
            GET_OPR_CODE => Some(TransferOp::Get),
            DONE_OPR_CODE => Some(TransferOp::Done),
            _ => None,
        }
    }
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct TransferHeader {
    pub op: TransferOp,
    pub flags: i32,
    pub offset: i64,
    pub length: i64,
}

impl TransferHeader {
    pub fn new(op: TransferOp, flags: i32, offset: u64, length: u64) -> Self {
        TransferHeader {
            op,
            flags,
            offset: offset as i64,
            length: length as i64,
        }
    }

    pub fn done(flags: i32) -> Self {
        Self::new(TransferOp::Done, flags, 0, 0)
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.reserve(TRAN_HEADER_LEN);
        buf.put_i32(self.op.code());
        buf.put_i32(self.flags);
        buf.put_i64(self.offset);
        buf.put_i64(self.length);
    }

    /// Decodes and sanity-checks a header.
    pub fn decode(mut raw: &[u8]) -> Result<Self, StrataError> {
        if raw.len() != TRAN_HEADER_LEN {
            return Err(StrataError::new(
                ErrorKind::PortalProtocol,
                format!("transfer header of {} bytes", raw.len()),
            ));
        }
        let code = raw.get_i32();
        let flags = raw.get_i32();
        let offset = raw.get_i64();
        let length = raw.get_i64();

        let op = TransferOp::from_code(code).ok_or_else(|| {
            StrataError::new(
                ErrorKind::PortalProtocol,
                format!("unknown transfer op {}", code),
            )
        })?;
        if offset < 0 || length < 0 || (op == TransferOp::Done && length != 0)
        {
            return Err(StrataError::new(
                ErrorKind::PortalProtocol,
                format!(
                    "malformed transfer header op {:?} offset {} length {}",
                    op, offset, length
                ),
            ));
        }

        Ok(TransferHeader {
            op,
            flags,
            offset,
            length,
        })
    }

    pub fn offset(&self) -> u64 {
        self.offset as u64
    }

    pub fn length(&self) -> u64 {
        self.length as u64
    }

    pub fn streaming(&self) -> bool {
        self.flags & STREAMING_FLAG != 0
    }

    pub fn no_check_len(&self) -> bool {
        self.flags & NO_CHK_COPY_LEN_FLAG != 0
    }
}

/// Writes a header to the connection.
pub(crate) async fn send_header<W>(
    conn: &mut W,
    header: &TransferHeader,
) -> Result<(), StrataError>
where
    W: AsyncWriteExt + Unpin,
{
    let mut buf = BytesMut::with_capacity(TRAN_HEADER_LEN);
    header.encode(&mut buf);
    conn.write_all(&buf).await?;
    Ok(())
}

/// Reads one header off the connection.
pub(crate) async fn recv_header<R>(
    conn: &mut R,
) -> Result<TransferHeader, StrataError>
where
    R: AsyncReadExt + Unpin,
{
    let mut raw = [0u8; TRAN_HEADER_LEN];
    conn.read_exact(&mut raw).await?;
    TransferHeader::decode(&raw)
}
