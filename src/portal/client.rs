//! Client side of a parallel transfer: connects back to the portal once per
//! worker thread and answers the server's transfer headers.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use futures::future::join_all;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::portal::crypt::{recv_record, send_record};
use crate::portal::header::{recv_header, TransferOp};
use crate::portal::{BufferCrypt, PortalOprOut, NO_CHK_COPY_LEN_FLAG};
use crate::utils::{tcp_connect_with_retry, ErrorKind, StrataError};

/// Where a client put reads its bytes from.
#[derive(Debug, Clone)]
pub enum LocalSource {
    File(PathBuf),
    Buffer(Bytes),
}

impl LocalSource {
    async fn reader(&self) -> Result<SourceReader, StrataError> {
        Ok(match self {
            LocalSource::File(path) => SourceReader::File(File::open(path).await?),
            LocalSource::Buffer(data) => SourceReader::Buffer(data.clone()),
        })
    }
}

/// Per-connection handle on a `LocalSource`.
enum SourceReader {
    File(File),
    Buffer(Bytes),
}

impl SourceReader {
    /// Reads exactly `buf.len()` bytes at `offset`.
    async fn read_at(
        &mut self,
        offset: u64,
        buf: &mut [u8],
    ) -> Result<(), StrataError> {
        match self {
            SourceReader::File(file) => {
                file.seek(SeekFrom::Start(offset)).await?;
                file.read_exact(buf).await?;
            }
            SourceReader::Buffer(data) => {
                let start = offset as usize;
                let end = start + buf.len();
                if end > data.len() {
                    return Err(StrataError::new(
                        ErrorKind::PortalProtocol,
                        format!(
                            "range {}..{} past source of {} bytes",
                            start,
                            end,
                            data.len()
                        ),
                    ));
                }
                buf.copy_from_slice(&data[start..end]);
            }
        }
        Ok(())
    }
}

async fn connect(out: &PortalOprOut) -> Result<TcpStream, StrataError> {
    let mut stream = tcp_connect_with_retry(out.addr()?, 10).await?;
    stream.set_nodelay(true)?;
    stream.write_u32(out.cookie).await?;
    Ok(stream)
}

fn unexpected_op(op: TransferOp) -> StrataError {
    StrataError::new(
        ErrorKind::PortalProtocol,
        format!("unexpected transfer op {:?}", op),
    )
}

/// Sums per-connection results, surfacing the first error.
fn gather(
    out: &PortalOprOut,
    results: Vec<Result<Result<u64, StrataError>, tokio::task::JoinError>>,
) -> Result<u64, StrataError> {
    let mut total = 0;
    for result in results {
        total += result??;
    }
    if out.flags & NO_CHK_COPY_LEN_FLAG == 0 && total != out.data_size {
        return Err(StrataError::new(
            ErrorKind::LengthMismatch,
            format!("moved {} bytes, expected {}", total, out.data_size),
        ));
    }
    Ok(total)
}

/// Feeds a parallel put from `source`; returns the bytes sent.
pub async fn client_put(
    out: &PortalOprOut,
    source: LocalSource,
    crypt: Option<Arc<BufferCrypt>>,
    buffer_size: usize,
) -> Result<u64, StrataError> {
    let mut handles = Vec::with_capacity(out.num_threads as usize);
    for _ in 0..out.num_threads {
        let stream = connect(out).await?;
        let source = source.clone();
        let crypt = crypt.clone();
        handles.push(tokio::spawn(async move {
            let mut reader = source.reader().await?;
            put_conn(stream, &mut reader, crypt.as_deref(), buffer_size).await
        }));
    }
    gather(out, join_all(handles).await)
}

async fn put_conn(
    mut stream: TcpStream,
    reader: &mut SourceReader,
    crypt: Option<&BufferCrypt>,
    buffer_size: usize,
) -> Result<u64, StrataError> {
    let mut buf = vec![0u8; buffer_size.max(1)];
    let mut sent = 0;
    loop {
        let header = recv_header(&mut stream).await?;
        match header.op {
            TransferOp::Done => break,
            TransferOp::Get => return Err(unexpected_op(header.op)),
            TransferOp::Put => {
                let mut offset = header.offset();
                let end = offset + header.length();
                while offset < end {
                    let n = buf.len().min((end - offset) as usize);
                    reader.read_at(offset, &mut buf[..n]).await?;
                    match crypt {
                        Some(crypt) => send_record(&mut stream, crypt, &buf[..n]).await?,
                        None => stream.write_all(&buf[..n]).await?,
                    }
                    offset += n as u64;
                    sent += n as u64;
                }
            }
        }
    }
    Ok(sent)
}

/// Receives a parallel get into the local file `dest`, created or
/// truncated to the announced size; returns the bytes received.
pub async fn client_get(
    out: &PortalOprOut,
    dest: &Path,
    crypt: Option<Arc<BufferCrypt>>,
    buffer_size: usize,
) -> Result<u64, StrataError> {
    let file = File::create(dest).await?;
    file.set_len(out.data_size).await?;
    drop(file);

    let mut handles = Vec::with_capacity(out.num_threads as usize);
    for _ in 0..out.num_threads {
        let stream = connect(out).await?;
        let dest = dest.to_path_buf();
        let crypt = crypt.clone();
        handles.push(tokio::spawn(async move {
            let file = OpenOptions::new().write(true).open(&dest).await?;
            get_conn(stream, file, crypt.as_deref(), buffer_size).await
        }));
    }
    gather(out, join_all(handles).await)
}

async fn get_conn(
    mut stream: TcpStream,
    mut file: File,
    crypt: Option<&BufferCrypt>,
    buffer_size: usize,
) -> Result<u64, StrataError> {
    let mut buf = vec![0u8; buffer_size.max(1)];
    let mut received = 0;
    loop {
        let header = recv_header(&mut stream).await?;
        match header.op {
            TransferOp::Done => break,
            TransferOp::Put => return Err(unexpected_op(header.op)),
            TransferOp::Get => {
                file.seek(SeekFrom::Start(header.offset())).await?;
                let mut left = header.length();
                while left > 0 {
                    let n = match crypt {
                        Some(crypt) => {
                            let plain = recv_record(&mut stream, crypt).await?;
                            if plain.is_empty() || plain.len() as u64 > left {
                                return Err(StrataError::new(
                                    ErrorKind::PortalProtocol,
                                    format!(
                                        "record of {} bytes for {} announced",
                                        plain.len(),
                                        left
                                    ),
                                ));
                            }
                            file.write_all(&plain).await?;
                            plain.len()
                        }
                        None => {
                            let n = buf.len().min(left as usize);
                            stream.read_exact(&mut buf[..n]).await?;
                            file.write_all(&buf[..n]).await?;
                            n
                        }
                    };
                    left -= n as u64;
                    received += n as u64;
                }
            }
        }
    }
    file.flush().await?;
    Ok(received)
}
