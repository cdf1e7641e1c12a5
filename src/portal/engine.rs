//! Server side of parallel transfers: thread count negotiation, chunk
//! partitioning, and one worker per chunk streaming between a portal
//! connection and the replica's physical file.

use std::io::SeekFrom;
use std::sync::Arc;

use futures::future::join_all;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::portal::crypt::{recv_record, send_record};
use crate::portal::header::{send_header, TransferHeader, TransferOp};
use crate::portal::{
    BufferCrypt, Portal, PortalConfig, NO_CHK_COPY_LEN_FLAG, STREAMING_FLAG,
};
use crate::storage::{L3Fd, OpenFlags, StorageDriver};
use crate::utils::{ErrorKind, StrataError};

/// Picks the number of worker threads for a transfer of `data_size` bytes.
/// `requested` of 0 lets the server choose.
pub fn negotiate_thread_count(
    config: &PortalConfig,
    data_size: u64,
    requested: u32,
    streaming: bool,
) -> u32 {
    if streaming || data_size < config.parallel_threshold {
        return 1;
    }
    let n = if requested > 0 {
        requested
    } else {
        let by_size = data_size / config.size_per_thread.max(1) + 1;
        by_size.min(config.default_threads as u64) as u32
    };
    n.clamp(1, config.max_threads)
}

/// One contiguous byte range handled by one worker.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct ChunkRange {
    pub index: usize,
    pub offset: u64,
    pub length: u64,
}

/// Splits `[offset, offset + total)` into `n` contiguous chunks of
/// `total / n` bytes each, the last one absorbing the remainder.
pub fn partition(
    offset: u64,
    total: u64,
    n: u32,
) -> Result<Vec<ChunkRange>, StrataError> {
    if n == 0 {
        return Err(StrataError::new(
            ErrorKind::InvalidInput,
            "cannot partition into zero chunks",
        ));
    }
    let n = n as u64;
    let size0 = total / n;
    Ok((0..n)
        .map(|i| ChunkRange {
            index: i as usize,
            offset: offset + i * size0,
            length: if i == n - 1 { total - size0 * (n - 1) } else { size0 },
        })
        .collect())
}

/// Which way the bytes flow, seen from the server.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Direction {
    /// Client to server file.
    Put,
    /// Server file to client.
    Get,
}

/// Parameters of one transfer.
#[derive(Debug, Clone)]
pub struct TransferSpec {
    pub direction: Direction,
    pub offset: u64,
    pub total_size: u64,

    /// Header flags (`STREAMING_FLAG`, `NO_CHK_COPY_LEN_FLAG`).
    pub flags: i32,

    pub crypt: Option<Arc<BufferCrypt>>,
}

impl TransferSpec {
    pub fn streaming(&self) -> bool {
        self.flags & STREAMING_FLAG != 0
    }

    pub fn no_check_len(&self) -> bool {
        self.flags & NO_CHK_COPY_LEN_FLAG != 0
    }
}

/// The physical file end of a transfer. Worker 0 streams through
/// `primary_fd`; every other worker opens its own descriptor.
#[derive(Debug, Clone)]
pub struct LocalEndpoint {
    pub driver: Arc<dyn StorageDriver>,
    pub path: String,
    pub primary_fd: L3Fd,
}

/// Result slot of one worker.
#[derive(Debug)]
pub struct JobOutcome {
    pub index: usize,
    pub bytes: u64,
    pub status: Result<(), StrataError>,
}

/// Joined results of a whole transfer.
#[derive(Debug)]
pub struct TransferOutcome {
    pub jobs: Vec<JobOutcome>,

    /// Error that stopped dispatching before every chunk got a worker.
    pub dispatch_error: Option<StrataError>,

    pub expected: u64,
    pub check_len: bool,
}

impl TransferOutcome {
    pub fn bytes(&self) -> u64 {
        self.jobs.iter().map(|j| j.bytes).sum()
    }

    /// First failing worker's status in index order, then any dispatch
    /// error, then the length check. Returns total bytes on success.
    pub fn status(&self) -> Result<u64, StrataError> {
        if let Some(e) = self.jobs.iter().find_map(|j| j.status.as_ref().err())
        {
            return Err(e.clone());
        }
        if let Some(e) = &self.dispatch_error {
            return Err(e.clone());
        }
        let bytes = self.bytes();
        if self.check_len && bytes != self.expected {
            return Err(StrataError::new(
                ErrorKind::LengthMismatch,
                format!(
                    "transferred {} bytes, expected {}",
                    bytes, self.expected
                ),
            ));
        }
        Ok(bytes)
    }

    pub(crate) fn failed(
        expected: u64,
        check_len: bool,
        e: StrataError,
    ) -> Self {
        TransferOutcome {
            jobs: vec![],
            dispatch_error: Some(e),
            expected,
            check_len,
        }
    }
}

/// Everything one worker needs.
struct PortalJob {
    chunk: ChunkRange,
    stream: TcpStream,
    endpoint: LocalEndpoint,
    direction: Direction,
    flags: i32,
    crypt: Option<Arc<BufferCrypt>>,
    chunk_size: u64,
    buffer_size: usize,
}

/// Runs the server side of a transfer over an open portal: accepts one
/// connection per chunk, spawns a worker for each, and joins them all.
/// Workers do not cancel one another on failure.
pub async fn run_transfer(
    config: &PortalConfig,
    portal: Portal,
    spec: TransferSpec,
    endpoint: LocalEndpoint,
) -> TransferOutcome {
    let check_len = !spec.no_check_len();
    let chunks =
        match partition(spec.offset, spec.total_size, portal.num_threads()) {
            Ok(chunks) => chunks,
            Err(e) => return TransferOutcome::failed(spec.total_size, check_len, e),
        };
    pf_debug!(
        "{:?} of {} bytes over {} threads",
        spec.direction,
        spec.total_size,
        chunks.len()
    );

    let mut handles = Vec::with_capacity(chunks.len());
    let mut dispatch_error = None;
    for chunk in chunks {
        let stream = match portal.accept().await {
            Ok(stream) => stream,
            Err(e) => {
                pf_warn!("portal accept for chunk {} failed: {}", chunk.index, e);
                dispatch_error = Some(e);
                break;
            }
        };
        let job = PortalJob {
            chunk,
            stream,
            endpoint: endpoint.clone(),
            direction: spec.direction,
            flags: spec.flags,
            crypt: spec.crypt.clone(),
            chunk_size: config.chunk_size(),
            buffer_size: config.buffer_size(),
        };
        handles.push((chunk.index, tokio::spawn(portal_worker(job))));
    }
    drop(portal);

    // every dispatched worker is joined before returning
    let (indices, handles): (Vec<_>, Vec<_>) = handles.into_iter().unzip();
    let jobs = join_all(handles)
        .await
        .into_iter()
        .zip(indices)
        .map(|(joined, index)| match joined {
            Ok(outcome) => outcome,
            Err(e) => JobOutcome {
                index,
                bytes: 0,
                status: Err(StrataError::from(e)),
            },
        })
        .collect();

    TransferOutcome {
        jobs,
        dispatch_error,
        expected: spec.total_size,
        check_len,
    }
}

/// Worker body: gets a descriptor, moves its chunk, and always releases
/// the descriptor it opened and the socket.
async fn portal_worker(mut job: PortalJob) -> JobOutcome {
    let index = job.chunk.index;
    let mut bytes = 0;
    let driver = job.endpoint.driver.clone();

    let owns_fd = index != 0;
    let fd = if owns_fd {
        let flags = match job.direction {
            Direction::Put => OpenFlags::WRONLY,
            Direction::Get => OpenFlags::RDONLY,
        };
        match driver.open(&job.endpoint.path, flags, 0).await {
            Ok(fd) => fd,
            Err(e) => {
                return JobOutcome {
                    index,
                    bytes,
                    status: Err(e),
                }
            }
        }
    } else {
        job.endpoint.primary_fd
    };

    let mut status = match job.direction {
        Direction::Put => receive_chunk(&mut job, &*driver, fd, &mut bytes).await,
        Direction::Get => send_chunk(&mut job, &*driver, fd, &mut bytes).await,
    };

    if owns_fd {
        if let Err(e) = driver.close(fd).await {
            pf_warn!("worker {} closing fd {} failed: {}", index, fd, e);
            status = status.and(Err(e));
        }
    }
    if let Err(e) = job.stream.shutdown().await {
        pf_warn!("worker {} socket shutdown failed: {}", index, e);
    }

    if let Err(e) = &status {
        pf_warn!("worker {} failed after {} bytes: {}", index, bytes, e);
    }
    JobOutcome {
        index,
        bytes,
        status,
    }
}

/// Size of the next request: capped by the chunk size unless streaming.
fn next_request_len(job: &PortalJob, remaining: u64) -> u64 {
    if job.flags & STREAMING_FLAG != 0 {
        remaining
    } else {
        remaining.min(job.chunk_size)
    }
}

/// Put direction: requests ranges from the client and writes what comes
/// back into the file.
async fn receive_chunk(
    job: &mut PortalJob,
    driver: &dyn StorageDriver,
    fd: L3Fd,
    bytes: &mut u64,
) -> Result<(), StrataError> {
    driver.seek(fd, SeekFrom::Start(job.chunk.offset)).await?;
    let mut buf = vec![0u8; job.buffer_size];
    let mut cursor = job.chunk.offset;
    let end = job.chunk.offset + job.chunk.length;

    while cursor < end {
        let want = next_request_len(job, end - cursor);
        let header = TransferHeader::new(TransferOp::Put, job.flags, cursor, want);
        send_header(&mut job.stream, &header).await?;

        let mut left = want;
        while left > 0 {
            let written = match &job.crypt {
                Some(crypt) => {
                    let plain = recv_record(&mut job.stream, crypt).await?;
                    if plain.is_empty() || plain.len() as u64 > left {
                        return Err(StrataError::new(
                            ErrorKind::PortalProtocol,
                            format!(
                                "record of {} bytes for {} requested",
                                plain.len(),
                                left
                            ),
                        ));
                    }
                    driver.write_all(fd, &plain).await?;
                    plain.len()
                }
                None => {
                    let n = buf.len().min(left as usize);
                    job.stream.read_exact(&mut buf[..n]).await?;
                    driver.write_all(fd, &buf[..n]).await?;
                    n
                }
            };
            left -= written as u64;
            *bytes += written as u64;
        }
        cursor += want;
    }

    send_header(&mut job.stream, &TransferHeader::done(job.flags)).await
}

/// Get direction: announces ranges and streams file bytes to the client.
async fn send_chunk(
    job: &mut PortalJob,
    driver: &dyn StorageDriver,
    fd: L3Fd,
    bytes: &mut u64,
) -> Result<(), StrataError> {
    driver.seek(fd, SeekFrom::Start(job.chunk.offset)).await?;
    let mut buf = vec![0u8; job.buffer_size];
    let mut cursor = job.chunk.offset;
    let end = job.chunk.offset + job.chunk.length;

    while cursor < end {
        let want = next_request_len(job, end - cursor);
        let header = TransferHeader::new(TransferOp::Get, job.flags, cursor, want);
        send_header(&mut job.stream, &header).await?;

        let mut left = want;
        while left > 0 {
            let n = buf.len().min(left as usize);
            let got = driver.read_full(fd, &mut buf[..n]).await?;
            if got < n {
                return Err(StrataError::new(
                    ErrorKind::PhysicalIo,
                    format!(
                        "unexpected end of file at offset {}",
                        cursor + (want - left) + got as u64
                    ),
                ));
            }
            match &job.crypt {
                Some(crypt) => {
                    send_record(&mut job.stream, crypt, &buf[..n]).await?
                }
                None => job.stream.write_all(&buf[..n]).await?,
            }
            left -= n as u64;
            *bytes += n as u64;
        }
        cursor += want;
    }

    send_header(&mut job.stream, &TransferHeader::done(job.flags)).await
}
