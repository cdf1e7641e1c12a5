//! Same-host copy between two physical files, split across workers the
//! same way a portal transfer is.

use std::io::SeekFrom;
use std::sync::Arc;

use futures::future::join_all;

use crate::portal::engine::{partition, ChunkRange, JobOutcome, TransferOutcome};
use crate::portal::PortalConfig;
use crate::storage::{L3Fd, OpenFlags, StorageDriver};
use crate::utils::{ErrorKind, StrataError};

/// One end of a same-host copy.
#[derive(Debug, Clone)]
pub struct CopyEnd {
    pub driver: Arc<dyn StorageDriver>,
    pub path: String,
}

/// Copies `total` bytes from `src` to `dst` with `num_threads` workers,
/// each opening its own descriptors on both ends. The destination file
/// must already exist.
pub async fn same_host_copy(
    config: &PortalConfig,
    src: CopyEnd,
    dst: CopyEnd,
    total: u64,
    num_threads: u32,
) -> TransferOutcome {
    let chunks = match partition(0, total, num_threads) {
        Ok(chunks) => chunks,
        Err(e) => return TransferOutcome::failed(total, true, e),
    };
    pf_debug!(
        "copying {} bytes {} -> {} over {} threads",
        total,
        src.path,
        dst.path,
        chunks.len()
    );

    let buffer_size = config.buffer_size();
    let handles: Vec<_> = chunks
        .into_iter()
        .map(|chunk| {
            let (src, dst) = (src.clone(), dst.clone());
            tokio::spawn(copy_worker(chunk, src, dst, buffer_size))
        })
        .collect();

    let jobs = join_all(handles)
        .await
        .into_iter()
        .enumerate()
        .map(|(index, joined)| {
            joined.unwrap_or_else(|e| JobOutcome {
                index,
                bytes: 0,
                status: Err(StrataError::from(e)),
            })
        })
        .collect();

    TransferOutcome {
        jobs,
        dispatch_error: None,
        expected: total,
        check_len: true,
    }
}

async fn copy_worker(
    chunk: ChunkRange,
    src: CopyEnd,
    dst: CopyEnd,
    buffer_size: usize,
) -> JobOutcome {
    let mut bytes = 0;
    let status = async {
        let src_fd = src.driver.open(&src.path, OpenFlags::RDONLY, 0).await?;
        let dst_fd = match dst.driver.open(&dst.path, OpenFlags::WRONLY, 0).await {
            Ok(fd) => fd,
            Err(e) => {
                if let Err(ce) = src.driver.close(src_fd).await {
                    pf_warn!(
                        "copy worker {} closing source fd {} failed: {}",
                        chunk.index,
                        src_fd,
                        ce
                    );
                }
                return Err(e);
            }
        };

        let copied =
            copy_range(&chunk, &src, src_fd, &dst, dst_fd, buffer_size, &mut bytes)
                .await;
        let closed_src = src.driver.close(src_fd).await;
        let closed_dst = dst.driver.close(dst_fd).await;
        copied.and(closed_src).and(closed_dst)
    }
    .await;

    if let Err(e) = &status {
        pf_warn!("copy worker {} failed after {} bytes: {}", chunk.index, bytes, e);
    }
    JobOutcome {
        index: chunk.index,
        bytes,
        status,
    }
}

async fn copy_range(
    chunk: &ChunkRange,
    src: &CopyEnd,
    src_fd: L3Fd,
    dst: &CopyEnd,
    dst_fd: L3Fd,
    buffer_size: usize,
    bytes: &mut u64,
) -> Result<(), StrataError> {
    src.driver.seek(src_fd, SeekFrom::Start(chunk.offset)).await?;
    dst.driver.seek(dst_fd, SeekFrom::Start(chunk.offset)).await?;

    let mut buf = vec![0u8; buffer_size.max(1)];
    let mut left = chunk.length;
    while left > 0 {
        let n = buf.len().min(left as usize);
        let got = src.driver.read_full(src_fd, &mut buf[..n]).await?;
        if got == 0 {
            return Err(StrataError::new(
                ErrorKind::PhysicalIo,
                format!(
                    "source {} ended at offset {}",
                    src.path,
                    chunk.offset + *bytes
                ),
            ));
        }
        dst.driver.write_all(dst_fd, &buf[..got]).await?;
        left -= got as u64;
        *bytes += got as u64;
    }
    Ok(())
}

#[cfg(test)]
mod copy_tests {
    use super::*;
    use crate::storage::LocalFsDriver;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn copy_across_drivers() -> Result<(), StrataError> {
        let dir0 = tempfile::tempdir()?;
        let dir1 = tempfile::tempdir()?;
        let src_driver = Arc::new(LocalFsDriver::new(dir0.path()));
        let dst_driver = Arc::new(LocalFsDriver::new(dir1.path()));
        let data: Vec<u8> = (0..100_003u32).map(|i| (i % 97) as u8).collect();
        std::fs::write(dir0.path().join("a"), &data)?;
        let src_path = dir0.path().join("a").to_string_lossy().into_owned();
        let dst_path = dir1.path().join("b").to_string_lossy().into_owned();
        let fd = dst_driver.create(&dst_path, 0o600).await?;
        dst_driver.close(fd).await?;

        let config = PortalConfig {
            buffer_size_mb: 1,
            ..Default::default()
        };
        let src = CopyEnd {
            driver: src_driver.clone(),
            path: src_path,
        };
        let dst = CopyEnd {
            driver: dst_driver.clone(),
            path: dst_path,
        };
        let outcome = same_host_copy(&config, src.clone(), dst.clone(), data.len() as u64, 3).await;
        assert_eq!(outcome.status()?, data.len() as u64);
        assert_eq!(std::fs::read(dir1.path().join("b"))?, data);
        assert_eq!(src_driver.num_open() + dst_driver.num_open(), 0);

        // claiming more than the source holds fails
        let outcome = same_host_copy(&config, src, dst, data.len() as u64 + 10, 2).await;
        assert!(outcome.status().is_err_and(|e| e.kind() == ErrorKind::PhysicalIo));
        assert_eq!(src_driver.num_open() + dst_driver.num_open(), 0);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn missing_destination_releases_source() -> Result<(), StrataError> {
        let dir0 = tempfile::tempdir()?;
        let dir1 = tempfile::tempdir()?;
        let src_driver = Arc::new(LocalFsDriver::new(dir0.path()));
        let dst_driver = Arc::new(LocalFsDriver::new(dir1.path()));
        std::fs::write(dir0.path().join("a"), vec![7u8; 4096])?;

        let src = CopyEnd {
            driver: src_driver.clone(),
            path: dir0.path().join("a").to_string_lossy().into_owned(),
        };
        let dst = CopyEnd {
            driver: dst_driver.clone(),
            path: dir1.path().join("nope/b").to_string_lossy().into_owned(),
        };
        let outcome = same_host_copy(&PortalConfig::default(), src, dst, 4096, 3).await;
        assert!(outcome.status().is_err());
        assert_eq!(outcome.jobs.len(), 3);
        assert!(outcome.jobs.iter().all(|j| j.status.is_err() && j.bytes == 0));
        assert_eq!(src_driver.num_open(), 0);
        assert_eq!(dst_driver.num_open(), 0);
        Ok(())
    }
}
