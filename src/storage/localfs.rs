//! Local filesystem storage driver on top of `tokio::fs`.

use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex as AsyncMutex;

use crate::storage::{L3Fd, OpenFlags, StorageDriver};
use crate::utils::{ErrorKind, StrataError};

/// Smallest descriptor number handed out; 0..=2 are never valid.
const MIN_L3_FD: L3Fd = 3;

/// Driver storing physical files under one vault directory.
#[derive(Debug)]
pub struct LocalFsDriver {
    /// Vault root directory.
    root: PathBuf,

    /// Open files by descriptor.
    files: Mutex<HashMap<L3Fd, Arc<AsyncMutex<File>>>>,

    next_fd: AtomicUsize,
}

impl LocalFsDriver {
    pub fn new(root: impl AsRef<Path>) -> Self {
        LocalFsDriver {
            root: root.as_ref().to_path_buf(),
            files: Mutex::new(HashMap::new()),
            next_fd: AtomicUsize::new(MIN_L3_FD),
        }
    }

    /// Number of descriptors currently open.
    pub fn num_open(&self) -> usize {
        self.files.lock().map_or(0, |files| files.len())
    }

    fn register(&self, file: File) -> Result<L3Fd, StrataError> {
        let fd = self.next_fd.fetch_add(1, Ordering::Relaxed);
        self.files
            .lock()
            .map_err(|_| StrataError::msg("fd table mutex poisoned"))?
            .insert(fd, Arc::new(AsyncMutex::new(file)));
        Ok(fd)
    }

    fn file(&self, fd: L3Fd) -> Result<Arc<AsyncMutex<File>>, StrataError> {
        self.files
            .lock()
            .map_err(|_| StrataError::msg("fd table mutex poisoned"))?
            .get(&fd)
            .cloned()
            .ok_or_else(|| {
                StrataError::new(
                    ErrorKind::Internal,
                    format!("invalid L3 descriptor {}", fd),
                )
            })
    }

    async fn ensure_parent(path: &str) -> Result<(), StrataError> {
        if let Some(parent) = Path::new(path).parent() {
            fs::create_dir_all(parent).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl StorageDriver for LocalFsDriver {
    fn vault_path(&self, logical_path: &str) -> Result<String, StrataError> {
        let rel = logical_path.trim_start_matches('/');
        if rel.is_empty() || rel.split('/').any(|c| c == "..") {
            return Err(StrataError::new(
                ErrorKind::InvalidInput,
                format!("cannot map logical path '{}'", logical_path),
            ));
        }
        Ok(self.root.join(rel).to_string_lossy().into_owned())
    }

    async fn create(&self, path: &str, mode: u32) -> Result<L3Fd, StrataError> {
        Self::ensure_parent(path).await?;
        let mut opts = OpenOptions::new();
        opts.read(true).write(true).create(true).truncate(true);
        #[cfg(unix)]
        opts.mode(mode);
        #[cfg(not(unix))]
        let _ = mode;
        let file = opts.open(path).await?;
        self.register(file)
    }

    async fn open(
        &self,
        path: &str,
        flags: OpenFlags,
        mode: u32,
    ) -> Result<L3Fd, StrataError> {
        if flags.create {
            Self::ensure_parent(path).await?;
        }
        let mut opts = OpenOptions::new();
        opts.read(flags.read)
            .write(flags.write)
            .create(flags.create && flags.write)
            .truncate(flags.truncate && flags.write);
        #[cfg(unix)]
        opts.mode(mode);
        #[cfg(not(unix))]
        let _ = mode;
        let file = opts.open(path).await?;
        self.register(file)
    }

    async fn read(
        &self,
        fd: L3Fd,
        buf: &mut [u8],
    ) -> Result<usize, StrataError> {
        let file = self.file(fd)?;
        let mut file = file.lock().await;
        Ok(file.read(buf).await?)
    }

    async fn write(&self, fd: L3Fd, buf: &[u8]) -> Result<usize, StrataError> {
        let file = self.file(fd)?;
        let mut file = file.lock().await;
        Ok(file.write(buf).await?)
    }

    async fn seek(&self, fd: L3Fd, pos: SeekFrom) -> Result<u64, StrataError> {
        let file = self.file(fd)?;
        let mut file = file.lock().await;
        Ok(file.seek(pos).await?)
    }

    async fn close(&self, fd: L3Fd) -> Result<(), StrataError> {
        let file = self
            .files
            .lock()
            .map_err(|_| StrataError::msg("fd table mutex poisoned"))?
            .remove(&fd)
            .ok_or_else(|| {
                StrataError::new(
                    ErrorKind::Internal,
                    format!("closing invalid L3 descriptor {}", fd),
                )
            })?;
        let mut file = file.lock().await;
        file.flush().await?;
        file.sync_data().await?;
        Ok(())
    }

    async fn unlink(&self, path: &str) -> Result<(), StrataError> {
        fs::remove_file(path).await?;
        Ok(())
    }

    async fn size_on_disk(&self, path: &str) -> Result<u64, StrataError> {
        Ok(fs::metadata(path).await?.len())
    }
}
