//! Replica checksums in the `sha2:<base64>` form.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use sha2::{Digest, Sha256};

use crate::storage::{OpenFlags, StorageDriver};
use crate::utils::StrataError;

/// Scheme prefix of checksum strings.
pub const CHECKSUM_SCHEME: &str = "sha2:";

const READ_BUF_SIZE: usize = 1024 * 1024;

pub fn format_checksum(digest: &[u8]) -> String {
    format!("{}{}", CHECKSUM_SCHEME, STANDARD.encode(digest))
}

/// Checksum of an in-memory buffer.
pub fn checksum_of(data: &[u8]) -> String {
    format_checksum(&Sha256::digest(data))
}

/// Reads a physical file through its driver and checksums it.
pub async fn compute_checksum(
    driver: &dyn StorageDriver,
    path: &str,
) -> Result<String, StrataError> {
    let fd = driver.open(path, OpenFlags::RDONLY, 0).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; READ_BUF_SIZE];
    let res = loop {
        match driver.read(fd, &mut buf).await {
            Ok(0) => break Ok(()),
            Ok(n) => hasher.update(&buf[..n]),
            Err(e) => break Err(e),
        }
    };
    driver.close(fd).await?;
    res?;
    Ok(format_checksum(&hasher.finalize()))
}
