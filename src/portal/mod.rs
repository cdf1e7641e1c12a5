//! Parallel portal transfer engine: header codec, per-buffer encryption,
//! the listening portal, chunked multi-worker streaming, and the client
//! side that connects back.

mod client;
mod copy;
mod crypt;
mod endpoint;
mod engine;
mod header;

pub use client::{client_get, client_put, LocalSource};
pub use copy::{same_host_copy, CopyEnd};
pub use crypt::{BufferCrypt, SessionKeys, IV_CIPHER_LEN};
pub use endpoint::{Portal, PortalOprOut};
pub use engine::{
    negotiate_thread_count, partition, run_transfer, ChunkRange, Direction,
    JobOutcome, LocalEndpoint, TransferOutcome, TransferSpec,
};
pub use header::{
    TransferHeader, TransferOp, NO_CHK_COPY_LEN_FLAG, STREAMING_FLAG,
    TRAN_HEADER_LEN,
};

use std::net::IpAddr;

use serde::Deserialize;

use crate::utils::{ErrorKind, StrataError};

const MIB: u64 = 1024 * 1024;

/// Configuration parameters of the transfer engine.
#[derive(Debug, Deserialize, Clone)]
pub struct PortalConfig {
    /// Upper bound on worker threads of one transfer.
    pub max_threads: u32,

    /// Thread count when the server chooses and the size allows.
    pub default_threads: u32,

    /// Transfers smaller than this many bytes use a single thread.
    pub parallel_threshold: u64,

    /// Bytes per thread the server aims for when it chooses.
    pub size_per_thread: u64,

    /// Largest record requested per header, in MiB.
    pub chunk_size_mb: u64,

    /// Bounded buffer size of the streaming loop, in MiB.
    pub buffer_size_mb: u64,

    /// Port range the portal binds within, inclusive.
    pub port_range_start: u16,
    pub port_range_end: u16,

    /// Address the portal binds to and advertises.
    pub bind_host: String,

    /// How long the portal waits for each client connection, in millisecs.
    pub accept_timeout_ms: u64,

    /// Key size of the symmetric cipher; also the IV size on the wire.
    pub key_size: usize,

    pub salt_size: usize,
    pub num_hash_rounds: u32,
}

impl Default for PortalConfig {
    fn default() -> Self {
        PortalConfig {
            max_threads: 16,
            default_threads: 4,
            parallel_threshold: 4 * MIB,
            size_per_thread: 32 * MIB,
            chunk_size_mb: 4,
            buffer_size_mb: 1,
            port_range_start: 20000,
            port_range_end: 20199,
            bind_host: "127.0.0.1".into(),
            accept_timeout_ms: 5000,
            key_size: 32,
            salt_size: 8,
            num_hash_rounds: 16,
        }
    }
}

impl PortalConfig {
    /// Parses from an optional TOML string on top of defaults, then
    /// validates.
    pub fn from_toml(config_str: Option<&str>) -> Result<Self, StrataError> {
        let config = parsed_config!(config_str => PortalConfig;
                                    max_threads, default_threads,
                                    parallel_threshold, size_per_thread,
                                    chunk_size_mb, buffer_size_mb,
                                    port_range_start, port_range_end,
                                    bind_host, accept_timeout_ms,
                                    key_size, salt_size, num_hash_rounds)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), StrataError> {
        let invalid = |what: String| {
            Err(StrataError::new(ErrorKind::InvalidInput, what))
        };
        if self.max_threads == 0 || self.default_threads == 0 {
            return invalid(format!(
                "invalid thread counts max {} default {}",
                self.max_threads, self.default_threads
            ));
        }
        if self.chunk_size_mb == 0 || self.buffer_size_mb == 0 {
            return invalid(format!(
                "invalid chunk {} / buffer {} size",
                self.chunk_size_mb, self.buffer_size_mb
            ));
        }
        if self.port_range_start > self.port_range_end {
            return invalid(format!(
                "invalid port range {}..={}",
                self.port_range_start, self.port_range_end
            ));
        }
        if self.key_size != crypt::KEY_SIZE {
            return invalid(format!(
                "unsupported key size {}, expect {}",
                self.key_size,
                crypt::KEY_SIZE
            ));
        }
        if self.num_hash_rounds == 0 {
            return invalid("num_hash_rounds must be positive".into());
        }
        self.bind_addr()?;
        Ok(())
    }

    pub fn bind_addr(&self) -> Result<IpAddr, StrataError> {
        Ok(self.bind_host.parse()?)
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size_mb * MIB
    }

    pub fn buffer_size(&self) -> usize {
        (self.buffer_size_mb * MIB) as usize
    }
}

#[cfg(test)]
mod config_tests {
    use super::*;

    #[test]
    fn portal_config_defaults() -> Result<(), StrataError> {
        let config = PortalConfig::from_toml(None)?;
        assert_eq!(config.chunk_size(), 4 * MIB);
        assert_eq!(config.buffer_size(), MIB as usize);
        Ok(())
    }

    #[test]
    fn portal_config_overrides() -> Result<(), StrataError> {
        let config = PortalConfig::from_toml(Some(
            "max_threads = 8\nport_range_start = 30000\nport_range_end = 30010",
        ))?;
        assert_eq!(config.max_threads, 8);
        assert_eq!(config.port_range_end, 30010);
        Ok(())
    }

    #[test]
    fn portal_config_rejects_bad_values() {
        assert!(PortalConfig::from_toml(Some("max_threads = 0")).is_err());
        assert!(PortalConfig::from_toml(Some("key_size = 16")).is_err());
        assert!(PortalConfig::from_toml(Some(
            "port_range_start = 10\nport_range_end = 9"
        ))
        .is_err());
        assert!(PortalConfig::from_toml(Some("bind_host = 'nohost'")).is_err());
        assert!(PortalConfig::from_toml(Some("unknown = 1")).is_err());
    }
}
