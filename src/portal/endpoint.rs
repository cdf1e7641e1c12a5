//! The portal: a listening socket the client connects back to, one
//! connection per transfer worker, each opened by a cookie handshake.

use std::net::SocketAddr;

use serde::{Deserialize, Serialize};
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{self, Duration};

use crate::coord::L1Fd;
use crate::portal::PortalConfig;
use crate::utils::{tcp_bind_in_range, ErrorKind, StrataError};

/// What the server hands back to the client for a parallel put/get.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct PortalOprOut {
    /// Open descriptor on the server side.
    pub l1_fd: L1Fd,

    /// Number of connections the client must open.
    pub num_threads: u32,

    pub host: String,
    pub port: u16,

    /// Value each connection must send first.
    pub cookie: u32,

    /// Total bytes to move.
    pub data_size: u64,

    /// Transfer header flags of the session.
    pub flags: i32,
}

impl PortalOprOut {
    pub fn addr(&self) -> Result<SocketAddr, StrataError> {
        Ok(SocketAddr::new(self.host.parse()?, self.port))
    }
}

/// Server-side listening portal.
#[derive(Debug)]
pub struct Portal {
    listener: TcpListener,
    addr: SocketAddr,
    cookie: u32,
    num_threads: u32,
    accept_timeout: Duration,
}

impl Portal {
    /// Binds a portal within the configured port range for `num_threads`
    /// sequential connections.
    pub async fn open(
        config: &PortalConfig,
        num_threads: u32,
    ) -> Result<Self, StrataError> {
        if num_threads == 0 || num_threads > config.max_threads {
            return logged_err!(
                InvalidInput;
                "portal thread count {} outside 1..={}",
                num_threads,
                config.max_threads
            );
        }

        let listener = tcp_bind_in_range(
            config.bind_addr()?,
            config.port_range_start,
            config.port_range_end,
            num_threads,
        )
        .await?;
        let addr = listener.local_addr()?;
        let cookie = rand::random::<u32>() >> 1;
        pf_debug!("portal open at {} for {} threads", addr, num_threads);

        Ok(Portal {
            listener,
            addr,
            cookie,
            num_threads,
            accept_timeout: Duration::from_millis(config.accept_timeout_ms),
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn cookie(&self) -> u32 {
        self.cookie
    }

    pub fn num_threads(&self) -> u32 {
        self.num_threads
    }

    /// Connect-back info for the client.
    pub fn opr_out(&self, l1_fd: L1Fd, data_size: u64, flags: i32) -> PortalOprOut {
        PortalOprOut {
            l1_fd,
            num_threads: self.num_threads,
            host: self.addr.ip().to_string(),
            port: self.addr.port(),
            cookie: self.cookie,
            data_size,
            flags,
        }
    }

    /// Accepts one connection within the timeout and checks its cookie.
    pub async fn accept(&self) -> Result<TcpStream, StrataError> {
        let (mut stream, peer) =
            time::timeout(self.accept_timeout, self.listener.accept())
                .await
                .map_err(|_| {
                    StrataError::new(
                        ErrorKind::PortalProtocol,
                        format!(
                            "no connection on portal {} within {:?}",
                            self.addr, self.accept_timeout
                        ),
                    )
                })??;
        stream.set_nodelay(true)?;

        let cookie =
            time::timeout(self.accept_timeout, stream.read_u32()).await??;
        if cookie != self.cookie {
            return logged_err!(
                PortalProtocol;
                "cookie mismatch from {}: got {} expect {}",
                peer,
                cookie,
                self.cookie
            );
        }
        pf_trace!("portal {} accepted {}", self.addr, peer);
        Ok(stream)
    }
}

#[cfg(test)]
mod endpoint_tests {
    use super::*;
    use crate::utils::tcp_connect_with_retry;
    use tokio::io::AsyncWriteExt;

    fn config(start: u16) -> PortalConfig {
        PortalConfig {
            port_range_start: start,
            port_range_end: start + 19,
            accept_timeout_ms: 300,
            ..Default::default()
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn cookie_handshake() -> Result<(), StrataError> {
        let portal = Portal::open(&config(32100), 2).await?;
        let out = portal.opr_out(3, 100, 0);
        assert_eq!(out.cookie, portal.cookie());
        assert!(out.cookie <= i32::MAX as u32);

        let addr = out.addr()?;
        let client = async {
            let mut good = tcp_connect_with_retry(addr, 3).await?;
            good.write_u32(out.cookie).await?;
            let mut bad = tcp_connect_with_retry(addr, 3).await?;
            bad.write_u32(out.cookie ^ 1).await?;
            Ok::<_, StrataError>((good, bad))
        };
        let server = async {
            let first = portal.accept().await;
            let second = portal.accept().await;
            (first, second)
        };
        let (conns, (first, second)) = tokio::join!(client, server);
        conns?;
        assert!(first.is_ok());
        assert!(second.is_err_and(|e| e.kind() == ErrorKind::PortalProtocol));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn accept_times_out() -> Result<(), StrataError> {
        let portal = Portal::open(&config(32130), 1).await?;
        assert!(portal
            .accept()
            .await
            .is_err_and(|e| e.kind() == ErrorKind::PortalProtocol));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn thread_count_bounds() {
        assert!(Portal::open(&config(32160), 0).await.is_err());
        assert!(Portal::open(&config(32160), 17).await.is_err());
    }
}
