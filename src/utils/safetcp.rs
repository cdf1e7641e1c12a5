//! Safe TCP bind/connect helper functions used by the portal.

use std::io::ErrorKind as IoErrorKind;
use std::net::{IpAddr, SocketAddr};

use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::time::{self, Duration};

use crate::utils::{ErrorKind, StrataError};

fn new_socket(addr: &SocketAddr) -> Result<TcpSocket, StrataError> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_linger(None)?;
    socket.set_reuseaddr(true)?;
    socket.set_nodelay(true)?;
    Ok(socket)
}

/// Binds a listener on the first free port within `[port_start, port_end]`
/// on given host. Ports already in use are skipped; any other bind error is
/// returned immediately. Fails if every port in the range is taken.
pub(crate) async fn tcp_bind_in_range(
    host: IpAddr,
    port_start: u16,
    port_end: u16,
    backlog: u32,
) -> Result<TcpListener, StrataError> {
    if port_start > port_end {
        return Err(StrataError::new(
            ErrorKind::InvalidInput,
            format!("invalid port range {}..={}", port_start, port_end),
        ));
    }

    for port in port_start..=port_end {
        let bind_addr = SocketAddr::new(host, port);
        let socket = new_socket(&bind_addr)?;
        match socket.bind(bind_addr) {
            Ok(()) => {}
            Err(e) if e.kind() == IoErrorKind::AddrInUse => continue,
            Err(e) => return Err(e.into()),
        }
        match socket.listen(backlog) {
            Ok(listener) => return Ok(listener),
            Err(e) if e.kind() == IoErrorKind::AddrInUse => continue,
            Err(e) => return Err(e.into()),
        }
    }

    Err(StrataError::new(
        ErrorKind::PhysicalIo,
        format!("no free port in range {}..={}", port_start, port_end),
    ))
}

/// Wrapper over tokio `TcpStream::connect()` that provides a retrying logic.
pub(crate) async fn tcp_connect_with_retry(
    conn_addr: SocketAddr,
    mut retries: u8,
) -> Result<TcpStream, StrataError> {
    loop {
        let socket = new_socket(&conn_addr)?;
        match socket.connect(conn_addr).await {
            Ok(stream) => return Ok(stream),
            Err(err) => {
                if retries == 0 {
                    return Err(err.into());
                }
                retries -= 1;
                time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}
