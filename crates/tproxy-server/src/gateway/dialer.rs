//! Outbound TCP dialing with a bounded connect timeout.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpStream;
use tproxy_core::{ProxyError, ProxyResult};
use tracing::{debug, warn};

/// Connect to `addr`, giving up after `timeout`.
///
/// Nagle is disabled on the returned stream: relayed traffic is mostly
/// interactive keystrokes.
///
/// # Errors
///
/// Returns [`ProxyError::Dial`] if the connection is refused, unreachable,
/// or does not complete within `timeout`.
pub async fn dial(addr: SocketAddr, timeout: Duration) -> ProxyResult<TcpStream> {
    let stream = match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            warn!(addr = %addr, error = %e, "TCP connect failed");
            return Err(ProxyError::Dial(e.to_string()));
        }
        Err(_) => {
            let e = io::Error::new(io::ErrorKind::TimedOut, "connection timed out");
            warn!(addr = %addr, timeout_ms = timeout.as_millis() as u64, "TCP connect timed out");
            return Err(ProxyError::Dial(e.to_string()));
        }
    };

    if let Err(e) = stream.set_nodelay(true) {
        debug!(addr = %addr, error = %e, "could not set TCP_NODELAY");
    }
    Ok(stream)
}
