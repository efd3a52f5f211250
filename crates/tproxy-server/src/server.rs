//! Core server: accepts control connections and hands each one to a
//! [`SessionController`] running in its own task.
//!
//! Owns the admission registry shared by every session.

use crate::config::ServerConfig;
use crate::gateway::AdmissionRegistry;
use crate::session::{SessionController, SessionSettings};
use std::time::Duration;
use tokio::net::TcpListener;
use tproxy_core::{ProxyError, ProxyResult};
use tracing::{debug, info, warn};

/// Back-off after a failed accept, so a full fd table does not spin the loop.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// The gateway server instance.
pub struct ProxyServer {
    config: ServerConfig,
    registry: AdmissionRegistry,
}

impl ProxyServer {
    /// Create a server with a fresh registry built from the configured limits.
    pub fn new(config: ServerConfig) -> Self {
        let registry = AdmissionRegistry::new(config.limits());
        Self { config, registry }
    }

    pub fn registry(&self) -> &AdmissionRegistry {
        &self.registry
    }

    /// Bind the configured listen address.
    pub async fn bind(&self) -> ProxyResult<TcpListener> {
        let addr = self.config.bind.socket_str();
        TcpListener::bind(&addr)
            .await
            .map_err(|e| ProxyError::Other(format!("failed to listen on {addr}: {e}")))
    }

    /// Accept connections until the task is cancelled.
    pub async fn run(self, listener: TcpListener) -> ProxyResult<()> {
        let settings = SessionSettings::from_config(&self.config);
        let limits = self.registry.limits();
        info!(
            addr = %listener.local_addr()?,
            max_connections = limits.max_sessions,
            max_connections_per_host = limits.max_sessions_per_host,
            relay_mode = ?self.config.relay_mode,
            "tproxy-server ready"
        );

        loop {
            match listener.accept().await {
                Ok((stream, remote)) => {
                    info!(remote = %remote, "new incoming connection");
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!(remote = %remote, error = %e, "failed to set TCP_NODELAY");
                    }
                    let controller =
                        SessionController::new(remote, self.registry.clone(), settings.clone());
                    tokio::spawn(controller.run(stream));
                }
                Err(e) => {
                    warn!(error = %e, "error accepting connection");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_bind;
    use crate::gateway::RelayStrategy;
    use std::net::SocketAddr;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;
    use tproxy_core::{Session, PROMPT};

    fn test_config(max: usize, per_host: usize, idle: Duration) -> ServerConfig {
        ServerConfig {
            bind: parse_bind("tcp://127.0.0.1:0").unwrap(),
            client_idle_timeout: idle,
            destination_idle_timeout: idle,
            connect_timeout: Duration::from_secs(2),
            max_connections: max,
            max_connections_per_host: per_host,
            relay_mode: RelayStrategy::Bytewise,
            log_enabled: false,
            log_color: false,
            log_level: "info".into(),
            source: None,
        }
    }

    async fn start_server(config: ServerConfig) -> (SocketAddr, AdmissionRegistry) {
        let server = ProxyServer::new(config);
        let registry = server.registry().clone();
        let listener = server.bind().await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(server.run(listener));
        (addr, registry)
    }

    /// Control connection that keeps the full transcript and a read cursor.
    struct Client {
        stream: TcpStream,
        transcript: String,
        cursor: usize,
    }

    impl Client {
        async fn connect(addr: SocketAddr) -> Self {
            let mut client = Self {
                stream: TcpStream::connect(addr).await.unwrap(),
                transcript: String::new(),
                cursor: 0,
            };
            client.expect(PROMPT).await;
            client
        }

        async fn send(&mut self, line: &str) {
            self.stream.write_all(line.as_bytes()).await.unwrap();
        }

        /// Wait for `marker` after the cursor; return the text up to it.
        async fn expect(&mut self, marker: &str) -> String {
            let mut buf = [0u8; 1024];
            loop {
                if let Some(pos) = self.transcript[self.cursor..].find(marker) {
                    let start = self.cursor;
                    self.cursor += pos + marker.len();
                    return self.transcript[start..self.cursor].to_string();
                }
                let n = tokio::time::timeout(Duration::from_secs(5), self.stream.read(&mut buf))
                    .await
                    .unwrap_or_else(|_| panic!("timed out waiting for {marker:?}"))
                    .unwrap();
                assert!(
                    n > 0,
                    "connection closed before {marker:?}; transcript {:?}",
                    self.transcript
                );
                self.transcript.push_str(&String::from_utf8_lossy(&buf[..n]));
            }
        }

        /// Read until the server closes the connection.
        async fn expect_eof(&mut self) {
            let mut rest = Vec::new();
            tokio::time::timeout(Duration::from_secs(5), self.stream.read_to_end(&mut rest))
                .await
                .expect("connection was not closed")
                .unwrap();
        }
    }

    async fn wait_for_count(registry: &AdmissionRegistry, expected: usize) {
        for _ in 0..100 {
            if registry.count() == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("registry count stayed at {}, expected {expected}", registry.count());
    }

    #[tokio::test]
    async fn test_connect_relays_and_reports_close() {
        let dest = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dest_addr = dest.local_addr().unwrap();
        let (addr, registry) = start_server(test_config(10, 2, Duration::from_secs(5))).await;

        let mut client = Client::connect(addr).await;
        client.send(&format!("CONNECT 127.0.0.1 {}\r\n", dest_addr.port())).await;
        client.expect(">>>CONNECTING<<<").await;
        let (mut device, _) = dest.accept().await.unwrap();

        client.send("hi").await;
        let mut got = [0u8; 2];
        device.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"hi");
        assert_eq!(registry.count(), 1);

        device.write_all(b"welcome\r\n").await.unwrap();
        client.expect("welcome\r\n").await;

        drop(device);
        let closed = client.expect(">>>CONNECTION_CLOSED<<<").await;
        assert!(!closed.contains("CONNECTION_LIMIT"));
        client.expect("EOF signal from destination").await;
        client.expect_eof().await;
        assert_eq!(registry.count(), 0);
    }

    #[tokio::test]
    async fn test_control_bytes_filtered_end_to_end() {
        let dest = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dest_addr = dest.local_addr().unwrap();
        let (addr, _registry) = start_server(test_config(10, 2, Duration::from_secs(5))).await;

        let mut client = Client::connect(addr).await;
        client.send(&format!("CONNECT 127.0.0.1 {}\n", dest_addr.port())).await;
        client.expect(">>>CONNECTING<<<").await;
        let (mut device, _) = dest.accept().await.unwrap();

        client.stream.write_all(b"a\x00\xffb\x03c").await.unwrap();
        let mut got = [0u8; 3];
        device.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"abc");
    }

    #[tokio::test]
    async fn test_per_host_limit_denies_second_connect() {
        let dest = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dest_addr = dest.local_addr().unwrap();
        let (addr, registry) = start_server(test_config(10, 1, Duration::from_secs(5))).await;
        let connect = format!("CONNECT 127.0.0.1 {}\n", dest_addr.port());

        let mut first = Client::connect(addr).await;
        first.send(&connect).await;
        first.expect(">>>CONNECTING<<<").await;
        let (_device, _) = dest.accept().await.unwrap();
        wait_for_count(&registry, 1).await;

        let mut second = Client::connect(addr).await;
        second.send(&connect).await;
        second
            .expect(">>>CONNECTION_LIMIT<<< Message: connect to 127.0.0.1 is denied by limits")
            .await;

        // Denied client keeps its control connection and can list sessions.
        second.expect(PROMPT).await;
        second.send("CONNECT_LIST\n").await;
        second.expect(">>>CONNECTION_LIST<<< Message: ").await;
        let listing = second.expect("\n").await;
        let sessions: Vec<Session> = serde_json::from_str(listing.trim()).unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].destination, dest_addr);
        assert!(sessions[0].started_at > 0);
    }

    #[tokio::test]
    async fn test_global_limit_denies() {
        let dest = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dest_addr = dest.local_addr().unwrap();
        let (addr, registry) = start_server(test_config(1, 10, Duration::from_secs(5))).await;
        let connect = format!("CONNECT 127.0.0.1 {}\n", dest_addr.port());

        let mut first = Client::connect(addr).await;
        first.send(&connect).await;
        let (_device, _) = dest.accept().await.unwrap();
        wait_for_count(&registry, 1).await;

        let mut second = Client::connect(addr).await;
        second.send(&connect).await;
        second.expect(">>>CONNECTION_LIMIT<<<").await;
    }

    #[tokio::test]
    async fn test_parse_error_keeps_connection_open() {
        let (addr, _registry) = start_server(test_config(10, 2, Duration::from_secs(5))).await;

        let mut client = Client::connect(addr).await;
        client.send("CONNECT not.an.ip 23\r\n").await;
        client.expect(">>>ERROR_PARSE_COMMAND<<<").await;
        client.expect(PROMPT).await;

        client.send("CONNECT 127.0.0.1\r\n").await;
        client.expect(">>>ERROR_PARSE_COMMAND<<< Message: not all arguments received").await;

        client.send("CONNECT_LIST\r\n").await;
        client.expect(">>>CONNECTION_LIST<<< Message: []").await;
    }

    #[tokio::test]
    async fn test_dial_failure_reprompts() {
        // Bind then drop to get a port with nothing listening.
        let closed_port = {
            let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
            l.local_addr().unwrap().port()
        };
        let (addr, registry) = start_server(test_config(10, 2, Duration::from_secs(5))).await;

        let mut client = Client::connect(addr).await;
        client.send(&format!("CONNECT 127.0.0.1 {closed_port}\n")).await;
        client.expect(">>>CONNECTION_ERROR<<<").await;
        client.expect(PROMPT).await;
        assert_eq!(registry.count(), 0);

        client.send("CONNECT_LIST\n").await;
        client.expect(">>>CONNECTION_LIST<<<").await;
    }

    #[tokio::test]
    async fn test_idle_control_connection_is_closed() {
        let (addr, _registry) =
            start_server(test_config(10, 2, Duration::from_millis(300))).await;

        let mut client = Client::connect(addr).await;
        client.expect_eof().await;
    }

    #[tokio::test]
    async fn test_idle_relay_reports_timeout() {
        let dest = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dest_addr = dest.local_addr().unwrap();
        let (addr, registry) =
            start_server(test_config(10, 2, Duration::from_millis(300))).await;

        let mut client = Client::connect(addr).await;
        client.send(&format!("CONNECT 127.0.0.1 {}\n", dest_addr.port())).await;
        let (_device, _) = dest.accept().await.unwrap();

        client.expect(">>>CONNECTION_CLOSED<<<").await;
        let message = client.expect("\n").await;
        assert!(message.contains("idle timeout"), "{message}");
        client.expect_eof().await;
        assert_eq!(registry.count(), 0);
    }
}
