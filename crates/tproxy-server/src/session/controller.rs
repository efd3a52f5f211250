//! Control session lifecycle.
//!
//! A session reads command lines from the client until it either closes the
//! control connection, goes idle, or starts a relay. Once a relay starts the
//! control connection is handed to it, and the session ends when the relay
//! does:
//!
//! ```text
//! AwaitingCommand → Validating → Admitting → Dialing → Relaying → Closed
//!        ↑______________|______________|__________|
//!          (command, admission and dial errors re-prompt)
//! ```

use crate::config::ServerConfig;
use crate::gateway::{
    dial, AdmissionRegistry, DuplexRelay, RelayStrategy, RelayTimeouts, SessionGuard,
};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tproxy_core::{
    banner, parse_command, Command, ProxyError, ProxyResult, Session, StatusLine, PROMPT,
};
use tracing::{debug, info, trace, warn};

/// Longest command line accepted; longer input is cut at this length.
const MAX_LINE_LEN: u64 = 1024;

/// Timeouts and relay mode applied to every session.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// Deadline for each command read and each status write.
    pub control_idle_timeout: Duration,
    pub connect_timeout: Duration,
    pub relay_timeouts: RelayTimeouts,
    pub relay_mode: RelayStrategy,
}

impl SessionSettings {
    pub fn from_config(config: &ServerConfig) -> Self {
        Self {
            control_idle_timeout: config.client_idle_timeout,
            connect_timeout: config.connect_timeout,
            relay_timeouts: config.relay_timeouts(),
            relay_mode: config.relay_mode,
        }
    }
}

/// Where a control session currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    AwaitingCommand,
    Validating,
    Admitting,
    Dialing,
    Relaying,
    Closed,
}

/// Drives one client's control connection.
pub struct SessionController {
    peer: SocketAddr,
    registry: AdmissionRegistry,
    settings: SessionSettings,
    state: SessionState,
}

impl SessionController {
    pub fn new(peer: SocketAddr, registry: AdmissionRegistry, settings: SessionSettings) -> Self {
        Self {
            peer,
            registry,
            settings,
            state: SessionState::AwaitingCommand,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Serve `stream` until the session ends. Errors are logged, never
    /// returned: a failed control connection has no one left to report to.
    pub async fn run<S>(mut self, stream: S)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        if let Err(e) = self.serve(stream).await {
            debug!(
                remote = %self.peer,
                state = ?self.state(),
                error = %e,
                "control connection error"
            );
        }
        self.transition(SessionState::Closed);
        info!(remote = %self.peer, "client disconnected, connection closed");
    }

    async fn serve<S>(&mut self, stream: S) -> ProxyResult<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let mut control = BufReader::new(stream);
        self.send(&mut control, banner().as_bytes()).await?;

        loop {
            self.transition(SessionState::AwaitingCommand);
            self.send(&mut control, PROMPT.as_bytes()).await?;

            let raw = match self.read_line(&mut control).await {
                Ok(Some(raw)) => raw,
                Ok(None) => {
                    debug!(remote = %self.peer, "client closed control connection");
                    return Ok(());
                }
                Err(ProxyError::Timeout) => {
                    info!(remote = %self.peer, "no commands from client, connection closed");
                    return Ok(());
                }
                Err(e) => return Err(e),
            };

            self.transition(SessionState::Validating);
            let command = match parse_command(&raw) {
                Ok(command) => command,
                Err(e) => {
                    warn!(remote = %self.peer, error = %e, "error parse command");
                    self.send_status(&mut control, StatusLine::parse_error(&e)).await?;
                    continue;
                }
            };

            match command {
                Command::Empty => {}
                Command::Unsupported(line) => {
                    warn!(remote = %self.peer, command = %line, "incorrect command");
                    self.send_status(&mut control, StatusLine::unsupported(&line)).await?;
                }
                Command::ConnectList => {
                    let sessions = self.registry.list();
                    debug!(remote = %self.peer, count = sessions.len(), "listing sessions");
                    self.send_status(&mut control, StatusLine::session_list(&sessions)).await?;
                }
                Command::Connect { .. } => {
                    let Some(destination) = command.destination() else {
                        continue;
                    };
                    if let Some((far, guard)) = self.open(&mut control, destination).await? {
                        return self.relay(control, far, guard).await;
                    }
                }
            }
        }
    }

    /// Admit, dial and register. `None` means the attempt failed and the
    /// client has already been told why.
    async fn open<S>(
        &mut self,
        control: &mut BufReader<S>,
        destination: SocketAddr,
    ) -> ProxyResult<Option<(TcpStream, SessionGuard)>>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        self.transition(SessionState::Admitting);
        let host = destination.ip();
        if !self.registry.admit(host) {
            warn!(remote = %self.peer, host = %host, "connect denied by limits");
            self.send_status(control, StatusLine::limit(host)).await?;
            return Ok(None);
        }

        self.send_status(control, StatusLine::connecting(destination)).await?;

        self.transition(SessionState::Dialing);
        info!(remote = %self.peer, destination = %destination, "opening destination connection");
        let far = match dial(destination, self.settings.connect_timeout).await {
            Ok(far) => far,
            Err(e) => {
                self.send_status(control, StatusLine::dial_failed(destination, &e)).await?;
                return Ok(None);
            }
        };

        let device = far.peer_addr().unwrap_or(destination);
        let guard = match self.registry.try_register(Session::new(self.peer, device)) {
            Ok(guard) => guard,
            Err(e) => {
                // Another session took the last slot between admit and now.
                warn!(remote = %self.peer, host = %host, error = %e, "connect denied by limits");
                self.send_status(control, StatusLine::limit(host)).await?;
                return Ok(None);
            }
        };

        info!(
            remote = %self.peer,
            destination = %device,
            host_sessions = self.registry.count_for_host(host),
            total_sessions = self.registry.count(),
            "destination connected"
        );
        Ok(Some((far, guard)))
    }

    /// Relay until either leg ends, then report the outcome and close.
    async fn relay<S>(
        &mut self,
        control: BufReader<S>,
        far: TcpStream,
        guard: SessionGuard,
    ) -> ProxyResult<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        self.transition(SessionState::Relaying);
        let key = guard.session().key.clone();

        // Bytes the client sent right after the command are still buffered
        // in `control` and reach the destination through the relay.
        let mut relay = DuplexRelay::start(
            control,
            far,
            self.settings.relay_timeouts,
            self.settings.relay_mode,
        );
        let outcome = relay.wait().await;
        let streams = relay.close().await;
        drop(guard);

        let message = match outcome {
            Ok(outcome) => {
                if outcome.is_error() {
                    warn!(
                        remote = %self.peer,
                        session = %key,
                        side = %outcome.side(),
                        timeout = outcome.is_timeout(),
                        outcome = %outcome,
                        "relay terminated"
                    );
                } else {
                    info!(
                        remote = %self.peer,
                        session = %key,
                        side = %outcome.side(),
                        outcome = %outcome,
                        "relay finished"
                    );
                }
                outcome.to_string()
            }
            Err(e) => {
                warn!(remote = %self.peer, session = %key, error = %e, "relay failed");
                e.to_string()
            }
        };

        let (mut control, far) = streams?;
        drop(far);
        debug!(remote = %self.peer, session = %key, "destination disconnected, connection closed");

        self.send_status(&mut control, StatusLine::closed(message)).await?;
        let _ = control.shutdown().await;
        Ok(())
    }

    /// Read one line, bounded by the control idle deadline and `MAX_LINE_LEN`.
    /// `Ok(None)` on EOF.
    async fn read_line<S>(&self, control: &mut BufReader<S>) -> ProxyResult<Option<Vec<u8>>>
    where
        S: AsyncRead + Unpin,
    {
        let mut line = Vec::new();
        let mut limited = (&mut *control).take(MAX_LINE_LEN);
        match tokio::time::timeout(
            self.settings.control_idle_timeout,
            limited.read_until(b'\n', &mut line),
        )
        .await
        {
            Err(_) => Err(ProxyError::Timeout),
            Ok(Err(e)) => Err(e.into()),
            Ok(Ok(0)) => Ok(None),
            Ok(Ok(_)) => Ok(Some(line)),
        }
    }

    async fn send_status<W>(&self, control: &mut W, line: StatusLine) -> ProxyResult<()>
    where
        W: AsyncWrite + Unpin,
    {
        self.send(control, &line.to_bytes()).await
    }

    async fn send<W>(&self, control: &mut W, bytes: &[u8]) -> ProxyResult<()>
    where
        W: AsyncWrite + Unpin,
    {
        tokio::time::timeout(self.settings.control_idle_timeout, async {
            control.write_all(bytes).await?;
            control.flush().await
        })
        .await
        .map_err(|_| ProxyError::Timeout)??;
        Ok(())
    }

    fn transition(&mut self, next: SessionState) {
        trace!(remote = %self.peer, from = ?self.state, to = ?next, "session state");
        self.state = next;
    }
}
