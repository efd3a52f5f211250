//! tproxy-server: telnet-style TCP gateway.
//!
//! Accepts control connections, reads a `CONNECT <ip> <port>` command, dials
//! the destination and relays bytes between the two sockets under global and
//! per-host session limits:
//! - Admission registry with global and per-host ceilings
//! - Duplex relay with per-leg idle deadlines
//! - Per-connection session controller and accept loop
//! - TOML configuration with CLI overrides

pub mod config;
pub mod gateway;
pub mod server;
pub mod session;
