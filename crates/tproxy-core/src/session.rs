//! Relay session record shared between the registry and the control protocol.

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::time::{SystemTime, UNIX_EPOCH};

/// One active client↔destination relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    /// `"<client>-<destination>"`, unique per live TCP connection pair.
    pub key: String,
    /// Remote address of the control connection.
    pub client: SocketAddr,
    /// Address of the dialed destination.
    pub destination: SocketAddr,
    /// Unix seconds; refreshed when the session is registered.
    pub started_at: u64,
}

impl Session {
    pub fn new(client: SocketAddr, destination: SocketAddr) -> Self {
        Self {
            key: session_key(&client, &destination),
            client,
            destination,
            started_at: unix_now(),
        }
    }

    /// Destination host without the port; the unit of per-host admission.
    pub fn destination_host(&self) -> IpAddr {
        self.destination.ip()
    }
}

/// Registry key for a (client, destination) pair.
pub fn session_key(client: &SocketAddr, destination: &SocketAddr) -> String {
    format!("{client}-{destination}")
}

/// Current wall-clock time in unix seconds (0 if the clock is before the epoch).
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_and_host() {
        let s = Session::new(
            "192.168.0.7:51000".parse().unwrap(),
            "10.0.0.5:23".parse().unwrap(),
        );
        assert_eq!(s.key, "192.168.0.7:51000-10.0.0.5:23");
        assert_eq!(s.destination_host(), "10.0.0.5".parse::<IpAddr>().unwrap());
        assert!(s.started_at > 0);
    }

    #[test]
    fn distinct_client_ports_give_distinct_keys() {
        let dest: SocketAddr = "10.0.0.5:23".parse().unwrap();
        let a = session_key(&"127.0.0.1:40000".parse().unwrap(), &dest);
        let b = session_key(&"127.0.0.1:40001".parse().unwrap(), &dest);
        assert_ne!(a, b);
    }
}
