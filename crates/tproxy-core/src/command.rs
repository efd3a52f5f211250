//! Control-line command parsing.
//!
//! A control line is one newline-terminated chunk of client input. Keywords
//! are case-sensitive; arguments are separated by whitespace.

use crate::error::CommandError;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

/// `CONNECT <IP Address> <Port>`
pub const CMD_CONNECT: &str = "CONNECT";
/// `CONNECT_LIST`
pub const CMD_CONNECT_LIST: &str = "CONNECT_LIST";

/// Telnet control octets stripped from client→destination traffic:
/// NUL, IAC and the C0 codes SOH, STX, ETX, EOT, BEL, BS.
pub const CONTROL_BYTES: [u8; 8] = [0x00, 0xFF, 0x02, 0x01, 0x03, 0x04, 0x07, 0x08];

/// Whether `byte` belongs to the telnet control filter set.
#[inline]
pub fn is_control_byte(byte: u8) -> bool {
    CONTROL_BYTES.contains(&byte)
}

/// A parsed control command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Open a relay to `ip:port`.
    Connect { ip: Ipv4Addr, port: u16 },
    /// Enumerate the active relay sessions.
    ConnectList,
    /// Nothing but whitespace / line terminators.
    Empty,
    /// Any other keyword. Holds the prepared line for logging.
    Unsupported(String),
}

impl Command {
    /// Destination socket address for `Connect`, `None` otherwise.
    pub fn destination(&self) -> Option<SocketAddr> {
        match self {
            Command::Connect { ip, port } => Some(SocketAddr::V4(SocketAddrV4::new(*ip, *port))),
            _ => None,
        }
    }
}

/// Strip line terminators, NULs and telnet control octets, then trim.
pub fn prepare_line(raw: &[u8]) -> String {
    let bytes: Vec<u8> = raw
        .iter()
        .copied()
        .filter(|b| *b != b'\r' && *b != b'\n' && !is_control_byte(*b))
        .collect();
    String::from_utf8_lossy(&bytes).trim().to_string()
}

/// Parse one raw control line into a [`Command`].
///
/// # Errors
///
/// Returns a [`CommandError`] for a known keyword with a wrong argument
/// count, a malformed dotted-quad IPv4 address, or a port that is not a
/// decimal number in `1..=65535`. Unknown keywords are not errors; they
/// yield [`Command::Unsupported`].
pub fn parse_command(raw: &[u8]) -> Result<Command, CommandError> {
    let line = prepare_line(raw);
    let mut parts = line.split_whitespace();

    let Some(keyword) = parts.next() else {
        return Ok(Command::Empty);
    };
    let args: Vec<&str> = parts.collect();

    match keyword {
        CMD_CONNECT => {
            if args.len() < 2 {
                return Err(CommandError::MissingArguments(CMD_CONNECT));
            }
            if args.len() > 2 {
                return Err(CommandError::TooManyArguments(CMD_CONNECT));
            }
            let ip = parse_ipv4(args[0])?;
            let port = parse_port(args[1])?;
            Ok(Command::Connect { ip, port })
        }
        CMD_CONNECT_LIST => {
            if !args.is_empty() {
                return Err(CommandError::TooManyArguments(CMD_CONNECT_LIST));
            }
            Ok(Command::ConnectList)
        }
        _ => Ok(Command::Unsupported(line)),
    }
}

/// Strict dotted-quad: four decimal octets, no leading zeros, no shorthand.
fn parse_ipv4(s: &str) -> Result<Ipv4Addr, CommandError> {
    s.parse::<Ipv4Addr>()
        .map_err(|_| CommandError::InvalidAddress(s.to_string()))
}

fn parse_port(s: &str) -> Result<u16, CommandError> {
    match s.parse::<u16>() {
        Ok(0) | Err(_) => Err(CommandError::InvalidPort(s.to_string())),
        Ok(port) => Ok(port),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_connect() {
        let cmd = parse_command(b"CONNECT 10.0.0.5 23\r\n").unwrap();
        assert_eq!(
            cmd,
            Command::Connect {
                ip: Ipv4Addr::new(10, 0, 0, 5),
                port: 23
            }
        );
        assert_eq!(
            cmd.destination(),
            Some("10.0.0.5:23".parse::<SocketAddr>().unwrap())
        );
    }

    #[test]
    fn parse_connect_extra_whitespace() {
        let cmd = parse_command(b"  CONNECT   192.168.1.1\t8080 \n").unwrap();
        assert_eq!(
            cmd,
            Command::Connect {
                ip: Ipv4Addr::new(192, 168, 1, 1),
                port: 8080
            }
        );
    }

    #[test]
    fn parse_connect_invalid_ip() {
        let err = parse_command(b"CONNECT not.an.ip 23\n").unwrap_err();
        assert_eq!(err, CommandError::InvalidAddress("not.an.ip".into()));

        for bad in ["256.0.0.1", "1.2.3", "1.2.3.4.5", "01.2.3.4", "::1"] {
            let line = format!("CONNECT {bad} 23");
            assert!(
                matches!(
                    parse_command(line.as_bytes()),
                    Err(CommandError::InvalidAddress(_))
                ),
                "{bad} should be rejected"
            );
        }
    }

    #[test]
    fn parse_connect_invalid_port() {
        for bad in ["telnet", "0", "65536", "-1"] {
            let line = format!("CONNECT 10.0.0.5 {bad}");
            assert_eq!(
                parse_command(line.as_bytes()),
                Err(CommandError::InvalidPort(bad.to_string()))
            );
        }
    }

    #[test]
    fn address_checked_before_port() {
        let err = parse_command(b"CONNECT bad port").unwrap_err();
        assert!(matches!(err, CommandError::InvalidAddress(_)));
    }

    #[test]
    fn parse_connect_argument_count() {
        assert_eq!(
            parse_command(b"CONNECT 10.0.0.5"),
            Err(CommandError::MissingArguments(CMD_CONNECT))
        );
        assert_eq!(
            parse_command(b"CONNECT"),
            Err(CommandError::MissingArguments(CMD_CONNECT))
        );
        assert_eq!(
            parse_command(b"CONNECT 10.0.0.5 23 extra"),
            Err(CommandError::TooManyArguments(CMD_CONNECT))
        );
    }

    #[test]
    fn parse_connect_list() {
        assert_eq!(parse_command(b"CONNECT_LIST\r\n").unwrap(), Command::ConnectList);
        assert_eq!(
            parse_command(b"CONNECT_LIST 1.2.3.4 23"),
            Err(CommandError::TooManyArguments(CMD_CONNECT_LIST))
        );
    }

    #[test]
    fn keywords_are_case_sensitive() {
        assert_eq!(
            parse_command(b"connect 10.0.0.5 23").unwrap(),
            Command::Unsupported("connect 10.0.0.5 23".into())
        );
    }

    #[test]
    fn blank_lines_are_empty() {
        assert_eq!(parse_command(b"").unwrap(), Command::Empty);
        assert_eq!(parse_command(b"\r\n").unwrap(), Command::Empty);
        assert_eq!(parse_command(b" \x00 \n").unwrap(), Command::Empty);
    }

    #[test]
    fn control_bytes_stripped_from_line() {
        let cmd = parse_command(b"\xff\x00CONNECT 10.0.0.5 23\x00\r\n").unwrap();
        assert_eq!(cmd.destination(), Some("10.0.0.5:23".parse().unwrap()));
    }

    #[test]
    fn control_byte_set() {
        for b in CONTROL_BYTES {
            assert!(is_control_byte(b));
        }
        assert!(!is_control_byte(b'a'));
        assert!(!is_control_byte(b'\r'));
        assert!(!is_control_byte(b'\n'));
        assert!(!is_control_byte(0x1b));
    }
}
