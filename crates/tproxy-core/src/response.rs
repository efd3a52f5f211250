//! Status lines written back on the control connection.
//!
//! Every status line has the form `\n>>>MARKER<<< Message: <text>\n` so a
//! client or test harness can match on the bracketed marker.

use crate::session::Session;
use std::fmt;

/// Prompt written before each command read.
pub const PROMPT: &str = "\n>>> ";

/// Greeting sent once per accepted control connection.
pub fn banner() -> String {
    format!(
        "\nTelnet proxy v{}\nSupported commands:\n\tCONNECT <IP Address> <Port>\n\tCONNECT_LIST\n",
        env!("CARGO_PKG_VERSION")
    )
}

/// Machine-matchable status marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Connecting,
    ConnectionClosed,
    ConnectionLimit,
    ConnectionError,
    ConnectionList,
    ErrorParseCommand,
    IncorrectCommand,
}

impl Status {
    pub fn marker(self) -> &'static str {
        match self {
            Status::Connecting => "CONNECTING",
            Status::ConnectionClosed => "CONNECTION_CLOSED",
            Status::ConnectionLimit => "CONNECTION_LIMIT",
            Status::ConnectionError => "CONNECTION_ERROR",
            Status::ConnectionList => "CONNECTION_LIST",
            Status::ErrorParseCommand => "ERROR_PARSE_COMMAND",
            Status::IncorrectCommand => "INCORRECT_OR_NOT_SUPPORTED_COMMAND",
        }
    }
}

/// One status line: a marker plus free text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusLine {
    pub status: Status,
    pub message: String,
}

impl StatusLine {
    pub fn new(status: Status, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn connecting(destination: impl fmt::Display) -> Self {
        Self::new(Status::Connecting, format!("connect to {destination}"))
    }

    pub fn closed(outcome: impl fmt::Display) -> Self {
        Self::new(Status::ConnectionClosed, outcome.to_string())
    }

    pub fn limit(host: impl fmt::Display) -> Self {
        Self::new(
            Status::ConnectionLimit,
            format!("connect to {host} is denied by limits"),
        )
    }

    pub fn dial_failed(destination: impl fmt::Display, reason: impl fmt::Display) -> Self {
        Self::new(
            Status::ConnectionError,
            format!("connect to {destination} failed: {reason}"),
        )
    }

    pub fn parse_error(reason: impl fmt::Display) -> Self {
        Self::new(Status::ErrorParseCommand, reason.to_string())
    }

    pub fn unsupported(line: &str) -> Self {
        Self::new(
            Status::IncorrectCommand,
            format!("unsupported command: {line}"),
        )
    }

    /// Active sessions as a JSON array.
    pub fn session_list(sessions: &[Session]) -> Self {
        let json = serde_json::to_string(sessions).unwrap_or_else(|_| "[]".to_string());
        Self::new(Status::ConnectionList, json)
    }

    /// Wire bytes for this line.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.to_string().into_bytes()
    }
}

impl fmt::Display for StatusLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\n>>>{}<<< Message: {}\n", self.status.marker(), self.message)
    }
}
