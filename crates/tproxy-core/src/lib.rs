//! tproxy-core: shared protocol library for the tproxy gateway.
//!
//! Provides the control-line command parser, status-line formatting, the
//! relay session record and the common error type.

pub mod command;
pub mod error;
pub mod response;
pub mod session;

// Re-export commonly used items at crate root.
pub use command::{is_control_byte, parse_command, Command, CONTROL_BYTES};
pub use error::{CommandError, ProxyError, ProxyResult};
pub use response::{banner, Status, StatusLine, PROMPT};
pub use session::{session_key, Session};
