//! Control sessions: one [`SessionController`] per accepted client connection.

pub mod controller;

pub use controller::{SessionController, SessionSettings, SessionState};
