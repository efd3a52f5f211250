//! Gateway module — admission control, outbound dialing, and the duplex relay.
//!
//! # Submodule Architecture
//!
//! - **[`registry`]** — The [`AdmissionRegistry`] tracks active relay
//!   sessions and decides whether a new one may open under the global and
//!   per-destination-host ceilings. [`SessionGuard`] keeps a session
//!   registered for exactly as long as its relay runs.
//!
//! - **[`dialer`]** — [`dial`] opens the destination connection with a
//!   bounded connect timeout.
//!
//! - **[`relay`]** — The [`DuplexRelay`] copies bytes between the client and
//!   destination streams with per-leg idle deadlines and reports a single
//!   [`RelayOutcome`].
//!
//! # Data Flow
//!
//! ```text
//! CONNECT <ip> <port>
//!   → AdmissionRegistry::admit          (fast reject before dialing)
//!   → dial                              (bounded by connect timeout)
//!   → AdmissionRegistry::try_register   (check + insert, one lock hold)
//!   → DuplexRelay::start / wait / close
//!   → SessionGuard dropped              (session unregistered)
//! ```

pub mod dialer;
pub mod registry;
pub mod relay;

pub use dialer::dial;
pub use registry::{AdmissionLimits, AdmissionRegistry, SessionGuard};
pub use relay::{DuplexRelay, RelayOutcome, RelayStrategy, RelayTimeouts, Side};
