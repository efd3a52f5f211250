//! Admission registry — tracks active relay sessions and enforces the global
//! and per-destination-host ceilings.
//!
//! The registry is a cheap-to-clone handle around one `Mutex`-guarded map.
//! The lock is never held across an `.await`, so a plain `std::sync::Mutex`
//! is used; this also lets [`SessionGuard`] unregister synchronously on drop.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tproxy_core::session::{unix_now, Session};
use tproxy_core::{ProxyError, ProxyResult};
use tracing::{debug, info};

/// Session ceilings, fixed at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdmissionLimits {
    /// Maximum number of concurrent relay sessions.
    pub max_sessions: usize,
    /// Maximum concurrent sessions to one destination IP (port ignored).
    pub max_sessions_per_host: usize,
}

/// Default limits: 100 sessions overall, 10 per destination host.
impl Default for AdmissionLimits {
    fn default() -> Self {
        Self {
            max_sessions: 100,
            max_sessions_per_host: 10,
        }
    }
}

type SessionMap = HashMap<String, Session>;

/// Registry of active relay sessions keyed by `"<client>-<destination>"`.
#[derive(Debug, Clone)]
pub struct AdmissionRegistry {
    sessions: Arc<Mutex<SessionMap>>,
    limits: AdmissionLimits,
}

impl AdmissionRegistry {
    pub fn new(limits: AdmissionLimits) -> Self {
        Self {
            sessions: Arc::new(Mutex::new(HashMap::new())),
            limits,
        }
    }

    pub fn limits(&self) -> AdmissionLimits {
        self.limits
    }

    /// Whether one more session to `host` fits under both ceilings.
    ///
    /// Read-only: no slot is reserved, so a concurrent caller may take the
    /// last slot before this caller registers. Use [`Self::try_register`]
    /// when the limit must hold exactly.
    pub fn admit(&self, host: IpAddr) -> bool {
        let sessions = self.lock();
        Self::check(&sessions, &self.limits, host).is_ok()
    }

    /// Insert `session`, overwriting any entry with the same key.
    pub fn register(&self, mut session: Session) {
        session.started_at = unix_now();
        let mut sessions = self.lock();
        info!(
            key = %session.key,
            active = sessions.len() + 1,
            "session registered"
        );
        sessions.insert(session.key.clone(), session);
    }

    /// Remove the entry for `session`'s key. Missing keys are ignored.
    pub fn unregister(&self, session: &Session) {
        let mut sessions = self.lock();
        if sessions.remove(&session.key).is_some() {
            debug!(key = %session.key, active = sessions.len(), "session unregistered");
        }
    }

    /// Check both ceilings and insert `session` under a single lock hold.
    ///
    /// The returned [`SessionGuard`] unregisters the session when dropped.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::LimitExceeded`] if either ceiling is reached.
    pub fn try_register(&self, mut session: Session) -> ProxyResult<SessionGuard> {
        let mut sessions = self.lock();
        Self::check(&sessions, &self.limits, session.destination_host())
            .map_err(ProxyError::LimitExceeded)?;

        session.started_at = unix_now();
        info!(
            key = %session.key,
            active = sessions.len() + 1,
            "session registered"
        );
        sessions.insert(session.key.clone(), session.clone());

        Ok(SessionGuard {
            registry: self.clone(),
            session,
        })
    }

    /// Snapshot of the active sessions, in no particular order.
    pub fn list(&self) -> Vec<Session> {
        self.lock().values().cloned().collect()
    }

    /// Drop every entry.
    pub fn reset(&self) {
        let mut sessions = self.lock();
        info!(cleared = sessions.len(), "session registry reset");
        sessions.clear();
    }

    /// Number of active sessions.
    pub fn count(&self) -> usize {
        self.lock().len()
    }

    /// Number of active sessions whose destination IP is `host`.
    pub fn count_for_host(&self, host: IpAddr) -> usize {
        Self::host_count(&self.lock(), host)
    }

    fn lock(&self) -> MutexGuard<'_, SessionMap> {
        // The map stays consistent even if a holder panicked.
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn host_count(sessions: &SessionMap, host: IpAddr) -> usize {
        sessions
            .values()
            .filter(|s| s.destination_host() == host)
            .count()
    }

    fn check(sessions: &SessionMap, limits: &AdmissionLimits, host: IpAddr) -> Result<(), String> {
        let total = sessions.len();
        if total >= limits.max_sessions {
            return Err(format!(
                "connection limit reached ({}/{})",
                total, limits.max_sessions
            ));
        }

        let per_host = Self::host_count(sessions, host);
        if per_host >= limits.max_sessions_per_host {
            return Err(format!(
                "connection limit for {} reached ({}/{})",
                host, per_host, limits.max_sessions_per_host
            ));
        }

        Ok(())
    }
}

/// RAII registration: the session stays in the registry until this is dropped.
#[derive(Debug)]
pub struct SessionGuard {
    registry: AdmissionRegistry,
    session: Session,
}

impl SessionGuard {
    pub fn session(&self) -> &Session {
        &self.session
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.registry.unregister(&self.session);
    }
}
