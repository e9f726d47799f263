//! Single-session admission control.
//!
//! The server serves exactly one bound client at a time. Binding is a single
//! check-and-set under one lock, so two racing `!CONNECT`s can never both be
//! granted.

use crate::token::{SessionToken, TokenError};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::time::Instant;
use tracing::{debug, info};

/// The currently bound client
#[derive(Debug, Clone)]
pub struct ClientSession {
    /// Token handed out in `WELCOME`
    pub token: SessionToken,
    /// Peer address of the binding control connection
    pub peer: SocketAddr,
    /// When the session was granted
    pub bound_at: Instant,
}

/// Outcome of [`SessionManager::try_bind`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// Session granted with this token
    Granted(SessionToken),
    /// Another client holds the session
    Busy,
}

/// UNBOUND/BOUND state machine guarding the single session
#[derive(Debug, Default)]
pub struct SessionManager {
    current: Mutex<Option<ClientSession>>,
}

impl SessionManager {
    /// Create an unbound manager
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `peer` if no session is active.
    ///
    /// Returns `Admission::Busy` without touching state when a session is
    /// already bound.
    ///
    /// # Errors
    ///
    /// Returns `TokenError::Random` if a token cannot be generated.
    pub fn try_bind(&self, peer: SocketAddr) -> Result<Admission, TokenError> {
        let mut current = self.current.lock();
        if let Some(existing) = current.as_ref() {
            debug!(peer = %peer, holder = %existing.peer, "Session busy");
            return Ok(Admission::Busy);
        }

        let token = SessionToken::generate()?;
        *current = Some(ClientSession {
            token: token.clone(),
            peer,
            bound_at: Instant::now(),
        });
        info!(peer = %peer, token = ?token, "Session bound");
        Ok(Admission::Granted(token))
    }

    /// Release the session if `token` is the bound one.
    ///
    /// A stale or foreign token is a no-op returning `false`.
    pub fn release(&self, token: &SessionToken) -> bool {
        let mut current = self.current.lock();
        match current.as_ref() {
            Some(session) if session.token == *token => {
                info!(
                    peer = %session.peer,
                    held_ms = session.bound_at.elapsed().as_millis() as u64,
                    "Session released"
                );
                *current = None;
                true
            }
            _ => false,
        }
    }

    /// Whether `token` is the bound session's token
    #[must_use]
    pub fn is_bound(&self, token: &SessionToken) -> bool {
        self.current
            .lock()
            .as_ref()
            .is_some_and(|s| s.token == *token)
    }

    /// Copy of the bound session, if any
    #[must_use]
    pub fn current(&self) -> Option<ClientSession> {
        self.current.lock().clone()
    }
}
