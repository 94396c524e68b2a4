//! Session validation.
//!
//! Resolves the session id a client connects with into a [`Principal`].
//! One configured credential marks the trusted upstream producer; every
//! other session must exist in the user store.

use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

use crate::store::{Identity, StoreError, UserStore};

/// Session validation errors.
#[derive(Debug, Error)]
pub enum SessionError {
    /// No user owns this session.
    #[error("Invalid authorization")]
    Rejected,

    /// The user store failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// The shared secret identifying the trusted producer.
#[derive(Clone, Default)]
pub struct TrustedCredential(Option<Arc<str>>);

impl TrustedCredential {
    /// Trust exactly `secret`.
    #[must_use]
    pub fn new(secret: impl AsRef<str>) -> Self {
        Self(Some(Arc::from(secret.as_ref())))
    }

    /// Trust nobody.
    #[must_use]
    pub fn disabled() -> Self {
        Self(None)
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.0.is_some()
    }

    /// Constant-time comparison against the configured secret.
    #[must_use]
    pub fn matches(&self, session_id: &str) -> bool {
        match &self.0 {
            Some(secret) => constant_time_eq(secret.as_bytes(), session_id.as_bytes()),
            None => false,
        }
    }
}

impl std::fmt::Debug for TrustedCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.0 {
            Some(_) => f.write_str("TrustedCredential(<redacted>)"),
            None => f.write_str("TrustedCredential(disabled)"),
        }
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut result: u8 = 0;
    for (x, y) in a.iter().zip(b.iter()) {
        result |= x ^ y;
    }
    result == 0
}

/// Who is on the other end of a connection.
#[derive(Debug, Clone, PartialEq)]
pub enum Principal {
    /// The trusted upstream producer.
    Trusted,
    /// A verified user.
    User(Identity),
}

impl Principal {
    /// The single privilege check used throughout the gateway.
    #[must_use]
    pub fn is_trusted(&self) -> bool {
        matches!(self, Principal::Trusted)
    }

    #[must_use]
    pub fn identity(&self) -> Option<&Identity> {
        match self {
            Principal::Trusted => None,
            Principal::User(identity) => Some(identity),
        }
    }

    /// READY payload: the identity, or null for the trusted producer.
    #[must_use]
    pub fn ready_payload(&self) -> Value {
        match self {
            Principal::Trusted => Value::Null,
            Principal::User(identity) => serde_json::to_value(identity).unwrap_or(Value::Null),
        }
    }
}

/// Resolves session ids through the user store.
#[derive(Clone)]
pub struct SessionValidator {
    users: Arc<dyn UserStore>,
    trusted: TrustedCredential,
}

impl SessionValidator {
    #[must_use]
    pub fn new(users: Arc<dyn UserStore>, trusted: TrustedCredential) -> Self {
        Self { users, trusted }
    }

    /// Validate a session id.
    ///
    /// The trusted credential short-circuits without touching the store.
    /// Anything else costs exactly one lookup.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Rejected`] for an unknown session, or the
    /// store's error if the lookup failed.
    pub async fn validate(&self, session_id: &str) -> Result<Principal, SessionError> {
        if self.trusted.matches(session_id) {
            debug!("Trusted session connected");
            return Ok(Principal::Trusted);
        }

        match self.users.find_user_by_session(session_id).await? {
            Some(user) => Ok(Principal::User(Identity::from(user))),
            None => Err(SessionError::Rejected),
        }
    }
}

impl std::fmt::Debug for SessionValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionValidator")
            .field("trusted", &self.trusted)
            .finish_non_exhaustive()
    }
}
