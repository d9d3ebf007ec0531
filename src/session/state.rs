//! Session states, notifications and errors.

use rand::Rng;
use serde::Serialize;
use subtle::ConstantTimeEq;

use crate::oauth::{ErrorKind, Profile, TokenSet};

/// Characters used for CSRF nonces.
const NONCE_CHARS: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

/// Nonce length in characters (~190 bits of entropy).
const NONCE_LENGTH: usize = 32;

/// Anti-forgery value bound to one authorization attempt.
#[derive(Clone, PartialEq, Eq)]
pub struct CsrfNonce(String);

impl CsrfNonce {
    /// Generate a fresh random nonce.
    #[must_use]
    pub fn generate() -> Self {
        let mut rng = rand::rng();
        let nonce = (0..NONCE_LENGTH)
            .map(|_| NONCE_CHARS[rng.random_range(0..NONCE_CHARS.len())] as char)
            .collect();
        Self(nonce)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Compare against a `state` value from a redirect in constant time.
    pub fn matches(&self, candidate: &str) -> bool {
        self.0.as_bytes().ct_eq(candidate.as_bytes()).into()
    }
}

impl From<&str> for CsrfNonce {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl std::fmt::Debug for CsrfNonce {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "CsrfNonce({})", crate::oauth::mask(&self.0))
    }
}

/// Full session state, including secrets. Never leaves the session.
#[derive(Debug, Clone)]
pub(crate) enum SessionState {
    LoggedOut,
    Authorizing { nonce: CsrfNonce },
    ExchangingToken,
    RefreshingToken,
    LoggedIn { tokens: TokenSet, profile: Profile },
}

impl SessionState {
    pub(crate) fn phase(&self) -> SessionPhase {
        match self {
            Self::LoggedOut => SessionPhase::LoggedOut,
            Self::Authorizing { .. } => SessionPhase::Authorizing,
            Self::ExchangingToken => SessionPhase::ExchangingToken,
            Self::RefreshingToken => SessionPhase::RefreshingToken,
            Self::LoggedIn { .. } => SessionPhase::LoggedIn,
        }
    }

    /// A token request is outstanding.
    pub(crate) fn is_exchanging(&self) -> bool {
        matches!(self, Self::ExchangingToken | Self::RefreshingToken)
    }
}

/// Secret-free view of [`SessionState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    LoggedOut,
    Authorizing,
    ExchangingToken,
    RefreshingToken,
    LoggedIn,
}

impl std::fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::LoggedOut => write!(f, "logged_out"),
            Self::Authorizing => write!(f, "authorizing"),
            Self::ExchangingToken => write!(f, "exchanging_token"),
            Self::RefreshingToken => write!(f, "refreshing_token"),
            Self::LoggedIn => write!(f, "logged_in"),
        }
    }
}

/// Notifications delivered to the UI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum SessionEvent {
    LoggedOut,
    Authorizing,
    LoggedIn(Profile),
    Error(ErrorKind),
}

/// Snapshot of the session for display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionStatus {
    pub phase: SessionPhase,
    /// Present only while logged in. Empty if the profile fetch failed.
    pub profile: Option<Profile>,
    /// Whether the current session can renew its access token.
    pub can_refresh: bool,
    /// Seconds until the access token expires, if known.
    pub expires_in_secs: Option<u64>,
}

/// Usage errors reported synchronously to the caller.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("{operation} is not valid while {phase}")]
    InvalidState {
        operation: &'static str,
        phase: SessionPhase,
    },

    #[error("{operation} requires a Tokio runtime")]
    NoRuntime { operation: &'static str },
}

impl SessionError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::InvalidState
    }
}
