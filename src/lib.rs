//! Yahoo OAuth2 login: authorization-code flow with a CSRF nonce,
//! refresh-token persistence and profile lookup.
//!
//! - [`oauth`] - protocol client, credential stores, redirect delivery
//! - [`session`] - the login state machine the UI drives
//! - [`config`] - TOML configuration with environment overrides

pub mod config;
pub mod oauth;
pub mod session;

pub use oauth::{ErrorKind, OAuthClient, OAuthError, Profile, TokenSet};
pub use session::{AuthSession, SessionEvent, SessionPhase, SessionStatus, UrlLauncher};
