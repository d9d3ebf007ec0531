//! OAuth module for the Yahoo login session.
//!
//! Provides the protocol side of the authorization-code flow:
//! - [`OAuthClient`] - builds the authorization URL, exchanges codes and
//!   refresh tokens, fetches the user profile
//! - [`CredentialStore`] - pluggable refresh-token persistence (file, keyring, memory)
//! - [`TokenSet`] / [`Profile`] - token response and profile data
//! - [`RedirectListener`] - delivery of the provider's redirect callback
//!
//! # Example
//!
//! ```rust,ignore
//! use auction_login::oauth::{ClientCredentials, OAuthClient, OAuthEndpoints};
//!
//! let credentials = ClientCredentials::new("client-id", "client-secret");
//! let client = OAuthClient::new(credentials, OAuthEndpoints::default(), timeout)?;
//!
//! let url = client.build_authorization_url("nonce");
//! // ... user consents, redirect delivers ?code=...&state=nonce ...
//! let tokens = client.exchange_token(code, GrantType::AuthorizationCode).await?;
//! let profile = client.fetch_profile(&tokens).await?;
//! ```

pub mod client;
pub mod redirect;
pub mod storage;
pub mod token;

// Re-exports
pub use client::{ClientCredentials, GrantType, OAuthClient, OAuthEndpoints};
pub use redirect::{
    CallbackParams, LinkRedirectListener, RedirectCallback, RedirectListener,
    RedirectSubscription,
};
pub use storage::{CredentialStore, FileCredentialStore, MemoryCredentialStore, StoreError};
pub use token::{Profile, TokenSet};

#[cfg(feature = "system-keyring")]
pub use storage::KeyringCredentialStore;

use serde::Serialize;

// =============================================================================
// ErrorKind
// =============================================================================

/// Failure categories reported to the UI.
///
/// Every [`OAuthError`] collapses into one of these before it reaches the
/// session layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Redirect `state` did not match the live nonce.
    CsrfMismatch,
    /// The provider answered with an explicit error body.
    TokenExchangeFailed,
    /// Transport-level failure; stored credentials may still be valid.
    NetworkFailure,
    /// Profile lookup failed; the session stays authenticated.
    ProfileFetchFailed,
    /// The operation is not valid in the current session state.
    InvalidState,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CsrfMismatch => write!(f, "csrf_mismatch"),
            Self::TokenExchangeFailed => write!(f, "token_exchange_failed"),
            Self::NetworkFailure => write!(f, "network_failure"),
            Self::ProfileFetchFailed => write!(f, "profile_fetch_failed"),
            Self::InvalidState => write!(f, "invalid_state"),
        }
    }
}

// =============================================================================
// OAuthError
// =============================================================================

/// Errors that can occur during OAuth operations.
#[derive(Debug, thiserror::Error)]
pub enum OAuthError {
    /// The token endpoint returned an `error` body (invalid or revoked credentials).
    #[error("Provider rejected token request: {error}{}", describe(.description))]
    Provider {
        error: String,
        description: Option<String>,
    },

    /// HTTP client error (connect, TLS, timeout).
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The token endpoint answered with something that is neither tokens nor an error body.
    #[error("Unexpected token response: {0}")]
    InvalidResponse(String),

    /// Profile lookup failed or returned an unexpected shape.
    #[error("Profile fetch failed: {0}")]
    Profile(String),

    /// Credential store error.
    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),
}

impl OAuthError {
    /// Translate this error into the taxonomy reported to the UI.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Provider { .. } => ErrorKind::TokenExchangeFailed,
            Self::Http(_) | Self::InvalidResponse(_) | Self::Storage(_) => {
                ErrorKind::NetworkFailure
            }
            Self::Profile(_) => ErrorKind::ProfileFetchFailed,
        }
    }
}

fn describe(description: &Option<String>) -> String {
    description
        .as_deref()
        .map(|d| format!(" ({d})"))
        .unwrap_or_default()
}

/// Shorten a secret for log output.
pub(crate) fn mask(secret: &str) -> String {
    let prefix: String = secret.chars().take(4).collect();
    if secret.chars().count() <= 4 {
        "****".to_string()
    } else {
        format!("{prefix}****")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_error_maps_to_exchange_failed() {
        let err = OAuthError::Provider {
            error: "invalid_grant".into(),
            description: Some("token revoked".into()),
        };
        assert_eq!(err.kind(), ErrorKind::TokenExchangeFailed);
        assert_eq!(
            err.to_string(),
            "Provider rejected token request: invalid_grant (token revoked)"
        );
    }

    #[test]
    fn test_provider_error_without_description() {
        let err = OAuthError::Provider {
            error: "invalid_request".into(),
            description: None,
        };
        assert_eq!(err.to_string(), "Provider rejected token request: invalid_request");
    }

    #[test]
    fn test_transport_class_errors() {
        assert_eq!(
            OAuthError::InvalidResponse("HTTP 503".into()).kind(),
            ErrorKind::NetworkFailure
        );
        assert_eq!(
            OAuthError::Storage(StoreError::Io("disk full".into())).kind(),
            ErrorKind::NetworkFailure
        );
        assert_eq!(
            OAuthError::Profile("HTTP 401".into()).kind(),
            ErrorKind::ProfileFetchFailed
        );
    }

    #[test]
    fn test_error_kind_display() {
        assert_eq!(ErrorKind::CsrfMismatch.to_string(), "csrf_mismatch");
        assert_eq!(ErrorKind::InvalidState.to_string(), "invalid_state");
    }

    #[test]
    fn test_mask() {
        assert_eq!(mask("abcdefgh"), "abcd****");
        assert_eq!(mask("abc"), "****");
        assert_eq!(mask(""), "****");
    }
}
