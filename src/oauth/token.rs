//! Token and profile data.
//!
//! [`TokenSet`] is what the token endpoint hands back for either grant type.
//! Only its refresh token ever leaves memory (through the credential store);
//! the access token is re-derived from it on every cold start.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Safety margin for token expiry checks (60 seconds).
const EXPIRY_SAFETY_MARGIN_SECS: i64 = 60;

/// Proactive refresh buffer (5 minutes / 300 seconds).
const REFRESH_BUFFER_SECS: i64 = 300;

/// Credentials returned by the token endpoint.
#[derive(Clone, Serialize, Deserialize, PartialEq)]
pub struct TokenSet {
    /// Short-lived bearer token for API requests.
    pub access_token: String,

    /// Long-lived token used to mint new access tokens. Absent when the
    /// provider did not issue one.
    #[serde(default)]
    pub refresh_token: Option<String>,

    /// Token type, typically "bearer".
    #[serde(default = "default_token_type")]
    pub token_type: String,

    /// Lifetime of the access token in seconds, as reported by the provider.
    #[serde(default)]
    pub expires_in: Option<i64>,

    /// Yahoo user GUID; parameterizes the profile endpoint.
    #[serde(rename = "xoauth_yahoo_guid", default)]
    pub guid: Option<String>,

    /// Unix timestamp when the access token expires, computed on receipt.
    #[serde(skip)]
    pub expires_at: Option<i64>,
}

fn default_token_type() -> String {
    "bearer".to_string()
}

impl std::fmt::Debug for TokenSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenSet")
            .field("access_token", &super::mask(&self.access_token))
            .field(
                "refresh_token",
                &self.refresh_token.as_deref().map(super::mask),
            )
            .field("token_type", &self.token_type)
            .field("expires_in", &self.expires_in)
            .field("guid", &self.guid)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

impl TokenSet {
    /// Create a token set, stamping `expires_at` from `expires_in`.
    pub fn new(
        access_token: String,
        refresh_token: Option<String>,
        expires_in: Option<i64>,
        guid: Option<String>,
    ) -> Self {
        Self {
            access_token,
            refresh_token,
            token_type: default_token_type(),
            expires_in,
            guid,
            expires_at: None,
        }
        .stamped()
    }

    /// Compute `expires_at` relative to now.
    #[must_use]
    pub fn stamped(self) -> Self {
        let expires_at = self
            .expires_in
            .map(|ei| chrono::Utc::now().timestamp() + ei);
        Self { expires_at, ..self }
    }

    /// Check if the access token is expired or about to expire.
    ///
    /// Returns `false` if no expiry is known.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        match self.expires_at {
            Some(exp) => exp <= chrono::Utc::now().timestamp() + EXPIRY_SAFETY_MARGIN_SECS,
            None => false,
        }
    }

    /// Check if the token should be proactively refreshed (within 5 minutes of expiry).
    #[must_use]
    pub fn needs_refresh(&self) -> bool {
        match self.expires_at {
            Some(exp) => exp <= chrono::Utc::now().timestamp() + REFRESH_BUFFER_SECS,
            None => false,
        }
    }

    /// Get the duration until the access token expires.
    ///
    /// Returns `Duration::ZERO` if expired or unknown.
    pub fn time_until_expiry(&self) -> Duration {
        match self.expires_at {
            Some(exp) => {
                let remaining = exp - chrono::Utc::now().timestamp();
                if remaining > 0 {
                    Duration::from_secs(remaining as u64)
                } else {
                    Duration::ZERO
                }
            }
            None => Duration::ZERO,
        }
    }

    /// Carry over a refresh token the provider did not repeat.
    ///
    /// Refresh-grant responses may omit `refresh_token`; the previous one
    /// stays valid in that case.
    #[must_use]
    pub fn or_refresh_token(self, previous: Option<&str>) -> Self {
        match (&self.refresh_token, previous) {
            (None, Some(prev)) => Self {
                refresh_token: Some(prev.to_string()),
                ..self
            },
            _ => self,
        }
    }
}

/// Display data for the signed-in user.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub nickname: String,
    pub image_url: String,
}

impl Profile {
    /// True when no profile data has been loaded.
    pub fn is_empty(&self) -> bool {
        self.nickname.is_empty() && self.image_url.is_empty()
    }
}

/// `{"profile": {"nickname": ..., "image": {"imageUrl": ...}}}`
#[derive(Debug, Deserialize)]
pub(crate) struct ProfileEnvelope {
    profile: ProfileBody,
}

#[derive(Debug, Deserialize)]
struct ProfileBody {
    nickname: String,
    image: ProfileImage,
}

#[derive(Debug, Deserialize)]
struct ProfileImage {
    #[serde(rename = "imageUrl")]
    image_url: String,
}

impl From<ProfileEnvelope> for Profile {
    fn from(envelope: ProfileEnvelope) -> Self {
        Self {
            nickname: envelope.profile.nickname,
            image_url: envelope.profile.image.image_url,
        }
    }
}
