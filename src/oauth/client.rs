//! Yahoo OAuth 2.0 authorization-code client.
//!
//! # Key Characteristics
//! - Token request format: JSON body (not form-encoded)
//! - Client authentication: HTTP Basic with `base64(client_id:client_secret)`,
//!   and the same pair repeated in the body
//! - Token-request `redirect_uri`: always `oob`
//! - Auth URL parameters: `language=zh-tw`, no scope, no PKCE
//!
//! # Endpoints
//! - Authorization: `https://api.login.yahoo.com/oauth2/request_auth`
//! - Token: `https://api.login.yahoo.com/oauth2/get_token`
//! - Profile: `https://social.yahooapis.com/v1/user/{guid}/profile?format=json`
//!
//! Every call here is a single request. Retry policy belongs to the caller.

use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use reqwest::StatusCode;
use reqwest::header::{ACCEPT, AUTHORIZATION};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use super::storage::CredentialStore;
use super::token::{Profile, ProfileEnvelope, TokenSet};
use super::{OAuthError, mask};

/// Default authorization URL.
pub const DEFAULT_AUTH_URL: &str = "https://api.login.yahoo.com/oauth2/request_auth";

/// Default token URL.
pub const DEFAULT_TOKEN_URL: &str = "https://api.login.yahoo.com/oauth2/get_token";

/// Default profile API base; `/{guid}/profile?format=json` is appended.
pub const DEFAULT_PROFILE_URL: &str = "https://social.yahooapis.com/v1/user";

/// Default redirect URI registered with the provider.
pub const DEFAULT_REDIRECT_URI: &str = "https://rn-webrtc-hall.herokuapp.com/api/oauth";

/// Default display language for the consent screen.
pub const DEFAULT_LANGUAGE: &str = "zh-tw";

/// `redirect_uri` value sent with token requests.
const TOKEN_REDIRECT_URI: &str = "oob";

/// Longest response body excerpt included in error messages.
const MAX_BODY_EXCERPT: usize = 200;

// =============================================================================
// Configuration types
// =============================================================================

/// Static client registration. Loaded once at startup and never mutated.
#[derive(Clone, PartialEq, Eq)]
pub struct ClientCredentials {
    client_id: String,
    client_secret: String,
}

impl ClientCredentials {
    pub fn new(client_id: impl Into<String>, client_secret: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret: client_secret.into(),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn client_secret(&self) -> &str {
        &self.client_secret
    }

    /// `Basic base64(client_id:client_secret)`
    pub fn basic_authorization(&self) -> String {
        let pair = format!("{}:{}", self.client_id, self.client_secret);
        format!("Basic {}", STANDARD.encode(pair))
    }
}

impl std::fmt::Debug for ClientCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientCredentials")
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .finish()
    }
}

/// Provider endpoints and fixed authorization parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OAuthEndpoints {
    pub auth_url: String,
    pub token_url: String,
    pub profile_url: String,
    pub redirect_uri: String,
    pub language: String,
}

impl Default for OAuthEndpoints {
    fn default() -> Self {
        Self {
            auth_url: DEFAULT_AUTH_URL.to_string(),
            token_url: DEFAULT_TOKEN_URL.to_string(),
            profile_url: DEFAULT_PROFILE_URL.to_string(),
            redirect_uri: DEFAULT_REDIRECT_URI.to_string(),
            language: DEFAULT_LANGUAGE.to_string(),
        }
    }
}

/// Grant types accepted by the token endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrantType {
    AuthorizationCode,
    RefreshToken,
}

impl GrantType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AuthorizationCode => "authorization_code",
            Self::RefreshToken => "refresh_token",
        }
    }
}

impl std::fmt::Display for GrantType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Wire types
// =============================================================================

/// JSON body for the token endpoint. Exactly one of `code` /
/// `refresh_token` is set, matching `grant_type`.
#[derive(Debug, Serialize)]
struct TokenRequest<'a> {
    client_id: &'a str,
    client_secret: &'a str,
    redirect_uri: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    code: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    refresh_token: Option<&'a str>,
    grant_type: &'static str,
}

/// Error fields of a token endpoint response.
///
/// Any non-null `error` marks a rejection, whatever its JSON type.
#[derive(Debug, Deserialize)]
struct TokenErrorResponse {
    #[serde(default)]
    error: serde_json::Value,
    #[serde(default)]
    error_description: Option<serde_json::Value>,
}

impl TokenErrorResponse {
    /// `(error, description)` if the body carries an `error`.
    fn into_rejection(self) -> Option<(String, Option<String>)> {
        if self.error.is_null() {
            return None;
        }
        let description = self
            .error_description
            .as_ref()
            .and_then(json_text)
            .or_else(|| self.error.get("description").and_then(json_text));
        let error = match &self.error {
            serde_json::Value::String(s) => s.clone(),
            serde_json::Value::Object(map) => map
                .get("error")
                .or_else(|| map.get("code"))
                .and_then(json_text)
                .unwrap_or_else(|| self.error.to_string()),
            other => other.to_string(),
        };
        Some((error, description))
    }
}

/// Best-effort text of a scalar JSON value.
fn json_text(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        serde_json::Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

// =============================================================================
// OAuthClient
// =============================================================================

/// Client for the provider's authorization, token and profile endpoints.
#[derive(Debug, Clone)]
pub struct OAuthClient {
    credentials: ClientCredentials,
    endpoints: OAuthEndpoints,
    http_client: reqwest::Client,
}

impl OAuthClient {
    /// Create a client whose token and profile requests time out after
    /// `request_timeout`.
    pub fn new(
        credentials: ClientCredentials,
        endpoints: OAuthEndpoints,
        request_timeout: Duration,
    ) -> Result<Self, OAuthError> {
        let http_client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .timeout(request_timeout)
            .build()?;

        Ok(Self {
            credentials,
            endpoints,
            http_client,
        })
    }

    pub fn credentials(&self) -> &ClientCredentials {
        &self.credentials
    }

    pub fn endpoints(&self) -> &OAuthEndpoints {
        &self.endpoints
    }

    /// Build the authorization URL for one login attempt.
    ///
    /// Pure: the same nonce always yields the same URL. Every parameter
    /// value is percent-encoded.
    pub fn build_authorization_url(&self, nonce: &str) -> String {
        format!(
            "{}?client_id={}&response_type=code&language={}&redirect_uri={}&state={}",
            self.endpoints.auth_url,
            urlencoding::encode(&self.credentials.client_id),
            urlencoding::encode(&self.endpoints.language),
            urlencoding::encode(&self.endpoints.redirect_uri),
            urlencoding::encode(nonce),
        )
    }

    fn token_request<'a>(&'a self, code_or_token: &'a str, grant: GrantType) -> TokenRequest<'a> {
        let (code, refresh_token) = match grant {
            GrantType::AuthorizationCode => (Some(code_or_token), None),
            GrantType::RefreshToken => (None, Some(code_or_token)),
        };
        TokenRequest {
            client_id: &self.credentials.client_id,
            client_secret: &self.credentials.client_secret,
            redirect_uri: TOKEN_REDIRECT_URI,
            code,
            refresh_token,
            grant_type: grant.as_str(),
        }
    }

    /// Exchange an authorization code or a refresh token for a [`TokenSet`].
    ///
    /// Sends exactly one POST. A response body carrying `error` becomes
    /// [`OAuthError::Provider`]; transport failures and unreadable
    /// responses become [`OAuthError::Http`] / [`OAuthError::InvalidResponse`].
    #[instrument(skip(self, code_or_token), fields(grant_type = %grant))]
    pub async fn exchange_token(
        &self,
        code_or_token: &str,
        grant: GrantType,
    ) -> Result<TokenSet, OAuthError> {
        debug!(credential = %mask(code_or_token), "Requesting tokens");

        let response = self
            .http_client
            .post(&self.endpoints.token_url)
            .header(ACCEPT, "application/json")
            .header(AUTHORIZATION, self.credentials.basic_authorization())
            .json(&self.token_request(code_or_token, grant))
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;

        let tokens = parse_token_response(status, &body)?;
        debug!(
            has_refresh_token = tokens.refresh_token.is_some(),
            expires_in = ?tokens.expires_in,
            "Token request succeeded"
        );
        Ok(tokens)
    }

    /// Fetch the user's profile with the access token.
    ///
    /// Any transport error, non-2xx status or unexpected body shape is an
    /// [`OAuthError::Profile`].
    #[instrument(skip(self, tokens))]
    pub async fn fetch_profile(&self, tokens: &TokenSet) -> Result<Profile, OAuthError> {
        let guid = tokens
            .guid
            .as_deref()
            .filter(|g| !g.is_empty())
            .ok_or_else(|| OAuthError::Profile("token response carried no user GUID".into()))?;

        let url = format!(
            "{}/{}/profile?format=json",
            self.endpoints.profile_url.trim_end_matches('/'),
            urlencoding::encode(guid)
        );
        debug!(%guid, "Fetching profile");

        let response = self
            .http_client
            .get(&url)
            .header(ACCEPT, "application/json")
            .bearer_auth(&tokens.access_token)
            .send()
            .await
            .map_err(|e| OAuthError::Profile(format!("request failed: {e}")))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| OAuthError::Profile(format!("failed to read body: {e}")))?;

        if !status.is_success() {
            warn!(status = status.as_u16(), "Profile request rejected");
            return Err(OAuthError::Profile(format!(
                "HTTP {}: {}",
                status.as_u16(),
                excerpt(&body)
            )));
        }

        let envelope: ProfileEnvelope = serde_json::from_str(&body)
            .map_err(|e| OAuthError::Profile(format!("unexpected response shape: {e}")))?;
        Ok(envelope.into())
    }

    /// Renew tokens from a refresh token persisted under `key`.
    ///
    /// Returns `Ok(None)` when nothing is stored; the caller must then start
    /// an interactive login. The store read completes before any request is
    /// made.
    pub async fn resume(
        &self,
        store: &dyn CredentialStore,
        key: &str,
    ) -> Result<Option<TokenSet>, OAuthError> {
        let Some(refresh_token) = store.get(key)? else {
            debug!(backend = store.name(), "No stored refresh token");
            return Ok(None);
        };

        info!(backend = store.name(), "Resuming session from stored refresh token");
        let tokens = self
            .exchange_token(&refresh_token, GrantType::RefreshToken)
            .await?;
        Ok(Some(tokens.or_refresh_token(Some(&refresh_token))))
    }
}

/// Interpret a token endpoint response.
fn parse_token_response(status: StatusCode, body: &str) -> Result<TokenSet, OAuthError> {
    let rejection = serde_json::from_str::<TokenErrorResponse>(body)
        .ok()
        .and_then(TokenErrorResponse::into_rejection);
    if let Some((error, description)) = rejection {
        warn!(
            status = status.as_u16(),
            %error,
            ?description,
            "Token request rejected by provider"
        );
        return Err(OAuthError::Provider { error, description });
    }

    if !status.is_success() {
        return Err(OAuthError::InvalidResponse(format!(
            "HTTP {}: {}",
            status.as_u16(),
            excerpt(body)
        )));
    }

    let tokens: TokenSet = serde_json::from_str(body)
        .map_err(|e| OAuthError::InvalidResponse(format!("Failed to parse token response: {e}")))?;
    Ok(tokens.stamped())
}

fn excerpt(body: &str) -> String {
    body.chars().take(MAX_BODY_EXCERPT).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oauth::ErrorKind;
    use proptest::prelude::*;

    fn test_client() -> OAuthClient {
        OAuthClient::new(
            ClientCredentials::new("my-client", "my-secret"),
            OAuthEndpoints::default(),
            Duration::from_secs(5),
        )
        .unwrap()
    }

    #[test]
    fn test_build_authorization_url() {
        let url = test_client().build_authorization_url("abc123");
        assert_eq!(
            url,
            "https://api.login.yahoo.com/oauth2/request_auth?client_id=my-client&response_type=code\
             &language=zh-tw&redirect_uri=https%3A%2F%2Frn-webrtc-hall.herokuapp.com%2Fapi%2Foauth\
             &state=abc123"
        );
    }

    #[test]
    fn test_build_authorization_url_is_deterministic() {
        let client = test_client();
        assert_eq!(
            client.build_authorization_url("n"),
            client.build_authorization_url("n")
        );
    }

    #[test]
    fn test_build_authorization_url_encodes_reserved_characters() {
        let url = test_client().build_authorization_url("a&b=c?d/e f");
        assert!(url.ends_with("&state=a%26b%3Dc%3Fd%2Fe%20f"));
    }

    #[test]
    fn test_basic_authorization() {
        let credentials = ClientCredentials::new("id", "secret");
        // base64("id:secret")
        assert_eq!(credentials.basic_authorization(), "Basic aWQ6c2VjcmV0");
    }

    #[test]
    fn test_credentials_debug_redacts_secret() {
        let debug = format!("{:?}", ClientCredentials::new("id", "super-secret"));
        assert!(debug.contains("id"));
        assert!(!debug.contains("super-secret"));
    }

    #[test]
    fn test_authorization_code_body() {
        let client = test_client();
        let body =
            serde_json::to_value(client.token_request("XYZ", GrantType::AuthorizationCode)).unwrap();
        assert_eq!(
            body,
            serde_json::json!({
                "client_id": "my-client",
                "client_secret": "my-secret",
                "redirect_uri": "oob",
                "code": "XYZ",
                "grant_type": "authorization_code",
            })
        );
    }

    #[test]
    fn test_refresh_token_body() {
        let client = test_client();
        let body = serde_json::to_value(client.token_request("R", GrantType::RefreshToken)).unwrap();
        assert_eq!(
            body,
            serde_json::json!({
                "client_id": "my-client",
                "client_secret": "my-secret",
                "redirect_uri": "oob",
                "refresh_token": "R",
                "grant_type": "refresh_token",
            })
        );
    }

    #[test]
    fn test_parse_success() {
        let tokens = parse_token_response(
            StatusCode::OK,
            r#"{"access_token":"A","refresh_token":"B","expires_in":3600,"xoauth_yahoo_guid":"G"}"#,
        )
        .unwrap();
        assert_eq!(tokens.access_token, "A");
        assert_eq!(tokens.refresh_token.as_deref(), Some("B"));
        assert_eq!(tokens.guid.as_deref(), Some("G"));
        assert!(tokens.expires_at.is_some());
    }

    #[test]
    fn test_parse_error_body_on_success_status() {
        let err = parse_token_response(
            StatusCode::OK,
            r#"{"error":"invalid_grant","error_description":"revoked"}"#,
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TokenExchangeFailed);
    }

    #[test]
    fn test_parse_error_body_on_client_error() {
        let err = parse_token_response(StatusCode::BAD_REQUEST, r#"{"error":"invalid_client"}"#)
            .unwrap_err();
        assert!(matches!(err, OAuthError::Provider { ref error, .. } if error == "invalid_client"));
    }

    #[test]
    fn test_parse_structured_error_is_provider_error() {
        let err = parse_token_response(
            StatusCode::UNAUTHORIZED,
            r#"{"error":{"description":"revoked","lang":"en-US"}}"#,
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TokenExchangeFailed);
        assert!(matches!(
            err,
            OAuthError::Provider { description: Some(ref d), .. } if d == "revoked"
        ));

        let err = parse_token_response(StatusCode::OK, r#"{"error":401}"#).unwrap_err();
        assert!(matches!(err, OAuthError::Provider { ref error, .. } if error == "401"));
    }

    #[test]
    fn test_parse_null_error_is_not_a_rejection() {
        let tokens = parse_token_response(
            StatusCode::OK,
            r#"{"access_token":"A","error":null}"#,
        )
        .unwrap();
        assert_eq!(tokens.access_token, "A");
    }

    #[test]
    fn test_parse_server_error_without_body_is_transport_class() {
        let err = parse_token_response(StatusCode::SERVICE_UNAVAILABLE, "<html>down</html>")
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NetworkFailure);
    }

    #[test]
    fn test_parse_garbage_success_is_transport_class() {
        let err = parse_token_response(StatusCode::OK, "not json").unwrap_err();
        assert!(matches!(err, OAuthError::InvalidResponse(_)));
    }

    #[tokio::test]
    async fn test_fetch_profile_without_guid() {
        let tokens = TokenSet::new("A".into(), None, None, None);
        let err = test_client().fetch_profile(&tokens).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ProfileFetchFailed);
    }

    #[test]
    fn test_grant_type_display() {
        assert_eq!(GrantType::AuthorizationCode.to_string(), "authorization_code");
        assert_eq!(GrantType::RefreshToken.to_string(), "refresh_token");
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(200))]

        /// The nonce appears exactly once, encoded, and the URL parses with
        /// the nonce round-tripping through the `state` parameter.
        #[test]
        fn prop_authorization_url_carries_state_once(nonce in "\\PC{1,40}") {
            let url = test_client().build_authorization_url(&nonce);
            let encoded = format!("state={}", urlencoding::encode(&nonce));

            prop_assert_eq!(url.matches("state=").count(), 1);
            prop_assert!(url.ends_with(&encoded));

            let parsed = url::Url::parse(&url).unwrap();
            let states: Vec<String> = parsed
                .query_pairs()
                .filter(|(k, _)| k == "state")
                .map(|(_, v)| v.into_owned())
                .collect();
            prop_assert_eq!(states, vec![nonce.clone()]);

            let query = parsed.query().unwrap_or_default();
            for reserved in [' ', '#', '[', ']', '@', '!', '$', '\'', '(', ')', '*', '+', ',', ';'] {
                prop_assert!(!query.contains(reserved));
            }
        }
    }
}
