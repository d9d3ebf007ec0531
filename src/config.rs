use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use crate::oauth::client::{
    DEFAULT_AUTH_URL, DEFAULT_LANGUAGE, DEFAULT_PROFILE_URL, DEFAULT_REDIRECT_URI,
    DEFAULT_TOKEN_URL,
};
use crate::oauth::storage::refresh_token_key;
use crate::oauth::{
    ClientCredentials, CredentialStore, FileCredentialStore, MemoryCredentialStore,
    OAuthEndpoints,
};

// ---------------------------------------------------------------------------
// Environment override tracking
// ---------------------------------------------------------------------------

/// Tracks which configuration settings are overridden by environment variables.
#[derive(Debug, Clone, Default)]
pub struct EnvOverrides {
    overrides: HashMap<String, String>,
}

impl EnvOverrides {
    /// Check whether a setting key (e.g. "oauth.client_id") is overridden by an env var.
    pub fn is_overridden(&self, key: &str) -> bool {
        self.overrides.contains_key(key)
    }

    /// Get the env var name that overrides the given setting key.
    pub fn env_var_for(&self, key: &str) -> Option<&str> {
        self.overrides.get(key).map(String::as_str)
    }

    pub fn all(&self) -> &HashMap<String, String> {
        &self.overrides
    }

    fn record(&mut self, key: &str, env_var: &str) {
        self.overrides.insert(key.to_string(), env_var.to_string());
    }
}

// ---------------------------------------------------------------------------
// Main configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub oauth: OAuthConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Env var overrides are not serialized to TOML.
    #[serde(skip)]
    pub env_overrides: EnvOverrides,
}

/// Provider registration and endpoints.
#[derive(Clone, Deserialize, Serialize)]
pub struct OAuthConfig {
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub client_secret: String,
    #[serde(default = "default_auth_url")]
    pub auth_url: String,
    #[serde(default = "default_token_url")]
    pub token_url: String,
    #[serde(default = "default_profile_url")]
    pub profile_url: String,
    #[serde(default = "default_redirect_uri")]
    pub redirect_uri: String,
    #[serde(default = "default_language")]
    pub language: String,
    /// Applies to token and profile requests. The authorization step has no timeout.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for OAuthConfig {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            client_secret: String::new(),
            auth_url: default_auth_url(),
            token_url: default_token_url(),
            profile_url: default_profile_url(),
            redirect_uri: default_redirect_uri(),
            language: default_language(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl std::fmt::Debug for OAuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OAuthConfig")
            .field("client_id", &self.client_id)
            .field("client_secret", &"[REDACTED]")
            .field("auth_url", &self.auth_url)
            .field("token_url", &self.token_url)
            .field("profile_url", &self.profile_url)
            .field("redirect_uri", &self.redirect_uri)
            .field("language", &self.language)
            .field("request_timeout_secs", &self.request_timeout_secs)
            .finish()
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackend,
    /// Directory for the file backend.
    #[serde(default = "default_storage_dir")]
    pub dir: PathBuf,
    /// Prefix of the persisted key: `@<namespace>:REFRESH_TOKEN`.
    #[serde(default = "default_namespace")]
    pub namespace: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::default(),
            dir: default_storage_dir(),
            namespace: default_namespace(),
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    #[default]
    File,
    Keyring,
    Memory,
}

impl std::fmt::Display for StorageBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::File => write!(f, "file"),
            Self::Keyring => write!(f, "keyring"),
            Self::Memory => write!(f, "memory"),
        }
    }
}

impl FromStr for StorageBackend {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "file" => Ok(Self::File),
            "keyring" => Ok(Self::Keyring),
            "memory" => Ok(Self::Memory),
            _ => Err(format!("Unknown storage backend: {s}")),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Default value functions
// ---------------------------------------------------------------------------

fn default_auth_url() -> String {
    DEFAULT_AUTH_URL.to_string()
}
fn default_token_url() -> String {
    DEFAULT_TOKEN_URL.to_string()
}
fn default_profile_url() -> String {
    DEFAULT_PROFILE_URL.to_string()
}
fn default_redirect_uri() -> String {
    DEFAULT_REDIRECT_URI.to_string()
}
fn default_language() -> String {
    DEFAULT_LANGUAGE.to_string()
}
const fn default_request_timeout_secs() -> u64 {
    30
}
fn default_storage_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("auction-login")
}
fn default_namespace() -> String {
    "AuctionLogin".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}

// ---------------------------------------------------------------------------
// Config loading, env overrides, validation
// ---------------------------------------------------------------------------

impl Config {
    /// Load configuration from a TOML file, then apply environment variable
    /// overrides. Any setting prefixed with `AUCTION_LOGIN_` takes precedence
    /// over the file value and is tracked in `env_overrides`.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Config = toml::from_str(&content)?;
            config
        } else {
            tracing::warn!("Config file not found at {}, using defaults", path.display());
            Self::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        let mut ov = EnvOverrides::default();

        macro_rules! env_str {
            ($key:expr, $env:expr, $field:expr) => {
                if let Ok(val) = std::env::var($env) {
                    $field = val;
                    ov.record($key, $env);
                }
            };
        }
        macro_rules! env_bool {
            ($key:expr, $env:expr, $field:expr) => {
                if let Ok(val) = std::env::var($env) {
                    $field = matches!(val.to_lowercase().as_str(), "1" | "true" | "yes" | "on");
                    ov.record($key, $env);
                }
            };
        }
        macro_rules! env_parse {
            ($key:expr, $env:expr, $field:expr) => {
                if let Ok(val) = std::env::var($env) {
                    if let Ok(parsed) = val.parse() {
                        $field = parsed;
                        ov.record($key, $env);
                    }
                }
            };
        }
        macro_rules! env_path {
            ($key:expr, $env:expr, $field:expr) => {
                if let Ok(val) = std::env::var($env) {
                    $field = PathBuf::from(val);
                    ov.record($key, $env);
                }
            };
        }

        // -- OAuth --
        env_str!("oauth.client_id", "AUCTION_LOGIN_CLIENT_ID", self.oauth.client_id);
        env_str!(
            "oauth.client_secret",
            "AUCTION_LOGIN_CLIENT_SECRET",
            self.oauth.client_secret
        );
        env_str!("oauth.auth_url", "AUCTION_LOGIN_AUTH_URL", self.oauth.auth_url);
        env_str!("oauth.token_url", "AUCTION_LOGIN_TOKEN_URL", self.oauth.token_url);
        env_str!(
            "oauth.profile_url",
            "AUCTION_LOGIN_PROFILE_URL",
            self.oauth.profile_url
        );
        env_str!(
            "oauth.redirect_uri",
            "AUCTION_LOGIN_REDIRECT_URI",
            self.oauth.redirect_uri
        );
        env_str!("oauth.language", "AUCTION_LOGIN_LANGUAGE", self.oauth.language);
        env_parse!(
            "oauth.request_timeout_secs",
            "AUCTION_LOGIN_REQUEST_TIMEOUT",
            self.oauth.request_timeout_secs
        );

        // -- Storage --
        env_parse!(
            "storage.backend",
            "AUCTION_LOGIN_STORAGE_BACKEND",
            self.storage.backend
        );
        env_path!("storage.dir", "AUCTION_LOGIN_STORAGE_DIR", self.storage.dir);
        env_str!(
            "storage.namespace",
            "AUCTION_LOGIN_STORAGE_NAMESPACE",
            self.storage.namespace
        );

        // -- Logging --
        env_str!("logging.level", "AUCTION_LOGIN_LOG_LEVEL", self.logging.level);
        env_bool!("logging.json", "AUCTION_LOGIN_LOG_JSON", self.logging.json);

        self.env_overrides = ov;
    }

    /// Reject settings no flow can start with.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.oauth.client_id.trim().is_empty() {
            anyhow::bail!(
                "oauth.client_id is empty (set it in the config file or AUCTION_LOGIN_CLIENT_ID)"
            );
        }
        if self.oauth.client_secret.trim().is_empty() {
            anyhow::bail!(
                "oauth.client_secret is empty (set it in the config file or AUCTION_LOGIN_CLIENT_SECRET)"
            );
        }
        if self.oauth.request_timeout_secs == 0 {
            anyhow::bail!("oauth.request_timeout_secs must be greater than zero");
        }
        if self.storage.namespace.trim().is_empty() {
            anyhow::bail!("storage.namespace is empty");
        }
        Ok(())
    }

    pub fn credentials(&self) -> ClientCredentials {
        ClientCredentials::new(&self.oauth.client_id, &self.oauth.client_secret)
    }

    pub fn endpoints(&self) -> OAuthEndpoints {
        OAuthEndpoints {
            auth_url: self.oauth.auth_url.clone(),
            token_url: self.oauth.token_url.clone(),
            profile_url: self.oauth.profile_url.clone(),
            redirect_uri: self.oauth.redirect_uri.clone(),
            language: self.oauth.language.clone(),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.oauth.request_timeout_secs)
    }

    /// Key under which the refresh token is persisted.
    pub fn store_key(&self) -> String {
        refresh_token_key(&self.storage.namespace)
    }

    /// Create the configured credential store.
    pub fn build_store(&self) -> anyhow::Result<Arc<dyn CredentialStore>> {
        let store: Arc<dyn CredentialStore> = match self.storage.backend {
            StorageBackend::File => Arc::new(FileCredentialStore::new(&self.storage.dir)),
            StorageBackend::Memory => Arc::new(MemoryCredentialStore::new()),
            #[cfg(feature = "system-keyring")]
            StorageBackend::Keyring => Arc::new(crate::oauth::KeyringCredentialStore::new()),
            #[cfg(not(feature = "system-keyring"))]
            StorageBackend::Keyring => {
                anyhow::bail!("keyring backend requires the `system-keyring` feature")
            }
        };
        Ok(store)
    }
}

// Helper for default storage directory
mod dirs {
    use std::path::PathBuf;

    pub fn data_local_dir() -> Option<PathBuf> {
        std::env::var_os("XDG_DATA_HOME")
            .map(PathBuf::from)
            .or_else(|| {
                std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".local").join("share"))
            })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
