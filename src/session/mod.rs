//! Login session state machine.
//!
//! [`AuthSession`] owns the live CSRF nonce, the current [`TokenSet`] and the
//! user [`Profile`]. It drives [`OAuthClient`] and reports every transition
//! as a [`SessionEvent`] on a broadcast channel.
//!
//! ```text
//! LoggedOut --start_login--> Authorizing --valid redirect--> ExchangingToken --ok--> LoggedIn
//! LoggedOut --resume (stored token)--> RefreshingToken --ok--> LoggedIn
//! LoggedIn --refresh--> RefreshingToken --ok--> LoggedIn
//! Authorizing --state mismatch--> LoggedOut
//! ExchangingToken|RefreshingToken --provider error--> LoggedOut (store cleared)
//! ExchangingToken|RefreshingToken --network error--> LoggedOut (store untouched)
//! any --logout--> LoggedOut (store cleared)
//! ```
//!
//! Every transition into or out of an in-flight step bumps an attempt
//! counter. Redirects and token responses carry the counter they were issued
//! under and are dropped if the session has moved on, so a `logout()` during
//! an exchange wins over the exchange's late result.

mod state;

pub use state::{CsrfNonce, SessionError, SessionEvent, SessionPhase, SessionStatus};

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::oauth::{
    CallbackParams, CredentialStore, ErrorKind, GrantType, OAuthClient, OAuthError, Profile,
    RedirectListener, RedirectSubscription, TokenSet,
};
use state::SessionState;

/// Capacity of the notification channel.
const EVENT_CHANNEL_CAPACITY: usize = 32;

/// Opens the authorization URL in a browser or equivalent surface.
pub trait UrlLauncher: Send + Sync {
    fn open(&self, url: &str) -> std::io::Result<()>;
}

struct Inner {
    state: SessionState,
    attempt: u64,
    subscription: Option<RedirectSubscription>,
}

impl Inner {
    /// Abandon whatever is in flight and return to `LoggedOut`.
    fn reset(&mut self) {
        self.attempt += 1;
        self.state = SessionState::LoggedOut;
        if let Some(subscription) = self.subscription.take() {
            subscription.unsubscribe();
        }
    }
}

/// Single-account login session.
pub struct AuthSession {
    client: OAuthClient,
    store: Arc<dyn CredentialStore>,
    store_key: String,
    listener: Arc<dyn RedirectListener>,
    launcher: Arc<dyn UrlLauncher>,
    events: broadcast::Sender<SessionEvent>,
    inner: Mutex<Inner>,
}

impl AuthSession {
    /// Create a logged-out session. The refresh token is persisted in
    /// `store` under `store_key`.
    pub fn new(
        client: OAuthClient,
        store: Arc<dyn CredentialStore>,
        store_key: impl Into<String>,
        listener: Arc<dyn RedirectListener>,
        launcher: Arc<dyn UrlLauncher>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Arc::new(Self {
            client,
            store,
            store_key: store_key.into(),
            listener,
            launcher,
            events,
            inner: Mutex::new(Inner {
                state: SessionState::LoggedOut,
                attempt: 0,
                subscription: None,
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Callers that change state emit while still holding the state lock,
    /// so notifications arrive in transition order.
    fn emit(&self, event: SessionEvent) {
        debug!(?event, "Session event");
        // No receivers is fine.
        let _ = self.events.send(event);
    }

    fn fail(&self, kind: ErrorKind) {
        self.emit(SessionEvent::Error(kind));
        self.emit(SessionEvent::LoggedOut);
    }

    fn invalid_state(&self, operation: &'static str, phase: SessionPhase) -> SessionError {
        warn!(operation, %phase, "Operation not valid in current state");
        self.emit(SessionEvent::Error(ErrorKind::InvalidState));
        SessionError::InvalidState { operation, phase }
    }

    /// Receive future session notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn phase(&self) -> SessionPhase {
        self.lock().state.phase()
    }

    /// Snapshot for display.
    pub fn status(&self) -> SessionStatus {
        let inner = self.lock();
        match &inner.state {
            SessionState::LoggedIn { tokens, profile } => SessionStatus {
                phase: SessionPhase::LoggedIn,
                profile: Some(profile.clone()),
                can_refresh: tokens.refresh_token.is_some(),
                expires_in_secs: tokens
                    .expires_at
                    .map(|_| tokens.time_until_expiry().as_secs()),
            },
            other => SessionStatus {
                phase: other.phase(),
                profile: None,
                can_refresh: false,
                expires_in_secs: None,
            },
        }
    }

    // =========================================================================
    // Interactive login
    // =========================================================================

    /// Begin an authorization attempt.
    ///
    /// Generates a nonce, subscribes to the redirect listener and opens the
    /// authorization URL. Only valid while logged out. Must be called from
    /// within a Tokio runtime; redirects are processed on it.
    pub fn start_login(self: &Arc<Self>) -> Result<(), SessionError> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| SessionError::NoRuntime {
            operation: "start_login",
        })?;

        let url = {
            let mut inner = self.lock();
            if !matches!(inner.state, SessionState::LoggedOut) {
                let phase = inner.state.phase();
                drop(inner);
                return Err(self.invalid_state("start_login", phase));
            }

            let nonce = CsrfNonce::generate();
            inner.attempt += 1;
            let attempt = inner.attempt;

            let session = Arc::downgrade(self);
            let expected = nonce.clone();
            let subscription = self.listener.subscribe(Box::new(move |url| {
                let session: Weak<Self> = session.clone();
                let expected = expected.clone();
                runtime.spawn(async move {
                    if let Some(session) = session.upgrade() {
                        session.complete_authorization(attempt, &expected, &url).await;
                    }
                });
            }));

            let url = self.client.build_authorization_url(nonce.as_str());
            inner.subscription = Some(subscription);
            inner.state = SessionState::Authorizing { nonce };
            info!("Authorization started");
            self.emit(SessionEvent::Authorizing);
            url
        };

        if let Err(e) = self.launcher.open(&url) {
            warn!(error = %e, "Failed to open authorization URL");
        }
        Ok(())
    }

    /// Handle a redirect URL for the live authorization attempt.
    ///
    /// Redirects arriving through the listener take this path
    /// automatically; this entry point serves platforms that hand the URL
    /// over directly.
    pub async fn on_redirect(&self, url: &str) -> Result<(), SessionError> {
        let (attempt, nonce) = {
            let inner = self.lock();
            match &inner.state {
                SessionState::Authorizing { nonce } => (inner.attempt, nonce.clone()),
                other => {
                    let phase = other.phase();
                    drop(inner);
                    return Err(self.invalid_state("on_redirect", phase));
                }
            }
        };
        self.complete_authorization(attempt, &nonce, url).await;
        Ok(())
    }

    async fn complete_authorization(&self, attempt: u64, expected: &CsrfNonce, url: &str) {
        let params = CallbackParams::from_redirect_url(url);

        let code = {
            let mut inner = self.lock();
            if inner.attempt != attempt || !matches!(inner.state, SessionState::Authorizing { .. })
            {
                debug!("Ignoring redirect for a finished authorization attempt");
                return;
            }

            let state_matches = params
                .state
                .as_deref()
                .is_some_and(|state| expected.matches(state));
            if !state_matches {
                inner.reset();
                warn!("Redirect state does not match the live nonce, attempt rejected");
                self.fail(ErrorKind::CsrfMismatch);
                return;
            }

            let code = match (params.code, params.error) {
                (Some(code), None) if !code.is_empty() => code,
                (_, error) => {
                    inner.reset();
                    warn!(
                        error = error.as_deref().unwrap_or("missing_code"),
                        description = ?params.error_description,
                        "Authorization was not granted"
                    );
                    self.fail(ErrorKind::TokenExchangeFailed);
                    return;
                }
            };

            if let Some(subscription) = inner.subscription.take() {
                subscription.unsubscribe();
            }
            inner.state = SessionState::ExchangingToken;
            code
        };

        debug!("Redirect accepted, exchanging authorization code");
        let result = self
            .client
            .exchange_token(&code, GrantType::AuthorizationCode)
            .await;
        self.finish_exchange(attempt, result, None, None).await;
    }

    // =========================================================================
    // Token renewal
    // =========================================================================

    /// Restore a session from the persisted refresh token.
    ///
    /// Only valid while logged out. The store is read before any request is
    /// made; with nothing stored the session stays logged out and the caller
    /// should [`start_login`](Self::start_login). Returns the resulting phase.
    pub async fn resume(&self) -> Result<SessionPhase, SessionError> {
        let (attempt, refresh_token) = {
            let mut inner = self.lock();
            if !matches!(inner.state, SessionState::LoggedOut) {
                let phase = inner.state.phase();
                drop(inner);
                return Err(self.invalid_state("resume", phase));
            }

            let stored = match self.store.get(&self.store_key) {
                Ok(stored) => stored,
                Err(e) => {
                    warn!(error = %e, backend = self.store.name(), "Failed to read stored refresh token");
                    None
                }
            };
            let Some(refresh_token) = stored else {
                debug!("No stored refresh token, staying logged out");
                return Ok(SessionPhase::LoggedOut);
            };

            inner.attempt += 1;
            inner.state = SessionState::RefreshingToken;
            (inner.attempt, refresh_token)
        };

        info!("Resuming session from stored refresh token");
        let result = self
            .client
            .exchange_token(&refresh_token, GrantType::RefreshToken)
            .await;
        self.finish_exchange(attempt, result, Some(refresh_token), None)
            .await;
        Ok(self.phase())
    }

    /// Renew the access token of a logged-in session.
    pub async fn refresh(&self) -> Result<SessionPhase, SessionError> {
        let (attempt, refresh_token, profile) = {
            let mut inner = self.lock();
            let (refresh_token, profile) = match &inner.state {
                SessionState::LoggedIn { tokens, profile } => {
                    match tokens.refresh_token.clone() {
                        Some(rt) => (rt, profile.clone()),
                        None => {
                            drop(inner);
                            return Err(self.invalid_state("refresh", SessionPhase::LoggedIn));
                        }
                    }
                }
                other => {
                    let phase = other.phase();
                    drop(inner);
                    return Err(self.invalid_state("refresh", phase));
                }
            };
            inner.attempt += 1;
            inner.state = SessionState::RefreshingToken;
            (inner.attempt, refresh_token, profile)
        };

        debug!("Refreshing access token");
        let result = self
            .client
            .exchange_token(&refresh_token, GrantType::RefreshToken)
            .await;
        // An empty profile is fetched again; a fetch still in flight from
        // the previous attempt is discarded when it lands.
        let keep_profile = (!profile.is_empty()).then_some(profile);
        self.finish_exchange(attempt, result, Some(refresh_token), keep_profile)
            .await;
        Ok(self.phase())
    }

    /// Get an access token, refreshing first when it is close to expiry.
    pub async fn valid_access_token(&self) -> Result<String, SessionError> {
        {
            let inner = self.lock();
            match &inner.state {
                SessionState::LoggedIn { tokens, .. }
                    if !tokens.needs_refresh() || tokens.refresh_token.is_none() =>
                {
                    return Ok(tokens.access_token.clone());
                }
                SessionState::LoggedIn { .. } => {}
                other => {
                    let phase = other.phase();
                    drop(inner);
                    return Err(self.invalid_state("valid_access_token", phase));
                }
            }
        }

        self.refresh().await?;

        let inner = self.lock();
        match &inner.state {
            SessionState::LoggedIn { tokens, .. } => Ok(tokens.access_token.clone()),
            other => Err(SessionError::InvalidState {
                operation: "valid_access_token",
                phase: other.phase(),
            }),
        }
    }

    /// Apply the outcome of a token request issued under `attempt`.
    ///
    /// `previous_refresh` is the token a refresh grant was made with;
    /// `keep_profile` skips the profile fetch when one is already loaded.
    async fn finish_exchange(
        &self,
        attempt: u64,
        result: Result<TokenSet, OAuthError>,
        previous_refresh: Option<String>,
        keep_profile: Option<Profile>,
    ) {
        let tokens = {
            let mut inner = self.lock();
            if inner.attempt != attempt || !inner.state.is_exchanging() {
                info!("Discarding token response for a superseded attempt");
                return;
            }

            match result {
                Ok(tokens) => {
                    let tokens = tokens.or_refresh_token(previous_refresh.as_deref());
                    self.persist_refresh_token(tokens.refresh_token.as_deref());
                    info!(guid = ?tokens.guid, "Logged in");
                    match keep_profile {
                        Some(profile) => {
                            inner.state = SessionState::LoggedIn {
                                tokens,
                                profile: profile.clone(),
                            };
                            self.emit(SessionEvent::LoggedIn(profile));
                            return;
                        }
                        None => {
                            inner.state = SessionState::LoggedIn {
                                tokens: tokens.clone(),
                                profile: Profile::default(),
                            };
                            tokens
                        }
                    }
                }
                Err(err) => {
                    let kind = err.kind();
                    if kind == ErrorKind::TokenExchangeFailed {
                        self.clear_store();
                    }
                    inner.reset();
                    warn!(error = %err, %kind, "Token request failed, logged out");
                    self.fail(kind);
                    return;
                }
            }
        };

        let fetched = self.client.fetch_profile(&tokens).await;

        let mut inner = self.lock();
        if inner.attempt != attempt {
            debug!("Discarding profile for a superseded session");
            return;
        }
        match fetched {
            Ok(profile) => {
                if let SessionState::LoggedIn { profile: slot, .. } = &mut inner.state {
                    *slot = profile.clone();
                }
                debug!(nickname = %profile.nickname, "Profile loaded");
                self.emit(SessionEvent::LoggedIn(profile));
            }
            Err(err) => {
                warn!(error = %err, "Profile fetch failed, staying logged in");
                self.emit(SessionEvent::LoggedIn(Profile::default()));
                self.emit(SessionEvent::Error(ErrorKind::ProfileFetchFailed));
            }
        }
    }

    fn persist_refresh_token(&self, refresh_token: Option<&str>) {
        let result = match refresh_token {
            Some(rt) => self.store.set(&self.store_key, rt),
            // Without a refresh token this session cannot be resumed; drop
            // any older token so a restart does not revive a stale login.
            None => {
                info!("Provider issued no refresh token; renewal disabled until next login");
                self.store.remove(&self.store_key)
            }
        };
        if let Err(e) = result {
            error!(error = %e, backend = self.store.name(), "Failed to persist refresh token");
        }
    }

    fn clear_store(&self) {
        if let Err(e) = self.store.remove(&self.store_key) {
            error!(error = %e, backend = self.store.name(), "Failed to clear stored refresh token");
        }
    }

    // =========================================================================
    // Logout
    // =========================================================================

    /// End the session from any state.
    ///
    /// Releases a pending redirect subscription, clears the stored refresh
    /// token and forgets tokens and profile. Results of requests still in
    /// flight are discarded when they arrive.
    pub fn logout(&self) {
        let mut inner = self.lock();
        let from = inner.state.phase();
        inner.reset();
        self.clear_store();
        info!(%from, "Logged out");
        self.emit(SessionEvent::LoggedOut);
    }
}

impl std::fmt::Debug for AuthSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthSession")
            .field("phase", &self.phase())
            .field("store", &self.store.name())
            .finish()
    }
}
