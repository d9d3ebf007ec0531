#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use auction_login::oauth::{
    CallbackParams, ClientCredentials, CredentialStore, LinkRedirectListener,
    MemoryCredentialStore, OAuthClient, OAuthEndpoints,
};
use auction_login::session::{AuthSession, SessionEvent, SessionPhase, UrlLauncher};
use tokio::sync::broadcast;
use wiremock::MockServer;

pub const CLIENT_ID: &str = "test-client";
pub const CLIENT_SECRET: &str = "test-secret";
pub const STORE_KEY: &str = "@AuctionLogin:REFRESH_TOKEN";
pub const TOKEN_PATH: &str = "/oauth2/get_token";
pub const REDIRECT_URI: &str = "https://rn-webrtc-hall.herokuapp.com/api/oauth";

/// Records authorization URLs instead of opening a browser.
#[derive(Default)]
pub struct RecordingLauncher {
    urls: Mutex<Vec<String>>,
}

impl RecordingLauncher {
    pub fn urls(&self) -> Vec<String> {
        self.urls.lock().unwrap().clone()
    }

    /// `state` parameter of the most recently opened URL.
    pub fn last_state(&self) -> String {
        let url = self.urls.lock().unwrap().last().cloned().expect("no URL opened");
        CallbackParams::from_redirect_url(&url)
            .state
            .expect("authorization URL without state")
    }
}

impl UrlLauncher for RecordingLauncher {
    fn open(&self, url: &str) -> std::io::Result<()> {
        self.urls.lock().unwrap().push(url.to_string());
        Ok(())
    }
}

pub struct Harness {
    pub server: MockServer,
    pub store: MemoryCredentialStore,
    pub listener: LinkRedirectListener,
    pub launcher: Arc<RecordingLauncher>,
    pub session: Arc<AuthSession>,
    pub events: broadcast::Receiver<SessionEvent>,
}

pub fn credentials() -> ClientCredentials {
    ClientCredentials::new(CLIENT_ID, CLIENT_SECRET)
}

pub fn client_for(server: &MockServer, timeout: Duration) -> OAuthClient {
    let endpoints = OAuthEndpoints {
        token_url: format!("{}{TOKEN_PATH}", server.uri()),
        profile_url: format!("{}/v1/user", server.uri()),
        ..OAuthEndpoints::default()
    };
    OAuthClient::new(credentials(), endpoints, timeout).unwrap()
}

pub async fn harness() -> Harness {
    harness_with(MemoryCredentialStore::new(), Duration::from_secs(5)).await
}

pub async fn harness_with(store: MemoryCredentialStore, timeout: Duration) -> Harness {
    let server = MockServer::start().await;
    let listener = LinkRedirectListener::new();
    let launcher = Arc::new(RecordingLauncher::default());
    let session = AuthSession::new(
        client_for(&server, timeout),
        Arc::new(store.clone()),
        STORE_KEY,
        Arc::new(listener.clone()),
        launcher.clone(),
    );
    let events = session.subscribe();
    Harness {
        server,
        store,
        listener,
        launcher,
        session,
        events,
    }
}

impl Harness {
    pub fn stored(&self) -> Option<String> {
        self.store.get(STORE_KEY).unwrap()
    }

    /// Next session event, failing the test if none arrives in time.
    pub async fn next_event(&mut self) -> SessionEvent {
        tokio::time::timeout(Duration::from_secs(5), self.events.recv())
            .await
            .expect("timed out waiting for session event")
            .expect("event channel closed")
    }

    /// Assert that no further event arrives within `wait`.
    pub async fn assert_quiet(&mut self, wait: Duration) {
        if let Ok(event) = tokio::time::timeout(wait, self.events.recv()).await {
            panic!("unexpected session event: {event:?}");
        }
    }

    /// Start a login and deliver a redirect carrying the live nonce.
    pub async fn login_with_code(&mut self, code: &str) {
        self.session.start_login().unwrap();
        assert_eq!(self.next_event().await, SessionEvent::Authorizing);
        let state = self.launcher.last_state();
        assert!(self.listener.deliver(redirect_url(&[("code", code), ("state", &state)])));
    }

    pub async fn wait_for_phase(&self, phase: SessionPhase) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while self.session.phase() != phase {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("session never reached {phase}"));
    }
}

pub fn redirect_url(params: &[(&str, &str)]) -> String {
    let query = url::form_urlencoded::Serializer::new(String::new())
        .extend_pairs(params)
        .finish();
    format!("{REDIRECT_URI}?{query}")
}

pub fn token_body(access: &str, refresh: Option<&str>, guid: &str, expires_in: i64) -> serde_json::Value {
    let mut body = serde_json::json!({
        "access_token": access,
        "token_type": "bearer",
        "expires_in": expires_in,
        "xoauth_yahoo_guid": guid,
    });
    if let Some(refresh) = refresh {
        body["refresh_token"] = serde_json::json!(refresh);
    }
    body
}

pub fn profile_body(nickname: &str, image_url: &str) -> serde_json::Value {
    serde_json::json!({
        "profile": {
            "guid": "G",
            "nickname": nickname,
            "image": { "imageUrl": image_url, "height": 192, "width": 192 }
        }
    })
}
