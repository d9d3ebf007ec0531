//! Redirect callback delivery.
//!
//! The provider sends the user back to a fixed redirect URI carrying
//! `?code=...&state=...`. How that URL reaches this process (deep link,
//! pasted into a terminal, loopback request) is platform glue behind
//! [`RedirectListener`]. The session installs one subscription per
//! authorization attempt and releases it exactly once.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tracing::{debug, warn};

/// Callback invoked with each redirect URL delivered to a subscription.
pub type RedirectCallback = Box<dyn Fn(String) + Send + Sync>;

/// Source of redirect callback URLs.
pub trait RedirectListener: Send + Sync {
    /// Register `on_url` to receive redirect URLs until the returned
    /// subscription is released.
    fn subscribe(&self, on_url: RedirectCallback) -> RedirectSubscription;
}

// =============================================================================
// RedirectSubscription
// =============================================================================

/// Handle for one registration with a [`RedirectListener`].
///
/// The release action runs exactly once: on [`unsubscribe`](Self::unsubscribe)
/// or, failing that, on drop.
pub struct RedirectSubscription {
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl RedirectSubscription {
    pub fn new(release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            release: Some(Box::new(release)),
        }
    }

    /// Unregister from the listener.
    pub fn unsubscribe(mut self) {
        self.release_once();
    }

    fn release_once(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl Drop for RedirectSubscription {
    fn drop(&mut self) {
        self.release_once();
    }
}

impl std::fmt::Debug for RedirectSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedirectSubscription")
            .field("active", &self.release.is_some())
            .finish()
    }
}

// =============================================================================
// LinkRedirectListener
// =============================================================================

/// In-process redirect listener.
///
/// Holds at most one registration. Whatever receives links on this platform
/// (stdin reader, URL scheme handler, test) calls [`deliver`](Self::deliver).
/// A newer subscription replaces an older one; releasing the older handle
/// afterwards leaves the newer registration in place.
#[derive(Clone, Default)]
pub struct LinkRedirectListener {
    inner: Arc<ListenerInner>,
}

#[derive(Default)]
struct ListenerInner {
    slot: Mutex<Option<(u64, Arc<RedirectCallback>)>>,
    next_id: AtomicU64,
    released: AtomicUsize,
}

impl LinkRedirectListener {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hand a redirect URL to the current subscriber.
    ///
    /// Returns `false` when nobody is subscribed; the URL is dropped.
    pub fn deliver(&self, url: impl Into<String>) -> bool {
        let url = url.into();
        let callback = self
            .inner
            .slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|(_, cb)| Arc::clone(cb));

        match callback {
            Some(cb) => {
                debug!("Delivering redirect to subscriber");
                cb(url);
                true
            }
            None => {
                warn!("Redirect received with no active subscription, ignoring");
                false
            }
        }
    }

    /// Whether a subscription is currently registered.
    pub fn is_subscribed(&self) -> bool {
        self.inner
            .slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Number of subscriptions released so far.
    pub fn released_count(&self) -> usize {
        self.inner.released.load(Ordering::SeqCst)
    }
}

impl RedirectListener for LinkRedirectListener {
    fn subscribe(&self, on_url: RedirectCallback) -> RedirectSubscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let previous = self
            .inner
            .slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace((id, Arc::new(on_url)));
        if previous.is_some() {
            warn!("Replacing a redirect subscription that was never released");
        }

        let inner = Arc::clone(&self.inner);
        RedirectSubscription::new(move || {
            let mut slot = inner.slot.lock().unwrap_or_else(PoisonError::into_inner);
            if slot.as_ref().is_some_and(|(current, _)| *current == id) {
                *slot = None;
            }
            inner.released.fetch_add(1, Ordering::SeqCst);
        })
    }
}

// =============================================================================
// Callback parsing
// =============================================================================

/// Query parameters carried by the redirect callback.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallbackParams {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
    pub error_description: Option<String>,
}

impl CallbackParams {
    /// Parse the query component of a redirect URL.
    ///
    /// Scheme and host are ignored; everything after the first `?` (up to an
    /// optional `#fragment`) is form-decoded. A URL without a query yields
    /// empty parameters. Repeated keys keep their first value.
    pub fn from_redirect_url(url: &str) -> Self {
        let Some((_, query)) = url.split_once('?') else {
            return Self::default();
        };
        let query = query.split_once('#').map_or(query, |(q, _)| q);

        let mut params = Self::default();
        for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
            let field = match key.as_ref() {
                "code" => &mut params.code,
                "state" => &mut params.state,
                "error" => &mut params.error,
                "error_description" => &mut params.error_description,
                _ => continue,
            };
            if field.is_none() {
                *field = Some(value.into_owned());
            }
        }
        params
    }
}
