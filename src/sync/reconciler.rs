use std::sync::{Arc, Mutex, PoisonError};

use anyhow::Result;
use tracing::{debug, info, warn};

use crate::{
    api::{
        types::{SessionState, SessionStatus},
        RemoteApi,
    },
    storage::session_store::{keys, SessionStore},
    utils::clock::Clock,
};

use super::connectivity::Connectivity;

/// Seconds a cached login answer stays valid.
pub const LOGIN_CACHE_TTL_SECS: i64 = 60 * 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CachedLoginState {
    pub logged_in: bool,
    pub checked_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserStatus {
    pub logged_in: bool,
}

/// Outcome of one reconciliation. `became_logged_in` is set only on the not-logged-in to
/// logged-in edge, which is when the caller runs its login side effects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusCheck {
    pub status: UserStatus,
    pub became_logged_in: bool,
}

#[derive(Default)]
struct LoginCache {
    entry: Option<CachedLoginState>,
    /// Survives invalidation of `entry`, so an expired cache doesn't look like a fresh login.
    last_logged_in: bool,
}

/// Resolves whether the user is logged in by combining the local cache, its TTL and the remote
/// session status.
///
/// ```text
/// UNKNOWN --check--> CACHED_VALID --TTL--> CACHED_STALE --next query--> UNKNOWN --check--> ...
/// ```
pub struct Reconciler {
    api: Arc<dyn RemoteApi>,
    store: Arc<SessionStore>,
    connectivity: Arc<Connectivity>,
    clock: Arc<dyn Clock>,
    cache: Mutex<LoginCache>,
}

impl Reconciler {
    pub fn new(
        api: Arc<dyn RemoteApi>,
        store: Arc<SessionStore>,
        connectivity: Arc<Connectivity>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            api,
            store,
            connectivity,
            clock,
            cache: Mutex::new(LoginCache::default()),
        }
    }

    /// Returns the login state. A fresh cached answer is returned without any I/O unless
    /// `force_refresh` is set. Never fails: every error ends up as logged out.
    pub async fn check(&self, force_refresh: bool) -> StatusCheck {
        let now = self.clock.epoch_seconds();
        if !force_refresh {
            if let Some(logged_in) = self.cached(now) {
                return StatusCheck {
                    status: UserStatus { logged_in },
                    became_logged_in: false,
                };
            }
        }

        let logged_in = if self.connectivity.is_available().await {
            self.resolve_remote().await
        } else {
            // Offline says nothing about the credentials, so they are left alone.
            debug!("Remote service unavailable, treating user as logged out");
            false
        };
        info!("Checking login status, logged in: {logged_in}");

        let mut cache = self.lock_cache();
        let became_logged_in = logged_in && !cache.last_logged_in;
        cache.last_logged_in = logged_in;
        cache.entry = Some(CachedLoginState {
            logged_in,
            checked_at: self.clock.epoch_seconds(),
        });

        StatusCheck {
            status: UserStatus { logged_in },
            became_logged_in,
        }
    }

    pub fn cached_state(&self) -> Option<CachedLoginState> {
        self.lock_cache().entry
    }

    /// Drops the cached answer and forgets the user was ever logged in.
    pub fn reset(&self) {
        *self.lock_cache() = LoginCache::default();
    }

    fn cached(&self, now: i64) -> Option<bool> {
        let mut cache = self.lock_cache();
        let entry = cache.entry?;
        if now - entry.checked_at > LOGIN_CACHE_TTL_SECS {
            debug!("Login cache expired");
            cache.entry = None;
            return None;
        }
        Some(entry.logged_in)
    }

    fn lock_cache(&self) -> std::sync::MutexGuard<'_, LoginCache> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn resolve_remote(&self) -> bool {
        let status = match self.query_session().await {
            Ok(Some(status)) => status,
            Ok(None) => return false,
            Err(e) => {
                warn!("Unable to check session status: {e:#}");
                return false;
            }
        };

        let logged_in = status.is_logged_in();
        if let Err(e) = self.apply_session(&status).await {
            warn!("Unable to store session status: {e:#}");
        }
        logged_in
    }

    /// Asks the remote for the session state. A pending login is identified by its auth
    /// callback state; email accounts are checked once more with the stored token.
    async fn query_session(&self) -> Result<Option<SessionStatus>> {
        let jwt = self.store.get_string(keys::JWT).await;
        let callback_state = self.store.get_string(keys::AUTH_CALLBACK_STATE).await;

        let Some(token) = callback_state.as_ref().or(jwt.as_ref()) else {
            debug!("No token stored, skipping session check");
            return Ok(None);
        };
        let mut status = self.api.session_status(token).await?;

        let email_auth = matches!(
            self.store.get_string(keys::AUTH_TYPE).await.as_deref(),
            Some("software") | Some("email")
        );
        if let (false, true, Some(_), Some(jwt)) =
            (status.is_logged_in(), email_auth, &callback_state, &jwt)
        {
            debug!("Rechecking email account session with stored token");
            status = self.api.session_status(jwt).await?;
        }

        Ok(Some(status))
    }

    async fn apply_session(&self, status: &SessionStatus) -> Result<()> {
        if let Some(user) = &status.user {
            if let Some(plugin_jwt) = user.plugin_jwt.as_deref().filter(|t| !t.is_empty()) {
                if self.store.set(keys::JWT, plugin_jwt).await? {
                    info!("Session token rotated");
                }
            }
            if self.store.get_string(keys::AUTH_TYPE).await.is_none() {
                self.store.set(keys::AUTH_TYPE, "software").await?;
            }
            self.store.remove(keys::SWITCHING_ACCOUNT).await?;
            self.store.remove(keys::AUTH_CALLBACK_STATE).await?;
        }

        if status.state == SessionState::Ok {
            if let Some(email) = status.user.as_ref().and_then(|u| u.email.as_deref()) {
                self.store.set(keys::NAME, email).await?;
            }
            self.store.remove(keys::CHECK_STATUS).await?;
        } else {
            self.store.remove(keys::NAME).await?;
        }
        Ok(())
    }
}
