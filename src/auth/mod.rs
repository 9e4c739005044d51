//! Session credentials and the single-flight refresher.
//!
//! [`SessionContext`] is the one place the bearer credentials live. It is
//! shared by reference with the gateway and the refresher and can only be
//! mutated through `login`, `logout` and the refresher's token swap.

mod refresh;
mod storage;

pub use refresh::SessionRefresher;
pub use storage::{SessionStorage, StorageError};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tracing::{info, warn};

/// Refresh this long before the access token actually expires.
const REFRESH_THRESHOLD_MS: u64 = 5 * 60 * 1000;

/// Bearer credentials.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    /// Access token for API calls.
    pub access_token: String,
    /// Refresh token for getting new access tokens.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    /// Token expiration timestamp (milliseconds since epoch).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<u64>,
}

impl Session {
    pub fn new(access_token: impl Into<String>, refresh_token: Option<String>) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token,
            expires_at: None,
        }
    }

    /// Set the expiry relative to now.
    #[must_use]
    pub fn expires_in(mut self, secs: u64) -> Self {
        self.expires_at = Some(now_millis().saturating_add(secs.saturating_mul(1000)));
        self
    }

    /// Returns true if the token expires within 5 minutes.
    #[must_use]
    pub fn needs_refresh(&self) -> bool {
        let Some(expires_at) = self.expires_at else {
            return false;
        };
        expires_at.saturating_sub(now_millis()) < REFRESH_THRESHOLD_MS
    }

    #[must_use]
    pub fn is_expired(&self) -> bool {
        let Some(expires_at) = self.expires_at else {
            return false;
        };
        now_millis() >= expires_at
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("access_token", &"[REDACTED]")
            .field(
                "refresh_token",
                &self.refresh_token.as_ref().map(|_| "[REDACTED]"),
            )
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

#[allow(clippy::cast_possible_truncation)]
fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

type ExpiredCallback = Arc<dyn Fn() + Send + Sync>;

/// Process-wide holder of the current [`Session`].
pub struct SessionContext {
    state: RwLock<Option<Session>>,
    storage: Option<SessionStorage>,
    expired_callbacks: Mutex<Vec<ExpiredCallback>>,
}

impl SessionContext {
    /// Context backed by durable storage; loads any saved session.
    pub fn with_storage(storage: SessionStorage) -> Result<Self, StorageError> {
        let session = storage.load()?;
        Ok(Self {
            state: RwLock::new(session),
            storage: Some(storage),
            expired_callbacks: Mutex::new(Vec::new()),
        })
    }

    /// Context that lives only as long as the process.
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            state: RwLock::new(None),
            storage: None,
            expired_callbacks: Mutex::new(Vec::new()),
        }
    }

    pub fn login(&self, session: Session) -> Result<(), StorageError> {
        self.store(session)?;
        info!("session stored");
        Ok(())
    }

    pub fn logout(&self) -> Result<(), StorageError> {
        if let Some(storage) = &self.storage {
            storage.clear()?;
        }
        *self.state.write().unwrap_or_else(PoisonError::into_inner) = None;
        Ok(())
    }

    #[must_use]
    pub fn current(&self) -> Option<Session> {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    #[must_use]
    pub fn access_token(&self) -> Option<String> {
        self.current().map(|s| s.access_token)
    }

    #[must_use]
    pub fn refresh_token(&self) -> Option<String> {
        self.current().and_then(|s| s.refresh_token)
    }

    #[must_use]
    pub fn is_logged_in(&self) -> bool {
        self.current().is_some()
    }

    /// Register a callback for forced logout after an unrecoverable 401.
    pub fn on_expired(&self, callback: impl Fn() + Send + Sync + 'static) {
        self.expired_callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(callback));
    }

    /// Swap in refreshed tokens. Persisted before the in-memory copy changes.
    pub(crate) fn replace_tokens(&self, session: Session) -> Result<(), StorageError> {
        self.store(session)
    }

    /// Forced logout: clear the session and tell every listener.
    pub(crate) fn expire(&self) {
        warn!("session expired; logging out");
        if let Err(e) = self.logout() {
            warn!("Failed to clear stored session: {}", e);
        }

        let callbacks = self
            .expired_callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for callback in callbacks {
            callback();
        }
    }

    fn store(&self, session: Session) -> Result<(), StorageError> {
        if let Some(storage) = &self.storage {
            storage.save(&session)?;
        }
        *self.state.write().unwrap_or_else(PoisonError::into_inner) = Some(session);
        Ok(())
    }
}

impl fmt::Debug for SessionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionContext")
            .field("logged_in", &self.is_logged_in())
            .field("storage", &self.storage)
            .finish_non_exhaustive()
    }
}
