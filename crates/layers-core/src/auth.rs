use std::fs;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::backend::{BackendError, TokenRefresher};
use crate::constants::TOKEN_EXPIRY_SKEW_SECS;

/// Access/refresh token pair issued by the backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
}

impl Session {
    pub fn expiring_in(access_token: String, refresh_token: String, seconds: i64) -> Self {
        Self {
            access_token,
            refresh_token,
            expires_at: Utc::now() + Duration::seconds(seconds),
        }
    }

    /// Expired, or close enough that a request might outlive the token
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now + Duration::seconds(TOKEN_EXPIRY_SKEW_SECS) >= self.expires_at
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("Not signed in")]
    NoSession,
    #[error("Session expired, sign in again ({0})")]
    RefreshFailed(String),
    #[error("Session storage error: {0}")]
    Storage(String),
}

/// Failure of a request made on the user's behalf
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RequestError {
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Backend(#[from] BackendError),
}

impl RequestError {
    /// No usable session: the request cannot succeed until sign-in.
    pub fn is_auth(&self) -> bool {
        matches!(self, RequestError::Auth(_))
    }
}

/// What the UI shows about the session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    SignedOut,
    Active,
    /// A refresh was rejected; the user has to sign in again
    Expired,
}

/// Durable home for the session between runs
pub trait SessionStore: Send + Sync {
    fn load(&self) -> Result<Option<Session>, AuthError>;
    fn save(&self, session: &Session) -> Result<(), AuthError>;
    fn clear(&self) -> Result<(), AuthError>;
}

#[derive(Default)]
pub struct MemorySessionStore {
    session: Mutex<Option<Session>>,
}

impl MemorySessionStore {
    pub fn new(session: Option<Session>) -> Self {
        Self {
            session: Mutex::new(session),
        }
    }
}

impl SessionStore for MemorySessionStore {
    fn load(&self) -> Result<Option<Session>, AuthError> {
        Ok(self.session.lock().clone())
    }

    fn save(&self, session: &Session) -> Result<(), AuthError> {
        *self.session.lock() = Some(session.clone());
        Ok(())
    }

    fn clear(&self) -> Result<(), AuthError> {
        *self.session.lock() = None;
        Ok(())
    }
}

/// Session persisted as JSON in the data directory. Used on headless
/// machines where no keyring service is available.
pub struct FileSessionStore {
    path: PathBuf,
}

impl FileSessionStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

impl SessionStore for FileSessionStore {
    fn load(&self) -> Result<Option<Session>, AuthError> {
        match fs::read_to_string(&self.path) {
            Ok(contents) => serde_json::from_str(&contents)
                .map(Some)
                .map_err(|e| AuthError::Storage(e.to_string())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(AuthError::Storage(e.to_string())),
        }
    }

    fn save(&self, session: &Session) -> Result<(), AuthError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| AuthError::Storage(e.to_string()))?;
        }
        let json =
            serde_json::to_string_pretty(session).map_err(|e| AuthError::Storage(e.to_string()))?;
        fs::write(&self.path, json).map_err(|e| AuthError::Storage(e.to_string()))
    }

    fn clear(&self) -> Result<(), AuthError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(AuthError::Storage(e.to_string())),
        }
    }
}

/// Holds the current session and hands out valid access tokens.
///
/// Refresh is single-flight: concurrent callers that find the token stale
/// queue on one lock, and only the first actually calls the refresher. The
/// rest observe the new token on re-check.
pub struct SessionManager {
    current: Mutex<Option<Session>>,
    refresh_lock: tokio::sync::Mutex<()>,
    refresher: Arc<dyn TokenRefresher>,
    store: Arc<dyn SessionStore>,
    state_tx: watch::Sender<SessionState>,
}

impl SessionManager {
    /// Load any stored session. A storage failure degrades to signed out.
    pub fn new(refresher: Arc<dyn TokenRefresher>, store: Arc<dyn SessionStore>) -> Self {
        let current = match store.load() {
            Ok(session) => session,
            Err(e) => {
                tracing::warn!("Failed to load stored session: {}", e);
                None
            }
        };
        let state = if current.is_some() {
            SessionState::Active
        } else {
            SessionState::SignedOut
        };
        let (state_tx, _) = watch::channel(state);
        Self {
            current: Mutex::new(current),
            refresh_lock: tokio::sync::Mutex::new(()),
            refresher,
            store,
            state_tx,
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state_tx.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    pub fn is_signed_in(&self) -> bool {
        self.current.lock().is_some()
    }

    pub fn sign_in(&self, session: Session) -> Result<(), AuthError> {
        self.store.save(&session)?;
        *self.current.lock() = Some(session);
        self.state_tx.send_replace(SessionState::Active);
        Ok(())
    }

    pub fn sign_out(&self) -> Result<(), AuthError> {
        *self.current.lock() = None;
        self.state_tx.send_replace(SessionState::SignedOut);
        self.store.clear()
    }

    /// A token good for at least the expiry skew, refreshing first if needed
    pub async fn valid_token(&self) -> Result<String, AuthError> {
        let seen = {
            let current = self.current.lock();
            let session = current.as_ref().ok_or(AuthError::NoSession)?;
            if !session.is_expired(Utc::now()) {
                return Ok(session.access_token.clone());
            }
            session.access_token.clone()
        };
        self.refresh_replacing(&seen).await
    }

    /// Run `op` with a valid access token. A 401 triggers one refresh and one
    /// resend; a second 401 is returned as is.
    pub async fn authorized<T, F, Fut>(&self, op: F) -> Result<T, RequestError>
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = Result<T, BackendError>>,
    {
        let token = self.valid_token().await?;
        match op(token.clone()).await {
            Err(BackendError::Unauthorized) => {
                tracing::debug!("Request rejected with 401, refreshing session");
                let fresh = self.refresh_after_rejection(&token).await?;
                Ok(op(fresh).await?)
            }
            other => Ok(other?),
        }
    }

    /// The backend rejected `rejected`; refresh unless someone already did.
    pub async fn refresh_after_rejection(&self, rejected: &str) -> Result<String, AuthError> {
        self.refresh_replacing(rejected).await
    }

    async fn refresh_replacing(&self, stale: &str) -> Result<String, AuthError> {
        let _guard = self.refresh_lock.lock().await;

        let session = {
            let current = self.current.lock();
            let session = current.clone().ok_or(AuthError::NoSession)?;
            if session.access_token != stale && !session.is_expired(Utc::now()) {
                return Ok(session.access_token);
            }
            session
        };

        tracing::debug!("Refreshing access token");
        match self.refresher.refresh(&session.refresh_token).await {
            Ok(fresh) => {
                if let Err(e) = self.store.save(&fresh) {
                    tracing::warn!("Refreshed session could not be persisted: {}", e);
                }
                let token = fresh.access_token.clone();
                *self.current.lock() = Some(fresh);
                self.state_tx.send_replace(SessionState::Active);
                Ok(token)
            }
            Err(e) => {
                tracing::warn!("Token refresh failed: {}", e);
                self.state_tx.send_replace(SessionState::Expired);
                Err(match e {
                    BackendError::Unauthorized => {
                        AuthError::RefreshFailed("refresh token rejected".to_string())
                    }
                    other => AuthError::RefreshFailed(other.to_string()),
                })
            }
        }
    }
}
