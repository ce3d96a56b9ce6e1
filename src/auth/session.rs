//! The authenticated session and the read-only view other components get of it.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::watch;

use crate::auth::types::{AuthResponse, Principal};

/// Tokens plus the identity they belong to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: String,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    pub user: Principal,
}

impl Session {
    pub fn new(
        access_token: impl Into<String>,
        refresh_token: impl Into<String>,
        user: Principal,
    ) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: refresh_token.into(),
            token_type: "Bearer".to_string(),
            expires_at: None,
            user,
        }
    }

    /// Session for a login, register or refresh response received at `now`.
    pub fn from_auth_response(response: AuthResponse, now: DateTime<Utc>) -> Self {
        let expires_at = response
            .expires_in
            .and_then(|secs| i64::try_from(secs).ok())
            .map(|secs| now + ChronoDuration::seconds(secs));
        Self {
            access_token: response.access_token,
            refresh_token: response.refresh_token,
            token_type: response.token_type.unwrap_or_else(|| "Bearer".to_string()),
            expires_at,
            user: response.user,
        }
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Why a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogoutReason {
    UserRequested,
    RefreshFailed(String),
}

/// Lifecycle notifications for dependents of the session.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    LoggedIn { username: String },
    Refreshed { username: String },
    LoggedOut { reason: LogoutReason },
}

/// Read-only handle on the current session.
///
/// Cloning is cheap. Only the [`TokenCoordinator`](crate::auth::coordinator::TokenCoordinator)
/// that produced the handle can change what it observes.
#[derive(Debug, Clone)]
pub struct SessionReader {
    rx: watch::Receiver<Option<Arc<Session>>>,
}

impl SessionReader {
    /// A reader fixed to one session, for callers that manage tokens themselves.
    pub fn from_session(session: Session) -> Self {
        let (_tx, rx) = watch::channel(Some(Arc::new(session)));
        Self { rx }
    }

    /// A reader that never observes a session.
    pub fn anonymous() -> Self {
        let (_tx, rx) = watch::channel(None);
        Self { rx }
    }

    pub fn current(&self) -> Option<Arc<Session>> {
        self.rx.borrow().clone()
    }

    pub fn access_token(&self) -> Option<String> {
        self.rx.borrow().as_ref().map(|s| s.access_token.clone())
    }

    pub fn username(&self) -> Option<String> {
        self.rx.borrow().as_ref().map(|s| s.user.username.clone())
    }

    pub fn is_authenticated(&self) -> bool {
        self.rx.borrow().is_some()
    }

    /// Wait for the session to change. Returns `false` once the owning
    /// coordinator is gone and no further change can happen.
    pub async fn changed(&mut self) -> bool {
        self.rx.changed().await.is_ok()
    }
}

/// The single writer behind every [`SessionReader`].
#[derive(Debug)]
pub(crate) struct SessionCell {
    tx: watch::Sender<Option<Arc<Session>>>,
}

impl SessionCell {
    pub(crate) fn new(initial: Option<Session>) -> Self {
        let (tx, _rx) = watch::channel(initial.map(Arc::new));
        Self { tx }
    }

    pub(crate) fn reader(&self) -> SessionReader {
        SessionReader {
            rx: self.tx.subscribe(),
        }
    }

    pub(crate) fn current(&self) -> Option<Arc<Session>> {
        self.tx.borrow().clone()
    }

    pub(crate) fn replace(&self, session: Session) -> Arc<Session> {
        let session = Arc::new(session);
        self.tx.send_replace(Some(Arc::clone(&session)));
        session
    }

    /// Clear the session. Returns whether one was present.
    pub(crate) fn clear(&self) -> bool {
        self.tx.send_replace(None).is_some()
    }

    /// Clear the session only if it still holds `refresh_token`.
    ///
    /// Every waiter of a failed refresh calls this; the first one clears and
    /// the rest see a session that no longer matches.
    pub(crate) fn clear_if_refresh_token(&self, refresh_token: &str) -> bool {
        self.tx.send_if_modified(|current| {
            let matches = current
                .as_ref()
                .is_some_and(|session| session.refresh_token == refresh_token);
            if matches {
                *current = None;
            }
            matches
        })
    }
}

/// Persistence collaborator for sessions.
///
/// Where and how a session is stored (browser storage, keyring, file) is up
/// to the implementation.
pub trait SessionStore: Send + Sync + 'static {
    fn load(&self) -> Option<Session>;
    fn save(&self, session: &Session);
    fn clear(&self);
}

/// Keeps the session in process memory only.
#[derive(Debug, Default)]
pub struct MemorySessionStore {
    slot: Mutex<Option<Session>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_session(session: Session) -> Self {
        Self {
            slot: Mutex::new(Some(session)),
        }
    }
}

impl SessionStore for MemorySessionStore {
    fn load(&self) -> Option<Session> {
        self.slot.lock().clone()
    }

    fn save(&self, session: &Session) {
        *self.slot.lock() = Some(session.clone());
    }

    fn clear(&self) {
        self.slot.lock().take();
    }
}
