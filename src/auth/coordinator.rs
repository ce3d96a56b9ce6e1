//! The `TokenCoordinator`: bearer-token attachment and 401 recovery.

use chrono::Utc;
use reqwest::{StatusCode, header::CONTENT_TYPE};
use serde::de::DeserializeOwned;
use std::fmt;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, instrument, warn};

use crate::api::request::{ApiRequest, RequestBody};
use crate::auth::gate::{RefreshGate, RefreshStats};
use crate::auth::session::{
    LogoutReason, MemorySessionStore, Session, SessionCell, SessionEvent, SessionReader,
    SessionStore,
};
use crate::auth::types::{AuthResponse, Credentials, Registration};
use crate::config::{ApiSettings, ClientConfig};
use crate::error::{ApiError, ClientError, RefreshError};

pub const LOGIN_PATH: &str = "/auth/login";
pub const REGISTER_PATH: &str = "/auth/register";
pub const REFRESH_PATH: &str = "/auth/refresh";

const EVENT_CHANNEL_CAPACITY: usize = 32;

/// Sends API requests on behalf of the current session.
///
/// Authenticated requests carry `Authorization: Bearer <access token>`. When
/// one comes back `401 Unauthorized`, the coordinator refreshes the session
/// and sends it again. Concurrent 401s share a single refresh call, and all of
/// them observe the same outcome: either every request is re-sent with the
/// same new token, or every one fails with [`ClientError::SessionExpired`] and
/// the session is cleared.
///
/// Cloning is cheap; clones share the session and the refresh slot.
#[derive(Clone)]
pub struct TokenCoordinator {
    inner: Arc<CoordinatorInner>,
}

struct CoordinatorInner {
    http: reqwest::Client,
    api: ApiSettings,
    session: SessionCell,
    store: Arc<dyn SessionStore>,
    gate: RefreshGate<Session>,
    events: broadcast::Sender<SessionEvent>,
}

impl TokenCoordinator {
    /// Create a coordinator that keeps its session in memory only.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Network`] if the HTTP client cannot be built.
    pub fn new(config: &ClientConfig) -> Result<Self, ClientError> {
        Self::with_store(config, Arc::new(MemorySessionStore::new()))
    }

    /// Create a coordinator backed by `store`. A session already present in
    /// the store becomes the active session.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Network`] if the HTTP client cannot be built.
    pub fn with_store(
        config: &ClientConfig,
        store: Arc<dyn SessionStore>,
    ) -> Result<Self, ClientError> {
        let http = reqwest::Client::builder()
            .timeout(config.api.request_timeout())
            .build()?;
        Ok(Self::with_http_client(config, store, http))
    }

    /// Use a custom HTTP client (for connection pool reuse or testing).
    pub fn with_http_client(
        config: &ClientConfig,
        store: Arc<dyn SessionStore>,
        http: reqwest::Client,
    ) -> Self {
        let restored = store.load();
        if let Some(session) = &restored {
            info!(username = %session.user.username, "Restored persisted session.");
        }
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Self {
            inner: Arc::new(CoordinatorInner {
                http,
                api: config.api.clone(),
                session: SessionCell::new(restored),
                store,
                gate: RefreshGate::with_timeout(config.auth.refresh_timeout()),
                events,
            }),
        }
    }

    /// A read-only view of the session for other components.
    pub fn session(&self) -> SessionReader {
        self.inner.session.reader()
    }

    pub fn current_session(&self) -> Option<Arc<Session>> {
        self.inner.session.current()
    }

    pub fn is_authenticated(&self) -> bool {
        self.inner.session.current().is_some()
    }

    /// Subscribe to login, refresh and logout notifications.
    pub fn events(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    pub fn refresh_stats(&self) -> RefreshStats {
        self.inner.gate.stats()
    }

    /// Whether a refresh call is outstanding right now.
    pub fn is_refreshing(&self) -> bool {
        self.inner.gate.is_refreshing()
    }

    /// Sign in and make the returned session current.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Api`] with the server's problem document when
    /// the credentials are rejected, or a network/decode error.
    #[instrument(skip(self, credentials), fields(username = %credentials.username))]
    pub async fn login(&self, credentials: &Credentials) -> Result<Arc<Session>, ClientError> {
        let request = ApiRequest::post(LOGIN_PATH).json(credentials)?;
        let response: AuthResponse = self.send_json(request).await?;
        Ok(self.establish(response))
    }

    /// Create an account and make the returned session current.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Api`] (e.g. 409 for a taken username), or a
    /// network/decode error.
    #[instrument(skip(self, registration), fields(username = %registration.username))]
    pub async fn register(
        &self,
        registration: &Registration,
    ) -> Result<Arc<Session>, ClientError> {
        let request = ApiRequest::post(REGISTER_PATH).json(registration)?;
        let response: AuthResponse = self.send_json(request).await?;
        Ok(self.establish(response))
    }

    /// End the session locally and notify dependents.
    #[instrument(skip(self))]
    pub fn logout(&self) {
        if self.inner.session.clear() {
            self.inner.store.clear();
            info!("Logged out.");
            let _ = self.inner.events.send(SessionEvent::LoggedOut {
                reason: LogoutReason::UserRequested,
            });
        }
    }

    /// Reload the session from the store, replacing the current one.
    ///
    /// Returns `None` (and leaves the current session alone) when the store
    /// is empty.
    #[instrument(skip(self))]
    pub fn restore(&self) -> Option<Arc<Session>> {
        let session = self.inner.store.load()?;
        let username = session.user.username.clone();
        let session = self.inner.session.replace(session);
        info!(%username, "Session restored from store.");
        let _ = self.inner.events.send(SessionEvent::LoggedIn { username });
        Some(session)
    }

    /// Refresh the session now, joining a refresh already in flight.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Refresh`] if the refresh fails; the session is
    /// cleared in that case.
    #[instrument(skip(self))]
    pub async fn refresh(&self) -> Result<Arc<Session>, ClientError> {
        self.refresh_unless(|| None)
            .await
            .map_err(ClientError::Refresh)
    }

    /// Send `request`, attaching the bearer token when the endpoint needs one
    /// and recovering from a 401 by refreshing the session.
    ///
    /// Successful responses are returned as-is; any other status becomes
    /// [`ClientError::Api`].
    ///
    /// # Errors
    ///
    /// See [`ClientError`]. A 401 that survives a refresh is returned as
    /// [`ClientError::Api`]; a failed refresh yields
    /// [`ClientError::SessionExpired`].
    #[instrument(skip(self, request), fields(method = %request.method(), path = request.path()))]
    pub async fn dispatch(&self, request: ApiRequest) -> Result<reqwest::Response, ClientError> {
        if !request.requires_auth() {
            let response = self.send_once(&request, None).await?;
            return ensure_success(response).await;
        }

        let token = self.inner.session.current().map(|s| s.access_token.clone());
        let response = self.send_once(&request, token.as_deref()).await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return ensure_success(response).await;
        }

        let original = ApiError::from_response(response).await;
        self.on_unauthorized(request, token, original).await
    }

    /// Dispatch and decode a JSON response body.
    ///
    /// # Errors
    ///
    /// As [`dispatch`](Self::dispatch), plus [`ClientError::Decode`].
    pub async fn send_json<T: DeserializeOwned>(&self, request: ApiRequest) -> Result<T, ClientError> {
        let response = self.dispatch(request).await?;
        let bytes = response.bytes().await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Dispatch and discard the response body.
    ///
    /// # Errors
    ///
    /// As [`dispatch`](Self::dispatch).
    pub async fn send_empty(&self, request: ApiRequest) -> Result<(), ClientError> {
        self.dispatch(request).await.map(|_| ())
    }

    async fn on_unauthorized(
        &self,
        request: ApiRequest,
        sent_with: Option<String>,
        original: ApiError,
    ) -> Result<reqwest::Response, ClientError> {
        let session = &self.inner.session;
        let rotated = || {
            session
                .current()
                .filter(|current| sent_with.as_deref() != Some(current.access_token.as_str()))
                .inspect(|_| debug!("Token rotated while the request was in flight; re-sending."))
        };

        match self.refresh_unless(rotated).await {
            Ok(session) => self.redispatch(&request, &session.access_token).await,
            Err(reason) => Err(ClientError::SessionExpired { original, reason }),
        }
    }

    /// Refresh through the gate unless `settled` reports a newer session.
    ///
    /// A failed refresh clears the session on the refresh task itself, before
    /// the gate lets the next caller in.
    async fn refresh_unless<S>(&self, settled: S) -> Result<Arc<Session>, Arc<RefreshError>>
    where
        S: FnOnce() -> Option<Arc<Session>> + Send,
    {
        let refresh_token = self.inner.session.current().map(|s| s.refresh_token.clone());
        let worker = Arc::clone(&self.inner);
        let cleanup = Arc::clone(&self.inner);
        self.inner
            .gate
            .run_unless(settled, move || perform_refresh(worker), move |reason| {
                expire(&cleanup, refresh_token.as_deref(), reason);
            })
            .await
    }

    /// Send again with a fresh token. A second 401 is returned, never refreshed.
    async fn redispatch(
        &self,
        request: &ApiRequest,
        token: &str,
    ) -> Result<reqwest::Response, ClientError> {
        let response = self.send_once(request, Some(token)).await?;
        if response.status() == StatusCode::UNAUTHORIZED {
            warn!("Request still unauthorized after refresh.");
        }
        ensure_success(response).await
    }

    async fn send_once(
        &self,
        request: &ApiRequest,
        token: Option<&str>,
    ) -> Result<reqwest::Response, ClientError> {
        send_request(&self.inner.http, &self.inner.api, request, token).await
    }

    fn establish(&self, response: AuthResponse) -> Arc<Session> {
        let session = Session::from_auth_response(response, Utc::now());
        self.inner.store.save(&session);
        let username = session.user.username.clone();
        let session = self.inner.session.replace(session);
        info!(%username, "Session established.");
        let _ = self
            .inner
            .events
            .send(SessionEvent::LoggedIn { username });
        session
    }
}

/// Clear the session after a failed refresh, unless it changed meanwhile.
fn expire(inner: &CoordinatorInner, refresh_token: Option<&str>, reason: &RefreshError) {
    let Some(refresh_token) = refresh_token else {
        return;
    };
    if inner.session.clear_if_refresh_token(refresh_token) {
        inner.store.clear();
        warn!("Session expired: {}", reason);
        let _ = inner.events.send(SessionEvent::LoggedOut {
            reason: LogoutReason::RefreshFailed(reason.to_string()),
        });
    }
}

impl fmt::Debug for TokenCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenCoordinator")
            .field("base_url", &self.inner.api.base_url.as_str())
            .field("authenticated", &self.is_authenticated())
            .field("gate", &self.inner.gate)
            .finish()
    }
}

/// The single upstream refresh call. Runs inside the gate.
async fn perform_refresh(inner: Arc<CoordinatorInner>) -> Result<Session, RefreshError> {
    let Some(refresh_token) = inner.session.current().map(|s| s.refresh_token.clone()) else {
        return Err(RefreshError::MissingRefreshToken);
    };

    let url = inner.api.endpoint(REFRESH_PATH)?;
    let response = inner
        .http
        .post(url)
        .header(CONTENT_TYPE, "text/plain")
        .body(refresh_token)
        .send()
        .await?;

    if !response.status().is_success() {
        return Err(RefreshError::Rejected(ApiError::from_response(response).await));
    }

    let bytes = response.bytes().await?;
    let auth: AuthResponse = serde_json::from_slice(&bytes)?;
    let session = Session::from_auth_response(auth, Utc::now());

    inner.store.save(&session);
    let username = session.user.username.clone();
    inner.session.replace(session.clone());
    info!(%username, "Session refreshed.");
    let _ = inner.events.send(SessionEvent::Refreshed { username });

    Ok(session)
}

async fn send_request(
    http: &reqwest::Client,
    api: &ApiSettings,
    request: &ApiRequest,
    token: Option<&str>,
) -> Result<reqwest::Response, ClientError> {
    let url = api.endpoint(request.path())?;
    let mut builder = http.request(request.method().clone(), url);
    if !request.query_pairs().is_empty() {
        builder = builder.query(request.query_pairs());
    }
    if let Some(token) = token {
        builder = builder.bearer_auth(token);
    }
    builder = match request.body() {
        RequestBody::Empty => builder,
        RequestBody::Json(value) => builder.json(value),
        RequestBody::Text(text) => builder
            .header(CONTENT_TYPE, "text/plain")
            .body(text.clone()),
    };
    Ok(builder.send().await?)
}

/// Pass 2xx responses through; turn anything else into a problem document.
async fn ensure_success(response: reqwest::Response) -> Result<reqwest::Response, ClientError> {
    if response.status().is_success() {
        return Ok(response);
    }
    Err(ClientError::Api(ApiError::from_response(response).await))
}
