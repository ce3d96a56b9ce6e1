//! A mock Linkboard backend for integration tests: REST endpoints under
//! `/api` and a small STOMP broker at `/ws`.

#![allow(dead_code)]

use axum::{
    Json, Router,
    extract::{
        Path, Query, State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    http::{HeaderMap, StatusCode, header::AUTHORIZATION},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};
use linkboard_client::config::ClientConfig;
use linkboard_client::realtime::stomp::{Command, Frame};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;
use url::Url;

static TRACING: Lazy<()> = Lazy::new(|| {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_test_writer()
        .try_init();
});

pub fn init_tracing() {
    Lazy::force(&TRACING);
}

#[derive(Default)]
pub struct BackendState {
    pub refresh_calls: AtomicUsize,
    pub fail_refresh: AtomicBool,
    /// Refresh succeeds but the new token is still refused.
    pub keep_revoked: AtomicBool,
    pub refresh_delay: Mutex<Duration>,
    /// Delay before `/api/posts` checks the token.
    pub posts_delay: Mutex<Duration>,
    /// The access token `/api/posts` currently accepts.
    pub valid_token: Mutex<String>,
    /// `Authorization` headers seen by authenticated endpoints, in order.
    pub seen_auth: Mutex<Vec<String>>,
    pub last_vote: Mutex<Option<Value>>,
    pub stomp_subscriptions: Mutex<Vec<String>>,
}

pub struct Backend {
    pub addr: SocketAddr,
    pub state: Arc<BackendState>,
}

impl Backend {
    pub async fn spawn() -> Backend {
        init_tracing();
        let state = Arc::new(BackendState::default());
        *state.valid_token.lock() = "abc".to_string();

        let app = Router::new()
            .route("/api/auth/login", post(login))
            .route("/api/auth/refresh", post(refresh))
            .route("/api/posts", get(list_posts))
            .route("/api/posts/{id}", get(get_post))
            .route("/api/posts/{id}/vote", post(vote))
            .route("/api/subreddits", get(list_subreddits))
            .route("/api/search", get(search))
            .route("/api/admin/posts/{id}", delete(remove_post))
            .route("/ws", get(broker))
            .with_state(Arc::clone(&state));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Backend { addr, state }
    }

    pub fn config(&self) -> ClientConfig {
        ClientConfig::new(
            Url::parse(&format!("http://{}/api", self.addr)).unwrap(),
            Url::parse(&format!("ws://{}/ws", self.addr)).unwrap(),
        )
    }

    /// Expire the current access token; the next request gets a 401.
    pub fn revoke(&self) {
        *self.state.valid_token.lock() = "revoked".to_string();
    }

    pub fn refresh_calls(&self) -> usize {
        self.state.refresh_calls.load(Ordering::SeqCst)
    }

    pub fn seen_auth(&self) -> Vec<String> {
        self.state.seen_auth.lock().clone()
    }
}

fn problem(status: StatusCode, title: &str, detail: &str) -> Response {
    let body = json!({
        "type": "about:blank",
        "title": title,
        "status": status.as_u16(),
        "detail": detail,
        "timestamp": "2025-03-01T10:15:30"
    });
    (status, Json(body)).into_response()
}

fn auth_response(access: &str, refresh: &str) -> Value {
    json!({
        "accessToken": access,
        "refreshToken": refresh,
        "tokenType": "Bearer",
        "expiresIn": 900,
        "user": {"id": 7, "username": "ada", "displayName": "Ada", "karma": 42}
    })
}

fn authorized(state: &BackendState, headers: &HeaderMap) -> bool {
    let header = headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string();
    state.seen_auth.lock().push(header.clone());
    header == format!("Bearer {}", state.valid_token.lock())
}

async fn login(State(state): State<Arc<BackendState>>, Json(body): Json<Value>) -> Response {
    if body["password"] == "secret" {
        *state.valid_token.lock() = "abc".to_string();
        Json(auth_response("abc", "r1")).into_response()
    } else {
        problem(StatusCode::UNAUTHORIZED, "Unauthorized", "Bad credentials")
    }
}

async fn refresh(State(state): State<Arc<BackendState>>, body: String) -> Response {
    state.refresh_calls.fetch_add(1, Ordering::SeqCst);
    let delay = *state.refresh_delay.lock();
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }
    if state.fail_refresh.load(Ordering::SeqCst) || body != "r1" {
        return problem(StatusCode::UNAUTHORIZED, "Unauthorized", "Refresh token revoked");
    }
    if !state.keep_revoked.load(Ordering::SeqCst) {
        *state.valid_token.lock() = "xyz".to_string();
    }
    Json(auth_response("xyz", "r1")).into_response()
}

async fn list_posts(State(state): State<Arc<BackendState>>, headers: HeaderMap) -> Response {
    let delay = *state.posts_delay.lock();
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }
    if !authorized(&state, &headers) {
        return problem(StatusCode::UNAUTHORIZED, "Unauthorized", "Token expired");
    }
    Json(json!({
        "content": [
            {"id": 1, "title": "Hello", "authorUsername": "ada", "subredditId": 3, "score": 5}
        ],
        "pageNumber": 0,
        "pageSize": 20,
        "totalElements": 1,
        "totalPages": 1,
        "last": true
    }))
    .into_response()
}

async fn get_post(
    State(state): State<Arc<BackendState>>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Response {
    if !authorized(&state, &headers) {
        return problem(StatusCode::UNAUTHORIZED, "Unauthorized", "Token expired");
    }
    if id == 404 {
        return problem(StatusCode::NOT_FOUND, "Not Found", "Post 404 does not exist");
    }
    Json(json!({"id": id, "title": "Hello", "authorUsername": "ada", "subredditId": 3})).into_response()
}

async fn vote(
    State(state): State<Arc<BackendState>>,
    headers: HeaderMap,
    Path(id): Path<i64>,
    Json(body): Json<Value>,
) -> Response {
    if !authorized(&state, &headers) {
        return problem(StatusCode::UNAUTHORIZED, "Unauthorized", "Token expired");
    }
    let user_vote = body["voteType"].clone();
    *state.last_vote.lock() = Some(body);
    // Someone else upvoted in the meantime, so the score is higher than a
    // client-side delta would predict.
    Json(json!({"targetId": id, "targetType": "POST", "newScore": 11, "userVote": user_vote}))
        .into_response()
}

async fn list_subreddits(State(state): State<Arc<BackendState>>, headers: HeaderMap) -> Response {
    if !authorized(&state, &headers) {
        return problem(StatusCode::UNAUTHORIZED, "Unauthorized", "Token expired");
    }
    Json(json!({
        "content": [{"id": 3, "name": "rust", "memberCount": 1200}],
        "pageable": {"pageNumber": 0, "pageSize": 20},
        "totalElements": 1,
        "totalPages": 1
    }))
    .into_response()
}

async fn search(
    State(state): State<Arc<BackendState>>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    if !authorized(&state, &headers) {
        return problem(StatusCode::UNAUTHORIZED, "Unauthorized", "Token expired");
    }
    let q = params.get("q").cloned().unwrap_or_default();
    Json(json!({
        "posts": [{"id": 9, "title": q, "authorUsername": "ada", "subredditId": 3}],
        "subreddits": [],
        "users": []
    }))
    .into_response()
}

async fn remove_post(
    State(state): State<Arc<BackendState>>,
    headers: HeaderMap,
    Path(_id): Path<i64>,
) -> Response {
    if !authorized(&state, &headers) {
        return problem(StatusCode::UNAUTHORIZED, "Unauthorized", "Token expired");
    }
    problem(StatusCode::FORBIDDEN, "Forbidden", "Moderator role required")
}

// --- STOMP broker ---

async fn broker(ws: WebSocketUpgrade, State(state): State<Arc<BackendState>>) -> Response {
    ws.on_upgrade(move |socket| run_broker(socket, state))
}

async fn send_frame(socket: &mut WebSocket, frame: Frame) -> bool {
    socket.send(Message::Text(frame.encode().into())).await.is_ok()
}

/// Accepts `Bearer abc`, answers every SUBSCRIBE with one post update on
/// that destination, and closes on DISCONNECT.
async fn run_broker(mut socket: WebSocket, state: Arc<BackendState>) {
    while let Some(Ok(message)) = socket.recv().await {
        let Message::Text(text) = message else {
            continue;
        };
        let Ok(frames) = Frame::decode_all(text.as_str()) else {
            return;
        };
        for frame in frames {
            match frame.command {
                Command::Connect | Command::Stomp => {
                    if frame.get("Authorization") == Some("Bearer abc") {
                        send_frame(&mut socket, Frame::new(Command::Connected).header("version", "1.2")).await;
                    } else {
                        let error = Frame::new(Command::Error)
                            .header("message", "Invalid token")
                            .body("Authentication failed");
                        send_frame(&mut socket, error).await;
                        return;
                    }
                }
                Command::Subscribe => {
                    let destination = frame.get("destination").unwrap_or_default().to_string();
                    let id = frame.get("id").unwrap_or_default().to_string();
                    state.stomp_subscriptions.lock().push(destination.clone());
                    let body = r#"{"postId":1,"score":12,"commentCount":4,"upvotes":14,"downvotes":2,"viewCount":99}"#;
                    let message = Frame::new(Command::Message)
                        .header("destination", destination)
                        .header("subscription", id)
                        .header("message-id", "m-1")
                        .header("content-type", "application/json")
                        .body(body);
                    send_frame(&mut socket, message).await;
                }
                Command::Disconnect => return,
                _ => {}
            }
        }
    }
}
