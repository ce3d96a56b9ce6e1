//! Error types shared by the HTTP and realtime halves of the client.
//!
//! Every failed operation produces exactly one structured value. HTTP failures
//! carry the server's problem document ([`ApiError`]) so a presentation layer
//! can render status, title, detail and field errors without re-parsing.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crate::serde_ext;

/// Coarse classification of a failure, keyed by HTTP status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Validation,
    Authentication,
    Forbidden,
    NotFound,
    Duplicate,
    ContentModeration,
    RateLimited,
    Internal,
    ServiceUnavailable,
    /// Transport-level failure with no HTTP status.
    Network,
    Other,
}

impl ErrorKind {
    pub fn from_status(status: u16) -> Self {
        match status {
            400 => ErrorKind::Validation,
            401 => ErrorKind::Authentication,
            403 => ErrorKind::Forbidden,
            404 => ErrorKind::NotFound,
            409 => ErrorKind::Duplicate,
            422 => ErrorKind::ContentModeration,
            429 => ErrorKind::RateLimited,
            500 => ErrorKind::Internal,
            503 => ErrorKind::ServiceUnavailable,
            _ => ErrorKind::Other,
        }
    }
}

/// The platform's RFC-7807 style problem document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[serde(rename_all = "camelCase")]
#[error("{title} ({status})")]
pub struct ApiError {
    #[serde(rename = "type", default = "default_problem_type")]
    pub problem_type: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub status: u16,
    #[serde(default)]
    pub detail: Option<String>,
    #[serde(default)]
    pub instance: Option<String>,
    #[serde(default, with = "serde_ext::lenient_datetime")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub field_errors: Option<BTreeMap<String, String>>,
    #[serde(default)]
    pub violation_categories: Option<Vec<String>>,
}

fn default_problem_type() -> String {
    "about:blank".to_string()
}

impl ApiError {
    /// Builds a problem document for a response whose body was not one.
    pub fn synthetic(status: u16, detail: Option<String>) -> Self {
        let title = reqwest::StatusCode::from_u16(status)
            .ok()
            .and_then(|s| s.canonical_reason())
            .unwrap_or("Unexpected response")
            .to_string();
        Self {
            problem_type: default_problem_type(),
            title,
            status,
            detail: detail.filter(|d| !d.trim().is_empty()),
            instance: None,
            timestamp: None,
            field_errors: None,
            violation_categories: None,
        }
    }

    /// Reads the body of a failed response into a problem document.
    ///
    /// Bodies that are not problem JSON are kept verbatim as `detail`.
    pub async fn from_response(response: reqwest::Response) -> Self {
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        Self::from_body(status, &body)
    }

    pub fn from_body(status: u16, body: &str) -> Self {
        match serde_json::from_str::<ApiError>(body) {
            Ok(mut problem) => {
                if problem.status == 0 {
                    problem.status = status;
                }
                problem
            }
            Err(_) => Self::synthetic(status, Some(body.to_string())),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        ErrorKind::from_status(self.status)
    }

    /// Message for a single form field, if the server reported one.
    pub fn field_error(&self, field: &str) -> Option<&str> {
        self.field_errors
            .as_ref()
            .and_then(|errors| errors.get(field))
            .map(String::as_str)
    }
}

/// Why a token refresh did not produce a new session.
#[derive(Debug, thiserror::Error)]
pub enum RefreshError {
    #[error("no refresh token is available")]
    MissingRefreshToken,
    #[error("refresh rejected by server: {0}")]
    Rejected(ApiError),
    #[error("refresh request failed: {0}")]
    Network(#[from] reqwest::Error),
    #[error("refresh response could not be decoded: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("invalid refresh URL: {0}")]
    Url(#[from] url::ParseError),
    #[error("refresh timed out after {0:?}")]
    TimedOut(Duration),
    #[error("refresh task ended before producing a result")]
    Aborted,
}

/// Errors returned by HTTP operations.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ClientError {
    #[error("API error: {0}")]
    Api(#[from] ApiError),
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    /// The request hit a 401 and the session could not be refreshed. The
    /// session has been cleared.
    #[error("session expired ({original}): {reason}")]
    SessionExpired {
        original: ApiError,
        reason: Arc<RefreshError>,
    },
    #[error("token refresh failed: {0}")]
    Refresh(Arc<RefreshError>),
    #[error("failed to decode response: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("invalid URL: {0}")]
    Url(#[from] url::ParseError),
}

impl ClientError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ClientError::Api(problem) => problem.kind(),
            ClientError::SessionExpired { .. } | ClientError::Refresh(_) => {
                ErrorKind::Authentication
            }
            ClientError::Network(_) => ErrorKind::Network,
            ClientError::Decode(_) | ClientError::Url(_) => ErrorKind::Other,
        }
    }

    /// The problem document behind this error, when there is one.
    pub fn api_error(&self) -> Option<&ApiError> {
        match self {
            ClientError::Api(problem) => Some(problem),
            ClientError::SessionExpired { original, .. } => Some(original),
            _ => None,
        }
    }
}

/// Failure reported by a broker transport.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// The broker refused the credential. Retrying with the same token is pointless.
    #[error("broker rejected credentials: {0}")]
    Unauthorized(String),
    #[error("transport failure: {0}")]
    Io(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("connection closed")]
    Closed,
}

impl TransportError {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, TransportError::Unauthorized(_))
    }
}

/// Errors returned by [`RealtimeManager`](crate::realtime::manager::RealtimeManager) operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RealtimeError {
    #[error("no access token available; sign in before connecting")]
    MissingCredentials,
    #[error("handshake failed: {0}")]
    Handshake(#[from] TransportError),
    /// The attempt was overtaken by a disconnect or a newer attempt.
    #[error("connection attempt was superseded")]
    Superseded,
}
