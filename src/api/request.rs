//! A replayable description of an HTTP request.
//!
//! `reqwest::Request` bodies cannot always be cloned, and a request that hits
//! a 401 has to be sent again with a new bearer token. `ApiRequest` keeps the
//! parts needed to rebuild it as often as necessary.

use reqwest::Method;
use serde::Serialize;

/// Paths that never carry a bearer token and never trigger a refresh.
pub const PUBLIC_PATHS: [&str; 3] = ["/auth/login", "/auth/register", "/auth/refresh"];

#[derive(Debug, Clone, PartialEq)]
pub enum RequestBody {
    Empty,
    Json(serde_json::Value),
    /// Sent as `text/plain`.
    Text(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ApiRequest {
    pub(crate) method: Method,
    pub(crate) path: String,
    pub(crate) query: Vec<(String, String)>,
    pub(crate) body: RequestBody,
}

impl ApiRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            body: RequestBody::Empty,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    pub fn put(path: impl Into<String>) -> Self {
        Self::new(Method::PUT, path)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, path)
    }

    #[must_use]
    pub fn query(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.query.push((key.into(), value.to_string()));
        self
    }

    /// Attach a JSON body.
    ///
    /// # Errors
    ///
    /// Returns the serialization error if `body` cannot be represented as JSON.
    pub fn json<T: Serialize + ?Sized>(mut self, body: &T) -> Result<Self, serde_json::Error> {
        self.body = RequestBody::Json(serde_json::to_value(body)?);
        Ok(self)
    }

    #[must_use]
    pub fn text(mut self, body: impl Into<String>) -> Self {
        self.body = RequestBody::Text(body.into());
        self
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn query_pairs(&self) -> &[(String, String)] {
        &self.query
    }

    pub fn body(&self) -> &RequestBody {
        &self.body
    }

    /// Whether the request must carry the session's bearer token.
    pub fn requires_auth(&self) -> bool {
        let path = self.path.split('?').next().unwrap_or_default();
        let path = path.trim_matches('/');
        !PUBLIC_PATHS
            .iter()
            .any(|public| path == public.trim_start_matches('/'))
    }
}
