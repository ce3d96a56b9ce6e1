//! # Linkboard Client
//!
//! The client core for the Linkboard link-aggregation platform. It consumes
//! the platform's HTTP API and its STOMP-over-WebSocket broker, and leaves
//! rendering and persistence to the application embedding it.
//!
//! ## Core Features
//!
//! - **`TokenCoordinator`**: Attaches bearer tokens and turns concurrent 401s into a single refresh call.
//! - **`ApiClient`**: Typed operations for posts, comments, subreddits, votes, search and moderation.
//! - **`RealtimeManager`**: Keeps one broker connection alive with linear backoff and routes messages by topic.
//! - **Pluggable transport**: Implement `Connector` to drive the manager over any broker link.
//! - **WebSocket transport (default feature)**: `StompConnector`, built on `tokio-tungstenite`.
//!
//! ## Getting Started
//!
//! ```no_run
//! use linkboard_client::prelude::*;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ClientConfig::load()?;
//! let coordinator = TokenCoordinator::new(&config)?;
//! coordinator.login(&Credentials::new("ada", "secret")).await?;
//!
//! let api = ApiClient::new(coordinator.clone());
//! let front_page = api.list_posts(None, &PageRequest::default()).await?;
//!
//! let realtime = RealtimeManager::over_websocket(&config.realtime, coordinator.session());
//! realtime.follow_session();
//! realtime.connect().await?;
//! # let _ = front_page;
//! # Ok(())
//! # }
//! ```
//!
//! ---

pub mod api;
pub mod auth;
pub mod config;
pub mod error;
pub mod realtime;
pub mod serde_ext;

/// Public prelude for convenience.
///
/// `use linkboard_client::prelude::*;`
pub mod prelude {
    pub use crate::api::{
        client::ApiClient,
        models::{NewComment, NewPost, TargetType, VoteType},
        pagination::{Page, PageRequest, SortDirection},
        request::ApiRequest,
        votes::VoteState,
    };

    pub use crate::auth::{
        coordinator::TokenCoordinator,
        session::{Session, SessionEvent, SessionReader, SessionStore},
        types::{Credentials, Registration},
    };

    pub use crate::config::ClientConfig;
    pub use crate::error::{ApiError, ClientError, ErrorKind, RealtimeError};

    pub use crate::realtime::{
        connector::Connector,
        handler::TopicHandler,
        manager::RealtimeManager,
        messages::RealtimeEvent,
        types::{ConnectionState, ReconnectPolicy},
    };

    #[cfg(feature = "websocket")]
    pub use crate::realtime::websocket::StompConnector;
}
