//! The realtime side of the client: one broker connection, many topics.

pub mod connector;
pub mod handler;
pub mod manager;
pub mod messages;
pub mod stomp;
pub mod topics;
pub mod types;
#[cfg(feature = "websocket")]
pub mod websocket;
