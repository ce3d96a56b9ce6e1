//! The REST side of the client.

pub mod client;
pub mod models;
pub mod pagination;
pub mod request;
pub mod votes;
