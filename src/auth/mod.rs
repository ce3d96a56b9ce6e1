//! Session ownership and token refresh.
//!
//! [`TokenCoordinator`](coordinator::TokenCoordinator) is the only writer of
//! the [`Session`](session::Session). Everything else reads it through a
//! [`SessionReader`](session::SessionReader).

pub mod coordinator;
pub mod gate;
pub mod session;
pub mod types;
