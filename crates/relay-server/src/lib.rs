//! HTTP/WebSocket surface for the relay engine: start, inspect and cancel
//! runs over REST; receive a user's ordered event stream over WebSocket.

pub mod channel;
pub mod handlers;
pub mod server;

pub use channel::{ConnectionId, ConnectionRegistry};
pub use server::{build_router, start, AppState, ServerConfig, ServerHandle};
