//! Axum server exposing the broadcast layer to websocket subscribers.

pub mod websocket;

pub use websocket::{router, serve, ServerState};
