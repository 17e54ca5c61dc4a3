//! Client-facing transport: the WebSocket listener and its chunk adapters.

pub mod prefixed;
pub mod websocket;

pub use websocket::{start_listener, WebSocketConnection};
