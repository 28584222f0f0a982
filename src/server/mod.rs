//! HTTP server and socket entry point

pub mod http;
pub mod websocket;

pub use http::{run, AppState};
pub use websocket::WsSocket;
