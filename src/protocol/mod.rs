//! Protocols a connection can speak.
//!
//! Every connection starts with [`HttpProtocol`]; a successful WebSocket
//! upgrade switches it to [`WebSocketProtocol`](crate::realtime::WebSocketProtocol).

mod http;

pub use http::HttpProtocol;
