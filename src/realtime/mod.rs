//! WebSocket support (RFC 6455).
//!
//! An HTTP request carrying `Upgrade: websocket` is validated by
//! [`handshake`], answered with `101 Switching Protocols`, and the connection
//! then switches to a [`WebSocketProtocol`] driving the application's
//! [`WebSocketHandler`].
//!
//! ## Keepalive
//!
//! [`WebSocket::set_auto_ping`] sends a ping every interval. A pong must
//! arrive within the timeout of each ping, otherwise the socket is closed
//! with code 1000 and reason `ping timeout`.

pub mod frame;
pub mod handshake;
mod protocol;
mod socket;

pub use frame::{CloseCode, FrameError, OpCode};
pub use protocol::WebSocketProtocol;
pub use socket::{MAX_CLOSE_REASON, Message, WebSocket, WebSocketError, WebSocketHandler};
