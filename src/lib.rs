//! # wirecore
//!
//! An embeddable, event-driven HTTP/1.1 and WebSocket server core.
//!
//! Each accepted socket is a [`Connection`](connection::Connection) whose
//! active [`Protocol`](connection::Protocol) consumes buffered bytes and may
//! switch to another protocol (HTTP to WebSocket) without closing the
//! socket. Requests are routed by a shared [`Dispatcher`](router::Dispatcher)
//! using regex path patterns.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use wirecore::http::{Response, StatusCode};
//! use wirecore::realtime::{Message, WebSocket, WebSocketHandler};
//! use wirecore::router::Dispatcher;
//! use wirecore::server::Server;
//!
//! struct Echo;
//!
//! impl WebSocketHandler for Echo {
//!     fn on_message(&mut self, ws: &WebSocket, message: Message) {
//!         if let Message::Text(text) = message {
//!             let _ = ws.text(&text);
//!         }
//!     }
//! }
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let dispatcher = Arc::new(Dispatcher::new());
//!     dispatcher.get(r"/hello/(\w+)", |_req, caps| {
//!         let name = caps.get(0).unwrap_or("world");
//!         Ok(Some(Response::new(StatusCode::Ok).body(format!("Hello, {name}!"))))
//!     })?;
//!     dispatcher.websocket("/echo", |_req, _caps| Some(Box::new(Echo)))?;
//!
//!     let mut server = Server::new(dispatcher);
//!     server.bind("127.0.0.1:8080").await?;
//!     server.run().await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod connection;
pub mod http;
pub mod protocol;
pub mod realtime;
pub mod router;
pub mod server;

pub use config::ServerConfig;
pub use http::{Headers, HttpError, Method, Request, Response, StatusCode};
pub use router::{Dispatcher, Route, WsRoute};
pub use server::{Server, ServerError};
