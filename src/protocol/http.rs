//! HTTP/1.x request parsing on a live connection.
//!
//! Bytes are consumed one complete element at a time: first the header
//! block (kept in a pending slot once parsed), then `Content-Length` bytes
//! of body. Each complete request is routed and answered before the next
//! one is parsed, so pipelined responses leave in request order.

use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, warn};

use crate::config::ServerConfig;
use crate::connection::{ConnectionHandle, Consumed, Protocol};
use crate::http::request::find_head_end;
use crate::http::{HttpError, Method, Request, Response, StatusCode};
use crate::realtime::{WebSocketProtocol, handshake};
use crate::router::Dispatcher;

enum Outcome {
    Continue,
    Close,
    Switch(Box<dyn Protocol>),
}

/// The protocol every accepted connection starts with.
pub struct HttpProtocol {
    conn: ConnectionHandle,
    dispatcher: Arc<Dispatcher>,
    config: Arc<ServerConfig>,
    // A parsed header block and the body length it declared.
    pending: Option<(Request, usize)>,
}

impl HttpProtocol {
    pub fn new(conn: ConnectionHandle, dispatcher: Arc<Dispatcher>, config: Arc<ServerConfig>) -> Self {
        Self {
            conn,
            dispatcher,
            config,
            pending: None,
        }
    }

    fn too_large() -> HttpError {
        HttpError::new(StatusCode::PayloadTooLarge, "request too large")
    }

    fn send(&self, response: Response, head_only: bool) {
        let mut bytes = response.into_bytes();
        if head_only {
            if let Some(head_len) = find_head_end(&bytes) {
                bytes.truncate(head_len);
            }
        }
        self.conn.write(bytes);
    }

    // Answers `err`; fatal errors and `close` end the connection.
    fn reject(&self, err: &HttpError, close: bool) -> Outcome {
        let close = close || err.is_fatal();
        if err.is_fatal() {
            warn!(peer = ?self.conn.peer_addr(), error = %err, "request failed, closing");
        } else {
            debug!(peer = ?self.conn.peer_addr(), status = err.status(), error = %err, "bad request");
        }
        let mut response = self.dispatcher.error_for(err);
        if close {
            response.headers_mut().set("Connection", "close");
        }
        self.send(response, false);
        if close { Outcome::Close } else { Outcome::Continue }
    }

    fn handle(&self, mut request: Request, body: Bytes) -> Outcome {
        let keep_alive = request.is_keep_alive();
        if let Err(err) = request.attach_body(body) {
            return self.reject(&err, !keep_alive);
        }

        if handshake::is_upgrade(&request) {
            return match self.upgrade(&request) {
                Ok(next) => Outcome::Switch(next),
                Err(err) => self.reject(&err, !keep_alive),
            };
        }

        match self.dispatcher.try_route(&request) {
            Ok(mut response) => {
                debug!(
                    peer = ?self.conn.peer_addr(),
                    method = %request.method(),
                    path = request.path(),
                    status = response.status(),
                    "dispatched"
                );
                if !keep_alive {
                    response.headers_mut().set("Connection", "close");
                }
                self.send(response, *request.method() == Method::Head);
                if keep_alive { Outcome::Continue } else { Outcome::Close }
            }
            Err(err) => self.reject(&err, !keep_alive),
        }
    }

    fn upgrade(&self, request: &Request) -> Result<Box<dyn Protocol>, HttpError> {
        let key = handshake::validate(request)?;
        let handler = self.dispatcher.route_ws(request)?;

        self.conn.write(handshake::response(key).into_bytes());
        debug!(peer = ?self.conn.peer_addr(), path = request.path(), "websocket opened");

        let mut protocol =
            WebSocketProtocol::new(self.conn.clone(), handler, self.config.max_message_size);
        protocol.open();
        Ok(Box::new(protocol))
    }
}

impl Protocol for HttpProtocol {
    fn name(&self) -> &'static str {
        "http"
    }

    fn consume(&mut self, data: &[u8]) -> Consumed {
        let max = self.config.max_request_size;
        let mut used = 0;

        loop {
            let (request, body_len) = match self.pending.take() {
                Some(pending) => pending,
                None => {
                    let rest = &data[used..];
                    if rest.is_empty() {
                        return Consumed::partial(used);
                    }
                    let Some(head_len) = find_head_end(rest) else {
                        if rest.len() > max {
                            self.reject(&Self::too_large(), true);
                            return Consumed::close(data.len());
                        }
                        return Consumed::partial(used);
                    };
                    if head_len > max {
                        self.reject(&Self::too_large(), true);
                        return Consumed::close(data.len());
                    }

                    let head = &rest[..head_len];
                    used += head_len;

                    let request = match Request::parse_head(head, self.config.max_headers) {
                        Ok(request) => request,
                        Err(err) => match self.reject(&err, false) {
                            Outcome::Continue => continue,
                            _ => return Consumed::close(data.len()),
                        },
                    };

                    // Framing errors leave no way to find the next request.
                    let body_len = match request.body_length() {
                        Ok(len) if head_len.saturating_add(len) > max => {
                            self.reject(&Self::too_large(), true);
                            return Consumed::close(data.len());
                        }
                        Ok(len) => len,
                        Err(err) => {
                            self.reject(&err, true);
                            return Consumed::close(data.len());
                        }
                    };
                    (request, body_len)
                }
            };

            let rest = &data[used..];
            if rest.len() < body_len {
                self.pending = Some((request, body_len));
                return Consumed::partial(used);
            }
            let body = Bytes::copy_from_slice(&rest[..body_len]);
            used += body_len;

            match self.handle(request, body) {
                Outcome::Continue => {}
                Outcome::Close => return Consumed::close(data.len()),
                Outcome::Switch(next) => return Consumed::switch(used, next),
            }
        }
    }
}
