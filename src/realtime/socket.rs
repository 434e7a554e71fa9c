//! The application-facing WebSocket handle.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use tokio::time::Instant;
use tracing::debug;

use super::frame::{self, CloseCode, MAX_CONTROL_PAYLOAD, OpCode};
use crate::connection::ConnectionHandle;

/// Longest close reason that fits a control frame next to the 2-byte code.
pub const MAX_CLOSE_REASON: usize = MAX_CONTROL_PAYLOAD - 2;

/// Misuse of a [`WebSocket`].
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum WebSocketError {
    #[error("control frame payload of {0} bytes exceeds 125")]
    ControlPayloadTooLong(usize),

    #[error("close reason of {0} bytes exceeds 123")]
    ReasonTooLong(usize),

    #[error("keepalive interval must be non-zero")]
    ZeroInterval,

    #[error("websocket is closing")]
    Closed,
}

/// A complete (reassembled) data message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Text(String),
    Binary(Bytes),
}

/// Application callbacks for one WebSocket connection.
///
/// Callbacks run on the connection's task and must not block. The
/// [`WebSocket`] argument may be cloned and kept to send later from
/// anywhere.
pub trait WebSocketHandler: Send {
    fn on_open(&mut self, _ws: &WebSocket) {}

    fn on_message(&mut self, ws: &WebSocket, message: Message);

    /// Answers with a pong carrying the same payload unless overridden.
    fn on_ping(&mut self, ws: &WebSocket, payload: Bytes) {
        let _ = ws.pong(&payload);
    }

    fn on_pong(&mut self, _ws: &WebSocket, _payload: Bytes) {}

    /// Called exactly once, whichever side closed. A peer that vanished
    /// without a close frame reports [`CloseCode::Abnormal`].
    fn on_close(&mut self, _ws: &WebSocket, _code: CloseCode, _reason: &str) {}
}

struct Keepalive {
    interval: Duration,
    timeout: Duration,
    next_ping: Instant,
    pong_deadline: Option<Instant>,
    last_ping: Option<Instant>,
    last_pong: Option<Instant>,
}

#[derive(Default)]
struct Session {
    keepalive: Option<Keepalive>,
    closing: bool,
    // Set by a local close, taken once by the protocol for `on_close`.
    close_notice: Option<(CloseCode, String)>,
}

/// What a keepalive timer expiry asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Tick {
    Idle,
    Ping,
    TimedOut,
}

/// A cloneable handle to one WebSocket connection.
#[derive(Clone)]
pub struct WebSocket {
    conn: ConnectionHandle,
    session: Arc<Mutex<Session>>,
}

impl WebSocket {
    pub(crate) fn new(conn: ConnectionHandle) -> Self {
        Self {
            conn,
            session: Arc::new(Mutex::new(Session::default())),
        }
    }

    fn session(&self) -> MutexGuard<'_, Session> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.conn.peer_addr()
    }

    pub fn connection(&self) -> &ConnectionHandle {
        &self.conn
    }

    /// `false` once either side started closing.
    pub fn is_open(&self) -> bool {
        !self.is_closing() && !self.conn.is_closed()
    }

    pub(crate) fn is_closing(&self) -> bool {
        self.session().closing
    }

    /// Sends one frame.
    pub fn send(&self, opcode: OpCode, payload: &[u8], fin: bool) -> Result<(), WebSocketError> {
        self.check_send(opcode, payload)?;
        self.conn.write(frame::encode(opcode, payload, fin));
        Ok(())
    }

    /// Like [`send`](Self::send), then runs `on_sent` once the frame is
    /// fully handed to the OS.
    pub fn send_then(
        &self,
        opcode: OpCode,
        payload: &[u8],
        fin: bool,
        on_sent: impl FnOnce() + Send + 'static,
    ) -> Result<(), WebSocketError> {
        self.check_send(opcode, payload)?;
        self.conn
            .write_then(frame::encode(opcode, payload, fin), on_sent);
        Ok(())
    }

    fn check_send(&self, opcode: OpCode, payload: &[u8]) -> Result<(), WebSocketError> {
        if opcode.is_control() && payload.len() > MAX_CONTROL_PAYLOAD {
            return Err(WebSocketError::ControlPayloadTooLong(payload.len()));
        }
        if self.is_closing() {
            return Err(WebSocketError::Closed);
        }
        Ok(())
    }

    pub fn text(&self, text: &str) -> Result<(), WebSocketError> {
        self.send(OpCode::Text, text.as_bytes(), true)
    }

    pub fn binary(&self, data: &[u8]) -> Result<(), WebSocketError> {
        self.send(OpCode::Binary, data, true)
    }

    pub fn ping(&self, payload: &[u8]) -> Result<(), WebSocketError> {
        self.send(OpCode::Ping, payload, true)
    }

    pub fn pong(&self, payload: &[u8]) -> Result<(), WebSocketError> {
        self.send(OpCode::Pong, payload, true)
    }

    /// Starts the closing handshake: stops keepalive, sends a close frame
    /// carrying `code` and `reason`, and closes the connection once that
    /// frame is out. The handler's `on_close` sees the same code and reason.
    ///
    /// Closing an already-closing socket does nothing.
    pub fn close(&self, code: CloseCode, reason: &str) -> Result<(), WebSocketError> {
        if reason.len() > MAX_CLOSE_REASON {
            return Err(WebSocketError::ReasonTooLong(reason.len()));
        }
        {
            let mut session = self.session();
            if session.closing {
                return Ok(());
            }
            session.closing = true;
            session.keepalive = None;
            session.close_notice = Some((code, reason.to_owned()));
        }
        debug!(peer = ?self.peer_addr(), %code, reason, "closing websocket");
        self.send_close_frame(frame::close_payload(code, reason).freeze());
        Ok(())
    }

    /// Answers a peer's close frame by echoing its payload.
    pub(crate) fn echo_close(&self, payload: Bytes) {
        {
            let mut session = self.session();
            if session.closing {
                return;
            }
            session.closing = true;
            session.keepalive = None;
        }
        self.send_close_frame(payload);
    }

    fn send_close_frame(&self, payload: Bytes) {
        let conn = self.conn.clone();
        self.conn
            .write_then(frame::encode(OpCode::Close, &payload, true), move || conn.close());
        self.conn.wake();
    }

    /// Sends a ping every `interval`; if no pong arrives within `timeout` of
    /// a ping, closes with [`CloseCode::Normal`] and reason `ping timeout`.
    /// Replaces any earlier keepalive.
    pub fn set_auto_ping(&self, interval: Duration, timeout: Duration) -> Result<(), WebSocketError> {
        if interval.is_zero() {
            return Err(WebSocketError::ZeroInterval);
        }
        {
            let mut session = self.session();
            if session.closing {
                return Err(WebSocketError::Closed);
            }
            session.keepalive = Some(Keepalive {
                interval,
                timeout,
                next_ping: Instant::now() + interval,
                pong_deadline: None,
                last_ping: None,
                last_pong: None,
            });
        }
        self.conn.wake();
        Ok(())
    }

    /// Stops keepalive pings.
    pub fn cancel_auto_ping(&self) {
        self.session().keepalive = None;
    }

    /// When the last keepalive ping and pong happened.
    pub fn keepalive_stats(&self) -> Option<(Option<Instant>, Option<Instant>)> {
        self.session()
            .keepalive
            .as_ref()
            .map(|k| (k.last_ping, k.last_pong))
    }

    pub(crate) fn keepalive_deadline(&self) -> Option<Instant> {
        let session = self.session();
        let keepalive = session.keepalive.as_ref()?;
        Some(match keepalive.pong_deadline {
            Some(deadline) => deadline.min(keepalive.next_ping),
            None => keepalive.next_ping,
        })
    }

    /// Advances keepalive state to `now`. Arms the pong deadline when a ping
    /// is due; the caller sends the ping.
    pub(crate) fn keepalive_tick(&self, now: Instant) -> Tick {
        let mut session = self.session();
        let Some(keepalive) = session.keepalive.as_mut() else {
            return Tick::Idle;
        };
        if keepalive.pong_deadline.is_some_and(|deadline| deadline <= now) {
            return Tick::TimedOut;
        }
        if keepalive.next_ping <= now {
            keepalive.last_ping = Some(now);
            keepalive.pong_deadline = Some(now + keepalive.timeout);
            keepalive.next_ping = now + keepalive.interval;
            return Tick::Ping;
        }
        Tick::Idle
    }

    pub(crate) fn pong_received(&self, now: Instant) {
        if let Some(keepalive) = self.session().keepalive.as_mut() {
            keepalive.pong_deadline = None;
            keepalive.last_pong = Some(now);
        }
    }

    /// Marks the socket closed for good and returns the notice left by a
    /// local [`close`](Self::close), if any.
    pub(crate) fn take_close_notice(&self) -> Option<(CloseCode, String)> {
        let mut session = self.session();
        session.closing = true;
        session.keepalive = None;
        session.close_notice.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::testing::MockSocket;

    fn socket() -> (Arc<MockSocket>, WebSocket) {
        let mock = MockSocket::new();
        let ws = WebSocket::new(ConnectionHandle::new(mock.clone(), None));
        (mock, ws)
    }

    #[test]
    fn text_is_one_unmasked_final_frame() {
        let (mock, ws) = socket();
        ws.text("hello").unwrap();
        assert_eq!(mock.take_written(), b"\x81\x05hello");
    }

    #[test]
    fn control_payload_limit() {
        let (_, ws) = socket();
        assert_eq!(
            ws.ping(&[0; 126]),
            Err(WebSocketError::ControlPayloadTooLong(126))
        );
        assert!(ws.ping(&[0; 125]).is_ok());
        assert!(ws.close(CloseCode::Normal, &"x".repeat(124)).is_err());
    }

    #[test]
    fn close_sends_frame_then_closes_connection() {
        let (mock, ws) = socket();
        ws.close(CloseCode::GoingAway, "bye").unwrap();
        assert_eq!(mock.take_written(), b"\x88\x05\x03\xe9bye");
        assert!(ws.connection().is_closed());
        assert!(!ws.is_open());
        assert_eq!(ws.text("late"), Err(WebSocketError::Closed));
        assert_eq!(
            ws.take_close_notice(),
            Some((CloseCode::GoingAway, "bye".to_owned()))
        );
    }

    #[test]
    fn keepalive_pings_then_times_out() {
        let (_, ws) = socket();
        ws.set_auto_ping(Duration::from_secs(10), Duration::from_secs(3))
            .unwrap();
        let first = ws.keepalive_deadline().unwrap();

        assert_eq!(ws.keepalive_tick(first - Duration::from_secs(1)), Tick::Idle);
        assert_eq!(ws.keepalive_tick(first), Tick::Ping);
        assert_eq!(ws.keepalive_deadline(), Some(first + Duration::from_secs(3)));
        assert_eq!(
            ws.keepalive_tick(first + Duration::from_secs(3)),
            Tick::TimedOut
        );
    }

    #[test]
    fn pong_disarms_timeout() {
        let (_, ws) = socket();
        ws.set_auto_ping(Duration::from_secs(10), Duration::from_secs(3))
            .unwrap();
        let first = ws.keepalive_deadline().unwrap();
        assert_eq!(ws.keepalive_tick(first), Tick::Ping);

        ws.pong_received(first + Duration::from_secs(1));
        assert_eq!(ws.keepalive_deadline(), Some(first + Duration::from_secs(10)));
        assert_eq!(ws.keepalive_tick(first + Duration::from_secs(3)), Tick::Idle);
        let (last_ping, last_pong) = ws.keepalive_stats().unwrap();
        assert_eq!(last_ping, Some(first));
        assert_eq!(last_pong, Some(first + Duration::from_secs(1)));
    }

    #[test]
    fn zero_interval_is_rejected() {
        let (_, ws) = socket();
        assert_eq!(
            ws.set_auto_ping(Duration::ZERO, Duration::from_secs(1)),
            Err(WebSocketError::ZeroInterval)
        );
    }
}
