//! WebSocket framing state for one upgraded connection.

use std::panic::{self, AssertUnwindSafe};

use bytes::{Bytes, BytesMut};
use tokio::time::Instant;
use tracing::{debug, error};

use super::frame::{self, CloseCode, Frame, OpCode};
use super::socket::{Message, Tick, WebSocket, WebSocketHandler};
use crate::connection::{ConnectionHandle, Consumed, Protocol};

/// The [`Protocol`] a connection switches to after a successful upgrade.
pub struct WebSocketProtocol {
    ws: WebSocket,
    handler: Box<dyn WebSocketHandler>,
    fragments: BytesMut,
    // Opcode of the message being reassembled.
    fragment_opcode: Option<OpCode>,
    max_message_size: usize,
    close_notified: bool,
}

struct Violation {
    code: CloseCode,
    reason: String,
}

impl Violation {
    fn new(code: CloseCode, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }
}

impl WebSocketProtocol {
    pub fn new(
        conn: ConnectionHandle,
        handler: Box<dyn WebSocketHandler>,
        max_message_size: usize,
    ) -> Self {
        Self {
            ws: WebSocket::new(conn),
            handler,
            fragments: BytesMut::new(),
            fragment_opcode: None,
            max_message_size,
            close_notified: false,
        }
    }

    pub fn socket(&self) -> &WebSocket {
        &self.ws
    }

    /// Runs the handler's `on_open`.
    pub fn open(&mut self) {
        self.call(|handler, ws| handler.on_open(ws));
        self.after_callback();
    }

    // Runs one handler callback; a panic closes the socket with 1011.
    fn call(&mut self, f: impl FnOnce(&mut dyn WebSocketHandler, &WebSocket)) {
        let ws = &self.ws;
        let handler = self.handler.as_mut();
        if panic::catch_unwind(AssertUnwindSafe(|| f(handler, ws))).is_err() {
            error!(peer = ?ws.peer_addr(), "websocket handler panicked");
            let _ = ws.close(CloseCode::Internal, "internal error");
        }
    }

    // Delivers a pending local close to the handler. Returns `true` once
    // the socket is closing.
    fn after_callback(&mut self) -> bool {
        if !self.ws.is_closing() {
            return false;
        }
        if let Some((code, reason)) = self.ws.take_close_notice() {
            self.notify_close(code, &reason);
        }
        true
    }

    fn notify_close(&mut self, code: CloseCode, reason: &str) {
        if self.close_notified {
            return;
        }
        self.close_notified = true;
        self.call(|handler, ws| handler.on_close(ws, code, reason));
    }

    fn fail(&mut self, violation: Violation) {
        debug!(
            peer = ?self.ws.peer_addr(),
            code = %violation.code,
            reason = %violation.reason,
            "websocket protocol violation"
        );
        let _ = self.ws.close(violation.code, &violation.reason);
        self.after_callback();
    }

    fn on_frame(&mut self, frame: Frame) -> Result<(), Violation> {
        let Frame {
            fin,
            opcode,
            payload,
        } = frame;

        match opcode {
            OpCode::Text | OpCode::Binary if self.fragment_opcode.is_some() => Err(
                Violation::new(CloseCode::ProtocolError, "data frame inside a fragmented message"),
            ),
            OpCode::Text | OpCode::Binary if !fin => {
                self.check_size(payload.len())?;
                self.fragment_opcode = Some(opcode);
                self.fragments.extend_from_slice(&payload);
                Ok(())
            }
            OpCode::Text | OpCode::Binary => self.deliver(opcode, payload),
            OpCode::Continuation => {
                let Some(first) = self.fragment_opcode else {
                    return Err(Violation::new(
                        CloseCode::ProtocolError,
                        "continuation without a message in progress",
                    ));
                };
                self.check_size(payload.len())?;
                self.fragments.extend_from_slice(&payload);
                if fin {
                    self.fragment_opcode = None;
                    let message = self.fragments.split().freeze();
                    self.deliver(first, message)?;
                }
                Ok(())
            }
            OpCode::Close => {
                let (code, reason) = frame::parse_close_payload(&payload)
                    .map_err(|err| Violation::new(err.close_code(), err.to_string()))?;
                debug!(peer = ?self.ws.peer_addr(), %code, reason = %reason, "peer closed websocket");
                self.ws.echo_close(payload);
                self.notify_close(code, &reason);
                Ok(())
            }
            OpCode::Ping => {
                self.call(|handler, ws| handler.on_ping(ws, payload));
                Ok(())
            }
            OpCode::Pong => {
                self.ws.pong_received(Instant::now());
                self.call(|handler, ws| handler.on_pong(ws, payload));
                Ok(())
            }
        }
    }

    fn check_size(&self, incoming: usize) -> Result<(), Violation> {
        if self.fragments.len() + incoming > self.max_message_size {
            return Err(Violation::new(CloseCode::TooBig, "message too big"));
        }
        Ok(())
    }

    fn deliver(&mut self, opcode: OpCode, payload: Bytes) -> Result<(), Violation> {
        let message = if opcode == OpCode::Text {
            let text = String::from_utf8(payload.to_vec())
                .map_err(|_| Violation::new(CloseCode::InvalidPayload, "text is not UTF-8"))?;
            Message::Text(text)
        } else {
            Message::Binary(payload)
        };
        self.call(|handler, ws| handler.on_message(ws, message));
        Ok(())
    }
}

impl Protocol for WebSocketProtocol {
    fn name(&self) -> &'static str {
        "websocket"
    }

    fn consume(&mut self, data: &[u8]) -> Consumed {
        let mut used = 0;
        loop {
            if self.after_callback() {
                return Consumed::close(data.len());
            }
            match frame::decode(&data[used..], self.max_message_size) {
                Ok(None) => return Consumed::partial(used),
                Ok(Some((frame, len))) => {
                    used += len;
                    if let Err(violation) = self.on_frame(frame) {
                        self.fail(violation);
                    }
                }
                Err(err) => self.fail(Violation::new(err.close_code(), err.to_string())),
            }
        }
    }

    fn on_peer_closed(&mut self) {
        self.on_closed();
    }

    fn on_closed(&mut self) {
        let notice = self.ws.take_close_notice();
        let (code, reason) = notice.unwrap_or((CloseCode::Abnormal, String::new()));
        self.notify_close(code, &reason);
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.ws.keepalive_deadline()
    }

    fn on_timer(&mut self, now: Instant) {
        match self.ws.keepalive_tick(now) {
            Tick::Idle => {}
            Tick::Ping => {
                let _ = self.ws.ping(b"");
            }
            Tick::TimedOut => {
                debug!(peer = ?self.ws.peer_addr(), "websocket ping timeout");
                let _ = self.ws.close(CloseCode::Normal, "ping timeout");
            }
        }
        self.after_callback();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use super::*;
    use crate::connection::testing::MockSocket;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Event {
        Open,
        Message(Message),
        Pong(Bytes),
        Close(CloseCode, String),
    }

    #[derive(Clone, Default)]
    struct Log(Arc<Mutex<Vec<Event>>>);

    impl Log {
        fn events(&self) -> Vec<Event> {
            self.0.lock().unwrap().clone()
        }
    }

    struct Recorder {
        log: Log,
        reply: bool,
    }

    impl WebSocketHandler for Recorder {
        fn on_open(&mut self, _ws: &WebSocket) {
            self.log.0.lock().unwrap().push(Event::Open);
        }

        fn on_message(&mut self, ws: &WebSocket, message: Message) {
            if self.reply {
                if let Message::Text(text) = &message {
                    ws.text(text).unwrap();
                }
            }
            self.log.0.lock().unwrap().push(Event::Message(message));
        }

        fn on_pong(&mut self, _ws: &WebSocket, payload: Bytes) {
            self.log.0.lock().unwrap().push(Event::Pong(payload));
        }

        fn on_close(&mut self, _ws: &WebSocket, code: CloseCode, reason: &str) {
            self.log
                .0
                .lock()
                .unwrap()
                .push(Event::Close(code, reason.to_owned()));
        }
    }

    const KEY: [u8; 4] = [1, 2, 3, 4];

    fn client(opcode: OpCode, payload: &[u8], fin: bool) -> Vec<u8> {
        frame::encode_masked(opcode, payload, fin, KEY).to_vec()
    }

    fn setup(reply: bool) -> (Arc<MockSocket>, WebSocketProtocol, Log) {
        let mock = MockSocket::new();
        let log = Log::default();
        let handler = Recorder {
            log: log.clone(),
            reply,
        };
        let mut protocol =
            WebSocketProtocol::new(ConnectionHandle::new(mock.clone(), None), Box::new(handler), 1024);
        protocol.open();
        (mock, protocol, log)
    }

    #[test]
    fn text_round_trip() {
        let (mock, mut protocol, log) = setup(true);
        let input = client(OpCode::Text, b"hello", true);
        let consumed = protocol.consume(&input);
        assert_eq!(consumed.bytes, input.len());
        assert!(consumed.next.is_none());
        assert_eq!(
            log.events(),
            vec![Event::Open, Event::Message(Message::Text("hello".into()))]
        );

        let written = mock.take_written();
        let echoed = client(OpCode::Text, &written[2..], true);
        let (frame, _) = frame::decode(&echoed, 1024).unwrap().unwrap();
        assert!(frame.fin);
        assert_eq!(frame.opcode, OpCode::Text);
        assert_eq!(frame.payload.as_ref(), b"hello");
    }

    #[test]
    fn fragments_are_reassembled() {
        let (_, mut protocol, log) = setup(false);
        let mut input = client(OpCode::Text, b"ab", false);
        input.extend(client(OpCode::Ping, b"", true));
        input.extend(client(OpCode::Continuation, b"cd", true));

        let consumed = protocol.consume(&input);
        assert_eq!(consumed.bytes, input.len());
        assert_eq!(
            log.events(),
            vec![Event::Open, Event::Message(Message::Text("abcd".into()))]
        );
        assert!(protocol.fragments.is_empty());
        assert!(protocol.fragment_opcode.is_none());
    }

    #[test]
    fn partial_frame_waits() {
        let (_, mut protocol, log) = setup(false);
        let input = client(OpCode::Binary, b"payload", true);
        let consumed = protocol.consume(&input[..input.len() - 1]);
        assert_eq!(consumed.bytes, 0);
        assert_eq!(log.events(), vec![Event::Open]);
    }

    #[test]
    fn ping_is_answered_with_pong() {
        let (mock, mut protocol, _) = setup(false);
        protocol.consume(&client(OpCode::Ping, b"hi", true));
        assert_eq!(mock.take_written(), b"\x8a\x02hi");
    }

    #[test]
    fn peer_close_is_echoed_and_reported_once() {
        let (mock, mut protocol, log) = setup(false);
        let payload = frame::close_payload(CloseCode::Normal, "done");
        let mut input = client(OpCode::Close, &payload, true);
        input.extend(client(OpCode::Text, b"ignored", true));

        let consumed = protocol.consume(&input);
        assert!(matches!(consumed.next, Some(crate::connection::Transition::Close)));
        assert_eq!(mock.take_written(), [&b"\x88\x06"[..], &payload[..]].concat());

        protocol.on_closed();
        assert_eq!(
            log.events(),
            vec![Event::Open, Event::Close(CloseCode::Normal, "done".into())]
        );
    }

    #[test]
    fn unmasked_frame_closes_with_protocol_error() {
        let (mock, mut protocol, log) = setup(false);
        let consumed = protocol.consume(&frame::encode(OpCode::Text, b"x", true));
        assert!(matches!(consumed.next, Some(crate::connection::Transition::Close)));
        let written = mock.take_written();
        assert_eq!(&written[..4], b"\x88\x1c\x03\xea");
        assert!(matches!(
            log.events().last(),
            Some(Event::Close(CloseCode::ProtocolError, _))
        ));
    }

    #[test]
    fn invalid_utf8_closes_with_1007() {
        let (_, mut protocol, log) = setup(false);
        protocol.consume(&client(OpCode::Text, &[0xff, 0xfe], true));
        assert!(matches!(
            log.events().last(),
            Some(Event::Close(CloseCode::InvalidPayload, _))
        ));
    }

    #[test]
    fn stray_continuation_is_a_protocol_error() {
        let (_, mut protocol, log) = setup(false);
        protocol.consume(&client(OpCode::Continuation, b"x", true));
        assert!(matches!(
            log.events().last(),
            Some(Event::Close(CloseCode::ProtocolError, _))
        ));
    }

    #[test]
    fn oversized_message_closes_with_1009() {
        let (_, mut protocol, log) = setup(false);
        let mut input = client(OpCode::Binary, &[0; 600], false);
        input.extend(client(OpCode::Continuation, &[0; 600], true));
        protocol.consume(&input);
        assert!(matches!(
            log.events().last(),
            Some(Event::Close(CloseCode::TooBig, _))
        ));
    }

    #[test]
    fn hangup_reports_abnormal_close_once() {
        let (_, mut protocol, log) = setup(false);
        protocol.on_peer_closed();
        protocol.on_closed();
        assert_eq!(
            log.events(),
            vec![Event::Open, Event::Close(CloseCode::Abnormal, String::new())]
        );
    }

    #[test]
    fn missing_pong_closes_with_ping_timeout() {
        let (mock, mut protocol, log) = setup(false);
        protocol
            .socket()
            .set_auto_ping(Duration::from_secs(5), Duration::from_secs(2))
            .unwrap();

        let ping_at = protocol.next_deadline().unwrap();
        protocol.on_timer(ping_at);
        assert_eq!(mock.take_written(), b"\x89\x00");

        let timeout_at = protocol.next_deadline().unwrap();
        assert_eq!(timeout_at, ping_at + Duration::from_secs(2));
        protocol.on_timer(timeout_at);

        let written = mock.take_written();
        assert_eq!(written, [&b"\x88\x0e\x03\xe8"[..], b"ping timeout"].concat());
        assert!(protocol.socket().connection().is_closed());
        assert_eq!(
            log.events().last(),
            Some(&Event::Close(CloseCode::Normal, "ping timeout".into()))
        );
        assert_eq!(protocol.next_deadline(), None);
    }

    #[test]
    fn pong_before_timeout_keeps_connection_open() {
        let (mock, mut protocol, log) = setup(false);
        protocol
            .socket()
            .set_auto_ping(Duration::from_secs(5), Duration::from_secs(2))
            .unwrap();

        let ping_at = protocol.next_deadline().unwrap();
        protocol.on_timer(ping_at);
        mock.take_written();

        protocol.consume(&client(OpCode::Pong, b"", true));
        assert_eq!(protocol.next_deadline(), Some(ping_at + Duration::from_secs(5)));

        protocol.on_timer(ping_at + Duration::from_secs(2));
        assert!(mock.take_written().is_empty());
        assert!(protocol.socket().is_open());
        assert_eq!(log.events().last(), Some(&Event::Pong(Bytes::new())));
    }

    #[test]
    fn panicking_handler_closes_with_internal_error() {
        struct Panics;
        impl WebSocketHandler for Panics {
            fn on_message(&mut self, _ws: &WebSocket, _message: Message) {
                panic!("boom");
            }
        }

        let mock = MockSocket::new();
        let mut protocol =
            WebSocketProtocol::new(ConnectionHandle::new(mock.clone(), None), Box::new(Panics), 1024);
        let consumed = protocol.consume(&client(OpCode::Text, b"x", true));
        assert!(consumed.next.is_some());
        assert_eq!(&mock.take_written()[..4], b"\x88\x10\x03\xf3");
    }
}
