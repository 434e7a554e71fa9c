//! Per-connection I/O state machine.
//!
//! A [`Connection`] owns one accepted socket, an inbound byte buffer and the
//! active [`Protocol`]. The tokio readiness loop in [`Connection::run`] plays
//! the reactor callback: it waits for read readiness (plus write readiness
//! while transmit jobs are queued), for a wakeup from a
//! [`ConnectionHandle`], or for the protocol's next timer deadline, then
//! feeds the event to the state machine.
//!
//! ```text
//!  readable ──► read chunks ──► inbound buffer ──► protocol.consume()
//!                                                     │
//!                       ┌─────────────────────────────┼──────────────┐
//!                       ▼                             ▼              ▼
//!                 wait for more            Switch(next protocol)   Close
//!                                                                 (drain, then close)
//!  writable ──► ConnectionHandle::flush() (FIFO transmit jobs)
//! ```

use std::io;
use std::sync::Arc;

use bytes::{Buf, BytesMut};
use tokio::io::Interest;
use tokio::net::TcpStream;
use tokio::time::{Instant, sleep_until};
use tracing::{debug, warn};

mod handle;

pub use handle::{ConnectionHandle, OnSent, Socket};

/// A protocol parser driven by a connection.
///
/// Implementations hold their own [`ConnectionHandle`] to write to the
/// connection they belong to.
pub trait Protocol: Send {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Consumes as much of `data` as forms complete protocol elements.
    ///
    /// Returning zero consumed bytes with no transition means "wait for more
    /// data"; the unconsumed tail is offered again, extended, on the next read.
    fn consume(&mut self, data: &[u8]) -> Consumed;

    /// The peer hung up or the socket failed.
    fn on_peer_closed(&mut self) {}

    /// The connection is being torn down, for whatever reason. Called once.
    fn on_closed(&mut self) {}

    /// The next instant [`on_timer`](Self::on_timer) wants to run at.
    fn next_deadline(&self) -> Option<Instant> {
        None
    }

    fn on_timer(&mut self, _now: Instant) {}
}

/// What the connection does after a [`Protocol::consume`] call.
pub enum Transition {
    /// Adopt a new protocol for the remaining and all future bytes.
    Switch(Box<dyn Protocol>),
    /// Parse nothing more; close once queued writes drain.
    Close,
}

/// Result of [`Protocol::consume`].
pub struct Consumed {
    pub bytes: usize,
    pub next: Option<Transition>,
}

impl Consumed {
    pub fn partial(bytes: usize) -> Self {
        Self { bytes, next: None }
    }

    pub fn switch(bytes: usize, next: Box<dyn Protocol>) -> Self {
        Self {
            bytes,
            next: Some(Transition::Switch(next)),
        }
    }

    pub fn close(bytes: usize) -> Self {
        Self {
            bytes,
            next: Some(Transition::Close),
        }
    }
}

/// Readiness flags delivered to [`Connection::on_event`].
#[derive(Debug, Clone, Copy, Default)]
pub struct Readiness {
    pub readable: bool,
    pub writable: bool,
    pub hangup: bool,
}

/// One accepted connection and its active protocol.
pub struct Connection<S: Socket> {
    socket: Arc<S>,
    handle: ConnectionHandle,
    inbound: BytesMut,
    protocol: Box<dyn Protocol>,
    // The protocol returned `Transition::Close`, or the peer finished sending.
    draining: bool,
    // The peer shut down its write side; nothing more will be read.
    read_closed: bool,
    read_chunk_size: usize,
}

impl<S: Socket> Connection<S> {
    /// Wraps `socket`; `make_protocol` builds the initial protocol around the
    /// connection's handle.
    pub fn new(
        socket: Arc<S>,
        peer: Option<std::net::SocketAddr>,
        read_chunk_size: usize,
        make_protocol: impl FnOnce(ConnectionHandle) -> Box<dyn Protocol>,
    ) -> Self {
        let handle = ConnectionHandle::new(socket.clone(), peer);
        let protocol = make_protocol(handle.clone());
        Self {
            socket,
            handle,
            inbound: BytesMut::with_capacity(read_chunk_size),
            protocol,
            draining: false,
            read_closed: false,
            read_chunk_size,
        }
    }

    pub fn handle(&self) -> &ConnectionHandle {
        &self.handle
    }

    /// Name of the active protocol.
    pub fn protocol_name(&self) -> &'static str {
        self.protocol.name()
    }

    /// Handles one readiness notification.
    pub fn on_event(&mut self, event: Readiness) {
        if self.handle.is_closed() {
            return;
        }

        if event.hangup {
            self.hang_up();
            return;
        }

        if event.readable && !self.read_closed {
            match self.read_available() {
                Ok(false) => self.process_inbound(),
                Ok(true) => {
                    self.process_inbound();
                    self.end_of_stream();
                }
                Err(err) => {
                    debug!(peer = ?self.handle.peer_addr(), error = %err, "read failed");
                    self.hang_up();
                    return;
                }
            }
        }

        if event.writable {
            self.handle.flush();
        }

        self.close_if_drained();
    }

    /// Runs protocol timers that are due at `now`.
    pub fn on_timer(&mut self, now: Instant) {
        if self.draining || self.handle.is_closed() {
            return;
        }
        self.protocol.on_timer(now);
        self.close_if_drained();
    }

    fn deadline(&self) -> Option<Instant> {
        if self.draining {
            None
        } else {
            self.protocol.next_deadline()
        }
    }

    // Reads fixed-size chunks until a short read or `WouldBlock`.
    // Returns `Ok(true)` on end of stream.
    fn read_available(&mut self) -> io::Result<bool> {
        loop {
            let start = self.inbound.len();
            self.inbound.resize(start + self.read_chunk_size, 0);
            let result = self.socket.try_read(&mut self.inbound[start..]);
            match result {
                Ok(0) => {
                    self.inbound.truncate(start);
                    return Ok(true);
                }
                Ok(n) => {
                    self.inbound.truncate(start + n);
                    if n < self.read_chunk_size {
                        return Ok(false);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.inbound.truncate(start);
                    return Ok(false);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {
                    self.inbound.truncate(start);
                }
                Err(e) => {
                    self.inbound.truncate(start);
                    return Err(e);
                }
            }
        }
    }

    fn process_inbound(&mut self) {
        if self.draining {
            self.inbound.clear();
            return;
        }

        while !self.inbound.is_empty() && !self.handle.is_closed() {
            let Consumed { bytes, next } = self.protocol.consume(&self.inbound);
            self.inbound.advance(bytes.min(self.inbound.len()));

            match next {
                None => break,
                Some(Transition::Switch(next)) => {
                    debug!(
                        peer = ?self.handle.peer_addr(),
                        from = self.protocol.name(),
                        to = next.name(),
                        "protocol switch"
                    );
                    self.protocol = next;
                }
                Some(Transition::Close) => {
                    self.draining = true;
                    self.inbound.clear();
                }
            }
        }
    }

    // The peer half-closed: queued writes still go out, then the
    // connection closes.
    fn end_of_stream(&mut self) {
        debug!(
            peer = ?self.handle.peer_addr(),
            pending = self.handle.pending_bytes(),
            "peer finished sending"
        );
        self.read_closed = true;
        self.draining = true;
        self.inbound.clear();
        self.protocol.on_peer_closed();
    }

    /// Returns `true` once the peer has shut down its write side.
    pub fn is_read_closed(&self) -> bool {
        self.read_closed
    }

    fn hang_up(&mut self) {
        debug!(peer = ?self.handle.peer_addr(), "peer hung up");
        self.protocol.on_peer_closed();
        self.handle.close();
    }

    fn close_if_drained(&mut self) {
        if self.draining && !self.handle.has_pending() {
            self.handle.close();
        }
    }

    fn teardown(&mut self) {
        self.handle.close();
        self.protocol.on_closed();
        self.handle.mark_finished();
    }
}

enum Wake {
    Io(io::Result<tokio::io::Ready>),
    Handle,
    Timer,
}

impl Connection<TcpStream> {
    /// Drives the connection until it closes.
    pub async fn run(mut self) {
        let peer = self.handle.peer_addr();
        let socket = Arc::clone(&self.socket);
        let handle = self.handle.clone();

        while !handle.is_closed() {
            let interest = match (self.read_closed, handle.has_pending()) {
                (false, true) => Interest::READABLE | Interest::WRITABLE,
                (false, false) => Interest::READABLE,
                (true, _) => Interest::WRITABLE,
            };
            let deadline = self.deadline();

            let wake = tokio::select! {
                ready = socket.ready(interest) => Wake::Io(ready),
                () = handle.woken() => Wake::Handle,
                () = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => Wake::Timer,
            };

            match wake {
                Wake::Io(Ok(ready)) => self.on_event(Readiness {
                    readable: ready.is_readable() || ready.is_read_closed(),
                    writable: ready.is_writable(),
                    hangup: ready.is_write_closed() && !ready.is_readable(),
                }),
                Wake::Io(Err(err)) => {
                    warn!(peer = ?peer, error = %err, "readiness wait failed");
                    self.hang_up();
                }
                Wake::Handle => self.close_if_drained(),
                Wake::Timer => self.on_timer(Instant::now()),
            }
        }

        self.teardown();
        debug!(peer = ?peer, "connection closed");
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::VecDeque;
    use std::io;
    use std::sync::{Arc, Mutex};

    use super::Socket;

    #[derive(Default)]
    struct MockState {
        inbound: VecDeque<u8>,
        eof: bool,
        written: Vec<u8>,
        // Bytes accepted before writes start returning `WouldBlock`.
        budget: Option<usize>,
        broken: bool,
    }

    /// An in-memory [`Socket`] with a controllable send capacity.
    #[derive(Default)]
    pub(crate) struct MockSocket {
        state: Mutex<MockState>,
    }

    impl MockSocket {
        pub(crate) fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        pub(crate) fn feed(&self, bytes: &[u8]) {
            self.state.lock().unwrap().inbound.extend(bytes);
        }

        pub(crate) fn hang_up(&self) {
            self.state.lock().unwrap().eof = true;
        }

        pub(crate) fn set_budget(&self, budget: Option<usize>) {
            self.state.lock().unwrap().budget = budget;
        }

        pub(crate) fn grant(&self, bytes: usize) {
            let mut state = self.state.lock().unwrap();
            state.budget = Some(state.budget.unwrap_or(0) + bytes);
        }

        pub(crate) fn fail_writes(&self) {
            self.state.lock().unwrap().broken = true;
        }

        pub(crate) fn take_written(&self) -> Vec<u8> {
            std::mem::take(&mut self.state.lock().unwrap().written)
        }
    }

    impl Socket for MockSocket {
        fn try_read(&self, buf: &mut [u8]) -> io::Result<usize> {
            let mut state = self.state.lock().unwrap();
            if state.inbound.is_empty() {
                return if state.eof {
                    Ok(0)
                } else {
                    Err(io::ErrorKind::WouldBlock.into())
                };
            }
            let n = buf.len().min(state.inbound.len());
            for (slot, byte) in buf.iter_mut().zip(state.inbound.drain(..n)) {
                *slot = byte;
            }
            Ok(n)
        }

        fn try_write(&self, buf: &[u8]) -> io::Result<usize> {
            let mut state = self.state.lock().unwrap();
            if state.broken {
                return Err(io::ErrorKind::BrokenPipe.into());
            }
            let n = match state.budget {
                None => buf.len(),
                Some(0) => return Err(io::ErrorKind::WouldBlock.into()),
                Some(budget) => budget.min(buf.len()),
            };
            if let Some(budget) = state.budget.as_mut() {
                *budget -= n;
            }
            state.written.extend_from_slice(&buf[..n]);
            Ok(n)
        }
    }
}
