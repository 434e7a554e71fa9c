//! The shareable half of a connection: the socket's write side, the ordered
//! transmit queue, close and wakeup signalling.

use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tracing::{debug, warn};

/// Callback fired once a queued buffer has been fully handed to the OS.
pub type OnSent = Box<dyn FnOnce() + Send + 'static>;

/// A non-blocking, readiness-driven byte stream.
///
/// Both calls must return [`io::ErrorKind::WouldBlock`] instead of blocking.
pub trait Socket: Send + Sync + 'static {
    fn try_read(&self, buf: &mut [u8]) -> io::Result<usize>;
    fn try_write(&self, buf: &[u8]) -> io::Result<usize>;
}

impl Socket for TcpStream {
    fn try_read(&self, buf: &mut [u8]) -> io::Result<usize> {
        TcpStream::try_read(self, buf)
    }

    fn try_write(&self, buf: &[u8]) -> io::Result<usize> {
        TcpStream::try_write(self, buf)
    }
}

/// One queued outbound write.
struct TransmitJob {
    data: Bytes,
    sent: usize,
    on_sent: Option<OnSent>,
}

impl TransmitJob {
    fn new(data: Bytes, on_sent: Option<OnSent>) -> Self {
        Self {
            data,
            sent: 0,
            on_sent,
        }
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.sent
    }
}

enum Flush {
    Complete,
    Blocked,
    Failed(io::Error),
}

// Writes as much of `job` as the socket takes without blocking.
fn send_some(socket: &dyn Socket, job: &mut TransmitJob) -> Flush {
    while job.sent < job.data.len() {
        match socket.try_write(&job.data[job.sent..]) {
            Ok(0) => return Flush::Failed(io::ErrorKind::WriteZero.into()),
            Ok(n) => job.sent += n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Flush::Blocked,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Flush::Failed(e),
        }
    }
    Flush::Complete
}

struct Outbound {
    // `None` once the connection is closed.
    socket: Option<Arc<dyn Socket>>,
    jobs: VecDeque<TransmitJob>,
    unsent: usize,
}

struct Shared {
    peer: Option<SocketAddr>,
    outbound: Mutex<Outbound>,
    closed: AtomicBool,
    finished: AtomicBool,
    wakeup: Notify,
    done: Notify,
}

/// A cloneable reference to one connection.
///
/// Protocols hold one to write responses and frames; application code may
/// hold one too (usually through a [`WebSocket`](crate::realtime::WebSocket))
/// and write from any task. Bytes from successive [`write`](Self::write)
/// calls reach the peer in call order. After [`close`](Self::close) every
/// operation is a no-op.
#[derive(Clone)]
pub struct ConnectionHandle {
    shared: Arc<Shared>,
}

impl ConnectionHandle {
    pub fn new(socket: Arc<dyn Socket>, peer: Option<SocketAddr>) -> Self {
        Self {
            shared: Arc::new(Shared {
                peer,
                outbound: Mutex::new(Outbound {
                    socket: Some(socket),
                    jobs: VecDeque::new(),
                    unsent: 0,
                }),
                closed: AtomicBool::new(false),
                finished: AtomicBool::new(false),
                wakeup: Notify::new(),
                done: Notify::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Outbound> {
        self.shared
            .outbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// The remote address, when the socket has one.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.shared.peer
    }

    /// Queues `data` for transmission.
    ///
    /// If nothing is queued ahead of it the bytes are sent immediately and
    /// only the remainder (if any) is queued.
    pub fn write(&self, data: impl Into<Bytes>) {
        self.enqueue(data.into(), None);
    }

    /// Like [`write`](Self::write), then calls `on_sent` exactly once after
    /// the last byte has been handed to the OS. Runs synchronously when the
    /// whole buffer goes out immediately. Never runs if the connection closes
    /// first.
    pub fn write_then(&self, data: impl Into<Bytes>, on_sent: impl FnOnce() + Send + 'static) {
        self.enqueue(data.into(), Some(Box::new(on_sent)));
    }

    fn enqueue(&self, data: Bytes, on_sent: Option<OnSent>) {
        let mut guard = self.lock();
        let outbound = &mut *guard;
        let Some(socket) = outbound.socket.as_ref() else {
            return;
        };

        let mut job = TransmitJob::new(data, on_sent);
        if !outbound.jobs.is_empty() {
            outbound.unsent += job.remaining();
            outbound.jobs.push_back(job);
            drop(guard);
            self.shared.wakeup.notify_one();
            return;
        }

        match send_some(socket.as_ref(), &mut job) {
            Flush::Complete => {
                drop(guard);
                if let Some(on_sent) = job.on_sent.take() {
                    on_sent();
                }
            }
            Flush::Blocked => {
                outbound.unsent += job.remaining();
                outbound.jobs.push_back(job);
                drop(guard);
                // re-arm write interest
                self.shared.wakeup.notify_one();
            }
            Flush::Failed(err) => {
                drop(guard);
                self.fail(err);
            }
        }
    }

    /// Drains queued jobs in order, stopping at the first one the socket will
    /// not take in full. Completion callbacks run between jobs.
    pub(crate) fn flush(&self) {
        loop {
            let mut guard = self.lock();
            let outbound = &mut *guard;
            let Some(socket) = outbound.socket.as_ref() else {
                return;
            };
            let Some(job) = outbound.jobs.front_mut() else {
                return;
            };

            let before = job.sent;
            let result = send_some(socket.as_ref(), job);
            outbound.unsent -= job.sent - before;

            match result {
                Flush::Complete => {
                    let on_sent = outbound.jobs.pop_front().and_then(|mut job| job.on_sent.take());
                    drop(guard);
                    if let Some(on_sent) = on_sent {
                        on_sent();
                    }
                }
                Flush::Blocked => return,
                Flush::Failed(err) => {
                    drop(guard);
                    self.fail(err);
                    return;
                }
            }
        }
    }

    fn fail(&self, err: io::Error) {
        warn!(peer = ?self.shared.peer, error = %err, "write failed, closing connection");
        self.close();
    }

    /// Number of queued bytes not yet handed to the OS.
    pub fn pending_bytes(&self) -> usize {
        self.lock().unsent
    }

    /// Returns `true` while transmit jobs remain queued.
    pub fn has_pending(&self) -> bool {
        !self.lock().jobs.is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Closes the connection without waiting: queued jobs are dropped
    /// (their callbacks never run) and the connection task is woken so it
    /// deregisters and releases the socket. Idempotent.
    pub fn close(&self) {
        let (socket, jobs) = {
            let mut outbound = self.lock();
            if outbound.socket.is_none() {
                return;
            }
            self.shared.closed.store(true, Ordering::Release);
            outbound.unsent = 0;
            (outbound.socket.take(), std::mem::take(&mut outbound.jobs))
        };
        if !jobs.is_empty() {
            debug!(peer = ?self.shared.peer, dropped = jobs.len(), "closing with unsent data");
        }
        drop((socket, jobs));
        self.shared.wakeup.notify_one();
    }

    /// Closes the connection and waits until its task has finished, so no
    /// further protocol callback for it can be running afterwards.
    ///
    /// Must not be awaited from inside that connection's own callbacks.
    pub async fn close_and_wait(&self) {
        self.close();
        self.closed().await;
    }

    /// Resolves once the connection task has torn the connection down.
    pub async fn closed(&self) {
        loop {
            let done = self.shared.done.notified();
            if self.shared.finished.load(Ordering::Acquire) {
                return;
            }
            done.await;
        }
    }

    /// Asks the connection task to re-evaluate its interest set and timers.
    pub(crate) fn wake(&self) {
        self.shared.wakeup.notify_one();
    }

    pub(crate) async fn woken(&self) {
        self.shared.wakeup.notified().await;
    }

    pub(crate) fn mark_finished(&self) {
        self.shared.finished.store(true, Ordering::Release);
        self.shared.done.notify_waiters();
    }
}
