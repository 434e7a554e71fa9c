//! Async TCP server using Tokio.
//!
//! Accepts TCP connections on any number of listeners and drives each one
//! with its own [`Connection`] task, starting in HTTP and switching to
//! WebSocket on upgrade.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tracing::{debug, error, info};

use crate::config::{ConfigError, ServerConfig};
use crate::connection::Connection;
use crate::protocol::HttpProtocol;
use crate::router::Dispatcher;

/// Errors produced by the server.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to bind to {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("no listener bound")]
    NoListeners,
}

/// The wirecore server.
///
/// Every connection is served by one task that owns the socket; parsing,
/// routing and serialization run inside that task without suspension
/// points. On a current-thread runtime a single thread drives every
/// connection callback.
///
/// # Examples
///
/// ```rust,no_run
/// use std::sync::Arc;
///
/// use wirecore::http::{Response, StatusCode};
/// use wirecore::router::Dispatcher;
/// use wirecore::server::Server;
///
/// #[tokio::main(flavor = "current_thread")]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let dispatcher = Arc::new(Dispatcher::new());
///     dispatcher.get("/", |_req, _caps| {
///         Ok(Some(Response::new(StatusCode::Ok).body("Hello!")))
///     })?;
///
///     let mut server = Server::new(dispatcher);
///     server.bind("127.0.0.1:8080").await?;
///     server.run().await?;
///     Ok(())
/// }
/// ```
pub struct Server {
    dispatcher: Arc<Dispatcher>,
    config: Arc<ServerConfig>,
    listeners: Vec<TcpListener>,
}

impl Server {
    /// A server with the default [`ServerConfig`].
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            dispatcher,
            config: Arc::new(ServerConfig::default()),
            listeners: Vec::new(),
        }
    }

    /// # Errors
    ///
    /// Returns [`ServerError::Config`] if `config` fails validation.
    pub fn with_config(dispatcher: Arc<Dispatcher>, config: ServerConfig) -> Result<Self, ServerError> {
        config.validate()?;
        Ok(Self {
            dispatcher,
            config: Arc::new(config),
            listeners: Vec::new(),
        })
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Adds a listener bound to `addr` and returns its local address.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Bind`] if the address cannot be bound
    /// (e.g. port already in use, insufficient permissions).
    pub async fn bind(&mut self, addr: impl AsRef<str>) -> Result<SocketAddr, ServerError> {
        let addr = addr.as_ref();
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ServerError::Bind {
                addr: addr.to_owned(),
                source: e,
            })?;
        let local_addr = listener.local_addr()?;
        self.listeners.push(listener);
        Ok(local_addr)
    }

    /// Returns the local addresses of every bound listener.
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.listeners
            .iter()
            .filter_map(|listener| listener.local_addr().ok())
            .collect()
    }

    /// Accepts connections until the process ends.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::NoListeners`] if nothing was bound.
    pub async fn run(self) -> Result<(), ServerError> {
        self.run_until(std::future::pending()).await
    }

    /// Accepts connections until `shutdown` resolves. Connections already
    /// accepted keep running until they close.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::NoListeners`] if nothing was bound.
    pub async fn run_until(self, shutdown: impl Future<Output = ()>) -> Result<(), ServerError> {
        if self.listeners.is_empty() {
            return Err(ServerError::NoListeners);
        }

        let mut accept_loops = JoinSet::new();
        for listener in self.listeners {
            if let Ok(address) = listener.local_addr() {
                info!(%address, "wirecore listening");
            }
            accept_loops.spawn(accept_loop(
                listener,
                Arc::clone(&self.dispatcher),
                Arc::clone(&self.config),
            ));
        }

        shutdown.await;
        info!("shutting down listeners");
        accept_loops.shutdown().await;
        Ok(())
    }
}

async fn accept_loop(listener: TcpListener, dispatcher: Arc<Dispatcher>, config: Arc<ServerConfig>) {
    loop {
        let (stream, peer_addr) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                error!(error = %e, "failed to accept connection");
                continue;
            }
        };

        debug!(peer = %peer_addr, "connection accepted");
        serve(stream, peer_addr, Arc::clone(&dispatcher), Arc::clone(&config));
    }
}

/// Spawns the task that serves one accepted socket.
pub fn serve(stream: TcpStream, peer_addr: SocketAddr, dispatcher: Arc<Dispatcher>, config: Arc<ServerConfig>) {
    if config.nodelay {
        if let Err(e) = stream.set_nodelay(true) {
            debug!(peer = %peer_addr, error = %e, "failed to set TCP_NODELAY");
        }
    }

    let chunk = config.read_chunk_size;
    let connection = Connection::new(Arc::new(stream), Some(peer_addr), chunk, move |handle| {
        Box::new(HttpProtocol::new(handle, dispatcher, config))
    });
    tokio::spawn(connection.run());
}
