//! Server limits and tunables.
//!
//! Every field has a conservative default, so `ServerConfig::default()` is a
//! reasonable production starting point. The struct derives serde traits so it
//! can be embedded in an application's own configuration file.
//!
//! ```
//! use wirecore::config::ServerConfig;
//!
//! let config = ServerConfig::from_json(r#"{ "max_headers": 32 }"#).unwrap();
//! assert_eq!(config.max_headers, 32);
//! assert_eq!(config.read_chunk_size, 4096);
//! ```

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Maximum size of a buffered request (header block plus declared body): 8 MiB.
pub const DEFAULT_MAX_REQUEST_SIZE: usize = 8 * 1024 * 1024;

/// Size of each non-blocking read issued on a readable socket.
pub const DEFAULT_READ_CHUNK_SIZE: usize = 4096;

/// Maximum number of header fields accepted per request.
pub const DEFAULT_MAX_HEADERS: usize = 64;

/// Maximum size of a reassembled WebSocket message: 16 MiB.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Errors produced while loading or validating a [`ServerConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration document: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("`{field}` must be greater than zero")]
    Zero { field: &'static str },
}

/// Limits applied to every connection accepted by a [`Server`](crate::Server).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Largest header block or declared body the HTTP parser buffers before
    /// answering `413 Payload Too Large` and closing the connection.
    pub max_request_size: usize,

    /// Bytes requested per `read` call while draining a readable socket.
    pub read_chunk_size: usize,

    /// Header fields accepted per request; more is a `400 Bad Request`.
    pub max_headers: usize,

    /// Largest WebSocket message (after fragment reassembly). Larger
    /// messages close the connection with code 1009.
    pub max_message_size: usize,

    /// Sets `TCP_NODELAY` on accepted sockets.
    pub nodelay: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_request_size: DEFAULT_MAX_REQUEST_SIZE,
            read_chunk_size: DEFAULT_READ_CHUNK_SIZE,
            max_headers: DEFAULT_MAX_HEADERS,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            nodelay: true,
        }
    }
}

impl ServerConfig {
    /// Parses a JSON document, filling absent fields with defaults, and
    /// validates the result.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] for malformed JSON and
    /// [`ConfigError::Zero`] when a size limit is zero.
    pub fn from_json(document: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(document)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks that every size limit is usable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let checks = [
            ("max_request_size", self.max_request_size),
            ("read_chunk_size", self.read_chunk_size),
            ("max_headers", self.max_headers),
            ("max_message_size", self.max_message_size),
        ];
        for (field, value) in checks {
            if value == 0 {
                return Err(ConfigError::Zero { field });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = ServerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_request_size, DEFAULT_MAX_REQUEST_SIZE);
        assert!(config.nodelay);
    }

    #[test]
    fn partial_document_keeps_defaults() {
        let config = ServerConfig::from_json(r#"{"nodelay": false}"#).unwrap();
        assert!(!config.nodelay);
        assert_eq!(config.max_headers, DEFAULT_MAX_HEADERS);
    }

    #[test]
    fn zero_limit_rejected() {
        let err = ServerConfig::from_json(r#"{"read_chunk_size": 0}"#).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Zero {
                field: "read_chunk_size"
            }
        ));
    }

    #[test]
    fn malformed_json_rejected() {
        assert!(matches!(
            ServerConfig::from_json("{"),
            Err(ConfigError::Parse(_))
        ));
    }
}
