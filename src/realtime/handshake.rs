//! The HTTP/1.1 upgrade handshake that opens a WebSocket.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use sha1::{Digest, Sha1};

use crate::http::{HttpError, Method, Request, Response, StatusCode};

const GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// The only protocol version this server speaks.
pub const VERSION: &str = "13";

/// `base64(SHA-1(key ++ GUID))`, the `Sec-WebSocket-Accept` value for `key`.
pub fn accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(GUID.as_bytes());
    STANDARD.encode(hasher.finalize())
}

/// Returns `true` if the request asks to switch protocols at all.
pub fn is_upgrade(request: &Request) -> bool {
    request.headers().contains("upgrade")
}

/// Checks the upgrade preconditions and returns the client key.
///
/// # Errors
///
/// - `501` for an `Upgrade` target other than `websocket`
/// - `400` without an `upgrade` token in `Connection`
/// - `405` for any method but `GET`
/// - `400` for a missing key or a version other than 13
pub fn validate(request: &Request) -> Result<&str, HttpError> {
    let target = request.headers().get("upgrade").unwrap_or_default();
    if !target.eq_ignore_ascii_case("websocket") {
        return Err(HttpError::not_implemented(format!(
            "upgrade to `{target}` is not supported"
        )));
    }
    if !request.headers().has_token("connection", "upgrade") {
        return Err(HttpError::bad_request("Connection header lacks the upgrade token"));
    }
    if *request.method() != Method::Get {
        return Err(HttpError::method_not_allowed(format!(
            "WebSocket upgrade requires GET, got {}",
            request.method()
        )));
    }
    let key = request
        .headers()
        .get("sec-websocket-key")
        .filter(|key| !key.is_empty())
        .ok_or_else(|| HttpError::bad_request("missing Sec-WebSocket-Key"))?;
    match request.headers().get("sec-websocket-version") {
        Some(VERSION) => Ok(key),
        Some(other) => Err(HttpError::bad_request(format!(
            "unsupported Sec-WebSocket-Version `{other}`"
        ))),
        None => Err(HttpError::bad_request("missing Sec-WebSocket-Version")),
    }
}

/// The `101 Switching Protocols` response for a validated key.
pub fn response(key: &str) -> Response {
    Response::new(StatusCode::SwitchingProtocols)
        .header("Upgrade", "websocket")
        .header("Connection", "Upgrade")
        .header("Sec-WebSocket-Accept", accept_key(key))
}
