//! HTTP/1.x request parsing using the [`httparse`] crate.
//!
//! Parsing happens in two steps so a connection can hold a parsed header block
//! while the body is still arriving: [`Request::parse_head`] handles the
//! request line and header fields, then [`Request::attach_body`] adds the
//! body once `Content-Length` bytes are buffered.

use std::collections::HashMap;

use bytes::Bytes;
use memchr::memmem;

use super::args::{self, Args};
use super::multipart::{self, BodyArgs, FormPart};
use super::{Headers, HttpError, Method, Version};
use crate::config::DEFAULT_MAX_HEADERS;

/// Returns the length of the header block (including the terminating
/// `CRLF CRLF`) at the start of `buf`, or `None` if it is not complete yet.
pub(crate) fn find_head_end(buf: &[u8]) -> Option<usize> {
    memmem::find(buf, b"\r\n\r\n").map(|pos| pos + 4)
}

/// A fully parsed HTTP request.
///
/// # Examples
///
/// ```
/// use wirecore::http::Request;
///
/// let raw = b"GET /hello%20there?name=world HTTP/1.1\r\nHost: localhost\r\nCookie: id=7\r\n\r\n";
/// let (request, consumed) = Request::parse(raw).unwrap().unwrap();
///
/// assert_eq!(consumed, raw.len());
/// assert_eq!(request.method().as_str(), "GET");
/// assert_eq!(request.path(), "/hello there");
/// assert_eq!(request.query_arg("name"), Some("world"));
/// assert_eq!(request.cookie("id"), Some("7"));
/// assert_eq!(request.headers().get("host"), Some("localhost"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    method: Method,
    url: String,
    path: String,
    query: Option<String>,
    version: Version,
    headers: Headers,
    query_args: Args,
    cookies: HashMap<String, String>,
    body_args: BodyArgs,
    content_length: usize,
    body: Bytes,
}

impl Request {
    /// Parses a complete request from `buf`, body included.
    ///
    /// Returns `Ok(None)` while the header block or the declared body is
    /// still incomplete, otherwise the request and the number of bytes it
    /// occupied.
    ///
    /// # Errors
    ///
    /// Any malformed request line, header field, escape sequence,
    /// `Content-Length` or multipart body is an [`HttpError`].
    pub fn parse(buf: &[u8]) -> Result<Option<(Self, usize)>, HttpError> {
        let Some(head_len) = find_head_end(buf) else {
            return Ok(None);
        };
        let mut request = Self::parse_head(&buf[..head_len], DEFAULT_MAX_HEADERS)?;
        let end = head_len
            .checked_add(request.body_length()?)
            .ok_or_else(|| HttpError::bad_request("Content-Length overflows"))?;
        if buf.len() < end {
            return Ok(None);
        }
        request.attach_body(Bytes::copy_from_slice(&buf[head_len..end]))?;
        Ok(Some((request, end)))
    }

    /// Parses the request line and header fields of a complete header block.
    ///
    /// `head` must end with the `CRLF CRLF` terminator. The returned request
    /// has an empty body; see [`attach_body`](Self::attach_body).
    pub fn parse_head(head: &[u8], max_headers: usize) -> Result<Self, HttpError> {
        let mut headers = vec![httparse::EMPTY_HEADER; max_headers];
        let mut raw_req = httparse::Request::new(&mut headers);

        match raw_req.parse(head) {
            Ok(httparse::Status::Complete(_)) => {}
            Ok(httparse::Status::Partial) => {
                return Err(HttpError::bad_request("truncated header block"));
            }
            Err(httparse::Error::TooManyHeaders) => {
                return Err(HttpError::bad_request(format!(
                    "more than {max_headers} header fields"
                )));
            }
            Err(e) => return Err(HttpError::bad_request(format!("malformed request: {e}"))),
        }

        let method: Method = match raw_req
            .method
            .ok_or_else(|| HttpError::bad_request("missing method"))?
            .parse()
        {
            Ok(method) => method,
            Err(never) => match never {},
        };

        let url = raw_req
            .path
            .ok_or_else(|| HttpError::bad_request("missing request target"))?
            .to_owned();

        let version = raw_req
            .version
            .and_then(Version::from_minor)
            .ok_or_else(|| HttpError::bad_request("unsupported HTTP version"))?;

        let (raw_path, query) = match url.split_once('?') {
            Some((path, query)) => (path, Some(query.to_owned())),
            None => (url.as_str(), None),
        };
        if raw_path != "*" && !raw_path.starts_with('/') {
            return Err(HttpError::bad_request(format!("invalid request target `{url}`")));
        }
        let path = args::unescape(raw_path, false)?;

        let mut header_map = Headers::with_capacity(raw_req.headers.len());
        for header in raw_req.headers.iter() {
            let name = args::unescape(header.name, false)?;
            header_map.insert(name, String::from_utf8_lossy(header.value).trim());
        }

        let query_args = match query.as_deref() {
            Some(query) => args::parse_query(query)?,
            None => Args::new(),
        };
        let cookies = args::parse_cookies(header_map.get_all("cookie"))?;

        Ok(Self {
            method,
            url,
            path,
            query,
            version,
            headers: header_map,
            query_args,
            cookies,
            body_args: BodyArgs::default(),
            content_length: 0,
            body: Bytes::new(),
        })
    }

    /// The number of body bytes that follow the header block.
    ///
    /// # Errors
    ///
    /// `400` for an unparsable or conflicting `Content-Length`, `501` for a
    /// `Transfer-Encoding` other than `identity`.
    pub fn body_length(&self) -> Result<usize, HttpError> {
        if let Some(coding) = self.headers.get("transfer-encoding") {
            if !coding.eq_ignore_ascii_case("identity") {
                return Err(HttpError::not_implemented(format!(
                    "Transfer-Encoding `{coding}` is not supported"
                )));
            }
        }

        let mut length = None;
        for value in self.headers.get_all("content-length") {
            let parsed: usize = value
                .parse()
                .map_err(|_| HttpError::bad_request(format!("invalid Content-Length `{value}`")))?;
            if length.is_some_and(|previous| previous != parsed) {
                return Err(HttpError::bad_request("conflicting Content-Length values"));
            }
            length = Some(parsed);
        }
        Ok(length.unwrap_or(0))
    }

    /// Stores the complete body and, for `multipart/*` content types with a
    /// boundary, splits it into [`body_args`](Self::body_args).
    pub fn attach_body(&mut self, body: Bytes) -> Result<(), HttpError> {
        if let Some(boundary) = self
            .headers
            .get("content-type")
            .and_then(multipart::boundary)
        {
            self.body_args = multipart::parse(&body, boundary)?;
        }
        self.content_length = body.len();
        self.body = body;
        Ok(())
    }

    /// Returns the HTTP method.
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Returns the raw request target exactly as received.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Returns the unescaped resource path (without the query string).
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Returns the raw query string (without the leading `?`), if any.
    pub fn query_string(&self) -> Option<&str> {
        self.query.as_deref()
    }

    pub fn version(&self) -> Version {
        self.version
    }

    /// Returns the request headers.
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn query_args(&self) -> &Args {
        &self.query_args
    }

    /// Returns the first decoded query argument named `name`.
    pub fn query_arg(&self, name: &str) -> Option<&str> {
        self.query_args.get(name)
    }

    pub fn cookies(&self) -> &HashMap<String, String> {
        &self.cookies
    }

    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.cookies.get(name).map(String::as_str)
    }

    pub fn body_args(&self) -> &BodyArgs {
        &self.body_args
    }

    pub fn body_arg(&self, name: &str) -> Option<&FormPart> {
        self.body_args.get(name)
    }

    /// Returns the number of body bytes received.
    pub fn content_length(&self) -> usize {
        self.content_length
    }

    /// Returns the request body bytes.
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Deserializes the body as JSON.
    pub fn json<T>(&self) -> Result<T, serde_json::Error>
    where
        T: serde::de::DeserializeOwned,
    {
        serde_json::from_slice(&self.body)
    }

    /// Returns `true` if the connection should be kept alive after this request.
    ///
    /// HTTP/1.0 always closes; HTTP/1.1 stays open unless `Connection: close`
    /// is present.
    pub fn is_keep_alive(&self) -> bool {
        self.version == Version::Http11 && !self.headers.has_token("connection", "close")
    }
}
