//! `multipart/*` request bodies.
//!
//! A body is a sequence of parts separated by `--boundary` delimiters. Every
//! delimiter is followed by `CRLF` (or `--` for the final one), every part
//! carries its own header block ending in `CRLF CRLF`, and every part's content
//! runs up to the `CRLF--boundary` that starts the next delimiter.

use bytes::Bytes;
use memchr::memmem;

use super::{Headers, HttpError};

/// One named part of a multipart body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormPart {
    headers: Headers,
    content: Bytes,
}

impl FormPart {
    /// The part's own header fields (`Content-Disposition`, `Content-Type`, …).
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// The raw part content.
    pub fn content(&self) -> &Bytes {
        &self.content
    }

    /// The `filename` parameter of `Content-Disposition`, if any.
    pub fn filename(&self) -> Option<&str> {
        self.headers
            .get("content-disposition")
            .and_then(|value| header_param(value, "filename"))
    }
}

/// Multipart body arguments keyed by the `name` parameter of each part.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BodyArgs {
    inner: Vec<(String, FormPart)>,
}

impl BodyArgs {
    pub fn get(&self, name: &str) -> Option<&FormPart> {
        self.inner.iter().find(|(k, _)| k == name).map(|(_, part)| part)
    }

    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a FormPart> + 'a {
        self.inner
            .iter()
            .filter(move |(k, _)| k == name)
            .map(|(_, part)| part)
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &FormPart)> {
        self.inner.iter().map(|(k, part)| (k.as_str(), part))
    }
}

/// Extracts a `key=value` parameter from a `;`-separated header value such as
/// `form-data; name="avatar"; filename="me.png"`. Quotes are stripped.
pub fn header_param<'a>(value: &'a str, key: &str) -> Option<&'a str> {
    value.split(';').skip(1).find_map(|param| {
        let (k, v) = param.split_once('=')?;
        k.trim()
            .eq_ignore_ascii_case(key)
            .then(|| v.trim().trim_matches('"'))
    })
}

/// Returns the boundary of a `multipart/*` content type, or `None` for any
/// other media type.
pub fn boundary(content_type: &str) -> Option<&str> {
    let media_type = content_type.split(';').next()?.trim();
    let is_multipart = media_type
        .get(..10)
        .is_some_and(|prefix| prefix.eq_ignore_ascii_case("multipart/"));
    if !is_multipart {
        return None;
    }
    header_param(content_type, "boundary").filter(|b| !b.is_empty())
}

/// Splits `body` into named parts.
///
/// # Errors
///
/// A missing boundary, a delimiter not followed by `CRLF`, an unterminated
/// header block or part, or a part without a named `Content-Disposition` is a
/// `400 Bad Request`.
pub fn parse(body: &Bytes, boundary: &str) -> Result<BodyArgs, HttpError> {
    let delimiter = format!("--{boundary}");
    let next_delimiter = format!("\r\n--{boundary}");

    let mut pos = memmem::find(body, delimiter.as_bytes())
        .ok_or_else(|| HttpError::bad_request("multipart boundary not found"))?
        + delimiter.len();

    let mut args = BodyArgs::default();
    loop {
        let rest = &body[pos..];
        if rest.starts_with(b"--") {
            return Ok(args);
        }
        if !rest.starts_with(b"\r\n") {
            return Err(HttpError::bad_request("multipart delimiter not followed by CRLF"));
        }
        pos += 2;

        let header_len = memmem::find(&body[pos..], b"\r\n\r\n")
            .ok_or_else(|| HttpError::bad_request("unterminated multipart part headers"))?;
        let headers = parse_part_headers(&body[pos..pos + header_len])?;
        pos += header_len + 4;

        let content_len = memmem::find(&body[pos..], next_delimiter.as_bytes())
            .ok_or_else(|| HttpError::bad_request("unterminated multipart part"))?;
        let content = body.slice(pos..pos + content_len);
        pos += content_len + next_delimiter.len();

        let name = headers
            .get("content-disposition")
            .and_then(|value| header_param(value, "name"))
            .ok_or_else(|| HttpError::bad_request("multipart part without a named Content-Disposition"))?
            .to_owned();

        args.inner.push((name, FormPart { headers, content }));
    }
}

fn parse_part_headers(block: &[u8]) -> Result<Headers, HttpError> {
    let text = std::str::from_utf8(block)
        .map_err(|_| HttpError::bad_request("multipart part headers are not UTF-8"))?;
    let mut headers = Headers::new();
    for line in text.split("\r\n") {
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| HttpError::bad_request(format!("invalid multipart header `{line}`")))?;
        headers.insert(name.trim(), value.trim());
    }
    Ok(headers)
}
