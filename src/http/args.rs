//! URL query arguments, cookies and percent-unescaping.

use std::collections::HashMap;

use percent_encoding::percent_decode_str;

use super::HttpError;

/// A case-sensitive, multi-value map of decoded `name=value` arguments.
///
/// # Examples
///
/// ```
/// use wirecore::http::args::parse_query;
///
/// let args = parse_query("tag=a&tag=b&q=hello+world%21").unwrap();
/// assert_eq!(args.get("q"), Some("hello world!"));
/// assert_eq!(args.get_all("tag").collect::<Vec<_>>(), vec!["a", "b"]);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Args {
    inner: Vec<(String, String)>,
}

impl Args {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.inner.push((name.into(), value.into()));
    }

    /// Returns the first value for `name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.inner
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.inner
            .iter()
            .filter(move |(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.inner.iter().any(|(k, _)| k == name)
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.inner.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// Decodes `%XX` escapes (and `+` as a space when `plus_as_space` is set).
///
/// # Errors
///
/// A `%` not followed by two hex digits, or an escape sequence that decodes
/// to invalid UTF-8, is a `400 Bad Request`.
pub fn unescape(raw: &str, plus_as_space: bool) -> Result<String, HttpError> {
    let bytes = raw.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let valid = bytes
                .get(i + 1..i + 3)
                .is_some_and(|hex| hex.iter().all(u8::is_ascii_hexdigit));
            if !valid {
                return Err(HttpError::bad_request(format!("invalid escape in `{raw}`")));
            }
            i += 3;
        } else {
            i += 1;
        }
    }

    let spaced;
    let source = if plus_as_space && raw.contains('+') {
        spaced = raw.replace('+', " ");
        spaced.as_str()
    } else {
        raw
    };

    percent_decode_str(source)
        .decode_utf8()
        .map(|decoded| decoded.into_owned())
        .map_err(|_| HttpError::bad_request(format!("escape in `{raw}` is not valid UTF-8")))
}

/// Parses a URL query string (`key=value&key2=value2`) into [`Args`].
///
/// Empty pairs are skipped; a key without `=` maps to an empty value.
pub fn parse_query(query: &str) -> Result<Args, HttpError> {
    let mut args = Args::new();
    for pair in query.split('&').filter(|pair| !pair.is_empty()) {
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        args.insert(unescape(key, true)?, unescape(value, true)?);
    }
    Ok(args)
}

/// Parses `Cookie` header values, split on `;` and `,`, into a name → value map.
///
/// Pairs without `=` are ignored; a later duplicate name replaces an earlier one.
pub fn parse_cookies<'a>(
    values: impl Iterator<Item = &'a str>,
) -> Result<HashMap<String, String>, HttpError> {
    let mut cookies = HashMap::new();
    for pair in values.flat_map(|value| value.split([';', ','])) {
        let Some((name, value)) = pair.split_once('=') else {
            continue;
        };
        let name = name.trim();
        if name.is_empty() {
            continue;
        }
        let value = value.trim().trim_matches('"');
        cookies.insert(unescape(name, false)?, unescape(value, false)?);
    }
    Ok(cookies)
}
