//! Header fields of a request or response.
//!
//! Field names compare case-insensitively and a name may repeat
//! (`Set-Cookie`, split `Connection` lists). Fields keep wire order so a
//! serialized response lists them as they were added.

#[derive(Debug, Clone, PartialEq, Eq)]
struct Field {
    name: String,
    value: String,
}

impl Field {
    fn is(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name)
    }
}

/// Header fields in wire order.
///
/// # Examples
///
/// ```
/// use wirecore::http::Headers;
///
/// let mut headers = Headers::new();
/// headers.insert("Connection", "keep-alive, Upgrade");
/// headers.insert("Set-Cookie", "a=1");
/// headers.insert("set-cookie", "b=2");
///
/// assert!(headers.has_token("connection", "upgrade"));
/// assert_eq!(headers.get_all("SET-COOKIE").collect::<Vec<_>>(), vec!["a=1", "b=2"]);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    fields: Vec<Field>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sized for a parsed header block of `capacity` lines.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            fields: Vec::with_capacity(capacity),
        }
    }

    /// Adds a field after any existing ones of the same name.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.fields.push(Field {
            name: name.into(),
            value: value.into(),
        });
    }

    /// Drops every field named `name`, then adds one with `value`.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        self.remove(&name);
        self.insert(name, value);
    }

    /// First value of `name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|field| field.is(name))
            .map(|field| field.value.as_str())
    }

    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.fields
            .iter()
            .filter(move |field| field.is(name))
            .map(|field| field.value.as_str())
    }

    /// Returns `true` if any value of `name`, read as a comma-separated token
    /// list, contains `token` (both compared case-insensitively).
    ///
    /// Used for list-valued fields such as `Connection: keep-alive, Upgrade`.
    pub fn has_token(&self, name: &str, token: &str) -> bool {
        self.get_all(name)
            .flat_map(|value| value.split(','))
            .any(|item| item.trim().eq_ignore_ascii_case(token))
    }

    /// Removes every field named `name`; `false` if there was none.
    pub fn remove(&mut self, name: &str) -> bool {
        let before = self.fields.len();
        self.fields.retain(|field| !field.is(name));
        self.fields.len() != before
    }

    pub fn contains(&self, name: &str) -> bool {
        self.fields.iter().any(|field| field.is(name))
    }

    /// Number of fields, counting repeats.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// `(name, value)` pairs in wire order, names as they were added.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields
            .iter()
            .map(|field| (field.name.as_str(), field.value.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_ignores_name_case() {
        let mut headers = Headers::new();
        headers.insert("Sec-WebSocket-Key", "dGhlIHNhbXBsZSBub25jZQ==");
        assert_eq!(headers.get("sec-websocket-key"), Some("dGhlIHNhbXBsZSBub25jZQ=="));
        assert_eq!(headers.get("SEC-WEBSOCKET-KEY"), Some("dGhlIHNhbXBsZSBub25jZQ=="));
        assert!(headers.contains("Sec-Websocket-Key"));
        assert_eq!(headers.get("sec-websocket-version"), None);
    }

    #[test]
    fn value_outlives_the_looked_up_name() {
        let mut headers = Headers::new();
        headers.insert("Host", "example.com");
        let host = {
            let name = String::from("host");
            headers.get(&name)
        };
        assert_eq!(host, Some("example.com"));
    }

    #[test]
    fn repeated_fields_keep_wire_order() {
        let mut headers = Headers::new();
        headers.insert("Content-Length", "5");
        headers.insert("Host", "h");
        headers.insert("content-length", "7");
        assert_eq!(headers.get("Content-Length"), Some("5"));
        assert_eq!(headers.get_all("content-length").collect::<Vec<_>>(), vec!["5", "7"]);
        let names: Vec<_> = headers.iter().map(|(name, _)| name).collect();
        assert_eq!(names, vec!["Content-Length", "Host", "content-length"]);
    }

    #[test]
    fn set_collapses_repeats() {
        let mut headers = Headers::new();
        headers.insert("Connection", "keep-alive");
        headers.insert("connection", "upgrade");
        headers.set("Connection", "close");
        assert_eq!(headers.len(), 1);
        assert_eq!(headers.get("connection"), Some("close"));
    }

    #[test]
    fn token_lists_across_values() {
        let mut headers = Headers::new();
        headers.insert("Connection", "keep-alive");
        headers.insert("Connection", " Upgrade ");
        assert!(headers.has_token("connection", "upgrade"));
        assert!(headers.has_token("CONNECTION", "Keep-Alive"));
        assert!(!headers.has_token("connection", "close"));
        assert!(!headers.has_token("upgrade", "websocket"));
    }

    #[test]
    fn remove_reports_whether_anything_went() {
        let mut headers = Headers::with_capacity(2);
        headers.insert("Transfer-Encoding", "chunked");
        headers.insert("transfer-encoding", "gzip");
        assert!(headers.remove("TRANSFER-ENCODING"));
        assert!(headers.is_empty());
        assert!(!headers.remove("transfer-encoding"));
    }
}
