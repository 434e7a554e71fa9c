//! Route definitions: a regex pattern over the resource path plus a handler.

use std::fmt;
use std::str::FromStr;

use regex::Regex;

use crate::http::{HttpError, Method, Request, Response};
use crate::realtime::WebSocketHandler;

/// Errors raised while building a route.
#[derive(Debug, thiserror::Error)]
pub enum RouteError {
    #[error("invalid route pattern: {0}")]
    Pattern(#[from] regex::Error),

    #[error("pattern `{pattern}` has {found} capture groups but the handler takes {expected}")]
    Arity {
        pattern: String,
        expected: usize,
        found: usize,
    },
}

/// What a handler returns: a response, `None` to decline (the request is
/// answered with 404), or a classified error.
pub type HandlerResult = Result<Option<Response>, HttpError>;

/// A type-erased route handler.
pub type Handler = Box<dyn Fn(&Request, &Captures) -> HandlerResult + Send + Sync + 'static>;

/// Builds the handler for an accepted WebSocket upgrade, or declines it.
pub type WsFactory =
    Box<dyn Fn(&Request, &Captures) -> Option<Box<dyn WebSocketHandler>> + Send + Sync + 'static>;

/// The capture groups of a matched pattern, in order. Group 0 (the whole
/// match) is not included.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Captures {
    groups: Vec<Option<String>>,
}

impl Captures {
    /// The `index`-th capture group (0-based), if it participated in the match.
    pub fn get(&self, index: usize) -> Option<&str> {
        self.groups.get(index)?.as_deref()
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = Option<&str>> {
        self.groups.iter().map(Option::as_deref)
    }

    // Total length of every captured substring.
    fn captured_len(&self) -> usize {
        self.iter().flatten().map(str::len).sum()
    }
}

// A pattern anchored at both ends of the path.
struct PathPattern {
    source: String,
    regex: Regex,
}

impl PathPattern {
    fn compile(pattern: &str) -> Result<Self, RouteError> {
        Ok(Self {
            source: pattern.to_owned(),
            regex: Regex::new(&format!("^(?:{pattern})$"))?,
        })
    }

    fn groups(&self) -> usize {
        self.regex.captures_len() - 1
    }

    fn matches(&self, path: &str) -> Option<Captures> {
        let caps = self.regex.captures(path)?;
        Some(Captures {
            groups: caps
                .iter()
                .skip(1)
                .map(|group| group.map(|m| m.as_str().to_owned()))
                .collect(),
        })
    }
}

/// Specificity of a match: the path length minus everything the pattern's
/// groups captured. Literal routes outscore parametric ones.
pub fn score(path: &str, captures: &Captures) -> isize {
    path.len() as isize - captures.captured_len() as isize
}

/// An HTTP route.
///
/// # Examples
///
/// ```
/// use wirecore::http::{Method, Response, StatusCode};
/// use wirecore::router::Route;
///
/// let route = Route::new(r"/user/(\d+)", &[Method::Get], |_req, caps| {
///     let id = caps.get(0).unwrap_or_default();
///     Ok(Some(Response::new(StatusCode::Ok).body(format!("user {id}"))))
/// })
/// .unwrap();
/// assert_eq!(route.pattern(), r"/user/(\d+)");
/// ```
pub struct Route {
    pattern: PathPattern,
    // Empty means every method.
    methods: Vec<Method>,
    handler: Handler,
}

impl Route {
    /// Compiles `pattern` and binds it to `handler` for `methods` (an empty
    /// slice accepts every method).
    pub fn new<F>(pattern: &str, methods: &[Method], handler: F) -> Result<Self, RouteError>
    where
        F: Fn(&Request, &Captures) -> HandlerResult + Send + Sync + 'static,
    {
        Ok(Self {
            pattern: PathPattern::compile(pattern)?,
            methods: methods.to_vec(),
            handler: Box::new(handler),
        })
    }

    /// A route whose handler receives the capture groups parsed into `A`.
    ///
    /// Fails if the pattern does not have exactly `A::ARITY` groups. A group
    /// that does not parse answers 400.
    ///
    /// ```
    /// use wirecore::http::{Method, Response, StatusCode};
    /// use wirecore::router::Route;
    ///
    /// let route = Route::typed(r"/add/(\d+)/(\d+)", &[Method::Get], |_req, (a, b): (u32, u32)| {
    ///     Ok(Some(Response::new(StatusCode::Ok).body((a + b).to_string())))
    /// });
    /// assert!(route.is_ok());
    ///
    /// let wrong = Route::typed(r"/add/(\d+)", &[Method::Get], |_req, (a, b): (u32, u32)| {
    ///     Ok(Some(Response::new(StatusCode::Ok).body((a + b).to_string())))
    /// });
    /// assert!(wrong.is_err());
    /// ```
    pub fn typed<A, F>(pattern: &str, methods: &[Method], handler: F) -> Result<Self, RouteError>
    where
        A: FromCaptures + 'static,
        F: Fn(&Request, A) -> HandlerResult + Send + Sync + 'static,
    {
        let compiled = PathPattern::compile(pattern)?;
        if compiled.groups() != A::ARITY {
            return Err(RouteError::Arity {
                pattern: pattern.to_owned(),
                expected: A::ARITY,
                found: compiled.groups(),
            });
        }
        Ok(Self {
            pattern: compiled,
            methods: methods.to_vec(),
            handler: Box::new(move |req: &Request, caps: &Captures| {
                handler(req, A::from_captures(caps)?)
            }),
        })
    }

    pub fn pattern(&self) -> &str {
        &self.pattern.source
    }

    pub fn methods(&self) -> &[Method] {
        &self.methods
    }

    pub fn allows(&self, method: &Method) -> bool {
        self.methods.is_empty() || self.methods.contains(method)
    }

    pub fn matches(&self, path: &str) -> Option<Captures> {
        self.pattern.matches(path)
    }

    pub(crate) fn call(&self, request: &Request, captures: &Captures) -> HandlerResult {
        (self.handler)(request, captures)
    }
}

impl fmt::Debug for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Route")
            .field("pattern", &self.pattern.source)
            .field("methods", &self.methods)
            .finish_non_exhaustive()
    }
}

/// A WebSocket route: a path pattern and a factory that accepts the upgrade
/// by returning a handler.
pub struct WsRoute {
    pattern: PathPattern,
    factory: WsFactory,
}

impl WsRoute {
    pub fn new<F>(pattern: &str, factory: F) -> Result<Self, RouteError>
    where
        F: Fn(&Request, &Captures) -> Option<Box<dyn WebSocketHandler>> + Send + Sync + 'static,
    {
        Ok(Self {
            pattern: PathPattern::compile(pattern)?,
            factory: Box::new(factory),
        })
    }

    pub fn pattern(&self) -> &str {
        &self.pattern.source
    }

    /// The handler for `request`, if the path matches and the factory accepts.
    pub fn open(&self, request: &Request) -> Option<Box<dyn WebSocketHandler>> {
        let captures = self.pattern.matches(request.path())?;
        (self.factory)(request, &captures)
    }
}

impl fmt::Debug for WsRoute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WsRoute")
            .field("pattern", &self.pattern.source)
            .finish_non_exhaustive()
    }
}

/// Conversion of capture groups into typed handler arguments.
pub trait FromCaptures: Sized {
    /// Number of capture groups consumed.
    const ARITY: usize;

    fn from_captures(captures: &Captures) -> Result<Self, HttpError>;
}

impl FromCaptures for () {
    const ARITY: usize = 0;

    fn from_captures(_: &Captures) -> Result<Self, HttpError> {
        Ok(())
    }
}

fn parse_group<T: FromStr>(captures: &Captures, index: usize) -> Result<T, HttpError> {
    let raw = captures
        .get(index)
        .ok_or_else(|| HttpError::bad_request(format!("missing path argument {index}")))?;
    raw.parse()
        .map_err(|_| HttpError::bad_request(format!("invalid path argument `{raw}`")))
}

macro_rules! tuple_from_captures {
    ($arity:expr; $($ty:ident => $idx:tt),+) => {
        impl<$($ty: FromStr),+> FromCaptures for ($($ty,)+) {
            const ARITY: usize = $arity;

            fn from_captures(captures: &Captures) -> Result<Self, HttpError> {
                Ok(($(parse_group::<$ty>(captures, $idx)?,)+))
            }
        }
    };
}

tuple_from_captures!(1; A => 0);
tuple_from_captures!(2; A => 0, B => 1);
tuple_from_captures!(3; A => 0, B => 1, C => 2);
tuple_from_captures!(4; A => 0, B => 1, C => 2, D => 3);
