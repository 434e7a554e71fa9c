//! Request routing: map resource paths and HTTP methods to handlers.
//!
//! A [`Dispatcher`] holds two independent route lists, one for plain HTTP
//! routes and one for WebSocket routes, each behind its own lock so routes
//! can be added and removed while connections are being served.
//!
//! Route patterns are regular expressions matched against the whole
//! (unescaped) resource path. When several HTTP routes match, the most
//! specific one wins:
//!
//! | Pattern         | Path          | Captured  | Score |
//! |-----------------|---------------|-----------|-------|
//! | `/user/(\w+)`   | `/user/admin` | `admin`   | 6     |
//! | `/user/admin`   | `/user/admin` | *(none)*  | 11    |
//!
//! The score is the path length minus the length of everything captured.
//! Ties go to the route registered first.

use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, PoisonError, RwLock};

use tracing::{debug, error, warn};

mod route;

pub use route::{
    Captures, FromCaptures, Handler, HandlerResult, Route, RouteError, WsFactory, WsRoute, score,
};

use crate::http::{HttpError, Method, Request, Response, StatusCode, reason_phrase};
use crate::realtime::WebSocketHandler;

/// Produces the response for a classified error from its status and message.
pub type ErrorHandler = Box<dyn Fn(u16, &str) -> Response + Send + Sync + 'static>;

/// Shared routing table for every connection of a server.
///
/// # Examples
///
/// ```
/// use wirecore::http::{Request, Response, StatusCode};
/// use wirecore::router::Dispatcher;
///
/// let dispatcher = Dispatcher::new();
/// dispatcher
///     .get("/ping", |_req, _caps| Ok(Some(Response::new(StatusCode::Ok).body("pong"))))
///     .unwrap();
///
/// let (request, _) = Request::parse(b"GET /ping HTTP/1.1\r\n\r\n").unwrap().unwrap();
/// assert_eq!(dispatcher.route(&request).status(), 200);
/// ```
#[derive(Default)]
pub struct Dispatcher {
    routes: RwLock<Vec<Arc<Route>>>,
    ws_routes: RwLock<Vec<Arc<WsRoute>>>,
    error_handler: RwLock<Option<ErrorHandler>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an HTTP route. The same route may be shared between
    /// dispatchers.
    pub fn add_route(&self, route: Arc<Route>) {
        self.routes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(route);
    }

    /// Unregisters `route` (compared by identity). Returns `false` if it was
    /// not registered.
    pub fn remove_route(&self, route: &Arc<Route>) -> bool {
        let mut routes = self.routes.write().unwrap_or_else(PoisonError::into_inner);
        match routes.iter().position(|r| Arc::ptr_eq(r, route)) {
            Some(index) => {
                routes.remove(index);
                true
            }
            None => false,
        }
    }

    pub fn add_ws_route(&self, route: Arc<WsRoute>) {
        self.ws_routes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(route);
    }

    pub fn remove_ws_route(&self, route: &Arc<WsRoute>) -> bool {
        let mut routes = self
            .ws_routes
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        match routes.iter().position(|r| Arc::ptr_eq(r, route)) {
            Some(index) => {
                routes.remove(index);
                true
            }
            None => false,
        }
    }

    /// Builds and registers a route for `methods`, returning it so it can be
    /// removed later.
    pub fn handle<F>(
        &self,
        pattern: &str,
        methods: &[Method],
        handler: F,
    ) -> Result<Arc<Route>, RouteError>
    where
        F: Fn(&Request, &Captures) -> HandlerResult + Send + Sync + 'static,
    {
        let route = Arc::new(Route::new(pattern, methods, handler)?);
        self.add_route(route.clone());
        Ok(route)
    }

    /// Register a handler for `GET` (and `HEAD`) requests matching `pattern`.
    pub fn get<F>(&self, pattern: &str, handler: F) -> Result<Arc<Route>, RouteError>
    where
        F: Fn(&Request, &Captures) -> HandlerResult + Send + Sync + 'static,
    {
        self.handle(pattern, &[Method::Get, Method::Head], handler)
    }

    /// Register a handler for `POST` requests matching `pattern`.
    pub fn post<F>(&self, pattern: &str, handler: F) -> Result<Arc<Route>, RouteError>
    where
        F: Fn(&Request, &Captures) -> HandlerResult + Send + Sync + 'static,
    {
        self.handle(pattern, &[Method::Post], handler)
    }

    /// Register a handler for `PUT` requests matching `pattern`.
    pub fn put<F>(&self, pattern: &str, handler: F) -> Result<Arc<Route>, RouteError>
    where
        F: Fn(&Request, &Captures) -> HandlerResult + Send + Sync + 'static,
    {
        self.handle(pattern, &[Method::Put], handler)
    }

    /// Register a handler for `DELETE` requests matching `pattern`.
    pub fn delete<F>(&self, pattern: &str, handler: F) -> Result<Arc<Route>, RouteError>
    where
        F: Fn(&Request, &Captures) -> HandlerResult + Send + Sync + 'static,
    {
        self.handle(pattern, &[Method::Delete], handler)
    }

    /// Register a handler for `PATCH` requests matching `pattern`.
    pub fn patch<F>(&self, pattern: &str, handler: F) -> Result<Arc<Route>, RouteError>
    where
        F: Fn(&Request, &Captures) -> HandlerResult + Send + Sync + 'static,
    {
        self.handle(pattern, &[Method::Patch], handler)
    }

    /// Builds and registers a WebSocket route.
    pub fn websocket<F>(&self, pattern: &str, factory: F) -> Result<Arc<WsRoute>, RouteError>
    where
        F: Fn(&Request, &Captures) -> Option<Box<dyn WebSocketHandler>> + Send + Sync + 'static,
    {
        let route = Arc::new(WsRoute::new(pattern, factory)?);
        self.add_ws_route(route.clone());
        Ok(route)
    }

    /// Replaces the generator of error response bodies.
    pub fn set_error_handler<F>(&self, handler: F)
    where
        F: Fn(u16, &str) -> Response + Send + Sync + 'static,
    {
        *self
            .error_handler
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(Box::new(handler));
    }

    /// The response for a classified error.
    ///
    /// Uses the installed error handler, or a JSON body of the form
    /// `{"status": 404, "error": "Not Found", "message": "..."}`.
    pub fn error_response(&self, status: u16, message: &str) -> Response {
        let custom = self
            .error_handler
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(handler) = custom.as_ref() {
            match panic::catch_unwind(AssertUnwindSafe(|| handler(status, message))) {
                Ok(response) => return response,
                Err(_) => error!(status, "error handler panicked"),
            }
        }
        default_error_response(status, message)
    }

    /// Like [`error_response`](Self::error_response), for an [`HttpError`].
    pub fn error_for(&self, err: &HttpError) -> Response {
        self.error_response(err.status(), &err.message())
    }

    /// Routes `request` to the best matching handler.
    ///
    /// # Errors
    ///
    /// - `404` when nothing matches or the matched handler declines
    /// - `405` when routes match the path but none accepts the method
    /// - whatever the handler raised; a panic becomes `500`
    pub fn try_route(&self, request: &Request) -> Result<Response, HttpError> {
        // Routes are cloned out so handlers can register routes themselves.
        let routes = self
            .routes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        let path = request.path();
        let method = request.method();
        let mut path_matched = false;
        let mut best: Option<(isize, &Route, Captures)> = None;
        for route in &routes {
            let Some(captures) = route.matches(path) else {
                continue;
            };
            path_matched = true;
            if !route.allows(method) {
                continue;
            }
            let rank = score(path, &captures);
            if best.as_ref().is_none_or(|(top, _, _)| rank > *top) {
                best = Some((rank, route.as_ref(), captures));
            }
        }

        let Some((_, route, captures)) = best else {
            return Err(if path_matched {
                HttpError::method_not_allowed(format!("{method} is not allowed on {path}"))
            } else {
                HttpError::not_found(format!("no route for {path}"))
            });
        };

        match panic::catch_unwind(AssertUnwindSafe(|| route.call(request, &captures))) {
            Ok(Ok(Some(response))) => Ok(response),
            Ok(Ok(None)) => Err(HttpError::not_found(format!("no response for {path}"))),
            Ok(Err(err)) => Err(err),
            Err(_) => {
                error!(method = %request.method(), path, pattern = route.pattern(), "route handler panicked");
                Err(HttpError::new(StatusCode::InternalServerError, "handler panicked"))
            }
        }
    }

    /// Routes `request`, turning every failure into an error response.
    /// Never panics.
    pub fn route(&self, request: &Request) -> Response {
        match self.try_route(request) {
            Ok(response) => {
                debug!(method = %request.method(), path = request.path(), status = response.status(), "dispatched");
                response
            }
            Err(err) => {
                if err.is_fatal() {
                    warn!(method = %request.method(), path = request.path(), error = %err, "request failed");
                } else {
                    debug!(method = %request.method(), path = request.path(), status = err.status(), "request rejected");
                }
                self.error_for(&err)
            }
        }
    }

    /// Finds the handler for a WebSocket upgrade: the first registered
    /// WebSocket route whose pattern matches and whose factory accepts.
    ///
    /// # Errors
    ///
    /// `404` when no route accepts the request.
    pub fn route_ws(&self, request: &Request) -> Result<Box<dyn WebSocketHandler>, HttpError> {
        let routes = self
            .ws_routes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        for route in &routes {
            match panic::catch_unwind(AssertUnwindSafe(|| route.open(request))) {
                Ok(Some(handler)) => return Ok(handler),
                Ok(None) => {}
                Err(_) => {
                    error!(path = request.path(), pattern = route.pattern(), "websocket route panicked");
                    return Err(HttpError::new(
                        StatusCode::InternalServerError,
                        "websocket route panicked",
                    ));
                }
            }
        }
        Err(HttpError::not_found(format!(
            "no websocket route for {}",
            request.path()
        )))
    }

    pub fn route_count(&self) -> usize {
        self.routes.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn ws_route_count(&self) -> usize {
        self.ws_routes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

fn default_error_response(status: u16, message: &str) -> Response {
    let body = serde_json::json!({
        "status": status,
        "error": reason_phrase(status).unwrap_or("Unknown"),
        "message": message,
    });
    Response::new(status)
        .json(&body)
        .unwrap_or_else(|_| Response::new(status).body(message.to_owned()))
}

static DEFAULT: RwLock<Option<Arc<Dispatcher>>> = RwLock::new(None);

/// Installs the process-wide default dispatcher, returning the previous one.
///
/// The default is a convenience for code that registers routes without a
/// dispatcher at hand; servers still take their dispatcher explicitly.
pub fn install_default(dispatcher: Arc<Dispatcher>) -> Option<Arc<Dispatcher>> {
    DEFAULT
        .write()
        .unwrap_or_else(PoisonError::into_inner)
        .replace(dispatcher)
}

/// The process-wide default dispatcher, if one is installed.
pub fn default_dispatcher() -> Option<Arc<Dispatcher>> {
    DEFAULT
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .clone()
}

/// Removes the process-wide default dispatcher.
pub fn clear_default() -> Option<Arc<Dispatcher>> {
    DEFAULT.write().unwrap_or_else(PoisonError::into_inner).take()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::realtime::{Message, WebSocket};

    fn request(raw: &str) -> Request {
        Request::parse(raw.as_bytes()).unwrap().unwrap().0
    }

    fn get(path: &str) -> Request {
        request(&format!("GET {path} HTTP/1.1\r\nHost: h\r\n\r\n"))
    }

    fn text(body: &'static str) -> impl Fn(&Request, &Captures) -> HandlerResult {
        move |_, _| Ok(Some(Response::new(StatusCode::Ok).body(body)))
    }

    fn body(response: Response) -> String {
        String::from_utf8(response.body_ref().to_vec()).unwrap()
    }

    #[test]
    fn literal_route_beats_earlier_parametric_route() {
        let d = Dispatcher::new();
        d.get(r"/user/(\w+)", text("param")).unwrap();
        d.get("/user/admin", text("literal")).unwrap();
        assert_eq!(body(d.route(&get("/user/admin"))), "literal");
        assert_eq!(body(d.route(&get("/user/42"))), "param");
    }

    #[test]
    fn ties_go_to_first_registered() {
        let d = Dispatcher::new();
        d.get("/same", text("first")).unwrap();
        d.get("/same", text("second")).unwrap();
        assert_eq!(body(d.route(&get("/same"))), "first");
    }

    #[test]
    fn optional_trailing_slash_with_query() {
        let d = Dispatcher::new();
        d.get("/global/?", text("global")).unwrap();
        let response = d.route(&get("/global/?x=1"));
        assert_eq!(response.status(), 200);
        assert_eq!(body(response), "global");
    }

    #[test]
    fn no_match_is_json_404() {
        let d = Dispatcher::new();
        let response = d.route(&get("/missing"));
        assert_eq!(response.status(), 404);
        assert_eq!(
            response.headers().get("content-type"),
            Some("application/json")
        );
        let json: serde_json::Value = serde_json::from_slice(response.body_ref()).unwrap();
        assert_eq!(json["status"], 404);
        assert_eq!(json["error"], "Not Found");
    }

    #[test]
    fn wrong_method_on_best_match_is_405() {
        let d = Dispatcher::new();
        d.post("/items", text("created")).unwrap();
        assert_eq!(d.route(&get("/items")).status(), 405);
    }

    #[test]
    fn same_pattern_split_by_method() {
        let d = Dispatcher::new();
        d.get("/items", text("listed")).unwrap();
        d.post("/items", |_, _| {
            Ok(Some(Response::new(StatusCode::Created).body("created")))
        })
        .unwrap();

        let created = d.route(&request("POST /items HTTP/1.1\r\nContent-Length: 0\r\n\r\n"));
        assert_eq!(created.status(), 201);
        assert_eq!(body(created), "created");
        assert_eq!(body(d.route(&get("/items"))), "listed");
        assert_eq!(
            d.route(&request("DELETE /items HTTP/1.1\r\n\r\n")).status(),
            405
        );
    }

    #[test]
    fn less_specific_route_serves_method_the_best_match_lacks() {
        let d = Dispatcher::new();
        d.post(r"/user/(\w+)", text("param post")).unwrap();
        d.get("/user/admin", text("literal get")).unwrap();
        let response = d.route(&request("POST /user/admin HTTP/1.1\r\n\r\n"));
        assert_eq!(body(response), "param post");
    }

    #[test]
    fn declining_handler_is_404_without_fallthrough() {
        let d = Dispatcher::new();
        d.get(r"/(.*)", text("catch-all")).unwrap();
        d.get("/thing", |_, _| Ok(None)).unwrap();
        assert_eq!(d.route(&get("/thing")).status(), 404);
    }

    #[test]
    fn handler_errors_and_panics_become_responses() {
        let d = Dispatcher::new();
        d.get("/teapot", |_, _| Err(HttpError::new(418u16, "short and stout")))
            .unwrap();
        d.get("/boom", |_, _| panic!("boom")).unwrap();

        assert_eq!(d.route(&get("/teapot")).status(), 418);
        let err = d.try_route(&get("/boom")).unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(d.route(&get("/boom")).status(), 500);
    }

    #[test]
    fn custom_error_handler() {
        let d = Dispatcher::new();
        d.set_error_handler(|status, message| {
            Response::new(status).body(format!("custom {status}: {message}"))
        });
        let response = d.route(&get("/nowhere"));
        assert_eq!(response.status(), 404);
        assert!(body(response).starts_with("custom 404: "));
    }

    #[test]
    fn routes_can_be_removed() {
        let d = Dispatcher::new();
        let route = d.get("/gone", text("here")).unwrap();
        assert_eq!(d.route(&get("/gone")).status(), 200);
        assert!(d.remove_route(&route));
        assert!(!d.remove_route(&route));
        assert_eq!(d.route(&get("/gone")).status(), 404);
        assert_eq!(d.route_count(), 0);
    }

    #[test]
    fn handler_may_register_routes() {
        let d = Arc::new(Dispatcher::new());
        let inner = Arc::downgrade(&d);
        d.get("/register", move |_, _| {
            if let Some(d) = inner.upgrade() {
                d.get("/registered", text("new")).map_err(HttpError::internal)?;
            }
            Ok(Some(Response::new(StatusCode::Created)))
        })
        .unwrap();
        assert_eq!(d.route(&get("/register")).status(), 201);
        assert_eq!(body(d.route(&get("/registered"))), "new");
    }

    struct Silent;

    impl WebSocketHandler for Silent {
        fn on_message(&mut self, _ws: &WebSocket, _message: Message) {}
    }

    #[test]
    fn ws_routes_first_accepting_wins() {
        let d = Dispatcher::new();
        d.websocket("/ws/(.*)", |req, _| {
            (req.query_arg("token") == Some("ok")).then(|| Box::new(Silent) as Box<dyn WebSocketHandler>)
        })
        .unwrap();
        assert!(d.route_ws(&get("/ws/chat?token=ok")).is_ok());
        assert_eq!(d.route_ws(&get("/ws/chat")).err().map(|e| e.status()), Some(404));
        assert_eq!(d.route_ws(&get("/other")).err().map(|e| e.status()), Some(404));
    }

    #[test]
    fn default_dispatcher_lifecycle() {
        let d = Arc::new(Dispatcher::new());
        install_default(d.clone());
        assert!(default_dispatcher().is_some_and(|current| Arc::ptr_eq(&current, &d)));
        assert!(clear_default().is_some());
        assert!(default_dispatcher().is_none());
    }
}
