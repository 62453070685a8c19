//! The dispatch loop and its continuation.
//!
//! A dispatcher walks its [`Stack`] once per request. Every layer whose
//! route matches the request path is called with a [`Next`]; resuming it
//! moves on to the following layer, either on the normal track or, when it
//! carries an error, on the error track. When the stack runs out the
//! terminal handler answers.
//!
//! # Continuations without recursion
//!
//! Layers may resume their continuation before returning (the usual case) or
//! later, from any thread. A continuation resumed while the loop for its
//! request is still running only records the request; the loop picks it up
//! once the layer returns. A continuation resumed after the loop has exited
//! becomes the loop. Either way the stack never grows with the number of
//! layers.
//!
//! The terminal is never called by the loop itself. Once the stack runs out
//! it is handed to another thread, so it runs neither inside
//! [`Dispatcher::handle`] nor inside the `next.run()` of the last layer.

use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::config::DispatchConfig;
use crate::error::Error;
use crate::exchange::Exchange;
use crate::executor;
use crate::final_handler::FinalHandler;
use crate::http::{Request, Response};
use crate::layer::{Callback, Handler, IntoHandler, Layer, Stack};
use crate::server::{ConnectionInfo, Server, Service};
use crate::url::{self, Stripped};

/// What runs once a dispatcher has no layers left.
///
/// Receives the exchange (at the dispatcher's own mount-relative URL) and the
/// pending error, if any, and is responsible for answering the request.
pub type Terminal = Box<dyn FnOnce(Exchange, Option<Error>) + Send + 'static>;

/// An ordered, prefix-scoped chain of layers.
///
/// ```
/// use junction::{Dispatcher, Exchange, Handler, Next, StatusCode};
///
/// let mut app = Dispatcher::new();
/// app.register("/api", Handler::request(|ex: Exchange, _next: Next| {
///     ex.send(StatusCode::OK, format!("api saw {}", ex.url()))
/// }));
/// app.layer(Handler::request(|ex: Exchange, _next: Next| {
///     ex.send(StatusCode::OK, "everything else")
/// }));
/// ```
#[derive(Clone, Debug)]
pub struct Dispatcher {
    route: String,
    stack: Arc<Stack>,
    final_handler: FinalHandler,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher {
    /// Creates an empty dispatcher mounted at `/`.
    pub fn new() -> Self {
        Self::with_config(DispatchConfig::default())
    }

    /// Creates an empty dispatcher whose final handler uses `config`.
    pub fn with_config(config: DispatchConfig) -> Self {
        Self {
            route: "/".to_owned(),
            stack: Arc::new(Stack::new()),
            final_handler: FinalHandler::new(config),
        }
    }

    /// Appends a layer at `prefix`.
    ///
    /// A trailing `/` on `prefix` is ignored. Duplicate prefixes are fine;
    /// both layers run, in order.
    pub fn register(&mut self, prefix: &str, handler: impl IntoHandler) -> &mut Self {
        let handler = handler.into_handler(prefix);
        Arc::make_mut(&mut self.stack).push(Layer::new(prefix, handler));
        self
    }

    /// Appends a layer that sees every request.
    pub fn layer(&mut self, handler: impl IntoHandler) -> &mut Self {
        self.register("/", handler)
    }

    /// The prefix this dispatcher is mounted at; `/` unless it was
    /// registered inside another dispatcher.
    pub fn route(&self) -> &str {
        &self.route
    }

    pub(crate) fn set_route(&mut self, route: &str) {
        self.route = route.to_owned();
    }

    /// The layers, in registration order.
    pub fn stack(&self) -> &Stack {
        &self.stack
    }

    /// Number of registered layers, nested dispatchers counting as one.
    pub fn len(&self) -> usize {
        self.stack.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stack.is_empty()
    }

    /// Runs `exchange` through the stack.
    ///
    /// `terminal` replaces the default [`FinalHandler`]. Nested dispatchers
    /// receive the outer continuation here. The terminal always runs on
    /// another thread, after this call and every layer frame have returned.
    pub fn handle(&self, exchange: Exchange, terminal: Option<Terminal>) {
        exchange.capture_original_url();

        let terminal = terminal.unwrap_or_else(|| self.final_handler.clone().into_terminal());
        let run = Arc::new(Run {
            route: self.route.clone(),
            stack: self.stack.clone(),
            state: Mutex::new(RunState {
                frame: DispatchState::new(exchange.url()),
                driving: true,
                awaiting: None,
                pending: None,
            }),
            terminal: Mutex::new(Some(terminal)),
            exchange,
        });

        run.drive(None);
    }

    /// Serves this dispatcher on `addr` until the listener fails.
    pub async fn listen(self, addr: impl Into<String>) -> std::io::Result<()> {
        Server::bind(addr).serve(self).await
    }
}

/// A dispatcher is itself a service, so it can be handed straight to a
/// [`Server`] or mounted inside anything that speaks [`Service`].
impl Service for Dispatcher {
    fn call(&self, request: Request, info: ConnectionInfo) -> Response {
        let (exchange, pending) = Exchange::new(request, info);
        self.handle(exchange, None);

        pending.wait().unwrap_or_else(|err| {
            log::warn!("{}", err);
            FinalHandler::response_for(hyper::StatusCode::INTERNAL_SERVER_ERROR)
        })
    }
}

/// Per-request position in the stack and the URL rewrite currently applied.
#[derive(Debug)]
pub(crate) struct DispatchState {
    index: usize,
    url: String,
    protohost: String,
    removed: String,
    slash_added: bool,
}

/// Where the next step of a dispatch lands.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Step {
    /// The layer at `index` matched; it sees `url`.
    Matched { index: usize, url: String },
    /// No layer is left.
    Exhausted { url: String },
}

impl DispatchState {
    pub(crate) fn new(url: &str) -> Self {
        Self {
            index: 0,
            url: url.to_owned(),
            protohost: url::protohost(url).unwrap_or_default().to_owned(),
            removed: String::new(),
            slash_added: false,
        }
    }

    /// Puts back whatever the previous step stripped.
    fn restore(&mut self) {
        if self.slash_added || !self.removed.is_empty() {
            self.url = url::restore(&self.url, &self.removed, &self.protohost, self.slash_added);
            self.removed.clear();
            self.slash_added = false;
        }
    }

    /// Advances to the next layer whose route matches, stripping its prefix.
    pub(crate) fn advance(&mut self, stack: &Stack) -> Step {
        self.restore();

        loop {
            let Some(layer) = stack.get(self.index) else {
                return Step::Exhausted {
                    url: self.url.clone(),
                };
            };
            let index = self.index;
            self.index += 1;

            if !url::matches_prefix(url::pathname(&self.url), layer.route()) {
                continue;
            }

            if layer.strips() {
                let Stripped {
                    url,
                    removed,
                    slash_added,
                } = url::strip(&self.url, layer.route().len(), &self.protohost);
                self.url = url;
                self.removed = removed;
                self.slash_added = slash_added;
            }

            return Step::Matched {
                index,
                url: self.url.clone(),
            };
        }
    }
}

struct Run {
    route: String,
    stack: Arc<Stack>,
    exchange: Exchange,
    state: Mutex<RunState>,
    terminal: Mutex<Option<Terminal>>,
}

struct RunState {
    frame: DispatchState,
    /// Whether some thread is inside [`Run::drive`] for this request.
    driving: bool,
    /// The layer whose continuation has not been resumed yet.
    awaiting: Option<usize>,
    /// A continuation resumed while the loop was running.
    pending: Option<Option<Error>>,
}

impl Run {
    fn lock(&self) -> MutexGuard<'_, RunState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Walks the stack until a layer keeps the request or the stack runs out.
    ///
    /// The caller must have set `driving`.
    fn drive(self: &Arc<Self>, mut error: Option<Error>) {
        loop {
            let step = self.lock().frame.advance(&self.stack);

            let (index, url) = match step {
                Step::Matched { index, url } => (index, url),
                Step::Exhausted { url } => {
                    self.lock().driving = false;
                    self.finish(url, error);
                    return;
                }
            };

            let Some(layer) = self.stack.get(index) else {
                continue;
            };

            error = match self.call(index, layer, url, error) {
                Some(carry) => carry,
                None => {
                    let mut state = self.lock();
                    match state.pending.take() {
                        Some(resumed) => resumed,
                        None => {
                            state.driving = false;
                            return;
                        }
                    }
                }
            };
        }
    }

    /// Invokes `layer` if it runs on the current track.
    ///
    /// Returns `Some(error)` when the layer was skipped, otherwise `None`
    /// after recording any failure as the layer's continuation.
    fn call(
        self: &Arc<Self>,
        index: usize,
        layer: &Layer,
        url: String,
        error: Option<Error>,
    ) -> Option<Option<Error>> {
        let handler: &Handler = layer.handler();
        let exchange = self.exchange.with_url(&url);

        let invoke: Box<dyn FnOnce(Next) -> crate::Result<()> + '_> =
            match (handler.callback(), error) {
                (Callback::Request(h), None) => {
                    Box::new(move |next: Next| h.handle(exchange, next))
                }
                (Callback::Error(h), Some(err)) => {
                    Box::new(move |next: Next| h.handle(err, exchange, next))
                }
                (_, error) => return Some(error),
            };

        log::debug!(
            "{} {} : {}",
            handler.name(),
            if layer.route().is_empty() { "/" } else { layer.route() },
            self.exchange.original_url()
        );

        self.lock().awaiting = Some(index);
        let next = Next {
            run: self.clone(),
            token: index,
        };

        let fault = match panic::catch_unwind(AssertUnwindSafe(|| invoke(next))) {
            Ok(Ok(())) => None,
            Ok(Err(err)) => Some(err),
            Err(payload) => Some(Error::from_panic(payload)),
        };

        if let Some(err) = fault {
            let mut state = self.lock();
            if state.awaiting == Some(index) {
                state.awaiting = None;
                state.pending = Some(Some(err));
            } else {
                log::error!(
                    "{} failed after resuming its continuation: {}",
                    handler.name(),
                    err
                );
            }
        }

        None
    }

    fn finish(&self, url: String, error: Option<Error>) {
        let terminal = self
            .terminal
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        match terminal {
            Some(terminal) => {
                let exchange = self.exchange.with_url(&url);
                executor::defer(move || terminal(exchange, error));
            }
            None => log::warn!("dispatcher at {} finished twice", self.route),
        }
    }
}

/// The continuation handed to each layer.
///
/// Resume it exactly once: [`run`](Next::run) to continue normally,
/// [`fail`](Next::fail) to switch to the error track. Dropping it without
/// resuming stops the chain, which is right when the layer has answered the
/// request itself.
pub struct Next {
    run: Arc<Run>,
    token: usize,
}

impl Next {
    /// Continues with the next matching layer.
    pub fn run(self) {
        self.resume(None)
    }

    /// Continues on the error track with `error`.
    pub fn fail(self, error: impl Into<Error>) {
        self.resume(Some(error.into()))
    }

    /// Continues, with or without an error.
    pub fn resume(self, error: Option<Error>) {
        let run = self.run;
        {
            let mut state = run.lock();
            if state.awaiting != Some(self.token) {
                log::warn!(
                    "continuation of layer {} in {} resumed more than once",
                    self.token,
                    run.route
                );
                return;
            }
            state.awaiting = None;

            if state.driving {
                state.pending = Some(error);
                return;
            }
            state.driving = true;
        }

        run.drive(error);
    }

    /// Turns this continuation into the terminal of a nested dispatcher.
    pub fn into_terminal(self) -> Terminal {
        Box::new(move |_exchange: Exchange, error: Option<Error>| self.resume(error))
    }

}

impl std::fmt::Debug for Next {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Next")
            .field("route", &self.run.route)
            .field("layer", &self.token)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Environment;
    use crate::exchange::Pending;
    use crate::http::Body;
    use hyper::StatusCode;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::time::Duration;

    type Log = Arc<Mutex<Vec<String>>>;

    fn quiet() -> Dispatcher {
        Dispatcher::with_config(DispatchConfig::for_env(Environment::Test))
    }

    fn exchange(uri: &str) -> (Exchange, Pending) {
        let request = hyper::Request::builder()
            .uri(uri)
            .body(Body::empty())
            .unwrap();
        Exchange::new(request, ConnectionInfo::default())
    }

    /// A layer that records `name url` and continues.
    fn record(log: &Log, name: &'static str) -> Handler {
        let log = log.clone();
        Handler::request(move |ex: Exchange, next: Next| {
            log.lock().unwrap().push(format!("{} {}", name, ex.url()));
            next.run();
            Ok(())
        })
    }

    fn reply(text: &'static str) -> Handler {
        Handler::request(move |ex: Exchange, _next: Next| ex.send(StatusCode::OK, text))
    }

    fn body_of(pending: Pending) -> (StatusCode, String) {
        let response = pending.wait().unwrap();
        let status = response.status();
        let bytes = response.into_body().into_bytes().unwrap();
        (status, String::from_utf8(bytes.to_vec()).unwrap())
    }

    /// Dispatches `uri` with a terminal that reports its error on a channel.
    fn dispatch_to_channel(app: &Dispatcher, uri: &str) -> mpsc::Receiver<Option<String>> {
        let (tx, rx) = mpsc::channel();
        let (ex, _pending) = exchange(uri);
        app.handle(
            ex,
            Some(Box::new(move |_ex: Exchange, err: Option<Error>| {
                tx.send(err.map(|e| e.to_string())).unwrap();
            })),
        );
        rx
    }

    /// `/api` takes its own requests stripped; everything else falls through to
    /// `/`.
    #[test]
    fn test_mount_scenario() {
        let seen: Log = Default::default();
        let mut app = quiet();

        let log = seen.clone();
        app.register(
            "/api",
            Handler::request(move |ex: Exchange, _next: Next| {
                log.lock().unwrap().push(format!("A {}", ex.url()));
                ex.send(StatusCode::OK, "A")
            }),
        );
        let log = seen.clone();
        app.register(
            "/",
            Handler::request(move |ex: Exchange, _next: Next| {
                log.lock().unwrap().push(format!("B {}", ex.url()));
                ex.send(StatusCode::OK, "B")
            }),
        );

        let (ex, pending) = exchange("/api/users");
        app.handle(ex, None);
        assert_eq!(body_of(pending), (StatusCode::OK, "A".to_owned()));

        let (ex, pending) = exchange("/other");
        app.handle(ex, None);
        assert_eq!(body_of(pending), (StatusCode::OK, "B".to_owned()));

        assert_eq!(*seen.lock().unwrap(), ["A /users", "B /other"]);
    }

    /// `/foobar` is not inside `/foo`; `.`, `/` and case differences are.
    #[test]
    fn test_boundary_mismatch_skips() {
        let seen: Log = Default::default();
        let mut app = quiet();
        app.register("/foo", record(&seen, "foo"));
        app.layer(reply("root"));

        for uri in ["/foobar", "/foo", "/foo/bar", "/foo.json", "/FOO/x"] {
            let (ex, pending) = exchange(uri);
            app.handle(ex, None);
            assert_eq!(body_of(pending).1, "root");
        }

        assert_eq!(
            *seen.lock().unwrap(),
            ["foo /", "foo /bar", "foo /.json", "foo /x"]
        );
    }

    /// Layers run in registration order.
    #[test]
    fn test_order_preserved() {
        let seen: Log = Default::default();
        let mut app = quiet();
        app.layer(record(&seen, "A"))
            .layer(record(&seen, "B"))
            .layer(record(&seen, "C"));

        let rx = dispatch_to_channel(&app, "/x");
        assert_eq!(rx.recv().unwrap(), None);
        assert_eq!(*seen.lock().unwrap(), ["A /x", "B /x", "C /x"]);
    }

    /// Two layers on the same prefix both run, trailing slash or not.
    #[test]
    fn test_duplicate_prefixes_both_fire() {
        let seen: Log = Default::default();
        let mut app = quiet();
        app.register("/dup", record(&seen, "first"));
        app.register("/dup/", record(&seen, "second"));

        let rx = dispatch_to_channel(&app, "/dup/page");
        assert_eq!(rx.recv().unwrap(), None);
        assert_eq!(*seen.lock().unwrap(), ["first /page", "second /page"]);
    }

    /// Each layer sees the URL relative to its own mount, never a neighbour's.
    #[test]
    fn test_url_restored_between_layers() {
        let seen: Log = Default::default();
        let mut app = quiet();
        app.register("/a", record(&seen, "a"));
        app.register("/a/b", record(&seen, "ab"));
        app.layer(record(&seen, "root"));

        let rx = dispatch_to_channel(&app, "/a/b/c?q=1");
        assert_eq!(rx.recv().unwrap(), None);
        assert_eq!(
            *seen.lock().unwrap(),
            ["a /b/c?q=1", "ab /c?q=1", "root /a/b/c?q=1"]
        );
    }

    /// Scheme and host stay put while the path is stripped.
    #[test]
    fn test_fully_qualified_url() {
        let seen: Log = Default::default();
        let mut app = quiet();
        app.register("/api", record(&seen, "api"));
        app.layer(record(&seen, "root"));

        let rx = dispatch_to_channel(&app, "http://example.com/api/users");
        assert_eq!(rx.recv().unwrap(), None);
        assert_eq!(
            *seen.lock().unwrap(),
            [
                "api http://example.com/users",
                "root http://example.com/api/users"
            ]
        );
    }

    /// After a failure normal layers are skipped until an error layer recovers.
    #[test]
    fn test_error_track_isolation() {
        let seen: Log = Default::default();
        let mut app = quiet();
        app.layer(record(&seen, "A"));
        app.layer(Handler::request(|_ex: Exchange, _next: Next| {
            Err(Error::with_status(StatusCode::CONFLICT, "B failed"))
        }));
        app.layer(record(&seen, "C"));

        let log = seen.clone();
        app.layer(Handler::error(move |err: Error, _ex: Exchange, next: Next| {
            log.lock().unwrap().push(format!("D {}", err));
            next.run();
            Ok(())
        }));
        app.layer(record(&seen, "E"));

        let rx = dispatch_to_channel(&app, "/");
        assert_eq!(rx.recv().unwrap(), None);
        assert_eq!(*seen.lock().unwrap(), ["A /", "D B failed", "E /"]);
    }

    /// With no error layer the terminal receives the error.
    #[test]
    fn test_unhandled_error_reaches_terminal() {
        let seen: Log = Default::default();
        let mut app = quiet();
        app.layer(Handler::request(|_ex: Exchange, next: Next| {
            next.fail(Error::with_status(StatusCode::BAD_REQUEST, "bad input"));
            Ok(())
        }));
        app.layer(record(&seen, "skipped"));

        let rx = dispatch_to_channel(&app, "/");
        assert_eq!(rx.recv().unwrap(), Some("bad input".to_owned()));
        assert!(seen.lock().unwrap().is_empty());
    }

    /// Error layers do not run on the normal track.
    #[test]
    fn test_error_layer_skipped_without_error() {
        let seen: Log = Default::default();
        let mut app = quiet();
        let log = seen.clone();
        app.layer(Handler::error(move |_err: Error, _ex: Exchange, next: Next| {
            log.lock().unwrap().push("error layer".to_owned());
            next.run();
            Ok(())
        }));
        app.layer(record(&seen, "normal"));

        let rx = dispatch_to_channel(&app, "/");
        assert_eq!(rx.recv().unwrap(), None);
        assert_eq!(*seen.lock().unwrap(), ["normal /"]);
    }

    /// A failing error layer replaces the error it was given.
    #[test]
    fn test_thrown_error_replaces_prior_error() {
        let mut app = quiet();
        app.layer(Handler::request(|_ex: Exchange, next: Next| {
            next.fail(Error::with_status(StatusCode::BAD_REQUEST, "first"));
            Ok(())
        }));
        app.layer(Handler::error(|_err: Error, _ex: Exchange, _next: Next| {
            Err(Error::with_status(StatusCode::BAD_GATEWAY, "second"))
        }));

        let rx = dispatch_to_channel(&app, "/");
        assert_eq!(rx.recv().unwrap(), Some("second".to_owned()));
    }

    /// A panicking layer is turned into `Error::Panic`.
    #[test]
    fn test_panic_becomes_error() {
        let mut app = quiet();
        app.layer(Handler::request(|_ex: Exchange, _next: Next| {
            panic!("layer exploded");
        }));

        let rx = dispatch_to_channel(&app, "/");
        assert_eq!(
            rx.recv().unwrap(),
            Some("handler panicked: layer exploded".to_owned())
        );
    }

    /// An `Err` returned after `next.run()` does not reroute the chain.
    #[test]
    fn test_failure_after_resume_is_dropped() {
        let seen: Log = Default::default();
        let mut app = quiet();
        app.layer(Handler::request(|_ex: Exchange, next: Next| {
            next.run();
            Err(Error::with_status(StatusCode::INTERNAL_SERVER_ERROR, "late"))
        }));
        app.layer(record(&seen, "after"));

        let rx = dispatch_to_channel(&app, "/");
        assert_eq!(rx.recv().unwrap(), None);
        assert_eq!(*seen.lock().unwrap(), ["after /"]);
    }

    /// An empty dispatcher calls its terminal exactly once, without an error.
    #[test]
    fn test_exhaustion_calls_terminal_once() {
        let app = quiet();
        let rx = dispatch_to_channel(&app, "/anything");
        assert_eq!(rx.recv().unwrap(), None);
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
    }

    /// Without a custom terminal the final handler answers 404.
    #[test]
    fn test_default_terminal_answers_not_found() {
        let app = quiet();
        let (ex, pending) = exchange("/missing?x=1");
        app.handle(ex, None);

        let (status, body) = body_of(pending);
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body.contains("Cannot GET /missing"));
    }

    /// A continuation resumed later from another thread finishes the chain.
    #[test]
    fn test_async_continuation() {
        let seen: Log = Default::default();
        let mut app = quiet();
        app.layer(Handler::request(|_ex: Exchange, next: Next| {
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(20));
                next.run();
            });
            Ok(())
        }));
        app.layer(record(&seen, "later"));
        app.layer(reply("done"));

        let (ex, pending) = exchange("/slow");
        app.handle(ex, None);

        assert_eq!(body_of(pending).1, "done");
        assert_eq!(*seen.lock().unwrap(), ["later /slow"]);
    }

    /// Far more synchronous continuations than a recursive design could
    /// survive on a test thread's stack.
    #[test]
    fn test_many_sync_layers() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut app = quiet();
        for _ in 0..50_000 {
            let counter = counter.clone();
            app.layer(Handler::request(move |_ex: Exchange, next: Next| {
                counter.fetch_add(1, Ordering::Relaxed);
                next.run();
                Ok(())
            }));
        }

        let rx = dispatch_to_channel(&app, "/");
        assert_eq!(rx.recv().unwrap(), None);
        assert_eq!(counter.load(Ordering::Relaxed), 50_000);
    }

    /// A nested dispatcher strips its own prefix and hands back to the outer
    /// stack; `original_url` stays the outermost one.
    #[test]
    fn test_nested_dispatcher() {
        let seen: Log = Default::default();

        let mut blog = quiet();
        let log = seen.clone();
        blog.register(
            "/posts",
            Handler::request(move |ex: Exchange, next: Next| {
                log.lock()
                    .unwrap()
                    .push(format!("posts {} {}", ex.url(), ex.original_url()));
                next.run();
                Ok(())
            }),
        );

        let mut app = quiet();
        app.register("/blog/", blog);
        let log = seen.clone();
        app.layer(Handler::request(move |ex: Exchange, _next: Next| {
            log.lock()
                .unwrap()
                .push(format!("root {} {}", ex.url(), ex.original_url()));
            ex.send(StatusCode::OK, "root")
        }));

        let (ex, pending) = exchange("/blog/posts/1");
        app.handle(ex, None);

        assert_eq!(body_of(pending).1, "root");
        assert_eq!(
            *seen.lock().unwrap(),
            [
                "posts /1 /blog/posts/1",
                "root /blog/posts/1 /blog/posts/1"
            ]
        );
    }

    /// Errors escaping a nested dispatcher continue on the outer error track.
    #[test]
    fn test_nested_error_propagates_out() {
        let mut inner = quiet();
        inner.layer(Handler::request(|_ex: Exchange, _next: Next| {
            Err(Error::with_status(StatusCode::UNAUTHORIZED, "inner failed"))
        }));

        let mut app = quiet();
        app.register("/inner", inner);
        app.layer(Handler::error(|err: Error, ex: Exchange, _next: Next| {
            ex.send(StatusCode::OK, format!("recovered: {}", err))
        }));

        let (ex, pending) = exchange("/inner/x");
        app.handle(ex, None);
        assert_eq!(body_of(pending).1, "recovered: inner failed");
    }

    /// A nested dispatcher registers as one `dispatcher` layer.
    #[test]
    fn test_mount_route_recorded() {
        let mut inner = quiet();
        inner.set_route("/ignored");
        let mut app = quiet();
        app.register("/admin", inner);

        assert_eq!(app.len(), 1);
        assert_eq!(app.stack().get(0).unwrap().handler().name(), "dispatcher");
        assert_eq!(app.route(), "/");
    }

    /// A plain service mounted as a layer sees the mount-relative URI.
    #[test]
    fn test_listener_layer() {
        let mut app = quiet();
        app.register(
            "/legacy",
            crate::layer::Listener(|request: Request, _info: ConnectionInfo| {
                Response::new(Body::new(format!("legacy {}", request.uri())))
            }),
        );

        let (ex, pending) = exchange("/legacy/status?v=1");
        app.handle(ex, None);
        assert_eq!(body_of(pending).1, "legacy /status?v=1");
    }

    /// Used as a `Service`, a dispatcher answers matches and 404s.
    #[test]
    fn test_dispatcher_as_service() {
        let mut app = quiet();
        app.register("/hello", reply("hi"));

        let request = hyper::Request::builder()
            .uri("/hello")
            .body(Body::empty())
            .unwrap();
        let response = app.call(request, ConnectionInfo::default());
        assert_eq!(response.status(), StatusCode::OK);

        let request = hyper::Request::builder()
            .uri("/nope")
            .body(Body::empty())
            .unwrap();
        let response = app.call(request, ConnectionInfo::default());
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    /// A layer that neither answers nor continues drops the exchange: 500.
    #[test]
    fn test_dropped_request_yields_500() {
        let mut app = quiet();
        app.layer(Handler::request(|_ex: Exchange, _next: Next| Ok(())));

        let request = hyper::Request::builder()
            .uri("/")
            .body(Body::empty())
            .unwrap();
        let response = app.call(request, ConnectionInfo::default());
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    /// The terminal of an empty dispatcher runs on another thread, after
    /// `handle` has returned.
    #[test]
    fn test_terminal_runs_after_handle_returns() {
        let returned = Arc::new(AtomicBool::new(false));
        let (report_tx, report_rx) = mpsc::channel();
        let (gate_tx, gate_rx) = mpsc::channel::<()>();

        let seen = returned.clone();
        let (ex, _pending) = exchange("/");
        quiet().handle(
            ex,
            Some(Box::new(move |_ex: Exchange, _err: Option<Error>| {
                let _ = gate_rx.recv_timeout(Duration::from_secs(5));
                report_tx
                    .send((std::thread::current().id(), seen.load(Ordering::SeqCst)))
                    .unwrap();
            })),
        );
        returned.store(true, Ordering::SeqCst);
        gate_tx.send(()).unwrap();

        let (thread, after_handle) = report_rx.recv().unwrap();
        assert_ne!(thread, std::thread::current().id());
        assert!(after_handle);
    }

    /// A layer resuming from its own thread gets `next.run()` back before
    /// the terminal runs.
    #[test]
    fn test_terminal_runs_after_async_next_returns() {
        let resuming = Arc::new(AtomicBool::new(false));
        let (report_tx, report_rx) = mpsc::channel();
        let (gate_tx, gate_rx) = mpsc::channel::<()>();
        let gate = Mutex::new(gate_tx);

        let mut app = quiet();
        let flag = resuming.clone();
        app.layer(Handler::request(move |_ex: Exchange, next: Next| {
            let flag = flag.clone();
            let gate = gate.lock().unwrap().clone();
            std::thread::spawn(move || {
                flag.store(true, Ordering::SeqCst);
                next.run();
                flag.store(false, Ordering::SeqCst);
                gate.send(()).unwrap();
            });
            Ok(())
        }));

        let flag = resuming.clone();
        let (ex, _pending) = exchange("/");
        app.handle(
            ex,
            Some(Box::new(move |_ex: Exchange, _err: Option<Error>| {
                let _ = gate_rx.recv_timeout(Duration::from_secs(5));
                report_tx.send(flag.load(Ordering::SeqCst)).unwrap();
            })),
        );

        let inside_next = report_rx.recv().unwrap();
        assert!(!inside_next);
    }

    /// Stepping the state directly: match, restore, exhaust.
    #[test]
    fn test_state_advance() {
        let mut stack = Stack::new();
        stack.push(Layer::new("/x", reply("x")));
        stack.push(Layer::new("/", reply("root")));

        let mut state = DispatchState::new("/x/y");
        assert_eq!(
            state.advance(&stack),
            Step::Matched {
                index: 0,
                url: "/y".to_owned()
            }
        );
        assert_eq!(
            state.advance(&stack),
            Step::Matched {
                index: 1,
                url: "/x/y".to_owned()
            }
        );
        assert_eq!(
            state.advance(&stack),
            Step::Exhausted {
                url: "/x/y".to_owned()
            }
        );
    }
}
