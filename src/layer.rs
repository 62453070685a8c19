//! Layers and the ordered stack a dispatcher walks.

use std::fmt;
use std::sync::Arc;

use crate::dispatch::{Dispatcher, Next};
use crate::error::{Error, Result};
use crate::exchange::Exchange;
use crate::server::Service;

/// A layer that handles requests while no error is pending.
pub trait RequestHandler: Send + Sync + 'static {
    fn handle(&self, exchange: Exchange, next: Next) -> Result<()>;
}

impl<F> RequestHandler for F
where
    F: Fn(Exchange, Next) -> Result<()> + Send + Sync + 'static,
{
    fn handle(&self, exchange: Exchange, next: Next) -> Result<()> {
        self(exchange, next)
    }
}

/// A layer that only runs while an error is pending.
///
/// Calling `next.run()` clears the error and puts the request back on the
/// normal track; `next.fail(err)` passes an error on.
pub trait ErrorHandler: Send + Sync + 'static {
    fn handle(&self, error: Error, exchange: Exchange, next: Next) -> Result<()>;
}

impl<F> ErrorHandler for F
where
    F: Fn(Error, Exchange, Next) -> Result<()> + Send + Sync + 'static,
{
    fn handle(&self, error: Error, exchange: Exchange, next: Next) -> Result<()> {
        self(error, exchange, next)
    }
}

/// Which track a layer runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerKind {
    /// Runs while no error is pending.
    Normal,
    /// Runs only while an error is pending.
    Error,
}

#[derive(Clone)]
pub(crate) enum Callback {
    Request(Arc<dyn RequestHandler>),
    Error(Arc<dyn ErrorHandler>),
}

/// A handler tagged with the track it runs on.
#[derive(Clone)]
pub struct Handler {
    name: &'static str,
    callback: Callback,
}

impl Handler {
    /// A handler for the normal track.
    pub fn request<F>(handler: F) -> Self
    where
        F: Fn(Exchange, Next) -> Result<()> + Send + Sync + 'static,
    {
        Self::from_request(handler)
    }

    /// A handler for the error track.
    pub fn error<F>(handler: F) -> Self
    where
        F: Fn(Error, Exchange, Next) -> Result<()> + Send + Sync + 'static,
    {
        Self::from_error(handler)
    }

    pub fn from_request<H: RequestHandler>(handler: H) -> Self {
        Self {
            name: std::any::type_name::<H>(),
            callback: Callback::Request(Arc::new(handler)),
        }
    }

    pub fn from_error<H: ErrorHandler>(handler: H) -> Self {
        Self {
            name: std::any::type_name::<H>(),
            callback: Callback::Error(Arc::new(handler)),
        }
    }

    /// Overrides the name used in debug logs.
    pub fn named(mut self, name: &'static str) -> Self {
        self.name = name;
        self
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn kind(&self) -> LayerKind {
        match self.callback {
            Callback::Request(_) => LayerKind::Normal,
            Callback::Error(_) => LayerKind::Error,
        }
    }

    pub(crate) fn callback(&self) -> &Callback {
        &self.callback
    }
}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handler")
            .field("name", &self.name)
            .field("kind", &self.kind())
            .finish()
    }
}

/// Anything that can be registered on a dispatcher.
///
/// `mount` is the prefix the handler is registered under, as given by the
/// caller.
pub trait IntoHandler {
    fn into_handler(self, mount: &str) -> Handler;
}

impl IntoHandler for Handler {
    fn into_handler(self, _mount: &str) -> Handler {
        self
    }
}

/// A nested dispatcher is mounted as a single layer. When it runs out of
/// layers, dispatch resumes in the outer dispatcher.
impl IntoHandler for Dispatcher {
    fn into_handler(mut self, mount: &str) -> Handler {
        self.set_route(mount);
        let app = Arc::new(self);

        Handler::request(move |exchange: Exchange, next: Next| {
            app.handle(exchange, Some(next.into_terminal()));
            Ok(())
        })
        .named("dispatcher")
    }
}

/// Adapts a plain [`Service`] into a layer.
///
/// The service sees the request with its URI relative to the mount point and
/// always answers it; layers after it never run for the requests it takes.
pub struct Listener<S>(pub S);

impl<S: Service> IntoHandler for Listener<S> {
    fn into_handler(self, _mount: &str) -> Handler {
        let service = self.0;

        Handler::request(move |exchange: Exchange, _next: Next| {
            let request = exchange.to_request()?;
            let response = service.call(request, exchange.info().clone());
            exchange.respond(response)
        })
        .named(std::any::type_name::<S>())
    }
}

/// A handler bound to the prefix it is mounted at.
#[derive(Clone, Debug)]
pub struct Layer {
    route: String,
    handler: Handler,
}

impl Layer {
    /// Creates a layer; one trailing `/` is trimmed from `route`, so `/`
    /// becomes the empty root route.
    pub fn new(route: &str, handler: Handler) -> Self {
        let route = route.strip_suffix('/').unwrap_or(route);
        Self {
            route: route.to_owned(),
            handler,
        }
    }

    /// The mount prefix, without its trailing `/`.
    pub fn route(&self) -> &str {
        &self.route
    }

    pub fn handler(&self) -> &Handler {
        &self.handler
    }

    /// The track this layer's handler runs on.
    pub fn kind(&self) -> LayerKind {
        self.handler.kind()
    }

    /// Whether matching this layer rewrites the URL.
    pub(crate) fn strips(&self) -> bool {
        !self.route.is_empty() && self.route != "/"
    }
}

/// Layers in registration order.
#[derive(Clone, Debug, Default)]
pub struct Stack {
    layers: Vec<Layer>,
}

impl Stack {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `layer`; it runs after every layer already on the stack.
    pub fn push(&mut self, layer: Layer) {
        log::debug!(
            "use {} {}",
            if layer.route.is_empty() { "/" } else { &layer.route },
            layer.handler.name()
        );
        self.layers.push(layer);
    }

    /// The layer at `index`, counting from the first registered.
    pub fn get(&self, index: usize) -> Option<&Layer> {
        self.layers.get(index)
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Layer> {
        self.layers.iter()
    }
}
