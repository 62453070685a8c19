//! The request/response pair a dispatcher hands from layer to layer.
//!
//! A layer answers through [`Exchange::respond`]; whoever created the
//! exchange receives that answer through the matching [`Pending`].

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::task::{Context, Poll};

use futures::channel::oneshot;
use hyper::header::HeaderMap;
use hyper::{Method, StatusCode, Uri, Version};

use crate::error::{Error, Result};
use crate::executor::Parker;
use crate::http::{Body, Request, Response, ResponseBuilder};
use crate::server::ConnectionInfo;
use crate::url;

/// One request travelling through a dispatcher, and the way to answer it.
///
/// An `Exchange` is a cheap handle: cloning it shares the same request and
/// responder. Each layer receives its own view whose [`url`](Exchange::url)
/// is relative to that layer's mount point; the request head itself is
/// never rewritten.
#[derive(Clone)]
pub struct Exchange {
    shared: Arc<Shared>,
    url: Arc<str>,
}

struct Shared {
    method: Method,
    uri: Uri,
    version: Version,
    headers: HeaderMap,
    body: Mutex<Option<Body>>,
    info: ConnectionInfo,
    original_url: OnceLock<String>,
    responder: Mutex<Option<oneshot::Sender<Response>>>,
}

impl Exchange {
    /// Wraps a request, returning the exchange and the handle that
    /// eventually yields its response.
    pub fn new(request: Request, info: ConnectionInfo) -> (Exchange, Pending) {
        let (parts, body) = request.into_parts();
        let (tx, rx) = oneshot::channel();
        let url: Arc<str> = parts.uri.to_string().into();

        let shared = Arc::new(Shared {
            method: parts.method,
            uri: parts.uri,
            version: parts.version,
            headers: parts.headers,
            body: Mutex::new(Some(body)),
            info,
            original_url: OnceLock::new(),
            responder: Mutex::new(Some(tx)),
        });

        (Exchange { shared, url }, Pending { rx })
    }

    /// The request URL as seen from the current mount point.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// The path component of [`url`](Exchange::url).
    pub fn path(&self) -> &str {
        url::pathname(&self.url)
    }

    /// The URL the request arrived with, before any mount stripped it.
    pub fn original_url(&self) -> &str {
        self.shared
            .original_url
            .get()
            .map(String::as_str)
            .unwrap_or(self.url())
    }

    /// The request method.
    pub fn method(&self) -> &Method {
        &self.shared.method
    }

    /// The request URI exactly as received.
    pub fn uri(&self) -> &Uri {
        &self.shared.uri
    }

    pub fn version(&self) -> Version {
        self.shared.version
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.shared.headers
    }

    /// Details of the connection the request arrived on.
    pub fn info(&self) -> &ConnectionInfo {
        &self.shared.info
    }

    /// Takes the request body. Later calls return `None`.
    pub fn take_body(&self) -> Option<Body> {
        self.shared
            .body
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Whether a response has already been sent.
    pub fn is_finished(&self) -> bool {
        self.shared
            .responder
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }

    /// Answers the request. Only the first response is delivered.
    ///
    /// # Errors
    /// Returns [`Error::AlreadySent`] if the exchange was already answered.
    pub fn respond(&self, response: Response) -> Result<()> {
        let sender = self
            .shared
            .responder
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(Error::AlreadySent)?;

        if sender.send(response).is_err() {
            log::debug!("client went away before {} was answered", self.original_url());
        }
        Ok(())
    }

    /// Answers with `status` and a plain-text body.
    pub fn send(&self, status: StatusCode, body: impl Into<Body>) -> Result<()> {
        let response = ResponseBuilder::new()
            .status(status)
            .header("Content-Type", "text/plain; charset=utf-8")
            .body(body.into())?;
        self.respond(response)
    }

    /// Rebuilds a standalone request whose URI is the mount-relative URL.
    ///
    /// The body is moved into the new request; it is empty if a previous
    /// layer already took it.
    pub fn to_request(&self) -> Result<Request> {
        let mut request = hyper::Request::builder()
            .method(self.shared.method.clone())
            .uri(self.url())
            .version(self.shared.version)
            .body(self.take_body().unwrap_or_default())?;
        *request.headers_mut() = self.shared.headers.clone();
        Ok(request)
    }

    /// Records the URL this exchange arrived with. Only the first call,
    /// made by the outermost dispatcher, has any effect.
    pub(crate) fn capture_original_url(&self) {
        self.shared
            .original_url
            .get_or_init(|| self.url.to_string());
    }

    /// A view of the same exchange at another mount-relative URL.
    pub(crate) fn with_url(&self, url: &str) -> Exchange {
        Exchange {
            shared: self.shared.clone(),
            url: url.into(),
        }
    }
}

impl std::fmt::Debug for Exchange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Exchange")
            .field("method", &self.shared.method)
            .field("url", &self.url)
            .field("original_url", &self.original_url())
            .finish()
    }
}

/// The response side of an [`Exchange`].
///
/// Resolves once a layer or the final handler answers. If every handle to
/// the exchange is dropped first, it resolves to [`Error::Dropped`].
#[derive(Debug)]
pub struct Pending {
    rx: oneshot::Receiver<Response>,
}

impl Pending {
    /// Blocks the current thread until the response is available.
    pub fn wait(self) -> Result<Response> {
        Parker::new().block_on(self)
    }
}

impl Future for Pending {
    type Output = Result<Response>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|res| res.map_err(|_| Error::Dropped))
    }
}
