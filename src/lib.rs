#![allow(clippy::return_self_not_must_use)]

//! # Junction
//!
//! An ordered, prefix-scoped middleware dispatcher served over hyper.
//!
//! ## Features
//! - Layers mounted at path prefixes, run in registration order
//! - Mount-relative URLs: a layer at `/api` sees `/api/users` as `/users`
//! - Separate normal and error tracks, chosen per layer at registration
//! - Nested dispatchers that hand control back to the outer stack
//! - Continuations that may be resumed later, from any thread
//! - A final handler answering `404` or the error's status
//!
//! ## Example
//! ```no_run
//! use junction::{Dispatcher, Error, Exchange, Handler, Next, StatusCode};
//!
//! #[tokio::main]
//! async fn main() -> std::io::Result<()> {
//!     let mut api = Dispatcher::new();
//!     api.register("/users", Handler::request(|ex: Exchange, _next: Next| {
//!         ex.send(StatusCode::OK, format!("users at {}", ex.url()))
//!     }));
//!
//!     let mut app = Dispatcher::new();
//!     app.register("/api", api);
//!     app.layer(Handler::error(|err: Error, ex: Exchange, _next: Next| {
//!         ex.send(StatusCode::BAD_GATEWAY, err.to_string())
//!     }));
//!
//!     app.listen("127.0.0.1:3000").await
//! }
//! ```
//!
//! ## Architecture
//! - `Dispatcher`: the layer stack and the dispatch loop
//! - `Next`: the continuation each layer resumes to move on
//! - `FinalHandler`: answers requests that fall off the stack
//! - `Server`: accepts connections and runs any `Service` on tokio's
//!   blocking pool
//!
//! ## Configuration
//! Server and dispatch settings are read from:
//! - Environment variables (prefixed with `JUNCTION_`, a `.env` file is honored)
//! - An optional `junction` configuration file
//! - A hand-built [`ServerConfig`] passed to `Server::from_config` or
//!   `Server::with_config`
//!
//! ## Features
//! - `http2`: Enables HTTP/2 support (enabled by default)

pub use crate::config::{DispatchConfig, Environment, ServerConfig};
pub use crate::dispatch::{Dispatcher, Next, Terminal};
pub use crate::error::{Error, Result};
pub use crate::exchange::{Exchange, Pending};
pub use crate::final_handler::FinalHandler;
pub use crate::http::{Body, Bytes, Request, Response, ResponseBuilder};
pub use crate::inject::Injector;
pub use crate::layer::{
    ErrorHandler, Handler, IntoHandler, Layer, LayerKind, Listener, RequestHandler, Stack,
};
pub use crate::server::{ConnectionInfo, Server, Service};

pub mod inject;
pub mod url;

mod config;
mod dispatch;
mod error;
mod exchange;
mod executor;
mod final_handler;
mod http;
mod layer;
mod server;

// Re-export common types
pub use hyper;
pub use hyper::{Method, StatusCode};
