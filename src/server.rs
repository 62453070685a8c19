//! The listening adapter. Connections are accepted with tokio and served
//! with hyper; each blocking [`Service`] call runs on tokio's blocking pool.

use std::convert::Infallible;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use hyper::server::conn::Http;
use hyper::service::service_fn;
use hyper::StatusCode;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;

use crate::config::ServerConfig;
use crate::executor::TokioExecutor;
use crate::final_handler::FinalHandler;
use crate::http::{Body, Request, Response};

/// Details about the connection a request came in on.
#[derive(Debug, Clone, Default)]
pub struct ConnectionInfo {
    peer_addr: Option<SocketAddr>,
}

impl ConnectionInfo {
    pub(crate) fn new(peer_addr: SocketAddr) -> Self {
        Self {
            peer_addr: Some(peer_addr),
        }
    }

    /// The address of the remote client, when known.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }
}

/// A blocking request handler.
///
/// Calls run on tokio's blocking pool, so a service is free to block while
/// it produces its response. Closures of the right shape are services:
///
/// ```
/// use junction::{Body, ConnectionInfo, Request, Response, Service};
///
/// fn assert_service(_: impl Service) {}
/// assert_service(|_req: Request, _info: ConnectionInfo| Response::new(Body::new("hi")));
/// ```
pub trait Service: Send + Sync + 'static {
    fn call(&self, request: Request, info: ConnectionInfo) -> Response;
}

impl<F> Service for F
where
    F: Fn(Request, ConnectionInfo) -> Response + Send + Sync + 'static,
{
    fn call(&self, request: Request, info: ConnectionInfo) -> Response {
        self(request, info)
    }
}

/// The listening adapter: accepts TCP connections and serves them with hyper.
///
/// ```no_run
/// use junction::{Body, ConnectionInfo, Request, Response, Server};
///
/// #[tokio::main]
/// async fn main() -> std::io::Result<()> {
///     Server::bind("127.0.0.1:3000")
///         .serve(|_req: Request, _info: ConnectionInfo| {
///             Response::new(Body::new("Hello World!"))
///         })
///         .await
/// }
/// ```
#[derive(Debug, Clone)]
pub struct Server {
    addr: String,
    config: ServerConfig,
}

impl Server {
    /// A server for `addr` with the default configuration.
    pub fn bind(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            config: ServerConfig::default(),
        }
    }

    /// A server bound to the host and port named in `config`.
    pub fn from_config(config: ServerConfig) -> Self {
        Self {
            addr: config.address(),
            config,
        }
    }

    /// Replaces the configuration, keeping the bind address.
    pub fn with_config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    /// The configuration connections will be served with.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// The address `serve` binds to.
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Builds a multi-threaded runtime sized by the configuration and serves
    /// `service` on it, blocking the calling thread.
    ///
    /// Each in-flight request may hold a second blocking thread while a
    /// dispatcher's deferred final handler runs, so the blocking pool is
    /// twice `max_workers`.
    pub fn run<S: Service>(self, service: S) -> io::Result<()> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .thread_name("junction-worker")
            .max_blocking_threads(self.config.max_workers.max(1) * 2)
            .thread_keep_alive(self.config.worker_keep_alive())
            .build()?;

        runtime.block_on(self.serve(service))
    }

    /// Binds the listener and serves `service` until accepting fails.
    pub async fn serve<S: Service>(self, service: S) -> io::Result<()> {
        let listener = TcpListener::bind(&self.addr).await?;
        log::info!("listening on {}", listener.local_addr()?);
        self.serve_listener(listener, service).await
    }

    /// Serves `service` on an already bound listener.
    ///
    /// # Errors
    /// `InvalidInput` when the configuration holds a value hyper cannot use,
    /// otherwise the error that stopped the accept loop.
    pub async fn serve_listener<S: Service>(
        self,
        listener: TcpListener,
        service: S,
    ) -> io::Result<()> {
        self.config
            .validate()
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err))?;

        let service = Arc::new(service);
        let permits = Arc::new(Semaphore::new(self.config.max_workers.max(1)));
        let http = Arc::new(self.http());

        loop {
            let (stream, peer) = listener.accept().await?;
            if let Err(err) = stream.set_nodelay(true) {
                log::debug!("could not set TCP_NODELAY for {}: {}", peer, err);
            }

            let info = ConnectionInfo::new(peer);
            let service = service.clone();
            let permits = permits.clone();
            let http = http.clone();

            tokio::spawn(async move {
                let handler = service_fn(move |request: hyper::Request<hyper::Body>| {
                    let service = service.clone();
                    let permits = permits.clone();
                    let info = info.clone();

                    async move {
                        let request = request.map(Body);
                        Ok::<_, Infallible>(call_blocking(service, permits, request, info).await)
                    }
                });

                if let Err(err) = http.serve_connection(stream, handler).await {
                    log::debug!("connection from {} ended with error: {}", peer, err);
                }
            });
        }
    }

    /// A connection builder with every HTTP option from the configuration.
    fn http(&self) -> Http<TokioExecutor> {
        let mut http = Http::new().with_executor(TokioExecutor);

        let http1 = &self.config.http1;
        http.http1_keep_alive(http1.keep_alive)
            .http1_half_close(http1.half_close)
            .max_buf_size(http1.max_buf_size)
            .pipeline_flush(http1.pipeline_flush)
            .http1_writev(http1.writev)
            .http1_title_case_headers(http1.title_case_headers)
            .http1_preserve_header_case(http1.preserve_header_case)
            .http1_only(http1.only);

        #[cfg(feature = "http2")]
        {
            let http2 = &self.config.http2;
            http.http2_only(http2.only)
                .http2_initial_stream_window_size(http2.initial_stream_window_size)
                .http2_initial_connection_window_size(http2.initial_connection_window_size)
                .http2_adaptive_window(http2.adaptive_window)
                .http2_max_frame_size(http2.max_frame_size)
                .http2_max_concurrent_streams(http2.max_concurrent_streams)
                .http2_max_send_buf_size(http2.max_send_buf_size);
        }

        http
    }
}

/// Runs one blocking service call once a worker permit is available.
async fn call_blocking<S: Service>(
    service: Arc<S>,
    permits: Arc<Semaphore>,
    request: Request,
    info: ConnectionInfo,
) -> Response {
    let _permit = match permits.acquire_owned().await {
        Ok(permit) => permit,
        Err(_) => return FinalHandler::response_for(StatusCode::SERVICE_UNAVAILABLE),
    };

    match tokio::task::spawn_blocking(move || service.call(request, info)).await {
        Ok(response) => response,
        Err(err) => {
            log::error!("service call failed: {}", err);
            FinalHandler::response_for(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}
