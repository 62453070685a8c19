//! Server and dispatch settings, read from an optional `junction` file and
//! `JUNCTION_` environment variables.

use serde::Deserialize;
use std::convert::TryFrom;
use std::time::Duration;

/// Environment variable prefix shared by every configuration type.
const ENV_PREFIX: &str = "JUNCTION";

/// Collects the configuration sources in precedence order.
///
/// 1. A `.env` file, if present, is loaded into the process environment
/// 2. An optional `junction` config file (any format the config crate reads)
/// 3. Environment variables prefixed with `JUNCTION_`; nested tables use a
///    double underscore, as in `JUNCTION_HTTP1__KEEP_ALIVE`
fn sources() -> config::ConfigBuilder<config::builder::DefaultState> {
    dotenv::dotenv().ok();

    config::Config::builder()
        .add_source(config::File::with_name("junction").required(false))
        .add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__"),
        )
}

/// Configuration for the listening adapter.
///
/// Every key is optional; missing keys take the values of
/// [`ServerConfig::default`].
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Requests dispatched at once. `Server::run` allows twice as many
    /// blocking threads. CPU count * 15 unless set.
    pub max_workers: usize,
    /// Seconds an idle worker thread is kept around.
    pub worker_keep_alive_secs: u64,
    pub host: String,
    pub port: u16,
    /// Options applied to every HTTP/1 connection (`[http1]`).
    pub http1: Http1Config,
    /// Options applied to every HTTP/2 connection (`[http2]`).
    #[cfg(feature = "http2")]
    pub http2: Http2Config,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_workers: num_cpus::get() * 15,
            worker_keep_alive_secs: 6,
            host: "127.0.0.1".to_owned(),
            port: 3000,
            http1: Http1Config::default(),
            #[cfg(feature = "http2")]
            http2: Http2Config::default(),
        }
    }
}

impl TryFrom<config::Config> for ServerConfig {
    type Error = config::ConfigError;

    fn try_from(config: config::Config) -> Result<Self, Self::Error> {
        let server: ServerConfig = config.try_deserialize()?;
        server.validate()?;
        Ok(server)
    }
}

/// Smallest HTTP/1 read buffer hyper accepts.
const MIN_BUF_SIZE: usize = 8192;

/// The HTTP/2 frame sizes allowed by RFC 9113.
#[cfg(feature = "http2")]
const FRAME_SIZES: std::ops::RangeInclusive<u32> = 16_384..=16_777_215;

impl ServerConfig {
    /// Checks the values hyper would otherwise reject with a panic when a
    /// connection is set up.
    ///
    /// # Errors
    /// Returns `ConfigError::Message` naming the first offending key.
    pub fn validate(&self) -> Result<(), config::ConfigError> {
        if self.http1.max_buf_size < MIN_BUF_SIZE {
            return Err(config::ConfigError::Message(format!(
                "http1.max_buf_size must be at least {}, got {}",
                MIN_BUF_SIZE, self.http1.max_buf_size
            )));
        }

        #[cfg(feature = "http2")]
        {
            if let Some(size) = self.http2.max_frame_size {
                if !FRAME_SIZES.contains(&size) {
                    return Err(config::ConfigError::Message(format!(
                        "http2.max_frame_size must be within {}..={}, got {}",
                        FRAME_SIZES.start(),
                        FRAME_SIZES.end(),
                        size
                    )));
                }
            }

            if self.http2.max_send_buf_size > u32::MAX as usize {
                return Err(config::ConfigError::Message(format!(
                    "http2.max_send_buf_size must fit in 32 bits, got {}",
                    self.http2.max_send_buf_size
                )));
            }
        }

        Ok(())
    }

    /// Loads the server configuration from the `junction` config file and
    /// `JUNCTION_` environment variables.
    ///
    /// # Errors
    /// Fails when a source cannot be read or a value has the wrong type.
    pub fn new() -> Result<Self, config::ConfigError> {
        sources().build()?.try_into()
    }

    /// How long an idle blocking thread lingers before exiting.
    pub fn worker_keep_alive(&self) -> Duration {
        Duration::from_secs(self.worker_keep_alive_secs)
    }

    /// The `host:port` pair the server binds to.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// HTTP/1 connection options, passed straight to hyper.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Http1Config {
    pub keep_alive: bool,
    pub half_close: bool,
    /// Read buffer cap in bytes; hyper rejects values under 8192.
    pub max_buf_size: usize,
    pub pipeline_flush: bool,
    pub writev: bool,
    pub title_case_headers: bool,
    pub preserve_header_case: bool,
    /// Refuse to upgrade connections to HTTP/2.
    pub only: bool,
}

impl Default for Http1Config {
    fn default() -> Self {
        Self {
            keep_alive: true,
            half_close: false,
            max_buf_size: 512 * 1024,
            pipeline_flush: false,
            writev: true,
            title_case_headers: false,
            preserve_header_case: false,
            only: false,
        }
    }
}

/// HTTP/2 connection options. `None` leaves hyper's own default in place.
#[cfg(feature = "http2")]
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Http2Config {
    /// Speak HTTP/2 with prior knowledge only.
    pub only: bool,
    pub initial_stream_window_size: Option<u32>,
    pub initial_connection_window_size: Option<u32>,
    pub adaptive_window: bool,
    pub max_frame_size: Option<u32>,
    pub max_concurrent_streams: Option<u32>,
    pub max_send_buf_size: usize,
}

#[cfg(feature = "http2")]
impl Default for Http2Config {
    fn default() -> Self {
        Self {
            only: false,
            initial_stream_window_size: None,
            initial_connection_window_size: None,
            adaptive_window: true,
            max_frame_size: None,
            max_concurrent_streams: None,
            max_send_buf_size: 512 * 1024,
        }
    }
}

/// The deployment environment a dispatcher runs in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[default]
    Development,
    Production,
    /// Unhandled errors are not logged.
    Test,
}

/// Settings injected into a dispatcher's final handler.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    pub env: Environment,
}

impl TryFrom<config::Config> for DispatchConfig {
    type Error = config::ConfigError;

    fn try_from(config: config::Config) -> Result<Self, Self::Error> {
        config.try_deserialize()
    }
}

impl DispatchConfig {
    /// Loads the dispatch configuration (`JUNCTION_ENV`) from the same
    /// sources as [`ServerConfig::new`].
    pub fn new() -> Result<Self, config::ConfigError> {
        sources().build()?.try_into()
    }

    /// Configuration for the given environment.
    pub fn for_env(env: Environment) -> Self {
        Self { env }
    }

    /// Whether the final handler logs errors that reach it.
    pub fn logs_errors(&self) -> bool {
        self.env != Environment::Test
    }
}
