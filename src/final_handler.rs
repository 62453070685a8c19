//! The default terminal of a dispatch: a 404 for requests nothing answered,
//! an error page for errors nothing handled.

use hyper::header::{HeaderValue, CONTENT_LENGTH, CONTENT_TYPE};
use hyper::{Method, StatusCode};

use crate::config::DispatchConfig;
use crate::dispatch::Terminal;
use crate::error::Error;
use crate::exchange::Exchange;
use crate::http::{Body, Response};
use crate::url;

/// Answers a request that fell off the end of the stack.
///
/// Without an error the answer is `404 Cannot <METHOD> <path>`. With an
/// error it is the error's status, or `500` when the error has none, and
/// the body is only the status reason: error details go to the log, never
/// to the client.
#[derive(Debug, Clone, Default)]
pub struct FinalHandler {
    config: DispatchConfig,
}

impl FinalHandler {
    /// A final handler that logs according to `config`.
    pub fn new(config: DispatchConfig) -> Self {
        Self { config }
    }

    /// The settings this handler was built with.
    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    /// Finalizes `exchange`, unless something already answered it.
    pub fn finish(&self, exchange: Exchange, error: Option<Error>) {
        let (status, body) = match &error {
            None => (
                StatusCode::NOT_FOUND,
                format!(
                    "Cannot {} {}",
                    exchange.method(),
                    escape_html(url::pathname(exchange.original_url()))
                ),
            ),
            Some(err) => {
                let status = status_for(err);
                if self.config.logs_errors() {
                    log::error!(
                        "{} {} failed: {}",
                        exchange.method(),
                        exchange.original_url(),
                        err
                    );
                }
                (status, status.canonical_reason().unwrap_or("Error").to_owned())
            }
        };

        if exchange.is_finished() {
            log::debug!(
                "{} already answered, dropping {} response",
                exchange.original_url(),
                status
            );
            return;
        }

        let response = document(status, &body, *exchange.method() == Method::HEAD);
        if let Err(err) = exchange.respond(response) {
            log::debug!("final handler could not respond: {}", err);
        }
    }

    /// Wraps this handler as the terminal of a dispatch.
    pub fn into_terminal(self) -> Terminal {
        Box::new(move |exchange: Exchange, error: Option<Error>| self.finish(exchange, error))
    }

    /// A bare response carrying only the reason phrase of `status`.
    pub(crate) fn response_for(status: StatusCode) -> Response {
        document(status, status.canonical_reason().unwrap_or("Error"), false)
    }
}

/// The status an unhandled error is answered with.
fn status_for(err: &Error) -> StatusCode {
    match err.status_code() {
        Some(status) if status.is_client_error() || status.is_server_error() => status,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// An HTML page for `status` with the security headers set.
fn document(status: StatusCode, message: &str, head: bool) -> Response {
    let html = format!(
        "<!DOCTYPE html>\n<html lang=\"en\">\n<head>\n<meta charset=\"utf-8\">\n<title>Error</title>\n</head>\n<body>\n<pre>{}</pre>\n</body>\n</html>\n",
        message
    );

    let length = html.len();
    let mut response = Response::new(if head { Body::empty() } else { Body::new(html) });
    *response.status_mut() = status;

    let headers = response.headers_mut();
    headers.insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/html; charset=utf-8"),
    );
    headers.insert(
        "content-security-policy",
        HeaderValue::from_static("default-src 'none'"),
    );
    headers.insert(
        "x-content-type-options",
        HeaderValue::from_static("nosniff"),
    );
    headers.insert(CONTENT_LENGTH, length.into());

    response
}

/// Escapes the characters that are significant in HTML text.
fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            _ => escaped.push(c),
        }
    }
    escaped
}
