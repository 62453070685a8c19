//! Injection of a script snippet into served HTML documents.

use std::borrow::Cow;
use std::sync::Arc;

use hyper::header::{HeaderValue, CONTENT_LENGTH, CONTENT_TYPE};
use hyper::StatusCode;

use crate::dispatch::Next;
use crate::exchange::Exchange;
use crate::http::ResponseBuilder;
use crate::layer::Handler;

/// Closing tags tried in order; the snippet goes right before the first one
/// found.
pub const DEFAULT_TAGS: [&str; 3] = ["</head>", "</html>", "</body>"];

/// Rewrites a buffered HTML body so it carries `code`.
#[derive(Debug, Clone)]
pub struct Injector {
    tags: Vec<String>,
    code: String,
}

impl Injector {
    pub fn new(code: impl Into<String>) -> Self {
        Self::with_tags(DEFAULT_TAGS, code)
    }

    pub fn with_tags<I, T>(tags: I, code: impl Into<String>) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        Self {
            tags: tags.into_iter().map(Into::into).collect(),
            code: code.into(),
        }
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    /// Inserts the code before the first tag, in tag-list order, that occurs
    /// in `body`. Tags match regardless of ASCII case. A body without any of
    /// the tags comes back borrowed and untouched.
    pub fn inject<'a>(&self, body: &'a str) -> Cow<'a, str> {
        let lowered = body.to_ascii_lowercase();

        let found = self
            .tags
            .iter()
            .find_map(|tag| lowered.find(&tag.to_ascii_lowercase()));

        match found {
            Some(at) => {
                let mut out = String::with_capacity(body.len() + self.code.len());
                out.push_str(&body[..at]);
                out.push_str(&self.code);
                out.push_str(&body[at..]);
                Cow::Owned(out)
            }
            None => Cow::Borrowed(body),
        }
    }
}

/// The `<script>` element that loads the reload client.
///
/// `file_path` is the document on disk, `base_url` the prefix the client
/// script is served under, and `inject_body` asks the client to patch the
/// body in place instead of reloading.
pub fn script_tag(file_path: &str, base_url: &str, inject_body: bool) -> String {
    let inject_body = if inject_body {
        " data-inject-body=\"true\""
    } else {
        ""
    };

    format!(
        "<!-- Code injected by junction -->\n  <script async data-id=\"junction\" data-file=\"{}\"{} type=\"application/javascript\" src=\"{}junction.js\"></script>\n  ",
        file_path, inject_body, base_url
    )
}

/// Whether a request path names an HTML document.
fn is_document(path: &str) -> bool {
    path == "/" || path.ends_with(".html") || path.ends_with(".htm")
}

/// A request layer that serves HTML documents with the injector applied.
///
/// `source` maps the mount-relative path to the document text, or `None`
/// when there is nothing to serve, in which case the request continues down
/// the stack.
pub fn layer<F>(injector: Injector, source: F) -> Handler
where
    F: Fn(&str) -> Option<String> + Send + Sync + 'static,
{
    let injector = Arc::new(injector);

    Handler::request(move |exchange: Exchange, next: Next| {
        let path = exchange.path();
        if !is_document(path) {
            next.run();
            return Ok(());
        }

        let Some(document) = source(path) else {
            next.run();
            return Ok(());
        };

        let html = injector.inject(&document).into_owned();
        let response = ResponseBuilder::new()
            .status(StatusCode::OK)
            .header(CONTENT_TYPE, HeaderValue::from_static("text/html; charset=utf-8"))
            .header(CONTENT_LENGTH, html.len())
            .body(html.into())?;

        exchange.respond(response)
    })
    .named("inject")
}
