//! Transport interface the retry system drives.

use bytes::Bytes;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HttpVerb {
    Get,
    Head,
    Post,
    Put,
    Delete,
}

impl HttpVerb {
    /// GET and HEAD requests may be retried after a generic failure.
    pub fn is_safe_to_retry(&self) -> bool {
        matches!(self, Self::Get | Self::Head)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub verb: HttpVerb,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl HttpRequest {
    pub fn new(verb: HttpVerb, url: impl Into<String>) -> Self {
        Self {
            verb,
            url: url.into(),
            headers: Vec::new(),
            body: Bytes::new(),
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(HttpVerb::Get, url)
    }

    pub fn head(url: impl Into<String>) -> Self {
        Self::new(HttpVerb::Head, url)
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Bytes,
}

impl HttpResponse {
    pub fn new(status: u16, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// A request that produced no response.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The connection could not be established or was lost.
    #[error("connection error: {0}")]
    Connection(String),

    #[error("request failed: {0}")]
    Failed(String),
}

pub type TransportResult = Result<HttpResponse, TransportError>;

/// Called exactly once with the outcome of a request, on any thread.
pub type CompletionCallback = Box<dyn FnOnce(TransportResult) + Send>;

/// Asynchronous HTTP transport.
///
/// `process` must return promptly and deliver the outcome through
/// `on_complete` later, possibly from another thread.
pub trait HttpTransport: Send + Sync {
    fn process(&self, request: HttpRequest, on_complete: CompletionCallback);
}
