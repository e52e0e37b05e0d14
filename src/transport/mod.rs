//! Transport layer
//!
//! Unary and streaming request primitives for talking to the inference
//! server. The [`Transport`] trait is the seam the lifecycle controller and
//! query executor are built on; [`http::HttpTransport`] is the real implementation.

pub mod http;
pub mod lines;

#[cfg(test)]
pub(crate) mod mock;

use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

pub use http::HttpTransport;
pub use lines::LineDecoder;

/// HTTP method of an API call
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum Method {
    Get,
    Post,
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Method::Get => write!(f, "GET"),
            Method::Post => write!(f, "POST"),
        }
    }
}

/// A single API call against the server
#[derive(Clone, Debug, PartialEq)]
pub struct ApiRequest {
    pub method: Method,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub body: Option<Value>,
}

impl ApiRequest {
    pub fn get(path: impl Into<String>) -> Self {
        Self {
            method: Method::Get,
            path: path.into(),
            query: Vec::new(),
            body: None,
        }
    }

    pub fn post(path: impl Into<String>, body: Option<Value>) -> Self {
        Self {
            method: Method::Post,
            path: path.into(),
            query: Vec::new(),
            body,
        }
    }

    pub fn with_query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }
}

/// Transport errors
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("Network error: {0}")]
    Network(String),
    #[error("Timed out after {0:?} waiting for the server")]
    Timeout(Duration),
    #[error("{}", http_message(*status, message.as_deref()))]
    Http { status: u16, message: Option<String> },
    #[error("Invalid response body: {0}")]
    InvalidBody(String),
}

fn http_message(status: u16, message: Option<&str>) -> String {
    match message {
        Some(m) => format!("Server returned HTTP {}: {}", status, m),
        None => format!("Server returned HTTP {}", status),
    }
}

impl TransportError {
    /// HTTP status code for non-2xx replies
    pub fn status(&self) -> Option<u16> {
        match self {
            TransportError::Http { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// A source of raw response lines, consumed front to back.
#[async_trait]
pub trait LineSource: Send {
    /// Next line, or `None` once the body has ended
    async fn next_line(&mut self) -> Option<Result<String, TransportError>>;
}

/// Request primitives the client is built on.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a request and decode the JSON reply. Non-2xx replies fail with
    /// [`TransportError::Http`]; an empty body decodes to `Value::Null`.
    async fn unary(&self, request: ApiRequest) -> Result<Value, TransportError>;

    /// Send a request and hand back its body as a line source once the
    /// response headers have arrived.
    async fn open_stream(&self, request: ApiRequest) -> Result<Box<dyn LineSource>, TransportError>;

    /// Like [`Transport::open_stream`], wrapped in a cancellable [`LineStream`].
    async fn stream(&self, request: ApiRequest) -> Result<LineStream, TransportError> {
        let source = self.open_stream(request).await?;
        Ok(LineStream::new(source, CancellationToken::new()))
    }
}

/// Cancellable handle over a streamed response body.
///
/// Cancelling drops the underlying source, which closes the connection.
/// `cancel()` may be called at any time, any number of times.
pub struct LineStream {
    source: Option<Box<dyn LineSource>>,
    token: CancellationToken,
}

impl LineStream {
    pub fn new(source: Box<dyn LineSource>, token: CancellationToken) -> Self {
        Self {
            source: Some(source),
            token,
        }
    }

    /// Token that cancels this stream from another task
    pub fn cancel_token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// True once the body ended, failed, or the stream was cancelled
    pub fn is_closed(&self) -> bool {
        self.source.is_none()
    }

    /// Next line; `None` after the end of the body, a transport error, or cancellation.
    pub async fn next_line(&mut self) -> Option<Result<String, TransportError>> {
        if self.token.is_cancelled() {
            self.source = None;
        }
        let source = self.source.as_mut()?;

        let next = tokio::select! {
            biased;
            _ = self.token.cancelled() => None,
            line = source.next_line() => line,
        };

        match next {
            Some(Ok(line)) => Some(Ok(line)),
            Some(Err(e)) => {
                self.source = None;
                Some(Err(e))
            }
            None => {
                self.source = None;
                None
            }
        }
    }
}
