//! HTTP transport
//!
//! [`Transport`] over `reqwest`. Connect timeouts are enforced by the client;
//! the send budget and inter-chunk read timeout are enforced here.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::timeout;

use super::{ApiRequest, LineDecoder, LineSource, Method, Transport, TransportError};
use crate::types::ClientConfig;

/// Transport against a live server
pub struct HttpTransport {
    base_url: String,
    client: reqwest::Client,
    connect_timeout: Duration,
    write_timeout: Duration,
    read_timeout: Duration,
}

impl HttpTransport {
    pub fn new(config: &ClientConfig) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout())
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(|e| TransportError::Network(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            base_url: config.server_url.trim_end_matches('/').to_string(),
            client,
            connect_timeout: config.connect_timeout(),
            write_timeout: config.write_timeout(),
            read_timeout: config.read_timeout(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    /// Send the request and wait for a 2xx status line.
    ///
    /// Waiting for headers covers both writing the request and the server's
    /// time to first byte, so it is bounded by write + read timeouts.
    async fn send(&self, request: &ApiRequest) -> Result<reqwest::Response, TransportError> {
        let url = self.url(&request.path);
        let mut builder = match request.method {
            Method::Get => self.client.get(&url),
            Method::Post => self.client.post(&url),
        };
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        tracing::debug!("{} {}", request.method, url);
        let budget = self.write_timeout + self.read_timeout;
        let response = timeout(budget, builder.send())
            .await
            .map_err(|_| TransportError::Timeout(budget))?
            .map_err(|e| self.map_error(e))?;

        let status = response.status();
        if !status.is_success() {
            let body = match timeout(self.read_timeout, response.text()).await {
                Ok(Ok(text)) => text,
                _ => String::new(),
            };
            tracing::warn!("{} {} failed with status {}", request.method, url, status);
            return Err(TransportError::Http {
                status: status.as_u16(),
                message: error_message(&body),
            });
        }

        Ok(response)
    }

    fn map_error(&self, e: reqwest::Error) -> TransportError {
        if e.is_timeout() {
            TransportError::Timeout(self.connect_timeout)
        } else if e.is_connect() {
            TransportError::Network(format!("Connection failed: {}", e))
        } else {
            TransportError::Network(e.to_string())
        }
    }
}

/// Pull the server's `error`/`message` field out of a failure body
fn error_message(body: &str) -> Option<String> {
    let value: Value = serde_json::from_str(body).ok()?;
    value
        .get("error")
        .or_else(|| value.get("message"))
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
}

#[async_trait]
impl Transport for HttpTransport {
    async fn unary(&self, request: ApiRequest) -> Result<Value, TransportError> {
        let response = self.send(&request).await?;

        let bytes = timeout(self.read_timeout, response.bytes())
            .await
            .map_err(|_| TransportError::Timeout(self.read_timeout))?
            .map_err(|e| self.map_error(e))?;

        if bytes.iter().all(|b| b.is_ascii_whitespace()) {
            return Ok(Value::Null);
        }
        serde_json::from_slice(&bytes).map_err(|e| TransportError::InvalidBody(e.to_string()))
    }

    async fn open_stream(&self, request: ApiRequest) -> Result<Box<dyn LineSource>, TransportError> {
        let response = self.send(&request).await?;
        Ok(Box::new(HttpLines {
            response: Some(response),
            decoder: LineDecoder::new(),
            pending: VecDeque::new(),
            read_timeout: self.read_timeout,
        }))
    }
}

/// Streamed response body split into lines.
///
/// The read timeout applies to the silence between chunks, not the whole body.
struct HttpLines {
    response: Option<reqwest::Response>,
    decoder: LineDecoder,
    pending: VecDeque<String>,
    read_timeout: Duration,
}

#[async_trait]
impl LineSource for HttpLines {
    async fn next_line(&mut self) -> Option<Result<String, TransportError>> {
        loop {
            if let Some(line) = self.pending.pop_front() {
                return Some(Ok(line));
            }
            let response = self.response.as_mut()?;

            match timeout(self.read_timeout, response.chunk()).await {
                Err(_) => {
                    self.response = None;
                    return Some(Err(TransportError::Timeout(self.read_timeout)));
                }
                Ok(Err(e)) => {
                    self.response = None;
                    return Some(Err(TransportError::Network(format!("Stream interrupted: {}", e))));
                }
                Ok(Ok(Some(chunk))) => {
                    self.pending.extend(self.decoder.push(&chunk));
                }
                Ok(Ok(None)) => {
                    self.response = None;
                    self.pending.extend(self.decoder.finish());
                }
            }
        }
    }
}
