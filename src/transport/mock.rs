//! Scripted in-memory transport for tests

use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, Notify};

use super::{ApiRequest, LineSource, Method, Transport, TransportError};

/// Canned reply for a unary call
pub(crate) enum Reply {
    Json(Value),
    Fail(TransportError),
    /// Wait for the gate to open, then answer
    Gated(Arc<Notify>, Box<Reply>),
}

/// Canned reply for a streaming call
pub(crate) enum StreamReply {
    Lines(ScriptedLines),
    Channel(mpsc::UnboundedReceiver<Result<String, TransportError>>),
    Fail(TransportError),
    /// Headers never arrive
    Hang,
}

/// Lines served from a fixed script
pub(crate) struct ScriptedLines {
    lines: VecDeque<String>,
    then: Option<TransportError>,
    hang: bool,
    released: Option<Arc<AtomicUsize>>,
}

impl ScriptedLines {
    pub fn new<I, S>(lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            lines: lines.into_iter().map(Into::into).collect(),
            then: None,
            hang: false,
            released: None,
        }
    }

    /// A source that never produces anything
    pub fn pending() -> Self {
        Self::new(Vec::<String>::new()).then_hang()
    }

    pub fn then_fail(mut self, error: TransportError) -> Self {
        self.then = Some(error);
        self
    }

    pub fn then_hang(mut self) -> Self {
        self.hang = true;
        self
    }
}

#[async_trait]
impl LineSource for ScriptedLines {
    async fn next_line(&mut self) -> Option<Result<String, TransportError>> {
        if let Some(line) = self.lines.pop_front() {
            return Some(Ok(line));
        }
        if let Some(error) = self.then.take() {
            return Some(Err(error));
        }
        if self.hang {
            std::future::pending::<()>().await;
        }
        None
    }
}

impl Drop for ScriptedLines {
    fn drop(&mut self) {
        if let Some(released) = &self.released {
            released.fetch_add(1, Ordering::SeqCst);
        }
    }
}

struct ChannelLines {
    rx: mpsc::UnboundedReceiver<Result<String, TransportError>>,
    released: Arc<AtomicUsize>,
}

#[async_trait]
impl LineSource for ChannelLines {
    async fn next_line(&mut self) -> Option<Result<String, TransportError>> {
        self.rx.recv().await
    }
}

impl Drop for ChannelLines {
    fn drop(&mut self) {
        self.released.fetch_add(1, Ordering::SeqCst);
    }
}

/// Transport answering from per-route reply queues and recording every call
#[derive(Default)]
pub(crate) struct ScriptedTransport {
    unary: Mutex<HashMap<(Method, String), VecDeque<Reply>>>,
    streams: Mutex<VecDeque<StreamReply>>,
    calls: Mutex<Vec<ApiRequest>>,
    released: Arc<AtomicUsize>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(&self, method: Method, path: &str, reply: Reply) -> &Self {
        self.unary
            .lock()
            .expect("unary mutex poisoned")
            .entry((method, path.to_string()))
            .or_default()
            .push_back(reply);
        self
    }

    pub fn on_stream(&self, reply: StreamReply) -> &Self {
        self.streams.lock().expect("streams mutex poisoned").push_back(reply);
        self
    }

    pub fn calls(&self) -> Vec<ApiRequest> {
        self.calls.lock().expect("calls mutex poisoned").clone()
    }

    pub fn call_count(&self, path: &str) -> usize {
        self.calls().iter().filter(|c| c.path == path).count()
    }

    /// Number of stream bodies dropped so far
    pub fn released_streams(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }

    fn record(&self, request: &ApiRequest) {
        self.calls.lock().expect("calls mutex poisoned").push(request.clone());
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn unary(&self, request: ApiRequest) -> Result<Value, TransportError> {
        self.record(&request);
        let reply = self
            .unary
            .lock()
            .expect("unary mutex poisoned")
            .get_mut(&(request.method, request.path.clone()))
            .and_then(|queue| queue.pop_front());

        let mut reply = reply.unwrap_or(Reply::Fail(TransportError::Http {
            status: 404,
            message: Some("Endpoint not found".into()),
        }));
        loop {
            match reply {
                Reply::Json(value) => return Ok(value),
                Reply::Fail(error) => return Err(error),
                Reply::Gated(gate, inner) => {
                    gate.notified().await;
                    reply = *inner;
                }
            }
        }
    }

    async fn open_stream(&self, request: ApiRequest) -> Result<Box<dyn LineSource>, TransportError> {
        self.record(&request);
        let reply = self.streams.lock().expect("streams mutex poisoned").pop_front();

        match reply {
            Some(StreamReply::Lines(mut lines)) => {
                lines.released = Some(self.released.clone());
                Ok(Box::new(lines))
            }
            Some(StreamReply::Channel(rx)) => Ok(Box::new(ChannelLines {
                rx,
                released: self.released.clone(),
            })),
            Some(StreamReply::Fail(error)) => Err(error),
            Some(StreamReply::Hang) => {
                std::future::pending::<()>().await;
                Err(TransportError::Network("unreachable".into()))
            }
            None => Err(TransportError::Network("Connection refused".into())),
        }
    }
}
