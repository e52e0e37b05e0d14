//! Streaming query executor
//!
//! Runs one generation request at a time against the loaded model. Starting
//! a query cancels the previous one; events of a cancelled query are never
//! delivered once the cancelling call has begun.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::lifecycle::ModelController;
use crate::params::{describe_errors, CheckError, ParameterCatalog, ParameterScope, ValidationError};
use crate::stream::{EventStream, ParserOptions, StreamEvent};
use crate::transport::{ApiRequest, LineStream, Transport, TransportError};
use crate::types::ParamMap;

const PREMATURE_END: &str = "Stream ended before the response completed";
const CALLBACK_PANICKED: &str = "Event callback panicked";

/// One generation request
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QueryRequest {
    pub prompt: String,
    #[serde(default)]
    pub system_prompt: Option<String>,
    pub model: String,
    /// Fully formatted prompt sent instead of the server's own template
    #[serde(default)]
    pub formatted_prompt: Option<String>,
    #[serde(default)]
    pub inference_parameters: ParamMap,
}

impl QueryRequest {
    pub fn new(model: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            system_prompt: None,
            model: model.into(),
            formatted_prompt: None,
            inference_parameters: ParamMap::new(),
        }
    }

    pub fn with_system_prompt(mut self, system_prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(system_prompt.into());
        self
    }

    pub fn with_formatted_prompt(mut self, formatted: impl Into<String>) -> Self {
        self.formatted_prompt = Some(formatted.into());
        self
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.inference_parameters.insert(key.into(), value.into());
        self
    }

    /// Wire body. Reserved fields win over parameters of the same name.
    fn payload(&self, params: &ParamMap, stream: bool) -> Value {
        let mut body = serde_json::Map::new();
        for (key, value) in params {
            body.insert(key.clone(), value.clone());
        }
        body.insert("prompt".into(), Value::String(self.prompt.clone()));
        if let Some(system) = &self.system_prompt {
            body.insert("system_prompt".into(), Value::String(system.clone()));
        }
        body.insert("model".into(), Value::String(self.model.clone()));
        body.insert("stream".into(), Value::Bool(stream));
        if let Some(formatted) = &self.formatted_prompt {
            body.insert("formatted_prompt".into(), Value::String(formatted.clone()));
        }
        Value::Object(body)
    }
}

/// Query errors raised before any generation request is sent
#[derive(Debug, Clone, Error)]
pub enum QueryError {
    #[error("{}", no_model_message(requested, loaded.as_deref()))]
    NoModelLoaded { requested: String, loaded: Option<String> },
    #[error("Prompt is empty")]
    EmptyPrompt,
    #[error("Invalid inference parameters: {}", describe_errors(.0))]
    Validation(Vec<ValidationError>),
    #[error("Could not fetch parameter schema: {0}")]
    Schema(TransportError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

fn no_model_message(requested: &str, loaded: Option<&str>) -> String {
    match loaded {
        Some(loaded) => format!("Model {} is not loaded (current model: {})", requested, loaded),
        None => format!("Model {} is not loaded (no model loaded)", requested),
    }
}

impl From<CheckError> for QueryError {
    fn from(e: CheckError) -> Self {
        match e {
            CheckError::Schema(e) => QueryError::Schema(e),
            CheckError::Invalid(errors) => QueryError::Validation(errors),
        }
    }
}

/// How a query ended
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum QueryOutcome {
    Completed,
    Failed(String),
    Cancelled,
}

/// Caller's handle on a running query
#[derive(Clone, Debug)]
pub struct QueryHandle {
    id: Uuid,
    token: CancellationToken,
    outcome: watch::Receiver<Option<QueryOutcome>>,
}

impl QueryHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Stop the query and close its connection. No further events are
    /// delivered and no error event is synthesized. Idempotent.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.outcome.borrow().is_some()
    }

    /// Wait until the query has delivered its last event
    pub async fn finished(&self) -> QueryOutcome {
        let mut outcome = self.outcome.clone();
        let done = outcome.wait_for(Option::is_some).await.map(|done| Option::clone(&done));
        match done {
            Ok(Some(outcome)) => outcome,
            Ok(None) => QueryOutcome::Cancelled,
            Err(_) => QueryOutcome::Failed("Query task stopped unexpectedly".into()),
        }
    }
}

type EventCallback = Box<dyn FnMut(StreamEvent) + Send>;

struct ActiveQuery {
    id: Uuid,
    token: CancellationToken,
}

/// Shared between the executor and its query tasks
struct Slot {
    active: Mutex<Option<ActiveQuery>>,
    /// Held while a callback runs
    delivery: tokio::sync::Mutex<()>,
}

impl Slot {
    fn release(&self, id: Uuid) {
        let mut active = self.active.lock().expect("active query mutex poisoned");
        if active.as_ref().map(|a| a.id) == Some(id) {
            *active = None;
        }
    }
}

/// Slot claim of a query that has not reached its task yet. Dropping it
/// cancels the query and frees the slot.
struct Reservation<'a> {
    slot: &'a Slot,
    id: Uuid,
    token: CancellationToken,
    armed: bool,
}

impl Reservation<'_> {
    fn keep(mut self) {
        self.armed = false;
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.token.cancel();
            self.slot.release(self.id);
        }
    }
}

/// Runs streaming generation requests, at most one at a time
pub struct QueryExecutor {
    transport: Arc<dyn Transport>,
    controller: Arc<ModelController>,
    catalog: Arc<ParameterCatalog>,
    options: ParserOptions,
    slot: Arc<Slot>,
}

impl QueryExecutor {
    pub fn new(
        transport: Arc<dyn Transport>,
        controller: Arc<ModelController>,
        catalog: Arc<ParameterCatalog>,
        options: ParserOptions,
    ) -> Self {
        Self {
            transport,
            controller,
            catalog,
            options,
            slot: Arc::new(Slot {
                active: Mutex::new(None),
                delivery: tokio::sync::Mutex::new(()),
            }),
        }
    }

    fn check_preconditions(&self, request: &QueryRequest) -> Result<(), QueryError> {
        let session = self.controller.snapshot();
        if !session.is_loaded(&request.model) {
            return Err(QueryError::NoModelLoaded {
                requested: request.model.clone(),
                loaded: session.model_name().map(str::to_string),
            });
        }
        if request.prompt.is_empty() {
            return Err(QueryError::EmptyPrompt);
        }
        Ok(())
    }

    /// Validate parameters and build the wire body; nothing is sent on failure
    async fn payload(&self, request: &QueryRequest, stream: bool) -> Result<Value, QueryError> {
        let params = self
            .catalog
            .check(ParameterScope::Inference, &request.model, &request.inference_parameters)
            .await?;
        Ok(request.payload(&params, stream))
    }

    /// Make `id` the active query, cancelling whichever query held the slot
    fn supersede(&self, id: Uuid, token: CancellationToken) {
        let previous = self
            .slot
            .active
            .lock()
            .expect("active query mutex poisoned")
            .replace(ActiveQuery { id, token });
        if let Some(previous) = previous {
            tracing::info!("Query {} superseded by {}", previous.id, id);
            previous.token.cancel();
        }
    }

    /// Start a streaming query.
    ///
    /// Events are passed to `on_event` in arrival order from a single task,
    /// ending with exactly one `Complete` or `Error` unless the query is
    /// cancelled. A query still running on this executor is cancelled before
    /// this call first yields; its callback is never invoked again after that.
    pub async fn query<F>(&self, request: QueryRequest, on_event: F) -> Result<QueryHandle, QueryError>
    where
        F: FnMut(StreamEvent) + Send + 'static,
    {
        self.check_preconditions(&request)?;

        let id = Uuid::new_v4();
        let token = CancellationToken::new();
        self.supersede(id, token.clone());
        let reservation = Reservation {
            slot: &self.slot,
            id,
            token: token.clone(),
            armed: true,
        };
        // Wait out a callback of the superseded query that is already running
        drop(self.slot.delivery.lock().await);

        let body = self.payload(&request, true).await?;
        reservation.keep();

        tracing::info!("Starting query {} on model {}", id, request.model);
        let (outcome_tx, outcome_rx) = watch::channel(None);
        let task = QueryTask {
            id,
            token: token.clone(),
            slot: self.slot.clone(),
            transport: self.transport.clone(),
            options: self.options,
            on_event: Box::new(on_event),
        };
        tokio::spawn(async move {
            let slot = task.slot.clone();
            let outcome = task.run(body).await;
            tracing::debug!("Query {} finished: {:?}", id, outcome);
            slot.release(id);
            outcome_tx.send_replace(Some(outcome));
        });

        Ok(QueryHandle {
            id,
            token,
            outcome: outcome_rx,
        })
    }

    /// Run a query without streaming and return the full response text
    pub async fn complete(&self, request: QueryRequest) -> Result<String, QueryError> {
        self.check_preconditions(&request)?;
        let body = self.payload(&request, false).await?;
        let reply = self
            .transport
            .unary(ApiRequest::post("/query", Some(body)))
            .await?;
        reply
            .get("response")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| QueryError::Transport(TransportError::InvalidBody("missing response field".into())))
    }

    /// Cancel the running query, if any. Returns whether one was running.
    pub fn cancel_active(&self) -> bool {
        let previous = self.slot.active.lock().expect("active query mutex poisoned").take();
        match previous {
            Some(active) => {
                tracing::info!("Cancelling query {}", active.id);
                active.token.cancel();
                true
            }
            None => false,
        }
    }

    /// Id of the running query
    pub fn active_query(&self) -> Option<Uuid> {
        self.slot
            .active
            .lock()
            .expect("active query mutex poisoned")
            .as_ref()
            .map(|a| a.id)
    }
}

impl Drop for QueryExecutor {
    fn drop(&mut self) {
        self.cancel_active();
    }
}

/// What happened to one event handed to the callback
enum Delivery {
    Delivered,
    /// The query was cancelled first
    Dropped,
    Panicked,
}

impl Delivery {
    /// Outcome of a query whose last delivery ended this way
    fn outcome(self, delivered: QueryOutcome) -> QueryOutcome {
        match self {
            Delivery::Delivered => delivered,
            Delivery::Dropped => QueryOutcome::Cancelled,
            Delivery::Panicked => QueryOutcome::Failed(CALLBACK_PANICKED.into()),
        }
    }
}

struct QueryTask {
    id: Uuid,
    token: CancellationToken,
    slot: Arc<Slot>,
    transport: Arc<dyn Transport>,
    options: ParserOptions,
    on_event: EventCallback,
}

impl QueryTask {
    async fn run(mut self, body: Value) -> QueryOutcome {
        let opened = tokio::select! {
            biased;
            _ = self.token.cancelled() => return QueryOutcome::Cancelled,
            opened = self.transport.open_stream(ApiRequest::post("/query", Some(body))) => opened,
        };

        let source = match opened {
            Ok(source) => source,
            Err(e) => {
                tracing::warn!("Query {} failed before streaming: {}", self.id, e);
                return self.fail(e.to_string()).await;
            }
        };

        let lines = LineStream::new(source, self.token.child_token());
        let mut events = EventStream::new(lines, self.options);
        loop {
            match events.next_event().await {
                Some(Ok(event)) => {
                    let outcome = match &event {
                        StreamEvent::Complete { .. } => Some(QueryOutcome::Completed),
                        StreamEvent::Error { message } => Some(QueryOutcome::Failed(message.clone())),
                        _ => None,
                    };
                    match (self.deliver(event).await, outcome) {
                        (Delivery::Delivered, None) => {}
                        (delivery, outcome) => {
                            return delivery.outcome(outcome.unwrap_or(QueryOutcome::Completed));
                        }
                    }
                }
                Some(Err(e)) => {
                    if self.token.is_cancelled() {
                        return QueryOutcome::Cancelled;
                    }
                    tracing::warn!("Query {} interrupted: {}", self.id, e);
                    return self.fail(e.to_string()).await;
                }
                None => {
                    if self.token.is_cancelled() {
                        return QueryOutcome::Cancelled;
                    }
                    tracing::warn!("Query {}: {}", self.id, PREMATURE_END);
                    return self.fail(PREMATURE_END.to_string()).await;
                }
            }
        }
    }

    /// Deliver a synthetic terminal error
    async fn fail(&mut self, message: String) -> QueryOutcome {
        let event = StreamEvent::Error {
            message: message.clone(),
        };
        self.deliver(event).await.outcome(QueryOutcome::Failed(message))
    }

    /// Hand one event to the callback unless this query has been cancelled
    async fn deliver(&mut self, event: StreamEvent) -> Delivery {
        let _delivering = self.slot.delivery.lock().await;
        if self.token.is_cancelled() {
            return Delivery::Dropped;
        }
        let on_event = &mut self.on_event;
        match panic::catch_unwind(AssertUnwindSafe(|| on_event(event))) {
            Ok(()) => Delivery::Delivered,
            Err(_) => {
                tracing::error!("Event callback of query {} panicked", self.id);
                Delivery::Panicked
            }
        }
    }
}
