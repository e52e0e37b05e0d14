//! Model lifecycle controller
//!
//! Owns the client's [`SessionState`] and serializes load, unload and status
//! operations against the server. A second lifecycle call made while one is in
//! flight is rejected with [`LifecycleError::OperationInProgress`].

use serde::Deserialize;
use serde_json::Value;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::watch;

use crate::params::{describe_errors, CheckError, ParameterCatalog, ParameterScope, ValidationError};
use crate::transport::{ApiRequest, Transport, TransportError};
use crate::types::{LifecyclePhase, ModelDescriptor, ParamMap, SessionState};

/// Loading parameter carrying the requested context size
const CONTEXT_PARAM: &str = "n_ctx";

/// Lifecycle operation occupying the single operation slot
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum LifecycleOp {
    Load,
    Unload,
    Refresh,
}

impl std::fmt::Display for LifecycleOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LifecycleOp::Load => write!(f, "load"),
            LifecycleOp::Unload => write!(f, "unload"),
            LifecycleOp::Refresh => write!(f, "status refresh"),
        }
    }
}

/// Lifecycle errors
#[derive(Debug, Clone, Error)]
pub enum LifecycleError {
    #[error("A model {0} is already in progress")]
    OperationInProgress(LifecycleOp),
    #[error("No model is loaded")]
    NotLoaded,
    #[error("Invalid loading parameters: {}", describe_errors(.0))]
    Validation(Vec<ValidationError>),
    #[error("Could not fetch parameter schema: {0}")]
    Schema(TransportError),
    #[error("Could not fetch model list: {0}")]
    ModelsFetch(TransportError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl From<CheckError> for LifecycleError {
    fn from(e: CheckError) -> Self {
        match e {
            CheckError::Schema(e) => LifecycleError::Schema(e),
            CheckError::Invalid(errors) => LifecycleError::Validation(errors),
        }
    }
}

#[derive(Deserialize)]
struct ModelsReply {
    #[serde(default)]
    models: Vec<String>,
}

#[derive(Deserialize)]
struct StatusReply {
    #[serde(default)]
    loaded: bool,
    #[serde(default)]
    current_model: Option<String>,
    #[serde(default)]
    context_length: Option<u64>,
    #[serde(default)]
    loading_parameters: Option<ParamMap>,
}

impl StatusReply {
    fn into_state(self) -> SessionState {
        if !self.loaded {
            return SessionState::unloaded();
        }
        SessionState {
            loaded: true,
            current_model: self.current_model.map(ModelDescriptor::new),
            context_length: self.context_length.and_then(|n| u32::try_from(n).ok()),
            loading_parameters: self.loading_parameters.unwrap_or_default(),
        }
    }
}

/// Holds the operation slot; frees it when dropped, including when the
/// owning future is cancelled.
struct OpGuard<'a> {
    slot: &'a Mutex<Option<LifecycleOp>>,
}

impl Drop for OpGuard<'_> {
    fn drop(&mut self) {
        *self.slot.lock().expect("lifecycle mutex poisoned") = None;
    }
}

/// Single writer of the session state
pub struct ModelController {
    transport: Arc<dyn Transport>,
    catalog: Arc<ParameterCatalog>,
    state: watch::Sender<SessionState>,
    in_flight: Mutex<Option<LifecycleOp>>,
}

impl ModelController {
    pub fn new(transport: Arc<dyn Transport>, catalog: Arc<ParameterCatalog>) -> Self {
        Self {
            transport,
            catalog,
            state: watch::Sender::new(SessionState::unloaded()),
            in_flight: Mutex::new(None),
        }
    }

    /// Last committed state. Never reflects a half-finished transition.
    pub fn snapshot(&self) -> SessionState {
        self.state.borrow().clone()
    }

    /// Receiver notified on every committed state change
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    pub fn phase(&self) -> LifecyclePhase {
        let in_flight = *self.in_flight.lock().expect("lifecycle mutex poisoned");
        match in_flight {
            Some(LifecycleOp::Load) => LifecyclePhase::Loading,
            Some(LifecycleOp::Unload) => LifecyclePhase::Unloading,
            _ if self.state.borrow().loaded => LifecyclePhase::Loaded,
            _ => LifecyclePhase::Unloaded,
        }
    }

    /// Operation currently in flight, if any
    pub fn in_flight(&self) -> Option<LifecycleOp> {
        *self.in_flight.lock().expect("lifecycle mutex poisoned")
    }

    fn begin(&self, op: LifecycleOp) -> Result<OpGuard<'_>, LifecycleError> {
        let mut slot = self.in_flight.lock().expect("lifecycle mutex poisoned");
        if let Some(current) = *slot {
            tracing::warn!("Rejecting {} while {} is in progress", op, current);
            return Err(LifecycleError::OperationInProgress(current));
        }
        *slot = Some(op);
        Ok(OpGuard {
            slot: &self.in_flight,
        })
    }

    fn commit(&self, state: SessionState) {
        self.state.send_replace(state);
    }

    /// List the models the server can load. Leaves the session untouched.
    pub async fn fetch_models(&self) -> Result<Vec<ModelDescriptor>, LifecycleError> {
        let body = self
            .transport
            .unary(ApiRequest::get("/models"))
            .await
            .map_err(LifecycleError::ModelsFetch)?;
        let reply: ModelsReply = serde_json::from_value(body)
            .map_err(|e| LifecycleError::ModelsFetch(TransportError::InvalidBody(e.to_string())))?;

        tracing::debug!("Server offers {} models", reply.models.len());
        Ok(reply.models.into_iter().map(ModelDescriptor::new).collect())
    }

    /// Replace the session with the server's view of what is loaded
    pub async fn refresh_status(&self) -> Result<SessionState, LifecycleError> {
        let _guard = self.begin(LifecycleOp::Refresh)?;

        let body = self.transport.unary(ApiRequest::get("/model/status")).await?;
        let reply: StatusReply = serde_json::from_value(body)
            .map_err(|e| TransportError::InvalidBody(e.to_string()))?;
        let state = reply.into_state();

        tracing::info!(
            "Server status: {}",
            state.model_name().unwrap_or(if state.loaded { "<unnamed>" } else { "no model loaded" })
        );
        self.commit(state.clone());
        Ok(state)
    }

    /// Load `model` with the given loading parameters.
    ///
    /// Parameters are validated before anything is sent. On failure the
    /// previous state is kept.
    pub async fn load(&self, model: &str, loading_params: &ParamMap) -> Result<SessionState, LifecycleError> {
        let _guard = self.begin(LifecycleOp::Load)?;

        let params = self
            .catalog
            .check(ParameterScope::Loading, model, loading_params)
            .await?;

        let mut body = serde_json::Map::new();
        for (key, value) in &params {
            body.insert(key.clone(), value.clone());
        }
        body.insert("model".to_string(), Value::String(model.to_string()));

        tracing::info!("Loading model {} with {} parameters", model, params.len());
        let reply = match self
            .transport
            .unary(ApiRequest::post("/model/load", Some(Value::Object(body))))
            .await
        {
            Ok(reply) => reply,
            Err(e) => {
                tracing::warn!("Failed to load model {}, keeping previous state: {}", model, e);
                return Err(e.into());
            }
        };

        // The server's context length wins over the requested one
        let context_length = reply
            .get("context_length")
            .and_then(Value::as_u64)
            .or_else(|| params.get(CONTEXT_PARAM).and_then(Value::as_u64))
            .and_then(|n| u32::try_from(n).ok());

        if let Some(message) = reply.get("message").and_then(Value::as_str) {
            tracing::info!("{}", message);
        }

        let state = SessionState::loaded(ModelDescriptor::new(model), context_length, params);
        self.commit(state.clone());
        Ok(state)
    }

    /// Unload the current model. Fails with `NotLoaded` without contacting
    /// the server when nothing is loaded.
    pub async fn unload(&self) -> Result<SessionState, LifecycleError> {
        let _guard = self.begin(LifecycleOp::Unload)?;

        let previous = self.snapshot();
        if !previous.loaded {
            return Err(LifecycleError::NotLoaded);
        }

        let name = previous.model_name().unwrap_or("<unnamed>").to_string();
        tracing::info!("Unloading model {}", name);
        if let Err(e) = self.transport.unary(ApiRequest::post("/model/unload", None)).await {
            tracing::warn!("Failed to unload model {}, still loaded: {}", name, e);
            return Err(e.into());
        }

        let state = SessionState::unloaded();
        self.commit(state.clone());
        Ok(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::{ParamKind, ParameterSchema, ParameterSpec};
    use crate::transport::mock::{Reply, ScriptedTransport};
    use crate::transport::Method;
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::Notify;

    fn loading_schema() -> ParameterSchema {
        let mut schema = ParameterSchema::default();
        schema.global.insert(
            "n_ctx".into(),
            ParameterSpec::new("n_ctx", ParamKind::Integer, json!(2048)).with_range(Some(512.0), Some(32768.0)),
        );
        schema.global.insert(
            "n_gpu_layers".into(),
            ParameterSpec::new("n_gpu_layers", ParamKind::Integer, json!(-1)).with_range(Some(-1.0), None),
        );
        schema
    }

    fn setup() -> (Arc<ScriptedTransport>, Arc<ModelController>) {
        let transport = Arc::new(ScriptedTransport::new());
        let catalog = Arc::new(ParameterCatalog::new(transport.clone()));
        for model in ["modelA", "modelB"] {
            catalog.seed(ParameterScope::Loading, Some(model), loading_schema());
        }
        let controller = Arc::new(ModelController::new(transport.clone(), catalog));
        (transport, controller)
    }

    fn params(value: serde_json::Value) -> ParamMap {
        serde_json::from_value(value).unwrap()
    }

    async fn wait_for_phase(controller: &ModelController, phase: LifecyclePhase) {
        for _ in 0..200 {
            if controller.phase() == phase {
                return;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        panic!("controller never reached {phase}");
    }

    #[tokio::test]
    async fn test_load_commits_state() {
        let (transport, controller) = setup();
        transport.on(
            Method::Post,
            "/model/load",
            Reply::Json(json!({"message": "Model modelA loaded successfully"})),
        );

        let state = controller.load("modelA", &params(json!({"n_ctx": 4096}))).await.unwrap();
        assert!(state.is_loaded("modelA"));
        assert_eq!(state.context_length, Some(4096));
        assert_eq!(state.loading_parameters.get("n_ctx"), Some(&json!(4096)));
        assert_eq!(controller.snapshot(), state);
        assert_eq!(controller.phase(), LifecyclePhase::Loaded);

        let call = &transport.calls()[0];
        assert_eq!(call.body, Some(json!({"model": "modelA", "n_ctx": 4096})));
    }

    #[tokio::test]
    async fn test_server_context_length_wins() {
        let (transport, controller) = setup();
        transport.on(Method::Post, "/model/load", Reply::Json(json!({"context_length": 8192})));

        let state = controller.load("modelA", &params(json!({"n_ctx": 4096}))).await.unwrap();
        assert_eq!(state.context_length, Some(8192));
    }

    #[tokio::test]
    async fn test_invalid_params_never_sent() {
        let (transport, controller) = setup();

        let err = controller
            .load("modelA", &params(json!({"n_ctx": "4096", "flash_attn": true})))
            .await
            .unwrap_err();
        match err {
            LifecycleError::Validation(errors) => assert_eq!(errors.len(), 2),
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(transport.call_count("/model/load"), 0);
        assert_eq!(controller.snapshot(), SessionState::unloaded());
        assert_eq!(controller.in_flight(), None);
    }

    #[tokio::test]
    async fn test_concurrent_load_rejected() {
        let (transport, controller) = setup();
        let gate = Arc::new(Notify::new());
        transport.on(
            Method::Post,
            "/model/load",
            Reply::Gated(gate.clone(), Box::new(Reply::Json(json!({"context_length": 4096})))),
        );

        let first = {
            let controller = controller.clone();
            tokio::spawn(async move { controller.load("modelA", &params(json!({"n_ctx": 4096}))).await })
        };
        wait_for_phase(&controller, LifecyclePhase::Loading).await;

        let err = controller.load("modelB", &ParamMap::new()).await.unwrap_err();
        assert!(matches!(err, LifecycleError::OperationInProgress(LifecycleOp::Load)));
        assert_eq!(controller.snapshot(), SessionState::unloaded());

        let err = controller.unload().await.unwrap_err();
        assert!(matches!(err, LifecycleError::OperationInProgress(LifecycleOp::Load)));

        gate.notify_one();
        let state = first.await.unwrap().unwrap();
        assert!(state.is_loaded("modelA"));
        assert_eq!(transport.call_count("/model/load"), 1);
    }

    #[tokio::test]
    async fn test_failed_load_keeps_previous_model() {
        let (transport, controller) = setup();
        transport
            .on(Method::Post, "/model/load", Reply::Json(json!({})))
            .on(
                Method::Post,
                "/model/load",
                Reply::Fail(TransportError::Http {
                    status: 500,
                    message: Some("out of memory".into()),
                }),
            );

        controller.load("modelA", &ParamMap::new()).await.unwrap();
        let before = controller.snapshot();

        let err = controller.load("modelB", &ParamMap::new()).await.unwrap_err();
        assert!(matches!(err, LifecycleError::Transport(TransportError::Http { status: 500, .. })));
        assert_eq!(controller.snapshot(), before);
        assert_eq!(controller.phase(), LifecyclePhase::Loaded);
    }

    #[tokio::test]
    async fn test_abandoned_load_frees_slot() {
        let (transport, controller) = setup();
        let gate = Arc::new(Notify::new());
        transport
            .on(Method::Post, "/model/load", Reply::Gated(gate, Box::new(Reply::Json(json!({})))))
            .on(Method::Post, "/model/load", Reply::Json(json!({})));

        let abandoned =
            tokio::time::timeout(Duration::from_millis(20), controller.load("modelA", &ParamMap::new())).await;
        assert!(abandoned.is_err());
        assert_eq!(controller.phase(), LifecyclePhase::Unloaded);

        let state = controller.load("modelB", &ParamMap::new()).await.unwrap();
        assert!(state.is_loaded("modelB"));
    }

    #[tokio::test]
    async fn test_unload_when_unloaded() {
        let (transport, controller) = setup();
        let err = controller.unload().await.unwrap_err();
        assert!(matches!(err, LifecycleError::NotLoaded));
        assert!(transport.calls().is_empty());
    }

    #[tokio::test]
    async fn test_unload_success_and_failure() {
        let (transport, controller) = setup();
        transport
            .on(Method::Post, "/model/load", Reply::Json(json!({})))
            .on(Method::Post, "/model/unload", Reply::Fail(TransportError::Network("reset".into())))
            .on(Method::Post, "/model/unload", Reply::Json(json!({"message": "unloaded"})));
        controller.load("modelA", &ParamMap::new()).await.unwrap();

        assert!(controller.unload().await.is_err());
        assert!(controller.snapshot().is_loaded("modelA"));

        let state = controller.unload().await.unwrap();
        assert_eq!(state, SessionState::unloaded());
        assert_eq!(controller.phase(), LifecyclePhase::Unloaded);
    }

    #[tokio::test]
    async fn test_refresh_status_overwrites() {
        let (transport, controller) = setup();
        transport
            .on(
                Method::Get,
                "/model/status",
                Reply::Json(json!({
                    "loaded": true,
                    "current_model": "modelB",
                    "context_length": 2048,
                    "loading_parameters": {"n_gpu_layers": -1}
                })),
            )
            .on(
                Method::Get,
                "/model/status",
                Reply::Json(json!({"loaded": false, "current_model": "stale", "context_length": 2048})),
            );

        let mut updates = controller.subscribe();
        let state = controller.refresh_status().await.unwrap();
        assert!(state.is_loaded("modelB"));
        assert_eq!(state.context_length, Some(2048));
        assert!(updates.has_changed().unwrap());
        assert_eq!(*updates.borrow_and_update(), state);

        let state = controller.refresh_status().await.unwrap();
        assert_eq!(state, SessionState::unloaded());
    }

    #[tokio::test]
    async fn test_refresh_failure_keeps_state() {
        let (transport, controller) = setup();
        transport.on(Method::Get, "/model/status", Reply::Json(json!(["not", "an", "object"])));

        let err = controller.refresh_status().await.unwrap_err();
        assert!(matches!(err, LifecycleError::Transport(TransportError::InvalidBody(_))));
        assert_eq!(controller.snapshot(), SessionState::unloaded());
    }

    #[tokio::test]
    async fn test_fetch_models() {
        let (transport, controller) = setup();
        transport
            .on(Method::Get, "/models", Reply::Json(json!({"models": ["MyMainLLM", "MySecondLLM"]})))
            .on(Method::Get, "/models", Reply::Fail(TransportError::Network("refused".into())));

        let models = controller.fetch_models().await.unwrap();
        assert_eq!(models, vec![ModelDescriptor::new("MyMainLLM"), ModelDescriptor::new("MySecondLLM")]);

        let err = controller.fetch_models().await.unwrap_err();
        assert!(matches!(err, LifecycleError::ModelsFetch(_)));
        assert_eq!(controller.snapshot(), SessionState::unloaded());
    }
}
