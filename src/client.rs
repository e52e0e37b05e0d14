//! Session client
//!
//! Wires one transport, parameter catalog, lifecycle controller and query
//! executor together for a single server.

use std::sync::Arc;
use thiserror::Error;

use crate::lifecycle::{LifecycleError, ModelController};
use crate::params::{ParameterCatalog, ParameterSchema, ParameterScope};
use crate::query::{QueryError, QueryExecutor, QueryHandle, QueryRequest};
use crate::stream::{ParserOptions, StreamEvent};
use crate::transport::{ApiRequest, HttpTransport, Transport, TransportError};
use crate::types::config::ConfigError;
use crate::types::{ClientConfig, ModelDescriptor, ParamMap, ServerInfo, ServerPing, SessionState};

/// Errors surfaced by the [`Client`] facade
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
    #[error(transparent)]
    Query(#[from] QueryError),
}

/// Client for one inference server
pub struct Client {
    config: ClientConfig,
    transport: Arc<dyn Transport>,
    catalog: Arc<ParameterCatalog>,
    controller: Arc<ModelController>,
    executor: QueryExecutor,
}

impl Client {
    /// Client talking HTTP to `config.server_url`
    pub fn new(mut config: ClientConfig) -> Result<Self, ClientError> {
        config.validate();
        let transport = Arc::new(HttpTransport::new(&config)?);
        Ok(Self::with_transport(config, transport))
    }

    /// Client over any [`Transport`]
    pub fn with_transport(config: ClientConfig, transport: Arc<dyn Transport>) -> Self {
        let catalog = Arc::new(ParameterCatalog::new(transport.clone()));
        let controller = Arc::new(ModelController::new(transport.clone(), catalog.clone()));
        let options = ParserOptions {
            emit_processing: config.emit_processing_events,
        };
        let executor = QueryExecutor::new(transport.clone(), controller.clone(), catalog.clone(), options);

        tracing::debug!("Client created for {}", config.server_url);
        Self {
            config,
            transport,
            catalog,
            controller,
            executor,
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn controller(&self) -> &Arc<ModelController> {
        &self.controller
    }

    pub fn catalog(&self) -> &Arc<ParameterCatalog> {
        &self.catalog
    }

    pub fn executor(&self) -> &QueryExecutor {
        &self.executor
    }

    pub fn session(&self) -> SessionState {
        self.controller.snapshot()
    }

    /// Check that the server is up
    pub async fn ping(&self) -> Result<ServerPing, ClientError> {
        let reply = self.transport.unary(ApiRequest::get("/server/ping")).await?;
        serde_json::from_value(reply)
            .map_err(|e| ClientError::Transport(TransportError::InvalidBody(e.to_string())))
    }

    /// Host platform and resource summary
    pub async fn server_info(&self) -> Result<ServerInfo, ClientError> {
        let reply = self.transport.unary(ApiRequest::get("/server/info")).await?;
        serde_json::from_value(reply)
            .map_err(|e| ClientError::Transport(TransportError::InvalidBody(e.to_string())))
    }

    pub async fn fetch_models(&self) -> Result<Vec<ModelDescriptor>, ClientError> {
        Ok(self.controller.fetch_models().await?)
    }

    pub async fn refresh_status(&self) -> Result<SessionState, ClientError> {
        Ok(self.controller.refresh_status().await?)
    }

    pub async fn load(&self, model: &str, loading_params: &ParamMap) -> Result<SessionState, ClientError> {
        Ok(self.controller.load(model, loading_params).await?)
    }

    pub async fn unload(&self) -> Result<SessionState, ClientError> {
        Ok(self.controller.unload().await?)
    }

    pub async fn parameter_schema(
        &self,
        scope: ParameterScope,
        model: Option<&str>,
    ) -> Result<Arc<ParameterSchema>, ClientError> {
        Ok(self.catalog.schema(scope, model).await?)
    }

    pub async fn query<F>(&self, request: QueryRequest, on_event: F) -> Result<QueryHandle, ClientError>
    where
        F: FnMut(StreamEvent) + Send + 'static,
    {
        Ok(self.executor.query(request, on_event).await?)
    }

    pub async fn complete(&self, request: QueryRequest) -> Result<String, ClientError> {
        Ok(self.executor.complete(request).await?)
    }

    /// Cancel any running query. The loaded model stays loaded.
    pub fn shutdown(&self) {
        if self.executor.cancel_active() {
            tracing::info!("Cancelled running query on shutdown");
        }
    }
}
