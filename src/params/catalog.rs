//! Parameter catalog
//!
//! Fetches parameter schemas from the server and caches them per model.

use dashmap::DashMap;
use std::sync::Arc;

use super::{validate, ParameterSchema, ParameterScope, ValidationError};
use crate::transport::{ApiRequest, Transport, TransportError};
use crate::types::ParamMap;

/// Why a parameter map was refused
#[derive(Debug, Clone)]
pub enum CheckError {
    /// The schema could not be fetched
    Schema(TransportError),
    /// The values violate the schema
    Invalid(Vec<ValidationError>),
}

type CacheKey = (ParameterScope, Option<String>);

/// Schema cache backed by the server's parameter endpoints
pub struct ParameterCatalog {
    transport: Arc<dyn Transport>,
    schemas: DashMap<CacheKey, Arc<ParameterSchema>>,
}

impl ParameterCatalog {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            schemas: DashMap::new(),
        }
    }

    /// Schema for `scope`, with the overrides of `model` when given
    pub async fn schema(
        &self,
        scope: ParameterScope,
        model: Option<&str>,
    ) -> Result<Arc<ParameterSchema>, TransportError> {
        let key = (scope, model.map(str::to_string));
        if let Some(cached) = self.schemas.get(&key) {
            return Ok(cached.clone());
        }

        let mut request = ApiRequest::get(scope.path());
        if let Some(model) = model {
            request = request.with_query("model", model);
        }
        let body = self.transport.unary(request).await?;
        let schema = ParameterSchema::from_json(body)
            .map_err(|e| TransportError::InvalidBody(format!("Invalid {} parameter schema: {}", scope, e)))?;

        tracing::debug!(
            "Fetched {} parameter schema for {}: {} global, {} model-specific",
            scope,
            model.unwrap_or("<global>"),
            schema.global.len(),
            schema.model_specific.len()
        );

        let schema = Arc::new(schema);
        self.schemas.insert(key, schema.clone());
        Ok(schema)
    }

    /// Install a schema without asking the server
    pub fn seed(&self, scope: ParameterScope, model: Option<&str>, schema: ParameterSchema) {
        self.schemas.insert((scope, model.map(str::to_string)), Arc::new(schema));
    }

    /// Drop every cached schema
    pub fn invalidate(&self) {
        self.schemas.clear();
    }

    pub fn cached_count(&self) -> usize {
        self.schemas.len()
    }

    /// Validate `input` against the effective specs of `model`.
    ///
    /// An empty input is accepted without fetching anything.
    pub async fn check(
        &self,
        scope: ParameterScope,
        model: &str,
        input: &ParamMap,
    ) -> Result<ParamMap, CheckError> {
        if input.is_empty() {
            return Ok(ParamMap::new());
        }
        let schema = self
            .schema(scope, Some(model))
            .await
            .map_err(CheckError::Schema)?;
        validate(&schema.effective(), input).map_err(CheckError::Invalid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::{Reply, ScriptedTransport};
    use crate::transport::Method;
    use serde_json::json;

    fn schema_body() -> serde_json::Value {
        json!({
            "global": {
                "temperature": {"type": "float", "default": 0.7, "min": 0.0, "max": 2.0}
            },
            "model_specific": {
                "temperature": {"type": "float", "default": 0.8, "min": 0.0, "max": 1.5}
            }
        })
    }

    #[tokio::test]
    async fn test_schema_fetched_once_per_model() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.on(Method::Get, "/model/inference-parameters", Reply::Json(schema_body()));
        let catalog = ParameterCatalog::new(transport.clone());

        let first = catalog.schema(ParameterScope::Inference, Some("alphamonarch")).await.unwrap();
        let second = catalog.schema(ParameterScope::Inference, Some("alphamonarch")).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(transport.call_count("/model/inference-parameters"), 1);

        let call = &transport.calls()[0];
        assert_eq!(call.query, vec![("model".to_string(), "alphamonarch".to_string())]);
    }

    #[tokio::test]
    async fn test_check_uses_model_overrides() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.on(Method::Get, "/model/inference-parameters", Reply::Json(schema_body()));
        let catalog = ParameterCatalog::new(transport);

        let input: ParamMap = [("temperature".to_string(), json!(1.8))].into_iter().collect();
        let err = catalog
            .check(ParameterScope::Inference, "alphamonarch", &input)
            .await
            .unwrap_err();
        assert!(matches!(err, CheckError::Invalid(ref errors) if errors.len() == 1));
    }

    #[tokio::test]
    async fn test_empty_input_skips_fetch() {
        let transport = Arc::new(ScriptedTransport::new());
        let catalog = ParameterCatalog::new(transport.clone());

        let out = catalog
            .check(ParameterScope::Loading, "kunoichi", &ParamMap::new())
            .await
            .unwrap();
        assert!(out.is_empty());
        assert!(transport.calls().is_empty());
    }

    #[tokio::test]
    async fn test_fetch_failure_is_schema_error() {
        let transport = Arc::new(ScriptedTransport::new());
        let catalog = ParameterCatalog::new(transport);

        let input: ParamMap = [("n_ctx".to_string(), json!(4096))].into_iter().collect();
        let err = catalog
            .check(ParameterScope::Loading, "kunoichi", &input)
            .await
            .unwrap_err();
        assert!(matches!(err, CheckError::Schema(TransportError::Http { status: 404, .. })));
    }

    #[tokio::test]
    async fn test_seed_and_invalidate() {
        let transport = Arc::new(ScriptedTransport::new());
        let catalog = ParameterCatalog::new(transport.clone());
        catalog.seed(ParameterScope::Loading, Some("kunoichi"), ParameterSchema::default());
        assert_eq!(catalog.cached_count(), 1);

        catalog.schema(ParameterScope::Loading, Some("kunoichi")).await.unwrap();
        assert!(transport.calls().is_empty());

        catalog.invalidate();
        assert_eq!(catalog.cached_count(), 0);
    }
}
