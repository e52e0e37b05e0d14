//! Parameter schema
//!
//! Describes the loading and inference parameters a server accepts, and
//! validates caller-provided values against them before they leave the client.

pub mod catalog;
pub mod validate;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::types::ParamMap;

pub use catalog::{CheckError, ParameterCatalog};
pub use validate::{describe_errors, validate, Bound, ValidationError};

/// Value type a parameter accepts
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamKind {
    #[serde(alias = "int")]
    Integer,
    Float,
    #[serde(alias = "bool")]
    Boolean,
    #[serde(alias = "str")]
    String,
}

impl std::fmt::Display for ParamKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParamKind::Integer => write!(f, "integer"),
            ParamKind::Float => write!(f, "float"),
            ParamKind::Boolean => write!(f, "boolean"),
            ParamKind::String => write!(f, "string"),
        }
    }
}

/// Definition of one accepted parameter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterSpec {
    /// Parameter name; filled from the schema map key when absent on the wire
    #[serde(default)]
    pub key: String,
    #[serde(rename = "type")]
    pub kind: ParamKind,
    #[serde(default)]
    pub default: Value,
    #[serde(default)]
    pub min: Option<f64>,
    #[serde(default)]
    pub max: Option<f64>,
    #[serde(default)]
    pub description: String,
}

impl ParameterSpec {
    pub fn new(key: impl Into<String>, kind: ParamKind, default: Value) -> Self {
        Self {
            key: key.into(),
            kind,
            default,
            min: None,
            max: None,
            description: String::new(),
        }
    }

    pub fn with_range(mut self, min: Option<f64>, max: Option<f64>) -> Self {
        self.min = min;
        self.max = max;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

/// Which family of parameters a schema describes
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum ParameterScope {
    /// How a model is brought into memory (context size, threads, GPU offload)
    Loading,
    /// Sampling behavior of a single generation call
    Inference,
}

impl ParameterScope {
    pub fn path(self) -> &'static str {
        match self {
            ParameterScope::Loading => "/model/loading-parameters",
            ParameterScope::Inference => "/model/inference-parameters",
        }
    }
}

impl std::fmt::Display for ParameterScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParameterScope::Loading => write!(f, "loading"),
            ParameterScope::Inference => write!(f, "inference"),
        }
    }
}

/// Global specs plus the overrides of one model
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParameterSchema {
    pub global: BTreeMap<String, ParameterSpec>,
    pub model_specific: BTreeMap<String, ParameterSpec>,
}

#[derive(Deserialize)]
struct SchemaBody {
    #[serde(default)]
    global: BTreeMap<String, ParameterSpec>,
    #[serde(default)]
    model_specific: BTreeMap<String, ParameterSpec>,
}

impl ParameterSchema {
    /// Parse a schema response.
    ///
    /// Accepts `{"global": {..}, "model_specific": {..}}` or a flat map of global specs.
    pub fn from_json(body: Value) -> Result<Self, serde_json::Error> {
        let split = body
            .as_object()
            .map(|obj| obj.contains_key("global") || obj.contains_key("model_specific"))
            .unwrap_or(false);

        let (global, model_specific) = if split {
            let parsed: SchemaBody = serde_json::from_value(body)?;
            (parsed.global, parsed.model_specific)
        } else {
            let flat: BTreeMap<String, ParameterSpec> = serde_json::from_value(body)?;
            (flat, BTreeMap::new())
        };

        Ok(Self {
            global: fill_keys(global),
            model_specific: fill_keys(model_specific),
        })
    }

    /// Specs in effect for the model; model-specific entries shadow global ones
    pub fn effective(&self) -> BTreeMap<String, ParameterSpec> {
        let mut merged = self.global.clone();
        for (key, spec) in &self.model_specific {
            merged.insert(key.clone(), spec.clone());
        }
        merged
    }

    pub fn get(&self, key: &str) -> Option<&ParameterSpec> {
        self.model_specific.get(key).or_else(|| self.global.get(key))
    }

    /// Default value of every effective parameter
    pub fn defaults(&self) -> ParamMap {
        self.effective()
            .into_iter()
            .filter(|(_, spec)| !spec.default.is_null())
            .map(|(key, spec)| (key, spec.default))
            .collect()
    }
}

fn fill_keys(specs: BTreeMap<String, ParameterSpec>) -> BTreeMap<String, ParameterSpec> {
    specs
        .into_iter()
        .map(|(key, mut spec)| {
            if spec.key.is_empty() {
                spec.key = key.clone();
            }
            (key, spec)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_split_schema() {
        let body = json!({
            "global": {
                "n_ctx": {"type": "int", "default": 2048, "min": 512, "max": 32768, "description": "Context window"},
                "use_mlock": {"type": "bool", "default": true}
            },
            "model_specific": {
                "n_ctx": {"type": "int", "default": 8192, "min": 512, "max": 8192}
            }
        });
        let schema = ParameterSchema::from_json(body).unwrap();
        assert_eq!(schema.global.len(), 2);
        assert_eq!(schema.global["n_ctx"].key, "n_ctx");
        assert_eq!(schema.global["use_mlock"].kind, ParamKind::Boolean);

        let effective = schema.effective();
        assert_eq!(effective["n_ctx"].max, Some(8192.0));
        assert_eq!(effective["n_ctx"].default, json!(8192));
        assert_eq!(schema.get("n_ctx").and_then(|s| s.max), Some(8192.0));
    }

    #[test]
    fn test_parse_flat_schema() {
        let body = json!({
            "temperature": {"type": "float", "default": 0.7, "min": 0.0, "max": 2.0},
            "stop": {"type": "string", "default": null}
        });
        let schema = ParameterSchema::from_json(body).unwrap();
        assert!(schema.model_specific.is_empty());
        assert_eq!(schema.global["temperature"].kind, ParamKind::Float);

        let defaults = schema.defaults();
        assert_eq!(defaults.get("temperature"), Some(&json!(0.7)));
        assert!(!defaults.contains_key("stop"));
    }

    #[test]
    fn test_unknown_type_rejected() {
        let body = json!({"grammar": {"type": "bnf", "default": ""}});
        assert!(ParameterSchema::from_json(body).is_err());
    }
}
