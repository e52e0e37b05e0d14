//! Model types
//!
//! Model descriptors, the client-side session snapshot and server health payloads.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Parameter values keyed by name, in deterministic order.
pub type ParamMap = BTreeMap<String, Value>;

/// A loadable model as advertised by the server
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ModelDescriptor {
    /// Name the server uses to identify the model
    pub name: String,
}

impl ModelDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl std::fmt::Display for ModelDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.name)
    }
}

/// Committed view of what the server has loaded.
///
/// `loaded == false` always comes with no model and no context length; use
/// [`SessionState::unloaded`] and [`SessionState::loaded`] to build values that hold it.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SessionState {
    pub loaded: bool,
    pub current_model: Option<ModelDescriptor>,
    pub context_length: Option<u32>,
    #[serde(default)]
    pub loading_parameters: ParamMap,
}

impl SessionState {
    /// Nothing loaded
    pub fn unloaded() -> Self {
        Self::default()
    }

    /// A model is resident with the given context length and loading parameters
    pub fn loaded(
        model: ModelDescriptor,
        context_length: Option<u32>,
        loading_parameters: ParamMap,
    ) -> Self {
        Self {
            loaded: true,
            current_model: Some(model),
            context_length,
            loading_parameters,
        }
    }

    /// Name of the loaded model, if any
    pub fn model_name(&self) -> Option<&str> {
        self.current_model.as_ref().map(|m| m.name.as_str())
    }

    /// True when `name` is the model currently loaded
    pub fn is_loaded(&self, name: &str) -> bool {
        self.loaded && self.model_name() == Some(name)
    }
}

/// Phase of the model lifecycle state machine
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub enum LifecyclePhase {
    Unloaded,
    Loading,
    Loaded,
    Unloading,
}

impl std::fmt::Display for LifecyclePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LifecyclePhase::Unloaded => write!(f, "unloaded"),
            LifecyclePhase::Loading => write!(f, "loading"),
            LifecyclePhase::Loaded => write!(f, "loaded"),
            LifecyclePhase::Unloading => write!(f, "unloading"),
        }
    }
}

/// Reply to `GET /server/ping`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerPing {
    pub status: String,
    #[serde(default)]
    pub timestamp: Option<String>,
}

impl ServerPing {
    pub fn is_online(&self) -> bool {
        self.status == "online"
    }
}

/// Reply to `GET /server/info`. Fields the server omits stay `None`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerInfo {
    #[serde(default)]
    pub server_platform: Option<String>,
    #[serde(default)]
    pub python_version: Option<String>,
    #[serde(default)]
    pub current_model: Option<String>,
    #[serde(default)]
    pub model_loaded: Option<bool>,
    #[serde(default)]
    pub memory_total: Option<u64>,
    #[serde(default)]
    pub memory_available: Option<u64>,
    #[serde(default)]
    pub memory_percent: Option<f64>,
    #[serde(default)]
    pub disk_total: Option<u64>,
    #[serde(default)]
    pub disk_free: Option<u64>,
    #[serde(default)]
    pub cpu_percent: Option<f64>,
    #[serde(default)]
    pub cpu_count: Option<u32>,
    #[serde(default)]
    pub note: Option<String>,
    /// Anything else the server reported
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}
