//! Shared type definitions
//!
//! Data types shared by the transport, lifecycle and query layers.

pub mod config;
pub mod model;

pub use config::ClientConfig;
pub use model::{LifecyclePhase, ModelDescriptor, ParamMap, ServerInfo, ServerPing, SessionState};
