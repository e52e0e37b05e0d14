//! lmlink Library
//!
//! Session and streaming client for a remote LLM inference server: parameter
//! validation, model lifecycle control and cancellable streaming queries.

pub mod client;
pub mod lifecycle;
pub mod logging;
pub mod params;
pub mod query;
pub mod stream;
pub mod transport;
pub mod types;

pub use client::{Client, ClientError};
pub use lifecycle::{LifecycleError, LifecycleOp, ModelController};
pub use params::{ParamKind, ParameterCatalog, ParameterSchema, ParameterScope, ParameterSpec, ValidationError};
pub use query::{QueryError, QueryExecutor, QueryHandle, QueryOutcome, QueryRequest};
pub use stream::{EventStream, ParserOptions, StreamEvent};
pub use transport::{ApiRequest, HttpTransport, LineStream, Transport, TransportError};
pub use types::{ClientConfig, LifecyclePhase, ModelDescriptor, ParamMap, SessionState};
