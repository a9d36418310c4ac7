//! The relay execution engine: per-run isolation, ordered event streaming,
//! bounded supervision.
//!
//! `ExecutionEngine` is the only entry point callers need; the other modules
//! are its collaborators and are public for the server crate and for tests.

pub mod alerts;
pub mod dispatcher;
pub mod emitter;
pub mod engine;
pub mod error;
pub mod registry;
pub mod tracker;

pub use alerts::{Alert, AlertSink, LogAlertSink};
pub use dispatcher::ScopedDispatcher;
pub use emitter::{EmitError, EventEmitter};
pub use engine::{EngineConfig, ExecutionEngine};
pub use error::EngineError;
pub use registry::{AgentRegistry, RegistryHealth, Session};
pub use tracker::ExecutionTracker;
