//! Shared leaf types for the relay execution engine.
//!
//! Everything here is either an immutable value type (IDs, contexts, events,
//! state records) or a capability trait (`Tool`, `Agent`) implemented by
//! external collaborators. No component in this crate holds locks or spawns
//! tasks; that is the engine crate's job.

pub mod agent;
pub mod context;
pub mod errors;
pub mod events;
pub mod ids;
pub mod state;
pub mod tools;
