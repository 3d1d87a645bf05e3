//! Shared domain types for trellis.
//!
//! This crate contains the serializable vocabulary of the workflow engine:
//! node/edge/run status enums, status reports, run events, engine
//! configuration, the declarative workflow document, and the error types
//! that cross crate boundaries.
//!
//! Zero runtime dependencies -- only serde, uuid, chrono, thiserror, schemars.

pub mod config;
pub mod document;
pub mod error;
pub mod event;
pub mod workflow;
