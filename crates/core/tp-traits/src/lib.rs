//! Core traits for the transform processor.
//!
//! This crate defines the main abstractions around a stage:
//! - [`MessageSource`] / [`MessageSink`] - The channel adapter boundary
//! - [`FailureSink`] - Where failed messages are handed for retry or dead-lettering
//! - [`Stage`] - A synchronous per-message processing step
//! - [`VariableGenerator`] - Per-message variables made available to transformations

pub mod channel;
pub mod stage;
pub mod variables;

pub use channel::*;
pub use stage::*;
pub use variables::*;
