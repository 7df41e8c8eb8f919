//! Core types for the transform processor.
//!
//! This crate provides the foundational types used throughout the system:
//! - [`Message`] - Immutable envelope carried between pipeline stages
//! - [`TransformSpec`] - What a stage evaluates: an expression or a script
//! - [`PayloadType`] - The payload shape a stage is required to emit

pub mod message;
pub mod spec;

pub use message::*;
pub use spec::*;
