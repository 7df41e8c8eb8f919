//! Rhai evaluator and compiled-transform cache for the transform processor.
//!
//! This crate provides [`Evaluator`], which compiles a [`TransformSpec`]
//! (an inline expression or a script file) and evaluates it against a
//! message, and [`EvaluationCache`], which keeps one compiled form per spec.
//!
//! # Features
//!
//! - **Expressions and scripts**: expressions are compiled in expression-only
//!   mode, scripts are full Rhai programs loaded from disk
//! - **Exact conversion**: JSON payloads in, JSON payloads out, no coercion
//! - **Limits**: engine operation/size limits plus an optional wall-clock budget
//! - **Script reloading**: edited scripts are recompiled on next use
//! - **Built-in functions**: UUIDs, timestamps, parsing, strings, JSON
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use tp_script::{EvaluationCache, Evaluator};
//! use tp_types::{Message, TransformSpec};
//!
//! let cache = EvaluationCache::new(Arc::new(Evaluator::default()));
//! let compiled = cache.get_or_compile(&TransformSpec::expression("payload.toUpperCase()"))?;
//!
//! let result = cache.evaluator().evaluate(&compiled, &Message::new("hello"))?;
//! assert_eq!(result, serde_json::json!("HELLO"));
//! ```
//!
//! [`TransformSpec`]: tp_types::TransformSpec

mod builtin;
pub mod cache;
pub mod conversion;
pub mod evaluator;

pub use cache::{CacheConfig, CacheStatsSnapshot, EvaluationCache};
pub use evaluator::{
    ensure_payload_type, CompiledTransform, EngineLimits, EvaluationContext, Evaluator,
    ScriptFingerprint, RESERVED_BINDINGS,
};
