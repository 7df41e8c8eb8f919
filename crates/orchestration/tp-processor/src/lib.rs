//! tp-processor - Message transform stage for streaming pipelines.
//!
//! This crate provides [`TransformStage`], which evaluates a configured
//! expression or script for every inbound message and emits a new message
//! carrying the result, and [`Processor`], which drives a stage between a
//! message source and sink:
//!
//! - Inline expressions or external scripts, compiled once and cached
//! - Edited scripts picked up without restarting
//! - Header policies and per-message variable bindings
//! - Bounded concurrency with a per-message wall-clock budget
//! - Failed messages handed to a failure sink with a retry category
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use tp_processor::{Processor, ProcessorConfig, TransformConfig, TransformStage};
//! use tp_traits::{bounded, CollectingFailureSink};
//!
//! let config = TransformConfig::with_expression("payload.toUpperCase()");
//! let stage = TransformStage::from_config(&config, None)?;
//!
//! let (inbound_tx, inbound) = bounded(100);
//! let (outbound, outbound_rx) = bounded(100);
//! let failures = CollectingFailureSink::new();
//!
//! let processor = Processor::new(Arc::new(stage), ProcessorConfig::new().with_concurrency(4));
//! let stats = processor.run(&inbound, &outbound, &failures).await?;
//!
//! eprintln!("Emitted {} messages, {} failed", stats.emitted, stats.failed);
//! ```

pub mod config;
pub mod processor;
pub mod stage;
pub mod stats;

pub use config::{HeaderPolicy, ProcessorConfig, TransformConfig, VariableBinding};
pub use processor::Processor;
pub use stage::TransformStage;
pub use stats::{ProcessorStats, StageStats, StageStatsSnapshot};
