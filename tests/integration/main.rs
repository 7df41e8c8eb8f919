//! Integration tests for the transform processor.
//!
//! Every test wires a real [`TransformStage`](tp_processor::TransformStage)
//! into a [`Processor`](tp_processor::Processor) over in-memory channels; no
//! external services are needed.
//!
//! Set `RUST_LOG=debug` to see the stage's logs in failing tests.

mod common;
mod config_test;
mod pipeline_test;
mod script_test;
