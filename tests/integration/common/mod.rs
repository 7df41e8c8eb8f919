//! Common utilities for integration tests.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Once};
use tp_error::StageError;
use tp_processor::{Processor, ProcessorConfig, ProcessorStats, TransformConfig, TransformStage};
use tp_traits::{bounded, CollectingFailureSink, MessageSink, MessageSource};
use tp_types::Message;
use tracing_subscriber::EnvFilter;

static INIT: Once = Once::new();

/// Installs a test-friendly tracing subscriber once per test binary.
pub fn init_tracing() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Writes a script file and returns its path.
pub fn write_script(dir: &Path, name: &str, source: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, source).expect("write script");
    path
}

/// Everything a pipeline run produced.
pub struct RunOutput {
    pub emitted: Vec<Message>,
    pub rejected: Vec<(Message, StageError)>,
    pub stats: ProcessorStats,
}

impl RunOutput {
    /// Emitted payloads, in delivery order.
    pub fn payloads(&self) -> Vec<serde_json::Value> {
        self.emitted.iter().map(|m| m.payload().clone()).collect()
    }
}

/// Runs `messages` through a stage built from `config`.
pub async fn run_config(
    config: &TransformConfig,
    processor_config: ProcessorConfig,
    messages: Vec<Message>,
) -> RunOutput {
    let stage = TransformStage::from_config(config, None).expect("valid config");
    run_stage(Arc::new(stage), processor_config, messages).await
}

/// Runs `messages` through an existing stage.
pub async fn run_stage(
    stage: Arc<TransformStage>,
    processor_config: ProcessorConfig,
    messages: Vec<Message>,
) -> RunOutput {
    init_tracing();

    let (inbound_tx, inbound) = bounded(messages.len().max(1));
    let (outbound, outbound_rx) = bounded(messages.len().max(1));
    let failures = CollectingFailureSink::new();

    for message in messages {
        inbound_tx.send(message).await.expect("inbound open");
    }
    drop(inbound_tx);

    let processor = Processor::new(stage, processor_config);
    let stats = processor
        .run(&inbound, &outbound, &failures)
        .await
        .expect("run completes");
    drop(outbound);

    let mut emitted = Vec::new();
    while let Some(message) = outbound_rx.receive().await.expect("outbound readable") {
        emitted.push(message);
    }

    RunOutput {
        emitted,
        rejected: failures.drain(),
        stats,
    }
}
