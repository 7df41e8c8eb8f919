//! End-to-end pipeline tests over in-memory channels.

use crate::common::{init_tracing, run_config, run_stage, write_script};
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tp_error::{ErrorCategory, ErrorKind, StageCause};
use tp_processor::{HeaderPolicy, Processor, ProcessorConfig, TransformConfig, TransformStage};
use tp_traits::{bounded, CollectingFailureSink, MessageSink, MessageSource};
use tp_types::{Message, PayloadType};

#[tokio::test]
async fn test_upper_case_pipeline() {
    let config = TransformConfig::with_expression("payload.toUpperCase()");
    let inbound = Message::new("hello").with_header("contentType", "text/plain");
    let inbound_id = inbound.id();

    let output = run_config(&config, ProcessorConfig::new(), vec![inbound]).await;

    assert_eq!(output.payloads(), vec![json!("HELLO")]);
    let outbound = &output.emitted[0];
    assert_ne!(outbound.id(), inbound_id);
    assert_eq!(outbound.header("contentType"), Some(&json!("text/plain")));
    assert!(output.rejected.is_empty());
}

#[tokio::test]
async fn test_failure_does_not_stop_pipeline() {
    let config = TransformConfig::with_expression("100 / payload");
    let messages = vec![Message::new(4), Message::new(0), Message::new(5)];

    let output = run_config(&config, ProcessorConfig::new().with_concurrency(1), messages).await;

    assert_eq!(output.payloads(), vec![json!(25), json!(20)]);
    assert_eq!(output.rejected.len(), 1);

    let (failed, error) = &output.rejected[0];
    assert_eq!(failed.payload(), &json!(0));
    assert_eq!(error.kind(), ErrorKind::Runtime);
    assert_eq!(output.stats.permanent_errors, 1);
    assert_eq!(output.stats.received, 3);
}

#[tokio::test]
async fn test_concurrent_run_matches_sequential_results() {
    let config =
        TransformConfig::with_expression("#{ \"n\": payload, \"square\": payload * payload }");
    let messages = || (0..200).map(Message::new).collect::<Vec<_>>();

    let sequential = ProcessorConfig::new().with_concurrency(1);
    let sequential = run_config(&config, sequential, messages()).await;
    let concurrent = ProcessorConfig::new().with_concurrency(8);
    let concurrent = run_config(&config, concurrent, messages()).await;

    // Concurrency 1 keeps arrival order
    let expected: Vec<Value> = (0..200_i64).map(|n| json!({"n": n, "square": n * n})).collect();
    assert_eq!(sequential.payloads(), expected);

    let as_set = |payloads: Vec<Value>| {
        payloads
            .into_iter()
            .map(|v| v.to_string())
            .collect::<BTreeSet<_>>()
    };
    assert_eq!(as_set(concurrent.payloads()), as_set(sequential.payloads()));
    assert_eq!(concurrent.stats.emitted, 200);
}

#[tokio::test]
async fn test_shared_cache_across_runs() {
    let config = TransformConfig::with_expression("payload + 1");
    let stage = Arc::new(TransformStage::from_config(&config, None).unwrap());

    for _ in 0..3 {
        let messages = vec![Message::new(1)];
        let output = run_stage(Arc::clone(&stage), ProcessorConfig::new(), messages).await;
        assert_eq!(output.payloads(), vec![json!(2)]);
    }

    assert_eq!(stage.cache().stats().compilations, 1);
    assert_eq!(stage.stats().succeeded, 3);
}

#[tokio::test]
async fn test_output_type_and_null_payload_failures() {
    let config =
        TransformConfig::with_expression("payload.len()").with_output_type(PayloadType::Integer);
    let messages = vec![
        Message::new("abc"),
        Message::new(Value::Null),
        Message::new(json!([1, 2])),
        Message::new(""),
    ];

    let output = run_config(&config, ProcessorConfig::new().with_concurrency(1), messages).await;

    assert_eq!(output.payloads(), vec![json!(3), json!(2), json!(0)]);
    assert_eq!(output.rejected.len(), 1);
    assert!(output.rejected[0].1.to_string().contains("null payload"));
}

#[tokio::test]
async fn test_no_value_is_config_failure() {
    let dir = TempDir::new().unwrap();
    let script = write_script(dir.path(), "positive.rhai", "if payload > 0 { payload }");
    let config = TransformConfig::with_script(script);
    let messages = vec![Message::new(1), Message::new(-1)];

    let output = run_config(&config, ProcessorConfig::new().with_concurrency(1), messages).await;

    assert_eq!(output.payloads(), vec![json!(1)]);
    let (_, error) = &output.rejected[0];
    assert_eq!(error.kind(), ErrorKind::Config);
    assert_eq!(error.cause, StageCause::NoValue);
}

#[tokio::test]
async fn test_header_policies() {
    let inbound = || vec![Message::new(1).with_header("trace", "t-1").with_header("secret", "s")];

    let preserve = TransformConfig::with_expression("payload").with_remove_header("secret");
    let output = run_config(&preserve, ProcessorConfig::new(), inbound()).await;
    let headers = output.emitted[0].headers();
    assert_eq!(headers.get("trace"), Some(&json!("t-1")));
    assert!(!headers.contains_key("secret"));

    let discard = TransformConfig::with_expression("payload")
        .with_header_policy(HeaderPolicy::Discard)
        .with_set_header("origin", "transform");
    let output = run_config(&discard, ProcessorConfig::new(), inbound()).await;
    let headers = output.emitted[0].headers();
    assert_eq!(headers.len(), 1);
    assert_eq!(headers.get("origin"), Some(&json!("transform")));
}

#[tokio::test]
async fn test_full_sink_stalls_intake() {
    init_tracing();

    let config = TransformConfig::with_expression("payload * 10");
    let stage = TransformStage::from_config(&config, None).unwrap();
    let processor = Processor::new(Arc::new(stage), ProcessorConfig::new().with_concurrency(1));

    let (inbound_tx, inbound) = bounded(1);
    let (outbound, outbound_rx) = bounded(1);
    let failures = CollectingFailureSink::new();

    let sent = Arc::new(AtomicUsize::new(0));
    let producer = tokio::spawn({
        let sent = Arc::clone(&sent);
        async move {
            for n in 0..10 {
                inbound_tx.send(Message::new(n)).await.unwrap();
                sent.fetch_add(1, Ordering::SeqCst);
            }
        }
    });

    let consumer = async {
        // Nobody reads the sink yet, so the processor stops taking messages
        tokio::time::sleep(Duration::from_millis(200)).await;
        let stalled_at = sent.load(Ordering::SeqCst);
        assert!(stalled_at <= 4, "intake continued to {stalled_at} messages");
        assert!(!producer.is_finished());

        let mut received = Vec::new();
        while received.len() < 10 {
            let message = outbound_rx.receive().await.unwrap().unwrap();
            received.push(message.payload().as_i64().unwrap());
        }
        received
    };

    let (stats, received) = tokio::join!(processor.run(&inbound, &outbound, &failures), consumer);
    producer.await.unwrap();

    let stats = stats.unwrap();
    assert_eq!(stats.emitted, 10);
    assert_eq!(received, (0..10).map(|n| n * 10).collect::<Vec<i64>>());
    assert!(failures.is_empty());
}

#[tokio::test]
async fn test_failure_categories() {
    let config = TransformConfig::with_expression("payload +");
    let output = run_config(&config, ProcessorConfig::new(), vec![Message::new(1)]).await;

    let (_, error) = &output.rejected[0];
    assert_eq!(error.kind(), ErrorKind::Compile);
    assert_eq!(tp_error::classify_error(error), ErrorCategory::Permanent);
}
