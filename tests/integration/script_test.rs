//! Script-file transforms: reloading, header access, timeouts.

use crate::common::{run_config, run_stage, write_script};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tp_error::{ErrorCategory, ErrorKind};
use tp_processor::{HeaderPolicy, ProcessorConfig, TransformConfig, TransformStage};
use tp_script::EngineLimits;
use tp_types::Message;

#[tokio::test]
async fn test_script_transform() {
    let dir = TempDir::new().unwrap();
    let script = write_script(
        dir.path(),
        "enrich.rhai",
        r#"
            let order = payload;
            order.total = order.quantity * order.price;
            order.id = id;
            order
        "#,
    );

    let message = Message::new(json!({"quantity": 3, "price": 5}));
    let message_id = message.id().to_string();

    let config = TransformConfig::with_script(script);
    let output = run_config(&config, ProcessorConfig::new(), vec![message]).await;

    assert_eq!(
        output.payloads(),
        vec![json!({"quantity": 3, "price": 5, "total": 15, "id": message_id})]
    );
}

#[tokio::test]
async fn test_script_edit_picked_up_between_runs() {
    let dir = TempDir::new().unwrap();
    let script = write_script(dir.path(), "version.rhai", "\"v1:\" + payload");

    let config = TransformConfig::with_script(&script);
    let stage = Arc::new(TransformStage::from_config(&config, None).unwrap());

    let output = run_stage(Arc::clone(&stage), ProcessorConfig::new(), vec![Message::new("a")])
        .await;
    assert_eq!(output.payloads(), vec![json!("v1:a")]);

    // Different length, so the change is visible even with coarse mtimes
    write_script(dir.path(), "version.rhai", "\"version2:\" + payload");

    let output = run_stage(Arc::clone(&stage), ProcessorConfig::new(), vec![Message::new("a")])
        .await;
    assert_eq!(output.payloads(), vec![json!("version2:a")]);
    assert_eq!(stage.cache().stats().recompilations, 1);
}

#[tokio::test]
async fn test_broken_script_fixed_later() {
    let dir = TempDir::new().unwrap();
    let script = write_script(dir.path(), "fix.rhai", "payload +");

    let config = TransformConfig::with_script(&script);
    let stage = Arc::new(TransformStage::from_config(&config, None).unwrap());

    let output = run_stage(Arc::clone(&stage), ProcessorConfig::new(), vec![Message::new(1)]).await;
    assert_eq!(output.rejected[0].1.kind(), ErrorKind::Compile);

    write_script(dir.path(), "fix.rhai", "payload + 41");

    let output = run_stage(Arc::clone(&stage), ProcessorConfig::new(), vec![Message::new(1)]).await;
    assert_eq!(output.payloads(), vec![json!(42)]);
}

#[tokio::test]
async fn test_script_controls_headers() {
    let dir = TempDir::new().unwrap();
    let script = write_script(
        dir.path(),
        "route.rhai",
        r#"
            headers.route = if payload.priority > 5 { "fast" } else { "slow" };
            headers.remove("internal");
            payload.body
        "#,
    );

    let config = TransformConfig::with_script(script)
        .with_header_policy(HeaderPolicy::Script)
        .with_set_header("stage", "router");
    let messages = vec![
        Message::new(json!({"priority": 9, "body": "urgent"})).with_header("internal", true),
        Message::new(json!({"priority": 1, "body": "later"})),
    ];

    let output = run_config(&config, ProcessorConfig::new().with_concurrency(1), messages).await;

    assert_eq!(output.payloads(), vec![json!("urgent"), json!("later")]);
    let first = output.emitted[0].headers();
    assert_eq!(first.get("route"), Some(&json!("fast")));
    assert_eq!(first.get("stage"), Some(&json!("router")));
    assert!(!first.contains_key("internal"));
    assert_eq!(output.emitted[1].header("route"), Some(&json!("slow")));
}

#[tokio::test]
async fn test_endless_script_times_out() {
    let dir = TempDir::new().unwrap();
    let script = write_script(
        dir.path(),
        "spin.rhai",
        "if payload == 0 { loop { } }\npayload",
    );

    let config = TransformConfig::with_script(script)
        .with_timeout(Duration::from_millis(100))
        .with_limits(EngineLimits {
            max_operations: 0,
            ..EngineLimits::default()
        });
    let messages = vec![Message::new(1), Message::new(0), Message::new(2)];

    let output = run_config(&config, ProcessorConfig::new().with_concurrency(1), messages).await;

    assert_eq!(output.payloads(), vec![json!(1), json!(2)]);
    assert_eq!(output.stats.timed_out, 1);
    assert_eq!(output.stats.transient_errors, 1);

    let (failed, error) = &output.rejected[0];
    assert_eq!(failed.payload(), &json!(0));
    assert_eq!(error.kind(), ErrorKind::Timeout);
    assert_eq!(tp_error::classify_error(error), ErrorCategory::Transient);
}

#[tokio::test]
async fn test_missing_script_is_transient() {
    let dir = TempDir::new().unwrap();
    let config = TransformConfig::with_script(dir.path().join("absent.rhai"));

    let output = run_config(&config, ProcessorConfig::new(), vec![Message::new(1)]).await;

    assert_eq!(output.stats.transient_errors, 1);
    assert_eq!(output.rejected[0].1.kind(), ErrorKind::Compile);
}
