//! Stages built from host-supplied JSON configuration.

use crate::common::run_config;
use serde_json::json;
use std::sync::Arc;
use tp_error::ConfigError;
use tp_processor::{ProcessorConfig, TransformConfig, TransformStage};
use tp_traits::{StaticVariables, VariableGenerator};
use tp_types::Message;

fn parse(value: serde_json::Value) -> TransformConfig {
    serde_json::from_value(value).expect("config deserializes")
}

#[tokio::test]
async fn test_json_config_end_to_end() {
    let config = parse(json!({
        "name": "greeter",
        "expression": "greeting + \", \" + payload.name + suffix",
        "variables": {
            "greeting": "Hello",
            "suffix": {"expression": "headers.mark"}
        },
        "header_policy": "discard",
        "set_headers": {"contentType": "text/plain"},
        "output_type": "string",
        "timeout": "1s"
    }));

    let messages = vec![
        Message::new(json!({"name": "Ada"})).with_header("mark", "!"),
        Message::new(json!({"name": "Bob"})).with_header("mark", "."),
    ];

    let output = run_config(&config, ProcessorConfig::new().with_concurrency(1), messages).await;

    assert_eq!(output.payloads(), vec![json!("Hello, Ada!"), json!("Hello, Bob.")]);
    assert!(output
        .emitted
        .iter()
        .all(|m| m.headers().len() == 1 && m.header("contentType") == Some(&json!("text/plain"))));
}

#[test]
fn test_conflicting_transform_rejected() {
    let config = parse(json!({
        "expression": "payload",
        "script": "/etc/transform.rhai"
    }));

    let error = TransformStage::from_config(&config, None).unwrap_err();
    assert_eq!(error, ConfigError::ConflictingTransform);
}

#[test]
fn test_missing_transform_rejected() {
    let config = parse(json!({"name": "empty"}));

    let error = TransformStage::from_config(&config, None).unwrap_err();
    assert_eq!(error, ConfigError::MissingTransform);
}

#[test]
fn test_reserved_variable_rejected() {
    let config = parse(json!({
        "expression": "payload",
        "variables": {"headers": 1}
    }));

    let error = TransformStage::from_config(&config, None).unwrap_err();
    assert!(matches!(error, ConfigError::InvalidBinding { name, .. } if name == "headers"));
}

#[tokio::test]
async fn test_generator_supplies_variables() {
    let config = TransformConfig::with_expression("payload * multiplier");
    let generator: Arc<dyn VariableGenerator> =
        Arc::new(StaticVariables::default().with("multiplier", 7));
    let stage = TransformStage::from_config(&config, Some(generator)).unwrap();

    let messages = vec![Message::new(6)];
    let output = crate::common::run_stage(Arc::new(stage), ProcessorConfig::new(), messages).await;
    assert_eq!(output.payloads(), vec![json!(42)]);
}
