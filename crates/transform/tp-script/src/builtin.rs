//! Built-in Rhai functions available to expressions and scripts.
//!
//! String helpers are registered under their snake_case name and, where one
//! exists, the camelCase spelling users know from other message routers, so
//! `to_uppercase(payload)` and `payload.toUpperCase()` are the same call.

use crate::conversion::{dynamic_to_value, value_to_dynamic};
use rhai::{Array, Dynamic, Engine, EvalAltResult};
use std::str::FromStr;

/// Registers all built-in functions in the Rhai engine.
pub fn register_builtin_functions(engine: &mut Engine) {
    register_identity_functions(engine);
    register_parsing_functions(engine);
    register_string_functions(engine);
    register_json_functions(engine);
}

/// Values that differ per call: ids and clock readings.
fn register_identity_functions(engine: &mut Engine) {
    engine.register_fn("uuid", || uuid::Uuid::new_v4().to_string());

    engine.register_fn("timestamp", || chrono::Utc::now().to_rfc3339());
    engine.register_fn("unix_timestamp", || chrono::Utc::now().timestamp());
    engine.register_fn("unix_timestamp_ms", || chrono::Utc::now().timestamp_millis());
}

/// Text that does not parse yields `()`, which a transform can test for.
fn parse_or_unit<T>(text: &str) -> Dynamic
where
    T: FromStr + Clone + Send + Sync + 'static,
{
    text.trim().parse::<T>().map(Dynamic::from).unwrap_or(Dynamic::UNIT)
}

fn parse_flag(text: &str) -> Dynamic {
    match text.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Dynamic::from(true),
        "false" | "0" | "no" | "off" => Dynamic::from(false),
        _ => Dynamic::UNIT,
    }
}

fn register_parsing_functions(engine: &mut Engine) {
    engine.register_fn("parse_int", parse_or_unit::<i64>);
    engine.register_fn("parse_float", parse_or_unit::<f64>);
    engine.register_fn("parse_bool", parse_flag);
}

fn upper(s: &str) -> String {
    s.to_uppercase()
}

fn lower(s: &str) -> String {
    s.to_lowercase()
}

fn starts_with(s: &str, prefix: &str) -> bool {
    s.starts_with(prefix)
}

fn ends_with(s: &str, suffix: &str) -> bool {
    s.ends_with(suffix)
}

// Characters, not bytes
fn char_count(s: &str) -> i64 {
    i64::try_from(s.chars().count()).unwrap_or(i64::MAX)
}

// Character offsets; out of range bounds are clamped
fn substring(s: &str, start: i64, len: i64) -> String {
    let start = usize::try_from(start).unwrap_or(0);
    let len = usize::try_from(len).unwrap_or(0);
    s.chars().skip(start).take(len).collect()
}

fn split(s: &str, delimiter: &str) -> Array {
    s.split(delimiter)
        .map(|part| Dynamic::from(part.to_string()))
        .collect()
}

// Non-string elements are skipped
fn join(parts: Array, delimiter: &str) -> String {
    parts
        .into_iter()
        .filter_map(|part| part.into_string().ok())
        .collect::<Vec<_>>()
        .join(delimiter)
}

fn register_string_functions(engine: &mut Engine) {
    for name in ["to_uppercase", "toUpperCase"] {
        engine.register_fn(name, upper);
    }
    for name in ["to_lowercase", "toLowerCase"] {
        engine.register_fn(name, lower);
    }
    for name in ["starts_with", "startsWith"] {
        engine.register_fn(name, starts_with);
    }
    for name in ["ends_with", "endsWith"] {
        engine.register_fn(name, ends_with);
    }
    engine.register_fn("length", char_count);

    engine.register_fn("trim", |s: &str| s.trim().to_string());
    engine.register_fn("trim_start", |s: &str| s.trim_start().to_string());
    engine.register_fn("trim_end", |s: &str| s.trim_end().to_string());
    engine.register_fn("str_contains", |s: &str, pattern: &str| s.contains(pattern));

    // Returns a new string; Rhai's own replace mutates in place
    engine.register_fn("replace", |s: &str, from: &str, to: &str| s.replace(from, to));

    engine.register_fn("split", split);
    engine.register_fn("join", join);
    engine.register_fn("substring", substring);
}

fn register_json_functions(engine: &mut Engine) {
    engine.register_fn(
        "to_json",
        |value: Dynamic| -> Result<String, Box<EvalAltResult>> {
            let value = dynamic_to_value(value)
                .map_err(|t| format!("cannot encode {t} as JSON"))?;
            serde_json::to_string(&value).map_err(|e| e.to_string().into())
        },
    );

    // Unit on malformed input, like the parse_* family
    engine.register_fn("parse_json", |s: &str| -> Dynamic {
        serde_json::from_str::<serde_json::Value>(s)
            .map(|v| value_to_dynamic(&v))
            .unwrap_or(Dynamic::UNIT)
    });
}
