//! JSON <-> Rhai value conversion.
//!
//! Conversion is exact: nothing is coerced into a different type. Rhai values
//! with no JSON counterpart are reported by type name.

use rhai::{Array, Blob, Dynamic, Map};
use serde_json::{Number, Value};

/// Converts a JSON value into a Rhai value.
///
/// `null` becomes `()`. Unsigned integers beyond `i64::MAX` become floats,
/// the only widening Rhai's integer type forces on us.
pub fn value_to_dynamic(value: &Value) -> Dynamic {
    match value {
        Value::Null => Dynamic::UNIT,
        Value::Bool(b) => Dynamic::from(*b),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Dynamic::from(i)
            } else {
                Dynamic::from(n.as_f64().unwrap_or(f64::NAN))
            }
        }
        Value::String(s) => Dynamic::from(s.clone()),
        Value::Array(items) => {
            let array: Array = items.iter().map(value_to_dynamic).collect();
            Dynamic::from_array(array)
        }
        Value::Object(fields) => {
            let mut map = Map::new();
            for (key, field) in fields {
                map.insert(key.as_str().into(), value_to_dynamic(field));
            }
            map.into()
        }
    }
}

/// Converts a Rhai value into a JSON value.
///
/// # Errors
///
/// Returns the Rhai type name of the first value that has no JSON
/// representation (function pointers, custom types, non-finite floats).
pub fn dynamic_to_value(value: Dynamic) -> Result<Value, String> {
    if value.is_unit() {
        return Ok(Value::Null);
    }
    if let Ok(b) = value.as_bool() {
        return Ok(Value::Bool(b));
    }
    if let Ok(i) = value.as_int() {
        return Ok(Value::Number(i.into()));
    }
    if let Ok(f) = value.as_float() {
        return Number::from_f64(f)
            .map(Value::Number)
            .ok_or_else(|| format!("non-finite float ({f})"));
    }
    if let Ok(c) = value.as_char() {
        return Ok(Value::String(c.to_string()));
    }
    if value.is_string() {
        let type_name = value.type_name();
        return value
            .into_string()
            .map(Value::String)
            .map_err(|_| type_name.to_string());
    }
    if value.is_blob() {
        let blob = value.cast::<Blob>();
        return Ok(Value::Array(
            blob.into_iter().map(|b| Value::Number(b.into())).collect(),
        ));
    }
    if value.is_array() {
        let array = value.cast::<Array>();
        return array
            .into_iter()
            .map(dynamic_to_value)
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array);
    }
    if value.is_map() {
        let map = value.cast::<Map>();
        let mut object = serde_json::Map::with_capacity(map.len());
        for (key, field) in map {
            object.insert(key.to_string(), dynamic_to_value(field)?);
        }
        return Ok(Value::Object(object));
    }

    Err(value.type_name().to_string())
}
