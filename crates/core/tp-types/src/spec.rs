//! Transform specifications and payload type requirements.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::path::{Path, PathBuf};

/// What a transform stage evaluates.
///
/// Exactly one form is ever present; configuration that sets both or neither
/// is rejected before a `TransformSpec` can be built.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransformSpec {
    /// A short expression, compiled in expression-only mode
    Expression(String),

    /// A script loaded from a file
    Script(ScriptRef),
}

impl TransformSpec {
    /// Creates an expression spec.
    pub fn expression(text: impl Into<String>) -> Self {
        Self::Expression(text.into())
    }

    /// Creates a script spec referencing a file.
    pub fn script(path: impl Into<PathBuf>) -> Self {
        Self::Script(ScriptRef::new(path))
    }

    /// Short description for logs.
    pub fn describe(&self) -> String {
        match self {
            Self::Expression(text) => format!("expression `{text}`"),
            Self::Script(script) => format!("script {}", script.path().display()),
        }
    }
}

/// Reference to a script file.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScriptRef {
    path: PathBuf,
}

impl ScriptRef {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Required shape of the payload a stage emits.
///
/// No coercion is ever applied: a result that does not already have this
/// shape is a type mismatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayloadType {
    /// Any non-null JSON value
    #[default]
    Any,

    /// A JSON string
    String,

    /// A whole number
    Integer,

    /// A floating point number
    Float,

    /// Any number
    Number,

    /// `true` or `false`
    Boolean,

    /// A JSON array
    Array,

    /// A JSON object
    Object,
}

impl PayloadType {
    /// Returns true if `value` has this shape.
    pub fn accepts(&self, value: &Value) -> bool {
        match self {
            Self::Any => !value.is_null(),
            Self::String => value.is_string(),
            Self::Integer => value.is_i64() || value.is_u64(),
            Self::Float => value.is_f64(),
            Self::Number => value.is_number(),
            Self::Boolean => value.is_boolean(),
            Self::Array => value.is_array(),
            Self::Object => value.is_object(),
        }
    }
}

impl fmt::Display for PayloadType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Any => write!(f, "any"),
            Self::String => write!(f, "string"),
            Self::Integer => write!(f, "integer"),
            Self::Float => write!(f, "float"),
            Self::Number => write!(f, "number"),
            Self::Boolean => write!(f, "boolean"),
            Self::Array => write!(f, "array"),
            Self::Object => write!(f, "object"),
        }
    }
}

/// Names the JSON type of a value, for error messages.
pub fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_f64() => "float",
        Value::Number(_) => "integer",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
