//! Configuration types for transform stages and the processor.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;
use tp_error::ConfigError;
use tp_script::{CacheConfig, EngineLimits, RESERVED_BINDINGS};
use tp_types::{Headers, PayloadType, TransformSpec};

/// Default stage name used in logs and errors.
pub const DEFAULT_STAGE_NAME: &str = "transform";

/// How the outbound message's headers are built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HeaderPolicy {
    /// Copy the inbound headers
    #[default]
    Preserve,

    /// Start from no headers
    Discard,

    /// Use the `headers` map as the transformation left it
    Script,
}

/// A configured variable: a literal value or an expression evaluated per message.
///
/// An object with an `expression` key is always read as an expression binding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum VariableBinding {
    Expression { expression: String },
    Value(Value),
}

impl VariableBinding {
    pub fn value(value: impl Into<Value>) -> Self {
        Self::Value(value.into())
    }

    pub fn expression(expression: impl Into<String>) -> Self {
        Self::Expression {
            expression: expression.into(),
        }
    }
}

/// Configuration for a transform stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransformConfig {
    /// Stage name for logging and error reports
    pub name: String,

    /// Inline expression (mutually exclusive with `script`)
    pub expression: Option<String>,

    /// Path to a script file (mutually exclusive with `expression`)
    pub script: Option<PathBuf>,

    /// Extra variables bound into every evaluation
    pub variables: BTreeMap<String, VariableBinding>,

    /// How outbound headers are built
    pub header_policy: HeaderPolicy,

    /// Headers set on every outbound message, after the policy
    pub set_headers: Headers,

    /// Headers removed from every outbound message, last
    pub remove_headers: Vec<String>,

    /// Required outbound payload type
    pub output_type: PayloadType,

    /// Wall-clock budget per evaluation
    #[serde(with = "humantime_serde")]
    pub timeout: Option<Duration>,

    /// Engine safety limits
    pub limits: EngineLimits,

    /// Compiled-transform cache settings
    pub cache: CacheConfig,
}

impl Default for TransformConfig {
    fn default() -> Self {
        Self {
            name: DEFAULT_STAGE_NAME.to_string(),
            expression: None,
            script: None,
            variables: BTreeMap::new(),
            header_policy: HeaderPolicy::default(),
            set_headers: Headers::new(),
            remove_headers: Vec::new(),
            output_type: PayloadType::default(),
            timeout: None,
            limits: EngineLimits::default(),
            cache: CacheConfig::default(),
        }
    }
}

impl TransformConfig {
    /// Creates a config with an inline expression.
    pub fn with_expression(expression: impl Into<String>) -> Self {
        Self {
            expression: Some(expression.into()),
            ..Self::default()
        }
    }

    /// Creates a config with a script file path.
    pub fn with_script(path: impl Into<PathBuf>) -> Self {
        Self {
            script: Some(path.into()),
            ..Self::default()
        }
    }

    /// Sets the stage name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Adds a variable binding.
    pub fn with_variable(mut self, name: impl Into<String>, binding: VariableBinding) -> Self {
        self.variables.insert(name.into(), binding);
        self
    }

    /// Sets the header policy.
    pub fn with_header_policy(mut self, policy: HeaderPolicy) -> Self {
        self.header_policy = policy;
        self
    }

    /// Sets a header on every outbound message.
    pub fn with_set_header(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set_headers.insert(name.into(), value.into());
        self
    }

    /// Removes a header from every outbound message.
    pub fn with_remove_header(mut self, name: impl Into<String>) -> Self {
        self.remove_headers.push(name.into());
        self
    }

    /// Sets the required outbound payload type.
    pub fn with_output_type(mut self, output_type: PayloadType) -> Self {
        self.output_type = output_type;
        self
    }

    /// Sets the per-evaluation wall-clock budget.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Sets the engine limits.
    pub fn with_limits(mut self, limits: EngineLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Sets the cache configuration.
    pub fn with_cache(mut self, cache: CacheConfig) -> Self {
        self.cache = cache;
        self
    }

    /// Returns the configured transformation.
    ///
    /// # Errors
    ///
    /// Exactly one of `expression` and `script` must be set.
    pub fn spec(&self) -> Result<TransformSpec, ConfigError> {
        match (&self.expression, &self.script) {
            (Some(expression), None) => Ok(TransformSpec::expression(expression.clone())),
            (None, Some(path)) => Ok(TransformSpec::script(path)),
            (Some(_), Some(_)) => Err(ConfigError::ConflictingTransform),
            (None, None) => Err(ConfigError::MissingTransform),
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.spec()?;

        if self.name.trim().is_empty() {
            return Err(invalid_setting("name", "must not be empty"));
        }
        if let Some(expression) = &self.expression {
            if expression.trim().is_empty() {
                return Err(invalid_setting("expression", "must not be empty"));
            }
        }
        if self.timeout == Some(Duration::ZERO) {
            return Err(invalid_setting("timeout", "must be greater than zero"));
        }
        if self.limits.max_expr_depth == 0 || self.limits.max_function_expr_depth == 0 {
            return Err(invalid_setting("limits", "expression depths must be at least 1"));
        }

        for (name, binding) in &self.variables {
            validate_binding_name(name)?;
            if let VariableBinding::Expression { expression } = binding {
                if expression.trim().is_empty() {
                    return Err(ConfigError::InvalidBinding {
                        name: name.clone(),
                        reason: "expression must not be empty".to_string(),
                    });
                }
            }
        }

        for name in self.set_headers.keys().chain(&self.remove_headers) {
            if name.trim().is_empty() {
                return Err(ConfigError::InvalidHeader {
                    name: name.clone(),
                    reason: "header name must not be empty".to_string(),
                });
            }
        }
        if let Some(name) = self
            .remove_headers
            .iter()
            .find(|name| self.set_headers.contains_key(*name))
        {
            return Err(ConfigError::InvalidHeader {
                name: name.clone(),
                reason: "header is both set and removed".to_string(),
            });
        }

        Ok(())
    }
}

fn invalid_setting(setting: &str, reason: &str) -> ConfigError {
    ConfigError::InvalidSetting {
        setting: setting.to_string(),
        reason: reason.to_string(),
    }
}

fn validate_binding_name(name: &str) -> Result<(), ConfigError> {
    let invalid = |reason: &str| ConfigError::InvalidBinding {
        name: name.to_string(),
        reason: reason.to_string(),
    };

    if RESERVED_BINDINGS.contains(&name) {
        return Err(invalid("shadows a message binding"));
    }
    if !is_identifier(name) {
        return Err(invalid("not a valid identifier"));
    }
    Ok(())
}

/// ASCII letter or underscore first, then letters, digits or underscores.
pub(crate) fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Configuration for a [`Processor`](crate::Processor).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessorConfig {
    /// Maximum number of messages evaluated at once
    pub concurrency: usize,

    /// Wall-clock limit per message; defaults to the stage's own budget
    #[serde(with = "humantime_serde")]
    pub message_timeout: Option<Duration>,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            concurrency: num_cpus(),
            message_timeout: None,
        }
    }
}

impl ProcessorConfig {
    /// Create a new processor configuration with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the number of concurrent evaluations.
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    /// Set the per-message timeout.
    pub fn with_message_timeout(mut self, timeout: Duration) -> Self {
        self.message_timeout = Some(timeout);
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.concurrency == 0 {
            return Err(invalid_setting("concurrency", "must be at least 1"));
        }
        if self.message_timeout == Some(Duration::ZERO) {
            return Err(invalid_setting("message_timeout", "must be greater than zero"));
        }
        Ok(())
    }
}

/// Get the number of available CPUs.
fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}
