//! Per-message variable generation.

use serde_json::Value;
use std::collections::BTreeMap;
use tp_types::Message;

/// Variables bound into a transformation's context, by name.
pub type Variables = BTreeMap<String, Value>;

/// Produces extra variables for each message before it is transformed.
///
/// Implemented for any `Fn(&Message) -> Variables` closure.
pub trait VariableGenerator: Send + Sync {
    fn generate(&self, message: &Message) -> Variables;
}

impl<F> VariableGenerator for F
where
    F: Fn(&Message) -> Variables + Send + Sync,
{
    fn generate(&self, message: &Message) -> Variables {
        self(message)
    }
}

/// A generator that returns the same variables for every message.
#[derive(Debug, Clone, Default)]
pub struct StaticVariables {
    variables: Variables,
}

impl StaticVariables {
    pub fn new(variables: Variables) -> Self {
        Self { variables }
    }

    /// Adds a variable.
    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.variables.insert(name.into(), value.into());
        self
    }
}

impl VariableGenerator for StaticVariables {
    fn generate(&self, _message: &Message) -> Variables {
        self.variables.clone()
    }
}
