//! Message envelope carried between pipeline stages.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;

/// Message headers: string keys mapped to JSON values.
pub type Headers = BTreeMap<String, Value>;

/// An immutable message.
///
/// Every message gets a fresh id and timestamp when it is created. Stages
/// never modify a message they receive; they build a new one with
/// [`Message::derive`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Unique identifier of this message
    id: Uuid,

    /// When this message was created
    timestamp: DateTime<Utc>,

    /// Message body
    payload: Value,

    /// Message headers
    #[serde(default)]
    headers: Headers,
}

impl Message {
    /// Creates a message with the given payload and no headers.
    pub fn new(payload: impl Into<Value>) -> Self {
        Self::with_headers(payload, Headers::new())
    }

    /// Creates a message with the given payload and headers.
    pub fn with_headers(payload: impl Into<Value>, headers: Headers) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            payload: payload.into(),
            headers,
        }
    }

    /// Adds a header while building a message.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Builds a new message from this one with a replaced payload and headers.
    ///
    /// The new message has its own id and timestamp.
    pub fn derive(&self, payload: Value, headers: Headers) -> Self {
        Self::with_headers(payload, headers)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Returns a single header value.
    pub fn header(&self, name: &str) -> Option<&Value> {
        self.headers.get(name)
    }

    /// Returns true if the payload is JSON `null`.
    ///
    /// Empty strings, arrays and objects are valid payloads; only `null` counts
    /// as a missing payload.
    pub fn has_null_payload(&self) -> bool {
        self.payload.is_null()
    }

    /// Splits the message into payload and headers.
    pub fn into_parts(self) -> (Value, Headers) {
        (self.payload, self.headers)
    }
}
