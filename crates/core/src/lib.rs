//! O2IMS core types: objects, scalar values, errors and lazy streams.

#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

pub mod stream;

pub use stream::{BoxStream, Stream};
pub use tokio_util::sync::CancellationToken;

/// Untyped domain entity (alarm, subscription, resource) before or after API shaping.
pub type Object = serde_json::Map<String, serde_json::Value>;

/// Errors shared by every O2IMS crate. HTTP status classification only looks at the variant.
#[derive(Debug, Clone, thiserror::Error, Serialize, Deserialize, PartialEq, Eq)]
pub enum O2Error {
    #[error("validation: {0}")]
    Validation(String),
    #[error("not_found: {0}")]
    NotFound(String),
    /// The request clashes with the current state of the object.
    #[error("conflict: {0}")]
    Conflict(String),
    /// End of stream reached where an item was required.
    #[error("end of stream")]
    End,
    #[error("cancelled")]
    Cancelled,
    #[error("upstream: {0}")]
    Upstream(String),
    #[error("storage: {0}")]
    Storage(String),
    #[error("internal: {0}")]
    Internal(String),
}

pub type O2Result<T> = Result<T, O2Error>;

impl O2Error {
    pub fn validation(msg: impl Into<String>) -> Self { Self::Validation(msg.into()) }
    pub fn not_found(msg: impl Into<String>) -> Self { Self::NotFound(msg.into()) }
    pub fn conflict(msg: impl Into<String>) -> Self { Self::Conflict(msg.into()) }
    pub fn upstream(msg: impl Into<String>) -> Self { Self::Upstream(msg.into()) }
    pub fn internal(msg: impl Into<String>) -> Self { Self::Internal(msg.into()) }

    /// True for the sentinels that mean "nothing there" (404 at the boundary).
    pub fn is_not_found(&self) -> bool { matches!(self, Self::NotFound(_) | Self::End) }
}

impl From<serde_json::Error> for O2Error {
    fn from(e: serde_json::Error) -> Self { Self::Validation(e.to_string()) }
}

/// Scalar comparison value. Objects and arrays never take part in comparisons.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    String(String),
    Number(f64),
    Bool(bool),
    Null,
}

impl Value {
    /// Scalar view of a JSON value; `None` for objects and arrays.
    pub fn from_json(v: &serde_json::Value) -> Option<Self> {
        match v {
            serde_json::Value::String(s) => Some(Self::String(s.clone())),
            serde_json::Value::Number(n) => n.as_f64().map(Self::Number),
            serde_json::Value::Bool(b) => Some(Self::Bool(*b)),
            serde_json::Value::Null => Some(Self::Null),
            serde_json::Value::Array(_) | serde_json::Value::Object(_) => None,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Self::String(_) => "string",
            Self::Number(_) => "number",
            Self::Bool(_) => "bool",
            Self::Null => "null",
        }
    }
}

/// Name of a JSON value's type, for error messages.
pub fn json_type_name(v: &serde_json::Value) -> &'static str {
    match v {
        serde_json::Value::String(_) => "string",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::Bool(_) => "bool",
        serde_json::Value::Null => "null",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}

pub mod prelude {
    pub use super::{BoxStream, CancellationToken, O2Error, O2Result, Object, Stream, Value};
}
