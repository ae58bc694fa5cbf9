//! Document value model and namespace identifiers

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::errors::{SharedError, SharedResult};

pub use serde_json::Value;

/// Ordered key/value document; iteration order is insertion order
pub type Document = serde_json::Map<String, Value>;

/// Target of a backend command: a database, optionally narrowed to a collection
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Namespace {
    pub database: String,
    pub collection: Option<String>,
}

impl Namespace {
    pub fn database<S: Into<String>>(database: S) -> Self {
        Self {
            database: database.into(),
            collection: None,
        }
    }

    pub fn collection<D: Into<String>, C: Into<String>>(database: D, collection: C) -> Self {
        Self {
            database: database.into(),
            collection: Some(collection.into()),
        }
    }

    /// Administrative namespace used for server-wide commands
    pub fn admin() -> Self {
        Self::database("admin")
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.collection {
            Some(collection) => write!(f, "{}.{}", self.database, collection),
            None => write!(f, "{}", self.database),
        }
    }
}

/// Type name of a value as used by `$$type` matching and diagnostics
pub fn value_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(number) => {
            if let Some(int) = number.as_i64() {
                if i32::try_from(int).is_ok() { "int" } else { "long" }
            } else if number.as_u64().is_some() {
                "long"
            } else {
                "double"
            }
        }
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Numeric view of a value, if it is a number
pub fn as_number(value: &Value) -> Option<f64> {
    value.as_f64()
}

/// Numbers compare by value regardless of their integral/floating representation
pub fn numbers_equal(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Number(l), Value::Number(r)) => {
            if let (Some(l), Some(r)) = (l.as_i64(), r.as_i64()) {
                return l == r;
            }
            match (l.as_f64(), r.as_f64()) {
                (Some(l), Some(r)) => l == r,
                _ => false,
            }
        }
        _ => false,
    }
}

/// Compact single-line rendering used in diagnostics
pub fn render(value: &Value) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| format!("{value:?}"))
}

/// Compact rendering of a document
pub fn render_document(document: &Document) -> String {
    render(&Value::Object(document.clone()))
}

/// Parse a JSON text that must hold a top-level document
pub fn parse_document(text: &str) -> SharedResult<Document> {
    match serde_json::from_str::<Value>(text)? {
        Value::Object(document) => Ok(document),
        other => Err(SharedError::DocumentParse {
            message: format!("expected a document, found {}", value_type_name(&other)),
        }),
    }
}

/// Name of the first key in a document (the command name for command documents)
pub fn first_key(document: &Document) -> Option<&str> {
    document.keys().next().map(String::as_str)
}
