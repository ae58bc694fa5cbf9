//! Typed reads over a step's argument document
//!
//! Builders walk the document themselves (`for (key, value) in args.iter()`)
//! and hand each recognised value to one of these accessors; every error
//! names the operation and the offending key.

use std::time::Duration;

use shared::{value_type_name, Document, Value};

use crate::error::{InterpreterError, InterpreterResult};

#[derive(Debug, Clone, Copy)]
pub struct Arguments<'a> {
    operation: &'a str,
    document: &'a Document,
}

impl<'a> Arguments<'a> {
    pub fn new(operation: &'a str, document: &'a Document) -> Self {
        Self { operation, document }
    }

    pub fn operation(&self) -> &'a str {
        self.operation
    }

    /// Keys in document order
    pub fn iter(&self) -> impl Iterator<Item = (&'a str, &'a Value)> {
        self.document.iter().map(|(key, value)| (key.as_str(), value))
    }

    fn invalid(&self, key: &str, reason: String) -> InterpreterError {
        InterpreterError::InvalidArgument {
            operation: self.operation.to_string(),
            key: key.to_string(),
            reason,
        }
    }

    fn wrong_type(&self, key: &str, expected: &str, value: &Value) -> InterpreterError {
        self.invalid(key, format!("expected {expected}, found {}", value_type_name(value)))
    }

    pub fn unsupported(&self, key: &str) -> InterpreterError {
        InterpreterError::UnsupportedArgument {
            operation: self.operation.to_string(),
            key: key.to_string(),
        }
    }

    pub fn required<T>(&self, value: Option<T>, key: &str) -> InterpreterResult<T> {
        value.ok_or_else(|| InterpreterError::MissingRequiredArgument {
            operation: self.operation.to_string(),
            key: key.to_string(),
        })
    }

    pub fn string(&self, key: &str, value: &Value) -> InterpreterResult<String> {
        value
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| self.wrong_type(key, "string", value))
    }

    /// A non-empty string naming an entity
    pub fn entity_name(&self, key: &str, value: &Value) -> InterpreterResult<String> {
        let name = self.string(key, value)?;
        if name.is_empty() {
            return Err(self.invalid(key, "entity name must not be empty".to_string()));
        }
        Ok(name)
    }

    pub fn document(&self, key: &str, value: &Value) -> InterpreterResult<Document> {
        value
            .as_object()
            .cloned()
            .ok_or_else(|| self.wrong_type(key, "object", value))
    }

    pub fn array(&self, key: &str, value: &Value) -> InterpreterResult<Vec<Value>> {
        value
            .as_array()
            .cloned()
            .ok_or_else(|| self.wrong_type(key, "array", value))
    }

    pub fn string_list(&self, key: &str, value: &Value) -> InterpreterResult<Vec<String>> {
        self.array(key, value)?
            .iter()
            .map(|item| {
                item.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| self.invalid(key, format!("expected array of strings, found {}", value_type_name(item))))
            })
            .collect()
    }

    pub fn bool(&self, key: &str, value: &Value) -> InterpreterResult<bool> {
        value.as_bool().ok_or_else(|| self.wrong_type(key, "bool", value))
    }

    pub fn i64(&self, key: &str, value: &Value) -> InterpreterResult<i64> {
        // Doubles are rejected even when integral, like 3.0
        value.as_i64().ok_or_else(|| self.wrong_type(key, "integer", value))
    }

    pub fn usize(&self, key: &str, value: &Value) -> InterpreterResult<usize> {
        let number = self.i64(key, value)?;
        usize::try_from(number).map_err(|_| self.invalid(key, format!("expected a non-negative integer, found {number}")))
    }

    pub fn duration_ms(&self, key: &str, value: &Value) -> InterpreterResult<Duration> {
        let millis = self.usize(key, value)?;
        Ok(Duration::from_millis(millis as u64))
    }
}
