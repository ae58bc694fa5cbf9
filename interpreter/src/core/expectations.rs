//! Step-level `expectedError` parsing and reconciliation

use shared::{Document, Value};

use crate::core::arguments::Arguments;
use crate::error::{BackendError, InterpreterError, InterpreterResult};

/// What a step declares about the error it expects
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ExpectedError {
    pub is_client_error: Option<bool>,
    pub error_contains: Option<String>,
    pub error_code: Option<i64>,
    pub error_code_name: Option<String>,
    pub error_labels_contain: Vec<String>,
    pub error_labels_omit: Vec<String>,
}

impl ExpectedError {
    pub fn parse(value: &Value) -> InterpreterResult<Self> {
        let document: &Document = value.as_object().ok_or_else(|| {
            InterpreterError::malformed(format!(
                "expectedError must be a document, found {}",
                shared::value_type_name(value)
            ))
        })?;
        let args = Arguments::new("expectedError", document);

        let mut expected = ExpectedError::default();
        for (key, value) in args.iter() {
            match key {
                "isError" => {
                    if !args.bool(key, value)? {
                        return Err(InterpreterError::malformed("expectedError.isError must be true"));
                    }
                }
                "isClientError" => expected.is_client_error = Some(args.bool(key, value)?),
                "errorContains" => expected.error_contains = Some(args.string(key, value)?),
                "errorCode" => expected.error_code = Some(args.i64(key, value)?),
                "errorCodeName" => expected.error_code_name = Some(args.string(key, value)?),
                "errorLabelsContain" => expected.error_labels_contain = args.string_list(key, value)?,
                "errorLabelsOmit" => expected.error_labels_omit = args.string_list(key, value)?,
                other => return Err(args.unsupported(other)),
            }
        }
        Ok(expected)
    }

    /// Compare an actual backend error, describing the first difference
    pub fn check(&self, error: &BackendError) -> Result<(), String> {
        if let Some(is_client_error) = self.is_client_error {
            if error.is_client_error() != is_client_error {
                return Err(format!(
                    "expected isClientError={is_client_error}, but error was {:?}: {}",
                    error.kind, error.message
                ));
            }
        }

        if let Some(fragment) = &self.error_contains {
            if !error.message.to_lowercase().contains(&fragment.to_lowercase()) {
                return Err(format!(
                    "expected error message to contain '{fragment}', got '{}'",
                    error.message
                ));
            }
        }

        if let Some(code) = self.error_code {
            if error.code.map(i64::from) != Some(code) {
                return Err(format!("expected error code {code}, got {:?}", error.code));
            }
        }

        if let Some(code_name) = &self.error_code_name {
            if error.code_name.as_deref() != Some(code_name.as_str()) {
                return Err(format!(
                    "expected error code name '{code_name}', got {:?}",
                    error.code_name
                ));
            }
        }

        for label in &self.error_labels_contain {
            if !error.has_label(label) {
                return Err(format!("expected error label '{label}', labels were {:?}", error.labels));
            }
        }

        for label in &self.error_labels_omit {
            if error.has_label(label) {
                return Err(format!("expected error label '{label}' to be absent"));
            }
        }

        Ok(())
    }
}
