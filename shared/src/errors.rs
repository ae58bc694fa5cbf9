//! Shared error types for the conformance test interpreter

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SharedError {
    #[error("Document parse failed: {message}")]
    DocumentParse { message: String },

    #[error("Invalid configuration: {field} = {value}")]
    InvalidConfig { field: String, value: String },
}

pub type SharedResult<T> = Result<T, SharedError>;

impl From<serde_json::Error> for SharedError {
    fn from(error: serde_json::Error) -> Self {
        SharedError::DocumentParse {
            message: error.to_string(),
        }
    }
}
