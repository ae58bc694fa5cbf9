//! Interpreter-specific error types

use shared::SharedError;
use std::fmt;
use thiserror::Error;

/// Broad origin of a backend failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendErrorKind {
    /// The server rejected the command
    Server,
    /// The client-side driver refused the request before it reached a server
    Client,
    /// The transport failed
    Network,
    /// The backend gave up waiting
    Timeout,
}

/// Failure reported by the Command Executor or Cluster Provider
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{message}")]
pub struct BackendError {
    pub kind: BackendErrorKind,
    pub code: Option<i32>,
    pub code_name: Option<String>,
    pub message: String,
    pub labels: Vec<String>,
}

impl BackendError {
    pub fn server<S: Into<String>>(code: i32, code_name: S, message: S) -> Self {
        Self {
            kind: BackendErrorKind::Server,
            code: Some(code),
            code_name: Some(code_name.into()),
            message: message.into(),
            labels: Vec::new(),
        }
    }

    pub fn client<S: Into<String>>(message: S) -> Self {
        Self {
            kind: BackendErrorKind::Client,
            code: None,
            code_name: None,
            message: message.into(),
            labels: Vec::new(),
        }
    }

    pub fn network<S: Into<String>>(message: S) -> Self {
        Self {
            kind: BackendErrorKind::Network,
            code: None,
            code_name: None,
            message: message.into(),
            labels: Vec::new(),
        }
    }

    pub fn with_label<S: Into<String>>(mut self, label: S) -> Self {
        self.labels.push(label.into());
        self
    }

    pub fn is_client_error(&self) -> bool {
        self.kind == BackendErrorKind::Client
    }

    pub fn has_label(&self, label: &str) -> bool {
        self.labels.iter().any(|candidate| candidate == label)
    }
}

pub type BackendResult<T> = Result<T, BackendError>;

/// Why a step was cancelled
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancelReason {
    /// The caller fired the cancellation signal
    Requested,
    /// The step did not finish within its timeout
    TimedOut { timeout_ms: u64 },
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CancelReason::Requested => write!(f, "cancellation requested"),
            CancelReason::TimedOut { timeout_ms } => write!(f, "timed out after {timeout_ms}ms"),
        }
    }
}

#[derive(Error, Debug)]
pub enum InterpreterError {
    #[error("Unknown operation: '{name}'")]
    UnknownOperation { name: String },

    #[error("Invalid {operation} argument name: '{key}'")]
    UnsupportedArgument { operation: String, key: String },

    #[error("Missing required {operation} argument: '{key}'")]
    MissingRequiredArgument { operation: String, key: String },

    #[error("Invalid {operation} argument '{key}': {reason}")]
    InvalidArgument {
        operation: String,
        key: String,
        reason: String,
    },

    #[error("Malformed step: {reason}")]
    MalformedStep { reason: String },

    #[error("Entity '{name}' already exists")]
    DuplicateEntity { name: String },

    #[error("Unknown entity: '{name}'")]
    UnknownEntity { name: String },

    #[error("Entity '{name}' is a {actual}, expected a {expected}")]
    WrongEntityKind {
        name: String,
        expected: String,
        actual: String,
    },

    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("Assertion failed: {message}")]
    AssertionMismatch { message: String },

    #[error("Cancelled: {reason}")]
    Cancelled { reason: CancelReason },

    #[error("Configuration error: {field}: {reason}")]
    Configuration { field: String, reason: String },

    #[error("Teardown failed for {} entities: {}", failures.len(), failures.join("; "))]
    Teardown { failures: Vec<String> },

    #[error("Shared component error: {0}")]
    Shared(#[from] SharedError),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type InterpreterResult<T> = Result<T, InterpreterError>;

/// Category a failure is reported under in a test run outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    MalformedStep,
    UnknownEntity,
    WrongEntityKind,
    BackendError,
    AssertionMismatch,
    Cancelled,
    Teardown,
}

impl FailureKind {
    /// Kinds that end a test run regardless of the step's failure policy
    pub fn is_always_fatal(self) -> bool {
        matches!(
            self,
            FailureKind::MalformedStep
                | FailureKind::UnknownEntity
                | FailureKind::WrongEntityKind
                | FailureKind::Cancelled
        )
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FailureKind::MalformedStep => "MalformedStep",
            FailureKind::UnknownEntity => "UnknownEntity",
            FailureKind::WrongEntityKind => "WrongEntityKind",
            FailureKind::BackendError => "BackendError",
            FailureKind::AssertionMismatch => "AssertionMismatch",
            FailureKind::Cancelled => "Cancelled",
            FailureKind::Teardown => "Teardown",
        };
        write!(f, "{name}")
    }
}

impl InterpreterError {
    pub fn kind(&self) -> FailureKind {
        match self {
            InterpreterError::UnknownOperation { .. }
            | InterpreterError::UnsupportedArgument { .. }
            | InterpreterError::MissingRequiredArgument { .. }
            | InterpreterError::InvalidArgument { .. }
            | InterpreterError::MalformedStep { .. }
            | InterpreterError::DuplicateEntity { .. }
            | InterpreterError::Configuration { .. }
            | InterpreterError::Shared(_)
            | InterpreterError::Json(_) => FailureKind::MalformedStep,
            InterpreterError::UnknownEntity { .. } => FailureKind::UnknownEntity,
            InterpreterError::WrongEntityKind { .. } => FailureKind::WrongEntityKind,
            InterpreterError::Backend(_) => FailureKind::BackendError,
            InterpreterError::AssertionMismatch { .. } => FailureKind::AssertionMismatch,
            InterpreterError::Cancelled { .. } => FailureKind::Cancelled,
            InterpreterError::Teardown { .. } => FailureKind::Teardown,
        }
    }

    pub fn malformed<S: Into<String>>(reason: S) -> Self {
        InterpreterError::MalformedStep { reason: reason.into() }
    }

    pub fn mismatch<S: Into<String>>(message: S) -> Self {
        InterpreterError::AssertionMismatch {
            message: message.into(),
        }
    }
}
