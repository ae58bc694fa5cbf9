//! Conformance test interpreter
//!
//! This library reads declarative test documents, builds each operation
//! step through a name-keyed registry, runs it against a backend reached
//! only through injected collaborator traits, and verifies captured events
//! and results against expectations written in the same document format.

pub mod core;
pub mod environment;
pub mod error;
pub mod operations;
pub mod runner;
pub mod traits;

// Re-export commonly used types
pub use crate::core::{cancellation_pair, CancellationSignal, Canceller, EntityMap, EventMatcher};
pub use environment::{EnvironmentConfig, TestEnvironment};
pub use error::{BackendError, BackendErrorKind, FailureKind, InterpreterError, InterpreterResult};
pub use operations::{FailurePolicy, OperationRegistry};
pub use runner::{StepFailure, TestDocument, TestRunOutcome, TestRunState, TestRunner};
pub use traits::{ClusterHandle, ClusterProvider, CommandExecutor, SessionHandle};
