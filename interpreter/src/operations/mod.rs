//! Operation abstraction
//!
//! A step's name selects a builder in the [`OperationRegistry`]. Builders
//! validate every argument key, resolve entity references up front, and
//! return an [`Operation`] without touching the backend. Execution happens
//! later, under the runner's cancellation signal and step timeout.

pub mod assertions;
pub mod commands;
pub mod cursors;
pub mod entities;
pub mod registry;
pub mod sessions;

use std::fmt;
use std::time::Duration;

use shared::Value;

use crate::core::cancellation::CancellationSignal;
use crate::core::entity::Entity;
use crate::core::entity_map::EntityMap;
use crate::environment::TestEnvironment;
use crate::error::{BackendError, InterpreterResult};

pub use registry::{Builder, OperationRegistry};

/// What the runner does after a step of this kind fails
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    /// The step is a precondition: stop the run
    Abort,
    /// Record the failure and go on with the next step
    Continue,
}

/// Inputs available to a builder
pub struct BuildContext<'a> {
    pub entities: &'a EntityMap,
    pub environment: &'a TestEnvironment,
    /// Name requested through the step's `saveResultAsEntity`
    pub save_result_as: Option<&'a str>,
}

/// Inputs available while an operation executes
pub struct ExecutionContext<'a> {
    pub entities: &'a EntityMap,
    pub environment: &'a TestEnvironment,
    pub cancellation: &'a CancellationSignal,
    pub timeout: Duration,
}

/// Result of running a backend operation
#[derive(Debug)]
pub enum OperationOutcome {
    Succeeded {
        result: Option<Value>,
        /// Entity to register under the given name
        created: Option<(String, Entity)>,
    },
    Failed(BackendError),
}

impl OperationOutcome {
    pub fn value(result: Value) -> Self {
        OperationOutcome::Succeeded {
            result: Some(result),
            created: None,
        }
    }

    pub fn empty() -> Self {
        OperationOutcome::Succeeded {
            result: None,
            created: None,
        }
    }

    pub fn created<S: Into<String>>(name: S, entity: Entity) -> Self {
        OperationOutcome::Succeeded {
            result: None,
            created: Some((name.into(), entity)),
        }
    }

    pub fn from_backend(result: Result<Option<Value>, BackendError>) -> Self {
        match result {
            Ok(Some(value)) => OperationOutcome::value(value),
            Ok(None) => OperationOutcome::empty(),
            Err(error) => OperationOutcome::Failed(error),
        }
    }
}

/// Work performed against the backend through the collaborator traits
#[async_trait::async_trait]
pub trait BackendOperation: fmt::Debug + Send + Sync {
    async fn execute(&self, context: &ExecutionContext<'_>) -> OperationOutcome;
}

/// Local check over captured state; an `Err` is the failure to record
#[async_trait::async_trait]
pub trait AssertionOperation: fmt::Debug + Send + Sync {
    async fn execute(&self, context: &ExecutionContext<'_>) -> InterpreterResult<()>;
}

/// A validated, executable step
#[derive(Debug)]
pub enum Operation {
    Backend(Box<dyn BackendOperation>),
    Assertion(Box<dyn AssertionOperation>),
}

impl Operation {
    pub fn backend<O: BackendOperation + 'static>(operation: O) -> Self {
        Operation::Backend(Box::new(operation))
    }

    pub fn assertion<O: AssertionOperation + 'static>(operation: O) -> Self {
        Operation::Assertion(Box::new(operation))
    }

    pub fn is_assertion(&self) -> bool {
        matches!(self, Operation::Assertion(_))
    }
}
