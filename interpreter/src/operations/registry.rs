//! Operation Registry: name to builder dispatch

use std::collections::HashMap;

use shared::Document;

use crate::core::arguments::Arguments;
use crate::error::{InterpreterError, InterpreterResult};
use crate::operations::{assertions, commands, cursors, entities, sessions};
use crate::operations::{BuildContext, FailurePolicy, Operation};

/// Validates an argument document and constructs an operation
pub type Builder = fn(&Arguments<'_>, &BuildContext<'_>) -> InterpreterResult<Operation>;

#[derive(Debug, Clone, Copy)]
struct Registration {
    builder: Builder,
    policy: FailurePolicy,
}

/// Populated once, then shared read-only by every test run
#[derive(Debug, Default)]
pub struct OperationRegistry {
    operations: HashMap<String, Registration>,
}

impl OperationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding every built-in operation
    pub fn standard() -> Self {
        let mut registry = Self::new();
        let catalogue: [(&str, FailurePolicy, Builder); 16] = [
            ("createEntity", FailurePolicy::Abort, entities::build_create_entity),
            ("runCommand", FailurePolicy::Continue, commands::build_run_command),
            ("createFindCursor", FailurePolicy::Continue, cursors::build_create_find_cursor),
            ("iterateUntilDocumentOrError", FailurePolicy::Continue, cursors::build_iterate_until_document_or_error),
            ("close", FailurePolicy::Continue, cursors::build_close),
            ("startTransaction", FailurePolicy::Continue, sessions::build_start_transaction),
            ("commitTransaction", FailurePolicy::Continue, sessions::build_commit_transaction),
            ("abortTransaction", FailurePolicy::Continue, sessions::build_abort_transaction),
            ("endSession", FailurePolicy::Continue, sessions::build_end_session),
            ("assertEventCount", FailurePolicy::Continue, assertions::build_assert_event_count),
            ("waitForEvent", FailurePolicy::Abort, assertions::build_wait_for_event),
            ("assertSessionPinned", FailurePolicy::Continue, assertions::build_assert_session_pinned),
            ("assertSessionUnpinned", FailurePolicy::Continue, assertions::build_assert_session_unpinned),
            (
                "assertSessionTransactionState",
                FailurePolicy::Continue,
                assertions::build_assert_session_transaction_state,
            ),
            (
                "assertSameLsidOnLastTwoCommands",
                FailurePolicy::Continue,
                assertions::build_assert_same_lsid_on_last_two_commands,
            ),
            (
                "assertDifferentLsidOnLastTwoCommands",
                FailurePolicy::Continue,
                assertions::build_assert_different_lsid_on_last_two_commands,
            ),
        ];

        for (name, policy, builder) in catalogue {
            registry.operations.insert(name.to_string(), Registration { builder, policy });
        }
        registry
    }

    /// Add an operation kind; names are unique
    pub fn register<S: Into<String>>(&mut self, name: S, policy: FailurePolicy, builder: Builder) -> InterpreterResult<()> {
        let name = name.into();
        if self.operations.contains_key(&name) {
            return Err(InterpreterError::Configuration {
                field: "operation".to_string(),
                reason: format!("'{name}' is already registered"),
            });
        }
        self.operations.insert(name, Registration { builder, policy });
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.operations.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.operations.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn policy(&self, name: &str) -> Option<FailurePolicy> {
        self.operations.get(name).map(|registration| registration.policy)
    }

    /// Validate `arguments` and build the operation registered under `name`
    pub fn build(&self, name: &str, arguments: &Document, context: &BuildContext<'_>) -> InterpreterResult<Operation> {
        let registration = self
            .operations
            .get(name)
            .ok_or_else(|| InterpreterError::UnknownOperation { name: name.to_string() })?;
        let args = Arguments::new(name, arguments);
        (registration.builder)(&args, context)
    }
}
