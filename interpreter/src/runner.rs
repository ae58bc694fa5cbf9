//! Test Runner: executes one test document against one Entity Map
//!
//! Steps run strictly in order. Each step is parsed, built through the
//! registry, executed under the caller's cancellation signal, and its
//! outcome reconciled with `expectedResult` / `expectedError`. Teardown
//! always runs, and its failures are reported after every step failure.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use shared::{logging, render, render_document, Document, Value};

use crate::core::cancellation::CancellationSignal;
use crate::core::entity::Entity;
use crate::core::entity_map::EntityMap;
use crate::core::expectations::ExpectedError;
use crate::core::matcher::{resolve_entity_references, EventMatcher};
use crate::environment::TestEnvironment;
use crate::error::{BackendError, FailureKind, InterpreterError, InterpreterResult};
use crate::operations::{BuildContext, ExecutionContext, FailurePolicy, Operation, OperationOutcome, OperationRegistry};

/// A test document; top-level keys other than these are ignored
#[derive(Debug, Clone, Deserialize)]
pub struct TestDocument {
    #[serde(default)]
    pub description: String,
    pub operations: Vec<Value>,
}

impl TestDocument {
    pub fn from_value(value: &Value) -> InterpreterResult<Self> {
        Ok(serde_json::from_value(value.clone())?)
    }

    pub fn from_json(text: &str) -> InterpreterResult<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

/// One parsed operation step
#[derive(Debug, Clone, PartialEq)]
pub struct StepSpec {
    pub name: String,
    pub arguments: Document,
    pub expected_result: Option<Value>,
    pub expected_error: Option<ExpectedError>,
    pub save_result_as: Option<String>,
    pub ignore_result_and_error: bool,
    pub abort_on_failure: Option<bool>,
}

impl StepSpec {
    pub fn parse(raw: &Value) -> InterpreterResult<Self> {
        let fields = raw.as_object().ok_or_else(|| {
            InterpreterError::malformed(format!("step must be a document, found {}", shared::value_type_name(raw)))
        })?;

        let mut name = None;
        let mut arguments = Document::new();
        let mut expected_result = None;
        let mut expected_error = None;
        let mut save_result_as = None;
        let mut ignore_result_and_error = false;
        let mut abort_on_failure = None;

        for (key, value) in fields {
            match key.as_str() {
                "name" => name = Some(step_string(key, value)?),
                "arguments" => {
                    arguments = value
                        .as_object()
                        .cloned()
                        .ok_or_else(|| InterpreterError::malformed("step 'arguments' must be a document"))?
                }
                "expectedResult" => expected_result = Some(value.clone()),
                "expectedError" => expected_error = Some(ExpectedError::parse(value)?),
                "saveResultAsEntity" => save_result_as = Some(step_string(key, value)?),
                "ignoreResultAndError" => ignore_result_and_error = step_bool(key, value)?,
                "abortOnFailure" => abort_on_failure = Some(step_bool(key, value)?),
                // Operations are dispatched by name alone
                "object" => {
                    step_string(key, value)?;
                }
                other => return Err(InterpreterError::malformed(format!("unknown step key '{other}'"))),
            }
        }

        let name = name.ok_or_else(|| InterpreterError::malformed("step has no 'name'"))?;
        if ignore_result_and_error && (expected_result.is_some() || expected_error.is_some()) {
            return Err(InterpreterError::malformed(
                "ignoreResultAndError cannot be combined with expectedResult or expectedError",
            ));
        }

        Ok(Self {
            name,
            arguments,
            expected_result,
            expected_error,
            save_result_as,
            ignore_result_and_error,
            abort_on_failure,
        })
    }
}

fn step_string(key: &str, value: &Value) -> InterpreterResult<String> {
    match value.as_str() {
        Some(text) if !text.is_empty() => Ok(text.to_string()),
        _ => Err(InterpreterError::malformed(format!("step '{key}' must be a non-empty string"))),
    }
}

fn step_bool(key: &str, value: &Value) -> InterpreterResult<bool> {
    value
        .as_bool()
        .ok_or_else(|| InterpreterError::malformed(format!("step '{key}' must be a bool")))
}

/// Terminal state of a test run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestRunState {
    Passed,
    Failed,
}

/// A failure recorded against a step, or against teardown when `step_index` is `None`
#[derive(Debug, Clone, PartialEq)]
pub struct StepFailure {
    pub step_index: Option<usize>,
    pub operation_name: String,
    pub kind: FailureKind,
    pub message: String,
    pub arguments: Document,
}

impl StepFailure {
    fn new(step_index: usize, operation_name: &str, arguments: &Document, error: &InterpreterError) -> Self {
        Self {
            step_index: Some(step_index),
            operation_name: operation_name.to_string(),
            kind: error.kind(),
            message: error.to_string(),
            arguments: arguments.clone(),
        }
    }

    /// Failure for a step that could not be parsed; salvages what it can
    fn unparsed(step_index: usize, raw: &Value, error: &InterpreterError) -> Self {
        let name = raw.get("name").and_then(Value::as_str).unwrap_or("<unnamed>");
        let arguments = raw
            .get("arguments")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        Self::new(step_index, name, &arguments, error)
    }

    fn teardown(message: String) -> Self {
        Self {
            step_index: None,
            operation_name: "teardown".to_string(),
            kind: FailureKind::Teardown,
            message,
            arguments: Document::new(),
        }
    }
}

impl fmt::Display for StepFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.step_index {
            Some(index) => write!(
                f,
                "step {} ({}): [{}] {} | arguments: {}",
                index,
                self.operation_name,
                self.kind,
                self.message,
                render_document(&self.arguments)
            ),
            None => write!(f, "teardown: [{}] {}", self.kind, self.message),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TestRunOutcome {
    pub description: String,
    pub state: TestRunState,
    pub failures: Vec<StepFailure>,
    pub steps_executed: usize,
    pub finished_at: String,
}

impl TestRunOutcome {
    pub fn passed(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn summary(&self) -> String {
        let mut summary = format!(
            "[{}] '{}': {:?} after {} steps",
            self.finished_at, self.description, self.state, self.steps_executed
        );
        for failure in &self.failures {
            summary.push_str("\n  - ");
            summary.push_str(&failure.to_string());
        }
        summary
    }
}

pub struct TestRunner<'a> {
    registry: &'a OperationRegistry,
    environment: &'a TestEnvironment,
    step_timeout: Duration,
}

impl<'a> TestRunner<'a> {
    pub fn new(registry: &'a OperationRegistry, environment: &'a TestEnvironment) -> Self {
        Self {
            registry,
            environment,
            step_timeout: environment.default_test_timeout(),
        }
    }

    pub fn with_step_timeout(mut self, step_timeout: Duration) -> Self {
        self.step_timeout = step_timeout;
        self
    }

    /// Parse and run a test document with no external cancellation
    pub async fn run_test(&self, document: &Value) -> InterpreterResult<TestRunOutcome> {
        let document = TestDocument::from_value(document)?;
        Ok(self.run(&document, CancellationSignal::never()).await)
    }

    pub async fn run(&self, document: &TestDocument, cancellation: CancellationSignal) -> TestRunOutcome {
        let entities = EntityMap::new();
        let mut failures = Vec::new();
        let mut steps_executed = 0;

        tracing::info!(
            "🧪 Running '{}' ({} steps)",
            document.description,
            document.operations.len()
        );

        for (index, raw) in document.operations.iter().enumerate() {
            let step = match StepSpec::parse(raw) {
                Ok(step) => step,
                Err(error) => {
                    tracing::error!(step = index, "❌ {}", error);
                    failures.push(StepFailure::unparsed(index, raw, &error));
                    break;
                }
            };
            tracing::info!(step = index, operation = %step.name, "▶️ Step started");
            tracing::debug!(step = index, "Arguments: {}", render_document(&step.arguments));

            let operation = match self.build(&step, &entities) {
                Ok(operation) => operation,
                Err(error) => {
                    tracing::error!(step = index, operation = %step.name, "❌ {}", error);
                    failures.push(StepFailure::new(index, &step.name, &step.arguments, &error));
                    break;
                }
            };

            steps_executed += 1;
            match self.execute(&step, operation, &entities, &cancellation).await {
                Ok(()) => tracing::info!(step = index, operation = %step.name, "✅ Step finished"),
                Err(error) => {
                    let fatal = error.kind().is_always_fatal() || self.aborts_on_failure(&step);
                    failures.push(StepFailure::new(index, &step.name, &step.arguments, &error));
                    if fatal {
                        tracing::error!(step = index, operation = %step.name, "❌ {} (stopping)", error);
                        break;
                    }
                    tracing::warn!(step = index, operation = %step.name, "⚠️ {}", error);
                }
            }
        }

        tracing::info!("🧹 Tearing down {} entities", entities.len());
        for message in entities.dispose(self.step_timeout).await {
            failures.push(StepFailure::teardown(message));
        }

        let state = if failures.is_empty() {
            TestRunState::Passed
        } else {
            TestRunState::Failed
        };

        let outcome = TestRunOutcome {
            description: document.description.clone(),
            state,
            failures,
            steps_executed,
            finished_at: logging::format_timestamp(),
        };
        if outcome.passed() {
            tracing::info!("✅ '{}' passed", outcome.description);
        } else {
            tracing::warn!("❌ {}", outcome.summary());
        }
        outcome
    }

    fn aborts_on_failure(&self, step: &StepSpec) -> bool {
        step.abort_on_failure
            .unwrap_or_else(|| self.registry.policy(&step.name) == Some(FailurePolicy::Abort))
    }

    fn build(&self, step: &StepSpec, entities: &EntityMap) -> InterpreterResult<Operation> {
        let context = BuildContext {
            entities,
            environment: self.environment,
            save_result_as: step.save_result_as.as_deref(),
        };
        let operation = self.registry.build(&step.name, &step.arguments, &context)?;
        if let Some(expected) = &step.expected_result {
            resolve_entity_references(entities, expected)?;
        }

        if operation.is_assertion() {
            let rejected = [
                ("expectedResult", step.expected_result.is_some()),
                ("expectedError", step.expected_error.is_some()),
                ("saveResultAsEntity", step.save_result_as.is_some()),
            ];
            if let Some((key, _)) = rejected.iter().find(|(_, present)| *present) {
                return Err(InterpreterError::malformed(format!(
                    "assertion operation '{}' does not accept '{key}'",
                    step.name
                )));
            }
        }
        Ok(operation)
    }

    async fn execute(
        &self,
        step: &StepSpec,
        operation: Operation,
        entities: &EntityMap,
        cancellation: &CancellationSignal,
    ) -> InterpreterResult<()> {
        let context = ExecutionContext {
            entities,
            environment: self.environment,
            cancellation,
            timeout: self.step_timeout,
        };

        match operation {
            Operation::Assertion(assertion) => cancellation
                .until_cancelled(assertion.execute(&context))
                .await
                .map_err(|reason| InterpreterError::Cancelled { reason })?,
            Operation::Backend(backend) => {
                let outcome = cancellation
                    .guard(self.step_timeout, backend.execute(&context))
                    .await
                    .map_err(|reason| InterpreterError::Cancelled { reason })?;
                self.reconcile(step, outcome, entities).await
            }
        }
    }

    async fn reconcile(&self, step: &StepSpec, outcome: OperationOutcome, entities: &EntityMap) -> InterpreterResult<()> {
        match outcome {
            OperationOutcome::Succeeded { result, created } => {
                let created_name = created.as_ref().map(|(name, _)| name.clone());
                if let Some((name, entity)) = created {
                    register(entities, name, entity).await?;
                }
                if let Some(save_as) = &step.save_result_as {
                    if created_name.as_deref() != Some(save_as.as_str()) {
                        let value = result.clone().unwrap_or(Value::Null);
                        entities.create(save_as.clone(), Entity::Result(Arc::new(value)))?;
                    }
                }

                if step.ignore_result_and_error {
                    return Ok(());
                }
                if step.expected_error.is_some() {
                    return Err(InterpreterError::mismatch(format!(
                        "expected an error, but the operation succeeded with {}",
                        result.as_ref().map(render).unwrap_or_else(|| "no result".to_string())
                    )));
                }
                if let Some(expected) = &step.expected_result {
                    let actual = result.unwrap_or(Value::Null);
                    EventMatcher::with_entities(entities)
                        .check(expected, &actual)
                        .map_err(|failure| {
                            InterpreterError::mismatch(format!("result {} does not match: {}", render(&actual), failure))
                        })?;
                }
                Ok(())
            }
            OperationOutcome::Failed(error) => {
                if step.ignore_result_and_error {
                    tracing::debug!("Ignoring error from '{}': {}", step.name, error);
                    return Ok(());
                }
                match &step.expected_error {
                    Some(expected) => expected.check(&error).map_err(|detail| {
                        InterpreterError::Backend(BackendError {
                            message: format!("{detail} (actual error: {})", error.message),
                            ..error.clone()
                        })
                    }),
                    None => Err(InterpreterError::Backend(error)),
                }
            }
        }
    }
}

/// Store a newly created entity, releasing it if the name is taken
async fn register(entities: &EntityMap, name: String, entity: Entity) -> InterpreterResult<()> {
    if let Err(error) = entities.create(name, entity.clone()) {
        if let Err(release_error) = entity.release().await {
            tracing::warn!("⚠️ Failed to release orphaned {}: {}", entity.kind(), release_error);
        }
        return Err(error);
    }
    Ok(())
}
