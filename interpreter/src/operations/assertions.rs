//! Assertion operations
//!
//! Local checks over captured events and session state. None of them talk
//! to the backend; a failed check comes back as an `AssertionMismatch`.

use std::sync::Arc;

use shared::{render, render_document, Document, Value};

use crate::core::arguments::Arguments;
use crate::core::entity::{EventObserver, SessionEntity};
use crate::core::events::{WaitOutcome, COMMAND_STARTED_EVENT};
use crate::core::matcher::{resolve_entity_references, EventMatcher};
use crate::error::{CancelReason, InterpreterError, InterpreterResult};
use crate::operations::sessions::session_argument;
use crate::operations::{AssertionOperation, BuildContext, ExecutionContext, Operation};
use crate::traits::TransactionState;

/// Validated `client` / `event` / `count` arguments
#[derive(Debug)]
struct EventCountArguments {
    observer: Arc<EventObserver>,
    event: Document,
    count: usize,
}

fn event_count_arguments(args: &Arguments<'_>, context: &BuildContext<'_>) -> InterpreterResult<EventCountArguments> {
    let mut observer = None;
    let mut event = None;
    let mut count = None;

    for (key, value) in args.iter() {
        match key {
            "client" => observer = Some(context.entities.observer(&args.entity_name(key, value)?)?),
            "event" => event = Some(event_filter(args, key, value)?),
            "count" => count = Some(args.usize(key, value)?),
            other => return Err(args.unsupported(other)),
        }
    }

    let event = args.required(event, "event")?;
    resolve_entity_references(context.entities, &Value::Object(event.clone()))?;

    Ok(EventCountArguments {
        observer: args.required(observer, "client")?,
        event,
        count: args.required(count, "count")?,
    })
}

/// `{ <eventType>: { ..filter.. } }`
fn event_filter(args: &Arguments<'_>, key: &str, value: &Value) -> InterpreterResult<Document> {
    let event = args.document(key, value)?;
    let shape_ok = event.len() == 1 && event.values().all(Value::is_object);
    if !shape_ok {
        return Err(InterpreterError::InvalidArgument {
            operation: args.operation().to_string(),
            key: key.to_string(),
            reason: format!(
                "expected a document with exactly one event type mapped to a filter document, got {}",
                render_document(&event)
            ),
        });
    }
    Ok(event)
}

#[derive(Debug)]
pub struct AssertEventCountOperation {
    arguments: EventCountArguments,
}

pub fn build_assert_event_count(args: &Arguments<'_>, context: &BuildContext<'_>) -> InterpreterResult<Operation> {
    let arguments = event_count_arguments(args, context)?;
    Ok(Operation::assertion(AssertEventCountOperation { arguments }))
}

#[async_trait::async_trait]
impl AssertionOperation for AssertEventCountOperation {
    async fn execute(&self, context: &ExecutionContext<'_>) -> InterpreterResult<()> {
        let EventCountArguments { observer, event, count } = &self.arguments;
        let matcher = EventMatcher::with_entities(context.entities);
        let snapshot = observer.log().snapshot();
        let actual = matcher.count(&snapshot, event);

        tracing::debug!(entity = %observer.id(), "🔍 {} matching events of {}", actual, snapshot.len());
        if actual != *count {
            return Err(InterpreterError::mismatch(format!(
                "{} must be triggered exactly {} times, but was triggered {} times",
                render_document(event),
                count,
                actual
            )));
        }
        Ok(())
    }
}

#[derive(Debug)]
pub struct WaitForEventOperation {
    arguments: EventCountArguments,
}

pub fn build_wait_for_event(args: &Arguments<'_>, context: &BuildContext<'_>) -> InterpreterResult<Operation> {
    let arguments = event_count_arguments(args, context)?;
    Ok(Operation::assertion(WaitForEventOperation { arguments }))
}

#[async_trait::async_trait]
impl AssertionOperation for WaitForEventOperation {
    async fn execute(&self, context: &ExecutionContext<'_>) -> InterpreterResult<()> {
        let EventCountArguments { observer, event, count } = &self.arguments;
        let matcher = EventMatcher::with_entities(context.entities);
        let predicate = matcher.event_predicate(event);

        match observer
            .log()
            .wait_for(predicate, *count, context.timeout, context.cancellation)
            .await
        {
            WaitOutcome::Reached(_) => Ok(()),
            WaitOutcome::TimedOut(found) => Err(InterpreterError::mismatch(format!(
                "timed out after {}ms waiting for {} to be triggered {} times, saw {}",
                context.timeout.as_millis(),
                render_document(event),
                count,
                found
            ))),
            WaitOutcome::Cancelled(_) => Err(InterpreterError::Cancelled {
                reason: CancelReason::Requested,
            }),
        }
    }
}

#[derive(Debug)]
pub struct AssertSessionPinnedOperation {
    session: Arc<SessionEntity>,
    expect_pinned: bool,
}

pub fn build_assert_session_pinned(args: &Arguments<'_>, context: &BuildContext<'_>) -> InterpreterResult<Operation> {
    let session = session_argument(args, context)?;
    Ok(Operation::assertion(AssertSessionPinnedOperation {
        session,
        expect_pinned: true,
    }))
}

pub fn build_assert_session_unpinned(args: &Arguments<'_>, context: &BuildContext<'_>) -> InterpreterResult<Operation> {
    let session = session_argument(args, context)?;
    Ok(Operation::assertion(AssertSessionPinnedOperation {
        session,
        expect_pinned: false,
    }))
}

#[async_trait::async_trait]
impl AssertionOperation for AssertSessionPinnedOperation {
    async fn execute(&self, _context: &ExecutionContext<'_>) -> InterpreterResult<()> {
        let pinned = self.session.handle().pinned_endpoint();
        match (self.expect_pinned, pinned) {
            (true, None) => Err(InterpreterError::mismatch(format!(
                "expected session '{}' to be pinned, but it is not",
                self.session.id()
            ))),
            (false, Some(endpoint)) => Err(InterpreterError::mismatch(format!(
                "expected session '{}' to be unpinned, but it is pinned to {}",
                self.session.id(),
                endpoint
            ))),
            _ => Ok(()),
        }
    }
}

#[derive(Debug)]
pub struct AssertSessionTransactionStateOperation {
    session: Arc<SessionEntity>,
    state: TransactionState,
}

pub fn build_assert_session_transaction_state(
    args: &Arguments<'_>,
    context: &BuildContext<'_>,
) -> InterpreterResult<Operation> {
    let mut session = None;
    let mut state = None;

    for (key, value) in args.iter() {
        match key {
            "session" => session = Some(context.entities.session(&args.entity_name(key, value)?)?),
            "state" => {
                let name = args.string(key, value)?;
                let parsed = TransactionState::parse(&name).ok_or_else(|| InterpreterError::InvalidArgument {
                    operation: args.operation().to_string(),
                    key: key.to_string(),
                    reason: format!("unknown transaction state '{name}'"),
                })?;
                state = Some(parsed);
            }
            other => return Err(args.unsupported(other)),
        }
    }

    Ok(Operation::assertion(AssertSessionTransactionStateOperation {
        session: args.required(session, "session")?,
        state: args.required(state, "state")?,
    }))
}

#[async_trait::async_trait]
impl AssertionOperation for AssertSessionTransactionStateOperation {
    async fn execute(&self, _context: &ExecutionContext<'_>) -> InterpreterResult<()> {
        let actual = self.session.handle().transaction_state();
        if actual != self.state {
            return Err(InterpreterError::mismatch(format!(
                "expected session '{}' transaction state {:?}, found {:?}",
                self.session.id(),
                self.state,
                actual
            )));
        }
        Ok(())
    }
}

#[derive(Debug)]
pub struct AssertLsidOnLastTwoCommandsOperation {
    observer: Arc<EventObserver>,
    expect_same: bool,
}

pub fn build_assert_same_lsid_on_last_two_commands(
    args: &Arguments<'_>,
    context: &BuildContext<'_>,
) -> InterpreterResult<Operation> {
    let observer = observer_argument(args, context)?;
    Ok(Operation::assertion(AssertLsidOnLastTwoCommandsOperation {
        observer,
        expect_same: true,
    }))
}

pub fn build_assert_different_lsid_on_last_two_commands(
    args: &Arguments<'_>,
    context: &BuildContext<'_>,
) -> InterpreterResult<Operation> {
    let observer = observer_argument(args, context)?;
    Ok(Operation::assertion(AssertLsidOnLastTwoCommandsOperation {
        observer,
        expect_same: false,
    }))
}

fn observer_argument(args: &Arguments<'_>, context: &BuildContext<'_>) -> InterpreterResult<Arc<EventObserver>> {
    let mut observer = None;
    for (key, value) in args.iter() {
        match key {
            "client" => observer = Some(context.entities.observer(&args.entity_name(key, value)?)?),
            other => return Err(args.unsupported(other)),
        }
    }
    args.required(observer, "client")
}

#[async_trait::async_trait]
impl AssertionOperation for AssertLsidOnLastTwoCommandsOperation {
    async fn execute(&self, _context: &ExecutionContext<'_>) -> InterpreterResult<()> {
        let started: Vec<_> = self
            .observer
            .log()
            .snapshot()
            .into_iter()
            .filter(|event| event.event_type == COMMAND_STARTED_EVENT)
            .collect();
        if started.len() < 2 {
            return Err(InterpreterError::mismatch(format!(
                "observer '{}' captured {} command started events, need at least 2",
                self.observer.id(),
                started.len()
            )));
        }

        let lsid = |index: usize| -> InterpreterResult<Value> {
            started[index]
                .body
                .get("command")
                .and_then(|command| command.get("lsid"))
                .cloned()
                .ok_or_else(|| {
                    InterpreterError::mismatch(format!(
                        "command '{}' was sent without an lsid",
                        started[index].command_name().unwrap_or("<unknown>")
                    ))
                })
        };
        let previous = lsid(started.len() - 2)?;
        let last = lsid(started.len() - 1)?;

        match (self.expect_same, previous == last) {
            (true, false) => Err(InterpreterError::mismatch(format!(
                "expected the last two commands to share an lsid, got {} and {}",
                render(&previous),
                render(&last)
            ))),
            (false, true) => Err(InterpreterError::mismatch(format!(
                "expected the last two commands to use different lsids, both used {}",
                render(&last)
            ))),
            _ => Ok(()),
        }
    }
}
