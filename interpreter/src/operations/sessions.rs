//! Transaction and session lifecycle operations

use std::sync::Arc;

use shared::{Document, Value};

use crate::core::arguments::Arguments;
use crate::core::entity::SessionEntity;
use crate::error::InterpreterResult;
use crate::operations::{BackendOperation, BuildContext, ExecutionContext, Operation, OperationOutcome};

#[derive(Debug)]
pub struct StartTransactionOperation {
    session: Arc<SessionEntity>,
    options: Document,
}

pub fn build_start_transaction(args: &Arguments<'_>, context: &BuildContext<'_>) -> InterpreterResult<Operation> {
    let mut session = None;
    let mut options = Document::new();

    for (key, value) in args.iter() {
        match key {
            "session" => session = Some(context.entities.session(&args.entity_name(key, value)?)?),
            "readConcern" | "writeConcern" => {
                options.insert(key.to_string(), Value::Object(args.document(key, value)?));
            }
            "maxCommitTimeMS" => {
                options.insert(key.to_string(), Value::from(args.usize(key, value)? as u64));
            }
            other => return Err(args.unsupported(other)),
        }
    }

    Ok(Operation::backend(StartTransactionOperation {
        session: args.required(session, "session")?,
        options,
    }))
}

#[async_trait::async_trait]
impl BackendOperation for StartTransactionOperation {
    async fn execute(&self, _context: &ExecutionContext<'_>) -> OperationOutcome {
        let result = self.session.handle().start_transaction(&self.options).await;
        OperationOutcome::from_backend(result.map(|_| None))
    }
}

#[derive(Debug)]
pub struct CommitTransactionOperation {
    session: Arc<SessionEntity>,
}

pub fn build_commit_transaction(args: &Arguments<'_>, context: &BuildContext<'_>) -> InterpreterResult<Operation> {
    let session = session_argument(args, context)?;
    Ok(Operation::backend(CommitTransactionOperation { session }))
}

#[async_trait::async_trait]
impl BackendOperation for CommitTransactionOperation {
    async fn execute(&self, _context: &ExecutionContext<'_>) -> OperationOutcome {
        let result = self.session.handle().commit_transaction().await;
        OperationOutcome::from_backend(result.map(|_| None))
    }
}

#[derive(Debug)]
pub struct AbortTransactionOperation {
    session: Arc<SessionEntity>,
}

pub fn build_abort_transaction(args: &Arguments<'_>, context: &BuildContext<'_>) -> InterpreterResult<Operation> {
    let session = session_argument(args, context)?;
    Ok(Operation::backend(AbortTransactionOperation { session }))
}

#[async_trait::async_trait]
impl BackendOperation for AbortTransactionOperation {
    async fn execute(&self, _context: &ExecutionContext<'_>) -> OperationOutcome {
        let result = self.session.handle().abort_transaction().await;
        OperationOutcome::from_backend(result.map(|_| None))
    }
}

#[derive(Debug)]
pub struct EndSessionOperation {
    session: Arc<SessionEntity>,
}

pub fn build_end_session(args: &Arguments<'_>, context: &BuildContext<'_>) -> InterpreterResult<Operation> {
    let session = session_argument(args, context)?;
    Ok(Operation::backend(EndSessionOperation { session }))
}

#[async_trait::async_trait]
impl BackendOperation for EndSessionOperation {
    async fn execute(&self, _context: &ExecutionContext<'_>) -> OperationOutcome {
        OperationOutcome::from_backend(self.session.end().await.map(|_| None))
    }
}

/// Argument set made of a single required `session`
pub(crate) fn session_argument(args: &Arguments<'_>, context: &BuildContext<'_>) -> InterpreterResult<Arc<SessionEntity>> {
    let mut session = None;
    for (key, value) in args.iter() {
        match key {
            "session" => session = Some(context.entities.session(&args.entity_name(key, value)?)?),
            other => return Err(args.unsupported(other)),
        }
    }
    args.required(session, "session")
}
