//! `createFindCursor`, `iterateUntilDocumentOrError`, `close`

use std::sync::Arc;

use shared::{Document, Namespace, Value};

use crate::core::arguments::Arguments;
use crate::core::entity::{CollectionEntity, CursorEntity, Entity, SessionEntity};
use crate::error::{InterpreterError, InterpreterResult};
use crate::operations::{BackendOperation, BuildContext, ExecutionContext, Operation, OperationOutcome};
use crate::traits::CommandOptions;

#[derive(Debug)]
pub struct CreateFindCursorOperation {
    cursor_name: String,
    collection: Arc<CollectionEntity>,
    filter: Document,
    batch_size: Option<i64>,
    session: Option<Arc<SessionEntity>>,
}

pub fn build_create_find_cursor(args: &Arguments<'_>, context: &BuildContext<'_>) -> InterpreterResult<Operation> {
    let mut collection = None;
    let mut filter = None;
    let mut batch_size = None;
    let mut session = None;

    for (key, value) in args.iter() {
        match key {
            "collection" => collection = Some(context.entities.collection(&args.entity_name(key, value)?)?),
            "filter" => filter = Some(args.document(key, value)?),
            "batchSize" => batch_size = Some(args.usize(key, value)? as i64),
            "session" => session = Some(context.entities.session(&args.entity_name(key, value)?)?),
            other => return Err(args.unsupported(other)),
        }
    }

    let collection = args.required(collection, "collection")?;
    let cursor_name = context
        .save_result_as
        .ok_or_else(|| InterpreterError::malformed("createFindCursor requires saveResultAsEntity"))?;
    if context.entities.contains(cursor_name) {
        return Err(InterpreterError::DuplicateEntity {
            name: cursor_name.to_string(),
        });
    }

    Ok(Operation::backend(CreateFindCursorOperation {
        cursor_name: cursor_name.to_string(),
        collection,
        filter: filter.unwrap_or_default(),
        batch_size,
        session,
    }))
}

#[async_trait::async_trait]
impl BackendOperation for CreateFindCursorOperation {
    async fn execute(&self, _context: &ExecutionContext<'_>) -> OperationOutcome {
        let namespace = self.collection.namespace();
        let mut find = Document::new();
        find.insert("find".to_string(), Value::from(self.collection.name.clone()));
        find.insert("filter".to_string(), Value::Object(self.filter.clone()));
        if let Some(batch_size) = self.batch_size {
            find.insert("batchSize".to_string(), Value::from(batch_size));
        }

        let session = self.session.as_ref().map(|session| session.handle().clone());
        let options = CommandOptions {
            session: session.clone(),
            ..CommandOptions::default()
        };
        let executor = self.collection.client().executor();

        let reply = match executor
            .execute(&Namespace::database(namespace.database.clone()), &find, &options)
            .await
        {
            Ok(reply) => reply,
            Err(error) => return OperationOutcome::Failed(error),
        };

        match CursorEntity::from_reply(&self.cursor_name, executor, namespace, session, self.batch_size, &reply) {
            Ok(cursor) => OperationOutcome::created(self.cursor_name.clone(), Entity::Cursor(Arc::new(cursor))),
            Err(error) => OperationOutcome::Failed(error),
        }
    }
}

#[derive(Debug)]
pub struct IterateUntilDocumentOrErrorOperation {
    cursor: Arc<CursorEntity>,
}

pub fn build_iterate_until_document_or_error(
    args: &Arguments<'_>,
    context: &BuildContext<'_>,
) -> InterpreterResult<Operation> {
    let cursor = cursor_argument(args, context)?;
    Ok(Operation::backend(IterateUntilDocumentOrErrorOperation { cursor }))
}

#[async_trait::async_trait]
impl BackendOperation for IterateUntilDocumentOrErrorOperation {
    async fn execute(&self, _context: &ExecutionContext<'_>) -> OperationOutcome {
        OperationOutcome::from_backend(self.cursor.next().await.map(Some))
    }
}

#[derive(Debug)]
pub struct CloseCursorOperation {
    cursor: Arc<CursorEntity>,
}

pub fn build_close(args: &Arguments<'_>, context: &BuildContext<'_>) -> InterpreterResult<Operation> {
    let cursor = cursor_argument(args, context)?;
    Ok(Operation::backend(CloseCursorOperation { cursor }))
}

#[async_trait::async_trait]
impl BackendOperation for CloseCursorOperation {
    async fn execute(&self, _context: &ExecutionContext<'_>) -> OperationOutcome {
        OperationOutcome::from_backend(self.cursor.close().await.map(|_| None))
    }
}

fn cursor_argument(args: &Arguments<'_>, context: &BuildContext<'_>) -> InterpreterResult<Arc<CursorEntity>> {
    let mut cursor = None;
    for (key, value) in args.iter() {
        match key {
            "cursor" => cursor = Some(context.entities.cursor(&args.entity_name(key, value)?)?),
            other => return Err(args.unsupported(other)),
        }
    }
    args.required(cursor, "cursor")
}
