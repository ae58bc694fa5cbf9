//! `runCommand`

use std::sync::Arc;
use std::time::Duration;

use shared::{first_key, Document, Namespace, Value};

use crate::core::arguments::Arguments;
use crate::core::entity::{ClientEntity, SessionEntity};
use crate::error::{InterpreterError, InterpreterResult};
use crate::operations::{BackendOperation, BuildContext, ExecutionContext, Operation, OperationOutcome};
use crate::traits::CommandOptions;

#[derive(Debug)]
pub struct RunCommandOperation {
    client: Arc<ClientEntity>,
    namespace: Namespace,
    command: Document,
    session: Option<Arc<SessionEntity>>,
    read_preference: Option<Document>,
    timeout: Option<Duration>,
}

pub fn build_run_command(args: &Arguments<'_>, context: &BuildContext<'_>) -> InterpreterResult<Operation> {
    let mut command = None;
    let mut command_name = None;
    let mut client = None;
    let mut database = None;
    let mut session = None;
    let mut read_preference = None;
    let mut timeout = None;

    for (key, value) in args.iter() {
        match key {
            "command" => command = Some(args.document(key, value)?),
            "commandName" => command_name = Some(args.string(key, value)?),
            "client" => client = Some(context.entities.client(&args.entity_name(key, value)?)?),
            "database" => database = Some(context.entities.database(&args.entity_name(key, value)?)?),
            "session" => session = Some(context.entities.session(&args.entity_name(key, value)?)?),
            "readPreference" => read_preference = Some(args.document(key, value)?),
            "timeoutMS" => timeout = Some(args.duration_ms(key, value)?),
            other => return Err(args.unsupported(other)),
        }
    }

    let command = args.required(command, "command")?;
    let first = first_key(&command).ok_or_else(|| InterpreterError::InvalidArgument {
        operation: args.operation().to_string(),
        key: "command".to_string(),
        reason: "command document is empty".to_string(),
    })?;
    if let Some(expected) = &command_name {
        if expected != first {
            return Err(InterpreterError::InvalidArgument {
                operation: args.operation().to_string(),
                key: "commandName".to_string(),
                reason: format!("'{expected}' does not match the command's first key '{first}'"),
            });
        }
    }

    let (client, namespace) = match (client, database) {
        (Some(_), Some(_)) => {
            return Err(InterpreterError::InvalidArgument {
                operation: args.operation().to_string(),
                key: "database".to_string(),
                reason: "cannot be combined with 'client'".to_string(),
            })
        }
        (None, Some(database)) => (database.client.clone(), database.namespace()),
        (Some(client), None) => (client, context.environment.default_database()),
        (None, None) => (
            context.environment.default_client().clone(),
            context.environment.default_database(),
        ),
    };

    Ok(Operation::backend(RunCommandOperation {
        client,
        namespace,
        command,
        session,
        read_preference,
        timeout,
    }))
}

#[async_trait::async_trait]
impl BackendOperation for RunCommandOperation {
    async fn execute(&self, _context: &ExecutionContext<'_>) -> OperationOutcome {
        let options = CommandOptions {
            session: self.session.as_ref().map(|session| session.handle().clone()),
            read_preference: self.read_preference.clone(),
            timeout: self.timeout,
        };

        tracing::debug!(
            "📤 {} on {} via '{}'",
            first_key(&self.command).unwrap_or_default(),
            self.namespace,
            self.client.id()
        );
        let reply = self
            .client
            .executor()
            .execute(&self.namespace, &self.command, &options)
            .await;
        OperationOutcome::from_backend(reply.map(|reply| Some(Value::Object(reply))))
    }
}
