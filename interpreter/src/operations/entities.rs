//! `createEntity`

use std::sync::Arc;

use shared::{Document, Value};

use crate::core::arguments::Arguments;
use crate::core::entity::{
    ClientEntity, CollectionEntity, DatabaseEntity, Entity, EntityKind, EventObserver, ObserverOwner, SessionEntity,
};
use crate::core::events::SUPPORTED_EVENT_TYPES;
use crate::error::{InterpreterError, InterpreterResult};
use crate::operations::{BackendOperation, BuildContext, ExecutionContext, Operation, OperationOutcome};
use crate::traits::SessionOptions;

/// Arguments accepted by each entity kind, besides `kind` and `id`
fn allowed_arguments(kind: EntityKind) -> &'static [&'static str] {
    match kind {
        EntityKind::Client => &["uriOptions", "useMultipleRouters"],
        EntityKind::Database => &["client", "databaseName"],
        EntityKind::Collection => &["database", "collectionName"],
        EntityKind::Session => &["client", "sessionOptions"],
        EntityKind::Observer => &["client", "observeEvents", "ignoreCommandMonitoringEvents"],
        EntityKind::Cursor | EntityKind::Result => &[],
    }
}

const ALL_ARGUMENTS: &[&str] = &[
    "uriOptions",
    "useMultipleRouters",
    "client",
    "databaseName",
    "database",
    "collectionName",
    "sessionOptions",
    "observeEvents",
    "ignoreCommandMonitoringEvents",
];

#[derive(Debug)]
enum EntitySpec {
    Client {
        uri_options: Document,
        use_multiple_routers: bool,
    },
    Database {
        client: Arc<ClientEntity>,
        database_name: String,
    },
    Collection {
        database: Arc<DatabaseEntity>,
        collection_name: String,
    },
    Session {
        client_name: String,
        client: Arc<ClientEntity>,
        options: SessionOptions,
    },
    Observer {
        /// `None` observes the environment's default client
        client: Option<(String, Arc<ClientEntity>)>,
        observe_events: Vec<String>,
        ignored_commands: Vec<String>,
    },
}

#[derive(Debug)]
pub struct CreateEntityOperation {
    id: String,
    spec: EntitySpec,
}

pub fn build_create_entity(args: &Arguments<'_>, context: &BuildContext<'_>) -> InterpreterResult<Operation> {
    let mut kind = None;
    let mut id = None;
    let mut specific: Vec<(&str, &Value)> = Vec::new();

    for (key, value) in args.iter() {
        match key {
            "kind" => {
                let name = args.string(key, value)?;
                let parsed = EntityKind::parse(&name)
                    .filter(|kind| !allowed_arguments(*kind).is_empty())
                    .ok_or_else(|| InterpreterError::InvalidArgument {
                        operation: args.operation().to_string(),
                        key: key.to_string(),
                        reason: format!("cannot create entities of kind '{name}'"),
                    })?;
                kind = Some(parsed);
            }
            "id" => id = Some(args.entity_name(key, value)?),
            other if ALL_ARGUMENTS.contains(&other) => specific.push((key, value)),
            other => return Err(args.unsupported(other)),
        }
    }

    let kind = args.required(kind, "kind")?;
    let id = args.required(id, "id")?;
    if context.entities.contains(&id) {
        return Err(InterpreterError::DuplicateEntity { name: id });
    }

    if let Some((key, _)) = specific.iter().find(|(key, _)| !allowed_arguments(kind).contains(key)) {
        return Err(args.unsupported(key));
    }
    let argument = |name: &str| specific.iter().find(|(key, _)| *key == name).map(|(_, value)| *value);

    let spec = match kind {
        EntityKind::Client => EntitySpec::Client {
            uri_options: argument("uriOptions")
                .map(|value| args.document("uriOptions", value))
                .transpose()?
                .unwrap_or_default(),
            use_multiple_routers: argument("useMultipleRouters")
                .map(|value| args.bool("useMultipleRouters", value))
                .transpose()?
                .unwrap_or(false),
        },
        EntityKind::Database => {
            let client_name = args.entity_name("client", args.required(argument("client"), "client")?)?;
            let database_name = args.string("databaseName", args.required(argument("databaseName"), "databaseName")?)?;
            EntitySpec::Database {
                client: context.entities.client(&client_name)?,
                database_name,
            }
        }
        EntityKind::Collection => {
            let database_name = args.entity_name("database", args.required(argument("database"), "database")?)?;
            let collection_name =
                args.string("collectionName", args.required(argument("collectionName"), "collectionName")?)?;
            EntitySpec::Collection {
                database: context.entities.database(&database_name)?,
                collection_name,
            }
        }
        EntityKind::Session => {
            let client_name = args.entity_name("client", args.required(argument("client"), "client")?)?;
            let options = match argument("sessionOptions") {
                Some(value) => parse_session_options(&args.document("sessionOptions", value)?)?,
                None => SessionOptions::default(),
            };
            EntitySpec::Session {
                client: context.entities.client(&client_name)?,
                client_name,
                options,
            }
        }
        EntityKind::Observer => {
            let client = match argument("client") {
                Some(value) => {
                    let client_name = args.entity_name("client", value)?;
                    let client = context.entities.client(&client_name)?;
                    Some((client_name, client))
                }
                None => None,
            };
            let observe_events = args.string_list(
                "observeEvents",
                args.required(argument("observeEvents"), "observeEvents")?,
            )?;
            if let Some(unknown) = observe_events
                .iter()
                .find(|event| !SUPPORTED_EVENT_TYPES.contains(&event.as_str()))
            {
                return Err(InterpreterError::InvalidArgument {
                    operation: args.operation().to_string(),
                    key: "observeEvents".to_string(),
                    reason: format!("unsupported event type '{unknown}'"),
                });
            }
            let ignored_commands = argument("ignoreCommandMonitoringEvents")
                .map(|value| args.string_list("ignoreCommandMonitoringEvents", value))
                .transpose()?
                .unwrap_or_default();
            EntitySpec::Observer {
                client,
                observe_events,
                ignored_commands,
            }
        }
        EntityKind::Cursor | EntityKind::Result => {
            return Err(InterpreterError::malformed(format!("cannot create entities of kind '{kind}'")))
        }
    };

    Ok(Operation::backend(CreateEntityOperation { id, spec }))
}

fn parse_session_options(document: &Document) -> InterpreterResult<SessionOptions> {
    let args = Arguments::new("sessionOptions", document);
    let mut options = SessionOptions::default();
    for (key, value) in args.iter() {
        match key {
            "causalConsistency" => options.causal_consistency = Some(args.bool(key, value)?),
            "snapshot" => options.snapshot = Some(args.bool(key, value)?),
            "defaultTransactionOptions" => options.default_transaction_options = Some(args.document(key, value)?),
            other => return Err(args.unsupported(other)),
        }
    }
    Ok(options)
}

#[async_trait::async_trait]
impl BackendOperation for CreateEntityOperation {
    async fn execute(&self, context: &ExecutionContext<'_>) -> OperationOutcome {
        let entity = match &self.spec {
            EntitySpec::Client {
                uri_options,
                use_multiple_routers,
            } => match context
                .environment
                .connect_client(uri_options.clone(), *use_multiple_routers)
                .await
            {
                Ok(cluster) => Entity::Client(Arc::new(ClientEntity::new(self.id.clone(), cluster))),
                Err(error) => return OperationOutcome::Failed(error),
            },
            EntitySpec::Database { client, database_name } => Entity::Database(Arc::new(DatabaseEntity {
                id: self.id.clone(),
                client: client.clone(),
                name: database_name.clone(),
            })),
            EntitySpec::Collection {
                database,
                collection_name,
            } => Entity::Collection(Arc::new(CollectionEntity {
                id: self.id.clone(),
                database: database.clone(),
                name: collection_name.clone(),
            })),
            EntitySpec::Session {
                client_name,
                client,
                options,
            } => match client.cluster().start_session(options).await {
                Ok(handle) => Entity::Session(Arc::new(SessionEntity::new(self.id.as_str(), client_name.as_str(), handle))),
                Err(error) => return OperationOutcome::Failed(error),
            },
            EntitySpec::Observer {
                client,
                observe_events,
                ignored_commands,
            } => {
                let observer = match client {
                    Some((client_name, client)) => {
                        let observer = EventObserver::attach(
                            &self.id,
                            ObserverOwner::Client(client_name.clone()),
                            client.cluster().clone(),
                            observe_events.iter().cloned(),
                            ignored_commands.iter().cloned(),
                        );
                        client.attach_observer(observer.clone());
                        observer
                    }
                    None => EventObserver::attach(
                        &self.id,
                        ObserverOwner::Environment,
                        context.environment.cluster().clone(),
                        observe_events.iter().cloned(),
                        ignored_commands.iter().cloned(),
                    ),
                };
                Entity::Observer(observer)
            }
        };

        tracing::info!(entity = %self.id, "🆕 Created {}", entity.kind());
        OperationOutcome::created(self.id.clone(), entity)
    }
}
