//! Entity Map: the named registry of everything a test run creates

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use shared::Value;

use crate::core::entity::{
    ClientEntity, CollectionEntity, CursorEntity, DatabaseEntity, Entity, EntityKind, EventObserver,
    SessionEntity,
};
use crate::error::{CancelReason, InterpreterError, InterpreterResult};

#[derive(Debug, Default)]
struct Registry {
    entities: HashMap<String, Entity>,
    creation_order: Vec<String>,
}

/// Owns every entity of one test run
///
/// Creation and disposal are driven by the foreground runner only; lookups
/// take a read lock and hand out cloned `Arc` handles.
#[derive(Debug, Default)]
pub struct EntityMap {
    registry: RwLock<Registry>,
}

impl EntityMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new entity under `name`
    pub fn create<S: Into<String>>(&self, name: S, entity: Entity) -> InterpreterResult<()> {
        let name = name.into();
        let mut registry = self.registry.write().unwrap_or_else(PoisonError::into_inner);
        if registry.entities.contains_key(&name) {
            return Err(InterpreterError::DuplicateEntity { name });
        }

        tracing::debug!(entity = %name, kind = %entity.kind(), "📝 Entity created");
        registry.creation_order.push(name.clone());
        registry.entities.insert(name, entity);
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .entities
            .contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.registry.read().unwrap_or_else(PoisonError::into_inner).entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Names in creation order
    pub fn names(&self) -> Vec<String> {
        self.registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .creation_order
            .clone()
    }

    /// Look up `name`, requiring it to be of `expected` kind
    pub fn get(&self, name: &str, expected: EntityKind) -> InterpreterResult<Entity> {
        let registry = self.registry.read().unwrap_or_else(PoisonError::into_inner);
        let entity = registry
            .entities
            .get(name)
            .ok_or_else(|| InterpreterError::UnknownEntity { name: name.to_string() })?;

        if entity.kind() != expected {
            return Err(InterpreterError::WrongEntityKind {
                name: name.to_string(),
                expected: expected.to_string(),
                actual: entity.kind().to_string(),
            });
        }
        Ok(entity.clone())
    }

    pub fn client(&self, name: &str) -> InterpreterResult<Arc<ClientEntity>> {
        match self.get(name, EntityKind::Client)? {
            Entity::Client(client) => Ok(client),
            other => Err(kind_mismatch(name, EntityKind::Client, &other)),
        }
    }

    pub fn database(&self, name: &str) -> InterpreterResult<Arc<DatabaseEntity>> {
        match self.get(name, EntityKind::Database)? {
            Entity::Database(database) => Ok(database),
            other => Err(kind_mismatch(name, EntityKind::Database, &other)),
        }
    }

    pub fn collection(&self, name: &str) -> InterpreterResult<Arc<CollectionEntity>> {
        match self.get(name, EntityKind::Collection)? {
            Entity::Collection(collection) => Ok(collection),
            other => Err(kind_mismatch(name, EntityKind::Collection, &other)),
        }
    }

    pub fn session(&self, name: &str) -> InterpreterResult<Arc<SessionEntity>> {
        match self.get(name, EntityKind::Session)? {
            Entity::Session(session) => Ok(session),
            other => Err(kind_mismatch(name, EntityKind::Session, &other)),
        }
    }

    pub fn observer(&self, name: &str) -> InterpreterResult<Arc<EventObserver>> {
        match self.get(name, EntityKind::Observer)? {
            Entity::Observer(observer) => Ok(observer),
            other => Err(kind_mismatch(name, EntityKind::Observer, &other)),
        }
    }

    pub fn cursor(&self, name: &str) -> InterpreterResult<Arc<CursorEntity>> {
        match self.get(name, EntityKind::Cursor)? {
            Entity::Cursor(cursor) => Ok(cursor),
            other => Err(kind_mismatch(name, EntityKind::Cursor, &other)),
        }
    }

    pub fn result(&self, name: &str) -> InterpreterResult<Arc<Value>> {
        match self.get(name, EntityKind::Result)? {
            Entity::Result(value) => Ok(value),
            other => Err(kind_mismatch(name, EntityKind::Result, &other)),
        }
    }

    /// Release every entity, newest first
    ///
    /// Every release is attempted and bounded by `timeout`; failures are
    /// collected as `"<name>: <error>"` and returned together.
    pub async fn dispose(&self, timeout: Duration) -> Vec<String> {
        let drained: Vec<(String, Entity)> = {
            let mut registry = self.registry.write().unwrap_or_else(PoisonError::into_inner);
            let order = std::mem::take(&mut registry.creation_order);
            let mut entities = std::mem::take(&mut registry.entities);
            order
                .into_iter()
                .rev()
                .filter_map(|name| entities.remove(&name).map(|entity| (name, entity)))
                .collect()
        };

        let mut failures = Vec::new();
        for (name, entity) in drained {
            match tokio::time::timeout(timeout, entity.release()).await {
                Ok(Ok(())) => tracing::debug!(entity = %name, "🧹 Released {}", entity.kind()),
                Ok(Err(error)) => {
                    tracing::warn!(entity = %name, "⚠️ Failed to release {}: {}", entity.kind(), error);
                    failures.push(format!("{name}: {error}"));
                }
                Err(_) => {
                    let reason = CancelReason::TimedOut {
                        timeout_ms: timeout.as_millis() as u64,
                    };
                    tracing::warn!(entity = %name, "⏰ Releasing {} {}", entity.kind(), reason);
                    failures.push(format!("{name}: release {reason}"));
                }
            }
        }
        failures
    }
}

fn kind_mismatch(name: &str, expected: EntityKind, actual: &Entity) -> InterpreterError {
    InterpreterError::WrongEntityKind {
        name: name.to_string(),
        expected: expected.to_string(),
        actual: actual.kind().to_string(),
    }
}
