//! Entities: named live resources created during a test run

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use shared::{Document, Namespace, Value};

use crate::core::events::{EventLog, EventSink};
use crate::error::{BackendError, BackendResult};
use crate::traits::{ClusterHandle, CommandExecutor, CommandOptions, SessionHandle, SubscriptionId};

/// Name given to the environment's shared client when it backs a step
pub const DEFAULT_CLIENT_NAME: &str = "<default>";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    Client,
    Database,
    Collection,
    Session,
    Observer,
    Cursor,
    Result,
}

impl EntityKind {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "client" => Some(EntityKind::Client),
            "database" => Some(EntityKind::Database),
            "collection" => Some(EntityKind::Collection),
            "session" => Some(EntityKind::Session),
            "observer" => Some(EntityKind::Observer),
            "cursor" => Some(EntityKind::Cursor),
            "result" => Some(EntityKind::Result),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EntityKind::Client => "client",
            EntityKind::Database => "database",
            EntityKind::Collection => "collection",
            EntityKind::Session => "session",
            EntityKind::Observer => "observer",
            EntityKind::Cursor => "cursor",
            EntityKind::Result => "result",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Typed handle to a live resource owned by the entity map
#[derive(Debug, Clone)]
pub enum Entity {
    Client(Arc<ClientEntity>),
    Database(Arc<DatabaseEntity>),
    Collection(Arc<CollectionEntity>),
    Session(Arc<SessionEntity>),
    Observer(Arc<EventObserver>),
    Cursor(Arc<CursorEntity>),
    Result(Arc<Value>),
}

impl Entity {
    pub fn kind(&self) -> EntityKind {
        match self {
            Entity::Client(_) => EntityKind::Client,
            Entity::Database(_) => EntityKind::Database,
            Entity::Collection(_) => EntityKind::Collection,
            Entity::Session(_) => EntityKind::Session,
            Entity::Observer(_) => EntityKind::Observer,
            Entity::Cursor(_) => EntityKind::Cursor,
            Entity::Result(_) => EntityKind::Result,
        }
    }

    /// Release the resource this entity holds
    ///
    /// Observers owned by a client are released with that client, never here.
    pub async fn release(&self) -> BackendResult<()> {
        match self {
            Entity::Client(client) => client.close().await,
            Entity::Session(session) => session.end().await,
            Entity::Cursor(cursor) => cursor.close().await,
            Entity::Observer(observer) => {
                if observer.owner() == ObserverOwner::Environment {
                    observer.detach();
                }
                Ok(())
            }
            Entity::Database(_) | Entity::Collection(_) | Entity::Result(_) => Ok(()),
        }
    }
}

/// A connection to the deployment
pub struct ClientEntity {
    id: String,
    cluster: Arc<dyn ClusterHandle>,
    owns_cluster: bool,
    observers: Mutex<Vec<Arc<EventObserver>>>,
    closed: AtomicBool,
}

impl ClientEntity {
    /// Client created by a test step; closing it closes the cluster handle
    pub fn new<S: Into<String>>(id: S, cluster: Arc<dyn ClusterHandle>) -> Self {
        Self {
            id: id.into(),
            cluster,
            owns_cluster: true,
            observers: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// View of the environment's shared cluster; never closes it
    pub fn environment_default(cluster: Arc<dyn ClusterHandle>) -> Self {
        Self {
            id: DEFAULT_CLIENT_NAME.to_string(),
            cluster,
            owns_cluster: false,
            observers: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn cluster(&self) -> &Arc<dyn ClusterHandle> {
        &self.cluster
    }

    pub fn executor(&self) -> Arc<dyn CommandExecutor> {
        self.cluster.executor()
    }

    pub fn attach_observer(&self, observer: Arc<EventObserver>) {
        self.observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(observer);
    }

    pub fn observer_count(&self) -> usize {
        self.observers.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Detach every owned observer, then close the connection once
    pub async fn close(&self) -> BackendResult<()> {
        let observers: Vec<Arc<EventObserver>> = self
            .observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for observer in observers {
            observer.detach();
        }

        if self.owns_cluster && !self.closed.swap(true, Ordering::SeqCst) {
            tracing::debug!("🔌 Closing client '{}'", self.id);
            self.cluster.close().await?;
        }
        Ok(())
    }
}

impl fmt::Debug for ClientEntity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientEntity")
            .field("id", &self.id)
            .field("owns_cluster", &self.owns_cluster)
            .finish()
    }
}

#[derive(Debug)]
pub struct DatabaseEntity {
    pub id: String,
    pub client: Arc<ClientEntity>,
    pub name: String,
}

impl DatabaseEntity {
    pub fn namespace(&self) -> Namespace {
        Namespace::database(self.name.clone())
    }
}

#[derive(Debug)]
pub struct CollectionEntity {
    pub id: String,
    pub database: Arc<DatabaseEntity>,
    pub name: String,
}

impl CollectionEntity {
    pub fn namespace(&self) -> Namespace {
        Namespace::collection(self.database.name.clone(), self.name.clone())
    }

    pub fn client(&self) -> &Arc<ClientEntity> {
        &self.database.client
    }
}

/// A logical session started on a client
pub struct SessionEntity {
    id: String,
    client: String,
    handle: Arc<dyn SessionHandle>,
    ended: AtomicBool,
}

impl SessionEntity {
    pub fn new<S: Into<String>>(id: S, client: S, handle: Arc<dyn SessionHandle>) -> Self {
        Self {
            id: id.into(),
            client: client.into(),
            handle,
            ended: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Name of the client entity the session was started on
    pub fn client(&self) -> &str {
        &self.client
    }

    pub fn handle(&self) -> &Arc<dyn SessionHandle> {
        &self.handle
    }

    pub fn is_ended(&self) -> bool {
        self.ended.load(Ordering::SeqCst)
    }

    /// End the session; once it has ended, later calls are no-ops
    ///
    /// A failed end leaves the session open so teardown can try again.
    pub async fn end(&self) -> BackendResult<()> {
        if self.is_ended() {
            return Ok(());
        }
        self.handle.end().await?;
        self.ended.store(true, Ordering::SeqCst);
        Ok(())
    }
}

impl fmt::Debug for SessionEntity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionEntity")
            .field("id", &self.id)
            .field("client", &self.client)
            .finish()
    }
}

/// Who an observer belongs to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObserverOwner {
    /// A client entity; the observer is detached when that client closes
    Client(String),
    /// The environment's shared client; the observer is detached at teardown
    Environment,
}

/// Records events delivered by one client's backend activity
pub struct EventObserver {
    id: String,
    owner: ObserverOwner,
    log: Arc<EventLog>,
    cluster: Arc<dyn ClusterHandle>,
    subscription: Mutex<Option<SubscriptionId>>,
}

impl EventObserver {
    /// Create an observer and subscribe it to `cluster`
    pub fn attach<O, I>(
        id: &str,
        owner: ObserverOwner,
        cluster: Arc<dyn ClusterHandle>,
        observed: O,
        ignored_commands: I,
    ) -> Arc<Self>
    where
        O: IntoIterator<Item = String>,
        I: IntoIterator<Item = String>,
    {
        let log = Arc::new(EventLog::new(id));
        let sink = EventSink::new(log.clone(), observed, ignored_commands);
        let subscription = cluster.subscribe(sink);

        tracing::debug!("👁️ Observer '{}' subscribed ({:?})", id, owner);

        Arc::new(Self {
            id: id.to_string(),
            owner,
            log,
            cluster,
            subscription: Mutex::new(Some(subscription)),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn owner(&self) -> ObserverOwner {
        self.owner.clone()
    }

    pub fn log(&self) -> &Arc<EventLog> {
        &self.log
    }

    pub fn is_attached(&self) -> bool {
        self.subscription
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Stop receiving events; only the first call unsubscribes
    pub fn detach(&self) {
        let subscription = self
            .subscription
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(subscription) = subscription {
            self.cluster.unsubscribe(subscription);
            tracing::debug!("👁️ Observer '{}' detached", self.id);
        }
    }
}

impl fmt::Debug for EventObserver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventObserver")
            .field("id", &self.id)
            .field("owner", &self.owner)
            .field("events", &self.log.len())
            .finish()
    }
}

#[derive(Debug)]
struct CursorState {
    cursor_id: i64,
    buffer: VecDeque<Value>,
    closed: bool,
}

/// Server-side cursor iterated with follow-up commands
pub struct CursorEntity {
    id: String,
    executor: Arc<dyn CommandExecutor>,
    namespace: Namespace,
    session: Option<Arc<dyn SessionHandle>>,
    batch_size: Option<i64>,
    state: tokio::sync::Mutex<CursorState>,
}

impl CursorEntity {
    /// Build a cursor from a `{cursor: {id, firstBatch}}` reply
    pub fn from_reply(
        id: &str,
        executor: Arc<dyn CommandExecutor>,
        namespace: Namespace,
        session: Option<Arc<dyn SessionHandle>>,
        batch_size: Option<i64>,
        reply: &Document,
    ) -> BackendResult<Self> {
        let (cursor_id, first_batch) = parse_cursor_reply(reply, "firstBatch")?;
        Ok(Self {
            id: id.to_string(),
            executor,
            namespace,
            session,
            batch_size,
            state: tokio::sync::Mutex::new(CursorState {
                cursor_id,
                buffer: first_batch.into(),
                closed: false,
            }),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    fn command_options(&self) -> CommandOptions {
        CommandOptions {
            session: self.session.clone(),
            ..CommandOptions::default()
        }
    }

    /// Next document, fetching more batches until one arrives or the cursor ends
    pub async fn next(&self) -> BackendResult<Value> {
        let mut state = self.state.lock().await;
        loop {
            if state.closed {
                return Err(BackendError::client(format!("cursor '{}' is closed", self.id)));
            }
            if let Some(document) = state.buffer.pop_front() {
                return Ok(document);
            }
            if state.cursor_id == 0 {
                return Err(BackendError::client(format!("cursor '{}' is exhausted", self.id)));
            }

            let mut get_more = Document::new();
            get_more.insert("getMore".to_string(), Value::from(state.cursor_id));
            get_more.insert(
                "collection".to_string(),
                Value::from(self.namespace.collection.clone().unwrap_or_default()),
            );
            if let Some(batch_size) = self.batch_size {
                get_more.insert("batchSize".to_string(), Value::from(batch_size));
            }

            let reply = self
                .executor
                .execute(&Namespace::database(self.namespace.database.clone()), &get_more, &self.command_options())
                .await?;
            let (cursor_id, next_batch) = parse_cursor_reply(&reply, "nextBatch")?;
            state.cursor_id = cursor_id;
            state.buffer.extend(next_batch);
        }
    }

    /// Close the cursor, killing it server-side if it is still open
    pub async fn close(&self) -> BackendResult<()> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Ok(());
        }
        state.closed = true;
        state.buffer.clear();

        if state.cursor_id != 0 {
            let mut kill = Document::new();
            kill.insert(
                "killCursors".to_string(),
                Value::from(self.namespace.collection.clone().unwrap_or_default()),
            );
            kill.insert("cursors".to_string(), Value::Array(vec![Value::from(state.cursor_id)]));
            state.cursor_id = 0;
            self.executor
                .execute(&Namespace::database(self.namespace.database.clone()), &kill, &self.command_options())
                .await?;
        }
        Ok(())
    }
}

impl fmt::Debug for CursorEntity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CursorEntity")
            .field("id", &self.id)
            .field("namespace", &self.namespace)
            .field("batch_size", &self.batch_size)
            .finish()
    }
}

fn parse_cursor_reply(reply: &Document, batch_field: &str) -> BackendResult<(i64, Vec<Value>)> {
    let cursor = reply
        .get("cursor")
        .and_then(Value::as_object)
        .ok_or_else(|| BackendError::client("reply has no 'cursor' document"))?;
    let cursor_id = cursor
        .get("id")
        .and_then(Value::as_i64)
        .ok_or_else(|| BackendError::client("cursor reply has no integer 'id'"))?;
    let batch = cursor
        .get(batch_field)
        .and_then(Value::as_array)
        .cloned()
        .ok_or_else(|| BackendError::client(format!("cursor reply has no '{batch_field}' array")))?;
    Ok((cursor_id, batch))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::{MockClusterHandle, MockCommandExecutor, MockSessionHandle};
    use serde_json::json;

    fn document(value: serde_json::Value) -> Document {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_entity_kind_names_round_trip() {
        for kind in [
            EntityKind::Client,
            EntityKind::Database,
            EntityKind::Collection,
            EntityKind::Session,
            EntityKind::Observer,
            EntityKind::Cursor,
            EntityKind::Result,
        ] {
            assert_eq!(EntityKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(EntityKind::parse("bucket"), None);
    }

    #[tokio::test]
    async fn test_client_close_detaches_observers_and_closes_once() {
        let mut cluster = MockClusterHandle::new();
        cluster.expect_subscribe().times(1).returning(|_| SubscriptionId::new());
        cluster.expect_unsubscribe().times(1).returning(|_| ());
        cluster.expect_close().times(1).returning(|| Ok(()));
        let cluster: Arc<dyn ClusterHandle> = Arc::new(cluster);

        let client = ClientEntity::new("client0", cluster.clone());
        let observer = EventObserver::attach(
            "ev0",
            ObserverOwner::Client("client0".to_string()),
            cluster,
            vec!["commandStartedEvent".to_string()],
            Vec::new(),
        );
        client.attach_observer(observer.clone());
        assert_eq!(client.observer_count(), 1);

        client.close().await.unwrap();
        client.close().await.unwrap();
        assert!(!observer.is_attached());
        assert_eq!(client.observer_count(), 0);
    }

    #[tokio::test]
    async fn test_environment_default_client_never_closes_cluster() {
        let mut cluster = MockClusterHandle::new();
        cluster.expect_close().times(0);
        let client = ClientEntity::environment_default(Arc::new(cluster));
        assert_eq!(client.id(), DEFAULT_CLIENT_NAME);
        client.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_session_end_is_idempotent() {
        let mut handle = MockSessionHandle::new();
        handle.expect_end().times(1).returning(|| Ok(()));
        let session = SessionEntity::new("session0", "client0", Arc::new(handle));

        session.end().await.unwrap();
        session.end().await.unwrap();
        assert!(session.is_ended());
        assert_eq!(session.client(), "client0");
    }

    #[tokio::test]
    async fn test_failed_session_end_can_be_retried() {
        let mut handle = MockSessionHandle::new();
        let mut sequence = mockall::Sequence::new();
        handle
            .expect_end()
            .times(1)
            .in_sequence(&mut sequence)
            .returning(|| Err(BackendError::network("socket closed")));
        handle
            .expect_end()
            .times(1)
            .in_sequence(&mut sequence)
            .returning(|| Ok(()));
        let session = SessionEntity::new("session0", "client0", Arc::new(handle));

        assert!(session.end().await.is_err());
        assert!(!session.is_ended());

        session.end().await.unwrap();
        assert!(session.is_ended());
        session.end().await.unwrap();
    }

    #[tokio::test]
    async fn test_cursor_iterates_batches_and_kills_on_close() {
        let mut executor = MockCommandExecutor::new();
        executor
            .expect_execute()
            .withf(|_, command, _| command.contains_key("getMore"))
            .times(1)
            .returning(|_, _, _| Ok(document(json!({"cursor": {"id": 42, "nextBatch": [{"_id": 2}]}}))));
        executor
            .expect_execute()
            .withf(|namespace, command, _| command.contains_key("killCursors") && namespace.database == "db")
            .times(1)
            .returning(|_, _, _| Ok(document(json!({"ok": 1}))));

        let reply = document(json!({"cursor": {"id": 42, "firstBatch": [{"_id": 1}]}}));
        let cursor = CursorEntity::from_reply(
            "cursor0",
            Arc::new(executor),
            Namespace::collection("db", "coll"),
            None,
            Some(1),
            &reply,
        )
        .unwrap();

        assert_eq!(cursor.next().await.unwrap(), json!({"_id": 1}));
        assert_eq!(cursor.next().await.unwrap(), json!({"_id": 2}));
        cursor.close().await.unwrap();
        cursor.close().await.unwrap();

        let error = cursor.next().await.unwrap_err();
        assert!(error.is_client_error());
    }

    #[tokio::test]
    async fn test_exhausted_cursor_reports_client_error() {
        let executor = MockCommandExecutor::new();
        let reply = document(json!({"cursor": {"id": 0, "firstBatch": []}}));
        let cursor = CursorEntity::from_reply(
            "cursor0",
            Arc::new(executor),
            Namespace::collection("db", "coll"),
            None,
            None,
            &reply,
        )
        .unwrap();

        let error = cursor.next().await.unwrap_err();
        assert!(error.message.contains("exhausted"));
        cursor.close().await.unwrap();
    }

    #[test]
    fn test_malformed_cursor_reply_is_rejected() {
        let executor = MockCommandExecutor::new();
        let result = CursorEntity::from_reply(
            "cursor0",
            Arc::new(executor),
            Namespace::collection("db", "coll"),
            None,
            None,
            &document(json!({"ok": 1})),
        );
        assert!(result.is_err());
    }
}
