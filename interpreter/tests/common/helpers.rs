//! Scriptable stub backend and test helpers
//!
//! The stub plays the Cluster Provider, Cluster Handle, Command Executor and
//! Session roles at once. Every cluster it hands out has its own event
//! channel, and every command emits command monitoring events to the sinks
//! subscribed on that cluster only. Failures, replies and latency are
//! scripted per command name.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use interpreter::core::EventSink;
use interpreter::error::{BackendError, BackendResult};
use interpreter::traits::{
    ClientConfig, ClusterHandle, ClusterProvider, CommandExecutor, CommandOptions, Endpoint, EndpointDescription,
    EndpointRole, EndpointSelector, SessionHandle, SessionOptions, SubscriptionId, TopologyDescription, TopologyKind,
    TransactionState,
};
use interpreter::{EnvironmentConfig, OperationRegistry, TestEnvironment};
use serde_json::{json, Value};
use shared::{first_key, Document, Namespace};
use tokio::sync::watch;

use super::fixtures::TestFixtures;

/// Event sinks subscribed on one cluster
#[derive(Default)]
struct EventChannel {
    sinks: Mutex<HashMap<SubscriptionId, EventSink>>,
}

impl EventChannel {
    fn emit(&self, event_type: &str, body: Document) {
        let sinks: Vec<EventSink> = self.sinks.lock().unwrap().values().cloned().collect();
        for sink in sinks {
            sink.deliver(event_type, body.clone());
        }
    }
}

/// State shared by every handle the stub hands out
pub struct StubState {
    channels: Mutex<Vec<Arc<EventChannel>>>,
    failures: Mutex<HashMap<String, BackendError>>,
    replies: Mutex<HashMap<String, Document>>,
    delays: Mutex<HashMap<String, Duration>>,
    commands: Mutex<Vec<(Namespace, Document)>>,
    connections: Mutex<Vec<ClientConfig>>,
    topology: watch::Sender<TopologyDescription>,
    closed: AtomicUsize,
    fail_close: AtomicBool,
    sessions_ended: AtomicUsize,
    pinned_to: Mutex<Option<Endpoint>>,
}

impl StubState {
    fn open_cluster(self: &Arc<Self>) -> StubCluster {
        let channel = Arc::new(EventChannel::default());
        self.channels.lock().unwrap().push(channel.clone());
        StubCluster {
            state: self.clone(),
            channel,
        }
    }
}

/// Handle to the stub backend used to script and inspect it
#[derive(Clone)]
pub struct StubBackend {
    state: Arc<StubState>,
}

impl StubBackend {
    pub fn new() -> Self {
        let (topology, _) = watch::channel(TestHelpers::writable_topology());
        Self {
            state: Arc::new(StubState {
                channels: Mutex::new(Vec::new()),
                failures: Mutex::new(HashMap::new()),
                replies: Mutex::new(HashMap::new()),
                delays: Mutex::new(HashMap::new()),
                commands: Mutex::new(Vec::new()),
                connections: Mutex::new(Vec::new()),
                topology,
                closed: AtomicUsize::new(0),
                fail_close: AtomicBool::new(false),
                sessions_ended: AtomicUsize::new(0),
                pinned_to: Mutex::new(None),
            }),
        }
    }

    /// Make every `command` fail with `error`
    pub fn fail_command(&self, command: &str, error: BackendError) -> &Self {
        self.state.failures.lock().unwrap().insert(command.to_string(), error);
        self
    }

    pub fn reply_to(&self, command: &str, reply: Value) -> &Self {
        let reply = reply.as_object().cloned().unwrap();
        self.state.replies.lock().unwrap().insert(command.to_string(), reply);
        self
    }

    pub fn delay_command(&self, command: &str, delay: Duration) -> &Self {
        self.state.delays.lock().unwrap().insert(command.to_string(), delay);
        self
    }

    pub fn fail_close(&self) -> &Self {
        self.state.fail_close.store(true, Ordering::SeqCst);
        self
    }

    /// Pin every session started from now on
    pub fn pin_sessions_to(&self, address: &str) -> &Self {
        *self.state.pinned_to.lock().unwrap() = Some(Endpoint {
            address: address.to_string(),
        });
        self
    }

    pub fn cluster(&self) -> Arc<dyn ClusterHandle> {
        Arc::new(self.state.open_cluster())
    }

    pub fn provider(&self) -> Arc<dyn ClusterProvider> {
        Arc::new(StubProvider {
            state: self.state.clone(),
        })
    }

    pub fn command_names(&self) -> Vec<String> {
        self.state
            .commands
            .lock()
            .unwrap()
            .iter()
            .filter_map(|(_, command)| first_key(command).map(str::to_string))
            .collect()
    }

    pub fn commands(&self) -> Vec<(Namespace, Document)> {
        self.state.commands.lock().unwrap().clone()
    }

    pub fn connections(&self) -> Vec<ClientConfig> {
        self.state.connections.lock().unwrap().clone()
    }

    /// Sinks still subscribed, across every cluster
    pub fn subscriber_count(&self) -> usize {
        self.state
            .channels
            .lock()
            .unwrap()
            .iter()
            .map(|channel| channel.sinks.lock().unwrap().len())
            .sum()
    }

    pub fn closed_count(&self) -> usize {
        self.state.closed.load(Ordering::SeqCst)
    }

    pub fn sessions_ended(&self) -> usize {
        self.state.sessions_ended.load(Ordering::SeqCst)
    }

    /// Deliver an event on the `cluster`-th opened cluster from a separate OS thread
    ///
    /// Clusters are numbered in the order they were opened; the environment's is 0.
    pub fn emit_in_background(
        &self,
        cluster: usize,
        event_type: &'static str,
        body: Value,
        delay: Duration,
    ) -> std::thread::JoinHandle<()> {
        let channel = self.state.channels.lock().unwrap()[cluster].clone();
        let body = body.as_object().cloned().unwrap();
        std::thread::spawn(move || {
            std::thread::sleep(delay);
            channel.emit(event_type, body);
        })
    }
}

struct StubProvider {
    state: Arc<StubState>,
}

#[async_trait::async_trait]
impl ClusterProvider for StubProvider {
    async fn connect(&self, config: &ClientConfig) -> BackendResult<Arc<dyn ClusterHandle>> {
        self.state.connections.lock().unwrap().push(config.clone());
        Ok(Arc::new(self.state.open_cluster()))
    }
}

struct StubCluster {
    state: Arc<StubState>,
    channel: Arc<EventChannel>,
}

#[async_trait::async_trait]
impl ClusterHandle for StubCluster {
    async fn select_endpoint(&self, _selector: &EndpointSelector) -> BackendResult<Endpoint> {
        Ok(Endpoint {
            address: TestFixtures::PRIMARY_ADDRESS.to_string(),
        })
    }

    fn topology(&self) -> watch::Receiver<TopologyDescription> {
        self.state.topology.subscribe()
    }

    fn executor(&self) -> Arc<dyn CommandExecutor> {
        Arc::new(StubExecutor {
            state: self.state.clone(),
            channel: self.channel.clone(),
        })
    }

    async fn start_session(&self, _options: &SessionOptions) -> BackendResult<Arc<dyn SessionHandle>> {
        let mut lsid = Document::new();
        lsid.insert("id".to_string(), json!(uuid::Uuid::new_v4().to_string()));
        Ok(Arc::new(StubSession {
            state: self.state.clone(),
            lsid,
            pinned: self.state.pinned_to.lock().unwrap().clone(),
            transaction: Mutex::new(TransactionState::None),
        }))
    }

    fn subscribe(&self, sink: EventSink) -> SubscriptionId {
        let id = SubscriptionId::new();
        self.channel.sinks.lock().unwrap().insert(id, sink);
        id
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        self.channel.sinks.lock().unwrap().remove(&id);
    }

    async fn close(&self) -> BackendResult<()> {
        self.state.closed.fetch_add(1, Ordering::SeqCst);
        if self.state.fail_close.load(Ordering::SeqCst) {
            return Err(BackendError::network("connection reset during close"));
        }
        Ok(())
    }
}

struct StubExecutor {
    state: Arc<StubState>,
    channel: Arc<EventChannel>,
}

#[async_trait::async_trait]
impl CommandExecutor for StubExecutor {
    async fn execute(&self, namespace: &Namespace, command: &Document, options: &CommandOptions) -> BackendResult<Document> {
        let name = first_key(command).unwrap_or_default().to_string();
        self.state.commands.lock().unwrap().push((namespace.clone(), command.clone()));

        let mut sent = command.clone();
        if let Some(session) = &options.session {
            sent.insert("lsid".to_string(), Value::Object(session.lsid()));
        }
        let started = json!({
            "commandName": name,
            "databaseName": namespace.database,
            "command": sent,
        });
        self.channel.emit("commandStartedEvent", started.as_object().cloned().unwrap_or_default());

        let delay = self.state.delays.lock().unwrap().get(&name).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let failure = self.state.failures.lock().unwrap().get(&name).cloned();
        if let Some(error) = failure {
            let failed = json!({"commandName": name, "failure": error.message});
            self.channel.emit("commandFailedEvent", failed.as_object().cloned().unwrap_or_default());
            return Err(error);
        }

        let reply = self
            .state
            .replies
            .lock()
            .unwrap()
            .get(&name)
            .cloned()
            .unwrap_or_else(|| json!({"ok": 1}).as_object().cloned().unwrap_or_default());
        let succeeded = json!({"commandName": name, "reply": reply});
        self.channel.emit("commandSucceededEvent", succeeded.as_object().cloned().unwrap_or_default());
        Ok(reply)
    }
}

struct StubSession {
    state: Arc<StubState>,
    lsid: Document,
    pinned: Option<Endpoint>,
    transaction: Mutex<TransactionState>,
}

#[async_trait::async_trait]
impl SessionHandle for StubSession {
    fn lsid(&self) -> Document {
        self.lsid.clone()
    }

    fn pinned_endpoint(&self) -> Option<Endpoint> {
        self.pinned.clone()
    }

    fn transaction_state(&self) -> TransactionState {
        *self.transaction.lock().unwrap()
    }

    async fn start_transaction(&self, _options: &Document) -> BackendResult<()> {
        let mut state = self.transaction.lock().unwrap();
        if *state == TransactionState::Starting || *state == TransactionState::InProgress {
            return Err(BackendError::client("transaction already in progress"));
        }
        *state = TransactionState::Starting;
        Ok(())
    }

    async fn commit_transaction(&self) -> BackendResult<()> {
        *self.transaction.lock().unwrap() = TransactionState::Committed;
        Ok(())
    }

    async fn abort_transaction(&self) -> BackendResult<()> {
        *self.transaction.lock().unwrap() = TransactionState::Aborted;
        Ok(())
    }

    async fn end(&self) -> BackendResult<()> {
        self.state.sessions_ended.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Common setup shared by the integration suites
pub struct TestHelpers;

impl TestHelpers {
    pub fn writable_topology() -> TopologyDescription {
        TopologyDescription {
            kind: TopologyKind::ReplicaSet,
            endpoints: vec![EndpointDescription {
                address: TestFixtures::PRIMARY_ADDRESS.to_string(),
                role: EndpointRole::Writable,
                connected: true,
                version: Some(TestFixtures::SERVER_VERSION.to_string()),
            }],
            logical_session_timeout: Some(Duration::from_secs(1800)),
        }
    }

    pub fn config() -> EnvironmentConfig {
        EnvironmentConfig::from_lookup(|key| match key {
            "BACKEND_URI" => Some(TestFixtures::CONNECTION_STRING.to_string()),
            "BACKEND_SERVER_SELECTION_TIMEOUT_MS" => Some("1000".to_string()),
            _ => None,
        })
        .unwrap()
    }

    /// Environment connected to `backend` through its provider
    pub async fn environment(backend: &StubBackend) -> TestEnvironment {
        TestEnvironment::connect(Self::config(), backend.provider()).await.unwrap()
    }

    pub fn registry() -> OperationRegistry {
        OperationRegistry::standard()
    }
}
