//! Trait definitions with mockall annotations for testing
//!
//! The interpreter treats the backend as a black box reached through these
//! collaborators: a Cluster Provider that hands out connected cluster
//! handles, and a Command Executor that runs one opaque command per call.
//! Everything here is injected, so tests drive the engine with mocks or
//! scripted stubs instead of a live deployment.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use shared::{Document, Namespace};
use tokio::sync::watch;

use crate::core::events::EventSink;
use crate::error::BackendResult;

/// Versioned server API declaration sent with every command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerApiVersion {
    V1,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerApi {
    pub version: ServerApiVersion,
}

/// Everything the Cluster Provider needs to open a connection
#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    pub connection_string: String,
    pub uri_options: Document,
    pub server_api: Option<ServerApi>,
    pub server_selection_timeout: Duration,
}

/// Criteria for choosing a server
#[derive(Debug, Clone, PartialEq)]
pub enum EndpointSelector {
    Writable,
    DataBearing,
    ReadPreference(Document),
}

/// A selected server
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub address: String,
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.address)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TopologyKind {
    #[default]
    Unknown,
    Single,
    ReplicaSet,
    Sharded,
    LoadBalanced,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointRole {
    Writable,
    Secondary,
    Arbiter,
    Unknown,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EndpointDescription {
    pub address: String,
    pub role: EndpointRole,
    pub connected: bool,
    pub version: Option<String>,
}

impl EndpointDescription {
    pub fn is_writable(&self) -> bool {
        self.connected && self.role == EndpointRole::Writable
    }

    pub fn is_data_bearing(&self) -> bool {
        self.connected && matches!(self.role, EndpointRole::Writable | EndpointRole::Secondary)
    }
}

/// Client view of the deployment, published on every topology change
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TopologyDescription {
    pub kind: TopologyKind,
    pub endpoints: Vec<EndpointDescription>,
    pub logical_session_timeout: Option<Duration>,
}

impl TopologyDescription {
    pub fn has_writable_endpoint(&self) -> bool {
        self.endpoints.iter().any(EndpointDescription::is_writable)
    }

    pub fn has_data_bearing_endpoint(&self) -> bool {
        self.endpoints.iter().any(EndpointDescription::is_data_bearing)
    }

    pub fn sessions_supported(&self) -> bool {
        self.endpoints.iter().any(|endpoint| endpoint.connected)
            && (self.logical_session_timeout.is_some() || self.kind == TopologyKind::LoadBalanced)
    }
}

impl fmt::Display for TopologyDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let endpoints: Vec<String> = self
            .endpoints
            .iter()
            .map(|endpoint| format!("{}({:?}, connected={})", endpoint.address, endpoint.role, endpoint.connected))
            .collect();
        write!(f, "{:?} [{}]", self.kind, endpoints.join(", "))
    }
}

/// Transaction state of a session as reported by the backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    None,
    Starting,
    InProgress,
    Committed,
    Aborted,
}

impl TransactionState {
    /// Parse the snake_case names used by test documents
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "none" => Some(TransactionState::None),
            "starting" => Some(TransactionState::Starting),
            "in_progress" => Some(TransactionState::InProgress),
            "committed" => Some(TransactionState::Committed),
            "aborted" => Some(TransactionState::Aborted),
            _ => None,
        }
    }
}

/// Options for starting a session
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SessionOptions {
    pub causal_consistency: Option<bool>,
    pub snapshot: Option<bool>,
    pub default_transaction_options: Option<Document>,
}

/// Per-call options passed along with a command document
#[derive(Clone, Default)]
pub struct CommandOptions {
    pub session: Option<Arc<dyn SessionHandle>>,
    pub read_preference: Option<Document>,
    pub timeout: Option<Duration>,
}

impl fmt::Debug for CommandOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandOptions")
            .field("session", &self.session.as_ref().map(|session| session.lsid()))
            .field("read_preference", &self.read_preference)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Identifier of an event sink registered with a cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub uuid::Uuid);

impl SubscriptionId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for SubscriptionId {
    fn default() -> Self {
        Self::new()
    }
}

/// Cluster bootstrap abstraction
#[mockall::automock]
#[async_trait::async_trait]
pub trait ClusterProvider: Send + Sync {
    /// Open a connection to the deployment described by `config`
    async fn connect(&self, config: &ClientConfig) -> BackendResult<Arc<dyn ClusterHandle>>;
}

/// A live connection to the deployment
#[mockall::automock]
#[async_trait::async_trait]
pub trait ClusterHandle: Send + Sync {
    /// Select a server matching `selector`
    async fn select_endpoint(&self, selector: &EndpointSelector) -> BackendResult<Endpoint>;

    /// Topology-change notifications; the current value is the latest description
    fn topology(&self) -> watch::Receiver<TopologyDescription>;

    /// Command executor bound to this connection
    fn executor(&self) -> Arc<dyn CommandExecutor>;

    /// Start a logical session on this connection
    async fn start_session(&self, options: &SessionOptions) -> BackendResult<Arc<dyn SessionHandle>>;

    /// Register an event sink; the backend delivers events from its own threads
    fn subscribe(&self, sink: EventSink) -> SubscriptionId;

    /// Stop delivering events to a previously registered sink
    fn unsubscribe(&self, id: SubscriptionId);

    /// Release every resource held by the connection
    async fn close(&self) -> BackendResult<()>;
}

/// Opaque command execution
#[mockall::automock]
#[async_trait::async_trait]
pub trait CommandExecutor: Send + Sync {
    /// Run one command document against `namespace`
    async fn execute(
        &self,
        namespace: &Namespace,
        command: &Document,
        options: &CommandOptions,
    ) -> BackendResult<Document>;
}

/// A logical session owned by the backend
#[mockall::automock]
#[async_trait::async_trait]
pub trait SessionHandle: Send + Sync {
    /// Logical session id document
    fn lsid(&self) -> Document;

    /// Server the current transaction is pinned to, if any
    fn pinned_endpoint(&self) -> Option<Endpoint>;

    fn transaction_state(&self) -> TransactionState;

    async fn start_transaction(&self, options: &Document) -> BackendResult<()>;

    async fn commit_transaction(&self) -> BackendResult<()>;

    async fn abort_transaction(&self) -> BackendResult<()>;

    /// End the session; further use is an error
    async fn end(&self) -> BackendResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint(role: EndpointRole, connected: bool) -> EndpointDescription {
        EndpointDescription {
            address: "localhost:27017".to_string(),
            role,
            connected,
            version: Some("7.0.0".to_string()),
        }
    }

    /// Test that mock traits can be instantiated
    #[tokio::test]
    async fn test_mock_trait_instantiation() {
        let _provider = MockClusterProvider::new();
        let _cluster = MockClusterHandle::new();
        let _executor = MockCommandExecutor::new();
        let _session = MockSessionHandle::new();
    }

    #[test]
    fn test_writable_topology_requires_connected_primary() {
        let mut topology = TopologyDescription {
            kind: TopologyKind::ReplicaSet,
            endpoints: vec![endpoint(EndpointRole::Writable, false)],
            logical_session_timeout: None,
        };
        assert!(!topology.has_writable_endpoint());

        topology.endpoints.push(endpoint(EndpointRole::Writable, true));
        assert!(topology.has_writable_endpoint());
        assert!(topology.has_data_bearing_endpoint());
    }

    #[test]
    fn test_sessions_supported() {
        let mut topology = TopologyDescription {
            kind: TopologyKind::Sharded,
            endpoints: vec![endpoint(EndpointRole::Writable, true)],
            logical_session_timeout: None,
        };
        assert!(!topology.sessions_supported());

        topology.logical_session_timeout = Some(Duration::from_secs(1800));
        assert!(topology.sessions_supported());

        topology.logical_session_timeout = None;
        topology.kind = TopologyKind::LoadBalanced;
        assert!(topology.sessions_supported());

        topology.endpoints[0].connected = false;
        assert!(!topology.sessions_supported());
    }

    #[test]
    fn test_transaction_state_names() {
        assert_eq!(TransactionState::parse("in_progress"), Some(TransactionState::InProgress));
        assert_eq!(TransactionState::parse("none"), Some(TransactionState::None));
        assert_eq!(TransactionState::parse("InProgress"), None);
    }
}
