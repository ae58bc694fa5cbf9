//! Test Environment: configuration and the shared cluster connection
//!
//! Built once by the external runner's setup phase and passed by reference
//! into every test run. It holds no per-run state.
//!
//! ## Configuration Sources
//! Values are loaded from:
//! 1. `.env` file in the current directory or parent directories (if present)
//! 2. System environment variables
//!
//! Environment variables take precedence over .env file values.
//!
//! ## Variables
//! - `BACKEND_URI` / `TEST_BACKEND_URI`: connection string
//! - `BACKEND_URI_WITH_MULTIPLE_ROUTERS`: connection string listing several routers
//! - `BACKEND_API_VERSION`: declared server API version (`1` only)
//! - `SERVERLESS`: `true` when running against a serverless deployment
//! - `BACKEND_SERVER_SELECTION_TIMEOUT_MS`: server selection timeout
//! - `BACKEND_LOGGING`: log level for the interpreter crates

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use shared::{logging, Document, Namespace};

use crate::core::entity::ClientEntity;
use crate::error::{BackendResult, InterpreterError, InterpreterResult};
use crate::traits::{
    ClientConfig, ClusterHandle, ClusterProvider, ServerApi, ServerApiVersion, TopologyDescription,
};

pub const DEFAULT_CONNECTION_STRING: &str = "backend://localhost";
pub const DEFAULT_MULTIPLE_ROUTERS_CONNECTION_STRING: &str = "backend://localhost,localhost:27018";
pub const DEFAULT_SERVER_SELECTION_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(180);

const MAX_DATABASE_NAME_LENGTH: usize = 63;
const MAX_FULL_COLLECTION_NAME_LENGTH: usize = 120;

/// Plain configuration value read from the environment
#[derive(Debug, Clone, PartialEq)]
pub struct EnvironmentConfig {
    pub connection_string: String,
    pub multiple_routers_connection_string: String,
    pub server_api: Option<ServerApi>,
    pub serverless: bool,
    pub server_selection_timeout: Duration,
    pub log_level: Option<String>,
    pub database_name: String,
    pub default_test_timeout: Duration,
}

impl EnvironmentConfig {
    /// Load `.env` (if any), then read the process environment
    pub fn from_env() -> InterpreterResult<Self> {
        // Already-set variables win over the file
        let _ = dotenv::dotenv();
        let config = Self::from_lookup(|key| std::env::var(key).ok())?;
        config.init_logging();
        Ok(config)
    }

    /// Read variables from a specific `.env` file, with the process environment taking precedence
    pub fn from_env_file<P: AsRef<Path>>(path: P) -> InterpreterResult<Self> {
        let file_error = |reason: String| InterpreterError::Configuration {
            field: path.as_ref().display().to_string(),
            reason,
        };

        let mut file_values = HashMap::new();
        for item in dotenv::from_path_iter(path.as_ref()).map_err(|error| file_error(error.to_string()))? {
            let (key, value) = item.map_err(|error| file_error(error.to_string()))?;
            file_values.insert(key, value);
        }

        let config = Self::from_lookup(|key| std::env::var(key).ok().or_else(|| file_values.get(key).cloned()))?;
        config.init_logging();
        Ok(config)
    }

    /// Build a configuration from any variable lookup
    pub fn from_lookup<F>(lookup: F) -> InterpreterResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let connection_string = lookup("BACKEND_URI")
            .or_else(|| lookup("TEST_BACKEND_URI"))
            .unwrap_or_else(|| DEFAULT_CONNECTION_STRING.to_string());

        let multiple_routers_connection_string = lookup("BACKEND_URI_WITH_MULTIPLE_ROUTERS")
            .unwrap_or_else(|| DEFAULT_MULTIPLE_ROUTERS_CONNECTION_STRING.to_string());

        let server_api = match lookup("BACKEND_API_VERSION").as_deref() {
            None | Some("") => None,
            Some("1") => Some(ServerApi {
                version: ServerApiVersion::V1,
            }),
            Some(other) => {
                return Err(InterpreterError::Configuration {
                    field: "BACKEND_API_VERSION".to_string(),
                    reason: format!("unsupported server API version '{other}'"),
                })
            }
        };

        let serverless = lookup("SERVERLESS")
            .map(|value| value.eq_ignore_ascii_case("true"))
            .unwrap_or(false);

        let server_selection_timeout_ms = match lookup("BACKEND_SERVER_SELECTION_TIMEOUT_MS") {
            None => DEFAULT_SERVER_SELECTION_TIMEOUT_MS,
            Some(raw) => raw.trim().parse::<u64>().map_err(|_| InterpreterError::Configuration {
                field: "BACKEND_SERVER_SELECTION_TIMEOUT_MS".to_string(),
                reason: format!("'{raw}' is not a number of milliseconds"),
            })?,
        };

        let log_level = lookup("BACKEND_LOGGING")
            .as_deref()
            .and_then(logging::parse_log_level)
            .map(str::to_string);

        let database_name = database_name_from_connection_string(&connection_string)
            .unwrap_or_else(|| format!("Tests{}", chrono::Local::now().format("%m%d%H%M")));

        Ok(Self {
            connection_string,
            multiple_routers_connection_string,
            server_api,
            serverless,
            server_selection_timeout: Duration::from_millis(server_selection_timeout_ms),
            log_level,
            database_name,
            default_test_timeout: DEFAULT_TEST_TIMEOUT,
        })
    }

    pub fn init_logging(&self) {
        if let Some(level) = &self.log_level {
            logging::init_tracing(Some(level));
        }
    }

    /// Per-suite database name, capped at the backend's database name limit
    pub fn database_name_for_suite(&self, suite: &str) -> String {
        truncate_chars(&format!("{}-{}", self.database_name, suite), MAX_DATABASE_NAME_LENGTH)
    }

    /// Per-test collection name, keeping `<db>.<collection>` within the namespace limit
    pub fn collection_name_for_test(&self, suite: &str, test: &str) -> String {
        let name = format!("{suite}-{test}");
        let database_length = self.database_name.chars().count();
        let full_length = database_length + 1 + name.chars().count();
        if full_length <= MAX_FULL_COLLECTION_NAME_LENGTH {
            return name;
        }
        let max_length = MAX_FULL_COLLECTION_NAME_LENGTH.saturating_sub(database_length + 1);
        truncate_chars(&name, max_length.saturating_sub(1))
    }

    /// Client configuration for a new connection
    pub fn client_config(&self, uri_options: Document, use_multiple_routers: bool) -> ClientConfig {
        let connection_string = if use_multiple_routers {
            self.multiple_routers_connection_string.clone()
        } else {
            self.connection_string.clone()
        };
        ClientConfig {
            connection_string,
            uri_options,
            server_api: self.server_api,
            server_selection_timeout: self.server_selection_timeout,
        }
    }
}

/// Path segment of `scheme://hosts/<db>?options`, if present
fn database_name_from_connection_string(connection_string: &str) -> Option<String> {
    let after_scheme = connection_string
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(connection_string);
    let (_, path) = after_scheme.split_once('/')?;
    let database = path.split('?').next().unwrap_or_default();
    if database.is_empty() {
        None
    } else {
        Some(database.to_string())
    }
}

fn truncate_chars(value: &str, max_chars: usize) -> String {
    value.chars().take(max_chars).collect()
}

/// Configuration plus the connected default cluster
pub struct TestEnvironment {
    config: EnvironmentConfig,
    provider: Arc<dyn ClusterProvider>,
    cluster: Arc<dyn ClusterHandle>,
    default_client: Arc<ClientEntity>,
}

impl std::fmt::Debug for TestEnvironment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestEnvironment")
            .field("config", &self.config)
            .finish()
    }
}

impl TestEnvironment {
    /// Connect and wait until the topology reports a writable endpoint
    pub async fn connect(config: EnvironmentConfig, provider: Arc<dyn ClusterProvider>) -> InterpreterResult<Self> {
        tracing::info!("🔗 Connecting to {}", config.connection_string);
        let cluster = provider
            .connect(&config.client_config(Document::new(), false))
            .await?;

        let mut changes = cluster.topology();
        let last_seen = changes.clone();
        let wait_for_writable = async move {
            loop {
                if changes.borrow_and_update().has_writable_endpoint() {
                    return true;
                }
                if changes.changed().await.is_err() {
                    return false;
                }
            }
        };

        let writable = tokio::time::timeout(config.server_selection_timeout, wait_for_writable)
            .await
            .unwrap_or(false);
        if !writable {
            let topology = last_seen.borrow().clone();
            tracing::error!("❌ No writable endpoint: {}", topology);
            // Best effort: the connection is unusable either way
            let _ = cluster.close().await;
            return Err(InterpreterError::Configuration {
                field: "topology".to_string(),
                reason: format!(
                    "no writable endpoint within {}ms; last topology: {}",
                    config.server_selection_timeout.as_millis(),
                    topology
                ),
            });
        }

        tracing::info!("✅ Connected: {}", last_seen.borrow().clone());
        Ok(Self::with_cluster(config, provider, cluster))
    }

    /// Wrap an already-connected cluster without waiting on the topology
    pub fn with_cluster(
        config: EnvironmentConfig,
        provider: Arc<dyn ClusterProvider>,
        cluster: Arc<dyn ClusterHandle>,
    ) -> Self {
        let default_client = Arc::new(ClientEntity::environment_default(cluster.clone()));
        Self {
            config,
            provider,
            cluster,
            default_client,
        }
    }

    pub fn config(&self) -> &EnvironmentConfig {
        &self.config
    }

    pub fn cluster(&self) -> &Arc<dyn ClusterHandle> {
        &self.cluster
    }

    /// Client used by steps that name none
    pub fn default_client(&self) -> &Arc<ClientEntity> {
        &self.default_client
    }

    pub fn default_database(&self) -> Namespace {
        Namespace::database(self.config.database_name.clone())
    }

    pub fn default_test_timeout(&self) -> Duration {
        self.config.default_test_timeout
    }

    /// Open an additional connection for a client entity
    pub async fn connect_client(&self, uri_options: Document, use_multiple_routers: bool) -> BackendResult<Arc<dyn ClusterHandle>> {
        let client_config = self.config.client_config(uri_options, use_multiple_routers);
        self.provider.connect(&client_config).await
    }

    pub fn topology(&self) -> TopologyDescription {
        self.cluster.topology().borrow().clone()
    }

    pub fn sessions_supported(&self) -> bool {
        self.topology().sessions_supported()
    }

    /// Version reported by a writable endpoint
    pub fn server_version(&self) -> InterpreterResult<String> {
        self.topology()
            .endpoints
            .iter()
            .filter(|endpoint| endpoint.is_writable())
            .find_map(|endpoint| endpoint.version.clone())
            .ok_or_else(|| InterpreterError::Configuration {
                field: "server_version".to_string(),
                reason: "no writable endpoint reports a version".to_string(),
            })
    }

    pub async fn shutdown(&self) -> InterpreterResult<()> {
        tracing::info!("🔌 Shutting down test environment");
        self.cluster.close().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::{EndpointDescription, EndpointRole, MockClusterHandle, MockClusterProvider, TopologyKind};
    use assert_matches::assert_matches;
    use std::io::Write;
    use tokio::sync::watch;

    fn lookup<'a>(pairs: &'a [(&'a str, &'a str)]) -> impl Fn(&str) -> Option<String> + 'a {
        move |key| {
            pairs
                .iter()
                .find(|(name, _)| *name == key)
                .map(|(_, value)| value.to_string())
        }
    }

    fn writable_topology() -> TopologyDescription {
        TopologyDescription {
            kind: TopologyKind::ReplicaSet,
            endpoints: vec![EndpointDescription {
                address: "localhost:27017".to_string(),
                role: EndpointRole::Writable,
                connected: true,
                version: Some("7.0.2".to_string()),
            }],
            logical_session_timeout: Some(Duration::from_secs(1800)),
        }
    }

    #[test]
    fn test_defaults() {
        let config = EnvironmentConfig::from_lookup(|_| None).unwrap();
        assert_eq!(config.connection_string, DEFAULT_CONNECTION_STRING);
        assert_eq!(config.multiple_routers_connection_string, DEFAULT_MULTIPLE_ROUTERS_CONNECTION_STRING);
        assert_eq!(config.server_api, None);
        assert!(!config.serverless);
        assert_eq!(config.server_selection_timeout, Duration::from_secs(30));
        assert_eq!(config.default_test_timeout, Duration::from_secs(180));
        assert!(config.database_name.starts_with("Tests"));
        assert_eq!(config.database_name.len(), "Tests".len() + 8);
    }

    #[test]
    fn test_variables_override_defaults() {
        let pairs = [
            ("TEST_BACKEND_URI", "backend://ignored/other"),
            ("BACKEND_URI", "backend://db.example:27017/conformance?replicaSet=rs0"),
            ("BACKEND_API_VERSION", "1"),
            ("SERVERLESS", "TRUE"),
            ("BACKEND_SERVER_SELECTION_TIMEOUT_MS", "500"),
            ("BACKEND_LOGGING", "Debug"),
        ];
        let config = EnvironmentConfig::from_lookup(lookup(&pairs)).unwrap();
        assert_eq!(config.database_name, "conformance");
        assert_eq!(config.server_api, Some(ServerApi { version: ServerApiVersion::V1 }));
        assert!(config.serverless);
        assert_eq!(config.server_selection_timeout, Duration::from_millis(500));
        assert_eq!(config.log_level.as_deref(), Some("debug"));
    }

    #[test]
    fn test_invalid_values_are_configuration_errors() {
        let bad_api = [("BACKEND_API_VERSION", "2")];
        assert_matches!(
            EnvironmentConfig::from_lookup(lookup(&bad_api)),
            Err(InterpreterError::Configuration { field, .. }) if field == "BACKEND_API_VERSION"
        );

        let bad_timeout = [("BACKEND_SERVER_SELECTION_TIMEOUT_MS", "soon")];
        assert_matches!(
            EnvironmentConfig::from_lookup(lookup(&bad_timeout)),
            Err(InterpreterError::Configuration { .. })
        );

        let bad_level = [("BACKEND_LOGGING", "chatty")];
        assert_eq!(EnvironmentConfig::from_lookup(lookup(&bad_level)).unwrap().log_level, None);
    }

    #[test]
    fn test_name_truncation() {
        let pairs = [("BACKEND_URI", "backend://localhost/db")];
        let config = EnvironmentConfig::from_lookup(lookup(&pairs)).unwrap();

        assert_eq!(config.database_name_for_suite("Sessions"), "db-Sessions");
        assert_eq!(config.database_name_for_suite(&"x".repeat(100)).len(), 63);

        assert_eq!(config.collection_name_for_test("Suite", "test"), "Suite-test");
        let long = config.collection_name_for_test("Suite", &"t".repeat(200));
        assert_eq!(long.len(), 120 - ("db".len() + 1) - 1);
    }

    #[test]
    fn test_from_env_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "BACKEND_URI_WITH_MULTIPLE_ROUTERS=backend://r1,r2/routers").unwrap();
        writeln!(file, "SERVERLESS=true").unwrap();

        let config = EnvironmentConfig::from_env_file(file.path()).unwrap();
        assert_eq!(config.multiple_routers_connection_string, "backend://r1,r2/routers");

        let client = config.client_config(Document::new(), true);
        assert_eq!(client.connection_string, "backend://r1,r2/routers");
    }

    #[test]
    fn test_env_file_logging_level_installs_subscriber() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "BACKEND_LOGGING=debug").unwrap();

        let config = EnvironmentConfig::from_env_file(file.path()).unwrap();
        assert_eq!(config.log_level.as_deref(), Some("debug"));
        assert!(tracing::dispatcher::has_been_set());
    }

    #[test]
    fn test_missing_env_file_is_configuration_error() {
        let directory = tempfile::tempdir().unwrap();
        let result = EnvironmentConfig::from_env_file(directory.path().join("absent.env"));
        assert_matches!(result, Err(InterpreterError::Configuration { .. }));
    }

    #[tokio::test]
    async fn test_connect_waits_for_writable_endpoint() {
        let (tx, rx) = watch::channel(TopologyDescription::default());
        let mut cluster = MockClusterHandle::new();
        cluster.expect_topology().returning(move || rx.clone());
        let cluster: Arc<dyn ClusterHandle> = Arc::new(cluster);

        let mut provider = MockClusterProvider::new();
        let connected = cluster.clone();
        provider.expect_connect().times(1).returning(move |_| Ok(connected.clone()));

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            let _ = tx.send(writable_topology());
            // Keep the sender alive until the environment has observed the change
            tokio::time::sleep(Duration::from_millis(200)).await;
        });

        let config = EnvironmentConfig::from_lookup(|_| None).unwrap();
        let environment = TestEnvironment::connect(config, Arc::new(provider)).await.unwrap();
        assert!(environment.sessions_supported());
        assert_eq!(environment.server_version().unwrap(), "7.0.2");
    }

    #[tokio::test]
    async fn test_connect_fails_without_writable_endpoint() {
        let (_tx, rx) = watch::channel(TopologyDescription::default());
        let mut cluster = MockClusterHandle::new();
        cluster.expect_topology().returning(move || rx.clone());
        cluster.expect_close().times(1).returning(|| Ok(()));
        let cluster: Arc<dyn ClusterHandle> = Arc::new(cluster);

        let mut provider = MockClusterProvider::new();
        provider.expect_connect().returning(move |_| Ok(cluster.clone()));

        let pairs = [("BACKEND_SERVER_SELECTION_TIMEOUT_MS", "50")];
        let config = EnvironmentConfig::from_lookup(lookup(&pairs)).unwrap();
        let result = TestEnvironment::connect(config, Arc::new(provider)).await;
        assert_matches!(
            result,
            Err(InterpreterError::Configuration { field, reason }) if field == "topology" && reason.contains("50ms")
        );
    }
}
