//! WolfSync Configuration
//!
//! Cluster topology, service ports, network retry policy and failover
//! policy. The configuration is loaded once and handed to the coordinator
//! as an immutable snapshot at session start.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

use crate::protocol::ServiceKind;
use crate::state::OperationMode;

/// Main WolfSync configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Node that starts the session as primary
    pub primary_node_id: String,

    /// Operation mode for the session
    #[serde(default)]
    pub operation_mode: OperationMode,

    /// Cluster nodes
    pub nodes: Vec<NodeConfig>,

    /// Service ports (shared by all nodes)
    #[serde(default)]
    pub ports: PortsConfig,

    /// Network retry and timeout configuration
    #[serde(default)]
    pub network: NetworkConfig,

    /// Failover configuration
    #[serde(default)]
    pub failover: FailoverConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// A single render node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Unique node identifier
    pub id: String,

    /// Host the node's services bind to and peers connect to
    pub host: String,
}

/// Per-service TCP ports
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortsConfig {
    #[serde(default = "default_port_cluster_sync")]
    pub cluster_sync: u16,

    #[serde(default = "default_port_render_sync")]
    pub render_sync: u16,

    #[serde(default = "default_port_events_json")]
    pub events_json: u16,

    #[serde(default = "default_port_events_binary")]
    pub events_binary: u16,

    #[serde(default = "default_port_generic_barrier")]
    pub generic_barrier: u16,

    #[serde(default = "default_port_internal_comm")]
    pub internal_comm: u16,
}

/// Network configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Number of client connection attempts before giving up
    #[serde(default = "default_connect_retries")]
    pub connect_retries: u32,

    /// Delay between client connection attempts in milliseconds
    #[serde(default = "default_connect_retry_delay_ms")]
    pub connect_retry_delay_ms: u64,

    /// Number of server bind attempts before giving up
    #[serde(default = "default_bind_retries")]
    pub bind_retries: u32,

    /// Delay between server bind attempts in milliseconds
    #[serde(default = "default_bind_retry_delay_ms")]
    pub bind_retry_delay_ms: u64,

    /// Connect timeout for a single attempt in milliseconds
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Upper bound for a single request round trip in milliseconds
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Game start barrier timeout in milliseconds
    #[serde(default = "default_game_start_barrier_timeout_ms")]
    pub game_start_barrier_timeout_ms: u64,

    /// Frame start barrier timeout in milliseconds
    #[serde(default = "default_frame_barrier_timeout_ms")]
    pub frame_start_barrier_timeout_ms: u64,

    /// Frame end barrier timeout in milliseconds
    #[serde(default = "default_frame_barrier_timeout_ms")]
    pub frame_end_barrier_timeout_ms: u64,

    /// Render sync barrier timeout in milliseconds
    #[serde(default = "default_frame_barrier_timeout_ms")]
    pub render_sync_barrier_timeout_ms: u64,

    /// Timeout used for generic barriers created without an explicit one
    #[serde(default = "default_frame_barrier_timeout_ms")]
    pub generic_barrier_timeout_ms: u64,
}

/// Failover policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FailoverPolicy {
    /// Any node failure terminates the cluster
    #[default]
    Disabled,
    /// Secondary failures are tolerated, a primary failure is fatal
    DropSecondaries,
    /// Secondary failures are tolerated, a primary failure triggers election
    Failover,
}

impl std::fmt::Display for FailoverPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailoverPolicy::Disabled => write!(f, "disabled"),
            FailoverPolicy::DropSecondaries => write!(f, "drop_secondaries"),
            FailoverPolicy::Failover => write!(f, "failover"),
        }
    }
}

/// Failover configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailoverConfig {
    /// What to do when a node fails
    #[serde(default)]
    pub policy: FailoverPolicy,

    /// Time the new primary waits for every survivor's recovery state
    #[serde(default = "default_negotiation_timeout_ms")]
    pub negotiation_timeout_ms: u64,

    /// How many recoveries a single transaction may go through before failing
    #[serde(default = "default_transaction_retries")]
    pub transaction_retries: u32,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, json)
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_port_cluster_sync() -> u16 {
    41001
}

fn default_port_render_sync() -> u16 {
    41002
}

fn default_port_events_json() -> u16 {
    41003
}

fn default_port_events_binary() -> u16 {
    41004
}

fn default_port_generic_barrier() -> u16 {
    41005
}

fn default_port_internal_comm() -> u16 {
    41006
}

fn default_connect_retries() -> u32 {
    15
}

fn default_connect_retry_delay_ms() -> u64 {
    1000
}

fn default_bind_retries() -> u32 {
    5
}

fn default_bind_retry_delay_ms() -> u64 {
    500
}

fn default_connect_timeout_ms() -> u64 {
    2000
}

fn default_request_timeout_ms() -> u64 {
    // Barrier calls block inside the request, so this must outlive them
    120_000
}

fn default_game_start_barrier_timeout_ms() -> u64 {
    30_000
}

fn default_frame_barrier_timeout_ms() -> u64 {
    5_000
}

fn default_negotiation_timeout_ms() -> u64 {
    10_000
}

fn default_transaction_retries() -> u32 {
    3
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for PortsConfig {
    fn default() -> Self {
        Self {
            cluster_sync: default_port_cluster_sync(),
            render_sync: default_port_render_sync(),
            events_json: default_port_events_json(),
            events_binary: default_port_events_binary(),
            generic_barrier: default_port_generic_barrier(),
            internal_comm: default_port_internal_comm(),
        }
    }
}

impl PortsConfig {
    /// Port assigned to a service
    pub fn port(&self, service: ServiceKind) -> u16 {
        match service {
            ServiceKind::ClusterSync => self.cluster_sync,
            ServiceKind::RenderSync => self.render_sync,
            ServiceKind::EventsJson => self.events_json,
            ServiceKind::EventsBinary => self.events_binary,
            ServiceKind::GenericBarrier => self.generic_barrier,
            ServiceKind::InternalComm => self.internal_comm,
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            connect_retries: default_connect_retries(),
            connect_retry_delay_ms: default_connect_retry_delay_ms(),
            bind_retries: default_bind_retries(),
            bind_retry_delay_ms: default_bind_retry_delay_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            game_start_barrier_timeout_ms: default_game_start_barrier_timeout_ms(),
            frame_start_barrier_timeout_ms: default_frame_barrier_timeout_ms(),
            frame_end_barrier_timeout_ms: default_frame_barrier_timeout_ms(),
            render_sync_barrier_timeout_ms: default_frame_barrier_timeout_ms(),
            generic_barrier_timeout_ms: default_frame_barrier_timeout_ms(),
        }
    }
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            policy: FailoverPolicy::default(),
            negotiation_timeout_ms: default_negotiation_timeout_ms(),
            transaction_retries: default_transaction_retries(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl ClusterConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load configuration from a TOML string
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: ClusterConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.nodes.is_empty() {
            return Err(crate::Error::Config("at least one node is required".into()));
        }

        let mut ids = HashSet::new();
        for node in &self.nodes {
            if node.id.is_empty() {
                return Err(crate::Error::Config("node id cannot be empty".into()));
            }
            if node.host.is_empty() {
                return Err(crate::Error::Config(format!(
                    "node '{}' has an empty host",
                    node.id
                )));
            }
            if !ids.insert(node.id.as_str()) {
                return Err(crate::Error::Config(format!("duplicate node id '{}'", node.id)));
            }
        }

        if self.primary_node_id.is_empty() {
            return Err(crate::Error::Config("primary_node_id cannot be empty".into()));
        }
        if !ids.contains(self.primary_node_id.as_str()) {
            return Err(crate::Error::Config(format!(
                "primary node '{}' is not part of the topology",
                self.primary_node_id
            )));
        }

        let mut ports = HashSet::new();
        for service in ServiceKind::ALL {
            let port = self.ports.port(service);
            if port == 0 {
                return Err(crate::Error::Config(format!("port for {} cannot be 0", service)));
            }
            if !ports.insert(port) {
                return Err(crate::Error::Config(format!(
                    "port {} is assigned to more than one service",
                    port
                )));
            }
        }

        // A barrier call blocks inside one request; a request timeout shorter
        // than the barrier would fail a primary that is only late
        let network = &self.network;
        let longest_wait = [
            ("game_start_barrier_timeout_ms", network.game_start_barrier_timeout_ms),
            ("frame_start_barrier_timeout_ms", network.frame_start_barrier_timeout_ms),
            ("frame_end_barrier_timeout_ms", network.frame_end_barrier_timeout_ms),
            ("render_sync_barrier_timeout_ms", network.render_sync_barrier_timeout_ms),
            ("generic_barrier_timeout_ms", network.generic_barrier_timeout_ms),
            ("negotiation_timeout_ms", self.failover.negotiation_timeout_ms),
        ]
        .into_iter()
        .max_by_key(|(_, ms)| *ms);

        if let Some((name, ms)) = longest_wait {
            if network.request_timeout_ms <= ms {
                return Err(crate::Error::Config(format!(
                    "request_timeout_ms ({}) must exceed {} ({})",
                    network.request_timeout_ms, name, ms
                )));
            }
        }

        Ok(())
    }

    /// Look up a node by id
    pub fn node(&self, id: &str) -> Option<&NodeConfig> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// All node ids in configuration order
    pub fn node_ids(&self) -> Vec<String> {
        self.nodes.iter().map(|n| n.id.clone()).collect()
    }

    /// Address of a node's service (host:port)
    pub fn service_address(&self, node_id: &str, service: ServiceKind) -> Option<String> {
        self.node(node_id)
            .map(|n| format!("{}:{}", n.host, self.ports.port(service)))
    }

    /// Failover policy in effect for the configured operation mode
    pub fn effective_failover_policy(&self) -> FailoverPolicy {
        match self.operation_mode {
            OperationMode::Cluster => self.failover.policy,
            _ => FailoverPolicy::Disabled,
        }
    }

    /// Barrier timeout for a built-in barrier
    pub fn game_start_timeout(&self) -> Duration {
        Duration::from_millis(self.network.game_start_barrier_timeout_ms)
    }

    pub fn frame_start_timeout(&self) -> Duration {
        Duration::from_millis(self.network.frame_start_barrier_timeout_ms)
    }

    pub fn frame_end_timeout(&self) -> Duration {
        Duration::from_millis(self.network.frame_end_barrier_timeout_ms)
    }

    pub fn render_sync_timeout(&self) -> Duration {
        Duration::from_millis(self.network.render_sync_barrier_timeout_ms)
    }

    pub fn generic_barrier_timeout(&self) -> Duration {
        Duration::from_millis(self.network.generic_barrier_timeout_ms)
    }

    pub fn negotiation_timeout(&self) -> Duration {
        Duration::from_millis(self.failover.negotiation_timeout_ms)
    }

    pub fn connect_retry_delay(&self) -> Duration {
        Duration::from_millis(self.network.connect_retry_delay_ms)
    }

    pub fn bind_retry_delay(&self) -> Duration {
        Duration::from_millis(self.network.bind_retry_delay_ms)
    }

    /// Sample three node configuration used by `wolfsync init`
    pub fn sample() -> Self {
        Self {
            primary_node_id: "node-a".to_string(),
            operation_mode: OperationMode::Cluster,
            nodes: vec![
                NodeConfig { id: "node-a".into(), host: "127.0.0.1".into() },
                NodeConfig { id: "node-b".into(), host: "127.0.0.2".into() },
                NodeConfig { id: "node-c".into(), host: "127.0.0.3".into() },
            ],
            ports: PortsConfig::default(),
            network: NetworkConfig::default(),
            failover: FailoverConfig {
                policy: FailoverPolicy::Failover,
                ..FailoverConfig::default()
            },
            logging: LoggingConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
primary_node_id = "node-a"
operation_mode = "cluster"

[[nodes]]
id = "node-a"
host = "10.0.0.1"

[[nodes]]
id = "node-b"
host = "10.0.0.2"

[[nodes]]
id = "node-c"
host = "10.0.0.3"

[network]
connect_retries = 3
connect_retry_delay_ms = 50

[failover]
policy = "failover"
"#;

    #[test]
    fn test_parse_config() {
        let config = ClusterConfig::from_str(SAMPLE).unwrap();
        assert_eq!(config.primary_node_id, "node-a");
        assert_eq!(config.nodes.len(), 3);
        assert_eq!(config.operation_mode, OperationMode::Cluster);
        assert_eq!(config.network.connect_retries, 3);
        assert_eq!(config.failover.policy, FailoverPolicy::Failover);
        assert_eq!(config.ports.cluster_sync, 41001);
        assert_eq!(
            config.service_address("node-b", ServiceKind::InternalComm).as_deref(),
            Some("10.0.0.2:41006")
        );
    }

    #[test]
    fn test_primary_must_exist() {
        let toml = SAMPLE.replace("primary_node_id = \"node-a\"", "primary_node_id = \"node-z\"");
        assert!(ClusterConfig::from_str(&toml).is_err());
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let toml = SAMPLE.replace("id = \"node-c\"", "id = \"node-b\"");
        assert!(ClusterConfig::from_str(&toml).is_err());
    }

    #[test]
    fn test_port_collision_rejected() {
        let toml = format!("{}\n[ports]\nrender_sync = 41001\n", SAMPLE);
        assert!(ClusterConfig::from_str(&toml).is_err());
    }

    #[test]
    fn test_request_timeout_must_outlive_barriers() {
        let toml = SAMPLE.replace(
            "connect_retries = 3",
            "connect_retries = 3\nrequest_timeout_ms = 300\ngame_start_barrier_timeout_ms = 5000",
        );
        let err = ClusterConfig::from_str(&toml).unwrap_err();
        assert!(err.to_string().contains("game_start_barrier_timeout_ms"), "{}", err);

        let mut config = ClusterConfig::sample();
        config.network.request_timeout_ms = config.failover.negotiation_timeout_ms;
        config.network.game_start_barrier_timeout_ms = 1_000;
        assert!(matches!(config.validate(), Err(crate::Error::Config(_))));

        config.network.request_timeout_ms += 1;
        config.validate().unwrap();
    }

    #[test]
    fn test_failover_forced_off_outside_cluster_mode() {
        let toml = SAMPLE.replace("operation_mode = \"cluster\"", "operation_mode = \"editor\"");
        let config = ClusterConfig::from_str(&toml).unwrap();
        assert_eq!(config.effective_failover_policy(), FailoverPolicy::Disabled);
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wolfsync.toml");
        std::fs::write(&path, SAMPLE).unwrap();

        let config = ClusterConfig::from_file(&path).unwrap();
        assert_eq!(config.node_ids(), vec!["node-a", "node-b", "node-c"]);
    }

    #[test]
    fn test_sample_is_valid() {
        let sample = ClusterConfig::sample();
        sample.validate().unwrap();
        let text = toml::to_string(&sample).unwrap();
        let parsed = ClusterConfig::from_str(&text).unwrap();
        assert_eq!(parsed.nodes.len(), 3);
    }
}
