//! WolfCoord Configuration
//!
//! This module provides configuration structures for WolfCoord nodes and
//! the coordination store server.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::store::validate_path;

/// Main WolfCoord configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WolfCoordConfig {
    /// Node-specific configuration
    pub node: NodeConfig,

    /// Coordination store connection
    #[serde(default)]
    pub store: StoreConfig,

    /// Leader election paths
    #[serde(default = "default_election_group")]
    pub election: GroupConfig,

    /// Service registry paths
    #[serde(default = "default_registry_group")]
    pub registry: GroupConfig,

    /// Store server configuration (used by `serve`)
    #[serde(default)]
    pub server: ServerConfig,

    /// API configuration
    #[serde(default)]
    pub api: ApiConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Node-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Unique node identifier
    pub id: String,

    /// Address published to the service registry
    pub advertise_address: String,

    /// Volunteer and register again after the session is lost
    #[serde(default = "default_true")]
    pub rejoin: bool,

    /// Base delay before rejoining, in milliseconds (jittered)
    #[serde(default = "default_rejoin_delay_ms")]
    pub rejoin_delay_ms: u64,
}

/// Coordination store connection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Store server address
    #[serde(default = "default_store_address")]
    pub address: String,

    /// Session timeout in milliseconds
    #[serde(default = "default_session_timeout_ms")]
    pub session_timeout_ms: u64,

    /// Connection timeout in milliseconds
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

/// Root path and member prefix of a sequential group
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupConfig {
    /// Persistent root node
    pub root: String,

    /// Name prefix of member nodes
    pub prefix: String,
}

/// Store server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address to accept client sessions on
    #[serde(default = "default_server_address")]
    pub bind_address: String,
}

/// API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Enable HTTP API
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// HTTP API bind address
    #[serde(default = "default_api_address")]
    pub bind_address: String,

    /// Enable CORS
    #[serde(default)]
    pub cors_enabled: bool,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (full, compact)
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_true() -> bool {
    true
}

fn default_rejoin_delay_ms() -> u64 {
    1000
}

fn default_store_address() -> String {
    "127.0.0.1:2181".to_string()
}

fn default_session_timeout_ms() -> u64 {
    3000
}

fn default_connect_timeout_ms() -> u64 {
    5000
}

fn default_election_group() -> GroupConfig {
    GroupConfig {
        root: "/election".to_string(),
        prefix: "c_".to_string(),
    }
}

fn default_registry_group() -> GroupConfig {
    GroupConfig {
        root: "/service_registry".to_string(),
        prefix: "n_".to_string(),
    }
}

fn default_server_address() -> String {
    "0.0.0.0:2181".to_string()
}

fn default_api_address() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "full".to_string()
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            address: default_store_address(),
            session_timeout_ms: default_session_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_server_address(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_address: default_api_address(),
            cors_enabled: false,
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

impl GroupConfig {
    fn validate(&self, section: &str) -> crate::Result<()> {
        if validate_path(&self.root).is_err() || self.root == "/" {
            return Err(crate::Error::Config(format!(
                "{}.root must be an absolute path below /, got {:?}",
                section, self.root
            )));
        }
        if self.prefix.is_empty() || self.prefix.contains('/') {
            return Err(crate::Error::Config(format!(
                "{}.prefix must be non-empty and contain no '/'",
                section
            )));
        }
        Ok(())
    }
}

impl WolfCoordConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: WolfCoordConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML string
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: WolfCoordConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.node.id.is_empty() {
            return Err(crate::Error::Config("node.id cannot be empty".into()));
        }

        if self.node.advertise_address.is_empty() {
            return Err(crate::Error::Config("node.advertise_address cannot be empty".into()));
        }

        if self.store.address.is_empty() {
            return Err(crate::Error::Config("store.address cannot be empty".into()));
        }

        if self.store.session_timeout_ms == 0 {
            return Err(crate::Error::Config("store.session_timeout_ms must be positive".into()));
        }

        self.election.validate("election")?;
        self.registry.validate("registry")?;

        if self.election.root == self.registry.root {
            return Err(crate::Error::Config(
                "election.root and registry.root must differ".into(),
            ));
        }

        Ok(())
    }

    /// Get session timeout as Duration
    pub fn session_timeout(&self) -> Duration {
        Duration::from_millis(self.store.session_timeout_ms)
    }

    /// Get connection timeout as Duration
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.store.connect_timeout_ms)
    }

    /// Get base rejoin delay as Duration
    pub fn rejoin_delay(&self) -> Duration {
        Duration::from_millis(self.node.rejoin_delay_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_config() {
        let toml = r#"
[node]
id = "node-1"
advertise_address = "10.0.0.1:9000"

[store]
address = "zk-1:2181"
session_timeout_ms = 4000

[registry]
root = "/apps/registry"
prefix = "n_"
"#;

        let config = WolfCoordConfig::from_str(toml).unwrap();
        assert_eq!(config.node.id, "node-1");
        assert!(config.node.rejoin);
        assert_eq!(config.session_timeout(), Duration::from_millis(4000));
        assert_eq!(config.connect_timeout(), Duration::from_millis(5000));
        assert_eq!(config.election.root, "/election");
        assert_eq!(config.election.prefix, "c_");
        assert_eq!(config.registry.root, "/apps/registry");
        assert_eq!(config.logging.format, "full");
    }

    #[test]
    fn test_validation_rejects_bad_paths() {
        let base = r#"
[node]
id = "node-1"
advertise_address = "10.0.0.1:9000"
"#;
        let same_roots = format!("{}\n[registry]\nroot = \"/election\"\nprefix = \"n_\"\n", base);
        assert!(matches!(
            WolfCoordConfig::from_str(&same_roots),
            Err(crate::Error::Config(_))
        ));

        let relative = format!("{}\n[election]\nroot = \"election\"\nprefix = \"c_\"\n", base);
        assert!(WolfCoordConfig::from_str(&relative).is_err());

        let slash_prefix = format!("{}\n[election]\nroot = \"/election\"\nprefix = \"c/\"\n", base);
        assert!(WolfCoordConfig::from_str(&slash_prefix).is_err());
    }

    #[test]
    fn test_missing_node_id() {
        let toml = r#"
[node]
id = ""
advertise_address = "10.0.0.1:9000"
"#;
        assert!(WolfCoordConfig::from_str(toml).is_err());
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[node]\nid = \"node-2\"\nadvertise_address = \"10.0.0.2:9000\"").unwrap();

        let config = WolfCoordConfig::from_file(file.path()).unwrap();
        assert_eq!(config.node.id, "node-2");
        assert_eq!(config.store.address, "127.0.0.1:2181");
    }
}
