// Node configuration loaded from TOML

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::Address;
use crate::error::ConfigError;
use crate::network::NetworkType;

pub const DEFAULT_PORT: u16 = 7400;
pub const PROTOCOL_VERSION: u32 = 1;

/// Every field has a default, so a config file only lists what it changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub node_name: String,
    pub network: NetworkType,
    pub listen_address: String,
    pub port: u16,
    /// Peers dialed at startup, as `host:port`
    pub peers: Vec<String>,
    /// Maximum simultaneous connections, inbound and outbound together
    pub active_connections: usize,
    /// Capacity of the peer directory
    pub peer_record_limit: usize,
    /// Connect and handshake deadline
    pub connection_timeout_ms: u64,
    pub protocol_version: u32,
    /// Where blocks and peer records are kept. `None` keeps everything in memory.
    pub data_dir: Option<PathBuf>,
    /// Most mempool transactions packed into one mined block
    pub block_transaction_limit: usize,
    /// Coinbase recipient for mined blocks
    pub mining_address: Option<Address>,
    pub mining_reward: u64,
    pub peer_maintenance_interval_secs: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_name: "yggdrasil".to_string(),
            network: NetworkType::Main,
            listen_address: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            peers: Vec::new(),
            active_connections: 8,
            peer_record_limit: 256,
            connection_timeout_ms: 30_000,
            protocol_version: PROTOCOL_VERSION,
            data_dir: None,
            block_transaction_limit: 1000,
            mining_address: None,
            mining_reward: 0,
            peer_maintenance_interval_secs: 60,
        }
    }
}

impl NodeConfig {
    /// Read and validate a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml_str(&text)?;
        log::debug!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let checks = [
            (self.active_connections == 0, "active_connections must be at least 1"),
            (self.peer_record_limit == 0, "peer_record_limit must be at least 1"),
            (self.connection_timeout_ms == 0, "connection_timeout_ms must be positive"),
            (self.block_transaction_limit == 0, "block_transaction_limit must be at least 1"),
            (self.peer_maintenance_interval_secs == 0, "peer_maintenance_interval_secs must be positive"),
        ];
        match checks.iter().find(|(failed, _)| *failed) {
            Some((_, message)) => Err(ConfigError::Invalid(message.to_string())),
            None => Ok(()),
        }
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    pub fn peer_maintenance_interval(&self) -> Duration {
        Duration::from_secs(self.peer_maintenance_interval_secs)
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.listen_address, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = NodeConfig::default();
        assert_eq!(config.connection_timeout(), Duration::from_secs(30));
        assert_eq!(config.protocol_version, 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml() {
        let config = NodeConfig::from_toml_str(
            r#"
            node_name = "alpha"
            network = "test"
            port = 9001
            peers = ["127.0.0.1:9002"]
            mining_address = "abcdef"
            mining_reward = 500
            "#,
        )
        .unwrap();

        assert_eq!(config.node_name, "alpha");
        assert_eq!(config.network, NetworkType::Test);
        assert_eq!(config.port, 9001);
        assert_eq!(config.peers, vec!["127.0.0.1:9002".to_string()]);
        assert_eq!(config.mining_address, Some(Address::new("abcdef")));
        assert_eq!(config.active_connections, 8);
    }

    #[test]
    fn test_invalid_values() {
        let err = NodeConfig::from_toml_str("active_connections = 0").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));

        let err = NodeConfig::from_toml_str("port = \"eighty\"").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "peer_record_limit = 16").unwrap();

        let config = NodeConfig::load(file.path()).unwrap();
        assert_eq!(config.peer_record_limit, 16);

        assert!(matches!(
            NodeConfig::load("/definitely/not/here.toml"),
            Err(ConfigError::Read { .. })
        ));
    }
}
