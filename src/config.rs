//! Configuration file support for the Peridot node.
//!
//! Loads optional `peridot.toml` from the data directory. CLI flags override
//! config file values; missing files fall back to defaults.

use serde::Deserialize;
use std::net::SocketAddr;
use std::path::Path;

use crate::constants;

/// Top-level configuration.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct PeridotConfig {
    pub node: NodeSection,
}

/// Node configuration section.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct NodeSection {
    pub p2p_host: String,
    pub p2p_port: u16,
    /// Port advertised to peers; zero disables back-ping promotion.
    pub external_port: u16,
    pub rpc_host: String,
    pub rpc_port: u16,
    pub data_dir: String,
    /// Connect exclusively to these peers when non-empty.
    pub exclusive_peers: Vec<String>,
    pub seed_nodes: Vec<String>,
    pub connections_count: usize,
    pub testnet: bool,
}

impl Default for NodeSection {
    fn default() -> Self {
        NodeSection {
            p2p_host: "0.0.0.0".into(),
            p2p_port: constants::P2P_DEFAULT_PORT,
            external_port: 0,
            rpc_host: "127.0.0.1".into(),
            rpc_port: constants::RPC_DEFAULT_PORT,
            data_dir: "./peridot-data".into(),
            exclusive_peers: vec![],
            seed_nodes: constants::SEED_NODES.iter().map(|s| s.to_string()).collect(),
            connections_count: constants::P2P_CONNECTIONS_COUNT,
            testnet: false,
        }
    }
}

impl PeridotConfig {
    /// Load configuration from `peridot.toml` in the given directory.
    /// Returns defaults if the file doesn't exist or fails to parse.
    pub fn load(data_dir: &Path) -> Self {
        let config_path = data_dir.join("peridot.toml");
        match std::fs::read_to_string(&config_path) {
            Ok(contents) => match toml::from_str(&contents) {
                Ok(config) => {
                    tracing::info!("loaded config from {}", config_path.display());
                    config
                }
                Err(e) => {
                    tracing::warn!(
                        "failed to parse {}: {}, using defaults",
                        config_path.display(),
                        e
                    );
                    Self::default()
                }
            },
            Err(_) => Self::default(),
        }
    }

    pub fn p2p_listen_addr(&self) -> Option<SocketAddr> {
        format!("{}:{}", self.node.p2p_host, self.node.p2p_port)
            .parse()
            .ok()
    }

    pub fn rpc_listen_addr(&self) -> Option<SocketAddr> {
        format!("{}:{}", self.node.rpc_host, self.node.rpc_port)
            .parse()
            .ok()
    }

    pub fn parse_exclusive_peers(&self) -> Vec<SocketAddr> {
        self.node
            .exclusive_peers
            .iter()
            .filter_map(|s| s.parse().ok())
            .collect()
    }

    pub fn parse_seed_nodes(&self) -> Vec<SocketAddr> {
        self.node
            .seed_nodes
            .iter()
            .filter_map(|s| s.parse().ok())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_valid() {
        let config = PeridotConfig::default();
        assert_eq!(config.node.p2p_port, constants::P2P_DEFAULT_PORT);
        assert_eq!(config.node.rpc_port, constants::RPC_DEFAULT_PORT);
        assert!(!config.node.testnet);
        assert!(config.p2p_listen_addr().is_some());
    }

    #[test]
    fn parse_toml_config() {
        let toml_str = r#"
[node]
p2p_port = 9999
rpc_host = "0.0.0.0"
exclusive_peers = ["1.2.3.4:16000", "5.6.7.8:16000"]
testnet = true
"#;
        let config: PeridotConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.node.p2p_port, 9999);
        assert_eq!(config.node.rpc_host, "0.0.0.0");
        assert_eq!(config.node.exclusive_peers.len(), 2);
        assert!(config.node.testnet);
    }

    #[test]
    fn missing_config_returns_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = PeridotConfig::load(dir.path());
        assert_eq!(config.node.p2p_port, constants::P2P_DEFAULT_PORT);
    }

    #[test]
    fn bad_peer_addresses_filtered() {
        let mut config = PeridotConfig::default();
        config.node.exclusive_peers = vec!["1.2.3.4:16000".into(), "bad-addr".into()];
        assert_eq!(config.parse_exclusive_peers().len(), 1);
    }
}
