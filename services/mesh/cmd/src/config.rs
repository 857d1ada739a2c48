//! Configuration handling for the emberlink node.
//!
//! Settings come from a YAML config file, overridden by `EMBER_*`
//! environment variables, overridden in turn by CLI arguments in main.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{info, warn};

/// Per-service relay toggles
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceToggles {
    /// Accept signed-transaction broadcast jobs
    pub tx_broadcast: bool,
    /// Accept Cashu token relay jobs
    pub cashu_relay: bool,
    /// Accept Cashu token redemption jobs
    pub cashu_redeem: bool,
    /// Accept payment forwarding jobs
    pub payment_forward: bool,
    /// Accept chunk republish jobs
    pub chunk_reassembly: bool,
}

impl Default for ServiceToggles {
    fn default() -> Self {
        Self {
            tx_broadcast: true,
            cashu_relay: true,
            cashu_redeem: true,
            payment_forward: true,
            chunk_reassembly: true,
        }
    }
}

/// Emberlink node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmberConfig {
    /// Node id on the mesh
    pub node_id: u64,
    /// Operating mode: "client" or "gateway"
    pub mode: String,
    /// Backbone topic prefix
    pub topic_prefix: String,
    /// Starting hop budget for originated messages
    pub default_ttl: u8,
    /// Seconds to wait for an ACK before each retry
    pub ack_timeout_secs: u64,
    /// Retry budget for acked sends
    pub ack_max_retries: u32,
    /// Storage backend: "memory" or "file"
    pub storage_mode: String,
    /// Data directory for file storage
    pub data_dir: String,
    /// Fsync frequency for file storage
    pub fsync_every: u32,
    /// Per-service gateway toggles
    pub services: ServiceToggles,
}

impl Default for EmberConfig {
    fn default() -> Self {
        Self {
            node_id: 1001,
            mode: "client".to_string(),
            topic_prefix: "ember".to_string(),
            default_ttl: 7,
            ack_timeout_secs: 30,
            ack_max_retries: 3,
            storage_mode: "memory".to_string(),
            data_dir: "./emberdata".to_string(),
            fsync_every: 1,
            services: ServiceToggles::default(),
        }
    }
}

impl EmberConfig {
    /// Load configuration from a YAML file and apply environment overrides.
    pub fn load_from_file<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let mut config = Self::default();

        if let Ok(content) = std::fs::read_to_string(&config_path) {
            match serde_yaml::from_str::<EmberConfig>(&content) {
                Ok(parsed) => {
                    config = parsed;
                    info!("loaded configuration from {:?}", config_path.as_ref());
                }
                Err(e) => {
                    warn!(
                        "failed to parse config file {:?} ({e}), using defaults",
                        config_path.as_ref()
                    );
                }
            }
        } else {
            warn!(
                "config file {:?} not found, using defaults",
                config_path.as_ref()
            );
        }

        config.apply_environment_overrides();

        info!(
            "node configuration: node_id={}, mode={}, storage={}, ttl={}",
            config.node_id, config.mode, config.storage_mode, config.default_ttl
        );
        Ok(config)
    }

    /// Apply `EMBER_*` environment variable overrides.
    fn apply_environment_overrides(&mut self) {
        if let Ok(node_id) = std::env::var("EMBER_NODE_ID") {
            if let Ok(id) = node_id.parse::<u64>() {
                self.node_id = id;
                info!("node id overridden by environment: {id}");
            }
        }
        if let Ok(mode) = std::env::var("EMBER_MODE") {
            self.mode = mode;
            info!("mode overridden by environment: {}", self.mode);
        }
        if let Ok(data_dir) = std::env::var("EMBER_DATA_DIR") {
            self.data_dir = data_dir;
            info!("data dir overridden by environment: {}", self.data_dir);
        }
        if let Ok(prefix) = std::env::var("EMBER_TOPIC_PREFIX") {
            self.topic_prefix = prefix;
            info!("topic prefix overridden by environment: {}", self.topic_prefix);
        }
    }

    /// Whether the node runs as a gateway.
    pub fn is_gateway(&self) -> bool {
        self.mode.eq_ignore_ascii_case("gateway")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = EmberConfig::default();
        assert_eq!(config.node_id, 1001);
        assert!(!config.is_gateway());
        assert_eq!(config.default_ttl, 7);
        assert!(config.services.cashu_relay);
    }

    #[test]
    fn test_load_from_file() {
        let yaml = r#"
node_id: 2002
mode: gateway
topic_prefix: testmesh
default_ttl: 5
storage_mode: file
data_dir: /tmp/ember-test
services:
  tx_broadcast: true
  cashu_relay: true
  cashu_redeem: false
  payment_forward: false
  chunk_reassembly: true
"#;
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(yaml.as_bytes()).unwrap();

        let config = EmberConfig::load_from_file(file.path()).unwrap();
        assert_eq!(config.node_id, 2002);
        assert!(config.is_gateway());
        assert_eq!(config.topic_prefix, "testmesh");
        assert_eq!(config.default_ttl, 5);
        assert_eq!(config.storage_mode, "file");
        assert!(!config.services.cashu_redeem);
        assert!(config.services.tx_broadcast);
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let config = EmberConfig::load_from_file("/definitely/not/here.yaml").unwrap();
        assert_eq!(config.node_id, 1001);
    }
}
