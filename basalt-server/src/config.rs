use basalt_core::{BasaltError, CoordinatorOptions, NodeAddr, NodeSpec, Result, StorageNodeOptions};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    pub bind_addr: String,
    pub data_dir: PathBuf,
    #[serde(default = "default_block_size")]
    pub block_size: u64,
    #[serde(default = "default_total_blocks")]
    pub total_blocks: u64,
    #[serde(default = "default_replica_count")]
    pub replica_count: usize,
    #[serde(default = "default_reservation_timeout_secs")]
    pub reservation_timeout_secs: u64,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    pub storage_nodes: Vec<StorageNodeEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageNodeEntry {
    pub host: String,
    pub port: u16,
    pub primary_capacity: u64,
    pub replica_capacity: u64,
}

fn default_block_size() -> u64 {
    4 * 1024 * 1024
}

fn default_total_blocks() -> u64 {
    1024
}

fn default_replica_count() -> usize {
    1
}

fn default_reservation_timeout_secs() -> u64 {
    300
}

fn default_sweep_interval_secs() -> u64 {
    60
}

impl CoordinatorConfig {
    pub fn from_file(path: &str) -> Result<Self> {
        let settings = ::config::Config::builder()
            .add_source(::config::File::with_name(path))
            .add_source(::config::Environment::with_prefix("BASALT"))
            .build()
            .map_err(|e| BasaltError::Config(e.to_string()))?;

        let config: CoordinatorConfig = settings
            .try_deserialize()
            .map_err(|e| BasaltError::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.block_size == 0 {
            return Err(BasaltError::Config(
                "block_size must be at least 1".to_string(),
            ));
        }
        if self.total_blocks == 0 {
            return Err(BasaltError::Config(
                "total_blocks must be at least 1".to_string(),
            ));
        }
        if self.storage_nodes.is_empty() {
            return Err(BasaltError::Config(
                "at least one storage node must be configured".to_string(),
            ));
        }
        // Each block lands on replica_count nodes besides its primary, all
        // distinct.
        if self.replica_count + 1 > self.storage_nodes.len() {
            return Err(BasaltError::Config(format!(
                "replica_count {} requires {} distinct nodes but only {} are configured",
                self.replica_count,
                self.replica_count + 1,
                self.storage_nodes.len()
            )));
        }
        Ok(())
    }

    pub fn into_options(self) -> CoordinatorOptions {
        CoordinatorOptions {
            bind_addr: self.bind_addr,
            data_dir: self.data_dir,
            block_size: self.block_size,
            total_blocks: self.total_blocks,
            replica_count: self.replica_count,
            reservation_timeout: Duration::from_secs(self.reservation_timeout_secs),
            sweep_interval: Duration::from_secs(self.sweep_interval_secs),
            storage_nodes: self
                .storage_nodes
                .into_iter()
                .map(|node| NodeSpec {
                    addr: NodeAddr::new(node.host, node.port),
                    primary_capacity: node.primary_capacity,
                    replica_capacity: node.replica_capacity,
                })
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub bind_addr: String,
    pub storage_root: PathBuf,
    #[serde(default = "default_recv_timeout_secs")]
    pub recv_timeout_secs: u64,
}

fn default_recv_timeout_secs() -> u64 {
    30
}

impl NodeConfig {
    pub fn from_file(path: &str) -> Result<Self> {
        let settings = ::config::Config::builder()
            .add_source(::config::File::with_name(path))
            .add_source(::config::Environment::with_prefix("BASALT"))
            .build()
            .map_err(|e| BasaltError::Config(e.to_string()))?;

        let config: NodeConfig = settings
            .try_deserialize()
            .map_err(|e| BasaltError::Config(e.to_string()))?;

        if config.recv_timeout_secs == 0 {
            return Err(BasaltError::Config(
                "recv_timeout_secs must be at least 1".to_string(),
            ));
        }
        Ok(config)
    }

    pub fn into_options(self) -> StorageNodeOptions {
        StorageNodeOptions {
            bind_addr: self.bind_addr,
            storage_root: self.storage_root,
            recv_timeout: Duration::from_secs(self.recv_timeout_secs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(dir: &tempfile::TempDir, name: &str, contents: &str) -> String {
        let path = dir.path().join(name);
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        path.to_str().unwrap().to_string()
    }

    #[test]
    fn test_coordinator_config_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            &dir,
            "coordinator.yaml",
            r#"
bind_addr: "127.0.0.1:7000"
data_dir: "/var/lib/basalt"
storage_nodes:
  - host: "127.0.0.1"
    port: 7100
    primary_capacity: 512
    replica_capacity: 512
  - host: "127.0.0.1"
    port: 7101
    primary_capacity: 512
    replica_capacity: 512
"#,
        );

        let config = CoordinatorConfig::from_file(&path).unwrap();
        assert_eq!(config.block_size, 4 * 1024 * 1024);
        assert_eq!(config.total_blocks, 1024);
        assert_eq!(config.replica_count, 1);
        assert_eq!(config.reservation_timeout_secs, 300);
        assert_eq!(config.sweep_interval_secs, 60);

        let options = config.into_options();
        assert_eq!(options.storage_nodes.len(), 2);
        assert_eq!(options.storage_nodes[0].addr.to_string(), "127.0.0.1:7100");
        assert_eq!(options.reservation_timeout, Duration::from_secs(300));
    }

    #[test]
    fn test_replica_count_needs_enough_nodes() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            &dir,
            "coordinator.yaml",
            r#"
bind_addr: "127.0.0.1:7000"
data_dir: "/var/lib/basalt"
replica_count: 2
storage_nodes:
  - host: "127.0.0.1"
    port: 7100
    primary_capacity: 512
    replica_capacity: 512
"#,
        );

        assert!(CoordinatorConfig::from_file(&path).is_err());
    }

    #[test]
    fn test_node_config_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            &dir,
            "storage_node.yaml",
            r#"
bind_addr: "127.0.0.1:7100"
storage_root: "/var/lib/basalt/blocks"
"#,
        );

        let config = NodeConfig::from_file(&path).unwrap();
        assert_eq!(config.recv_timeout_secs, 30);
        assert_eq!(
            config.into_options().recv_timeout,
            Duration::from_secs(30)
        );
    }
}
