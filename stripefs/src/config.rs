//! Configuration for the two daemons.
//!
//! Files are YAML/TOML/JSON (whatever the `config` crate recognizes by
//! extension); every field has a default so a minimal file only names
//! the storage hosts and the proxy.

use serde_derive::{Deserialize, Serialize};

use crate::block::DEFAULT_BLOCK_SIZE;
use crate::error::{Error, SResult};
use crate::worker::cache::EvictionPolicy;

/// Storage backends a worker can be launched with. Only `ssbd` (the
/// stripefs block plane) is part of the core; the legacy tags are still
/// recognized so old launch configs fail with a clear message instead
/// of a parse error.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageType {
    Ssbd,
    Cassandra,
    Swift,
}

/// One storage node endpoint.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HostPort {
    pub host: String,
    pub port: u16,
}

fn default_storage_type() -> StorageType {
    StorageType::Ssbd
}
fn default_replication_size() -> u32 {
    3
}
fn default_block_size() -> u32 {
    DEFAULT_BLOCK_SIZE
}
fn default_cache_size() -> u64 {
    64 * 1024 * 1024
}
fn default_cache_policy() -> String {
    "LRU".to_string()
}
fn default_proxy_port() -> u16 {
    12000
}
fn default_idle_timeout_ms() -> u64 {
    10_000
}
fn default_listen_port() -> u16 {
    2000
}
fn default_max_pending_jobs() -> usize {
    512
}

/// Options recognized at worker launch.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WorkerConfig {
    #[serde(default = "default_storage_type")]
    pub storage_type: StorageType,

    /// Storage nodes used for striping.
    #[serde(default)]
    pub hosts: Vec<HostPort>,

    /// Replicas per block, primary included.
    #[serde(default = "default_replication_size")]
    pub replication_size: u32,

    /// Bytes per block; must match the nodes' configured block size.
    #[serde(default = "default_block_size")]
    pub block_size: u32,

    #[serde(default)]
    pub cache_enabled: bool,

    /// Byte budget for cache eviction.
    #[serde(default = "default_cache_size")]
    pub cache_size: u64,

    /// `LRU`, `FIFO`, or `NONE`.
    #[serde(default = "default_cache_policy")]
    pub cache_policy: String,

    /// Where the worker registers.
    #[serde(default)]
    pub proxy_host: Option<String>,

    #[serde(default = "default_proxy_port")]
    pub proxy_port: u16,

    /// Default keepalive deadline, until the proxy overrides it.
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,

    /// Port of the worker's own client-facing listener.
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,

    /// In-flight job limit before the worker sheds load by closing its
    /// control channel.
    #[serde(default = "default_max_pending_jobs")]
    pub max_pending_jobs: usize,

    /// Overall worker lifetime in milliseconds; 0 disables the limit.
    #[serde(default)]
    pub lifetime_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        WorkerConfig {
            storage_type: default_storage_type(),
            hosts: Vec::new(),
            replication_size: default_replication_size(),
            block_size: default_block_size(),
            cache_enabled: false,
            cache_size: default_cache_size(),
            cache_policy: default_cache_policy(),
            proxy_host: None,
            proxy_port: default_proxy_port(),
            idle_timeout_ms: default_idle_timeout_ms(),
            listen_port: default_listen_port(),
            max_pending_jobs: default_max_pending_jobs(),
            lifetime_ms: 0,
        }
    }
}

impl WorkerConfig {
    /// Loads and validates a config file.
    pub fn load(path: &str) -> SResult<Self> {
        let cfg: WorkerConfig = config::Config::builder()
            .add_source(config::File::with_name(path))
            .build()
            .map_err(|e| Error::Value(e.to_string()))?
            .try_deserialize()
            .map_err(|e| Error::Value(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> SResult<()> {
        if self.storage_type != StorageType::Ssbd {
            return Err(Error::Value(format!(
                "storage type {:?} is not available in this build; use ssbd",
                self.storage_type
            )));
        }
        if self.hosts.is_empty() {
            return Err(Error::Value("at least one storage host is required".to_string()));
        }
        if self.replication_size < 1 {
            return Err(Error::Value("replication_size must be at least 1".to_string()));
        }
        if self.block_size == 0 || self.block_size > u16::MAX as u32 + 1 {
            return Err(Error::Value(format!(
                "block_size {} must be in 1..={}",
                self.block_size,
                u16::MAX as u32 + 1
            )));
        }
        self.policy()?;
        Ok(())
    }

    pub fn policy(&self) -> SResult<EvictionPolicy> {
        EvictionPolicy::from_tag(&self.cache_policy)
    }
}

fn default_node_port() -> u16 {
    12000
}
fn default_db_path() -> String {
    "/tmp/stripefs/blocks.db".to_string()
}
fn default_compact_ratio() -> f64 {
    0.2
}

/// Options recognized at storage-node launch.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NodeConfig {
    #[serde(default = "default_node_port")]
    pub listen_port: u16,

    /// Block database file.
    #[serde(default = "default_db_path")]
    pub db_path: String,

    #[serde(default = "default_block_size")]
    pub block_size: u32,

    /// Garbage ratio that triggers compaction at startup.
    #[serde(default = "default_compact_ratio")]
    pub compact_ratio: f64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        NodeConfig {
            listen_port: default_node_port(),
            db_path: default_db_path(),
            block_size: default_block_size(),
            compact_ratio: default_compact_ratio(),
        }
    }
}

impl NodeConfig {
    pub fn load(path: &str) -> SResult<Self> {
        config::Config::builder()
            .add_source(config::File::with_name(path))
            .build()
            .map_err(|e| Error::Value(e.to_string()))?
            .try_deserialize()
            .map_err(|e| Error::Value(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_hold() {
        let cfg = WorkerConfig::default();
        assert_eq!(cfg.storage_type, StorageType::Ssbd);
        assert_eq!(cfg.replication_size, 3);
        assert_eq!(cfg.block_size, DEFAULT_BLOCK_SIZE);
        assert_eq!(cfg.cache_policy, "LRU");
        assert!(!cfg.cache_enabled);
    }

    #[test]
    fn load_worker_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("worker.yaml");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(
            f,
            "storage_type: ssbd\n\
             hosts:\n\
             - host: 127.0.0.1\n\
             \x20 port: 12000\n\
             - host: 127.0.0.1\n\
             \x20 port: 12001\n\
             replication_size: 2\n\
             cache_enabled: true\n\
             cache_policy: FIFO\n\
             proxy_host: 127.0.0.1\n\
             proxy_port: 13000\n\
             idle_timeout_ms: 5000"
        )
        .unwrap();

        let cfg = WorkerConfig::load(path.to_str().unwrap()).unwrap();
        assert_eq!(cfg.hosts.len(), 2);
        assert_eq!(cfg.hosts[1].port, 12001);
        assert_eq!(cfg.replication_size, 2);
        assert!(cfg.cache_enabled);
        assert_eq!(cfg.policy().unwrap(), EvictionPolicy::Fifo);
        assert_eq!(cfg.idle_timeout_ms, 5000);
    }

    #[test]
    fn legacy_backends_are_rejected() {
        let mut cfg = WorkerConfig {
            hosts: vec![HostPort { host: "h".to_string(), port: 1 }],
            ..WorkerConfig::default()
        };
        cfg.storage_type = StorageType::Cassandra;
        assert!(cfg.validate().is_err());
        cfg.storage_type = StorageType::Swift;
        assert!(cfg.validate().is_err());
        cfg.storage_type = StorageType::Ssbd;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn validation_catches_bad_values() {
        let good = WorkerConfig {
            hosts: vec![HostPort { host: "h".to_string(), port: 1 }],
            ..WorkerConfig::default()
        };
        assert!(good.validate().is_ok());

        let mut cfg = good.clone();
        cfg.hosts.clear();
        assert!(cfg.validate().is_err());

        let mut cfg = good.clone();
        cfg.replication_size = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = good.clone();
        cfg.block_size = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = good;
        cfg.cache_policy = "MRU".to_string();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn node_defaults() {
        let cfg = NodeConfig::default();
        assert_eq!(cfg.listen_port, 12000);
        assert_eq!(cfg.block_size, DEFAULT_BLOCK_SIZE);
        assert!(cfg.compact_ratio > 0.0);
    }
}
