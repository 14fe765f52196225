//! Node configuration.
//!
//! One JSON file per node describes its identity, its peers, the quorum it
//! serves and the storage tuning. Cluster membership management beyond this
//! static list is the control plane's business.

use std::path::{Path, PathBuf};

use anyhow::{bail, format_err, Error};
use serde::{Deserialize, Serialize};

use silo_api_types::{NodeId, QuorumId, TrackId};
use silo_replication::{PeerAddress, TransportConfig};
use silo_storage::StorageConfig;

fn default_chunk_size() -> u64 {
    64 * 1024 * 1024
}

fn default_log_segment_size() -> u64 {
    64 * 1024 * 1024
}

fn default_page_cache_size() -> usize {
    256 * 1024 * 1024
}

fn default_num_job_threads() -> usize {
    2
}

fn default_archive_script() -> String {
    "$delete".to_string()
}

fn default_lease_duration_ms() -> u64 {
    silo_replication::DEFAULT_LEASE_DURATION_MS
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PeerConfig {
    pub node_id: NodeId,
    pub address: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeConfig {
    pub node_id: NodeId,
    pub listen_address: String,
    pub database_dir: PathBuf,
    pub quorum_id: QuorumId,
    /// All quorum members, including this node.
    pub peers: Vec<PeerConfig>,
    #[serde(default)]
    pub track_id: TrackId,
    #[serde(default = "default_lease_duration_ms")]
    pub lease_duration_ms: u64,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u64,
    #[serde(default = "default_log_segment_size")]
    pub log_segment_size: u64,
    #[serde(default = "default_page_cache_size")]
    pub page_cache_size: usize,
    #[serde(default = "default_num_job_threads")]
    pub num_job_threads: usize,
    #[serde(default = "default_archive_script")]
    pub archive_script: String,
}

impl NodeConfig {
    pub fn load(path: &Path) -> Result<Self, Error> {
        let file = std::fs::File::open(path)
            .map_err(|err| format_err!("unable to open config {:?} - {}", path, err))?;
        let config: NodeConfig = serde_json::from_reader(file)
            .map_err(|err| format_err!("unable to parse config {:?} - {}", path, err))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.node_id >= 1 << 16 {
            bail!("node id {} does not fit 16 bits", self.node_id);
        }
        if !self.peers.iter().any(|peer| peer.node_id == self.node_id) {
            bail!("node {} is not part of its own quorum", self.node_id);
        }
        if self.lease_duration_ms < 1000 {
            bail!("lease duration below 1s is unsafe");
        }
        Ok(())
    }

    pub fn storage_config(&self) -> StorageConfig {
        StorageConfig {
            env_path: self.database_dir.join("db"),
            chunk_size: self.chunk_size,
            log_segment_size: self.log_segment_size,
            page_cache_size: self.page_cache_size,
            num_job_threads: self.num_job_threads,
            archive_script: self.archive_script.clone(),
        }
    }

    pub fn replication_dir(&self) -> PathBuf {
        self.database_dir.join("replication")
    }

    pub fn transport_config(&self) -> TransportConfig {
        TransportConfig {
            node_id: self.node_id,
            listen_address: self.listen_address.clone(),
            peers: self
                .peers
                .iter()
                .filter(|peer| peer.node_id != self.node_id)
                .map(|peer| PeerAddress {
                    node_id: peer.node_id,
                    address: peer.address.clone(),
                })
                .collect(),
        }
    }

    pub fn quorum_nodes(&self) -> Vec<NodeId> {
        self.peers.iter().map(|peer| peer.node_id).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_validate() {
        let json = serde_json::json!({
            "node_id": 1,
            "listen_address": "127.0.0.1:7080",
            "database_dir": "/var/lib/silodb",
            "quorum_id": 1,
            "peers": [
                {"node_id": 1, "address": "127.0.0.1:7080"},
                {"node_id": 2, "address": "127.0.0.1:7081"},
                {"node_id": 3, "address": "127.0.0.1:7082"}
            ]
        });
        let config: NodeConfig = serde_json::from_value(json).unwrap();
        config.validate().unwrap();
        assert_eq!(config.lease_duration_ms, 7000);
        assert_eq!(config.chunk_size, 64 * 1024 * 1024);
        assert_eq!(config.transport_config().peers.len(), 2);
        assert_eq!(config.quorum_nodes(), vec![1, 2, 3]);
    }

    #[test]
    fn bad_configs_rejected() {
        let mut config = NodeConfig {
            node_id: 1,
            listen_address: "127.0.0.1:7080".into(),
            database_dir: "/tmp/x".into(),
            quorum_id: 1,
            peers: vec![PeerConfig {
                node_id: 1,
                address: "127.0.0.1:7080".into(),
            }],
            track_id: 0,
            lease_duration_ms: 7000,
            chunk_size: default_chunk_size(),
            log_segment_size: default_log_segment_size(),
            page_cache_size: default_page_cache_size(),
            num_job_threads: 2,
            archive_script: default_archive_script(),
        };
        config.validate().unwrap();

        config.node_id = 1 << 16;
        assert!(config.validate().is_err());

        config.node_id = 4;
        assert!(config.validate().is_err()); // not in own quorum
    }
}
