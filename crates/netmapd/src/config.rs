//! Configuration for netmapd

use clap::Parser;
use netmap_core::types::{Bytes32, SecureHash};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// netmapd - network map synchronization daemon
#[derive(Parser, Debug, Clone)]
#[command(name = "netmapd")]
#[command(about = "Keeps a node's network map cache in sync with the network map and local node infos")]
pub struct Config {
    /// Base directory for the node database and network parameters files
    #[arg(short, long, env = "NETMAP_DATA_DIR", default_value = "./data/netmapd")]
    pub data_dir: PathBuf,

    /// Directory scanned for nodeInfo-* files (defaults to <data-dir>/additional-node-infos)
    #[arg(long, env = "NETMAP_NODE_INFO_DIR")]
    pub node_info_dir: Option<PathBuf>,

    /// Network map server address; omit to run with local node infos only
    #[arg(long, env = "NETMAP_NETWORK_MAP")]
    pub network_map: Option<SocketAddr>,

    /// Hex public key of the root that certifies the network map key
    #[arg(long, env = "NETMAP_TRUSTED_ROOT")]
    pub trusted_root: Option<String>,

    /// Timeout for each network map request in seconds
    #[arg(long, default_value = "30")]
    pub request_timeout_secs: u64,

    /// Node info directory scan interval in seconds
    #[arg(long, default_value = "5")]
    pub watcher_interval_secs: u64,

    /// Accept the parameters update with this hex hash once it is advertised;
    /// a failed acknowledgement is retried while the update stays pending
    #[arg(long, env = "NETMAP_ACCEPT_PARAMETERS")]
    pub accept_parameters: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Log format (json or pretty)
    #[arg(long, default_value = "pretty")]
    pub log_format: String,
}

impl Config {
    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.network_map.is_some() && self.trusted_root.is_none() {
            anyhow::bail!("--trusted-root is required when a network map is configured");
        }
        if self.accept_parameters.is_some() && self.network_map.is_none() {
            anyhow::bail!("--accept-parameters needs a network map to acknowledge to");
        }
        if self.request_timeout_secs == 0 {
            anyhow::bail!("Request timeout must be at least one second");
        }
        if self.watcher_interval_secs == 0 {
            anyhow::bail!("Watcher interval must be at least one second");
        }
        if !matches!(self.log_format.as_str(), "json" | "pretty") {
            anyhow::bail!("Unknown log format '{}', expected json or pretty", self.log_format);
        }
        self.trusted_root_key()?;
        self.accept_parameters_hash()?;
        Ok(())
    }

    /// Decoded trusted root key
    pub fn trusted_root_key(&self) -> anyhow::Result<Option<Bytes32>> {
        match &self.trusted_root {
            Some(hex_key) => {
                let bytes = hex::decode(hex_key)?;
                let key: Bytes32 = bytes
                    .try_into()
                    .map_err(|_| anyhow::anyhow!("Trusted root must be 32 bytes"))?;
                Ok(Some(key))
            }
            None => Ok(None),
        }
    }

    /// Decoded hash from `--accept-parameters`
    pub fn accept_parameters_hash(&self) -> anyhow::Result<Option<SecureHash>> {
        match &self.accept_parameters {
            Some(hex_hash) => SecureHash::from_hex(hex_hash)
                .map(Some)
                .ok_or_else(|| anyhow::anyhow!("Invalid parameters hash '{}'", hex_hash)),
            None => Ok(None),
        }
    }

    pub fn node_info_dir(&self) -> PathBuf {
        self.node_info_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("additional-node-infos"))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn watcher_interval(&self) -> Duration {
        Duration::from_secs(self.watcher_interval_secs)
    }
}

/// Persisted node state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeState {
    /// Node signing key seed, used to acknowledge parameters updates
    pub keypair_seed: [u8; 32],
}
