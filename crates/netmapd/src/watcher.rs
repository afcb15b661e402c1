//! File-backed local membership source
//!
//! Node infos dropped into the node-info directory (by an operator or a
//! bootstrapper) join the local network map without the network map server.

use crate::storage::write_file_atomic;
use netmap_core::crypto::{node_info_hash, verify_node_info};
use netmap_core::types::*;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// File name prefix of node info files
pub const NODE_INFO_FILE_PREFIX: &str = "nodeInfo-";

/// Capacity of each subscription channel
const UPDATE_CHANNEL_CAPACITY: usize = 64;

/// Watcher errors
#[derive(Debug, Error)]
pub enum WatcherError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] postcard::Error),
    #[error("Invalid node info: {0}")]
    Invalid(#[from] netmap_core::Error),
}

/// Source of locally discovered membership entries
pub trait LocalMembershipSource: Send + Sync {
    /// Start a new notification sequence of entries.
    ///
    /// Each call begins from scratch; dropping the receiver ends the sequence.
    fn node_info_updates(&self) -> mpsc::Receiver<SignedNodeInfo>;

    /// Hashes of entries this source has produced
    fn processed_node_info_hashes(&self) -> HashSet<SecureHash>;
}

/// Polls a directory for `nodeInfo-*` files
pub struct NodeInfoWatcher {
    node_info_dir: PathBuf,
    poll_interval: Duration,
    processed: Arc<RwLock<HashSet<SecureHash>>>,
}

impl NodeInfoWatcher {
    pub fn new(node_info_dir: impl Into<PathBuf>, poll_interval: Duration) -> Self {
        Self {
            node_info_dir: node_info_dir.into(),
            poll_interval,
            processed: Arc::new(RwLock::new(HashSet::new())),
        }
    }

    /// Directory being watched
    pub fn node_info_dir(&self) -> &Path {
        &self.node_info_dir
    }

    /// Write a signed node info into `dir` under its content-addressed name
    pub fn save_to_file(dir: &Path, signed: &SignedNodeInfo) -> Result<PathBuf, WatcherError> {
        verify_node_info(signed)?;
        let path = dir.join(format!(
            "{}{}",
            NODE_INFO_FILE_PREFIX,
            node_info_hash(signed).to_hex()
        ));
        let bytes = postcard::to_allocvec(signed)?;
        write_file_atomic(&path, &bytes)?;
        Ok(path)
    }
}

impl LocalMembershipSource for NodeInfoWatcher {
    /// Must be called from within a tokio runtime.
    fn node_info_updates(&self) -> mpsc::Receiver<SignedNodeInfo> {
        let (tx, rx) = mpsc::channel(UPDATE_CHANNEL_CAPACITY);
        let mut scan = DirectoryScan {
            dir: self.node_info_dir.clone(),
            processed: self.processed.clone(),
            seen: HashSet::new(),
            rejected: HashMap::new(),
        };
        let poll_interval = self.poll_interval;

        tokio::spawn(async move {
            loop {
                for signed in scan.poll().await {
                    if tx.send(signed).await.is_err() {
                        debug!("Node info subscriber gone, stopping scan");
                        return;
                    }
                }
                tokio::select! {
                    _ = tokio::time::sleep(poll_interval) => {}
                    _ = tx.closed() => return,
                }
            }
        });

        rx
    }

    fn processed_node_info_hashes(&self) -> HashSet<SecureHash> {
        self.processed.read().clone()
    }
}

/// Per-subscription scan state
struct DirectoryScan {
    dir: PathBuf,
    processed: Arc<RwLock<HashSet<SecureHash>>>,
    /// Hashes already emitted on this subscription
    seen: HashSet<SecureHash>,
    /// Files that failed to load, by modification time
    rejected: HashMap<PathBuf, SystemTime>,
}

impl DirectoryScan {
    /// Load every new node info file in the directory
    async fn poll(&mut self) -> Vec<SignedNodeInfo> {
        let mut found = Vec::new();

        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) => {
                debug!("Cannot read node info directory {}: {}", self.dir.display(), e);
                return found;
            }
        };

        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    warn!("Error listing {}: {}", self.dir.display(), e);
                    break;
                }
            };
            let path = entry.path();
            let is_node_info = path
                .file_name()
                .and_then(|name| name.to_str())
                .map(|name| name.starts_with(NODE_INFO_FILE_PREFIX) && !name.contains(".tmp"))
                .unwrap_or(false);
            if !is_node_info {
                continue;
            }

            let modified = entry
                .metadata()
                .await
                .and_then(|m| m.modified())
                .unwrap_or(SystemTime::UNIX_EPOCH);
            if self.rejected.get(&path) == Some(&modified) {
                continue;
            }

            match load_node_info(&path).await {
                Ok(signed) => {
                    self.rejected.remove(&path);
                    let hash = node_info_hash(&signed);
                    if self.seen.insert(hash) {
                        self.processed.write().insert(hash);
                        info!("Found node info file {} ({:?})", path.display(), hash);
                        found.push(signed);
                    }
                }
                Err(e) => {
                    warn!("Ignoring node info file {}: {}", path.display(), e);
                    self.rejected.insert(path, modified);
                }
            }
        }

        found
    }
}

async fn load_node_info(path: &Path) -> Result<SignedNodeInfo, WatcherError> {
    let bytes = tokio::fs::read(path).await?;
    let signed: SignedNodeInfo = postcard::from_bytes(&bytes)?;
    verify_node_info(&signed)?;
    Ok(signed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use netmap_core::crypto::sign_node_info;
    use netmap_core::KeyPair;
    use tempfile::tempdir;

    fn node(seed: u8) -> SignedNodeInfo {
        let identity = KeyPair::from_seed(&[seed; 32]);
        sign_node_info(
            NodeInfo {
                identity_key: identity.public_key(),
                legal_name: format!("O=Local {}, L=Berlin, C=DE", seed),
                addresses: vec![format!("192.168.0.{}:10002", seed)],
                platform_version: 4,
                serial: 1,
            },
            &identity,
        )
        .unwrap()
    }

    async fn recv(rx: &mut mpsc::Receiver<SignedNodeInfo>) -> SignedNodeInfo {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_emits_existing_and_new_files() {
        let dir = tempdir().unwrap();
        let first = node(1);
        NodeInfoWatcher::save_to_file(dir.path(), &first).unwrap();

        let watcher = NodeInfoWatcher::new(dir.path(), Duration::from_millis(20));
        let mut rx = watcher.node_info_updates();
        assert_eq!(recv(&mut rx).await, first);

        let second = node(2);
        NodeInfoWatcher::save_to_file(dir.path(), &second).unwrap();
        assert_eq!(recv(&mut rx).await, second);

        let processed = watcher.processed_node_info_hashes();
        assert!(processed.contains(&node_info_hash(&first)));
        assert!(processed.contains(&node_info_hash(&second)));
    }

    #[tokio::test]
    async fn test_skips_invalid_files() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("nodeInfo-garbage"), b"not a node info").unwrap();
        std::fs::write(dir.path().join("README"), b"ignored").unwrap();
        let good = node(3);
        NodeInfoWatcher::save_to_file(dir.path(), &good).unwrap();

        let watcher = NodeInfoWatcher::new(dir.path(), Duration::from_millis(20));
        let mut rx = watcher.node_info_updates();
        assert_eq!(recv(&mut rx).await, good);
        assert_eq!(watcher.processed_node_info_hashes().len(), 1);
    }

    #[tokio::test]
    async fn test_restartable() {
        let dir = tempdir().unwrap();
        let entry = node(4);
        NodeInfoWatcher::save_to_file(dir.path(), &entry).unwrap();
        let watcher = NodeInfoWatcher::new(dir.path(), Duration::from_millis(20));

        let mut first = watcher.node_info_updates();
        assert_eq!(recv(&mut first).await, entry);
        drop(first);

        // A new subscription replays the directory from scratch
        let mut second = watcher.node_info_updates();
        assert_eq!(recv(&mut second).await, entry);
    }

    #[tokio::test]
    async fn test_missing_directory_is_quiet() {
        let dir = tempdir().unwrap();
        let watcher = NodeInfoWatcher::new(dir.path().join("absent"), Duration::from_millis(20));
        let mut rx = watcher.node_info_updates();
        let result = tokio::time::timeout(Duration::from_millis(100), rx.recv()).await;
        assert!(result.is_err());
    }
}
