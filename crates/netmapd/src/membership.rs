//! Network map cache: the node's view of network membership

use crate::storage::{Storage, StorageError};
use netmap_core::crypto::{node_info_hash, verify_node_info};
use netmap_core::types::*;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

/// Cache errors
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("Invalid node info: {0}")]
    Invalid(#[from] netmap_core::Error),
}

/// Result of adding a node info
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    /// First entry for this identity
    Added,
    /// Replaced the identity's previous entry (its hash)
    Replaced(SecureHash),
    /// Exact entry already present
    Unchanged,
    /// Older serial than the stored entry, ignored
    Stale,
}

/// Hash-keyed membership store consumed by the updater.
///
/// Implementations must be safe to call from several tasks at once: the
/// local watcher feed and the poll worker both write to it.
pub trait NetworkMapCache: Send + Sync {
    /// Add an entry, replacing the previous entry of the same identity
    fn add_node(&self, node: SignedNodeInfo) -> Result<AddOutcome, CacheError>;

    /// Remove an entry
    fn remove_node(&self, node: &SignedNodeInfo) -> Result<(), CacheError>;

    /// Look up an entry by content hash
    fn get_node_by_hash(&self, hash: &SecureHash) -> Result<Option<SignedNodeInfo>, CacheError>;

    /// Hashes of every entry held
    fn all_node_hashes(&self) -> Result<HashSet<SecureHash>, CacheError>;
}

/// Network map cache persisted in sled
pub struct PersistentNetworkMapCache {
    storage: Arc<Storage>,
    /// Serializes the multi-tree update of an add or remove
    write_lock: Mutex<()>,
}

impl PersistentNetworkMapCache {
    /// Create a cache over existing storage
    pub fn new(storage: Arc<Storage>) -> Self {
        Self {
            storage,
            write_lock: Mutex::new(()),
        }
    }

    /// Number of entries held
    pub fn node_count(&self) -> usize {
        self.storage.node_info_count()
    }

    /// Current entry for an identity
    pub fn get_node_by_identity(
        &self,
        identity_key: &Bytes32,
    ) -> Result<Option<SignedNodeInfo>, CacheError> {
        match self.storage.get_identity(identity_key)? {
            Some(hash) => Ok(self.storage.get_node_info(&hash)?),
            None => Ok(None),
        }
    }
}

impl NetworkMapCache for PersistentNetworkMapCache {
    fn add_node(&self, node: SignedNodeInfo) -> Result<AddOutcome, CacheError> {
        let info = verify_node_info(&node)?;
        let hash = node_info_hash(&node);

        let _guard = self.write_lock.lock();

        let previous = match self.storage.get_identity(&info.identity_key)? {
            Some(prev_hash) if prev_hash == hash => return Ok(AddOutcome::Unchanged),
            Some(prev_hash) => self
                .storage
                .get_node_info(&prev_hash)?
                .map(|prev| (prev_hash, prev)),
            None => None,
        };

        if let Some((prev_hash, prev)) = &previous {
            let prev_info: NodeInfo = postcard::from_bytes(&prev.raw)
                .map_err(netmap_core::Error::from)?;
            if prev_info.serial > info.serial {
                debug!(
                    "Ignoring stale node info for {} (serial {} < {}), keeping {:?}",
                    info.legal_name, info.serial, prev_info.serial, prev_hash
                );
                return Ok(AddOutcome::Stale);
            }
        }

        self.storage.put_node_info(&hash, &node)?;
        self.storage.put_identity(&info.identity_key, &hash)?;

        match previous {
            Some((prev_hash, _)) => {
                self.storage.delete_node_info(&prev_hash)?;
                info!("Updated node info for {} ({:?})", info.legal_name, hash);
                Ok(AddOutcome::Replaced(prev_hash))
            }
            None => {
                info!("Added node info for {} ({:?})", info.legal_name, hash);
                Ok(AddOutcome::Added)
            }
        }
    }

    fn remove_node(&self, node: &SignedNodeInfo) -> Result<(), CacheError> {
        let hash = node_info_hash(node);
        let info: NodeInfo = postcard::from_bytes(&node.raw).map_err(netmap_core::Error::from)?;

        let _guard = self.write_lock.lock();
        if self.storage.delete_node_info(&hash)? {
            info!("Removed node info for {} ({:?})", info.legal_name, hash);
        }
        self.storage.delete_identity_if(&info.identity_key, &hash)?;
        Ok(())
    }

    fn get_node_by_hash(&self, hash: &SecureHash) -> Result<Option<SignedNodeInfo>, CacheError> {
        Ok(self.storage.get_node_info(hash)?)
    }

    fn all_node_hashes(&self) -> Result<HashSet<SecureHash>, CacheError> {
        Ok(self.storage.node_info_hashes()?.into_iter().collect())
    }
}
