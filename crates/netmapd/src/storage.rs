//! Persistent storage using sled

use netmap_core::types::*;
use sled::Db;
use std::fs;
use std::io::Write;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Storage errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Sled error: {0}")]
    Sled(#[from] sled::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] postcard::Error),
    #[error("Corrupt key in tree {0}")]
    CorruptKey(&'static str),
}

/// Storage backend for netmapd
pub struct Storage {
    db: Db,
    /// Node info tree: node_info_hash -> SignedNodeInfo
    node_infos: sled::Tree,
    /// Identity tree: identity_key -> node_info_hash
    identities: sled::Tree,
    /// Metadata tree: key -> value
    metadata: sled::Tree,
}

impl Storage {
    /// Open storage at the given path
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let db = sled::open(path)?;
        let node_infos = db.open_tree("node_infos")?;
        let identities = db.open_tree("identities")?;
        let metadata = db.open_tree("metadata")?;

        Ok(Self {
            db,
            node_infos,
            identities,
            metadata,
        })
    }

    /// Store a node info under its content hash
    pub fn put_node_info(
        &self,
        hash: &SecureHash,
        signed: &SignedNodeInfo,
    ) -> Result<(), StorageError> {
        let value = postcard::to_allocvec(signed)?;
        self.node_infos.insert(hash.0, value)?;
        Ok(())
    }

    /// Get a node info by hash
    pub fn get_node_info(&self, hash: &SecureHash) -> Result<Option<SignedNodeInfo>, StorageError> {
        match self.node_infos.get(hash.0)? {
            Some(bytes) => {
                let signed: SignedNodeInfo = postcard::from_bytes(&bytes)?;
                Ok(Some(signed))
            }
            None => Ok(None),
        }
    }

    /// Delete a node info by hash
    pub fn delete_node_info(&self, hash: &SecureHash) -> Result<bool, StorageError> {
        Ok(self.node_infos.remove(hash.0)?.is_some())
    }

    /// All stored node info hashes
    pub fn node_info_hashes(&self) -> Result<Vec<SecureHash>, StorageError> {
        let mut hashes = Vec::with_capacity(self.node_infos.len());
        for result in self.node_infos.iter().keys() {
            let key = result?;
            let hash: Bytes32 = key
                .as_ref()
                .try_into()
                .map_err(|_| StorageError::CorruptKey("node_infos"))?;
            hashes.push(SecureHash(hash));
        }
        Ok(hashes)
    }

    /// Count node infos
    pub fn node_info_count(&self) -> usize {
        self.node_infos.len()
    }

    /// Hash of the entry currently held for an identity
    pub fn get_identity(&self, identity_key: &Bytes32) -> Result<Option<SecureHash>, StorageError> {
        match self.identities.get(identity_key)? {
            Some(bytes) => {
                let hash: Bytes32 = bytes
                    .as_ref()
                    .try_into()
                    .map_err(|_| StorageError::CorruptKey("identities"))?;
                Ok(Some(SecureHash(hash)))
            }
            None => Ok(None),
        }
    }

    /// Point an identity at an entry hash
    pub fn put_identity(&self, identity_key: &Bytes32, hash: &SecureHash) -> Result<(), StorageError> {
        self.identities.insert(identity_key, &hash.0[..])?;
        Ok(())
    }

    /// Drop the identity mapping if it still points at `hash`
    pub fn delete_identity_if(
        &self,
        identity_key: &Bytes32,
        hash: &SecureHash,
    ) -> Result<(), StorageError> {
        // A concurrent replace may already have moved the identity on
        let _ = self
            .identities
            .compare_and_swap(identity_key, Some(&hash.0[..]), None as Option<&[u8]>)?;
        Ok(())
    }

    /// Store metadata
    pub fn put_metadata(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        self.metadata.insert(key, value)?;
        Ok(())
    }

    /// Get metadata
    pub fn get_metadata(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.metadata.get(key)?.map(|v| v.to_vec()))
    }

    /// Flush all pending writes
    pub fn flush(&self) -> Result<(), StorageError> {
        self.db.flush()?;
        Ok(())
    }
}

/// Replace `path` with `bytes` so readers see either the old or the new file.
///
/// Writes a uniquely named sibling, syncs it, then renames it over `path`.
pub fn write_file_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let temp_path = path.with_extension(format!(
        "tmp.{}.{}",
        std::process::id(),
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|duration| duration.as_nanos())
            .unwrap_or(0)
    ));
    let result = (|| {
        let mut temp = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&temp_path)?;
        temp.write_all(bytes)?;
        temp.sync_all()?;
        fs::rename(&temp_path, path)
    })();
    if result.is_err() {
        let _ = fs::remove_file(&temp_path);
    }
    result
}
