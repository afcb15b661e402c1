//! Durable network parameters files
//!
//! `network-parameters` holds the parameters the node runs under;
//! `network-parameters-update` holds an update the node has accepted and
//! will switch to at the next restart.

use crate::storage::write_file_atomic;
use netmap_core::crypto::{signed_parameters_hash, verify_network_parameters};
use netmap_core::types::*;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;

/// File holding the parameters in force
pub const NETWORK_PARAMS_FILE_NAME: &str = "network-parameters";
/// File holding accepted, not yet active parameters
pub const NETWORK_PARAMS_UPDATE_FILE_NAME: &str = "network-parameters-update";

/// Parameters file errors
#[derive(Debug, Error)]
pub enum ParametersError {
    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Serialization error: {0}")]
    Serialization(#[from] postcard::Error),
    #[error("Invalid parameters: {0}")]
    Invalid(#[from] netmap_core::Error),
}

/// Reads and writes the parameters files in the node's base directory
#[derive(Debug, Clone)]
pub struct ParametersStore {
    base_dir: PathBuf,
}

impl ParametersStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    pub fn current_file(&self) -> PathBuf {
        self.base_dir.join(NETWORK_PARAMS_FILE_NAME)
    }

    pub fn update_file(&self) -> PathBuf {
        self.base_dir.join(NETWORK_PARAMS_UPDATE_FILE_NAME)
    }

    /// Parameters the node runs under, if the file exists
    pub fn read_current(&self) -> Result<Option<SignedNetworkParameters>, ParametersError> {
        read_signed(&self.current_file())
    }

    /// Replace the parameters the node runs under
    pub fn write_current(&self, signed: &SignedNetworkParameters) -> Result<(), ParametersError> {
        write_signed(&self.current_file(), signed)
    }

    /// Accepted update, if any
    pub fn read_accepted(&self) -> Result<Option<SignedNetworkParameters>, ParametersError> {
        read_signed(&self.update_file())
    }

    /// Hash of the accepted update, if any
    pub fn accepted_hash(&self) -> Result<Option<SecureHash>, ParametersError> {
        Ok(self.read_accepted()?.as_ref().map(signed_parameters_hash))
    }

    /// Record an accepted update. The latest acceptance wins.
    pub fn write_accepted(&self, signed: &SignedNetworkParameters) -> Result<(), ParametersError> {
        write_signed(&self.update_file(), signed)
    }

    /// Make the accepted update the current parameters if it is what the
    /// network map now advertises. Returns whether a switch happened.
    pub fn promote_accepted(
        &self,
        advertised: &SecureHash,
        trusted_root: &Bytes32,
    ) -> Result<bool, ParametersError> {
        let accepted = match self.read_accepted()? {
            Some(accepted) => accepted,
            None => return Ok(false),
        };
        if signed_parameters_hash(&accepted) != *advertised {
            return Ok(false);
        }
        verify_network_parameters(&accepted, trusted_root)?;

        let from = self.update_file();
        let to = self.current_file();
        fs::rename(&from, &to).map_err(|source| ParametersError::Io { path: to, source })?;
        info!("Switched to accepted network parameters {}", advertised);
        Ok(true)
    }
}

fn read_signed(path: &Path) -> Result<Option<SignedNetworkParameters>, ParametersError> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(postcard::from_bytes(&bytes)?)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(source) => Err(ParametersError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

fn write_signed(path: &Path, signed: &SignedNetworkParameters) -> Result<(), ParametersError> {
    let bytes = postcard::to_allocvec(signed)?;
    write_file_atomic(path, &bytes).map_err(|source| ParametersError::Io {
        path: path.to_path_buf(),
        source,
    })
}
