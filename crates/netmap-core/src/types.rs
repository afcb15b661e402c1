//! Core network-map types
//!
//! All types here are designed for deterministic serialization via postcard.
//! Field order matters for canonical encoding.

use serde::{Deserialize, Serialize};
use std::fmt;

/// 32-byte fixed-size array used for hashes, keys and identifiers.
pub type Bytes32 = [u8; 32];

// =============================================================================
// HASHES
// =============================================================================

/// Content hash: BLAKE3(domain || canonical_bytes)
#[derive(Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SecureHash(pub Bytes32);

impl SecureHash {
    /// The all-zero hash, never produced by a real derivation
    pub const ZERO: SecureHash = SecureHash([0u8; 32]);

    /// Get as bytes
    pub fn as_bytes(&self) -> &Bytes32 {
        &self.0
    }

    /// Parse from a 64 character hex string
    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes = hex::decode(s.trim()).ok()?;
        let arr: Bytes32 = bytes.try_into().ok()?;
        Some(Self(arr))
    }

    /// Full hex encoding
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for SecureHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for SecureHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecureHash({})", hex::encode(&self.0[..8]))
    }
}

// =============================================================================
// MEMBERSHIP
// =============================================================================

/// Identity and reachability of a peer
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeInfo {
    /// Ed25519 identity key, also the key that signs this record
    pub identity_key: Bytes32,
    pub legal_name: String,
    /// MUST be sorted lexicographically and deduped before hashing
    pub addresses: Vec<String>,
    pub platform_version: u32,
    /// Monotonic per identity, higher wins
    pub serial: u64,
}

/// Published membership entry: canonical `NodeInfo` bytes plus the identity signature
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct SignedNodeInfo {
    pub raw: Vec<u8>,
    /// Ed25519 signature over ("nodeinfo-sig" || raw)
    pub signature: Vec<u8>,
}

// =============================================================================
// NETWORK PARAMETERS
// =============================================================================

/// Notary advertised in the network parameters
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub struct NotaryInfo {
    pub identity_key: Bytes32,
    pub validating: bool,
}

/// Network-wide consensus parameters
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct NetworkParameters {
    pub minimum_platform_version: u32,
    /// MUST be sorted and deduped before hashing
    pub notaries: Vec<NotaryInfo>,
    pub max_message_size: u32,
    pub max_transaction_size: u32,
    /// Unix millis
    pub modified_time: u64,
    pub epoch: u32,
}

/// Network-map signing key certified by the trusted root
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct NetworkMapCertificate {
    pub public_key: Bytes32,
    /// Root signature over ("netmap-cert" || public_key)
    pub root_signature: Vec<u8>,
}

/// Parameters bundled with the network-map signature and its certificate
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct SignedNetworkParameters {
    /// canonical_bytes(NetworkParameters)
    pub raw: Vec<u8>,
    /// Signature by `signer.public_key` over ("params-sig" || raw)
    pub signature: Vec<u8>,
    pub signer: NetworkMapCertificate,
}

// =============================================================================
// NETWORK MAP
// =============================================================================

/// Parameter change announced by the network map
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ParametersUpdate {
    pub new_parameters_hash: SecureHash,
    pub description: String,
    /// Unix millis
    pub update_deadline: u64,
}

/// Snapshot of the authority's view of the network
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct NetworkMap {
    pub node_info_hashes: Vec<SecureHash>,
    pub network_parameter_hash: SecureHash,
    pub parameters_update: Option<ParametersUpdate>,
}

impl Default for SecureHash {
    fn default() -> Self {
        Self::ZERO
    }
}

/// Pending update as handed to subscribers
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParametersUpdateInfo {
    pub hash: SecureHash,
    pub parameters: NetworkParameters,
    pub description: String,
    pub update_deadline: u64,
}

/// A node's signature over a hash (used to acknowledge a parameters update)
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct SignedHash {
    pub hash: SecureHash,
    pub signer_public_key: Bytes32,
    pub signature: Vec<u8>,
}
