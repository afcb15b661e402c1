//! Hash derivations and signatures for network-map objects
//!
//! All hash derivations use BLAKE3 with domain separation prefixes.
//! Signatures are Ed25519 over a domain prefix followed by the signed bytes.

use crate::canonical::{
    canonical_bytes, decode_canonical, normalize_network_parameters, normalize_node_info,
    validate_addresses_sorted, validate_notaries_sorted,
};
use crate::error::{Error, Result};
use crate::types::*;
use blake3::Hasher;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;

// =============================================================================
// DOMAIN SEPARATION PREFIXES
// =============================================================================

/// Domain prefix for NodeInfo content hash
pub const DOMAIN_NODE_INFO: &[u8] = b"nodeinfo";
/// Domain prefix for NodeInfo signature
pub const DOMAIN_NODE_INFO_SIG: &[u8] = b"nodeinfo-sig";
/// Domain prefix for NetworkParameters content hash
pub const DOMAIN_PARAMS: &[u8] = b"params";
/// Domain prefix for NetworkParameters signature
pub const DOMAIN_PARAMS_SIG: &[u8] = b"params-sig";
/// Domain prefix for the root signature on a network-map certificate
pub const DOMAIN_NETMAP_CERT: &[u8] = b"netmap-cert";
/// Domain prefix for a node's signature over a hash
pub const DOMAIN_HASH_SIG: &[u8] = b"hash-sig";

fn domain_hash(domain: &[u8], bytes: &[u8]) -> SecureHash {
    let mut hasher = Hasher::new();
    hasher.update(domain);
    hasher.update(bytes);
    SecureHash(*hasher.finalize().as_bytes())
}

fn prefixed(domain: &[u8], bytes: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(domain.len() + bytes.len());
    out.extend_from_slice(domain);
    out.extend_from_slice(bytes);
    out
}

fn verify_ed25519(public_key: &Bytes32, message: &[u8], signature: &[u8]) -> Result<()> {
    let verifying_key = VerifyingKey::from_bytes(public_key)
        .map_err(|e| Error::InvalidPublicKey(e.to_string()))?;
    let sig_bytes: [u8; 64] = signature.try_into().map_err(|_| Error::InvalidSignature)?;
    let sig = Signature::from_bytes(&sig_bytes);
    verifying_key
        .verify(message, &sig)
        .map_err(|_| Error::InvalidSignature)
}

// =============================================================================
// KEYS
// =============================================================================

/// Ed25519 keypair for signing and identity
#[derive(Clone)]
pub struct KeyPair {
    signing_key: SigningKey,
}

impl KeyPair {
    /// Generate a new random keypair
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        Self { signing_key }
    }

    /// Create from seed bytes (for deterministic recovery and testing)
    pub fn from_seed(seed: &Bytes32) -> Self {
        let signing_key = SigningKey::from_bytes(seed);
        Self { signing_key }
    }

    /// Seed bytes, for persisting the key
    pub fn seed(&self) -> Bytes32 {
        self.signing_key.to_bytes()
    }

    /// Get the public key bytes
    pub fn public_key(&self) -> Bytes32 {
        self.signing_key.verifying_key().to_bytes()
    }

    /// Sign a message
    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        self.signing_key.sign(message).to_bytes()
    }

    /// Sign a hash, producing the acknowledgement form sent to the network map
    pub fn sign_hash(&self, hash: &SecureHash) -> SignedHash {
        SignedHash {
            hash: *hash,
            signer_public_key: self.public_key(),
            signature: self.sign(&prefixed(DOMAIN_HASH_SIG, &hash.0)).to_vec(),
        }
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "KeyPair({})", hex::encode(&self.public_key()[..8]))
    }
}

/// Verify a node's signature over a hash.
pub fn verify_signed_hash(signed: &SignedHash) -> Result<()> {
    verify_ed25519(
        &signed.signer_public_key,
        &prefixed(DOMAIN_HASH_SIG, &signed.hash.0),
        &signed.signature,
    )
}

// =============================================================================
// NODE INFO
// =============================================================================

/// Content hash of a published membership entry.
///
/// `hash = BLAKE3("nodeinfo" || raw)`
pub fn node_info_hash(signed: &SignedNodeInfo) -> SecureHash {
    domain_hash(DOMAIN_NODE_INFO, &signed.raw)
}

/// Normalize, encode and sign a NodeInfo with its own identity key.
pub fn sign_node_info(mut info: NodeInfo, identity: &KeyPair) -> Result<SignedNodeInfo> {
    if info.identity_key != identity.public_key() {
        return Err(Error::InvalidPublicKey(
            "node info identity does not match signing key".into(),
        ));
    }
    normalize_node_info(&mut info);
    let raw = canonical_bytes(&info)?;
    let signature = identity.sign(&prefixed(DOMAIN_NODE_INFO_SIG, &raw)).to_vec();
    Ok(SignedNodeInfo { raw, signature })
}

/// Decode a signed entry and check its identity signature.
pub fn verify_node_info(signed: &SignedNodeInfo) -> Result<NodeInfo> {
    let info: NodeInfo = decode_canonical(&signed.raw, "node info")?;
    validate_addresses_sorted(&info.addresses)?;
    verify_ed25519(
        &info.identity_key,
        &prefixed(DOMAIN_NODE_INFO_SIG, &signed.raw),
        &signed.signature,
    )?;
    Ok(info)
}

// =============================================================================
// NETWORK PARAMETERS
// =============================================================================

/// Hash of the signed parameters as advertised by the network map.
///
/// `hash = BLAKE3("params" || raw)`
pub fn signed_parameters_hash(signed: &SignedNetworkParameters) -> SecureHash {
    domain_hash(DOMAIN_PARAMS, &signed.raw)
}

/// Canonical hash of verified parameters, recomputed from the decoded value.
///
/// Equals [`signed_parameters_hash`] for any bundle that passed verification.
pub fn network_parameters_hash(params: &NetworkParameters) -> Result<SecureHash> {
    let raw = canonical_bytes(params)?;
    Ok(domain_hash(DOMAIN_PARAMS, &raw))
}

/// Certify a network-map signing key with the root key.
pub fn certify_network_map_key(root: &KeyPair, network_map_key: &Bytes32) -> NetworkMapCertificate {
    NetworkMapCertificate {
        public_key: *network_map_key,
        root_signature: root.sign(&prefixed(DOMAIN_NETMAP_CERT, network_map_key)).to_vec(),
    }
}

/// Normalize, encode and sign parameters with a certified network-map key.
pub fn sign_network_parameters(
    mut params: NetworkParameters,
    network_map_key: &KeyPair,
    certificate: NetworkMapCertificate,
) -> Result<SignedNetworkParameters> {
    if certificate.public_key != network_map_key.public_key() {
        return Err(Error::InvalidPublicKey(
            "certificate does not match network map key".into(),
        ));
    }
    normalize_network_parameters(&mut params);
    let raw = canonical_bytes(&params)?;
    let signature = network_map_key
        .sign(&prefixed(DOMAIN_PARAMS_SIG, &raw))
        .to_vec();
    Ok(SignedNetworkParameters {
        raw,
        signature,
        signer: certificate,
    })
}

/// Verify the certificate chain and signature and decode the parameters.
pub fn verify_network_parameters(
    signed: &SignedNetworkParameters,
    trusted_root: &Bytes32,
) -> Result<NetworkParameters> {
    verify_ed25519(
        trusted_root,
        &prefixed(DOMAIN_NETMAP_CERT, &signed.signer.public_key),
        &signed.signer.root_signature,
    )
    .map_err(|_| Error::UntrustedCertificate(hex::encode(&trusted_root[..8])))?;

    verify_ed25519(
        &signed.signer.public_key,
        &prefixed(DOMAIN_PARAMS_SIG, &signed.raw),
        &signed.signature,
    )?;

    let params: NetworkParameters = decode_canonical(&signed.raw, "network parameters")?;
    validate_notaries_sorted(&params.notaries)?;
    Ok(params)
}

/// Verify parameters and check their hash against an expected value.
pub fn verify_network_parameters_hash(
    signed: &SignedNetworkParameters,
    trusted_root: &Bytes32,
    expected: &SecureHash,
) -> Result<NetworkParameters> {
    let computed = signed_parameters_hash(signed);
    if computed != *expected {
        return Err(Error::HashMismatch {
            computed: computed.to_hex(),
            transmitted: expected.to_hex(),
        });
    }
    verify_network_parameters(signed, trusted_root)
}
