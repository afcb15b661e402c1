//! Canonical encoding for network-map objects
//!
//! All hashed/signed objects use postcard serialization with strict constraints:
//! - No maps/hashmaps
//! - Repeated fields must be sorted and deduped
//! - Field order is Rust struct field order

use crate::error::{Error, Result};
use crate::types::*;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Serialize a value to canonical bytes using postcard.
///
/// This is the normative encoding for all hashing and signing operations.
pub fn canonical_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    postcard::to_allocvec(value).map_err(Error::from)
}

/// Decode `raw` and check that it is the canonical encoding of the result.
///
/// Two byte strings that decode to the same value would otherwise hash
/// differently, so anything content-addressed is decoded through here.
pub fn decode_canonical<T: Serialize + DeserializeOwned>(
    raw: &[u8],
    what: &'static str,
) -> Result<T> {
    let value: T = postcard::from_bytes(raw)?;
    if canonical_bytes(&value)? != raw {
        return Err(Error::NonCanonical(what));
    }
    Ok(value)
}

/// Sort and dedupe the address list of a NodeInfo.
pub fn normalize_node_info(info: &mut NodeInfo) {
    info.addresses.sort();
    info.addresses.dedup();
}

/// Sort and dedupe the notary list of NetworkParameters.
pub fn normalize_network_parameters(params: &mut NetworkParameters) {
    params.notaries.sort();
    params.notaries.dedup();
}

/// Check that addresses are properly sorted and deduped.
pub fn validate_addresses_sorted(addresses: &[String]) -> Result<()> {
    for i in 1..addresses.len() {
        if addresses[i] <= addresses[i - 1] {
            return Err(Error::UnsortedRepeatedField {
                field: "addresses".into(),
            });
        }
    }
    Ok(())
}

/// Check that notaries are properly sorted and deduped.
pub fn validate_notaries_sorted(notaries: &[NotaryInfo]) -> Result<()> {
    for i in 1..notaries.len() {
        if notaries[i] <= notaries[i - 1] {
            return Err(Error::UnsortedRepeatedField {
                field: "notaries".into(),
            });
        }
    }
    Ok(())
}
