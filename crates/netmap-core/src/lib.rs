//! Network-map core library
//!
//! This crate provides the content-addressed types, canonical encoding, and
//! cryptographic primitives shared by the network-map client and daemon.
//!
//! # Modules
//!
//! - [`types`]: Membership entries, network parameters, network map snapshots
//! - [`canonical`]: Deterministic serialization for hashing/signing
//! - [`crypto`]: Hash derivations, signing keys and signature verification
//! - [`error`]: Error types

pub mod canonical;
pub mod crypto;
pub mod error;
pub mod types;

pub use crypto::KeyPair;
pub use error::{Error, Result};
pub use types::*;
