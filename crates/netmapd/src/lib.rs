//! netmapd - network map synchronization daemon
//!
//! This daemon provides:
//! - A persistent, signature-checked network map cache
//! - Local membership from node-info files
//! - Polling and reconciliation against the network map
//! - Network parameters update tracking, acceptance and flag day handling

pub mod config;
pub mod membership;
pub mod parameters;
pub mod server;
pub mod storage;
pub mod updater;
pub mod watcher;

pub use config::Config;
pub use membership::{NetworkMapCache, PersistentNetworkMapCache};
pub use parameters::ParametersStore;
pub use server::Server;
pub use storage::Storage;
pub use updater::{FlagDay, NetworkMapUpdater};
pub use watcher::{LocalMembershipSource, NodeInfoWatcher};
