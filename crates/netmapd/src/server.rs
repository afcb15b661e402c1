//! netmapd server - wires storage, cache, watcher, client and updater

use crate::config::{Config, NodeState};
use crate::membership::{NetworkMapCache, PersistentNetworkMapCache};
use crate::parameters::{ParametersError, ParametersStore};
use crate::storage::{Storage, StorageError};
use crate::updater::{NetworkMapUpdater, UpdaterError, DEFAULT_RETRY_INTERVAL};
use crate::watcher::{LocalMembershipSource, NodeInfoWatcher};
use netmap_core::crypto::{
    signed_parameters_hash, verify_network_parameters, verify_network_parameters_hash,
};
use netmap_core::types::*;
use netmap_core::KeyPair;
use netmap_net::client::{ClientError, NetworkMapClient, TcpNetworkMapClient};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Metadata key of the persisted node state
const NODE_STATE_KEY: &str = "node_state";

/// Server errors
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("Parameters error: {0}")]
    Parameters(#[from] ParametersError),
    #[error("Network map error: {0}")]
    Client(#[from] ClientError),
    #[error("Updater error: {0}")]
    Updater(#[from] UpdaterError),
    #[error("Invalid network parameters: {0}")]
    Invalid(#[from] netmap_core::Error),
    #[error("No network parameters at {0} and no network map to download them from")]
    MissingParameters(PathBuf),
}

/// Server state
pub struct Server {
    keypair: KeyPair,
    storage: Arc<Storage>,
    cache: Arc<PersistentNetworkMapCache>,
    updater: Arc<NetworkMapUpdater>,
    accept_parameters: Option<SecureHash>,
}

impl Server {
    /// Open storage, settle the network parameters and build the updater
    pub async fn new(config: Config) -> Result<Self, ServerError> {
        let trusted_root = config
            .trusted_root_key()
            .map_err(|e| ServerError::Config(e.to_string()))?;
        let accept_parameters = config
            .accept_parameters_hash()
            .map_err(|e| ServerError::Config(e.to_string()))?;

        let storage = Arc::new(Storage::open(config.data_dir.join("db"))?);
        let keypair = load_or_create_keypair(&storage)?;
        let cache = Arc::new(PersistentNetworkMapCache::new(storage.clone()));

        let client: Option<Arc<dyn NetworkMapClient>> = match (config.network_map, trusted_root) {
            (Some(addr), Some(root)) => Some(Arc::new(TcpNetworkMapClient::new(
                addr,
                root,
                config.request_timeout(),
            ))),
            (Some(_), None) => {
                return Err(ServerError::Config(
                    "a network map needs a trusted root".into(),
                ))
            }
            (None, _) => None,
        };

        let store = ParametersStore::new(&config.data_dir);
        let current_parameters_hash =
            bootstrap_parameters(&store, client.as_deref(), trusted_root.as_ref()).await?;
        info!("Running under network parameters {}", current_parameters_hash);

        let watcher: Arc<dyn LocalMembershipSource> = Arc::new(NodeInfoWatcher::new(
            config.node_info_dir(),
            config.watcher_interval(),
        ));
        let updater = Arc::new(NetworkMapUpdater::new(
            cache.clone(),
            watcher,
            client,
            current_parameters_hash,
            store,
        ));

        Ok(Self {
            keypair,
            storage,
            cache,
            updater,
            accept_parameters,
        })
    }

    /// Node public key, used to acknowledge parameters updates
    pub fn public_key(&self) -> Bytes32 {
        self.keypair.public_key()
    }

    /// Updater driving this node's network map
    pub fn updater(&self) -> &Arc<NetworkMapUpdater> {
        &self.updater
    }

    /// Run until a flag day or a shutdown signal; returns the exit status
    pub async fn run(&self) -> Result<u8, ServerError> {
        info!(
            "Starting netmapd ({} cached node infos, key {})",
            self.cache.node_count(),
            hex::encode(&self.public_key()[..8])
        );
        self.updater.subscribe_to_network_map()?;

        let monitor = (!self.updater.is_local_only()).then(|| {
            spawn_update_monitor(
                self.updater.clone(),
                self.keypair.clone(),
                self.accept_parameters,
                DEFAULT_RETRY_INTERVAL,
            )
        });

        let exit_code = tokio::select! {
            flag_day = self.updater.wait_for_flag_day() => flag_day.exit_code(),
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal");
                0
            }
        };

        if let Some(monitor) = monitor {
            monitor.abort();
        }
        self.updater.close().await;
        self.storage.flush()?;
        Ok(exit_code)
    }
}

/// Log every parameters update and accept the one named on the command line.
///
/// A failed acceptance is retried every `retry_interval` for as long as that
/// update stays pending.
fn spawn_update_monitor(
    updater: Arc<NetworkMapUpdater>,
    node_key: KeyPair,
    accept: Option<SecureHash>,
    retry_interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut feed = updater.track_parameters_update().await;
        let mut next = feed.snapshot.take();
        let mut retry = false;
        loop {
            if let Some(update) = next.take() {
                info!(
                    "Network parameters update {} (epoch {}) available: {}. Deadline {}",
                    update.hash, update.parameters.epoch, update.description, update.update_deadline
                );
                retry = accept == Some(update.hash)
                    && !try_accept(&updater, &node_key, update.hash).await;
            }
            next = tokio::select! {
                received = feed.updates.recv() => match received {
                    Ok(update) => Some(update),
                    Err(RecvError::Lagged(_)) => updater.current_parameters_update().await,
                    Err(RecvError::Closed) => return,
                },
                _ = tokio::time::sleep(retry_interval), if retry => {
                    let pending = updater.current_parameters_update().await.map(|u| u.hash);
                    retry = match pending {
                        Some(hash) if accept == Some(hash) => !try_accept(&updater, &node_key, hash).await,
                        _ => false,
                    };
                    None
                }
            };
        }
    })
}

async fn try_accept(updater: &NetworkMapUpdater, node_key: &KeyPair, hash: SecureHash) -> bool {
    match updater
        .accept_new_network_parameters(hash, |hash| node_key.sign_hash(hash))
        .await
    {
        Ok(()) => {
            info!("Acknowledged network parameters {}", hash);
            true
        }
        Err(e) => {
            warn!("Failed to accept network parameters {}, will retry: {}", hash, e);
            false
        }
    }
}

fn load_or_create_keypair(storage: &Storage) -> Result<KeyPair, ServerError> {
    if let Some(bytes) = storage.get_metadata(NODE_STATE_KEY)? {
        let state: NodeState = postcard::from_bytes(&bytes).map_err(StorageError::from)?;
        return Ok(KeyPair::from_seed(&state.keypair_seed));
    }

    let keypair = KeyPair::generate();
    let state = NodeState {
        keypair_seed: keypair.seed(),
    };
    let bytes = postcard::to_allocvec(&state).map_err(StorageError::from)?;
    storage.put_metadata(NODE_STATE_KEY, &bytes)?;
    storage.flush()?;
    info!("Generated node key {}", hex::encode(keypair.public_key()));
    Ok(keypair)
}

/// Settle which parameters this run uses and return their hash.
///
/// Promotes an accepted update the network map has switched to and downloads
/// the advertised parameters when none are on disk yet.
async fn bootstrap_parameters(
    store: &ParametersStore,
    client: Option<&dyn NetworkMapClient>,
    trusted_root: Option<&Bytes32>,
) -> Result<SecureHash, ServerError> {
    if let Some(client) = client {
        let root = client.trusted_root();
        match client.get_network_map().await {
            Ok(response) => {
                let advertised = response.network_map.network_parameter_hash;
                store.promote_accepted(&advertised, &root)?;
                if store.read_current()?.is_none() {
                    let signed = client.get_network_parameters(&advertised).await?;
                    verify_network_parameters_hash(&signed, &root, &advertised)?;
                    store.write_current(&signed)?;
                    info!("Downloaded network parameters {}", advertised);
                }
            }
            Err(e) => warn!("Network map unreachable at start-up, using parameters on disk: {}", e),
        }
    }

    let current = store
        .read_current()?
        .ok_or_else(|| ServerError::MissingParameters(store.current_file()))?;
    if let Some(root) = trusted_root {
        verify_network_parameters(&current, root)?;
    }
    Ok(signed_parameters_hash(&current))
}
