//! Network map updater
//!
//! Keeps the network map cache in step with the local node-info directory and,
//! when a network map is configured, with the remote network map:
//!
//! - one poll worker; each cycle schedules the next when it finishes, so
//!   cycles never overlap
//! - reconciliation adds what the network map lists and the cache lacks, and
//!   drops what it no longer lists unless the entry came from the local
//!   directory
//! - parameter updates are verified, tracked (latest wins) and broadcast
//! - a parameters hash mismatch ends in a [`FlagDay`], which the supervisor
//!   turns into a process exit

use crate::membership::{AddOutcome, CacheError, NetworkMapCache};
use crate::parameters::{ParametersError, ParametersStore};
use crate::watcher::LocalMembershipSource;
use netmap_core::crypto::{
    network_parameters_hash, verify_network_parameters, verify_network_parameters_hash,
};
use netmap_core::types::*;
use netmap_net::client::{ClientError, NetworkMapClient, NetworkMapResponse};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Delay before the next poll after a failed cycle
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(60);

/// How long `close` waits for an in-flight cycle
pub const SHUTDOWN_GRACE_PERIOD: Duration = Duration::from_secs(50);

/// Buffered notices per subscriber before it starts lagging
const UPDATES_CHANNEL_CAPACITY: usize = 16;

/// Updater errors
#[derive(Debug, Error)]
pub enum UpdaterError {
    #[error("Should not subscribe to the network map twice")]
    InvalidState,
    #[error("Network parameters updates are not supported without a network map configured")]
    Unsupported,
    #[error("Couldn't find parameters update for the hash: {0}")]
    NotFound(SecureHash),
    #[error(
        "Refused to accept parameters with hash {requested} because network map advertises update with hash {advertised}"
    )]
    Mismatch {
        requested: SecureHash,
        advertised: SecureHash,
    },
    #[error("Network map client error: {0}")]
    Client(#[from] ClientError),
    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),
    #[error("Parameters file error: {0}")]
    Parameters(#[from] ParametersError),
    #[error("Parameters verification failed: {0}")]
    Verification(#[from] netmap_core::Error),
}

/// Terminal result of a parameters hash mismatch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlagDay {
    /// The network switched to parameters this node accepted; restart to adopt them
    Reached { parameters_hash: SecureHash },
    /// The network runs parameters this node never accepted
    Diverged {
        running: SecureHash,
        advertised: SecureHash,
        accepted: Option<SecureHash>,
    },
}

impl FlagDay {
    /// Process exit status for this outcome
    pub fn exit_code(&self) -> u8 {
        match self {
            FlagDay::Reached { .. } => 0,
            FlagDay::Diverged { .. } => 1,
        }
    }
}

/// What a poll cycle asks the worker to do next
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    /// Poll again after this delay
    Reschedule(Duration),
    /// Stop polling, the process must exit
    FlagDay(FlagDay),
}

/// Counts from one reconciliation pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileStats {
    pub added: usize,
    pub skipped: usize,
    pub removed: usize,
}

/// Current pending update plus every later one
pub struct DataFeed {
    pub snapshot: Option<ParametersUpdateInfo>,
    pub updates: broadcast::Receiver<ParametersUpdateInfo>,
}

struct PendingParameters {
    update: ParametersUpdate,
    signed: SignedNetworkParameters,
    verified: NetworkParameters,
}

impl PendingParameters {
    fn info(&self) -> ParametersUpdateInfo {
        ParametersUpdateInfo {
            hash: self.update.new_parameters_hash,
            parameters: self.verified.clone(),
            description: self.update.description.clone(),
            update_deadline: self.update.update_deadline,
        }
    }
}

#[derive(Default)]
struct Tasks {
    subscribed: bool,
    feed: Option<JoinHandle<()>>,
    poller: Option<JoinHandle<()>>,
}

/// Synchronizes the network map cache and tracks parameter updates
pub struct NetworkMapUpdater {
    cache: Arc<dyn NetworkMapCache>,
    source: Arc<dyn LocalMembershipSource>,
    client: Option<Arc<dyn NetworkMapClient>>,
    /// Parameters this process runs under, fixed for its lifetime
    current_parameters_hash: SecureHash,
    store: ParametersStore,
    /// Guards the pending update and the accepted-parameters file
    pending: Mutex<Option<PendingParameters>>,
    updates_tx: broadcast::Sender<ParametersUpdateInfo>,
    flag_day_tx: watch::Sender<Option<FlagDay>>,
    shutdown_tx: watch::Sender<bool>,
    tasks: parking_lot::Mutex<Tasks>,
    retry_interval: Duration,
    shutdown_grace: Duration,
}

impl NetworkMapUpdater {
    pub fn new(
        cache: Arc<dyn NetworkMapCache>,
        source: Arc<dyn LocalMembershipSource>,
        client: Option<Arc<dyn NetworkMapClient>>,
        current_parameters_hash: SecureHash,
        store: ParametersStore,
    ) -> Self {
        let (updates_tx, _) = broadcast::channel(UPDATES_CHANNEL_CAPACITY);
        let (flag_day_tx, _) = watch::channel(None);
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            cache,
            source,
            client,
            current_parameters_hash,
            store,
            pending: Mutex::new(None),
            updates_tx,
            flag_day_tx,
            shutdown_tx,
            tasks: parking_lot::Mutex::new(Tasks::default()),
            retry_interval: DEFAULT_RETRY_INTERVAL,
            shutdown_grace: SHUTDOWN_GRACE_PERIOD,
        }
    }

    /// Override the delay after a failed cycle
    pub fn with_retry_interval(mut self, retry_interval: Duration) -> Self {
        self.retry_interval = retry_interval;
        self
    }

    /// Override how long `close` waits for the poll worker
    pub fn with_shutdown_grace(mut self, shutdown_grace: Duration) -> Self {
        self.shutdown_grace = shutdown_grace;
        self
    }

    /// Parameters hash this node runs under
    pub fn current_parameters_hash(&self) -> SecureHash {
        self.current_parameters_hash
    }

    /// True when no network map is configured
    pub fn is_local_only(&self) -> bool {
        self.client.is_none()
    }

    /// Start forwarding local node infos into the cache and, if a network
    /// map is configured, start polling it. May only be called once.
    pub fn subscribe_to_network_map(self: &Arc<Self>) -> Result<(), UpdaterError> {
        let mut tasks = self.tasks.lock();
        if tasks.subscribed {
            return Err(UpdaterError::InvalidState);
        }
        tasks.subscribed = true;

        let mut local_updates = self.source.node_info_updates();
        let cache = self.cache.clone();
        tasks.feed = Some(tokio::spawn(async move {
            while let Some(node) = local_updates.recv().await {
                if let Err(e) = cache.add_node(node) {
                    warn!("Failed to add local node info to the network map cache: {}", e);
                }
            }
        }));

        match &self.client {
            Some(_) => {
                let updater = self.clone();
                // The first poll may be slow, so it runs on the worker too
                tasks.poller = Some(tokio::spawn(async move { updater.run_poller().await }));
                info!("Subscribed to the network map");
            }
            None => info!("No network map configured, running with local node infos only"),
        }
        Ok(())
    }

    async fn run_poller(self: Arc<Self>) {
        let mut shutdown = self.shutdown_tx.subscribe();
        loop {
            if *shutdown.borrow() {
                return;
            }
            let delay = match self.run_cycle().await {
                PollOutcome::Reschedule(delay) => delay,
                PollOutcome::FlagDay(flag_day) => {
                    self.flag_day_tx.send_replace(Some(flag_day));
                    return;
                }
            };
            debug!("Next network map poll in {:?}", delay);
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => return,
            }
        }
    }

    /// Run one poll cycle, turning any failure into the retry delay
    pub async fn run_cycle(&self) -> PollOutcome {
        match self.poll_once().await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(
                    "Error encountered while updating network map, will retry in {:?}: {}",
                    self.retry_interval, e
                );
                PollOutcome::Reschedule(self.retry_interval)
            }
        }
    }

    /// Fetch the network map, handle any parameters update and reconcile
    pub async fn poll_once(&self) -> Result<PollOutcome, UpdaterError> {
        let client = self.client.as_deref().ok_or(UpdaterError::Unsupported)?;
        let NetworkMapResponse {
            network_map,
            cache_timeout,
        } = client.get_network_map().await?;

        if let Some(update) = &network_map.parameters_update {
            self.handle_parameters_update(client, update).await?;
        }

        if network_map.network_parameter_hash != self.current_parameters_hash {
            let flag_day = self
                .check_flag_day(&network_map.network_parameter_hash)
                .await;
            return Ok(PollOutcome::FlagDay(flag_day));
        }

        let stats = self.reconcile(client, &network_map).await?;
        debug!(
            "Network map reconciled: {} added, {} skipped, {} removed",
            stats.added, stats.skipped, stats.removed
        );
        Ok(PollOutcome::Reschedule(cache_timeout))
    }

    async fn reconcile(
        &self,
        client: &dyn NetworkMapClient,
        network_map: &NetworkMap,
    ) -> Result<ReconcileStats, UpdaterError> {
        let current = self.cache.all_node_hashes()?;
        let remote: HashSet<SecureHash> = network_map.node_info_hashes.iter().copied().collect();
        let mut stats = ReconcileStats::default();

        for hash in remote.difference(&current) {
            let node = match client.get_node_info(hash).await {
                Ok(node) => node,
                Err(e) => {
                    warn!("Error encountered when downloading node info '{}', skipping: {}", hash, e);
                    stats.skipped += 1;
                    continue;
                }
            };
            match self.cache.add_node(node) {
                Ok(AddOutcome::Added) | Ok(AddOutcome::Replaced(_)) => stats.added += 1,
                Ok(AddOutcome::Stale) | Ok(AddOutcome::Unchanged) => {
                    debug!("Network map lists superseded node info '{}', skipping", hash);
                    stats.skipped += 1;
                }
                Err(CacheError::Invalid(e)) => {
                    warn!("Network map served invalid node info '{}', skipping: {}", hash, e);
                    stats.skipped += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }

        // Entries from the local directory may not have reached the network map yet
        let local = self.source.processed_node_info_hashes();
        for hash in current
            .iter()
            .filter(|hash| !remote.contains(hash) && !local.contains(hash))
        {
            if let Some(node) = self.cache.get_node_by_hash(hash)? {
                self.cache.remove_node(&node)?;
                stats.removed += 1;
            }
        }

        Ok(stats)
    }

    async fn handle_parameters_update(
        &self,
        client: &dyn NetworkMapClient,
        update: &ParametersUpdate,
    ) -> Result<(), UpdaterError> {
        if self.is_tracked(&update.new_parameters_hash).await {
            return Ok(());
        }

        let signed = client
            .get_network_parameters(&update.new_parameters_hash)
            .await?;
        let verified =
            verify_network_parameters_hash(&signed, &client.trusted_root(), &update.new_parameters_hash)?;
        info!(
            "Downloaded new network parameters {} (epoch {}) from the update: {}",
            update.new_parameters_hash, verified.epoch, update.description
        );

        let mut pending = self.pending.lock().await;
        if is_same_update(&pending, &update.new_parameters_hash) {
            return Ok(());
        }
        let tracked = PendingParameters {
            update: update.clone(),
            signed,
            verified,
        };
        let notice = tracked.info();
        *pending = Some(tracked);
        // Sent under the lock so a concurrent snapshot+subscribe sees it exactly once
        let _ = self.updates_tx.send(notice);
        Ok(())
    }

    async fn is_tracked(&self, hash: &SecureHash) -> bool {
        is_same_update(&*self.pending.lock().await, hash)
    }

    async fn check_flag_day(&self, advertised: &SecureHash) -> FlagDay {
        // Excludes an accept writing the file at the same moment
        let _pending = self.pending.lock().await;
        let accepted = match self.store.accepted_hash() {
            Ok(accepted) => accepted,
            Err(e) => {
                error!("Cannot read accepted network parameters: {}", e);
                None
            }
        };

        if accepted.as_ref() == Some(advertised) {
            info!(
                "Flag day occurred. Network map switched to the new network parameters: {}. \
                 Node will shutdown now and needs to be started again.",
                advertised
            );
            FlagDay::Reached {
                parameters_hash: *advertised,
            }
        } else {
            // Missed or declined update: no automatic recovery
            error!(
                "Node is using parameters with hash: {} but network map is advertising: {}. \
                 Node will shutdown now. Please update node to use correct network parameters file.",
                self.current_parameters_hash, advertised
            );
            FlagDay::Diverged {
                running: self.current_parameters_hash,
                advertised: *advertised,
                accepted,
            }
        }
    }

    /// Pending update, if any
    pub async fn current_parameters_update(&self) -> Option<ParametersUpdateInfo> {
        self.pending.lock().await.as_ref().map(PendingParameters::info)
    }

    /// Pending update plus a receiver for every later update
    pub async fn track_parameters_update(&self) -> DataFeed {
        let pending = self.pending.lock().await;
        DataFeed {
            snapshot: pending.as_ref().map(PendingParameters::info),
            updates: self.updates_tx.subscribe(),
        }
    }

    /// Accept the pending update: persist it for the next restart and
    /// acknowledge it to the network map with `sign(hash)`.
    pub async fn accept_new_network_parameters<F>(
        &self,
        parameters_hash: SecureHash,
        sign: F,
    ) -> Result<(), UpdaterError>
    where
        F: FnOnce(&SecureHash) -> SignedHash + Send,
    {
        let client = self.client.as_deref().ok_or(UpdaterError::Unsupported)?;

        let pending = self.pending.lock().await;
        let tracked = pending
            .as_ref()
            .ok_or(UpdaterError::NotFound(parameters_hash))?;

        // Recomputed from the verified parameters
        let verified = verify_network_parameters(&tracked.signed, &client.trusted_root())?;
        let advertised = network_parameters_hash(&verified)?;
        if advertised != parameters_hash {
            return Err(UpdaterError::Mismatch {
                requested: parameters_hash,
                advertised,
            });
        }

        self.store.write_accepted(&tracked.signed)?;
        info!("Accepted network parameters update {}", parameters_hash);
        client.ack_parameters_update(sign(&parameters_hash)).await?;
        Ok(())
    }

    /// Wait until polling ends in a flag day
    pub async fn wait_for_flag_day(&self) -> FlagDay {
        let mut rx = self.flag_day_tx.subscribe();
        if let Ok(value) = rx.wait_for(Option::is_some).await {
            if let Some(flag_day) = value.clone() {
                return flag_day;
            }
        }
        std::future::pending().await
    }

    /// Stop the local feed, let an in-flight cycle finish within the grace
    /// period, then cancel the worker.
    pub async fn close(&self) {
        let (feed, poller) = {
            let mut tasks = self.tasks.lock();
            (tasks.feed.take(), tasks.poller.take())
        };
        if let Some(feed) = feed {
            feed.abort();
        }
        self.shutdown_tx.send_replace(true);

        if let Some(mut poller) = poller {
            if tokio::time::timeout(self.shutdown_grace, &mut poller)
                .await
                .is_err()
            {
                warn!(
                    "Network map poll did not finish within {:?}, cancelling",
                    self.shutdown_grace
                );
                poller.abort();
            }
        }
        info!("Network map updater closed");
    }
}

fn is_same_update(pending: &Option<PendingParameters>, hash: &SecureHash) -> bool {
    pending
        .as_ref()
        .map(|p| p.update.new_parameters_hash == *hash)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::membership::PersistentNetworkMapCache;
    use crate::storage::Storage;
    use async_trait::async_trait;
    use netmap_core::crypto::{
        certify_network_map_key, node_info_hash, sign_network_parameters, sign_node_info,
        signed_parameters_hash, verify_signed_hash,
    };
    use netmap_core::KeyPair;
    use parking_lot::Mutex as SyncMutex;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::{tempdir, TempDir};
    use tokio::sync::{mpsc, Notify};
    use tokio::time::Instant;

    const CURRENT: SecureHash = SecureHash([0xaa; 32]);

    // ---------------------------------------------------------------------
    // Fakes
    // ---------------------------------------------------------------------

    #[derive(Default)]
    struct FakeState {
        network_map: NetworkMap,
        cache_timeout: Duration,
        fail_map: bool,
        map_delay: Duration,
        nodes: HashMap<SecureHash, SignedNodeInfo>,
        parameters: HashMap<SecureHash, SignedNetworkParameters>,
        acks: Vec<SignedHash>,
        map_calls: Vec<Instant>,
    }

    /// Holds a call until released, once closed
    #[derive(Default)]
    struct Gate {
        entered: Notify,
        release: SyncMutex<Option<Arc<Notify>>>,
    }

    impl Gate {
        fn close(&self) -> Arc<Notify> {
            let release = Arc::new(Notify::new());
            *self.release.lock() = Some(release.clone());
            release
        }

        async fn pass(&self) {
            let release = self.release.lock().clone();
            self.entered.notify_one();
            if let Some(release) = release {
                release.notified().await;
            }
        }
    }

    struct FakeClient {
        root: Bytes32,
        state: SyncMutex<FakeState>,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        parameter_fetches: AtomicUsize,
        parameters_gate: Gate,
        ack_gate: Gate,
    }

    impl FakeClient {
        fn new(root: Bytes32) -> Self {
            Self {
                root,
                state: SyncMutex::new(FakeState {
                    network_map: NetworkMap {
                        network_parameter_hash: CURRENT,
                        ..NetworkMap::default()
                    },
                    cache_timeout: Duration::from_secs(10),
                    ..FakeState::default()
                }),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
                parameter_fetches: AtomicUsize::new(0),
                parameters_gate: Gate::default(),
                ack_gate: Gate::default(),
            }
        }
    }

    #[async_trait]
    impl NetworkMapClient for FakeClient {
        async fn get_network_map(&self) -> Result<NetworkMapResponse, ClientError> {
            let now_in_flight = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now_in_flight, Ordering::SeqCst);
            let (delay, fail) = {
                let mut state = self.state.lock();
                state.map_calls.push(Instant::now());
                (state.map_delay, state.fail_map)
            };
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            if fail {
                return Err(ClientError::ConnectionClosed);
            }
            let state = self.state.lock();
            Ok(NetworkMapResponse {
                network_map: state.network_map.clone(),
                cache_timeout: state.cache_timeout,
            })
        }

        async fn get_node_info(&self, hash: &SecureHash) -> Result<SignedNodeInfo, ClientError> {
            self.state
                .lock()
                .nodes
                .get(hash)
                .cloned()
                .ok_or_else(|| ClientError::Remote(format!("unknown node info {}", hash)))
        }

        async fn get_network_parameters(
            &self,
            hash: &SecureHash,
        ) -> Result<SignedNetworkParameters, ClientError> {
            self.parameter_fetches.fetch_add(1, Ordering::SeqCst);
            self.parameters_gate.pass().await;
            self.state
                .lock()
                .parameters
                .get(hash)
                .cloned()
                .ok_or_else(|| ClientError::Remote(format!("unknown parameters {}", hash)))
        }

        async fn ack_parameters_update(&self, signed_hash: SignedHash) -> Result<(), ClientError> {
            self.ack_gate.pass().await;
            self.state.lock().acks.push(signed_hash);
            Ok(())
        }

        fn trusted_root(&self) -> Bytes32 {
            self.root
        }
    }

    struct FakeSource {
        pending: SyncMutex<HashSet<SecureHash>>,
        feed: SyncMutex<Option<mpsc::Receiver<SignedNodeInfo>>>,
    }

    impl FakeSource {
        fn new() -> (Self, mpsc::Sender<SignedNodeInfo>) {
            let (tx, rx) = mpsc::channel(16);
            (
                Self {
                    pending: SyncMutex::new(HashSet::new()),
                    feed: SyncMutex::new(Some(rx)),
                },
                tx,
            )
        }
    }

    impl LocalMembershipSource for FakeSource {
        fn node_info_updates(&self) -> mpsc::Receiver<SignedNodeInfo> {
            self.feed
                .lock()
                .take()
                .unwrap_or_else(|| mpsc::channel(1).1)
        }

        fn processed_node_info_hashes(&self) -> HashSet<SecureHash> {
            self.pending.lock().clone()
        }
    }

    struct Harness {
        updater: Arc<NetworkMapUpdater>,
        client: Arc<FakeClient>,
        source: Arc<FakeSource>,
        cache: Arc<PersistentNetworkMapCache>,
        store: ParametersStore,
        local_tx: mpsc::Sender<SignedNodeInfo>,
        root: KeyPair,
        network_map_key: KeyPair,
        _dir: TempDir,
    }

    fn harness_with(remote: bool) -> Harness {
        let dir = tempdir().unwrap();
        let storage = Arc::new(Storage::open(dir.path().join("db")).unwrap());
        let cache = Arc::new(PersistentNetworkMapCache::new(storage));
        let (source, local_tx) = FakeSource::new();
        let source = Arc::new(source);
        let store = ParametersStore::new(dir.path());
        let root = KeyPair::from_seed(&[1; 32]);
        let network_map_key = KeyPair::from_seed(&[2; 32]);
        let client = Arc::new(FakeClient::new(root.public_key()));

        let updater = NetworkMapUpdater::new(
            cache.clone(),
            source.clone(),
            if remote {
                Some(client.clone() as Arc<dyn NetworkMapClient>)
            } else {
                None
            },
            CURRENT,
            store.clone(),
        );

        Harness {
            updater: Arc::new(updater),
            client,
            source,
            cache,
            store,
            local_tx,
            root,
            network_map_key,
            _dir: dir,
        }
    }

    fn harness() -> Harness {
        harness_with(true)
    }

    fn node(seed: u8) -> SignedNodeInfo {
        node_with_serial(seed, 1)
    }

    fn node_with_serial(seed: u8, serial: u64) -> SignedNodeInfo {
        let identity = KeyPair::from_seed(&[seed; 32]);
        sign_node_info(
            NodeInfo {
                identity_key: identity.public_key(),
                legal_name: format!("O=Node {}, L=New York, C=US", seed),
                addresses: vec![format!("10.1.0.{}:10002", seed)],
                platform_version: 4,
                serial,
            },
            &identity,
        )
        .unwrap()
    }

    impl Harness {
        fn signed_parameters(&self, epoch: u32) -> SignedNetworkParameters {
            let cert = certify_network_map_key(&self.root, &self.network_map_key.public_key());
            sign_network_parameters(
                NetworkParameters {
                    minimum_platform_version: 4,
                    notaries: vec![],
                    max_message_size: 10_485_760,
                    max_transaction_size: 524_288_000,
                    modified_time: 1_700_000_000_000 + epoch as u64,
                    epoch,
                },
                &self.network_map_key,
                cert,
            )
            .unwrap()
        }

        /// Publish parameters on the fake server and announce them as an update
        fn announce_update(&self, epoch: u32) -> SecureHash {
            let signed = self.signed_parameters(epoch);
            let hash = signed_parameters_hash(&signed);
            let mut state = self.client.state.lock();
            state.parameters.insert(hash, signed);
            state.network_map.parameters_update = Some(ParametersUpdate {
                new_parameters_hash: hash,
                description: format!("Move to epoch {}", epoch),
                update_deadline: 1_800_000_000_000,
            });
            hash
        }

        fn publish_remote(&self, node: &SignedNodeInfo) -> SecureHash {
            let hash = node_info_hash(node);
            let mut state = self.client.state.lock();
            state.nodes.insert(hash, node.clone());
            state.network_map.node_info_hashes.push(hash);
            hash
        }

        fn hashes(&self) -> HashSet<SecureHash> {
            self.cache.all_node_hashes().unwrap()
        }
    }

    // ---------------------------------------------------------------------
    // Subscription
    // ---------------------------------------------------------------------

    #[tokio::test]
    async fn test_subscribe_twice_fails() {
        let h = harness();
        h.updater.subscribe_to_network_map().unwrap();
        assert!(matches!(
            h.updater.subscribe_to_network_map(),
            Err(UpdaterError::InvalidState)
        ));
        h.updater.close().await;
    }

    #[tokio::test]
    async fn test_local_feed_reaches_cache() {
        let h = harness_with(false);
        assert!(h.updater.is_local_only());
        h.updater.subscribe_to_network_map().unwrap();

        let entry = node(1);
        h.local_tx.send(entry.clone()).await.unwrap();

        let hash = node_info_hash(&entry);
        let deadline = Instant::now() + Duration::from_secs(5);
        while !h.hashes().contains(&hash) {
            assert!(Instant::now() < deadline, "local entry never reached the cache");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        // Local-only: nothing polled
        assert!(h.client.state.lock().map_calls.is_empty());
        h.updater.close().await;
    }

    // ---------------------------------------------------------------------
    // Reconciliation
    // ---------------------------------------------------------------------

    #[tokio::test]
    async fn test_reconcile_adds_and_removes() {
        let h = harness();
        let (a, b, c, d, e, f) = (node(1), node(2), node(3), node(4), node(5), node(6));
        for entry in [&a, &b, &c, &d] {
            h.cache.add_node((*entry).clone()).unwrap();
        }
        // c came from the local directory and is not yet on the network map
        h.source.pending.lock().insert(node_info_hash(&c));

        h.publish_remote(&a);
        h.publish_remote(&e);
        // f is listed but the download fails
        h.client
            .state
            .lock()
            .network_map
            .node_info_hashes
            .push(node_info_hash(&f));

        let outcome = h.updater.poll_once().await.unwrap();
        assert_eq!(outcome, PollOutcome::Reschedule(Duration::from_secs(10)));

        let expected: HashSet<_> = [&a, &c, &e].iter().map(|n| node_info_hash(n)).collect();
        assert_eq!(h.hashes(), expected);
    }

    #[tokio::test]
    async fn test_reconcile_is_idempotent() {
        let h = harness();
        let a = node(1);
        h.publish_remote(&a);

        h.updater.poll_once().await.unwrap();
        h.updater.poll_once().await.unwrap();
        assert_eq!(h.hashes(), HashSet::from([node_info_hash(&a)]));
    }

    #[tokio::test]
    async fn test_reconcile_stats() {
        let h = harness();
        let stale = node(9);
        h.cache.add_node(stale).unwrap();
        h.publish_remote(&node(1));
        h.client
            .state
            .lock()
            .network_map
            .node_info_hashes
            .push(SecureHash([7; 32]));

        let network_map = h.client.state.lock().network_map.clone();
        let stats = h
            .updater
            .reconcile(h.client.as_ref(), &network_map)
            .await
            .unwrap();
        assert_eq!(
            stats,
            ReconcileStats {
                added: 1,
                skipped: 1,
                removed: 1
            }
        );
    }

    #[tokio::test]
    async fn test_reconcile_skips_superseded_entry() {
        let h = harness();
        let newer = node_with_serial(5, 2);
        let older = node_with_serial(5, 1);
        h.cache.add_node(newer.clone()).unwrap();
        h.publish_remote(&newer);
        h.publish_remote(&older);

        let network_map = h.client.state.lock().network_map.clone();
        for _ in 0..2 {
            let stats = h
                .updater
                .reconcile(h.client.as_ref(), &network_map)
                .await
                .unwrap();
            assert_eq!(
                stats,
                ReconcileStats {
                    added: 0,
                    skipped: 1,
                    removed: 0
                }
            );
        }
        assert_eq!(h.hashes(), HashSet::from([node_info_hash(&newer)]));
    }

    // ---------------------------------------------------------------------
    // Scheduling
    // ---------------------------------------------------------------------

    #[tokio::test]
    async fn test_cycle_delay_success_and_failure() {
        let h = harness();
        assert_eq!(
            h.updater.run_cycle().await,
            PollOutcome::Reschedule(Duration::from_secs(10))
        );

        h.client.state.lock().fail_map = true;
        assert_eq!(
            h.updater.run_cycle().await,
            PollOutcome::Reschedule(DEFAULT_RETRY_INTERVAL)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_cycles_never_overlap() {
        let h = harness();
        {
            let mut state = h.client.state.lock();
            // Each poll takes longer than the cache timeout
            state.map_delay = Duration::from_secs(90);
            state.cache_timeout = Duration::from_secs(10);
        }
        h.updater.subscribe_to_network_map().unwrap();
        tokio::time::sleep(Duration::from_secs(350)).await;

        assert_eq!(h.client.max_in_flight.load(Ordering::SeqCst), 1);
        let calls = h.client.state.lock().map_calls.clone();
        assert!(calls.len() >= 3);
        for pair in calls.windows(2) {
            assert!(pair[1] - pair[0] >= Duration::from_secs(100));
        }
        h.updater.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_poll_retries_after_default_interval() {
        let h = harness();
        h.client.state.lock().fail_map = true;
        h.updater.subscribe_to_network_map().unwrap();

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(h.client.state.lock().map_calls.len(), 1);

        tokio::time::sleep(Duration::from_secs(60)).await;
        let calls = h.client.state.lock().map_calls.clone();
        assert_eq!(calls.len(), 2);
        assert!(calls[1] - calls[0] >= DEFAULT_RETRY_INTERVAL);
        h.updater.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_cancels_after_grace() {
        let base = harness();
        let h = Harness {
            updater: Arc::new(
                NetworkMapUpdater::new(
                    base.cache.clone(),
                    base.source.clone(),
                    Some(base.client.clone() as Arc<dyn NetworkMapClient>),
                    CURRENT,
                    base.store.clone(),
                )
                .with_shutdown_grace(Duration::from_secs(5)),
            ),
            ..base
        };
        h.client.state.lock().map_delay = Duration::from_secs(3600);
        h.updater.subscribe_to_network_map().unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;

        let started = Instant::now();
        h.updater.close().await;
        let waited = Instant::now() - started;
        assert!(waited >= Duration::from_secs(5));
        assert!(waited < Duration::from_secs(3600));
    }

    // ---------------------------------------------------------------------
    // Parameters updates
    // ---------------------------------------------------------------------

    #[tokio::test]
    async fn test_update_is_tracked_and_broadcast_once() {
        let h = harness();
        let mut feed = h.updater.track_parameters_update().await;
        assert!(feed.snapshot.is_none());

        let hash = h.announce_update(2);
        h.updater.poll_once().await.unwrap();
        h.updater.poll_once().await.unwrap();

        let notice = feed.updates.try_recv().unwrap();
        assert_eq!(notice.hash, hash);
        assert_eq!(notice.parameters.epoch, 2);
        assert_eq!(notice.description, "Move to epoch 2");
        // Re-delivery of the same update is a no-op
        assert!(feed.updates.try_recv().is_err());
        assert_eq!(h.client.parameter_fetches.load(Ordering::SeqCst), 1);

        assert_eq!(h.updater.current_parameters_update().await, Some(notice));
    }

    #[tokio::test]
    async fn test_snapshot_then_future_updates() {
        let h = harness();
        let first = h.announce_update(2);
        h.updater.poll_once().await.unwrap();

        let mut feed = h.updater.track_parameters_update().await;
        assert_eq!(feed.snapshot.as_ref().map(|s| s.hash), Some(first));
        // The snapshot is not replayed on the receiver
        assert!(feed.updates.try_recv().is_err());

        let second = h.announce_update(3);
        h.updater.poll_once().await.unwrap();
        assert_eq!(feed.updates.try_recv().unwrap().hash, second);
        assert_eq!(
            h.updater.current_parameters_update().await.map(|u| u.hash),
            Some(second)
        );
    }

    #[tokio::test]
    async fn test_unverifiable_update_fails_cycle() {
        let h = harness();
        let hash = h.announce_update(2);
        {
            let mut state = h.client.state.lock();
            let forged = state.parameters.get_mut(&hash).unwrap();
            forged.signature[0] ^= 0xff;
        }

        assert!(matches!(
            h.updater.poll_once().await,
            Err(UpdaterError::Verification(_))
        ));
        assert!(h.updater.current_parameters_update().await.is_none());
        assert_eq!(
            h.updater.run_cycle().await,
            PollOutcome::Reschedule(DEFAULT_RETRY_INTERVAL)
        );
    }

    // ---------------------------------------------------------------------
    // Flag day
    // ---------------------------------------------------------------------

    #[tokio::test]
    async fn test_flag_day_after_acceptance_exits_zero() {
        let h = harness();
        let advertised = h.signed_parameters(2);
        let advertised_hash = signed_parameters_hash(&advertised);
        h.store.write_accepted(&advertised).unwrap();
        h.client.state.lock().network_map.network_parameter_hash = advertised_hash;

        let outcome = h.updater.poll_once().await.unwrap();
        let flag_day = FlagDay::Reached {
            parameters_hash: advertised_hash,
        };
        assert_eq!(outcome, PollOutcome::FlagDay(flag_day.clone()));
        assert_eq!(flag_day.exit_code(), 0);
    }

    #[tokio::test]
    async fn test_flag_day_without_acceptance_exits_one() {
        let h = harness();
        let advertised_hash = signed_parameters_hash(&h.signed_parameters(2));
        h.client.state.lock().network_map.network_parameter_hash = advertised_hash;

        match h.updater.poll_once().await.unwrap() {
            PollOutcome::FlagDay(flag_day) => {
                assert_eq!(flag_day.exit_code(), 1);
                assert_eq!(
                    flag_day,
                    FlagDay::Diverged {
                        running: CURRENT,
                        advertised: advertised_hash,
                        accepted: None
                    }
                );
            }
            other => panic!("expected flag day, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_flag_day_with_other_acceptance_exits_one() {
        let h = harness();
        let accepted = h.signed_parameters(3);
        h.store.write_accepted(&accepted).unwrap();
        let advertised_hash = signed_parameters_hash(&h.signed_parameters(2));
        h.client.state.lock().network_map.network_parameter_hash = advertised_hash;

        match h.updater.poll_once().await.unwrap() {
            PollOutcome::FlagDay(FlagDay::Diverged { accepted: got, .. }) => {
                assert_eq!(got, Some(signed_parameters_hash(&accepted)));
            }
            other => panic!("expected divergence, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_flag_day_skips_reconciliation() {
        let h = harness();
        let a = node(1);
        h.publish_remote(&a);
        h.client.state.lock().network_map.network_parameter_hash = SecureHash([0xbb; 32]);

        h.updater.poll_once().await.unwrap();
        assert!(h.hashes().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_poller_stops_on_flag_day() {
        let h = harness();
        h.client.state.lock().network_map.network_parameter_hash = SecureHash([0xbb; 32]);
        h.updater.subscribe_to_network_map().unwrap();

        let flag_day = h.updater.wait_for_flag_day().await;
        assert_eq!(flag_day.exit_code(), 1);

        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(h.client.state.lock().map_calls.len(), 1);
        h.updater.close().await;
    }

    // ---------------------------------------------------------------------
    // Accepting updates
    // ---------------------------------------------------------------------

    #[tokio::test]
    async fn test_accept_without_network_map() {
        let h = harness_with(false);
        let node_key = KeyPair::from_seed(&[3; 32]);
        let result = h
            .updater
            .accept_new_network_parameters(SecureHash([1; 32]), |hash| node_key.sign_hash(hash))
            .await;
        assert!(matches!(result, Err(UpdaterError::Unsupported)));
    }

    #[tokio::test]
    async fn test_accept_without_pending_update() {
        let h = harness();
        let node_key = KeyPair::from_seed(&[3; 32]);
        let result = h
            .updater
            .accept_new_network_parameters(SecureHash([1; 32]), |hash| node_key.sign_hash(hash))
            .await;
        assert!(matches!(result, Err(UpdaterError::NotFound(_))));
        assert!(h.store.read_accepted().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_accept_hash_mismatch_has_no_effect() {
        let h = harness();
        let advertised = h.announce_update(2);
        h.updater.poll_once().await.unwrap();

        let stale = signed_parameters_hash(&h.signed_parameters(1));
        let node_key = KeyPair::from_seed(&[3; 32]);
        let result = h
            .updater
            .accept_new_network_parameters(stale, |hash| node_key.sign_hash(hash))
            .await;

        match result {
            Err(UpdaterError::Mismatch {
                requested,
                advertised: got,
            }) => {
                assert_eq!(requested, stale);
                assert_eq!(got, advertised);
            }
            other => panic!("expected mismatch, got {:?}", other),
        }
        assert!(!h.store.update_file().exists());
        assert!(h.client.state.lock().acks.is_empty());
    }

    #[tokio::test]
    async fn test_accept_persists_and_acknowledges() {
        let h = harness();
        let hash = h.announce_update(2);
        h.updater.poll_once().await.unwrap();

        let node_key = KeyPair::from_seed(&[3; 32]);
        let sign_calls = AtomicUsize::new(0);
        h.updater
            .accept_new_network_parameters(hash, |hash| {
                sign_calls.fetch_add(1, Ordering::SeqCst);
                node_key.sign_hash(hash)
            })
            .await
            .unwrap();

        assert_eq!(sign_calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.store.accepted_hash().unwrap(), Some(hash));

        let acks = h.client.state.lock().acks.clone();
        assert_eq!(acks.len(), 1);
        assert_eq!(acks[0].hash, hash);
        assert_eq!(acks[0].signer_public_key, node_key.public_key());
        assert!(verify_signed_hash(&acks[0]).is_ok());
    }

    #[tokio::test]
    async fn test_accepted_update_reaches_flag_day() {
        let h = harness();
        let hash = h.announce_update(2);
        h.updater.poll_once().await.unwrap();

        let node_key = KeyPair::from_seed(&[3; 32]);
        h.updater
            .accept_new_network_parameters(hash, |hash| node_key.sign_hash(hash))
            .await
            .unwrap();

        // Network switches over
        h.client.state.lock().network_map.network_parameter_hash = hash;
        assert_eq!(
            h.updater.poll_once().await.unwrap(),
            PollOutcome::FlagDay(FlagDay::Reached {
                parameters_hash: hash
            })
        );
    }

    // ---------------------------------------------------------------------
    // Mutual exclusion
    // ---------------------------------------------------------------------

    const BLOCKED_FOR: Duration = Duration::from_millis(100);

    #[tokio::test]
    async fn test_update_waits_for_accept_in_flight() {
        let h = harness();
        let first = h.announce_update(2);
        h.updater.poll_once().await.unwrap();

        let release_ack = h.client.ack_gate.close();
        let updater = h.updater.clone();
        let accept = tokio::spawn(async move {
            let node_key = KeyPair::from_seed(&[3; 32]);
            updater
                .accept_new_network_parameters(first, |hash| node_key.sign_hash(hash))
                .await
        });
        h.client.ack_gate.entered.notified().await;

        // A newer update arrives while the acknowledgement is outstanding
        let second = h.announce_update(3);
        let updater = h.updater.clone();
        let mut poll = tokio::spawn(async move { updater.poll_once().await });
        assert!(tokio::time::timeout(BLOCKED_FOR, &mut poll).await.is_err());
        assert!(h.updater.pending.try_lock().is_err());

        release_ack.notify_one();
        accept.await.unwrap().unwrap();
        poll.await.unwrap().unwrap();

        assert_eq!(h.store.accepted_hash().unwrap(), Some(first));
        assert_eq!(h.client.state.lock().acks.len(), 1);
        assert_eq!(
            h.updater.current_parameters_update().await.map(|u| u.hash),
            Some(second)
        );
    }

    #[tokio::test]
    async fn test_concurrent_accepts_are_serialized() {
        let h = harness();
        let hash = h.announce_update(2);
        h.updater.poll_once().await.unwrap();

        let release_ack = h.client.ack_gate.close();
        let spawn_accept = |seed: u8| {
            let updater = h.updater.clone();
            tokio::spawn(async move {
                let node_key = KeyPair::from_seed(&[seed; 32]);
                updater
                    .accept_new_network_parameters(hash, |hash| node_key.sign_hash(hash))
                    .await
            })
        };

        let first = spawn_accept(3);
        h.client.ack_gate.entered.notified().await;
        let second = spawn_accept(4);

        // The second caller cannot write or acknowledge until the first is done
        assert!(
            tokio::time::timeout(BLOCKED_FOR, h.client.ack_gate.entered.notified())
                .await
                .is_err()
        );
        assert!(h.client.state.lock().acks.is_empty());

        release_ack.notify_one();
        first.await.unwrap().unwrap();
        h.client.ack_gate.entered.notified().await;
        assert_eq!(h.client.state.lock().acks.len(), 1);

        release_ack.notify_one();
        second.await.unwrap().unwrap();

        let acks = h.client.state.lock().acks.clone();
        assert_eq!(
            acks.iter().map(|a| a.signer_public_key).collect::<Vec<_>>(),
            vec![
                KeyPair::from_seed(&[3; 32]).public_key(),
                KeyPair::from_seed(&[4; 32]).public_key()
            ]
        );
        assert_eq!(h.store.accepted_hash().unwrap(), Some(hash));
    }

    #[tokio::test]
    async fn test_feed_subscribed_during_update_download() {
        let h = harness();
        let hash = h.announce_update(2);

        let release_download = h.client.parameters_gate.close();
        let updater = h.updater.clone();
        let poll = tokio::spawn(async move { updater.poll_once().await });
        h.client.parameters_gate.entered.notified().await;

        // Subscribed before the update is stored: no snapshot, one notice
        let mut early = h.updater.track_parameters_update().await;
        assert!(early.snapshot.is_none());

        release_download.notify_one();
        poll.await.unwrap().unwrap();

        assert_eq!(early.updates.try_recv().unwrap().hash, hash);
        assert!(early.updates.try_recv().is_err());

        // Subscribed after: snapshot only, nothing replayed
        let mut late = h.updater.track_parameters_update().await;
        assert_eq!(late.snapshot.map(|s| s.hash), Some(hash));
        assert!(late.updates.try_recv().is_err());
    }
}
