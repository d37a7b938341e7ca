//! The cluster registry: node lifecycle, ring maintenance, event dispatch.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use futures::future::join_all;
use futures::{future::RemoteHandle, FutureExt};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::frame::response::event::{Event, StatusChangeEvent};
use crate::routing::Token;
use crate::transport::connection::VerifiedKeyspaceName;
use crate::transport::connection_pool::PoolConfig;
use crate::transport::errors::QueryError;
use crate::transport::locator::{
    self, build_replica_index, KeyspaceReplicas, ReplicaSet, TokenRing,
};
use crate::transport::node::Node;
use crate::transport::topology::{Keyspace, Metadata, MetadataReader, Strategy};

// The ring is also rebuilt on a timer, so that drift (e.g. missed events)
// heals on its own.
const PERIODIC_REFRESH: Duration = Duration::from_secs(60);

/// Owns the driver's view of the cluster and the worker keeping it fresh.
/// Queries read the view by taking an `Arc<ClusterData>` snapshot.
pub(crate) struct Cluster {
    // Shared with the worker, which swaps in new snapshots.
    data: Arc<ArcSwap<ClusterData>>,

    refresh_tx: mpsc::Sender<RefreshRequest>,
    keyspace_tx: mpsc::Sender<KeyspaceRequest>,

    _worker: RemoteHandle<()>,
}

/// A nodes-grouped-by-datacenter entry.
#[derive(Clone, Debug, Default)]
pub struct Datacenter {
    pub nodes: Vec<Arc<Node>>,
    pub rack_count: usize,
}

/// An immutable snapshot of the cluster: nodes, the token ring and the
/// replica index. Published by atomic pointer swap; readers are wait-free.
#[derive(Clone, Default)]
pub struct ClusterData {
    pub(crate) known_peers: HashMap<Uuid, Arc<Node>>, // Invariant: nonempty after Cluster::new()
    pub(crate) all_nodes: Vec<Arc<Node>>,
    pub(crate) ring: TokenRing<Arc<Node>>,
    pub(crate) keyspaces: HashMap<String, Keyspace>,
    pub(crate) datacenters: HashMap<String, Datacenter>,
    pub(crate) replica_index: HashMap<String, KeyspaceReplicas>,
    pub(crate) local_dc: Option<String>,
}

struct RefreshRequest {
    done: oneshot::Sender<Result<(), QueryError>>,
}

struct KeyspaceRequest {
    keyspace: VerifiedKeyspaceName,
    done: oneshot::Sender<Result<(), QueryError>>,
}

impl Cluster {
    pub(crate) async fn new(
        initial_peers: &[SocketAddr],
        pool_config: PoolConfig,
        local_dc: Option<String>,
    ) -> Result<Cluster, QueryError> {
        let data = Arc::new(ArcSwap::from_pointee(ClusterData::default()));

        let (refresh_tx, refresh_rx) = mpsc::channel(32);
        let (keyspace_tx, keyspace_rx) = mpsc::channel(32);
        let (event_tx, event_rx) = mpsc::channel(32);

        let worker = ClusterWorker {
            data: data.clone(),
            metadata_reader: MetadataReader::new(
                initial_peers,
                pool_config.connection_config.clone(),
                event_tx,
            ),
            pool_config,
            local_dc,
            refresh_rx,
            keyspace_rx,
            event_rx,
            used_keyspace: None,
        };

        let (worker_task, worker_handle) = worker.run().remote_handle();
        tokio::spawn(worker_task);

        let cluster = Cluster {
            data,
            refresh_tx,
            keyspace_tx,
            _worker: worker_handle,
        };

        // The first refresh populates the node set; failing it fails the
        // session construction.
        cluster.refresh_metadata().await?;

        Ok(cluster)
    }

    pub(crate) fn get_data(&self) -> Arc<ClusterData> {
        self.data.load_full()
    }

    pub(crate) async fn refresh_metadata(&self) -> Result<(), QueryError> {
        let (done, confirmed) = oneshot::channel();
        self.refresh_tx
            .send(RefreshRequest { done })
            .await
            .expect("the cluster worker outlives the Cluster handle");
        confirmed
            .await
            .expect("the cluster worker answers every refresh request")
    }

    pub(crate) async fn use_keyspace(
        &self,
        keyspace: VerifiedKeyspaceName,
    ) -> Result<(), QueryError> {
        let (done, confirmed) = oneshot::channel();
        self.keyspace_tx
            .send(KeyspaceRequest { keyspace, done })
            .await
            .expect("the cluster worker outlives the Cluster handle");
        confirmed
            .await
            .expect("the cluster worker answers every keyspace request")
    }
}

impl ClusterData {
    pub(crate) async fn wait_until_all_pools_are_initialized(&self) {
        for node in self.all_nodes.iter() {
            node.wait_until_pool_initialized().await;
        }
    }

    /// Builds a snapshot out of freshly read metadata.
    ///
    /// Nodes of the previous snapshot are reused as long as their identity
    /// (host id) and coordinates (address, datacenter, rack) still match;
    /// everything else gets a new node with a new pool.
    pub(crate) fn new(
        metadata: Metadata,
        pool_config: &PoolConfig,
        known_peers: &HashMap<Uuid, Arc<Node>>,
        used_keyspace: &Option<VerifiedKeyspaceName>,
        local_dc: Option<String>,
    ) -> Self {
        let mut new_known_peers: HashMap<Uuid, Arc<Node>> =
            HashMap::with_capacity(metadata.peers.len());
        let mut all_nodes: Vec<Arc<Node>> = Vec::with_capacity(metadata.peers.len());
        let mut ring_entries: Vec<(Token, Arc<Node>)> = Vec::new();

        for peer in metadata.peers {
            let recycled = known_peers.get(&peer.host_id).filter(|node| {
                node.address == peer.address
                    && node.datacenter == peer.datacenter
                    && node.rack == peer.rack
            });
            let node: Arc<Node> = match recycled {
                Some(node) => node.clone(),
                None => Arc::new(Node::new(
                    peer.host_id,
                    peer.address,
                    pool_config.clone(),
                    peer.datacenter,
                    peer.rack,
                    used_keyspace.clone(),
                )),
            };

            new_known_peers.insert(peer.host_id, node.clone());
            all_nodes.push(node.clone());

            // Each owned token becomes one ring entry.
            for token in peer.tokens {
                ring_entries.push((token, node.clone()));
            }
        }

        let datacenters = Self::group_by_datacenter(&all_nodes);

        let ring = TokenRing::new(ring_entries.into_iter());
        let rack_count_per_dc: HashMap<String, usize> = datacenters
            .iter()
            .map(|(name, dc)| (name.clone(), dc.rack_count))
            .collect();
        let replica_index = build_replica_index(
            &ring,
            &metadata.keyspaces,
            &rack_count_per_dc,
            local_dc.as_deref(),
        );

        ClusterData {
            known_peers: new_known_peers,
            all_nodes,
            ring,
            keyspaces: metadata.keyspaces,
            datacenters,
            replica_index,
            local_dc,
        }
    }

    fn group_by_datacenter(all_nodes: &[Arc<Node>]) -> HashMap<String, Datacenter> {
        let mut datacenters: HashMap<String, Datacenter> = HashMap::new();
        for node in all_nodes {
            if let Some(dc) = &node.datacenter {
                datacenters
                    .entry(dc.clone())
                    .or_default()
                    .nodes
                    .push(node.clone());
            }
        }
        for datacenter in datacenters.values_mut() {
            let racks: HashSet<&Option<String>> =
                datacenter.nodes.iter().map(|node| &node.rack).collect();
            datacenter.rack_count = racks.len();
        }
        datacenters
    }

    /// All cluster members, in system-table order.
    pub fn get_nodes_info(&self) -> &[Arc<Node>] {
        &self.all_nodes
    }

    /// Access keyspace details collected by the driver.
    pub fn get_keyspace_info(&self) -> &HashMap<String, Keyspace> {
        &self.keyspaces
    }

    /// Access ring details collected by the driver.
    pub fn get_ring_info(&self) -> &TokenRing<Arc<Node>> {
        &self.ring
    }

    pub(crate) fn node_by_address(&self, address: SocketAddr) -> Option<&Arc<Node>> {
        self.all_nodes.iter().find(|node| node.address == address)
    }

    /// The precomputed replica set of the ring entry owning `token` under
    /// `keyspace`, when both are known.
    pub(crate) fn replicas_for_token(
        &self,
        keyspace: &str,
        token: Token,
    ) -> Option<&ReplicaSet> {
        let index = self.ring.lower_bound_index(token);
        self.replica_index.get(keyspace)?.for_ring_index(index)
    }

    /// Replicas computed on the fly for a keyspace the driver has no
    /// precomputed entry for.
    pub(crate) fn compute_replicas_for_token(
        &self,
        token: Token,
        strategy: &Strategy,
    ) -> Vec<Arc<Node>> {
        let rack_count_per_dc: HashMap<String, usize> = self
            .datacenters
            .iter()
            .map(|(name, dc)| (name.clone(), dc.rack_count))
            .collect();
        locator::replicas_for_token(&self.ring, token, strategy, &rack_count_per_dc)
    }
}

// Keeps the published ClusterData fresh: reacts to server events, serves
// explicit refresh and keyspace requests, and rebuilds periodically.
// Refreshes are serialized simply by all running on this one task.
struct ClusterWorker {
    data: Arc<ArcSwap<ClusterData>>,

    metadata_reader: MetadataReader,
    pool_config: PoolConfig,
    local_dc: Option<String>,

    refresh_rx: mpsc::Receiver<RefreshRequest>,
    keyspace_rx: mpsc::Receiver<KeyspaceRequest>,
    event_rx: mpsc::Receiver<Event>,

    // Keyspace that newly opened connections switch to.
    used_keyspace: Option<VerifiedKeyspaceName>,
}

impl ClusterWorker {
    async fn run(mut self) {
        let mut refresh_ticker = tokio::time::interval(PERIODIC_REFRESH);
        refresh_ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The interval fires immediately once; the initial refresh is driven
        // by Cluster::new instead, so spend that tick here.
        refresh_ticker.tick().await;

        loop {
            let mut reply_to: Option<oneshot::Sender<Result<(), QueryError>>> = None;

            tokio::select! {
                _ = refresh_ticker.tick() => {}
                request = self.refresh_rx.recv() => match request {
                    Some(request) => reply_to = Some(request.done),
                    // The Cluster handle is gone, and the session with it.
                    None => return,
                },
                event = self.event_rx.recv() => match event {
                    Some(event) => {
                        if !self.apply_event(event) {
                            continue;
                        }
                    }
                    // The metadata reader is gone; nothing sane is left to do.
                    None => return,
                },
                request = self.keyspace_rx.recv() => match request {
                    Some(request) => {
                        self.switch_keyspace(request);
                        continue;
                    }
                    None => return,
                },
            }

            let outcome = self.refresh().await;
            refresh_ticker.reset();
            if let Some(done) = reply_to {
                // Nobody listening is fine, the refresh already happened
                let _ = done.send(outcome);
            }
        }
    }

    // Digests one server event. Returns whether a metadata refresh is due.
    fn apply_event(&mut self, event: Event) -> bool {
        debug!("Server event: {:?}", event);
        match event {
            // Ring membership changed: rebuild.
            Event::TopologyChange(_) => true,
            // Replication of some keyspace may have changed: rebuild the
            // replica index via a full refresh.
            Event::SchemaChange(_) => true,
            // Status only flips the routing marker; the ring itself is
            // untouched and the periodic refresh reconciles the rest.
            Event::StatusChange(change) => {
                let (address, is_down) = match change {
                    StatusChangeEvent::Down(address) => (address, true),
                    StatusChangeEvent::Up(address) => (address, false),
                };
                match self.data.load().node_by_address(address) {
                    Some(node) => node.change_down_marker(is_down),
                    None => warn!("Status change for an unknown node {}", address),
                }
                false
            }
        }
    }

    async fn refresh(&mut self) -> Result<(), QueryError> {
        let current = self.data.load_full();
        let initial = current.all_nodes.is_empty();

        let metadata = self.metadata_reader.read_metadata(initial).await?;

        let fresh = Arc::new(ClusterData::new(
            metadata,
            &self.pool_config,
            &current.known_peers,
            &self.used_keyspace,
            self.local_dc.clone(),
        ));
        fresh.wait_until_all_pools_are_initialized().await;

        // One atomic swap; queries in flight keep their old snapshot.
        self.data.store(fresh);

        Ok(())
    }

    // Forwards the keyspace switch to every node. Spawned off the worker so
    // a slow node cannot stall event handling.
    fn switch_keyspace(&mut self, request: KeyspaceRequest) {
        self.used_keyspace = Some(request.keyspace.clone());

        let snapshot = self.data.load_full();
        tokio::spawn(async move {
            let switches = snapshot
                .all_nodes
                .iter()
                .map(|node| node.use_keyspace(request.keyspace.clone()));
            let outcome = combine_keyspace_outcomes(join_all(switches).await);
            let _ = request.done.send(outcome);
        });
    }
}

// One confirmed USE is enough, because nodes re-issue it for connections
// opened later; connection failures only matter when no node confirmed.
// Any error other than a connection failure condemns the keyspace itself.
fn combine_keyspace_outcomes(outcomes: Vec<Result<(), QueryError>>) -> Result<(), QueryError> {
    let mut confirmed = false;
    let mut connection_failure = None;

    for outcome in outcomes {
        match outcome {
            Ok(()) => confirmed = true,
            Err(QueryError::IoError(error)) => {
                connection_failure = Some(QueryError::IoError(error))
            }
            Err(other) => return Err(other),
        }
    }

    match connection_failure {
        Some(failure) if !confirmed => Err(failure),
        _ => Ok(()),
    }
}
