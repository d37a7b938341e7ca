//! Per-node connection pools.
//!
//! A pool holds one connection per server shard, dialed through the
//! shard-aware port so that each connection lands on its intended shard.
//! A background keeper task opens missing connections, watches the live
//! ones for fatal errors and publishes every change as an atomic snapshot.

use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::sync::{Arc, Weak};
use std::time::Duration;

use arc_swap::ArcSwap;
use futures::future::{join_all, select_all, RemoteHandle};
use futures::FutureExt;
use tokio::sync::{mpsc, oneshot, Notify};
use tracing::{debug, trace, warn};

use crate::routing::{Shard, Sharder, Token};
use crate::transport::connection::{
    self, Connection, ConnectionConfig, ErrorReceiver, VerifiedKeyspaceName,
};
use crate::transport::errors::QueryError;

/// The target size of a per-node connection pool.
#[derive(Debug, Clone, Copy)]
pub enum PoolSize {
    /// Open the given number of connections to the node, letting the server
    /// spread them over shards however it likes. Use when the shard-aware
    /// port cannot be reached.
    PerHost(NonZeroUsize),

    /// Open the given number of connections to every shard of the node.
    /// Nodes that don't advertise sharding count as having one shard.
    /// `PerShard(1)` is the recommended setting.
    PerShard(NonZeroUsize),
}

impl Default for PoolSize {
    fn default() -> Self {
        PoolSize::PerShard(NonZeroUsize::new(1).unwrap())
    }
}

#[derive(Clone, Default)]
pub(crate) struct PoolConfig {
    pub connection_config: ConnectionConfig,
    pub pool_size: PoolSize,
    pub can_use_shard_aware_port: bool,
}

// Reconnection backoff bounds.
const FIRST_RETRY_DELAY: Duration = Duration::from_millis(50);
const MAX_RETRY_DELAY: Duration = Duration::from_secs(10);

/// What queries currently see of the pool.
enum PoolState {
    /// The first fill has not produced a connection yet.
    Connecting,
    /// Everything is down; the keeper keeps retrying with backoff. Carries
    /// the most recent connection error.
    Broken(QueryError),
    Working(WorkingPool),
}

/// An immutable snapshot of the usable connections, grouped by shard.
#[derive(Clone)]
struct WorkingPool {
    sharder: Option<Sharder>,
    shards: Vec<Vec<Arc<Connection>>>,
}

impl WorkingPool {
    fn all(&self) -> impl Iterator<Item = &Arc<Connection>> {
        self.shards.iter().flatten()
    }

    fn least_busy(&self) -> Option<Arc<Connection>> {
        self.all()
            .min_by_key(|connection| connection.active_requests())
            .cloned()
    }

    fn for_token(&self, token: Token) -> Option<Arc<Connection>> {
        let sharder = match &self.sharder {
            Some(sharder) => sharder,
            None => return self.least_busy(),
        };

        // The shard owning the token first; when its slot happens to be
        // empty any other connection still reaches the data.
        let shard = sharder.shard_of(token) as usize;
        trace!(token = token.value, shard, "Selecting connection for token");
        let preferred = self.shards.get(shard).and_then(|slot| {
            slot.iter()
                .min_by_key(|connection| connection.active_requests())
                .cloned()
        });
        preferred.or_else(|| self.least_busy())
    }
}

struct KeyspaceRequest {
    keyspace: VerifiedKeyspaceName,
    done: oneshot::Sender<Result<(), QueryError>>,
}

#[derive(Clone)]
pub(crate) struct NodeConnectionPool {
    state: Arc<ArcSwap<PoolState>>,
    keyspace_tx: mpsc::Sender<KeyspaceRequest>,
    ready_notify: Arc<Notify>,
    _keeper: Arc<RemoteHandle<()>>,
}

impl std::fmt::Debug for NodeConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeConnectionPool").finish_non_exhaustive()
    }
}

impl NodeConnectionPool {
    pub(crate) fn new(
        address: SocketAddr,
        pool_config: PoolConfig,
        keyspace: Option<VerifiedKeyspaceName>,
    ) -> Self {
        let state = Arc::new(ArcSwap::new(Arc::new(PoolState::Connecting)));
        let ready_notify = Arc::new(Notify::new());
        let (keyspace_tx, keyspace_rx) = mpsc::channel(1);

        let keeper = PoolKeeper {
            address,
            config: pool_config,
            keyspace,
            state: state.clone(),
            ready_notify: ready_notify.clone(),
            sharder: None,
            shard_aware_port: None,
            shards: vec![Vec::new()],
            monitors: Vec::new(),
            retry_delay: FIRST_RETRY_DELAY,
            last_error: None,
        };

        let (keeper_task, keeper_handle) = keeper.run(keyspace_rx).remote_handle();
        tokio::spawn(keeper_task);

        Self {
            state,
            keyspace_tx,
            ready_notify,
            _keeper: Arc::new(keeper_handle),
        }
    }

    pub(crate) fn sharder(&self) -> Option<Sharder> {
        match &**self.state.load() {
            PoolState::Working(pool) => pool.sharder.clone(),
            _ => None,
        }
    }

    /// The connection to the shard owning the token, per the server's
    /// shard-selection function.
    pub(crate) fn connection_for_token(&self, token: Token) -> Result<Arc<Connection>, QueryError> {
        self.pick(|pool| pool.for_token(token))
    }

    /// The connection with the fewest requests in flight; ties broken
    /// arbitrarily.
    pub(crate) fn least_busy_connection(&self) -> Result<Arc<Connection>, QueryError> {
        self.pick(WorkingPool::least_busy)
    }

    pub(crate) fn get_working_connections(&self) -> Result<Vec<Arc<Connection>>, QueryError> {
        match &**self.state.load() {
            PoolState::Working(pool) => Ok(pool.all().cloned().collect()),
            other => Err(Self::unusable(other)),
        }
    }

    pub(crate) async fn use_keyspace(
        &self,
        keyspace: VerifiedKeyspaceName,
    ) -> Result<(), QueryError> {
        let (done, confirmed) = oneshot::channel();
        self.keyspace_tx
            .send(KeyspaceRequest { keyspace, done })
            .await
            .map_err(|_| keeper_gone())?;
        confirmed.await.map_err(|_| keeper_gone())?
    }

    /// Resolves once the first fill attempt finished, successfully or not.
    pub(crate) async fn wait_until_initialized(&self) {
        // Register interest before looking, otherwise a snapshot published
        // in between would be missed.
        let publication = self.ready_notify.notified();
        if let PoolState::Connecting = &**self.state.load() {
            publication.await;
        }
    }

    fn pick(
        &self,
        choose: impl FnOnce(&WorkingPool) -> Option<Arc<Connection>>,
    ) -> Result<Arc<Connection>, QueryError> {
        match &**self.state.load() {
            PoolState::Working(pool) => {
                // A published Working pool always holds a connection
                choose(pool).ok_or_else(keeper_gone)
            }
            other => Err(Self::unusable(other)),
        }
    }

    fn unusable(state: &PoolState) -> QueryError {
        let message = match state {
            PoolState::Connecting => "The pool is still opening its first connection".to_string(),
            PoolState::Broken(err) => {
                format!("All connections to the node are down, last error: {}", err)
            }
            PoolState::Working(_) => unreachable!("Working pools are usable"),
        };
        QueryError::IoError(Arc::new(std::io::Error::new(
            std::io::ErrorKind::Other,
            message,
        )))
    }
}

fn keeper_gone() -> QueryError {
    QueryError::IoError(Arc::new(std::io::Error::new(
        std::io::ErrorKind::Other,
        "Connection pool was shut down",
    )))
}

// Pairs a pooled connection with the channel announcing its fatal error.
struct ConnectionMonitor {
    connection: Weak<Connection>,
    fatal: ErrorReceiver,
}

struct PoolKeeper {
    address: SocketAddr,
    config: PoolConfig,
    keyspace: Option<VerifiedKeyspaceName>,

    state: Arc<ArcSwap<PoolState>>,
    ready_notify: Arc<Notify>,

    // Learned from the first connection's SUPPORTED options.
    sharder: Option<Sharder>,
    shard_aware_port: Option<u16>,

    shards: Vec<Vec<Arc<Connection>>>,
    monitors: Vec<ConnectionMonitor>,

    retry_delay: Duration,
    last_error: Option<QueryError>,
}

impl PoolKeeper {
    async fn run(mut self, mut keyspace_rx: mpsc::Receiver<KeyspaceRequest>) {
        debug!("[{}] Pool keeper started", self.address);

        loop {
            if self.missing_connection_count() > 0 {
                self.fill().await;
                self.publish();
            }

            // Sleep until something changes: a connection dying, a keyspace
            // switch, or the retry timer when the pool is not full yet.
            tokio::select! {
                request = keyspace_rx.recv() => match request {
                    Some(request) => self.switch_keyspace(request).await,
                    // All pool handles are gone, and with them the node.
                    None => return,
                },
                broken = Self::next_broken(&mut self.monitors), if !self.monitors.is_empty() => {
                    self.discard(broken);
                }
                _ = tokio::time::sleep(self.retry_delay), if self.missing_connection_count() > 0 => {}
            }
        }
    }

    // Opens connections until the pool reaches its target size. The first
    // connection doubles as a probe: it teaches us the shard parameters and
    // whether the node is alive at all, so nothing is opened in parallel
    // with it.
    async fn fill(&mut self) {
        self.last_error = None;

        if self.connection_count() == 0 {
            let probe = self.open(None).await;
            match probe {
                Ok(opened) => self.adopt(opened),
                Err(error) => {
                    self.note_fill_error(error);
                    return;
                }
            }
        }

        let wanted = self.missing_shards();
        if !wanted.is_empty() {
            trace!(
                "[{}] Opening {} more connections",
                self.address,
                wanted.len()
            );
            let outcomes = join_all(wanted.into_iter().map(|shard| self.open(shard))).await;
            for outcome in outcomes {
                match outcome {
                    Ok(opened) => self.adopt(opened),
                    Err(error) => self.note_fill_error(error),
                }
            }
        }

        if self.missing_connection_count() == 0 {
            self.retry_delay = FIRST_RETRY_DELAY;
        }
    }

    // Which shards still want a connection. `None` entries stand for
    // connections whose shard the server will choose.
    fn missing_shards(&self) -> Vec<Option<Shard>> {
        let per_slot_target = self.per_slot_target();
        let shard_aware = self.config.can_use_shard_aware_port
            && self.sharder.is_some()
            && self.shard_aware_port.is_some()
            && matches!(self.config.pool_size, PoolSize::PerShard(_));

        match self.config.pool_size {
            PoolSize::PerHost(target) => {
                let deficit = target.get().saturating_sub(self.connection_count());
                std::iter::repeat(None).take(deficit).collect()
            }
            PoolSize::PerShard(_) => self
                .shards
                .iter()
                .enumerate()
                .flat_map(|(shard, slot)| {
                    let deficit = per_slot_target.saturating_sub(slot.len());
                    let target = shard_aware.then_some(shard as Shard);
                    std::iter::repeat(target).take(deficit)
                })
                .collect(),
        }
    }

    fn per_slot_target(&self) -> usize {
        match self.config.pool_size {
            PoolSize::PerHost(target) | PoolSize::PerShard(target) => target.get(),
        }
    }

    fn connection_count(&self) -> usize {
        self.shards.iter().map(Vec::len).sum()
    }

    fn missing_connection_count(&self) -> usize {
        match self.config.pool_size {
            PoolSize::PerHost(target) => target.get().saturating_sub(self.connection_count()),
            PoolSize::PerShard(_) => self.missing_shards().len(),
        }
    }

    // Opens one connection, for a specific shard when requested and
    // possible, and brings it onto the pool's keyspace.
    async fn open(
        &self,
        shard: Option<Shard>,
    ) -> Result<(Connection, ErrorReceiver), QueryError> {
        let opened = match (shard, &self.sharder, self.shard_aware_port) {
            (Some(shard), Some(sharder), Some(port)) => {
                match self.open_via_shard_port(shard, sharder, port).await {
                    Ok(opened) => Ok(opened),
                    Err(error) => {
                        // The shard-aware port may be firewalled while the
                        // regular port works; let the server pick the shard.
                        debug!(
                            "[{}] Shard-aware dial to shard {} failed ({}), retrying on the regular port",
                            self.address, shard, error
                        );
                        self.open_plain().await
                    }
                }
            }
            _ => self.open_plain().await,
        }?;

        if let Some(keyspace) = &self.keyspace {
            opened.0.use_keyspace(keyspace).await?;
        }
        Ok(opened)
    }

    async fn open_plain(&self) -> Result<(Connection, ErrorReceiver), QueryError> {
        connection::open_connection(self.address, None, self.config.connection_config.clone())
            .await
    }

    // Walks candidate local ports whose `port mod shard_count` lands on the
    // shard; ports already taken are skipped, full exhaustion means no port
    // is available for this shard.
    async fn open_via_shard_port(
        &self,
        shard: Shard,
        sharder: &Sharder,
        shard_aware_port: u16,
    ) -> Result<(Connection, ErrorReceiver), QueryError> {
        let target = SocketAddr::new(self.address.ip(), shard_aware_port);

        for source_port in sharder.iter_source_ports_for_shard(shard) {
            let attempt = connection::open_connection(
                target,
                Some(source_port),
                self.config.connection_config.clone(),
            )
            .await;

            match attempt {
                Err(error) if error.is_address_unavailable_for_use() => continue,
                outcome => return outcome,
            }
        }

        Err(QueryError::IoError(Arc::new(std::io::Error::new(
            std::io::ErrorKind::AddrInUse,
            "No available local port for the shard",
        ))))
    }

    // Files a freshly opened connection into its shard slot. Surplus
    // connections (the server assigned an already-full shard) are dropped;
    // the next fill round tries again.
    fn adopt(&mut self, (connection, fatal): (Connection, ErrorReceiver)) {
        self.absorb_features(&connection);

        let total_after = self.connection_count() + 1;
        let shard = connection
            .get_shard_info()
            .as_ref()
            .map_or(0, |info| info.shard as usize);
        let slot = match self.shards.get_mut(shard) {
            Some(slot) => slot,
            None => return,
        };

        let at_capacity = match self.config.pool_size {
            PoolSize::PerShard(target) => slot.len() >= target.get(),
            PoolSize::PerHost(_) => false,
        };
        if at_capacity {
            trace!(
                "[{}] Dropping a surplus connection to shard {}",
                self.address,
                shard
            );
            return;
        }

        let connection = Arc::new(connection);
        trace!(
            "[{}] Connection added to shard {}, {} total",
            self.address,
            shard,
            total_after
        );
        self.monitors.push(ConnectionMonitor {
            connection: Arc::downgrade(&connection),
            fatal,
        });
        slot.push(connection);
    }

    // Adjusts to the shard parameters a new connection reports. A changed
    // sharder means the node was reconfigured; connections grouped under the
    // old scheme are discarded wholesale.
    fn absorb_features(&mut self, connection: &Connection) {
        let sharder = connection
            .get_shard_info()
            .as_ref()
            .map(|info| info.get_sharder());
        self.shard_aware_port = connection.get_shard_aware_port();

        if self.sharder != sharder {
            debug!(
                "[{}] Shard count changed to {:?}, restarting the pool",
                self.address,
                sharder.as_ref().map(|s| s.nr_shards)
            );
            let shard_count = sharder.as_ref().map_or(1, |s| s.nr_shards.get() as usize);
            self.sharder = sharder;
            self.shards = vec![Vec::new(); shard_count];
            self.monitors.clear();
        }
    }

    // Resolves when any pooled connection reports a fatal error.
    async fn next_broken(
        monitors: &mut Vec<ConnectionMonitor>,
    ) -> (Weak<Connection>, QueryError) {
        let (outcome, index, _) =
            select_all(monitors.iter_mut().map(|monitor| &mut monitor.fatal)).await;
        let monitor = monitors.swap_remove(index);
        let error = outcome.unwrap_or_else(|_| keeper_gone());
        (monitor.connection, error)
    }

    fn discard(&mut self, (connection, error): (Weak<Connection>, QueryError)) {
        debug!("[{}] A connection broke: {}", self.address, error);

        if let Some(connection) = connection.upgrade() {
            for slot in &mut self.shards {
                if let Some(position) = slot
                    .iter()
                    .position(|pooled| Arc::ptr_eq(pooled, &connection))
                {
                    slot.swap_remove(position);
                    break;
                }
            }
        }

        self.last_error = Some(error);
        self.publish();
    }

    // Applies `USE` on every pooled connection. Runs inline in the keeper,
    // briefly pausing refills, which keeps new and existing connections from
    // racing on the keyspace.
    async fn switch_keyspace(&mut self, request: KeyspaceRequest) {
        self.keyspace = Some(request.keyspace.clone());
        debug!(
            "[{}] Switching to keyspace {}",
            self.address,
            request.keyspace.as_str()
        );

        let switches = self
            .shards
            .iter()
            .flatten()
            .map(|connection| connection.use_keyspace(&request.keyspace));
        let timeout = self.config.connection_config.connect_timeout;
        let outcome = match tokio::time::timeout(timeout, join_all(switches)).await {
            Ok(outcomes) => Self::combine_keyspace_outcomes(outcomes),
            Err(_) => Err(QueryError::TimeoutError),
        };

        if let Err(error) = &outcome {
            warn!("[{}] Keyspace switch failed: {}", self.address, error);
        }
        let _ = request.done.send(outcome);
    }

    // One confirmed USE is enough: a connection that was broken during the
    // switch repeats the USE when its replacement is opened. Only an error
    // other than a connection failure means the keyspace itself is bad.
    fn combine_keyspace_outcomes(
        outcomes: Vec<Result<(), QueryError>>,
    ) -> Result<(), QueryError> {
        if outcomes.is_empty() {
            return Ok(());
        }

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

        if confirmed {
            Ok(())
        } else {
            // Nonempty input and no non-IoError early return, so a failure
            // was recorded
            Err(connection_failure.unwrap())
        }
    }

    fn note_fill_error(&mut self, error: QueryError) {
        debug!("[{}] Opening a connection failed: {}", self.address, error);
        self.last_error = Some(error);
        self.retry_delay = std::cmp::min(self.retry_delay * 2, MAX_RETRY_DELAY);
    }

    // Publishes the current connection set; queries pick it up wait-free.
    fn publish(&mut self) {
        let state = if self.connection_count() == 0 {
            let error = self.last_error.clone().unwrap_or_else(keeper_gone);
            PoolState::Broken(error)
        } else {
            PoolState::Working(WorkingPool {
                sharder: self.sharder.clone(),
                shards: self.shards.clone(),
            })
        };

        self.state.store(Arc::new(state));
        self.ready_notify.notify_waiters();
    }
}
