use std::hash::{Hash, Hasher};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use uuid::Uuid;

use crate::routing::{Sharder, Token};
use crate::transport::connection::{Connection, VerifiedKeyspaceName};
use crate::transport::connection_pool::{NodeConnectionPool, PoolConfig};
use crate::transport::errors::QueryError;

/// A cluster member, identified by its host id, along with its connections.
///
/// The down marker is authoritative for routing: connections of a down node
/// are never handed out.
#[derive(Debug)]
pub struct Node {
    pub host_id: Uuid,
    pub address: SocketAddr,
    pub datacenter: Option<String>,
    pub rack: Option<String>,

    pool: NodeConnectionPool,

    down_marker: AtomicBool,
}

impl Node {
    /// Creates a new node which starts connecting in the background.
    pub(crate) fn new(
        host_id: Uuid,
        address: SocketAddr,
        pool_config: PoolConfig,
        datacenter: Option<String>,
        rack: Option<String>,
        keyspace_name: Option<VerifiedKeyspaceName>,
    ) -> Self {
        let pool = NodeConnectionPool::new(address, pool_config, keyspace_name);

        Node {
            host_id,
            address,
            datacenter,
            rack,
            pool,
            down_marker: false.into(),
        }
    }

    pub fn sharder(&self) -> Option<Sharder> {
        self.pool.sharder()
    }

    /// Returns a connection appropriate for the routing context: the owning
    /// shard's connection when a token is known, the least busy one otherwise.
    pub(crate) fn connection_for(
        &self,
        token: Option<Token>,
    ) -> Result<Arc<Connection>, QueryError> {
        if self.is_down() {
            return Err(QueryError::NodeDown(self.address));
        }
        match token {
            Some(token) => self.pool.connection_for_token(token),
            None => self.pool.least_busy_connection(),
        }
    }

    pub(crate) fn least_busy_connection(&self) -> Result<Arc<Connection>, QueryError> {
        if self.is_down() {
            return Err(QueryError::NodeDown(self.address));
        }
        self.pool.least_busy_connection()
    }

    pub fn is_down(&self) -> bool {
        self.down_marker.load(Ordering::Relaxed)
    }

    pub(crate) fn change_down_marker(&self, is_down: bool) {
        self.down_marker.store(is_down, Ordering::Relaxed);
    }

    pub(crate) async fn use_keyspace(
        &self,
        keyspace_name: VerifiedKeyspaceName,
    ) -> Result<(), QueryError> {
        self.pool.use_keyspace(keyspace_name).await
    }

    pub(crate) fn get_working_connections(&self) -> Result<Vec<Arc<Connection>>, QueryError> {
        self.pool.get_working_connections()
    }

    pub(crate) async fn wait_until_pool_initialized(&self) {
        self.pool.wait_until_initialized().await;
    }

    pub(crate) async fn fetch_schema_version(&self) -> Result<Uuid, QueryError> {
        self.least_busy_connection()?.fetch_schema_version().await
    }
}

impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        self.host_id == other.host_id
    }
}

impl Eq for Node {}

impl Hash for Node {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.host_id.hash(state);
    }
}
