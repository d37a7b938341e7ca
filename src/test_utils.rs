//! Helpers shared by unit tests.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use uuid::Uuid;

use crate::routing::Token;
use crate::transport::cluster::ClusterData;
use crate::transport::connection_pool::PoolConfig;
use crate::transport::node::Node;
use crate::transport::topology::{Keyspace, Metadata, Peer};

pub(crate) fn setup_tracing() {
    let _ = tracing_subscriber::fmt::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

// Test nodes get addresses nobody listens on; the pool workers keep failing
// to connect in the background, which the tests don't mind.
pub(crate) fn id_to_invalid_addr(id: u16) -> SocketAddr {
    SocketAddr::new([255, 255, 255, 255].into(), id)
}

/// A node whose port doubles as a human-readable id in assertions.
pub(crate) fn mock_node(id: u16, datacenter: Option<&str>, rack: Option<&str>) -> Arc<Node> {
    Arc::new(Node::new(
        Uuid::from_u128(id as u128),
        id_to_invalid_addr(id),
        PoolConfig::default(),
        datacenter.map(ToOwned::to_owned),
        rack.map(ToOwned::to_owned),
        None,
    ))
}

pub(crate) fn mock_peer(
    id: u16,
    datacenter: Option<&str>,
    rack: Option<&str>,
    tokens: Vec<i64>,
) -> Peer {
    Peer {
        host_id: Uuid::from_u128(id as u128),
        address: id_to_invalid_addr(id),
        tokens: tokens.into_iter().map(|value| Token { value }).collect(),
        datacenter: datacenter.map(ToOwned::to_owned),
        rack: rack.map(ToOwned::to_owned),
    }
}

pub(crate) fn mock_cluster_data(
    peers: Vec<Peer>,
    keyspaces: HashMap<String, Keyspace>,
    local_dc: Option<String>,
) -> ClusterData {
    let metadata = Metadata { peers, keyspaces };
    ClusterData::new(
        metadata,
        &PoolConfig::default(),
        &HashMap::new(),
        &None,
        local_dc,
    )
}
