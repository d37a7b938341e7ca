//! Cluster metadata, read from the system tables over a control connection.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::str::FromStr;
use std::sync::Arc;

use rand::seq::SliceRandom;
use rand::thread_rng;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::frame::response::result::{
    decode_ip_addr, decode_text, decode_text_list, decode_text_map, decode_uuid, Row,
};
use crate::frame::response::Event;
use crate::frame::value::SerializedValues;
use crate::routing::Token;
use crate::statement::query::Query;
use crate::transport::connection::{Connection, ConnectionConfig};
use crate::transport::connection_pool::{NodeConnectionPool, PoolConfig, PoolSize};
use crate::transport::errors::QueryError;

const PEERS_QUERY: &str =
    "select host_id, rpc_address, data_center, rack, tokens from system.peers";
const LOCAL_QUERY: &str =
    "select host_id, rpc_address, data_center, rack, tokens from system.local";
const KEYSPACES_QUERY: &str = "select keyspace_name, replication from system_schema.keyspaces";

// System tables are tiny, but paging through them costs nothing.
const SYSTEM_QUERY_PAGE_SIZE: i32 = 1024;

/// Reads the cluster's self-description over a dedicated control connection.
///
/// The control connection doubles as the event subscription: it REGISTERs
/// for the session's event types and forwards what the server pushes.
pub(crate) struct MetadataReader {
    connection_config: ConnectionConfig,

    control_address: SocketAddr,
    control_pool: NodeConnectionPool,

    // Fallbacks for when the control connection's node goes away.
    known_peers: Vec<SocketAddr>,
}

/// Everything one metadata read learns about the cluster.
pub(crate) struct Metadata {
    pub peers: Vec<Peer>,
    pub keyspaces: HashMap<String, Keyspace>,
}

pub(crate) struct Peer {
    pub host_id: Uuid,
    pub address: SocketAddr,
    pub tokens: Vec<Token>,
    pub datacenter: Option<String>,
    pub rack: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Keyspace {
    pub strategy: Strategy,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Strategy {
    SimpleStrategy {
        replication_factor: usize,
    },
    NetworkTopologyStrategy {
        /// Replication factor of each named datacenter.
        datacenter_repfactors: HashMap<String, usize>,
    },
    LocalStrategy, // replication_factor == 1
    Other {
        name: String,
        data: HashMap<String, String>,
    },
}

impl Metadata {
    /// A stand-in for when the initial read fails: the configured contact
    /// points, each owning an equal slice of the ring. Routing is then
    /// arbitrary but the session comes up and can serve queries.
    pub(crate) fn new_dummy(initial_peers: &[SocketAddr]) -> Self {
        let spacing = u64::MAX / initial_peers.len() as u64;

        let peers = initial_peers
            .iter()
            .enumerate()
            .map(|(index, address)| Peer {
                host_id: Uuid::new_v4(),
                address: *address,
                tokens: vec![Token {
                    value: (index as u64).wrapping_mul(spacing) as i64,
                }],
                datacenter: None,
                rack: None,
            })
            .collect();

        Metadata {
            peers,
            keyspaces: HashMap::new(),
        }
    }
}

impl MetadataReader {
    /// The reader starts connecting to a random contact point right away;
    /// events arriving on that connection go out through `event_tx`.
    pub(crate) fn new(
        known_peers: &[SocketAddr],
        mut connection_config: ConnectionConfig,
        event_tx: mpsc::Sender<Event>,
    ) -> Self {
        let control_address = *known_peers
            .choose(&mut thread_rng())
            .expect("at least one contact point is required");

        // An event sender in the config is what makes open_connection
        // REGISTER for events during the handshake.
        connection_config.event_sender = Some(event_tx);

        MetadataReader {
            control_pool: Self::control_pool_at(control_address, connection_config.clone()),
            control_address,
            connection_config,
            known_peers: known_peers.into(),
        }
    }

    /// Performs one full metadata read, moving the control connection to
    /// another peer when the current one fails.
    pub(crate) async fn read_metadata(&mut self, initial: bool) -> Result<Metadata, QueryError> {
        let mut attempt = self.fetch().await;

        if let Err(first_error) = &attempt {
            warn!(
                control_address = %self.control_address,
                error = %first_error,
                "Metadata read over the current control connection failed"
            );

            // Rotate through the other peers we know of, in random order,
            // until one of them answers.
            let mut fallbacks = self.known_peers.clone();
            fallbacks.shuffle(&mut thread_rng());
            for address in fallbacks {
                if address == self.control_address {
                    continue;
                }
                debug!("Moving the control connection to {}", address);
                self.control_address = address;
                self.control_pool =
                    Self::control_pool_at(address, self.connection_config.clone());

                attempt = self.fetch().await;
                if attempt.is_ok() {
                    break;
                }
            }
        }

        match attempt {
            Ok(metadata) => {
                self.known_peers = metadata.peers.iter().map(|peer| peer.address).collect();
                debug!("Fetched fresh cluster metadata");
                Ok(metadata)
            }
            Err(error) if initial => {
                warn!(
                    error = %error,
                    "No contact point answered the initial metadata read; starting \
                    with a made-up ring over the contact points. Routing will be \
                    suboptimal until a refresh succeeds."
                );
                Ok(Metadata::new_dummy(&self.known_peers))
            }
            Err(error) => {
                error!(error = %error, "Every known peer failed the metadata read");
                Err(error)
            }
        }
    }

    async fn fetch(&self) -> Result<Metadata, QueryError> {
        self.control_pool.wait_until_initialized().await;
        let connection = self.control_pool.least_busy_connection()?;

        let (peers, keyspaces) = tokio::try_join!(
            query_peers(&connection, self.control_address.port()),
            query_keyspaces(&connection),
        )?;

        // A cluster without nodes or without any token cannot be real;
        // better to keep the previous view than to adopt this one.
        if peers.is_empty() {
            return Err(QueryError::ProtocolError(
                "Metadata read returned no peers",
            ));
        }
        if peers.iter().all(|peer| peer.tokens.is_empty()) {
            return Err(QueryError::ProtocolError(
                "Metadata read returned no tokens at all",
            ));
        }

        Ok(Metadata { peers, keyspaces })
    }

    fn control_pool_at(address: SocketAddr, connection_config: ConnectionConfig) -> NodeConnectionPool {
        let pool_config = PoolConfig {
            connection_config,
            // One connection is all the control traffic needs, and a single
            // event subscription is easier to reason about.
            pool_size: PoolSize::PerHost(NonZeroUsize::new(1).unwrap()),
            can_use_shard_aware_port: false,
        };

        NodeConnectionPool::new(address, pool_config, None)
    }
}

async fn query_peers(
    connection: &Arc<Connection>,
    control_port: u16,
) -> Result<Vec<Peer>, QueryError> {
    let mut peers_query = Query::new(PEERS_QUERY);
    peers_query.set_page_size(SYSTEM_QUERY_PAGE_SIZE);
    let peer_rows = connection
        .query_all_pages(peers_query, &SerializedValues::new())
        .await?;

    let mut local_query = Query::new(LOCAL_QUERY);
    local_query.set_page_size(SYSTEM_QUERY_PAGE_SIZE);
    let local_rows = connection
        .query_all_pages(local_query, &SerializedValues::new())
        .await?;

    // The node answering system.local is the one we dialed; its broadcast
    // address may be unroutable (e.g. 0.0.0.0), so the control connection's
    // address is authoritative for it.
    let control_address = SocketAddr::new(connection.get_connect_address().ip(), control_port);

    let mut peers = Vec::with_capacity(peer_rows.len() + local_rows.len());
    for row in &peer_rows {
        if let Some(peer) = peer_from_row(row, None, control_port)? {
            peers.push(peer);
        }
    }
    for row in &local_rows {
        if let Some(peer) = peer_from_row(row, Some(control_address), control_port)? {
            peers.push(peer);
        }
    }

    Ok(peers)
}

// Turns one system.peers/system.local row into a Peer. Rows missing the
// essentials name a node the driver cannot address, so they are skipped
// with a warning rather than failing the whole refresh.
fn peer_from_row(
    row: &Row,
    address_override: Option<SocketAddr>,
    port: u16,
) -> Result<Option<Peer>, QueryError> {
    if row.columns.len() < 5 {
        return Err(QueryError::ProtocolError(
            "Peer row has too few columns",
        ));
    }

    let host_id = match row.column(0) {
        Some(raw) => decode_uuid(raw)
            .map_err(|_| QueryError::ProtocolError("Peer row has a malformed host id"))?,
        None => {
            warn!("Skipping a peer with a null host id");
            return Ok(None);
        }
    };

    let address = match address_override {
        Some(address) => address,
        None => match row.column(1) {
            Some(raw) => {
                let ip = decode_ip_addr(raw).map_err(|_| {
                    QueryError::ProtocolError("Peer row has a malformed rpc_address")
                })?;
                SocketAddr::new(ip, port)
            }
            None => {
                warn!("Skipping peer {} with a null rpc_address", host_id);
                return Ok(None);
            }
        },
    };

    let datacenter = row
        .column(2)
        .map(|raw| decode_text(raw))
        .transpose()
        .map_err(|_| QueryError::ProtocolError("Peer row has a malformed data_center"))?;
    let rack = row
        .column(3)
        .map(|raw| decode_text(raw))
        .transpose()
        .map_err(|_| QueryError::ProtocolError("Peer row has a malformed rack"))?;

    let token_strings = match row.column(4) {
        Some(raw) => decode_text_list(raw)
            .map_err(|_| QueryError::ProtocolError("Peer row has a malformed token set"))?,
        None => Vec::new(),
    };
    let tokens = parse_tokens(&token_strings);

    Ok(Some(Peer {
        host_id,
        address,
        tokens,
        datacenter,
        rack,
    }))
}

fn parse_tokens(token_strings: &[String]) -> Vec<Token> {
    let parsed: Result<Vec<Token>, std::num::ParseIntError> =
        token_strings.iter().map(|s| Token::from_str(s)).collect();
    match parsed {
        Ok(tokens) => tokens,
        Err(error) => {
            // Only Murmur3-sized tokens are understood. With a different
            // partitioner the node keeps working, parked at a random ring
            // position.
            warn!(
                error = %error,
                "Tokens are not 64-bit integers; assigning a random ring position"
            );
            vec![Token {
                value: rand::random::<i64>(),
            }]
        }
    }
}

async fn query_keyspaces(
    connection: &Arc<Connection>,
) -> Result<HashMap<String, Keyspace>, QueryError> {
    let mut keyspaces_query = Query::new(KEYSPACES_QUERY);
    keyspaces_query.set_page_size(SYSTEM_QUERY_PAGE_SIZE);
    let rows = connection
        .query_all_pages(keyspaces_query, &SerializedValues::new())
        .await?;

    let mut keyspaces = HashMap::with_capacity(rows.len());
    for row in rows {
        let name = match row.column(0) {
            Some(raw) => decode_text(raw).map_err(|_| {
                QueryError::ProtocolError("Keyspace row has a malformed name")
            })?,
            None => continue,
        };
        let replication = match row.column(1) {
            Some(raw) => decode_text_map(raw).map_err(|_| {
                QueryError::ProtocolError("Keyspace row has a malformed replication map")
            })?,
            None => HashMap::new(),
        };

        let strategy = parse_strategy(replication)?;
        keyspaces.insert(name, Keyspace { strategy });
    }

    Ok(keyspaces)
}

fn parse_strategy(mut replication: HashMap<String, String>) -> Result<Strategy, QueryError> {
    let class = replication
        .remove("class")
        .ok_or(QueryError::ProtocolError(
            "Replication map carries no class",
        ))?;
    let short_name = class
        .strip_prefix("org.apache.cassandra.locator.")
        .map(str::to_owned)
        .unwrap_or_else(|| class.clone());

    Ok(match short_name.as_str() {
        "SimpleStrategy" => {
            let replication_factor = replication
                .remove("replication_factor")
                .as_deref()
                .and_then(|factor| factor.parse::<usize>().ok())
                .ok_or(QueryError::ProtocolError(
                    "SimpleStrategy without a numeric replication_factor",
                ))?;
            Strategy::SimpleStrategy { replication_factor }
        }
        "NetworkTopologyStrategy" => {
            // Remaining entries map datacenter names to their factors;
            // non-numeric extras are skipped.
            let datacenter_repfactors = replication
                .into_iter()
                .filter_map(|(datacenter, factor)| {
                    factor.parse::<usize>().ok().map(|factor| (datacenter, factor))
                })
                .collect();
            Strategy::NetworkTopologyStrategy {
                datacenter_repfactors,
            }
        }
        "LocalStrategy" => Strategy::LocalStrategy,
        _ => Strategy::Other {
            name: class,
            data: replication,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strategy_of(pairs: &[(&str, &str)]) -> Result<Strategy, QueryError> {
        let map = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        parse_strategy(map)
    }

    #[test]
    fn simple_strategy_parse() {
        let strategy = strategy_of(&[
            ("class", "org.apache.cassandra.locator.SimpleStrategy"),
            ("replication_factor", "3"),
        ])
        .unwrap();
        assert_eq!(
            strategy,
            Strategy::SimpleStrategy {
                replication_factor: 3
            }
        );

        // The short class name works too
        let strategy =
            strategy_of(&[("class", "SimpleStrategy"), ("replication_factor", "1")]).unwrap();
        assert_eq!(
            strategy,
            Strategy::SimpleStrategy {
                replication_factor: 1
            }
        );
    }

    #[test]
    fn network_topology_strategy_parse() {
        let strategy = strategy_of(&[
            ("class", "NetworkTopologyStrategy"),
            ("dc1", "3"),
            ("dc2", "2"),
        ])
        .unwrap();
        let expected = [("dc1".to_string(), 3), ("dc2".to_string(), 2)]
            .into_iter()
            .collect();
        assert_eq!(
            strategy,
            Strategy::NetworkTopologyStrategy {
                datacenter_repfactors: expected
            }
        );
    }

    #[test]
    fn unknown_strategy_is_preserved() {
        let strategy = strategy_of(&[("class", "ExoticStrategy"), ("foo", "bar")]).unwrap();
        match strategy {
            Strategy::Other { name, data } => {
                assert_eq!(name, "ExoticStrategy");
                assert_eq!(data.get("foo").unwrap(), "bar");
            }
            other => panic!("unexpected strategy: {:?}", other),
        }
    }

    #[test]
    fn invalid_strategies_are_rejected() {
        // No class at all
        assert!(strategy_of(&[("replication_factor", "3")]).is_err());
        // SimpleStrategy without its factor
        assert!(strategy_of(&[("class", "SimpleStrategy")]).is_err());
        // SimpleStrategy with garbage for a factor
        assert!(strategy_of(&[("class", "SimpleStrategy"), ("replication_factor", "many")])
            .is_err());
    }

    #[test]
    fn token_parsing_degrades_to_a_random_position() {
        let tokens = parse_tokens(&["42".to_string(), "-9223372036854775808".to_string()]);
        assert_eq!(tokens.len(), 2);
        assert_eq!(tokens[0].value, 42);

        // A foreign partitioner's tokens still produce one usable position
        let fallback = parse_tokens(&["not-a-number".to_string()]);
        assert_eq!(fallback.len(), 1);
    }

    #[test]
    fn dummy_metadata_covers_all_peers() {
        let addrs: Vec<SocketAddr> = vec![
            "10.0.0.1:9042".parse().unwrap(),
            "10.0.0.2:9042".parse().unwrap(),
            "10.0.0.3:9042".parse().unwrap(),
        ];
        let metadata = Metadata::new_dummy(&addrs);

        assert_eq!(metadata.peers.len(), 3);
        for peer in &metadata.peers {
            assert_eq!(peer.tokens.len(), 1);
        }
        // Each node gets a distinct ring position
        let tokens: std::collections::HashSet<i64> = metadata
            .peers
            .iter()
            .map(|p| p.tokens[0].value)
            .collect();
        assert_eq!(tokens.len(), 3);
    }
}
