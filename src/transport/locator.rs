//! The token ring and per-keyspace replica precomputation.

use std::collections::HashMap;
use std::sync::Arc;

use itertools::Itertools;

use crate::routing::Token;
use crate::transport::node::Node;
use crate::transport::topology::{Keyspace, Strategy};

/// A token ring is a continuous hash ring. It defines association by hashing
/// a key onto the ring and then walking the ring in one direction.
/// Each ring member has a token (i64 number) which defines the member's
/// position on the ring. The ring is circular and can be traversed in the
/// order of increasing tokens. `TokenRing` makes it easy and efficient to
/// traverse the ring starting at a given token.
#[derive(Debug, Clone)]
pub struct TokenRing<ElemT> {
    ring: Vec<(Token, ElemT)>,
}

impl<ElemT> Default for TokenRing<ElemT> {
    fn default() -> Self {
        Self { ring: Vec::new() }
    }
}

impl<ElemT> TokenRing<ElemT> {
    pub(crate) fn new(ring_iter: impl Iterator<Item = (Token, ElemT)>) -> TokenRing<ElemT> {
        let mut ring: Vec<(Token, ElemT)> = ring_iter.collect();
        ring.sort_by(|a, b| a.0.cmp(&b.0));
        TokenRing { ring }
    }

    /// Iterates over all members of the ring starting at the lowest token.
    pub fn iter(&self) -> impl Iterator<Item = &(Token, ElemT)> {
        self.ring.iter()
    }

    /// Index of the first entry with token not lower than the given one,
    /// wrapping to 0 past the highest token.
    pub(crate) fn lower_bound_index(&self, token: Token) -> usize {
        let index = match self.ring.binary_search_by(|e| e.0.cmp(&token)) {
            Ok(exact_match_index) => exact_match_index,
            Err(first_greater_index) => first_greater_index,
        };
        if index >= self.ring.len() {
            0
        } else {
            index
        }
    }

    /// Provides an iterator over the ring members starting at the given
    /// token. The iterator traverses the whole ring in the direction of
    /// increasing tokens. After reaching the maximum token it wraps around
    /// and continues from the lowest one. The iterator visits each member
    /// once, it is not infinite.
    pub fn ring_range_full(&self, token: Token) -> impl Iterator<Item = &(Token, ElemT)> {
        let binary_search_index: usize = match self.ring.binary_search_by(|e| e.0.cmp(&token)) {
            Ok(exact_match_index) => exact_match_index,
            Err(first_greater_index) => first_greater_index,
        };

        self.ring[binary_search_index..]
            .iter()
            .chain(self.ring.iter())
            .take(self.ring.len())
    }

    /// Like `ring_range_full` but yields elements only.
    pub fn ring_range(&self, token: Token) -> impl Iterator<Item = &ElemT> {
        self.ring_range_full(token).map(|(_t, e)| e)
    }

    /// Traverses the ring starting at the given token and returns the first
    /// ring member encountered.
    pub fn get_elem_for_token(&self, token: Token) -> Option<&ElemT> {
        self.ring_range(token).next()
    }

    pub fn len(&self) -> usize {
        self.ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }
}

/// Replicas of one ring entry under one keyspace, split by datacenter
/// locality so that DC-aware policies can iterate local candidates first
/// without re-filtering.
#[derive(Debug, Clone, Default)]
pub(crate) struct ReplicaSet {
    pub(crate) local: Vec<Arc<Node>>,
    pub(crate) remote: Vec<Arc<Node>>,
}

impl ReplicaSet {
    pub(crate) fn iter(&self) -> impl Iterator<Item = &Arc<Node>> {
        self.local.iter().chain(self.remote.iter())
    }

    pub(crate) fn len(&self) -> usize {
        self.local.len() + self.remote.len()
    }
}

/// Precomputed replica sets of every ring entry for one keyspace.
#[derive(Debug, Clone, Default)]
pub(crate) struct KeyspaceReplicas {
    sets: Vec<ReplicaSet>,
}

impl KeyspaceReplicas {
    pub(crate) fn for_ring_index(&self, index: usize) -> Option<&ReplicaSet> {
        self.sets.get(index)
    }
}

/// Builds the replica index: for each ring entry and each known keyspace the
/// replica list is computed once and cached, so no routing decision walks
/// the ring.
pub(crate) fn build_replica_index(
    ring: &TokenRing<Arc<Node>>,
    keyspaces: &HashMap<String, Keyspace>,
    rack_count_per_dc: &HashMap<String, usize>,
    local_dc: Option<&str>,
) -> HashMap<String, KeyspaceReplicas> {
    keyspaces
        .iter()
        .map(|(name, keyspace)| {
            let sets = ring
                .iter()
                .map(|(token, _)| {
                    let replicas = replicas_for_token(
                        ring,
                        *token,
                        &keyspace.strategy,
                        rack_count_per_dc,
                    );
                    split_replicas(replicas, local_dc)
                })
                .collect();
            (name.clone(), KeyspaceReplicas { sets })
        })
        .collect()
}

pub(crate) fn replicas_for_token(
    ring: &TokenRing<Arc<Node>>,
    token: Token,
    strategy: &Strategy,
    rack_count_per_dc: &HashMap<String, usize>,
) -> Vec<Arc<Node>> {
    match strategy {
        Strategy::SimpleStrategy { replication_factor } => {
            simple_strategy_replicas(ring, token, *replication_factor)
        }
        Strategy::NetworkTopologyStrategy {
            datacenter_repfactors,
        } => network_topology_strategy_replicas(
            ring,
            token,
            datacenter_repfactors,
            rack_count_per_dc,
        ),
        // LocalStrategy and unknown strategies degrade to a single owner
        _ => simple_strategy_replicas(ring, token, 1),
    }
}

/// Walks successors on the ring collecting the requested number of distinct
/// nodes.
pub(crate) fn simple_strategy_replicas(
    ring: &TokenRing<Arc<Node>>,
    token: Token,
    replication_factor: usize,
) -> Vec<Arc<Node>> {
    ring.ring_range(token)
        .unique_by(|node| node.host_id)
        .take(replication_factor)
        .cloned()
        .collect()
}

/// Walks successors accumulating per-DC counts up to each DC's replication
/// factor; each DC spreads across racks before reusing one.
pub(crate) fn network_topology_strategy_replicas(
    ring: &TokenRing<Arc<Node>>,
    token: Token,
    datacenter_repfactors: &HashMap<String, usize>,
    rack_count_per_dc: &HashMap<String, usize>,
) -> Vec<Arc<Node>> {
    let mut acceptable_repeats = datacenter_repfactors
        .iter()
        .map(|(dc_name, repfactor)| {
            let rack_count = rack_count_per_dc.get(dc_name).copied().unwrap_or(0);
            (dc_name.clone(), repfactor.saturating_sub(rack_count))
        })
        .collect::<HashMap<String, usize>>();

    let desired_result_len: usize = datacenter_repfactors.values().sum();

    let mut result: Vec<Arc<Node>> = Vec::with_capacity(desired_result_len);
    for node in ring.ring_range(token).unique_by(|node| node.host_id) {
        let current_node_dc = match &node.datacenter {
            None => continue,
            Some(dc) => dc,
        };

        let repfactor = match datacenter_repfactors.get(current_node_dc) {
            None => continue,
            Some(r) => r,
        };

        let picked_nodes_from_current_dc = || {
            result
                .iter()
                .filter(|node| node.datacenter.as_ref() == Some(current_node_dc))
        };

        if *repfactor == picked_nodes_from_current_dc().count() {
            // found enough nodes in this datacenter
            continue;
        }

        let current_node_rack = node.rack.as_ref();
        let current_node_rack_count = picked_nodes_from_current_dc()
            .filter(|node| node.rack.as_ref() == current_node_rack)
            .count();

        if current_node_rack_count == 0 {
            // new rack
            result.push(node.clone());
        } else {
            // we already have a node in this rack
            let repeats = acceptable_repeats.get_mut(current_node_dc).unwrap();
            if *repeats > 0 {
                // we must pick multiple nodes in the same rack
                *repeats -= 1;
                result.push(node.clone());
            }
        }

        if result.len() == desired_result_len {
            break;
        }
    }

    result
}

fn split_replicas(replicas: Vec<Arc<Node>>, local_dc: Option<&str>) -> ReplicaSet {
    match local_dc {
        // Without a local datacenter notion every replica counts as local
        None => ReplicaSet {
            local: replicas,
            remote: Vec::new(),
        },
        Some(local_dc) => {
            let (local, remote) = replicas
                .into_iter()
                .partition(|node| node.datacenter.as_deref() == Some(local_dc));
            ReplicaSet { local, remote }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{mock_node, setup_tracing};

    #[test]
    fn token_ring_range_walks() {
        setup_tracing();
        let ring_data = [
            (Token { value: -30 }, -3),
            (Token { value: -20 }, -2),
            (Token { value: -10 }, -1),
            (Token { value: 0 }, 0),
            (Token { value: 10 }, 1),
            (Token { value: 20 }, 2),
            (Token { value: 30 }, 3),
        ];

        let ring: TokenRing<i32> = TokenRing::new(ring_data.into_iter());

        assert_eq!(
            ring.ring_range(Token { value: -35 })
                .cloned()
                .collect::<Vec<i32>>(),
            vec![-3, -2, -1, 0, 1, 2, 3]
        );

        assert_eq!(
            ring.ring_range(Token { value: -25 })
                .cloned()
                .collect::<Vec<i32>>(),
            vec![-2, -1, 0, 1, 2, 3, -3]
        );

        assert_eq!(
            ring.ring_range(Token { value: 0 })
                .cloned()
                .collect::<Vec<i32>>(),
            vec![0, 1, 2, 3, -3, -2, -1]
        );

        assert_eq!(
            ring.ring_range(Token { value: 35 })
                .cloned()
                .collect::<Vec<i32>>(),
            vec![-3, -2, -1, 0, 1, 2, 3]
        );
    }

    #[test]
    fn token_ring_lower_bound() {
        let ring: TokenRing<i32> = TokenRing::new(
            [
                (Token { value: 10 }, 1),
                (Token { value: 20 }, 2),
                (Token { value: 30 }, 3),
            ]
            .into_iter(),
        );

        // The least index i with entries[i].token >= T
        assert_eq!(ring.lower_bound_index(Token { value: 5 }), 0);
        assert_eq!(ring.lower_bound_index(Token { value: 10 }), 0);
        assert_eq!(ring.lower_bound_index(Token { value: 11 }), 1);
        assert_eq!(ring.lower_bound_index(Token { value: 30 }), 2);
        // Wraps to 0 when no entry has a token >= T
        assert_eq!(ring.lower_bound_index(Token { value: 31 }), 0);
    }

    // Ring tokens:  50 100 150 200 250 300 400 500
    // Node ids:     2  1   2   3   1   2   3   1
    #[tokio::test]
    async fn simple_strategy_collects_distinct_successors() {
        let n1 = mock_node(1, Some("eu"), None);
        let n2 = mock_node(2, Some("eu"), None);
        let n3 = mock_node(3, Some("us"), None);

        let ring = TokenRing::new(
            [
                (50, &n2),
                (100, &n1),
                (150, &n2),
                (200, &n3),
                (250, &n1),
                (300, &n2),
                (400, &n3),
                (500, &n1),
            ]
            .into_iter()
            .map(|(t, n)| (Token { value: t }, n.clone())),
        );

        let ids = |replicas: Vec<Arc<Node>>| {
            replicas
                .iter()
                .map(|n| n.address.port())
                .collect::<Vec<u16>>()
        };

        assert_eq!(
            ids(simple_strategy_replicas(&ring, Token { value: 160 }, 2)),
            vec![3, 1]
        );
        assert_eq!(
            ids(simple_strategy_replicas(&ring, Token { value: 60 }, 3)),
            vec![1, 2, 3]
        );
        // Wrap-around past the highest token
        assert_eq!(
            ids(simple_strategy_replicas(&ring, Token { value: 450 }, 3)),
            vec![1, 2, 3]
        );
        // More than distinct owners exist - the list saturates
        assert_eq!(
            ids(simple_strategy_replicas(&ring, Token { value: 0 }, 5)).len(),
            3
        );
    }

    // Datacenter "waw": nodes 1, 2 in rack r1; 3, 4 in rack r2
    // Datacenter "her": nodes 5, 6 in rack r3; 7, 8 in rack r4
    // Ring tokens:  50 100 150 200 250 300 400 500 510
    // Node ids:     1  5   2   1   6   4   8   7   3
    #[tokio::test]
    async fn network_topology_strategy_respects_rack_diversity() {
        setup_tracing();
        let nodes = [
            mock_node(1, Some("waw"), Some("r1")),
            mock_node(2, Some("waw"), Some("r1")),
            mock_node(3, Some("waw"), Some("r2")),
            mock_node(4, Some("waw"), Some("r2")),
            mock_node(5, Some("her"), Some("r3")),
            mock_node(6, Some("her"), Some("r3")),
            mock_node(7, Some("her"), Some("r4")),
            mock_node(8, Some("her"), Some("r4")),
        ];
        let node = |id: usize| nodes[id - 1].clone();

        let ring = TokenRing::new(
            [
                (50, node(1)),
                (100, node(5)),
                (150, node(2)),
                (200, node(1)),
                (250, node(6)),
                (300, node(4)),
                (400, node(8)),
                (500, node(7)),
                (510, node(3)),
            ]
            .into_iter()
            .map(|(t, n)| (Token { value: t }, n)),
        );

        let datacenter_repfactors = [("waw".to_string(), 2), ("her".to_string(), 3)]
            .into_iter()
            .collect::<HashMap<_, _>>();
        let rack_count = [("waw".to_string(), 2), ("her".to_string(), 2)]
            .into_iter()
            .collect::<HashMap<_, _>>();

        let replicas = network_topology_strategy_replicas(
            &ring,
            Token { value: 0 },
            &datacenter_repfactors,
            &rack_count,
        );

        let ids: Vec<u16> = replicas.iter().map(|n| n.address.port()).collect();
        // Node 2 is skipped (rack r1 already taken by node 1), node 4 opens
        // rack r2; "her" needs a third replica so rack r4 repeats.
        assert_eq!(ids, vec![1, 5, 6, 4, 8]);
    }

    #[tokio::test]
    async fn replica_index_split_by_local_dc() {
        let n1 = mock_node(1, Some("eu"), None);
        let n2 = mock_node(2, Some("us"), None);

        let ring = TokenRing::new(
            [(100, n1.clone()), (200, n2.clone())]
                .into_iter()
                .map(|(t, n)| (Token { value: t }, n)),
        );

        let mut keyspaces = HashMap::new();
        keyspaces.insert(
            "ks".to_string(),
            Keyspace {
                strategy: Strategy::SimpleStrategy {
                    replication_factor: 2,
                },
            },
        );

        let index = build_replica_index(&ring, &keyspaces, &HashMap::new(), Some("eu"));
        let replicas = index.get("ks").unwrap();

        let first = replicas.for_ring_index(0).unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(first.local.len(), 1);
        assert_eq!(first.local[0].host_id, n1.host_id);
        assert_eq!(first.remote.len(), 1);
        assert_eq!(first.remote[0].host_id, n2.host_id);

        // Without a local DC everything is local
        let index = build_replica_index(&ring, &keyspaces, &HashMap::new(), None);
        let first = index.get("ks").unwrap().for_ring_index(0).unwrap();
        assert_eq!(first.local.len(), 2);
        assert!(first.remote.is_empty());
    }
}
