use std::collections::HashMap;
use std::sync::Arc;

use itertools::Itertools;

use super::{HostSelectionPolicy, NodeRef, QueryInfo};
use crate::transport::cluster::ClusterData;
use crate::transport::topology::Strategy;

/// Token-aware wrapper for SimpleStrategy keyspaces: when the routing
/// context carries a token, the first `replication_factor` distinct
/// successors on the ring are yielded, then the wrapped policy continues the
/// sequence with the replicas filtered out.
#[derive(Debug)]
pub struct SimpleTokenAwarePolicy {
    replication_factor: usize,
    fallback: Arc<dyn HostSelectionPolicy>,
}

impl SimpleTokenAwarePolicy {
    pub fn new(replication_factor: usize, fallback: Arc<dyn HostSelectionPolicy>) -> Self {
        Self {
            replication_factor,
            fallback,
        }
    }
}

impl HostSelectionPolicy for SimpleTokenAwarePolicy {
    fn node<'a>(
        &self,
        cluster: &'a ClusterData,
        query: &QueryInfo<'_>,
        offset: usize,
    ) -> Option<NodeRef<'a>> {
        let token = match query.token {
            Some(token) => token,
            None => return self.fallback.node(cluster, query, offset),
        };

        let replicas: Vec<NodeRef<'a>> = cluster
            .ring
            .ring_range(token)
            .unique_by(|node| node.host_id)
            .take(self.replication_factor)
            .collect();

        if offset < replicas.len() {
            return Some(replicas[offset]);
        }

        fall_through(
            &replicas,
            &*self.fallback,
            cluster,
            query,
            offset - replicas.len(),
        )
    }

    fn name(&self) -> String {
        format!(
            "SimpleTokenAwarePolicy{{fallback: {}}}",
            self.fallback.name()
        )
    }
}

/// Token-aware wrapper for NetworkTopologyStrategy keyspaces. Yields the
/// ring entry's precomputed replica list (local datacenter first, then
/// remote) when the statement's keyspace is indexed, computes the list from
/// the policy's configured per-datacenter replication factors otherwise, and
/// finally falls through to the wrapped policy.
#[derive(Debug)]
pub struct NetworkTopologyTokenAwarePolicy {
    datacenter_repfactors: HashMap<String, usize>,
    fallback: Arc<dyn HostSelectionPolicy>,
}

impl NetworkTopologyTokenAwarePolicy {
    pub fn new(
        datacenter_repfactors: HashMap<String, usize>,
        fallback: Arc<dyn HostSelectionPolicy>,
    ) -> Self {
        Self {
            datacenter_repfactors,
            fallback,
        }
    }
}

impl HostSelectionPolicy for NetworkTopologyTokenAwarePolicy {
    fn node<'a>(
        &self,
        cluster: &'a ClusterData,
        query: &QueryInfo<'_>,
        offset: usize,
    ) -> Option<NodeRef<'a>> {
        let token = match query.token {
            Some(token) => token,
            None => return self.fallback.node(cluster, query, offset),
        };

        let replicas: Vec<NodeRef<'a>> = match query
            .keyspace
            .and_then(|keyspace| cluster.replicas_for_token(keyspace, token))
        {
            Some(replica_set) => replica_set.iter().collect(),
            None => {
                // No precomputed entry for this keyspace; compute from the
                // policy's own replication factors.
                let strategy = Strategy::NetworkTopologyStrategy {
                    datacenter_repfactors: self.datacenter_repfactors.clone(),
                };
                cluster
                    .compute_replicas_for_token(token, &strategy)
                    .iter()
                    .filter_map(|node| cluster.known_peers.get(&node.host_id))
                    .collect()
            }
        };

        if offset < replicas.len() {
            return Some(replicas[offset]);
        }

        fall_through(
            &replicas,
            &*self.fallback,
            cluster,
            query,
            offset - replicas.len(),
        )
    }

    fn name(&self) -> String {
        format!(
            "NetworkTopologyTokenAwarePolicy{{fallback: {}}}",
            self.fallback.name()
        )
    }
}

// Continues the candidate sequence with the wrapped policy, skipping nodes
// already yielded as replicas. `skip_count` is the position within the
// filtered fallback sequence.
fn fall_through<'a>(
    already_yielded: &[NodeRef<'a>],
    fallback: &dyn HostSelectionPolicy,
    cluster: &'a ClusterData,
    query: &QueryInfo<'_>,
    skip_count: usize,
) -> Option<NodeRef<'a>> {
    let mut remaining = skip_count;
    let mut fallback_offset = 0;
    loop {
        let node = fallback.node(cluster, query, fallback_offset)?;
        fallback_offset += 1;

        if already_yielded
            .iter()
            .any(|replica| replica.host_id == node.host_id)
        {
            continue;
        }
        if remaining == 0 {
            return Some(node);
        }
        remaining -= 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::Token;
    use crate::test_utils::{mock_cluster_data, mock_peer};
    use crate::transport::load_balancing::RoundRobinPolicy;
    use crate::transport::topology::Keyspace;

    // Ring tokens:  50 100 150 200 250 300 400 500
    // Node ids:     2  1   2   3   1   2   3   1
    fn three_node_peers() -> Vec<crate::transport::topology::Peer> {
        vec![
            mock_peer(1, Some("eu"), None, vec![100, 250, 500]),
            mock_peer(2, Some("eu"), None, vec![50, 150, 300]),
            mock_peer(3, Some("us"), None, vec![200, 400]),
        ]
    }

    fn plan(
        policy: &dyn HostSelectionPolicy,
        cluster: &ClusterData,
        info: &QueryInfo<'_>,
    ) -> Vec<u16> {
        (0..)
            .map_while(|offset| policy.node(cluster, info, offset))
            .map(|node| node.address.port())
            .collect()
    }

    #[tokio::test]
    async fn simple_token_aware_yields_ring_successors_first() {
        crate::test_utils::setup_tracing();
        let cluster = mock_cluster_data(three_node_peers(), Default::default(), None);
        let policy = SimpleTokenAwarePolicy::new(2, Arc::new(RoundRobinPolicy::new()));

        let info = QueryInfo::with_base(Some(Token { value: 160 }), None, 0);
        let sequence = plan(&policy, &cluster, &info);

        // Successors of token 160: node 3 (token 200), node 1 (token 250);
        // then the fallback continues with the remaining node 2.
        assert_eq!(sequence, vec![3, 1, 2]);
    }

    #[tokio::test]
    async fn simple_token_aware_does_not_re_yield_replicas() {
        let cluster = mock_cluster_data(three_node_peers(), Default::default(), None);
        let policy = SimpleTokenAwarePolicy::new(2, Arc::new(RoundRobinPolicy::new()));

        for base in 0..6 {
            let info = QueryInfo::with_base(Some(Token { value: 60 }), None, base);
            let sequence = plan(&policy, &cluster, &info);

            // Replicas stay in ring order regardless of base, every node
            // appears exactly once.
            assert_eq!(sequence[..2], [1, 2]);
            assert_eq!(sequence.len(), 3);
            assert_eq!(sequence[2], 3);
        }
    }

    #[tokio::test]
    async fn token_less_statement_falls_back() {
        let cluster = mock_cluster_data(three_node_peers(), Default::default(), None);
        let policy = SimpleTokenAwarePolicy::new(2, Arc::new(RoundRobinPolicy::new()));

        let info = QueryInfo::with_base(None, None, 0);
        assert_eq!(plan(&policy, &cluster, &info), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn network_topology_token_aware_uses_precomputed_lists() {
        // Datacenter "waw": nodes 1, 2 in rack r1; 3, 4 in rack r2
        // Datacenter "her": nodes 5, 6 in rack r3; 7, 8 in rack r4
        let peers = vec![
            mock_peer(1, Some("waw"), Some("r1"), vec![50, 200]),
            mock_peer(2, Some("waw"), Some("r1"), vec![150]),
            mock_peer(3, Some("waw"), Some("r2"), vec![510]),
            mock_peer(4, Some("waw"), Some("r2"), vec![300]),
            mock_peer(5, Some("her"), Some("r3"), vec![100]),
            mock_peer(6, Some("her"), Some("r3"), vec![250]),
            mock_peer(7, Some("her"), Some("r4"), vec![500]),
            mock_peer(8, Some("her"), Some("r4"), vec![400]),
        ];

        let datacenter_repfactors: HashMap<String, usize> =
            [("waw".to_string(), 2), ("her".to_string(), 3)]
                .into_iter()
                .collect();

        let mut keyspaces = HashMap::new();
        keyspaces.insert(
            "ks_nts".to_string(),
            Keyspace {
                strategy: Strategy::NetworkTopologyStrategy {
                    datacenter_repfactors: datacenter_repfactors.clone(),
                },
            },
        );

        let cluster = mock_cluster_data(peers, keyspaces, Some("waw".to_string()));
        let policy = NetworkTopologyTokenAwarePolicy::new(
            datacenter_repfactors,
            Arc::new(RoundRobinPolicy::new()),
        );

        let info = QueryInfo::with_base(Some(Token { value: 0 }), Some("ks_nts"), 0);
        let sequence = plan(&policy, &cluster, &info);

        // Ring walk yields 1, 5, 6, 4, 8; with "waw" local the split
        // reorders to local replicas (1, 4) before remote ones (5, 6, 8),
        // and the fallback appends the three remaining nodes.
        assert_eq!(sequence[..2], [1, 4]);
        assert_eq!(sequence[2..5], [5, 6, 8]);
        assert_eq!(sequence.len(), 8);
        let tail: std::collections::HashSet<u16> = sequence[5..].iter().copied().collect();
        assert_eq!(tail, [2, 3, 7].into_iter().collect());
    }

    #[tokio::test]
    async fn network_topology_token_aware_computes_for_unknown_keyspace() {
        let peers = vec![
            mock_peer(1, Some("eu"), None, vec![100]),
            mock_peer(2, Some("eu"), None, vec![200]),
            mock_peer(3, Some("us"), None, vec![300]),
        ];
        let datacenter_repfactors: HashMap<String, usize> =
            [("eu".to_string(), 1), ("us".to_string(), 1)]
                .into_iter()
                .collect();

        let cluster = mock_cluster_data(peers, Default::default(), None);
        let policy = NetworkTopologyTokenAwarePolicy::new(
            datacenter_repfactors,
            Arc::new(RoundRobinPolicy::new()),
        );

        let info = QueryInfo::with_base(Some(Token { value: 150 }), Some("missing_ks"), 0);
        let sequence = plan(&policy, &cluster, &info);

        // Walk from token 150: node 2 covers "eu", node 3 covers "us";
        // node 1 arrives through the fallback.
        assert_eq!(sequence[..2], [2, 3]);
        assert_eq!(sequence, vec![2, 3, 1]);
    }
}
