use super::{compute_rotation, HostSelectionPolicy, NodeRef, QueryInfo};
use crate::transport::cluster::ClusterData;
use crate::transport::node::Node;

/// A datacenter-aware Round-robin host-selection policy: nodes of the local
/// datacenter are yielded first, round-robin among them, then the remote
/// ones.
#[derive(Debug)]
pub struct DcAwareRoundRobinPolicy {
    local_dc: String,
}

impl DcAwareRoundRobinPolicy {
    pub fn new(local_dc: String) -> Self {
        Self { local_dc }
    }

    fn is_local_node(node: &Node, local_dc: &str) -> bool {
        node.datacenter.as_deref() == Some(local_dc)
    }

    fn retrieve_local_nodes<'a>(&self, cluster: &'a ClusterData) -> &'a [std::sync::Arc<Node>] {
        cluster
            .datacenters
            .get(&self.local_dc)
            .map(|dc| dc.nodes.as_slice())
            .unwrap_or(&[])
    }
}

impl HostSelectionPolicy for DcAwareRoundRobinPolicy {
    fn node<'a>(
        &self,
        cluster: &'a ClusterData,
        query: &QueryInfo<'_>,
        offset: usize,
    ) -> Option<NodeRef<'a>> {
        let local_nodes = self.retrieve_local_nodes(cluster);

        if offset < local_nodes.len() {
            let rotation = compute_rotation(query.base.wrapping_add(offset), local_nodes.len());
            return Some(&local_nodes[rotation]);
        }

        let remote_offset = offset - local_nodes.len();
        let remote_count = cluster.get_nodes_info().len() - local_nodes.len();
        if remote_offset >= remote_count {
            return None;
        }

        let rotation = compute_rotation(query.base.wrapping_add(remote_offset), remote_count);
        cluster
            .get_nodes_info()
            .iter()
            .filter(|node| !Self::is_local_node(node, &self.local_dc))
            .nth(rotation)
    }

    fn name(&self) -> String {
        "DcAwareRoundRobinPolicy".to_string()
    }
}
