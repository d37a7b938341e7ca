use super::{compute_rotation, HostSelectionPolicy, NodeRef, QueryInfo};
use crate::transport::cluster::ClusterData;

/// A Round-robin host-selection policy.
#[derive(Debug, Default)]
pub struct RoundRobinPolicy;

impl RoundRobinPolicy {
    pub fn new() -> Self {
        Self
    }
}

impl HostSelectionPolicy for RoundRobinPolicy {
    fn node<'a>(
        &self,
        cluster: &'a ClusterData,
        query: &QueryInfo<'_>,
        offset: usize,
    ) -> Option<NodeRef<'a>> {
        let nodes = cluster.get_nodes_info();
        if offset >= nodes.len() {
            return None;
        }

        let rotation = compute_rotation(query.base.wrapping_add(offset), nodes.len());
        Some(&nodes[rotation])
    }

    fn name(&self) -> String {
        "RoundRobinPolicy".to_string()
    }
}
