//! Host-selection policies.
//!
//! The query executor walks candidate nodes by asking the session's policy
//! for the `offset`-th candidate of a routing context, starting at 0 and
//! increasing until the policy runs out. Policies are stateless with respect
//! to their inputs, so the executor never pays for per-call plan allocation
//! on the happy path.

pub mod dc_aware;
pub mod round_robin;
pub mod token_aware;

pub use dc_aware::DcAwareRoundRobinPolicy;
pub use round_robin::RoundRobinPolicy;
pub use token_aware::{NetworkTopologyTokenAwarePolicy, SimpleTokenAwarePolicy};

use std::sync::Arc;

use rand::Rng;

use crate::routing::Token;
use crate::transport::cluster::ClusterData;
use crate::transport::node::Node;

pub type NodeRef<'a> = &'a Arc<Node>;

/// The routing context of one execution, immutable for its duration.
#[derive(Debug, Clone, Default)]
pub struct QueryInfo<'a> {
    /// Token of the partition the statement operates on, when derivable.
    pub token: Option<Token>,
    /// Keyspace the statement operates on, when known.
    pub keyspace: Option<&'a str>,
    /// Pseudo-random starting point in the candidate sequence, drawn once
    /// per execution to spread load.
    pub base: usize,
}

impl<'a> QueryInfo<'a> {
    pub fn new(token: Option<Token>, keyspace: Option<&'a str>) -> Self {
        Self {
            token,
            keyspace,
            base: rand::thread_rng().gen(),
        }
    }

    #[cfg(test)]
    pub(crate) fn with_base(token: Option<Token>, keyspace: Option<&'a str>, base: usize) -> Self {
        Self {
            token,
            keyspace,
            base,
        }
    }
}

/// Yields candidate nodes for a query, one offset at a time.
///
/// For fixed internal state and inputs the result is deterministic; `None`
/// means the candidate sequence is exhausted. Composite policies wrap a
/// fallback and are responsible for not re-yielding nodes they already
/// yielded at lower offsets.
pub trait HostSelectionPolicy: Send + Sync + std::fmt::Debug {
    fn node<'a>(
        &self,
        cluster: &'a ClusterData,
        query: &QueryInfo<'_>,
        offset: usize,
    ) -> Option<NodeRef<'a>>;

    /// Returns the name of the host-selection policy.
    fn name(&self) -> String;
}

pub(crate) fn compute_rotation(base: usize, count: usize) -> usize {
    if count > 0 {
        base % count
    } else {
        0
    }
}
