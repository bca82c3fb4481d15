//! Load balancing configurations\
//! `Session` can use any load balancing policy which implements the `LoadBalancingPolicy` trait
//!
//! A policy answers two questions: in which order should nodes be tried
//! for a given request (the plan), and how far is a node (its distance),
//! which decides the size of the node's pool or whether it has one at all.

use crate::cluster::{ClusterState, Node, NodeRef};
use crate::routing::Token;
use corvid_cql::{Consistency, SerialConsistency};

use std::sync::Arc;

mod dc_aware;
mod round_robin;
mod token_aware;

pub use dc_aware::DcAwareRoundRobinPolicy;
pub use round_robin::RoundRobinPolicy;
pub use token_aware::TokenAwarePolicy;

/// Represents info about statement that can be used by load balancing policies.
#[derive(Default, Clone, Debug)]
pub struct RoutingInfo<'a> {
    pub consistency: Consistency,
    pub serial_consistency: Option<SerialConsistency>,

    /// Token of the partition key, if known.
    pub token: Option<Token>,
    /// Keyspace whose replication decides the replicas of `token`.
    pub keyspace: Option<&'a str>,
}

/// How far a node is from the client, as judged by a load balancing policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeDistance {
    Local,
    Remote,
    /// The node is never contacted and gets no connection pool.
    Ignored,
}

/// Nodes to try for one request, in order. Computed lazily where the
/// policy allows it.
pub type Plan<'a> = Box<dyn Iterator<Item = NodeRef<'a>> + Send + Sync + 'a>;

/// Policy that decides which nodes to contact for each request.
pub trait LoadBalancingPolicy: Send + Sync + std::fmt::Debug {
    /// Returns the nodes to contact for a given request, best first.
    fn plan<'a>(&'a self, request: &'a RoutingInfo, cluster: &'a ClusterState) -> Plan<'a>;

    /// Returns the distance of a node. Must depend only on the node's
    /// placement and the policy's configuration.
    fn distance(&self, node: &Node) -> NodeDistance;

    /// Returns the name of load balancing policy.
    fn name(&self) -> String;
}

impl<P: LoadBalancingPolicy + ?Sized> LoadBalancingPolicy for Arc<P> {
    fn plan<'a>(&'a self, request: &'a RoutingInfo, cluster: &'a ClusterState) -> Plan<'a> {
        (**self).plan(request, cluster)
    }

    fn distance(&self, node: &Node) -> NodeDistance {
        (**self).distance(node)
    }

    fn name(&self) -> String {
        (**self).name()
    }
}

/// The slice starting at `start % len`, wrapping around.
fn rotated<T>(items: &[T], start: usize) -> impl Iterator<Item = &T> {
    let index = if items.is_empty() {
        0
    } else {
        start % items.len()
    };
    items[index..].iter().chain(items[..index].iter())
}

/// Up nodes first, then down ones, each in their original order.
fn down_last<'a>(nodes: impl Iterator<Item = NodeRef<'a>>) -> impl Iterator<Item = NodeRef<'a>> {
    let (up, down): (Vec<_>, Vec<_>) = nodes.partition(|node| node.is_up());
    up.into_iter().chain(down)
}

#[cfg(test)]
mod tests {
    use super::{down_last, rotated};
    use crate::test_utils::{mock_nodes, A, B, C, D, E, F, G};

    #[test]
    fn rotation_wraps_around() {
        let nodes = mock_nodes();
        let ports = |start| {
            rotated(&nodes, start)
                .map(|node| node.address.port())
                .collect::<Vec<_>>()
        };
        assert_eq!(ports(0), vec![A, B, C, D, E, F, G]);
        assert_eq!(ports(3), vec![D, E, F, G, A, B, C]);
        assert_eq!(ports(9), vec![C, D, E, F, G, A, B]);
        assert_eq!(rotated::<u8>(&[], 5).count(), 0);
    }

    #[test]
    fn down_nodes_move_to_the_end() {
        let nodes = mock_nodes();
        nodes[1].set_down();
        nodes[4].set_down();
        let ports: Vec<u16> = down_last(nodes.iter())
            .map(|node| node.address.port())
            .collect();
        assert_eq!(ports, vec![A, C, D, F, G, B, E]);
    }
}
