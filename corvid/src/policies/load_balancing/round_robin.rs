use std::sync::atomic::{AtomicUsize, Ordering};

use super::{down_last, rotated, LoadBalancingPolicy, NodeDistance, Plan, RoutingInfo};
use crate::cluster::{ClusterState, Node};

/// Rotates over every node of the cluster, starting one node further with
/// each plan. All nodes are local.
#[derive(Debug, Default)]
pub struct RoundRobinPolicy {
    index: AtomicUsize,
}

impl RoundRobinPolicy {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LoadBalancingPolicy for RoundRobinPolicy {
    fn plan<'a>(&'a self, _request: &'a RoutingInfo, cluster: &'a ClusterState) -> Plan<'a> {
        let start = self.index.fetch_add(1, Ordering::Relaxed);
        Box::new(down_last(rotated(cluster.get_nodes_info(), start)))
    }

    fn distance(&self, _node: &Node) -> NodeDistance {
        NodeDistance::Local
    }

    fn name(&self) -> String {
        "RoundRobinPolicy".to_owned()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::RoundRobinPolicy;
    use crate::cluster::ClusterState;
    use crate::policies::load_balancing::{LoadBalancingPolicy, NodeDistance, RoutingInfo};
    use crate::test_utils::{mock_nodes, setup_tracing, A, B, C, D, E, F, G};

    #[test]
    fn consecutive_plans_start_at_consecutive_nodes() {
        setup_tracing();
        let cluster = ClusterState::new(mock_nodes(), HashMap::new());
        let policy = RoundRobinPolicy::new();
        let info = RoutingInfo::default();

        let first: Vec<u16> = policy
            .plan(&info, &cluster)
            .map(|node| node.address.port())
            .collect();
        assert_eq!(first, vec![A, B, C, D, E, F, G]);

        let second: Vec<u16> = policy
            .plan(&info, &cluster)
            .map(|node| node.address.port())
            .collect();
        assert_eq!(second, vec![B, C, D, E, F, G, A]);

        for node in cluster.get_nodes_info() {
            assert_eq!(policy.distance(node), NodeDistance::Local);
        }
    }

    #[test]
    fn down_nodes_are_tried_last() {
        setup_tracing();
        let cluster = ClusterState::new(mock_nodes(), HashMap::new());
        cluster.get_nodes_info()[0].set_down();
        let policy = RoundRobinPolicy::new();

        let plan: Vec<u16> = policy
            .plan(&RoutingInfo::default(), &cluster)
            .map(|node| node.address.port())
            .collect();
        assert_eq!(plan, vec![B, C, D, E, F, G, A]);
    }
}
