use std::sync::atomic::{AtomicUsize, Ordering};

use itertools::Itertools;

use super::{down_last, rotated, LoadBalancingPolicy, NodeDistance, Plan, RoutingInfo};
use crate::cluster::{ClusterState, Node, NodeRef};

/// Round robin over the local datacenter first, then, if allowed, over
/// the other datacenters.
///
/// Nodes with an unknown datacenter count as local.
#[derive(Debug)]
pub struct DcAwareRoundRobinPolicy {
    local_dc: String,
    include_remote_nodes: bool,
    index: AtomicUsize,
}

impl DcAwareRoundRobinPolicy {
    /// Creates a policy which never contacts nodes outside `local_dc`.
    pub fn new(local_dc: impl Into<String>) -> Self {
        Self {
            local_dc: local_dc.into(),
            include_remote_nodes: false,
            index: AtomicUsize::new(0),
        }
    }

    /// Remote nodes are tried after local ones instead of being ignored.
    pub fn with_remote_nodes(mut self, include_remote_nodes: bool) -> Self {
        self.include_remote_nodes = include_remote_nodes;
        self
    }

    fn is_local(&self, node: &Node) -> bool {
        node.datacenter
            .as_deref()
            .is_none_or(|dc| dc == self.local_dc)
    }
}

impl LoadBalancingPolicy for DcAwareRoundRobinPolicy {
    fn plan<'a>(&'a self, _request: &'a RoutingInfo, cluster: &'a ClusterState) -> Plan<'a> {
        let start = self.index.fetch_add(1, Ordering::Relaxed);
        let (local, remote): (Vec<NodeRef<'a>>, Vec<NodeRef<'a>>) = cluster
            .get_nodes_info()
            .iter()
            .partition(|node| self.is_local(node));

        let mut ordered = rotated(&local, start).copied().collect_vec();
        if self.include_remote_nodes {
            ordered.extend(rotated(&remote, start).copied());
        }

        Box::new(down_last(ordered.into_iter()))
    }

    fn distance(&self, node: &Node) -> NodeDistance {
        if self.is_local(node) {
            NodeDistance::Local
        } else if self.include_remote_nodes {
            NodeDistance::Remote
        } else {
            NodeDistance::Ignored
        }
    }

    fn name(&self) -> String {
        "DcAwareRoundRobinPolicy".to_owned()
    }
}
