use itertools::Itertools;

use super::TokenRing;
use crate::cluster::metadata::Strategy;
use crate::cluster::node::Node;
use crate::routing::Token;

use std::cmp;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;

/// Token ring restricted to the nodes of one datacenter.
#[derive(Debug, Clone)]
struct DatacenterNodes {
    dc_ring: TokenRing<Arc<Node>>,
    unique_node_count: usize,
    rack_count: usize,
}

/// The global token ring plus one ring per datacenter, used to compute
/// replica lists for SimpleStrategy and NetworkTopologyStrategy.
#[derive(Debug, Clone)]
pub(crate) struct ReplicationInfo {
    global_ring: TokenRing<Arc<Node>>,
    unique_node_count: usize,
    datacenters: HashMap<String, DatacenterNodes>,
}

impl ReplicationInfo {
    pub(crate) fn new(ring_iter: impl Iterator<Item = (Token, Arc<Node>)>) -> ReplicationInfo {
        let global_ring: TokenRing<Arc<Node>> = TokenRing::new(ring_iter);
        let unique_node_count = global_ring.iter().map(|(_t, n)| n).unique().count();

        let mut datacenter_nodes: HashMap<&str, Vec<(Token, Arc<Node>)>> = HashMap::new();
        for (token, node) in global_ring.iter() {
            if let Some(datacenter_name) = node.datacenter.as_deref() {
                datacenter_nodes
                    .entry(datacenter_name)
                    .or_default()
                    .push((*token, node.clone()));
            }
        }

        let datacenters = datacenter_nodes
            .into_iter()
            .map(|(datacenter_name, nodes)| {
                let dc_ring = TokenRing::new(nodes);
                let unique_node_count = dc_ring.iter().map(|(_t, n)| n).unique().count();
                // A missing rack counts as a rack of its own.
                let rack_count = dc_ring
                    .iter()
                    .map(|(_t, n)| n.rack.as_deref())
                    .unique()
                    .count();
                (
                    datacenter_name.to_owned(),
                    DatacenterNodes {
                        dc_ring,
                        unique_node_count,
                        rack_count,
                    },
                )
            })
            .collect();

        ReplicationInfo {
            global_ring,
            unique_node_count,
            datacenters,
        }
    }

    pub(crate) fn global_ring(&self) -> &TokenRing<Arc<Node>> {
        &self.global_ring
    }

    /// The first `replication_factor` distinct nodes clockwise from the owner of `token`.
    pub(crate) fn simple_strategy_replicas(
        &self,
        token: Token,
        replication_factor: usize,
    ) -> impl Iterator<Item = &Arc<Node>> {
        let num_to_take = cmp::min(replication_factor, self.unique_node_count);

        self.global_ring
            .ring_range(token)
            .unique()
            .take(num_to_take)
    }

    /// NetworkTopologyStrategy replicas of `token` within one datacenter.
    ///
    /// Nodes are taken clockwise on the datacenter's ring. A node whose rack
    /// was already used is set aside. Once every rack has a replica, the
    /// set-aside nodes come first, in ring order, then the rest of the ring.
    pub(crate) fn nts_replicas_in_datacenter<'a>(
        &'a self,
        token: Token,
        datacenter_name: &str,
        replication_factor: usize,
    ) -> impl Iterator<Item = &'a Arc<Node>> + use<'a> {
        self.datacenters
            .get(datacenter_name)
            .into_iter()
            .flat_map(move |dc| NtsReplicasInDatacenterIterator {
                replicas_left_to_find: cmp::min(replication_factor, dc.unique_node_count),
                unique_dc_ring_nodes_iter: dc.dc_ring.ring_range(token).unique(),
                used_racks: BTreeSet::new(),
                rack_count: dc.rack_count,
                skipped: VecDeque::new(),
            })
    }

    /// Replicas of `token` under `strategy`, primary owner first.
    ///
    /// Datacenters of a NetworkTopologyStrategy are walked in name order.
    /// Strategies the driver cannot compute fall back to the primary owner.
    pub(crate) fn replicas_for_token(&self, token: Token, strategy: &Strategy) -> Vec<Arc<Node>> {
        match strategy {
            Strategy::SimpleStrategy { replication_factor } => self
                .simple_strategy_replicas(token, *replication_factor)
                .cloned()
                .collect(),
            Strategy::NetworkTopologyStrategy {
                datacenter_repfactors,
            } => datacenter_repfactors
                .iter()
                .sorted_by(|(a, _), (b, _)| a.cmp(b))
                .flat_map(|(dc, rf)| self.nts_replicas_in_datacenter(token, dc, *rf))
                .cloned()
                .collect(),
            Strategy::LocalStrategy | Strategy::Other { .. } => self
                .global_ring
                .get_elem_for_token(token)
                .cloned()
                .into_iter()
                .collect(),
        }
    }
}

struct NtsReplicasInDatacenterIterator<'a, I>
where
    I: Iterator<Item = &'a Arc<Node>>,
{
    replicas_left_to_find: usize,
    unique_dc_ring_nodes_iter: I,
    used_racks: BTreeSet<Option<&'a str>>,
    rack_count: usize,
    /// Same-rack nodes passed over while some rack was still unused.
    skipped: VecDeque<&'a Arc<Node>>,
}

impl<'a, I> Iterator for NtsReplicasInDatacenterIterator<'a, I>
where
    I: Iterator<Item = &'a Arc<Node>>,
{
    type Item = &'a Arc<Node>;

    fn next(&mut self) -> Option<&'a Arc<Node>> {
        if self.replicas_left_to_find == 0 {
            return None;
        }

        let next = if self.used_racks.len() >= self.rack_count {
            self.skipped
                .pop_front()
                .or_else(|| self.unique_dc_ring_nodes_iter.next())
        } else {
            self.next_from_unused_rack()
                .or_else(|| self.skipped.pop_front())
        };
        if next.is_some() {
            self.replicas_left_to_find -= 1;
        }
        next
    }
}

impl<'a, I> NtsReplicasInDatacenterIterator<'a, I>
where
    I: Iterator<Item = &'a Arc<Node>>,
{
    fn next_from_unused_rack(&mut self) -> Option<&'a Arc<Node>> {
        for node in &mut self.unique_dc_ring_nodes_iter {
            if self.used_racks.insert(node.rack.as_deref()) {
                return Some(node);
            }
            self.skipped.push_back(node);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::ReplicationInfo;
    use crate::cluster::metadata::Strategy;
    use crate::routing::Token;
    use crate::test_utils::{mock_ring, setup_tracing, A, B, C, D, E, F, G};

    fn ports<'a>(nodes: impl Iterator<Item = &'a std::sync::Arc<crate::cluster::node::Node>>) -> Vec<u16> {
        nodes.map(|node| node.address.port()).collect()
    }

    #[test]
    fn simple_strategy_takes_distinct_nodes_clockwise() {
        setup_tracing();
        let info = ReplicationInfo::new(mock_ring().into_iter());

        let check = |token, rf, expected: Vec<u16>| {
            assert_eq!(
                ports(info.simple_strategy_replicas(Token::new(token), rf)),
                expected
            );
        };

        check(160, 0, vec![]);
        check(160, 2, vec![F, A]);
        check(200, 3, vec![F, A, C]);
        check(200, 7, vec![F, A, C, D, G, B, E]);
        check(701, 3, vec![E, G, B]);
        // More replicas than nodes: every node once.
        check(701, 8, vec![E, G, B, A, F, C, D]);
        // Past the last token the ring wraps.
        check(901, 2, vec![A, B]);
    }

    #[test]
    fn network_topology_strategy_prefers_unused_racks() {
        setup_tracing();
        let info = ReplicationInfo::new(mock_ring().into_iter());

        let check = |token, dc, rf, expected: Vec<u16>| {
            assert_eq!(
                ports(info.nts_replicas_in_datacenter(Token::new(token), dc, rf)),
                expected
            );
        };

        // eu ring: 50A 100B 250A 300C 400A 500G 600B 650C 700C 800G 900B
        check(0, "eu", 1, vec![A]);
        // B shares A's rack and G is the only node in r2.
        check(0, "eu", 2, vec![A, G]);
        // Two racks, rf 3: B was passed over for G and comes right after.
        check(0, "eu", 3, vec![A, G, B]);
        check(0, "eu", 4, vec![A, G, B, C]);
        check(0, "eu", 5, vec![A, G, B, C]);
        // G and B cover both racks, nothing is set aside.
        check(450, "eu", 3, vec![G, B, C]);

        // us ring: 150E 200F 350D 450F 550D 750E
        check(360, "us", 2, vec![F, D]);
        check(360, "us", 3, vec![F, D, E]);

        check(0, "unknown_dc", 3, vec![]);
    }

    #[test]
    fn replicas_for_token_by_strategy() {
        setup_tracing();
        let info = ReplicationInfo::new(mock_ring().into_iter());

        let nts = Strategy::NetworkTopologyStrategy {
            datacenter_repfactors: [("us".to_owned(), 1), ("eu".to_owned(), 2)]
                .into_iter()
                .collect(),
        };
        // eu before us.
        assert_eq!(
            ports(info.replicas_for_token(Token::new(0), &nts).iter()),
            vec![A, G, E]
        );

        assert_eq!(
            ports(
                info.replicas_for_token(Token::new(449), &Strategy::LocalStrategy)
                    .iter()
            ),
            vec![F]
        );
    }
}
