use rand::prelude::SliceRandom;
use rand::{rng, Rng};
use smallvec::SmallVec;
use tracing::trace;

use super::{LoadBalancingPolicy, NodeDistance, Plan, RoutingInfo};
use crate::cluster::{ClusterState, Node, NodeRef};

/// Sends requests to the replicas of the partition first, when the token
/// of the partition key is known.
///
/// Replicas the child policy ignores are skipped. The rest are shuffled,
/// up ones first, and followed by the child's plan without them. Without
/// a token the child's plan is used unchanged.
#[derive(Debug)]
pub struct TokenAwarePolicy<P> {
    child: P,
}

impl<P: LoadBalancingPolicy> TokenAwarePolicy<P> {
    pub fn new(child: P) -> Self {
        Self { child }
    }

    pub fn child(&self) -> &P {
        &self.child
    }
}

type Replicas<'a> = SmallVec<[NodeRef<'a>; 8]>;

/// Shuffles `replicas` and moves the down ones behind the up ones.
fn shuffled_up_first<'a, R: Rng + ?Sized>(
    mut replicas: Replicas<'a>,
    rng: &mut R,
) -> Replicas<'a> {
    replicas.shuffle(rng);
    let (up, down): (Replicas<'a>, Replicas<'a>) =
        replicas.into_iter().partition(|node| node.is_up());
    up.into_iter().chain(down).collect()
}

impl<P: LoadBalancingPolicy> LoadBalancingPolicy for TokenAwarePolicy<P> {
    fn plan<'a>(&'a self, request: &'a RoutingInfo, cluster: &'a ClusterState) -> Plan<'a> {
        let Some(token) = request.token else {
            return self.child.plan(request, cluster);
        };

        let replicas: Replicas<'a> = cluster
            .token_map()
            .get_replicas(request.keyspace.unwrap_or_default(), token)
            .iter()
            .filter(|node| self.child.distance(node) != NodeDistance::Ignored)
            .collect();
        trace!(token = token.value(), replicas = replicas.len(), "Token-aware plan");

        let replicas = shuffled_up_first(replicas, &mut rng());
        let (up_rest, down_rest): (Vec<NodeRef<'a>>, Vec<NodeRef<'a>>) = self
            .child
            .plan(request, cluster)
            .filter(|node| !replicas.iter().any(|replica| replica.address == node.address))
            .partition(|node| node.is_up());

        // Down replicas go behind the rest of the plan's up nodes.
        let (up_replicas, down_replicas): (Replicas<'a>, Replicas<'a>) =
            replicas.into_iter().partition(|node| node.is_up());

        Box::new(
            up_replicas
                .into_iter()
                .chain(up_rest)
                .chain(down_replicas)
                .chain(down_rest),
        )
    }

    fn distance(&self, node: &Node) -> NodeDistance {
        self.child.distance(node)
    }

    fn name(&self) -> String {
        format!("TokenAwarePolicy{{child: {}}}", self.child.name())
    }
}
