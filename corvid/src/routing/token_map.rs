//! Answers "which nodes hold replicas of this token in this keyspace".
//!
//! Replica lists are computed once per distinct replication strategy when
//! the map is built, so a lookup is a binary search on a ring. The map is
//! immutable; topology or schema changes build a new one, which replaces
//! the old inside a fresh [`ClusterState`](crate::cluster::ClusterState).

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use super::replication::ReplicationInfo;
use super::{Token, TokenRing};
use crate::cluster::metadata::{Keyspace, Strategy};
use crate::cluster::node::Node;

#[derive(Debug, Clone)]
pub struct TokenMap {
    replication: ReplicationInfo,

    /// Precomputed replica ring per distinct computable strategy.
    replica_rings: Vec<(Strategy, TokenRing<Vec<Arc<Node>>>)>,

    /// Keyspace name to index in `replica_rings`.
    keyspaces: HashMap<String, usize>,
}

impl TokenMap {
    pub(crate) fn build<'a>(
        nodes: impl IntoIterator<Item = &'a Arc<Node>>,
        keyspaces: &HashMap<String, Keyspace>,
    ) -> TokenMap {
        let ring_entries = nodes
            .into_iter()
            .flat_map(|node| {
                let tokens = node.tokens();
                tokens
                    .iter()
                    .map(|token| (*token, node.clone()))
                    .collect::<Vec<_>>()
            });
        let replication = ReplicationInfo::new(ring_entries);

        let mut replica_rings: Vec<(Strategy, TokenRing<Vec<Arc<Node>>>)> = Vec::new();
        let mut keyspace_indexes = HashMap::with_capacity(keyspaces.len());

        for (name, keyspace) in keyspaces {
            if !matches!(
                keyspace.strategy,
                Strategy::SimpleStrategy { .. } | Strategy::NetworkTopologyStrategy { .. }
            ) {
                continue;
            }

            let index = match replica_rings
                .iter()
                .position(|(strategy, _)| *strategy == keyspace.strategy)
            {
                Some(index) => index,
                None => {
                    let ring = TokenRing::new(replication.global_ring().iter().map(|(token, _)| {
                        (
                            *token,
                            replication.replicas_for_token(*token, &keyspace.strategy),
                        )
                    }));
                    replica_rings.push((keyspace.strategy.clone(), ring));
                    replica_rings.len() - 1
                }
            };
            keyspace_indexes.insert(name.clone(), index);
        }

        debug!(
            ring_size = replication.global_ring().len(),
            strategies = replica_rings.len(),
            "Built token map"
        );

        TokenMap {
            replication,
            replica_rings,
            keyspaces: keyspace_indexes,
        }
    }

    /// Replicas of `token` in `keyspace`, primary owner first.
    ///
    /// Keyspaces that are unknown, or whose strategy is not Simple or
    /// NetworkTopology, yield the primary owner only. An empty ring yields
    /// nothing.
    pub fn get_replicas(&self, keyspace: &str, token: Token) -> &[Arc<Node>] {
        let precomputed = self
            .keyspaces
            .get(keyspace)
            .and_then(|index| self.replica_rings.get(*index))
            .and_then(|(_, ring)| ring.get_elem_for_token(token));

        match precomputed {
            Some(replicas) => replicas.as_slice(),
            None => self
                .primary_replica(token)
                .map(std::slice::from_ref)
                .unwrap_or(&[]),
        }
    }

    /// The node owning `token`: the one with the smallest ring token `>= token`,
    /// wrapping around past the largest.
    pub fn primary_replica(&self, token: Token) -> Option<&Arc<Node>> {
        self.replication.global_ring().get_elem_for_token(token)
    }

    /// Ring positions in token order.
    pub fn ring(&self) -> impl Iterator<Item = (Token, &Arc<Node>)> {
        self.replication
            .global_ring()
            .iter()
            .map(|(token, node)| (*token, node))
    }

    pub fn is_empty(&self) -> bool {
        self.replication.global_ring().is_empty()
    }
}
