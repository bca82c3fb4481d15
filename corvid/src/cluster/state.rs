use crate::errors::SchemaAgreementError;
use crate::network::Connection;
use crate::routing::partitioner::Murmur3Partitioner;
use crate::routing::{Token, TokenMap};

use itertools::Itertools;
use std::collections::HashMap;
use std::sync::Arc;

use super::metadata::Keyspace;
use super::node::Node;

/// Represents the state of the cluster: known nodes, keyspaces, and the
/// token map built from both.
///
/// It is immutable after creation, and is replaced atomically upon a
/// metadata refresh. Node up/down flags are the only part that changes in
/// place. Can be accessed through
/// [Session::get_cluster_state()](crate::client::session::Session::get_cluster_state).
#[derive(Clone)]
pub struct ClusterState {
    /// All nodes known to be part of the cluster, down ones included,
    /// ordered by address.
    pub(crate) all_nodes: Vec<Arc<Node>>,

    /// All keyspaces in the cluster, accessible by their name.
    pub(crate) keyspaces: HashMap<String, Keyspace>,

    pub(crate) token_map: TokenMap,
}

/// Enables printing [ClusterState] struct in a neat way, skipping the ring,
/// which is large.
impl std::fmt::Debug for ClusterState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        struct RingSizePrinter(usize);
        impl std::fmt::Debug for RingSizePrinter {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "<size={}>", self.0)
            }
        }

        f.debug_struct("ClusterState")
            .field("nodes", &self.all_nodes)
            .field("ring", &RingSizePrinter(self.token_map.ring().count()))
            .field("keyspaces", &self.keyspaces.keys())
            .finish_non_exhaustive()
    }
}

impl ClusterState {
    pub(crate) fn new(mut nodes: Vec<Arc<Node>>, keyspaces: HashMap<String, Keyspace>) -> Self {
        nodes.sort_unstable_by_key(|node| node.address);
        let token_map = TokenMap::build(&nodes, &keyspaces);
        ClusterState {
            all_nodes: nodes,
            keyspaces,
            token_map,
        }
    }

    /// The same nodes with keyspaces changed, and the token map rebuilt.
    pub(crate) fn with_keyspaces(&self, keyspaces: HashMap<String, Keyspace>) -> Self {
        Self::new(self.all_nodes.clone(), keyspaces)
    }

    pub(crate) async fn wait_until_all_pools_are_initialized(&self) {
        for node in self.all_nodes.iter() {
            node.wait_until_pool_initialized().await;
        }
    }

    /// Access keyspace details collected by the driver.
    pub fn get_keyspace(&self, keyspace: impl AsRef<str>) -> Option<&Keyspace> {
        self.keyspaces.get(keyspace.as_ref())
    }

    /// Returns an iterator over keyspaces.
    pub fn keyspaces_iter(&self) -> impl Iterator<Item = (&str, &Keyspace)> {
        self.keyspaces.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Access details about nodes known to the driver
    pub fn get_nodes_info(&self) -> &[Arc<Node>] {
        &self.all_nodes
    }

    pub fn token_map(&self) -> &TokenMap {
        &self.token_map
    }

    /// Token of a serialized partition key.
    pub fn compute_token(&self, partition_key: &[u8]) -> Token {
        Murmur3Partitioner.hash(partition_key)
    }

    /// Replicas owning a given token in a keyspace, primary owner first.
    pub fn get_token_endpoints(&self, keyspace: &str, token: Token) -> Vec<Arc<Node>> {
        self.token_map.get_replicas(keyspace, token).to_vec()
    }

    /// One working connection to every up node.
    ///
    /// Fails if no node is up, or if none of the up nodes has a connection.
    pub(crate) fn working_connections_to_up_nodes(
        &self,
    ) -> Result<Vec<Arc<Connection>>, SchemaAgreementError> {
        let mut per_node = self
            .all_nodes
            .iter()
            .filter(|node| node.is_up() && node.is_enabled())
            .map(|node| {
                node.get_working_connections()
                    .map(|conns| conns.into_iter().next())
            })
            .peekable();

        if per_node.peek().is_none() {
            return Err(SchemaAgreementError::NoUpNodes);
        }

        let mut first_error = None;
        let mut connections = Vec::new();
        for result in per_node {
            match result {
                Ok(Some(conn)) => connections.push(conn),
                Ok(None) => {}
                Err(err) => {
                    first_error.get_or_insert(err);
                }
            }
        }

        match (connections.is_empty(), first_error) {
            (true, Some(err)) => Err(err.into()),
            (true, None) => Err(SchemaAgreementError::NoUpNodes),
            (false, _) => Ok(connections),
        }
    }

    /// Nodes grouped by datacenter, in address order within each.
    pub(crate) fn nodes_by_datacenter(&self) -> HashMap<Option<&str>, Vec<&Arc<Node>>> {
        self.all_nodes
            .iter()
            .into_group_map_by(|node| node.datacenter.as_deref())
    }
}
