use arc_swap::ArcSwap;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::errors::{ConnectionPoolError, UseKeyspaceError};
use crate::network::{
    Connection, ConnectionConfig, ConnectivityChangeEvent, NodeConnectionPool, PoolConfig,
    VerifiedKeyspaceName,
};
use crate::policies::load_balancing::{LoadBalancingPolicy, NodeDistance};
use crate::policies::reconnection::{ReconnectionPolicy, ReconnectionSchedule};
use crate::routing::Token;

use super::metadata::Peer;

use std::hash::{Hash, Hasher};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// The backoff state of one node, shared by its pool refiller and the
/// registry.
///
/// Every failed attempt advances the schedule. A success, or the node
/// being reported up, starts a fresh one.
pub(crate) struct ReconnectionState {
    policy: Arc<dyn ReconnectionPolicy>,
    schedule: Mutex<Box<dyn ReconnectionSchedule>>,
}

impl ReconnectionState {
    pub(crate) fn new(policy: Arc<dyn ReconnectionPolicy>) -> Self {
        let schedule = Mutex::new(policy.new_schedule());
        Self { policy, schedule }
    }

    pub(crate) fn next_delay(&self) -> Duration {
        let mut schedule = self
            .schedule
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        schedule.next_delay()
    }

    pub(crate) fn reset(&self) {
        let fresh = self.policy.new_schedule();
        *self
            .schedule
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = fresh;
    }
}

impl std::fmt::Debug for ReconnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReconnectionState")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

/// Node represents a cluster node along with its data and connections
///
/// If a node changes its placement or address, it is replaced by a new
/// instance with a new pool.
pub struct Node {
    /// Unique identifier of the node.
    pub host_id: Uuid,
    /// Address of the node, which is used to connect to it.
    pub address: SocketAddr,
    /// Datacenter of the node, if known.
    pub datacenter: Option<String>,
    /// Rack of the node, if known.
    pub rack: Option<String>,
    /// Tokens the node owns on the ring. Refreshed with every topology
    /// read, since a bootstrapping node reports none at first.
    tokens: ArcSwap<Vec<Token>>,

    up: AtomicBool,
    distance: NodeDistance,
    reconnection: Arc<ReconnectionState>,

    /// Connection pool for this node.
    ///
    /// Nodes ignored by the load balancing policy have none.
    pool: Option<NodeConnectionPool>,
}

/// A way that Nodes are often passed and accessed in the driver's code.
pub type NodeRef<'a> = &'a Arc<Node>;

impl Node {
    /// Whether the node is considered up. A node starts up and goes down
    /// when its pool loses every connection or the cluster reports it down.
    pub fn is_up(&self) -> bool {
        self.up.load(Ordering::Acquire)
    }

    /// Returns true if the driver has any open connections in the pool for this
    /// node.
    pub fn is_connected(&self) -> bool {
        self.pool.as_ref().is_some_and(|pool| pool.is_connected())
    }

    /// Only enabled nodes have connections open. Nodes the load balancing
    /// policy ignores are disabled.
    pub fn is_enabled(&self) -> bool {
        self.pool.is_some()
    }

    pub fn distance(&self) -> NodeDistance {
        self.distance
    }

    /// Tokens the node owned at the last topology read.
    pub fn tokens(&self) -> Arc<Vec<Token>> {
        self.tokens.load_full()
    }

    /// Replaces the owned tokens. True iff they changed.
    pub(crate) fn set_tokens(&self, tokens: Vec<Token>) -> bool {
        if **self.tokens.load() == tokens {
            return false;
        }
        self.tokens.store(Arc::new(tokens));
        true
    }

    /// Flips the node down. True iff this call made the transition.
    pub(crate) fn set_down(&self) -> bool {
        self.up
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Flips the node up. True iff this call made the transition, in which
    /// case the backoff starts over and the pool reconnects right away.
    pub(crate) fn set_up_if_down(&self) -> bool {
        let flipped = self
            .up
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if flipped {
            self.reconnection.reset();
            if let Some(pool) = &self.pool {
                pool.trigger_refill();
            }
        }
        flipped
    }

    pub(crate) async fn borrow_connection(&self) -> Result<Arc<Connection>, ConnectionPoolError> {
        self.get_pool()?.borrow().await
    }

    pub(crate) async fn use_keyspace(
        &self,
        keyspace_name: VerifiedKeyspaceName,
    ) -> Result<(), UseKeyspaceError> {
        if let Some(pool) = &self.pool {
            pool.use_keyspace(keyspace_name).await?;
        }
        Ok(())
    }

    pub(crate) fn get_working_connections(
        &self,
    ) -> Result<Vec<Arc<Connection>>, ConnectionPoolError> {
        self.get_pool()?.get_working_connections()
    }

    pub(crate) async fn wait_until_pool_initialized(&self) {
        if let Some(pool) = &self.pool {
            pool.wait_until_initialized().await;
        }
    }

    /// Same host id, address and placement: the metadata describes this
    /// very node. Tokens are not part of the identity, see
    /// [`Node::set_tokens`].
    pub(crate) fn matches_peer(&self, peer: &Peer) -> bool {
        self.host_id == peer.host_id
            && self.address == peer.address
            && self.datacenter == peer.datacenter
            && self.rack == peer.rack
    }

    fn get_pool(&self) -> Result<&NodeConnectionPool, ConnectionPoolError> {
        self.pool.as_ref().ok_or(ConnectionPoolError::NodeIgnored)
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("host_id", &self.host_id)
            .field("address", &self.address)
            .field("datacenter", &self.datacenter)
            .field("rack", &self.rack)
            .field("up", &self.is_up())
            .field("distance", &self.distance)
            .finish_non_exhaustive()
    }
}

impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        self.host_id == other.host_id
    }
}

impl Eq for Node {}

impl Hash for Node {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.host_id.hash(state);
    }
}

/// Everything a new [`Node`] needs besides its own metadata.
#[derive(Clone)]
pub(crate) struct NodeFactory {
    pub(crate) pool_config: PoolConfig,
    pub(crate) connection_config: ConnectionConfig,
    pub(crate) reconnection_policy: Arc<dyn ReconnectionPolicy>,
    pub(crate) connectivity_events: mpsc::UnboundedSender<ConnectivityChangeEvent>,
}

impl NodeFactory {
    /// Creates a node which starts connecting in the background, unless
    /// the load balancing policy ignores it.
    pub(crate) fn create(
        &self,
        peer: Peer,
        load_balancing: &dyn LoadBalancingPolicy,
        keyspace: Option<VerifiedKeyspaceName>,
    ) -> Node {
        if peer.tokens.is_empty() {
            warn!(node = %peer.address, "Node owns no tokens");
        }

        let reconnection = Arc::new(ReconnectionState::new(self.reconnection_policy.clone()));
        let mut node = Node {
            host_id: peer.host_id,
            address: peer.address,
            datacenter: peer.datacenter,
            rack: peer.rack,
            tokens: ArcSwap::from_pointee(peer.tokens),
            up: AtomicBool::new(true),
            distance: NodeDistance::Ignored,
            reconnection,
            pool: None,
        };

        // Distance depends on placement only, so it can be asked before the
        // node has a pool.
        node.distance = load_balancing.distance(&node);
        node.pool = match self.pool_config.sizing_for(node.distance) {
            Some(sizing) => Some(NodeConnectionPool::new(
                node.address,
                sizing,
                self.connection_config.clone(),
                node.reconnection.clone(),
                keyspace,
                self.connectivity_events.clone(),
            )),
            None => {
                debug!(node = %node.address, "Node is ignored, not opening a pool");
                None
            }
        };
        node
    }
}

#[cfg(test)]
impl Node {
    pub(crate) fn new_for_test(
        id: Option<Uuid>,
        address: SocketAddr,
        datacenter: Option<String>,
        rack: Option<String>,
        tokens: Vec<Token>,
    ) -> Self {
        use crate::policies::reconnection::ConstantReconnectionPolicy;

        Self {
            host_id: id.unwrap_or_else(Uuid::new_v4),
            address,
            datacenter,
            rack,
            tokens: ArcSwap::from_pointee(tokens),
            up: AtomicBool::new(true),
            distance: NodeDistance::Local,
            reconnection: Arc::new(ReconnectionState::new(Arc::new(
                ConstantReconnectionPolicy::new(Duration::from_millis(10)),
            ))),
            pool: None,
        }
    }
}
