//! The set of known nodes, keyed by address, and their up/down state.
//!
//! Transitions are compare-and-set on the node's flag, so when several
//! observers (pools, server events, the control connection) report the same
//! change at once, exactly one of them wins and only the winner notifies the
//! [`HostListener`]s.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{debug, info};

use super::metadata::Peer;
use super::node::Node;
use crate::policies::host_listener::{HostEvent, HostEventContext, HostListener};

pub(crate) struct HostRegistry {
    nodes: DashMap<SocketAddr, Arc<Node>>,
    listeners: Vec<Arc<dyn HostListener>>,
}

impl HostRegistry {
    pub(crate) fn new(listeners: Vec<Arc<dyn HostListener>>) -> Self {
        Self {
            nodes: DashMap::new(),
            listeners,
        }
    }

    pub(crate) fn get(&self, address: &SocketAddr) -> Option<Arc<Node>> {
        self.nodes.get(address).map(|entry| entry.value().clone())
    }

    pub(crate) fn nodes(&self) -> Vec<Arc<Node>> {
        self.nodes.iter().map(|entry| entry.value().clone()).collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Inserts a node for `peer`, built by `make`, or brings the node
    /// already known at that address up.
    pub(crate) fn add_or_bring_up(&self, peer: Peer, make: impl FnOnce(Peer) -> Node) -> Arc<Node> {
        let address = peer.address;
        // Listeners run after the shard lock is released.
        let (node, added) = match self.nodes.entry(address) {
            Entry::Occupied(entry) => (entry.get().clone(), false),
            Entry::Vacant(entry) => {
                let node = Arc::new(make(peer));
                entry.insert(node.clone());
                (node, true)
            }
        };

        if added {
            info!(node = %address, host_id = %node.host_id, "Node added to cluster");
            self.emit(&node, HostEvent::Added);
            if node.is_up() {
                self.emit(&node, HostEvent::Up);
            }
        } else if node.set_up_if_down() {
            info!(node = %address, "Node is up");
            self.emit(&node, HostEvent::Up);
        }
        node
    }

    /// Marks the node down. True iff it was up until now.
    pub(crate) fn set_down(&self, address: &SocketAddr) -> bool {
        let Some(node) = self.get(address) else {
            debug!(node = %address, "Down report for unknown node");
            return false;
        };
        if !node.set_down() {
            return false;
        }
        info!(node = %address, "Node is down");
        self.emit(&node, HostEvent::Down);
        true
    }

    /// Marks the node up and restarts its reconnection backoff. True iff it
    /// was down until now.
    pub(crate) fn bring_up_if_down(&self, address: &SocketAddr) -> bool {
        let Some(node) = self.get(address) else {
            debug!(node = %address, "Up report for unknown node");
            return false;
        };
        if !node.set_up_if_down() {
            return false;
        }
        info!(node = %address, "Node is up");
        self.emit(&node, HostEvent::Up);
        true
    }

    /// Forgets the node. Listeners see it go down first if it was up.
    pub(crate) fn remove(&self, address: &SocketAddr) -> Option<Arc<Node>> {
        let (_, node) = self.nodes.remove(address)?;
        info!(node = %address, host_id = %node.host_id, "Node removed from cluster");
        if node.set_down() {
            self.emit(&node, HostEvent::Down);
        }
        self.emit(&node, HostEvent::Removed);
        Some(node)
    }

    /// Makes the registry hold exactly `peers`: unknown ones are added,
    /// missing ones removed, and nodes whose identity or placement changed
    /// are replaced. Unchanged nodes take the peer's current tokens. A down
    /// node whose pool is still connected is brought back up; otherwise
    /// the up/down state of unchanged nodes is left alone.
    pub(crate) fn sync_peers(&self, peers: Vec<Peer>, mut make: impl FnMut(Peer) -> Node) {
        let wanted: HashSet<SocketAddr> = peers.iter().map(|peer| peer.address).collect();
        let stale: Vec<SocketAddr> = self
            .nodes
            .iter()
            .map(|entry| *entry.key())
            .filter(|address| !wanted.contains(address))
            .collect();
        for address in stale {
            self.remove(&address);
        }

        for peer in peers {
            match self.get(&peer.address) {
                Some(node) if node.matches_peer(&peer) => {
                    if node.set_tokens(peer.tokens) {
                        debug!(node = %peer.address, "Node tokens changed");
                    }
                    if !node.is_up() && node.is_connected() {
                        self.bring_up_if_down(&peer.address);
                    }
                }
                Some(_) => {
                    debug!(node = %peer.address, "Node changed identity or placement, replacing it");
                    self.remove(&peer.address);
                    self.add_or_bring_up(peer, &mut make);
                }
                None => {
                    self.add_or_bring_up(peer, &mut make);
                }
            }
        }
    }

    fn emit(&self, node: &Node, event: HostEvent) {
        let ctx = HostEventContext {
            host_id: node.host_id,
            addr: node.address,
        };
        for listener in &self.listeners {
            listener.on_event(&ctx, &event);
        }
    }
}

impl std::fmt::Debug for HostRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostRegistry")
            .field("nodes", &self.nodes)
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::net::SocketAddr;
    use std::sync::{Arc, Mutex};

    use std::collections::HashMap;

    use uuid::Uuid;

    use super::HostRegistry;
    use crate::cluster::metadata::Peer;
    use crate::cluster::node::Node;
    use crate::policies::host_listener::{HostEvent, HostEventContext, HostListener};
    use crate::routing::token_map::TokenMap;
    use crate::routing::Token;
    use crate::test_utils::{id_to_address, id_to_host_id, setup_tracing};

    /// Records every event it sees.
    #[derive(Default)]
    pub(crate) struct RecordingListener {
        pub(crate) events: Mutex<Vec<(SocketAddr, HostEvent)>>,
    }

    impl RecordingListener {
        pub(crate) fn take(&self) -> Vec<(SocketAddr, HostEvent)> {
            std::mem::take(&mut *self.events.lock().unwrap())
        }
    }

    impl HostListener for RecordingListener {
        fn on_event(&self, ctx: &HostEventContext, event: &HostEvent) {
            self.events.lock().unwrap().push((ctx.addr(), *event));
        }
    }

    fn peer(id: u16) -> Peer {
        Peer {
            host_id: id_to_host_id(id),
            address: id_to_address(id),
            tokens: vec![Token::new(id as i64 * 100)],
            datacenter: Some("dc1".to_owned()),
            rack: Some("r1".to_owned()),
        }
    }

    fn make(peer: Peer) -> Node {
        Node::new_for_test(
            Some(peer.host_id),
            peer.address,
            peer.datacenter,
            peer.rack,
            peer.tokens,
        )
    }

    fn registry() -> (HostRegistry, Arc<RecordingListener>) {
        let listener = Arc::new(RecordingListener::default());
        (HostRegistry::new(vec![listener.clone()]), listener)
    }

    #[test]
    fn add_then_bring_up_reuses_the_node() {
        setup_tracing();
        let (registry, listener) = registry();

        let first = registry.add_or_bring_up(peer(1), make);
        let again = registry.add_or_bring_up(peer(1), make);
        assert!(Arc::ptr_eq(&first, &again));
        assert_eq!(registry.len(), 1);
        assert_eq!(
            listener.take(),
            vec![(id_to_address(1), HostEvent::Added), (id_to_address(1), HostEvent::Up)]
        );

        assert!(registry.set_down(&id_to_address(1)));
        registry.add_or_bring_up(peer(1), make);
        assert!(first.is_up());
        assert_eq!(
            listener.take(),
            vec![(id_to_address(1), HostEvent::Down), (id_to_address(1), HostEvent::Up)]
        );
    }

    #[test]
    fn transitions_are_reported_once() {
        let (registry, listener) = registry();
        registry.add_or_bring_up(peer(1), make);
        listener.take();

        assert!(registry.set_down(&id_to_address(1)));
        assert!(!registry.set_down(&id_to_address(1)));
        assert!(registry.bring_up_if_down(&id_to_address(1)));
        assert!(!registry.bring_up_if_down(&id_to_address(1)));
        assert_eq!(
            listener.take(),
            vec![(id_to_address(1), HostEvent::Down), (id_to_address(1), HostEvent::Up)]
        );

        // Unknown nodes are ignored.
        assert!(!registry.set_down(&id_to_address(9)));
        assert!(!registry.bring_up_if_down(&id_to_address(9)));
    }

    #[test]
    fn concurrent_reports_have_one_winner() {
        let (registry, listener) = registry();
        registry.add_or_bring_up(peer(1), make);
        listener.take();

        let wins: usize = std::thread::scope(|s| {
            let handles: Vec<_> = (0..8)
                .map(|_| s.spawn(|| registry.set_down(&id_to_address(1))))
                .collect();
            handles.into_iter().map(|h| h.join().unwrap() as usize).sum()
        });
        assert_eq!(wins, 1);
        assert_eq!(listener.take(), vec![(id_to_address(1), HostEvent::Down)]);
    }

    #[test]
    fn down_nodes_stay_until_removed() {
        let (registry, listener) = registry();
        registry.add_or_bring_up(peer(1), make);
        registry.set_down(&id_to_address(1));
        listener.take();

        let node = registry.get(&id_to_address(1)).unwrap();
        assert!(!node.is_up());

        let removed = registry.remove(&id_to_address(1)).unwrap();
        assert_eq!(removed.host_id, id_to_host_id(1));
        assert!(registry.get(&id_to_address(1)).is_none());
        assert!(registry.remove(&id_to_address(1)).is_none());
        assert_eq!(listener.take(), vec![(id_to_address(1), HostEvent::Removed)]);
    }

    #[test]
    fn sync_adds_removes_and_replaces() {
        let (registry, listener) = registry();
        registry.sync_peers(vec![peer(1), peer(2)], make);
        let kept = registry.get(&id_to_address(1)).unwrap();
        kept.set_down();
        listener.take();

        let mut moved = peer(2);
        moved.host_id = Uuid::from_u128(99);
        registry.sync_peers(vec![peer(1), moved, peer(3)], make);

        // Unchanged node: same instance, still down.
        let after = registry.get(&id_to_address(1)).unwrap();
        assert!(Arc::ptr_eq(&kept, &after));
        assert!(!after.is_up());

        assert_eq!(registry.get(&id_to_address(2)).unwrap().host_id, Uuid::from_u128(99));
        assert_eq!(registry.len(), 3);

        let events = listener.take();
        assert!(events.contains(&(id_to_address(2), HostEvent::Removed)));
        assert!(events.contains(&(id_to_address(2), HostEvent::Added)));
        assert!(events.contains(&(id_to_address(3), HostEvent::Added)));

        registry.sync_peers(vec![peer(3)], make);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn sync_refreshes_tokens_of_known_nodes() {
        let (registry, listener) = registry();
        let mut bootstrapping = peer(1);
        bootstrapping.tokens = vec![];
        registry.sync_peers(vec![bootstrapping], make);
        let node = registry.get(&id_to_address(1)).unwrap();
        let nodes = registry.nodes();
        assert!(TokenMap::build(&nodes, &HashMap::new()).is_empty());
        listener.take();

        registry.sync_peers(vec![peer(1)], make);
        let after = registry.get(&id_to_address(1)).unwrap();
        assert!(Arc::ptr_eq(&node, &after));
        assert_eq!(*after.tokens(), vec![Token::new(100)]);
        assert_eq!(listener.take(), vec![]);

        let nodes = registry.nodes();
        let token_map = TokenMap::build(&nodes, &HashMap::new());
        let ring: Vec<_> = token_map.ring().collect();
        assert_eq!(ring.len(), 1);
        assert_eq!(ring[0].0, Token::new(100));
        assert!(Arc::ptr_eq(ring[0].1, &after));
    }
}
