//! Notifications about hosts joining, leaving, and changing state.

use std::net::SocketAddr;

use uuid::Uuid;

/// Host an event is about.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub struct HostEventContext {
    pub(crate) host_id: Uuid,
    pub(crate) addr: SocketAddr,
}

impl HostEventContext {
    pub fn host_id(&self) -> Uuid {
        self.host_id
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }
}

#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostEvent {
    /// The host was discovered, by a topology refresh or a NEW_NODE event.
    Added,

    /// The host left the cluster.
    Removed,

    /// The host became reachable again: its pool opened a connection, or
    /// the cluster reported it UP.
    Up,

    /// The host became unreachable: its pool lost every connection, or
    /// the cluster reported it DOWN.
    Down,
}

/// Receives [`HostEvent`]s.
///
/// Up and down transitions are deduplicated: a listener never sees two `Up`s
/// without a `Down` in between, however many components observed the change.
/// Callbacks run on the driver's tasks and must not block.
pub trait HostListener: Send + Sync {
    fn on_event(&self, ctx: &HostEventContext, event: &HostEvent);
}
