//! Everything the driver knows about the cluster: its nodes, their state,
//! the schema parts that affect routing, and the background worker keeping
//! all of it current.

mod control_connection;
pub mod metadata;
pub mod node;
pub(crate) mod registry;
mod state;
pub(crate) mod worker;

pub use metadata::{Keyspace, Peer, Strategy};
pub use node::{Node, NodeRef};
pub use state::ClusterState;
