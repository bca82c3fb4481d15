//! Connections to a single node and the per-node pools built on them.

pub(crate) mod connection;
pub(crate) mod connection_pool;

pub(crate) use connection::{Connection, ConnectionConfig, VerifiedKeyspaceName};
pub(crate) use connection_pool::{ConnectivityChangeEvent, NodeConnectionPool};
pub use connection_pool::{PoolConfig, PoolSizing};
