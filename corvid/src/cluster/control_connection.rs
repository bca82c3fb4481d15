//! Specially treated single connection used to fetch metadata
//! and receive events from the cluster.

use std::net::SocketAddr;
use std::sync::Arc;

use crate::errors::{BrokenConnectionErrorKind, ConnectionError, MetadataError};
use crate::network::connection::{open_connection, ErrorReceiver};
use crate::network::{Connection, ConnectionConfig};

use super::metadata::{self, Keyspace, Metadata};

/// The single connection used to fetch metadata and receive events from the cluster.
pub(super) struct ControlConnection {
    conn: Arc<Connection>,
    error_receiver: ErrorReceiver,
}

impl ControlConnection {
    /// Opens a connection registered for server events. `config` must
    /// carry the event sender.
    pub(super) async fn open(
        address: SocketAddr,
        config: &ConnectionConfig,
    ) -> Result<Self, ConnectionError> {
        debug_assert!(config.event_sender.is_some());
        let (conn, error_receiver) = open_connection(address, config).await?;
        Ok(Self {
            conn: Arc::new(conn),
            error_receiver,
        })
    }

    pub(super) fn get_connect_address(&self) -> SocketAddr {
        self.conn.get_connect_address()
    }

    pub(super) async fn query_metadata(&self) -> Result<Metadata, MetadataError> {
        metadata::query_metadata(&self.conn, self.get_connect_address().port()).await
    }

    pub(super) async fn query_keyspace(
        &self,
        keyspace_name: &str,
    ) -> Result<Option<Keyspace>, MetadataError> {
        metadata::query_keyspace(&self.conn, keyspace_name).await
    }

    /// Resolves once the connection breaks. Must not be polled again after
    /// it resolved.
    pub(super) async fn broken(&mut self) -> ConnectionError {
        match (&mut self.error_receiver).await {
            Ok(error) => error,
            // The router is gone without reporting anything.
            Err(_) => ConnectionError::BrokenConnection(BrokenConnectionErrorKind::ChannelError.into()),
        }
    }
}
