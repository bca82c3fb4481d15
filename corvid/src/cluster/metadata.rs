//! Topology and schema metadata read from the system tables over the
//! control connection.
//!
//! Only what routing needs is fetched: the nodes with their placement and
//! tokens, and the replication options of every keyspace.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::str::FromStr;

use corvid_cql::frame::response::result::{CqlValue, Row};
use rand::Rng;
use tracing::{trace, warn};
use uuid::Uuid;

use crate::errors::{KeyspacesMetadataError, MetadataError, PeersMetadataError};
use crate::network::Connection;
use crate::response::QueryResult;
use crate::routing::Token;

pub(crate) const LOCAL_QUERY: &str =
    "SELECT host_id, rpc_address, data_center, rack, tokens FROM system.local WHERE key='local'";
pub(crate) const PEERS_QUERY: &str =
    "SELECT host_id, rpc_address, data_center, rack, tokens FROM system.peers";
pub(crate) const KEYSPACES_QUERY: &str =
    "SELECT keyspace_name, replication FROM system_schema.keyspaces";

/// A node as described by `system.local` or `system.peers`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Peer {
    pub host_id: Uuid,
    pub address: SocketAddr,
    pub tokens: Vec<Token>,
    pub datacenter: Option<String>,
    pub rack: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
#[allow(clippy::enum_variant_names)]
pub enum Strategy {
    SimpleStrategy {
        replication_factor: usize,
    },
    NetworkTopologyStrategy {
        // Replication factors of datacenters with given names
        datacenter_repfactors: HashMap<String, usize>,
    },
    LocalStrategy, // replication_factor == 1
    Other {
        name: String,
        data: HashMap<String, String>,
    },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Keyspace {
    pub strategy: Strategy,
}

impl Keyspace {
    pub fn new(strategy: Strategy) -> Self {
        Self { strategy }
    }
}

/// One read of the system tables.
#[derive(Debug)]
pub(crate) struct Metadata {
    pub(crate) peers: Vec<Peer>,
    /// Keyspaces whose replication options could not be understood map to
    /// an error, so that the previous version can be kept.
    pub(crate) keyspaces: HashMap<String, Result<Keyspace, KeyspacesMetadataError>>,
}

impl Metadata {
    /// Metadata made of the contact points alone, with the ring split
    /// evenly between them. Used when the first read fails.
    pub(crate) fn new_dummy(contact_points: &[SocketAddr]) -> Self {
        let peers = contact_points
            .iter()
            .enumerate()
            .map(|(id, address)| {
                let token = ((id as u128) << 64) / contact_points.len() as u128;
                Peer {
                    host_id: Uuid::new_v4(),
                    address: *address,
                    tokens: vec![Token::new(token as i64)],
                    datacenter: None,
                    rack: None,
                }
            })
            .collect();

        Metadata {
            peers,
            keyspaces: HashMap::new(),
        }
    }
}

/// Reads nodes and keyspaces. `connect_port` is the port every node is
/// assumed to listen on; the system tables carry only addresses.
pub(crate) async fn query_metadata(
    conn: &Connection,
    connect_port: u16,
) -> Result<Metadata, MetadataError> {
    let (peers, keyspaces) = tokio::try_join!(
        query_peers(conn, connect_port),
        query_keyspaces(conn)
    )?;

    // There must be at least one peer
    if peers.is_empty() {
        return Err(MetadataError::Peers(PeersMetadataError::EmptyPeers));
    }

    Ok(Metadata { peers, keyspaces })
}

#[derive(Clone, Copy)]
enum NodeInfoSource {
    Local,
    Peer,
}

impl NodeInfoSource {
    fn describe(&self) -> &'static str {
        match self {
            Self::Local => "local node",
            Self::Peer => "peer",
        }
    }
}

async fn query_peers(conn: &Connection, connect_port: u16) -> Result<Vec<Peer>, MetadataError> {
    let (local, peers) = tokio::try_join!(
        conn.query_unpaged(LOCAL_QUERY),
        conn.query_unpaged(PEERS_QUERY)
    )?;

    // The local node is reached through the control connection's address,
    // which is known to work even when its rpc_address is misconfigured.
    let local_address = SocketAddr::new(conn.get_connect_address().ip(), connect_port);

    let mut result = Vec::new();
    for (source, rows) in [(NodeInfoSource::Local, local), (NodeInfoSource::Peer, peers)] {
        let columns = NodeInfoColumns::locate(&rows)?;
        for row in rows.rows().unwrap_or(&[]) {
            if let Some(peer) = columns.peer_from_row(source, row, local_address)? {
                result.push(peer);
            }
        }
    }
    Ok(result)
}

struct NodeInfoColumns {
    host_id: usize,
    rpc_address: usize,
    data_center: usize,
    rack: usize,
    tokens: usize,
}

impl NodeInfoColumns {
    fn locate(result: &QueryResult) -> Result<Self, PeersMetadataError> {
        if !result.is_rows() {
            return Err(PeersMetadataError::NotRows);
        }
        let index = |name: &'static str| {
            result
                .column_index(name)
                .ok_or(PeersMetadataError::BadColumn(name))
        };
        Ok(Self {
            host_id: index("host_id")?,
            rpc_address: index("rpc_address")?,
            data_center: index("data_center")?,
            rack: index("rack")?,
            tokens: index("tokens")?,
        })
    }

    fn peer_from_row(
        &self,
        source: NodeInfoSource,
        row: &Row,
        local_address: SocketAddr,
    ) -> Result<Option<Peer>, PeersMetadataError> {
        let cell = |index: usize| row.columns.get(index).and_then(Option::as_ref);
        let text = |index: usize| cell(index).and_then(CqlValue::as_text).cloned();

        let ip = cell(self.rpc_address)
            .and_then(CqlValue::as_inet)
            .ok_or(PeersMetadataError::BadColumn("rpc_address"))?;
        let datacenter = text(self.data_center);
        let rack = text(self.rack);

        let Some(host_id) = cell(self.host_id).and_then(CqlValue::as_uuid) else {
            warn!(
                "{} (ip: {}, dc: {:?}, rack: {:?}) has Host ID set to null; skipping node.",
                source.describe(),
                ip,
                datacenter,
                rack
            );
            return Ok(None);
        };

        let address = match source {
            NodeInfoSource::Local => local_address,
            NodeInfoSource::Peer => SocketAddr::new(ip, local_address.port()),
        };

        let tokens_str: Vec<String> = cell(self.tokens)
            .cloned()
            .and_then(CqlValue::into_vec)
            .unwrap_or_default()
            .into_iter()
            .filter_map(CqlValue::into_string)
            .collect();

        let tokens = match tokens_str
            .iter()
            .map(|s| Token::from_str(s))
            .collect::<Result<Vec<Token>, _>>()
        {
            Ok(parsed) => parsed,
            Err(e) => {
                trace!(
                    "Couldn't parse tokens as 64-bit integers: {}, proceeding with a dummy token",
                    e
                );
                vec![Token::new(rand::rng().random::<i64>())]
            }
        };

        Ok(Some(Peer {
            host_id,
            address,
            tokens,
            datacenter,
            rack,
        }))
    }
}

async fn query_keyspaces(
    conn: &Connection,
) -> Result<HashMap<String, Result<Keyspace, KeyspacesMetadataError>>, MetadataError> {
    let result = conn.query_unpaged(KEYSPACES_QUERY).await?;
    Ok(keyspaces_from_result(&result)?)
}

/// Reads the replication options of a single keyspace. `Ok(None)` if the
/// keyspace does not exist.
pub(crate) async fn query_keyspace(
    conn: &Connection,
    keyspace_name: &str,
) -> Result<Option<Keyspace>, MetadataError> {
    let mut statement = crate::statement::Statement::new(format!(
        "{} WHERE keyspace_name = '{}'",
        KEYSPACES_QUERY,
        keyspace_name.replace('\'', "''")
    ));
    statement.set_is_idempotent(true);
    let result = conn.query_unpaged(statement).await?;

    let mut keyspaces = keyspaces_from_result(&result)?;
    match keyspaces.remove(keyspace_name) {
        Some(keyspace) => Ok(Some(keyspace?)),
        None => Ok(None),
    }
}

fn keyspaces_from_result(
    result: &QueryResult,
) -> Result<HashMap<String, Result<Keyspace, KeyspacesMetadataError>>, KeyspacesMetadataError> {
    let index = |name: &'static str| {
        result
            .column_index(name)
            .ok_or(KeyspacesMetadataError::BadColumn(name))
    };
    let name_idx = index("keyspace_name")?;
    let replication_idx = index("replication")?;

    let mut keyspaces = HashMap::new();
    for row in result.rows().unwrap_or(&[]) {
        let cell = |index: usize| row.columns.get(index).and_then(Option::as_ref);

        let keyspace_name = cell(name_idx)
            .and_then(CqlValue::as_text)
            .cloned()
            .ok_or(KeyspacesMetadataError::BadColumn("keyspace_name"))?;

        let strategy_map: HashMap<String, String> = cell(replication_idx)
            .cloned()
            .and_then(CqlValue::into_pair_vec)
            .ok_or(KeyspacesMetadataError::BadColumn("replication"))?
            .into_iter()
            .filter_map(|(k, v)| Some((k.into_string()?, v.into_string()?)))
            .collect();

        let keyspace = strategy_from_string_map(&keyspace_name, strategy_map).map(Keyspace::new);
        keyspaces.insert(keyspace_name, keyspace);
    }

    Ok(keyspaces)
}

fn strategy_from_string_map(
    keyspace: &str,
    mut strategy_map: HashMap<String, String>,
) -> Result<Strategy, KeyspacesMetadataError> {
    let strategy_name: String = strategy_map.remove("class").ok_or_else(|| {
        KeyspacesMetadataError::MissingStrategyClass {
            keyspace: keyspace.to_owned(),
        }
    })?;

    let parse_rf = |value: String| {
        usize::from_str(&value).map_err(|error| KeyspacesMetadataError::BadReplicationFactor {
            keyspace: keyspace.to_owned(),
            value,
            error,
        })
    };

    let strategy: Strategy = match strategy_name.as_str() {
        "org.apache.cassandra.locator.SimpleStrategy" | "SimpleStrategy" => {
            let replication_factor = parse_rf(
                strategy_map
                    .remove("replication_factor")
                    .unwrap_or_default(),
            )?;
            Strategy::SimpleStrategy { replication_factor }
        }
        "org.apache.cassandra.locator.NetworkTopologyStrategy" | "NetworkTopologyStrategy" => {
            let mut datacenter_repfactors: HashMap<String, usize> =
                HashMap::with_capacity(strategy_map.len());

            for (key, value) in strategy_map.drain() {
                datacenter_repfactors.insert(key, parse_rf(value)?);
            }

            Strategy::NetworkTopologyStrategy {
                datacenter_repfactors,
            }
        }
        "org.apache.cassandra.locator.LocalStrategy" | "LocalStrategy" => Strategy::LocalStrategy,
        _ => Strategy::Other {
            name: strategy_name,
            data: strategy_map,
        },
    };

    Ok(strategy)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use assert_matches::assert_matches;

    use super::{strategy_from_string_map, Strategy};
    use crate::errors::KeyspacesMetadataError;

    fn map(entries: &[(&str, &str)]) -> HashMap<String, String> {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn known_strategies_are_parsed() {
        assert_eq!(
            strategy_from_string_map(
                "ks",
                map(&[
                    ("class", "org.apache.cassandra.locator.SimpleStrategy"),
                    ("replication_factor", "3"),
                ])
            )
            .unwrap(),
            Strategy::SimpleStrategy {
                replication_factor: 3
            }
        );

        assert_eq!(
            strategy_from_string_map(
                "ks",
                map(&[("class", "NetworkTopologyStrategy"), ("eu", "2"), ("us", "1")])
            )
            .unwrap(),
            Strategy::NetworkTopologyStrategy {
                datacenter_repfactors: [("eu".to_owned(), 2), ("us".to_owned(), 1)]
                    .into_iter()
                    .collect()
            }
        );

        assert_eq!(
            strategy_from_string_map("system", map(&[("class", "LocalStrategy")])).unwrap(),
            Strategy::LocalStrategy
        );

        assert_matches!(
            strategy_from_string_map("ks", map(&[("class", "EverywhereStrategy"), ("x", "y")])),
            Ok(Strategy::Other { name, data }) if name == "EverywhereStrategy" && data.len() == 1
        );
    }

    #[test]
    fn malformed_replication_is_an_error() {
        assert_matches!(
            strategy_from_string_map("ks", map(&[("replication_factor", "3")])),
            Err(KeyspacesMetadataError::MissingStrategyClass { keyspace }) if keyspace == "ks"
        );
        assert_matches!(
            strategy_from_string_map(
                "ks",
                map(&[("class", "SimpleStrategy"), ("replication_factor", "three")])
            ),
            Err(KeyspacesMetadataError::BadReplicationFactor { value, .. }) if value == "three"
        );
    }
}
