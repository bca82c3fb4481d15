//! `Session` is the main object used in the driver.\
//! It manages all connections to the cluster and allows to execute CQL requests.

use arc_swap::ArcSwapOption;
use corvid_cql::frame::Compression;
use corvid_cql::{Consistency, SerializedValues};
use futures::future::join_all;
use itertools::Itertools;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace_span, warn, Instrument};
use uuid::Uuid;

use super::execution::{run_request, RequestParams, RunRequestResult};
use crate::authentication::AuthenticatorProvider;
use crate::cluster::worker::{Cluster, ClusterConfig};
use crate::cluster::ClusterState;
use crate::errors::{
    BadQuery, ExecutionError, MetadataError, NewSessionError, RequestAttemptError,
    SchemaAgreementError, UseKeyspaceError,
};
use crate::network::{Connection, ConnectionConfig, PoolConfig, VerifiedKeyspaceName};
use crate::policies::host_listener::HostListener;
use crate::policies::load_balancing::{
    LoadBalancingPolicy, RoundRobinPolicy, RoutingInfo, TokenAwarePolicy,
};
use crate::policies::reconnection::{ExponentialReconnectionPolicy, ReconnectionPolicy};
use crate::policies::retry::{DefaultRetryPolicy, RetryPolicy};
use crate::response::{QueryResponse, QueryResult};
use crate::statement::{Batch, PreparedStatement, Statement, StatementConfig};

const DEFAULT_PORT: u16 = 9042;

/// Describes a database server known on Session startup.
#[derive(Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum KnownNode {
    /// A hostname, optionally with a port. Resolved when the session starts.
    Hostname(String),
    Address(SocketAddr),
}

/// Configuration options for [`Session`].
/// Can be created manually, but usually it's easier to use
/// [SessionBuilder](super::session_builder::SessionBuilder)
#[derive(Clone)]
#[non_exhaustive]
pub struct SessionConfig {
    /// List of database servers known on Session startup.
    /// Session will connect to these nodes to retrieve information about other nodes in the cluster.
    /// Each node can be represented as a hostname or an IP address.
    pub known_nodes: Vec<KnownNode>,

    /// Preferred compression algorithm to use on connections.
    /// If it's not supported by database server Session will fall back to no compression.
    pub compression: Option<Compression>,

    /// Whether to set the nodelay TCP flag.
    pub tcp_nodelay: bool,

    /// TCP keepalive interval, which means how often keepalive messages
    /// are sent **on TCP layer** when a connection is idle.
    /// If `None`, no TCP keepalive messages are sent.
    pub tcp_keepalive_interval: Option<Duration>,

    /// Consistency of statements that do not set their own.
    pub default_consistency: Consistency,

    /// Keyspace to be used on all connections.
    /// Each connection will send `"USE <keyspace_name>"` before sending any requests.
    /// This can be later changed with [`Session::use_keyspace`].
    pub used_keyspace: Option<String>,

    /// Whether the keyspace name is case-sensitive.
    pub keyspace_case_sensitive: bool,

    /// Custom authenticator provider to create an authenticator instance
    /// upon session creation.
    pub authenticator: Option<Arc<dyn AuthenticatorProvider>>,

    /// Timeout for establishing connections to a node.
    pub connect_timeout: Duration,

    /// Bound on a whole execution, retries included. Statements may
    /// override it. `None` means no bound.
    pub request_timeout: Option<Duration>,

    pub pool_config: PoolConfig,

    pub load_balancing: Arc<dyn LoadBalancingPolicy>,

    pub retry_policy: Arc<dyn RetryPolicy>,

    /// Backoff of reconnecting to nodes whose connections were lost.
    pub reconnection_policy: Arc<dyn ReconnectionPolicy>,

    /// Interval of sending keepalive requests.
    /// If `None`, keepalives are never sent, so `Self::keepalive_timeout` has no effect.
    pub keepalive_interval: Option<Duration>,

    /// Controls after what time of not receiving response to keepalives a connection is closed.
    /// If `None`, connections are never closed due to lack of response to a keepalive message.
    pub keepalive_timeout: Option<Duration>,

    /// Notified about nodes being added, removed, going up and down.
    pub host_listeners: Vec<Arc<dyn HostListener>>,

    /// How often to check schema versions while awaiting agreement.
    pub schema_agreement_interval: Duration,

    /// How long to wait for schema agreement before giving up.
    pub schema_agreement_timeout: Duration,

    /// Whether a statement that changed the schema waits for the schema to
    /// agree before returning.
    pub auto_await_schema_agreement: bool,

    /// Interval of periodic metadata refresh.
    pub cluster_metadata_refresh_interval: Duration,
}

impl SessionConfig {
    /// Creates a [`SessionConfig`] with default configuration
    /// # Default configuration
    /// * Compression: None
    /// * Load balancing policy: Token-aware Round-robin
    ///
    /// # Example
    /// ```
    /// # use corvid::client::session::SessionConfig;
    /// let config = SessionConfig::new();
    /// ```
    pub fn new() -> Self {
        SessionConfig {
            known_nodes: Vec::new(),
            compression: None,
            tcp_nodelay: true,
            tcp_keepalive_interval: None,
            default_consistency: Consistency::default(),
            used_keyspace: None,
            keyspace_case_sensitive: false,
            authenticator: None,
            connect_timeout: Duration::from_secs(5),
            request_timeout: Some(Duration::from_secs(30)),
            pool_config: PoolConfig::default(),
            load_balancing: Arc::new(TokenAwarePolicy::new(RoundRobinPolicy::new())),
            retry_policy: Arc::new(DefaultRetryPolicy::new()),
            reconnection_policy: Arc::new(ExponentialReconnectionPolicy::default()),
            keepalive_interval: Some(Duration::from_secs(30)),
            keepalive_timeout: Some(Duration::from_secs(30)),
            host_listeners: Vec::new(),
            schema_agreement_interval: Duration::from_millis(200),
            schema_agreement_timeout: Duration::from_secs(60),
            auto_await_schema_agreement: true,
            cluster_metadata_refresh_interval: Duration::from_secs(60),
        }
    }

    /// Adds a known database server with a hostname.
    /// If the port is not explicitly specified, 9042 is used as default
    pub fn add_known_node(&mut self, hostname: impl AsRef<str>) {
        self.known_nodes
            .push(KnownNode::Hostname(hostname.as_ref().to_string()));
    }

    /// Adds a known database server with an IP address
    pub fn add_known_node_addr(&mut self, node_addr: SocketAddr) {
        self.known_nodes.push(KnownNode::Address(node_addr));
    }

    /// Adds a list of known database server with hostnames.
    pub fn add_known_nodes(&mut self, hostnames: impl IntoIterator<Item = impl AsRef<str>>) {
        for hostname in hostnames {
            self.add_known_node(hostname);
        }
    }

    fn connection_config(&self) -> ConnectionConfig {
        ConnectionConfig {
            compression: self.compression,
            tcp_nodelay: self.tcp_nodelay,
            tcp_keepalive_interval: self.tcp_keepalive_interval,
            connect_timeout: self.connect_timeout,
            default_consistency: self.default_consistency,
            authenticator: self.authenticator.clone(),
            keepalive_interval: self.keepalive_interval,
            keepalive_timeout: self.keepalive_timeout,
            ..Default::default()
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SessionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionConfig")
            .field("known_nodes", &self.known_nodes)
            .field("compression", &self.compression)
            .field("default_consistency", &self.default_consistency)
            .field("used_keyspace", &self.used_keyspace)
            .field("request_timeout", &self.request_timeout)
            .field("pool_config", &self.pool_config)
            .field("load_balancing", &self.load_balancing)
            .field("retry_policy", &self.retry_policy)
            .field("reconnection_policy", &self.reconnection_policy)
            .finish_non_exhaustive()
    }
}

/// `Session` manages connections to the cluster and allows to execute CQL requests.
pub struct Session {
    cluster: Cluster,
    load_balancing: Arc<dyn LoadBalancingPolicy>,
    retry_policy: Arc<dyn RetryPolicy>,
    default_consistency: Consistency,
    request_timeout: Option<Duration>,
    schema_agreement_interval: Duration,
    schema_agreement_timeout: Duration,
    auto_await_schema_agreement: bool,
    keyspace_name: ArcSwapOption<String>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("cluster", &self.cluster)
            .field("load_balancing", &self.load_balancing)
            .field("retry_policy", &self.retry_policy)
            .field("default_consistency", &self.default_consistency)
            .field("request_timeout", &self.request_timeout)
            .field("keyspace_name", &self.keyspace_name)
            .finish_non_exhaustive()
    }
}

/// Resolves a hostname, with or without a port.
async fn resolve_hostname(hostname: &str) -> Option<SocketAddr> {
    let addrs: Vec<SocketAddr> = match tokio::net::lookup_host(hostname).await {
        Ok(addrs) => addrs.collect(),
        // Most likely the port is missing.
        Err(_) => tokio::net::lookup_host((hostname, DEFAULT_PORT))
            .await
            .ok()?
            .collect(),
    };
    // Prefer IPv4 addresses.
    addrs
        .iter()
        .find(|addr| addr.is_ipv4())
        .or_else(|| addrs.first())
        .copied()
}

/// Turns known nodes into contact points. Fails only if no node could be
/// resolved at all.
async fn resolve_contact_points(
    known_nodes: &[KnownNode],
) -> Result<Vec<SocketAddr>, NewSessionError> {
    if known_nodes.is_empty() {
        return Err(NewSessionError::EmptyKnownNodesList);
    }

    let mut contact_points = Vec::with_capacity(known_nodes.len());
    let mut unresolved = Vec::new();
    for node in known_nodes {
        match node {
            KnownNode::Address(address) => contact_points.push(*address),
            KnownNode::Hostname(hostname) => match resolve_hostname(hostname).await {
                Some(address) => contact_points.push(address),
                None => {
                    warn!(hostname = %hostname, "Failed to resolve known node");
                    unresolved.push(hostname.clone());
                }
            },
        }
    }

    if contact_points.is_empty() {
        return Err(NewSessionError::FailedToResolveAnyHostname(unresolved));
    }
    Ok(contact_points.into_iter().unique().collect())
}

impl Session {
    /// Establishes a CQL session with the database
    ///
    /// Usually it's easier to use [SessionBuilder](super::session_builder::SessionBuilder)
    /// instead of calling `Session::connect` directly, because it's more convenient.
    pub async fn connect(config: SessionConfig) -> Result<Session, NewSessionError> {
        let contact_points = resolve_contact_points(&config.known_nodes).await?;
        debug!(contact_points = ?contact_points, "Starting session");

        let keyspace = config
            .used_keyspace
            .clone()
            .map(|name| VerifiedKeyspaceName::new(name, config.keyspace_case_sensitive))
            .transpose()
            .map_err(UseKeyspaceError::from)?;

        let cluster = Cluster::new(ClusterConfig {
            contact_points,
            connection_config: config.connection_config(),
            pool_config: config.pool_config,
            load_balancing: config.load_balancing.clone(),
            reconnection_policy: config.reconnection_policy.clone(),
            control_reconnection_policy: Arc::new(ExponentialReconnectionPolicy::default()),
            host_listeners: config.host_listeners.clone(),
            metadata_refresh_interval: config.cluster_metadata_refresh_interval,
            keyspace: keyspace.clone(),
        })
        .await?;

        Ok(Session {
            cluster,
            load_balancing: config.load_balancing,
            retry_policy: config.retry_policy,
            default_consistency: config.default_consistency,
            request_timeout: config.request_timeout,
            schema_agreement_interval: config.schema_agreement_interval,
            schema_agreement_timeout: config.schema_agreement_timeout,
            auto_await_schema_agreement: config.auto_await_schema_agreement,
            keyspace_name: ArcSwapOption::new(
                keyspace.map(|name| Arc::new(name.as_str().to_owned())),
            ),
        })
    }

    /// Executes an unprepared statement, with `values` bound to its markers.
    ///
    /// A `USE` statement switches the keyspace of every connection, and a
    /// schema change waits for schema agreement if the session is
    /// configured so.
    pub async fn query(
        &self,
        statement: impl Into<Statement>,
        values: &SerializedValues,
    ) -> Result<QueryResult, ExecutionError> {
        let statement: Statement = statement.into();
        let routing_info = RoutingInfo {
            consistency: self.consistency_of(&statement.config),
            serial_consistency: statement.config.serial_consistency,
            token: statement.get_routing_token(),
            keyspace: statement.get_routing_keyspace(),
        };

        let statement_ref = &statement;
        let serial = statement.config.serial_consistency;
        let (response, coordinator) = self
            .execute_with_plan(
                &statement.config,
                &routing_info,
                move |connection: Arc<Connection>, consistency| async move {
                    connection
                        .query_raw_with_consistency(statement_ref, values, consistency, serial, None)
                        .await?
                        .into_non_error()
                },
            )
            .instrument(trace_span!("Request", kind = "query"))
            .await?;

        self.finish(response, coordinator).await
    }

    /// Prepares a statement on every up node.
    ///
    /// Succeeds if any node prepared it. Nodes that failed will prepare it
    /// again on first execution.
    pub async fn prepare(
        &self,
        statement: impl Into<Statement>,
    ) -> Result<PreparedStatement, ExecutionError> {
        let statement: Statement = statement.into();
        let cluster_state = self.get_cluster_state();

        let mut pool_error = None;
        let connections: Vec<Arc<Connection>> = cluster_state
            .get_nodes_info()
            .iter()
            .filter(|node| node.is_up() && node.is_enabled())
            .filter_map(|node| match node.get_working_connections() {
                Ok(connections) => connections.into_iter().next(),
                Err(e) => {
                    pool_error.get_or_insert(e);
                    None
                }
            })
            .collect();
        if connections.is_empty() {
            return Err(pool_error.map_or(ExecutionError::EmptyPlan, Into::into));
        }

        let results = join_all(
            connections
                .iter()
                .map(|connection| connection.prepare(&statement)),
        )
        .await;

        let mut results = results.into_iter();
        let first = results
            .by_ref()
            .find_or_first(|res| res.is_ok())
            .ok_or(ExecutionError::EmptyPlan)?;
        let prepared = first?;

        for other in results.flatten() {
            if other.get_id() != prepared.get_id() {
                return Err(ExecutionError::ProtocolError(format!(
                    "Nodes returned different ids when preparing \"{}\": {:?} and {:?}",
                    prepared.get_statement(),
                    prepared.get_id(),
                    other.get_id()
                )));
            }
        }

        Ok(prepared)
    }

    /// Executes a prepared statement. Routes it to a replica of the
    /// partition the values address, when the load balancing policy is
    /// token aware.
    pub async fn execute(
        &self,
        prepared: &PreparedStatement,
        values: &SerializedValues,
    ) -> Result<QueryResult, ExecutionError> {
        let expected = prepared.get_prepared_metadata().col_count;
        let got = values.element_count() as usize;
        if expected != got {
            return Err(BadQuery::ValuesCountMismatch { expected, got }.into());
        }

        let token = prepared.compute_token(values).map_err(BadQuery::from)?;
        let routing_info = RoutingInfo {
            consistency: self.consistency_of(&prepared.config),
            serial_consistency: prepared.config.serial_consistency,
            token,
            keyspace: prepared.get_keyspace_name(),
        };

        let serial = prepared.config.serial_consistency;
        let (response, coordinator) = self
            .execute_with_plan(
                &prepared.config,
                &routing_info,
                move |connection: Arc<Connection>, consistency| async move {
                    connection
                        .execute_raw_with_consistency(prepared, values, consistency, serial, None)
                        .await?
                        .into_non_error()
                },
            )
            .instrument(trace_span!("Request", kind = "execute"))
            .await?;

        self.finish(response, coordinator).await
    }

    /// Executes a batch. `values` holds one list per statement.
    pub async fn batch(
        &self,
        batch: &Batch,
        values: &[SerializedValues],
    ) -> Result<QueryResult, ExecutionError> {
        let statements = batch.statements.len();
        if statements > u16::MAX as usize {
            return Err(BadQuery::TooManyQueriesInBatchStatement(statements).into());
        }
        if values.len() != statements {
            return Err(BadQuery::BatchValuesCountMismatch {
                statements,
                values: values.len(),
            }
            .into());
        }

        // Routed like its first prepared statement.
        let (token, keyspace) = match batch.first_prepared() {
            Some((index, prepared)) => (
                prepared
                    .compute_token(&values[index])
                    .map_err(BadQuery::from)?,
                prepared.get_keyspace_name(),
            ),
            None => (None, None),
        };
        let routing_info = RoutingInfo {
            consistency: self.consistency_of(&batch.config),
            serial_consistency: batch.config.serial_consistency,
            token,
            keyspace,
        };

        let serial = batch.config.serial_consistency;
        let (response, coordinator) = self
            .execute_with_plan(
                &batch.config,
                &routing_info,
                move |connection: Arc<Connection>, consistency| async move {
                    connection
                        .batch_with_consistency(batch, values, consistency, serial)
                        .await
                },
            )
            .instrument(trace_span!("Request", kind = "batch", statements))
            .await?;

        self.finish(response, coordinator).await
    }

    /// Sends `USE <keyspace_name>` on every connection, and makes new
    /// connections do the same.
    pub async fn use_keyspace(
        &self,
        keyspace_name: impl Into<String>,
        case_sensitive: bool,
    ) -> Result<(), UseKeyspaceError> {
        let keyspace_name = keyspace_name.into();
        let verified = VerifiedKeyspaceName::new(keyspace_name.clone(), case_sensitive)?;
        self.cluster.use_keyspace(verified).await?;
        self.keyspace_name.store(Some(Arc::new(keyspace_name)));
        Ok(())
    }

    /// Keyspace the session's connections currently use, if any.
    pub fn get_keyspace(&self) -> Option<Arc<String>> {
        self.keyspace_name.load_full()
    }

    /// Waits until every up node reports the same schema version.
    ///
    /// Checks every `schema_agreement_interval`. Returns `false` if the
    /// versions still differ after `schema_agreement_timeout`.
    pub async fn await_schema_agreement(&self) -> Result<bool, ExecutionError> {
        let agreement = async {
            loop {
                if self.check_schema_agreement().await?.is_some() {
                    return Ok::<_, SchemaAgreementError>(());
                }
                tokio::time::sleep(self.schema_agreement_interval).await;
            }
        };

        match tokio::time::timeout(self.schema_agreement_timeout, agreement).await {
            Ok(result) => {
                result?;
                Ok(true)
            }
            Err(_) => {
                warn!(timeout = ?self.schema_agreement_timeout, "Schema agreement not reached");
                Ok(false)
            }
        }
    }

    /// Checks if all up nodes have the same schema version.
    ///
    /// If so, returns that agreed upon version. Nodes whose connection
    /// broke during the check are left out.
    pub async fn check_schema_agreement(&self) -> Result<Option<Uuid>, SchemaAgreementError> {
        let connections = self.get_cluster_state().working_connections_to_up_nodes()?;

        let results =
            join_all(connections.iter().map(|connection| connection.fetch_schema_version())).await;

        let mut first_error = None;
        let versions: Vec<Uuid> = results
            .into_iter()
            .filter_map(|result| match result {
                Ok(version) => Some(version),
                Err(e) => {
                    first_error.get_or_insert(e);
                    None
                }
            })
            .collect();

        let Some(local_version) = versions.first().copied() else {
            return Err(first_error.unwrap_or(SchemaAgreementError::NoUpNodes));
        };
        let in_agreement = versions.iter().all(|v| *v == local_version);
        debug!(versions = ?versions, in_agreement, "Checked schema versions");
        Ok(in_agreement.then_some(local_version))
    }

    /// Manually trigger a metadata refresh\
    /// The driver will fetch current nodes in the cluster and update its metadata
    ///
    /// Normally this is not needed,
    /// the driver should automatically detect all metadata changes in the cluster
    pub async fn refresh_metadata(&self) -> Result<(), MetadataError> {
        self.cluster.refresh_metadata().await
    }

    /// Access cluster state visible by the driver.
    ///
    /// Returns a snapshot; it is not updated after later changes.
    pub fn get_cluster_state(&self) -> Arc<ClusterState> {
        self.cluster.get_state()
    }

    fn consistency_of(&self, config: &StatementConfig) -> Consistency {
        config.determine_consistency(self.default_consistency)
    }

    /// Runs `attempt` over the load balancing plan for `routing_info`.
    async fn execute_with_plan<'a, AttemptFut>(
        &'a self,
        config: &'a StatementConfig,
        routing_info: &'a RoutingInfo<'a>,
        attempt: impl Fn(Arc<Connection>, Consistency) -> AttemptFut,
    ) -> Result<(RunRequestResult<QueryResponse>, SocketAddr), ExecutionError>
    where
        AttemptFut: Future<Output = Result<QueryResponse, RequestAttemptError>>,
    {
        let cluster_state = self.get_cluster_state();
        let plan = self.load_balancing.plan(routing_info, &cluster_state);
        let mut retry_session = config
            .retry_policy
            .as_ref()
            .unwrap_or(&self.retry_policy)
            .new_session();

        run_request(
            plan,
            |node| node.borrow_connection(),
            attempt,
            retry_session.as_mut(),
            RequestParams {
                consistency: routing_info.consistency,
                is_idempotent: config.is_idempotent,
            },
            config.request_timeout.or(self.request_timeout),
        )
        .await
    }

    /// Reacts to `USE` and schema changes, then converts the response.
    async fn finish(
        &self,
        response: RunRequestResult<QueryResponse>,
        coordinator: SocketAddr,
    ) -> Result<QueryResult, ExecutionError> {
        let response = match response {
            RunRequestResult::Completed(response) => response,
            RunRequestResult::IgnoredError => {
                return Ok(QueryResult::new(coordinator, None, None, Vec::new()));
            }
        };

        if let Some(set_keyspace) = response.as_set_keyspace() {
            debug!(keyspace = %set_keyspace.keyspace_name, "Switching keyspace after USE");
            // The server reports the name as stored, so it is quoted as is.
            self.use_keyspace(set_keyspace.keyspace_name.clone(), true)
                .await?;
        }

        if self.auto_await_schema_agreement && response.as_schema_change().is_some() {
            if !self.await_schema_agreement().await? {
                warn!("Schema change applied, but nodes have not agreed on the schema yet");
            }
        }

        response
            .into_query_result(coordinator)
            .map_err(ExecutionError::from)
    }
}
