use crate::errors::{
    BrokenConnectionErrorKind, ConnectionError, ConnectionPoolError, MetadataError,
    NewSessionError, PeersMetadataError, RequestAttemptError, UseKeyspaceError,
};
use crate::network::connection_pool::use_keyspace_result;
use crate::network::{ConnectionConfig, ConnectivityChangeEvent, PoolConfig, VerifiedKeyspaceName};
use crate::policies::host_listener::HostListener;
use crate::policies::load_balancing::{LoadBalancingPolicy, RoutingInfo};
use crate::policies::reconnection::{ReconnectionPolicy, ReconnectionSchedule};

use arc_swap::ArcSwap;
use corvid_cql::frame::response::event::{
    Event, SchemaChangeEvent, SchemaChangeType, StatusChangeEvent,
};
use futures::future::join_all;
use futures::{future::RemoteHandle, FutureExt};
use itertools::Itertools;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn, Instrument};

use super::control_connection::ControlConnection;
use super::metadata::Metadata;
use super::node::NodeFactory;
use super::registry::HostRegistry;
use super::state::ClusterState;

/// Everything the cluster needs to discover nodes and connect to them.
pub(crate) struct ClusterConfig {
    pub(crate) contact_points: Vec<SocketAddr>,
    pub(crate) connection_config: ConnectionConfig,
    pub(crate) pool_config: PoolConfig,
    pub(crate) load_balancing: Arc<dyn LoadBalancingPolicy>,
    /// Backoff of node pools.
    pub(crate) reconnection_policy: Arc<dyn ReconnectionPolicy>,
    /// Backoff of the control connection.
    pub(crate) control_reconnection_policy: Arc<dyn ReconnectionPolicy>,
    pub(crate) host_listeners: Vec<Arc<dyn HostListener>>,
    pub(crate) metadata_refresh_interval: Duration,
    pub(crate) keyspace: Option<VerifiedKeyspaceName>,
}

/// Cluster manages up to date information and connections to database nodes.
/// All state can be accessed by cloning Arc<ClusterState> in the `state` field
pub(crate) struct Cluster {
    // `ArcSwap<ClusterState>` is wrapped in `Arc` to support sharing cluster state
    // between `Cluster` and `ClusterWorker`
    state: Arc<ArcSwap<ClusterState>>,
    registry: Arc<HostRegistry>,

    refresh_channel: mpsc::Sender<RefreshRequest>,
    use_keyspace_channel: mpsc::Sender<UseKeyspaceRequest>,

    _worker_handle: RemoteHandle<()>,
}

// Works in the background to keep the cluster updated
struct ClusterWorker {
    // Cluster state to keep updated:
    state: Arc<ArcSwap<ClusterState>>,
    registry: Arc<HostRegistry>,

    node_factory: NodeFactory,
    load_balancing: Arc<dyn LoadBalancingPolicy>,
    contact_points: Vec<SocketAddr>,

    control: Option<ControlConnection>,
    // Carries the sender of `server_events_channel`.
    control_config: ConnectionConfig,
    control_reconnection_policy: Arc<dyn ReconnectionPolicy>,
    control_reconnection: Box<dyn ReconnectionSchedule>,
    next_control_attempt: Instant,

    // To listen for refresh requests
    refresh_channel: mpsc::Receiver<RefreshRequest>,

    // Channel used to receive use keyspace requests
    use_keyspace_channel: mpsc::Receiver<UseKeyspaceRequest>,

    // Channel used to receive server events
    server_events_channel: mpsc::Receiver<Event>,

    // Channel used to receive signals that node is no longer reachable or became reachable.
    connectivity_events: mpsc::UnboundedReceiver<ConnectivityChangeEvent>,

    // Keyspace send in "USE <keyspace name>" when opening each connection
    used_keyspace: Option<VerifiedKeyspaceName>,

    metadata_refresh_interval: Duration,
}

#[derive(Debug)]
struct RefreshRequest {
    response_chan: oneshot::Sender<Result<(), MetadataError>>,
}

#[derive(Debug)]
struct UseKeyspaceRequest {
    keyspace_name: VerifiedKeyspaceName,
    response_chan: oneshot::Sender<Result<(), UseKeyspaceError>>,
}

/// What a caller sees if the worker is gone. It lives as long as the
/// [`Cluster`], so this only happens while the runtime shuts down.
fn worker_gone() -> ConnectionPoolError {
    ConnectionPoolError::Broken {
        last_connection_error: ConnectionError::BrokenConnection(
            BrokenConnectionErrorKind::ChannelError.into(),
        ),
    }
}

impl Cluster {
    pub(crate) async fn new(config: ClusterConfig) -> Result<Cluster, NewSessionError> {
        if config.contact_points.is_empty() {
            return Err(NewSessionError::EmptyKnownNodesList);
        }

        let (refresh_sender, refresh_receiver) = mpsc::channel(32);
        let (use_keyspace_sender, use_keyspace_receiver) = mpsc::channel(32);
        let (server_events_sender, server_events_receiver) = mpsc::channel(32);
        // Unbounded: a pool refiller must never block on reporting, and a
        // network split may produce many events at once.
        let (connectivity_events_sender, connectivity_events_receiver) =
            mpsc::unbounded_channel();

        let mut control_config = config.connection_config.clone();
        control_config.event_sender = Some(server_events_sender);

        let mut last_error = None;
        let mut control = None;
        for address in &config.contact_points {
            match ControlConnection::open(*address, &control_config).await {
                Ok(connection) => {
                    control = Some(connection);
                    break;
                }
                Err(err) => {
                    warn!(node = %address, error = %err, "Could not open control connection");
                    last_error = Some(err);
                }
            }
        }
        let Some(control) = control else {
            return Err(last_error.map_or(
                NewSessionError::EmptyKnownNodesList,
                NewSessionError::ControlConnectionError,
            ));
        };
        info!(node = %control.get_connect_address(), "Control connection established");

        let metadata = match control.query_metadata().await {
            Ok(metadata) => metadata,
            Err(err) => {
                warn!(
                    error = %err,
                    "Initial metadata read failed, proceeding with metadata \
                    consisting only of the initial peer list and dummy tokens. \
                    This might result in suboptimal performance and schema \
                    information not being available."
                );
                Metadata::new_dummy(&config.contact_points)
            }
        };

        let state = Arc::new(ArcSwap::from_pointee(ClusterState::new(
            Vec::new(),
            HashMap::new(),
        )));
        let registry = Arc::new(HostRegistry::new(config.host_listeners));

        let mut worker = ClusterWorker {
            state: state.clone(),
            registry: registry.clone(),
            node_factory: NodeFactory {
                pool_config: config.pool_config,
                connection_config: config.connection_config,
                reconnection_policy: config.reconnection_policy,
                connectivity_events: connectivity_events_sender,
            },
            load_balancing: config.load_balancing,
            contact_points: config.contact_points,
            control: Some(control),
            control_config,
            control_reconnection: config.control_reconnection_policy.new_schedule(),
            control_reconnection_policy: config.control_reconnection_policy,
            next_control_attempt: Instant::now(),
            refresh_channel: refresh_receiver,
            use_keyspace_channel: use_keyspace_receiver,
            server_events_channel: server_events_receiver,
            connectivity_events: connectivity_events_receiver,
            used_keyspace: config.keyspace,
            metadata_refresh_interval: config.metadata_refresh_interval,
        };

        worker.apply_metadata(metadata);
        state.load().wait_until_all_pools_are_initialized().await;

        let (fut, worker_handle) = worker
            .work()
            .instrument(tracing::debug_span!("cluster_worker"))
            .remote_handle();
        tokio::spawn(fut);

        Ok(Cluster {
            state,
            registry,
            refresh_channel: refresh_sender,
            use_keyspace_channel: use_keyspace_sender,
            _worker_handle: worker_handle,
        })
    }

    pub(crate) fn get_state(&self) -> Arc<ClusterState> {
        self.state.load_full()
    }

    pub(crate) fn registry(&self) -> &HostRegistry {
        &self.registry
    }

    pub(crate) async fn refresh_metadata(&self) -> Result<(), MetadataError> {
        let (response_sender, response_receiver) = oneshot::channel();

        self.refresh_channel
            .send(RefreshRequest {
                response_chan: response_sender,
            })
            .await
            .map_err(|_| worker_gone())?;

        response_receiver.await.map_err(|_| worker_gone())?
    }

    pub(crate) async fn use_keyspace(
        &self,
        keyspace_name: VerifiedKeyspaceName,
    ) -> Result<(), UseKeyspaceError> {
        let (response_sender, response_receiver) = oneshot::channel();
        let gone = || UseKeyspaceError::RequestError(RequestAttemptError::from(worker_gone()));

        self.use_keyspace_channel
            .send(UseKeyspaceRequest {
                keyspace_name,
                response_chan: response_sender,
            })
            .await
            .map_err(|_| gone())?;

        response_receiver.await.map_err(|_| gone())?
    }
}

impl std::fmt::Debug for Cluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cluster")
            .field("state", &self.state.load())
            .finish_non_exhaustive()
    }
}

/// Resolves when the control connection breaks; never, if there is none.
async fn control_broken(control: &mut Option<ControlConnection>) -> ConnectionError {
    match control {
        Some(control) => control.broken().await,
        None => std::future::pending().await,
    }
}

impl ClusterWorker {
    async fn work(mut self) {
        let mut last_refresh_time = Instant::now();

        loop {
            let mut cur_request: Option<RefreshRequest> = None;

            // Without a control connection, the next refresh is the next
            // reconnection attempt.
            let sleep_until = match self.control {
                Some(_) => last_refresh_time + self.metadata_refresh_interval,
                None => self.next_control_attempt,
            };
            let sleep_future = tokio::time::sleep_until(sleep_until);
            tokio::pin!(sleep_future);

            tokio::select! {
                _ = &mut sleep_future => {
                    // Time to do periodic refresh.
                }

                maybe_refresh_request = self.refresh_channel.recv() => {
                    match maybe_refresh_request {
                        Some(request) => cur_request = Some(request),
                        None => return, // If refresh_channel was closed then cluster was dropped, we can stop working
                    }
                }

                maybe_event = self.server_events_channel.recv() => {
                    let Some(event) = maybe_event else {
                        return;
                    };
                    if !self.handle_server_event(event).await {
                        continue;
                    }
                }

                maybe_connectivity_event = self.connectivity_events.recv() => {
                    let Some(event) = maybe_connectivity_event else {
                        return;
                    };
                    self.handle_connectivity_event(event);
                    continue;
                }

                maybe_use_keyspace_request = self.use_keyspace_channel.recv() => {
                    let Some(request) = maybe_use_keyspace_request else {
                        return;
                    };
                    self.used_keyspace = Some(request.keyspace_name.clone());
                    let state = self.state.load_full();
                    tokio::spawn(Self::handle_use_keyspace_request(state, request));
                    continue;
                }

                err = control_broken(&mut self.control) => {
                    warn!(error = %err, "Control connection broke, reconnecting");
                    self.control = None;
                    // The first attempt is the refresh below.
                }
            }

            debug!("Requesting metadata refresh");
            last_refresh_time = Instant::now();
            let refresh_res = self.perform_refresh().await;

            // Send refresh result if there was a request
            if let Some(request) = cur_request {
                // We can ignore sending error - if no one waits for the response we can drop it
                let _ = request.response_chan.send(refresh_res);
            }
        }
    }

    /// Returns whether a full refresh should follow.
    async fn handle_server_event(&mut self, event: Event) -> bool {
        debug!(event = ?event, "Received server event");
        match event {
            // New nodes are found, and removed ones dropped, by the refresh.
            Event::TopologyChange(_) => true,
            Event::StatusChange(StatusChangeEvent::Up(address)) => {
                let address = self.node_address(address);
                self.registry.bring_up_if_down(&address);
                true
            }
            Event::StatusChange(StatusChangeEvent::Down(address)) => {
                let address = self.node_address(address);
                self.registry.set_down(&address);
                false
            }
            Event::SchemaChange(change) => {
                self.handle_schema_change(change).await;
                false
            }
        }
    }

    /// Events carry the node's address as the server sees it; the port may
    /// differ from the one the driver connects to.
    fn node_address(&self, address: SocketAddr) -> SocketAddr {
        if self.registry.get(&address).is_some() {
            return address;
        }
        self.registry
            .nodes()
            .into_iter()
            .map(|node| node.address)
            .filter(|known| known.ip() == address.ip())
            .exactly_one()
            .unwrap_or(address)
    }

    async fn handle_schema_change(&mut self, change: SchemaChangeEvent) {
        // Replication is a keyspace option; changes below it leave the
        // token map as it is.
        let SchemaChangeEvent::KeyspaceChange {
            change_type,
            keyspace_name,
        } = change
        else {
            trace!(keyspace = change.keyspace_name(), "Schema change below keyspace level");
            return;
        };

        let state = self.state.load_full();
        let mut keyspaces = state.keyspaces.clone();
        match change_type {
            SchemaChangeType::Dropped => {
                if keyspaces.remove(&keyspace_name).is_none() {
                    return;
                }
                debug!(keyspace = %keyspace_name, "Keyspace dropped");
            }
            _ => {
                let Some(control) = &self.control else {
                    debug!(keyspace = %keyspace_name, "No control connection, keyspace left for the next refresh");
                    return;
                };
                match control.query_keyspace(&keyspace_name).await {
                    Ok(Some(keyspace)) => {
                        debug!(keyspace = %keyspace_name, strategy = ?keyspace.strategy, "Keyspace updated");
                        keyspaces.insert(keyspace_name, keyspace);
                    }
                    Ok(None) => {
                        keyspaces.remove(&keyspace_name);
                    }
                    Err(err) => {
                        warn!(keyspace = %keyspace_name, error = %err, "Could not read keyspace after schema change");
                        return;
                    }
                }
            }
        }

        self.state.store(Arc::new(state.with_keyspaces(keyspaces)));
    }

    fn handle_connectivity_event(&self, event: ConnectivityChangeEvent) {
        trace!(event = ?event, "Received connectivity event");
        match event {
            ConnectivityChangeEvent::Lost { address } => {
                self.registry.set_down(&address);
            }
            ConnectivityChangeEvent::Established { address } => {
                self.registry.bring_up_if_down(&address);
            }
        }
    }

    async fn handle_use_keyspace_request(state: Arc<ClusterState>, request: UseKeyspaceRequest) {
        let use_keyspace_futures = state
            .get_nodes_info()
            .iter()
            .map(|node| node.use_keyspace(request.keyspace_name.clone()));
        let results = join_all(use_keyspace_futures).await;

        // Don't care if nobody wants request result
        let _ = request
            .response_chan
            .send(use_keyspace_result(results.into_iter()));
    }

    async fn perform_refresh(&mut self) -> Result<(), MetadataError> {
        let metadata = self.read_metadata().await?;
        self.apply_metadata(metadata);
        self.state
            .load_full()
            .wait_until_all_pools_are_initialized()
            .await;
        Ok(())
    }

    /// Fetches metadata over the control connection, moving it to another
    /// node if the current one fails.
    async fn read_metadata(&mut self) -> Result<Metadata, MetadataError> {
        let mut last_error = None;
        if let Some(control) = &self.control {
            match control.query_metadata().await {
                Ok(metadata) => return Ok(metadata),
                Err(err) => {
                    warn!(
                        control_connection_address = %control.get_connect_address(),
                        error = %err,
                        "Failed to fetch metadata using current control connection"
                    );
                    last_error = Some(err);
                }
            }
        }

        let failed = self.control.take().map(|control| control.get_connect_address());
        for address in self.control_candidates(failed) {
            debug!(node = %address, "Retrying to establish the control connection");
            let control = match ControlConnection::open(address, &self.control_config).await {
                Ok(control) => control,
                Err(err) => {
                    debug!(node = %address, error = %err, "Could not open control connection");
                    last_error = Some(MetadataError::ConnectionPoolError(
                        ConnectionPoolError::Broken {
                            last_connection_error: err,
                        },
                    ));
                    continue;
                }
            };
            match control.query_metadata().await {
                Ok(metadata) => {
                    info!(node = %address, "Control connection established");
                    self.control = Some(control);
                    self.control_reconnection = self.control_reconnection_policy.new_schedule();
                    return Ok(metadata);
                }
                Err(err) => {
                    warn!(node = %address, error = %err, "Could not fetch metadata");
                    last_error = Some(err);
                }
            }
        }

        let delay = self.control_reconnection.next_delay();
        self.next_control_attempt = Instant::now() + delay;
        error!(retry_in = ?delay, "Could not fetch metadata from any node");
        Err(last_error.unwrap_or(MetadataError::Peers(PeersMetadataError::EmptyPeers)))
    }

    /// Nodes to try for a new control connection: the load balancing plan,
    /// then the contact points. The node that just failed is left out.
    fn control_candidates(&self, failed: Option<SocketAddr>) -> Vec<SocketAddr> {
        let state = self.state.load_full();
        let routing_info = RoutingInfo::default();
        self.load_balancing
            .plan(&routing_info, &state)
            .map(|node| node.address)
            .chain(self.contact_points.iter().copied())
            .filter(|address| Some(*address) != failed)
            .unique()
            .collect()
    }

    /// Brings the registry in line with `metadata` and publishes a new
    /// cluster state.
    fn apply_metadata(&mut self, metadata: Metadata) {
        let Metadata { peers, keyspaces } = metadata;

        let factory = &self.node_factory;
        let load_balancing = &*self.load_balancing;
        let keyspace = &self.used_keyspace;
        self.registry
            .sync_peers(peers, |peer| factory.create(peer, load_balancing, keyspace.clone()));

        let old_state = self.state.load_full();
        let keyspaces = keyspaces
            .into_iter()
            .filter_map(|(name, keyspace)| match keyspace {
                Ok(keyspace) => Some((name, keyspace)),
                Err(err) => {
                    warn!(keyspace = %name, error = %err, "Bad keyspace metadata, keeping the previous one");
                    let previous = old_state.keyspaces.get(&name).cloned();
                    previous.map(|keyspace| (name, keyspace))
                }
            })
            .collect();

        let new_state = ClusterState::new(self.registry.nodes(), keyspaces);
        trace!(state = ?new_state, "New cluster state");
        self.state.store(Arc::new(new_state));
    }
}
