use super::connection::{
    open_connection, Connection, ConnectionConfig, ErrorReceiver, VerifiedKeyspaceName,
};

use crate::cluster::node::ReconnectionState;
use crate::errors::{
    BrokenConnectionErrorKind, ConnectionError, ConnectionPoolError, RequestAttemptError,
    UseKeyspaceError,
};
use crate::policies::load_balancing::NodeDistance;

use arc_swap::ArcSwap;
use futures::future::BoxFuture;
use futures::{future::RemoteHandle, stream::FuturesUnordered, FutureExt, StreamExt};
use itertools::Itertools;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, Notify};
use tracing::{debug, debug_span, trace, warn, Instrument};

/// Connection count and load thresholds of a pool at one distance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolSizing {
    /// Connections kept open regardless of load.
    pub core_connections: usize,
    /// Upper bound on open connections.
    pub max_connections: usize,
    /// A connection with this many requests in flight is saturated.
    pub max_requests_per_connection: usize,
    /// A connection above the core count with fewer requests in flight is
    /// retired.
    pub min_requests_per_connection: usize,
}

impl PoolSizing {
    fn normalized(self) -> Self {
        let core_connections = self.core_connections.max(1);
        Self {
            core_connections,
            max_connections: self.max_connections.max(core_connections),
            max_requests_per_connection: self.max_requests_per_connection.max(1),
            min_requests_per_connection: self.min_requests_per_connection,
        }
    }
}

/// Pool sizing per [`NodeDistance`]. Ignored nodes get no pool at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolConfig {
    pub local: PoolSizing,
    pub remote: PoolSizing,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            local: PoolSizing {
                core_connections: 1,
                max_connections: 8,
                max_requests_per_connection: 1024,
                min_requests_per_connection: 25,
            },
            remote: PoolSizing {
                core_connections: 1,
                max_connections: 2,
                max_requests_per_connection: 256,
                min_requests_per_connection: 25,
            },
        }
    }
}

impl PoolConfig {
    pub fn sizing_for(&self, distance: NodeDistance) -> Option<PoolSizing> {
        match distance {
            NodeDistance::Local => Some(self.local),
            NodeDistance::Remote => Some(self.remote),
            NodeDistance::Ignored => None,
        }
    }
}

/// Reported by a pool when it gains its first connection, or loses its last.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnectivityChangeEvent {
    Established { address: SocketAddr },
    Lost { address: SocketAddr },
}

enum MaybePoolConnections {
    // The pool is being filled for the first time
    Initializing,

    // The pool is empty because either initial filling failed or all connections
    // became broken; will be asynchronously refilled. Contains an error
    // from the last connection attempt.
    Broken(ConnectionError),

    // Never empty.
    Ready(Vec<Arc<Connection>>),
}

impl std::fmt::Debug for MaybePoolConnections {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MaybePoolConnections::Initializing => write!(f, "Initializing"),
            MaybePoolConnections::Broken(err) => write!(f, "Broken({err:?})"),
            MaybePoolConnections::Ready(conns) => {
                write!(f, "Ready({:?})", ConnectionVectorWrapper(conns))
            }
        }
    }
}

struct ConnectionVectorWrapper<'a>(&'a [Arc<Connection>]);
impl std::fmt::Debug for ConnectionVectorWrapper<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.0.iter().map(|conn| conn.in_flight()))
            .finish()
    }
}

/// Connections to one node, kept between `core_connections` and
/// `max_connections` by a background refiller task.
#[derive(Clone)]
pub(crate) struct NodeConnectionPool {
    conns: Arc<ArcSwap<MaybePoolConnections>>,
    use_keyspace_request_sender: mpsc::Sender<UseKeyspaceRequest>,
    fill_request_sender: mpsc::Sender<()>,
    _refiller_handle: Arc<RemoteHandle<()>>,
    pool_updated_notify: Arc<Notify>,
    address: SocketAddr,
    sizing: PoolSizing,
    connect_timeout: Duration,
}

impl std::fmt::Debug for NodeConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeConnectionPool")
            .field("conns", &self.conns)
            .field("address", &self.address)
            .field("sizing", &self.sizing)
            .finish_non_exhaustive()
    }
}

impl NodeConnectionPool {
    pub(crate) fn new(
        address: SocketAddr,
        sizing: PoolSizing,
        connection_config: ConnectionConfig,
        reconnection: Arc<ReconnectionState>,
        current_keyspace: Option<VerifiedKeyspaceName>,
        connectivity_events: mpsc::UnboundedSender<ConnectivityChangeEvent>,
    ) -> Self {
        let sizing = sizing.normalized();
        let (use_keyspace_request_sender, use_keyspace_request_receiver) = mpsc::channel(1);
        let (fill_request_sender, fill_request_receiver) = mpsc::channel(1);
        let pool_updated_notify = Arc::new(Notify::new());
        let connect_timeout = connection_config.connect_timeout;

        let refiller = PoolRefiller::new(
            address,
            sizing,
            connection_config,
            reconnection,
            current_keyspace,
            pool_updated_notify.clone(),
            connectivity_events,
        );

        let conns = refiller.get_shared_connections();
        let (fut, refiller_handle) = refiller
            .run(use_keyspace_request_receiver, fill_request_receiver)
            .instrument(debug_span!("pool_refiller", node = %address))
            .remote_handle();
        tokio::spawn(fut);

        Self {
            conns,
            use_keyspace_request_sender,
            fill_request_sender,
            _refiller_handle: Arc::new(refiller_handle),
            pool_updated_notify,
            address,
            sizing,
            connect_timeout,
        }
    }

    pub(crate) fn is_connected(&self) -> bool {
        matches!(**self.conns.load(), MaybePoolConnections::Ready(_))
    }

    /// Picks the least busy connection that is not saturated.
    ///
    /// When every connection is saturated and the pool may still grow, asks
    /// the refiller for one more connection and waits for it, at most for
    /// the connect timeout.
    pub(crate) async fn borrow(&self) -> Result<Arc<Connection>, ConnectionPoolError> {
        // Registered before the check so that a fresh connection is not missed.
        let notified = self.pool_updated_notify.notified();

        let conns = self.with_connections(|conns| conns.to_vec())?;
        if let Some(conn) = self.least_busy(&conns) {
            return Ok(conn);
        }
        if conns.len() >= self.sizing.max_connections {
            trace!(node = %self.address, "All connections saturated, pool at max size");
            return Err(ConnectionPoolError::NoConnectionsAvailable);
        }

        debug!(node = %self.address, "All connections saturated, growing the pool");
        let _ = self.fill_request_sender.try_send(());
        if tokio::time::timeout(self.connect_timeout, notified).await.is_err() {
            return Err(ConnectionPoolError::NoConnectionsAvailable);
        }

        let conns = self.with_connections(|conns| conns.to_vec())?;
        self.least_busy(&conns)
            .ok_or(ConnectionPoolError::NoConnectionsAvailable)
    }

    fn least_busy(&self, conns: &[Arc<Connection>]) -> Option<Arc<Connection>> {
        let in_flight = conns.iter().map(|c| c.in_flight()).collect_vec();
        least_busy_index(&in_flight, self.sizing.max_requests_per_connection)
            .map(|idx| conns[idx].clone())
    }

    /// Asks the refiller to reconnect now instead of waiting out its delay.
    pub(crate) fn trigger_refill(&self) {
        let _ = self.fill_request_sender.try_send(());
    }

    pub(crate) async fn use_keyspace(
        &self,
        keyspace_name: VerifiedKeyspaceName,
    ) -> Result<(), UseKeyspaceError> {
        let (response_sender, response_receiver) = oneshot::channel();

        // The refiller lives as long as `_refiller_handle`, so both channel
        // ends outlive this call; a failure still maps to a broken connection.
        let broken = || {
            UseKeyspaceError::RequestError(RequestAttemptError::BrokenConnectionError(
                BrokenConnectionErrorKind::ChannelError.into(),
            ))
        };
        self.use_keyspace_request_sender
            .send(UseKeyspaceRequest {
                keyspace_name,
                response_sender,
            })
            .await
            .map_err(|_| broken())?;

        response_receiver.await.map_err(|_| broken())?
    }

    // Waits until the pool becomes initialized.
    // The pool is considered initialized either if the first connection has been
    // established or after first filling ends, whichever comes first.
    pub(crate) async fn wait_until_initialized(&self) {
        // First, register for the notification
        // so that we don't miss it
        let notified = self.pool_updated_notify.notified();

        if let MaybePoolConnections::Initializing = **self.conns.load() {
            notified.await;
        }
    }

    pub(crate) fn get_working_connections(
        &self,
    ) -> Result<Vec<Arc<Connection>>, ConnectionPoolError> {
        self.with_connections(|conns| conns.to_vec())
    }

    fn with_connections<T>(
        &self,
        f: impl FnOnce(&[Arc<Connection>]) -> T,
    ) -> Result<T, ConnectionPoolError> {
        let conns = self.conns.load_full();
        match &*conns {
            MaybePoolConnections::Ready(pool_connections) => Ok(f(pool_connections)),
            MaybePoolConnections::Broken(err) => Err(ConnectionPoolError::Broken {
                last_connection_error: err.clone(),
            }),
            MaybePoolConnections::Initializing => Err(ConnectionPoolError::Initializing),
        }
    }
}

/// Index of the connection with the fewest requests in flight, among those
/// below `max_requests`.
fn least_busy_index(in_flight: &[usize], max_requests: usize) -> Option<usize> {
    in_flight
        .iter()
        .enumerate()
        .filter(|(_, load)| **load < max_requests)
        .min_by_key(|(_, load)| **load)
        .map(|(idx, _)| idx)
}

/// Indexes of connections to retire: beyond the first `core` connections
/// (taken least busy first), those carrying fewer than `min_requests`.
fn trash_candidates(in_flight: &[usize], core: usize, min_requests: usize) -> Vec<usize> {
    if in_flight.len() <= core {
        return Vec::new();
    }
    in_flight
        .iter()
        .enumerate()
        .sorted_by_key(|(_, load)| **load)
        .filter(|(_, load)| **load < min_requests)
        .take(in_flight.len() - core)
        .map(|(idx, _)| idx)
        .collect()
}

// How often idle surplus connections are retired.
#[cfg(not(test))]
const TRASH_CHECK_INTERVAL: Duration = Duration::from_secs(10);
#[cfg(test)]
const TRASH_CHECK_INTERVAL: Duration = Duration::from_millis(200);

struct PoolRefiller {
    address: SocketAddr,
    sizing: PoolSizing,
    connection_config: ConnectionConfig,

    // Shared with the node; the registry resets it when the node comes back.
    reconnection: Arc<ReconnectionState>,

    // `shared_conns` is updated only after `conns` change
    shared_conns: Arc<ArcSwap<MaybePoolConnections>>,
    conns: Vec<Arc<Connection>>,

    // Retired connections, dropped once idle. Load growth brings them back.
    trash: Vec<Arc<Connection>>,

    // Connection count the pool is filled up to, `core..=max`.
    target_size: usize,

    // Set to true if there was an error since the last refill,
    // set to false when refilling starts.
    had_error_since_last_refill: bool,

    ready_connections: FuturesUnordered<BoxFuture<'static, OpenedConnectionEvent>>,

    connection_errors: FuturesUnordered<BoxFuture<'static, BrokenConnectionEvent>>,

    current_keyspace: Option<VerifiedKeyspaceName>,

    // Signaled when the connection pool is updated
    pool_updated_notify: Arc<Notify>,

    connectivity_events: mpsc::UnboundedSender<ConnectivityChangeEvent>,
    connectivity: Connectivity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Connectivity {
    Initializing,
    Ready,
    Broken,
}

#[derive(Debug)]
struct UseKeyspaceRequest {
    keyspace_name: VerifiedKeyspaceName,
    response_sender: oneshot::Sender<Result<(), UseKeyspaceError>>,
}

impl PoolRefiller {
    fn new(
        address: SocketAddr,
        sizing: PoolSizing,
        connection_config: ConnectionConfig,
        reconnection: Arc<ReconnectionState>,
        current_keyspace: Option<VerifiedKeyspaceName>,
        pool_updated_notify: Arc<Notify>,
        connectivity_events: mpsc::UnboundedSender<ConnectivityChangeEvent>,
    ) -> Self {
        let shared_conns = Arc::new(ArcSwap::new(Arc::new(MaybePoolConnections::Initializing)));

        Self {
            address,
            sizing,
            connection_config,
            reconnection,

            shared_conns,
            conns: Vec::new(),
            trash: Vec::new(),
            target_size: sizing.core_connections,

            had_error_since_last_refill: false,

            ready_connections: FuturesUnordered::new(),
            connection_errors: FuturesUnordered::new(),

            current_keyspace,

            pool_updated_notify,
            connectivity_events,
            connectivity: Connectivity::Initializing,
        }
    }

    fn get_shared_connections(&self) -> Arc<ArcSwap<MaybePoolConnections>> {
        self.shared_conns.clone()
    }

    // The main loop of the pool refiller
    async fn run(
        mut self,
        mut use_keyspace_request_receiver: mpsc::Receiver<UseKeyspaceRequest>,
        mut fill_request_receiver: mpsc::Receiver<()>,
    ) {
        debug!("Started asynchronous pool worker");

        let mut next_refill_time = tokio::time::Instant::now();
        let mut refill_scheduled = true;

        let mut trash_interval = tokio::time::interval(TRASH_CHECK_INTERVAL);
        trash_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(next_refill_time), if refill_scheduled => {
                    self.had_error_since_last_refill = false;
                    self.start_filling();
                    refill_scheduled = false;
                }

                evt = self.ready_connections.select_next_some(), if !self.ready_connections.is_empty() => {
                    self.handle_ready_connection(evt);
                }

                evt = self.connection_errors.select_next_some(), if !self.connection_errors.is_empty() => {
                    if let Some(conn) = evt.connection.upgrade() {
                        debug!("Got error for connection {:p}: {:?}", Arc::as_ptr(&conn), evt.error);
                        self.remove_connection(conn, evt.error);
                    }
                }

                _ = trash_interval.tick() => {
                    self.collect_trash();
                }

                Some(()) = fill_request_receiver.recv() => {
                    if self.conns.is_empty() {
                        if !self.is_filling() {
                            trace!("Refill requested for an empty pool");
                            next_refill_time = tokio::time::Instant::now();
                            refill_scheduled = true;
                        }
                    } else {
                        self.grow_if_saturated();
                    }
                }

                req = use_keyspace_request_receiver.recv() => {
                    if let Some(req) = req {
                        debug!("Requested keyspace change: {}", req.keyspace_name.as_str());
                        self.use_keyspace(req.keyspace_name, req.response_sender);
                    } else {
                        // The pool handle is dropped.
                        trace!("Keyspace request channel dropped, stopping asynchronous pool worker");
                        return;
                    }
                }
            }
            trace!(pool_state = ?ConnectionVectorWrapper(&self.conns), trash = self.trash.len());

            // Schedule refilling here
            if !refill_scheduled && self.need_filling() {
                let delay = if self.had_error_since_last_refill {
                    self.reconnection.next_delay()
                } else {
                    Duration::ZERO
                };
                debug!("Scheduling next refill in {} ms", delay.as_millis());

                next_refill_time = tokio::time::Instant::now() + delay;
                refill_scheduled = true;
            }
        }
    }

    fn is_filling(&self) -> bool {
        !self.ready_connections.is_empty()
    }

    fn need_filling(&self) -> bool {
        !self.is_filling() && self.conns.len() < self.target_size
    }

    // Begins opening connections up to the target size. Results are processed
    // in the main loop as they arrive on `ready_connections`.
    fn start_filling(&mut self) {
        if self.conns.is_empty() {
            // The node may well be down; one attempt is enough.
            trace!("Will open the first connection to the node");
            self.start_opening_connection();
            return;
        }

        let to_open_count = self.target_size.saturating_sub(self.conns.len());
        trace!("Will open {} connections", to_open_count);
        for _ in 0..to_open_count {
            self.start_opening_connection();
        }
    }

    fn grow_if_saturated(&mut self) {
        let in_flight = self.conns.iter().map(|c| c.in_flight()).collect_vec();
        if least_busy_index(&in_flight, self.sizing.max_requests_per_connection).is_some() {
            return;
        }

        // A retired connection is the cheapest way to add capacity.
        if let Some(conn) = self.trash.pop() {
            debug!("Bringing back connection {:p} from trash", Arc::as_ptr(&conn));
            self.conns.push(conn);
            self.target_size = self.target_size.max(self.conns.len());
            self.update_shared_conns(None);
            return;
        }

        if self.target_size < self.sizing.max_connections && !self.is_filling() {
            self.target_size = (self.conns.len() + 1).min(self.sizing.max_connections);
            debug!("Growing pool to {} connections", self.target_size);
            self.start_filling();
        }
    }

    // Drops idle trashed connections, then retires surplus idle ones.
    fn collect_trash(&mut self) {
        let before = self.trash.len();
        self.trash.retain(|conn| conn.in_flight() > 0);
        if self.trash.len() != before {
            debug!("Closed {} idle trashed connections", before - self.trash.len());
        }

        let in_flight = self.conns.iter().map(|c| c.in_flight()).collect_vec();
        let mut to_trash = trash_candidates(
            &in_flight,
            self.sizing.core_connections,
            self.sizing.min_requests_per_connection,
        );
        if to_trash.is_empty() {
            return;
        }

        // Remove from the back so indexes stay valid.
        to_trash.sort_unstable_by(|a, b| b.cmp(a));
        for idx in to_trash {
            let conn = self.conns.swap_remove(idx);
            trace!("Moving connection {:p} to trash", Arc::as_ptr(&conn));
            self.trash.push(conn);
        }
        self.target_size = self.conns.len().max(self.sizing.core_connections);
        self.update_shared_conns(None);
    }

    // Handles a newly opened connection and decides what to do with it.
    fn handle_ready_connection(&mut self, evt: OpenedConnectionEvent) {
        match evt.result {
            Err(err) => {
                self.had_error_since_last_refill = true;
                debug!("Failed to open connection: {:?}", err);

                // If all connection attempts in this fill attempt failed
                // and the pool is empty, report this error.
                if !self.is_filling() && self.conns.is_empty() {
                    self.update_shared_conns(Some(err));
                }
            }
            Ok((connection, error_receiver)) => {
                // Before the connection can be put to the pool, we need
                // to make sure that it uses appropriate keyspace
                if let Some(keyspace) = &self.current_keyspace {
                    if evt.keyspace_name.as_ref() != Some(keyspace) {
                        self.start_setting_keyspace_for_connection(connection, error_receiver);
                        return;
                    }
                }

                if self.conns.len() >= self.sizing.max_connections {
                    debug!("Pool already at max size, dropping new connection");
                    return;
                }

                let conn = Arc::new(connection);
                trace!(
                    "Adding connection {:p} to the pool, now there are {}",
                    Arc::as_ptr(&conn),
                    self.conns.len() + 1,
                );

                self.connection_errors
                    .push(wait_for_error(Arc::downgrade(&conn), error_receiver).boxed());
                self.conns.push(conn);
                self.reconnection.reset();

                self.update_shared_conns(None);
            }
        }
    }

    fn start_opening_connection(&self) {
        let cfg = self.connection_config.clone();
        let address = self.address;

        let fut = async move {
            let result = open_connection(address, &cfg).await;
            OpenedConnectionEvent {
                result,
                keyspace_name: None,
            }
        }
        .boxed();
        self.ready_connections.push(fut);
    }

    // Updates `shared_conns` based on `conns`.
    // `last_error` must not be `None` if there is a possibility of the pool
    // being empty.
    fn update_shared_conns(&mut self, last_error: Option<ConnectionError>) {
        let new_conns = if self.conns.is_empty() {
            let err = last_error.unwrap_or_else(|| {
                ConnectionError::BrokenConnection(BrokenConnectionErrorKind::ChannelError.into())
            });
            Arc::new(MaybePoolConnections::Broken(err))
        } else {
            Arc::new(MaybePoolConnections::Ready(self.conns.clone()))
        };

        // Make the connection list available
        self.shared_conns.store(new_conns);

        // Notify potential waiters
        self.pool_updated_notify.notify_waiters();

        self.report_connectivity();
    }

    // Ready after Initializing or Broken is reported as established. Broken
    // after Initializing or Ready is reported as lost. Repeated failed
    // refills of a broken pool report nothing.
    fn report_connectivity(&mut self) {
        let address = self.address;
        let now = if self.conns.is_empty() {
            Connectivity::Broken
        } else {
            Connectivity::Ready
        };
        if now == self.connectivity {
            return;
        }
        self.connectivity = now;

        let event = match now {
            Connectivity::Ready => ConnectivityChangeEvent::Established { address },
            Connectivity::Broken => ConnectivityChangeEvent::Lost { address },
            Connectivity::Initializing => return,
        };
        debug!(?event, "Pool connectivity changed");
        let _ = self.connectivity_events.send(event);
    }

    // Removes given connection from the pool, whether active or trashed.
    fn remove_connection(&mut self, connection: Arc<Connection>, last_error: ConnectionError) {
        let ptr = Arc::as_ptr(&connection);

        if let Some(idx) = self.conns.iter().position(|c| Arc::ptr_eq(c, &connection)) {
            self.conns.swap_remove(idx);
            trace!(
                "Connection {:p} removed from the pool, now there are {}",
                ptr,
                self.conns.len(),
            );
            if self.conns.is_empty() {
                warn!(node = %self.address, error = %last_error, "Lost the last connection to the node");
            }
            self.update_shared_conns(Some(last_error));
            return;
        }

        if let Some(idx) = self.trash.iter().position(|c| Arc::ptr_eq(c, &connection)) {
            self.trash.swap_remove(idx);
            trace!("Connection {:p} removed from trash", ptr);
            return;
        }

        trace!("Connection {:p} was already removed", ptr);
    }

    // Sets current keyspace for available connections.
    // Connections which are being currently opened and future connections
    // will have this keyspace set when they appear on `ready_connections`.
    // Sends response to the `response_sender` when all current connections
    // have their keyspace set.
    fn use_keyspace(
        &mut self,
        keyspace_name: VerifiedKeyspaceName,
        response_sender: oneshot::Sender<Result<(), UseKeyspaceError>>,
    ) {
        self.current_keyspace = Some(keyspace_name.clone());

        let conns = self.conns.clone();
        let address = self.address;
        let connect_timeout = self.connection_config.connect_timeout;

        let fut = async move {
            let use_keyspace_futures = conns.iter().map(|conn| conn.use_keyspace(&keyspace_name));

            let use_keyspace_results: Vec<Result<(), UseKeyspaceError>> = tokio::time::timeout(
                connect_timeout,
                futures::future::join_all(use_keyspace_futures),
            )
            .await
            .map_err(|_| UseKeyspaceError::RequestTimeout(connect_timeout))?;

            use_keyspace_result(use_keyspace_results.into_iter())
        };

        tokio::task::spawn(async move {
            let res = fut.await;
            match &res {
                Ok(()) => debug!(node = %address, "Successfully changed current keyspace"),
                Err(err) => warn!(node = %address, "Failed to change keyspace: {:?}", err),
            }
            let _ = response_sender.send(res);
        });
    }

    // Requires the keyspace to be set
    // Requires that the event is for a successful connection
    fn start_setting_keyspace_for_connection(
        &mut self,
        connection: Connection,
        error_receiver: ErrorReceiver,
    ) {
        let Some(keyspace_name) = self.current_keyspace.clone() else {
            return;
        };
        let connect_timeout = self.connection_config.connect_timeout;
        self.ready_connections.push(
            async move {
                let result =
                    tokio::time::timeout(connect_timeout, connection.use_keyspace(&keyspace_name))
                        .await
                        .unwrap_or(Err(UseKeyspaceError::RequestTimeout(connect_timeout)));
                if let Err(err) = result {
                    warn!(
                        "[{}] Failed to set keyspace for new connection: {}",
                        connection.get_connect_address().ip(),
                        err,
                    );
                }
                OpenedConnectionEvent {
                    result: Ok((connection, error_receiver)),
                    keyspace_name: Some(keyspace_name),
                }
            }
            .boxed(),
        );
    }
}

/// Folds per-connection USE results: one success is enough as long as the
/// rest only failed on broken connections, which pick the keyspace up when
/// they are replaced.
pub(crate) fn use_keyspace_result(
    use_keyspace_results: impl Iterator<Item = Result<(), UseKeyspaceError>>,
) -> Result<(), UseKeyspaceError> {
    let mut was_ok: bool = false;
    let mut broken_conn_error: Option<UseKeyspaceError> = None;

    for result in use_keyspace_results {
        match result {
            Ok(()) => was_ok = true,
            Err(err) => match err {
                UseKeyspaceError::RequestError(RequestAttemptError::BrokenConnectionError(_)) => {
                    broken_conn_error = Some(err)
                }
                _ => return Err(err),
            },
        }
    }

    match broken_conn_error {
        Some(err) if !was_ok => Err(err),
        // No connections at all: new ones get the keyspace when they open.
        _ => Ok(()),
    }
}

struct BrokenConnectionEvent {
    connection: Weak<Connection>,
    error: ConnectionError,
}

async fn wait_for_error(
    connection: Weak<Connection>,
    error_receiver: ErrorReceiver,
) -> BrokenConnectionEvent {
    BrokenConnectionEvent {
        connection,
        error: error_receiver.await.unwrap_or_else(|_| {
            ConnectionError::BrokenConnection(BrokenConnectionErrorKind::ChannelError.into())
        }),
    }
}

struct OpenedConnectionEvent {
    result: Result<(Connection, ErrorReceiver), ConnectionError>,
    keyspace_name: Option<VerifiedKeyspaceName>,
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use assert_matches::assert_matches;
    use tokio::sync::mpsc;

    use super::{
        least_busy_index, trash_candidates, use_keyspace_result, ConnectivityChangeEvent,
        NodeConnectionPool, PoolConfig, PoolSizing, TRASH_CHECK_INTERVAL,
    };
    use crate::cluster::node::ReconnectionState;
    use crate::errors::{
        BrokenConnectionErrorKind, ConnectionPoolError, RequestAttemptError, UseKeyspaceError,
    };
    use crate::network::connection::{Connection, ConnectionConfig};
    use crate::policies::load_balancing::NodeDistance;
    use crate::policies::reconnection::ConstantReconnectionPolicy;
    use crate::test_utils::{handshake_reply, setup_tracing, MockResponse, MockServer, Reply};

    fn sizing(core: usize, max: usize, max_requests: usize) -> PoolSizing {
        PoolSizing {
            core_connections: core,
            max_connections: max,
            max_requests_per_connection: max_requests,
            min_requests_per_connection: 0,
        }
    }

    fn reconnection() -> Arc<ReconnectionState> {
        Arc::new(ReconnectionState::new(Arc::new(
            ConstantReconnectionPolicy::new(Duration::from_millis(50)),
        )))
    }

    fn broken() -> UseKeyspaceError {
        UseKeyspaceError::RequestError(RequestAttemptError::BrokenConnectionError(
            BrokenConnectionErrorKind::ChannelError.into(),
        ))
    }

    #[test]
    fn least_busy_skips_saturated_connections() {
        assert_eq!(least_busy_index(&[], 10), None);
        assert_eq!(least_busy_index(&[5, 2, 7], 10), Some(1));
        assert_eq!(least_busy_index(&[10, 12, 9], 10), Some(2));
        assert_eq!(least_busy_index(&[10, 10], 10), None);
    }

    #[test]
    fn only_idle_surplus_connections_are_trashed() {
        // At or below core nothing goes.
        assert!(trash_candidates(&[0, 0], 2, 25).is_empty());

        let mut trashed = trash_candidates(&[3, 100, 0, 30], 1, 25);
        trashed.sort_unstable();
        assert_eq!(trashed, vec![0, 2]);

        // Busy connections stay even above core.
        assert!(trash_candidates(&[50, 60, 70], 1, 25).is_empty());

        // Never more than the surplus.
        assert_eq!(trash_candidates(&[0, 0, 0], 2, 25), vec![0]);
    }

    #[test]
    fn pool_sizing_by_distance() {
        let config = PoolConfig::default();
        assert_eq!(config.sizing_for(NodeDistance::Local), Some(config.local));
        assert_eq!(config.sizing_for(NodeDistance::Remote), Some(config.remote));
        assert_eq!(config.sizing_for(NodeDistance::Ignored), None);

        let fixed = sizing(0, 0, 0).normalized();
        assert_eq!(fixed, sizing(1, 1, 1));
    }

    #[test]
    fn use_keyspace_results_tolerate_broken_connections() {
        assert_matches!(use_keyspace_result(std::iter::empty()), Ok(()));
        assert_matches!(use_keyspace_result([Ok(()), Err(broken())].into_iter()), Ok(()));
        assert_matches!(
            use_keyspace_result([Err(broken()), Err(broken())].into_iter()),
            Err(UseKeyspaceError::RequestError(_))
        );
        assert_matches!(
            use_keyspace_result(
                [Ok(()), Err(UseKeyspaceError::RequestTimeout(Duration::ZERO))].into_iter()
            ),
            Err(UseKeyspaceError::RequestTimeout(_))
        );
    }

    #[tokio::test]
    #[ntest::timeout(10000)]
    async fn pool_connects_and_reports_connectivity() {
        setup_tracing();
        let server = MockServer::start(|request| {
            handshake_reply(request).unwrap_or(Reply::Respond(MockResponse::void()))
        })
        .await;

        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let pool = NodeConnectionPool::new(
            server.addr(),
            sizing(1, 4, 100),
            ConnectionConfig::default(),
            reconnection(),
            None,
            events_tx,
        );
        pool.wait_until_initialized().await;

        assert_eq!(
            events_rx.recv().await,
            Some(ConnectivityChangeEvent::Established {
                address: server.addr()
            })
        );
        assert!(pool.is_connected());
        assert_eq!(pool.get_working_connections().unwrap().len(), 1);

        let conn = pool.borrow().await.unwrap();
        conn.query_unpaged("SELECT 1").await.unwrap();

        server.close_connections();
        assert_eq!(
            events_rx.recv().await,
            Some(ConnectivityChangeEvent::Lost {
                address: server.addr()
            })
        );

        // And comes back on its own.
        assert_eq!(
            events_rx.recv().await,
            Some(ConnectivityChangeEvent::Established {
                address: server.addr()
            })
        );
    }

    #[tokio::test]
    #[ntest::timeout(10000)]
    async fn saturated_pool_grows_up_to_max() {
        setup_tracing();
        let server = MockServer::start(|request| {
            if request.is_query("SLOW") {
                return Reply::Delayed(Duration::from_secs(2), MockResponse::void());
            }
            handshake_reply(request).unwrap_or(Reply::Respond(MockResponse::void()))
        })
        .await;

        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let pool = NodeConnectionPool::new(
            server.addr(),
            sizing(1, 2, 1),
            ConnectionConfig::default(),
            reconnection(),
            None,
            events_tx,
        );
        pool.wait_until_initialized().await;

        let first = pool.borrow().await.unwrap();
        let busy = first.clone();
        let slow = tokio::spawn(async move { busy.query_unpaged("SLOW").await });
        while first.in_flight() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let second = pool.borrow().await.unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(pool.get_working_connections().unwrap().len(), 2);

        let also_busy = second.clone();
        let slow_too = tokio::spawn(async move { also_busy.query_unpaged("SLOW").await });
        while second.in_flight() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        assert_matches!(
            pool.borrow().await,
            Err(ConnectionPoolError::NoConnectionsAvailable)
        );

        slow.await.unwrap().unwrap();
        slow_too.await.unwrap().unwrap();
        assert_eq!(server.connection_count(), 2);
    }

    #[tokio::test]
    #[ntest::timeout(10000)]
    async fn trashed_connection_lives_until_its_requests_finish() {
        setup_tracing();
        let server = MockServer::start(|request| {
            if request.is_query("SLOW") {
                return Reply::Delayed(Duration::from_millis(1500), MockResponse::void());
            }
            handshake_reply(request).unwrap_or(Reply::Respond(MockResponse::void()))
        })
        .await;

        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let pool = NodeConnectionPool::new(
            server.addr(),
            PoolSizing {
                core_connections: 1,
                max_connections: 2,
                max_requests_per_connection: 2,
                min_requests_per_connection: 5,
            },
            ConnectionConfig::default(),
            reconnection(),
            None,
            events_tx,
        );
        pool.wait_until_initialized().await;

        let slow = |conn: &Arc<Connection>| {
            let conn = conn.clone();
            tokio::spawn(async move { conn.query_unpaged("SLOW").await })
        };
        let wait_for_load = |conn: Arc<Connection>, load: usize| async move {
            while conn.in_flight() < load {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        };

        let first = pool.borrow().await.unwrap();
        let mut requests = vec![slow(&first), slow(&first)];
        wait_for_load(first.clone(), 2).await;

        let second = pool.borrow().await.unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        requests.push(slow(&second));
        wait_for_load(second.clone(), 1).await;

        // Surplus and below the minimum load, so it is retired, but stays
        // open across later checks while its request is outstanding.
        while pool.get_working_connections().unwrap().len() != 1 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tokio::time::sleep(TRASH_CHECK_INTERVAL * 2 + Duration::from_millis(50)).await;
        let working = pool.get_working_connections().unwrap();
        assert_eq!(working.len(), 1);
        assert!(Arc::ptr_eq(&working[0], &first));
        assert_eq!(second.in_flight(), 1);
        assert_eq!(server.open_connections(), 2);

        // The first one is saturated: the retired connection comes back
        // instead of a new one being opened.
        let borrowed = pool.borrow().await.unwrap();
        assert!(Arc::ptr_eq(&borrowed, &second));
        assert_eq!(pool.get_working_connections().unwrap().len(), 2);
        assert_eq!(server.connection_count(), 2);

        for request in requests {
            request.await.unwrap().unwrap();
        }
        drop((first, second, borrowed, working));

        // Idle again: one goes to the trash and is closed at the next check.
        let mut waited = Duration::ZERO;
        while server.open_connections() != 1 {
            assert!(waited < Duration::from_secs(3), "Idle connection was never closed");
            tokio::time::sleep(Duration::from_millis(10)).await;
            waited += Duration::from_millis(10);
        }
        assert_eq!(pool.get_working_connections().unwrap().len(), 1);
    }

    #[tokio::test]
    #[ntest::timeout(10000)]
    async fn unreachable_node_makes_pool_broken() {
        setup_tracing();
        // Bind and drop to get a port nobody listens on.
        let addr = {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };

        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let pool = NodeConnectionPool::new(
            addr,
            sizing(1, 1, 10),
            ConnectionConfig::default(),
            reconnection(),
            None,
            events_tx,
        );
        pool.wait_until_initialized().await;

        assert_matches!(pool.borrow().await, Err(ConnectionPoolError::Broken { .. }));
        assert_eq!(
            events_rx.recv().await,
            Some(ConnectivityChangeEvent::Lost { address: addr })
        );

        // Failed refills do not repeat the event.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(events_rx.try_recv().is_err());
    }

    #[tokio::test]
    #[ntest::timeout(10000)]
    async fn use_keyspace_reaches_open_connections() {
        setup_tracing();
        let server = MockServer::start(|request| {
            if let Some(query) = request.query_text() {
                if let Some(name) = query.strip_prefix("USE ") {
                    return Reply::Respond(MockResponse::set_keyspace(name.trim_matches('"')));
                }
            }
            handshake_reply(request).unwrap_or(Reply::Respond(MockResponse::void()))
        })
        .await;

        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let pool = NodeConnectionPool::new(
            server.addr(),
            sizing(1, 1, 10),
            ConnectionConfig::default(),
            reconnection(),
            None,
            events_tx,
        );
        pool.wait_until_initialized().await;

        let keyspace =
            crate::network::connection::VerifiedKeyspaceName::new("ks".to_owned(), false).unwrap();
        pool.use_keyspace(keyspace).await.unwrap();
    }
}
