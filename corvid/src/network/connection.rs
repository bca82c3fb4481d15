use bytes::Bytes;
use corvid_cql::frame::request::batch::{self as batch_frame, BatchStatement as BatchStatementFrame};
use corvid_cql::frame::request::query::QueryParameters;
use corvid_cql::frame::request::startup;
use corvid_cql::frame::request::{self, SerializableRequest};
use corvid_cql::frame::response::authenticate::Authenticate;
use corvid_cql::frame::response::event::Event;
use corvid_cql::frame::response::{self, result, Error, Response, ResponseOpcode};
use corvid_cql::frame::server_event_type::EventType;
use corvid_cql::frame::types::{Consistency, SerialConsistency};
use corvid_cql::frame::{self, Compression, FrameParams, SerializedRequest};
use corvid_cql::SerializedValues;
use futures::future::RemoteHandle;
use futures::FutureExt;
use socket2::{SockRef, TcpKeepalive};
use tokio::io::{split, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, debug_span, error, trace, warn, Instrument};
use uuid::Uuid;

use std::borrow::Cow;
use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::authentication::AuthenticatorProvider;
use crate::errors::{
    BadKeyspaceName, BrokenConnectionError, BrokenConnectionErrorKind, ConnectionError,
    ConnectionSetupRequestError, ConnectionSetupRequestErrorKind, CqlEventHandlingError, DbError,
    InternalRequestError, RequestAttemptError, SchemaAgreementError, UseKeyspaceError,
};
use crate::response::{QueryResponse, QueryResult};
use crate::statement::{Batch, BatchStatement, PreparedStatement, Statement};

// Query for schema agreement
const LOCAL_VERSION: &str = "SELECT schema_version FROM system.local WHERE key='local'";

// An orphan is a stream id allocated for a request nobody waits for anymore
// (it timed out or was cancelled). A connection that accumulates more than
// OLD_ORPHAN_COUNT_THRESHOLD orphans older than OLD_AGE_ORPHAN_THRESHOLD is
// broken; the pool replaces it.
const OLD_ORPHAN_COUNT_THRESHOLD: usize = 1024;
const OLD_AGE_ORPHAN_THRESHOLD: Duration = Duration::from_secs(1);

/// Stream ids available on a v4 connection.
pub(crate) const MAX_STREAMS: usize = i16::MAX as usize + 1;

const DRIVER_NAME: &str = "corvid";

pub(crate) struct Connection {
    _worker_handle: RemoteHandle<()>,

    connect_address: SocketAddr,
    config: ConnectionConfig,
    router_handle: Arc<RouterHandle>,
    in_flight: AtomicUsize,
}

struct RouterHandle {
    submit_channel: mpsc::Sender<Task>,

    // Each request sent by `Connection::send_request` needs a unique request id.
    request_id_generator: AtomicU64,
    // A cancelled or timed out `send_request` notifies the router through
    // this sender. It is unbounded because only unbounded channels can be
    // pushed to synchronously, from a `Drop` impl.
    orphan_notification_sender: mpsc::UnboundedSender<RequestId>,
}

impl RouterHandle {
    fn allocate_request_id(&self) -> RequestId {
        self.request_id_generator
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed)
    }

    async fn send_request(
        &self,
        request: &impl SerializableRequest,
        compression: Option<Compression>,
        tracing: bool,
        timeout: Option<Duration>,
    ) -> Result<TaskResponse, InternalRequestError> {
        let serialized_request = SerializedRequest::make(request, compression, tracing)?;
        let request_id = self.allocate_request_id();

        let (response_sender, receiver) = oneshot::channel();
        let response_handler = ResponseHandler {
            response_sender,
            request_id,
        };

        // Dropping `notifier` before `disable()` orphans the stream id the
        // router allocated for this request.
        let notifier = OrphanhoodNotifier::new(request_id, &self.orphan_notification_sender);

        self.submit_channel
            .send(Task {
                serialized_request,
                response_handler,
            })
            .await
            .map_err(|_| -> BrokenConnectionError {
                BrokenConnectionErrorKind::ChannelError.into()
            })?;

        let received = match timeout {
            Some(timeout) => tokio::time::timeout(timeout, receiver)
                .await
                .map_err(|_| InternalRequestError::RequestTimeout(timeout))?,
            None => receiver.await,
        };
        let task_response = received.map_err(|_| -> BrokenConnectionError {
            BrokenConnectionErrorKind::ChannelError.into()
        })?;

        notifier.disable();

        task_response
    }
}

type RequestId = u64;

struct ResponseHandler {
    response_sender: oneshot::Sender<Result<TaskResponse, InternalRequestError>>,
    request_id: RequestId,
}

// Tells `Connection::orphaner` that a `send_request` future was dropped
// before it received its response.
struct OrphanhoodNotifier<'a> {
    enabled: bool,
    request_id: RequestId,
    notification_sender: &'a mpsc::UnboundedSender<RequestId>,
}

impl<'a> OrphanhoodNotifier<'a> {
    fn new(
        request_id: RequestId,
        notification_sender: &'a mpsc::UnboundedSender<RequestId>,
    ) -> Self {
        Self {
            enabled: true,
            request_id,
            notification_sender,
        }
    }

    fn disable(mut self) {
        self.enabled = false;
    }
}

impl Drop for OrphanhoodNotifier<'_> {
    fn drop(&mut self) {
        if self.enabled {
            let _ = self.notification_sender.send(self.request_id);
        }
    }
}

// Counts a request as in flight for as long as it lives.
struct InFlightGuard<'a>(&'a AtomicUsize);

impl<'a> InFlightGuard<'a> {
    fn new(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        Self(counter)
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, std::sync::atomic::Ordering::Relaxed);
    }
}

struct Task {
    serialized_request: SerializedRequest,
    response_handler: ResponseHandler,
}

struct TaskResponse {
    params: FrameParams,
    opcode: ResponseOpcode,
    body: Bytes,
}

/// Settings of a single connection.
#[derive(Clone)]
pub(crate) struct ConnectionConfig {
    pub(crate) compression: Option<Compression>,
    pub(crate) tcp_nodelay: bool,
    pub(crate) tcp_keepalive_interval: Option<Duration>,
    pub(crate) connect_timeout: Duration,
    /// How long a single request waits for its response.
    pub(crate) request_timeout: Option<Duration>,
    /// Set for control connections, which REGISTER for server events.
    pub(crate) event_sender: Option<mpsc::Sender<Event>>,
    pub(crate) default_consistency: Consistency,
    pub(crate) authenticator: Option<Arc<dyn AuthenticatorProvider>>,
    pub(crate) keepalive_interval: Option<Duration>,
    pub(crate) keepalive_timeout: Option<Duration>,
    pub(crate) max_streams: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            compression: None,
            tcp_nodelay: true,
            tcp_keepalive_interval: None,
            connect_timeout: Duration::from_secs(5),
            request_timeout: Some(Duration::from_secs(12)),
            event_sender: None,
            default_consistency: Default::default(),
            authenticator: None,
            keepalive_interval: Some(Duration::from_secs(30)),
            keepalive_timeout: Some(Duration::from_secs(30)),
            max_streams: MAX_STREAMS,
        }
    }
}

impl fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("compression", &self.compression)
            .field("tcp_nodelay", &self.tcp_nodelay)
            .field("tcp_keepalive_interval", &self.tcp_keepalive_interval)
            .field("connect_timeout", &self.connect_timeout)
            .field("request_timeout", &self.request_timeout)
            .field("is_control", &self.event_sender.is_some())
            .field("default_consistency", &self.default_consistency)
            .field("has_authenticator", &self.authenticator.is_some())
            .field("keepalive_interval", &self.keepalive_interval)
            .field("keepalive_timeout", &self.keepalive_timeout)
            .field("max_streams", &self.max_streams)
            .finish()
    }
}

pub(crate) type ErrorReceiver = oneshot::Receiver<ConnectionError>;

impl Connection {
    // Returns the new connection and a receiver which resolves with the fatal
    // error of the connection, if one happens. No frames are sent yet.
    async fn new(
        connect_address: SocketAddr,
        config: ConnectionConfig,
    ) -> Result<(Self, ErrorReceiver), ConnectionError> {
        let stream_connector =
            tokio::time::timeout(config.connect_timeout, TcpStream::connect(connect_address)).await;
        let stream = match stream_connector {
            Ok(stream) => stream?,
            Err(_) => {
                return Err(ConnectionError::ConnectTimeout);
            }
        };
        stream.set_nodelay(config.tcp_nodelay)?;

        if let Some(tcp_keepalive_interval) = config.tcp_keepalive_interval {
            Self::setup_tcp_keepalive(&stream, tcp_keepalive_interval)?;
        }

        let (sender, receiver) = mpsc::channel(1024);
        let (error_sender, error_receiver) = oneshot::channel();
        let (orphan_notification_sender, orphan_notification_receiver) = mpsc::unbounded_channel();

        let router_handle = Arc::new(RouterHandle {
            submit_channel: sender,
            request_id_generator: AtomicU64::new(0),
            orphan_notification_sender,
        });

        let (task, _worker_handle) = Self::router(
            config.clone(),
            stream,
            receiver,
            error_sender,
            orphan_notification_receiver,
            router_handle.clone(),
            connect_address,
        )
        .instrument(debug_span!("connection_router", node = %connect_address))
        .remote_handle();
        tokio::task::spawn(task);

        let connection = Connection {
            _worker_handle,
            config,
            connect_address,
            router_handle,
            in_flight: AtomicUsize::new(0),
        };

        Ok((connection, error_receiver))
    }

    fn setup_tcp_keepalive(
        stream: &TcpStream,
        tcp_keepalive_interval: Duration,
    ) -> std::io::Result<()> {
        // Our "interval" is the idle time before the first keepalive packet, which
        // socket2 calls "time"; its "interval" is the gap between packets.
        let mut tcp_keepalive = TcpKeepalive::new().with_time(tcp_keepalive_interval);

        // Same platform constraints as in socket2.
        #[cfg(any(
            target_os = "android",
            target_os = "dragonfly",
            target_os = "freebsd",
            target_os = "fuchsia",
            target_os = "illumos",
            target_os = "ios",
            target_os = "linux",
            target_os = "macos",
            target_os = "netbsd",
            target_os = "tvos",
            target_os = "watchos",
            target_os = "windows",
        ))]
        {
            tcp_keepalive = tcp_keepalive.with_interval(Duration::from_secs(1));
        }

        #[cfg(any(
            target_os = "android",
            target_os = "dragonfly",
            target_os = "freebsd",
            target_os = "fuchsia",
            target_os = "illumos",
            target_os = "ios",
            target_os = "linux",
            target_os = "macos",
            target_os = "netbsd",
            target_os = "tvos",
            target_os = "watchos",
        ))]
        {
            tcp_keepalive = tcp_keepalive.with_retries(10);
        }

        let sf = SockRef::from(&stream);
        sf.set_tcp_keepalive(&tcp_keepalive)
    }

    async fn get_options(&self) -> Result<response::Supported, ConnectionSetupRequestError> {
        let err = |kind: ConnectionSetupRequestErrorKind| {
            ConnectionSetupRequestError::new("OPTIONS", kind)
        };

        let response = self
            .send_request(&request::Options, false, false)
            .await
            .map_err(|e| err(e.into()))?;

        match response.response {
            Response::Supported(supported) => Ok(supported),
            Response::Error(Error { error, reason }) => {
                Err(err(ConnectionSetupRequestErrorKind::DbError(error, reason)))
            }
            other => Err(err(ConnectionSetupRequestErrorKind::UnexpectedResponse(
                other.to_response_kind(),
            ))),
        }
    }

    /// Sends STARTUP. `None` means READY; otherwise the server wants authentication.
    async fn startup(
        &self,
        options: HashMap<String, String>,
    ) -> Result<Option<Authenticate>, ConnectionSetupRequestError> {
        let err = |kind: ConnectionSetupRequestErrorKind| {
            ConnectionSetupRequestError::new("STARTUP", kind)
        };

        let response = self
            .send_request(&request::Startup { options }, false, false)
            .await
            .map_err(|e| err(e.into()))?;

        match response.response {
            Response::Ready => Ok(None),
            Response::Authenticate(authenticate) => Ok(Some(authenticate)),
            Response::Error(Error { error, reason }) => {
                Err(err(ConnectionSetupRequestErrorKind::DbError(error, reason)))
            }
            other => Err(err(ConnectionSetupRequestErrorKind::UnexpectedResponse(
                other.to_response_kind(),
            ))),
        }
    }

    async fn perform_authenticate(
        &self,
        authenticate: &Authenticate,
    ) -> Result<(), ConnectionSetupRequestError> {
        let err = |kind: ConnectionSetupRequestErrorKind| {
            ConnectionSetupRequestError::new("AUTH_RESPONSE", kind)
        };

        let authenticator_provider = self
            .config
            .authenticator
            .as_ref()
            .ok_or_else(|| err(ConnectionSetupRequestErrorKind::MissingAuthentication))?;

        let (initial_response, mut auth_session) = authenticator_provider
            .start_authentication_session(&authenticate.authenticator_name)
            .await
            .map_err(|e| err(ConnectionSetupRequestErrorKind::StartAuthSessionError(e)))?;

        let mut response = initial_response;
        loop {
            let reply = self
                .send_request(&request::AuthResponse { response }, false, false)
                .await
                .map_err(|e| err(e.into()))?;

            match reply.response {
                Response::AuthChallenge(challenge) => {
                    let next = auth_session
                        .evaluate_challenge(challenge.authenticate_message.as_deref())
                        .await
                        .map_err(|e| {
                            err(ConnectionSetupRequestErrorKind::AuthChallengeEvaluationError(e))
                        })?;
                    match next {
                        Some(token) => response = Some(token),
                        None => {
                            debug!(
                                node = %self.connect_address,
                                "Authenticator has no answer to the challenge, treating the connection as ready"
                            );
                            return Ok(());
                        }
                    }
                }
                // Some servers finish the exchange with READY instead.
                Response::Ready => return Ok(()),
                Response::AuthSuccess(success) => {
                    return auth_session
                        .success(success.success_message.as_deref())
                        .await
                        .map_err(|e| err(ConnectionSetupRequestErrorKind::AuthFinishError(e)));
                }
                Response::Error(Error { error, reason }) => {
                    return Err(err(ConnectionSetupRequestErrorKind::DbError(error, reason)));
                }
                other => {
                    return Err(err(ConnectionSetupRequestErrorKind::UnexpectedResponse(
                        other.to_response_kind(),
                    )));
                }
            }
        }
    }

    async fn register(
        &self,
        event_types_to_register_for: Vec<EventType>,
    ) -> Result<(), ConnectionSetupRequestError> {
        let err = |kind: ConnectionSetupRequestErrorKind| {
            ConnectionSetupRequestError::new("REGISTER", kind)
        };

        let register_frame = request::Register {
            event_types_to_register_for,
        };

        let response = self
            .send_request(&register_frame, true, false)
            .await
            .map_err(|e| err(e.into()))?;

        match response.response {
            Response::Ready => Ok(()),
            Response::Error(Error { error, reason }) => {
                Err(err(ConnectionSetupRequestErrorKind::DbError(error, reason)))
            }
            other => Err(err(ConnectionSetupRequestErrorKind::UnexpectedResponse(
                other.to_response_kind(),
            ))),
        }
    }

    pub(crate) async fn prepare(
        &self,
        statement: &Statement,
    ) -> Result<PreparedStatement, RequestAttemptError> {
        let query_response = self
            .send_request(
                &request::Prepare {
                    query: &statement.contents,
                },
                true,
                statement.config.tracing,
            )
            .await?;

        match query_response.response {
            Response::Error(Error { error, reason }) => {
                Err(RequestAttemptError::DbError(error, reason))
            }
            Response::Result(result::Result::Prepared(p)) => Ok(PreparedStatement::new(
                p.id,
                p.prepared_metadata,
                p.result_metadata,
                statement.contents.clone(),
                statement.get_page_size(),
                statement.config.clone(),
            )),
            other => Err(RequestAttemptError::UnexpectedResponse(
                other.to_response_kind(),
            )),
        }
    }

    async fn reprepare(&self, previous_prepared: &PreparedStatement) -> Result<(), RequestAttemptError> {
        let reprepare_query = Statement::new(previous_prepared.get_statement());
        let reprepared = self.prepare(&reprepare_query).await?;

        // The id is a digest of the statement text, so it must not change.
        if reprepared.get_id() != previous_prepared.get_id() {
            return Err(RequestAttemptError::RepreparedIdChanged {
                statement: reprepare_query.contents,
                expected_id: previous_prepared.get_id().to_vec(),
                reprepared_id: reprepared.get_id().to_vec(),
            });
        }

        Ok(())
    }

    /// Runs an internal statement, without paging or retries.
    pub(crate) async fn query_unpaged(
        &self,
        statement: impl Into<Statement>,
    ) -> Result<QueryResult, RequestAttemptError> {
        let statement: Statement = statement.into();

        self.query_raw_with_consistency(
            &statement,
            SerializedValues::EMPTY,
            statement
                .config
                .determine_consistency(self.config.default_consistency),
            statement.config.serial_consistency,
            None,
        )
        .await
        .and_then(|response| response.into_query_result(self.connect_address))
    }

    pub(crate) async fn query_raw_with_consistency(
        &self,
        statement: &Statement,
        values: &SerializedValues,
        consistency: Consistency,
        serial_consistency: Option<SerialConsistency>,
        paging_state: Option<Bytes>,
    ) -> Result<QueryResponse, RequestAttemptError> {
        let query_frame = request::Query {
            contents: Cow::Borrowed(&statement.contents),
            parameters: QueryParameters {
                consistency,
                serial_consistency,
                values: Cow::Borrowed(values),
                page_size: statement.get_page_size(),
                paging_state,
                skip_metadata: false,
                timestamp: statement.get_timestamp(),
            },
        };

        let response = self
            .send_request(&query_frame, true, statement.config.tracing)
            .await?;

        Ok(response)
    }

    /// Executes a prepared statement. If the node no longer knows the
    /// statement, it is prepared again on this connection and executed once more.
    pub(crate) async fn execute_raw_with_consistency(
        &self,
        prepared_statement: &PreparedStatement,
        values: &SerializedValues,
        consistency: Consistency,
        serial_consistency: Option<SerialConsistency>,
        paging_state: Option<Bytes>,
    ) -> Result<QueryResponse, RequestAttemptError> {
        let execute_frame = request::Execute {
            id: prepared_statement.get_id().clone(),
            parameters: QueryParameters {
                consistency,
                serial_consistency,
                values: Cow::Borrowed(values),
                page_size: prepared_statement.get_page_size(),
                timestamp: prepared_statement.get_timestamp(),
                skip_metadata: false,
                paging_state,
            },
        };

        let query_response = self
            .send_request(&execute_frame, true, prepared_statement.config.tracing)
            .await?;

        match &query_response.response {
            Response::Error(Error {
                error: DbError::Unprepared { statement_id },
                ..
            }) => {
                debug!(
                    node = %self.connect_address,
                    "Connection::execute: got DbError::Unprepared, repreparing statement with id {:?}",
                    statement_id
                );
                self.reprepare(prepared_statement).await?;
                let new_response = self
                    .send_request(&execute_frame, true, prepared_statement.config.tracing)
                    .await?;
                Ok(new_response)
            }
            _ => Ok(query_response),
        }
    }

    /// Sends a BATCH, with one value list per statement.
    ///
    /// Every prepared statement the node reports as unknown is prepared
    /// again, once, before the batch is resent.
    pub(crate) async fn batch_with_consistency(
        &self,
        batch: &Batch,
        values: &[SerializedValues],
        consistency: Consistency,
        serial_consistency: Option<SerialConsistency>,
    ) -> Result<QueryResponse, RequestAttemptError> {
        let batch_frame = batch_frame::Batch {
            statements: batch
                .statements
                .iter()
                .map(|statement| match statement {
                    BatchStatement::Query(query) => BatchStatementFrame::Query {
                        text: Cow::Borrowed(query.contents.as_str()),
                    },
                    BatchStatement::PreparedStatement(prepared) => BatchStatementFrame::Prepared {
                        id: prepared.get_id().clone(),
                    },
                })
                .collect(),
            batch_type: batch.get_type(),
            consistency,
            serial_consistency,
            timestamp: batch.get_timestamp(),
            values: values.iter().map(Cow::Borrowed).collect(),
        };

        let mut reprepared: HashSet<Bytes> = HashSet::new();
        loop {
            let query_response = self
                .send_request(&batch_frame, true, batch.config.tracing)
                .await?;

            return match query_response.response {
                Response::Error(Error {
                    error: DbError::Unprepared { statement_id },
                    reason,
                }) => {
                    debug!(
                        node = %self.connect_address,
                        "Connection::batch: got DbError::Unprepared, repreparing statement with id {:?}",
                        statement_id
                    );
                    if reprepared.contains(&statement_id) {
                        return Err(RequestAttemptError::DbError(
                            DbError::Unprepared { statement_id },
                            reason,
                        ));
                    }
                    let prepared_statement = batch.statements.iter().find_map(|s| match s {
                        BatchStatement::PreparedStatement(s) if *s.get_id() == statement_id => {
                            Some(s)
                        }
                        _ => None,
                    });
                    match prepared_statement {
                        Some(p) => {
                            self.reprepare(p).await?;
                            reprepared.insert(statement_id);
                            continue;
                        }
                        None => Err(RequestAttemptError::RepreparedIdMissingInBatch(
                            statement_id.to_vec(),
                        )),
                    }
                }
                Response::Error(Error { error, reason }) => {
                    Err(RequestAttemptError::DbError(error, reason))
                }
                Response::Result(_) => Ok(QueryResponse {
                    response: query_response.response,
                    tracing_id: query_response.tracing_id,
                    warnings: query_response.warnings,
                }),
                other => Err(RequestAttemptError::UnexpectedResponse(
                    other.to_response_kind(),
                )),
            };
        }
    }

    pub(crate) async fn use_keyspace(
        &self,
        keyspace_name: &VerifiedKeyspaceName,
    ) -> Result<(), UseKeyspaceError> {
        // The keyspace cannot be a bound value; it is spliced into the text.
        let query: Statement = match keyspace_name.is_case_sensitive {
            true => format!("USE \"{}\"", keyspace_name.as_str()).into(),
            false => format!("USE {}", keyspace_name.as_str()).into(),
        };

        let query_response = self
            .query_raw_with_consistency(
                &query,
                SerializedValues::EMPTY,
                self.config.default_consistency,
                None,
                None,
            )
            .await?;
        Self::verify_use_keyspace_result(keyspace_name, query_response)
    }

    fn verify_use_keyspace_result(
        keyspace_name: &VerifiedKeyspaceName,
        query_response: QueryResponse,
    ) -> Result<(), UseKeyspaceError> {
        match query_response.response {
            Response::Result(result::Result::SetKeyspace(set_keyspace)) => {
                if !set_keyspace
                    .keyspace_name
                    .eq_ignore_ascii_case(keyspace_name.as_str())
                {
                    let expected_keyspace_name_lowercase = keyspace_name.as_str().to_lowercase();
                    let result_keyspace_name_lowercase = set_keyspace.keyspace_name.to_lowercase();

                    return Err(UseKeyspaceError::KeyspaceNameMismatch {
                        expected_keyspace_name_lowercase,
                        result_keyspace_name_lowercase,
                    });
                }

                Ok(())
            }
            Response::Error(err) => Err(UseKeyspaceError::RequestError(
                RequestAttemptError::DbError(err.error, err.reason),
            )),
            other => Err(UseKeyspaceError::RequestError(
                RequestAttemptError::UnexpectedResponse(other.to_response_kind()),
            )),
        }
    }

    pub(crate) async fn fetch_schema_version(&self) -> Result<Uuid, SchemaAgreementError> {
        let result = self.query_unpaged(LOCAL_VERSION).await?;

        result
            .rows()
            .and_then(|rows| rows.first())
            .and_then(|row| row.columns.first())
            .and_then(|cell| cell.as_ref())
            .and_then(|value| value.as_uuid())
            .ok_or(SchemaAgreementError::BadSchemaVersion)
    }

    async fn send_request(
        &self,
        request: &impl SerializableRequest,
        compress: bool,
        tracing: bool,
    ) -> Result<QueryResponse, InternalRequestError> {
        let compression = if compress {
            self.config.compression
        } else {
            None
        };

        let _in_flight = InFlightGuard::new(&self.in_flight);
        let task_response = self
            .router_handle
            .send_request(request, compression, tracing, self.config.request_timeout)
            .await?;

        Self::parse_response(task_response, self.config.compression)
    }

    fn parse_response(
        task_response: TaskResponse,
        compression: Option<Compression>,
    ) -> Result<QueryResponse, InternalRequestError> {
        let body_with_ext = frame::parse_response_body_extensions(
            task_response.params.flags,
            compression,
            task_response.body,
        )?;

        for warn_description in &body_with_ext.warnings {
            warn!(
                warning = warn_description.as_str(),
                "Response from the database contains a warning",
            );
        }

        let response = Response::deserialize(task_response.opcode, &mut &*body_with_ext.body)?;

        Ok(QueryResponse {
            response,
            warnings: body_with_ext.warnings,
            tracing_id: body_with_ext.trace_id,
        })
    }

    async fn router(
        config: ConnectionConfig,
        stream: impl AsyncRead + AsyncWrite,
        receiver: mpsc::Receiver<Task>,
        error_sender: oneshot::Sender<ConnectionError>,
        orphan_notification_receiver: mpsc::UnboundedReceiver<RequestId>,
        router_handle: Arc<RouterHandle>,
        node_address: SocketAddr,
    ) {
        let (read_half, write_half) = split(stream);
        // Reader, writer and orphaner run on this one task and never hold
        // the lock across an .await, so it is never contended.
        let handler_map = StdMutex::new(ResponseHandlerMap::new(config.max_streams));

        let k = Self::keepaliver(
            router_handle,
            config.keepalive_interval,
            config.keepalive_timeout,
            node_address,
        );

        let r = Self::reader(
            BufReader::with_capacity(8192, read_half),
            &handler_map,
            config.event_sender,
            config.compression,
        );
        let w = Self::writer(
            BufWriter::with_capacity(8192, write_half),
            &handler_map,
            receiver,
        );
        let o = Self::orphaner(&handler_map, orphan_notification_receiver);

        let result = futures::try_join!(r, w, o, k);

        let error: BrokenConnectionError = match result {
            Ok(_) => return, // The connection was dropped.
            Err(err) => err,
        };
        debug!(error = %error, "Connection broken");

        // Every pending request fails with the same error.
        let response_handlers: HashMap<i16, ResponseHandler> = handler_map
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner)
            .into_handlers();

        for (_, handler) in response_handlers {
            // The request may have been dropped meanwhile.
            let _ = handler.response_sender.send(Err(error.clone().into()));
        }

        let _ = error_sender.send(error.into());
    }

    fn lock_handlers(
        handler_map: &StdMutex<ResponseHandlerMap>,
    ) -> MutexGuard<'_, ResponseHandlerMap> {
        handler_map.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn reader(
        mut read_half: impl AsyncRead + Unpin,
        handler_map: &StdMutex<ResponseHandlerMap>,
        event_sender: Option<mpsc::Sender<Event>>,
        compression: Option<Compression>,
    ) -> Result<(), BrokenConnectionError> {
        loop {
            let (params, opcode, body) = frame::read_response_frame(&mut read_half)
                .await
                .map_err(BrokenConnectionErrorKind::FrameError)?;
            let response = TaskResponse {
                params,
                opcode,
                body,
            };

            match params.stream.cmp(&-1) {
                Ordering::Less => {
                    // Negative streams other than -1 are reserved; nothing uses them.
                    continue;
                }
                Ordering::Equal => {
                    if let Some(event_sender) = event_sender.as_ref() {
                        Self::handle_event(response, compression, event_sender)
                            .await
                            .map_err(BrokenConnectionErrorKind::CqlEventHandlingError)?
                    }
                    continue;
                }
                _ => {}
            }

            let handler_lookup_res = Self::lock_handlers(handler_map).lookup(params.stream);

            use HandlerLookupResult::*;
            match handler_lookup_res {
                Handler(handler) => {
                    // The receiver may have given up waiting.
                    let _ = handler.response_sender.send(Ok(response));
                }
                Missing => {
                    debug!(
                        "Received response with unexpected StreamId {}",
                        params.stream
                    );
                    return Err(BrokenConnectionErrorKind::UnexpectedStreamId(params.stream).into());
                }
                Orphaned => {
                    // The requester is gone; the stream id is free again.
                }
            }
        }
    }

    fn alloc_stream_id(
        handler_map: &StdMutex<ResponseHandlerMap>,
        response_handler: ResponseHandler,
    ) -> Option<i16> {
        match Self::lock_handlers(handler_map).allocate(response_handler) {
            Ok(stream_id) => Some(stream_id),
            Err(response_handler) => {
                error!("Could not allocate stream id");
                let _ = response_handler
                    .response_sender
                    .send(Err(InternalRequestError::UnableToAllocStreamId));
                None
            }
        }
    }

    async fn writer(
        mut write_half: impl AsyncWrite + Unpin,
        handler_map: &StdMutex<ResponseHandlerMap>,
        mut task_receiver: mpsc::Receiver<Task>,
    ) -> Result<(), BrokenConnectionError> {
        // Dropping the Connection closes the channel, which ends this loop
        // and with it the whole router.
        while let Some(task) = task_receiver.recv().await {
            let mut num_requests = 0;
            let mut total_sent = 0;
            let mut next = Some(task);
            while let Some(task) = next.take() {
                if let Some(stream_id) = Self::alloc_stream_id(handler_map, task.response_handler) {
                    let mut req = task.serialized_request;
                    req.set_stream(stream_id);
                    let req_data: &[u8] = req.get_data();
                    total_sent += req_data.len();
                    num_requests += 1;
                    write_half
                        .write_all(req_data)
                        .await
                        .map_err(BrokenConnectionErrorKind::WriteError)?;
                }
                next = task_receiver.try_recv().ok();
            }
            trace!("Sending {} requests; {} bytes", num_requests, total_sent);
            write_half
                .flush()
                .await
                .map_err(BrokenConnectionErrorKind::WriteError)?;
        }

        Ok(())
    }

    // Marks the stream ids of abandoned requests as orphaned, and breaks the
    // connection once too many of them are old.
    async fn orphaner(
        handler_map: &StdMutex<ResponseHandlerMap>,
        mut orphan_receiver: mpsc::UnboundedReceiver<RequestId>,
    ) -> Result<(), BrokenConnectionError> {
        let mut interval = tokio::time::interval(OLD_AGE_ORPHAN_THRESHOLD);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let old_orphan_count = Self::lock_handlers(handler_map).old_orphans_count();
                    if old_orphan_count > OLD_ORPHAN_COUNT_THRESHOLD {
                        warn!(
                            "Too many old orphaned stream ids: {}",
                            old_orphan_count,
                        );
                        return Err(BrokenConnectionErrorKind::TooManyOrphanedStreamIds(
                            old_orphan_count.min(u16::MAX as usize) as u16,
                        )
                        .into());
                    }
                }
                Some(request_id) = orphan_receiver.recv() => {
                    trace!(
                        "Trying to orphan stream id associated with request_id = {}",
                        request_id,
                    );
                    Self::lock_handlers(handler_map).orphan(request_id);
                }
                else => { break }
            }
        }

        Ok(())
    }

    async fn keepaliver(
        router_handle: Arc<RouterHandle>,
        keepalive_interval: Option<Duration>,
        keepalive_timeout: Option<Duration>,
        node_address: SocketAddr,
    ) -> Result<(), BrokenConnectionError> {
        async fn issue_keepalive_query(
            router_handle: &RouterHandle,
        ) -> Result<(), BrokenConnectionError> {
            router_handle
                .send_request(&request::Options, None, false, None)
                .await
                .map(|_| ())
                .map_err(|req_err| {
                    BrokenConnectionErrorKind::KeepaliveRequestError(req_err.into()).into()
                })
        }

        let Some(keepalive_interval) = keepalive_interval else {
            return Ok(());
        };

        let mut interval = tokio::time::interval(keepalive_interval);
        interval.tick().await; // The first tick is immediate.

        // The default, Burst, would fire queued keepalives back to back.
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            interval.tick().await;

            let keepalive_query = issue_keepalive_query(&router_handle);
            let query_result = if let Some(timeout) = keepalive_timeout {
                match tokio::time::timeout(timeout, keepalive_query).await {
                    Ok(res) => res,
                    Err(_) => {
                        warn!(
                            "Timed out while waiting for response to keepalive request on connection to node {}",
                            node_address
                        );
                        return Err(BrokenConnectionErrorKind::KeepaliveTimeout {
                            node_address,
                            timeout,
                        }
                        .into());
                    }
                }
            } else {
                keepalive_query.await
            };
            if let Err(err) = query_result {
                warn!(
                    "Failed to execute keepalive request on connection to node {} - {}",
                    node_address, err
                );
                return Err(err);
            }

            trace!(
                "Keepalive request successful on connection to node {}",
                node_address
            );
        }
    }

    async fn handle_event(
        task_response: TaskResponse,
        compression: Option<Compression>,
        event_sender: &mpsc::Sender<Event>,
    ) -> Result<(), CqlEventHandlingError> {
        let response = match Self::parse_response(task_response, compression) {
            Ok(r) => r.response,
            Err(InternalRequestError::FrameError(e)) => return Err(e.into()),
            Err(InternalRequestError::ParseError(e)) => return Err(e.into()),
            Err(_) => return Err(CqlEventHandlingError::UnexpectedResponse("EVENT")),
        };

        let event = match response {
            Response::Event(event) => event,
            other => {
                error!("Expected to receive Event response, got {:?}", other);
                return Err(CqlEventHandlingError::UnexpectedResponse(
                    other.to_response_kind(),
                ));
            }
        };

        event_sender
            .send(event)
            .await
            .map_err(|_| CqlEventHandlingError::SendError)
    }

    pub(crate) fn get_connect_address(&self) -> SocketAddr {
        self.connect_address
    }

    /// Requests sent on this connection and still waiting for a response.
    pub(crate) fn in_flight(&self) -> usize {
        self.in_flight.load(std::sync::atomic::Ordering::Relaxed)
    }

    #[cfg(test)]
    pub(crate) fn compression(&self) -> Option<Compression> {
        self.config.compression
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("connect_address", &self.connect_address)
            .field("in_flight", &self.in_flight())
            .finish_non_exhaustive()
    }
}

/// Opens a connection and runs the OPTIONS/STARTUP handshake, authenticating
/// and registering for events when needed.
pub(crate) async fn open_connection(
    addr: SocketAddr,
    config: &ConnectionConfig,
) -> Result<(Connection, ErrorReceiver), ConnectionError> {
    let (mut connection, error_receiver) = Connection::new(addr, config.clone()).await?;

    let mut supported = connection.get_options().await?;
    let supported_compression = supported
        .options
        .remove(startup::COMPRESSION)
        .unwrap_or_default();

    let mut options = HashMap::new();
    options.insert(
        startup::CQL_VERSION.to_owned(),
        startup::DEFAULT_CQL_PROTOCOL_VERSION.to_owned(),
    );
    options.insert(startup::DRIVER_NAME.to_owned(), DRIVER_NAME.to_owned());
    options.insert(
        startup::DRIVER_VERSION.to_owned(),
        env!("CARGO_PKG_VERSION").to_owned(),
    );

    if let Some(compression) = &config.compression {
        let compression_str = compression.as_str();
        if supported_compression.iter().any(|c| c == compression_str) {
            options.insert(startup::COMPRESSION.to_owned(), compression_str.to_owned());
        } else {
            warn!(
                node = %addr,
                "Requested compression <{}> is not supported by the cluster. Falling back to no compression",
                compression_str
            );
            connection.config.compression = None;
        }
    }

    if let Some(authenticate) = connection.startup(options).await? {
        connection.perform_authenticate(&authenticate).await?;
    }

    if connection.config.event_sender.is_some() {
        let all_event_types = vec![
            EventType::TopologyChange,
            EventType::StatusChange,
            EventType::SchemaChange,
        ];
        connection.register(all_event_types).await?;
    }

    Ok((connection, error_receiver))
}

struct OrphanageTracker {
    orphans: HashMap<i16, Instant>,
    by_orphaning_times: BTreeSet<(Instant, i16)>,
}

impl OrphanageTracker {
    fn new() -> Self {
        Self {
            orphans: HashMap::new(),
            by_orphaning_times: BTreeSet::new(),
        }
    }

    fn insert(&mut self, stream_id: i16) {
        let now = Instant::now();
        self.orphans.insert(stream_id, now);
        self.by_orphaning_times.insert((now, stream_id));
    }

    fn remove(&mut self, stream_id: i16) {
        if let Some(time) = self.orphans.remove(&stream_id) {
            self.by_orphaning_times.remove(&(time, stream_id));
        }
    }

    fn contains(&self, stream_id: i16) -> bool {
        self.orphans.contains_key(&stream_id)
    }

    fn orphans_older_than(&self, age: Duration) -> usize {
        let Some(minimal_age) = Instant::now().checked_sub(age) else {
            return 0;
        };
        // Linear in the number of old orphans only.
        self.by_orphaning_times
            .range(..(minimal_age, i16::MAX))
            .count()
    }
}

struct ResponseHandlerMap {
    stream_set: StreamIdSet,
    handlers: HashMap<i16, ResponseHandler>,

    request_to_stream: HashMap<RequestId, i16>,
    orphanage_tracker: OrphanageTracker,
}

enum HandlerLookupResult {
    Orphaned,
    Handler(ResponseHandler),
    Missing,
}

impl ResponseHandlerMap {
    fn new(max_streams: usize) -> Self {
        Self {
            stream_set: StreamIdSet::new(max_streams),
            handlers: HashMap::new(),
            request_to_stream: HashMap::new(),
            orphanage_tracker: OrphanageTracker::new(),
        }
    }

    fn allocate(&mut self, response_handler: ResponseHandler) -> Result<i16, ResponseHandler> {
        match self.stream_set.allocate() {
            Some(stream_id) => {
                self.request_to_stream
                    .insert(response_handler.request_id, stream_id);
                self.handlers.insert(stream_id, response_handler);
                Ok(stream_id)
            }
            None => Err(response_handler),
        }
    }

    // Moves the stream id of `request_id` to the orphanage and frees its handler.
    fn orphan(&mut self, request_id: RequestId) {
        if let Some(stream_id) = self.request_to_stream.remove(&request_id) {
            debug!(
                "Orphaning stream_id = {} associated with request_id = {}",
                stream_id, request_id
            );
            self.orphanage_tracker.insert(stream_id);
            self.handlers.remove(&stream_id);
        }
    }

    fn old_orphans_count(&self) -> usize {
        self.orphanage_tracker
            .orphans_older_than(OLD_AGE_ORPHAN_THRESHOLD)
    }

    fn lookup(&mut self, stream_id: i16) -> HandlerLookupResult {
        self.stream_set.free(stream_id);

        if self.orphanage_tracker.contains(stream_id) {
            self.orphanage_tracker.remove(stream_id);
            return HandlerLookupResult::Orphaned;
        }

        if let Some(handler) = self.handlers.remove(&stream_id) {
            // Otherwise a late orphan notification could orphan a reused id.
            self.request_to_stream.remove(&handler.request_id);

            HandlerLookupResult::Handler(handler)
        } else {
            HandlerLookupResult::Missing
        }
    }

    fn into_handlers(self) -> HashMap<i16, ResponseHandler> {
        self.handlers
    }
}

/// Bitmap of stream ids in use, `0..max_streams`.
struct StreamIdSet {
    used_bitmap: Box<[u64]>,
    max_streams: usize,
}

impl StreamIdSet {
    fn new(max_streams: usize) -> Self {
        let max_streams = max_streams.clamp(1, MAX_STREAMS);
        let blocks = max_streams.div_ceil(64);
        let mut used_bitmap = vec![0u64; blocks].into_boxed_slice();
        // Ids past the limit in the last block are permanently taken.
        let tail = max_streams % 64;
        if tail != 0 {
            if let Some(last) = used_bitmap.last_mut() {
                *last = !0u64 << tail;
            }
        }
        Self {
            used_bitmap,
            max_streams,
        }
    }

    fn allocate(&mut self) -> Option<i16> {
        for (block_id, block) in self.used_bitmap.iter_mut().enumerate() {
            if *block != !0 {
                let off = block.trailing_ones();
                *block |= 1u64 << off;
                let stream_id = off as i16 + block_id as i16 * 64;
                return Some(stream_id);
            }
        }
        None
    }

    fn free(&mut self, stream_id: i16) {
        if stream_id < 0 || stream_id as usize >= self.max_streams {
            return;
        }
        let block_id = stream_id as usize / 64;
        let off = stream_id as usize % 64;
        self.used_bitmap[block_id] &= !(1 << off);
    }
}

/// A keyspace name that is safe to splice into `USE`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct VerifiedKeyspaceName {
    name: Arc<String>,
    pub(crate) is_case_sensitive: bool,
}

impl VerifiedKeyspaceName {
    pub(crate) fn new(
        keyspace_name: String,
        case_sensitive: bool,
    ) -> Result<Self, BadKeyspaceName> {
        Self::verify_keyspace_name_is_valid(&keyspace_name)?;

        Ok(VerifiedKeyspaceName {
            name: Arc::new(keyspace_name),
            is_case_sensitive: case_sensitive,
        })
    }

    pub(crate) fn as_str(&self) -> &str {
        self.name.as_str()
    }

    // Up to 48 characters, letters, digits and underscores only.
    fn verify_keyspace_name_is_valid(keyspace_name: &str) -> Result<(), BadKeyspaceName> {
        if keyspace_name.is_empty() {
            return Err(BadKeyspaceName::Empty);
        }

        let keyspace_name_len: usize = keyspace_name.chars().count();
        if keyspace_name_len > 48 {
            return Err(BadKeyspaceName::TooLong(
                keyspace_name.to_string(),
                keyspace_name_len,
            ));
        }

        for character in keyspace_name.chars() {
            match character {
                'a'..='z' | 'A'..='Z' | '0'..='9' | '_' => {}
                _ => {
                    return Err(BadKeyspaceName::IllegalCharacter(
                        keyspace_name.to_string(),
                        character,
                    ));
                }
            };
        }

        Ok(())
    }
}
