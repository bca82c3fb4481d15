//! Errors returned by the driver.
//!
//! [`ExecutionError`] is what a caller of [`Session`](crate::client::session::Session)
//! sees. Errors of single attempts ([`RequestAttemptError`]) are what the
//! execution coordinator and the retry policy reason about.

use std::net::SocketAddr;
use std::num::ParseIntError;
use std::sync::Arc;
use std::time::Duration;

use itertools::Itertools;
use thiserror::Error;

pub use corvid_cql::frame::frame_errors::{FrameError, ParseError};
pub use corvid_cql::frame::response::error::{DbError, WriteType};
pub use corvid_cql::frame::value::SerializeValuesError;

use crate::authentication::AuthError;
use crate::routing::partitioner::TokenCalculationError;

/// Error that occurred during request execution.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum ExecutionError {
    /// Every node from the query plan was tried and all of them failed.
    /// Holds one entry per attempted node.
    #[error("No host could serve the request, errors per host: [{}]", display_host_errors(.errors))]
    NoHostAvailable {
        errors: Vec<(SocketAddr, RequestAttemptError)>,
    },

    /// Load balancing policy returned an empty plan.
    #[error("Load balancing policy returned an empty plan")]
    EmptyPlan,

    /// Database sent a response containing an error that was not retried.
    #[error("Database returned an error: {0}, Error message: {1}")]
    DbError(DbError, String),

    /// The whole execution did not finish in time.
    #[error("Request timed out after {0:?}")]
    RequestTimeout(Duration),

    /// Caller passed an invalid request.
    #[error(transparent)]
    BadQuery(#[from] BadQuery),

    /// Selected node's connection pool is in invalid state.
    #[error("No connections in the pool: {0}")]
    ConnectionPoolError(#[from] ConnectionPoolError),

    /// Server answered with a response of an unexpected kind.
    #[error("Received unexpected response from the server: {0}")]
    UnexpectedResponse(&'static str),

    #[error(transparent)]
    MetadataError(#[from] MetadataError),

    #[error(transparent)]
    UseKeyspaceError(#[from] UseKeyspaceError),

    #[error(transparent)]
    SchemaAgreementError(#[from] SchemaAgreementError),

    /// Server response violated the protocol.
    #[error("Protocol error: {0}")]
    ProtocolError(String),

    /// The last attempt failed with an error that has no
    /// more specific variant on this level.
    #[error(transparent)]
    LastAttemptError(RequestAttemptError),
}

fn display_host_errors(errors: &[(SocketAddr, RequestAttemptError)]) -> String {
    errors
        .iter()
        .map(|(addr, err)| format!("{}: {}", addr, err))
        .join(", ")
}

impl From<RequestAttemptError> for ExecutionError {
    fn from(err: RequestAttemptError) -> Self {
        match err {
            RequestAttemptError::DbError(db_error, reason) => {
                ExecutionError::DbError(db_error, reason)
            }
            RequestAttemptError::RequestTimeout(timeout) => ExecutionError::RequestTimeout(timeout),
            RequestAttemptError::ConnectionPoolError(e) => ExecutionError::ConnectionPoolError(e),
            RequestAttemptError::UnexpectedResponse(kind) => {
                ExecutionError::UnexpectedResponse(kind)
            }
            RequestAttemptError::FrameError(e) => ExecutionError::ProtocolError(e.to_string()),
            RequestAttemptError::ParseError(e) => ExecutionError::ProtocolError(e.to_string()),
            other => ExecutionError::LastAttemptError(other),
        }
    }
}

impl From<SerializeValuesError> for ExecutionError {
    fn from(err: SerializeValuesError) -> Self {
        ExecutionError::BadQuery(BadQuery::SerializeValuesError(err))
    }
}

/// Invalid request passed by the caller.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum BadQuery {
    #[error("Serializing values failed: {0}")]
    SerializeValuesError(#[from] SerializeValuesError),

    #[error("Statement expects {expected} bound values, got {got}")]
    ValuesCountMismatch { expected: usize, got: usize },

    #[error("Number of values in a batch ({values}) differs from number of statements ({statements})")]
    BatchValuesCountMismatch { statements: usize, values: usize },

    #[error("Batch contains too many statements: {0}, max is {max}", max = u16::MAX)]
    TooManyQueriesInBatchStatement(usize),

    #[error("Failed to compute the partition key token: {0}")]
    PartitionKeyError(#[from] TokenCalculationError),
}

/// Error of a single request attempt on a single connection.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum RequestAttemptError {
    /// Database sent a response containing some error with a message
    #[error("Database returned an error: {0}, Error message: {1}")]
    DbError(DbError, String),

    #[error(transparent)]
    BrokenConnectionError(#[from] BrokenConnectionError),

    /// No response arrived within the per-request timeout.
    #[error("No response within {0:?}")]
    RequestTimeout(Duration),

    #[error("Unable to allocate stream id")]
    UnableToAllocStreamId,

    #[error("Connection pool error: {0}")]
    ConnectionPoolError(#[from] ConnectionPoolError),

    #[error("Failed to serialize request or read response frame: {0}")]
    FrameError(#[from] FrameError),

    #[error("Failed to deserialize response body: {0}")]
    ParseError(#[from] ParseError),

    #[error("Received unexpected response from the server: {0}")]
    UnexpectedResponse(&'static str),

    /// Re-preparing a statement after `Unprepared` gave a different id.
    #[error(
        "Prepared statement id changed after repreparation; statement: \"{statement}\", expected id: {expected_id:?}, reprepared id: {reprepared_id:?}"
    )]
    RepreparedIdChanged {
        statement: String,
        expected_id: Vec<u8>,
        reprepared_id: Vec<u8>,
    },

    /// Server said a batch contained an unprepared statement the batch does not have.
    #[error("Unprepared statement id {0:?} does not belong to the batch")]
    RepreparedIdMissingInBatch(Vec<u8>),
}

impl RequestAttemptError {
    /// Stream-level failures say nothing about the request itself,
    /// only about the path to the node. They fail over to the next node
    /// without consulting the retry policy.
    pub fn is_stream_level(&self) -> bool {
        matches!(
            self,
            RequestAttemptError::BrokenConnectionError(_)
                | RequestAttemptError::RequestTimeout(_)
                | RequestAttemptError::UnableToAllocStreamId
                | RequestAttemptError::ConnectionPoolError(_)
        )
    }
}

impl From<InternalRequestError> for RequestAttemptError {
    fn from(err: InternalRequestError) -> Self {
        match err {
            InternalRequestError::FrameError(e) => RequestAttemptError::FrameError(e),
            InternalRequestError::ParseError(e) => RequestAttemptError::ParseError(e),
            InternalRequestError::BrokenConnection(e) => {
                RequestAttemptError::BrokenConnectionError(e)
            }
            InternalRequestError::UnableToAllocStreamId => {
                RequestAttemptError::UnableToAllocStreamId
            }
            InternalRequestError::RequestTimeout(d) => RequestAttemptError::RequestTimeout(d),
        }
    }
}

/// Failure of a raw request/response exchange on a connection,
/// before the response is interpreted.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum InternalRequestError {
    #[error(transparent)]
    FrameError(#[from] FrameError),

    #[error(transparent)]
    ParseError(#[from] ParseError),

    #[error(transparent)]
    BrokenConnection(#[from] BrokenConnectionError),

    #[error("Unable to allocate stream id")]
    UnableToAllocStreamId,

    #[error("No response within {0:?}")]
    RequestTimeout(Duration),
}

/// Error that occurred while opening a connection.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum ConnectionError {
    #[error("Connect timeout elapsed")]
    ConnectTimeout,

    #[error(transparent)]
    IoError(Arc<std::io::Error>),

    #[error(transparent)]
    BrokenConnection(#[from] BrokenConnectionError),

    #[error(transparent)]
    ConnectionSetupRequestError(#[from] ConnectionSetupRequestError),
}

impl From<std::io::Error> for ConnectionError {
    fn from(err: std::io::Error) -> Self {
        ConnectionError::IoError(Arc::new(err))
    }
}

/// A request made while setting up a connection failed.
#[derive(Error, Debug, Clone)]
#[error("Failed to perform a connection setup request. Request: {request}, reason: {error}")]
pub struct ConnectionSetupRequestError {
    request: &'static str,
    error: ConnectionSetupRequestErrorKind,
}

impl ConnectionSetupRequestError {
    pub(crate) fn new(request: &'static str, error: ConnectionSetupRequestErrorKind) -> Self {
        ConnectionSetupRequestError { request, error }
    }

    pub fn request(&self) -> &'static str {
        self.request
    }

    pub fn error(&self) -> &ConnectionSetupRequestErrorKind {
        &self.error
    }
}

#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum ConnectionSetupRequestErrorKind {
    #[error(transparent)]
    InternalRequestError(#[from] InternalRequestError),

    #[error("Database returned an error: {0}, Error message: {1}")]
    DbError(DbError, String),

    #[error("Received unexpected response from the server: {0}")]
    UnexpectedResponse(&'static str),

    #[error("Server requested authentication, but no authenticator was configured")]
    MissingAuthentication,

    #[error("Failed to start client's auth session: {0}")]
    StartAuthSessionError(AuthError),

    #[error("Failed to evaluate auth challenge on client side: {0}")]
    AuthChallengeEvaluationError(AuthError),

    #[error("Failed to finish auth challenge on client side: {0}")]
    AuthFinishError(AuthError),
}

/// The connection router failed; every pending and future request on it
/// fails with this error.
#[derive(Error, Debug, Clone)]
#[error("Connection broken, reason: {0}")]
pub struct BrokenConnectionError(Arc<dyn std::error::Error + Sync + Send>);

impl BrokenConnectionError {
    pub fn downcast_ref<T: std::error::Error + 'static>(&self) -> Option<&T> {
        self.0.downcast_ref()
    }
}

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum BrokenConnectionErrorKind {
    #[error("Failed to read or parse a frame: {0}")]
    FrameError(FrameError),

    #[error("Failed to handle server event: {0}")]
    CqlEventHandlingError(#[from] CqlEventHandlingError),

    #[error("Received a server frame with unexpected stream id: {0}")]
    UnexpectedStreamId(i16),

    #[error("Failed writing to socket: {0}")]
    WriteError(std::io::Error),

    #[error("Too many orphaned stream ids: {0}")]
    TooManyOrphanedStreamIds(u16),

    #[error("Keepalive request failed: {0}")]
    KeepaliveRequestError(RequestAttemptError),

    #[error("Timed out waiting {timeout:?} for keepalive response from {node_address}")]
    KeepaliveTimeout {
        node_address: SocketAddr,
        timeout: Duration,
    },

    #[error("Connection task queue closed; the connection was already broken")]
    ChannelError,
}

impl From<BrokenConnectionErrorKind> for BrokenConnectionError {
    fn from(kind: BrokenConnectionErrorKind) -> Self {
        BrokenConnectionError(Arc::new(kind))
    }
}

/// Failed to handle a frame with stream id -1.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum CqlEventHandlingError {
    #[error("Failed to parse event body: {0}")]
    ParseError(#[from] ParseError),

    #[error("Failed to strip event body extensions: {0}")]
    BodyExtensionParseError(#[from] FrameError),

    #[error("Expected EVENT on stream -1, got {0}")]
    UnexpectedResponse(&'static str),

    #[error("Event receiver dropped")]
    SendError,
}

/// Pool of a node cannot provide a connection.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum ConnectionPoolError {
    /// All connections of the pool are broken, and reconnecting failed.
    #[error("The pool is broken; last connection failed with: {last_connection_error}")]
    Broken {
        last_connection_error: ConnectionError,
    },

    /// The pool has not opened its first connection yet.
    #[error("Pool is still being initialized")]
    Initializing,

    /// The load balancing policy marked the node as ignored, so it has no pool.
    #[error("The node is ignored by the load balancing policy")]
    NodeIgnored,

    /// Every connection is saturated and the pool is at its max size.
    #[error("All connections to the node are busy")]
    NoConnectionsAvailable,
}

/// Error of fetching cluster metadata over the control connection.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum MetadataError {
    #[error("Control connection pool error: {0}")]
    ConnectionPoolError(#[from] ConnectionPoolError),

    #[error("Metadata request failed: {0}")]
    RequestError(#[from] RequestAttemptError),

    #[error("Bad peers metadata: {0}")]
    Peers(#[from] PeersMetadataError),

    #[error("Bad keyspaces metadata: {0}")]
    Keyspaces(#[from] KeyspacesMetadataError),
}

#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum PeersMetadataError {
    #[error("Peers list is empty")]
    EmptyPeers,

    #[error("Metadata query returned no rows")]
    NotRows,

    #[error("Column {0} missing or of wrong type")]
    BadColumn(&'static str),

    #[error("Token {0} is not a valid Murmur3 token")]
    BadToken(String),
}

#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum KeyspacesMetadataError {
    #[error("Keyspace {keyspace}: replication options lack the 'class' key")]
    MissingStrategyClass { keyspace: String },

    #[error("Keyspace {keyspace}: invalid replication factor {value:?}: {error}")]
    BadReplicationFactor {
        keyspace: String,
        value: String,
        error: ParseIntError,
    },

    #[error("Column {0} missing or of wrong type")]
    BadColumn(&'static str),
}

/// Invalid keyspace name given to `use_keyspace`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum BadKeyspaceName {
    #[error("Keyspace name is empty")]
    Empty,

    #[error("Keyspace name too long, must be up to 48 characters, found {1} characters. Bad keyspace name: '{0}'")]
    TooLong(String, usize),

    #[error("Illegal character found: '{1}', only alphanumeric and underscores allowed. Bad keyspace name: '{0}'")]
    IllegalCharacter(String, char),
}

/// Error of switching the session to another keyspace.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum UseKeyspaceError {
    #[error(transparent)]
    BadKeyspaceName(#[from] BadKeyspaceName),

    #[error("Request of USE KEYSPACE failed: {0}")]
    RequestError(#[from] RequestAttemptError),

    #[error("Keyspace name mismatch; expected: {expected_keyspace_name_lowercase}, received: {result_keyspace_name_lowercase}")]
    KeyspaceNameMismatch {
        expected_keyspace_name_lowercase: String,
        result_keyspace_name_lowercase: String,
    },

    #[error("USE KEYSPACE did not finish within {0:?}")]
    RequestTimeout(Duration),
}

/// Error of fetching schema versions.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum SchemaAgreementError {
    #[error("Failed to get a connection: {0}")]
    ConnectionPoolError(#[from] ConnectionPoolError),

    #[error("Failed to fetch schema version: {0}")]
    RequestError(#[from] RequestAttemptError),

    #[error("schema_version is missing or is not a uuid")]
    BadSchemaVersion,

    #[error("No up node to check schema agreement on")]
    NoUpNodes,
}

/// Error of building a session.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum NewSessionError {
    #[error("Couldn't resolve any hostname: {0:?}")]
    FailedToResolveAnyHostname(Vec<String>),

    #[error("Empty known nodes list")]
    EmptyKnownNodesList,

    #[error("Failed to open control connection to any known node: {0}")]
    ControlConnectionError(#[from] ConnectionError),

    #[error(transparent)]
    MetadataError(#[from] MetadataError),

    #[error(transparent)]
    UseKeyspaceError(#[from] UseKeyspaceError),
}
