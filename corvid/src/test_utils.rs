//! Fixtures shared by unit tests: a fixed seven node ring and an in-process
//! CQL server that answers whatever its handler tells it to.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use corvid_cql::frame::request::startup;
use corvid_cql::frame::request::{Request, RequestOpcode};
use corvid_cql::frame::response::error::{DbError, Error};
use corvid_cql::frame::response::event::Event;
use corvid_cql::frame::response::result::{
    self, ColumnSpec, ColumnType, CqlValue, PreparedMetadata, ResultMetadata, Row, Rows,
    TableSpec,
};
use corvid_cql::frame::response::ResponseOpcode;
use corvid_cql::frame::{self, types, Compression, FrameHeader, FLAG_COMPRESSION};
use futures::future::RemoteHandle;
use futures::FutureExt;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::cluster::node::Node;
use crate::routing::Token;

pub(crate) fn setup_tracing() {
    let _ = tracing_subscriber::fmt::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(tracing_subscriber::fmt::TestWriter::new())
        .try_init();
}

// Ids of the mock nodes; each doubles as the node's port.
pub(crate) const A: u16 = 1;
pub(crate) const B: u16 = 2;
pub(crate) const C: u16 = 3;
pub(crate) const D: u16 = 4;
pub(crate) const E: u16 = 5;
pub(crate) const F: u16 = 6;
pub(crate) const G: u16 = 7;

/// Seven nodes in two datacenters:
///
/// ```text
/// eu: A(r1) 50 250 400   B(r1) 100 600 900   C(r1) 300 650 700   G(r2) 500 800
/// us: D(r1) 350 550      E(r1) 150 750       F(r2) 200 450
/// ```
pub(crate) fn mock_nodes() -> Vec<Arc<Node>> {
    let layout: [(u16, &str, &str, &[i64]); 7] = [
        (A, "eu", "r1", &[50, 250, 400]),
        (B, "eu", "r1", &[100, 600, 900]),
        (C, "eu", "r1", &[300, 650, 700]),
        (D, "us", "r1", &[350, 550]),
        (E, "us", "r1", &[150, 750]),
        (F, "us", "r2", &[200, 450]),
        (G, "eu", "r2", &[500, 800]),
    ];

    layout
        .iter()
        .map(|(id, dc, rack, tokens)| {
            Arc::new(Node::new_for_test(
                Some(id_to_host_id(*id)),
                id_to_address(*id),
                Some(dc.to_string()),
                Some(rack.to_string()),
                tokens.iter().map(|t| Token::new(*t)).collect(),
            ))
        })
        .collect()
}

/// Every (token, owner) pair of [`mock_nodes`].
pub(crate) fn mock_ring() -> Vec<(Token, Arc<Node>)> {
    mock_nodes()
        .into_iter()
        .flat_map(|node| {
            let tokens = node.tokens();
            tokens
                .iter()
                .map(|token| (*token, node.clone()))
                .collect::<Vec<_>>()
        })
        .collect()
}

pub(crate) fn id_to_address(id: u16) -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::BROADCAST), id)
}

pub(crate) fn id_to_host_id(id: u16) -> Uuid {
    Uuid::from_u128(id as u128)
}

/// A request as seen by the mock server.
#[derive(Debug)]
pub(crate) struct MockRequest {
    pub(crate) connection_id: usize,
    pub(crate) stream: i16,
    pub(crate) request: Request,
}

impl MockRequest {
    /// Text of a QUERY, or of a PREPARE.
    pub(crate) fn query_text(&self) -> Option<&str> {
        match &self.request {
            Request::Query(query) => Some(query.contents.as_ref()),
            Request::Prepare(text) => Some(text.as_str()),
            _ => None,
        }
    }

    pub(crate) fn is_query(&self, text: &str) -> bool {
        matches!(&self.request, Request::Query(query) if query.contents == text)
    }
}

/// Body of a response frame; the stream id is filled in when it is sent.
#[derive(Debug, Clone)]
pub(crate) struct MockResponse {
    opcode: ResponseOpcode,
    body: Vec<u8>,
}

impl MockResponse {
    pub(crate) fn ready() -> Self {
        Self {
            opcode: ResponseOpcode::Ready,
            body: Vec::new(),
        }
    }

    pub(crate) fn supported(options: &[(&str, &[&str])]) -> Self {
        let options: HashMap<String, Vec<String>> = options
            .iter()
            .map(|(key, values)| {
                (
                    key.to_string(),
                    values.iter().map(|v| v.to_string()).collect(),
                )
            })
            .collect();
        let mut body = Vec::new();
        types::write_string_multimap(&options, &mut body).unwrap();
        Self {
            opcode: ResponseOpcode::Supported,
            body,
        }
    }

    pub(crate) fn error(error: DbError, reason: &str) -> Self {
        let mut body = Vec::new();
        Error {
            error,
            reason: reason.to_owned(),
        }
        .serialize(&mut body)
        .unwrap();
        Self {
            opcode: ResponseOpcode::Error,
            body,
        }
    }

    pub(crate) fn result(result: &result::Result) -> Self {
        let mut body = Vec::new();
        result.serialize(&mut body).unwrap();
        Self {
            opcode: ResponseOpcode::Result,
            body,
        }
    }

    pub(crate) fn void() -> Self {
        Self::result(&result::Result::Void)
    }

    pub(crate) fn set_keyspace(keyspace_name: &str) -> Self {
        Self::result(&result::Result::SetKeyspace(result::SetKeyspace {
            keyspace_name: keyspace_name.to_owned(),
        }))
    }

    pub(crate) fn prepared(id: &[u8]) -> Self {
        Self::result(&result::Result::Prepared(result::Prepared {
            id: id.to_vec().into(),
            prepared_metadata: PreparedMetadata::default(),
            result_metadata: ResultMetadata::default(),
        }))
    }

    pub(crate) fn rows(columns: &[(&str, ColumnType)], rows: Vec<Vec<Option<CqlValue>>>) -> Self {
        Self::result(&rows_result(columns, rows))
    }

    pub(crate) fn authenticate(authenticator_name: &str) -> Self {
        let mut body = Vec::new();
        types::write_string(authenticator_name, &mut body).unwrap();
        Self {
            opcode: ResponseOpcode::Authenticate,
            body,
        }
    }

    pub(crate) fn auth_challenge(token: Option<&[u8]>) -> Self {
        let mut body = Vec::new();
        types::write_bytes_opt(token, &mut body).unwrap();
        Self {
            opcode: ResponseOpcode::AuthChallenge,
            body,
        }
    }

    pub(crate) fn auth_success(token: Option<&[u8]>) -> Self {
        let mut body = Vec::new();
        types::write_bytes_opt(token, &mut body).unwrap();
        Self {
            opcode: ResponseOpcode::AuthSuccess,
            body,
        }
    }

    pub(crate) fn event(event: &Event) -> Self {
        let mut body = Vec::new();
        event.serialize(&mut body).unwrap();
        Self {
            opcode: ResponseOpcode::Event,
            body,
        }
    }

    fn encode(&self, stream: i16) -> Vec<u8> {
        let header = FrameHeader {
            version: frame::PROTOCOL_VERSION | 0x80,
            flags: 0,
            stream,
            opcode: self.opcode as u8,
            length: self.body.len() as u32,
        };
        let mut data = header.encode().to_vec();
        data.extend_from_slice(&self.body);
        data
    }
}

pub(crate) fn rows_result(
    columns: &[(&str, ColumnType)],
    rows: Vec<Vec<Option<CqlValue>>>,
) -> result::Result {
    let col_specs: Vec<ColumnSpec> = columns
        .iter()
        .map(|(name, typ)| ColumnSpec {
            table_spec: TableSpec {
                ks_name: "system".to_owned(),
                table_name: "mock".to_owned(),
            },
            name: name.to_string(),
            typ: typ.clone(),
        })
        .collect();
    result::Result::Rows(Rows {
        metadata: ResultMetadata {
            col_count: col_specs.len(),
            col_specs,
        },
        paging_state: None,
        rows_count: rows.len(),
        rows: rows.into_iter().map(|columns| Row { columns }).collect(),
    })
}

/// What the mock server does with a request.
#[derive(Debug)]
pub(crate) enum Reply {
    Respond(MockResponse),
    Delayed(Duration, MockResponse),
    /// Never answer.
    Ignore,
    /// Drop the connection without answering.
    Close,
}

/// Answers for the connection handshake: OPTIONS, STARTUP and REGISTER.
pub(crate) fn handshake_reply(request: &MockRequest) -> Option<Reply> {
    match &request.request {
        Request::Options => Some(Reply::Respond(MockResponse::supported(&[(
            startup::COMPRESSION,
            &["lz4", "snappy"],
        )]))),
        Request::Startup(_) | Request::Register(_) => Some(Reply::Respond(MockResponse::ready())),
        _ => None,
    }
}

type Handler = Arc<dyn Fn(&MockRequest) -> Reply + Send + Sync>;

enum Outgoing {
    Frame(Vec<u8>),
    Close,
}

struct MockConnection {
    outgoing: mpsc::UnboundedSender<Outgoing>,
    registered: Arc<AtomicBool>,
}

/// A CQL server on a local port, driven by a handler closure.
///
/// Dropping it stops accepting and closes every open connection.
pub(crate) struct MockServer {
    addr: SocketAddr,
    connections: Arc<Mutex<Vec<MockConnection>>>,
    connection_count: Arc<AtomicUsize>,
    open_connections: Arc<AtomicUsize>,
    _acceptor: RemoteHandle<()>,
}

impl MockServer {
    pub(crate) async fn start(handler: impl Fn(&MockRequest) -> Reply + Send + Sync + 'static) -> Self {
        Self::start_at("127.0.0.1:0".parse().unwrap(), Arc::new(handler))
            .await
            .unwrap()
    }

    async fn start_at(addr: SocketAddr, handler: Handler) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let addr = listener.local_addr()?;
        let connections: Arc<Mutex<Vec<MockConnection>>> = Arc::default();
        let connection_count = Arc::new(AtomicUsize::new(0));
        let open_connections = Arc::new(AtomicUsize::new(0));

        let acceptor = {
            let connections = connections.clone();
            let connection_count = connection_count.clone();
            let open_connections = open_connections.clone();
            async move {
                while let Ok((stream, _)) = listener.accept().await {
                    let connection_id = connection_count.fetch_add(1, Ordering::SeqCst);
                    open_connections.fetch_add(1, Ordering::SeqCst);
                    let (outgoing, receiver) = mpsc::unbounded_channel();
                    let registered = Arc::new(AtomicBool::new(false));
                    connections.lock().unwrap().push(MockConnection {
                        outgoing: outgoing.clone(),
                        registered: registered.clone(),
                    });
                    let served = serve_connection(
                        connection_id,
                        stream,
                        handler.clone(),
                        outgoing,
                        receiver,
                        registered,
                    );
                    let open_connections = open_connections.clone();
                    tokio::spawn(async move {
                        served.await;
                        open_connections.fetch_sub(1, Ordering::SeqCst);
                    });
                }
            }
        };
        let (acceptor, handle) = acceptor.remote_handle();
        tokio::spawn(acceptor);

        Ok(Self {
            addr,
            connections,
            connection_count,
            open_connections,
            _acceptor: handle,
        })
    }

    pub(crate) fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Connections accepted so far, closed ones included.
    pub(crate) fn connection_count(&self) -> usize {
        self.connection_count.load(Ordering::SeqCst)
    }

    /// Connections the client has not closed yet.
    pub(crate) fn open_connections(&self) -> usize {
        self.open_connections.load(Ordering::SeqCst)
    }

    /// Sends `event` to every connection that sent REGISTER.
    pub(crate) fn push_event(&self, event: &Event) {
        let data = MockResponse::event(event).encode(-1);
        for connection in self.connections.lock().unwrap().iter() {
            if connection.registered.load(Ordering::SeqCst) {
                let _ = connection.outgoing.send(Outgoing::Frame(data.clone()));
            }
        }
    }

    pub(crate) fn close_connections(&self) {
        for connection in self.connections.lock().unwrap().drain(..) {
            let _ = connection.outgoing.send(Outgoing::Close);
        }
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.close_connections();
    }
}

async fn serve_connection(
    connection_id: usize,
    stream: TcpStream,
    handler: Handler,
    outgoing: mpsc::UnboundedSender<Outgoing>,
    mut receiver: mpsc::UnboundedReceiver<Outgoing>,
    registered: Arc<AtomicBool>,
) {
    let (mut read_half, mut write_half) = stream.into_split();

    tokio::spawn(async move {
        while let Some(item) = receiver.recv().await {
            match item {
                Outgoing::Frame(data) => {
                    if write_half.write_all(&data).await.is_err() {
                        break;
                    }
                }
                Outgoing::Close => break,
            }
        }
    });

    let mut compression: Option<Compression> = None;
    loop {
        let Ok((params, opcode, body)) = frame::read_request_frame(&mut read_half).await else {
            break;
        };
        let body = match (params.flags & FLAG_COMPRESSION != 0, compression) {
            (true, Some(compression)) => match frame::decompress(&body, compression) {
                Ok(body) => body,
                Err(_) => break,
            },
            _ => body.to_vec(),
        };
        let Some(request) = RequestOpcode::try_from(opcode)
            .ok()
            .and_then(|opcode| Request::deserialize(opcode, &mut &body[..]).ok())
        else {
            break;
        };

        match &request {
            Request::Startup(startup) => {
                compression = match startup.options.get(startup::COMPRESSION).map(String::as_str) {
                    Some("lz4") => Some(Compression::Lz4),
                    Some("snappy") => Some(Compression::Snappy),
                    _ => None,
                };
            }
            Request::Register(_) => registered.store(true, Ordering::SeqCst),
            _ => {}
        }

        let request = MockRequest {
            connection_id,
            stream: params.stream,
            request,
        };
        match handler(&request) {
            Reply::Respond(response) => {
                let _ = outgoing.send(Outgoing::Frame(response.encode(params.stream)));
            }
            Reply::Delayed(delay, response) => {
                let outgoing = outgoing.clone();
                let stream = params.stream;
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = outgoing.send(Outgoing::Frame(response.encode(stream)));
                });
            }
            Reply::Ignore => {}
            Reply::Close => {
                let _ = outgoing.send(Outgoing::Close);
                break;
            }
        }
    }
}

/// One node of a [`MockCluster`], as described by its system tables.
#[derive(Debug, Clone)]
pub(crate) struct MockNodeInfo {
    pub(crate) address: SocketAddr,
    pub(crate) host_id: Uuid,
    pub(crate) datacenter: String,
    pub(crate) rack: String,
    pub(crate) tokens: Vec<i64>,
}

/// Shared, mutable view of the cluster the mock nodes report.
#[derive(Debug)]
pub(crate) struct MockTopology {
    pub(crate) nodes: Mutex<Vec<MockNodeInfo>>,
    pub(crate) keyspaces: Mutex<Vec<(String, Vec<(String, String)>)>>,
    pub(crate) schema_versions: Mutex<Vec<Uuid>>,
}

impl MockTopology {
    /// Answers the metadata queries node `index` receives.
    pub(crate) fn metadata_reply(&self, index: usize, request: &MockRequest) -> Option<Reply> {
        let Request::Query(query) = &request.request else {
            return None;
        };
        let text = query.contents.as_ref();

        let response = if text.contains("schema_version") && text.contains("system.local") {
            let version = self.schema_versions.lock().unwrap()[index];
            MockResponse::rows(
                &[("schema_version", ColumnType::Uuid)],
                vec![vec![Some(CqlValue::Uuid(version))]],
            )
        } else if text.contains("system.local") {
            let nodes = self.nodes.lock().unwrap();
            MockResponse::rows(&peer_columns(), vec![peer_row(&nodes[index])])
        } else if text.contains("system.peers") {
            let nodes = self.nodes.lock().unwrap();
            let rows = nodes
                .iter()
                .enumerate()
                .filter(|(i, _)| *i != index)
                .map(|(_, node)| peer_row(node))
                .collect();
            MockResponse::rows(&peer_columns(), rows)
        } else if text.contains("system_schema.keyspaces") {
            let keyspaces = self.keyspaces.lock().unwrap();
            let rows = keyspaces
                .iter()
                .map(|(name, replication)| {
                    vec![
                        Some(CqlValue::Text(name.clone())),
                        Some(CqlValue::Map(
                            replication
                                .iter()
                                .map(|(k, v)| (CqlValue::Text(k.clone()), CqlValue::Text(v.clone())))
                                .collect(),
                        )),
                    ]
                })
                .collect();
            MockResponse::rows(
                &[
                    ("keyspace_name", ColumnType::Text),
                    (
                        "replication",
                        ColumnType::Map(Box::new(ColumnType::Text), Box::new(ColumnType::Text)),
                    ),
                ],
                rows,
            )
        } else {
            return None;
        };

        Some(Reply::Respond(response))
    }
}

fn peer_columns() -> Vec<(&'static str, ColumnType)> {
    vec![
        ("host_id", ColumnType::Uuid),
        ("rpc_address", ColumnType::Inet),
        ("data_center", ColumnType::Text),
        ("rack", ColumnType::Text),
        ("tokens", ColumnType::Set(Box::new(ColumnType::Text))),
    ]
}

fn peer_row(node: &MockNodeInfo) -> Vec<Option<CqlValue>> {
    vec![
        Some(CqlValue::Uuid(node.host_id)),
        Some(CqlValue::Inet(node.address.ip())),
        Some(CqlValue::Text(node.datacenter.clone())),
        Some(CqlValue::Text(node.rack.clone())),
        Some(CqlValue::Set(
            node.tokens
                .iter()
                .map(|t| CqlValue::Text(t.to_string()))
                .collect(),
        )),
    ]
}

/// Mock nodes on 127.0.0.1, 127.0.0.2, ... sharing one port, each
/// answering the metadata queries from a shared [`MockTopology`].
pub(crate) struct MockCluster {
    pub(crate) servers: Vec<Option<MockServer>>,
    pub(crate) topology: Arc<MockTopology>,
    handler: Arc<dyn Fn(usize, &MockRequest) -> Option<Reply> + Send + Sync>,
}

impl MockCluster {
    /// `handler` sees every request first, with the index of the node it
    /// was sent to; `None` falls back to the default answers.
    pub(crate) async fn start(
        node_count: usize,
        handler: impl Fn(usize, &MockRequest) -> Option<Reply> + Send + Sync + 'static,
    ) -> Self {
        let handler: Arc<dyn Fn(usize, &MockRequest) -> Option<Reply> + Send + Sync> =
            Arc::new(handler);

        // The shared port may be taken on some of the addresses; try another.
        for _ in 0..16 {
            let free_port = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let port = free_port.local_addr().unwrap().port();
            drop(free_port);

            let nodes: Vec<MockNodeInfo> = (0..node_count)
                .map(|i| MockNodeInfo {
                    address: SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, i as u8 + 1)), port),
                    host_id: Uuid::from_u128(i as u128 + 1),
                    datacenter: "dc1".to_owned(),
                    rack: "r1".to_owned(),
                    tokens: vec![(i as i64 - 1) * (i64::MAX / node_count as i64)],
                })
                .collect();
            let topology = Arc::new(MockTopology {
                nodes: Mutex::new(nodes.clone()),
                keyspaces: Mutex::new(vec![(
                    "ks".to_owned(),
                    vec![
                        (
                            "class".to_owned(),
                            "org.apache.cassandra.locator.SimpleStrategy".to_owned(),
                        ),
                        ("replication_factor".to_owned(), "1".to_owned()),
                    ],
                )]),
                schema_versions: Mutex::new(vec![Uuid::from_u128(42); node_count]),
            });

            let mut cluster = MockCluster {
                servers: Vec::with_capacity(node_count),
                topology,
                handler: handler.clone(),
            };
            let mut all_bound = true;
            for index in 0..node_count {
                match cluster.bind_node(index).await {
                    Ok(server) => cluster.servers.push(Some(server)),
                    Err(_) => {
                        all_bound = false;
                        break;
                    }
                }
            }
            if all_bound {
                return cluster;
            }
        }
        panic!("Could not bind mock cluster addresses");
    }

    async fn bind_node(&self, index: usize) -> std::io::Result<MockServer> {
        let address = self.topology.nodes.lock().unwrap()[index].address;
        let topology = self.topology.clone();
        let handler = self.handler.clone();
        MockServer::start_at(
            address,
            Arc::new(move |request: &MockRequest| {
                handler(index, request)
                    .or_else(|| handshake_reply(request))
                    .or_else(|| topology.metadata_reply(index, request))
                    .unwrap_or(Reply::Respond(MockResponse::void()))
            }),
        )
        .await
    }

    pub(crate) fn address(&self, index: usize) -> SocketAddr {
        self.topology.nodes.lock().unwrap()[index].address
    }

    pub(crate) fn addresses(&self) -> Vec<SocketAddr> {
        (0..self.servers.len()).map(|i| self.address(i)).collect()
    }

    /// Stops node `index`: open connections are closed and new ones refused.
    pub(crate) fn kill(&mut self, index: usize) {
        self.servers[index] = None;
    }

    /// Starts node `index` again on its old address.
    pub(crate) async fn restart(&mut self, index: usize) {
        let server = self.bind_node(index).await.unwrap();
        self.servers[index] = Some(server);
    }

    pub(crate) fn server(&self, index: usize) -> &MockServer {
        self.servers[index].as_ref().unwrap()
    }
}
