//! An in-process node speaking the native protocol, used by the unit tests.
//!
//! It understands OPTIONS, STARTUP, AUTH_RESPONSE, REGISTER and QUERY,
//! answers `system.local`/`system.peers` from its config and lets a test
//! override the answer to any statement.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use bytes::BufMut;
use cassie_cql::frame::request::{Request, RequestOpcode};
use cassie_cql::frame::response::ResponseOpcode;
use cassie_cql::frame::{
    decompress, encode_frame, types, Compression, FrameDecoder, FrameDirection, FrameParams,
    ProtocolVersion, RawFrame, EVENT_STREAM_ID, FLAG_COMPRESSION,
};
use futures::future::RemoteHandle;
use futures::FutureExt;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::cluster::token_map::MURMUR3_PARTITIONER;

pub(crate) fn setup_tracing() {
    let _ = tracing_subscriber::fmt::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(tracing_subscriber::fmt::TestWriter::new())
        .try_init();
}

pub(crate) const PASSWORD_AUTHENTICATOR: &str = "org.apache.cassandra.auth.PasswordAuthenticator";

/// A cell of a mocked row.
#[derive(Debug, Clone)]
pub(crate) enum MockValue {
    Text(String),
    Inet(IpAddr),
    Uuid(Uuid),
    Boolean(bool),
    Int(i32),
    TextSet(Vec<String>),
    TextList(Vec<String>),
    TextMap(Vec<(String, String)>),
    /// A null text cell.
    Null,
}

impl MockValue {
    pub(crate) fn text(s: impl Into<String>) -> Self {
        MockValue::Text(s.into())
    }

    fn write_type(&self, buf: &mut Vec<u8>) {
        const TEXT: u16 = 0x000D;
        match self {
            MockValue::Text(_) | MockValue::Null => buf.put_u16(TEXT),
            MockValue::Inet(_) => buf.put_u16(0x0010),
            MockValue::Uuid(_) => buf.put_u16(0x000C),
            MockValue::Boolean(_) => buf.put_u16(0x0004),
            MockValue::Int(_) => buf.put_u16(0x0009),
            MockValue::TextSet(_) => {
                buf.put_u16(0x0022);
                buf.put_u16(TEXT);
            }
            MockValue::TextList(_) => {
                buf.put_u16(0x0020);
                buf.put_u16(TEXT);
            }
            MockValue::TextMap(_) => {
                buf.put_u16(0x0021);
                buf.put_u16(TEXT);
                buf.put_u16(TEXT);
            }
        }
    }

    fn write_cell(&self, version: ProtocolVersion, buf: &mut Vec<u8>) {
        let cell: Vec<u8> = match self {
            MockValue::Null => {
                types::write_int(-1, buf);
                return;
            }
            MockValue::Text(s) => s.as_bytes().to_vec(),
            MockValue::Inet(IpAddr::V4(ip)) => ip.octets().to_vec(),
            MockValue::Inet(IpAddr::V6(ip)) => ip.octets().to_vec(),
            MockValue::Uuid(uuid) => uuid.as_bytes().to_vec(),
            MockValue::Boolean(b) => vec![*b as u8],
            MockValue::Int(i) => i.to_be_bytes().to_vec(),
            MockValue::TextSet(elems) | MockValue::TextList(elems) => {
                let mut collection = Vec::new();
                write_collection_len(version, elems.len(), &mut collection);
                for elem in elems {
                    write_collection_elem(version, elem.as_bytes(), &mut collection);
                }
                collection
            }
            MockValue::TextMap(pairs) => {
                let mut collection = Vec::new();
                write_collection_len(version, pairs.len(), &mut collection);
                for (key, value) in pairs {
                    write_collection_elem(version, key.as_bytes(), &mut collection);
                    write_collection_elem(version, value.as_bytes(), &mut collection);
                }
                collection
            }
        };
        types::write_bytes(&cell, buf).unwrap();
    }
}

fn write_collection_len(version: ProtocolVersion, len: usize, buf: &mut Vec<u8>) {
    if version.uses_two_byte_stream_ids() {
        types::write_int(len as i32, buf);
    } else {
        types::write_short(len as u16, buf);
    }
}

fn write_collection_elem(version: ProtocolVersion, elem: &[u8], buf: &mut Vec<u8>) {
    if version.uses_two_byte_stream_ids() {
        types::write_bytes(elem, buf).unwrap();
    } else {
        types::write_short_bytes(elem, buf).unwrap();
    }
}

/// One row: column names with their values.
pub(crate) type Columns = Vec<(&'static str, MockValue)>;

/// How the node answers a statement.
#[derive(Debug, Clone)]
pub(crate) enum MockReply {
    Void,
    Rows(Vec<Columns>),
    SetKeyspace(String),
    Error(i32, String),
    NoReply,
    Delayed(Duration, Box<MockReply>),
}

pub(crate) type QueryHandler = Arc<dyn Fn(&str) -> Option<MockReply> + Send + Sync>;

/// An event to push to the connections that REGISTERed.
#[derive(Debug, Clone)]
pub(crate) enum MockEvent {
    NewNode(SocketAddr),
    RemovedNode(SocketAddr),
    Up(SocketAddr),
    Down(SocketAddr),
    SchemaChange {
        change: &'static str,
        target: &'static str,
        keyspace: String,
        name: Option<String>,
        arguments: Vec<String>,
    },
}

#[derive(Clone)]
pub(crate) struct MockNodeConfig {
    pub(crate) max_version: ProtocolVersion,
    pub(crate) credentials: Option<(String, String)>,
    pub(crate) release_version: String,
    pub(crate) datacenter: String,
    pub(crate) host_id: Uuid,
    pub(crate) tokens: Vec<String>,
    /// Defaults to the address the node listens on.
    pub(crate) rpc_address: Option<IpAddr>,
    pub(crate) peers: Vec<Columns>,
    pub(crate) handler: Option<QueryHandler>,
}

impl Default for MockNodeConfig {
    fn default() -> Self {
        Self {
            max_version: ProtocolVersion::V4,
            credentials: None,
            release_version: "3.11.4".to_string(),
            datacenter: "dc1".to_string(),
            host_id: Uuid::new_v4(),
            tokens: vec!["0".to_string()],
            rpc_address: None,
            peers: Vec::new(),
            handler: None,
        }
    }
}

impl MockNodeConfig {
    pub(crate) fn with_handler(
        mut self,
        handler: impl Fn(&str) -> Option<MockReply> + Send + Sync + 'static,
    ) -> Self {
        self.handler = Some(Arc::new(handler));
        self
    }
}

/// A `system.peers` row.
pub(crate) fn peer_row(
    peer: IpAddr,
    rpc_address: Option<IpAddr>,
    datacenter: &str,
    host_id: Uuid,
    tokens: &[&str],
) -> Columns {
    vec![
        ("peer", MockValue::Inet(peer)),
        (
            "rpc_address",
            rpc_address.map(MockValue::Inet).unwrap_or(MockValue::Null),
        ),
        ("data_center", MockValue::text(datacenter)),
        ("rack", MockValue::text("rack1")),
        ("release_version", MockValue::text("3.11.4")),
        ("host_id", MockValue::Uuid(host_id)),
        (
            "tokens",
            MockValue::TextSet(tokens.iter().map(|t| t.to_string()).collect()),
        ),
    ]
}

enum Outgoing {
    Frame(Vec<u8>),
    Kill,
}

struct ConnectionHandle {
    sender: mpsc::UnboundedSender<Outgoing>,
    registered: Arc<AtomicBool>,
    version: Arc<AtomicU8>,
}

struct NodeState {
    address: SocketAddr,
    config: StdMutex<MockNodeConfig>,
    accepted: AtomicUsize,
    refusing: AtomicBool,
    silent: AtomicBool,
    queries: StdMutex<Vec<String>>,
    connections: StdMutex<Vec<ConnectionHandle>>,
}

pub(crate) struct MockNode {
    state: Arc<NodeState>,
    _acceptor: RemoteHandle<()>,
}

impl MockNode {
    pub(crate) async fn start(config: MockNodeConfig) -> MockNode {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let state = Arc::new(NodeState {
            address: listener.local_addr().unwrap(),
            config: StdMutex::new(config),
            accepted: AtomicUsize::new(0),
            refusing: AtomicBool::new(false),
            silent: AtomicBool::new(false),
            queries: StdMutex::new(Vec::new()),
            connections: StdMutex::new(Vec::new()),
        });
        let (acceptor, handle) = Self::accept_loop(listener, state.clone()).remote_handle();
        tokio::spawn(acceptor);
        MockNode {
            state,
            _acceptor: handle,
        }
    }

    /// An address nothing listens on.
    pub(crate) async fn unused_address() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    }

    pub(crate) fn address(&self) -> SocketAddr {
        self.state.address
    }

    pub(crate) fn accepted_connections(&self) -> usize {
        self.state.accepted.load(Ordering::SeqCst)
    }

    pub(crate) fn received_queries(&self) -> Vec<String> {
        self.state.queries.lock().unwrap().clone()
    }

    /// Accepted sockets are closed right away while refusing.
    pub(crate) fn set_refusing(&self, refusing: bool) {
        self.state.refusing.store(refusing, Ordering::SeqCst);
    }

    /// A silent node reads requests and never answers them.
    pub(crate) fn set_silent(&self, silent: bool) {
        self.state.silent.store(silent, Ordering::SeqCst);
    }

    pub(crate) fn update_config(&self, update: impl FnOnce(&mut MockNodeConfig)) {
        update(&mut self.state.config.lock().unwrap());
    }

    pub(crate) fn drop_connections(&self) {
        for connection in self.state.connections.lock().unwrap().drain(..) {
            let _ = connection.sender.send(Outgoing::Kill);
        }
    }

    pub(crate) fn push_event(&self, event: MockEvent) {
        let connections = self.state.connections.lock().unwrap();
        for connection in connections.iter() {
            if !connection.registered.load(Ordering::SeqCst) {
                continue;
            }
            let Ok(version) = ProtocolVersion::try_from(connection.version.load(Ordering::SeqCst))
            else {
                continue;
            };
            let body = encode_event(&event, version);
            let frame = response_frame(version, EVENT_STREAM_ID, ResponseOpcode::Event, &body);
            let _ = connection.sender.send(Outgoing::Frame(frame));
        }
    }

    async fn accept_loop(listener: TcpListener, state: Arc<NodeState>) {
        loop {
            let Ok((socket, _)) = listener.accept().await else {
                continue;
            };
            if state.refusing.load(Ordering::SeqCst) {
                drop(socket);
                continue;
            }
            state.accepted.fetch_add(1, Ordering::SeqCst);

            let (sender, receiver) = mpsc::unbounded_channel();
            let registered = Arc::new(AtomicBool::new(false));
            let version = Arc::new(AtomicU8::new(0));
            state.connections.lock().unwrap().push(ConnectionHandle {
                sender: sender.clone(),
                registered: registered.clone(),
                version: version.clone(),
            });
            tokio::spawn(Self::serve(
                state.clone(),
                socket,
                receiver,
                MockConnection {
                    sender,
                    registered,
                    version,
                    compression: None,
                },
            ));
        }
    }

    async fn serve(
        state: Arc<NodeState>,
        mut socket: TcpStream,
        mut outgoing: mpsc::UnboundedReceiver<Outgoing>,
        mut connection: MockConnection,
    ) {
        let mut decoder = FrameDecoder::for_requests();
        loop {
            tokio::select! {
                read = socket.read_buf(decoder.buffer_mut()) => {
                    match read {
                        Ok(0) | Err(_) => return,
                        Ok(_) => {}
                    }
                    loop {
                        match decoder.decode() {
                            Ok(Some(frame)) => connection.handle_frame(&state, frame),
                            Ok(None) => break,
                            Err(_) => return,
                        }
                    }
                }
                out = outgoing.recv() => match out {
                    Some(Outgoing::Frame(bytes)) => {
                        if socket.write_all(&bytes).await.is_err() {
                            return;
                        }
                    }
                    Some(Outgoing::Kill) | None => return,
                },
            }
        }
    }
}

impl Drop for MockNode {
    fn drop(&mut self) {
        self.drop_connections();
    }
}

struct MockConnection {
    sender: mpsc::UnboundedSender<Outgoing>,
    registered: Arc<AtomicBool>,
    version: Arc<AtomicU8>,
    compression: Option<Compression>,
}

impl MockConnection {
    fn reply(&self, version: ProtocolVersion, stream: i16, opcode: ResponseOpcode, body: &[u8]) {
        let _ = self
            .sender
            .send(Outgoing::Frame(response_frame(version, stream, opcode, body)));
    }

    fn handle_frame(&mut self, state: &NodeState, frame: RawFrame) {
        if state.silent.load(Ordering::SeqCst) {
            return;
        }
        let version = frame.params.version;
        let stream = frame.params.stream;
        let config = state.config.lock().unwrap().clone();

        if version > config.max_version {
            let mut body = Vec::new();
            types::write_int(0x000A, &mut body);
            types::write_string(
                &format!(
                    "Invalid or unsupported protocol version ({}); highest supported version is {}",
                    version.as_u8(),
                    config.max_version.as_u8()
                ),
                &mut body,
            )
            .unwrap();
            self.reply(config.max_version, stream, ResponseOpcode::Error, &body);
            return;
        }
        self.version.store(version.as_u8(), Ordering::SeqCst);

        let body = if frame.params.flags & FLAG_COMPRESSION != 0 {
            match self.compression {
                Some(compression) => match decompress(&frame.body, compression) {
                    Ok(body) => body,
                    Err(_) => return,
                },
                None => return,
            }
        } else {
            frame.body.to_vec()
        };

        let Ok(opcode) = RequestOpcode::try_from(frame.opcode) else {
            return;
        };
        let Ok(request) = Request::deserialize(version, opcode, &mut &body[..]) else {
            return;
        };

        match request {
            Request::Options => {
                let mut options = HashMap::new();
                options.insert(
                    "COMPRESSION".to_string(),
                    vec!["lz4".to_string(), "snappy".to_string()],
                );
                options.insert("CQL_VERSION".to_string(), vec!["3.4.4".to_string()]);
                let mut body = Vec::new();
                types::write_string_multimap(&options, &mut body).unwrap();
                self.reply(version, stream, ResponseOpcode::Supported, &body);
            }
            Request::Startup(startup) => {
                self.compression = match startup.options.get("COMPRESSION").map(String::as_str) {
                    Some("lz4") => Some(Compression::Lz4),
                    Some("snappy") => Some(Compression::Snappy),
                    _ => None,
                };
                if config.credentials.is_some() {
                    let mut body = Vec::new();
                    types::write_string(PASSWORD_AUTHENTICATOR, &mut body).unwrap();
                    self.reply(version, stream, ResponseOpcode::Authenticate, &body);
                } else {
                    self.reply(version, stream, ResponseOpcode::Ready, &[]);
                }
            }
            Request::AuthResponse(auth) => {
                let expected = config.credentials.as_ref().map(|(user, password)| {
                    format!("\0{}\0{}", user, password).into_bytes()
                });
                if auth.response.is_some() && auth.response == expected {
                    let mut body = Vec::new();
                    types::write_bytes_opt(None::<Vec<u8>>, &mut body).unwrap();
                    self.reply(version, stream, ResponseOpcode::AuthSuccess, &body);
                } else {
                    let body = error_body(0x0100, "Provided username and/or password are incorrect");
                    self.reply(version, stream, ResponseOpcode::Error, &body);
                }
            }
            Request::Register(_) => {
                self.registered.store(true, Ordering::SeqCst);
                self.reply(version, stream, ResponseOpcode::Ready, &[]);
            }
            Request::Query(query) => {
                let contents = query.contents.to_string();
                state.queries.lock().unwrap().push(contents.clone());
                let reply = config
                    .handler
                    .as_ref()
                    .and_then(|handler| handler(&contents))
                    .unwrap_or_else(|| default_reply(state, &config, &contents));
                self.send_reply(version, stream, reply);
            }
        }
    }

    fn send_reply(&self, version: ProtocolVersion, stream: i16, reply: MockReply) {
        match reply {
            MockReply::NoReply => {}
            MockReply::Delayed(delay, reply) => {
                let sender = self.sender.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    if let Some((opcode, body)) = encode_reply(version, *reply) {
                        let _ = sender.send(Outgoing::Frame(response_frame(
                            version, stream, opcode, &body,
                        )));
                    }
                });
            }
            reply => {
                if let Some((opcode, body)) = encode_reply(version, reply) {
                    self.reply(version, stream, opcode, &body);
                }
            }
        }
    }
}

fn default_reply(state: &NodeState, config: &MockNodeConfig, contents: &str) -> MockReply {
    let lowercase = contents.to_ascii_lowercase();
    if let Some(keyspace) = contents.strip_prefix("USE ") {
        let keyspace = keyspace.trim();
        let keyspace = match keyspace.strip_prefix('"').and_then(|k| k.strip_suffix('"')) {
            Some(quoted) => quoted.to_string(),
            None => keyspace.to_lowercase(),
        };
        return MockReply::SetKeyspace(keyspace);
    }
    if lowercase.contains("system.local") {
        let ip = state.address.ip();
        return MockReply::Rows(vec![vec![
            ("key", MockValue::text("local")),
            ("cluster_name", MockValue::text("Test Cluster")),
            ("partitioner", MockValue::text(MURMUR3_PARTITIONER)),
            ("data_center", MockValue::text(config.datacenter.clone())),
            ("rack", MockValue::text("rack1")),
            ("release_version", MockValue::text(config.release_version.clone())),
            ("host_id", MockValue::Uuid(config.host_id)),
            ("rpc_address", MockValue::Inet(config.rpc_address.unwrap_or(ip))),
            ("listen_address", MockValue::Inet(ip)),
            ("tokens", MockValue::TextSet(config.tokens.clone())),
        ]]);
    }
    if lowercase.contains("system.peers") {
        return MockReply::Rows(config.peers.clone());
    }
    if lowercase.contains("system_schema") {
        return MockReply::Rows(Vec::new());
    }
    MockReply::Void
}

fn encode_reply(version: ProtocolVersion, reply: MockReply) -> Option<(ResponseOpcode, Vec<u8>)> {
    let mut body = Vec::new();
    match reply {
        MockReply::Void => types::write_int(0x0001, &mut body),
        MockReply::SetKeyspace(keyspace) => {
            types::write_int(0x0003, &mut body);
            types::write_string(&keyspace, &mut body).unwrap();
        }
        MockReply::Rows(rows) => encode_rows(version, &rows, &mut body),
        MockReply::Error(code, message) => return Some((ResponseOpcode::Error, error_body(code, &message))),
        MockReply::NoReply | MockReply::Delayed(..) => return None,
    }
    Some((ResponseOpcode::Result, body))
}

fn encode_rows(version: ProtocolVersion, rows: &[Columns], buf: &mut Vec<u8>) {
    const FLAG_GLOBAL_TABLES_SPEC: i32 = 0x0001;

    types::write_int(0x0002, buf);
    types::write_int(FLAG_GLOBAL_TABLES_SPEC, buf);
    let columns = rows.first().map(Vec::as_slice).unwrap_or_default();
    types::write_int(columns.len() as i32, buf);
    types::write_string("system", buf).unwrap();
    types::write_string("mock", buf).unwrap();
    for (name, value) in columns {
        types::write_string(name, buf).unwrap();
        value.write_type(buf);
    }

    types::write_int(rows.len() as i32, buf);
    for row in rows {
        for (_, value) in row {
            value.write_cell(version, buf);
        }
    }
}

fn error_body(code: i32, message: &str) -> Vec<u8> {
    let mut body = Vec::new();
    types::write_int(code, &mut body);
    types::write_string(message, &mut body).unwrap();
    body
}

fn encode_event(event: &MockEvent, version: ProtocolVersion) -> Vec<u8> {
    let mut body = Vec::new();
    match event {
        MockEvent::NewNode(addr) | MockEvent::RemovedNode(addr) => {
            let change = match event {
                MockEvent::NewNode(_) => "NEW_NODE",
                _ => "REMOVED_NODE",
            };
            types::write_string("TOPOLOGY_CHANGE", &mut body).unwrap();
            types::write_string(change, &mut body).unwrap();
            types::write_inet(*addr, &mut body);
        }
        MockEvent::Up(addr) | MockEvent::Down(addr) => {
            let change = match event {
                MockEvent::Up(_) => "UP",
                _ => "DOWN",
            };
            types::write_string("STATUS_CHANGE", &mut body).unwrap();
            types::write_string(change, &mut body).unwrap();
            types::write_inet(*addr, &mut body);
        }
        MockEvent::SchemaChange {
            change,
            target,
            keyspace,
            name,
            arguments,
        } => {
            types::write_string("SCHEMA_CHANGE", &mut body).unwrap();
            types::write_string(change, &mut body).unwrap();
            if !version.uses_two_byte_stream_ids() {
                types::write_string(keyspace, &mut body).unwrap();
                types::write_string(name.as_deref().unwrap_or(""), &mut body).unwrap();
                return body;
            }
            types::write_string(target, &mut body).unwrap();
            types::write_string(keyspace, &mut body).unwrap();
            if let Some(name) = name {
                types::write_string(name, &mut body).unwrap();
            }
            if matches!(*target, "FUNCTION" | "AGGREGATE") {
                types::write_string_list(arguments, &mut body).unwrap();
            }
        }
    }
    body
}

fn response_frame(
    version: ProtocolVersion,
    stream: i16,
    opcode: ResponseOpcode,
    body: &[u8],
) -> Vec<u8> {
    let mut out = Vec::new();
    encode_frame(
        FrameDirection::Response,
        FrameParams {
            version,
            flags: 0,
            stream,
        },
        opcode as u8,
        body,
        &mut out,
    );
    out
}
