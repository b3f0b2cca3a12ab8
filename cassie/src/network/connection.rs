use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex, OnceLock, Weak};
use std::time::Duration;

use arc_swap::ArcSwapOption;
use cassie_cql::frame::request::{self, AuthResponse, Options, Query, Register, SerializableRequest, Startup};
use cassie_cql::frame::response::{event::Event, result, Response};
use cassie_cql::frame::server_event_type::EventType;
use cassie_cql::frame::{
    parse_response_body_extensions, Compression, FrameDecoder, RawFrame, SerializedRequest,
    EVENT_STREAM_ID,
};
use cassie_cql::{Consistency, ProtocolVersion};
use dashmap::DashMap;
use futures::future::{BoxFuture, RemoteHandle, Shared};
use futures::FutureExt;
use socket2::{SockRef, TcpKeepalive};
use tokio::io::{split, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot, Notify};
use tokio::time::Instant;
use tracing::{debug, error, trace, warn};
use uuid::Uuid;

use super::operation::{OperationState, OperationStatus, ResponseCallback};
#[cfg(feature = "rustls-023")]
use super::tls::Tls;
use super::tls::TlsContext;
use crate::authentication::AuthenticatorProvider;
use crate::cluster::endpoint::ConnectionEndPoint;
use crate::errors::{
    BadKeyspaceName, BrokenConnectionError, ConnectionError, RequestError, UseKeyspaceError,
};

const WRITE_IDLE: u8 = 0;
const WRITE_RUNNING: u8 = 1;
const WRITE_CLOSED: u8 = 2;

const DEFAULT_CQL_VERSION: &str = "3.0.0";

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(0);

/// Resolves once, with the error that broke the connection.
pub type ErrorReceiver = oneshot::Receiver<BrokenConnectionError>;

/// Something that happened to a connection, broadcast to its subscribers.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// A batch of requests was written to the socket.
    WriteCompleted,
    /// An operation timed out; see [`Connection::timed_out_operations`].
    OperationTimedOut,
    /// The idle heartbeat failed. The connection closes right after.
    IdleRequestFailed(RequestError),
    /// The connection is closing, every pending operation fails with the reason.
    Closing(BrokenConnectionError),
}

/// Settings of a single connection.
#[derive(Clone)]
pub struct ConnectionConfig {
    pub protocol_version: ProtocolVersion,
    pub compression: Option<Compression>,
    pub tcp_nodelay: bool,
    pub tcp_keepalive_interval: Option<Duration>,
    pub connect_timeout: Duration,
    /// Used for requests sent without an explicit timeout.
    pub request_timeout: Duration,
    /// How long a connection may stay quiet before an OPTIONS heartbeat is sent.
    pub heartbeat_interval: Option<Duration>,
    pub heartbeat_timeout: Duration,
    /// Requests are coalesced into one write until the batch reaches this many bytes.
    pub coalescing_threshold: usize,
    pub tls_context: Option<TlsContext>,
    pub authenticator: Option<Arc<dyn AuthenticatorProvider>>,
    /// Server events are forwarded here. The connection REGISTERs only if it is set.
    pub event_sender: Option<mpsc::Sender<Event>>,
    pub event_types: Vec<EventType>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            protocol_version: ProtocolVersion::MAX_SUPPORTED,
            compression: None,
            tcp_nodelay: true,
            tcp_keepalive_interval: None,
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(12),
            heartbeat_interval: Some(Duration::from_secs(30)),
            heartbeat_timeout: Duration::from_secs(5),
            coalescing_threshold: 8000,
            tls_context: None,
            authenticator: None,
            event_sender: None,
            event_types: EventType::ALL.to_vec(),
        }
    }
}

impl fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("protocol_version", &self.protocol_version)
            .field("compression", &self.compression)
            .field("tcp_nodelay", &self.tcp_nodelay)
            .field("tcp_keepalive_interval", &self.tcp_keepalive_interval)
            .field("connect_timeout", &self.connect_timeout)
            .field("request_timeout", &self.request_timeout)
            .field("heartbeat_interval", &self.heartbeat_interval)
            .field("heartbeat_timeout", &self.heartbeat_timeout)
            .field("coalescing_threshold", &self.coalescing_threshold)
            .field("tls", &self.tls_context.is_some())
            .field("authenticator", &self.authenticator.is_some())
            .field("event_types", &self.event_types)
            .finish_non_exhaustive()
    }
}

/// A parsed response together with its frame extensions.
#[derive(Debug)]
pub struct QueryResponse {
    pub response: Response,
    pub tracing_id: Option<Uuid>,
    pub warnings: Vec<String>,
    /// Version of the frame the response came in.
    pub version: ProtocolVersion,
}

impl QueryResponse {
    /// Turns an ERROR response into a [`RequestError`].
    pub fn into_result(self) -> Result<Self, RequestError> {
        match self.response {
            Response::Error(err) => Err(err.into()),
            _ => Ok(self),
        }
    }

    pub fn into_rows(self) -> Result<result::Rows, RequestError> {
        match self.into_result()?.response {
            Response::Result(result::Result::Rows(rows)) => Ok(rows),
            other => Err(RequestError::UnexpectedResponse(other.to_response_kind())),
        }
    }
}

/// A keyspace name that passed validation and can be put into `USE`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedKeyspaceName {
    name: Arc<String>,
    pub(crate) is_case_sensitive: bool,
}

impl VerifiedKeyspaceName {
    pub fn new(keyspace_name: String, case_sensitive: bool) -> Result<Self, BadKeyspaceName> {
        Self::verify_keyspace_name_is_valid(&keyspace_name)?;

        Ok(VerifiedKeyspaceName {
            name: Arc::new(keyspace_name),
            is_case_sensitive: case_sensitive,
        })
    }

    pub fn as_str(&self) -> &str {
        self.name.as_str()
    }

    pub fn is_case_sensitive(&self) -> bool {
        self.is_case_sensitive
    }

    // Keyspace names have up to 48 alphanumeric characters or underscores.
    // An underscore is accepted as the first character as well.
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

/// Bitmap of stream ids in use on one connection.
struct StreamIdSet {
    used_bitmap: Box<[u64]>,
}

impl StreamIdSet {
    fn new(max_stream_ids: usize) -> Self {
        const BITMAP_SIZE: usize = u64::BITS as usize;
        Self {
            used_bitmap: vec![0; max_stream_ids.div_ceil(BITMAP_SIZE)].into_boxed_slice(),
        }
    }

    fn allocate(&mut self) -> Option<i16> {
        for (block_id, block) in self.used_bitmap.iter_mut().enumerate() {
            if *block != !0 {
                let off = block.trailing_ones();
                *block |= 1u64 << off;
                let stream_id = off as i16 + block_id as i16 * u64::BITS as i16;
                return Some(stream_id);
            }
        }
        None
    }

    fn free(&mut self, stream_id: i16) {
        let block_id = stream_id as usize / u64::BITS as usize;
        let off = stream_id as usize % u64::BITS as usize;
        if let Some(block) = self.used_bitmap.get_mut(block_id) {
            *block &= !(1 << off);
        }
    }

    fn has_free(&self) -> bool {
        self.used_bitmap.iter().any(|block| *block != !0)
    }

    fn in_use(&self) -> usize {
        self.used_bitmap
            .iter()
            .map(|block| block.count_ones() as usize)
            .sum()
    }
}

type KeyspaceSwitch = Shared<BoxFuture<'static, Result<(), UseKeyspaceError>>>;

/// State shared by a [`Connection`], its router task and its operations.
pub(crate) struct ConnectionInner {
    id: u64,
    endpoint: ConnectionEndPoint,
    version: ProtocolVersion,
    config: ConnectionConfig,
    compression: Arc<OnceLock<Compression>>,

    write_queue: StdMutex<VecDeque<Arc<OperationState>>>,
    write_state: AtomicU8,
    writer_wakeup: Notify,
    stream_ids: StdMutex<StreamIdSet>,
    pending: DashMap<i16, Arc<OperationState>>,

    in_flight: AtomicUsize,
    timed_out: AtomicUsize,
    idle: Notify,
    last_activity: StdMutex<Instant>,

    events: broadcast::Sender<ConnectionEvent>,
    error_sender: StdMutex<Option<oneshot::Sender<BrokenConnectionError>>>,
    close_reason: OnceLock<BrokenConnectionError>,
    closed: Notify,

    keyspace: ArcSwapOption<VerifiedKeyspaceName>,
    keyspace_switch: StdMutex<Option<(VerifiedKeyspaceName, KeyspaceSwitch)>>,
}

enum Dispatch {
    Response(Arc<OperationState>, RawFrame),
    Event(RawFrame),
}

impl ConnectionInner {
    fn enqueue<R: SerializableRequest>(
        self: &Arc<Self>,
        request: &R,
        timeout: Option<Duration>,
        compress: bool,
        callback: ResponseCallback,
    ) -> Arc<OperationState> {
        let timeout = timeout.unwrap_or(self.config.request_timeout);
        let compression = if compress {
            self.compression.get().copied()
        } else {
            None
        };

        let serialized = match SerializedRequest::make(request, self.version, compression, false) {
            Ok(serialized) => serialized,
            Err(err) => {
                let op = OperationState::new(None, callback, timeout, Weak::new());
                if op.claim_completed() {
                    op.invoke(Err(err.into()));
                }
                return op;
            }
        };

        let op = OperationState::new(Some(serialized), callback, timeout, Arc::downgrade(self));
        self.in_flight.fetch_add(1, Ordering::AcqRel);

        let weak_op = Arc::downgrade(&op);
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(op) = weak_op.upgrade() {
                op.on_timeout();
            }
        });
        op.set_timer(timer);

        self.write_queue.lock().unwrap().push_back(op.clone());
        if self.write_state.load(Ordering::Acquire) == WRITE_CLOSED {
            self.sweep();
        } else {
            self.trigger_write();
        }
        op
    }

    async fn request<R: SerializableRequest>(
        self: &Arc<Self>,
        request: &R,
        timeout: Option<Duration>,
        compress: bool,
    ) -> Result<QueryResponse, RequestError> {
        let (sender, receiver) = oneshot::channel();
        self.enqueue(
            request,
            timeout,
            compress,
            Box::new(move |result| {
                // The receiver is gone if the caller stopped waiting.
                let _ = sender.send(result);
            }),
        );
        receiver
            .await
            .unwrap_or(Err(RequestError::BrokenConnection(BrokenConnectionError::Closed)))
    }

    fn trigger_write(&self) {
        if self
            .write_state
            .compare_exchange(WRITE_IDLE, WRITE_RUNNING, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.writer_wakeup.notify_one();
        }
    }

    fn has_writable_work(&self) -> bool {
        !self.write_queue.lock().unwrap().is_empty() && self.stream_ids.lock().unwrap().has_free()
    }

    /// Pops queued operations, assigns them stream ids and serializes them
    /// into one buffer of about `coalescing_threshold` bytes.
    fn fill_batch(&self) -> (Vec<u8>, usize) {
        let mut batch = Vec::new();
        let mut count = 0;
        let mut queue = self.write_queue.lock().unwrap();
        let mut stream_ids = self.stream_ids.lock().unwrap();

        while batch.len() < self.config.coalescing_threshold {
            let Some(op) = queue.pop_front() else {
                break;
            };
            match op.status() {
                OperationStatus::Pending => {}
                OperationStatus::TimedOut => {
                    // It never got a stream id, so no late response will settle the counter.
                    self.settle_timed_out();
                    continue;
                }
                OperationStatus::Cancelled | OperationStatus::Completed => continue,
            }

            let Some(stream_id) = stream_ids.allocate() else {
                queue.push_front(op);
                trace!(
                    "Connection {} ran out of stream ids, deferring {} requests",
                    self.id,
                    queue.len()
                );
                break;
            };
            let Some(mut request) = op.take_request() else {
                stream_ids.free(stream_id);
                continue;
            };
            request.set_stream(stream_id);
            batch.extend_from_slice(request.get_data());
            count += 1;
            self.pending.insert(stream_id, op);
        }

        (batch, count)
    }

    fn handle_frame(
        &self,
        frame: RawFrame,
        dispatch: &mpsc::UnboundedSender<Dispatch>,
    ) -> Result<(), BrokenConnectionError> {
        let stream = frame.params.stream;
        if stream == EVENT_STREAM_ID {
            let _ = dispatch.send(Dispatch::Event(frame));
            return Ok(());
        }
        if stream < 0 {
            // Negative streams are reserved for the server; only -1 is used.
            return Ok(());
        }

        let Some((_, op)) = self.pending.remove(&stream) else {
            debug!(
                "Received response with unexpected StreamId {} on connection {}",
                stream, self.id
            );
            return Err(BrokenConnectionError::UnexpectedStreamId(stream));
        };
        self.stream_ids.lock().unwrap().free(stream);

        if op.claim_completed() {
            self.operation_finished();
            let _ = dispatch.send(Dispatch::Response(op, frame));
        } else if op.status() == OperationStatus::TimedOut {
            self.settle_timed_out();
        }

        if !self.write_queue.lock().unwrap().is_empty() {
            self.trigger_write();
        }
        Ok(())
    }

    pub(crate) fn operation_finished(&self) {
        if self.in_flight.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.idle.notify_waiters();
        }
    }

    pub(crate) fn count_timed_out(&self) {
        self.timed_out.fetch_add(1, Ordering::AcqRel);
    }

    /// Drops one timed out operation from the counter, once its stream id
    /// is known to be free again.
    pub(crate) fn settle_timed_out(&self) {
        self.timed_out.fetch_sub(1, Ordering::AcqRel);
    }

    /// Called after [`ConnectionInner::count_timed_out`] once the timeout won the claim.
    pub(crate) fn operation_timed_out(&self) {
        self.operation_finished();
        let _ = self.events.send(ConnectionEvent::OperationTimedOut);
    }

    fn touch(&self) {
        *self.last_activity.lock().unwrap() = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        self.last_activity.lock().unwrap().elapsed()
    }

    fn is_closed(&self) -> bool {
        self.write_state.load(Ordering::Acquire) == WRITE_CLOSED
    }

    /// Closes the connection and fails every outstanding operation. Only the
    /// first call has any effect.
    pub(crate) fn close(&self, reason: BrokenConnectionError) {
        let _ = self.close_reason.set(reason);
        if self.write_state.swap(WRITE_CLOSED, Ordering::AcqRel) == WRITE_CLOSED {
            return;
        }
        let reason = self
            .close_reason
            .get()
            .cloned()
            .unwrap_or(BrokenConnectionError::Closed);
        debug!(
            "Connection {} to {} is closing: {}",
            self.id, self.endpoint, reason
        );

        let _ = self.events.send(ConnectionEvent::Closing(reason.clone()));
        self.closed.notify_one();
        self.writer_wakeup.notify_one();
        if let Some(sender) = self.error_sender.lock().unwrap().take() {
            let _ = sender.send(reason);
        }
        self.keyspace_switch.lock().unwrap().take();
        self.sweep();
    }

    /// Fails everything queued or pending on a closed connection.
    fn sweep(&self) {
        let reason = self
            .close_reason
            .get()
            .cloned()
            .unwrap_or(BrokenConnectionError::Closed);

        let queued: Vec<_> = self.write_queue.lock().unwrap().drain(..).collect();
        let pending_ids: Vec<i16> = self.pending.iter().map(|entry| *entry.key()).collect();
        let pending = pending_ids
            .into_iter()
            .filter_map(|stream_id| self.pending.remove(&stream_id).map(|(_, op)| op));

        for op in queued.into_iter().chain(pending) {
            if op.claim_completed() {
                self.operation_finished();
                op.invoke(Err(RequestError::BrokenConnection(reason.clone())));
            }
        }
    }
}

/// One multiplexed connection to a node.
///
/// Requests are written by a single writer task which coalesces them into
/// batches; responses are matched to requests by their stream id. Dropping
/// the connection closes it.
pub struct Connection {
    inner: Arc<ConnectionInner>,
    _router_handle: RemoteHandle<()>,
}

impl Connection {
    fn new<S>(stream: S, endpoint: ConnectionEndPoint, config: ConnectionConfig) -> (Self, ErrorReceiver)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (error_sender, error_receiver) = oneshot::channel();
        let (events, _) = broadcast::channel(64);
        let version = config.protocol_version;

        let inner = Arc::new(ConnectionInner {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            endpoint,
            version,
            compression: Arc::new(OnceLock::new()),
            write_queue: StdMutex::new(VecDeque::new()),
            write_state: AtomicU8::new(WRITE_IDLE),
            writer_wakeup: Notify::new(),
            stream_ids: StdMutex::new(StreamIdSet::new(version.max_stream_ids())),
            pending: DashMap::new(),
            in_flight: AtomicUsize::new(0),
            timed_out: AtomicUsize::new(0),
            idle: Notify::new(),
            last_activity: StdMutex::new(Instant::now()),
            events,
            error_sender: StdMutex::new(Some(error_sender)),
            close_reason: OnceLock::new(),
            closed: Notify::new(),
            keyspace: ArcSwapOption::empty(),
            keyspace_switch: StdMutex::new(None),
            config,
        });

        let (dispatch_sender, dispatch_receiver) = mpsc::unbounded_channel();
        tokio::task::spawn(Self::dispatcher(
            dispatch_receiver,
            inner.compression.clone(),
            inner.config.event_sender.clone(),
        ));

        let (task, router_handle) = Self::router(inner.clone(), stream, dispatch_sender).remote_handle();
        tokio::task::spawn(task);

        (
            Connection {
                inner,
                _router_handle: router_handle,
            },
            error_receiver,
        )
    }

    async fn router<S>(
        inner: Arc<ConnectionInner>,
        stream: S,
        dispatch: mpsc::UnboundedSender<Dispatch>,
    ) where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = split(stream);
        let result = tokio::select! {
            res = async {
                futures::try_join!(
                    Self::reader(&inner, read_half, dispatch),
                    Self::writer(&inner, write_half),
                    Self::heartbeater(&inner),
                )
            } => res.map(|_| ()),
            _ = inner.closed.notified() => Ok(()),
        };

        let reason = match result {
            Ok(()) => BrokenConnectionError::Closed,
            Err(err) => err,
        };
        inner.close(reason);
    }

    async fn reader(
        inner: &Arc<ConnectionInner>,
        mut read_half: impl AsyncRead + Unpin,
        dispatch: mpsc::UnboundedSender<Dispatch>,
    ) -> Result<(), BrokenConnectionError> {
        let mut decoder = FrameDecoder::for_responses();
        loop {
            let read = read_half
                .read_buf(decoder.buffer_mut())
                .await
                .map_err(BrokenConnectionError::read)?;
            if read == 0 {
                return Err(BrokenConnectionError::read(std::io::Error::new(
                    ErrorKind::UnexpectedEof,
                    "connection closed by the server",
                )));
            }
            inner.touch();

            while let Some(frame) = decoder.decode()? {
                inner.handle_frame(frame, &dispatch)?;
            }
        }
    }

    async fn writer(
        inner: &Arc<ConnectionInner>,
        mut write_half: impl AsyncWrite + Unpin,
    ) -> Result<(), BrokenConnectionError> {
        loop {
            inner.writer_wakeup.notified().await;

            loop {
                if inner.is_closed() {
                    return Ok(());
                }

                let (batch, num_requests) = inner.fill_batch();
                if batch.is_empty() {
                    if inner
                        .write_state
                        .compare_exchange(
                            WRITE_RUNNING,
                            WRITE_IDLE,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_err()
                    {
                        // Closed in the meantime.
                        return Ok(());
                    }
                    // Work queued between filling the batch and going idle did not wake us.
                    if inner.has_writable_work()
                        && inner
                            .write_state
                            .compare_exchange(
                                WRITE_IDLE,
                                WRITE_RUNNING,
                                Ordering::AcqRel,
                                Ordering::Acquire,
                            )
                            .is_ok()
                    {
                        continue;
                    }
                    break;
                }

                trace!("Sending {} requests; {} bytes", num_requests, batch.len());
                write_half
                    .write_all(&batch)
                    .await
                    .map_err(BrokenConnectionError::write)?;
                write_half
                    .flush()
                    .await
                    .map_err(BrokenConnectionError::write)?;
                inner.touch();
                let _ = inner.events.send(ConnectionEvent::WriteCompleted);
            }
        }
    }

    async fn heartbeater(inner: &Arc<ConnectionInner>) -> Result<(), BrokenConnectionError> {
        let Some(heartbeat_interval) = inner.config.heartbeat_interval else {
            // No heartbeats are to be sent.
            return Ok(());
        };

        let mut interval = tokio::time::interval(heartbeat_interval);
        interval.tick().await; // Use up the first, instant tick.
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            interval.tick().await;
            if inner.idle_for() < heartbeat_interval {
                continue;
            }

            match inner
                .request(&Options, Some(inner.config.heartbeat_timeout), false)
                .await
            {
                Ok(_) => trace!(
                    "Heartbeat successful on connection {} to {}",
                    inner.id,
                    inner.endpoint
                ),
                Err(err) => {
                    warn!(
                        "Heartbeat failed on connection {} to {} - {}",
                        inner.id, inner.endpoint, err
                    );
                    let _ = inner
                        .events
                        .send(ConnectionEvent::IdleRequestFailed(err.clone()));
                    return Err(BrokenConnectionError::HeartbeatFailed(Arc::new(err)));
                }
            }
        }
    }

    /// Parses responses and runs callbacks away from the socket reader.
    async fn dispatcher(
        mut receiver: mpsc::UnboundedReceiver<Dispatch>,
        compression: Arc<OnceLock<Compression>>,
        event_sender: Option<mpsc::Sender<Event>>,
    ) {
        while let Some(item) = receiver.recv().await {
            match item {
                Dispatch::Response(op, frame) => {
                    op.invoke(Self::parse_response(frame, compression.get().copied()));
                }
                Dispatch::Event(frame) => {
                    let Some(event_sender) = event_sender.as_ref() else {
                        continue;
                    };
                    match Self::parse_response(frame, compression.get().copied()) {
                        Ok(QueryResponse {
                            response: Response::Event(event),
                            ..
                        }) => {
                            // The receiver is dropped once nobody listens for events anymore.
                            let _ = event_sender.send(event).await;
                        }
                        Ok(other) => debug!(
                            "Expected an EVENT on stream -1, got {:?}",
                            other.response.to_response_kind()
                        ),
                        Err(err) => error!("Failed to parse a server event: {}", err),
                    }
                }
            }
        }
    }

    fn parse_response(
        frame: RawFrame,
        compression: Option<Compression>,
    ) -> Result<QueryResponse, RequestError> {
        let opcode = frame.response_opcode()?;
        let body_with_ext =
            parse_response_body_extensions(frame.params.flags, compression, frame.body)?;

        for warn_description in &body_with_ext.warnings {
            warn!(
                warning = warn_description.as_str(),
                "Response from the database contains a warning",
            );
        }

        let response =
            Response::deserialize(frame.params.version, opcode, &mut &*body_with_ext.body)?;

        Ok(QueryResponse {
            response,
            tracing_id: body_with_ext.trace_id,
            warnings: body_with_ext.warnings,
            version: frame.params.version,
        })
    }

    /// Queues a request. The callback runs exactly once, with the response
    /// or with the error that ended the operation.
    pub fn send_with_callback<R: SerializableRequest>(
        &self,
        request: &R,
        timeout: Option<Duration>,
        callback: ResponseCallback,
    ) -> Arc<OperationState> {
        self.inner.enqueue(request, timeout, true, callback)
    }

    /// Sends a request and waits for its response.
    ///
    /// Dropping the returned future does not cancel the operation.
    pub async fn send<R: SerializableRequest>(
        &self,
        request: &R,
        timeout: Option<Duration>,
    ) -> Result<QueryResponse, RequestError> {
        self.inner.request(request, timeout, true).await
    }

    /// Runs an unpaged statement without bound values.
    pub async fn query(&self, contents: impl Into<String>) -> Result<QueryResponse, RequestError> {
        let query = Query::new(contents.into(), Consistency::One);
        self.send(&query, None).await?.into_result()
    }

    /// Switches the keyspace of the connection.
    ///
    /// Concurrent callers asking for the same keyspace share one `USE` request.
    /// A caller asking for another keyspace waits for the switch in progress first.
    pub async fn use_keyspace(
        &self,
        keyspace_name: &VerifiedKeyspaceName,
    ) -> Result<(), UseKeyspaceError> {
        loop {
            if self.inner.keyspace.load().as_deref() == Some(keyspace_name) {
                return Ok(());
            }

            let (target, switch) = {
                let mut slot = self.inner.keyspace_switch.lock().unwrap();
                match &*slot {
                    Some((target, switch)) => (target.clone(), switch.clone()),
                    None => {
                        let switch = Self::switch_keyspace(
                            Arc::downgrade(&self.inner),
                            keyspace_name.clone(),
                        )
                        .boxed()
                        .shared();
                        *slot = Some((keyspace_name.clone(), switch.clone()));
                        (keyspace_name.clone(), switch)
                    }
                }
            };

            let result = switch.await;
            if &target == keyspace_name {
                return result;
            }
            if self.inner.is_closed() {
                return Err(UseKeyspaceError::RequestError(
                    RequestError::BrokenConnection(BrokenConnectionError::Closed),
                ));
            }
        }
    }

    async fn switch_keyspace(
        inner: Weak<ConnectionInner>,
        keyspace_name: VerifiedKeyspaceName,
    ) -> Result<(), UseKeyspaceError> {
        let Some(inner) = inner.upgrade() else {
            return Err(UseKeyspaceError::RequestError(
                RequestError::BrokenConnection(BrokenConnectionError::Closed),
            ));
        };

        // Keyspace names can't be bound values, they go straight into the statement.
        let contents = match keyspace_name.is_case_sensitive {
            true => format!("USE \"{}\"", keyspace_name.as_str()),
            false => format!("USE {}", keyspace_name.as_str()),
        };
        let result = match inner
            .request(&Query::new(contents, Consistency::One), None, true)
            .await
        {
            Ok(response) => Self::verify_use_keyspace_result(&keyspace_name, response),
            Err(err) => Err(err.into()),
        };

        if result.is_ok() {
            debug!(
                "Connection {} switched to keyspace {}",
                inner.id,
                keyspace_name.as_str()
            );
            inner.keyspace.store(Some(Arc::new(keyspace_name)));
        }
        inner.keyspace_switch.lock().unwrap().take();
        result
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
            Response::Error(err) => Err(UseKeyspaceError::RequestError(err.into())),
            other => Err(UseKeyspaceError::UnexpectedResponse(
                other.to_response_kind(),
            )),
        }
    }

    pub fn current_keyspace(&self) -> Option<Arc<VerifiedKeyspaceName>> {
        self.inner.keyspace.load_full()
    }

    async fn handshake(&self) -> Result<(), ConnectionError> {
        let version = self.inner.version;
        let setup_error = |request: &'static str| {
            move |error: RequestError| ConnectionError::SetupRequest { request, error }
        };

        let supported = match self.inner.request(&Options, None, false).await {
            Ok(response) if response.version != version => {
                return Err(ConnectionError::UnsupportedProtocolVersion(version));
            }
            Ok(QueryResponse {
                response: Response::Supported(supported),
                ..
            }) => supported,
            Ok(QueryResponse {
                response: Response::Error(err),
                ..
            }) => {
                if err.is_unsupported_protocol_version() {
                    return Err(ConnectionError::UnsupportedProtocolVersion(version));
                }
                return Err(setup_error("OPTIONS")(err.into()));
            }
            Ok(other) => {
                return Err(setup_error("OPTIONS")(RequestError::UnexpectedResponse(
                    other.response.to_response_kind(),
                )));
            }
            Err(RequestError::BrokenConnection(BrokenConnectionError::FrameHeaderParseError(
                cassie_cql::frame::frame_errors::FrameHeaderParseError::VersionNotSupported(_),
            ))) => return Err(ConnectionError::UnsupportedProtocolVersion(version)),
            Err(err) => return Err(setup_error("OPTIONS")(err)),
        };

        let compression = match self.inner.config.compression {
            Some(compression)
                if supported.offers(request::startup::COMPRESSION, compression.as_str()) =>
            {
                Some(compression)
            }
            Some(compression) => {
                warn!(
                    "Requested compression <{}> is not supported by the cluster. Falling back to no compression",
                    compression.as_str()
                );
                None
            }
            None => None,
        };
        if let Some(compression) = compression {
            // Responses to STARTUP may already be compressed.
            let _ = self.inner.compression.set(compression);
        }

        let mut options = HashMap::new();
        options.insert(
            request::startup::CQL_VERSION.to_string(),
            DEFAULT_CQL_VERSION.to_string(),
        );
        options.insert(
            request::startup::DRIVER_NAME.to_string(),
            env!("CARGO_PKG_NAME").to_string(),
        );
        options.insert(
            request::startup::DRIVER_VERSION.to_string(),
            env!("CARGO_PKG_VERSION").to_string(),
        );
        if let Some(compression) = compression {
            options.insert(
                request::startup::COMPRESSION.to_string(),
                compression.as_str().to_string(),
            );
        }

        let startup_response = self
            .inner
            .request(&Startup { options }, None, false)
            .await
            .map_err(setup_error("STARTUP"))?;
        match startup_response.response {
            Response::Ready => {}
            Response::Authenticate(authenticate) => {
                self.perform_authenticate(&authenticate.authenticator_name)
                    .await?
            }
            Response::Error(err) if err.is_unsupported_protocol_version() => {
                return Err(ConnectionError::UnsupportedProtocolVersion(version));
            }
            Response::Error(err) => return Err(setup_error("STARTUP")(err.into())),
            other => {
                return Err(setup_error("STARTUP")(RequestError::UnexpectedResponse(
                    other.to_response_kind(),
                )))
            }
        }

        if self.inner.config.event_sender.is_some() {
            self.register(self.inner.config.event_types.clone()).await?;
        }
        Ok(())
    }

    async fn perform_authenticate(&self, authenticator_name: &str) -> Result<(), ConnectionError> {
        let Some(authenticator) = self.inner.config.authenticator.as_ref() else {
            return Err(ConnectionError::AuthenticationError(format!(
                "Server requires authentication with {}, but no authenticator was configured",
                authenticator_name
            )));
        };

        let (mut response, mut auth_session) = authenticator
            .start_authentication_session(authenticator_name)
            .await
            .map_err(ConnectionError::AuthenticationError)?;

        loop {
            let auth_response = self
                .inner
                .request(&AuthResponse { response }, None, true)
                .await
                .map_err(|error| ConnectionError::SetupRequest {
                    request: "AUTH_RESPONSE",
                    error,
                })?;

            match auth_response.response {
                Response::AuthChallenge(challenge) => {
                    response = auth_session
                        .evaluate_challenge(challenge.authenticate_message.as_deref())
                        .await
                        .map_err(ConnectionError::AuthenticationError)?;
                }
                Response::AuthSuccess(success) => {
                    auth_session
                        .success(success.success_message.as_deref())
                        .await
                        .map_err(ConnectionError::AuthenticationError)?;
                    return Ok(());
                }
                Response::Error(err) => {
                    return Err(ConnectionError::AuthenticationError(err.reason));
                }
                other => {
                    return Err(ConnectionError::SetupRequest {
                        request: "AUTH_RESPONSE",
                        error: RequestError::UnexpectedResponse(other.to_response_kind()),
                    });
                }
            }
        }
    }

    async fn register(&self, event_types_to_register_for: Vec<EventType>) -> Result<(), ConnectionError> {
        let register_frame = Register {
            event_types_to_register_for,
        };

        let response = self
            .inner
            .request(&register_frame, None, true)
            .await
            .and_then(QueryResponse::into_result)
            .map_err(|error| ConnectionError::SetupRequest {
                request: "REGISTER",
                error,
            })?;
        match response.response {
            Response::Ready => Ok(()),
            other => Err(ConnectionError::SetupRequest {
                request: "REGISTER",
                error: RequestError::UnexpectedResponse(other.to_response_kind()),
            }),
        }
    }

    pub fn endpoint(&self) -> &ConnectionEndPoint {
        &self.inner.endpoint
    }

    pub fn address(&self) -> SocketAddr {
        self.inner.endpoint.socket_addr()
    }

    pub fn protocol_version(&self) -> ProtocolVersion {
        self.inner.version
    }

    pub fn compression(&self) -> Option<Compression> {
        self.inner.compression.get().copied()
    }

    /// Operations sent and not yet answered, timed out or cancelled.
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::Acquire)
    }

    /// Timed out operations whose late response has not arrived yet.
    pub fn timed_out_operations(&self) -> usize {
        self.inner.timed_out.load(Ordering::Acquire)
    }

    /// Stream ids currently held by written requests.
    pub fn stream_ids_in_use(&self) -> usize {
        self.inner.stream_ids.lock().unwrap().in_use()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    pub fn close(&self) {
        self.inner.close(BrokenConnectionError::Closed);
    }

    pub(crate) fn close_with(&self, reason: BrokenConnectionError) {
        self.inner.close(reason);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.events.subscribe()
    }

    /// Resolves once no operation is in flight.
    pub async fn wait_until_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            if self.in_flight() == 0 {
                return;
            }
            notified.await;
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.inner.close(BrokenConnectionError::Closed);
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("endpoint", &self.inner.endpoint)
            .field("version", &self.inner.version)
            .field("in_flight", &self.in_flight())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Opens a connection and runs the handshake: OPTIONS, STARTUP, the
/// authentication exchange if the server asks for it, and REGISTER if the
/// config has an event sender.
pub async fn open_connection(
    endpoint: ConnectionEndPoint,
    config: &ConnectionConfig,
) -> Result<(Connection, ErrorReceiver), ConnectionError> {
    let addr = endpoint.socket_addr();
    let stream = match tokio::time::timeout(config.connect_timeout, TcpStream::connect(addr)).await
    {
        Ok(stream) => stream?,
        Err(_) => return Err(ConnectionError::ConnectTimeout),
    };
    stream.set_nodelay(config.tcp_nodelay)?;

    if let Some(tcp_keepalive_interval) = config.tcp_keepalive_interval {
        if let Err(err) = setup_tcp_keepalive(&stream, tcp_keepalive_interval) {
            warn!(
                "Failed to set up TCP keepalive on connection to {}: {}",
                addr, err
            );
        }
    }

    let (connection, error_receiver) = match &config.tls_context {
        #[cfg(feature = "rustls-023")]
        Some(tls_context) => {
            let Tls::Rustls023 {
                connector,
                server_name,
            } = tls_context.new_tls(&endpoint).map_err(std::io::Error::from)?;
            let stream = connector.connect(server_name, stream).await?;
            Connection::new(stream, endpoint, config.clone())
        }
        // Without a TLS feature no context can exist.
        _ => Connection::new(stream, endpoint, config.clone()),
    };

    connection.handshake().await?;
    debug!(
        "Opened connection {} to {} with protocol {}",
        connection.inner.id,
        connection.endpoint(),
        connection.protocol_version()
    );
    Ok((connection, error_receiver))
}

fn setup_tcp_keepalive(stream: &TcpStream, tcp_keepalive_interval: Duration) -> std::io::Result<()> {
    // Our interval is the idle time before keepalives start ("time" in socket2 terms);
    // socket2's interval is the time between keepalive probes.
    let mut tcp_keepalive = TcpKeepalive::new().with_time(tcp_keepalive_interval);

    // These cfg values are taken from socket2 library, which uses the same constraints.
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

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use assert_matches::assert_matches;
    use cassie_cql::frame::response::event::TopologyChangeEvent;
    use ntest::timeout;

    use super::*;
    use crate::authentication::PlainTextAuthenticator;
    use crate::utils::test_utils::{setup_tracing, MockEvent, MockNode, MockNodeConfig, MockReply};

    async fn connect(
        node: &MockNode,
        config: ConnectionConfig,
    ) -> Result<(Connection, ErrorReceiver), ConnectionError> {
        open_connection(ConnectionEndPoint::Direct(node.address()), &config).await
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    fn hanging_node_config() -> MockNodeConfig {
        MockNodeConfig::default().with_handler(|query| {
            query
                .starts_with("SELECT hang")
                .then_some(MockReply::NoReply)
        })
    }

    #[test]
    fn stream_id_set_allocates_lowest_free_id() {
        let mut ids = StreamIdSet::new(128);
        for expected in 0..128 {
            assert_eq!(ids.allocate(), Some(expected));
        }
        assert_eq!(ids.allocate(), None);
        assert!(!ids.has_free());
        assert_eq!(ids.in_use(), 128);

        ids.free(70);
        ids.free(5);
        assert_eq!(ids.allocate(), Some(5));
        assert_eq!(ids.allocate(), Some(70));
        assert_eq!(ids.allocate(), None);
    }

    #[test]
    fn keyspace_name_validation() {
        assert!(VerifiedKeyspaceName::new("system_schema".to_string(), false).is_ok());
        assert!(VerifiedKeyspaceName::new("_ks1".to_string(), true).is_ok());
        assert_eq!(
            VerifiedKeyspaceName::new(String::new(), false),
            Err(BadKeyspaceName::Empty)
        );
        assert_matches!(
            VerifiedKeyspaceName::new("a".repeat(49), false),
            Err(BadKeyspaceName::TooLong(_, 49))
        );
        assert_matches!(
            VerifiedKeyspaceName::new("bad-name".to_string(), false),
            Err(BadKeyspaceName::IllegalCharacter(_, '-'))
        );
    }

    #[tokio::test]
    #[timeout(10000)]
    async fn handshake_and_simple_query() {
        setup_tracing();
        let node = MockNode::start(MockNodeConfig::default()).await;
        let (connection, _error_receiver) = connect(&node, ConnectionConfig::default())
            .await
            .unwrap();

        assert_eq!(connection.protocol_version(), ProtocolVersion::V4);
        assert_eq!(connection.compression(), None);

        let rows = connection
            .query("SELECT data_center FROM system.local WHERE key='local'")
            .await
            .unwrap()
            .into_rows()
            .unwrap();
        assert_eq!(rows.len(), 1);
        let row = rows.iter().next().unwrap();
        assert_eq!(
            row.get("data_center").unwrap().and_then(|v| v.into_string()),
            Some("dc1".to_string())
        );
        assert_eq!(connection.in_flight(), 0);
    }

    #[tokio::test]
    #[timeout(10000)]
    async fn compressed_requests_are_understood() {
        setup_tracing();
        let node = MockNode::start(MockNodeConfig::default()).await;
        for compression in [Compression::Lz4, Compression::Snappy] {
            let config = ConnectionConfig {
                compression: Some(compression),
                ..Default::default()
            };
            let (connection, _error_receiver) = connect(&node, config).await.unwrap();
            assert_eq!(connection.compression(), Some(compression));
            connection.query("SELECT * FROM system.peers").await.unwrap();
        }
        assert_eq!(node.received_queries().len(), 2);
    }

    #[tokio::test]
    #[timeout(10000)]
    async fn concurrent_requests_complete_exactly_once() {
        setup_tracing();
        let node = MockNode::start(MockNodeConfig::default()).await;
        let (connection, _error_receiver) = connect(&node, ConnectionConfig::default())
            .await
            .unwrap();

        let completions = Arc::new(AtomicUsize::new(0));
        let (done_sender, mut done_receiver) = mpsc::unbounded_channel();
        for i in 0..500 {
            let completions = completions.clone();
            let done_sender = done_sender.clone();
            connection.send_with_callback(
                &Query::new(format!("INSERT {}", i), Consistency::One),
                None,
                Box::new(move |result| {
                    assert!(result.is_ok());
                    completions.fetch_add(1, Ordering::SeqCst);
                    done_sender.send(()).unwrap();
                }),
            );
        }
        for _ in 0..500 {
            done_receiver.recv().await.unwrap();
        }

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(completions.load(Ordering::SeqCst), 500);
        assert_eq!(connection.in_flight(), 0);
        assert_eq!(connection.stream_ids_in_use(), 0);
    }

    #[tokio::test]
    #[timeout(10000)]
    async fn requests_beyond_free_stream_ids_wait_in_the_queue() {
        setup_tracing();
        let node = MockNode::start(MockNodeConfig::default().with_handler(|query| {
            query
                .starts_with("SELECT slow")
                .then(|| MockReply::Delayed(Duration::from_millis(200), Box::new(MockReply::Void)))
        }))
        .await;
        let config = ConnectionConfig {
            protocol_version: ProtocolVersion::V2,
            ..Default::default()
        };
        let (connection, _error_receiver) = connect(&node, config).await.unwrap();

        // Version 2 has 128 stream ids.
        let requests = (0..200).map(|i| connection.query(format!("SELECT slow {}", i)));
        let results = futures::future::join_all(requests).await;
        assert!(results.iter().all(Result::is_ok));
        assert_eq!(connection.stream_ids_in_use(), 0);
    }

    #[tokio::test]
    #[timeout(10000)]
    async fn close_fails_queued_and_pending_operations_once() {
        setup_tracing();
        let node = MockNode::start(hanging_node_config()).await;
        let (connection, _error_receiver) = connect(&node, ConnectionConfig::default())
            .await
            .unwrap();

        let (error_sender, mut error_receiver) = mpsc::unbounded_channel();
        let ops: Vec<_> = (0..3)
            .map(|_| {
                let error_sender = error_sender.clone();
                connection.send_with_callback(
                    &Query::new("SELECT hang", Consistency::One),
                    None,
                    Box::new(move |result| error_sender.send(result.unwrap_err()).unwrap()),
                )
            })
            .collect();
        wait_until(|| connection.stream_ids_in_use() == 3).await;

        connection.close();
        // Queued after the close.
        connection.send_with_callback(
            &Query::new("SELECT hang", Consistency::One),
            None,
            Box::new(move |result| error_sender.send(result.unwrap_err()).unwrap()),
        );

        for _ in 0..4 {
            assert_matches!(
                error_receiver.recv().await,
                Some(RequestError::BrokenConnection(BrokenConnectionError::Closed))
            );
        }
        assert!(error_receiver.try_recv().is_err());
        assert!(ops.iter().all(|op| op.status() == OperationStatus::Completed));
        assert!(connection.is_closed());
        assert_eq!(connection.in_flight(), 0);
    }

    #[tokio::test]
    #[timeout(10000)]
    async fn close_with_every_stream_id_taken_fails_each_operation_once() {
        setup_tracing();
        let node = MockNode::start(hanging_node_config()).await;
        let config = ConnectionConfig {
            protocol_version: ProtocolVersion::V2,
            ..Default::default()
        };
        let (connection, _error_receiver) = connect(&node, config).await.unwrap();

        let query = Query::new("SELECT hang", Consistency::One);
        let (error_sender, mut error_receiver) = mpsc::unbounded_channel();
        let ops: Vec<_> = (0..150)
            .map(|_| {
                let error_sender = error_sender.clone();
                connection.send_with_callback(
                    &query,
                    None,
                    Box::new(move |result| error_sender.send(result.unwrap_err()).unwrap()),
                )
            })
            .collect();
        // 128 are written, the other 22 wait for a free stream id.
        wait_until(|| connection.stream_ids_in_use() == 128).await;
        assert_eq!(connection.in_flight(), 150);

        connection.close();

        for _ in 0..150 {
            assert_matches!(
                error_receiver.recv().await,
                Some(RequestError::BrokenConnection(BrokenConnectionError::Closed))
            );
        }
        assert!(error_receiver.try_recv().is_err());
        assert!(ops.iter().all(|op| op.status() == OperationStatus::Completed));
        assert_eq!(connection.in_flight(), 0);
    }

    #[tokio::test]
    #[timeout(10000)]
    async fn late_response_releases_timed_out_stream_id() {
        setup_tracing();
        let node = MockNode::start(MockNodeConfig::default().with_handler(|query| {
            query
                .starts_with("SELECT slow")
                .then(|| MockReply::Delayed(Duration::from_millis(300), Box::new(MockReply::Void)))
        }))
        .await;
        let (connection, _error_receiver) = connect(&node, ConnectionConfig::default())
            .await
            .unwrap();
        let mut events = connection.subscribe();

        let result = connection
            .send(
                &Query::new("SELECT slow", Consistency::One),
                Some(Duration::from_millis(50)),
            )
            .await;
        assert_matches!(result, Err(RequestError::Timeout(_)));
        assert_eq!(connection.timed_out_operations(), 1);
        assert_eq!(connection.stream_ids_in_use(), 1);
        assert_eq!(connection.in_flight(), 0);

        loop {
            if let ConnectionEvent::OperationTimedOut = events.recv().await.unwrap() {
                break;
            }
        }

        wait_until(|| connection.timed_out_operations() == 0).await;
        assert_eq!(connection.stream_ids_in_use(), 0);
        assert!(!connection.is_closed());
    }

    #[tokio::test]
    #[timeout(10000)]
    async fn timeout_losing_to_a_response_leaves_the_counter_alone() {
        setup_tracing();
        let node = MockNode::start(hanging_node_config()).await;
        let (connection, _error_receiver) = connect(&node, ConnectionConfig::default())
            .await
            .unwrap();

        let (sender, mut receiver) = mpsc::unbounded_channel();
        let op = connection.send_with_callback(
            &Query::new("SELECT hang", Consistency::One),
            Some(Duration::from_secs(60)),
            Box::new(move |result| sender.send(result.map(|_| ())).unwrap()),
        );
        wait_until(|| connection.stream_ids_in_use() == 1).await;

        assert!(op.claim_completed());
        op.on_timeout();
        assert_eq!(connection.timed_out_operations(), 0);
        assert_eq!(op.status(), OperationStatus::Completed);
        assert!(receiver.try_recv().is_err());
    }

    #[tokio::test]
    #[timeout(10000)]
    async fn cancelled_operation_never_sees_its_response() {
        setup_tracing();
        let node = MockNode::start(MockNodeConfig::default().with_handler(|query| {
            query
                .starts_with("SELECT slow")
                .then(|| MockReply::Delayed(Duration::from_millis(100), Box::new(MockReply::Void)))
        }))
        .await;
        let (connection, _error_receiver) = connect(&node, ConnectionConfig::default())
            .await
            .unwrap();

        let (sender, mut receiver) = mpsc::unbounded_channel();
        let op = connection.send_with_callback(
            &Query::new("SELECT slow", Consistency::One),
            None,
            Box::new(move |result| sender.send(result.map(|_| ())).unwrap()),
        );
        wait_until(|| connection.stream_ids_in_use() == 1).await;
        assert!(op.cancel());
        assert!(!op.cancel());

        assert_matches!(receiver.recv().await, Some(Err(RequestError::Cancelled)));
        wait_until(|| connection.stream_ids_in_use() == 0).await;
        assert_matches!(receiver.recv().await, None);
        assert_eq!(op.status(), OperationStatus::Cancelled);
    }

    #[tokio::test]
    #[timeout(10000)]
    async fn use_keyspace_is_coalesced() {
        setup_tracing();
        let node = MockNode::start(MockNodeConfig::default()).await;
        let (connection, _error_receiver) = connect(&node, ConnectionConfig::default())
            .await
            .unwrap();

        let ks = VerifiedKeyspaceName::new("ks".to_string(), false).unwrap();
        let (first, second) = tokio::join!(connection.use_keyspace(&ks), connection.use_keyspace(&ks));
        first.unwrap();
        second.unwrap();
        assert_eq!(connection.current_keyspace().as_deref(), Some(&ks));

        // Already there, nothing is sent.
        connection.use_keyspace(&ks).await.unwrap();

        let quoted = VerifiedKeyspaceName::new("MyKs".to_string(), true).unwrap();
        connection.use_keyspace(&quoted).await.unwrap();
        assert_eq!(connection.current_keyspace().as_deref(), Some(&quoted));

        assert_eq!(
            node.received_queries(),
            vec!["USE ks".to_string(), "USE \"MyKs\"".to_string()]
        );
    }

    #[tokio::test]
    #[timeout(10000)]
    async fn use_keyspace_detects_mismatched_result() {
        setup_tracing();
        let node = MockNode::start(MockNodeConfig::default().with_handler(|query| {
            query
                .starts_with("USE")
                .then(|| MockReply::SetKeyspace("other".to_string()))
        }))
        .await;
        let (connection, _error_receiver) = connect(&node, ConnectionConfig::default())
            .await
            .unwrap();

        let ks = VerifiedKeyspaceName::new("ks".to_string(), false).unwrap();
        assert_matches!(
            connection.use_keyspace(&ks).await,
            Err(UseKeyspaceError::KeyspaceNameMismatch { .. })
        );
        assert_eq!(connection.current_keyspace(), None);
    }

    #[tokio::test]
    #[timeout(10000)]
    async fn authentication() {
        setup_tracing();
        let node = MockNode::start(MockNodeConfig {
            credentials: Some(("cassandra".to_string(), "secret".to_string())),
            ..Default::default()
        })
        .await;

        let with_credentials = |password: &str| ConnectionConfig {
            authenticator: Some(Arc::new(PlainTextAuthenticator::new("cassandra", password))),
            ..Default::default()
        };

        let (connection, _error_receiver) = connect(&node, with_credentials("secret")).await.unwrap();
        connection.query("SELECT * FROM system.local").await.unwrap();

        assert_matches!(
            connect(&node, with_credentials("wrong")).await,
            Err(ConnectionError::AuthenticationError(_))
        );
        assert_matches!(
            connect(&node, ConnectionConfig::default()).await,
            Err(ConnectionError::AuthenticationError(_))
        );
    }

    #[tokio::test]
    #[timeout(10000)]
    async fn unsupported_protocol_version_is_reported() {
        setup_tracing();
        let node = MockNode::start(MockNodeConfig {
            max_version: ProtocolVersion::V3,
            ..Default::default()
        })
        .await;

        assert_matches!(
            connect(&node, ConnectionConfig::default()).await,
            Err(ConnectionError::UnsupportedProtocolVersion(ProtocolVersion::V4))
        );

        let config = ConnectionConfig {
            protocol_version: ProtocolVersion::V3,
            ..Default::default()
        };
        let (connection, _error_receiver) = connect(&node, config).await.unwrap();
        assert_eq!(connection.protocol_version(), ProtocolVersion::V3);
        let rows = connection
            .query("SELECT tokens FROM system.local")
            .await
            .unwrap()
            .into_rows()
            .unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[tokio::test]
    #[timeout(10000)]
    async fn server_events_are_forwarded() {
        setup_tracing();
        let node = MockNode::start(MockNodeConfig::default()).await;
        let (event_sender, mut event_receiver) = mpsc::channel(16);
        let config = ConnectionConfig {
            event_sender: Some(event_sender),
            ..Default::default()
        };
        let (_connection, _error_receiver) = connect(&node, config).await.unwrap();

        let new_node: SocketAddr = "10.0.0.7:9042".parse().unwrap();
        node.push_event(MockEvent::NewNode(new_node));
        assert_matches!(
            event_receiver.recv().await,
            Some(Event::TopologyChange(TopologyChangeEvent::NewNode(addr))) if addr == new_node
        );
    }

    #[tokio::test]
    #[timeout(10000)]
    async fn failed_heartbeat_breaks_the_connection() {
        setup_tracing();
        let node = MockNode::start(MockNodeConfig::default()).await;
        let config = ConnectionConfig {
            heartbeat_interval: Some(Duration::from_millis(100)),
            heartbeat_timeout: Duration::from_millis(100),
            ..Default::default()
        };
        let (connection, error_receiver) = connect(&node, config).await.unwrap();
        node.set_silent(true);

        assert_matches!(
            error_receiver.await,
            Ok(BrokenConnectionError::HeartbeatFailed(_))
        );
        assert!(connection.is_closed());
    }

    #[tokio::test]
    #[timeout(10000)]
    async fn lost_socket_fails_pending_operations() {
        setup_tracing();
        let node = MockNode::start(hanging_node_config()).await;
        let (connection, error_receiver) = connect(&node, ConnectionConfig::default())
            .await
            .unwrap();

        let query = Query::new("SELECT hang", Consistency::One);
        let pending = connection.send(&query, None);
        let drop_connections = async {
            wait_until(|| connection.stream_ids_in_use() == 1).await;
            node.drop_connections();
        };
        let (result, ()) = tokio::join!(pending, drop_connections);

        assert_matches!(
            result,
            Err(RequestError::BrokenConnection(BrokenConnectionError::ReadError(_)))
        );
        assert_matches!(error_receiver.await, Ok(BrokenConnectionError::ReadError(_)));
        assert!(connection.is_closed());
    }

    #[tokio::test]
    #[timeout(10000)]
    async fn refused_connection() {
        setup_tracing();
        let addr = MockNode::unused_address().await;
        assert_matches!(
            open_connection(ConnectionEndPoint::Direct(addr), &ConnectionConfig::default()).await,
            Err(ConnectionError::IoError(_))
        );
    }
}
