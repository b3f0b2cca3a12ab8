//! Specially treated single connection used to fetch metadata
//! and receive events from the cluster.
//!
//! The control connection reads `system.local` and `system.peers` to build
//! the host set, reads the schema, and REGISTERs for server events. Events
//! are turned into [`RefreshEvent`]s and coalesced by a [`Debouncer`] before
//! anything is re-read.

use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration;

use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use cassie_cql::frame::response::event::{
    Event, SchemaChangeEvent, SchemaChangeTarget, SchemaChangeType, StatusChangeEvent,
};
use cassie_cql::frame::server_event_type::EventType;
use cassie_cql::ProtocolVersion;
use futures::future::{BoxFuture, RemoteHandle, Shared};
use futures::FutureExt;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use super::debouncer::{
    Debouncer, KeyspaceRefresh, RefreshBatch, RefreshEvent, RefreshHandler, SchemaElement,
};
use super::endpoint::{
    resolve_contact_points, ConnectionEndPoint, ContactPoint, DefaultEndPointResolver,
    EndPointResolver, DEFAULT_PORT,
};
use super::host::{Host, HostDistance, HostEvent, HostInfo};
use super::metadata::Metadata;
use super::schema::{FunctionSignature, TableMetadata};
use super::system_tables::{query_local, query_peers};
use crate::errors::{ConnectionError, MetadataError, NewClusterError, RequestError};
use crate::network::{open_connection, Connection, ConnectionConfig, ErrorReceiver};
use crate::policies::address_translator::{AddressTranslator, IdentityTranslator, UntranslatedPeer};
use crate::policies::load_balancing::{LoadBalancingPolicy, RoundRobinPolicy};
use crate::policies::reconnection::{
    ExponentialReconnectionPolicy, ReconnectionPolicy, ReconnectionSchedule,
};

const EVENT_CHANNEL_CAPACITY: usize = 128;

/// Lifecycle of the control connection.
///
/// `Disconnected` → `Connecting` → `Connected`, then `Reconnecting` and back
/// to `Connected` for as long as it lives. `ShutDown` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    ShutDown,
}

impl ControlConnectionState {
    fn as_u8(self) -> u8 {
        match self {
            ControlConnectionState::Disconnected => 0,
            ControlConnectionState::Connecting => 1,
            ControlConnectionState::Connected => 2,
            ControlConnectionState::Reconnecting => 3,
            ControlConnectionState::ShutDown => 4,
        }
    }

    fn from_u8(value: u8) -> ControlConnectionState {
        match value {
            0 => ControlConnectionState::Disconnected,
            1 => ControlConnectionState::Connecting,
            2 => ControlConnectionState::Connected,
            3 => ControlConnectionState::Reconnecting,
            _ => ControlConnectionState::ShutDown,
        }
    }
}

/// Settings of the control connection.
#[derive(Clone)]
pub struct ControlConnectionConfig {
    /// Tried in order on init. Hostnames may resolve to several addresses.
    pub contact_points: Vec<ContactPoint>,
    /// Base settings of the connection. The event sender and the request
    /// timeout are overridden.
    pub connection_config: ConnectionConfig,
    pub reconnection_policy: Arc<dyn ReconnectionPolicy>,
    pub load_balancing_policy: Arc<dyn LoadBalancingPolicy>,
    pub address_translator: Arc<dyn AddressTranslator>,
    pub endpoint_resolver: Arc<dyn EndPointResolver>,
    /// Request timeout of the system table queries.
    pub metadata_request_timeout: Duration,
    /// Without it the schema is never read and schema events are ignored.
    pub fetch_schema_metadata: bool,
    pub refresh_delay: Duration,
    pub refresh_max_delay: Duration,
    pub hostname_resolution_timeout: Option<Duration>,
}

impl Default for ControlConnectionConfig {
    fn default() -> Self {
        Self {
            contact_points: Vec::new(),
            connection_config: ConnectionConfig::default(),
            reconnection_policy: Arc::new(ExponentialReconnectionPolicy::default()),
            load_balancing_policy: Arc::new(RoundRobinPolicy::new()),
            address_translator: Arc::new(IdentityTranslator),
            endpoint_resolver: Arc::new(DefaultEndPointResolver),
            metadata_request_timeout: Duration::from_secs(12),
            fetch_schema_metadata: true,
            refresh_delay: Duration::from_secs(1),
            refresh_max_delay: Duration::from_secs(10),
            hostname_resolution_timeout: Some(Duration::from_secs(5)),
        }
    }
}

impl fmt::Debug for ControlConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControlConnectionConfig")
            .field("contact_points", &self.contact_points)
            .field("connection_config", &self.connection_config)
            .field("reconnection_policy", &self.reconnection_policy)
            .field("load_balancing_policy", &self.load_balancing_policy)
            .field("endpoint_resolver", &self.endpoint_resolver)
            .field("metadata_request_timeout", &self.metadata_request_timeout)
            .field("fetch_schema_metadata", &self.fetch_schema_metadata)
            .field("refresh_delay", &self.refresh_delay)
            .field("refresh_max_delay", &self.refresh_max_delay)
            .field(
                "hostname_resolution_timeout",
                &self.hostname_resolution_timeout,
            )
            .finish_non_exhaustive()
    }
}

type ReconnectFuture = Shared<BoxFuture<'static, Result<(), NewClusterError>>>;

enum Candidate {
    ContactPoint(SocketAddr),
    Host(Arc<Host>),
}

impl Candidate {
    fn address(&self) -> SocketAddr {
        match self {
            Candidate::ContactPoint(address) => *address,
            Candidate::Host(host) => host.address(),
        }
    }
}

struct ControlConnectionInner {
    config: ControlConnectionConfig,
    connection_config: ConnectionConfig,
    metadata: Arc<Metadata>,

    state: AtomicU8,
    protocol_version: StdMutex<ProtocolVersion>,
    // Swapped in one step, so a refresh runs either entirely on the old
    // connection or entirely on the new one.
    connection: ArcSwapOption<Connection>,
    host: ArcSwapOption<Host>,
    tried_hosts: StdMutex<HashMap<SocketAddr, ConnectionError>>,

    reconnect: StdMutex<Option<ReconnectFuture>>,
    reconnection_schedule: StdMutex<Box<dyn ReconnectionSchedule>>,
    retry_timer: StdMutex<Option<JoinHandle<()>>>,
    error_watcher: StdMutex<Option<RemoteHandle<()>>>,

    debouncer: Debouncer,
    tasks: StdMutex<Vec<RemoteHandle<()>>>,
}

/// The single connection used to fetch metadata and receive events from the cluster.
///
/// Dropping it shuts it down.
pub struct ControlConnection {
    inner: Arc<ControlConnectionInner>,
}

impl fmt::Debug for ControlConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControlConnection")
            .field("state", &self.state())
            .field("host", &self.current_host().map(|host| host.address()))
            .field("protocol_version", &self.protocol_version())
            .finish_non_exhaustive()
    }
}

impl ControlConnection {
    /// Creates a disconnected control connection writing into `metadata`.
    ///
    /// Must be called within a tokio runtime, the event handling tasks start
    /// right away.
    pub fn new(config: ControlConnectionConfig, metadata: Arc<Metadata>) -> Self {
        let (event_sender, event_receiver) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let mut connection_config = config.connection_config.clone();
        connection_config.request_timeout = config.metadata_request_timeout;
        connection_config.event_sender = Some(event_sender);
        connection_config.event_types = EventType::ALL.to_vec();
        let host_events = metadata.subscribe();

        let inner = Arc::new_cyclic(|weak: &Weak<ControlConnectionInner>| {
            ControlConnectionInner {
                debouncer: Debouncer::new(
                    config.refresh_delay,
                    config.refresh_max_delay,
                    Arc::new(Refresher(weak.clone())),
                ),
                protocol_version: StdMutex::new(connection_config.protocol_version),
                reconnection_schedule: StdMutex::new(config.reconnection_policy.new_schedule()),
                connection_config,
                metadata,
                state: AtomicU8::new(ControlConnectionState::Disconnected.as_u8()),
                connection: ArcSwapOption::empty(),
                host: ArcSwapOption::empty(),
                tried_hosts: StdMutex::new(HashMap::new()),
                reconnect: StdMutex::new(None),
                retry_timer: StdMutex::new(None),
                error_watcher: StdMutex::new(None),
                tasks: StdMutex::new(Vec::new()),
                config,
            }
        });

        let (events, events_handle) =
            handle_events(Arc::downgrade(&inner), event_receiver).remote_handle();
        tokio::spawn(events);
        let (hosts, hosts_handle) =
            watch_hosts(Arc::downgrade(&inner), host_events).remote_handle();
        tokio::spawn(hosts);
        *inner.tasks.lock().unwrap() = vec![events_handle, hosts_handle];

        ControlConnection { inner }
    }

    /// Connects to the first reachable contact point, then to any other
    /// known host, and reads the cluster metadata through it.
    ///
    /// Every failed attempt is kept in [`tried_hosts`](Self::tried_hosts);
    /// when all of them fail they are returned in `NoHostAvailable`.
    pub async fn init(&self) -> Result<(), NewClusterError> {
        let inner = &self.inner;
        if let Err(current) = inner.state.compare_exchange(
            ControlConnectionState::Disconnected.as_u8(),
            ControlConnectionState::Connecting.as_u8(),
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            return match ControlConnectionState::from_u8(current) {
                ControlConnectionState::ShutDown => Err(NewClusterError::ShutDown),
                _ => Err(NewClusterError::AlreadyInitialized),
            };
        }

        match inner.connect_initial().await {
            Ok(()) => {
                if !inner.set_state(ControlConnectionState::Connected) {
                    return Err(NewClusterError::ShutDown);
                }
                info!(
                    "Control connection established to {:?} with protocol {}",
                    inner.host.load().as_ref().map(|host| host.address()),
                    inner.protocol_version()
                );
                Ok(())
            }
            Err(err) => {
                let _ = inner.state.compare_exchange(
                    ControlConnectionState::Connecting.as_u8(),
                    ControlConnectionState::Disconnected.as_u8(),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                );
                Err(err)
            }
        }
    }

    pub fn state(&self) -> ControlConnectionState {
        self.inner.state()
    }

    pub fn metadata(&self) -> &Arc<Metadata> {
        &self.inner.metadata
    }

    pub fn connection(&self) -> Option<Arc<Connection>> {
        self.inner.connection.load_full()
    }

    /// The host the control connection is connected to.
    pub fn current_host(&self) -> Option<Arc<Host>> {
        self.inner.host.load_full()
    }

    pub fn load_balancing_policy(&self) -> &Arc<dyn LoadBalancingPolicy> {
        &self.inner.config.load_balancing_policy
    }

    /// Protocol version every new connection to the cluster should use.
    pub fn protocol_version(&self) -> ProtocolVersion {
        self.inner.protocol_version()
    }

    /// Failed attempts of the last init or reconnection.
    pub fn tried_hosts(&self) -> HashMap<SocketAddr, ConnectionError> {
        self.inner.tried_hosts.lock().unwrap().clone()
    }

    /// Moves the control connection to the first reachable host of a fresh
    /// query plan. Concurrent calls share one attempt.
    pub async fn reconnect(&self) -> Result<(), NewClusterError> {
        self.inner.shared_reconnect().await
    }

    pub fn schedule_hosts_refresh(&self) {
        self.inner.debouncer.schedule(RefreshEvent::Topology);
    }

    /// Re-reads the node list, together with whatever refresh was queued.
    pub async fn refresh_hosts(&self) -> Result<(), MetadataError> {
        self.inner.debouncer.process_now(RefreshEvent::Topology).await
    }

    pub fn schedule_keyspace_refresh(&self, keyspace: impl Into<String>) {
        self.inner
            .debouncer
            .schedule(RefreshEvent::Keyspace(keyspace.into()));
    }

    pub async fn refresh_keyspace(&self, keyspace: impl Into<String>) -> Result<(), MetadataError> {
        self.inner
            .debouncer
            .process_now(RefreshEvent::Keyspace(keyspace.into()))
            .await
    }

    pub fn schedule_schema_refresh(&self) {
        self.inner.debouncer.schedule(RefreshEvent::AllKeyspaces);
    }

    pub async fn refresh_schema(&self) -> Result<(), MetadataError> {
        self.inner
            .debouncer
            .process_now(RefreshEvent::AllKeyspaces)
            .await
    }

    /// Metadata of the table, read again through the control connection if
    /// it was invalidated.
    pub async fn table(
        &self,
        keyspace: &str,
        table: &str,
    ) -> Result<Option<Arc<TableMetadata>>, MetadataError> {
        let connection = self
            .inner
            .connection
            .load_full()
            .ok_or(MetadataError::NotConnected)?;
        self.inner
            .metadata
            .table_or_fetch(&connection, keyspace, table)
            .await
    }

    /// Closes the connection and stops every background task. Idempotent.
    pub fn shutdown(&self) {
        let previous = self
            .inner
            .state
            .swap(ControlConnectionState::ShutDown.as_u8(), Ordering::AcqRel);
        if previous == ControlConnectionState::ShutDown.as_u8() {
            return;
        }
        info!("Shutting down the control connection");

        if let Some(timer) = self.inner.retry_timer.lock().unwrap().take() {
            timer.abort();
        }
        self.inner.error_watcher.lock().unwrap().take();
        self.inner.tasks.lock().unwrap().clear();
        if let Some(connection) = self.inner.connection.swap(None) {
            connection.close();
        }
    }
}

impl Drop for ControlConnection {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl ControlConnectionInner {
    fn state(&self) -> ControlConnectionState {
        ControlConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn is_shut_down(&self) -> bool {
        self.state() == ControlConnectionState::ShutDown
    }

    /// Moves to `next` unless shut down. Returns whether it did.
    fn set_state(&self, next: ControlConnectionState) -> bool {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            if current == ControlConnectionState::ShutDown.as_u8() {
                return false;
            }
            match self.state.compare_exchange_weak(
                current,
                next.as_u8(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    fn protocol_version(&self) -> ProtocolVersion {
        *self.protocol_version.lock().unwrap()
    }

    fn set_protocol_version(&self, version: ProtocolVersion) {
        *self.protocol_version.lock().unwrap() = version;
    }

    async fn connect_initial(self: &Arc<Self>) -> Result<(), NewClusterError> {
        if self.config.contact_points.is_empty() {
            return Err(NewClusterError::EmptyContactPoints);
        }
        let (addresses, hostnames) = resolve_contact_points(
            &self.config.contact_points,
            self.config.hostname_resolution_timeout,
        )
        .await;
        if addresses.is_empty() {
            return Err(NewClusterError::FailedToResolveAnyHostname(hostnames));
        }

        let known = self
            .metadata
            .hosts()
            .into_iter()
            .filter(|host| !addresses.contains(&host.address()))
            .map(Candidate::Host);
        let candidates = addresses
            .iter()
            .copied()
            .map(Candidate::ContactPoint)
            .chain(known)
            .collect();

        self.connect_any(candidates)
            .await
            .map_err(|errors| NewClusterError::NoHostAvailable { errors })
    }

    /// Tries the candidates in order until one works.
    async fn connect_any(
        self: &Arc<Self>,
        candidates: Vec<Candidate>,
    ) -> Result<(), HashMap<SocketAddr, ConnectionError>> {
        let mut errors = HashMap::new();
        let mut connected = false;

        for candidate in candidates {
            if self.is_shut_down() {
                break;
            }
            let address = candidate.address();
            let endpoint = match &candidate {
                Candidate::ContactPoint(address) => {
                    self.config
                        .endpoint_resolver
                        .resolve_contact_point(*address)
                        .await
                }
                Candidate::Host(host) => self.config.endpoint_resolver.resolve(host).await,
            };
            let attempt = match endpoint {
                Ok(endpoint) => self.connect_to(endpoint).await,
                Err(err) => Err(err),
            };
            match attempt {
                Ok(()) => {
                    connected = true;
                    break;
                }
                Err(err) => {
                    warn!(
                        address = %address,
                        error = %err,
                        "Control connection failed to connect"
                    );
                    if let Candidate::Host(host) = &candidate {
                        self.config.endpoint_resolver.refresh(host).await;
                    }
                    errors.insert(address, err);
                }
            }
        }

        *self.tried_hosts.lock().unwrap() = errors.clone();
        if connected {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Opens a connection to the endpoint, reads the cluster through it and
    /// installs it as the current one.
    ///
    /// Downgrades the protocol version when the node, or any node it knows
    /// about, is too old for it.
    async fn connect_to(self: &Arc<Self>, endpoint: ConnectionEndPoint) -> Result<(), ConnectionError> {
        let mut version = self.protocol_version();
        loop {
            let mut config = self.connection_config.clone();
            config.protocol_version = version;
            let (connection, error_receiver) = match open_connection(endpoint.clone(), &config).await
            {
                Ok(opened) => opened,
                Err(ConnectionError::UnsupportedProtocolVersion(rejected)) => {
                    let Some(lower) = rejected.lower() else {
                        return Err(ConnectionError::UnsupportedProtocolVersion(rejected));
                    };
                    warn!(
                        "{} does not support protocol version {}, downgrading to {}",
                        endpoint, rejected, lower
                    );
                    version = lower;
                    self.set_protocol_version(lower);
                    continue;
                }
                Err(err) => return Err(err),
            };
            let connection = Arc::new(connection);

            let host = self.refresh_node_list(&connection).await?;
            let common = self.metadata.highest_common_protocol_version(version);
            if common < version {
                warn!(
                    "Some hosts don't support protocol version {}, reconnecting to {} with {}",
                    version, endpoint, common
                );
                connection.close();
                version = common;
                self.set_protocol_version(common);
                continue;
            }

            if self.config.fetch_schema_metadata {
                self.metadata.refresh_keyspaces(&connection).await?;
            }
            if self.is_shut_down() {
                connection.close();
                return Err(ConnectionError::BrokenConnection(
                    crate::errors::BrokenConnectionError::Closed,
                ));
            }
            self.set_protocol_version(version);
            self.install(connection, error_receiver, host);
            return Ok(());
        }
    }

    fn install(
        self: &Arc<Self>,
        connection: Arc<Connection>,
        error_receiver: ErrorReceiver,
        host: Option<Arc<Host>>,
    ) {
        self.host.store(host);
        let previous = self.connection.swap(Some(connection.clone()));
        self.watch_connection(&connection, error_receiver);
        if let Some(previous) = previous {
            if !Arc::ptr_eq(&previous, &connection) {
                debug!(
                    "Closing the previous control connection to {}",
                    previous.address()
                );
                previous.close();
            }
        }
        if self.is_shut_down() {
            if let Some(connection) = self.connection.swap(None) {
                connection.close();
            }
        }
    }

    fn watch_connection(self: &Arc<Self>, connection: &Arc<Connection>, error_receiver: ErrorReceiver) {
        let this = Arc::downgrade(self);
        let watched = Arc::downgrade(connection);
        let address = connection.address();
        let (watcher, handle) = async move {
            let Ok(error) = error_receiver.await else {
                return;
            };
            let Some(this) = this.upgrade() else {
                return;
            };
            let is_current = this
                .connection
                .load()
                .as_ref()
                .is_some_and(|current| std::ptr::eq(Arc::as_ptr(current), watched.as_ptr()));
            if !is_current || this.is_shut_down() {
                return;
            }
            warn!(
                address = %address,
                error = %error,
                "Control connection broke, reconnecting"
            );
            this.reconnect_in_background();
        }
        .remote_handle();
        tokio::spawn(watcher);
        *self.error_watcher.lock().unwrap() = Some(handle);
    }

    fn reconnect_in_background(self: &Arc<Self>) {
        // The attempt runs on its own task, nobody has to wait for it.
        let _ = self.shared_reconnect();
    }

    fn shared_reconnect(self: &Arc<Self>) -> ReconnectFuture {
        let mut slot = self.reconnect.lock().unwrap();
        if let Some(running) = slot.as_ref() {
            return running.clone();
        }

        let this = self.clone();
        let attempt = async move {
            let result = this.reconnect_once().await;
            *this.reconnect.lock().unwrap() = None;
            if let Err(NewClusterError::NoHostAvailable { errors }) = &result {
                let delay = this.reconnection_schedule.lock().unwrap().next_delay();
                warn!(
                    "Control connection failed to reconnect, next attempt in {:?}: {}",
                    delay,
                    NewClusterError::NoHostAvailable {
                        errors: errors.clone()
                    }
                );
                this.schedule_retry(delay);
            }
            result
        }
        .boxed()
        .shared();
        *slot = Some(attempt.clone());
        drop(slot);

        tokio::spawn(attempt.clone());
        attempt
    }

    async fn reconnect_once(self: &Arc<Self>) -> Result<(), NewClusterError> {
        if !self.set_state(ControlConnectionState::Reconnecting) {
            return Err(NewClusterError::ShutDown);
        }
        let candidates = self.reconnect_candidates().await;
        debug!(
            "Control connection reconnecting, {} candidates",
            candidates.len()
        );

        match self.connect_any(candidates).await {
            Ok(()) => {
                if !self.set_state(ControlConnectionState::Connected) {
                    return Err(NewClusterError::ShutDown);
                }
                *self.reconnection_schedule.lock().unwrap() =
                    self.config.reconnection_policy.new_schedule();
                if let Some(timer) = self.retry_timer.lock().unwrap().take() {
                    timer.abort();
                }
                info!(
                    "Control connection reconnected to {:?}",
                    self.host.load().as_ref().map(|host| host.address())
                );
                Ok(())
            }
            Err(_) if self.is_shut_down() => Err(NewClusterError::ShutDown),
            Err(errors) => Err(NewClusterError::NoHostAvailable { errors }),
        }
    }

    fn schedule_retry(self: &Arc<Self>, delay: Duration) {
        let this = Arc::downgrade(self);
        let timer = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(this) = this.upgrade() else {
                return;
            };
            if this.state() == ControlConnectionState::Reconnecting {
                let _ = this.shared_reconnect().await;
            }
        });
        *self.retry_timer.lock().unwrap() = Some(timer);
    }

    /// Hosts of a fresh query plan, or the contact points when no host is known.
    async fn reconnect_candidates(&self) -> Vec<Candidate> {
        let plan = self
            .config
            .load_balancing_policy
            .new_query_plan(&self.metadata.hosts());
        if !plan.is_empty() {
            return plan.into_iter().map(Candidate::Host).collect();
        }

        debug!("No host to reconnect to, falling back to the contact points");
        let (addresses, _) = resolve_contact_points(
            &self.config.contact_points,
            self.config.hostname_resolution_timeout,
        )
        .await;
        addresses.into_iter().map(Candidate::ContactPoint).collect()
    }

    /// Reads `system.local` and `system.peers` and replaces the host set.
    ///
    /// Returns the host the connection is connected to.
    async fn refresh_node_list(
        &self,
        connection: &Connection,
    ) -> Result<Option<Arc<Host>>, MetadataError> {
        let (local, peers) = futures::try_join!(query_local(connection), query_peers(connection))?;
        self.metadata
            .set_cluster_info(local.cluster_name, local.partitioner);

        // Peers listen on the port of the node we are connected to, unless
        // we only see them through a proxy.
        let port = match connection.endpoint() {
            ConnectionEndPoint::Direct(address) => address.port(),
            ConnectionEndPoint::Sni { .. } => DEFAULT_PORT,
        };
        let local_address = match connection.endpoint() {
            ConnectionEndPoint::Direct(address) => Some(*address),
            ConnectionEndPoint::Sni { .. } => match local.node.rpc_address {
                Some(rpc_address) => {
                    self.translate(rpc_address, port, &local.node.info).await
                }
                None => {
                    warn!("system.local has no rpc_address, the control connection host is unknown");
                    None
                }
            },
        };

        let mut found = Vec::with_capacity(peers.len() + 1);
        if let Some(address) = local_address {
            found.push((address, local.node.info));
        }
        for peer in peers {
            let Some(rpc_address) = peer.rpc_address else {
                continue;
            };
            if let Some(address) = self.translate(rpc_address, port, &peer.info).await {
                found.push((address, peer.info));
            }
        }

        trace!("Found {} hosts", found.len());
        self.metadata
            .update_hosts(found, self.config.load_balancing_policy.as_ref());
        Ok(local_address.and_then(|address| self.metadata.host(address)))
    }

    async fn translate(&self, rpc_address: IpAddr, port: u16, info: &HostInfo) -> Option<SocketAddr> {
        let untranslated = UntranslatedPeer {
            host_id: info.host_id,
            untranslated_address: SocketAddr::new(rpc_address, port),
            datacenter: info.datacenter.clone(),
            rack: info.rack.clone(),
        };
        match self
            .config
            .address_translator
            .translate_address(&untranslated)
            .await
        {
            Ok(address) => Some(address),
            Err(err) => {
                warn!(
                    "Couldn't translate address {} of host {:?}, skipping it: {}",
                    untranslated.untranslated_address, info.host_id, err
                );
                None
            }
        }
    }

    async fn handle_event(self: &Arc<Self>, event: Event) {
        debug!("Received server event: {:?}", event);
        match event {
            Event::TopologyChange(_) => self.debouncer.schedule(RefreshEvent::Topology),
            Event::StatusChange(change) => self.handle_status_change(change).await,
            Event::SchemaChange(change) => {
                if self.config.fetch_schema_metadata {
                    self.debouncer.schedule(schema_refresh_event(change));
                }
            }
        }
    }

    /// Pools watch the hosts they connect to more closely than the server
    /// does, so a status event only changes hosts without a pool.
    async fn handle_status_change(&self, change: StatusChangeEvent) {
        let (address, up) = match change {
            StatusChangeEvent::Up(address) => (address, true),
            StatusChangeEvent::Down(address) => (address, false),
        };
        let address = match self
            .config
            .address_translator
            .translate_address(&UntranslatedPeer::new(address))
            .await
        {
            Ok(address) => address,
            Err(err) => {
                warn!("Couldn't translate address {} of a status event: {}", address, err);
                return;
            }
        };
        let Some(host) = self.metadata.host(address) else {
            debug!("Status event for unknown host {}", address);
            return;
        };

        let distance = self.config.load_balancing_policy.distance(&host);
        host.set_distance(distance);
        if distance != HostDistance::Ignored {
            trace!(
                "Ignoring status event for {}, its pool tracks its state",
                address
            );
            return;
        }
        if up {
            host.bring_up_if_down();
        } else {
            host.set_down();
        }
    }

    async fn process_refresh(self: &Arc<Self>, batch: RefreshBatch) -> Result<(), MetadataError> {
        let connection = self
            .connection
            .load_full()
            .ok_or(MetadataError::NotConnected)?;
        let result = self.apply_refresh(&connection, batch).await;
        if let Err(MetadataError::Request {
            error: RequestError::BrokenConnection(_),
            ..
        }) = &result
        {
            if !self.is_shut_down() {
                warn!(
                    "Metadata refresh failed on a broken control connection, reconnecting: {:?}",
                    result
                );
                self.reconnect_in_background();
            }
        }
        result
    }

    async fn apply_refresh(
        &self,
        connection: &Connection,
        batch: RefreshBatch,
    ) -> Result<(), MetadataError> {
        if batch.topology {
            if let Some(host) = self.refresh_node_list(connection).await? {
                self.host.store(Some(host));
            }
        }
        if batch.all_keyspaces {
            self.metadata.refresh_keyspaces(connection).await?;
        }
        for (keyspace, refresh) in batch.keyspaces {
            match refresh {
                KeyspaceRefresh::Refresh => {
                    self.metadata.refresh_keyspace(connection, &keyspace).await?
                }
                KeyspaceRefresh::Drop => {
                    if self.metadata.remove_keyspace(&keyspace).is_some() {
                        debug!("Removed dropped keyspace {}", keyspace);
                    }
                }
                KeyspaceRefresh::Invalidate(targets) => {
                    for target in targets {
                        self.invalidate(&keyspace, &target);
                    }
                }
            }
        }
        Ok(())
    }

    fn invalidate(&self, keyspace: &str, target: &SchemaElement) {
        let cleared = match target {
            SchemaElement::Table(name) => self.metadata.clear_table(keyspace, name),
            SchemaElement::Type(name) => self.metadata.clear_type(keyspace, name),
            SchemaElement::Function(signature) => self.metadata.clear_function(keyspace, signature),
            SchemaElement::Aggregate(signature) => {
                self.metadata.clear_aggregate(keyspace, signature)
            }
        };
        if cleared {
            debug!("Invalidated {:?} in keyspace {}", target, keyspace);
        }
    }
}

fn schema_refresh_event(change: SchemaChangeEvent) -> RefreshEvent {
    let SchemaChangeEvent {
        change_type,
        keyspace,
        target,
    } = change;
    let target = match target {
        SchemaChangeTarget::Keyspace => {
            return match change_type {
                SchemaChangeType::Dropped => RefreshEvent::KeyspaceDropped(keyspace),
                SchemaChangeType::Created | SchemaChangeType::Updated => {
                    RefreshEvent::Keyspace(keyspace)
                }
            };
        }
        SchemaChangeTarget::Table(name) => SchemaElement::Table(name),
        SchemaChangeTarget::Type(name) => SchemaElement::Type(name),
        SchemaChangeTarget::Function { name, arguments } => {
            SchemaElement::Function(FunctionSignature::new(name, arguments))
        }
        SchemaChangeTarget::Aggregate { name, arguments } => {
            SchemaElement::Aggregate(FunctionSignature::new(name, arguments))
        }
    };
    RefreshEvent::Invalidate { keyspace, target }
}

struct Refresher(Weak<ControlConnectionInner>);

#[async_trait]
impl RefreshHandler for Refresher {
    async fn process(&self, batch: RefreshBatch) -> Result<(), MetadataError> {
        let inner = self.0.upgrade().ok_or(MetadataError::NotConnected)?;
        inner.process_refresh(batch).await
    }
}

async fn handle_events(inner: Weak<ControlConnectionInner>, mut events: mpsc::Receiver<Event>) {
    while let Some(event) = events.recv().await {
        let Some(inner) = inner.upgrade() else {
            return;
        };
        inner.handle_event(event).await;
    }
}

/// Reconnects when the host of the control connection goes down.
async fn watch_hosts(
    inner: Weak<ControlConnectionInner>,
    mut events: broadcast::Receiver<HostEvent>,
) {
    loop {
        match events.recv().await {
            Ok(HostEvent::Down(host)) => {
                let Some(inner) = inner.upgrade() else {
                    return;
                };
                let is_current = inner
                    .host
                    .load()
                    .as_ref()
                    .is_some_and(|current| Arc::ptr_eq(current, &host));
                if is_current && inner.state() == ControlConnectionState::Connected {
                    info!(
                        "Host {} of the control connection is down, reconnecting",
                        host
                    );
                    inner.reconnect_in_background();
                }
            }
            Ok(_) => {}
            Err(RecvError::Lagged(missed)) => {
                debug!("Control connection missed {} host events", missed);
            }
            Err(RecvError::Closed) => return,
        }
    }
}
