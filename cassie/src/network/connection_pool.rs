use super::connection::{
    open_connection, Connection, ConnectionConfig, ConnectionEvent, ErrorReceiver,
    VerifiedKeyspaceName,
};

use crate::cluster::endpoint::EndPointResolver;
use crate::cluster::host::{Host, HostDistance};
use crate::errors::{BrokenConnectionError, ConnectionError, PoolError, UseKeyspaceError};
use crate::policies::reconnection::{
    ExponentialReconnectionPolicy, ReconnectionPolicy, ReconnectionSchedule,
};

use arc_swap::{ArcSwap, ArcSwapOption};
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

/// Upper bound of the time a draining pool waits for in-flight requests.
const MAX_DRAIN_WAIT: Duration = Duration::from_secs(5 * 60);

/// Settings of the connection pools, shared by all hosts.
#[derive(Clone, Debug)]
pub struct PoolConfig {
    pub connection_config: ConnectionConfig,
    /// Connections kept open to a host at local distance.
    pub core_connections_local: usize,
    /// Upper bound the pool of a local host may grow to under load.
    pub max_connections_local: usize,
    pub core_connections_remote: usize,
    pub max_connections_remote: usize,
    /// A connection with this many requests in flight is busy. Also capped by
    /// the number of stream ids of the protocol version.
    pub max_requests_per_connection: usize,
    /// In-flight requests on the chosen connection above which the pool grows.
    pub grow_threshold: usize,
    /// Minimal time between two attempts to grow the pool.
    pub resize_cooldown: Duration,
    /// A connection with more timed-out requests still waiting for their
    /// response is evicted.
    pub max_timed_out_operations: usize,
    /// Draining waits up to twice this long, at most five minutes.
    pub read_timeout: Duration,
    pub reconnection_policy: Arc<dyn ReconnectionPolicy>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            connection_config: ConnectionConfig::default(),
            core_connections_local: 1,
            max_connections_local: 2,
            core_connections_remote: 1,
            max_connections_remote: 1,
            max_requests_per_connection: 2048,
            grow_threshold: 1500,
            resize_cooldown: Duration::from_secs(2),
            max_timed_out_operations: 64,
            read_timeout: Duration::from_secs(12),
            reconnection_policy: Arc::new(ExponentialReconnectionPolicy::default()),
        }
    }
}

impl PoolConfig {
    fn core_connections(&self, distance: HostDistance) -> usize {
        match distance {
            HostDistance::Local => self.core_connections_local,
            HostDistance::Remote => self.core_connections_remote,
            HostDistance::Ignored => 0,
        }
    }

    fn max_connections(&self, distance: HostDistance) -> usize {
        match distance {
            HostDistance::Local => self.max_connections_local,
            HostDistance::Remote => self.max_connections_remote,
            HostDistance::Ignored => 0,
        }
    }

    fn drain_window(&self) -> Duration {
        self.read_timeout.saturating_mul(2).min(MAX_DRAIN_WAIT)
    }
}

/// Lifecycle of a pool.
///
/// `Init` and `Closing` alternate while the host is ignored and un-ignored;
/// `ShuttingDown` leads to the terminal `Shutdown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolState {
    Init,
    Closing,
    ShuttingDown,
    Shutdown,
}

impl PoolState {
    fn as_u8(self) -> u8 {
        match self {
            PoolState::Init => 0,
            PoolState::Closing => 1,
            PoolState::ShuttingDown => 2,
            PoolState::Shutdown => 3,
        }
    }

    fn from_u8(value: u8) -> PoolState {
        match value {
            0 => PoolState::Init,
            1 => PoolState::Closing,
            2 => PoolState::ShuttingDown,
            _ => PoolState::Shutdown,
        }
    }
}

/// Something the owner of a pool may want to react to.
#[derive(Debug, Clone)]
pub enum PoolEvent {
    /// The last connection of the pool was lost. Unless the pool is closing,
    /// a reconnection is scheduled as well.
    AllConnectionsClosed { address: SocketAddr },
}

type ConnectionCreation = Shared<BoxFuture<'static, Result<Arc<Connection>, PoolError>>>;

struct PoolInner {
    host: Arc<Host>,
    config: PoolConfig,
    resolver: Arc<dyn EndPointResolver>,

    // Copy-on-write; borrowers only ever load a snapshot.
    connections: ArcSwap<Vec<Arc<Connection>>>,
    state: AtomicU8,
    creation: StdMutex<Option<ConnectionCreation>>,
    index: AtomicUsize,

    growing: AtomicBool,
    last_resize: StdMutex<Option<Instant>>,

    reconnecting: AtomicBool,
    reconnection_schedule: StdMutex<Box<dyn ReconnectionSchedule>>,
    reconnect_task: StdMutex<Option<JoinHandle<()>>>,

    keyspace: ArcSwapOption<VerifiedKeyspaceName>,
    events: broadcast::Sender<PoolEvent>,
}

/// The connections of a session to one host.
///
/// The pool starts empty. The first borrow opens a connection; concurrent
/// borrowers wait for that same connection. Afterwards the pool fills up to
/// its core size in the background and grows while its connections are busy.
pub struct HostConnectionPool {
    inner: Arc<PoolInner>,
}

impl std::fmt::Debug for HostConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostConnectionPool")
            .field("address", &self.inner.host.address())
            .field("state", &self.state())
            .field("connections", &self.inner.connections.load().len())
            .finish_non_exhaustive()
    }
}

impl HostConnectionPool {
    pub fn new(
        host: Arc<Host>,
        config: PoolConfig,
        resolver: Arc<dyn EndPointResolver>,
        keyspace: Option<VerifiedKeyspaceName>,
    ) -> Self {
        let (events, _) = broadcast::channel(16);
        let schedule = config.reconnection_policy.new_schedule();
        Self {
            inner: Arc::new(PoolInner {
                host,
                resolver,
                connections: ArcSwap::from_pointee(Vec::new()),
                state: AtomicU8::new(PoolState::Init.as_u8()),
                creation: StdMutex::new(None),
                index: AtomicUsize::new(0),
                growing: AtomicBool::new(false),
                last_resize: StdMutex::new(None),
                reconnecting: AtomicBool::new(false),
                reconnection_schedule: StdMutex::new(schedule),
                reconnect_task: StdMutex::new(None),
                keyspace: ArcSwapOption::new(keyspace.map(Arc::new)),
                events,
                config,
            }),
        }
    }

    pub fn host(&self) -> &Arc<Host> {
        &self.inner.host
    }

    pub fn state(&self) -> PoolState {
        self.inner.state()
    }

    /// Number of open connections.
    pub fn open_connections(&self) -> usize {
        self.inner.connections.load().len()
    }

    /// A snapshot of the connections, for callers that need all of them.
    pub fn connections(&self) -> Arc<Vec<Arc<Connection>>> {
        self.inner.connections.load_full()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.inner.events.subscribe()
    }

    /// Returns the least busy connection, opening the first one if the pool is empty.
    pub async fn borrow_connection(&self) -> Result<Arc<Connection>, PoolError> {
        self.inner.check_open()?;

        let connections = self.inner.connections.load_full();
        if connections.is_empty() {
            let connection = PoolInner::create_shared(&self.inner).await?;
            if connection.is_closed() {
                return Err(PoolError::NoConnections);
            }
            return self.check_busy(connection, 1);
        }

        let connection = self.inner.least_busy(&connections);
        self.check_busy(connection, connections.len())
    }

    fn check_busy(
        &self,
        connection: Arc<Connection>,
        pool_size: usize,
    ) -> Result<Arc<Connection>, PoolError> {
        let in_flight = connection.in_flight();
        PoolInner::maybe_grow(&self.inner, in_flight, pool_size);

        let limit = self
            .inner
            .config
            .max_requests_per_connection
            .min(connection.protocol_version().max_stream_ids());
        if in_flight >= limit {
            return Err(PoolError::Busy {
                address: self.inner.host.address(),
                in_flight,
            });
        }
        Ok(connection)
    }

    /// Opens connections until the pool reaches its core size.
    ///
    /// Returns right away if the pool is already being filled or grown.
    pub async fn warmup(&self) -> Result<(), PoolError> {
        self.inner.check_open()?;
        if !self.inner.start_growing() {
            trace!("[{}] The pool is already filling up", self.inner.host.address());
            return Ok(());
        }
        let result = async {
            while self.open_connections() < self.inner.core_size() {
                self.inner.check_open()?;
                PoolInner::open_and_add(&self.inner).await?;
            }
            Ok(())
        }
        .await;
        self.inner.growing.store(false, Ordering::Release);
        result
    }

    /// Switches every open connection to the keyspace. Connections opened
    /// later switch to it before they are handed out.
    pub async fn use_keyspace(&self, keyspace: &VerifiedKeyspaceName) -> Result<(), UseKeyspaceError> {
        self.inner.keyspace.store(Some(Arc::new(keyspace.clone())));
        let connections = self.inner.connections.load_full();
        let results =
            futures::future::join_all(connections.iter().map(|conn| conn.use_keyspace(keyspace)))
                .await;
        results.into_iter().collect()
    }

    /// Drains the pool because its host became ignored: new borrows are
    /// refused, in-flight requests get a chance to finish, then every
    /// connection is closed. The pool then returns to `Init`, empty.
    pub async fn drain(&self) {
        if !self.inner.transition(PoolState::Init, PoolState::Closing) {
            return;
        }
        debug!("[{}] Draining the pool", self.inner.host.address());
        self.inner.cancel_reconnection();
        self.inner.drain_connections().await;
        self.inner.transition(PoolState::Closing, PoolState::Init);
    }

    /// Drains the pool and shuts it down for good.
    pub async fn shutdown(&self) {
        loop {
            let current = self.inner.state();
            match current {
                PoolState::ShuttingDown | PoolState::Shutdown => return,
                PoolState::Init | PoolState::Closing => {}
            }
            if self.inner.transition(current, PoolState::ShuttingDown) {
                break;
            }
        }
        debug!("[{}] Shutting down the pool", self.inner.host.address());
        self.inner.cancel_reconnection();
        self.inner.drain_connections().await;
        self.inner
            .state
            .store(PoolState::Shutdown.as_u8(), Ordering::Release);
    }

    /// Schedules a reconnection right away, e.g. after the host came back up.
    pub fn reconnect_now(&self) {
        *self.inner.reconnection_schedule.lock().unwrap() =
            self.inner.config.reconnection_policy.new_schedule();
        PoolInner::schedule_reconnection(&self.inner);
    }
}

impl PoolInner {
    fn state(&self) -> PoolState {
        PoolState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn transition(&self, from: PoolState, to: PoolState) -> bool {
        self.state
            .compare_exchange(from.as_u8(), to.as_u8(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn check_open(&self) -> Result<(), PoolError> {
        match self.state() {
            PoolState::Init => {}
            PoolState::Closing => return Err(PoolError::Closing),
            PoolState::ShuttingDown | PoolState::Shutdown => return Err(PoolError::ShutDown),
        }
        if self.host.distance() == HostDistance::Ignored {
            return Err(PoolError::HostIgnored);
        }
        Ok(())
    }

    /// Claims the right to open connections beyond the first one.
    fn start_growing(&self) -> bool {
        self.growing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn core_size(&self) -> usize {
        self.config.core_connections(self.host.distance()).max(1)
    }

    fn max_size(&self) -> usize {
        self.config
            .max_connections(self.host.distance())
            .max(self.core_size())
    }

    /// Looks at the connection under the round-robin index and the next one.
    /// Only if both are above the growth threshold does it look further.
    fn least_busy(&self, connections: &[Arc<Connection>]) -> Arc<Connection> {
        let len = connections.len();
        let start = self.index.fetch_add(1, Ordering::Relaxed);

        let mut best = &connections[start % len];
        let mut best_in_flight = best.in_flight();
        for offset in 1..len {
            if best_in_flight == 0 || (offset >= 2 && best_in_flight < self.config.grow_threshold) {
                break;
            }
            let candidate = &connections[(start + offset) % len];
            let in_flight = candidate.in_flight();
            if in_flight < best_in_flight {
                best = candidate;
                best_in_flight = in_flight;
            }
        }
        best.clone()
    }

    /// Opens one connection. Concurrent callers share the same attempt.
    async fn create_shared(this: &Arc<PoolInner>) -> Result<Arc<Connection>, PoolError> {
        let creation = {
            let mut slot = this.creation.lock().unwrap();
            match &*slot {
                Some(creation) => creation.clone(),
                None => {
                    let weak = Arc::downgrade(this);
                    let creation = async move {
                        let Some(pool) = weak.upgrade() else {
                            return Err(PoolError::ShutDown);
                        };
                        let result = PoolInner::open_and_add(&pool).await;
                        // The connection is listed already, later borrowers won't come here.
                        pool.creation.lock().unwrap().take();
                        if result.is_ok() {
                            PoolInner::fill_to_core(&pool);
                        }
                        result
                    }
                    .boxed()
                    .shared();
                    *slot = Some(creation.clone());
                    creation
                }
            }
        };
        creation.await
    }

    async fn open_and_add(this: &Arc<PoolInner>) -> Result<Arc<Connection>, PoolError> {
        let (connection, error_receiver) = match this.open().await {
            Ok(opened) => opened,
            Err(err) => {
                this.resolver.refresh(&this.host).await;
                return Err(PoolError::ConnectionFailed(err));
            }
        };

        if let Some(keyspace) = this.keyspace.load_full() {
            if let Err(err) = connection.use_keyspace(&keyspace).await {
                warn!(
                    "[{}] Failed to set keyspace for new connection: {}",
                    this.host.address(),
                    err
                );
            }
        }

        let connection = Arc::new(connection);
        let max_size = this.max_size();
        let mut added = false;
        this.connections.rcu(|connections| {
            let mut connections = Vec::clone(connections);
            added = connections.len() < max_size;
            if added {
                connections.push(connection.clone());
            }
            connections
        });
        if !added {
            debug!(
                "[{}] The pool is full, closing the extra connection",
                this.host.address()
            );
            connection.close();
            let connections = this.connections.load_full();
            if connections.is_empty() {
                return Err(PoolError::NoConnections);
            }
            return Ok(this.least_busy(&connections));
        }
        // A drain or shutdown may have started while the connection was
        // opening, and may have taken the connections out already.
        if this.state() != PoolState::Init {
            Self::forget_connection(this, &connection);
            connection.close();
            return Err(match this.state() {
                PoolState::Closing => PoolError::Closing,
                _ => PoolError::ShutDown,
            });
        }
        // The pool may have switched keyspaces while this connection was opening.
        if let Some(keyspace) = this.keyspace.load_full() {
            if connection.current_keyspace().as_deref() != Some(&*keyspace) {
                if let Err(err) = connection.use_keyspace(&keyspace).await {
                    warn!(
                        "[{}] Failed to set keyspace for new connection: {}",
                        this.host.address(),
                        err
                    );
                }
            }
        }

        let events = connection.subscribe();
        tokio::spawn(Self::watch(
            Arc::downgrade(this),
            Arc::downgrade(&connection),
            error_receiver,
            events,
        ));
        trace!(
            "[{}] Added connection, the pool has {}",
            this.host.address(),
            this.connections.load().len()
        );
        Ok(connection)
    }

    async fn open(&self) -> Result<(Connection, ErrorReceiver), ConnectionError> {
        let endpoint = self.resolver.resolve(&self.host).await?;
        open_connection(endpoint, &self.config.connection_config).await
    }

    /// Keeps an eye on one connection: removes it once it breaks and evicts it
    /// once too many of its operations time out.
    async fn watch(
        pool: Weak<PoolInner>,
        connection: Weak<Connection>,
        mut error_receiver: ErrorReceiver,
        mut events: broadcast::Receiver<ConnectionEvent>,
    ) {
        let reason = loop {
            tokio::select! {
                error = &mut error_receiver => {
                    break error.unwrap_or(BrokenConnectionError::Closed);
                }
                event = events.recv() => match event {
                    Ok(ConnectionEvent::OperationTimedOut)
                    | Err(broadcast::error::RecvError::Lagged(_)) => {
                        if let (Some(pool), Some(conn)) = (pool.upgrade(), connection.upgrade()) {
                            pool.evict_if_unhealthy(&conn);
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Closed) => break BrokenConnectionError::Closed,
                },
            }
        };

        if let Some(pool) = pool.upgrade() {
            PoolInner::remove_connection(&pool, &connection, reason);
        }
    }

    fn evict_if_unhealthy(&self, connection: &Connection) {
        let timed_out = connection.timed_out_operations();
        if timed_out <= self.config.max_timed_out_operations {
            return;
        }
        warn!(
            "[{}] Evicting connection with {} timed out operations",
            self.host.address(),
            timed_out
        );
        connection.close_with(BrokenConnectionError::TooManyTimedOutOperations(timed_out));
    }

    /// Takes the connection off the list. Returns whether it was listed.
    fn forget_connection(this: &Arc<PoolInner>, connection: &Arc<Connection>) -> bool {
        Self::forget_ptr(this, Arc::as_ptr(connection))
    }

    fn forget_ptr(this: &Arc<PoolInner>, ptr: *const Connection) -> bool {
        let previous = this.connections.rcu(|connections| {
            connections
                .iter()
                .filter(|conn| !std::ptr::eq(Arc::as_ptr(conn), ptr))
                .cloned()
                .collect::<Vec<_>>()
        });
        previous.iter().any(|conn| std::ptr::eq(Arc::as_ptr(conn), ptr))
    }

    fn remove_connection(
        this: &Arc<PoolInner>,
        connection: &Weak<Connection>,
        reason: BrokenConnectionError,
    ) {
        if !Self::forget_ptr(this, connection.as_ptr()) {
            return;
        }

        let remaining = this.connections.load().len();
        debug!(
            "[{}] Removed connection ({}), {} left",
            this.host.address(),
            reason,
            remaining
        );
        if remaining == 0 {
            Self::on_all_connections_closed(this);
        }
    }

    fn on_all_connections_closed(this: &Arc<PoolInner>) {
        let address = this.host.address();
        let _ = this.events.send(PoolEvent::AllConnectionsClosed { address });

        if this.state() != PoolState::Init || this.host.distance() == HostDistance::Ignored {
            return;
        }
        info!("[{}] All connections closed, scheduling reconnection", address);
        Self::schedule_reconnection(this);
    }

    fn schedule_reconnection(this: &Arc<PoolInner>) {
        if this.state() != PoolState::Init {
            return;
        }
        if this
            .reconnecting
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        let delay = this.reconnection_schedule.lock().unwrap().next_delay();
        debug!(
            "[{}] Next reconnection attempt in {} ms",
            this.host.address(),
            delay.as_millis()
        );
        let weak = Arc::downgrade(this);
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(pool) = weak.upgrade() else {
                return;
            };
            if pool.state() != PoolState::Init {
                pool.reconnecting.store(false, Ordering::Release);
                return;
            }

            let result = if pool.connections.load().is_empty() {
                PoolInner::create_shared(&pool).await.map(|_| ())
            } else {
                Ok(())
            };
            pool.reconnecting.store(false, Ordering::Release);
            match result {
                Ok(()) => {
                    *pool.reconnection_schedule.lock().unwrap() =
                        pool.config.reconnection_policy.new_schedule();
                    pool.host.bring_up_if_down();
                }
                Err(err) => {
                    warn!("[{}] Reconnection failed: {}", pool.host.address(), err);
                    pool.host.set_down();
                    PoolInner::schedule_reconnection(&pool);
                }
            }
        });

        *this.reconnect_task.lock().unwrap() = Some(task);
    }

    fn cancel_reconnection(&self) {
        if let Some(task) = self.reconnect_task.lock().unwrap().take() {
            task.abort();
        }
        self.reconnecting.store(false, Ordering::Release);
    }

    /// Grows the pool by one connection in the background when the chosen
    /// connection is loaded, at most once per cooldown.
    fn maybe_grow(this: &Arc<PoolInner>, in_flight: usize, pool_size: usize) {
        if in_flight < this.config.grow_threshold || pool_size >= this.max_size() {
            return;
        }
        {
            let mut last_resize = this.last_resize.lock().unwrap();
            if last_resize.is_some_and(|at| at.elapsed() < this.config.resize_cooldown) {
                return;
            }
            if !this.start_growing() {
                return;
            }
            *last_resize = Some(Instant::now());
        }

        debug!(
            "[{}] Growing the pool, {} requests in flight on {} connections",
            this.host.address(),
            in_flight,
            pool_size
        );
        let pool = this.clone();
        tokio::spawn(async move {
            if let Err(err) = PoolInner::open_and_add(&pool).await {
                warn!("[{}] Failed to grow the pool: {}", pool.host.address(), err);
            }
            pool.growing.store(false, Ordering::Release);
        });
    }

    /// Opens the rest of the core connections in the background.
    fn fill_to_core(this: &Arc<PoolInner>) {
        if this.connections.load().len() >= this.core_size() || !this.start_growing() {
            return;
        }
        let weak = Arc::downgrade(this);
        tokio::spawn(async move {
            while let Some(pool) = weak.upgrade() {
                if pool.state() != PoolState::Init
                    || pool.connections.load().len() >= pool.core_size()
                {
                    pool.growing.store(false, Ordering::Release);
                    return;
                }
                if let Err(err) = PoolInner::open_and_add(&pool).await {
                    debug!("[{}] Failed to fill the pool: {}", pool.host.address(), err);
                    pool.growing.store(false, Ordering::Release);
                    return;
                }
            }
        });
    }

    /// Takes every connection out of the pool and closes each of them once
    /// it is idle or the drain window has passed.
    async fn drain_connections(&self) {
        let connections = self.connections.swap(Arc::new(Vec::new()));
        let window = self.config.drain_window();
        let drains = connections.iter().map(|connection| async move {
            if tokio::time::timeout(window, connection.wait_until_idle())
                .await
                .is_err()
            {
                debug!(
                    "[{}] Closing connection with {} requests still in flight",
                    self.host.address(),
                    connection.in_flight()
                );
            }
            connection.close();
        });
        futures::future::join_all(drains).await;
    }
}

impl Drop for PoolInner {
    fn drop(&mut self) {
        if let Some(task) = self.reconnect_task.get_mut().ok().and_then(Option::take) {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::endpoint::DefaultEndPointResolver;
    use crate::cluster::host::HostInfo;
    use crate::policies::reconnection::ConstantReconnectionPolicy;
    use crate::utils::test_utils::{setup_tracing, MockNode, MockNodeConfig, MockReply};
    use assert_matches::assert_matches;
    use cassie_cql::frame::request::Query;
    use cassie_cql::Consistency;
    use ntest::timeout;

    fn host(address: SocketAddr, distance: HostDistance) -> Arc<Host> {
        let (events, _) = broadcast::channel(16);
        Host::new(address, HostInfo::default(), distance, events)
    }

    fn test_config() -> PoolConfig {
        PoolConfig {
            reconnection_policy: Arc::new(ConstantReconnectionPolicy::new(Duration::from_millis(50))),
            read_timeout: Duration::from_millis(200),
            ..Default::default()
        }
    }

    fn pool_for(node: &MockNode, config: PoolConfig) -> HostConnectionPool {
        HostConnectionPool::new(
            host(node.address(), HostDistance::Local),
            config,
            Arc::new(DefaultEndPointResolver),
            None,
        )
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    #[timeout(10000)]
    async fn concurrent_borrows_share_one_connection_attempt() {
        setup_tracing();
        let node = MockNode::start(MockNodeConfig::default()).await;
        let pool = pool_for(&node, test_config());

        let borrows = (0..10).map(|_| pool.borrow_connection());
        let connections: Vec<_> = futures::future::join_all(borrows)
            .await
            .into_iter()
            .map(Result::unwrap)
            .collect();

        assert_eq!(node.accepted_connections(), 1);
        assert!(connections
            .iter()
            .all(|conn| Arc::ptr_eq(conn, &connections[0])));
        assert_eq!(pool.open_connections(), 1);
    }

    #[tokio::test]
    #[timeout(10000)]
    async fn concurrent_borrows_share_one_failure() {
        setup_tracing();
        let address = MockNode::unused_address().await;
        let pool = HostConnectionPool::new(
            host(address, HostDistance::Local),
            test_config(),
            Arc::new(DefaultEndPointResolver),
            None,
        );

        let borrows = (0..10).map(|_| pool.borrow_connection());
        for result in futures::future::join_all(borrows).await {
            assert_matches!(result, Err(PoolError::ConnectionFailed(_)));
        }
    }

    #[tokio::test]
    #[timeout(10000)]
    async fn lost_connection_is_replaced() {
        setup_tracing();
        let node = MockNode::start(MockNodeConfig::default()).await;
        let pool = pool_for(&node, test_config());
        let mut events = pool.subscribe();

        let first = pool.borrow_connection().await.unwrap();
        node.drop_connections();

        assert_matches!(
            events.recv().await,
            Ok(PoolEvent::AllConnectionsClosed { address }) if address == node.address()
        );
        wait_until(|| pool.open_connections() == 1).await;

        let second = pool.borrow_connection().await.unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert!(first.is_closed());
        assert_eq!(node.accepted_connections(), 2);
    }

    #[tokio::test]
    #[timeout(10000)]
    async fn reconnection_keeps_trying_until_the_host_accepts() {
        setup_tracing();
        let node = MockNode::start(MockNodeConfig::default()).await;
        let pool = pool_for(&node, test_config());
        pool.borrow_connection().await.unwrap();

        node.set_refusing(true);
        node.drop_connections();
        wait_until(|| !pool.host().is_up()).await;
        assert_eq!(pool.open_connections(), 0);

        node.set_refusing(false);
        wait_until(|| pool.open_connections() == 1 && pool.host().is_up()).await;
    }

    #[tokio::test]
    #[timeout(10000)]
    async fn warmup_opens_core_connections() {
        setup_tracing();
        let node = MockNode::start(MockNodeConfig::default()).await;
        let pool = pool_for(
            &node,
            PoolConfig {
                core_connections_local: 3,
                max_connections_local: 4,
                ..test_config()
            },
        );

        pool.warmup().await.unwrap();
        assert_eq!(pool.open_connections(), 3);
        assert_eq!(node.accepted_connections(), 3);
    }

    #[tokio::test]
    #[timeout(10000)]
    async fn busy_connection_is_reported_and_pool_grows() {
        setup_tracing();
        let node = MockNode::start(MockNodeConfig::default().with_handler(|query| {
            query.starts_with("SELECT hang").then_some(MockReply::NoReply)
        }))
        .await;
        let pool = pool_for(
            &node,
            PoolConfig {
                max_requests_per_connection: 4,
                grow_threshold: 2,
                resize_cooldown: Duration::ZERO,
                ..test_config()
            },
        );

        let connection = pool.borrow_connection().await.unwrap();
        let hanging: Vec<_> = (0..4)
            .map(|_| {
                connection.send_with_callback(
                    &Query::new("SELECT hang", Consistency::One),
                    Some(Duration::from_secs(60)),
                    Box::new(|_| {}),
                )
            })
            .collect();

        assert_matches!(
            pool.borrow_connection().await,
            Err(PoolError::Busy { in_flight: 4, .. })
        );
        wait_until(|| pool.open_connections() == 2).await;

        let other = pool.borrow_connection().await.unwrap();
        assert!(!Arc::ptr_eq(&other, &connection));
        assert_eq!(other.in_flight(), 0);
        drop(hanging);
    }

    #[tokio::test]
    #[timeout(10000)]
    async fn connection_with_many_timeouts_is_evicted() {
        setup_tracing();
        let node = MockNode::start(MockNodeConfig::default().with_handler(|query| {
            query.starts_with("SELECT hang").then_some(MockReply::NoReply)
        }))
        .await;
        let pool = pool_for(
            &node,
            PoolConfig {
                max_timed_out_operations: 2,
                ..test_config()
            },
        );

        let connection = pool.borrow_connection().await.unwrap();
        let query = Query::new("SELECT hang", Consistency::One);
        let timeouts =
            (0..3).map(|_| connection.send(&query, Some(Duration::from_millis(20))));
        for result in futures::future::join_all(timeouts).await {
            assert_matches!(result, Err(crate::errors::RequestError::Timeout(_)));
        }

        wait_until(|| connection.is_closed()).await;
        // The evicted connection is replaced like any other lost one.
        wait_until(|| {
            pool.connections()
                .iter()
                .any(|conn| !Arc::ptr_eq(conn, &connection))
        })
        .await;
    }

    #[tokio::test]
    #[timeout(10000)]
    async fn drain_waits_for_in_flight_requests() {
        setup_tracing();
        let node = MockNode::start(MockNodeConfig::default().with_handler(|query| {
            query.starts_with("SELECT slow").then(|| {
                MockReply::Delayed(Duration::from_millis(100), Box::new(MockReply::Void))
            })
        }))
        .await;
        let pool = pool_for(&node, test_config());

        let connection = pool.borrow_connection().await.unwrap();
        let query = Query::new("SELECT slow", Consistency::One);
        let slow = connection.send(&query, None);

        let (result, ()) = tokio::join!(slow, async {
            wait_until(|| connection.in_flight() == 1).await;
            let drain = pool.drain();
            tokio::pin!(drain);
            // Borrowing is refused as soon as draining starts.
            assert!((&mut drain).now_or_never().is_none());
            assert_matches!(pool.borrow_connection().await, Err(PoolError::Closing));
            drain.await;
        });

        assert!(result.is_ok());
        assert!(connection.is_closed());
        assert_eq!(pool.state(), PoolState::Init);
        assert_eq!(pool.open_connections(), 0);

        // Back in business once the host is used again.
        pool.borrow_connection().await.unwrap();
    }

    #[tokio::test]
    #[timeout(10000)]
    async fn drain_gives_up_after_the_window() {
        setup_tracing();
        let node = MockNode::start(MockNodeConfig::default().with_handler(|query| {
            query.starts_with("SELECT hang").then_some(MockReply::NoReply)
        }))
        .await;
        let pool = pool_for(&node, test_config());

        let connection = pool.borrow_connection().await.unwrap();
        let query = Query::new("SELECT hang", Consistency::One);
        let hanging = connection.send(&query, Some(Duration::from_secs(60)));

        let (result, ()) = tokio::join!(hanging, async {
            wait_until(|| connection.in_flight() == 1).await;
            // The window is twice the read timeout of 200 ms.
            pool.shutdown().await;
        });

        assert_matches!(result, Err(crate::errors::RequestError::BrokenConnection(_)));
        assert_eq!(pool.state(), PoolState::Shutdown);
        assert_matches!(pool.borrow_connection().await, Err(PoolError::ShutDown));
        pool.shutdown().await;
        assert_eq!(pool.state(), PoolState::Shutdown);
    }

    #[tokio::test]
    #[timeout(10000)]
    async fn ignored_host_is_not_connected() {
        setup_tracing();
        let node = MockNode::start(MockNodeConfig::default()).await;
        let pool = HostConnectionPool::new(
            host(node.address(), HostDistance::Ignored),
            test_config(),
            Arc::new(DefaultEndPointResolver),
            None,
        );
        assert_matches!(pool.borrow_connection().await, Err(PoolError::HostIgnored));
        assert_eq!(node.accepted_connections(), 0);
    }

    #[tokio::test]
    #[timeout(10000)]
    async fn new_connections_use_the_pool_keyspace() {
        setup_tracing();
        let node = MockNode::start(MockNodeConfig::default()).await;
        let pool = pool_for(
            &node,
            PoolConfig {
                core_connections_local: 2,
                ..test_config()
            },
        );
        let ks = VerifiedKeyspaceName::new("ks".to_string(), false).unwrap();

        let first = pool.borrow_connection().await.unwrap();
        pool.use_keyspace(&ks).await.unwrap();
        assert_eq!(first.current_keyspace().as_deref(), Some(&ks));

        wait_until(|| {
            pool.open_connections() == 2
                && pool
                    .connections()
                    .iter()
                    .all(|conn| conn.current_keyspace().as_deref() == Some(&ks))
        })
        .await;
    }

    #[tokio::test]
    #[timeout(10000)]
    async fn concurrent_warmups_stay_within_the_max_size() {
        setup_tracing();
        let node = MockNode::start(MockNodeConfig::default()).await;
        let pool = pool_for(
            &node,
            PoolConfig {
                core_connections_local: 2,
                max_connections_local: 2,
                ..test_config()
            },
        );

        let (first, second, third) = futures::join!(pool.warmup(), pool.warmup(), pool.warmup());
        first.unwrap();
        second.unwrap();
        third.unwrap();
        wait_until(|| pool.open_connections() == 2).await;
        let connection = pool.borrow_connection().await.unwrap();
        assert!(!connection.is_closed());

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(pool.open_connections(), 2);
        assert_eq!(node.accepted_connections(), 2);
    }

    #[tokio::test]
    #[timeout(10000)]
    async fn connection_opened_during_shutdown_is_closed() {
        setup_tracing();
        let node = MockNode::start(MockNodeConfig::default().with_handler(|query| {
            query.starts_with("USE ").then(|| {
                MockReply::Delayed(
                    Duration::from_millis(300),
                    Box::new(MockReply::SetKeyspace("ks".to_string())),
                )
            })
        }))
        .await;
        let ks = VerifiedKeyspaceName::new("ks".to_string(), false).unwrap();
        let pool = Arc::new(HostConnectionPool::new(
            host(node.address(), HostDistance::Local),
            test_config(),
            Arc::new(DefaultEndPointResolver),
            Some(ks),
        ));

        let warmup = tokio::spawn({
            let pool = pool.clone();
            async move { pool.warmup().await }
        });
        // The handshake is done, the keyspace is being set.
        wait_until(|| node.received_queries().iter().any(|q| q.starts_with("USE "))).await;
        pool.shutdown().await;
        assert_eq!(pool.state(), PoolState::Shutdown);

        assert_matches!(warmup.await.unwrap(), Err(PoolError::ShutDown));
        assert_eq!(pool.open_connections(), 0);
    }

    #[test]
    fn drain_window_is_capped() {
        let config = PoolConfig {
            read_timeout: Duration::from_secs(10),
            ..Default::default()
        };
        assert_eq!(config.drain_window(), Duration::from_secs(20));

        let config = PoolConfig {
            read_timeout: Duration::from_secs(600),
            ..Default::default()
        };
        assert_eq!(config.drain_window(), MAX_DRAIN_WAIT);
    }
}
