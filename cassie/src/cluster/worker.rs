use crate::cluster::control_connection::{ControlConnection, ControlConnectionConfig};
use crate::cluster::endpoint::EndPointResolver;
use crate::cluster::host::{Host, HostDistance, HostEvent};
use crate::cluster::metadata::Metadata;
use crate::errors::{NewClusterError, PoolError, RequestError, UseKeyspaceError};
use crate::network::{Connection, HostConnectionPool, PoolConfig, VerifiedKeyspaceName};

use arc_swap::ArcSwapOption;
use dashmap::DashMap;
use futures::future::join_all;
use futures::{future::RemoteHandle, FutureExt};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, trace, warn};

/// Settings of a [`Cluster`].
#[derive(Debug, Clone, Default)]
pub struct ClusterConfig {
    pub control_connection: ControlConnectionConfig,
    /// The protocol version of its connection config is replaced by the one
    /// negotiated by the control connection.
    pub pool: PoolConfig,
}

/// Cluster keeps a connection pool to every host that is not ignored and
/// follows the host set maintained by the control connection.
pub struct Cluster {
    control_connection: Arc<ControlConnection>,
    pools: Arc<Pools>,

    _worker_handle: RemoteHandle<()>,
}

impl std::fmt::Debug for Cluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cluster")
            .field("control_connection", &self.control_connection)
            .field("pools", &self.pools.by_address.len())
            .finish_non_exhaustive()
    }
}

// The pools, shared between `Cluster` and `ClusterWorker`.
struct Pools {
    by_address: DashMap<SocketAddr, Arc<HostConnectionPool>>,
    config: PoolConfig,
    resolver: Arc<dyn EndPointResolver>,
    keyspace: ArcSwapOption<VerifiedKeyspaceName>,
}

impl Pools {
    /// Makes the pool of the host match its distance: creates and warms up
    /// a missing one, drains the pool of an ignored host. A drained pool
    /// stays around, empty, until the host is used again.
    fn sync(&self, host: &Arc<Host>, control_connection: &ControlConnection) {
        let address = host.address();
        if host.distance() == HostDistance::Ignored {
            if let Some(pool) = self.by_address.get(&address).map(|pool| pool.value().clone()) {
                debug!("Host {} is ignored, draining its pool", address);
                tokio::spawn(async move { pool.drain().await });
            }
            return;
        }

        let existing = self.by_address.get(&address).map(|pool| pool.value().clone());
        let pool = match existing {
            Some(pool) if pool.open_connections() > 0 => return,
            Some(pool) => pool,
            None => {
                let mut config = self.config.clone();
                config.connection_config.protocol_version = control_connection.protocol_version();
                let keyspace = self.keyspace.load().as_deref().cloned();
                self.by_address
                    .entry(address)
                    .or_insert_with(|| {
                        trace!("Creating a pool for host {}", address);
                        Arc::new(HostConnectionPool::new(
                            host.clone(),
                            config,
                            self.resolver.clone(),
                            keyspace,
                        ))
                    })
                    .clone()
            }
        };

        tokio::spawn(async move {
            if let Err(err) = pool.warmup().await {
                debug!("Couldn't fill the pool of {}: {}", address, err);
            }
        });
    }

    fn remove(&self, address: SocketAddr) {
        if let Some((_, pool)) = self.by_address.remove(&address) {
            debug!("Host {} was removed, shutting down its pool", address);
            tokio::spawn(async move { pool.shutdown().await });
        }
    }
}

// Works in the background to keep the pools in line with the host set.
struct ClusterWorker {
    control_connection: Arc<ControlConnection>,
    pools: Arc<Pools>,
    host_events: broadcast::Receiver<HostEvent>,
}

impl Cluster {
    /// Initializes the control connection and opens pools to the hosts it found.
    pub async fn connect(config: ClusterConfig) -> Result<Cluster, NewClusterError> {
        let metadata = Arc::new(Metadata::new());
        let host_events = metadata.subscribe();
        let resolver = config.control_connection.endpoint_resolver.clone();
        let control_connection = Arc::new(ControlConnection::new(
            config.control_connection,
            metadata.clone(),
        ));
        control_connection.init().await?;

        let pools = Arc::new(Pools {
            by_address: DashMap::new(),
            config: config.pool,
            resolver,
            keyspace: ArcSwapOption::empty(),
        });
        for host in metadata.hosts() {
            pools.sync(&host, &control_connection);
        }

        let worker = ClusterWorker {
            control_connection: control_connection.clone(),
            pools: pools.clone(),
            host_events,
        };
        let (fut, worker_handle) = worker.work().remote_handle();
        tokio::spawn(fut);

        info!(
            "Connected to cluster {:?}, {} pools",
            metadata.cluster_name(),
            pools.by_address.len()
        );
        Ok(Cluster {
            control_connection,
            pools,
            _worker_handle: worker_handle,
        })
    }

    pub fn metadata(&self) -> &Arc<Metadata> {
        self.control_connection.metadata()
    }

    pub fn control_connection(&self) -> &ControlConnection {
        &self.control_connection
    }

    pub fn pool(&self, address: SocketAddr) -> Option<Arc<HostConnectionPool>> {
        self.pools
            .by_address
            .get(&address)
            .map(|pool| pool.value().clone())
    }

    /// Borrows a connection from the first host of a fresh query plan that
    /// has one to give.
    pub async fn borrow_connection(&self) -> Result<Arc<Connection>, PoolError> {
        let hosts = self.metadata().hosts();
        let plan = self
            .control_connection
            .load_balancing_policy()
            .new_query_plan(&hosts);

        let mut last_error = PoolError::NoConnections;
        for host in plan {
            let Some(pool) = self.pool(host.address()) else {
                continue;
            };
            match pool.borrow_connection().await {
                Ok(connection) => return Ok(connection),
                Err(err) => {
                    trace!("Couldn't borrow a connection to {}: {}", host, err);
                    last_error = err;
                }
            }
        }
        Err(last_error)
    }

    /// Switches every pool to the keyspace. Pools created later start with it.
    pub async fn use_keyspace(
        &self,
        keyspace_name: &str,
        case_sensitive: bool,
    ) -> Result<(), UseKeyspaceError> {
        let keyspace = VerifiedKeyspaceName::new(keyspace_name.to_string(), case_sensitive)?;
        self.pools.keyspace.store(Some(Arc::new(keyspace.clone())));

        let pools: Vec<Arc<HostConnectionPool>> = self
            .pools
            .by_address
            .iter()
            .map(|pool| pool.value().clone())
            .collect();
        let results = join_all(pools.iter().map(|pool| pool.use_keyspace(&keyspace))).await;
        use_keyspace_result(results.into_iter())
    }

    /// Shuts down the control connection and every pool.
    pub async fn shutdown(&self) {
        self.control_connection.shutdown();
        let pools: Vec<Arc<HostConnectionPool>> = self
            .pools
            .by_address
            .iter()
            .map(|pool| pool.value().clone())
            .collect();
        self.pools.by_address.clear();
        join_all(pools.iter().map(|pool| pool.shutdown())).await;
    }
}

impl ClusterWorker {
    async fn work(mut self) {
        loop {
            match self.host_events.recv().await {
                Ok(event) => self.handle_host_event(event),
                Err(RecvError::Lagged(missed)) => {
                    warn!("Missed {} host events, resynchronizing the pools", missed);
                    self.resync();
                }
                Err(RecvError::Closed) => return,
            }
        }
    }

    fn handle_host_event(&self, event: HostEvent) {
        match event {
            HostEvent::Added(host) => self.pools.sync(&host, &self.control_connection),
            HostEvent::Removed(host) => self.pools.remove(host.address()),
            HostEvent::Up(host) => {
                let pool = self
                    .pools
                    .by_address
                    .get(&host.address())
                    .map(|pool| pool.value().clone());
                match pool {
                    Some(pool) if host.distance() != HostDistance::Ignored => pool.reconnect_now(),
                    _ => self.pools.sync(&host, &self.control_connection),
                }
            }
            // The pool of the host already reconnects on its own schedule.
            HostEvent::Down(_) => {}
            HostEvent::DistanceChanged(host) => self.pools.sync(&host, &self.control_connection),
        }
    }

    fn resync(&self) {
        let hosts = self.control_connection.metadata().hosts();
        let known: HashSet<SocketAddr> = hosts.iter().map(|host| host.address()).collect();
        let stale: Vec<SocketAddr> = self
            .pools
            .by_address
            .iter()
            .map(|pool| *pool.key())
            .filter(|address| !known.contains(address))
            .collect();
        for address in stale {
            self.pools.remove(address);
        }
        for host in hosts {
            self.pools.sync(&host, &self.control_connection);
        }
    }
}

/// Merges the results of switching every pool to a keyspace.
///
/// A broken connection doesn't make the whole operation fail: the keyspace
/// is set on it once it is reopened. Any other error is returned.
pub(crate) fn use_keyspace_result(
    use_keyspace_results: impl Iterator<Item = Result<(), UseKeyspaceError>>,
) -> Result<(), UseKeyspaceError> {
    let mut was_ok: bool = false;
    let mut broken_conn_error: Option<UseKeyspaceError> = None;

    for result in use_keyspace_results {
        match result {
            Ok(()) => was_ok = true,
            Err(err) => match err {
                UseKeyspaceError::RequestError(RequestError::BrokenConnection(_)) => {
                    broken_conn_error = Some(err)
                }
                _ => return Err(err),
            },
        }
    }

    match broken_conn_error {
        Some(err) if !was_ok => Err(err),
        _ => Ok(()),
    }
}
