//! The registry of everything the driver knows about the cluster: its hosts,
//! the token ring and the schema.
//!
//! All of it is kept in copy-on-write snapshots, so readers never wait for a
//! refresh. Only the control connection writes to it.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use arc_swap::{ArcSwap, ArcSwapOption};
use cassie_cql::ProtocolVersion;
use tokio::sync::broadcast;
use tracing::{debug, trace};

use super::host::{Host, HostDistance, HostEvent, HostInfo};
use super::schema::{
    self, AggregateMetadata, FunctionMetadata, FunctionSignature, KeyspaceMetadata, TableMetadata,
    UserType,
};
use super::token_map::TokenMap;
use crate::errors::MetadataError;
use crate::network::Connection;
use crate::policies::load_balancing::LoadBalancingPolicy;

const HOST_EVENTS_CAPACITY: usize = 1024;

/// Hosts, token ring and schema of the cluster.
pub struct Metadata {
    hosts: ArcSwap<HashMap<SocketAddr, Arc<Host>>>,
    host_events: broadcast::Sender<HostEvent>,
    cluster_name: ArcSwapOption<String>,
    partitioner: ArcSwapOption<String>,
    token_map: ArcSwapOption<TokenMap>,
    keyspaces: ArcSwap<HashMap<String, Arc<KeyspaceMetadata>>>,
}

impl Default for Metadata {
    fn default() -> Self {
        Self::new()
    }
}

impl Metadata {
    pub fn new() -> Self {
        let (host_events, _) = broadcast::channel(HOST_EVENTS_CAPACITY);
        Metadata {
            hosts: ArcSwap::from_pointee(HashMap::new()),
            host_events,
            cluster_name: ArcSwapOption::empty(),
            partitioner: ArcSwapOption::empty(),
            token_map: ArcSwapOption::empty(),
            keyspaces: ArcSwap::from_pointee(HashMap::new()),
        }
    }

    /// Hosts being added, removed, going up or down.
    pub fn subscribe(&self) -> broadcast::Receiver<HostEvent> {
        self.host_events.subscribe()
    }

    pub fn hosts(&self) -> Vec<Arc<Host>> {
        self.hosts.load().values().cloned().collect()
    }

    pub fn host(&self, address: SocketAddr) -> Option<Arc<Host>> {
        self.hosts.load().get(&address).cloned()
    }

    pub fn cluster_name(&self) -> Option<Arc<String>> {
        self.cluster_name.load_full()
    }

    pub fn partitioner(&self) -> Option<Arc<String>> {
        self.partitioner.load_full()
    }

    /// `None` until the first topology refresh, or if the partitioner is not supported.
    pub fn token_map(&self) -> Option<Arc<TokenMap>> {
        self.token_map.load_full()
    }

    pub(crate) fn set_cluster_info(&self, cluster_name: Option<String>, partitioner: Option<String>) {
        self.cluster_name.store(cluster_name.map(Arc::new));
        self.partitioner.store(partitioner.map(Arc::new));
    }

    /// Replaces the host set with the hosts found in the system tables.
    ///
    /// Known hosts keep their identity and get their info updated. Every
    /// host gets its distance from the policy again, since a new datacenter
    /// may change it. Events are emitted once the new set is visible.
    pub(crate) fn update_hosts(
        &self,
        found: Vec<(SocketAddr, HostInfo)>,
        policy: &dyn LoadBalancingPolicy,
    ) {
        let current = self.hosts.load_full();
        let mut next: HashMap<SocketAddr, Arc<Host>> = HashMap::with_capacity(found.len());
        let mut added = Vec::new();
        let mut known = Vec::new();

        for (address, info) in found {
            if next.contains_key(&address) {
                debug!("Host {} is listed twice, ignoring the second row", address);
                continue;
            }
            let host = match current.get(&address) {
                Some(host) => {
                    host.set_info(info);
                    known.push(host.clone());
                    host.clone()
                }
                None => {
                    let host = Host::new(
                        address,
                        info,
                        HostDistance::Ignored,
                        self.host_events.clone(),
                    );
                    host.init_distance(policy.distance(&host));
                    added.push(host.clone());
                    host
                }
            };
            next.insert(address, host);
        }

        let removed: Vec<Arc<Host>> = current
            .values()
            .filter(|host| !next.contains_key(&host.address()))
            .cloned()
            .collect();

        self.hosts.store(Arc::new(next));
        for host in added {
            debug!("Adding host {}", host);
            host.emit(HostEvent::Added(host.clone()));
        }
        for host in removed {
            debug!("Removing host {}", host);
            host.emit(HostEvent::Removed(host.clone()));
        }
        for host in known {
            host.set_distance(policy.distance(&host));
        }
        self.rebuild_token_map();
    }

    pub(crate) fn rebuild_token_map(&self) {
        let partitioner = self.partitioner.load_full();
        let token_map = TokenMap::build(partitioner.as_deref().map(String::as_str), &self.hosts());
        trace!("Rebuilt token map: {:?}", token_map.as_ref().map(|m| m.ring().len()));
        self.token_map.store(token_map.map(Arc::new));
    }

    /// The highest protocol version every known host supports, capped at `current`.
    ///
    /// Hosts whose release version is unknown do not lower it.
    pub fn highest_common_protocol_version(&self, current: ProtocolVersion) -> ProtocolVersion {
        self.hosts
            .load()
            .values()
            .filter_map(|host| {
                host.info()
                    .release_version
                    .as_deref()
                    .and_then(max_protocol_version_for_release)
            })
            .fold(current, std::cmp::min)
    }

    // Schema

    pub fn keyspace(&self, name: &str) -> Option<Arc<KeyspaceMetadata>> {
        self.keyspaces.load().get(name).cloned()
    }

    pub fn keyspace_names(&self) -> Vec<String> {
        self.keyspaces.load().keys().cloned().collect()
    }

    pub fn table(&self, keyspace: &str, table: &str) -> Option<Arc<TableMetadata>> {
        self.keyspaces.load().get(keyspace)?.tables.get(table).cloned()
    }

    pub fn user_type(&self, keyspace: &str, name: &str) -> Option<Arc<UserType>> {
        self.keyspaces.load().get(keyspace)?.user_types.get(name).cloned()
    }

    pub fn function(
        &self,
        keyspace: &str,
        signature: &FunctionSignature,
    ) -> Option<Arc<FunctionMetadata>> {
        self.keyspaces.load().get(keyspace)?.functions.get(signature).cloned()
    }

    pub fn aggregate(
        &self,
        keyspace: &str,
        signature: &FunctionSignature,
    ) -> Option<Arc<AggregateMetadata>> {
        self.keyspaces.load().get(keyspace)?.aggregates.get(signature).cloned()
    }

    /// Applies `update` to a copy of the keyspace and publishes the copy if
    /// `update` reports a change.
    fn update_keyspace(&self, keyspace: &str, mut update: impl FnMut(&mut KeyspaceMetadata) -> bool) -> bool {
        let mut changed = false;
        self.keyspaces.rcu(|keyspaces| {
            changed = false;
            let mut keyspaces = HashMap::clone(keyspaces);
            if let Some(metadata) = keyspaces.get_mut(keyspace) {
                let mut copy = KeyspaceMetadata::clone(metadata);
                if update(&mut copy) {
                    *metadata = Arc::new(copy);
                    changed = true;
                }
            }
            keyspaces
        });
        changed
    }

    /// Forgets a cached table; the rest of the keyspace stays. Returns whether it was cached.
    pub fn clear_table(&self, keyspace: &str, table: &str) -> bool {
        self.update_keyspace(keyspace, |ks| ks.tables.remove(table).is_some())
    }

    pub fn clear_type(&self, keyspace: &str, name: &str) -> bool {
        self.update_keyspace(keyspace, |ks| ks.user_types.remove(name).is_some())
    }

    pub fn clear_function(&self, keyspace: &str, signature: &FunctionSignature) -> bool {
        self.update_keyspace(keyspace, |ks| ks.functions.remove(signature).is_some())
    }

    pub fn clear_aggregate(&self, keyspace: &str, signature: &FunctionSignature) -> bool {
        self.update_keyspace(keyspace, |ks| ks.aggregates.remove(signature).is_some())
    }

    /// Forgets a keyspace with everything in it.
    pub fn remove_keyspace(&self, keyspace: &str) -> Option<Arc<KeyspaceMetadata>> {
        let mut removed = None;
        self.keyspaces.rcu(|keyspaces| {
            let mut keyspaces = HashMap::clone(keyspaces);
            removed = keyspaces.remove(keyspace);
            keyspaces
        });
        removed
    }

    pub(crate) fn set_keyspace(&self, metadata: KeyspaceMetadata) {
        let metadata = Arc::new(metadata);
        self.keyspaces.rcu(|keyspaces| {
            let mut keyspaces = HashMap::clone(keyspaces);
            keyspaces.insert(metadata.name.clone(), metadata.clone());
            keyspaces
        });
    }

    pub(crate) fn set_keyspaces(&self, all: Vec<KeyspaceMetadata>) {
        let keyspaces = all
            .into_iter()
            .map(|ks| (ks.name.clone(), Arc::new(ks)))
            .collect();
        self.keyspaces.store(Arc::new(keyspaces));
    }

    /// Caches a table, provided its keyspace is known.
    pub(crate) fn set_table(&self, table: TableMetadata) -> bool {
        let keyspace = table.keyspace.clone();
        let table = Arc::new(table);
        self.update_keyspace(&keyspace, |ks| {
            ks.tables.insert(table.name.clone(), table.clone());
            true
        })
    }

    /// Re-reads one keyspace. A keyspace that no longer exists is removed.
    pub async fn refresh_keyspace(
        &self,
        connection: &Connection,
        keyspace: &str,
    ) -> Result<(), MetadataError> {
        match schema::fetch_keyspace(connection, keyspace).await? {
            Some(metadata) => self.set_keyspace(metadata),
            None => {
                self.remove_keyspace(keyspace);
            }
        }
        Ok(())
    }

    /// Re-reads the whole schema.
    pub async fn refresh_keyspaces(&self, connection: &Connection) -> Result<(), MetadataError> {
        let keyspaces = schema::fetch_keyspaces(connection).await?;
        debug!("Fetched {} keyspaces", keyspaces.len());
        self.set_keyspaces(keyspaces);
        Ok(())
    }

    /// Returns the cached table, fetching it first if it was cleared.
    pub async fn table_or_fetch(
        &self,
        connection: &Connection,
        keyspace: &str,
        table: &str,
    ) -> Result<Option<Arc<TableMetadata>>, MetadataError> {
        if let Some(cached) = self.table(keyspace, table) {
            return Ok(Some(cached));
        }
        let Some(fetched) = schema::fetch_table(connection, keyspace, table).await? else {
            return Ok(None);
        };
        let fetched = Arc::new(fetched);
        self.set_table(TableMetadata::clone(&fetched));
        Ok(Some(fetched))
    }
}

impl std::fmt::Debug for Metadata {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metadata")
            .field("cluster_name", &self.cluster_name.load())
            .field("hosts", &self.hosts.load().keys().collect::<Vec<_>>())
            .field("keyspaces", &self.keyspace_names())
            .finish_non_exhaustive()
    }
}

/// The newest protocol version a server release speaks.
///
/// Releases before 2.0 speak v1, 2.0 speaks v2, 2.1 speaks v3 and later ones v4.
pub(crate) fn max_protocol_version_for_release(release_version: &str) -> Option<ProtocolVersion> {
    let mut parts = release_version.split(['.', '-']);
    let major: u32 = parts.next()?.trim().parse().ok()?;
    let minor: u32 = parts.next().and_then(|m| m.parse().ok()).unwrap_or(0);
    Some(match (major, minor) {
        (0..=1, _) => ProtocolVersion::V1,
        (2, 0) => ProtocolVersion::V2,
        (2, 1) => ProtocolVersion::V3,
        _ => ProtocolVersion::V4,
    })
}
