//! Turning contact points and hosts into addresses to connect to.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use itertools::Itertools;
use tokio::net::{lookup_host, ToSocketAddrs};
use tracing::{debug, warn};

use super::host::Host;
use crate::errors::{ConnectionError, DnsLookupError};

/// Port assumed for hostnames given without one.
pub const DEFAULT_PORT: u16 = 9042;

/// A node given by the user to bootstrap cluster discovery.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum ContactPoint {
    /// A hostname, optionally followed by `:port`. Resolved with DNS.
    Hostname(String),
    /// A plain socket address, used as is.
    Address(SocketAddr),
}

impl From<SocketAddr> for ContactPoint {
    fn from(address: SocketAddr) -> Self {
        ContactPoint::Address(address)
    }
}

impl From<&str> for ContactPoint {
    fn from(s: &str) -> Self {
        match s.parse::<SocketAddr>() {
            Ok(address) => ContactPoint::Address(address),
            Err(_) => ContactPoint::Hostname(s.to_string()),
        }
    }
}

/// Where and how a connection is opened.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum ConnectionEndPoint {
    /// Straight to the host.
    Direct(SocketAddr),
    /// Through an SNI proxy, which routes the TLS connection by server name.
    Sni {
        proxy: SocketAddr,
        /// Unknown for contact points, which have no host id yet.
        server_name: Option<String>,
    },
}

impl ConnectionEndPoint {
    /// The address the TCP connection goes to.
    pub fn socket_addr(&self) -> SocketAddr {
        match self {
            ConnectionEndPoint::Direct(addr) => *addr,
            ConnectionEndPoint::Sni { proxy, .. } => *proxy,
        }
    }

    pub fn server_name(&self) -> Option<&str> {
        match self {
            ConnectionEndPoint::Direct(_) => None,
            ConnectionEndPoint::Sni { server_name, .. } => server_name.as_deref(),
        }
    }
}

impl fmt::Display for ConnectionEndPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionEndPoint::Direct(addr) => write!(f, "{}", addr),
            ConnectionEndPoint::Sni {
                proxy,
                server_name: Some(name),
            } => write!(f, "{} ({})", proxy, name),
            ConnectionEndPoint::Sni {
                proxy,
                server_name: None,
            } => write!(f, "{}", proxy),
        }
    }
}

/// Maps hosts and contact points to connection endpoints.
#[async_trait]
pub trait EndPointResolver: Send + Sync + fmt::Debug {
    /// Endpoint of a host discovered through the system tables.
    async fn resolve(&self, host: &Host) -> Result<ConnectionEndPoint, ConnectionError>;

    /// Endpoint of an already resolved contact point.
    async fn resolve_contact_point(
        &self,
        address: SocketAddr,
    ) -> Result<ConnectionEndPoint, ConnectionError>;

    /// Drops whatever was cached for the host, after connecting to it failed.
    async fn refresh(&self, _host: &Host) {}
}

/// Connects straight to the address of every host.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultEndPointResolver;

#[async_trait]
impl EndPointResolver for DefaultEndPointResolver {
    async fn resolve(&self, host: &Host) -> Result<ConnectionEndPoint, ConnectionError> {
        Ok(ConnectionEndPoint::Direct(host.address()))
    }

    async fn resolve_contact_point(
        &self,
        address: SocketAddr,
    ) -> Result<ConnectionEndPoint, ConnectionError> {
        Ok(ConnectionEndPoint::Direct(address))
    }
}

/// Connects to every host through an SNI proxy.
///
/// The proxy hostname is resolved lazily and spread round-robin over all of
/// its addresses. The server name of a host is its host id.
#[derive(Debug)]
pub struct SniEndPointResolver {
    proxy_hostname: String,
    proxy_port: u16,
    dns_timeout: Option<Duration>,
    resolved: ArcSwap<Vec<SocketAddr>>,
    index: AtomicUsize,
    resolving: tokio::sync::Mutex<()>,
}

impl SniEndPointResolver {
    pub fn new(proxy_hostname: impl Into<String>, proxy_port: u16) -> Self {
        Self {
            proxy_hostname: proxy_hostname.into(),
            proxy_port,
            dns_timeout: Some(Duration::from_secs(5)),
            resolved: ArcSwap::from_pointee(Vec::new()),
            index: AtomicUsize::new(0),
            resolving: tokio::sync::Mutex::new(()),
        }
    }

    pub fn with_dns_timeout(mut self, dns_timeout: Option<Duration>) -> Self {
        self.dns_timeout = dns_timeout;
        self
    }

    async fn next_proxy_address(&self) -> Result<SocketAddr, DnsLookupError> {
        let mut addresses = self.resolved.load_full();
        if addresses.is_empty() {
            let _guard = self.resolving.lock().await;
            addresses = self.resolved.load_full();
            if addresses.is_empty() {
                let fresh = lookup_host_with_timeout(
                    (self.proxy_hostname.as_str(), self.proxy_port),
                    self.dns_timeout,
                )
                .await?
                .collect_vec();
                if fresh.is_empty() {
                    return Err(DnsLookupError::EmptyAddressListForHost(
                        self.proxy_hostname.clone(),
                    ));
                }
                debug!(
                    "SNI proxy {} resolved to {:?}",
                    self.proxy_hostname, fresh
                );
                addresses = Arc::new(fresh);
                self.resolved.store(addresses.clone());
            }
        }
        let idx = self.index.fetch_add(1, Ordering::Relaxed) % addresses.len();
        Ok(addresses[idx])
    }
}

#[async_trait]
impl EndPointResolver for SniEndPointResolver {
    async fn resolve(&self, host: &Host) -> Result<ConnectionEndPoint, ConnectionError> {
        let proxy = self.next_proxy_address().await?;
        let server_name = match host.host_id() {
            Some(host_id) => host_id.to_string(),
            None => {
                warn!(
                    "Host {} has no host id, using its address as SNI server name",
                    host.address()
                );
                host.address().ip().to_string()
            }
        };
        Ok(ConnectionEndPoint::Sni {
            proxy,
            server_name: Some(server_name),
        })
    }

    async fn resolve_contact_point(
        &self,
        _address: SocketAddr,
    ) -> Result<ConnectionEndPoint, ConnectionError> {
        let proxy = self.next_proxy_address().await?;
        Ok(ConnectionEndPoint::Sni {
            proxy,
            server_name: None,
        })
    }

    async fn refresh(&self, _host: &Host) {
        self.resolved.store(Arc::new(Vec::new()));
    }
}

async fn lookup_host_with_timeout(
    host: impl ToSocketAddrs,
    hostname_resolution_timeout: Option<Duration>,
) -> Result<impl Iterator<Item = SocketAddr>, DnsLookupError> {
    if let Some(timeout) = hostname_resolution_timeout {
        match tokio::time::timeout(timeout, lookup_host(host)).await {
            Ok(res) => res.map_err(Into::into),
            // Elapsed error from tokio library does not provide any context.
            Err(_) => Err(DnsLookupError::Timeout(timeout.as_millis())),
        }
    } else {
        lookup_host(host).await.map_err(Into::into)
    }
}

/// Resolves a hostname to all of its addresses, IPv4 addresses first.
///
/// A hostname without a port is retried with [`DEFAULT_PORT`].
pub(crate) async fn resolve_hostname(
    hostname: &str,
    hostname_resolution_timeout: Option<Duration>,
) -> Result<Vec<SocketAddr>, DnsLookupError> {
    // `lookup_host` rejects a plain "hostname" immediately, so retry with the
    // default port. A timeout is not caused by the missing port; don't retry it.
    let addrs = match lookup_host_with_timeout(hostname, hostname_resolution_timeout).await {
        Ok(addrs) => itertools::Either::Left(addrs),
        Err(DnsLookupError::Timeout(t)) => return Err(DnsLookupError::Timeout(t)),
        Err(e) => {
            let addrs =
                lookup_host_with_timeout((hostname, DEFAULT_PORT), hostname_resolution_timeout)
                    .await
                    .or(Err(e))?;
            itertools::Either::Right(addrs)
        }
    };

    let (v4, v6): (Vec<_>, Vec<_>) = addrs
        .unique()
        .partition(|addr| matches!(addr, SocketAddr::V4(_)));
    let all = v4.into_iter().chain(v6).collect_vec();
    if all.is_empty() {
        return Err(DnsLookupError::EmptyAddressListForHost(hostname.to_owned()));
    }
    Ok(all)
}

/// Resolves the contact points, in the given order and without duplicates.
///
/// Returns the addresses and the hostnames among the contact points; a
/// hostname that fails to resolve is logged and skipped.
pub(crate) async fn resolve_contact_points(
    contact_points: &[ContactPoint],
    hostname_resolution_timeout: Option<Duration>,
) -> (Vec<SocketAddr>, Vec<String>) {
    let hostnames = contact_points
        .iter()
        .filter_map(|point| match point {
            ContactPoint::Hostname(hostname) => Some(hostname.clone()),
            ContactPoint::Address(_) => None,
        })
        .collect_vec();

    let resolve_futures = contact_points.iter().map(|point| async move {
        match point {
            ContactPoint::Address(address) => vec![*address],
            ContactPoint::Hostname(hostname) => {
                match resolve_hostname(hostname, hostname_resolution_timeout).await {
                    Ok(addresses) => addresses,
                    Err(e) => {
                        warn!("Hostname resolution failed for {}: {}", hostname, &e);
                        Vec::new()
                    }
                }
            }
        }
    });
    let resolved = futures::future::join_all(resolve_futures).await;
    let addresses = resolved.into_iter().flatten().unique().collect_vec();

    (addresses, hostnames)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::host::{HostDistance, HostInfo};
    use assert_matches::assert_matches;
    use tokio::sync::broadcast;
    use uuid::Uuid;

    #[test]
    fn contact_point_from_str() {
        assert_eq!(
            ContactPoint::from("127.0.0.1:9042"),
            ContactPoint::Address("127.0.0.1:9042".parse().unwrap())
        );
        assert_eq!(
            ContactPoint::from("db.example.com"),
            ContactPoint::Hostname("db.example.com".to_string())
        );
    }

    #[tokio::test]
    async fn ip_literal_without_port_gets_the_default_port() {
        let addrs = resolve_hostname("127.0.0.1", Some(Duration::from_secs(5)))
            .await
            .unwrap();
        assert_eq!(addrs, vec!["127.0.0.1:9042".parse::<SocketAddr>().unwrap()]);

        let addrs = resolve_hostname("127.0.0.1:19042", Some(Duration::from_secs(5)))
            .await
            .unwrap();
        assert_eq!(addrs, vec!["127.0.0.1:19042".parse::<SocketAddr>().unwrap()]);
    }

    #[tokio::test]
    async fn contact_points_keep_order_and_drop_duplicates() {
        let points = vec![
            ContactPoint::Address("127.0.0.2:9042".parse().unwrap()),
            ContactPoint::Hostname("127.0.0.1".to_string()),
            ContactPoint::Address("127.0.0.2:9042".parse().unwrap()),
        ];
        let (addresses, hostnames) =
            resolve_contact_points(&points, Some(Duration::from_secs(5))).await;
        assert_eq!(
            addresses,
            vec![
                "127.0.0.2:9042".parse::<SocketAddr>().unwrap(),
                "127.0.0.1:9042".parse::<SocketAddr>().unwrap(),
            ]
        );
        assert_eq!(hostnames, vec!["127.0.0.1".to_string()]);
    }

    #[tokio::test]
    async fn sni_resolver_uses_host_id_as_server_name() {
        let resolver = SniEndPointResolver::new("127.0.0.1", 30443);
        let host_id = Uuid::new_v4();
        let (events, _) = broadcast::channel(1);
        let host = Host::new(
            "10.0.0.1:9042".parse().unwrap(),
            HostInfo {
                host_id: Some(host_id),
                ..Default::default()
            },
            HostDistance::Local,
            events,
        );

        let endpoint = resolver.resolve(&host).await.unwrap();
        assert_eq!(endpoint.socket_addr(), "127.0.0.1:30443".parse().unwrap());
        assert_eq!(endpoint.server_name(), Some(host_id.to_string().as_str()));

        let contact = resolver
            .resolve_contact_point("10.0.0.1:9042".parse().unwrap())
            .await
            .unwrap();
        assert_matches!(contact, ConnectionEndPoint::Sni { server_name: None, .. });

        resolver.refresh(&host).await;
        assert!(resolver.resolved.load().is_empty());
        assert!(resolver.resolve(&host).await.is_ok());
    }
}
