//! Hosts known to the driver and their liveness.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use tokio::sync::broadcast;
use tracing::{debug, info};
use uuid::Uuid;

use super::token_map::Token;

/// How the load balancing policy regards a host.
///
/// Pools are only kept for `Local` and `Remote` hosts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HostDistance {
    Local,
    Remote,
    Ignored,
}

impl HostDistance {
    fn as_u8(self) -> u8 {
        match self {
            HostDistance::Local => 0,
            HostDistance::Remote => 1,
            HostDistance::Ignored => 2,
        }
    }

    fn from_u8(value: u8) -> HostDistance {
        match value {
            0 => HostDistance::Local,
            1 => HostDistance::Remote,
            _ => HostDistance::Ignored,
        }
    }
}

/// What the system tables say about a host.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostInfo {
    pub host_id: Option<Uuid>,
    pub datacenter: Option<String>,
    pub rack: Option<String>,
    pub release_version: Option<String>,
    pub tokens: Vec<Token>,
    /// Address the host uses to talk to other nodes.
    pub listen_address: Option<IpAddr>,
}

/// A change to the set of known hosts or to their liveness.
#[derive(Debug, Clone)]
pub enum HostEvent {
    Added(Arc<Host>),
    Removed(Arc<Host>),
    Up(Arc<Host>),
    Down(Arc<Host>),
    /// The load balancing policy now regards the host differently.
    DistanceChanged(Arc<Host>),
}

/// A single node of the cluster.
///
/// The address is the translated address the driver connects to; it identifies
/// the host for the whole lifetime of the object.
pub struct Host {
    address: SocketAddr,
    info: ArcSwap<HostInfo>,
    up: AtomicBool,
    distance: AtomicU8,
    events: broadcast::Sender<HostEvent>,
}

impl Host {
    pub(crate) fn new(
        address: SocketAddr,
        info: HostInfo,
        distance: HostDistance,
        events: broadcast::Sender<HostEvent>,
    ) -> Arc<Host> {
        Arc::new(Host {
            address,
            info: ArcSwap::from_pointee(info),
            up: AtomicBool::new(true),
            distance: AtomicU8::new(distance.as_u8()),
            events,
        })
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn info(&self) -> Arc<HostInfo> {
        self.info.load_full()
    }

    pub fn host_id(&self) -> Option<Uuid> {
        self.info.load().host_id
    }

    pub fn datacenter(&self) -> Option<String> {
        self.info.load().datacenter.clone()
    }

    pub(crate) fn set_info(&self, info: HostInfo) {
        self.info.store(Arc::new(info));
    }

    pub fn is_up(&self) -> bool {
        self.up.load(Ordering::Acquire)
    }

    pub fn distance(&self) -> HostDistance {
        HostDistance::from_u8(self.distance.load(Ordering::Acquire))
    }

    /// Sets the distance of a host nobody has seen yet, without an event.
    pub(crate) fn init_distance(&self, distance: HostDistance) {
        self.distance.store(distance.as_u8(), Ordering::Release);
    }

    /// Returns the previous distance. Emits `DistanceChanged` if it differs.
    pub(crate) fn set_distance(self: &Arc<Self>, distance: HostDistance) -> HostDistance {
        let previous =
            HostDistance::from_u8(self.distance.swap(distance.as_u8(), Ordering::AcqRel));
        if previous != distance {
            debug!(
                "Distance of host {} changed from {:?} to {:?}",
                self.address, previous, distance
            );
            self.emit(HostEvent::DistanceChanged(self.clone()));
        }
        previous
    }

    /// Marks the host as down. Returns whether this call changed its state.
    pub fn set_down(self: &Arc<Self>) -> bool {
        if !self.up.swap(false, Ordering::AcqRel) {
            return false;
        }
        info!("Host {} is now considered down", self.address);
        let _ = self.events.send(HostEvent::Down(self.clone()));
        true
    }

    /// Marks the host as up if it was down. Returns whether this call changed its state.
    pub fn bring_up_if_down(self: &Arc<Self>) -> bool {
        if self.up.swap(true, Ordering::AcqRel) {
            return false;
        }
        info!("Host {} is now considered up", self.address);
        let _ = self.events.send(HostEvent::Up(self.clone()));
        true
    }

    pub(crate) fn emit(&self, event: HostEvent) {
        if self.events.send(event).is_err() {
            debug!("No subscribers for events of host {}", self.address);
        }
    }
}

impl fmt::Debug for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Host")
            .field("address", &self.address)
            .field("info", &self.info.load())
            .field("up", &self.is_up())
            .field("distance", &self.distance())
            .finish()
    }
}

impl fmt::Display for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.address)
    }
}
