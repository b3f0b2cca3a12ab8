//! Host distances and the order in which hosts are tried.

use std::fmt::Debug;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use itertools::Itertools;

use crate::cluster::host::{Host, HostDistance};

/// Decides how far each host is and in which order hosts are contacted.
///
/// The control connection asks for a query plan whenever it has to pick a
/// new host; pools consult [`distance`](LoadBalancingPolicy::distance) to
/// decide how many connections to keep, if any.
pub trait LoadBalancingPolicy: Send + Sync + Debug {
    /// Distance of the given host.
    fn distance(&self, host: &Host) -> HostDistance;

    /// Hosts to try, best first. Ignored hosts are left out.
    fn new_query_plan(&self, hosts: &[Arc<Host>]) -> Vec<Arc<Host>>;

    /// Returns the name of load balancing policy.
    fn name(&self) -> String;
}

fn rotate(hosts: Vec<Arc<Host>>, offset: usize) -> impl Iterator<Item = Arc<Host>> {
    let len = hosts.len();
    let start = if len == 0 { 0 } else { offset % len };
    let (head, tail) = hosts.split_at(start);
    tail.iter().chain(head.iter()).cloned().collect_vec().into_iter()
}

/// Up hosts in rotated order, then down hosts.
fn up_first(hosts: Vec<Arc<Host>>, offset: usize) -> Vec<Arc<Host>> {
    let (up, down): (Vec<_>, Vec<_>) = hosts.into_iter().partition(|host| host.is_up());
    rotate(up, offset).chain(down).collect()
}

/// Treats every host as local and rotates the starting host of each plan.
#[derive(Debug)]
pub struct RoundRobinPolicy {
    index: AtomicUsize,
}

impl RoundRobinPolicy {
    pub fn new() -> Self {
        Self {
            index: AtomicUsize::new(rand::random::<u32>() as usize),
        }
    }
}

impl Default for RoundRobinPolicy {
    fn default() -> Self {
        Self::new()
    }
}

impl LoadBalancingPolicy for RoundRobinPolicy {
    fn distance(&self, _host: &Host) -> HostDistance {
        HostDistance::Local
    }

    fn new_query_plan(&self, hosts: &[Arc<Host>]) -> Vec<Arc<Host>> {
        let offset = self.index.fetch_add(1, Ordering::Relaxed);
        up_first(hosts.to_vec(), offset)
    }

    fn name(&self) -> String {
        "RoundRobinPolicy".to_string()
    }
}

/// Prefers hosts of one datacenter.
///
/// Hosts of the local datacenter come first in every plan. Hosts of other
/// datacenters are `Remote` when `allow_remote` is set and `Ignored` otherwise.
/// Hosts whose datacenter is not known yet are treated as local.
#[derive(Debug)]
pub struct DcAwareRoundRobinPolicy {
    local_dc: String,
    allow_remote: bool,
    index: AtomicUsize,
}

impl DcAwareRoundRobinPolicy {
    pub fn new(local_dc: impl Into<String>, allow_remote: bool) -> Self {
        Self {
            local_dc: local_dc.into(),
            allow_remote,
            index: AtomicUsize::new(rand::random::<u32>() as usize),
        }
    }
}

impl LoadBalancingPolicy for DcAwareRoundRobinPolicy {
    fn distance(&self, host: &Host) -> HostDistance {
        match host.datacenter() {
            None => HostDistance::Local,
            Some(dc) if dc == self.local_dc => HostDistance::Local,
            Some(_) if self.allow_remote => HostDistance::Remote,
            Some(_) => HostDistance::Ignored,
        }
    }

    fn new_query_plan(&self, hosts: &[Arc<Host>]) -> Vec<Arc<Host>> {
        let offset = self.index.fetch_add(1, Ordering::Relaxed);
        let (local, remote): (Vec<_>, Vec<_>) = hosts
            .iter()
            .filter(|host| self.distance(host) != HostDistance::Ignored)
            .cloned()
            .partition(|host| self.distance(host) == HostDistance::Local);

        let mut plan = up_first(local, offset);
        plan.extend(up_first(remote, offset));
        plan
    }

    fn name(&self) -> String {
        "DcAwareRoundRobinPolicy".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::host::HostInfo;
    use tokio::sync::broadcast;

    fn host(addr: &str, dc: Option<&str>) -> Arc<Host> {
        let (events, _) = broadcast::channel(8);
        Host::new(
            addr.parse().unwrap(),
            HostInfo {
                datacenter: dc.map(str::to_string),
                ..Default::default()
            },
            HostDistance::Local,
            events,
        )
    }

    fn addrs(plan: &[Arc<Host>]) -> Vec<String> {
        plan.iter().map(|h| h.address().to_string()).collect()
    }

    #[test]
    fn round_robin_rotates_and_puts_down_hosts_last() {
        let hosts = vec![
            host("127.0.0.1:9042", None),
            host("127.0.0.2:9042", None),
            host("127.0.0.3:9042", None),
        ];
        hosts[0].set_down();

        let policy = RoundRobinPolicy {
            index: AtomicUsize::new(0),
        };
        assert_eq!(
            addrs(&policy.new_query_plan(&hosts)),
            ["127.0.0.2:9042", "127.0.0.3:9042", "127.0.0.1:9042"]
        );
        assert_eq!(
            addrs(&policy.new_query_plan(&hosts)),
            ["127.0.0.3:9042", "127.0.0.2:9042", "127.0.0.1:9042"]
        );
    }

    #[test]
    fn dc_aware_distances_and_plan() {
        let hosts = vec![
            host("127.0.0.1:9042", Some("dc2")),
            host("127.0.0.2:9042", Some("dc1")),
            host("127.0.0.3:9042", None),
        ];

        let strict = DcAwareRoundRobinPolicy::new("dc1", false);
        assert_eq!(strict.distance(&hosts[0]), HostDistance::Ignored);
        assert_eq!(strict.distance(&hosts[1]), HostDistance::Local);
        assert_eq!(strict.distance(&hosts[2]), HostDistance::Local);
        let plan = strict.new_query_plan(&hosts);
        assert_eq!(plan.len(), 2);
        assert!(plan.iter().all(|h| h.address().port() == 9042 && h.address().ip().to_string() != "127.0.0.1"));

        let relaxed = DcAwareRoundRobinPolicy::new("dc1", true);
        assert_eq!(relaxed.distance(&hosts[0]), HostDistance::Remote);
        let plan = relaxed.new_query_plan(&hosts);
        assert_eq!(addrs(&plan).last().map(String::as_str), Some("127.0.0.1:9042"));
    }
}
