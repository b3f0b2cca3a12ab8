//! This module holds entities that represent the cluster as a whole,
//! the hosts in the cluster, and the logic keeping their view fresh.
//!
//! This includes:
//! - host's representation ([Host]) and its liveness,
//! - [Metadata], the registry of hosts, token ring and schema,
//! - the [ControlConnection], which is the single connection used to fetch
//!   metadata and receive events from the cluster,
//! - the [Debouncer](debouncer::Debouncer) coalescing metadata refreshes,
//! - endpoint resolution of contact points and hosts,
//! - [Cluster], which keeps a connection pool to every host in use.

mod worker;
pub use worker::{Cluster, ClusterConfig};

pub mod control_connection;
pub use control_connection::{ControlConnection, ControlConnectionConfig, ControlConnectionState};

pub mod debouncer;

pub mod endpoint;
pub use endpoint::{ConnectionEndPoint, ContactPoint, EndPointResolver};

pub mod host;
pub use host::{Host, HostDistance, HostEvent, HostInfo};

pub mod metadata;
pub use metadata::Metadata;

pub mod schema;

mod system_tables;

pub mod token_map;
