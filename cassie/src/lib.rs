//! Connection layer of an async driver for [Apache Cassandra®](https://cassandra.apache.org/)
//! and compatible databases, written in Rust.
//!
//! # Driver overview
//! ### Connections
//! A [`Connection`](network::Connection) multiplexes many requests over one
//! TCP connection, tagging each with a stream id. Requests are queued and
//! written in batches by a single writer; responses are matched back to their
//! callers by stream id. Every request carries its own timeout.
//!
//! ### Pools
//! A [`HostConnectionPool`](network::HostConnectionPool) keeps connections to
//! one host. It opens the first connection on demand, grows while its
//! connections are busy, evicts connections that accumulate timed-out
//! requests, and reconnects on its own when it loses every connection.
//!
//! ### Cluster discovery
//! The [`ControlConnection`](cluster::ControlConnection) connects to one of the
//! contact points, reads the hosts of the cluster and its schema into the
//! [`Metadata`](cluster::Metadata) registry and keeps them fresh by listening
//! to the events the server pushes. [`Cluster`](cluster::Cluster) puts it all
//! together:
//!
//! ```rust,no_run
//! use cassie::cluster::{Cluster, ClusterConfig, ContactPoint, ControlConnectionConfig};
//! use std::error::Error;
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> Result<(), Box<dyn Error>> {
//!     let cluster = Cluster::connect(ClusterConfig {
//!         control_connection: ControlConnectionConfig {
//!             contact_points: vec![ContactPoint::from("127.0.0.1:9042")],
//!             ..Default::default()
//!         },
//!         ..Default::default()
//!     })
//!     .await?;
//!
//!     let connection = cluster.borrow_connection().await?;
//!     connection.query("SELECT * FROM system.local").await?;
//!     Ok(())
//! }
//! ```

#![cfg_attr(docsrs, feature(doc_auto_cfg))]

pub mod frame {
    pub use cassie_cql::frame::{frame_errors, Compression, ProtocolVersion};

    pub mod response {
        pub use cassie_cql::frame::response::event;
        pub use cassie_cql::frame::response::result;
        pub use cassie_cql::frame::response::Response;
    }
}

pub mod authentication;
pub mod cluster;
pub mod errors;
pub mod network;
pub mod policies;

pub(crate) mod utils;
