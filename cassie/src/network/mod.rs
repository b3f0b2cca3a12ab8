//! Connections to single nodes and the pools that hold them.

mod connection;
mod connection_pool;
mod operation;
pub mod tls;

pub use connection::{
    open_connection, Connection, ConnectionConfig, ConnectionEvent, ErrorReceiver, QueryResponse,
    VerifiedKeyspaceName,
};
pub use connection_pool::{HostConnectionPool, PoolConfig, PoolEvent, PoolState};
pub use operation::{OperationState, OperationStatus, ResponseCallback};
