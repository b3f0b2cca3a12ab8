//! Errors returned by connections, pools and the control connection.

use std::collections::HashMap;
use std::fmt;
use std::io::ErrorKind;
use std::net::{AddrParseError, SocketAddr};
use std::num::ParseIntError;
use std::sync::Arc;
use std::time::Duration;

pub use cassie_cql::errors::{CqlResponseKind, DbError, WriteType};
use cassie_cql::frame::frame_errors::{
    CqlRequestSerializationError, CqlResponseParseError, FrameBodyExtensionsParseError,
    FrameHeaderParseError,
};
use cassie_cql::frame::response::Error as CqlError;
use cassie_cql::frame::value::ValueDeserializationError;
use cassie_cql::ProtocolVersion;
use thiserror::Error;

/// An error that made a connection unusable.
///
/// Every operation still pending on the connection is completed with it.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum BrokenConnectionError {
    /// The connection was closed by the driver.
    #[error("Connection was closed")]
    Closed,

    /// Reading from the socket failed or the server closed it.
    #[error("Failed to read from the socket: {0}")]
    ReadError(Arc<std::io::Error>),

    /// Writing to the socket failed.
    #[error("Failed to write to the socket: {0}")]
    WriteError(Arc<std::io::Error>),

    /// The server sent bytes which are not a valid frame.
    #[error("Received a malformed frame: {0}")]
    FrameHeaderParseError(#[from] FrameHeaderParseError),

    /// The server answered on a stream id that has no operation assigned.
    #[error("Received a response on unexpected stream id {0}")]
    UnexpectedStreamId(i16),

    /// The idle heartbeat did not get an answer in time.
    #[error("Heartbeat request failed: {0}")]
    HeartbeatFailed(Arc<RequestError>),

    /// The pool evicted the connection because too many of its requests timed out.
    #[error("Too many timed out operations on the connection: {0}")]
    TooManyTimedOutOperations(usize),
}

impl BrokenConnectionError {
    pub(crate) fn read(err: std::io::Error) -> Self {
        Self::ReadError(Arc::new(err))
    }

    pub(crate) fn write(err: std::io::Error) -> Self {
        Self::WriteError(Arc::new(err))
    }
}

/// An error that completed a single request.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum RequestError {
    /// Database sent a response containing some error with a message
    #[error("Database returned an error: {0}, Error message: {1}")]
    DbError(DbError, String),

    /// No response arrived within the operation's timeout.
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    /// The operation was cancelled before a response arrived.
    #[error("Request was cancelled")]
    Cancelled,

    /// The connection broke before a response arrived.
    #[error(transparent)]
    BrokenConnection(#[from] BrokenConnectionError),

    /// The request could not be serialized.
    #[error(transparent)]
    Serialization(#[from] CqlRequestSerializationError),

    /// Flags of the response frame could not be processed.
    #[error(transparent)]
    BodyExtensions(#[from] FrameBodyExtensionsParseError),

    /// The response body could not be parsed.
    #[error(transparent)]
    ResponseParse(#[from] CqlResponseParseError),

    /// The opcode of the response frame is unknown.
    #[error("Received a frame with unknown opcode: {0}")]
    UnknownOpcode(#[from] FrameHeaderParseError),

    /// The server answered with a response of an unexpected kind.
    #[error("Received unexpected response from the server: {0}")]
    UnexpectedResponse(CqlResponseKind),
}

impl From<CqlError> for RequestError {
    fn from(error: CqlError) -> RequestError {
        RequestError::DbError(error.error, error.reason)
    }
}

/// An error that prevented a connection from being opened.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum ConnectionError {
    /// The TCP connection was not established within the connect timeout.
    #[error("Connect timeout elapsed")]
    ConnectTimeout,

    /// Input/Output error has occurred while connecting.
    #[error("IO Error: {0}")]
    IoError(Arc<std::io::Error>),

    /// The server refused the protocol version the connection was opened with.
    #[error("Server does not support protocol version {0}")]
    UnsupportedProtocolVersion(ProtocolVersion),

    /// The server asked for authentication, but it could not be completed.
    #[error("Authentication failed: {0}")]
    AuthenticationError(String),

    /// One of the requests of the connection handshake failed.
    #[error("Connection setup request {request} failed: {error}")]
    SetupRequest {
        /// Name of the failed request.
        request: &'static str,
        /// What went wrong.
        error: RequestError,
    },

    /// The connection broke during the handshake.
    #[error(transparent)]
    BrokenConnection(#[from] BrokenConnectionError),

    /// Address translation failed
    #[error("Address translation failed: {0}")]
    TranslationError(#[from] TranslationError),

    /// The endpoint of the host could not be resolved.
    #[error("Failed to resolve the endpoint: {0}")]
    DnsLookup(#[from] DnsLookupError),

    /// The connection was opened, but the cluster metadata could not be read through it.
    #[error("Failed to read cluster metadata: {0}")]
    Metadata(#[from] MetadataError),
}

impl From<std::io::Error> for ConnectionError {
    fn from(io_error: std::io::Error) -> ConnectionError {
        ConnectionError::IoError(Arc::new(io_error))
    }
}

impl ConnectionError {
    /// Checks if this error indicates that a chosen source port/address cannot be bound.
    pub fn is_address_unavailable_for_use(&self) -> bool {
        if let ConnectionError::IoError(io_error) = self {
            match io_error.kind() {
                ErrorKind::AddrInUse | ErrorKind::PermissionDenied => return true,
                _ => {}
            }
        }

        false
    }
}

/// An error returned when borrowing a connection from a host's pool.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum PoolError {
    /// Every connection already carries the maximum number of requests.
    #[error("All connections to {address} are busy, the least busy one has {in_flight} requests in flight")]
    Busy {
        /// Address of the pool's host.
        address: SocketAddr,
        /// In-flight requests of the least busy connection.
        in_flight: usize,
    },

    /// Opening the first connection of the pool failed.
    #[error("Failed to open a connection: {0}")]
    ConnectionFailed(#[from] ConnectionError),

    /// Connection creation finished, but left the pool without connections.
    #[error("The pool has no connections after creating one")]
    NoConnections,

    /// The host is ignored by the load balancing policy.
    #[error("The host is ignored, the pool does not open connections to it")]
    HostIgnored,

    /// The pool is draining its connections.
    #[error("The pool is closing")]
    Closing,

    /// The pool was shut down.
    #[error("The pool was shut down")]
    ShutDown,
}

/// Invalid keyspace name given to `use_keyspace()`
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BadKeyspaceName {
    /// Keyspace name is empty
    #[error("Keyspace name is empty")]
    Empty,

    /// Keyspace name too long, must be up to 48 characters
    #[error("Keyspace name too long, must be up to 48 characters, found {1} characters. Bad keyspace name: '{0}'")]
    TooLong(String, usize),

    /// Illegal character - only alphanumeric and underscores allowed.
    #[error("Illegal character found: '{1}', only alphanumeric and underscores allowed. Bad keyspace name: '{0}'")]
    IllegalCharacter(String, char),
}

/// An error that occurred while switching the keyspace of a connection.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum UseKeyspaceError {
    /// Passed invalid keyspace name to use
    #[error("Passed invalid keyspace name to use: {0}")]
    BadKeyspaceName(#[from] BadKeyspaceName),

    /// The USE request failed.
    #[error(transparent)]
    RequestError(#[from] RequestError),

    /// The server switched to a different keyspace than requested.
    #[error("Keyspace name mismatch; expected: {expected_keyspace_name_lowercase}, received: {result_keyspace_name_lowercase}")]
    KeyspaceNameMismatch {
        /// Requested keyspace, lowercased.
        expected_keyspace_name_lowercase: String,
        /// Keyspace reported by the server, lowercased.
        result_keyspace_name_lowercase: String,
    },

    /// The server answered with something else than a SetKeyspace result.
    #[error("Received unexpected response to USE: {0}")]
    UnexpectedResponse(CqlResponseKind),
}

/// Error caused by failed address translation done before establishing connection
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum TranslationError {
    /// The translator has no mapping for the address.
    #[error("No rule for address {0}")]
    NoRuleForAddress(SocketAddr),
    /// The translator has a mapping, but it points to an invalid address.
    #[error("Failed to parse translated address: {translated_addr_str}, reason: {reason}")]
    InvalidAddressInRule {
        /// The invalid rule target.
        translated_addr_str: &'static str,
        /// Why it is invalid.
        reason: AddrParseError,
    },
}

/// An error that occurred during DNS resolution of a contact point.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum DnsLookupError {
    /// Resolution did not finish within the lookup timeout.
    #[error("Failed to perform DNS lookup within {0}ms")]
    Timeout(u128),
    /// Resolution succeeded but returned no addresses.
    #[error("Empty address list returned by DNS for {0}")]
    EmptyAddressListForHost(String),
    /// The resolver failed.
    #[error(transparent)]
    IoError(Arc<std::io::Error>),
}

impl From<std::io::Error> for DnsLookupError {
    fn from(io_error: std::io::Error) -> DnsLookupError {
        DnsLookupError::IoError(Arc::new(io_error))
    }
}

/// An error that occurred while reading cluster metadata from the system tables.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum MetadataError {
    /// Querying a system table failed.
    #[error("Querying {table} failed: {error}")]
    Request {
        /// The queried table.
        table: &'static str,
        /// What went wrong.
        error: RequestError,
    },

    /// The system table returned something else than rows.
    #[error("Querying {0} did not return rows")]
    NotRows(&'static str),

    /// `system.local` returned no rows.
    #[error("system.local returned no rows")]
    EmptyLocalTable,

    /// A required column was missing or null.
    #[error("Column {column} of {table} is missing or null")]
    MissingColumn {
        /// The queried table.
        table: &'static str,
        /// The missing column.
        column: &'static str,
    },

    /// A cell could not be decoded.
    #[error("Failed to decode a cell of {table}: {error}")]
    BadValue {
        /// The queried table.
        table: &'static str,
        /// What went wrong.
        error: ValueDeserializationError,
    },

    /// There is no open control connection to query through.
    #[error("The control connection is not connected")]
    NotConnected,
}

/// The replication strategy of a keyspace could not be understood.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum KeyspaceStrategyError {
    #[error("Keyspace strategy definition is missing a 'class' field")]
    MissingClassForStrategyDefinition,

    #[error("Missing replication factor field for SimpleStrategy")]
    MissingReplicationFactorForSimpleStrategy,

    #[error("Failed to parse a replication factor as unsigned integer: {0}")]
    ReplicationFactorParseError(ParseIntError),

    #[error("Unexpected NetworkTopologyStrategy option: '{key}': '{value}'")]
    UnexpectedNetworkTopologyStrategyOption {
        /// The unexpected key.
        key: String,
        /// Its value.
        value: String,
    },
}

/// Error that occurred while initializing the control connection.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum NewClusterError {
    /// Failed to resolve any of the hostnames among the contact points.
    #[error("Couldn't resolve any hostname: {0:?}")]
    FailedToResolveAnyHostname(Vec<String>),

    /// There were no contact points to connect to.
    #[error("Empty contact points list")]
    EmptyContactPoints,

    /// Connecting failed on every tried host.
    #[error("No host available: {}", DisplayErrors(.errors))]
    NoHostAvailable {
        /// Why connecting to each tried endpoint failed.
        errors: HashMap<SocketAddr, ConnectionError>,
    },

    /// The control connection was already initialized.
    #[error("The control connection was already initialized")]
    AlreadyInitialized,

    /// The control connection was shut down.
    #[error("The control connection was shut down")]
    ShutDown,
}

struct DisplayErrors<'a>(&'a HashMap<SocketAddr, ConnectionError>);

impl fmt::Display for DisplayErrors<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return f.write_str("no hosts were tried");
        }
        let mut first = true;
        for (addr, err) in self.0 {
            if !first {
                f.write_str("; ")?;
            }
            first = false;
            write!(f, "{}: {}", addr, err)?;
        }
        Ok(())
    }
}
