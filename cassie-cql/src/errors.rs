//! Errors reported by the server, as carried by ERROR response frames.

use crate::Consistency;
use bytes::Bytes;
use thiserror::Error;

/// An error returned by the server in an ERROR frame.
///
/// Codes follow the v4 protocol. Codes the driver doesn't know are kept as
/// [`DbError::Other`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DbError {
    #[error("Syntax error in the query")]
    SyntaxError,

    #[error("Invalid query")]
    Invalid,

    /// An empty `table` means the keyspace itself already existed.
    #[error("Already exists: keyspace {keyspace}, table {table}")]
    AlreadyExists { keyspace: String, table: String },

    #[error("Function {keyspace}.{function}({arg_types:?}) failed")]
    FunctionFailure {
        keyspace: String,
        function: String,
        arg_types: Vec<String>,
    },

    #[error("Bad credentials")]
    AuthenticationError,

    #[error("User is not allowed to run the query")]
    Unauthorized,

    #[error("Query rejected because of the server configuration")]
    ConfigError,

    #[error("Cannot achieve consistency {consistency}: {alive} replicas alive, {required} required")]
    Unavailable {
        consistency: Consistency,
        required: i32,
        alive: i32,
    },

    #[error("Coordinator is overloaded")]
    Overloaded,

    #[error("Coordinator is bootstrapping")]
    IsBootstrapping,

    #[error("Truncate failed")]
    TruncateError,

    /// `data_present` tells whether the replica asked for data responded.
    #[error("Read timed out at consistency {consistency}: {received} of {required} responses, data present: {data_present}")]
    ReadTimeout {
        consistency: Consistency,
        received: i32,
        required: i32,
        data_present: bool,
    },

    #[error("Write ({write_type}) timed out at consistency {consistency}: {received} of {required} acknowledgements")]
    WriteTimeout {
        consistency: Consistency,
        received: i32,
        required: i32,
        write_type: WriteType,
    },

    #[error("Read failed at consistency {consistency}: {received} of {required} responses, {numfailures} failures, data present: {data_present}")]
    ReadFailure {
        consistency: Consistency,
        received: i32,
        required: i32,
        numfailures: i32,
        data_present: bool,
    },

    #[error("Write ({write_type}) failed at consistency {consistency}: {received} of {required} acknowledgements, {numfailures} failures")]
    WriteFailure {
        consistency: Consistency,
        received: i32,
        required: i32,
        numfailures: i32,
        write_type: WriteType,
    },

    #[error("Statement is not prepared")]
    Unprepared { statement_id: Bytes },

    #[error("Internal server error")]
    ServerError,

    /// The server couldn't make sense of a frame, or doesn't speak the
    /// protocol version it was sent in.
    #[error("Protocol error")]
    ProtocolError,

    #[error("Server error with unknown code {0:#06x}")]
    Other(i32),
}

impl DbError {
    /// Error code of this error, as sent on the wire.
    pub fn code(&self) -> i32 {
        match self {
            DbError::ServerError => 0x0000,
            DbError::ProtocolError => 0x000A,
            DbError::AuthenticationError => 0x0100,
            DbError::Unavailable { .. } => 0x1000,
            DbError::Overloaded => 0x1001,
            DbError::IsBootstrapping => 0x1002,
            DbError::TruncateError => 0x1003,
            DbError::WriteTimeout { .. } => 0x1100,
            DbError::ReadTimeout { .. } => 0x1200,
            DbError::ReadFailure { .. } => 0x1300,
            DbError::FunctionFailure { .. } => 0x1400,
            DbError::WriteFailure { .. } => 0x1500,
            DbError::SyntaxError => 0x2000,
            DbError::Unauthorized => 0x2100,
            DbError::Invalid => 0x2200,
            DbError::ConfigError => 0x2300,
            DbError::AlreadyExists { .. } => 0x2400,
            DbError::Unprepared { .. } => 0x2500,
            DbError::Other(code) => *code,
        }
    }
}

/// The kind of write that timed out or failed, as named by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteType {
    Simple,
    /// The batch log was written.
    Batch,
    UnloggedBatch,
    Counter,
    /// Writing to the batch log itself timed out.
    BatchLog,
    Cas,
    View,
    Cdc,
    Other(String),
}

impl std::fmt::Display for WriteType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&str> for WriteType {
    fn from(write_type_str: &str) -> WriteType {
        match write_type_str {
            "SIMPLE" => WriteType::Simple,
            "BATCH" => WriteType::Batch,
            "UNLOGGED_BATCH" => WriteType::UnloggedBatch,
            "COUNTER" => WriteType::Counter,
            "BATCH_LOG" => WriteType::BatchLog,
            "CAS" => WriteType::Cas,
            "VIEW" => WriteType::View,
            "CDC" => WriteType::Cdc,
            _ => WriteType::Other(write_type_str.to_string()),
        }
    }
}

impl WriteType {
    pub fn as_str(&self) -> &str {
        match self {
            WriteType::Simple => "SIMPLE",
            WriteType::Batch => "BATCH",
            WriteType::UnloggedBatch => "UNLOGGED_BATCH",
            WriteType::Counter => "COUNTER",
            WriteType::BatchLog => "BATCH_LOG",
            WriteType::Cas => "CAS",
            WriteType::View => "VIEW",
            WriteType::Cdc => "CDC",
            WriteType::Other(write_type) => write_type.as_str(),
        }
    }
}

/// Kinds of response frames, used to report unexpected responses.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum CqlResponseKind {
    Error,
    Ready,
    Authenticate,
    Supported,
    Result,
    Event,
    AuthChallenge,
    AuthSuccess,
}

impl std::fmt::Display for CqlResponseKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind_str = match self {
            CqlResponseKind::Error => "ERROR",
            CqlResponseKind::Ready => "READY",
            CqlResponseKind::Authenticate => "AUTHENTICATE",
            CqlResponseKind::Supported => "SUPPORTED",
            CqlResponseKind::Result => "RESULT",
            CqlResponseKind::Event => "EVENT",
            CqlResponseKind::AuthChallenge => "AUTH_CHALLENGE",
            CqlResponseKind::AuthSuccess => "AUTH_SUCCESS",
        };

        f.write_str(kind_str)
    }
}
