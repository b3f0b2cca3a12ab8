//! Errors that can occur while encoding requests and decoding frames.

use std::sync::Arc;

use super::TryFromPrimitiveError;
use crate::errors::CqlResponseKind;
use thiserror::Error;

/// An error that occurred while parsing the header of a frame.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum FrameHeaderParseError {
    #[error("Received frame marked as coming from a client")]
    FrameFromClient,
    #[error("Received frame marked as coming from the server")]
    FrameFromServer,
    #[error("Received a frame from version {0}, but only versions 1 to 4 are supported")]
    VersionNotSupported(u8),
    #[error("Received frame body is too large: {length} bytes, the limit is {max}")]
    FrameTooLarge { length: usize, max: usize },
    #[error("Unrecognized response opcode: {0}")]
    UnknownResponseOpcode(#[from] TryFromPrimitiveError<u8>),
}

/// An error that occurred while decoding the compression, tracing id,
/// warnings or custom payload of a response body.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum FrameBodyExtensionsParseError {
    #[error("Frame is compressed, but no compression was negotiated for the connection")]
    NoCompressionNegotiated,
    #[error("Frame decompression failed: {0}")]
    FrameDecompression(Arc<dyn std::error::Error + Sync + Send>),
    #[error("Malformed trace id: {0}")]
    TraceIdParse(LowLevelDeserializationError),
    #[error("Malformed warnings list: {0}")]
    WarningsListParse(LowLevelDeserializationError),
    #[error("Malformed custom payload map: {0}")]
    CustomPayloadMapParse(LowLevelDeserializationError),
}

/// An error that occurred while serializing a request into a frame body.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum CqlRequestSerializationError {
    #[error("A value in the request does not fit its length prefix: {0}")]
    LengthOverflow(#[from] std::num::TryFromIntError),
    #[error("Frame compression failed: {0}")]
    FrameCompression(Arc<dyn std::error::Error + Sync + Send>),
}

/// An error that occurred while deserializing the body of a response.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum CqlResponseParseError {
    #[error("Failed to deserialize {kind} response: {err}")]
    Body {
        kind: CqlResponseKind,
        #[source]
        err: LowLevelDeserializationError,
    },
    #[error("Unknown RESULT kind: {0}")]
    UnknownResultKind(i32),
    #[error("RESULT kind {0} is not supported by this driver")]
    UnsupportedResultKind(i32),
    #[error("Failed to parse column type: {0}")]
    ColumnTypeParse(#[from] ColumnTypeParseError),
    #[error(transparent)]
    EventParse(#[from] CqlEventParseError),
}

impl CqlResponseParseError {
    pub(crate) fn body(kind: CqlResponseKind) -> impl Fn(LowLevelDeserializationError) -> Self {
        move |err| CqlResponseParseError::Body { kind, err }
    }
}

/// An error that occurred while parsing an EVENT response body.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum CqlEventParseError {
    #[error("Malformed event: {0}")]
    Malformed(#[from] LowLevelDeserializationError),
    #[error("Unknown event type: {0}")]
    UnknownEventType(String),
    #[error("Unknown schema change type: {0}")]
    UnknownSchemaChangeType(String),
    #[error("Unknown schema change target: {0}")]
    UnknownSchemaChangeTarget(String),
    #[error("Unknown topology change type: {0}")]
    UnknownTopologyChangeType(String),
    #[error("Unknown status change type: {0}")]
    UnknownStatusChangeType(String),
}

/// An error that occurred while parsing a column type option.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum ColumnTypeParseError {
    #[error("Malformed type option: {0}")]
    Malformed(#[from] LowLevelDeserializationError),
    #[error("Unknown type id: {0:#06x}")]
    UnknownTypeId(u16),
}

/// A low level deserialization error.
///
/// This type of error is returned when deserialization
/// of some primitive value fails.
///
/// Possible error kinds:
/// - generic io error - reading from buffer failed
/// - out of range integer conversion
/// - conversion errors - e.g. slice-to-array or primitive-to-enum
/// - not enough bytes in the buffer to deserialize a value
#[non_exhaustive]
#[derive(Error, Debug, Clone)]
pub enum LowLevelDeserializationError {
    #[error(transparent)]
    IoError(Arc<std::io::Error>),
    #[error(transparent)]
    TryFromIntError(#[from] std::num::TryFromIntError),
    #[error(transparent)]
    TryFromSliceError(#[from] std::array::TryFromSliceError),
    #[error("Not enough bytes! expected: {expected}, received: {received}")]
    TooFewBytesReceived { expected: usize, received: usize },
    #[error("Invalid value length: {0}")]
    InvalidValueLength(i32),
    #[error("Unknown consistency: {0}")]
    UnknownConsistency(#[from] TryFromPrimitiveError<u16>),
    #[error("Invalid inet bytes length: {0}. Accepted lengths are 4 and 16 bytes.")]
    InvalidInetLength(u8),
    #[error("UTF8 deserialization failed: {0}")]
    UTF8DeserializationError(#[from] std::str::Utf8Error),
}

impl From<std::io::Error> for LowLevelDeserializationError {
    fn from(value: std::io::Error) -> Self {
        Self::IoError(Arc::new(value))
    }
}
