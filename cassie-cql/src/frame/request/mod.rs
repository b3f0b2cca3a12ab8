//! CQL requests sent by the client.

pub mod auth_response;
pub mod options;
pub mod query;
pub mod register;
pub mod startup;

use thiserror::Error;

pub use auth_response::AuthResponse;
pub use options::Options;
pub use query::Query;
pub use register::Register;
pub use startup::Startup;

use super::frame_errors::{CqlRequestSerializationError, LowLevelDeserializationError};
use super::{ProtocolVersion, TryFromPrimitiveError};

/// Opcode of a request, used to identify the request type in a CQL frame.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum RequestOpcode {
    Startup = 0x01,
    Options = 0x05,
    Query = 0x07,
    Prepare = 0x09,
    Execute = 0x0A,
    Register = 0x0B,
    Batch = 0x0D,
    AuthResponse = 0x0F,
}

impl TryFrom<u8> for RequestOpcode {
    type Error = TryFromPrimitiveError<u8>;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Self::Startup),
            0x05 => Ok(Self::Options),
            0x07 => Ok(Self::Query),
            0x09 => Ok(Self::Prepare),
            0x0A => Ok(Self::Execute),
            0x0B => Ok(Self::Register),
            0x0D => Ok(Self::Batch),
            0x0F => Ok(Self::AuthResponse),
            _ => Err(TryFromPrimitiveError {
                enum_name: "RequestOpcode",
                primitive: value,
            }),
        }
    }
}

/// A request that can be turned into a frame body.
pub trait SerializableRequest {
    const OPCODE: RequestOpcode;

    fn serialize(
        &self,
        version: ProtocolVersion,
        buf: &mut Vec<u8>,
    ) -> Result<(), CqlRequestSerializationError>;

    fn to_bytes(&self, version: ProtocolVersion) -> Result<Vec<u8>, CqlRequestSerializationError> {
        let mut v = Vec::new();
        self.serialize(version, &mut v)?;
        Ok(v)
    }
}

/// Not intended for driver's direct usage (as driver has no interest in deserialising CQL requests),
/// but very useful for testing (e.g. asserting that the sent requests have proper parameters set).
pub trait DeserializableRequest: SerializableRequest + Sized {
    fn deserialize(
        version: ProtocolVersion,
        buf: &mut &[u8],
    ) -> Result<Self, RequestDeserializationError>;
}

/// An error returned by [DeserializableRequest::deserialize].
#[derive(Debug, Error, Clone)]
#[non_exhaustive]
pub enum RequestDeserializationError {
    #[error("Low level deser error: {0}")]
    LowLevelDeserialization(#[from] LowLevelDeserializationError),
    #[error("Unknown event type: {0}")]
    UnknownEventType(String),
    #[error("Request uses unsupported flags: {0:#04x}")]
    UnsupportedFlags(u8),
    #[error("Unexpected opcode {0:#04x} for this request type")]
    UnexpectedOpcode(u8),
}

/// A request parsed back from a frame, keyed by its opcode.
#[derive(Debug)]
pub enum Request {
    Startup(Startup),
    Options,
    Query(Query<'static>),
    Register(Register),
    AuthResponse(AuthResponse),
}

impl Request {
    pub fn deserialize(
        version: ProtocolVersion,
        opcode: RequestOpcode,
        buf: &mut &[u8],
    ) -> Result<Self, RequestDeserializationError> {
        match opcode {
            RequestOpcode::Startup => Startup::deserialize(version, buf).map(Self::Startup),
            RequestOpcode::Options => Ok(Self::Options),
            RequestOpcode::Query => Query::deserialize(version, buf).map(Self::Query),
            RequestOpcode::Register => Register::deserialize(version, buf).map(Self::Register),
            RequestOpcode::AuthResponse => {
                AuthResponse::deserialize(version, buf).map(Self::AuthResponse)
            }
            other => Err(RequestDeserializationError::UnexpectedOpcode(other as u8)),
        }
    }
}
