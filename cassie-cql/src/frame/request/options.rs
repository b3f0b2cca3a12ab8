use crate::frame::frame_errors::CqlRequestSerializationError;
use crate::frame::request::{RequestOpcode, SerializableRequest};
use crate::frame::ProtocolVersion;

/// OPTIONS carries no body. It is sent before STARTUP and as the idle heartbeat.
pub struct Options;

impl SerializableRequest for Options {
    const OPCODE: RequestOpcode = RequestOpcode::Options;

    fn serialize(
        &self,
        _version: ProtocolVersion,
        _buf: &mut Vec<u8>,
    ) -> Result<(), CqlRequestSerializationError> {
        Ok(())
    }
}
