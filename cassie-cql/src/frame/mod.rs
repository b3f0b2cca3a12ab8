//! Frame layout of the native protocol and the codec around it.
//!
//! A frame is a fixed-size header followed by a body. The header layout
//! depends on the protocol version: versions 1 and 2 use a one-byte stream
//! id (8-byte header), versions 3 and 4 use a two-byte stream id (9-byte header).

pub mod frame_errors;
pub mod request;
pub mod response;
pub mod server_event_type;
pub mod types;
pub mod value;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use uuid::Uuid;

use std::collections::HashMap;
use std::fmt::Display;
use std::sync::Arc;

use frame_errors::{
    CqlRequestSerializationError, FrameBodyExtensionsParseError, FrameHeaderParseError,
};
use request::SerializableRequest;
use response::ResponseOpcode;

// Frame flags
pub const FLAG_COMPRESSION: u8 = 0x01;
pub const FLAG_TRACING: u8 = 0x02;
pub const FLAG_CUSTOM_PAYLOAD: u8 = 0x04;
pub const FLAG_WARNING: u8 = 0x08;

const DIRECTION_RESPONSE: u8 = 0x80;

/// Stream id the server uses for frames it pushes on its own (events).
pub const EVENT_STREAM_ID: i16 = -1;

/// Upper bound on accepted frame bodies, matching the server's default
/// `native_transport_max_frame_size`.
pub const DEFAULT_MAX_FRAME_BODY_LEN: usize = 256 * 1024 * 1024;

/// Version of the native protocol spoken on a connection.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum ProtocolVersion {
    V1 = 1,
    V2 = 2,
    V3 = 3,
    V4 = 4,
}

impl ProtocolVersion {
    /// Highest version this crate can speak.
    pub const MAX_SUPPORTED: ProtocolVersion = ProtocolVersion::V4;

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Versions 3 and newer encode the stream id on two bytes.
    pub fn uses_two_byte_stream_ids(self) -> bool {
        self >= ProtocolVersion::V3
    }

    /// Size of the frame header in bytes.
    pub fn header_len(self) -> usize {
        if self.uses_two_byte_stream_ids() {
            9
        } else {
            8
        }
    }

    /// Number of stream ids a single connection may have in flight.
    pub fn max_stream_ids(self) -> usize {
        if self.uses_two_byte_stream_ids() {
            2048
        } else {
            128
        }
    }

    /// The next version to try when the server rejects this one.
    pub fn lower(self) -> Option<ProtocolVersion> {
        match self {
            ProtocolVersion::V1 => None,
            ProtocolVersion::V2 => Some(ProtocolVersion::V1),
            ProtocolVersion::V3 => Some(ProtocolVersion::V2),
            ProtocolVersion::V4 => Some(ProtocolVersion::V3),
        }
    }
}

impl TryFrom<u8> for ProtocolVersion {
    type Error = TryFromPrimitiveError<u8>;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(ProtocolVersion::V1),
            2 => Ok(ProtocolVersion::V2),
            3 => Ok(ProtocolVersion::V3),
            4 => Ok(ProtocolVersion::V4),
            _ => Err(TryFromPrimitiveError {
                enum_name: "ProtocolVersion",
                primitive: value,
            }),
        }
    }
}

impl Display for ProtocolVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "v{}", self.as_u8())
    }
}

/// The wire protocol compression algorithm.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub enum Compression {
    /// LZ4 compression algorithm.
    Lz4,
    /// Snappy compression algorithm.
    Snappy,
}

impl Compression {
    /// Name of the algorithm as advertised in SUPPORTED and sent in STARTUP.
    pub fn as_str(&self) -> &'static str {
        match self {
            Compression::Lz4 => "lz4",
            Compression::Snappy => "snappy",
        }
    }
}

impl Display for Compression {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Direction of a frame, encoded in the top bit of the version byte.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FrameDirection {
    Request,
    Response,
}

// Parts of the frame header which are not determined by the request/response type.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct FrameParams {
    pub version: ProtocolVersion,
    pub flags: u8,
    pub stream: i16,
}

impl Default for FrameParams {
    fn default() -> Self {
        Self {
            version: ProtocolVersion::V4,
            flags: 0x00,
            stream: 0,
        }
    }
}

/// Writes a complete frame (header and body) to `out`.
pub fn encode_frame(
    direction: FrameDirection,
    params: FrameParams,
    opcode: u8,
    body: &[u8],
    out: &mut Vec<u8>,
) {
    let mut version = params.version.as_u8();
    if direction == FrameDirection::Response {
        version |= DIRECTION_RESPONSE;
    }
    out.reserve(params.version.header_len() + body.len());
    out.put_u8(version);
    out.put_u8(params.flags);
    if params.version.uses_two_byte_stream_ids() {
        out.put_i16(params.stream);
    } else {
        out.put_i8(params.stream as i8);
    }
    out.put_u8(opcode);
    out.put_u32(body.len() as u32);
    out.extend_from_slice(body);
}

/// A request frame, ready to be written once it is assigned a stream id.
pub struct SerializedRequest {
    version: ProtocolVersion,
    data: Vec<u8>,
}

impl SerializedRequest {
    pub fn make<R: SerializableRequest>(
        req: &R,
        version: ProtocolVersion,
        compression: Option<Compression>,
        tracing: bool,
    ) -> Result<SerializedRequest, CqlRequestSerializationError> {
        let header_len = version.header_len();
        let mut flags = 0;
        let mut data = vec![0; header_len];

        if let Some(compression) = compression {
            flags |= FLAG_COMPRESSION;
            let body = req.to_bytes(version)?;
            compress_append(&body, compression, &mut data)?;
        } else {
            req.serialize(version, &mut data)?;
        }

        if tracing {
            flags |= FLAG_TRACING;
        }

        data[0] = version.as_u8();
        data[1] = flags;
        // Stream id is filled in by set_stream
        data[header_len - 5] = R::OPCODE as u8;

        let req_size = (data.len() - header_len) as u32;
        data[header_len - 4..header_len].copy_from_slice(&req_size.to_be_bytes());

        Ok(Self { version, data })
    }

    pub fn set_stream(&mut self, stream: i16) {
        if self.version.uses_two_byte_stream_ids() {
            self.data[2..4].copy_from_slice(&stream.to_be_bytes());
        } else {
            self.data[2] = stream as i8 as u8;
        }
    }

    pub fn version(&self) -> ProtocolVersion {
        self.version
    }

    pub fn get_data(&self) -> &[u8] {
        &self.data[..]
    }
}

/// A frame whose header was parsed and whose body was fully received.
#[derive(Debug, Clone)]
pub struct RawFrame {
    pub params: FrameParams,
    pub opcode: u8,
    pub body: Bytes,
}

impl RawFrame {
    pub fn response_opcode(&self) -> Result<ResponseOpcode, FrameHeaderParseError> {
        Ok(ResponseOpcode::try_from(self.opcode)?)
    }
}

/// Incremental frame decoder.
///
/// Bytes read from the socket are appended to an internal carry-over buffer
/// and complete frames are cut out of it as soon as they are available.
/// A header or body split across several reads is simply kept in the buffer
/// until the rest arrives.
pub struct FrameDecoder {
    buf: BytesMut,
    expected_direction: FrameDirection,
    max_body_len: usize,
}

impl FrameDecoder {
    /// A decoder for frames sent by the server.
    pub fn for_responses() -> Self {
        Self::new(FrameDirection::Response)
    }

    /// A decoder for frames sent by a client.
    pub fn for_requests() -> Self {
        Self::new(FrameDirection::Request)
    }

    fn new(expected_direction: FrameDirection) -> Self {
        Self {
            buf: BytesMut::with_capacity(8 * 1024),
            expected_direction,
            max_body_len: DEFAULT_MAX_FRAME_BODY_LEN,
        }
    }

    pub fn with_max_body_len(mut self, max_body_len: usize) -> Self {
        self.max_body_len = max_body_len;
        self
    }

    /// The carry-over buffer; socket reads append directly into it.
    pub fn buffer_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }

    pub fn extend_from_slice(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Number of bytes received but not yet consumed as part of a frame.
    pub fn buffered_len(&self) -> usize {
        self.buf.len()
    }

    /// Cuts the next complete frame out of the buffer, if there is one.
    pub fn decode(&mut self) -> Result<Option<RawFrame>, FrameHeaderParseError> {
        let Some(&raw_version) = self.buf.first() else {
            return Ok(None);
        };

        let is_response = raw_version & DIRECTION_RESPONSE != 0;
        match (self.expected_direction, is_response) {
            (FrameDirection::Response, false) => return Err(FrameHeaderParseError::FrameFromClient),
            (FrameDirection::Request, true) => return Err(FrameHeaderParseError::FrameFromServer),
            _ => {}
        }

        let version = ProtocolVersion::try_from(raw_version & !DIRECTION_RESPONSE)
            .map_err(|_| FrameHeaderParseError::VersionNotSupported(raw_version & 0x7F))?;

        let header_len = version.header_len();
        if self.buf.len() < header_len {
            return Ok(None);
        }

        let mut header = &self.buf[1..header_len];
        let flags = header.get_u8();
        let stream = if version.uses_two_byte_stream_ids() {
            header.get_i16()
        } else {
            header.get_i8() as i16
        };
        let opcode = header.get_u8();
        let length = header.get_u32() as usize;

        if length > self.max_body_len {
            return Err(FrameHeaderParseError::FrameTooLarge {
                length,
                max: self.max_body_len,
            });
        }

        if self.buf.len() < header_len + length {
            self.buf.reserve(header_len + length - self.buf.len());
            return Ok(None);
        }

        self.buf.advance(header_len);
        let body = self.buf.split_to(length).freeze();

        Ok(Some(RawFrame {
            params: FrameParams {
                version,
                flags,
                stream,
            },
            opcode,
            body,
        }))
    }
}

pub struct ResponseBodyWithExtensions {
    pub trace_id: Option<Uuid>,
    pub warnings: Vec<String>,
    pub body: Bytes,
    pub custom_payload: Option<HashMap<String, Bytes>>,
}

pub fn parse_response_body_extensions(
    flags: u8,
    compression: Option<Compression>,
    mut body: Bytes,
) -> Result<ResponseBodyWithExtensions, FrameBodyExtensionsParseError> {
    if flags & FLAG_COMPRESSION != 0 {
        if let Some(compression) = compression {
            body = decompress(&body, compression)?.into();
        } else {
            return Err(FrameBodyExtensionsParseError::NoCompressionNegotiated);
        }
    }

    let trace_id = if flags & FLAG_TRACING != 0 {
        let buf = &mut &*body;
        let trace_id =
            types::read_uuid(buf).map_err(FrameBodyExtensionsParseError::TraceIdParse)?;
        body.advance(16);
        Some(trace_id)
    } else {
        None
    };

    let warnings = if flags & FLAG_WARNING != 0 {
        let body_len = body.len();
        let buf = &mut &*body;
        let warnings = types::read_string_list(buf)
            .map_err(FrameBodyExtensionsParseError::WarningsListParse)?;
        let buf_len = buf.len();
        body.advance(body_len - buf_len);
        warnings
    } else {
        Vec::new()
    };

    let custom_payload = if flags & FLAG_CUSTOM_PAYLOAD != 0 {
        let body_len = body.len();
        let buf = &mut &*body;
        let payload_map = types::read_bytes_map(buf)
            .map_err(FrameBodyExtensionsParseError::CustomPayloadMapParse)?;
        let buf_len = buf.len();
        body.advance(body_len - buf_len);
        Some(payload_map)
    } else {
        None
    };

    Ok(ResponseBodyWithExtensions {
        trace_id,
        warnings,
        body,
        custom_payload,
    })
}

/// Compresses `uncomp_body` and appends the result to `out`.
pub fn compress_append(
    uncomp_body: &[u8],
    compression: Compression,
    out: &mut Vec<u8>,
) -> Result<(), CqlRequestSerializationError> {
    match compression {
        Compression::Lz4 => {
            let uncomp_len = uncomp_body.len() as u32;
            let tmp = lz4_flex::compress(uncomp_body);
            out.reserve_exact(std::mem::size_of::<u32>() + tmp.len());
            out.put_u32(uncomp_len);
            out.extend_from_slice(&tmp[..]);
            Ok(())
        }
        Compression::Snappy => {
            let old_size = out.len();
            out.resize(old_size + snap::raw::max_compress_len(uncomp_body.len()), 0);
            let compressed_size = snap::raw::Encoder::new()
                .compress(uncomp_body, &mut out[old_size..])
                .map_err(|err| CqlRequestSerializationError::FrameCompression(Arc::new(err)))?;
            out.truncate(old_size + compressed_size);
            Ok(())
        }
    }
}

/// Reverses [compress_append].
pub fn decompress(
    mut comp_body: &[u8],
    compression: Compression,
) -> Result<Vec<u8>, FrameBodyExtensionsParseError> {
    match compression {
        Compression::Lz4 => {
            if comp_body.len() < std::mem::size_of::<u32>() {
                return Err(FrameBodyExtensionsParseError::FrameDecompression(Arc::new(
                    lz4_flex::block::DecompressError::ExpectedAnotherByte,
                )));
            }
            let uncomp_len = comp_body.get_u32() as usize;
            lz4_flex::decompress(comp_body, uncomp_len)
                .map_err(|err| FrameBodyExtensionsParseError::FrameDecompression(Arc::new(err)))
        }
        Compression::Snappy => snap::raw::Decoder::new()
            .decompress_vec(comp_body)
            .map_err(|err| FrameBodyExtensionsParseError::FrameDecompression(Arc::new(err))),
    }
}

/// An error type for parsing an enum value from a primitive.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("No discrimant in enum `{enum_name}` matches the value `{primitive:?}`")]
pub struct TryFromPrimitiveError<T: Copy + std::fmt::Debug> {
    enum_name: &'static str,
    primitive: T,
}
