use std::borrow::Cow;

use bytes::{Buf, BufMut};

use crate::frame::frame_errors::CqlRequestSerializationError;
use crate::frame::request::{
    DeserializableRequest, RequestDeserializationError, RequestOpcode, SerializableRequest,
};
use crate::frame::{types, ProtocolVersion};

// Query flags (protocol v2 and newer)
const FLAG_VALUES: u8 = 0x01;
const FLAG_SKIP_METADATA: u8 = 0x02;
const FLAG_PAGE_SIZE: u8 = 0x04;

/// An unprepared statement without bound values.
///
/// The control connection and the keyspace switch only ever send literal
/// statements, so values, paging state and serial consistency are not modelled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query<'q> {
    pub contents: Cow<'q, str>,
    pub consistency: types::Consistency,
    pub page_size: Option<i32>,
    pub skip_metadata: bool,
}

impl<'q> Query<'q> {
    pub fn new(contents: impl Into<Cow<'q, str>>, consistency: types::Consistency) -> Self {
        Self {
            contents: contents.into(),
            consistency,
            page_size: None,
            skip_metadata: false,
        }
    }

    pub fn with_page_size(mut self, page_size: i32) -> Self {
        self.page_size = Some(page_size);
        self
    }
}

impl SerializableRequest for Query<'_> {
    const OPCODE: RequestOpcode = RequestOpcode::Query;

    fn serialize(
        &self,
        version: ProtocolVersion,
        buf: &mut Vec<u8>,
    ) -> Result<(), CqlRequestSerializationError> {
        types::write_long_string(&self.contents, buf)?;
        types::write_consistency(self.consistency, buf);

        // Version 1 has no query flags at all.
        if version == ProtocolVersion::V1 {
            return Ok(());
        }

        let mut flags = 0;
        if self.skip_metadata {
            flags |= FLAG_SKIP_METADATA;
        }
        if self.page_size.is_some() {
            flags |= FLAG_PAGE_SIZE;
        }
        buf.put_u8(flags);

        if let Some(page_size) = self.page_size {
            types::write_int(page_size, buf);
        }

        Ok(())
    }
}

impl DeserializableRequest for Query<'static> {
    fn deserialize(
        version: ProtocolVersion,
        buf: &mut &[u8],
    ) -> Result<Self, RequestDeserializationError> {
        let contents = Cow::Owned(types::read_long_string(buf)?.to_owned());
        let consistency = types::read_consistency(buf)?;

        let mut query = Query::new(contents, consistency);
        if version == ProtocolVersion::V1 || !buf.has_remaining() {
            return Ok(query);
        }

        let flags = types::read_byte(buf)?;
        query.skip_metadata = flags & FLAG_SKIP_METADATA != 0;
        if flags & FLAG_VALUES != 0 {
            // Bound values are never sent by this driver.
            return Err(RequestDeserializationError::UnsupportedFlags(FLAG_VALUES));
        }
        if flags & FLAG_PAGE_SIZE != 0 {
            query.page_size = Some(types::read_int(buf)?);
        }

        Ok(query)
    }
}
