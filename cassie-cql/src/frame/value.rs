//! Column types and the subset of CQL values the driver needs to decode
//! system tables.

use std::net::IpAddr;

use thiserror::Error;
use uuid::Uuid;

use super::frame_errors::{ColumnTypeParseError, LowLevelDeserializationError};
use super::{types, ProtocolVersion};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnType {
    Custom(String),
    Ascii,
    BigInt,
    Blob,
    Boolean,
    Counter,
    Decimal,
    Double,
    Float,
    Int,
    Timestamp,
    Uuid,
    Text,
    Varint,
    Timeuuid,
    Inet,
    Date,
    Time,
    SmallInt,
    TinyInt,
    Duration,
    List(Box<ColumnType>),
    Map(Box<ColumnType>, Box<ColumnType>),
    Set(Box<ColumnType>),
    UserDefinedType {
        keyspace: String,
        type_name: String,
        field_types: Vec<(String, ColumnType)>,
    },
    Tuple(Vec<ColumnType>),
}

impl ColumnType {
    /// Parses an `[option]` describing a column type.
    pub fn deserialize(buf: &mut &[u8]) -> Result<ColumnType, ColumnTypeParseError> {
        use ColumnType::*;
        let id = types::read_short(buf)?;
        Ok(match id {
            0x0000 => {
                let class = types::read_string(buf)?;
                match class {
                    "org.apache.cassandra.db.marshal.DurationType" => Duration,
                    _ => Custom(class.to_owned()),
                }
            }
            0x0001 => Ascii,
            0x0002 => BigInt,
            0x0003 => Blob,
            0x0004 => Boolean,
            0x0005 => Counter,
            0x0006 => Decimal,
            0x0007 => Double,
            0x0008 => Float,
            0x0009 => Int,
            0x000B => Timestamp,
            0x000C => Uuid,
            0x000D => Text,
            0x000E => Varint,
            0x000F => Timeuuid,
            0x0010 => Inet,
            0x0011 => Date,
            0x0012 => Time,
            0x0013 => SmallInt,
            0x0014 => TinyInt,
            0x0015 => Duration,
            0x0020 => List(Box::new(Self::deserialize(buf)?)),
            0x0021 => Map(
                Box::new(Self::deserialize(buf)?),
                Box::new(Self::deserialize(buf)?),
            ),
            0x0022 => Set(Box::new(Self::deserialize(buf)?)),
            0x0030 => {
                let keyspace = types::read_string(buf)?.to_owned();
                let type_name = types::read_string(buf)?.to_owned();
                let fields_size = types::read_short(buf)? as usize;
                let mut field_types = Vec::with_capacity(fields_size);
                for _ in 0..fields_size {
                    let field_name = types::read_string(buf)?.to_owned();
                    let field_type = Self::deserialize(buf)?;
                    field_types.push((field_name, field_type));
                }
                UserDefinedType {
                    keyspace,
                    type_name,
                    field_types,
                }
            }
            0x0031 => {
                let len = types::read_short(buf)? as usize;
                let mut elems = Vec::with_capacity(len);
                for _ in 0..len {
                    elems.push(Self::deserialize(buf)?);
                }
                Tuple(elems)
            }
            id => return Err(ColumnTypeParseError::UnknownTypeId(id)),
        })
    }
}

/// A decoded cell.
#[derive(Debug, Clone, PartialEq)]
pub enum CqlValue {
    Ascii(String),
    Text(String),
    Blob(Vec<u8>),
    Boolean(bool),
    TinyInt(i8),
    SmallInt(i16),
    Int(i32),
    BigInt(i64),
    Counter(i64),
    Float(f32),
    Double(f64),
    /// Milliseconds since the unix epoch.
    Timestamp(i64),
    Uuid(Uuid),
    Timeuuid(Uuid),
    Inet(IpAddr),
    List(Vec<CqlValue>),
    Set(Vec<CqlValue>),
    Map(Vec<(CqlValue, CqlValue)>),
}

impl CqlValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Ascii(s) | Self::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn into_string(self) -> Option<String> {
        match self {
            Self::Ascii(s) | Self::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_uuid(&self) -> Option<Uuid> {
        match self {
            Self::Uuid(u) | Self::Timeuuid(u) => Some(*u),
            _ => None,
        }
    }

    pub fn as_inet(&self) -> Option<IpAddr> {
        match self {
            Self::Inet(addr) => Some(*addr),
            _ => None,
        }
    }

    pub fn as_boolean(&self) -> Option<bool> {
        match self {
            Self::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i32> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Elements of a list or a set.
    pub fn into_vec(self) -> Option<Vec<CqlValue>> {
        match self {
            Self::List(v) | Self::Set(v) => Some(v),
            _ => None,
        }
    }

    pub fn into_pairs(self) -> Option<Vec<(CqlValue, CqlValue)>> {
        match self {
            Self::Map(m) => Some(m),
            _ => None,
        }
    }

    /// A list or set of text values, as owned strings.
    pub fn into_string_vec(self) -> Option<Vec<String>> {
        self.into_vec()?
            .into_iter()
            .map(CqlValue::into_string)
            .collect()
    }
}

#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum ValueDeserializationError {
    #[error("Decoding values of type {0:?} is not supported")]
    UnsupportedType(ColumnType),
    #[error("Expected {expected} bytes for {typ:?}, got {got}")]
    BadLength {
        typ: ColumnType,
        expected: usize,
        got: usize,
    },
    #[error("Ascii value contains non-ascii characters")]
    NonAsciiText,
    #[error(transparent)]
    Malformed(#[from] LowLevelDeserializationError),
}

fn exact<const N: usize>(
    typ: &ColumnType,
    buf: &[u8],
) -> Result<[u8; N], ValueDeserializationError> {
    buf.try_into().map_err(|_| ValueDeserializationError::BadLength {
        typ: typ.clone(),
        expected: N,
        got: buf.len(),
    })
}

/// Collections use `[short]` counts and element lengths in v1 and v2,
/// and `[int]` in later versions.
fn read_collection_len(
    version: ProtocolVersion,
    buf: &mut &[u8],
) -> Result<usize, LowLevelDeserializationError> {
    if version.uses_two_byte_stream_ids() {
        types::read_int_length(buf)
    } else {
        Ok(types::read_short(buf)? as usize)
    }
}

fn read_collection_elem<'a>(
    version: ProtocolVersion,
    buf: &mut &'a [u8],
) -> Result<Option<&'a [u8]>, LowLevelDeserializationError> {
    if version.uses_two_byte_stream_ids() {
        types::read_bytes_opt(buf)
    } else {
        types::read_short_bytes(buf).map(Some)
    }
}

fn deserialize_elem(
    typ: &ColumnType,
    version: ProtocolVersion,
    buf: &mut &[u8],
) -> Result<CqlValue, ValueDeserializationError> {
    match read_collection_elem(version, buf)? {
        Some(bytes) => deserialize_value(typ, version, bytes),
        None => Err(LowLevelDeserializationError::InvalidValueLength(-1).into()),
    }
}

/// Decodes a non-null cell of the given type.
pub fn deserialize_value(
    typ: &ColumnType,
    version: ProtocolVersion,
    buf: &[u8],
) -> Result<CqlValue, ValueDeserializationError> {
    Ok(match typ {
        ColumnType::Ascii => {
            if !buf.is_ascii() {
                return Err(ValueDeserializationError::NonAsciiText);
            }
            CqlValue::Ascii(
                std::str::from_utf8(buf)
                    .map_err(LowLevelDeserializationError::from)?
                    .to_owned(),
            )
        }
        ColumnType::Text => CqlValue::Text(
            std::str::from_utf8(buf)
                .map_err(LowLevelDeserializationError::from)?
                .to_owned(),
        ),
        ColumnType::Blob => CqlValue::Blob(buf.to_vec()),
        ColumnType::Boolean => CqlValue::Boolean(exact::<1>(typ, buf)?[0] != 0),
        ColumnType::TinyInt => CqlValue::TinyInt(i8::from_be_bytes(exact(typ, buf)?)),
        ColumnType::SmallInt => CqlValue::SmallInt(i16::from_be_bytes(exact(typ, buf)?)),
        ColumnType::Int => CqlValue::Int(i32::from_be_bytes(exact(typ, buf)?)),
        ColumnType::BigInt => CqlValue::BigInt(i64::from_be_bytes(exact(typ, buf)?)),
        ColumnType::Counter => CqlValue::Counter(i64::from_be_bytes(exact(typ, buf)?)),
        ColumnType::Timestamp => CqlValue::Timestamp(i64::from_be_bytes(exact(typ, buf)?)),
        ColumnType::Float => CqlValue::Float(f32::from_be_bytes(exact(typ, buf)?)),
        ColumnType::Double => CqlValue::Double(f64::from_be_bytes(exact(typ, buf)?)),
        ColumnType::Uuid => CqlValue::Uuid(Uuid::from_bytes(exact(typ, buf)?)),
        ColumnType::Timeuuid => CqlValue::Timeuuid(Uuid::from_bytes(exact(typ, buf)?)),
        ColumnType::Inet => match buf.len() {
            4 => CqlValue::Inet(IpAddr::from(exact::<4>(typ, buf)?)),
            16 => CqlValue::Inet(IpAddr::from(exact::<16>(typ, buf)?)),
            len => {
                return Err(LowLevelDeserializationError::InvalidInetLength(len as u8).into());
            }
        },
        ColumnType::List(elem) | ColumnType::Set(elem) => {
            let mut buf = buf;
            let len = read_collection_len(version, &mut buf)?;
            let mut values = Vec::with_capacity(len);
            for _ in 0..len {
                values.push(deserialize_elem(elem, version, &mut buf)?);
            }
            if matches!(typ, ColumnType::List(_)) {
                CqlValue::List(values)
            } else {
                CqlValue::Set(values)
            }
        }
        ColumnType::Map(key_type, value_type) => {
            let mut buf = buf;
            let len = read_collection_len(version, &mut buf)?;
            let mut pairs = Vec::with_capacity(len);
            for _ in 0..len {
                let key = deserialize_elem(key_type, version, &mut buf)?;
                let value = deserialize_elem(value_type, version, &mut buf)?;
                pairs.push((key, value));
            }
            CqlValue::Map(pairs)
        }
        other => return Err(ValueDeserializationError::UnsupportedType(other.clone())),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use bytes::BufMut;

    #[test]
    fn parses_nested_collection_types() {
        let mut buf = Vec::new();
        buf.put_u16(0x0021); // map
        buf.put_u16(0x000D); // varchar
        buf.put_u16(0x0020); // list
        buf.put_u16(0x0009); // int
        let typ = ColumnType::deserialize(&mut &buf[..]).unwrap();
        assert_eq!(
            typ,
            ColumnType::Map(
                Box::new(ColumnType::Text),
                Box::new(ColumnType::List(Box::new(ColumnType::Int)))
            )
        );
    }

    #[test]
    fn duration_custom_class_is_recognized() {
        let mut buf = Vec::new();
        buf.put_u16(0x0000);
        types::write_string("org.apache.cassandra.db.marshal.DurationType", &mut buf).unwrap();
        assert_eq!(
            ColumnType::deserialize(&mut &buf[..]).unwrap(),
            ColumnType::Duration
        );
    }

    #[test]
    fn unknown_type_id_is_rejected() {
        let buf = [0x00, 0x99];
        assert_matches!(
            ColumnType::deserialize(&mut &buf[..]),
            Err(ColumnTypeParseError::UnknownTypeId(0x99))
        );
    }

    #[test]
    fn map_uses_short_lengths_before_v3() {
        let typ = ColumnType::Map(Box::new(ColumnType::Text), Box::new(ColumnType::Text));

        let mut v2 = Vec::new();
        v2.put_u16(1);
        types::write_short_bytes(b"class", &mut v2).unwrap();
        types::write_short_bytes(b"SimpleStrategy", &mut v2).unwrap();

        let mut v4 = Vec::new();
        v4.put_i32(1);
        types::write_bytes(b"class", &mut v4).unwrap();
        types::write_bytes(b"SimpleStrategy", &mut v4).unwrap();

        let expected = CqlValue::Map(vec![(
            CqlValue::Text("class".to_string()),
            CqlValue::Text("SimpleStrategy".to_string()),
        )]);
        assert_eq!(deserialize_value(&typ, ProtocolVersion::V2, &v2).unwrap(), expected);
        assert_eq!(deserialize_value(&typ, ProtocolVersion::V4, &v4).unwrap(), expected);
    }

    #[test]
    fn fixed_width_values_check_length() {
        assert_eq!(
            deserialize_value(&ColumnType::Int, ProtocolVersion::V4, &[0, 0, 1, 0]).unwrap(),
            CqlValue::Int(256)
        );
        assert_matches!(
            deserialize_value(&ColumnType::Int, ProtocolVersion::V4, &[0, 1]),
            Err(ValueDeserializationError::BadLength {
                expected: 4,
                got: 2,
                ..
            })
        );
    }

    #[test]
    fn unsupported_types_report_themselves() {
        assert_matches!(
            deserialize_value(&ColumnType::Varint, ProtocolVersion::V4, &[1]),
            Err(ValueDeserializationError::UnsupportedType(ColumnType::Varint))
        );
    }

    #[test]
    fn string_vec_from_set_of_text() {
        let value = CqlValue::Set(vec![
            CqlValue::Text("a".to_string()),
            CqlValue::Text("b".to_string()),
        ]);
        assert_eq!(
            value.into_string_vec(),
            Some(vec!["a".to_string(), "b".to_string()])
        );
        assert_eq!(CqlValue::Int(1).into_string_vec(), None);
    }
}
