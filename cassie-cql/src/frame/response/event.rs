//! Events pushed by the server on stream -1.

use crate::frame::frame_errors::{CqlEventParseError, CqlResponseParseError};
use crate::frame::server_event_type::EventType;
use crate::frame::{types, ProtocolVersion};
use std::net::SocketAddr;

#[derive(Debug, Clone, PartialEq, Eq)]
#[allow(clippy::enum_variant_names)]
pub enum Event {
    TopologyChange(TopologyChangeEvent),
    StatusChange(StatusChangeEvent),
    SchemaChange(SchemaChangeEvent),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopologyChangeEvent {
    NewNode(SocketAddr),
    RemovedNode(SocketAddr),
    /// Only sent by protocol v1 and v2 servers.
    MovedNode(SocketAddr),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusChangeEvent {
    Up(SocketAddr),
    Down(SocketAddr),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SchemaChangeType {
    Created,
    Updated,
    Dropped,
}

/// The schema element a schema change refers to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SchemaChangeTarget {
    Keyspace,
    Table(String),
    Type(String),
    Function {
        name: String,
        arguments: Vec<String>,
    },
    Aggregate {
        name: String,
        arguments: Vec<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaChangeEvent {
    pub change_type: SchemaChangeType,
    pub keyspace: String,
    pub target: SchemaChangeTarget,
}

impl Event {
    pub fn deserialize(
        version: ProtocolVersion,
        buf: &mut &[u8],
    ) -> Result<Self, CqlResponseParseError> {
        let event_type: EventType = types::read_string(buf)
            .map_err(CqlEventParseError::from)?
            .parse()?;
        let event = match event_type {
            EventType::TopologyChange => Self::TopologyChange(TopologyChangeEvent::deserialize(buf)?),
            EventType::StatusChange => Self::StatusChange(StatusChangeEvent::deserialize(buf)?),
            EventType::SchemaChange => {
                Self::SchemaChange(SchemaChangeEvent::deserialize(version, buf)?)
            }
        };
        Ok(event)
    }
}

impl SchemaChangeType {
    fn parse(s: &str) -> Result<Self, CqlEventParseError> {
        match s {
            "CREATED" => Ok(Self::Created),
            "UPDATED" => Ok(Self::Updated),
            "DROPPED" => Ok(Self::Dropped),
            _ => Err(CqlEventParseError::UnknownSchemaChangeType(s.to_string())),
        }
    }
}

impl SchemaChangeEvent {
    /// Parses the schema change body shared by EVENT and RESULT::SchemaChange.
    pub fn deserialize(
        version: ProtocolVersion,
        buf: &mut &[u8],
    ) -> Result<Self, CqlEventParseError> {
        let change_type = SchemaChangeType::parse(types::read_string(buf)?)?;

        // Versions 1 and 2 only know keyspaces and tables: <keyspace><table>,
        // with an empty table name for keyspace-level changes.
        if !version.uses_two_byte_stream_ids() {
            let keyspace = types::read_string(buf)?.to_string();
            let table = types::read_string(buf)?;
            let target = if table.is_empty() {
                SchemaChangeTarget::Keyspace
            } else {
                SchemaChangeTarget::Table(table.to_string())
            };
            return Ok(Self {
                change_type,
                keyspace,
                target,
            });
        }

        let target_str = types::read_string(buf)?;
        let keyspace = types::read_string(buf)?.to_string();

        let target = match target_str {
            "KEYSPACE" => SchemaChangeTarget::Keyspace,
            "TABLE" => SchemaChangeTarget::Table(types::read_string(buf)?.to_string()),
            "TYPE" => SchemaChangeTarget::Type(types::read_string(buf)?.to_string()),
            "FUNCTION" => SchemaChangeTarget::Function {
                name: types::read_string(buf)?.to_string(),
                arguments: types::read_string_list(buf)?,
            },
            "AGGREGATE" => SchemaChangeTarget::Aggregate {
                name: types::read_string(buf)?.to_string(),
                arguments: types::read_string_list(buf)?,
            },
            other => return Err(CqlEventParseError::UnknownSchemaChangeTarget(other.to_string())),
        };

        Ok(Self {
            change_type,
            keyspace,
            target,
        })
    }
}

impl TopologyChangeEvent {
    pub fn deserialize(buf: &mut &[u8]) -> Result<Self, CqlEventParseError> {
        let type_of_change = types::read_string(buf)?;
        let addr = types::read_inet(buf)?;

        match type_of_change {
            "NEW_NODE" => Ok(Self::NewNode(addr)),
            "REMOVED_NODE" => Ok(Self::RemovedNode(addr)),
            "MOVED_NODE" => Ok(Self::MovedNode(addr)),
            _ => Err(CqlEventParseError::UnknownTopologyChangeType(
                type_of_change.to_string(),
            )),
        }
    }
}

impl StatusChangeEvent {
    pub fn deserialize(buf: &mut &[u8]) -> Result<Self, CqlEventParseError> {
        let type_of_change = types::read_string(buf)?;
        let addr = types::read_inet(buf)?;

        match type_of_change {
            "UP" => Ok(Self::Up(addr)),
            "DOWN" => Ok(Self::Down(addr)),
            _ => Err(CqlEventParseError::UnknownStatusChangeType(
                type_of_change.to_string(),
            )),
        }
    }
}
