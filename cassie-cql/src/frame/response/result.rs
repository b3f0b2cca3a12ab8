use bytes::Bytes;

use crate::errors::CqlResponseKind;
use crate::frame::frame_errors::{CqlResponseParseError, LowLevelDeserializationError};
use crate::frame::response::event::SchemaChangeEvent;
use crate::frame::value::{self, ColumnType, CqlValue, ValueDeserializationError};
use crate::frame::{types, ProtocolVersion};

// Rows metadata flags
const FLAG_GLOBAL_TABLES_SPEC: i32 = 0x0001;
const FLAG_HAS_MORE_PAGES: i32 = 0x0002;
const FLAG_NO_METADATA: i32 = 0x0004;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetKeyspace {
    pub keyspace_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSpec {
    pub ks_name: String,
    pub table_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnSpec {
    pub table_spec: TableSpec,
    pub name: String,
    pub typ: ColumnType,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResultMetadata {
    pub col_count: usize,
    pub paging_state: Option<Bytes>,
    pub col_specs: Vec<ColumnSpec>,
}

/// A row of raw cells, in the order of the result's column specs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Row {
    pub columns: Vec<Option<Bytes>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rows {
    pub metadata: ResultMetadata,
    pub rows: Vec<Row>,
    /// Collections are encoded differently depending on the version.
    pub version: ProtocolVersion,
}

impl Rows {
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.metadata.col_specs.iter().position(|spec| spec.name == name)
    }

    /// Iterates rows together with the column specs needed to decode them.
    pub fn iter(&self) -> impl Iterator<Item = RowRef<'_>> {
        self.rows.iter().map(|row| RowRef {
            col_specs: &self.metadata.col_specs,
            version: self.version,
            row,
        })
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// A borrowed row which knows the names and types of its cells.
#[derive(Debug, Clone, Copy)]
pub struct RowRef<'a> {
    col_specs: &'a [ColumnSpec],
    version: ProtocolVersion,
    row: &'a Row,
}

impl RowRef<'_> {
    pub fn has_column(&self, name: &str) -> bool {
        self.col_specs.iter().any(|spec| spec.name == name)
    }

    /// Decodes the named cell. A missing column and a null cell both yield `None`.
    pub fn get(
        &self,
        name: &str,
    ) -> std::result::Result<Option<CqlValue>, ValueDeserializationError> {
        let Some(idx) = self.col_specs.iter().position(|spec| spec.name == name) else {
            return Ok(None);
        };
        match self.row.columns.get(idx) {
            Some(Some(cell)) => {
                value::deserialize_value(&self.col_specs[idx].typ, self.version, cell).map(Some)
            }
            _ => Ok(None),
        }
    }
}

#[derive(Debug)]
pub enum Result {
    Void,
    Rows(Rows),
    SetKeyspace(SetKeyspace),
    SchemaChange(SchemaChangeEvent),
}

fn deser_table_spec(
    buf: &mut &[u8],
) -> std::result::Result<TableSpec, LowLevelDeserializationError> {
    let ks_name = types::read_string(buf)?.to_owned();
    let table_name = types::read_string(buf)?.to_owned();
    Ok(TableSpec {
        ks_name,
        table_name,
    })
}

fn deser_col_specs(
    buf: &mut &[u8],
    global_table_spec: &Option<TableSpec>,
    col_count: usize,
) -> std::result::Result<Vec<ColumnSpec>, CqlResponseParseError> {
    let mut col_specs = Vec::with_capacity(col_count);
    for _ in 0..col_count {
        let table_spec = match global_table_spec {
            Some(spec) => spec.clone(),
            None => deser_table_spec(buf)
                .map_err(CqlResponseParseError::body(CqlResponseKind::Result))?,
        };
        let name = types::read_string(buf)
            .map_err(CqlResponseParseError::body(CqlResponseKind::Result))?
            .to_owned();
        let typ = ColumnType::deserialize(buf)?;
        col_specs.push(ColumnSpec {
            table_spec,
            name,
            typ,
        });
    }
    Ok(col_specs)
}

fn deser_result_metadata(
    buf: &mut &[u8],
) -> std::result::Result<ResultMetadata, CqlResponseParseError> {
    let body_err = CqlResponseParseError::body(CqlResponseKind::Result);

    let flags = types::read_int(buf).map_err(&body_err)?;
    let global_tables_spec = flags & FLAG_GLOBAL_TABLES_SPEC != 0;
    let has_more_pages = flags & FLAG_HAS_MORE_PAGES != 0;
    let no_metadata = flags & FLAG_NO_METADATA != 0;

    let col_count = types::read_int_length(buf).map_err(&body_err)?;

    let paging_state = if has_more_pages {
        types::read_bytes_opt(buf)
            .map_err(&body_err)?
            .map(Bytes::copy_from_slice)
    } else {
        None
    };

    if no_metadata {
        return Ok(ResultMetadata {
            col_count,
            paging_state,
            col_specs: vec![],
        });
    }

    let global_table_spec = if global_tables_spec {
        Some(deser_table_spec(buf).map_err(&body_err)?)
    } else {
        None
    };

    let col_specs = deser_col_specs(buf, &global_table_spec, col_count)?;

    Ok(ResultMetadata {
        col_count,
        paging_state,
        col_specs,
    })
}

fn deser_rows(
    version: ProtocolVersion,
    buf: &mut &[u8],
) -> std::result::Result<Rows, CqlResponseParseError> {
    let metadata = deser_result_metadata(buf)?;
    let body_err = CqlResponseParseError::body(CqlResponseKind::Result);

    let rows_count = types::read_int_length(buf).map_err(&body_err)?;
    let mut rows = Vec::with_capacity(rows_count);
    for _ in 0..rows_count {
        let mut columns = Vec::with_capacity(metadata.col_count);
        for _ in 0..metadata.col_count {
            let cell = types::read_bytes_opt(buf)
                .map_err(&body_err)?
                .map(Bytes::copy_from_slice);
            columns.push(cell);
        }
        rows.push(Row { columns });
    }

    Ok(Rows {
        metadata,
        rows,
        version,
    })
}

pub fn deserialize(
    version: ProtocolVersion,
    buf: &mut &[u8],
) -> std::result::Result<Result, CqlResponseParseError> {
    use self::Result::*;
    let kind = types::read_int(buf).map_err(CqlResponseParseError::body(CqlResponseKind::Result))?;

    Ok(match kind {
        0x0001 => Void,
        0x0002 => Rows(deser_rows(version, buf)?),
        0x0003 => SetKeyspace(self::SetKeyspace {
            keyspace_name: types::read_string(buf)
                .map_err(CqlResponseParseError::body(CqlResponseKind::Result))?
                .to_string(),
        }),
        0x0004 => return Err(CqlResponseParseError::UnsupportedResultKind(kind)),
        0x0005 => SchemaChange(SchemaChangeEvent::deserialize(version, buf)?),
        k => return Err(CqlResponseParseError::UnknownResultKind(k)),
    })
}
