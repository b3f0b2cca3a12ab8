//! Reading the node lists from `system.local` and `system.peers`.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use cassie_cql::frame::response::result::{self, RowRef, Rows};
use cassie_cql::frame::response::Response;
use cassie_cql::frame::value::CqlValue;
use tracing::{trace, warn};
use uuid::Uuid;

use super::host::HostInfo;
use super::token_map::Token;
use crate::errors::MetadataError;
use crate::network::Connection;

pub(crate) const LOCAL_TABLE: &str = "system.local";
pub(crate) const PEERS_TABLE: &str = "system.peers";

const LOCAL_QUERY: &str = "SELECT * FROM system.local WHERE key='local'";
const PEERS_QUERY: &str = "SELECT * FROM system.peers";

/// Runs a statement against a system table and expects rows back.
pub(crate) async fn query_rows(
    connection: &Connection,
    table: &'static str,
    statement: String,
) -> Result<Rows, MetadataError> {
    let response = connection
        .query(statement)
        .await
        .map_err(|error| MetadataError::Request { table, error })?;
    match response.response {
        Response::Result(result::Result::Rows(rows)) => Ok(rows),
        _ => Err(MetadataError::NotRows(table)),
    }
}

/// A row of a system table, with errors reported against the table.
#[derive(Clone, Copy)]
pub(crate) struct SystemRow<'a> {
    table: &'static str,
    row: RowRef<'a>,
}

impl<'a> SystemRow<'a> {
    pub(crate) fn new(table: &'static str, row: RowRef<'a>) -> Self {
        SystemRow { table, row }
    }

    fn get(&self, column: &str) -> Result<Option<CqlValue>, MetadataError> {
        self.row
            .get(column)
            .map_err(|error| MetadataError::BadValue {
                table: self.table,
                error,
            })
    }

    pub(crate) fn text(&self, column: &str) -> Result<Option<String>, MetadataError> {
        Ok(self.get(column)?.and_then(CqlValue::into_string))
    }

    pub(crate) fn required_text(&self, column: &'static str) -> Result<String, MetadataError> {
        self.text(column)?.ok_or(MetadataError::MissingColumn {
            table: self.table,
            column,
        })
    }

    pub(crate) fn uuid(&self, column: &str) -> Result<Option<Uuid>, MetadataError> {
        Ok(self.get(column)?.and_then(|value| value.as_uuid()))
    }

    pub(crate) fn inet(&self, column: &str) -> Result<Option<IpAddr>, MetadataError> {
        Ok(self.get(column)?.and_then(|value| value.as_inet()))
    }

    pub(crate) fn boolean(&self, column: &str) -> Result<Option<bool>, MetadataError> {
        Ok(self.get(column)?.and_then(|value| value.as_boolean()))
    }

    pub(crate) fn int(&self, column: &str) -> Result<Option<i32>, MetadataError> {
        Ok(self.get(column)?.and_then(|value| value.as_int()))
    }

    /// A list or set of text. Null reads as empty.
    pub(crate) fn text_list(&self, column: &str) -> Result<Vec<String>, MetadataError> {
        Ok(self
            .get(column)?
            .and_then(CqlValue::into_string_vec)
            .unwrap_or_default())
    }

    /// A map of text to text. Null reads as empty.
    pub(crate) fn text_map(&self, column: &str) -> Result<HashMap<String, String>, MetadataError> {
        let Some(pairs) = self.get(column)?.and_then(CqlValue::into_pairs) else {
            return Ok(HashMap::new());
        };
        Ok(pairs
            .into_iter()
            .filter_map(|(key, value)| Some((key.into_string()?, value.into_string()?)))
            .collect())
    }
}

/// A node as described by one row of `system.local` or `system.peers`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct NodeInfoRow {
    /// Address clients should connect to, before translation.
    pub(crate) rpc_address: Option<IpAddr>,
    pub(crate) info: HostInfo,
}

/// The `system.local` row of the node the control connection talks to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct LocalInfo {
    pub(crate) cluster_name: Option<String>,
    pub(crate) partitioner: Option<String>,
    pub(crate) node: NodeInfoRow,
}

pub(crate) async fn query_local(connection: &Connection) -> Result<LocalInfo, MetadataError> {
    let rows = query_rows(connection, LOCAL_TABLE, LOCAL_QUERY.to_string()).await?;
    let row = rows.iter().next().ok_or(MetadataError::EmptyLocalTable)?;
    let row = SystemRow::new(LOCAL_TABLE, row);

    Ok(LocalInfo {
        cluster_name: row.text("cluster_name")?,
        partitioner: row.text("partitioner")?,
        node: node_info(&row, "listen_address")?,
    })
}

/// Reads the peers of the node. Rows that carry no usable address are skipped.
pub(crate) async fn query_peers(connection: &Connection) -> Result<Vec<NodeInfoRow>, MetadataError> {
    let rows = query_rows(connection, PEERS_TABLE, PEERS_QUERY.to_string()).await?;
    let mut peers = Vec::with_capacity(rows.len());
    for row in rows.iter() {
        let row = SystemRow::new(PEERS_TABLE, row);
        let peer = node_info(&row, "peer")?;
        if peer.rpc_address.is_none() {
            warn!(
                "system.peers has a row without rpc_address (host id: {:?}, peer: {:?}), skipping it",
                peer.info.host_id, peer.info.listen_address
            );
            continue;
        }
        peers.push(peer);
    }
    Ok(peers)
}

fn node_info(row: &SystemRow<'_>, listen_column: &str) -> Result<NodeInfoRow, MetadataError> {
    let listen_address = row.inet(listen_column)?;
    let rpc_address = connect_address(row.inet("rpc_address")?, listen_address);

    let tokens = row
        .text_list("tokens")?
        .iter()
        .filter_map(|token| match Token::from_str(token) {
            Ok(token) => Some(token),
            Err(err) => {
                trace!("Couldn't parse token {:?} as a 64-bit integer: {}", token, err);
                None
            }
        })
        .collect();

    Ok(NodeInfoRow {
        rpc_address,
        info: HostInfo {
            host_id: row.uuid("host_id")?,
            datacenter: row.text("data_center")?,
            rack: row.text("rack")?,
            release_version: row.text("release_version")?,
            tokens,
            listen_address,
        },
    })
}

/// Nodes started with `rpc_address: 0.0.0.0` report it in the system tables.
/// Nobody can connect there, so the listen address is used instead.
pub(crate) fn connect_address(
    rpc_address: Option<IpAddr>,
    listen_address: Option<IpAddr>,
) -> Option<IpAddr> {
    match rpc_address {
        Some(address) if is_bind_all(address) => {
            if let Some(listen_address) = listen_address {
                warn!(
                    "Found host with {} as rpc_address, using listen_address ({}) to contact it instead. \
                     If this is incorrect you should avoid the use of {} server side.",
                    address, listen_address, address
                );
            }
            listen_address
        }
        other => other,
    }
}

fn is_bind_all(address: IpAddr) -> bool {
    address == IpAddr::V4(Ipv4Addr::UNSPECIFIED) || address == IpAddr::V6(Ipv6Addr::UNSPECIFIED)
}
