//! Schema metadata and its fetching from the `system_schema` tables.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use cassie_cql::frame::response::result::Rows;
use tracing::warn;

use super::system_tables::{query_rows, SystemRow};
use crate::errors::{KeyspaceStrategyError, MetadataError};
use crate::network::Connection;

const KEYSPACES_TABLE: &str = "system_schema.keyspaces";
const TABLES_TABLE: &str = "system_schema.tables";
const COLUMNS_TABLE: &str = "system_schema.columns";
const TYPES_TABLE: &str = "system_schema.types";
const FUNCTIONS_TABLE: &str = "system_schema.functions";
const AGGREGATES_TABLE: &str = "system_schema.aggregates";

/// Describes a keyspace in the cluster.
#[derive(Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub struct KeyspaceMetadata {
    pub name: String,
    pub durable_writes: bool,
    pub strategy: Strategy,
    pub tables: HashMap<String, Arc<TableMetadata>>,
    pub user_types: HashMap<String, Arc<UserType>>,
    pub functions: HashMap<FunctionSignature, Arc<FunctionMetadata>>,
    pub aggregates: HashMap<FunctionSignature, Arc<AggregateMetadata>>,
}

/// Describes a table in the cluster.
#[derive(Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub struct TableMetadata {
    pub keyspace: String,
    pub name: String,
    pub columns: HashMap<String, Column>,
    /// Names of the column of partition key.
    /// All of the names are guaranteed to be present in `columns` field.
    pub partition_key: Vec<String>,
    /// Names of the column of clustering key.
    /// All of the names are guaranteed to be present in `columns` field.
    pub clustering_key: Vec<String>,
}

/// Describes a column of the table.
#[derive(Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub struct Column {
    /// The CQL type, as written in the schema (e.g. `frozen<list<int>>`).
    pub typ: String,
    pub kind: ColumnKind,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum ColumnKind {
    Regular,
    Static,
    Clustering,
    PartitionKey,
}

/// [ColumnKind] parse error
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ColumnKindFromStrError;

impl FromStr for ColumnKind {
    type Err = ColumnKindFromStrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "regular" => Ok(Self::Regular),
            "static" => Ok(Self::Static),
            "clustering" => Ok(Self::Clustering),
            "partition_key" => Ok(Self::PartitionKey),
            _ => Err(ColumnKindFromStrError),
        }
    }
}

/// A user defined type.
#[derive(Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub struct UserType {
    pub keyspace: String,
    pub name: String,
    /// Field names with their CQL types, in declaration order.
    pub fields: Vec<(String, String)>,
}

/// Identifies a function or an aggregate: overloads differ in argument types.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct FunctionSignature {
    pub name: String,
    pub argument_types: Vec<String>,
}

impl FunctionSignature {
    pub fn new(name: impl Into<String>, argument_types: Vec<String>) -> Self {
        FunctionSignature {
            name: name.into(),
            argument_types,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub struct FunctionMetadata {
    pub signature: FunctionSignature,
    pub argument_names: Vec<String>,
    pub return_type: String,
    pub language: String,
    pub body: String,
    pub called_on_null_input: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub struct AggregateMetadata {
    pub signature: FunctionSignature,
    pub state_function: String,
    pub state_type: String,
    pub final_function: Option<String>,
    pub return_type: String,
    pub initial_condition: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
#[allow(clippy::enum_variant_names)]
pub enum Strategy {
    SimpleStrategy {
        replication_factor: usize,
    },
    NetworkTopologyStrategy {
        // Replication factors of datacenters with given names
        datacenter_repfactors: HashMap<String, usize>,
    },
    LocalStrategy, // replication_factor == 1
    Other {
        name: String,
        data: HashMap<String, String>,
    },
}

pub(crate) fn strategy_from_string_map(
    mut strategy_map: HashMap<String, String>,
) -> Result<Strategy, KeyspaceStrategyError> {
    let strategy_name: String = strategy_map
        .remove("class")
        .ok_or(KeyspaceStrategyError::MissingClassForStrategyDefinition)?;

    let strategy: Strategy = match strategy_name.as_str() {
        "org.apache.cassandra.locator.SimpleStrategy" | "SimpleStrategy" => {
            let rep_factor_str: String = strategy_map
                .remove("replication_factor")
                .ok_or(KeyspaceStrategyError::MissingReplicationFactorForSimpleStrategy)?;

            let replication_factor: usize = usize::from_str(&rep_factor_str)
                .map_err(KeyspaceStrategyError::ReplicationFactorParseError)?;

            Strategy::SimpleStrategy { replication_factor }
        }
        "org.apache.cassandra.locator.NetworkTopologyStrategy" | "NetworkTopologyStrategy" => {
            let mut datacenter_repfactors: HashMap<String, usize> =
                HashMap::with_capacity(strategy_map.len());

            for (key, value) in strategy_map.drain() {
                let rep_factor: usize = usize::from_str(&value).map_err(|_| {
                    KeyspaceStrategyError::UnexpectedNetworkTopologyStrategyOption {
                        key: key.clone(),
                        value,
                    }
                })?;

                datacenter_repfactors.insert(key, rep_factor);
            }

            Strategy::NetworkTopologyStrategy {
                datacenter_repfactors,
            }
        }
        "org.apache.cassandra.locator.LocalStrategy" | "LocalStrategy" => Strategy::LocalStrategy,
        _ => Strategy::Other {
            name: strategy_name,
            data: strategy_map,
        },
    };

    Ok(strategy)
}

/// Which part of the schema a fetch is restricted to.
#[derive(Clone, Copy, Debug)]
enum Scope<'a> {
    All,
    Keyspace(&'a str),
    Table(&'a str, &'a str),
}

impl Scope<'_> {
    fn statement(&self, table: &str) -> String {
        match self {
            Scope::All => format!("SELECT * FROM {}", table),
            Scope::Keyspace(keyspace) => format!(
                "SELECT * FROM {} WHERE keyspace_name = '{}'",
                table,
                escape(keyspace)
            ),
            Scope::Table(keyspace, name) => format!(
                "SELECT * FROM {} WHERE keyspace_name = '{}' AND table_name = '{}'",
                table,
                escape(keyspace),
                escape(name)
            ),
        }
    }
}

fn escape(literal: &str) -> String {
    literal.replace('\'', "''")
}

/// Fetches every keyspace with its tables, types, functions and aggregates.
pub(crate) async fn fetch_keyspaces(
    connection: &Connection,
) -> Result<Vec<KeyspaceMetadata>, MetadataError> {
    fetch(connection, Scope::All).await
}

/// Fetches one keyspace. `None` means it does not exist (anymore).
pub(crate) async fn fetch_keyspace(
    connection: &Connection,
    keyspace: &str,
) -> Result<Option<KeyspaceMetadata>, MetadataError> {
    Ok(fetch(connection, Scope::Keyspace(keyspace)).await?.pop())
}

/// Fetches one table. `None` means it does not exist (anymore).
pub(crate) async fn fetch_table(
    connection: &Connection,
    keyspace: &str,
    table: &str,
) -> Result<Option<TableMetadata>, MetadataError> {
    let scope = Scope::Table(keyspace, table);
    let (tables, columns) = futures::try_join!(
        query_rows(connection, TABLES_TABLE, scope.statement(TABLES_TABLE)),
        query_rows(connection, COLUMNS_TABLE, scope.statement(COLUMNS_TABLE)),
    )?;
    let mut tables = read_tables(&tables, &columns)?;
    Ok(tables
        .remove(keyspace)
        .and_then(|mut tables| tables.remove(table)))
}

async fn fetch(
    connection: &Connection,
    scope: Scope<'_>,
) -> Result<Vec<KeyspaceMetadata>, MetadataError> {
    let (keyspaces, tables, columns, types, functions, aggregates) = futures::try_join!(
        query_rows(connection, KEYSPACES_TABLE, scope.statement(KEYSPACES_TABLE)),
        query_rows(connection, TABLES_TABLE, scope.statement(TABLES_TABLE)),
        query_rows(connection, COLUMNS_TABLE, scope.statement(COLUMNS_TABLE)),
        query_rows(connection, TYPES_TABLE, scope.statement(TYPES_TABLE)),
        query_rows(connection, FUNCTIONS_TABLE, scope.statement(FUNCTIONS_TABLE)),
        query_rows(connection, AGGREGATES_TABLE, scope.statement(AGGREGATES_TABLE)),
    )?;

    let mut all_tables = read_tables(&tables, &columns)?;
    let mut all_types = read_user_types(&types)?;
    let mut all_functions = read_functions(&functions)?;
    let mut all_aggregates = read_aggregates(&aggregates)?;

    let mut result = Vec::with_capacity(keyspaces.len());
    for row in keyspaces.iter() {
        let row = SystemRow::new(KEYSPACES_TABLE, row);
        let name = row.required_text("keyspace_name")?;
        let strategy = match strategy_from_string_map(row.text_map("replication")?) {
            Ok(strategy) => strategy,
            Err(error) => {
                warn!("Skipping keyspace {} with invalid replication: {}", name, error);
                continue;
            }
        };

        result.push(KeyspaceMetadata {
            durable_writes: row.boolean("durable_writes")?.unwrap_or(true),
            strategy,
            tables: into_arcs(all_tables.remove(&name)),
            user_types: into_arcs(all_types.remove(&name)),
            functions: into_arcs(all_functions.remove(&name)),
            aggregates: into_arcs(all_aggregates.remove(&name)),
            name,
        });
    }
    Ok(result)
}

fn into_arcs<K: std::hash::Hash + Eq, V>(map: Option<HashMap<K, V>>) -> HashMap<K, Arc<V>> {
    map.unwrap_or_default()
        .into_iter()
        .map(|(k, v)| (k, Arc::new(v)))
        .collect()
}

type PerKeyspace<T> = HashMap<String, T>;

fn read_tables(
    tables: &Rows,
    columns: &Rows,
) -> Result<PerKeyspace<HashMap<String, TableMetadata>>, MetadataError> {
    // (keyspace, table) -> columns with their positions
    let mut table_columns: HashMap<(String, String), Vec<(String, Column, i32)>> = HashMap::new();
    for row in columns.iter() {
        let row = SystemRow::new(COLUMNS_TABLE, row);
        let keyspace = row.required_text("keyspace_name")?;
        let table = row.required_text("table_name")?;
        let name = row.required_text("column_name")?;
        let kind_str = row.required_text("kind")?;
        let Ok(kind) = kind_str.parse::<ColumnKind>() else {
            warn!(
                "Column {}.{}.{} has unknown kind {}, skipping it",
                keyspace, table, name, kind_str
            );
            continue;
        };
        let position = row.int("position")?.unwrap_or(-1);
        let typ = row.required_text("type")?;
        table_columns
            .entry((keyspace, table))
            .or_default()
            .push((name, Column { typ, kind }, position));
    }

    let mut result: PerKeyspace<HashMap<String, TableMetadata>> = HashMap::new();
    for row in tables.iter() {
        let row = SystemRow::new(TABLES_TABLE, row);
        let keyspace = row.required_text("keyspace_name")?;
        let name = row.required_text("table_name")?;

        let mut columns = table_columns
            .remove(&(keyspace.clone(), name.clone()))
            .unwrap_or_default();
        columns.sort_by_key(|(_, _, position)| *position);
        let key_of = |kind: ColumnKind| {
            columns
                .iter()
                .filter(|(_, column, _)| column.kind == kind)
                .map(|(name, _, _)| name.clone())
                .collect::<Vec<_>>()
        };
        let partition_key = key_of(ColumnKind::PartitionKey);
        let clustering_key = key_of(ColumnKind::Clustering);

        let table = TableMetadata {
            keyspace: keyspace.clone(),
            name: name.clone(),
            columns: columns
                .into_iter()
                .map(|(name, column, _)| (name, column))
                .collect(),
            partition_key,
            clustering_key,
        };
        result.entry(keyspace).or_default().insert(name, table);
    }
    Ok(result)
}

fn read_user_types(
    types: &Rows,
) -> Result<PerKeyspace<HashMap<String, UserType>>, MetadataError> {
    let mut result: PerKeyspace<HashMap<String, UserType>> = HashMap::new();
    for row in types.iter() {
        let row = SystemRow::new(TYPES_TABLE, row);
        let keyspace = row.required_text("keyspace_name")?;
        let name = row.required_text("type_name")?;
        let fields = row
            .text_list("field_names")?
            .into_iter()
            .zip(row.text_list("field_types")?)
            .collect();
        result.entry(keyspace.clone()).or_default().insert(
            name.clone(),
            UserType {
                keyspace,
                name,
                fields,
            },
        );
    }
    Ok(result)
}

fn read_functions(
    functions: &Rows,
) -> Result<PerKeyspace<HashMap<FunctionSignature, FunctionMetadata>>, MetadataError> {
    let mut result: PerKeyspace<HashMap<FunctionSignature, FunctionMetadata>> = HashMap::new();
    for row in functions.iter() {
        let row = SystemRow::new(FUNCTIONS_TABLE, row);
        let keyspace = row.required_text("keyspace_name")?;
        let signature = FunctionSignature::new(
            row.required_text("function_name")?,
            row.text_list("argument_types")?,
        );
        let function = FunctionMetadata {
            signature: signature.clone(),
            argument_names: row.text_list("argument_names")?,
            return_type: row.required_text("return_type")?,
            language: row.required_text("language")?,
            body: row.text("body")?.unwrap_or_default(),
            called_on_null_input: row.boolean("called_on_null_input")?.unwrap_or(false),
        };
        result.entry(keyspace).or_default().insert(signature, function);
    }
    Ok(result)
}

fn read_aggregates(
    aggregates: &Rows,
) -> Result<PerKeyspace<HashMap<FunctionSignature, AggregateMetadata>>, MetadataError> {
    let mut result: PerKeyspace<HashMap<FunctionSignature, AggregateMetadata>> = HashMap::new();
    for row in aggregates.iter() {
        let row = SystemRow::new(AGGREGATES_TABLE, row);
        let keyspace = row.required_text("keyspace_name")?;
        let signature = FunctionSignature::new(
            row.required_text("aggregate_name")?,
            row.text_list("argument_types")?,
        );
        let aggregate = AggregateMetadata {
            signature: signature.clone(),
            state_function: row.required_text("state_func")?,
            state_type: row.required_text("state_type")?,
            final_function: row.text("final_func")?,
            return_type: row.required_text("return_type")?,
            initial_condition: row.text("initcond")?,
        };
        result
            .entry(keyspace)
            .or_default()
            .insert(signature, aggregate);
    }
    Ok(result)
}
