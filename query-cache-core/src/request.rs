//! Request/row data model: `CacheRequest`, qualifiers, rows, and the
//! read-only schema contract consulted for key columns.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Sentinel meaning "no limit" for `CacheRequest::limit` and `IndexItem::limit`.
pub const NO_LIMIT: i64 = -1;

/// A single scalar cell value. Kept deliberately small and enum-shaped
/// (rather than `serde_json::Value`) so `postcard` can encode it compactly
/// without a schema-less JSON-like representation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// SQL NULL.
    Null,
    /// Boolean.
    Bool(bool),
    /// Signed 64-bit integer.
    Int(i64),
    /// 64-bit float.
    Float(f64),
    /// UTF-8 text.
    Text(String),
    /// Opaque bytes.
    Bytes(Vec<u8>),
}

/// One row of a query result: an ordered list of cell values, one per
/// requested column.
pub type Row = Vec<Value>;

/// A predicate constraining a single column: `(field, operator, value)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Qual {
    /// The column name this qualifier constrains.
    pub field_name: String,
    /// Comparison operator, e.g. `"="`, `">"`, `"<="`.
    pub operator: String,
    /// The value being compared against.
    pub value: Value,
}

/// Qualifiers grouped by column name. Order of columns is irrelevant to
/// equality/hashing of a request (see `KeyBuilder::result_key_root`), so this
/// is a plain map rather than an ordered structure.
pub type QualMap = HashMap<String, Vec<Qual>>;

/// A key column descriptor from the plugin schema: a column the remote
/// source partitions on, plus which operators it supports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyColumn {
    /// Column name.
    pub name: String,
    /// Operators the source supports for this column (e.g. `["=", ">"]`).
    pub operators: Vec<String>,
}

/// Per-table schema: the key columns relevant to list-calls and get-calls.
/// Their union defines the match-relevant columns for `IndexBucket::get`.
#[derive(Debug, Clone, Default)]
pub struct TableSchema {
    /// Key columns usable when listing rows (e.g. a `WHERE` filter).
    pub list_call_key_columns: Vec<KeyColumn>,
    /// Key columns usable when fetching a single row by identity.
    pub get_call_key_columns: Vec<KeyColumn>,
}

/// Schema for one connection: table name to its key-column descriptors.
/// Read-only after construction (see §5 Shared-resource policy).
pub type PluginSchema = HashMap<String, TableSchema>;

/// Map of connection name to that connection's plugin schema.
pub type PluginSchemaMap = HashMap<String, PluginSchema>;

/// Input to all `QueryCache` operations.
///
/// Identifies one logical query: a connection, a table, qualifier
/// predicates, requested columns, and a row limit. Two requests that are
/// equal in every field below produce identical cache keys regardless of
/// `call_id`, insertion order of `quals`, or the state of any in-flight
/// fetch.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheRequest {
    /// Name of the connection (binding to a specific data source instance).
    pub connection_name: String,
    /// Table being queried.
    pub table: String,
    /// Qualifier predicates, grouped by column.
    pub quals: QualMap,
    /// Ordered list of requested column names.
    pub columns: Vec<String>,
    /// Row limit; `NO_LIMIT` (-1) means unlimited.
    pub limit: i64,
    /// Caller's desired freshness bound, in seconds.
    pub ttl_seconds: u64,
    /// Unique identifier for this in-flight request.
    pub call_id: String,
}

impl CacheRequest {
    /// Construct a request with no qualifiers, no limit, and a zero TTL
    /// (callers should set `ttl_seconds` explicitly before use).
    #[must_use]
    pub fn new(
        connection_name: impl Into<String>,
        table: impl Into<String>,
        columns: Vec<String>,
        call_id: impl Into<String>,
    ) -> Self {
        Self {
            connection_name: connection_name.into(),
            table: table.into(),
            quals: QualMap::new(),
            columns,
            limit: NO_LIMIT,
            ttl_seconds: 0,
            call_id: call_id.into(),
        }
    }

    /// Construct a request like [`CacheRequest::new`], generating a random
    /// `call_id` rather than requiring the caller to supply one — useful for
    /// a one-shot `Get` where nothing else needs to correlate against this
    /// request's call id.
    #[must_use]
    pub fn with_generated_call_id(
        connection_name: impl Into<String>,
        table: impl Into<String>,
        columns: Vec<String>,
    ) -> Self {
        Self::new(connection_name, table, columns, uuid::Uuid::new_v4().to_string())
    }

    /// True if this request has no row limit.
    #[must_use]
    pub fn is_unlimited(&self) -> bool {
        self.limit == NO_LIMIT
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_request_is_unlimited_by_default() {
        let req = CacheRequest::new("aws", "ec2", vec!["id".into()], "call-1");
        assert!(req.is_unlimited());
        assert_eq!(req.ttl_seconds, 0);
    }

    #[test]
    fn generated_call_id_is_a_valid_uuid_and_varies_per_call() {
        let a = CacheRequest::with_generated_call_id("aws", "ec2", vec!["id".into()]);
        let b = CacheRequest::with_generated_call_id("aws", "ec2", vec!["id".into()]);
        assert_ne!(a.call_id, b.call_id);
        assert!(uuid::Uuid::parse_str(&a.call_id).is_ok());
    }
}
