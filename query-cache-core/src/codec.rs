//! Marshal/unmarshal of `QueryResult` pages and `IndexBucket` catalogs to
//! bytes, via `postcard`'s length-prefixed binary format.
//!
//! The wire format is treated as opaque by the rest of the crate (callers
//! never inspect the bytes); this module is the only place that knows it.

use crate::error::{Error, Result};
use crate::index::IndexBucket;
use crate::request::Row;
use serde::{Deserialize, Serialize};

/// A page of rows, the unit persisted under one page key.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryResult {
    /// Up to `rowBufferSize` rows (see `cache::ROW_BUFFER_SIZE`).
    pub rows: Vec<Row>,
}

/// Encode a value to its stable wire representation.
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    postcard::to_allocvec(value).map_err(Error::from)
}

/// Decode a value from its stable wire representation.
pub fn decode<T: for<'a> Deserialize<'a>>(bytes: &[u8]) -> Result<T> {
    postcard::from_bytes(bytes).map_err(Error::from)
}

/// Encode a page of rows.
pub fn encode_page(rows: Vec<Row>) -> Result<Vec<u8>> {
    encode(&QueryResult { rows })
}

/// Decode a page of rows.
pub fn decode_page(bytes: &[u8]) -> Result<QueryResult> {
    decode(bytes)
}

/// Encode an index bucket.
pub fn encode_index_bucket(bucket: &IndexBucket) -> Result<Vec<u8>> {
    encode(bucket)
}

/// Decode an index bucket.
pub fn decode_index_bucket(bytes: &[u8]) -> Result<IndexBucket> {
    decode(bytes)
}
