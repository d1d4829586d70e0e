//! Per-(connection, table) catalog of cached result variants, and the
//! matching rule that lets a narrower query reuse a wider cached result.

use crate::request::{CacheRequest, KeyColumn, QualMap, NO_LIMIT};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

/// One cached result variant's descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexItem {
    /// The result-key root this variant was stored under.
    pub key: String,
    /// Qualifiers the cached result was fetched with.
    pub quals: QualMap,
    /// Columns the cached result contains.
    pub columns: Vec<String>,
    /// Row limit in effect when this variant was populated; `NO_LIMIT` (-1)
    /// if unlimited.
    pub limit: i64,
    /// Wall-clock time this variant was inserted, in milliseconds since the
    /// Unix epoch. Millisecond (not second) granularity so short TTLs in
    /// tests are meaningfully comparable.
    pub insertion_time_millis: u64,
    /// Number of pages successfully persisted for this variant. Invariant:
    /// every `IndexItem` reachable from the bucket has had all of its pages
    /// written to the store before being appended.
    pub page_count: u64,
}

impl IndexItem {
    /// Build a new item from a request that has just finished populating,
    /// stamped with the current wall-clock time.
    #[must_use]
    pub fn new(req: &CacheRequest, key: String, page_count: u64) -> Self {
        Self {
            key,
            quals: req.quals.clone(),
            columns: req.columns.clone(),
            limit: req.limit,
            insertion_time_millis: now_millis(),
            page_count,
        }
    }

    /// Does this cached variant satisfy `req`, given `req`'s table's key
    /// columns? See spec §4.2: quals cover, columns cover, limit cover,
    /// freshness, in that order (cheapest-to-fail checks first).
    #[must_use]
    pub fn satisfies(&self, req: &CacheRequest, key_columns: &HashMap<String, KeyColumn>) -> bool {
        self.limit_covers(req.limit)
            && self.columns_cover(&req.columns)
            && self.quals_cover(&req.quals, key_columns)
            && self.is_fresh(req.ttl_seconds)
    }

    fn limit_covers(&self, requested_limit: i64) -> bool {
        self.limit == NO_LIMIT || (requested_limit >= 0 && self.limit >= requested_limit)
    }

    fn columns_cover(&self, requested_columns: &[String]) -> bool {
        requested_columns
            .iter()
            .all(|c| self.columns.iter().any(|ic| ic == c))
    }

    /// Every qualifier in `requested` that concerns a key column must be
    /// implied by this item's qualifiers on that column (same field,
    /// operator, value). Qualifiers on non-key columns are ignored: they
    /// don't partition the remote result set, so they can't disqualify a
    /// match. Tables with no schema entry have no key columns (an
    /// acknowledged over-match risk, logged by the caller — see spec §9).
    fn quals_cover(&self, requested: &QualMap, key_columns: &HashMap<String, KeyColumn>) -> bool {
        for (column, reqd_quals) in requested {
            if !key_columns.contains_key(column) {
                continue;
            }
            let Some(item_quals) = self.quals.get(column) else {
                return false;
            };
            for rq in reqd_quals {
                let implied = item_quals.iter().any(|iq| {
                    iq.field_name == rq.field_name
                        && iq.operator == rq.operator
                        && iq.value == rq.value
                });
                if !implied {
                    return false;
                }
            }
        }
        true
    }

    fn is_fresh(&self, ttl_seconds: u64) -> bool {
        let age_millis = now_millis().saturating_sub(self.insertion_time_millis);
        age_millis <= ttl_seconds.saturating_mul(1000)
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

/// Ordered collection of `IndexItem`s sharing (connection, table).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IndexBucket {
    /// Items in insertion order.
    pub items: Vec<IndexItem>,
}

impl IndexBucket {
    /// An empty bucket.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a newly-populated item.
    pub fn append(&mut self, item: IndexItem) {
        self.items.push(item);
    }

    /// Find the item (if any) that satisfies `req`. If multiple qualify,
    /// prefer the most recently inserted.
    #[must_use]
    pub fn find_match(
        &self,
        req: &CacheRequest,
        key_columns: &HashMap<String, KeyColumn>,
    ) -> Option<&IndexItem> {
        self.items
            .iter()
            .filter(|item| item.satisfies(req, key_columns))
            .max_by_key(|item| item.insertion_time_millis)
    }
}
