//! Directory of in-flight `SetRequest`s keyed by index-bucket key, so a
//! late reader can discover and subscribe to a population already underway.

use crate::request::{CacheRequest, KeyColumn};
use crate::set_request::SharedSetRequest;
use std::collections::HashMap;
use tokio::sync::RwLock;

/// A back-reference stored under the index-bucket key: which call is
/// producing, and the `SetRequest` it's writing to.
#[derive(Clone)]
pub struct PendingIndexItem {
    /// The call id of the producing request.
    pub call_id: String,
    /// The in-flight population this item points at.
    pub set_request: SharedSetRequest,
}

/// All pending items for one index-bucket key (there can be more than one
/// in-flight population for the same table concurrently, at different
/// qual/column/limit shapes).
#[derive(Clone, Default)]
struct PendingIndexBucket {
    items: Vec<PendingIndexItem>,
}

/// Directory of pending (in-flight) populations, keyed by index-bucket key.
///
/// Held behind a single `RwLock`; never held across a store call or a
/// subscriber stream (see spec §5 ordering discipline).
#[derive(Default)]
pub struct PendingIndex {
    buckets: RwLock<HashMap<String, PendingIndexBucket>>,
}

impl PendingIndex {
    /// Empty directory.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Find a pending item under `index_bucket_key` whose request satisfies
    /// `req`, using the same matching rule as `IndexBucket::find_match`,
    /// applied to the pending request's own (quals, columns, limit).
    pub async fn find_satisfying(
        &self,
        index_bucket_key: &str,
        req: &CacheRequest,
        key_columns: &HashMap<String, KeyColumn>,
    ) -> Option<PendingIndexItem> {
        let buckets = self.buckets.read().await;
        let bucket = buckets.get(index_bucket_key)?;
        bucket
            .items
            .iter()
            .find(|item| request_satisfies(&item.set_request.request, req, key_columns))
            .cloned()
    }

    /// Register a new pending item for a caller that is about to become the
    /// producer for `req`.
    pub async fn register(
        &self,
        index_bucket_key: &str,
        call_id: String,
        set_request: SharedSetRequest,
    ) {
        let mut buckets = self.buckets.write().await;
        buckets
            .entry(index_bucket_key.to_string())
            .or_default()
            .items
            .push(PendingIndexItem {
                call_id,
                set_request,
            });
    }

    /// Double-checked find-or-register (spec §4.6): look for a satisfying
    /// pending item under a read lock first; if none is found, upgrade to a
    /// write lock and check again before registering `set_request` as the
    /// new producer, so two concurrent misses for the same request never
    /// both become producers.
    ///
    /// Returns `Some(item)` if a satisfying population (possibly just
    /// registered by a racing caller) was found — the caller should
    /// subscribe to it instead. Returns `None` if this call won the race and
    /// registered `set_request` itself.
    pub async fn find_or_register(
        &self,
        index_bucket_key: &str,
        req: &CacheRequest,
        key_columns: &HashMap<String, KeyColumn>,
        call_id: String,
        set_request: SharedSetRequest,
    ) -> Option<PendingIndexItem> {
        {
            let buckets = self.buckets.read().await;
            if let Some(bucket) = buckets.get(index_bucket_key) {
                if let Some(item) = bucket
                    .items
                    .iter()
                    .find(|item| request_satisfies(&item.set_request.request, req, key_columns))
                {
                    return Some(item.clone());
                }
            }
        }
        let mut buckets = self.buckets.write().await;
        if let Some(bucket) = buckets.get(index_bucket_key) {
            if let Some(item) = bucket
                .items
                .iter()
                .find(|item| request_satisfies(&item.set_request.request, req, key_columns))
            {
                return Some(item.clone());
            }
        }
        buckets
            .entry(index_bucket_key.to_string())
            .or_default()
            .items
            .push(PendingIndexItem {
                call_id,
                set_request,
            });
        None
    }

    /// Remove the pending item for `call_id` under `index_bucket_key`,
    /// called on `EndSet`/`AbortSet` regardless of outcome.
    pub async fn complete(&self, index_bucket_key: &str, call_id: &str) {
        let mut buckets = self.buckets.write().await;
        if let Some(bucket) = buckets.get_mut(index_bucket_key) {
            bucket.items.retain(|item| item.call_id != call_id);
            if bucket.items.is_empty() {
                buckets.remove(index_bucket_key);
            }
        }
    }
}

/// Does a pending producer's own original request satisfy a new caller's
/// request? This reuses the index-item matching semantics (quals/columns/
/// limit cover) but against a live request rather than a persisted
/// `IndexItem`, so a subscriber only coalesces onto a population that will
/// actually answer its query. Freshness does not apply here — the producer
/// is, by definition, populating right now.
fn request_satisfies(
    pending: &CacheRequest,
    req: &CacheRequest,
    key_columns: &HashMap<String, KeyColumn>,
) -> bool {
    if pending.connection_name != req.connection_name || pending.table != req.table {
        return false;
    }
    let limit_covers = pending.limit == crate::request::NO_LIMIT
        || (req.limit >= 0 && pending.limit >= req.limit);
    let columns_cover = req
        .columns
        .iter()
        .all(|c| pending.columns.iter().any(|pc| pc == c));
    let quals_cover = req.quals.iter().all(|(column, reqd_quals)| {
        if !key_columns.contains_key(column) {
            return true;
        }
        let Some(pending_quals) = pending.quals.get(column) else {
            return false;
        };
        reqd_quals.iter().all(|rq| {
            pending_quals
                .iter()
                .any(|pq| pq.field_name == rq.field_name && pq.operator == rq.operator && pq.value == rq.value)
        })
    });
    limit_covers && columns_cover && quals_cover
}
