//! `QueryCache`: the orchestrator tying `KeyBuilder`, `StoreAdapter`,
//! `IndexBucket`, `SetRequest`, and `PendingIndex` together into the public
//! `Get`/`StartSet`/`IterateSet`/`EndSet`/`AbortSet`/`ClearForConnection`
//! surface described in spec §4.5-4.8.

use crate::codec;
use crate::error::{Error, Result, StoreError};
use crate::index::IndexBucket;
use crate::index::IndexItem;
use crate::key::KeyBuilder;
use crate::pending::{PendingIndex, PendingIndexItem};
use crate::request::{CacheRequest, KeyColumn, PluginSchemaMap, Row};
use crate::set_request::{SetRequest, SharedSetRequest, StreamEvent};
use crate::store::{ByteStore, ShardedMemoryStore, StoreAdapter};
use futures::stream::{self, StreamExt};
use futures::FutureExt;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{oneshot, RwLock};
use tracing::{instrument, trace, warn};

/// Maximum number of page fetches a single `get` may have in flight at once,
/// on a multi-page hit (spec §5 bounded-parallelism requirement).
const MAX_CONCURRENT_PAGE_FETCHES: usize = 5;

/// A `get` caller's cooperative cancel signal, threaded by mutable reference
/// through the stream loops so it can be re-borrowed at each await point
/// rather than consumed by the first one.
type CancelSignal<'a> = Option<&'a mut oneshot::Receiver<()>>;

/// Race `fut` against `cancel` firing. With no cancel signal this is just
/// `fut.await`.
async fn race_cancel<T>(cancel: &mut CancelSignal<'_>, fut: impl Future<Output = T>) -> Result<T> {
    match cancel {
        Some(rx) => {
            tokio::select! {
                biased;
                _ = &mut **rx => Err(Error::Cancelled),
                value = fut => Ok(value),
            }
        }
        None => Ok(fut.await),
    }
}

/// Construction options for a [`QueryCache`].
#[derive(Debug, Clone)]
pub struct CacheOptions {
    /// Master on/off switch. When `false`, every public method either
    /// no-ops or returns [`Error::Disabled`].
    pub enabled: bool,
    /// Total byte budget handed to the default [`ShardedMemoryStore`] when
    /// constructed via [`QueryCache::with_memory_store`].
    pub max_size_mb: usize,
    /// Hard TTL cap applied to every store write, regardless of a request's
    /// own `ttl_seconds` (which only governs index-item freshness matching).
    pub ttl: Duration,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            max_size_mb: 256,
            ttl: crate::store::memory::DEFAULT_MAX_TTL,
        }
    }
}

/// Hit/miss counters for observability, accessed via [`QueryCache::stats`].
#[derive(Debug, Default)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
}

impl CacheStats {
    fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    /// Total `get` calls that were satisfied from the cache.
    #[must_use]
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Total `get` calls that fell through to the caller.
    #[must_use]
    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// Hit rate in `[0.0, 1.0]`; `0.0` if there have been no calls yet.
    #[must_use]
    pub fn hit_rate(&self) -> f64 {
        let hits = self.hits() as f64;
        let total = hits + self.misses() as f64;
        if total == 0.0 {
            0.0
        } else {
            hits / total
        }
    }
}

/// The streaming query result cache.
///
/// Generic over its backing [`ByteStore`] so a caller can swap in a
/// different persistence layer without touching any of the coalescing,
/// paging, or key-derivation logic above it.
pub struct QueryCache<S: ByteStore> {
    plugin_name: String,
    plugin_schema_map: PluginSchemaMap,
    store: StoreAdapter<S>,
    pending: PendingIndex,
    set_requests: RwLock<HashMap<String, SharedSetRequest>>,
    stats: CacheStats,
    enabled: bool,
    ttl: Duration,
}

impl QueryCache<ShardedMemoryStore> {
    /// Build a cache backed by the default in-process [`ShardedMemoryStore`],
    /// sized and capped per `options`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Protocol`] if `options.max_size_mb` is `0` — a store
    /// with no byte budget could admit nothing and every `set` would fail
    /// with [`Error::Store`]`(`[`StoreError::CapacityExceeded`]`)` anyway, so
    /// this is rejected up front instead of at the first write.
    pub fn with_memory_store(
        plugin_name: impl Into<String>,
        plugin_schema_map: PluginSchemaMap,
        options: CacheOptions,
    ) -> Result<Self> {
        if options.max_size_mb == 0 {
            return Err(Error::Protocol(
                "CacheOptions.max_size_mb must be greater than zero".to_string(),
            ));
        }
        let store = ShardedMemoryStore::new(options.max_size_mb, options.ttl);
        Ok(Self::new(plugin_name, plugin_schema_map, store, options))
    }
}

impl<S: ByteStore> QueryCache<S> {
    /// Build a cache over an arbitrary [`ByteStore`] implementation.
    pub fn new(
        plugin_name: impl Into<String>,
        plugin_schema_map: PluginSchemaMap,
        store: S,
        options: CacheOptions,
    ) -> Self {
        Self {
            plugin_name: plugin_name.into(),
            plugin_schema_map,
            store: StoreAdapter::new(store),
            pending: PendingIndex::new(),
            set_requests: RwLock::new(HashMap::new()),
            stats: CacheStats::default(),
            enabled: options.enabled,
            ttl: options.ttl,
        }
    }

    /// Hit/miss counters.
    #[must_use]
    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    /// This cache's plugin name, for log context.
    #[must_use]
    pub fn plugin_name(&self) -> &str {
        &self.plugin_name
    }

    /// Fetch a cached result for `req`, streaming each row to `stream_row` as
    /// it becomes available.
    ///
    /// On a cache hit, rows arrive page by page: page 0 synchronously, then
    /// the remaining pages fetched with up to [`MAX_CONCURRENT_PAGE_FETCHES`]
    /// in flight, delivered in page order regardless of fetch-completion
    /// order. On a miss, this transparently tries to coalesce onto an
    /// already in-flight population for an equivalent request before
    /// surfacing [`Error::CacheMiss`] to the caller.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Disabled`] if caching is off, [`Error::CacheMiss`] if
    /// no cached or in-flight result satisfies `req`, or any error the
    /// backing store/codec produced while trying to find out.
    #[instrument(skip(self, stream_row), fields(table = %req.table, connection = %req.connection_name))]
    pub async fn get<F>(&self, req: CacheRequest, stream_row: F) -> Result<()>
    where
        F: FnMut(Row) + Send,
    {
        self.get_inner(req, stream_row, None).await
    }

    /// Like [`QueryCache::get`], but aborts promptly with [`Error::Cancelled`]
    /// if `cancel` resolves before streaming completes. Cancellation is
    /// cooperative: it is only observed between page fetches and subscriber
    /// events, never mid-row.
    ///
    /// # Errors
    ///
    /// As [`QueryCache::get`], plus [`Error::Cancelled`] if `cancel` fires
    /// first.
    #[instrument(skip(self, stream_row, cancel), fields(table = %req.table, connection = %req.connection_name))]
    pub async fn get_with_cancel<F>(
        &self,
        req: CacheRequest,
        stream_row: F,
        mut cancel: oneshot::Receiver<()>,
    ) -> Result<()>
    where
        F: FnMut(Row) + Send,
    {
        self.get_inner(req, stream_row, Some(&mut cancel)).await
    }

    async fn get_inner<F>(
        &self,
        req: CacheRequest,
        mut stream_row: F,
        mut cancel: CancelSignal<'_>,
    ) -> Result<()>
    where
        F: FnMut(Row) + Send,
    {
        if !self.enabled {
            return Err(Error::Disabled);
        }
        let index_bucket_key = KeyBuilder::index_key(&req.connection_name, &req.table);

        match self
            .get_cached_query_result(&index_bucket_key, &req, &mut stream_row, &mut cancel)
            .await
        {
            Ok(()) => {
                self.stats.record_hit();
                trace!(%index_bucket_key, "cache hit");
                Ok(())
            }
            Err(Error::CacheMiss) => {
                self.stats.record_miss();
                trace!(%index_bucket_key, "cache miss; checking for an in-flight population");
                self.find_and_subscribe_to_pending(&index_bucket_key, &req, &mut stream_row, &mut cancel)
                    .await
            }
            Err(e) => Err(e),
        }
    }

    async fn get_cached_query_result(
        &self,
        index_bucket_key: &str,
        req: &CacheRequest,
        stream_row: &mut (dyn FnMut(Row) + Send),
        cancel: &mut CancelSignal<'_>,
    ) -> Result<()> {
        let key_columns = self.key_columns_for_table(&req.connection_name, &req.table);
        let bucket = self.get_cached_index_bucket(index_bucket_key).await?;
        let item = bucket
            .find_match(req, &key_columns)
            .ok_or(Error::CacheMiss)?;
        self.stream_from_index_item(item, stream_row, cancel).await
    }

    async fn get_cached_index_bucket(&self, index_bucket_key: &str) -> Result<IndexBucket> {
        match self.store.get(index_bucket_key).await {
            Ok(bytes) => codec::decode_index_bucket(&bytes),
            Err(StoreError::Miss(_)) => Err(Error::CacheMiss),
            Err(e) => Err(Error::from(e)),
        }
    }

    async fn fetch_page(&self, result_key_root: &str, page_index: u64) -> Result<codec::QueryResult> {
        let key = KeyBuilder::page_key(result_key_root, page_index);
        match self.store.get(&key).await {
            Ok(bytes) => codec::decode_page(&bytes),
            Err(StoreError::Miss(_)) => Err(Error::CacheMiss),
            Err(e) => Err(Error::from(e)),
        }
    }

    /// Stream every row of `item`: page 0 synchronously, the rest bounded and
    /// ordered. See spec §9 "ring of slots" — `buffered` on a page-index
    /// stream gives exactly that: up to N fetches in flight, yielded back in
    /// the original (page) order.
    async fn stream_from_index_item(
        &self,
        item: &IndexItem,
        stream_row: &mut (dyn FnMut(Row) + Send),
        cancel: &mut CancelSignal<'_>,
    ) -> Result<()> {
        if item.page_count == 0 {
            return Ok(());
        }
        let first = race_cancel(cancel, self.fetch_page(&item.key, 0)).await??;
        for row in first.rows {
            stream_row(row);
        }
        if item.page_count == 1 {
            return Ok(());
        }

        let mut pages = stream::iter(1..item.page_count)
            .map(|page_index| self.fetch_page(&item.key, page_index))
            .buffered(MAX_CONCURRENT_PAGE_FETCHES);

        // A miss on any page means the result set is no longer fully
        // present and the whole `get` must be treated as a cold miss so the
        // caller repopulates it. Any other error aborts `get` outright. Real
        // errors take priority over a miss verdict, matching the original's
        // "errors accumulate, then are checked before the miss flag" order.
        let mut saw_miss = false;
        while let Some(result) = race_cancel(cancel, pages.next()).await? {
            match result {
                Ok(page) => {
                    for row in page.rows {
                        stream_row(row);
                    }
                }
                Err(Error::CacheMiss) => saw_miss = true,
                Err(e) => return Err(e),
            }
        }
        if saw_miss {
            return Err(Error::CacheMiss);
        }
        Ok(())
    }

    /// spec §4.6: on a cold miss, look for (or become) the producer for an
    /// equivalent request before giving up.
    async fn find_and_subscribe_to_pending(
        &self,
        index_bucket_key: &str,
        req: &CacheRequest,
        stream_row: &mut (dyn FnMut(Row) + Send),
        cancel: &mut CancelSignal<'_>,
    ) -> Result<()> {
        let key_columns = self.key_columns_for_table(&req.connection_name, &req.table);

        if let Some(item) = self
            .pending
            .find_satisfying(index_bucket_key, req, &key_columns)
            .await
        {
            trace!(call_id = %item.call_id, "subscribing to an already in-flight population");
            return self.subscribe_to_pending(&item, req, stream_row, cancel).await;
        }

        // No one is populating this yet (as far as we last checked). Build
        // our own `SetRequest` and try to register it atomically; a racing
        // caller may have beaten us to it in between the check above and
        // this registration, in which case we subscribe to theirs instead.
        let result_key_root = KeyBuilder::result_key_root(req);
        let set_request = std::sync::Arc::new(SetRequest::new(req.clone(), result_key_root));
        match self
            .pending
            .find_or_register(
                index_bucket_key,
                req,
                &key_columns,
                req.call_id.clone(),
                set_request.clone(),
            )
            .await
        {
            Some(item) => {
                trace!(call_id = %item.call_id, "lost the producer race; subscribing instead");
                self.subscribe_to_pending(&item, req, stream_row, cancel).await
            }
            None => {
                // We won the race and are now the producer of record. The
                // caller is expected to follow this miss with `start_set`,
                // which will find and reuse this exact `SetRequest` rather
                // than creating a second one (see `start_set`'s doc comment
                // for why this indirection exists).
                trace!(call_id = %req.call_id, "promoted to producer for this fingerprint");
                self.set_requests
                    .write()
                    .await
                    .insert(req.call_id.clone(), set_request);
                Err(Error::CacheMiss)
            }
        }
    }

    /// Atomically snapshot-and-subscribe to `item`'s `SetRequest`, then
    /// replay its already-flushed pages, its currently-buffered rows, and
    /// finally its live stream — in that order, with no gap or duplicate.
    async fn subscribe_to_pending(
        &self,
        item: &PendingIndexItem,
        req: &CacheRequest,
        stream_row: &mut (dyn FnMut(Row) + Send),
        cancel: &mut CancelSignal<'_>,
    ) -> Result<()> {
        let (mut rx, prev_page_keys, buffered) =
            item.set_request.subscribe(req.call_id.clone()).await;

        for key in prev_page_keys {
            match race_cancel(cancel, self.store.get(&key)).await? {
                Ok(bytes) => {
                    let page = codec::decode_page(&bytes)?;
                    for row in page.rows {
                        stream_row(row);
                    }
                }
                // The producer is still writing; a page it already counted
                // in `page_count` but hasn't yet durably written is treated
                // as simply not-there-yet rather than an error — the live
                // stream below will have already delivered those same rows.
                Err(StoreError::Miss(_)) => {}
                Err(e) => return Err(Error::from(e)),
            }
        }
        for row in buffered {
            stream_row(row);
        }

        while let Some(event) = race_cancel(cancel, rx.recv()).await? {
            match event {
                StreamEvent::Row(row) => stream_row(row),
                StreamEvent::End => return Ok(()),
                StreamEvent::Error(message) => return Err(Error::Aborted(message)),
            }
        }
        Ok(())
    }

    /// Begin a new population for `req`. If `req.call_id` already has a
    /// `SetRequest` registered — because a `get` call just lost the
    /// producer race and pre-registered one via `find_and_subscribe_to_pending`
    /// — that same instance is reused, so the pending directory and the
    /// live set-request directory always point at one object.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Disabled`] if caching is off.
    pub async fn start_set(&self, req: CacheRequest) -> Result<SharedSetRequest> {
        if !self.enabled {
            return Err(Error::Disabled);
        }
        let mut set_requests = self.set_requests.write().await;
        if let Some(existing) = set_requests.get(&req.call_id) {
            return Ok(existing.clone());
        }
        let result_key_root = KeyBuilder::result_key_root(&req);
        let set_request = std::sync::Arc::new(SetRequest::new(req.clone(), result_key_root));
        set_requests.insert(req.call_id.clone(), set_request.clone());
        Ok(set_request)
    }

    /// Append one row to the population identified by `call_id`, flushing a
    /// page to the store whenever the row buffer fills.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Protocol`] if `call_id` has no active `SetRequest`,
    /// or [`Error::Flush`] if this (or the buffer-filling) flush failed.
    pub async fn iterate_set(&self, call_id: &str, row: Row) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        let set_request = self.lookup_set_request(call_id).await?;
        if let Some(message) = set_request.latched_error().await {
            return Err(Error::Flush(message));
        }
        if set_request.append_row(row).await {
            self.flush_page(&set_request).await?;
        }
        Ok(())
    }

    async fn flush_page(&self, set_request: &SetRequest) -> Result<()> {
        let (rows, page_index) = set_request.take_buffer_for_flush().await;
        let key = KeyBuilder::page_key(&set_request.result_key_root, page_index);
        let bytes = codec::encode_page(rows)?;
        if let Err(e) = self
            .store
            .set(&key, bytes, self.ttl, &set_request.request.connection_name, vec![])
            .await
        {
            let message = e.to_string();
            set_request.latch_error(message.clone()).await;
            return Err(Error::Flush(message));
        }
        Ok(())
    }

    /// Finish the population identified by `call_id`: flush the trailing
    /// (possibly short or empty) page, write the updated index bucket, and
    /// unconditionally clean up the set-request and pending directory
    /// entries and signal every subscriber, even if finalization panicked or
    /// the trailing flush failed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Protocol`] if `call_id` is unknown,
    /// [`Error::Flush`] if the trailing page or the index bucket failed to
    /// write, or [`Error::PanicRecovered`] if finalization panicked (cleanup
    /// still ran).
    #[instrument(skip(self))]
    pub async fn end_set(&self, call_id: &str) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        let set_request = self.lookup_set_request(call_id).await?;

        let outcome = match std::panic::AssertUnwindSafe(self.end_set_inner(&set_request))
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(panic_payload) => {
                let message = panic_message(&panic_payload);
                warn!(call_id, error = %message, "panic recovered during end_set");
                Err(Error::PanicRecovered(message))
            }
        };

        self.set_requests.write().await.remove(call_id);
        let index_bucket_key = KeyBuilder::index_key(
            &set_request.request.connection_name,
            &set_request.request.table,
        );
        self.pending.complete(&index_bucket_key, call_id).await;
        // Every ingested row already reached live subscribers via
        // `append_row`'s fan-out regardless of whether the trailing flush or
        // index write below it succeeded, so a plain `End` is always the
        // right terminal signal here — a failure only means the *next*
        // `get` for this shape will miss and have to repopulate.
        set_request.complete().await;

        outcome
    }

    async fn end_set_inner(&self, set_request: &SetRequest) -> Result<()> {
        self.flush_page(set_request).await?;

        let index_bucket_key = KeyBuilder::index_key(
            &set_request.request.connection_name,
            &set_request.request.table,
        );
        let mut bucket = match self.get_cached_index_bucket(&index_bucket_key).await {
            Ok(bucket) => bucket,
            Err(Error::CacheMiss) => IndexBucket::new(),
            Err(e) => return Err(e),
        };
        let item = IndexItem::new(
            &set_request.request,
            set_request.result_key_root.clone(),
            set_request.page_count().await,
        );
        trace!(key = %item.key, page_count = item.page_count, "appending index item");
        bucket.append(item);

        let bytes = codec::encode_index_bucket(&bucket)?;
        self.store
            .set(
                &index_bucket_key,
                bytes,
                self.ttl,
                &set_request.request.connection_name,
                vec![],
            )
            .await
            .map_err(|e| Error::Flush(e.to_string()))
    }

    /// Abort the population identified by `call_id`: signal every subscriber
    /// with `message`, remove it from both directories, and best-effort
    /// delete any pages already flushed (they'd otherwise be orphaned bytes
    /// with no index item ever pointing at them).
    ///
    /// A call for an unknown `call_id` is a silent no-op — `AbortSet` is
    /// expected to be safe to call defensively during error unwinding even
    /// when `StartSet` never actually ran.
    pub async fn abort_set(&self, call_id: &str, message: impl Into<String>) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        let set_request = self.set_requests.write().await.remove(call_id);
        let Some(set_request) = set_request else {
            return Ok(());
        };

        let message = message.into();
        set_request.abort(message).await;

        let index_bucket_key = KeyBuilder::index_key(
            &set_request.request.connection_name,
            &set_request.request.table,
        );
        self.pending.complete(&index_bucket_key, call_id).await;

        let page_count = set_request.page_count().await;
        for page_index in 0..page_count {
            let key = KeyBuilder::page_key(&set_request.result_key_root, page_index);
            if let Err(e) = self.store.delete(&key).await {
                warn!(call_id, key, error = %e, "failed to delete orphaned page during abort_set");
            }
        }
        Ok(())
    }

    /// Invalidate every cached entry (index buckets and pages alike) tagged
    /// with `connection_name`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Disabled`] if caching is off, or a store error.
    pub async fn clear_for_connection(&self, connection_name: &str) -> Result<()> {
        if !self.enabled {
            return Err(Error::Disabled);
        }
        self.store
            .invalidate_by_tag(connection_name)
            .await
            .map_err(Error::from)
    }

    async fn lookup_set_request(&self, call_id: &str) -> Result<SharedSetRequest> {
        self.set_requests
            .read()
            .await
            .get(call_id)
            .cloned()
            .ok_or_else(|| Error::Protocol(format!("no in-progress set request for call id '{call_id}'")))
    }

    /// Union of a table's list-call and get-call key columns, by name. A
    /// connection or table absent from the schema map yields an empty set —
    /// every qualifier is then treated as non-key and ignored by matching,
    /// an acknowledged over-match risk logged here rather than silently
    /// swallowed (see spec §9 Open Questions).
    fn key_columns_for_table(&self, connection_name: &str, table: &str) -> HashMap<String, KeyColumn> {
        let Some(table_schema) = self
            .plugin_schema_map
            .get(connection_name)
            .and_then(|schema| schema.get(table))
        else {
            warn!(connection_name, table, "no schema for table; qualifiers will not restrict cache matches");
            return HashMap::new();
        };
        table_schema
            .list_call_key_columns
            .iter()
            .chain(table_schema.get_call_key_columns.iter())
            .map(|kc| (kc.name.clone(), kc.clone()))
            .collect()
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
