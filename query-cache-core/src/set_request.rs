//! Live cache-population state: the page buffer, subscriber fan-out, and
//! the completion/error signal a `SetRequest` carries for its whole
//! lifetime.

use crate::request::{CacheRequest, Row};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::trace;

/// Rows are buffered up to this many before being flushed as a page.
pub const ROW_BUFFER_SIZE: usize = 1000;

/// One event in a subscriber's row stream. `End`/`Error` are the terminal
/// signals; a subscriber sees at most one of them, always last.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// One row, in ingestion order.
    Row(Row),
    /// End of stream: no more rows will follow.
    End,
    /// The producer aborted or a flush failed; the error message is
    /// surfaced as-is.
    Error(String),
}

/// A per-consumer fan-out handle. The producer enqueues under the
/// `SetRequest`'s lock; the subscriber drains outside it via the returned
/// receiver, so a slow subscriber can never block the producer's lock
/// indefinitely (only its own unbounded queue grows).
pub struct Subscriber {
    call_id: String,
    sender: mpsc::UnboundedSender<StreamEvent>,
}

impl Subscriber {
    fn send(&self, event: StreamEvent) {
        // A dropped receiver (subscriber gave up) is not this producer's
        // problem; it just means future sends are no-ops.
        let _ = self.sender.send(event);
    }

    /// The call id of the subscribing request, for log context.
    #[must_use]
    pub fn call_id(&self) -> &str {
        &self.call_id
    }
}

/// Mutable state guarded by the `SetRequest`'s own lock: buffer, page
/// count, subscribers, err, complete.
struct State {
    /// Invariant: `row_index` is always `buffer.len()` and stays in
    /// `[0, ROW_BUFFER_SIZE)` between flushes.
    buffer: Vec<Row>,
    page_count: u64,
    subscribers: Vec<Subscriber>,
    err: Option<String>,
    complete: bool,
}

/// Owned by exactly one writer for the lifetime of a cache population;
/// shared read-only (`Arc`) between that writer and any subscribers that
/// coalesce onto it.
pub struct SetRequest {
    /// The request that started this population. Immutable for the
    /// `SetRequest`'s lifetime — `resultKeyRoot` et al. are derived from it
    /// once, in `QueryCache::start_set`.
    pub request: CacheRequest,
    /// The deterministic root all of this request's page keys derive from.
    pub result_key_root: String,
    state: Mutex<State>,
}

impl SetRequest {
    /// Begin a new, empty population for `request` rooted at
    /// `result_key_root`.
    #[must_use]
    pub fn new(request: CacheRequest, result_key_root: String) -> Self {
        Self {
            request,
            result_key_root,
            state: Mutex::new(State {
                buffer: Vec::with_capacity(ROW_BUFFER_SIZE),
                page_count: 0,
                subscribers: Vec::new(),
                err: None,
                complete: false,
            }),
        }
    }

    /// Append `row` to the buffer and fan it out to every current
    /// subscriber. Returns `true` if the buffer is now full and the caller
    /// must flush a page.
    ///
    /// If a prior error is latched, this is a no-op and returns `false` —
    /// callers must check `latched_error` first (mirrors the original's
    /// "was there an error in a previous iterate" short-circuit).
    pub async fn append_row(&self, row: Row) -> bool {
        let mut state = self.state.lock().await;
        if state.err.is_some() {
            return false;
        }
        state.buffer.push(row.clone());
        for sub in &state.subscribers {
            sub.send(StreamEvent::Row(row.clone()));
        }
        state.buffer.len() == ROW_BUFFER_SIZE
    }

    /// Any error latched by a previous `IterateSet`/flush.
    pub async fn latched_error(&self) -> Option<String> {
        self.state.lock().await.err.clone()
    }

    /// Take the current buffer for persisting as a page, incrementing the
    /// page count and resetting the buffer. The page-count increment
    /// happens before the caller derives the page key, so the first page
    /// persisted is index 0 (the new count minus one).
    pub async fn take_buffer_for_flush(&self) -> (Vec<Row>, u64) {
        let mut state = self.state.lock().await;
        let rows = std::mem::replace(&mut state.buffer, Vec::with_capacity(ROW_BUFFER_SIZE));
        state.page_count += 1;
        let page_index = state.page_count - 1;
        trace!(page_index, rows = rows.len(), "flushing page");
        (rows, page_index)
    }

    /// Record a flush/store error on this request. Once set, subsequent
    /// `append_row` calls short-circuit and `EndSet` surfaces the same
    /// error.
    pub async fn latch_error(&self, message: String) {
        self.state.lock().await.err = Some(message);
    }

    /// Number of pages already persisted.
    pub async fn page_count(&self) -> u64 {
        self.state.lock().await.page_count
    }

    /// Page keys for every page already persisted: `0..page_count`.
    pub async fn prev_page_keys(&self) -> Vec<String> {
        let page_count = self.page_count().await;
        (0..page_count)
            .map(|i| crate::key::KeyBuilder::page_key(&self.result_key_root, i))
            .collect()
    }

    /// Snapshot of rows currently buffered (not yet persisted).
    pub async fn buffered_rows_snapshot(&self) -> Vec<Row> {
        self.state.lock().await.buffer.clone()
    }

    /// Register `subscriber`, returning a snapshot of `(prev_page_keys,
    /// buffered_rows)` taken under the *same* lock acquisition — the only
    /// correct shape per spec §9: a row the producer ingests after this
    /// call returns is guaranteed to reach `subscriber` via fan-out; a row
    /// already reflected in the snapshot will not be re-sent live, because
    /// the subscriber is registered before the lock is released.
    pub async fn subscribe(
        &self,
        call_id: String,
    ) -> (mpsc::UnboundedReceiver<StreamEvent>, Vec<String>, Vec<Row>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state.lock().await;
        state.subscribers.push(Subscriber {
            call_id,
            sender: tx,
        });
        let buffered = state.buffer.clone();
        // page_count must be read from this same guard, not via a second
        // lock acquisition after dropping it — a flush racing the gap
        // between the two acquisitions could advance page_count to cover a
        // page whose rows this subscriber already saw via the buffer
        // snapshot above or will see via live fan-out, duplicating them.
        let prev_keys = (0..state.page_count)
            .map(|i| crate::key::KeyBuilder::page_key(&self.result_key_root, i))
            .collect();
        drop(state);
        (rx, prev_keys, buffered)
    }

    /// Broadcast end-of-stream to every subscriber and mark complete.
    pub async fn complete(&self) {
        let mut state = self.state.lock().await;
        for sub in &state.subscribers {
            sub.send(StreamEvent::End);
        }
        state.complete = true;
    }

    /// Broadcast a terminal error to every subscriber (used by `AbortSet`
    /// and by `EndSet` when the trailing flush itself fails).
    pub async fn abort(&self, message: String) {
        let mut state = self.state.lock().await;
        state.err = Some(message.clone());
        for sub in &state.subscribers {
            sub.send(StreamEvent::Error(message.clone()));
        }
        state.complete = true;
    }

    /// True once this request has reached a terminal state.
    pub async fn is_complete(&self) -> bool {
        self.state.lock().await.complete
    }
}

/// A call-id-keyed, ref-counted handle to a `SetRequest`, the shape stored
/// in both the set-request directory and (via `PendingIndexItem`) the
/// pending directory.
pub type SharedSetRequest = Arc<SetRequest>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::Value;

    fn req() -> CacheRequest {
        CacheRequest::new("aws", "ec2", vec!["id".into()], "call-1")
    }

    #[tokio::test]
    async fn append_row_fans_out_to_subscribers() {
        let sr = SetRequest::new(req(), "root".to_string());
        let (mut rx, prev, buffered) = sr.subscribe("sub-1".to_string()).await;
        assert!(prev.is_empty());
        assert!(buffered.is_empty());

        assert!(!sr.append_row(vec![Value::Int(1)]).await);
        let event = rx.recv().await.unwrap();
        assert!(matches!(event, StreamEvent::Row(r) if r == vec![Value::Int(1)]));
    }

    #[tokio::test]
    async fn flush_triggers_at_buffer_size() {
        let sr = SetRequest::new(req(), "root".to_string());
        let mut should_flush = false;
        for i in 0..ROW_BUFFER_SIZE {
            should_flush = sr.append_row(vec![Value::Int(i as i64)]).await;
        }
        assert!(should_flush);
        let (rows, page_index) = sr.take_buffer_for_flush().await;
        assert_eq!(rows.len(), ROW_BUFFER_SIZE);
        assert_eq!(page_index, 0);
        assert_eq!(sr.page_count().await, 1);
    }

    #[tokio::test]
    async fn latched_error_short_circuits_append() {
        let sr = SetRequest::new(req(), "root".to_string());
        sr.latch_error("boom".to_string()).await;
        assert_eq!(sr.latched_error().await, Some("boom".to_string()));
        assert!(!sr.append_row(vec![Value::Int(1)]).await);
    }

    #[tokio::test]
    async fn subscribe_snapshot_and_live_fanout_do_not_duplicate_or_lose_rows() {
        let sr = SetRequest::new(req(), "root".to_string());
        sr.append_row(vec![Value::Int(1)]).await;
        sr.append_row(vec![Value::Int(2)]).await;

        let (mut rx, _prev, buffered) = sr.subscribe("late".to_string()).await;
        assert_eq!(buffered.len(), 2);

        sr.append_row(vec![Value::Int(3)]).await;
        sr.complete().await;

        let mut received = Vec::new();
        while let Some(event) = rx.recv().await {
            match event {
                StreamEvent::Row(r) => received.push(r),
                StreamEvent::End => break,
                StreamEvent::Error(e) => panic!("unexpected error: {e}"),
            }
        }
        // The snapshot already captured rows 1 and 2; only row 3 arrives
        // live. A subscriber reconstructs the full sequence by reading the
        // snapshot first, then the live stream (see cache::subscribe_to_pending).
        assert_eq!(received, vec![vec![Value::Int(3)]]);
    }

    #[tokio::test]
    async fn subscribe_prev_page_keys_matches_page_count_at_registration() {
        let sr = SetRequest::new(req(), "root".to_string());
        for i in 0..ROW_BUFFER_SIZE {
            sr.append_row(vec![Value::Int(i as i64)]).await;
        }
        // Flushing advances page_count to 1 and empties the buffer; a
        // subscriber registered right after must see exactly one prev page
        // key and an empty buffer snapshot, never a prev_keys list built
        // from a page_count read after some later flush.
        sr.take_buffer_for_flush().await;
        let (_rx, prev, buffered) = sr.subscribe("late".to_string()).await;
        assert_eq!(prev, vec!["root-p0".to_string()]);
        assert!(buffered.is_empty());
    }
}
