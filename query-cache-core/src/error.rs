//! Error types for the query cache.
//!
//! Mirrors the error taxonomy the rest of the crate relies on: a structural
//! `CacheMiss` sentinel that drives control flow (never a "real" error), a
//! `Store` / `Codec` pair for the backing store boundary, and a couple of
//! bug-signal variants (`Protocol`, `PanicRecovered`) that should never fire
//! in a correctly wired caller.

use std::fmt;

/// Result type alias for query cache operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during cache operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Caching is disabled; all public methods either no-op or return this.
    #[error("query cache is disabled")]
    Disabled,

    /// Structural sentinel for "no cached data satisfies this request".
    /// Distinct from any other error so callers can match on it directly.
    #[error("cache miss")]
    CacheMiss,

    /// An error from the backing byte store other than a miss.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Marshal/unmarshal failure, treated as fatal for the operation.
    #[error("codec error: {0}")]
    Codec(#[from] postcard::Error),

    /// `iterate_set` / `end_set` / `abort_set` called with an unknown call id.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// `end_set` caught a panic while finalizing; cleanup still ran.
    #[error("panic recovered during end_set: {0}")]
    PanicRecovered(String),

    /// Cooperative cancellation fired during `get`.
    #[error("operation cancelled")]
    Cancelled,

    /// A page flush failed and was latched on the `SetRequest`; surfaced to
    /// the caller of `iterate_set`/`end_set` that triggered or re-observed
    /// it.
    #[error("flush failed: {0}")]
    Flush(String),

    /// The population this caller subscribed to was aborted by its
    /// producer.
    #[error("producer aborted: {0}")]
    Aborted(String),
}

impl Error {
    /// True if this error is the structural cache-miss sentinel.
    #[must_use]
    pub fn is_cache_miss(&self) -> bool {
        matches!(self, Error::CacheMiss)
    }
}

/// Errors surfaced by a `ByteStore` implementation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// The requested key is not present (or has expired). Distinct from
    /// every other store failure so callers never conflate "not found" with
    /// "something went wrong".
    #[error("key not found: {0}")]
    Miss(String),

    /// Backing store capacity exceeded and the write could not be admitted.
    #[error("store capacity exceeded writing {kind} key '{key}': {reason}")]
    CapacityExceeded {
        /// The key being written.
        key: String,
        /// Which kind of key this was, for log/error context.
        kind: StoreKind,
        /// Human-readable reason the store gave for rejecting the write.
        reason: String,
    },

    /// Any other I/O-shaped failure from the backing store.
    #[error("store I/O error for {kind} key '{key}': {message}")]
    Io {
        /// The key involved in the failing operation.
        key: String,
        /// Which kind of key this was, for log/error context.
        kind: StoreKind,
        /// The underlying error message.
        message: String,
    },
}

impl StoreError {
    /// True if this is the distinguished "miss" variant.
    #[must_use]
    pub fn is_miss(&self) -> bool {
        matches!(self, StoreError::Miss(_))
    }
}

impl fmt::Display for StoreKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreKind::IndexBucket => write!(f, "index-bucket"),
            StoreKind::Page => write!(f, "page"),
        }
    }
}

/// What kind of store key an operation was touching, for log context only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreKind {
    /// An `index__{conn}_{table}` bucket key.
    IndexBucket,
    /// A `{root}-p{i}` page key.
    Page,
}

impl StoreKind {
    /// Classify a store key by its shape: index buckets carry the
    /// `index__` prefix `KeyBuilder::index_key` produces; everything else
    /// is a page.
    #[must_use]
    pub fn classify(key: &str) -> Self {
        if key.starts_with("index__") {
            StoreKind::IndexBucket
        } else {
            StoreKind::Page
        }
    }
}
