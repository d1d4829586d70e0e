//! End-to-end scenarios straight out of the design's testable-properties
//! list: cold miss then hit, subset/superset matching, coalesced
//! subscribers, abort, and limit narrowing.

use query_cache_core::cache::{CacheOptions, QueryCache};
use query_cache_core::error::Error;
use query_cache_core::request::{CacheRequest, PluginSchemaMap, Qual, Value};
use query_cache_core::store::ShardedMemoryStore;
use std::sync::Mutex;

fn cache() -> QueryCache<ShardedMemoryStore> {
    QueryCache::with_memory_store("aws", PluginSchemaMap::new(), CacheOptions::default()).unwrap()
}

fn base_request(call_id: &str) -> CacheRequest {
    let mut req = CacheRequest::new(
        "aws",
        "ec2",
        vec!["id".to_string(), "name".to_string()],
        call_id,
    );
    req.quals.insert(
        "region".to_string(),
        vec![Qual {
            field_name: "region".to_string(),
            operator: "=".to_string(),
            value: Value::Text("us-east-1".into()),
        }],
    );
    req.ttl_seconds = 3600;
    req
}

async fn populate(cache: &QueryCache<ShardedMemoryStore>, req: CacheRequest, row_count: i64) {
    let miss = cache.get(req.clone(), |_| {}).await;
    assert!(matches!(miss, Err(Error::CacheMiss)));
    cache.start_set(req.clone()).await.unwrap();
    for i in 0..row_count {
        cache
            .iterate_set(&req.call_id, vec![Value::Int(i)])
            .await
            .unwrap();
    }
    cache.end_set(&req.call_id).await.unwrap();
}

/// S1 — cold miss then hit: 2500 rows span three pages (1000, 1000, 500);
/// a second, identical request streams them back in order.
#[tokio::test]
async fn s1_cold_miss_then_hit() {
    let cache = cache();
    let req = base_request("s1-producer");
    populate(&cache, req.clone(), 2500).await;
    assert_eq!(cache.stats().misses(), 1);

    let rows = Mutex::new(Vec::new());
    cache
        .get(base_request("s1-reader"), |row| rows.lock().unwrap().push(row))
        .await
        .unwrap();

    assert_eq!(cache.stats().hits(), 1);
    assert_eq!(cache.stats().misses(), 1);
    let rows = rows.into_inner().unwrap();
    assert_eq!(rows.len(), 2500);
    for (i, row) in rows.iter().enumerate() {
        assert_eq!(row, &vec![Value::Int(i as i64)]);
    }
}

/// S2 — a narrower column projection against a wider cached result still
/// hits and streams every row (the caller, not the cache, projects).
#[tokio::test]
async fn s2_subset_columns_reuse_wider_result() {
    let cache = cache();
    populate(&cache, base_request("s2-producer"), 2500).await;

    let mut narrower = base_request("s2-reader");
    narrower.columns = vec!["id".to_string()];
    narrower.limit = 50;

    let rows = Mutex::new(Vec::new());
    cache
        .get(narrower, |row| rows.lock().unwrap().push(row))
        .await
        .unwrap();

    assert_eq!(rows.into_inner().unwrap().len(), 2500);
    assert_eq!(cache.stats().misses(), 1);
}

/// S3 — a superset column request does not match a narrower cached result.
#[tokio::test]
async fn s3_superset_columns_do_not_hit() {
    let cache = cache();
    populate(&cache, base_request("s3-producer"), 10).await;

    let mut wider = base_request("s3-reader");
    wider.columns = vec!["id".to_string(), "name".to_string(), "tags".to_string()];

    let miss = cache.get(wider, |_| {}).await;
    assert!(matches!(miss, Err(Error::CacheMiss)));
}

/// S4 — a second caller for an equivalent request, arriving mid-population,
/// coalesces onto the in-flight `SetRequest` and receives every row the
/// producer emits, in order, with none duplicated or dropped.
#[tokio::test]
async fn s4_coalesced_subscriber_receives_all_rows_in_order() {
    let cache = cache();
    let producer_req = base_request("s4-producer");

    let miss = cache.get(producer_req.clone(), |_| {}).await;
    assert!(matches!(miss, Err(Error::CacheMiss)));
    cache.start_set(producer_req.clone()).await.unwrap();

    // Page 0: 1000 rows, auto-flushed. Then 500 more buffered (1500 total).
    for i in 0..1500i64 {
        cache
            .iterate_set("s4-producer", vec![Value::Int(i)])
            .await
            .unwrap();
    }

    let subscriber_rows = Mutex::new(Vec::new());
    let cache_ref = &cache;
    let subscriber = async {
        cache_ref
            .get(base_request("s4-subscriber"), |row| {
                subscriber_rows.lock().unwrap().push(row)
            })
            .await
    };
    let producer = async {
        for i in 1500..2500i64 {
            cache_ref
                .iterate_set("s4-producer", vec![Value::Int(i)])
                .await
                .unwrap();
        }
        cache_ref.end_set("s4-producer").await.unwrap();
    };
    let (subscribe_result, ()) = tokio::join!(subscriber, producer);
    subscribe_result.unwrap();

    let rows = subscriber_rows.into_inner().unwrap();
    assert_eq!(rows.len(), 2500);
    for (i, row) in rows.iter().enumerate() {
        assert_eq!(row, &vec![Value::Int(i as i64)]);
    }
}

/// S5 — an abort mid-population signals every subscriber with the error
/// after replaying what had already been made durable or buffered; a
/// subsequent `get` is a cold miss again and the flushed page is gone.
#[tokio::test]
async fn s5_abort_signals_error_and_clears_state() {
    let cache = cache();
    let producer_req = base_request("s5-producer");

    let miss = cache.get(producer_req.clone(), |_| {}).await;
    assert!(matches!(miss, Err(Error::CacheMiss)));
    cache.start_set(producer_req.clone()).await.unwrap();
    for i in 0..1500i64 {
        cache
            .iterate_set("s5-producer", vec![Value::Int(i)])
            .await
            .unwrap();
    }

    let subscriber_rows = Mutex::new(Vec::new());
    let cache_ref = &cache;
    let subscriber = async {
        cache_ref
            .get(base_request("s5-subscriber"), |row| {
                subscriber_rows.lock().unwrap().push(row)
            })
            .await
    };
    let aborter = async {
        cache_ref
            .abort_set("s5-producer", "upstream connection reset")
            .await
            .unwrap();
    };
    let (subscribe_result, ()) = tokio::join!(subscriber, aborter);

    assert!(matches!(subscribe_result, Err(Error::Aborted(msg)) if msg == "upstream connection reset"));
    // Everything already flushed or buffered at the moment of subscribing
    // was replayed before the error (spec explicitly permits dropping the
    // unflushed tail; this implementation chooses to deliver it).
    assert_eq!(subscriber_rows.into_inner().unwrap().len(), 1500);

    let miss_again = cache.get(base_request("s5-reader"), |_| {}).await;
    assert!(matches!(miss_again, Err(Error::CacheMiss)));
}

/// S6 — limit narrowing: an unlimited cached item satisfies any limited
/// request; a limited cached item does not satisfy a request asking for
/// more rows than it was populated with.
#[tokio::test]
async fn s6_limit_narrowing() {
    let cache = cache();
    let mut unlimited = base_request("s6-unlimited");
    unlimited.limit = -1;
    populate(&cache, unlimited, 10).await;

    let mut limited_100 = base_request("s6-reader-a");
    limited_100.limit = 100;
    cache.get(limited_100, |_| {}).await.unwrap();

    // A distinct table so this doesn't collide with the unlimited item
    // cached above (which would otherwise satisfy any limit).
    let mut producer_50 = base_request("s6-producer-50");
    producer_50.table = "ec2_limited".to_string();
    producer_50.limit = 50;
    let miss = cache.get(producer_50.clone(), |_| {}).await;
    assert!(matches!(miss, Err(Error::CacheMiss)));
    cache.start_set(producer_50.clone()).await.unwrap();
    for i in 0..10i64 {
        cache
            .iterate_set("s6-producer-50", vec![Value::Int(i)])
            .await
            .unwrap();
    }
    cache.end_set("s6-producer-50").await.unwrap();

    let mut limited_100_again = base_request("s6-reader-b");
    limited_100_again.table = "ec2_limited".to_string();
    limited_100_again.limit = 100;
    let miss = cache.get(limited_100_again, |_| {}).await;
    assert!(matches!(miss, Err(Error::CacheMiss)));
}
