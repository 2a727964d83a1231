use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::Notify;

use crate::query::{QueryError, QueryFn, query_fn};

use super::*;

/// A `slow_sum(a, b, ..)` stand-in that counts its executions.
fn slow_sum(calls: Arc<AtomicUsize>) -> QueryFn {
    query_fn(move |args: QueryArgs| {
        let calls = calls.clone();
        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            let sum: i64 = args
                .positional
                .iter()
                .filter_map(|a| a.value().as_i64())
                .sum();
            Ok(json!(sum))
        }
    })
}

fn fast_config() -> MemoizeConfig {
    MemoizeConfig {
        poll_interval: Duration::from_millis(10),
        ..Default::default()
    }
}

fn memoized_sum(
    calls: &Arc<AtomicUsize>,
    config: MemoizeConfig,
    store: &Arc<InMemoryStore>,
) -> MemoizedQuery {
    MemoizedQuery::new(
        QueryIdentity::new("tests", "slow_sum"),
        slow_sum(calls.clone()),
        config,
        store.clone() as CacheStoreRef,
    )
}

fn args(a: i64, b: i64) -> QueryArgs {
    QueryArgs::new().with_arg(a).with_arg(b)
}

#[tokio::test]
async fn test_cache_hit_executes_at_most_once() {
    let calls = Arc::new(AtomicUsize::new(0));
    let store = Arc::new(InMemoryStore::new(1_000));
    let query = memoized_sum(&calls, fast_config(), &store);

    assert_eq!(query.call(args(2, 3)).await.unwrap(), json!(5));
    assert_eq!(query.call(args(2, 3)).await.unwrap(), json!(5));
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // A different argument set is a different cache line.
    assert_eq!(query.call(args(2, 4)).await.unwrap(), json!(6));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_force_recompute_always_executes() {
    let calls = Arc::new(AtomicUsize::new(0));
    let store = Arc::new(InMemoryStore::new(1_000));
    let query = memoized_sum(&calls, fast_config(), &store);

    query.call(args(2, 3)).await.unwrap();
    for _ in 0..3 {
        assert_eq!(query.force_recompute(args(2, 3)).await.unwrap(), json!(5));
    }
    assert_eq!(calls.load(Ordering::SeqCst), 4);

    // The recomputed result is published: default mode hits again.
    query.call(args(2, 3)).await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn test_force_retrieve_never_executes() {
    let calls = Arc::new(AtomicUsize::new(0));
    let store = Arc::new(InMemoryStore::new(1_000));
    let query = memoized_sum(&calls, fast_config(), &store);

    let err = query.force_retrieve(args(9, 9)).await.unwrap_err();
    match err {
        QueryError::NotFound { key } => {
            assert_eq!(key, query.cache_key(&args(9, 9)).to_string())
        }
        other => panic!("expected NotFound, got {other:?}"),
    }
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    // Once a result exists, force-retrieve serves it without executing.
    query.call(args(9, 9)).await.unwrap();
    assert_eq!(query.force_retrieve(args(9, 9)).await.unwrap(), json!(18));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_waits_for_inflight_computation() {
    let calls = Arc::new(AtomicUsize::new(0));
    let store = Arc::new(InMemoryStore::new(1_000));
    let query = memoized_sum(&calls, fast_config(), &store);

    // Another process has claimed the line and completes it shortly.
    let key = query.cache_key(&args(2, 3));
    store
        .set(&key, CacheValue::Pending, Duration::from_secs(10))
        .await
        .unwrap();
    let publisher = {
        let store = store.clone();
        let key = key.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            store
                .set(&key, CacheValue::Done(json!(5)), Duration::from_secs(60))
                .await
                .unwrap();
        })
    };

    assert_eq!(query.call(args(2, 3)).await.unwrap(), json!(5));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    publisher.await.unwrap();
}

#[tokio::test]
async fn test_pending_wait_times_out_and_reclaims() {
    let calls = Arc::new(AtomicUsize::new(0));
    let store = Arc::new(InMemoryStore::new(1_000));
    let config = MemoizeConfig {
        pending_timeout: Duration::from_millis(100),
        poll_interval: Duration::from_millis(10),
        ..Default::default()
    };
    let query = memoized_sum(&calls, config, &store);

    // A marker without a computer behind it, e.g. after a crash.
    let key = query.cache_key(&args(2, 3));
    store
        .set(&key, CacheValue::Pending, Duration::from_secs(10))
        .await
        .unwrap();

    // Force-retrieve gives up with NotFound and has no side effects.
    assert!(matches!(
        query.force_retrieve(args(2, 3)).await,
        Err(QueryError::NotFound { .. })
    ));
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    // Default mode gives up waiting and reclaims the line.
    assert_eq!(query.call(args(2, 3)).await.unwrap(), json!(5));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_completed_results_expire() {
    let calls = Arc::new(AtomicUsize::new(0));
    let store = Arc::new(InMemoryStore::new(1_000));
    let config = MemoizeConfig {
        result_ttl: Duration::from_millis(50),
        poll_interval: Duration::from_millis(10),
        ..Default::default()
    };
    let query = memoized_sum(&calls, config, &store);

    query.call(args(2, 3)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(120)).await;
    query.call(args(2, 3)).await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_computation_error_propagates_and_leaves_marker() {
    let store = Arc::new(InMemoryStore::new(1_000));
    let func = query_fn(|_args| async { Err(anyhow::anyhow!("datastore went away").into()) });
    let query = MemoizedQuery::new(
        QueryIdentity::new("tests", "boom"),
        func,
        fast_config(),
        store.clone() as CacheStoreRef,
    );

    let err = query.call(QueryArgs::new()).await.unwrap_err();
    assert!(matches!(err, QueryError::Computation(_)));

    // No rollback: the pending marker stays until its timeout self-heals it.
    let key = query.cache_key(&QueryArgs::new());
    assert_eq!(store.get(&key).await.unwrap(), Some(CacheValue::Pending));
}

/// A store whose backend is unreachable.
#[derive(Debug)]
struct DownStore;

#[async_trait]
impl CacheStore for DownStore {
    async fn get(&self, _key: &CacheKey) -> Result<Option<CacheValue>, StoreError> {
        Err(std::io::Error::other("connection refused").into())
    }

    async fn set(
        &self,
        _key: &CacheKey,
        _value: CacheValue,
        _ttl: Duration,
    ) -> Result<(), StoreError> {
        Err(std::io::Error::other("connection refused").into())
    }
}

#[tokio::test]
async fn test_store_outage_degrades_to_recompute() {
    let calls = Arc::new(AtomicUsize::new(0));
    let store = Arc::new(DownStore);
    let query = MemoizedQuery::new(
        QueryIdentity::new("tests", "slow_sum"),
        slow_sum(calls.clone()),
        fast_config(),
        store as CacheStoreRef,
    );

    assert_eq!(query.call(args(2, 3)).await.unwrap(), json!(5));
    assert_eq!(query.call(args(2, 3)).await.unwrap(), json!(5));
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    // Force-retrieve stays truthful: no usable cached result exists.
    assert!(matches!(
        query.force_retrieve(args(2, 3)).await,
        Err(QueryError::NotFound { .. })
    ));
}

#[tokio::test]
async fn test_concurrent_callers_share_one_computation() {
    let calls = Arc::new(AtomicUsize::new(0));
    let store = Arc::new(InMemoryStore::new(1_000));
    let gate = Arc::new(Notify::new());

    let func = {
        let calls = calls.clone();
        let gate = gate.clone();
        query_fn(move |_args| {
            let calls = calls.clone();
            let gate = gate.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                gate.notified().await;
                Ok(json!(5))
            }
        })
    };
    let query = Arc::new(MemoizedQuery::new(
        QueryIdentity::new("tests", "slow_sum"),
        func,
        fast_config(),
        store.clone() as CacheStoreRef,
    ));
    let key = query.cache_key(&args(2, 3));

    let first = {
        let query = query.clone();
        tokio::spawn(async move { query.call(args(2, 3)).await.unwrap() })
    };

    // Wait until the first caller has claimed the line.
    while store.get(&key).await.unwrap() != Some(CacheValue::Pending) {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let second = {
        let query = query.clone();
        tokio::spawn(async move { query.call(args(2, 3)).await.unwrap() })
    };

    // Let the second caller observe the marker, then release the computation.
    tokio::time::sleep(Duration::from_millis(50)).await;
    gate.notify_one();

    assert_eq!(first.await.unwrap(), json!(5));
    assert_eq!(second.await.unwrap(), json!(5));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}
