use std::fmt;
use std::time::Duration;

use serde_json::Value;
use tokio::time::Instant;

use crate::query::{QueryError, QueryFn, QueryResult};

use super::cache_key::{CacheKey, IgnoreSet, QueryArgs, QueryIdentity};
use super::store::{CacheStoreRef, CacheValue};

/// Constructor-time configuration for one memoized query.
#[derive(Debug, Clone)]
pub struct MemoizeConfig {
    /// Time-to-live of a completed result.
    pub result_ttl: Duration,

    /// How long a `Pending` marker may block other callers.
    ///
    /// This bounds both the marker's own lifetime in the store and the wait
    /// window of callers observing it, so a crashed computer self-heals.
    pub pending_timeout: Duration,

    /// How often waiting callers re-read a pending cache line.
    pub poll_interval: Duration,

    /// Argument types excluded from key derivation.
    pub ignores: IgnoreSet,

    /// Use this as the cache key instead of deriving one from the
    /// invocation arguments.
    pub key_override: Option<String>,
}

impl Default for MemoizeConfig {
    fn default() -> Self {
        Self {
            result_ttl: Duration::from_secs(60 * 4),
            pending_timeout: Duration::from_secs(60 * 15),
            poll_interval: Duration::from_millis(100),
            ignores: IgnoreSet::default(),
            key_override: None,
        }
    }
}

/// A query wrapped with shared-store memoization.
///
/// Wraps a pure, deterministic async function and exposes three operating
/// modes:
///
/// - [`call`](Self::call): return a cached result, wait for an in-flight
///   computation, or compute and publish.
/// - [`force_recompute`](Self::force_recompute): always execute and publish,
///   regardless of cache state.
/// - [`force_retrieve`](Self::force_retrieve): only read from the cache,
///   failing with [`QueryError::NotFound`] instead of computing.
///
/// Concurrent callers of the same invocation converge on one computation
/// through a `Pending` marker in the store; see the
/// [module docs](crate::caching) for the exact consistency guarantees.
pub struct MemoizedQuery {
    identity: QueryIdentity,
    func: QueryFn,
    config: MemoizeConfig,
    store: CacheStoreRef,
}

impl fmt::Debug for MemoizedQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoizedQuery")
            .field("identity", &self.identity)
            .field("config", &self.config)
            .field("store", &self.store)
            .finish_non_exhaustive()
    }
}

impl MemoizedQuery {
    /// Wraps `func` with memoization.
    pub fn new(
        identity: QueryIdentity,
        func: QueryFn,
        config: MemoizeConfig,
        store: CacheStoreRef,
    ) -> Self {
        Self {
            identity,
            func,
            config,
            store,
        }
    }

    /// The identity of the wrapped query.
    pub fn identity(&self) -> &QueryIdentity {
        &self.identity
    }

    /// Derives the cache key for an invocation of the wrapped query.
    pub fn cache_key(&self, args: &QueryArgs) -> CacheKey {
        CacheKey::for_invocation(
            &self.identity,
            args,
            &self.config.ignores,
            self.config.key_override.as_deref(),
        )
    }

    /// Default mode: cache-or-compute.
    pub async fn call(&self, args: QueryArgs) -> QueryResult {
        let name = self.identity.name.as_str();
        metric!(counter("memoize.access") += 1, "query" => name);

        let key = self.cache_key(&args);
        if let Some(value) = self.wait_for_result(&key).await {
            metric!(counter("memoize.hit") += 1, "query" => name);
            tracing::trace!(query = %self.identity, key = %key, "Cache hit");
            return Ok(value);
        }

        tracing::trace!(query = %self.identity, key = %key, "Cache miss");
        self.compute_and_cache(&key, args).await
    }

    /// Force-recompute mode: always execute and publish, regardless of any
    /// existing cache entry.
    ///
    /// The `Pending` marker is still published first so that default-mode
    /// callers arriving during the recomputation wait for it.
    pub async fn force_recompute(&self, args: QueryArgs) -> QueryResult {
        let key = self.cache_key(&args);
        tracing::debug!(query = %self.identity, key = %key, "Forcing recomputation");
        self.compute_and_cache(&key, args).await
    }

    /// Force-retrieve mode: read from the cache, never execute.
    ///
    /// Waits out an in-flight computation like default mode does, but when
    /// no complete result is reachable within the window this fails with
    /// [`QueryError::NotFound`] carrying the derived key. Has no side
    /// effects on the cache.
    pub async fn force_retrieve(&self, args: QueryArgs) -> QueryResult {
        let key = self.cache_key(&args);
        match self.wait_for_result(&key).await {
            Some(value) => Ok(value),
            None => Err(QueryError::NotFound {
                key: key.to_string(),
            }),
        }
    }

    /// Polls the store until the line is complete, absent, or the pending
    /// wait window has elapsed.
    ///
    /// Returns `None` for both "absent" and "gave up waiting": in either
    /// case no usable result exists and the caller may claim the
    /// computation. Store read failures degrade to `None` as well, so an
    /// unreachable store turns into "always recompute" rather than an error.
    async fn wait_for_result(&self, key: &CacheKey) -> Option<Value> {
        let deadline = Instant::now() + self.config.pending_timeout;
        loop {
            match self.store.get(key).await {
                Ok(Some(CacheValue::Done(value))) => return Some(value),
                Ok(Some(CacheValue::Pending)) => {
                    if Instant::now() >= deadline {
                        // The computer has most likely crashed; let the
                        // caller reclaim the line.
                        tracing::debug!(key = %key, "Gave up waiting on pending computation");
                        return None;
                    }
                    tokio::time::sleep(self.config.poll_interval).await;
                }
                Ok(None) => return None,
                Err(err) => {
                    tracing::warn!(
                        error = &err as &dyn std::error::Error,
                        key = %key,
                        "Cache store read failed",
                    );
                    return None;
                }
            }
        }
    }

    /// Claims the line, runs the wrapped function, and publishes the result.
    ///
    /// Claiming is a separate read-then-write, so two callers racing here
    /// may both compute once each; the last write wins.
    async fn compute_and_cache(&self, key: &CacheKey, args: QueryArgs) -> QueryResult {
        self.publish(key, CacheValue::Pending, self.config.pending_timeout)
            .await;

        metric!(counter("memoize.computation") += 1, "query" => self.identity.name.as_str());
        // A failure propagates verbatim and leaves the pending marker to
        // expire on its own.
        let result = (self.func)(args).await?;

        self.publish(
            key,
            CacheValue::Done(result.clone()),
            self.config.result_ttl,
        )
        .await;
        Ok(result)
    }

    async fn publish(&self, key: &CacheKey, value: CacheValue, ttl: Duration) {
        if let Err(err) = self.store.set(key, value, ttl).await {
            tracing::warn!(
                error = &err as &dyn std::error::Error,
                key = %key,
                "Cache store write failed",
            );
        }
    }
}
