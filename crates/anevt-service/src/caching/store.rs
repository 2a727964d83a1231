use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use super::CacheKey;

/// A single cache line, as visible to the memoization engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", content = "value", rename_all = "snake_case")]
pub enum CacheValue {
    /// Some caller has claimed the computation; others should wait.
    Pending,
    /// The completed result.
    Done(Value),
}

/// An error talking to the cache store backend.
///
/// These are transport-layer errors: the engine treats them as best-effort
/// failures (a failed read is a miss, a failed write is logged and dropped)
/// rather than surfacing them to query callers.
#[derive(Debug, Error)]
pub enum StoreError {
    /// An io error from a file-backed store.
    #[error("cache store io: {0}")]
    Io(#[from] std::io::Error),
    /// A stored entry could not be encoded.
    #[error("cache store encoding: {0}")]
    Encoding(#[from] serde_json::Error),
}

/// A shared key-value store with per-entry expiry.
///
/// Any number of processes may read and write concurrently. The store
/// guarantees atomicity per single `get`/`set` operation only; there is no
/// compare-and-set, and no transaction spanning the read-then-write pair the
/// engine uses to claim a computation.
///
/// An entry whose time-to-live has elapsed is indistinguishable from one
/// that never existed.
#[async_trait]
pub trait CacheStore: Send + Sync + std::fmt::Debug {
    /// Reads the current value for `key`, or `None` if absent or expired.
    async fn get(&self, key: &CacheKey) -> Result<Option<CacheValue>, StoreError>;

    /// Writes `value` under `key`, replacing any previous value, with the
    /// given time-to-live.
    async fn set(&self, key: &CacheKey, value: CacheValue, ttl: Duration)
    -> Result<(), StoreError>;
}

/// A shared reference to a cache store backend.
pub type CacheStoreRef = Arc<dyn CacheStore>;
