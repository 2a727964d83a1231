use std::time::{Duration, Instant};

use async_trait::async_trait;

use super::store::{CacheStore, CacheValue, StoreError};
use super::CacheKey;

/// An item saved in the in-memory moka cache.
#[derive(Clone, Debug)]
struct StoredValue {
    /// When to evict this item.
    deadline: Instant,
    /// The actual cache line.
    value: CacheValue,
}

/// A struct implementing [`moka::Expiry`] that uses the [`StoredValue`]
/// [`Instant`] as the explicit expiration time.
struct ValueExpiration;

/// Returns the duration between the `current_time` and `target_time` in the future.
/// In case the `target_time` is already elapsed (it is in the past relative to `current_time`), this
/// will return `Some(ZERO)`.
fn saturating_duration_since(current_time: Instant, target_time: Instant) -> Option<Duration> {
    Some(
        target_time
            .checked_duration_since(current_time)
            .unwrap_or_default(),
    )
}

impl moka::Expiry<CacheKey, StoredValue> for ValueExpiration {
    fn expire_after_create(
        &self,
        _key: &CacheKey,
        value: &StoredValue,
        current_time: Instant,
    ) -> Option<Duration> {
        saturating_duration_since(current_time, value.deadline)
    }

    fn expire_after_update(
        &self,
        _key: &CacheKey,
        value: &StoredValue,
        current_time: Instant,
        _current_duration: Option<Duration>,
    ) -> Option<Duration> {
        saturating_duration_since(current_time, value.deadline)
    }
}

/// An in-memory [`CacheStore`] backend.
///
/// Suitable for single-process deployments and tests. Per-entry time-to-live
/// is enforced through a [`moka::Expiry`] policy keyed on an absolute
/// deadline, so `Pending` markers and completed results can carry different
/// lifetimes under the same key.
#[derive(Debug)]
pub struct InMemoryStore {
    entries: moka::future::Cache<CacheKey, StoredValue>,
}

impl InMemoryStore {
    /// Creates a store with the given entry capacity.
    pub fn new(capacity: u64) -> Self {
        let entries = moka::future::Cache::builder()
            .max_capacity(capacity)
            .expire_after(ValueExpiration)
            .build();
        Self { entries }
    }
}

#[async_trait]
impl CacheStore for InMemoryStore {
    async fn get(&self, key: &CacheKey) -> Result<Option<CacheValue>, StoreError> {
        let entry = self.entries.get(key).await;
        // moka enforces the expiry policy on access, but the deadline check
        // keeps reads exact between its maintenance runs.
        Ok(entry
            .filter(|stored| stored.deadline > Instant::now())
            .map(|stored| stored.value))
    }

    async fn set(
        &self,
        key: &CacheKey,
        value: CacheValue,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        let stored = StoredValue {
            deadline: Instant::now() + ttl,
            value,
        };
        self.entries.insert(key.clone(), stored).await;
        Ok(())
    }
}
