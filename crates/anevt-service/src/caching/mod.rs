//! # Memoization infrastructure for SOA queries
//!
//! Queries registered with anevt are expensive, side-effect-free and
//! deterministic, so their results are cached in a store shared by every
//! process serving the same deployment. This module contains the cache key
//! derivation, the store abstraction with its backends, and the memoization
//! engine with its three operating modes.
//!
//! ## Cache lines
//!
//! A cache line for an invocation key is in one of three states:
//!
//! - *absent*: never computed, or expired.
//! - *pending*: some caller has claimed the computation and published the
//!   [`CacheValue::Pending`] sentinel; other default-mode callers poll until
//!   the line completes or the pending timeout elapses.
//! - *done*: holds the completed result until its time-to-live expires.
//!
//! Two independent expiry policies apply: a short timeout bounding how long
//! a pending marker may block other callers (protects against a crashed
//! computer), and a longer time-to-live for the completed result.
//!
//! ## Single flight
//!
//! Coordination between concurrent callers happens exclusively through the
//! store, which guarantees per-operation atomicity only. Claiming a key is
//! a separate read-then-write, so two callers racing within that window may
//! both compute; the last write wins. This weak consistency is accepted:
//! results of a pure query are identical, only the computation cost is
//! occasionally duplicated.
//!
//! ## Metrics
//!
//! Each metric is tagged with a `query` field carrying the wrapped
//! function's name:
//!
//! - `memoize.access`: all default-mode calls.
//! - `memoize.hit`: calls served from the store.
//! - `memoize.computation`: actual executions of the wrapped function.
//!
//! ## Error policy
//!
//! The store is treated as best-effort: a failed read degrades to a cache
//! miss and a failed write is logged and dropped, so a store outage turns
//! the engine into "always recompute" rather than an error source. Failures
//! of the wrapped function itself propagate verbatim and leave the pending
//! marker to expire on its own.

mod cache_key;
mod fs;
mod memoize;
mod memory;
mod store;

#[cfg(test)]
mod tests;

pub use cache_key::{
    CacheKey, CacheKeyBuilder, DATASTORE_HANDLE, FILESYSTEM_HANDLE, IgnoreSet, QueryArg,
    QueryArgs, QueryIdentity,
};
pub use fs::FilesystemStore;
pub use memoize::{MemoizeConfig, MemoizedQuery};
pub use memory::InMemoryStore;
pub use store::{CacheStore, CacheStoreRef, CacheValue, StoreError};
