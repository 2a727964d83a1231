//! Handler function types and the query error taxonomy.

use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::Value;
use thiserror::Error;

use crate::caching::QueryArgs;

/// An error surfaced by query execution or cache retrieval.
///
/// The two variants are deliberately distinguishable so that HTTP-facing
/// callers can map [`NotFound`](Self::NotFound) to a "try again later"
/// response and [`Computation`](Self::Computation) to a "computation failed"
/// response.
#[derive(Debug, Error)]
pub enum QueryError {
    /// Force-retrieve found no usable cached result within the wait window.
    ///
    /// Carries the derived cache key for diagnostics. Recoverable: callers
    /// may fall back to a default-mode call or treat it as "not ready yet".
    #[error("no cached result for key {key}")]
    NotFound {
        /// The derived cache key that had no completed entry.
        key: String,
    },

    /// The wrapped computation itself failed.
    ///
    /// Propagated verbatim to the immediate caller and never persisted to
    /// the cache.
    #[error(transparent)]
    Computation(#[from] anyhow::Error),
}

/// The result of a view or query handler invocation.
///
/// Queries return machine-readable JSON; views return an HTML string wrapped
/// in [`Value::String`].
pub type QueryResult = Result<Value, QueryError>;

/// The future returned by a handler invocation.
pub type QueryFuture = BoxFuture<'static, QueryResult>;

/// A registered handler callable: an async function over [`QueryArgs`].
pub type QueryFn = Arc<dyn Fn(QueryArgs) -> QueryFuture + Send + Sync>;

/// Boxes an async closure into a [`QueryFn`].
pub fn query_fn<F, Fut>(f: F) -> QueryFn
where
    F: Fn(QueryArgs) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = QueryResult> + Send + 'static,
{
    Arc::new(move |args| Box::pin(f(args)))
}
