//! The explicit handler registry.
//!
//! Analytics modules register their views, queries, event handlers and event
//! properties here at startup. Nothing is discovered implicitly: the HTTP
//! surface and the cron scheduler only ever see what was registered.
//!
//! Views and queries are addressed by `(category, name)`, where the category
//! defaults to the registering module. Event handlers are an ordered list
//! that [`dispatch`](Registry::dispatch) fans incoming batches out to.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, RwLock};

use futures::future::BoxFuture;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::caching::{CacheStoreRef, MemoizeConfig, MemoizedQuery, QueryArgs, QueryIdentity};
use crate::events::Event;
use crate::query::{QueryFn, QueryResult};

/// Whether a handler renders HTML or returns JSON.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HandlerKind {
    View,
    Query,
}

impl AsRef<str> for HandlerKind {
    fn as_ref(&self) -> &str {
        match self {
            HandlerKind::View => "view",
            HandlerKind::Query => "query",
        }
    }
}

impl fmt::Display for HandlerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_ref())
    }
}

/// Descriptive metadata supplied at registration time.
#[derive(Debug, Clone, Default)]
pub struct Registration {
    /// Routing category. Defaults to the registering module's name.
    pub category: Option<String>,
    /// Human-readable description, surfaced by the schema listing.
    pub description: Option<String>,
    /// Names of the arguments the handler understands.
    pub args: Vec<String>,
}

impl Registration {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn arg(mut self, name: impl Into<String>) -> Self {
        self.args.push(name.into());
        self
    }
}

/// The schema entry of one registered view or query.
#[derive(Debug, Clone, Serialize)]
pub struct HandlerInfo {
    pub kind: HandlerKind,
    pub category: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub args: Vec<String>,
}

/// A registered view or query, ready to invoke.
///
/// Memoized handlers route through their [`MemoizedQuery`]; plain handlers
/// execute directly in every mode, so forcing recomputation or retrieval on
/// an unmemoized handler degrades to an ordinary call.
#[derive(Clone)]
pub struct Handler {
    info: Arc<HandlerInfo>,
    func: QueryFn,
    memoized: Option<Arc<MemoizedQuery>>,
}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handler")
            .field("info", &self.info)
            .field("memoized", &self.memoized.is_some())
            .finish_non_exhaustive()
    }
}

impl Handler {
    pub fn info(&self) -> &HandlerInfo {
        &self.info
    }

    /// Invokes the handler in default mode.
    pub async fn call(&self, args: QueryArgs) -> QueryResult {
        match &self.memoized {
            Some(memoized) => memoized.call(args).await,
            None => (self.func)(args).await,
        }
    }

    /// Invokes the handler, bypassing any cached result.
    pub async fn force_recompute(&self, args: QueryArgs) -> QueryResult {
        match &self.memoized {
            Some(memoized) => memoized.force_recompute(args).await,
            None => (self.func)(args).await,
        }
    }

    /// Serves the handler from cache only.
    pub async fn force_retrieve(&self, args: QueryArgs) -> QueryResult {
        match &self.memoized {
            Some(memoized) => memoized.force_retrieve(args).await,
            None => (self.func)(args).await,
        }
    }
}

/// The future returned by an event handler.
pub type EventFuture = BoxFuture<'static, anyhow::Result<()>>;

/// An event handler callable: an async function over a batch of events.
pub type EventFn = Arc<dyn Fn(Vec<Event>) -> EventFuture + Send + Sync>;

/// Boxes an async closure into an [`EventFn`].
pub fn event_fn<F, Fut>(f: F) -> EventFn
where
    F: Fn(Vec<Event>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(move |events| Box::pin(f(events)))
}

/// A derived, read-only property of an event.
pub type EventPropertyFn = Arc<dyn Fn(&Event) -> Value + Send + Sync>;

/// Delivery options of an event handler.
///
/// Only batched, in-process delivery is implemented. The remaining knobs are
/// carried so registrations state their requirements explicitly and are
/// rejected up front instead of silently misbehaving.
#[derive(Debug, Clone)]
pub struct EventHandlerOptions {
    /// Deliver events in batches. Unbatched delivery is not supported.
    pub batch: bool,
    /// The handler only cares about per-user events.
    pub per_user: bool,
    /// The handler only cares about per-resource events.
    pub per_resource: bool,
    /// Require a dedicated delivery process. Not supported.
    pub single_process: bool,
    /// Consume from a named external queue. Not supported.
    pub source_queue: Option<String>,
}

impl Default for EventHandlerOptions {
    fn default() -> Self {
        Self {
            batch: true,
            per_user: false,
            per_resource: false,
            single_process: false,
            source_queue: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("{kind} {category}/{name} is already registered")]
    Duplicate {
        kind: HandlerKind,
        category: String,
        name: String,
    },

    #[error("event property {name} is already registered")]
    DuplicateProperty { name: String },

    #[error("event handler {name} requires unsupported delivery option {option}")]
    Unsupported { name: String, option: &'static str },
}

struct EventHandler {
    name: String,
    func: EventFn,
}

/// All registered handlers of one running service.
#[derive(Default)]
pub struct Registry {
    handlers: RwLock<BTreeMap<(HandlerKind, String, String), Handler>>,
    event_handlers: RwLock<Vec<EventHandler>>,
    event_properties: RwLock<BTreeMap<String, EventPropertyFn>>,
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("handlers", &self.schema())
            .finish_non_exhaustive()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an HTML-rendering view.
    pub fn register_view(
        &self,
        identity: QueryIdentity,
        registration: Registration,
        func: QueryFn,
    ) -> Result<Handler, RegistryError> {
        self.insert(HandlerKind::View, identity, registration, func, None)
    }

    /// Registers an unmemoized JSON query.
    pub fn register_query(
        &self,
        identity: QueryIdentity,
        registration: Registration,
        func: QueryFn,
    ) -> Result<Handler, RegistryError> {
        self.insert(HandlerKind::Query, identity, registration, func, None)
    }

    /// Registers a JSON query wrapped with shared-store memoization.
    pub fn register_memoized_query(
        &self,
        identity: QueryIdentity,
        registration: Registration,
        func: QueryFn,
        config: MemoizeConfig,
        store: CacheStoreRef,
    ) -> Result<Handler, RegistryError> {
        let memoized = Arc::new(MemoizedQuery::new(
            identity.clone(),
            func.clone(),
            config,
            store,
        ));
        self.insert(
            HandlerKind::Query,
            identity,
            registration,
            func,
            Some(memoized),
        )
    }

    fn insert(
        &self,
        kind: HandlerKind,
        identity: QueryIdentity,
        registration: Registration,
        func: QueryFn,
        memoized: Option<Arc<MemoizedQuery>>,
    ) -> Result<Handler, RegistryError> {
        let category = registration.category.unwrap_or_else(|| identity.module.clone());
        let info = Arc::new(HandlerInfo {
            kind,
            category: category.clone(),
            name: identity.name.clone(),
            description: registration.description,
            args: registration.args,
        });
        let handler = Handler {
            info,
            func,
            memoized,
        };

        let mut handlers = self.handlers.write().unwrap();
        let slot = (kind, category, identity.name);
        if handlers.contains_key(&slot) {
            return Err(RegistryError::Duplicate {
                kind,
                category: slot.1,
                name: slot.2,
            });
        }
        handlers.insert(slot, handler.clone());
        Ok(handler)
    }

    /// Looks up a view by category and name.
    pub fn view(&self, category: &str, name: &str) -> Option<Handler> {
        self.lookup(HandlerKind::View, category, name)
    }

    /// Looks up a query by category and name.
    pub fn query(&self, category: &str, name: &str) -> Option<Handler> {
        self.lookup(HandlerKind::Query, category, name)
    }

    fn lookup(&self, kind: HandlerKind, category: &str, name: &str) -> Option<Handler> {
        let handlers = self.handlers.read().unwrap();
        handlers
            .get(&(kind, category.to_owned(), name.to_owned()))
            .cloned()
    }

    /// All registered views and queries, in stable order.
    pub fn schema(&self) -> Vec<HandlerInfo> {
        let handlers = self.handlers.read().unwrap();
        handlers
            .values()
            .map(|handler| (*handler.info).clone())
            .collect()
    }

    /// Registers a batch event handler.
    pub fn register_event_handler(
        &self,
        name: impl Into<String>,
        options: EventHandlerOptions,
        func: EventFn,
    ) -> Result<(), RegistryError> {
        let name = name.into();
        let unsupported = if !options.batch {
            Some("unbatched delivery")
        } else if options.single_process {
            Some("single-process delivery")
        } else if options.source_queue.is_some() {
            Some("external source queues")
        } else {
            None
        };
        if let Some(option) = unsupported {
            return Err(RegistryError::Unsupported { name, option });
        }

        let mut handlers = self.event_handlers.write().unwrap();
        handlers.push(EventHandler { name, func });
        Ok(())
    }

    /// Registers a derived event property.
    pub fn register_event_property(
        &self,
        name: impl Into<String>,
        func: EventPropertyFn,
    ) -> Result<(), RegistryError> {
        let name = name.into();
        let mut properties = self.event_properties.write().unwrap();
        if properties.contains_key(&name) {
            return Err(RegistryError::DuplicateProperty { name });
        }
        properties.insert(name, func);
        Ok(())
    }

    /// Evaluates a registered event property against an event.
    pub fn event_property(&self, name: &str, event: &Event) -> Option<Value> {
        let properties = self.event_properties.read().unwrap();
        properties.get(name).map(|func| func(event))
    }

    /// Fans a batch of events out to every registered handler.
    ///
    /// A failing handler is logged and skipped; it never blocks delivery to
    /// the others. Returns the number of handlers that succeeded.
    pub async fn dispatch(&self, events: Vec<Event>) -> usize {
        // Snapshot under the lock; never hold it across an await.
        let handlers: Vec<(String, EventFn)> = {
            let handlers = self.event_handlers.read().unwrap();
            handlers
                .iter()
                .map(|handler| (handler.name.clone(), handler.func.clone()))
                .collect()
        };

        let mut delivered = 0;
        for (name, func) in handlers {
            match func(events.clone()).await {
                Ok(()) => delivered += 1,
                Err(error) => {
                    tracing::error!(
                        handler = %name,
                        error = format!("{error:#}"),
                        "Event handler failed",
                    );
                }
            }
        }
        delivered
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::json;

    use crate::caching::InMemoryStore;
    use crate::query::{QueryError, query_fn};

    use super::*;

    fn constant(value: Value) -> QueryFn {
        query_fn(move |_args| {
            let value = value.clone();
            async move { Ok(value) }
        })
    }

    #[test]
    fn test_duplicate_registration_is_rejected() {
        let registry = Registry::new();
        registry
            .register_query(
                QueryIdentity::new("video", "count"),
                Registration::new(),
                constant(json!(1)),
            )
            .unwrap();

        let err = registry
            .register_query(
                QueryIdentity::new("video", "count"),
                Registration::new(),
                constant(json!(2)),
            )
            .unwrap_err();
        assert!(matches!(err, RegistryError::Duplicate { .. }));

        // Same name under another kind or category is fine.
        registry
            .register_view(
                QueryIdentity::new("video", "count"),
                Registration::new(),
                constant(json!("<html>")),
            )
            .unwrap();
        registry
            .register_query(
                QueryIdentity::new("audio", "count"),
                Registration::new(),
                constant(json!(3)),
            )
            .unwrap();
    }

    #[test]
    fn test_schema_lists_registrations() {
        let registry = Registry::new();
        registry
            .register_query(
                QueryIdentity::new("video", "daily_uploads"),
                Registration::new()
                    .description("Uploads per day")
                    .arg("resolution"),
                constant(json!(0)),
            )
            .unwrap();
        registry
            .register_view(
                QueryIdentity::new("video", "dashboard"),
                Registration::new().category("overview"),
                constant(json!("<html>")),
            )
            .unwrap();

        let schema = registry.schema();
        assert_eq!(schema.len(), 2);
        let query = schema
            .iter()
            .find(|info| info.kind == HandlerKind::Query)
            .unwrap();
        assert_eq!(query.category, "video");
        assert_eq!(query.name, "daily_uploads");
        assert_eq!(query.args, vec!["resolution"]);
        let view = schema
            .iter()
            .find(|info| info.kind == HandlerKind::View)
            .unwrap();
        assert_eq!(view.category, "overview");
    }

    #[tokio::test]
    async fn test_plain_handler_ignores_modes() {
        let calls = Arc::new(AtomicUsize::new(0));
        let registry = Registry::new();
        let handler = registry
            .register_query(
                QueryIdentity::new("video", "uncached"),
                Registration::new(),
                {
                    let calls = calls.clone();
                    query_fn(move |_args| {
                        let calls = calls.clone();
                        async move {
                            calls.fetch_add(1, Ordering::SeqCst);
                            Ok(json!("fresh"))
                        }
                    })
                },
            )
            .unwrap();

        // All three modes execute directly when nothing is memoized.
        handler.call(QueryArgs::new()).await.unwrap();
        handler.force_recompute(QueryArgs::new()).await.unwrap();
        handler.force_retrieve(QueryArgs::new()).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_memoized_handler_routes_through_cache() {
        let calls = Arc::new(AtomicUsize::new(0));
        let registry = Registry::new();
        let store = Arc::new(InMemoryStore::new(100));
        let handler = registry
            .register_memoized_query(
                QueryIdentity::new("video", "cached"),
                Registration::new(),
                {
                    let calls = calls.clone();
                    query_fn(move |_args| {
                        let calls = calls.clone();
                        async move {
                            calls.fetch_add(1, Ordering::SeqCst);
                            Ok(json!(42))
                        }
                    })
                },
                MemoizeConfig::default(),
                store as CacheStoreRef,
            )
            .unwrap();

        assert!(matches!(
            handler.force_retrieve(QueryArgs::new()).await,
            Err(QueryError::NotFound { .. })
        ));
        handler.call(QueryArgs::new()).await.unwrap();
        handler.call(QueryArgs::new()).await.unwrap();
        assert_eq!(handler.force_retrieve(QueryArgs::new()).await.unwrap(), json!(42));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_dispatch_survives_failing_handlers() {
        let registry = Registry::new();
        let seen = Arc::new(AtomicUsize::new(0));

        registry
            .register_event_handler("broken", EventHandlerOptions::default(), {
                event_fn(|_events| async { anyhow::bail!("no database") })
            })
            .unwrap();
        registry
            .register_event_handler("counter", EventHandlerOptions::default(), {
                let seen = seen.clone();
                event_fn(move |events| {
                    let seen = seen.clone();
                    async move {
                        seen.fetch_add(events.len(), Ordering::SeqCst);
                        Ok(())
                    }
                })
            })
            .unwrap();

        let events = vec![Event::new(json!({"a": 1})), Event::new(json!({"a": 2}))];
        let delivered = registry.dispatch(events).await;
        assert_eq!(delivered, 1);
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_unsupported_delivery_options_are_rejected() {
        let registry = Registry::new();
        let noop = event_fn(|_events| async { Ok(()) });

        let err = registry
            .register_event_handler(
                "stream",
                EventHandlerOptions {
                    batch: false,
                    ..Default::default()
                },
                noop.clone(),
            )
            .unwrap_err();
        assert!(matches!(err, RegistryError::Unsupported { .. }));

        let err = registry
            .register_event_handler(
                "queued",
                EventHandlerOptions {
                    source_queue: Some("amqp://events".to_owned()),
                    ..Default::default()
                },
                noop,
            )
            .unwrap_err();
        assert!(matches!(err, RegistryError::Unsupported { .. }));
    }

    #[test]
    fn test_event_properties() {
        let registry = Registry::new();
        registry
            .register_event_property(
                "agent",
                Arc::new(|event: &Event| {
                    event.payload.get("agent").cloned().unwrap_or(Value::Null)
                }),
            )
            .unwrap();

        let event = Event::new(json!({"agent": "cli"}));
        assert_eq!(
            registry.event_property("agent", &event),
            Some(json!("cli"))
        );
        assert_eq!(registry.event_property("missing", &event), None);

        let err = registry
            .register_event_property("agent", Arc::new(|_event| Value::Null))
            .unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateProperty { .. }));
    }
}
