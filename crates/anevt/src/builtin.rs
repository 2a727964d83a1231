//! The builtin analytics module.
//!
//! Registered on every server: an event handler buffering the ingested
//! stream, a memoized `event_count` query over it, and a plain HTML
//! `dashboard` view. It doubles as the reference for how external modules
//! wire themselves into the registry.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Result;
use serde_json::{Value, json};

use anevt_service::caching::{CacheStoreRef, QueryArgs, QueryIdentity};
use anevt_service::config::Config;
use anevt_service::events::EventSink;
use anevt_service::query::query_fn;
use anevt_service::registry::{
    EventHandlerOptions, Handler, Registration, Registry, event_fn,
};

const MODULE: &str = "builtin";

/// Registers the builtin module.
///
/// Returns the memoized `event_count` handler so the caller can put it on a
/// warming schedule.
pub fn register(
    registry: &Registry,
    config: &Config,
    sink: Arc<EventSink>,
    store: CacheStoreRef,
) -> Result<Handler> {
    registry.register_event_handler("builtin.record", EventHandlerOptions::default(), {
        let sink = sink.clone();
        event_fn(move |events| {
            let sink = sink.clone();
            async move {
                sink.push(&events);
                Ok(())
            }
        })
    })?;

    registry.register_event_property(
        "received",
        Arc::new(|event| json!(event.received)),
    )?;

    let event_count = registry.register_memoized_query(
        QueryIdentity::new(MODULE, "event_count"),
        Registration::new()
            .category("global")
            .description("Number of ingested events, optionally grouped by a payload field")
            .arg("field"),
        {
            let sink = sink.clone();
            query_fn(move |args: QueryArgs| {
                let sink = sink.clone();
                async move { Ok(count_events(&sink, &args)) }
            })
        },
        config.memoize.memoize_config(),
        store,
    )?;

    registry.register_view(
        QueryIdentity::new(MODULE, "dashboard"),
        Registration::new()
            .category("global")
            .description("Plain HTML overview of the ingested event stream"),
        {
            let sink = sink.clone();
            query_fn(move |_args| {
                let sink = sink.clone();
                async move { Ok(Value::String(render_dashboard(&sink))) }
            })
        },
    )?;

    Ok(event_count)
}

fn count_events(sink: &EventSink, args: &QueryArgs) -> Value {
    let events = sink.snapshot();
    match args.keyword.get("field").and_then(|arg| arg.value().as_str()) {
        Some(field) => {
            let mut counts: BTreeMap<String, u64> = BTreeMap::new();
            for event in &events {
                let key = match event.payload.get(field) {
                    Some(Value::String(s)) => s.clone(),
                    Some(other) => other.to_string(),
                    None => "unknown".to_owned(),
                };
                *counts.entry(key).or_default() += 1;
            }
            json!({ "total": events.len(), "by": field, "counts": counts })
        }
        None => json!({ "total": events.len() }),
    }
}

fn render_dashboard(sink: &EventSink) -> String {
    let events = sink.snapshot();
    let last = events
        .last()
        .map(|event| event.received.to_rfc3339())
        .unwrap_or_else(|| "never".to_owned());
    format!(
        "<!doctype html>\n\
         <html><head><title>anevt</title></head><body>\n\
         <h1>Event stream</h1>\n\
         <p>Events received: {}</p>\n\
         <p>Last event: {}</p>\n\
         </body></html>\n",
        events.len(),
        last
    )
}

#[cfg(test)]
mod tests {
    use anevt_service::events::Event;

    use super::*;

    #[test]
    fn test_count_events_grouped() {
        let sink = EventSink::default();
        sink.push(&[
            Event::new(json!({"verb": "played"})),
            Event::new(json!({"verb": "played"})),
            Event::new(json!({"verb": "paused"})),
            Event::new(json!({"other": 1})),
        ]);

        let args = QueryArgs::new().with_kwarg("field", "verb");
        let counts = count_events(&sink, &args);
        assert_eq!(counts["total"], 4);
        assert_eq!(counts["counts"]["played"], 2);
        assert_eq!(counts["counts"]["paused"], 1);
        assert_eq!(counts["counts"]["unknown"], 1);

        let plain = count_events(&sink, &QueryArgs::new());
        assert_eq!(plain, json!({"total": 4}));
    }

    #[test]
    fn test_dashboard_renders_html() {
        let sink = EventSink::default();
        let html = render_dashboard(&sink);
        assert!(html.contains("Events received: 0"));
        assert!(html.contains("Last event: never"));

        sink.push(&[Event::new(json!({"verb": "played"}))]);
        let html = render_dashboard(&sink);
        assert!(html.contains("Events received: 1"));
    }
}
