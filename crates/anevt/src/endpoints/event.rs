use axum::Json;
use axum::extract::State;
use serde::Serialize;
use serde_json::Value;

use anevt_service::events::Event;
use anevt_service::metric;

use super::ResponseError;
use crate::service::AppService;

/// The response of the event ingestion endpoint.
#[derive(Debug, Serialize)]
pub struct IngestResponse {
    /// How many events the request contained.
    received: usize,
    /// How many handlers accepted the batch.
    delivered: usize,
}

/// Ingests a single event or an array of events.
pub async fn ingest_events(
    State(service): State<AppService>,
    Json(payload): Json<Value>,
) -> Result<Json<IngestResponse>, ResponseError> {
    let events: Vec<Event> = match payload {
        Value::Array(items) => items.into_iter().map(Event::new).collect(),
        other => vec![Event::new(other)],
    };
    let received = events.len();
    metric!(counter("events.received") += received as i64);

    let delivered = service.registry().dispatch(events).await;
    Ok(Json(IngestResponse {
        received,
        delivered,
    }))
}
