//! Types for the ingested user-tracking event stream.

use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// A single ingested tracking event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Identifier assigned at ingestion time.
    pub id: Uuid,
    /// When the event was received.
    pub received: DateTime<Utc>,
    /// The raw event payload as submitted.
    pub payload: Value,
}

impl Event {
    /// Wraps a raw payload into an event, stamping id and receive time.
    pub fn new(payload: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            received: Utc::now(),
            payload,
        }
    }
}

/// An in-memory buffer of ingested events.
///
/// Event handlers typically forward batches into durable storage; this sink
/// is the in-process store the builtin module (and the tests) consume.
#[derive(Debug, Default)]
pub struct EventSink {
    events: RwLock<Vec<Event>>,
}

impl EventSink {
    /// Appends a batch of events.
    pub fn push(&self, events: &[Event]) {
        self.events.write().unwrap().extend_from_slice(events);
    }

    /// The number of buffered events.
    pub fn len(&self) -> usize {
        self.events.read().unwrap().len()
    }

    /// Whether the sink holds no events.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// A point-in-time copy of all buffered events.
    pub fn snapshot(&self) -> Vec<Event> {
        self.events.read().unwrap().clone()
    }
}
