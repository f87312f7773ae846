//! Status events and their transport to the collector.
//!
//! Services observe their own behavior as [`Event`] values and push them
//! into an [`Emitter`](emitter::Emitter). The [`EventDrainService`](drain::EventDrainService)
//! periodically pulls accumulated events from every registered emitter and
//! ships them to the collector endpoint as one JSON batch.

pub mod drain;
pub mod emitter;

pub use drain::{DrainError, EventDrainService, EventDrainServiceBuilder};
pub use emitter::{BufferedEmitter, BufferedEmitterBuilder, Emitter, NoopEmitter};

use crate::context::RequestContext;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

/// Enumerated tag identifying what an event reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EventType(&'static str);

impl EventType {
    pub const fn new(tag: &'static str) -> Self {
        Self(tag)
    }

    pub fn as_str(&self) -> &'static str {
        self.0
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.0)
    }
}

/// A single status observation.
///
/// Events are value objects; once pushed into an emitter they are owned by
/// it until drained. Correlation fields are copied from the ambient context
/// at creation time.
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub source: String,
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Map<String, Value>>,
    pub is_error: bool,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub device_id: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub client_version: String,
}

impl Event {
    /// Creates an event stamped with the ambient context's correlation
    /// fields.
    pub fn new(context: &RequestContext, event_type: EventType) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            source: context.service().to_string(),
            event_type,
            message: String::new(),
            data: None,
            is_error: false,
            device_id: context.device_id().to_string(),
            client_version: context.client_version().to_string(),
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    /// Attaches one key to the event's data payload.
    pub fn with_data_field(mut self, key: impl Into<String>, value: Value) -> Self {
        self.data
            .get_or_insert_with(serde_json::Map::new)
            .insert(key.into(), value);
        self
    }

    /// Marks the event as reporting a failure.
    pub fn as_error(mut self) -> Self {
        self.is_error = true;
        self
    }
}
