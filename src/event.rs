//! Core event types
//!
//! `EventMessage` is the typed, immutable message routed by the event bus.
//! The JSON wire format is fixed: `id`, `event_type`, `data`, `metadata`,
//! `timestamp` (ISO-8601 UTC), `priority`, `correlation_id`, `reply_to`,
//! `ttl_seconds`. All fields round-trip.

use crate::error::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Event priority levels
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventPriority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

/// A typed message routed through the event bus
///
/// Event types are dotted hierarchical names (e.g. `user.action`,
/// `instruction.created`, `voice.call.started`). Events are treated as
/// immutable once published.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventMessage {
    /// Unique event identifier, fresh per publication
    #[serde(default = "new_event_id")]
    pub id: String,

    /// Dotted hierarchical event type
    #[serde(default)]
    pub event_type: String,

    /// Arbitrary structured payload
    #[serde(default = "empty_object")]
    pub data: serde_json::Value,

    /// Key-value metadata (typically `userID`, `request_id`, `session_id`)
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,

    /// Publication timestamp (UTC)
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,

    #[serde(default)]
    pub priority: EventPriority,

    /// Correlates related events across topics
    #[serde(default)]
    pub correlation_id: Option<String>,

    /// Topic a response should be published to
    #[serde(default)]
    pub reply_to: Option<String>,

    /// Time-to-live in seconds; expired events are discarded, never delivered
    #[serde(default)]
    pub ttl_seconds: Option<u64>,
}

fn new_event_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn empty_object() -> serde_json::Value {
    serde_json::json!({})
}

impl Default for EventMessage {
    fn default() -> Self {
        Self {
            id: new_event_id(),
            event_type: String::new(),
            data: empty_object(),
            metadata: HashMap::new(),
            timestamp: Utc::now(),
            priority: EventPriority::Normal,
            correlation_id: None,
            reply_to: None,
            ttl_seconds: None,
        }
    }
}

impl EventMessage {
    /// Create a new event with auto-generated id and timestamp
    pub fn new(event_type: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            event_type: event_type.into(),
            data,
            ..Self::default()
        }
    }

    /// Add a metadata entry
    pub fn with_metadata(
        mut self,
        key: impl Into<String>,
        value: impl Into<serde_json::Value>,
    ) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Set the priority
    pub fn with_priority(mut self, priority: EventPriority) -> Self {
        self.priority = priority;
        self
    }

    /// Set the time-to-live in seconds
    pub fn with_ttl(mut self, ttl_seconds: u64) -> Self {
        self.ttl_seconds = Some(ttl_seconds);
        self
    }

    /// Set the correlation id
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Set the reply-to topic
    pub fn with_reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.reply_to = Some(reply_to.into());
        self
    }

    /// An event is expired iff `now − timestamp > ttl_seconds`
    pub fn is_expired(&self) -> bool {
        match self.ttl_seconds {
            Some(ttl) => {
                let age = Utc::now().signed_duration_since(self.timestamp);
                age.num_seconds() > ttl as i64
            }
            None => false,
        }
    }

    /// Serialize to the JSON wire format
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(Into::into)
    }

    /// Parse from the JSON wire format; missing optional fields default
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(Into::into)
    }
}
