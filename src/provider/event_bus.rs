//! Event bus capability contract
//!
//! Topic-addressed asynchronous delivery with wildcard subscription, filter
//! expressions, bounded retry, and dead-letter handling. The bus is
//! best-effort: at-most-once delivery per handler with bounded retry, and
//! undeliverable events preserved in a dead-letter store.

use crate::error::Result;
use crate::event::EventMessage;
use crate::health::HealthCheckable;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::sync::Arc;

/// Async event handler invoked once per matched event per subscription
pub type EventHandler = Arc<dyn Fn(EventMessage) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Wrap an async closure as an [`EventHandler`]
pub fn handler_fn<F, Fut>(f: F) -> EventHandler
where
    F: Fn(EventMessage) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(move |event| -> BoxFuture<'static, Result<()>> { Box::pin(f(event)) })
}

/// Filter expression: dotted key-paths to expected values, AND semantics
///
/// Recognized prefixes: `data.<path>` walks the event payload, `metadata.
/// <field>` looks up metadata, and bare names compare event attributes.
/// Equality only; a missing path fails the filter.
pub type FilterExpression = HashMap<String, serde_json::Value>;

/// An event that exhausted its retries for one subscription
#[derive(Debug, Clone)]
pub struct DeadLetterRecord {
    pub event: EventMessage,
    /// Topic the event was originally published to
    pub topic: String,
    /// Subscription whose handler kept failing
    pub subscription_id: String,
    pub reason: String,
    /// Total handler invocations before dead-lettering
    pub attempts: u32,
    pub dead_lettered_at: DateTime<Utc>,
}

impl std::fmt::Debug for dyn EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("provider_name", &self.provider_name())
            .finish()
    }
}

/// Capability contract for event bus backends
#[async_trait]
pub trait EventBus: HealthCheckable {
    /// Publish an event; the topic defaults to `"default"` and is created
    /// lazily if absent
    async fn publish(&self, event: EventMessage, topic: Option<&str>) -> Result<()>;

    /// Publish a batch; elements are delivered in submission order within
    /// the topic
    async fn publish_batch(&self, events: Vec<EventMessage>, topic: Option<&str>) -> Result<()>;

    /// Subscribe a handler to an event-type pattern (literal or with `*`
    /// wildcard segments), returning a fresh subscription id
    async fn subscribe(
        &self,
        event_type: &str,
        handler: EventHandler,
        topic: Option<&str>,
        filter: Option<FilterExpression>,
    ) -> Result<String>;

    /// Remove a subscription; unknown ids are a no-op
    async fn unsubscribe(&self, subscription_id: &str) -> Result<()>;

    /// Start processing; idempotent
    async fn start(&self) -> Result<()>;

    /// Stop processing; pending queue contents survive for a later `start`
    async fn stop(&self) -> Result<()>;

    /// Create a topic/queue if it doesn't exist
    async fn create_topic(&self, topic_name: &str) -> Result<()>;

    /// Delete a topic/queue
    async fn delete_topic(&self, topic_name: &str) -> Result<()>;

    async fn topic_exists(&self, topic_name: &str) -> bool;

    /// Events currently held in the dead-letter queue
    async fn get_dead_letter_events(
        &self,
        topic: Option<&str>,
        max_items: Option<usize>,
    ) -> Result<Vec<EventMessage>>;

    /// Republish a dead-lettered event to its originating topic and remove
    /// the record; unknown ids fail with `NotFound`
    async fn reprocess_dead_letter_event(&self, event_id: &str, topic: Option<&str>) -> Result<()>;

    /// Whether an event type has any active subscribers
    ///
    /// Conservative default: `true`, to avoid dropping events when the
    /// backend can't answer cheaply.
    async fn has_subscribers(&self, _event_type: &str, _topic: Option<&str>) -> bool {
        true
    }

    /// Events that were published but matched no subscription
    async fn get_orphaned_events(
        &self,
        _since: Option<DateTime<Utc>>,
        _max_items: Option<usize>,
    ) -> Result<Vec<EventMessage>> {
        Ok(Vec::new())
    }

    /// Remove orphaned events, returning how many were drained
    async fn drain_orphaned_events(
        &self,
        _event_types: Option<&[String]>,
        _before: Option<DateTime<Utc>>,
    ) -> Result<usize> {
        Ok(0)
    }
}
