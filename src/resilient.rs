//! Resilient provider wrappers
//!
//! Wraps any health-checkable provider so every I/O call is routed through a
//! shared circuit breaker. Health checks bypass the breaker: they are
//! observations, and must keep flowing while the circuit is open so
//! operators can see recovery.

use crate::error::Result;
use crate::event::EventMessage;
use crate::health::{CircuitBreaker, CircuitBreakerConfig, HealthCheckResult, HealthCheckable};
use crate::provider::event_bus::{EventBus, EventHandler, FilterExpression};
use crate::provider::storage::{Document, DocumentStore, StorageProvider};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;

/// Storage provider with circuit breaking on every I/O call
///
/// Document stores handed out by this wrapper share the provider's breaker,
/// so a failing backend trips one circuit for the whole capability.
pub struct ResilientStorageProvider {
    inner: Arc<dyn StorageProvider>,
    breaker: Arc<CircuitBreaker>,
    name: String,
}

impl ResilientStorageProvider {
    pub fn new(inner: Arc<dyn StorageProvider>, config: CircuitBreakerConfig) -> Self {
        let name = inner.provider_name().to_string();
        Self {
            inner,
            breaker: Arc::new(CircuitBreaker::new(config)),
            name,
        }
    }

    /// Wrap with the default breaker configuration
    pub fn wrap(inner: Arc<dyn StorageProvider>) -> Self {
        Self::new(inner, CircuitBreakerConfig::default())
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn inner(&self) -> &Arc<dyn StorageProvider> {
        &self.inner
    }
}

#[async_trait]
impl StorageProvider for ResilientStorageProvider {
    fn document_store(&self, container_name: &str) -> Result<Arc<dyn DocumentStore>> {
        let store = self.inner.document_store(container_name)?;
        Ok(Arc::new(ResilientDocumentStore {
            inner: store,
            breaker: Arc::clone(&self.breaker),
        }))
    }

    async fn initialize(&self) -> Result<()> {
        self.breaker.call(self.inner.initialize()).await
    }

    async fn close(&self) -> Result<()> {
        self.breaker.call(self.inner.close()).await
    }

    async fn create_container_if_not_exists(
        &self,
        container_name: &str,
        partition_key_path: &str,
    ) -> Result<()> {
        self.breaker
            .call(self.inner.create_container_if_not_exists(container_name, partition_key_path))
            .await
    }

    async fn delete_container(&self, container_name: &str) -> Result<()> {
        self.breaker.call(self.inner.delete_container(container_name)).await
    }

    async fn container_exists(&self, container_name: &str) -> Result<bool> {
        self.breaker.call(self.inner.container_exists(container_name)).await
    }
}

#[async_trait]
impl HealthCheckable for ResilientStorageProvider {
    async fn health_check(&self) -> HealthCheckResult {
        self.inner.health_check().await
    }

    fn provider_name(&self) -> &str {
        &self.name
    }
}

/// Document store routing every call through the provider's breaker
pub struct ResilientDocumentStore {
    inner: Arc<dyn DocumentStore>,
    breaker: Arc<CircuitBreaker>,
}

#[async_trait]
impl DocumentStore for ResilientDocumentStore {
    async fn create(&self, document: Document) -> Result<Document> {
        self.breaker.call(self.inner.create(document)).await
    }

    async fn read(&self, id: &str, partition_key: Option<&str>) -> Result<Option<Document>> {
        self.breaker.call(self.inner.read(id, partition_key)).await
    }

    async fn update(&self, document: Document) -> Result<Document> {
        self.breaker.call(self.inner.update(document)).await
    }

    async fn delete(&self, id: &str, partition_key: Option<&str>) -> Result<bool> {
        self.breaker.call(self.inner.delete(id, partition_key)).await
    }

    async fn query(
        &self,
        criteria: &HashMap<String, serde_json::Value>,
        partition_key: Option<&str>,
        max_items: Option<usize>,
    ) -> Result<Vec<Document>> {
        self.breaker
            .call(self.inner.query(criteria, partition_key, max_items))
            .await
    }

    async fn list_all(
        &self,
        partition_key: Option<&str>,
        max_items: Option<usize>,
    ) -> Result<Vec<Document>> {
        self.breaker.call(self.inner.list_all(partition_key, max_items)).await
    }
}

/// Event bus with circuit breaking on every I/O call
pub struct ResilientEventBus {
    inner: Arc<dyn EventBus>,
    breaker: Arc<CircuitBreaker>,
    name: String,
}

impl ResilientEventBus {
    pub fn new(inner: Arc<dyn EventBus>, config: CircuitBreakerConfig) -> Self {
        let name = inner.provider_name().to_string();
        Self {
            inner,
            breaker: Arc::new(CircuitBreaker::new(config)),
            name,
        }
    }

    pub fn wrap(inner: Arc<dyn EventBus>) -> Self {
        Self::new(inner, CircuitBreakerConfig::default())
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn inner(&self) -> &Arc<dyn EventBus> {
        &self.inner
    }
}

#[async_trait]
impl EventBus for ResilientEventBus {
    async fn publish(&self, event: EventMessage, topic: Option<&str>) -> Result<()> {
        self.breaker.call(self.inner.publish(event, topic)).await
    }

    async fn publish_batch(&self, events: Vec<EventMessage>, topic: Option<&str>) -> Result<()> {
        self.breaker.call(self.inner.publish_batch(events, topic)).await
    }

    async fn subscribe(
        &self,
        event_type: &str,
        handler: EventHandler,
        topic: Option<&str>,
        filter: Option<FilterExpression>,
    ) -> Result<String> {
        self.breaker
            .call(self.inner.subscribe(event_type, handler, topic, filter))
            .await
    }

    async fn unsubscribe(&self, subscription_id: &str) -> Result<()> {
        self.breaker.call(self.inner.unsubscribe(subscription_id)).await
    }

    async fn start(&self) -> Result<()> {
        self.breaker.call(self.inner.start()).await
    }

    async fn stop(&self) -> Result<()> {
        self.breaker.call(self.inner.stop()).await
    }

    async fn create_topic(&self, topic_name: &str) -> Result<()> {
        self.breaker.call(self.inner.create_topic(topic_name)).await
    }

    async fn delete_topic(&self, topic_name: &str) -> Result<()> {
        self.breaker.call(self.inner.delete_topic(topic_name)).await
    }

    async fn topic_exists(&self, topic_name: &str) -> bool {
        self.inner.topic_exists(topic_name).await
    }

    async fn get_dead_letter_events(
        &self,
        topic: Option<&str>,
        max_items: Option<usize>,
    ) -> Result<Vec<EventMessage>> {
        self.breaker
            .call(self.inner.get_dead_letter_events(topic, max_items))
            .await
    }

    async fn reprocess_dead_letter_event(&self, event_id: &str, topic: Option<&str>) -> Result<()> {
        self.breaker
            .call(self.inner.reprocess_dead_letter_event(event_id, topic))
            .await
    }

    async fn has_subscribers(&self, event_type: &str, topic: Option<&str>) -> bool {
        self.inner.has_subscribers(event_type, topic).await
    }

    async fn get_orphaned_events(
        &self,
        since: Option<DateTime<Utc>>,
        max_items: Option<usize>,
    ) -> Result<Vec<EventMessage>> {
        self.breaker.call(self.inner.get_orphaned_events(since, max_items)).await
    }

    async fn drain_orphaned_events(
        &self,
        event_types: Option<&[String]>,
        before: Option<DateTime<Utc>>,
    ) -> Result<usize> {
        self.breaker
            .call(self.inner.drain_orphaned_events(event_types, before))
            .await
    }
}

#[async_trait]
impl HealthCheckable for ResilientEventBus {
    async fn health_check(&self) -> HealthCheckResult {
        self.inner.health_check().await
    }

    fn provider_name(&self) -> &str {
        &self.name
    }
}
