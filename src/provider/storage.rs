//! Document storage capability contract
//!
//! Documents carry an opaque payload plus an etag concurrency token. A
//! `StorageProvider` hands out per-container `DocumentStore`s and must be
//! health-checkable so the resilient layer can wrap it.

use crate::error::Result;
use crate::health::{HealthCheckResult, HealthCheckable};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// A stored document with identity and concurrency token
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    #[serde(default = "new_doc_id")]
    pub id: String,

    #[serde(default)]
    pub partition_key: String,

    /// Opaque structured payload
    #[serde(default = "empty_object")]
    pub data: serde_json::Value,

    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,

    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,

    /// Opaque concurrency token; refreshed on every write. Updates succeed
    /// only when the caller's etag matches the stored one.
    #[serde(default)]
    pub etag: Option<String>,
}

fn new_doc_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn empty_object() -> serde_json::Value {
    serde_json::json!({})
}

impl Default for Document {
    fn default() -> Self {
        Self {
            id: new_doc_id(),
            partition_key: String::new(),
            data: empty_object(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            etag: None,
        }
    }
}

impl Document {
    /// Create a document with a fresh id and the given payload
    pub fn new(data: serde_json::Value) -> Self {
        Self {
            data,
            ..Self::default()
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_partition_key(mut self, partition_key: impl Into<String>) -> Self {
        self.partition_key = partition_key.into();
        self
    }
}

/// CRUD + query operations over one container of documents
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Create a new document; the returned copy carries a fresh etag
    async fn create(&self, document: Document) -> Result<Document>;

    /// Read a document by id (and partition key, if the container is
    /// partitioned)
    async fn read(&self, id: &str, partition_key: Option<&str>) -> Result<Option<Document>>;

    /// Update an existing document
    ///
    /// Fails with `Conflict` when the document's etag doesn't match the
    /// stored one, and `NotFound` when the document is gone.
    async fn update(&self, document: Document) -> Result<Document>;

    /// Delete by id; returns whether a document was removed
    async fn delete(&self, id: &str, partition_key: Option<&str>) -> Result<bool>;

    /// Query documents whose payload fields equal the given criteria
    async fn query(
        &self,
        criteria: &HashMap<String, serde_json::Value>,
        partition_key: Option<&str>,
        max_items: Option<usize>,
    ) -> Result<Vec<Document>>;

    /// List all documents in the container
    async fn list_all(
        &self,
        partition_key: Option<&str>,
        max_items: Option<usize>,
    ) -> Result<Vec<Document>>;
}

/// Capability contract for storage backends
#[async_trait]
pub trait StorageProvider: HealthCheckable {
    /// Get the document store for a named container
    fn document_store(&self, container_name: &str) -> Result<Arc<dyn DocumentStore>>;

    async fn initialize(&self) -> Result<()>;

    async fn close(&self) -> Result<()>;

    async fn create_container_if_not_exists(
        &self,
        container_name: &str,
        partition_key_path: &str,
    ) -> Result<()>;

    async fn delete_container(&self, container_name: &str) -> Result<()>;

    async fn container_exists(&self, container_name: &str) -> Result<bool>;

    /// Default health probe for storage backends: check a sentinel
    /// container and measure latency
    async fn probe_health(&self) -> HealthCheckResult {
        let start = std::time::Instant::now();
        match self.container_exists("_health_check").await {
            Ok(_) => HealthCheckResult::healthy(start.elapsed().as_secs_f64() * 1000.0),
            Err(e) => {
                HealthCheckResult::unhealthy(start.elapsed().as_secs_f64() * 1000.0, e.to_string())
            }
        }
    }
}
