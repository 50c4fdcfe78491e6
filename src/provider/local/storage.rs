//! Local SQLite-backed storage provider
//!
//! One table per container in a single embedded database file, with schema
//! `(id, partition_key, data JSON, created_at, updated_at, etag,
//! UNIQUE(id, partition_key))`. This layout is internal — callers go through
//! `DocumentStore`. rusqlite is synchronous, so every operation runs under
//! `spawn_blocking` with the connection behind a mutex.

use crate::crypto::{EncryptedPayload, PayloadEncryptor};
use crate::error::{Result, RuntimeError};
use crate::health::{HealthCheckResult, HealthCheckable};
use crate::provider::storage::{Document, DocumentStore, StorageProvider};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::Connection;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Shared connection handle
type Db = Arc<Mutex<Connection>>;

fn lock_err(e: impl std::fmt::Display) -> RuntimeError {
    RuntimeError::Storage(format!("Connection lock poisoned: {}", e))
}

fn sql_err(e: rusqlite::Error) -> RuntimeError {
    RuntimeError::Storage(e.to_string())
}

async fn blocking<T, F>(f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| RuntimeError::Storage(format!("Blocking task failed: {}", e)))?
}

/// Container names become table names; restrict to a safe identifier set
fn table_name(container: &str) -> String {
    container
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect()
}

fn ensure_table(conn: &Connection, table: &str) -> Result<()> {
    conn.execute_batch(&format!(
        r#"CREATE TABLE IF NOT EXISTS "{table}" (
            id TEXT NOT NULL,
            partition_key TEXT NOT NULL DEFAULT '',
            data TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            etag TEXT NOT NULL,
            PRIMARY KEY (id, partition_key)
        );
        CREATE INDEX IF NOT EXISTS "idx_{table}_partition" ON "{table}"(partition_key);"#
    ))
    .map_err(sql_err)
}

fn parse_timestamp(text: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| RuntimeError::Storage(format!("Invalid stored timestamp '{}': {}", text, e)))
}

fn row_to_document(row: &rusqlite::Row<'_>) -> rusqlite::Result<(Document, String)> {
    let data_text: String = row.get(2)?;
    Ok((
        Document {
            id: row.get(0)?,
            partition_key: row.get(1)?,
            data: serde_json::Value::Null, // filled in after JSON parse
            created_at: Utc::now(),
            updated_at: Utc::now(),
            etag: Some(row.get(5)?),
        },
        data_text,
    ))
}

/// Fully materialize a row, parsing JSON and timestamps
fn materialize(row: &rusqlite::Row<'_>) -> Result<Document> {
    let (mut doc, data_text) = row_to_document(row).map_err(sql_err)?;
    doc.data = serde_json::from_str(&data_text)?;
    let created: String = row.get(3).map_err(sql_err)?;
    let updated: String = row.get(4).map_err(sql_err)?;
    doc.created_at = parse_timestamp(&created)?;
    doc.updated_at = parse_timestamp(&updated)?;
    Ok(doc)
}

/// SQLite-backed document store for one container
pub struct LocalDocumentStore {
    db: Db,
    table: String,
    encryptor: Option<Arc<dyn PayloadEncryptor>>,
    initialized: AtomicBool,
}

impl LocalDocumentStore {
    fn new(db: Db, table: String, encryptor: Option<Arc<dyn PayloadEncryptor>>) -> Self {
        Self {
            db,
            table,
            encryptor,
            initialized: AtomicBool::new(false),
        }
    }

    async fn ensure_initialized(&self) -> Result<()> {
        if self.initialized.load(Ordering::Acquire) {
            return Ok(());
        }
        let db = Arc::clone(&self.db);
        let table = self.table.clone();
        blocking(move || {
            let conn = db.lock().map_err(lock_err)?;
            ensure_table(&conn, &table)
        })
        .await?;
        self.initialized.store(true, Ordering::Release);
        Ok(())
    }

    fn encode_data(&self, data: &serde_json::Value) -> Result<String> {
        let stored = match &self.encryptor {
            Some(enc) => enc.encrypt(data)?,
            None => data.clone(),
        };
        serde_json::to_string(&stored).map_err(Into::into)
    }

    fn decode_document(&self, mut doc: Document) -> Document {
        if let Some(enc) = &self.encryptor {
            if EncryptedPayload::is_encrypted(&doc.data) {
                if let Ok(plain) = enc.decrypt(&doc.data) {
                    doc.data = plain;
                }
            }
        }
        doc
    }
}

#[async_trait]
impl DocumentStore for LocalDocumentStore {
    async fn create(&self, mut document: Document) -> Result<Document> {
        self.ensure_initialized().await?;
        document.updated_at = Utc::now();
        document.etag = Some(uuid::Uuid::new_v4().to_string());

        let db = Arc::clone(&self.db);
        let table = self.table.clone();
        let data_text = self.encode_data(&document.data)?;
        let doc = document.clone();
        blocking(move || {
            let conn = db.lock().map_err(lock_err)?;
            let result = conn.execute(
                &format!(
                    r#"INSERT INTO "{table}"
                       (id, partition_key, data, created_at, updated_at, etag)
                       VALUES (?1, ?2, ?3, ?4, ?5, ?6)"#
                ),
                rusqlite::params![
                    doc.id,
                    doc.partition_key,
                    data_text,
                    doc.created_at.to_rfc3339(),
                    doc.updated_at.to_rfc3339(),
                    doc.etag.as_deref().unwrap_or_default(),
                ],
            );
            match result {
                Ok(_) => Ok(()),
                Err(rusqlite::Error::SqliteFailure(e, _))
                    if e.code == rusqlite::ErrorCode::ConstraintViolation =>
                {
                    Err(RuntimeError::Conflict(format!(
                        "Document already exists: {}",
                        doc.id
                    )))
                }
                Err(e) => Err(sql_err(e)),
            }
        })
        .await?;

        Ok(document)
    }

    async fn read(&self, id: &str, partition_key: Option<&str>) -> Result<Option<Document>> {
        self.ensure_initialized().await?;
        let db = Arc::clone(&self.db);
        let table = self.table.clone();
        let id = id.to_string();
        let partition = partition_key.map(str::to_string);

        let doc = blocking(move || {
            let conn = db.lock().map_err(lock_err)?;
            let mut rows = Vec::new();
            match partition {
                Some(pk) => {
                    let mut stmt = conn
                        .prepare_cached(&format!(
                            r#"SELECT id, partition_key, data, created_at, updated_at, etag
                               FROM "{table}" WHERE id = ?1 AND partition_key = ?2"#
                        ))
                        .map_err(sql_err)?;
                    let mut query = stmt.query(rusqlite::params![id, pk]).map_err(sql_err)?;
                    while let Some(row) = query.next().map_err(sql_err)? {
                        rows.push(materialize(row)?);
                    }
                }
                None => {
                    let mut stmt = conn
                        .prepare_cached(&format!(
                            r#"SELECT id, partition_key, data, created_at, updated_at, etag
                               FROM "{table}" WHERE id = ?1"#
                        ))
                        .map_err(sql_err)?;
                    let mut query = stmt.query(rusqlite::params![id]).map_err(sql_err)?;
                    while let Some(row) = query.next().map_err(sql_err)? {
                        rows.push(materialize(row)?);
                    }
                }
            }
            Ok(rows.into_iter().next())
        })
        .await?;

        Ok(doc.map(|d| self.decode_document(d)))
    }

    async fn update(&self, mut document: Document) -> Result<Document> {
        self.ensure_initialized().await?;
        let caller_etag = document.etag.clone().ok_or_else(|| {
            RuntimeError::Conflict(format!("Update requires an etag: {}", document.id))
        })?;
        document.updated_at = Utc::now();
        let new_etag = uuid::Uuid::new_v4().to_string();
        document.etag = Some(new_etag.clone());

        let db = Arc::clone(&self.db);
        let table = self.table.clone();
        let data_text = self.encode_data(&document.data)?;
        let doc = document.clone();
        blocking(move || {
            let conn = db.lock().map_err(lock_err)?;
            let changed = conn
                .execute(
                    &format!(
                        r#"UPDATE "{table}"
                           SET data = ?1, updated_at = ?2, etag = ?3
                           WHERE id = ?4 AND partition_key = ?5 AND etag = ?6"#
                    ),
                    rusqlite::params![
                        data_text,
                        doc.updated_at.to_rfc3339(),
                        new_etag,
                        doc.id,
                        doc.partition_key,
                        caller_etag,
                    ],
                )
                .map_err(sql_err)?;

            if changed == 0 {
                // Distinguish a stale etag from a missing document
                let exists: bool = conn
                    .query_row(
                        &format!(
                            r#"SELECT COUNT(*) FROM "{table}"
                               WHERE id = ?1 AND partition_key = ?2"#
                        ),
                        rusqlite::params![doc.id, doc.partition_key],
                        |row| row.get::<_, i64>(0).map(|n| n > 0),
                    )
                    .map_err(sql_err)?;
                if exists {
                    return Err(RuntimeError::Conflict(format!(
                        "Etag mismatch for document: {}",
                        doc.id
                    )));
                }
                return Err(RuntimeError::NotFound(format!(
                    "Document not found: {}",
                    doc.id
                )));
            }
            Ok(())
        })
        .await?;

        Ok(document)
    }

    async fn delete(&self, id: &str, partition_key: Option<&str>) -> Result<bool> {
        self.ensure_initialized().await?;
        let db = Arc::clone(&self.db);
        let table = self.table.clone();
        let id = id.to_string();
        let partition = partition_key.map(str::to_string);

        blocking(move || {
            let conn = db.lock().map_err(lock_err)?;
            let changed = match partition {
                Some(pk) => conn
                    .execute(
                        &format!(
                            r#"DELETE FROM "{table}" WHERE id = ?1 AND partition_key = ?2"#
                        ),
                        rusqlite::params![id, pk],
                    )
                    .map_err(sql_err)?,
                None => conn
                    .execute(
                        &format!(r#"DELETE FROM "{table}" WHERE id = ?1"#),
                        rusqlite::params![id],
                    )
                    .map_err(sql_err)?,
            };
            Ok(changed > 0)
        })
        .await
    }

    async fn query(
        &self,
        criteria: &HashMap<String, serde_json::Value>,
        partition_key: Option<&str>,
        max_items: Option<usize>,
    ) -> Result<Vec<Document>> {
        self.ensure_initialized().await?;
        let db = Arc::clone(&self.db);
        let table = self.table.clone();
        let partition = partition_key.map(str::to_string);
        let criteria: Vec<(String, serde_json::Value)> = criteria
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let limit = max_items.map(|m| m as i64).unwrap_or(-1);

        let docs = blocking(move || {
            let mut where_clauses: Vec<String> = Vec::new();
            let mut params: Vec<rusqlite::types::Value> = Vec::new();

            if let Some(pk) = partition {
                where_clauses.push(format!("partition_key = ?{}", params.len() + 1));
                params.push(rusqlite::types::Value::Text(pk));
            }
            for (key, value) in &criteria {
                let field = json_path_field(key);
                where_clauses.push(format!(
                    "json_extract(data, '$.{}') = ?{}",
                    field,
                    params.len() + 1
                ));
                params.push(json_to_sql(value));
            }

            let where_sql = if where_clauses.is_empty() {
                "1=1".to_string()
            } else {
                where_clauses.join(" AND ")
            };

            let conn = db.lock().map_err(lock_err)?;
            let mut stmt = conn
                .prepare(&format!(
                    r#"SELECT id, partition_key, data, created_at, updated_at, etag
                       FROM "{table}" WHERE {where_sql} LIMIT {limit}"#
                ))
                .map_err(sql_err)?;
            let mut query = stmt
                .query(rusqlite::params_from_iter(params))
                .map_err(sql_err)?;
            let mut docs = Vec::new();
            while let Some(row) = query.next().map_err(sql_err)? {
                docs.push(materialize(row)?);
            }
            Ok(docs)
        })
        .await?;

        Ok(docs.into_iter().map(|d| self.decode_document(d)).collect())
    }

    async fn list_all(
        &self,
        partition_key: Option<&str>,
        max_items: Option<usize>,
    ) -> Result<Vec<Document>> {
        self.query(&HashMap::new(), partition_key, max_items).await
    }
}

/// Criteria keys become json_extract paths; dots select nested fields
fn json_path_field(key: &str) -> String {
    key.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Map a JSON criteria value to the SQL value json_extract produces
fn json_to_sql(value: &serde_json::Value) -> rusqlite::types::Value {
    match value {
        serde_json::Value::String(s) => rusqlite::types::Value::Text(s.clone()),
        serde_json::Value::Bool(b) => rusqlite::types::Value::Integer(*b as i64),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                rusqlite::types::Value::Integer(i)
            } else {
                rusqlite::types::Value::Real(n.as_f64().unwrap_or_default())
            }
        }
        serde_json::Value::Null => rusqlite::types::Value::Null,
        other => rusqlite::types::Value::Text(other.to_string()),
    }
}

/// Local file-based storage provider
pub struct LocalStorageProvider {
    db: Db,
    base_path: PathBuf,
    encryptor: Option<Arc<dyn PayloadEncryptor>>,
}

impl LocalStorageProvider {
    /// Open (or create) the database under the given directory
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let base_path = path.as_ref().to_path_buf();
        std::fs::create_dir_all(&base_path).map_err(|e| {
            RuntimeError::Storage(format!(
                "Failed to create storage directory {}: {}",
                base_path.display(),
                e
            ))
        })?;
        let db_path = base_path.join("lightning.db");
        let conn = Connection::open(&db_path).map_err(sql_err)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;").map_err(sql_err)?;
        Ok(Self {
            db: Arc::new(Mutex::new(conn)),
            base_path,
            encryptor: None,
        })
    }

    /// Encrypt document payloads at rest with the given encryptor
    pub fn with_encryptor(mut self, encryptor: Arc<dyn PayloadEncryptor>) -> Self {
        self.encryptor = Some(encryptor);
        self
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }
}

#[async_trait]
impl StorageProvider for LocalStorageProvider {
    fn document_store(&self, container_name: &str) -> Result<Arc<dyn DocumentStore>> {
        let table = table_name(container_name);
        if table.is_empty() {
            return Err(RuntimeError::Config("Container name cannot be empty".to_string()));
        }
        Ok(Arc::new(LocalDocumentStore::new(
            Arc::clone(&self.db),
            table,
            self.encryptor.clone(),
        )))
    }

    async fn initialize(&self) -> Result<()> {
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        // The connection closes when the provider is dropped
        Ok(())
    }

    async fn create_container_if_not_exists(
        &self,
        container_name: &str,
        _partition_key_path: &str,
    ) -> Result<()> {
        let db = Arc::clone(&self.db);
        let table = table_name(container_name);
        blocking(move || {
            let conn = db.lock().map_err(lock_err)?;
            ensure_table(&conn, &table)
        })
        .await
    }

    async fn delete_container(&self, container_name: &str) -> Result<()> {
        let db = Arc::clone(&self.db);
        let table = table_name(container_name);
        blocking(move || {
            let conn = db.lock().map_err(lock_err)?;
            conn.execute_batch(&format!(r#"DROP TABLE IF EXISTS "{table}""#))
                .map_err(sql_err)
        })
        .await
    }

    async fn container_exists(&self, container_name: &str) -> Result<bool> {
        let db = Arc::clone(&self.db);
        let table = table_name(container_name);
        blocking(move || {
            let conn = db.lock().map_err(lock_err)?;
            let count: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
                    rusqlite::params![table],
                    |row| row.get(0),
                )
                .map_err(sql_err)?;
            Ok(count > 0)
        })
        .await
    }
}

#[async_trait]
impl HealthCheckable for LocalStorageProvider {
    async fn health_check(&self) -> HealthCheckResult {
        self.probe_health().await
    }

    fn provider_name(&self) -> &str {
        "storage_local"
    }
}
