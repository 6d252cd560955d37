use crate::error::{AppError, Result};
use crate::store::{
    DocumentStore, Document, Filter, ServerClock, SetOptions, apply_set, check_batch,
    check_filters,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, params};
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;

/// SQLite-backed document store.
///
/// Every collection shares one `documents` table keyed by
/// `(collection, id)`; writes are upserts, so repeating a write never
/// creates a second row.
#[derive(Clone)]
pub struct SqliteDocumentStore {
    conn: Arc<Mutex<Connection>>,
    clock: Arc<ServerClock>,
}

impl SqliteDocumentStore {
    /// Open or create a store at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        // Create parent directories if needed
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)
            .map_err(|e| AppError::Storage(format!("Failed to open database: {}", e)))?;

        Self::with_connection(conn)
    }

    /// Open in-memory store (for testing).
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| AppError::Storage(format!("Failed to open database: {}", e)))?;

        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
            clock: Arc::new(ServerClock::default()),
        };

        store.initialize_schema()?;
        Ok(store)
    }

    /// Initialize database schema.
    fn initialize_schema(&self) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS documents (
                collection TEXT NOT NULL,
                id TEXT NOT NULL,
                data TEXT NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (collection, id)
            );

            CREATE INDEX IF NOT EXISTS idx_documents_collection ON documents(collection);
            "#,
        )
        .map_err(|e| AppError::Storage(format!("Failed to initialize schema: {}", e)))?;

        Ok(())
    }

    fn read_document(conn: &Connection, collection: &str, id: &str) -> Result<Option<Document>> {
        let raw: Option<String> = conn
            .query_row(
                "SELECT data FROM documents WHERE collection = ?1 AND id = ?2",
                params![collection, id],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| AppError::Storage(format!("Failed to get document: {}", e)))?;

        raw.map(|text| Self::decode(&text)).transpose()
    }

    fn write_document(conn: &Connection, collection: &str, id: &str, doc: &Document) -> Result<()> {
        let data = serde_json::to_string(doc)
            .map_err(|e| AppError::Internal(format!("Failed to encode document: {}", e)))?;

        conn.execute(
            "INSERT INTO documents (collection, id, data, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT (collection, id) DO UPDATE SET
                data = excluded.data,
                updated_at = excluded.updated_at",
            params![collection, id, data, chrono::Utc::now().timestamp_millis()],
        )
        .map_err(|e| AppError::Storage(format!("Failed to save document: {}", e)))?;
        Ok(())
    }

    fn decode(text: &str) -> Result<Document> {
        match serde_json::from_str::<Value>(text) {
            Ok(Value::Object(map)) => Ok(map),
            Ok(_) => Err(AppError::Storage("Stored document is not an object".into())),
            Err(e) => Err(AppError::Storage(format!("Corrupt document: {}", e))),
        }
    }

    /// Number of documents in a collection.
    pub fn count(&self, collection: &str) -> Result<usize> {
        let conn = self.conn.lock();
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM documents WHERE collection = ?1",
                params![collection],
                |row| row.get(0),
            )
            .map_err(|e| AppError::Storage(format!("Failed to count documents: {}", e)))?;
        Ok(count as usize)
    }
}

#[async_trait]
impl DocumentStore for SqliteDocumentStore {
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Document>> {
        let conn = self.conn.lock();
        Self::read_document(&conn, collection, id)
    }

    async fn set(
        &self,
        collection: &str,
        id: &str,
        data: Document,
        options: SetOptions,
    ) -> Result<()> {
        let conn = self.conn.lock();
        let existing = if options.merge {
            Self::read_document(&conn, collection, id)?
        } else {
            None
        };

        let doc = apply_set(existing, data, options, &self.clock);
        Self::write_document(&conn, collection, id, &doc)
    }

    async fn query(
        &self,
        collection: &str,
        filters: &[Filter],
        limit: Option<usize>,
    ) -> Result<Vec<(String, Document)>> {
        check_filters(filters)?;

        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare("SELECT id, data FROM documents WHERE collection = ?1 ORDER BY id")
            .map_err(|e| AppError::Storage(format!("Failed to prepare query: {}", e)))?;

        let rows = stmt
            .query_map(params![collection], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })
            .map_err(|e| AppError::Storage(format!("Failed to query documents: {}", e)))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| AppError::Storage(format!("Failed to collect documents: {}", e)))?;

        let mut matches = Vec::new();
        for (id, text) in rows {
            let doc = Self::decode(&text)?;
            if filters.iter().all(|f| f.matches(&doc)) {
                matches.push((id, doc));
                if limit.is_some_and(|max| matches.len() >= max) {
                    break;
                }
            }
        }

        Ok(matches)
    }

    async fn get_many(&self, collection: &str, ids: &[String]) -> Result<Vec<(String, Document)>> {
        check_batch(ids.len())?;

        let conn = self.conn.lock();
        let mut found = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(doc) = Self::read_document(&conn, collection, id)? {
                found.push((id.clone(), doc));
            }
        }
        Ok(found)
    }

    async fn increment(&self, collection: &str, id: &str, field: &str, by: i64) -> Result<()> {
        let conn = self.conn.lock();
        let mut doc = Self::read_document(&conn, collection, id)?.unwrap_or_default();

        let current = doc.get(field).and_then(Value::as_i64).unwrap_or(0);
        doc.insert(field.to_string(), Value::from(current + by));

        Self::write_document(&conn, collection, id, &doc)
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let rows = conn
            .execute(
                "DELETE FROM documents WHERE collection = ?1 AND id = ?2",
                params![collection, id],
            )
            .map_err(|e| AppError::Storage(format!("Failed to delete document: {}", e)))?;
        Ok(rows > 0)
    }
}
