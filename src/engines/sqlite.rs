use crate::traits::{
    ChunkReader, ChunkRecord, ChunkRequest, DocumentRequest, IndexCatalog, ModelIdentity,
};
use anyhow::anyhow;
use log::{debug, info};
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension};
use std::collections::HashMap;

/// Document and chunk counts held by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreStats {
    pub documents: i64,
    pub chunks: i64,
}

/// SQLite-backed metadata store: documents, their chunks keyed by embedding
/// id, the model identity record and the vector id bindings.
pub struct SqliteMetadataStore {
    db_path: String,
    conn: Mutex<Connection>,
}

impl SqliteMetadataStore {
    /// Opens the database at `db_path`. Call [`Self::create_tables`] before first use.
    pub fn new(db_path: &str) -> anyhow::Result<Self> {
        info!("Opening metadata store at: {}", db_path);
        let conn =
            Connection::open(db_path).map_err(|e| anyhow!("Failed to open database: {}", e))?;
        conn.pragma_update(None, "foreign_keys", 1)
            .map_err(|e| anyhow!("Failed to enable foreign keys: {}", e))?;
        Ok(SqliteMetadataStore {
            db_path: db_path.to_string(),
            conn: Mutex::new(conn),
        })
    }

    /// Creates the documents, chunks, vector binding and model identity tables.
    pub fn create_tables(&self) -> anyhow::Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "CREATE TABLE IF NOT EXISTS documents (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    source TEXT NOT NULL UNIQUE,
                    title TEXT NOT NULL,
                    contentType TEXT NOT NULL DEFAULT 'text',
                    metadata TEXT,
                    createdAt REAL NOT NULL,
                    updatedAt REAL NOT NULL
                )",
            [],
        )?;
        debug!("Created documents table if it did not exist.");

        conn.execute(
            "CREATE TABLE IF NOT EXISTS chunks (
                    embeddingId TEXT PRIMARY KEY,
                    documentId INTEGER NOT NULL,
                    chunkIndex INTEGER NOT NULL,
                    text TEXT NOT NULL,
                    contentType TEXT NOT NULL DEFAULT 'text',
                    metadata TEXT,
                    createdAt REAL NOT NULL,
                    FOREIGN KEY(documentId) REFERENCES documents(id)
                )",
            [],
        )?;
        debug!("Created chunks table if it did not exist.");

        conn.execute(
            "CREATE TABLE IF NOT EXISTS vector_bindings (
                    vectorId INTEGER PRIMARY KEY,
                    embeddingId TEXT NOT NULL
                )",
            [],
        )?;
        debug!("Created vector_bindings table if it did not exist.");

        conn.execute(
            "CREATE TABLE IF NOT EXISTS model_info (
                    id INTEGER PRIMARY KEY CHECK (id = 1),
                    modelName TEXT NOT NULL,
                    dimensions INTEGER NOT NULL,
                    modelVersion TEXT,
                    updatedAt REAL NOT NULL
                )",
            [],
        )?;
        debug!("Created model_info table if it did not exist.");
        Ok(())
    }

    /// Inserts a document, or updates title, content type and metadata of the
    /// document with the same source. Returns the document id.
    pub fn upsert_document(&self, request: &DocumentRequest) -> anyhow::Result<i64> {
        let metadata_str = encode_metadata(&request.metadata)?;
        let now = now_epoch_seconds();
        let conn = self.conn.lock();
        let id: i64 = conn
            .query_row(
                "INSERT INTO documents (source, title, contentType, metadata, createdAt, updatedAt)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?5)
                 ON CONFLICT(source) DO UPDATE SET
                    title = excluded.title,
                    contentType = excluded.contentType,
                    metadata = excluded.metadata,
                    updatedAt = excluded.updatedAt
                 RETURNING id",
                rusqlite::params![
                    request.source,
                    request.title,
                    request.content_type,
                    metadata_str,
                    now
                ],
                |row| row.get(0),
            )
            .map_err(|e| anyhow!("Failed to upsert document: {}", e))?;
        debug!("Upserted document {} with id: {}", request.source, id);
        Ok(id)
    }

    /// Stores a chunk under its embedding id, replacing an existing chunk with
    /// the same id.
    pub fn insert_chunk(&self, request: &ChunkRequest) -> anyhow::Result<()> {
        let metadata_str = encode_metadata(&request.metadata)?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO chunks (embeddingId, documentId, chunkIndex, text, contentType, metadata, createdAt)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            rusqlite::params![
                request.embedding_id,
                request.document_id,
                request.chunk_index,
                request.text,
                request.content_type,
                metadata_str,
                now_epoch_seconds()
            ],
        )
        .map_err(|e| anyhow!("Failed to insert chunk: {}", e))?;
        debug!(
            "Inserted chunk {} for document {}",
            request.embedding_id, request.document_id
        );
        Ok(())
    }

    /// Removes a document and its chunks by source. Vector bindings pointing
    /// at the removed chunks are left in place until the next rebuild.
    pub fn delete_document(&self, source: &str) -> anyhow::Result<()> {
        let conn = self.conn.lock();
        // Delete from child tables first to avoid foreign key constraint violations
        let chunks = conn
            .execute(
                "DELETE FROM chunks WHERE documentId IN (SELECT id FROM documents WHERE source = ?1)",
                rusqlite::params![source],
            )
            .map_err(|e| anyhow!("Failed to delete chunks: {}", e))?;
        let rows_affected = conn
            .execute(
                "DELETE FROM documents WHERE source = ?1",
                rusqlite::params![source],
            )
            .map_err(|e| anyhow!("Failed to delete document: {}", e))?;
        debug!(
            "Deleted document with source: {} ({} rows, {} chunks)",
            source, rows_affected, chunks
        );
        Ok(())
    }

    /// Refreshes the database connection to pick up external changes.
    pub fn refresh(&self) -> anyhow::Result<()> {
        let new_conn = Connection::open(&self.db_path)
            .map_err(|e| anyhow!("Failed to reopen database: {}", e))?;
        new_conn
            .pragma_update(None, "foreign_keys", 1)
            .map_err(|e| anyhow!("Failed to enable foreign keys: {}", e))?;
        let old_conn = std::mem::replace(&mut *self.conn.lock(), new_conn);
        old_conn
            .close()
            .map_err(|e| anyhow!("Failed to close database connection: {}", e.1))?;
        info!("Database connection refreshed for path: {:?}", self.db_path);
        Ok(())
    }

    /// Returns the number of documents and chunks currently stored.
    pub fn stats(&self) -> anyhow::Result<StoreStats> {
        let conn = self.conn.lock();
        let documents: i64 = conn.query_row("SELECT COUNT(*) FROM documents", [], |row| row.get(0))?;
        let chunks: i64 = conn.query_row("SELECT COUNT(*) FROM chunks", [], |row| row.get(0))?;
        info!("Metadata store holds {} documents, {} chunks", documents, chunks);
        Ok(StoreStats { documents, chunks })
    }
}

impl ChunkReader for SqliteMetadataStore {
    fn get_by_ids(&self, ids: &[String]) -> anyhow::Result<Vec<ChunkRecord>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = vec!["?"; ids.len()].join(", ");
        let sql = format!(
            "SELECT c.embeddingId, c.text, c.contentType, c.metadata, d.id, d.source, d.title
             FROM chunks c
             JOIN documents d ON c.documentId = d.id
             WHERE c.embeddingId IN ({})",
            placeholders
        );
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(&sql)
            .map_err(|e| anyhow!("Failed to prepare chunk lookup: {}", e))?;
        let rows = stmt
            .query_map(rusqlite::params_from_iter(ids.iter()), |row| {
                let metadata: Option<String> = row.get(3)?;
                Ok(ChunkRecord {
                    id: row.get(0)?,
                    text: row.get(1)?,
                    content_type: row.get(2)?,
                    metadata: metadata.and_then(|m| serde_json::from_str(&m).ok()),
                    document_id: row.get(4)?,
                    document_source: row.get(5)?,
                    document_title: row.get(6)?,
                })
            })
            .map_err(|e| anyhow!("Failed to query chunks: {}", e))?;

        let mut records = Vec::with_capacity(ids.len());
        for record in rows {
            records.push(record.map_err(|e| anyhow!("Failed to read chunk row: {}", e))?);
        }
        debug!("Resolved {} of {} chunk ids.", records.len(), ids.len());
        Ok(records)
    }
}

impl IndexCatalog for SqliteMetadataStore {
    fn model_identity(&self) -> anyhow::Result<Option<ModelIdentity>> {
        let conn = self.conn.lock();
        let identity = conn
            .query_row(
                "SELECT modelName, dimensions, modelVersion FROM model_info WHERE id = 1",
                [],
                |row| {
                    let dimensions: i64 = row.get(1)?;
                    Ok((
                        row.get::<_, String>(0)?,
                        dimensions,
                        row.get::<_, Option<String>>(2)?,
                    ))
                },
            )
            .optional()
            .map_err(|e| anyhow!("Failed to read model identity: {}", e))?;
        identity
            .map(|(model_name, dimensions, model_version)| {
                let dimensions = usize::try_from(dimensions)
                    .map_err(|_| anyhow!("Invalid stored dimensions: {}", dimensions))?;
                Ok(ModelIdentity {
                    model_name,
                    dimensions,
                    model_version,
                })
            })
            .transpose()
    }

    fn set_model_identity(&self, identity: &ModelIdentity) -> anyhow::Result<()> {
        let dimensions = i64::try_from(identity.dimensions)
            .map_err(|_| anyhow!("Dimensions out of range: {}", identity.dimensions))?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO model_info (id, modelName, dimensions, modelVersion, updatedAt)
             VALUES (1, ?1, ?2, ?3, ?4)
             ON CONFLICT(id) DO UPDATE SET
                modelName = excluded.modelName,
                dimensions = excluded.dimensions,
                modelVersion = excluded.modelVersion,
                updatedAt = excluded.updatedAt",
            rusqlite::params![
                identity.model_name,
                dimensions,
                identity.model_version,
                now_epoch_seconds()
            ],
        )
        .map_err(|e| anyhow!("Failed to write model identity: {}", e))?;
        info!(
            "Recorded model identity {} ({} dimensions)",
            identity.model_name, identity.dimensions
        );
        Ok(())
    }

    fn vector_bindings(&self) -> anyhow::Result<Vec<(u32, String)>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare("SELECT vectorId, embeddingId FROM vector_bindings ORDER BY vectorId")
            .map_err(|e| anyhow!("Failed to prepare binding query: {}", e))?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, u32>(0)?, row.get(1)?)))?;
        let mut bindings = Vec::new();
        for row in rows {
            bindings.push(row.map_err(|e| anyhow!("Failed to read binding row: {}", e))?);
        }
        Ok(bindings)
    }

    fn bind_vectors(&self, bindings: &[(u32, String)]) -> anyhow::Result<()> {
        if bindings.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT OR REPLACE INTO vector_bindings (vectorId, embeddingId) VALUES (?1, ?2)",
            )?;
            for (vector_id, embedding_id) in bindings {
                stmt.execute(rusqlite::params![vector_id, embedding_id])?;
            }
        }
        tx.commit()
            .map_err(|e| anyhow!("Failed to commit vector bindings: {}", e))?;
        debug!("Stored {} vector bindings", bindings.len());
        Ok(())
    }

    fn clear_vector_bindings(&self) -> anyhow::Result<()> {
        let conn = self.conn.lock();
        let rows = conn
            .execute("DELETE FROM vector_bindings", [])
            .map_err(|e| anyhow!("Failed to clear vector bindings: {}", e))?;
        debug!("Cleared {} vector bindings", rows);
        Ok(())
    }
}

fn encode_metadata(metadata: &Option<HashMap<String, String>>) -> anyhow::Result<Option<String>> {
    metadata
        .as_ref()
        .map(|m| {
            serde_json::to_string(m).map_err(|e| anyhow!("Failed to serialize metadata: {}", e))
        })
        .transpose()
}

fn now_epoch_seconds() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create_test_store() -> (SqliteMetadataStore, TempDir) {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let db_path = temp_dir.path().join("test.db");
        let store =
            SqliteMetadataStore::new(db_path.to_str().unwrap()).expect("Failed to create store");
        store.create_tables().expect("Failed to create tables");
        (store, temp_dir)
    }

    fn create_test_document(store: &SqliteMetadataStore, source: &str) -> i64 {
        store
            .upsert_document(&DocumentRequest {
                source: source.to_string(),
                title: format!("Title of {}", source),
                content_type: "text".to_string(),
                metadata: None,
            })
            .unwrap()
    }

    fn create_test_chunk(store: &SqliteMetadataStore, document_id: i64, embedding_id: &str, text: &str) {
        let mut metadata = HashMap::new();
        metadata.insert("lang".to_string(), "en".to_string());
        store
            .insert_chunk(&ChunkRequest {
                embedding_id: embedding_id.to_string(),
                document_id,
                chunk_index: 0,
                text: text.to_string(),
                content_type: "text".to_string(),
                metadata: Some(metadata),
            })
            .unwrap();
    }

    #[test]
    fn test_get_by_ids_joins_document() {
        let (store, _temp_dir) = create_test_store();
        let doc_id = create_test_document(&store, "notes/a.md");
        create_test_chunk(&store, doc_id, "emb-1", "first chunk");
        create_test_chunk(&store, doc_id, "emb-2", "second chunk");

        let mut records = store
            .get_by_ids(&["emb-2".to_string(), "emb-1".to_string(), "missing".to_string()])
            .unwrap();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].text, "first chunk");
        assert_eq!(records[0].document_id, doc_id);
        assert_eq!(records[0].document_source, "notes/a.md");
        assert_eq!(records[0].document_title, "Title of notes/a.md");
        assert_eq!(
            records[1].metadata.as_ref().and_then(|m| m.get("lang")).map(String::as_str),
            Some("en")
        );
    }

    #[test]
    fn test_get_by_ids_empty_input() {
        let (store, _temp_dir) = create_test_store();
        assert!(store.get_by_ids(&[]).unwrap().is_empty());
    }

    #[test]
    fn test_upsert_document_keeps_id() {
        let (store, _temp_dir) = create_test_store();
        let first = create_test_document(&store, "a.txt");
        let second = create_test_document(&store, "a.txt");
        assert_eq!(first, second);
        assert_eq!(store.stats().unwrap().documents, 1);
    }

    #[test]
    fn test_delete_document_removes_chunks() {
        let (store, _temp_dir) = create_test_store();
        let doc_id = create_test_document(&store, "a.txt");
        create_test_chunk(&store, doc_id, "emb-1", "text");
        store.delete_document("a.txt").unwrap();

        assert_eq!(store.stats().unwrap(), StoreStats { documents: 0, chunks: 0 });
        assert!(store.get_by_ids(&["emb-1".to_string()]).unwrap().is_empty());
        // Deleting non-existent document should not error
        assert!(store.delete_document("nonexistent.txt").is_ok());
    }

    #[test]
    fn test_model_identity_round_trip() {
        let (store, _temp_dir) = create_test_store();
        assert_eq!(store.model_identity().unwrap(), None);

        store.set_model_identity(&ModelIdentity::new("model-a", 384)).unwrap();
        let mut identity = ModelIdentity::new("model-b", 768);
        identity.model_version = Some("2".to_string());
        store.set_model_identity(&identity).unwrap();

        assert_eq!(store.model_identity().unwrap(), Some(identity));
    }

    #[test]
    fn test_vector_bindings() {
        let (store, _temp_dir) = create_test_store();
        store
            .bind_vectors(&[(1, "emb-1".to_string()), (0, "emb-0".to_string())])
            .unwrap();
        store.bind_vectors(&[(1, "emb-1b".to_string())]).unwrap();
        assert_eq!(
            store.vector_bindings().unwrap(),
            vec![(0, "emb-0".to_string()), (1, "emb-1b".to_string())]
        );

        store.clear_vector_bindings().unwrap();
        assert!(store.vector_bindings().unwrap().is_empty());
    }

    #[test]
    fn test_refresh_connection() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("test.db");
        let store = SqliteMetadataStore::new(db_path.to_str().unwrap()).unwrap();
        store.create_tables().unwrap();
        create_test_document(&store, "test1.txt");

        // Replace the database file with one holding different content
        {
            let temp_db_path = temp_dir.path().join("temp_test.db");
            let other = SqliteMetadataStore::new(temp_db_path.to_str().unwrap()).unwrap();
            other.create_tables().unwrap();
            create_test_document(&other, "test2.txt");
            create_test_document(&other, "test3.txt");
            drop(other);
            std::fs::rename(temp_db_path, &db_path).unwrap();
        }

        assert_eq!(store.stats().unwrap().documents, 1);
        store.refresh().unwrap();
        assert_eq!(store.stats().unwrap().documents, 2);
    }
}
