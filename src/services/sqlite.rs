use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::{CollectionSchema, VectorRecord, VectorStore};
use crate::error::StorageError;
use crate::now_s;

/// Vector store backed by a single SQLite file.
///
/// Collections are rows in `collections`; records hold their scalar fields as
/// JSON and the vector as little-endian `f32` bytes. There is no similarity
/// search here, only durable append.
pub struct SqliteVectorStore {
    conn: Mutex<Connection>,
}

impl SqliteVectorStore {
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let conn = Connection::open(db_path)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.ensure_schema()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        let store = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
        };
        store.ensure_schema()?;
        Ok(store)
    }

    fn ensure_schema(&self) -> Result<(), StorageError> {
        self.lock().execute_batch(
            r#"
            PRAGMA journal_mode=WAL;

            CREATE TABLE IF NOT EXISTS collections (
              name TEXT PRIMARY KEY,
              vector_field TEXT NOT NULL,
              dimension INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS records (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              collection TEXT NOT NULL REFERENCES collections(name),
              created_at INTEGER NOT NULL,
              fields_json TEXT NOT NULL,
              vector BLOB NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_records_collection ON records(collection);
            "#,
        )?;
        Ok(())
    }

    pub fn count(&self, collection: &str) -> Result<u64, StorageError> {
        let count: i64 = self.lock().query_row(
            "SELECT COUNT(*) FROM records WHERE collection = ?1",
            params![collection],
            |row| row.get(0),
        )?;
        Ok(count.max(0) as u64)
    }

    /// Vectors of a collection in insertion order.
    pub fn vectors(&self, collection: &str) -> Result<Vec<Vec<f32>>, StorageError> {
        let conn = self.lock();
        let mut stmt =
            conn.prepare("SELECT vector FROM records WHERE collection = ?1 ORDER BY id ASC")?;
        let mut rows = stmt.query(params![collection])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let bytes: Vec<u8> = row.get(0)?;
            out.push(decode_vector(&bytes));
        }
        Ok(out)
    }

    fn dimension_of(conn: &Connection, collection: &str) -> Result<Option<usize>, StorageError> {
        let dimension: Option<i64> = conn
            .query_row(
                "SELECT dimension FROM collections WHERE name = ?1",
                params![collection],
                |row| row.get(0),
            )
            .optional()?;
        Ok(dimension.map(|d| d.max(0) as usize))
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl VectorStore for SqliteVectorStore {
    fn ensure_collection(&self, schema: &CollectionSchema) -> Result<(), StorageError> {
        let conn = self.lock();
        match Self::dimension_of(&conn, &schema.name)? {
            Some(existing) if existing != schema.dimension => Err(StorageError::Dimension {
                collection: schema.name.clone(),
                expected: existing,
                actual: schema.dimension,
            }),
            Some(_) => Ok(()),
            None => {
                conn.execute(
                    "INSERT INTO collections(name, vector_field, dimension) VALUES (?1, ?2, ?3)",
                    params![schema.name, schema.vector_field, schema.dimension as i64],
                )?;
                log::info!(
                    "created collection {} ({} dims)",
                    schema.name,
                    schema.dimension
                );
                Ok(())
            }
        }
    }

    fn insert(&self, collection: &str, record: VectorRecord) -> Result<(), StorageError> {
        let conn = self.lock();
        let dimension = Self::dimension_of(&conn, collection)?
            .ok_or_else(|| StorageError::UnknownCollection(collection.to_string()))?;
        if record.vector.len() != dimension {
            return Err(StorageError::Dimension {
                collection: collection.to_string(),
                expected: dimension,
                actual: record.vector.len(),
            });
        }
        let fields_json = serde_json::to_string(&record.fields)?;
        conn.execute(
            r#"
            INSERT INTO records(collection, created_at, fields_json, vector)
            VALUES (?1, ?2, ?3, ?4)
            "#,
            params![
                collection,
                now_s(),
                fields_json,
                encode_vector(&record.vector)
            ],
        )?;
        Ok(())
    }
}

fn encode_vector(vector: &[f32]) -> Vec<u8> {
    vector.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn decode_vector(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}
