use std::path::Path;

use rusqlite::Connection;

use crate::error::StorageError;

/// One row of the `anime` table.
#[derive(Debug, Clone, PartialEq)]
pub struct PersistedRecord {
    pub id: i64,
    pub title_romaji: Option<String>,
    pub title_english: Option<String>,
    pub description: String,
    pub genres: Vec<String>,
    pub tags: Vec<String>,
    pub average_score: Option<i64>,
    pub studios: Vec<String>,
}

/// Where mapped records end up.
pub trait RecordStore {
    /// Insert-or-replace every record keyed by id, all or nothing.
    /// Returns the number of rows written.
    fn upsert_batch(&mut self, records: &[PersistedRecord]) -> Result<usize, StorageError>;
}

/// SQLite-backed store. The connection lives as long as the store and is
/// closed when it is dropped.
pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        let store = Self { conn };
        store.ensure_schema()?;
        Ok(store)
    }

    pub fn in_memory() -> Result<Self, StorageError> {
        let store = Self {
            conn: Connection::open_in_memory()?,
        };
        store.ensure_schema()?;
        Ok(store)
    }

    /// Create the table if it does not exist. Never touches existing columns.
    pub fn ensure_schema(&self) -> Result<(), StorageError> {
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS anime (
                id            INTEGER PRIMARY KEY,
                title_romaji  TEXT,
                title_english TEXT,
                description   TEXT,
                genres        TEXT,   -- JSON array
                tags          TEXT,   -- JSON array
                average_score INTEGER,
                studios       TEXT    -- JSON array, main studios only
            );
            ",
        )?;
        Ok(())
    }

    pub fn count_records(&self) -> Result<usize, StorageError> {
        let n: usize = self
            .conn
            .query_row("SELECT COUNT(*) FROM anime", [], |r| r.get(0))?;
        Ok(n)
    }

    #[cfg(test)]
    pub fn get(&self, id: i64) -> Result<Option<PersistedRecord>, StorageError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, title_romaji, title_english, description, genres, tags,
                    average_score, studios
             FROM anime WHERE id = ?1",
        )?;
        let mut rows = stmt.query(rusqlite::params![id])?;
        let Some(row) = rows.next()? else {
            return Ok(None);
        };

        let genres: String = row.get(4)?;
        let tags: String = row.get(5)?;
        let studios: String = row.get(7)?;
        Ok(Some(PersistedRecord {
            id: row.get(0)?,
            title_romaji: row.get(1)?,
            title_english: row.get(2)?,
            description: row.get::<_, Option<String>>(3)?.unwrap_or_default(),
            genres: serde_json::from_str(&genres)?,
            tags: serde_json::from_str(&tags)?,
            average_score: row.get(6)?,
            studios: serde_json::from_str(&studios)?,
        }))
    }
}

impl RecordStore for SqliteStore {
    fn upsert_batch(&mut self, records: &[PersistedRecord]) -> Result<usize, StorageError> {
        if records.is_empty() {
            return Ok(0);
        }

        let tx = self.conn.transaction()?;
        let mut count = 0;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO anime
                 (id, title_romaji, title_english, description, genres, tags, average_score, studios)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(id) DO UPDATE SET
                     title_romaji  = excluded.title_romaji,
                     title_english = excluded.title_english,
                     description   = excluded.description,
                     genres        = excluded.genres,
                     tags          = excluded.tags,
                     average_score = excluded.average_score,
                     studios       = excluded.studios",
            )?;
            for r in records {
                count += stmt.execute(rusqlite::params![
                    r.id,
                    r.title_romaji,
                    r.title_english,
                    r.description,
                    serde_json::to_string(&r.genres)?,
                    serde_json::to_string(&r.tags)?,
                    r.average_score,
                    serde_json::to_string(&r.studios)?,
                ])?;
            }
        }
        tx.commit()?;
        Ok(count)
    }
}
