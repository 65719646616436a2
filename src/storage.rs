//! Local face capture storage.
//!
//! Faces wait in a single `SQLite` table until the sync task forwards them
//! and deletes the rows.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use rusqlite::{params, params_from_iter, Connection};
use tracing::{debug, info};

use crate::error::{Error, Result};

const CREATE_CAPTURES_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS captures (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    date TEXT NOT NULL,
    time TEXT NOT NULL,
    image_base64 TEXT NOT NULL
)
";

/// A face waiting to be synced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredCapture {
    pub id: i64,
    /// `%Y-%m-%d`, local time
    pub date: String,
    /// `%H:%M:%S`, local time
    pub time: String,
    /// Base64 of the JPEG thumbnail
    pub image_base64: String,
}

#[derive(Debug)]
pub struct Storage {
    path: PathBuf,
    conn: Connection,
}

impl Storage {
    /// Open or create the database, creating parent directories as needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or the schema
    /// cannot be created.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|source| Error::DirectoryCreate {
                    path: parent.to_path_buf(),
                    source,
                })?;
            }
        }

        debug!("Opening database at {}", path.display());
        let conn = Connection::open(&path).map_err(|source| Error::DatabaseOpen {
            path: path.clone(),
            source,
        })?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        conn.execute(CREATE_CAPTURES_TABLE, [])?;

        info!("Database ready at {}", path.display());
        Ok(Self { path, conn })
    }

    /// In-memory database for tests.
    ///
    /// # Errors
    ///
    /// Returns an error if `SQLite` cannot create the database.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|source| Error::DatabaseOpen {
            path: PathBuf::from(":memory:"),
            source,
        })?;
        conn.execute(CREATE_CAPTURES_TABLE, [])?;

        Ok(Self {
            path: PathBuf::from(":memory:"),
            conn,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Store a face taken at `at`. Returns the new row id.
    ///
    /// # Errors
    ///
    /// Returns an error if the insert fails.
    pub fn insert(&self, image_base64: &str, at: DateTime<Local>) -> Result<i64> {
        let date = at.format("%Y-%m-%d").to_string();
        let time = at.format("%H:%M:%S").to_string();

        self.conn.execute(
            "INSERT INTO captures (date, time, image_base64) VALUES (?1, ?2, ?3)",
            params![date, time, image_base64],
        )?;

        let id = self.conn.last_insert_rowid();
        debug!("Stored capture {} ({} {})", id, date, time);
        Ok(id)
    }

    /// Oldest captures first, at most `limit`.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn fetch_pending(&self, limit: usize) -> Result<Vec<StoredCapture>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, date, time, image_base64 FROM captures ORDER BY id ASC LIMIT ?1",
        )?;

        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = stmt
            .query_map([limit], |row| {
                Ok(StoredCapture {
                    id: row.get(0)?,
                    date: row.get(1)?,
                    time: row.get(2)?,
                    image_base64: row.get(3)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(rows)
    }

    /// Delete captures by id. Returns the number of rows removed.
    ///
    /// # Errors
    ///
    /// Returns an error if the delete fails.
    pub fn delete(&self, ids: &[i64]) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }

        let placeholders = vec!["?"; ids.len()].join(",");
        let sql = format!("DELETE FROM captures WHERE id IN ({placeholders})");
        let deleted = self.conn.execute(&sql, params_from_iter(ids.iter()))?;
        Ok(deleted)
    }

    /// Number of captures waiting to be synced.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn count(&self) -> Result<i64> {
        let count = self
            .conn
            .query_row("SELECT COUNT(*) FROM captures", [], |row| row.get(0))?;
        Ok(count)
    }
}
