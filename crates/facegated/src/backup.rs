//! Durable local gallery backup in SQLite.
//!
//! Each write replaces the whole table inside one transaction, so the file
//! always holds a complete point-in-time copy of the gallery. Row order
//! preserves gallery insertion order.

use facegate_core::{Embedding, GallerySink, GallerySource, IdentityGallery, IdentityRecord};
use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::Mutex;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BackupError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("embedding encoding: {0}")]
    Json(#[from] serde_json::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS identities (
    position   INTEGER NOT NULL,
    key        TEXT PRIMARY KEY,
    id_real    TEXT NOT NULL,
    full_name  TEXT NOT NULL,
    embedding  TEXT NOT NULL
);";

pub struct SqliteBackup {
    conn: Mutex<Connection>,
}

impl SqliteBackup {
    /// Open (or create) the backup database at `path`.
    pub fn open(path: &Path) -> Result<Self, BackupError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA)?;
        tracing::info!(path = %path.display(), "backup database opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self, BackupError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open the backup at `path`, or an empty in-memory one if the file is
    /// unusable (corrupt, unreadable, or its directory cannot be created).
    ///
    /// The daemon keeps running without durability; the next successful
    /// remote load or enrollment repopulates the gallery.
    pub fn open_or_in_memory(path: &Path) -> Result<Self, BackupError> {
        match Self::open(path) {
            Ok(backup) => Ok(backup),
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "backup unusable, continuing with an in-memory backup"
                );
                Self::open_in_memory()
            }
        }
    }

    /// Dump `gallery` as it stands once the backup connection is held.
    ///
    /// Concurrent callers serialize on the connection, and each takes its
    /// snapshot after the previous dump committed, so the last dump written
    /// is never older than one written before it.
    pub fn write_gallery(&self, gallery: &IdentityGallery) -> Result<(), BackupError> {
        let mut conn = self.conn.lock().unwrap();
        let entries = gallery.entries();
        write_locked(&mut conn, &entries)
    }
}

fn write_locked(conn: &mut Connection, entries: &[(String, IdentityRecord)]) -> Result<(), BackupError> {
    let tx = conn.transaction()?;
    tx.execute("DELETE FROM identities", [])?;
    {
        let mut stmt = tx.prepare(
            "INSERT INTO identities (position, key, id_real, full_name, embedding)
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )?;
        for (position, (key, record)) in entries.iter().enumerate() {
            let embedding = serde_json::to_string(&record.embedding)?;
            stmt.execute(params![
                position as i64,
                key,
                record.id_real,
                record.full_name,
                embedding
            ])?;
        }
    }
    tx.commit()?;
    tracing::debug!(entries = entries.len(), "gallery backup written");
    Ok(())
}

impl GallerySource for SqliteBackup {
    type Error = BackupError;

    fn read_entries(&self) -> Result<Vec<(String, IdentityRecord)>, BackupError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt =
            conn.prepare("SELECT key, id_real, full_name, embedding FROM identities ORDER BY position")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?;

        let mut entries = Vec::new();
        for row in rows {
            let (key, id_real, full_name, embedding) = row?;
            let values: Vec<f32> = match serde_json::from_str(&embedding) {
                Ok(v) => v,
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "skipping unreadable backup row");
                    continue;
                }
            };
            entries.push((key, IdentityRecord::new(id_real, full_name, Embedding::new(values))));
        }
        Ok(entries)
    }
}

impl GallerySink for SqliteBackup {
    type Error = BackupError;

    fn write_entries(&self, entries: &[(String, IdentityRecord)]) -> Result<(), BackupError> {
        let mut conn = self.conn.lock().unwrap();
        write_locked(&mut conn, entries)
    }
}
