//! File index storage
//!
//! Local record of what the replicated tree contained the last time it
//! was scanned or written: one row per live file with its content hash,
//! plus tombstones for deleted paths. The index is what manifests are
//! served from and what local edits and deletions are detected against.

use std::path::PathBuf;

use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::Mutex;

use crate::error::Result;
use crate::sync::wire::{FileRecord, FileTombstone};

pub struct FileIndex {
    conn: Mutex<Connection>,
}

impl FileIndex {
    pub fn new(path: PathBuf) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(&path)?;
        conn.pragma_update(None, "journal_mode", "wal")?;
        conn.busy_timeout(std::time::Duration::from_millis(5000))?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS files (
                path       TEXT PRIMARY KEY,
                size       INTEGER NOT NULL,
                mtime_ms   INTEGER NOT NULL,
                sha256     TEXT NOT NULL,
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            );
            CREATE TABLE IF NOT EXISTS file_tombstones (
                path          TEXT PRIMARY KEY,
                deleted_at_ms INTEGER NOT NULL
            );",
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub async fn upsert(&self, record: &FileRecord) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO files (path, size, mtime_ms, sha256, updated_at)
             VALUES (?1, ?2, ?3, ?4, datetime('now'))
             ON CONFLICT(path) DO UPDATE SET
                size = excluded.size,
                mtime_ms = excluded.mtime_ms,
                sha256 = excluded.sha256,
                updated_at = excluded.updated_at",
            params![record.path, record.size as i64, record.mtime_ms, record.sha256],
        )?;
        Ok(())
    }

    pub async fn get(&self, path: &str) -> Result<Option<FileRecord>> {
        let conn = self.conn.lock().await;
        let row = conn
            .query_row(
                "SELECT path, size, mtime_ms, sha256 FROM files WHERE path = ?1",
                params![path],
                |r| {
                    Ok(FileRecord {
                        path: r.get(0)?,
                        size: r.get::<_, i64>(1)? as u64,
                        mtime_ms: r.get(2)?,
                        sha256: r.get(3)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    pub async fn remove(&self, path: &str) -> Result<bool> {
        let conn = self.conn.lock().await;
        let n = conn.execute("DELETE FROM files WHERE path = ?1", params![path])?;
        Ok(n > 0)
    }

    /// Every live file, ordered by path
    pub async fn all(&self) -> Result<Vec<FileRecord>> {
        let conn = self.conn.lock().await;
        let mut stmt =
            conn.prepare("SELECT path, size, mtime_ms, sha256 FROM files ORDER BY path ASC")?;
        let rows = stmt.query_map([], |r| {
            Ok(FileRecord {
                path: r.get(0)?,
                size: r.get::<_, i64>(1)? as u64,
                mtime_ms: r.get(2)?,
                sha256: r.get(3)?,
            })
        })?;
        let mut files = Vec::new();
        for row in rows {
            files.push(row?);
        }
        Ok(files)
    }

    pub async fn file_count(&self) -> Result<i64> {
        let conn = self.conn.lock().await;
        let n = conn.query_row("SELECT COUNT(*) FROM files", [], |r| r.get(0))?;
        Ok(n)
    }

    /// Record a deletion. Tombstone times only move forward, so a replayed
    /// older deletion cannot shadow a newer one.
    pub async fn add_tombstone(&self, path: &str, deleted_at_ms: i64) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO file_tombstones (path, deleted_at_ms) VALUES (?1, ?2)
             ON CONFLICT(path) DO UPDATE SET
                deleted_at_ms = MAX(deleted_at_ms, excluded.deleted_at_ms)",
            params![path, deleted_at_ms],
        )?;
        Ok(())
    }

    pub async fn tombstone(&self, path: &str) -> Result<Option<i64>> {
        let conn = self.conn.lock().await;
        let row = conn
            .query_row(
                "SELECT deleted_at_ms FROM file_tombstones WHERE path = ?1",
                params![path],
                |r| r.get(0),
            )
            .optional()?;
        Ok(row)
    }

    pub async fn tombstones(&self) -> Result<Vec<FileTombstone>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare("SELECT path, deleted_at_ms FROM file_tombstones ORDER BY path ASC")?;
        let rows = stmt.query_map([], |r| {
            Ok(FileTombstone {
                path: r.get(0)?,
                deleted_at_ms: r.get(1)?,
            })
        })?;
        let mut tombstones = Vec::new();
        for row in rows {
            tombstones.push(row?);
        }
        Ok(tombstones)
    }

    /// Drop a tombstone that lost to a newer write
    pub async fn clear_tombstone(&self, path: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute("DELETE FROM file_tombstones WHERE path = ?1", params![path])?;
        Ok(())
    }

    /// Drop tombstones older than the cutoff. By then every peer has
    /// either seen the deletion or been rebuilt.
    pub async fn prune_tombstones(&self, cutoff_ms: i64) -> Result<usize> {
        let conn = self.conn.lock().await;
        let n = conn.execute(
            "DELETE FROM file_tombstones WHERE deleted_at_ms < ?1",
            params![cutoff_ms],
        )?;
        Ok(n)
    }
}
