//! Sync Cursors
//!
//! Persistent per-peer progress markers. `pulled_to` is the highest origin
//! sequence of the peer's own changes that this node has applied;
//! `pushed_to` is the highest local origin sequence the peer has
//! acknowledged. Both advance monotonically and only after apply +
//! acknowledgement, so a crash replays work instead of skipping it. A
//! missing row means the peer has never been synced, which is what the
//! catch-up detector keys bootstrap off.

use std::path::PathBuf;

use rusqlite::{params, Connection};
use tokio::sync::Mutex;

use crate::error::{Error, Result};
use crate::ledger::ChangeId;

/// Cursor pair for one peer, keyed by the peer's server id. `floor` is
/// the origin sequence the first sync started from; nothing at or below
/// it is ever treated as missing.
#[derive(Debug, Clone)]
pub struct PeerCursor {
    pub peer_server_id: String,
    pub pulled_to: ChangeId,
    pub pushed_to: ChangeId,
    pub floor: ChangeId,
    pub updated_at: String,
}

/// Persistent cursor storage backed by SQLite
pub struct CursorStore {
    conn: Mutex<Connection>,
}

impl CursorStore {
    /// Create or open the cursor database
    pub fn new(path: PathBuf) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(&path)?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS sync_cursors (
                peer_server_id TEXT PRIMARY KEY,
                pulled_to INTEGER NOT NULL DEFAULT 0,
                pushed_to INTEGER NOT NULL DEFAULT 0,
                floor INTEGER NOT NULL DEFAULT 0,
                updated_at TEXT DEFAULT CURRENT_TIMESTAMP
            );
            "#,
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Highest origin sequence of this peer's changes applied locally.
    /// None means no cursor exists yet: the peer has never been synced.
    pub async fn pulled_to(&self, peer_server_id: &str) -> Result<Option<ChangeId>> {
        let conn = self.conn.lock().await;
        let result: std::result::Result<i64, _> = conn.query_row(
            "SELECT pulled_to FROM sync_cursors WHERE peer_server_id = ?1",
            params![peer_server_id],
            |row| row.get(0),
        );

        match result {
            Ok(id) => Ok(Some(id)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(Error::State(format!("Failed to read pull cursor: {}", e))),
        }
    }

    /// Highest local origin sequence this peer has acknowledged
    pub async fn pushed_to(&self, peer_server_id: &str) -> Result<Option<ChangeId>> {
        let conn = self.conn.lock().await;
        let result: std::result::Result<i64, _> = conn.query_row(
            "SELECT pushed_to FROM sync_cursors WHERE peer_server_id = ?1",
            params![peer_server_id],
            |row| row.get(0),
        );

        match result {
            Ok(id) => Ok(Some(id)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(Error::State(format!("Failed to read push cursor: {}", e))),
        }
    }

    /// Bootstrap floor for a peer, None when the peer has no cursor row
    pub async fn pull_floor(&self, peer_server_id: &str) -> Result<Option<ChangeId>> {
        let conn = self.conn.lock().await;
        let result: std::result::Result<i64, _> = conn.query_row(
            "SELECT floor FROM sync_cursors WHERE peer_server_id = ?1",
            params![peer_server_id],
            |row| row.get(0),
        );

        match result {
            Ok(id) => Ok(Some(id)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(Error::State(format!("Failed to read pull floor: {}", e))),
        }
    }

    /// Create the cursor row for a never-synced peer, starting both the
    /// pull cursor and the floor at `start`. A row already present wins.
    pub async fn init_bootstrap(&self, peer_server_id: &str, start: ChangeId) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT OR IGNORE INTO sync_cursors (peer_server_id, pulled_to, pushed_to, floor)
             VALUES (?1, ?2, 0, ?2)",
            params![peer_server_id, start],
        )?;
        Ok(())
    }

    /// Advance the pull cursor. Never moves backwards: an id at or below
    /// the stored value leaves the cursor unchanged.
    pub async fn advance_pulled(&self, peer_server_id: &str, id: ChangeId) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            r#"
            INSERT INTO sync_cursors (peer_server_id, pulled_to) VALUES (?1, ?2)
            ON CONFLICT(peer_server_id) DO UPDATE SET
                pulled_to = MAX(pulled_to, ?2),
                updated_at = CURRENT_TIMESTAMP
            "#,
            params![peer_server_id, id],
        )?;
        Ok(())
    }

    /// Advance the push cursor, same monotonic rule as the pull side
    pub async fn advance_pushed(&self, peer_server_id: &str, id: ChangeId) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            r#"
            INSERT INTO sync_cursors (peer_server_id, pushed_to) VALUES (?1, ?2)
            ON CONFLICT(peer_server_id) DO UPDATE SET
                pushed_to = MAX(pushed_to, ?2),
                updated_at = CURRENT_TIMESTAMP
            "#,
            params![peer_server_id, id],
        )?;
        Ok(())
    }

    /// Every cursor row, ordered by peer
    pub async fn all(&self) -> Result<Vec<PeerCursor>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT peer_server_id, pulled_to, pushed_to, floor, updated_at
             FROM sync_cursors ORDER BY peer_server_id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(PeerCursor {
                peer_server_id: row.get(0)?,
                pulled_to: row.get(1)?,
                pushed_to: row.get(2)?,
                floor: row.get(3)?,
                updated_at: row.get(4)?,
            })
        })?;

        let mut cursors = Vec::new();
        for result in rows {
            cursors.push(result?);
        }

        Ok(cursors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_missing_cursor_means_never_synced() {
        let dir = tempdir().unwrap();
        let store = CursorStore::new(dir.path().join("cursors.db")).unwrap();

        assert!(store.pulled_to("server-b").await.unwrap().is_none());
        assert!(store.pushed_to("server-b").await.unwrap().is_none());
        assert!(store.pull_floor("server-b").await.unwrap().is_none());

        store.advance_pulled("server-b", 10).await.unwrap();
        assert_eq!(store.pulled_to("server-b").await.unwrap(), Some(10));
        // Advancing one side creates the row, so the other side reads 0
        assert_eq!(store.pushed_to("server-b").await.unwrap(), Some(0));
    }

    #[tokio::test]
    async fn test_bootstrap_sets_floor_once() {
        let dir = tempdir().unwrap();
        let store = CursorStore::new(dir.path().join("cursors.db")).unwrap();

        store.init_bootstrap("server-b", 9500).await.unwrap();
        assert_eq!(store.pulled_to("server-b").await.unwrap(), Some(9500));
        assert_eq!(store.pull_floor("server-b").await.unwrap(), Some(9500));

        // A second bootstrap never rewrites an existing row
        store.init_bootstrap("server-b", 0).await.unwrap();
        assert_eq!(store.pull_floor("server-b").await.unwrap(), Some(9500));

        store.advance_pulled("server-b", 9600).await.unwrap();
        assert_eq!(store.pulled_to("server-b").await.unwrap(), Some(9600));
        assert_eq!(store.pull_floor("server-b").await.unwrap(), Some(9500));
    }

    #[tokio::test]
    async fn test_cursors_never_regress() {
        let dir = tempdir().unwrap();
        let store = CursorStore::new(dir.path().join("cursors.db")).unwrap();

        store.advance_pulled("server-b", 50).await.unwrap();
        store.advance_pulled("server-b", 30).await.unwrap();
        assert_eq!(store.pulled_to("server-b").await.unwrap(), Some(50));

        store.advance_pushed("server-b", 7).await.unwrap();
        store.advance_pushed("server-b", 7).await.unwrap();
        store.advance_pushed("server-b", 3).await.unwrap();
        assert_eq!(store.pushed_to("server-b").await.unwrap(), Some(7));
    }

    #[tokio::test]
    async fn test_cursors_survive_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cursors.db");

        {
            let store = CursorStore::new(path.clone()).unwrap();
            store.advance_pulled("server-b", 12).await.unwrap();
            store.advance_pushed("server-c", 4).await.unwrap();
        }

        let store = CursorStore::new(path).unwrap();
        assert_eq!(store.pulled_to("server-b").await.unwrap(), Some(12));
        assert_eq!(store.pushed_to("server-c").await.unwrap(), Some(4));

        let all = store.all().await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].peer_server_id, "server-b");
    }
}
