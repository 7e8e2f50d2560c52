//! Change ledger storage
//!
//! Durable, append-only history of every mutation this node has captured
//! or applied, backed by SQLite. Local-origin records are what the node
//! exports to peers; remote-origin records are kept as history so a full
//! audit trail (including conflict losers) survives on every node that
//! saw the change.

use std::path::Path;

use rusqlite::{params, Connection};
use tokio::sync::Mutex;

use crate::clock::HlcStamp;
use crate::error::Result;
use crate::ledger::entry::{ChangeId, ChangeRecord, Operation};

/// A ledger row: the record plus its local disposition. `applied` is
/// false only for conflict losers whose effect was suppressed.
#[derive(Debug, Clone)]
pub struct LedgerEntry {
    pub record: ChangeRecord,
    pub applied: bool,
}

/// Append-only change ledger backed by SQLite
pub struct ChangeLedger {
    conn: Mutex<Connection>,
    server_id: String,
}

impl ChangeLedger {
    /// Create or open the ledger database
    pub fn new(db_path: &Path, server_id: &str) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(db_path)?;
        conn.pragma_update(None, "journal_mode", "wal")?;
        conn.busy_timeout(std::time::Duration::from_millis(5000))?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS change_log (
                id               INTEGER PRIMARY KEY,
                table_name       TEXT NOT NULL,
                record_key       TEXT NOT NULL,
                operation        TEXT NOT NULL,
                payload          TEXT,
                origin_server_id TEXT NOT NULL,
                origin_change_id INTEGER NOT NULL,
                created_at_ms    INTEGER NOT NULL,
                logical          INTEGER NOT NULL DEFAULT 0,
                applied          INTEGER NOT NULL DEFAULT 1,
                recorded_at      TEXT NOT NULL DEFAULT (datetime('now'))
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_change_identity
                ON change_log(origin_server_id, origin_change_id);
            CREATE INDEX IF NOT EXISTS idx_change_key
                ON change_log(table_name, record_key);
            CREATE TABLE IF NOT EXISTS change_deliveries (
                change_id    INTEGER NOT NULL,
                peer_id      TEXT NOT NULL,
                delivered_at TEXT NOT NULL DEFAULT (datetime('now')),
                PRIMARY KEY (change_id, peer_id)
            );",
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
            server_id: server_id.to_string(),
        })
    }

    /// The server id this ledger stamps on captured records
    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    /// Append a locally captured mutation. Assigns the next ledger id and
    /// the next origin sequence number; the record's global identity is
    /// (self, origin sequence). Origin sequences are dense per origin,
    /// which is what lets peers compute exact missing sets.
    pub async fn append(
        &self,
        table_name: &str,
        record_key: &str,
        operation: Operation,
        payload: Option<serde_json::Value>,
        stamp: HlcStamp,
    ) -> Result<ChangeRecord> {
        let conn = self.conn.lock().await;
        let next_id: i64 =
            conn.query_row("SELECT COALESCE(MAX(id), 0) + 1 FROM change_log", [], |r| {
                r.get(0)
            })?;
        let next_seq: i64 = conn.query_row(
            "SELECT COALESCE(MAX(origin_change_id), 0) + 1 FROM change_log
             WHERE origin_server_id = ?1",
            params![self.server_id],
            |r| r.get(0),
        )?;

        let payload_text = match &payload {
            Some(value) => Some(serde_json::to_string(value)?),
            None => None,
        };

        conn.execute(
            "INSERT INTO change_log
                (id, table_name, record_key, operation, payload,
                 origin_server_id, origin_change_id, created_at_ms, logical, applied)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 1)",
            params![
                next_id,
                table_name,
                record_key,
                operation.as_str(),
                payload_text,
                self.server_id,
                next_seq,
                stamp.physical_ms,
                stamp.logical,
            ],
        )?;

        Ok(ChangeRecord {
            id: next_id,
            table_name: table_name.to_string(),
            record_key: record_key.to_string(),
            operation,
            payload,
            origin_server_id: self.server_id.clone(),
            origin_change_id: next_seq,
            created_at_ms: stamp.physical_ms,
            logical: stamp.logical,
        })
    }

    /// Record a change received from a peer. Returns false when the
    /// record was already in history (replay) or originated here (echo).
    /// `applied` marks whether its effect reached the application store;
    /// conflict losers are recorded with `applied = false`.
    pub async fn record_remote(&self, record: &ChangeRecord, applied: bool) -> Result<bool> {
        if record.origin_server_id == self.server_id {
            return Ok(false);
        }

        let conn = self.conn.lock().await;
        let next_id: i64 =
            conn.query_row("SELECT COALESCE(MAX(id), 0) + 1 FROM change_log", [], |r| {
                r.get(0)
            })?;

        let payload_text = match &record.payload {
            Some(value) => Some(serde_json::to_string(value)?),
            None => None,
        };

        let inserted = conn.execute(
            "INSERT OR IGNORE INTO change_log
                (id, table_name, record_key, operation, payload,
                 origin_server_id, origin_change_id, created_at_ms, logical, applied)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                next_id,
                record.table_name,
                record.record_key,
                record.operation.as_str(),
                payload_text,
                record.origin_server_id,
                record.origin_change_id,
                record.created_at_ms,
                record.logical,
                applied as i64,
            ],
        )?;

        Ok(inserted == 1)
    }

    /// Local-origin records with origin sequence > cursor, oldest first.
    /// `limit = 0` means no cap (catch-up passes).
    pub async fn changes_since(&self, cursor: ChangeId, limit: u32) -> Result<Vec<ChangeRecord>> {
        let conn = self.conn.lock().await;
        let cap: i64 = if limit == 0 { -1 } else { limit as i64 };

        let mut stmt = conn.prepare(
            "SELECT id, table_name, record_key, operation, payload,
                    origin_server_id, origin_change_id, created_at_ms, logical, applied
             FROM change_log
             WHERE origin_server_id = ?1 AND origin_change_id > ?2
             ORDER BY origin_change_id ASC
             LIMIT ?3",
        )?;

        let rows = stmt.query_map(params![self.server_id, cursor, cap], row_to_entry)?;
        let mut records = Vec::new();
        for row in rows {
            records.push(row?.record);
        }
        Ok(records)
    }

    /// Highest origin sequence this node has produced, 0 when none. This
    /// is the `server_max_id` peers page against.
    pub async fn export_head(&self) -> Result<ChangeId> {
        let conn = self.conn.lock().await;
        let id = conn.query_row(
            "SELECT COALESCE(MAX(origin_change_id), 0) FROM change_log
             WHERE origin_server_id = ?1",
            params![self.server_id],
            |r| r.get(0),
        )?;
        Ok(id)
    }

    /// Highest ledger id including remote history rows
    pub async fn max_id(&self) -> Result<ChangeId> {
        let conn = self.conn.lock().await;
        let id = conn.query_row("SELECT COALESCE(MAX(id), 0) FROM change_log", [], |r| {
            r.get(0)
        })?;
        Ok(id)
    }

    /// Total history rows
    pub async fn count(&self) -> Result<i64> {
        let conn = self.conn.lock().await;
        let n = conn.query_row("SELECT COUNT(*) FROM change_log", [], |r| r.get(0))?;
        Ok(n)
    }

    /// Exact number of local-origin records past a cursor
    pub async fn pending_count(&self, cursor: ChangeId) -> Result<i64> {
        let conn = self.conn.lock().await;
        let n = conn.query_row(
            "SELECT COUNT(*) FROM change_log
             WHERE origin_server_id = ?1 AND origin_change_id > ?2",
            params![self.server_id, cursor],
            |r| r.get(0),
        )?;
        Ok(n)
    }

    /// Exact list of an origin's sequence numbers in (floor, head] that
    /// are absent from local history. Sequences are dense per origin, so
    /// every gap is a real missing change.
    pub async fn missing_origin_ids(
        &self,
        origin_server_id: &str,
        floor: ChangeId,
        head: ChangeId,
    ) -> Result<Vec<ChangeId>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT origin_change_id FROM change_log
             WHERE origin_server_id = ?1
               AND origin_change_id > ?2 AND origin_change_id <= ?3
             ORDER BY origin_change_id ASC",
        )?;
        let rows = stmt.query_map(params![origin_server_id, floor, head], |r| {
            r.get::<_, i64>(0)
        })?;

        let mut missing = Vec::new();
        let mut expected = floor + 1;
        for row in rows {
            let known = row?;
            while expected < known {
                missing.push(expected);
                expected += 1;
            }
            expected = known + 1;
        }
        while expected <= head {
            missing.push(expected);
            expected += 1;
        }
        Ok(missing)
    }

    /// Count of an origin's sequences in (floor, head] present locally
    pub async fn known_origin_count(
        &self,
        origin_server_id: &str,
        floor: ChangeId,
        head: ChangeId,
    ) -> Result<i64> {
        let conn = self.conn.lock().await;
        let n = conn.query_row(
            "SELECT COUNT(*) FROM change_log
             WHERE origin_server_id = ?1
               AND origin_change_id > ?2 AND origin_change_id <= ?3",
            params![origin_server_id, floor, head],
            |r| r.get(0),
        )?;
        Ok(n)
    }

    /// Record that a peer has acknowledged applying a change. Idempotent.
    pub async fn mark_synced(&self, change_id: ChangeId, peer_id: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT OR IGNORE INTO change_deliveries (change_id, peer_id) VALUES (?1, ?2)",
            params![change_id, peer_id],
        )?;
        Ok(())
    }

    /// Mark a whole acknowledged batch in one transaction
    pub async fn mark_synced_batch(&self, change_ids: &[ChangeId], peer_id: &str) -> Result<()> {
        if change_ids.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        for id in change_ids {
            tx.execute(
                "INSERT OR IGNORE INTO change_deliveries (change_id, peer_id) VALUES (?1, ?2)",
                params![id, peer_id],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Peers that have acknowledged a change
    pub async fn synced_peers(&self, change_id: ChangeId) -> Result<Vec<String>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT peer_id FROM change_deliveries WHERE change_id = ?1 ORDER BY peer_id",
        )?;
        let rows = stmt.query_map(params![change_id], |r| r.get::<_, String>(0))?;
        let mut peers = Vec::new();
        for row in rows {
            peers.push(row?);
        }
        Ok(peers)
    }

    /// Local-origin records not yet acknowledged by every peer in
    /// `peer_ids`. Records covered by all of them are retired from active
    /// retry (they stay in history).
    pub async fn unsynced_count(&self, peer_ids: &[String]) -> Result<i64> {
        if peer_ids.is_empty() {
            return Ok(0);
        }
        let conn = self.conn.lock().await;
        let placeholders = vec!["?"; peer_ids.len()].join(", ");
        let sql = format!(
            "SELECT COUNT(*) FROM change_log c
             WHERE c.origin_server_id = ?
               AND (SELECT COUNT(*) FROM change_deliveries d
                    WHERE d.change_id = c.id AND d.peer_id IN ({placeholders})) < ?"
        );

        let required = peer_ids.len() as i64;
        let mut values: Vec<&dyn rusqlite::ToSql> = Vec::with_capacity(peer_ids.len() + 2);
        values.push(&self.server_id);
        for peer in peer_ids {
            values.push(peer);
        }
        values.push(&required);

        let n = conn.query_row(&sql, values.as_slice(), |r| r.get(0))?;
        Ok(n)
    }

    /// Most recent clock stamp recorded for a (table, key) pair, with the
    /// origin that produced it. Conflict resolution compares candidates
    /// against this.
    pub async fn latest_stamp_for_key(
        &self,
        table_name: &str,
        record_key: &str,
    ) -> Result<Option<(HlcStamp, String)>> {
        let conn = self.conn.lock().await;
        let result = conn.query_row(
            "SELECT created_at_ms, logical, origin_server_id
             FROM change_log
             WHERE table_name = ?1 AND record_key = ?2
             ORDER BY created_at_ms DESC, logical DESC, origin_server_id DESC
             LIMIT 1",
            params![table_name, record_key],
            |r| {
                Ok((
                    HlcStamp::new(r.get::<_, i64>(0)?, r.get::<_, u32>(1)?),
                    r.get::<_, String>(2)?,
                ))
            },
        );
        match result {
            Ok(found) => Ok(Some(found)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Full audit trail for a record, oldest first
    pub async fn history_for_key(
        &self,
        table_name: &str,
        record_key: &str,
    ) -> Result<Vec<LedgerEntry>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, table_name, record_key, operation, payload,
                    origin_server_id, origin_change_id, created_at_ms, logical, applied
             FROM change_log
             WHERE table_name = ?1 AND record_key = ?2
             ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(params![table_name, record_key], row_to_entry)?;
        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?);
        }
        Ok(entries)
    }

    /// Whether a change with this global identity is already in history
    pub async fn contains(&self, origin_server_id: &str, origin_change_id: ChangeId) -> Result<bool> {
        let conn = self.conn.lock().await;
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM change_log
             WHERE origin_server_id = ?1 AND origin_change_id = ?2",
            params![origin_server_id, origin_change_id],
            |r| r.get(0),
        )?;
        Ok(n > 0)
    }
}

fn row_to_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<LedgerEntry> {
    let operation_text: String = row.get(3)?;
    let operation = Operation::parse(&operation_text).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            3,
            rusqlite::types::Type::Text,
            format!("unknown operation {operation_text:?}").into(),
        )
    })?;

    let payload_text: Option<String> = row.get(4)?;
    let payload = match payload_text {
        Some(text) => Some(serde_json::from_str(&text).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                4,
                rusqlite::types::Type::Text,
                Box::new(e),
            )
        })?),
        None => None,
    };

    Ok(LedgerEntry {
        record: ChangeRecord {
            id: row.get(0)?,
            table_name: row.get(1)?,
            record_key: row.get(2)?,
            operation,
            payload,
            origin_server_id: row.get(5)?,
            origin_change_id: row.get(6)?,
            created_at_ms: row.get(7)?,
            logical: row.get(8)?,
        },
        applied: row.get::<_, i64>(9)? != 0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    async fn ledger(dir: &std::path::Path) -> ChangeLedger {
        ChangeLedger::new(&dir.join("ledger.db"), "server-a").unwrap()
    }

    fn remote(id: ChangeId, key: &str, ms: i64) -> ChangeRecord {
        ChangeRecord {
            id,
            table_name: "teams".to_string(),
            record_key: key.to_string(),
            operation: Operation::Update,
            payload: Some(json!({"id": key, "score": ms})),
            origin_server_id: "server-b".to_string(),
            origin_change_id: id,
            created_at_ms: ms,
            logical: 0,
        }
    }

    #[tokio::test]
    async fn test_append_assigns_sequential_ids() {
        let dir = tempdir().unwrap();
        let ledger = ledger(dir.path()).await;

        let a = ledger
            .append("teams", "254", Operation::Insert, Some(json!({"id": "254"})), HlcStamp::new(10, 0))
            .await
            .unwrap();
        let b = ledger
            .append("teams", "1114", Operation::Insert, Some(json!({"id": "1114"})), HlcStamp::new(11, 0))
            .await
            .unwrap();

        assert_eq!(a.id, 1);
        assert_eq!(b.id, 2);
        assert_eq!(a.origin_change_id, a.id);
        assert_eq!(a.origin_server_id, "server-a");
        assert_eq!(ledger.export_head().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_origin_sequence_stays_dense_across_remote_rows() {
        let dir = tempdir().unwrap();
        let ledger = ledger(dir.path()).await;

        ledger
            .append("teams", "254", Operation::Insert, Some(json!({"id": "254"})), HlcStamp::new(1, 0))
            .await
            .unwrap();
        // A remote row consumes a ledger id but not a local sequence
        ledger.record_remote(&remote(1, "x", 2), true).await.unwrap();
        let second = ledger
            .append("teams", "1114", Operation::Insert, Some(json!({"id": "1114"})), HlcStamp::new(3, 0))
            .await
            .unwrap();

        assert_eq!(second.id, 3);
        assert_eq!(second.origin_change_id, 2);
        assert_eq!(ledger.export_head().await.unwrap(), 2);
        assert!(ledger.contains("server-b", 1).await.unwrap());

        let exported = ledger.changes_since(0, 0).await.unwrap();
        let seqs: Vec<i64> = exported.iter().map(|r| r.origin_change_id).collect();
        assert_eq!(seqs, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_changes_since_orders_and_limits() {
        let dir = tempdir().unwrap();
        let ledger = ledger(dir.path()).await;

        for i in 0..5 {
            ledger
                .append("m", &format!("k{i}"), Operation::Update, Some(json!({"v": i})), HlcStamp::new(100 + i, 0))
                .await
                .unwrap();
        }

        let all = ledger.changes_since(0, 0).await.unwrap();
        assert_eq!(all.len(), 5);
        assert!(all.windows(2).all(|w| w[0].id < w[1].id));

        let tail = ledger.changes_since(3, 0).await.unwrap();
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].id, 4);

        let capped = ledger.changes_since(0, 2).await.unwrap();
        assert_eq!(capped.len(), 2);
    }

    #[tokio::test]
    async fn test_record_remote_is_idempotent_and_not_exported() {
        let dir = tempdir().unwrap();
        let ledger = ledger(dir.path()).await;

        let rec = remote(7, "254", 1000);
        assert!(ledger.record_remote(&rec, true).await.unwrap());
        // Replayed delivery is absorbed
        assert!(!ledger.record_remote(&rec, true).await.unwrap());
        assert!(ledger.contains("server-b", 7).await.unwrap());

        // Remote history never leaves through the export path
        assert!(ledger.changes_since(0, 0).await.unwrap().is_empty());
        assert_eq!(ledger.export_head().await.unwrap(), 0);
        assert_eq!(ledger.max_id().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_missing_origin_ids_exact() {
        let dir = tempdir().unwrap();
        let ledger = ledger(dir.path()).await;

        // Peer produced 1..=8; we only ever saw 2, 3 and 6
        for seq in [2, 3, 6] {
            ledger
                .record_remote(&remote(seq, &format!("k{seq}"), seq * 10), true)
                .await
                .unwrap();
        }

        let missing = ledger.missing_origin_ids("server-b", 0, 8).await.unwrap();
        assert_eq!(missing, vec![1, 4, 5, 7, 8]);
        assert_eq!(ledger.known_origin_count("server-b", 0, 8).await.unwrap(), 3);

        // A bootstrap floor hides everything at or below it
        let missing = ledger.missing_origin_ids("server-b", 3, 8).await.unwrap();
        assert_eq!(missing, vec![4, 5, 7, 8]);

        // Fully caught up
        ledger.record_remote(&remote(1, "k1", 10), true).await.unwrap();
        for seq in [4, 5, 7, 8] {
            ledger
                .record_remote(&remote(seq, &format!("k{seq}"), seq * 10), true)
                .await
                .unwrap();
        }
        assert!(ledger.missing_origin_ids("server-b", 0, 8).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_record_remote_rejects_echo() {
        let dir = tempdir().unwrap();
        let ledger = ledger(dir.path()).await;

        let ours = ledger
            .append("teams", "254", Operation::Insert, Some(json!({"id": "254"})), HlcStamp::new(5, 0))
            .await
            .unwrap();
        // The same record coming back from a peer must not duplicate
        assert!(!ledger.record_remote(&ours, true).await.unwrap());
        assert_eq!(ledger.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_mark_synced_idempotent_and_unsynced_count() {
        let dir = tempdir().unwrap();
        let ledger = ledger(dir.path()).await;
        let peers = vec!["server-b".to_string(), "server-c".to_string()];

        let rec = ledger
            .append("teams", "254", Operation::Insert, Some(json!({"id": "254"})), HlcStamp::new(5, 0))
            .await
            .unwrap();

        assert_eq!(ledger.unsynced_count(&peers).await.unwrap(), 1);

        ledger.mark_synced(rec.id, "server-b").await.unwrap();
        ledger.mark_synced(rec.id, "server-b").await.unwrap();
        assert_eq!(ledger.synced_peers(rec.id).await.unwrap(), vec!["server-b"]);
        assert_eq!(ledger.unsynced_count(&peers).await.unwrap(), 1);

        ledger.mark_synced(rec.id, "server-c").await.unwrap();
        assert_eq!(ledger.unsynced_count(&peers).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_pending_count_exact() {
        let dir = tempdir().unwrap();
        let ledger = ledger(dir.path()).await;

        for i in 0..10 {
            ledger
                .append("m", &format!("k{i}"), Operation::Update, Some(json!({"v": i})), HlcStamp::new(i, 0))
                .await
                .unwrap();
        }
        assert_eq!(ledger.pending_count(0).await.unwrap(), 10);
        assert_eq!(ledger.pending_count(7).await.unwrap(), 3);
        assert_eq!(ledger.pending_count(10).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_delete_then_recreate_stays_two_records() {
        let dir = tempdir().unwrap();
        let ledger = ledger(dir.path()).await;

        ledger
            .append("teams", "254", Operation::Delete, None, HlcStamp::new(50, 0))
            .await
            .unwrap();
        ledger
            .append("teams", "254", Operation::Insert, Some(json!({"id": "254"})), HlcStamp::new(60, 0))
            .await
            .unwrap();

        let history = ledger.history_for_key("teams", "254").await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].record.operation, Operation::Delete);
        assert_eq!(history[1].record.operation, Operation::Insert);
    }

    #[tokio::test]
    async fn test_latest_stamp_and_loser_history() {
        let dir = tempdir().unwrap();
        let ledger = ledger(dir.path()).await;

        ledger
            .append("teams", "254", Operation::Update, Some(json!({"v": 1})), HlcStamp::new(2000, 0))
            .await
            .unwrap();

        // An older remote change loses but stays in history, unapplied
        let loser = remote(3, "254", 1000);
        ledger.record_remote(&loser, false).await.unwrap();

        let (stamp, origin) = ledger
            .latest_stamp_for_key("teams", "254")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stamp, HlcStamp::new(2000, 0));
        assert_eq!(origin, "server-a");

        let history = ledger.history_for_key("teams", "254").await.unwrap();
        assert_eq!(history.len(), 2);
        let unapplied: Vec<_> = history.iter().filter(|e| !e.applied).collect();
        assert_eq!(unapplied.len(), 1);
        assert_eq!(unapplied[0].record.origin_server_id, "server-b");
    }

    #[tokio::test]
    async fn test_reopen_preserves_sequence() {
        let dir = tempdir().unwrap();
        {
            let ledger = ledger(dir.path()).await;
            for i in 0..3 {
                ledger
                    .append("m", &format!("k{i}"), Operation::Update, Some(json!({})), HlcStamp::new(i, 0))
                    .await
                    .unwrap();
            }
        }

        let reopened = ledger(dir.path()).await;
        let next = reopened
            .append("m", "k9", Operation::Update, Some(json!({})), HlcStamp::new(9, 0))
            .await
            .unwrap();
        assert_eq!(next.id, 4);
    }
}
