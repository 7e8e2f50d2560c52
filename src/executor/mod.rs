//! Record Store Module
//!
//! Applies change records to the application database through a narrow
//! read/write interface. The sync engine knows nothing about the host
//! schema beyond table names and record keys; everything else lives
//! behind this trait.

mod sqlite;

pub use sqlite::SqliteStore;

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::{Error, Result};
use crate::ledger::{ChangeRecord, Operation};

/// Narrow access to the application database. Insert and update both
/// upsert the payload; delete removes the row. Reads exist for the
/// status surface and local verification, not for sync decisions.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Fetch the current row for a table and key, if present
    async fn read(&self, table: &str, key: &str) -> Result<Option<serde_json::Value>>;

    /// Apply one change record
    async fn write(&self, record: &ChangeRecord) -> Result<()>;

    /// Whether the backing database answers
    async fn health_check(&self) -> Result<bool>;

    /// Short backend label for status output
    fn backend(&self) -> &'static str;
}

/// In-memory record store. Used by tests and as the stand-in backend
/// when the real store cannot be opened at startup.
pub struct MemoryStore {
    rows: RwLock<HashMap<(String, String), serde_json::Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            rows: RwLock::new(HashMap::new()),
        }
    }

    pub async fn len(&self) -> usize {
        self.rows.read().await.len()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn read(&self, table: &str, key: &str) -> Result<Option<serde_json::Value>> {
        let rows = self.rows.read().await;
        Ok(rows.get(&(table.to_string(), key.to_string())).cloned())
    }

    async fn write(&self, record: &ChangeRecord) -> Result<()> {
        let mut rows = self.rows.write().await;
        let slot = (record.table_name.clone(), record.record_key.clone());
        match record.operation {
            Operation::Insert | Operation::Update => {
                let payload = record.payload.clone().ok_or_else(|| Error::Apply {
                    table: record.table_name.clone(),
                    key: record.record_key.clone(),
                    reason: format!("{} without payload", record.operation),
                })?;
                rows.insert(slot, payload);
            }
            Operation::Delete => {
                rows.remove(&slot);
            }
        }
        Ok(())
    }

    async fn health_check(&self) -> Result<bool> {
        Ok(true)
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::now_ms;

    fn record(op: Operation, key: &str, payload: Option<serde_json::Value>) -> ChangeRecord {
        ChangeRecord {
            id: 0,
            table_name: "notes".to_string(),
            record_key: key.to_string(),
            operation: op,
            payload,
            origin_server_id: "server-a".to_string(),
            origin_change_id: 0,
            created_at_ms: now_ms(),
            logical: 0,
        }
    }

    #[tokio::test]
    async fn test_memory_store_round_trip() {
        let store = MemoryStore::new();
        let payload = serde_json::json!({"id": "n1", "body": "hello"});

        store
            .write(&record(Operation::Insert, "n1", Some(payload.clone())))
            .await
            .unwrap();
        assert_eq!(store.read("notes", "n1").await.unwrap(), Some(payload));

        store
            .write(&record(Operation::Delete, "n1", None))
            .await
            .unwrap();
        assert!(store.read("notes", "n1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_memory_store_rejects_missing_payload() {
        let store = MemoryStore::new();
        let err = store
            .write(&record(Operation::Update, "n1", None))
            .await
            .unwrap_err();
        assert!(err.is_apply());
    }
}
