//! Change record types
//!
//! A change record describes one committed mutation of one application
//! record: which table, which key, what happened, and the full row
//! snapshot for inserts and updates. Records are immutable once written
//! and carry their origin identity so replayed deliveries can be
//! recognized anywhere in the mesh.

use serde::{Deserialize, Serialize};

use crate::clock::HlcStamp;

/// Ledger sequence number, monotonic per node
pub type ChangeId = i64;

/// Kind of mutation a change record describes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Insert,
    Update,
    Delete,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Insert => "insert",
            Operation::Update => "update",
            Operation::Delete => "delete",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "insert" => Some(Operation::Insert),
            "update" => Some(Operation::Update),
            "delete" => Some(Operation::Delete),
            _ => None,
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One committed mutation. This struct is both the ledger row and the
/// wire shape: `id` is the ledger id on the node currently serving the
/// record, while `(origin_server_id, origin_change_id)` is the global
/// identity that never changes as the record travels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub id: ChangeId,
    pub table_name: String,
    pub record_key: String,
    pub operation: Operation,
    /// Full row snapshot for insert/update, None for delete
    pub payload: Option<serde_json::Value>,
    pub origin_server_id: String,
    pub origin_change_id: ChangeId,
    /// HLC physical component, milliseconds since the UNIX epoch
    pub created_at_ms: i64,
    /// HLC logical counter
    #[serde(default)]
    pub logical: u32,
}

impl ChangeRecord {
    /// The record's clock stamp
    pub fn stamp(&self) -> HlcStamp {
        HlcStamp::new(self.created_at_ms, self.logical)
    }

    /// Check wire-level shape: inserts and updates need a payload object,
    /// deletes must not carry one.
    pub fn shape_error(&self) -> Option<String> {
        if self.table_name.is_empty() || self.record_key.is_empty() {
            return Some("empty table or key".to_string());
        }
        match self.operation {
            Operation::Insert | Operation::Update => match &self.payload {
                Some(serde_json::Value::Object(_)) => None,
                Some(_) => Some("payload must be a JSON object".to_string()),
                None => Some(format!("{} without payload", self.operation)),
            },
            Operation::Delete => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(op: Operation, payload: Option<serde_json::Value>) -> ChangeRecord {
        ChangeRecord {
            id: 1,
            table_name: "teams".to_string(),
            record_key: "254".to_string(),
            operation: op,
            payload,
            origin_server_id: "server-a".to_string(),
            origin_change_id: 1,
            created_at_ms: 1_700_000_000_000,
            logical: 0,
        }
    }

    #[test]
    fn test_operation_roundtrip() {
        for op in [Operation::Insert, Operation::Update, Operation::Delete] {
            assert_eq!(Operation::parse(op.as_str()), Some(op));
        }
        assert_eq!(Operation::parse("truncate"), None);
    }

    #[test]
    fn test_shape_validation() {
        assert!(record(Operation::Insert, Some(json!({"name": "x"})))
            .shape_error()
            .is_none());
        assert!(record(Operation::Insert, None).shape_error().is_some());
        assert!(record(Operation::Update, Some(json!([1, 2])))
            .shape_error()
            .is_some());
        assert!(record(Operation::Delete, None).shape_error().is_none());
    }

    #[test]
    fn test_wire_shape() {
        let rec = record(Operation::Update, Some(json!({"score": 42})));
        let encoded = serde_json::to_string(&rec).unwrap();
        assert!(encoded.contains("\"operation\":\"update\""));

        let decoded: ChangeRecord = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, rec);
        assert_eq!(decoded.stamp(), HlcStamp::new(1_700_000_000_000, 0));
    }
}
