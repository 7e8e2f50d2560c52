//! Sync Wire Types
//!
//! JSON bodies exchanged between peers. Change records travel in their
//! ledger form; these are the envelopes around them.

use serde::{Deserialize, Serialize};

use crate::ledger::{ChangeId, ChangeRecord};

/// Shared-secret header checked on every route except `/sync/ping`
pub const AUTH_HEADER: &str = "x-sync-token";
/// Hex SHA-256 accompanying a file upload
pub const FILE_HASH_HEADER: &str = "x-file-sha256";
/// Source modification time accompanying a file upload
pub const FILE_MTIME_HEADER: &str = "x-file-mtime-ms";

/// Response to `GET /sync/changes?since_id=`
///
/// `server_max_id` is the highest exportable ledger id on the sender,
/// so the caller can tell an empty page from a finished range.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangesResponse {
    pub server_id: String,
    pub changes: Vec<ChangeRecord>,
    pub server_max_id: ChangeId,
}

/// Body of `POST /sync/changes`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushRequest {
    pub server_id: String,
    pub changes: Vec<ChangeRecord>,
}

/// One record the receiver could not apply
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkippedRecord {
    /// `table/key` of the failed record
    pub key: String,
    pub reason: String,
}

impl SkippedRecord {
    pub fn new(record: &ChangeRecord, reason: impl Into<String>) -> Self {
        Self {
            key: format!("{}/{}", record.table_name, record.record_key),
            reason: reason.into(),
        }
    }
}

/// Response to `POST /sync/changes`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushResponse {
    /// Records applied or already known
    pub applied: u64,
    /// Records rejected record-by-record
    pub skipped: Vec<SkippedRecord>,
    /// Highest exportable ledger id on the receiver
    pub server_max_id: ChangeId,
}

/// Response to `GET /sync/ping`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PingResponse {
    pub server_id: String,
    pub healthy: bool,
    /// Sender's clock, HLC physical milliseconds
    pub time: i64,
    /// HLC logical counter for clock exchange
    #[serde(default)]
    pub logical: u32,
}

/// Per-peer entry in `GET /sync/catchup/status`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerCatchup {
    pub peer_id: String,
    /// Exact count of that peer's ledger ids missing locally
    pub missing_count: u64,
}

/// Response to `GET /sync/catchup/status`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatchupStatus {
    pub server_id: String,
    pub peers: Vec<PeerCatchup>,
}

/// One mirrored file in `GET /files/manifest`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRecord {
    /// Path relative to the file root, forward slashes
    pub path: String,
    pub size: u64,
    /// Modification time, milliseconds since the UNIX epoch
    pub mtime_ms: i64,
    /// Hex SHA-256 of the content
    pub sha256: String,
}

/// Deletion marker in `GET /files/manifest`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileTombstone {
    pub path: String,
    pub deleted_at_ms: i64,
}

/// Response to `GET /files/manifest`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestResponse {
    pub server_id: String,
    pub files: Vec<FileRecord>,
    pub tombstones: Vec<FileTombstone>,
}

/// Response to `PUT /files/{path}`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreFileResponse {
    pub stored: bool,
}

/// Body of `POST /sync/run`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunRequest {
    /// Limit the nudge to one peer URL
    #[serde(default)]
    pub peer: Option<String>,
}

/// Response to `POST /sync/run`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResponse {
    pub requested: usize,
}

/// Body of the `POST /sync/peers/*` admin routes, naming one peer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerRequest {
    pub url: String,
}

/// Response to the `POST /sync/peers/*` admin routes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerAdminResponse {
    pub url: String,
    /// False when the action was a no-op (already present, not found)
    pub changed: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::Operation;

    #[test]
    fn test_push_response_shape() {
        let record = ChangeRecord {
            id: 7,
            table_name: "teams".to_string(),
            record_key: "254".to_string(),
            operation: Operation::Update,
            payload: Some(serde_json::json!({"id": "254"})),
            origin_server_id: "server-b".to_string(),
            origin_change_id: 7,
            created_at_ms: 1_700_000_000_000,
            logical: 0,
        };
        let response = PushResponse {
            applied: 3,
            skipped: vec![SkippedRecord::new(&record, "constraint failed")],
            server_max_id: 42,
        };

        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["applied"], 3);
        assert_eq!(json["skipped"][0]["key"], "teams/254");
        assert_eq!(json["server_max_id"], 42);
    }

    #[test]
    fn test_ping_logical_defaults() {
        let ping: PingResponse = serde_json::from_str(
            r#"{"server_id":"server-b","healthy":true,"time":1700000000000}"#,
        )
        .unwrap();
        assert_eq!(ping.logical, 0);
        assert!(ping.healthy);
    }
}
