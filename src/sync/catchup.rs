//! Catch-Up Detector
//!
//! Per-origin sequences are dense, so "what am I missing from peer X"
//! has an exact answer: count the sequences we hold in the window above
//! the bootstrap floor and every shortfall is a real missing change.
//! The detector answers that for the recovery loop and the status
//! endpoint; the uncapped pull itself runs as a catch-up pass.

use std::sync::Arc;

use crate::error::Result;
use crate::ledger::{ChangeId, ChangeLedger};
use crate::state::{CursorStore, PeerRegistry};
use crate::sync::wire::{CatchupStatus, PeerCatchup};

pub struct CatchupDetector {
    server_id: String,
    ledger: Arc<ChangeLedger>,
    cursors: Arc<CursorStore>,
    registry: Arc<PeerRegistry>,
}

impl CatchupDetector {
    pub fn new(
        server_id: String,
        ledger: Arc<ChangeLedger>,
        cursors: Arc<CursorStore>,
        registry: Arc<PeerRegistry>,
    ) -> Self {
        Self {
            server_id,
            ledger,
            cursors,
            registry,
        }
    }

    /// Cheap count-based check: would a catch-up pass against this peer
    /// do any work? Never-synced peers always qualify.
    pub async fn behind(&self, peer_server_id: &str, head: ChangeId) -> Result<bool> {
        if self.cursors.pulled_to(peer_server_id).await?.is_none() {
            return Ok(true);
        }
        let floor = self.cursors.pull_floor(peer_server_id).await?.unwrap_or(0);
        let span = (head - floor).max(0);
        let known = self
            .ledger
            .known_origin_count(peer_server_id, floor, head)
            .await?;
        Ok(known < span)
    }

    /// Snapshot across every peer whose server id is known, using the
    /// last observed export heads. Peers never contacted report zero.
    pub async fn status(&self) -> Result<CatchupStatus> {
        let mut peers = Vec::new();
        for peer in self.registry.peers().await {
            let Some(peer_id) = peer.server_id else {
                continue;
            };
            let head = peer.export_head.unwrap_or(0);
            let floor = self.cursors.pull_floor(&peer_id).await?.unwrap_or(0);
            let span = (head - floor).max(0) as u64;
            let known = self
                .ledger
                .known_origin_count(&peer_id, floor, head)
                .await?
                .max(0) as u64;
            peers.push(PeerCatchup {
                peer_id,
                missing_count: span.saturating_sub(known),
            });
        }
        Ok(CatchupStatus {
            server_id: self.server_id.clone(),
            peers,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock;
    use crate::ledger::{ChangeRecord, Operation};
    use tempfile::tempdir;

    fn remote(origin: &str, seq: ChangeId, key: &str) -> ChangeRecord {
        ChangeRecord {
            id: 0,
            table_name: "widgets".to_string(),
            record_key: key.to_string(),
            operation: Operation::Update,
            payload: Some(serde_json::json!({ "slug": key })),
            origin_server_id: origin.to_string(),
            origin_change_id: seq,
            created_at_ms: clock::now_ms(),
            logical: 0,
        }
    }

    async fn detector(dir: &std::path::Path) -> (CatchupDetector, Arc<ChangeLedger>, Arc<CursorStore>, Arc<PeerRegistry>) {
        let ledger = Arc::new(ChangeLedger::new(&dir.join("ledger.db"), "server-a").unwrap());
        let cursors = Arc::new(CursorStore::new(dir.join("cursors.db")).unwrap());
        let registry = Arc::new(PeerRegistry::new("server-a".to_string(), 3));
        let detector = CatchupDetector::new(
            "server-a".to_string(),
            Arc::clone(&ledger),
            Arc::clone(&cursors),
            Arc::clone(&registry),
        );
        (detector, ledger, cursors, registry)
    }

    #[tokio::test]
    async fn test_behind_tracks_holes_exactly() {
        let dir = tempdir().unwrap();
        let (detector, ledger, cursors, _registry) = detector(dir.path()).await;
        cursors.advance_pulled("server-b", 1).await.unwrap();

        for seq in [1, 2, 4] {
            ledger
                .record_remote(&remote("server-b", seq, &format!("w{seq}")), true)
                .await
                .unwrap();
        }
        assert!(detector.behind("server-b", 6).await.unwrap());

        for seq in [3, 5, 6] {
            ledger
                .record_remote(&remote("server-b", seq, &format!("w{seq}")), true)
                .await
                .unwrap();
        }
        assert!(!detector.behind("server-b", 6).await.unwrap());
    }

    #[tokio::test]
    async fn test_floor_excludes_pre_bootstrap_history() {
        let dir = tempdir().unwrap();
        let (detector, ledger, cursors, _registry) = detector(dir.path()).await;

        // Bootstrapped at 100: the peer's first century is not a gap
        cursors.init_bootstrap("server-b", 100).await.unwrap();
        for seq in [101, 103] {
            ledger
                .record_remote(&remote("server-b", seq, &format!("w{seq}")), true)
                .await
                .unwrap();
        }

        assert!(detector.behind("server-b", 104).await.unwrap());
        assert!(!detector.behind("server-b", 101).await.unwrap());
    }

    #[tokio::test]
    async fn test_never_synced_peer_is_behind() {
        let dir = tempdir().unwrap();
        let (detector, _ledger, _cursors, _registry) = detector(dir.path()).await;
        assert!(detector.behind("server-b", 0).await.unwrap());
    }

    #[tokio::test]
    async fn test_status_counts_against_observed_heads() {
        let dir = tempdir().unwrap();
        let (detector, ledger, _cursors, registry) = detector(dir.path()).await;

        registry.add_peer("http://b:7655").await;
        registry.record_success("http://b:7655", "server-b").await;
        registry.note_export_head("http://b:7655", 5).await;
        for seq in [1, 2] {
            ledger
                .record_remote(&remote("server-b", seq, &format!("w{seq}")), true)
                .await
                .unwrap();
        }

        let status = detector.status().await.unwrap();
        assert_eq!(status.server_id, "server-a");
        assert_eq!(status.peers.len(), 1);
        assert_eq!(status.peers[0].peer_id, "server-b");
        assert_eq!(status.peers[0].missing_count, 3);
    }
}
