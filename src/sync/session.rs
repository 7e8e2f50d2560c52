//! Sync Session
//!
//! One bidirectional pass against one peer: probe, pull the peer's
//! changes and apply them, push our own, commit cursors as each batch
//! is settled. A pass is cheap when nothing changed (a ping and two
//! empty pages), and a crash at any point replays from the last
//! committed cursor instead of losing ground.

use std::collections::HashSet;
use std::sync::Arc;

use crate::clock::HlcStamp;
use crate::error::{Error, Result};
use crate::ledger::{ChangeId, ChangeLedger, ChangeRecord};
use crate::network::PeerClient;
use crate::state::{CursorStore, PeerRegistry};
use crate::sync::apply::{Applier, ApplyOutcome};
use crate::sync::wire::PushRequest;
use crate::synclog::{EventKind, SyncEventLog};

/// What drives a pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassKind {
    /// Scheduled tick or dispatcher nudge; paged, cursor-driven
    Steady,
    /// Catch-up detector run; closes exact gaps with an uncapped range
    CatchUp,
}

/// Result of one completed pass
#[derive(Debug, Clone)]
pub struct PassOutcome {
    pub peer_url: String,
    pub peer_server_id: String,
    pub kind: PassKind,
    /// Records applied from the peer
    pub pulled: u64,
    /// Records the peer sent that failed to apply here
    pub pull_skipped: u64,
    /// Conflict losers absorbed as history
    pub suppressed: u64,
    /// Local records the peer acknowledged
    pub pushed: u64,
    /// Local records the peer reported as skipped
    pub push_skipped: u64,
}

impl PassOutcome {
    fn new(peer_url: String, peer_server_id: String, kind: PassKind) -> Self {
        Self {
            peer_url,
            peer_server_id,
            kind,
            pulled: 0,
            pull_skipped: 0,
            suppressed: 0,
            pushed: 0,
            push_skipped: 0,
        }
    }
}

/// A single peer's sync pass
pub struct SyncSession {
    server_id: String,
    peer_url: String,
    client: PeerClient,
    ledger: Arc<ChangeLedger>,
    cursors: Arc<CursorStore>,
    registry: Arc<PeerRegistry>,
    events: Arc<SyncEventLog>,
    applier: Arc<Applier>,
    max_batch: u32,
    bootstrap_max_changes: u64,
}

impl SyncSession {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        server_id: String,
        peer_url: String,
        client: PeerClient,
        ledger: Arc<ChangeLedger>,
        cursors: Arc<CursorStore>,
        registry: Arc<PeerRegistry>,
        events: Arc<SyncEventLog>,
        applier: Arc<Applier>,
        max_batch: u32,
        bootstrap_max_changes: u64,
    ) -> Self {
        Self {
            server_id,
            peer_url,
            client,
            ledger,
            cursors,
            registry,
            events,
            applier,
            max_batch,
            bootstrap_max_changes,
        }
    }

    /// Run the pass. The caller owns the per-peer run lock and the pass
    /// timeout; failures are classified by the error's own taxonomy.
    pub async fn run(&self, kind: PassKind) -> Result<PassOutcome> {
        let ping = self.client.ping().await?;
        self.applier
            .clock()
            .observe(HlcStamp::new(ping.time, ping.logical));

        if ping.server_id == self.server_id {
            return Err(Error::Config(format!(
                "peer {} reports our own server id {}",
                self.peer_url, ping.server_id
            )));
        }
        let peer_id = ping.server_id.clone();
        self.registry.record_success(&self.peer_url, &peer_id).await;
        if !ping.healthy {
            tracing::info!("peer {} reports degraded health, continuing", self.peer_url);
        }

        let mut outcome = PassOutcome::new(self.peer_url.clone(), peer_id.clone(), kind);

        match kind {
            PassKind::Steady => self.pull_steady(&peer_id, &mut outcome).await?,
            PassKind::CatchUp => self.pull_catch_up(&peer_id, &mut outcome).await?,
        }
        self.push(&peer_id, &mut outcome).await?;

        self.registry.record_pass_complete(&self.peer_url).await;
        self.events
            .record(
                EventKind::PassCompleted,
                format!(
                    "{}: pulled {} pushed {} (skipped {}/{})",
                    peer_id,
                    outcome.pulled,
                    outcome.pushed,
                    outcome.pull_skipped,
                    outcome.push_skipped
                ),
            )
            .await;
        Ok(outcome)
    }

    /// Cursor-paged pull. The cursor only advances over the contiguous
    /// prefix of settled records, so a failed record is retried on the
    /// next tick while later records still land this pass.
    async fn pull_steady(&self, peer_id: &str, outcome: &mut PassOutcome) -> Result<()> {
        let mut since = match self.cursors.pulled_to(peer_id).await? {
            Some(cursor) => cursor,
            None => self.bootstrap(peer_id).await?,
        };

        loop {
            let page = self.client.pull_changes(since, self.max_batch).await?;
            self.registry
                .note_export_head(&self.peer_url, page.server_max_id)
                .await;
            if page.changes.is_empty() {
                break;
            }

            let (advance_to, clean) =
                self.apply_page(&page.changes, since, outcome).await?;
            self.cursors.advance_pulled(peer_id, advance_to).await?;
            if !clean {
                break;
            }

            let last = match page.changes.last() {
                Some(record) => record.origin_change_id,
                None => break,
            };
            since = last;
            if last >= page.server_max_id || (page.changes.len() as u32) < self.max_batch {
                break;
            }
        }
        Ok(())
    }

    /// Uncapped recovery pull starting just below the first missing
    /// sequence. Everything already known is absorbed by replay dedup.
    async fn pull_catch_up(&self, peer_id: &str, outcome: &mut PassOutcome) -> Result<()> {
        let since = match self.cursors.pulled_to(peer_id).await? {
            None => self.bootstrap(peer_id).await?,
            Some(cursor) => {
                let probe = self.client.pull_changes(cursor, 1).await?;
                let head = probe.server_max_id;
                self.registry.note_export_head(&self.peer_url, head).await;

                let floor = self.cursors.pull_floor(peer_id).await?.unwrap_or(0);
                let missing = self.ledger.missing_origin_ids(peer_id, floor, head).await?;
                match missing.first() {
                    Some(&first) => {
                        tracing::info!(
                            "catch-up for {}: {} missing, first gap at {}",
                            peer_id,
                            missing.len(),
                            first
                        );
                        first - 1
                    }
                    None if head > cursor => cursor,
                    None => return Ok(()),
                }
            }
        };

        let page = self.client.pull_changes(since, 0).await?;
        self.registry
            .note_export_head(&self.peer_url, page.server_max_id)
            .await;
        if page.changes.is_empty() {
            return Ok(());
        }

        let examined = page.changes.len();
        let (advance_to, _clean) = self.apply_page(&page.changes, since, outcome).await?;
        self.cursors.advance_pulled(peer_id, advance_to).await?;

        self.events
            .record(
                EventKind::CatchupCompleted,
                format!(
                    "{}: examined {} records, applied {}",
                    peer_id, examined, outcome.pulled
                ),
            )
            .await;
        Ok(())
    }

    /// First contact with a peer: start from a bounded distance below
    /// its head instead of replaying its entire history.
    async fn bootstrap(&self, peer_id: &str) -> Result<ChangeId> {
        let probe = self.client.pull_changes(0, 1).await?;
        let head = probe.server_max_id;
        self.registry.note_export_head(&self.peer_url, head).await;

        let start = if self.bootstrap_max_changes == 0 {
            0
        } else {
            (head - self.bootstrap_max_changes as i64).max(0)
        };
        if start > 0 {
            tracing::info!(
                "bootstrapping {} from sequence {} (head {})",
                peer_id,
                start,
                head
            );
        }
        self.cursors.init_bootstrap(peer_id, start).await?;
        // A concurrent pass may have created the row first; read back
        Ok(self.cursors.pulled_to(peer_id).await?.unwrap_or(start))
    }

    async fn apply_page(
        &self,
        records: &[ChangeRecord],
        start: ChangeId,
        outcome: &mut PassOutcome,
    ) -> Result<(ChangeId, bool)> {
        let mut advance_to = start;
        let mut clean = true;
        for record in records {
            match self.applier.apply(record).await? {
                ApplyOutcome::Applied => {
                    outcome.pulled += 1;
                    if clean {
                        advance_to = record.origin_change_id;
                    }
                }
                ApplyOutcome::AlreadyKnown => {
                    if clean {
                        advance_to = record.origin_change_id;
                    }
                }
                ApplyOutcome::Suppressed { .. } => {
                    outcome.suppressed += 1;
                    if clean {
                        advance_to = record.origin_change_id;
                    }
                }
                ApplyOutcome::Failed { .. } => {
                    outcome.pull_skipped += 1;
                    clean = false;
                }
            }
        }
        Ok((advance_to, clean))
    }

    /// Paged push. The push cursor advances to the last record before
    /// the first one the peer reported skipped; skipped records are
    /// retried next pass and re-delivered tails are absorbed over there.
    async fn push(&self, peer_id: &str, outcome: &mut PassOutcome) -> Result<()> {
        let mut from = self.cursors.pushed_to(peer_id).await?.unwrap_or(0);

        loop {
            let batch = self.ledger.changes_since(from, self.max_batch).await?;
            if batch.is_empty() {
                break;
            }

            let request = PushRequest {
                server_id: self.server_id.clone(),
                changes: batch.clone(),
            };
            let response = self.client.push_changes(&request).await?;
            self.registry
                .note_export_head(&self.peer_url, response.server_max_id)
                .await;

            // Skips are reported by table/key, not id; halting at the
            // first match is conservative but always safe
            let skipped: HashSet<&str> =
                response.skipped.iter().map(|s| s.key.as_str()).collect();

            let mut advance_to = from;
            let mut acked: Vec<ChangeId> = Vec::new();
            let mut blocked = false;
            for record in &batch {
                let key = format!("{}/{}", record.table_name, record.record_key);
                if skipped.contains(key.as_str()) {
                    blocked = true;
                    break;
                }
                advance_to = record.origin_change_id;
                acked.push(record.id);
            }

            self.cursors.advance_pushed(peer_id, advance_to).await?;
            self.ledger.mark_synced_batch(&acked, peer_id).await?;
            outcome.pushed += acked.len() as u64;
            outcome.push_skipped += response.skipped.len() as u64;

            for skip in &response.skipped {
                self.events
                    .record(
                        EventKind::ApplySkipped,
                        format!("push to {}: {}: {}", peer_id, skip.key, skip.reason),
                    )
                    .await;
            }

            if blocked || (batch.len() as u32) < self.max_batch {
                break;
            }
            from = advance_to;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::HlcClock;
    use crate::executor::{MemoryStore, RecordStore};
    use std::time::Duration;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_unreachable_peer_fails_transient_without_state() {
        let dir = tempdir().unwrap();
        let ledger = Arc::new(
            crate::ledger::ChangeLedger::new(&dir.path().join("ledger.db"), "server-a").unwrap(),
        );
        let cursors = Arc::new(CursorStore::new(dir.path().join("cursors.db")).unwrap());
        let registry = Arc::new(PeerRegistry::new("server-a".to_string(), 3));
        let events = Arc::new(SyncEventLog::new(16));
        let applier = Arc::new(Applier::new(
            Arc::clone(&ledger),
            Arc::new(MemoryStore::new()) as Arc<dyn RecordStore>,
            Arc::new(HlcClock::new()),
            Arc::clone(&events),
        ));

        let session = SyncSession::new(
            "server-a".to_string(),
            "http://127.0.0.1:9".to_string(),
            PeerClient::new(
                "http://127.0.0.1:9",
                None,
                Duration::from_millis(200),
                Duration::from_millis(200),
            ),
            ledger,
            Arc::clone(&cursors),
            registry,
            events,
            applier,
            100,
            0,
        );

        let err = session.run(PassKind::Steady).await.unwrap_err();
        assert!(err.is_transient());
        // No cursor state is created by a failed probe
        assert!(cursors.all().await.unwrap().is_empty());
    }
}
