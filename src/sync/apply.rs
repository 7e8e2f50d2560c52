//! Incoming Change Application
//!
//! The single path every remote change goes through, whether it arrived
//! by pulling a peer or by the peer pushing to us. Replays are absorbed,
//! conflicts are resolved, and the application store is only touched for
//! winners. A record that fails to apply is reported back to the sender
//! and deliberately left out of the ledger so a later delivery retries it.

use std::sync::Arc;

use crate::clock::HlcClock;
use crate::error::Result;
use crate::executor::RecordStore;
use crate::ledger::{ChangeLedger, ChangeRecord};
use crate::sync::conflict::{self, Resolution};
use crate::synclog::{EventKind, SyncEventLog};

/// Per-record disposition of an incoming change
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Applied to the store and recorded in the ledger
    Applied,
    /// Echo of our own change or an exact replay; nothing to do
    AlreadyKnown,
    /// Lost a conflict; recorded as history only
    Suppressed { winner_origin: String },
    /// Store rejected the record; reported to the sender, not recorded
    Failed { reason: String },
}

/// Applies incoming records against the ledger and the application store
pub struct Applier {
    ledger: Arc<ChangeLedger>,
    store: Arc<dyn RecordStore>,
    clock: Arc<HlcClock>,
    events: Arc<SyncEventLog>,
}

impl Applier {
    pub fn new(
        ledger: Arc<ChangeLedger>,
        store: Arc<dyn RecordStore>,
        clock: Arc<HlcClock>,
        events: Arc<SyncEventLog>,
    ) -> Self {
        Self {
            ledger,
            store,
            clock,
            events,
        }
    }

    /// The clock this applier feeds remote stamps into
    pub fn clock(&self) -> &HlcClock {
        &self.clock
    }

    /// Apply one incoming record. Errors are infrastructure problems
    /// (ledger unavailable); record-level failures come back as
    /// `ApplyOutcome::Failed`.
    pub async fn apply(&self, record: &ChangeRecord) -> Result<ApplyOutcome> {
        // Absorb the remote clock before anything else so stamps we
        // produce from here on sort after everything we have seen
        self.clock.observe(record.stamp());

        if record.origin_server_id == self.ledger.server_id() {
            return Ok(ApplyOutcome::AlreadyKnown);
        }

        if let Some(reason) = record.shape_error() {
            self.events
                .record(
                    EventKind::ApplySkipped,
                    format!(
                        "{}/{} from {}: {}",
                        record.table_name, record.record_key, record.origin_server_id, reason
                    ),
                )
                .await;
            return Ok(ApplyOutcome::Failed { reason });
        }

        if self
            .ledger
            .contains(&record.origin_server_id, record.origin_change_id)
            .await?
        {
            return Ok(ApplyOutcome::AlreadyKnown);
        }

        let latest = self
            .ledger
            .latest_stamp_for_key(&record.table_name, &record.record_key)
            .await?;

        match conflict::resolve(record, latest) {
            Resolution::Apply => match self.store.write(record).await {
                Ok(()) => {
                    self.ledger.record_remote(record, true).await?;
                    tracing::debug!(
                        "applied {} {}/{} from {} (seq {})",
                        record.operation,
                        record.table_name,
                        record.record_key,
                        record.origin_server_id,
                        record.origin_change_id
                    );
                    Ok(ApplyOutcome::Applied)
                }
                Err(e) if e.is_apply() => {
                    let reason = e.to_string();
                    tracing::warn!(
                        "apply failed for {}/{} from {}: {}",
                        record.table_name,
                        record.record_key,
                        record.origin_server_id,
                        reason
                    );
                    self.events
                        .record(
                            EventKind::ApplySkipped,
                            format!(
                                "{}/{} from {}: {}",
                                record.table_name,
                                record.record_key,
                                record.origin_server_id,
                                reason
                            ),
                        )
                        .await;
                    Ok(ApplyOutcome::Failed { reason })
                }
                Err(e) => Err(e),
            },
            Resolution::Suppress { winner_origin } => {
                self.ledger.record_remote(record, false).await?;
                tracing::debug!(
                    "conflict on {}/{}: {} loses to {}",
                    record.table_name,
                    record.record_key,
                    record.origin_server_id,
                    winner_origin
                );
                self.events
                    .record(
                        EventKind::ConflictResolved,
                        format!(
                            "{}/{}: kept {} over {}",
                            record.table_name,
                            record.record_key,
                            winner_origin,
                            record.origin_server_id
                        ),
                    )
                    .await;
                Ok(ApplyOutcome::Suppressed { winner_origin })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::MemoryStore;
    use crate::ledger::Operation;
    use serde_json::json;
    use tempfile::tempdir;

    fn applier(dir: &std::path::Path) -> (Applier, Arc<ChangeLedger>, Arc<MemoryStore>) {
        let ledger = Arc::new(ChangeLedger::new(&dir.join("ledger.db"), "server-a").unwrap());
        let store = Arc::new(MemoryStore::new());
        let applier = Applier::new(
            Arc::clone(&ledger),
            Arc::clone(&store) as Arc<dyn RecordStore>,
            Arc::new(HlcClock::new()),
            Arc::new(SyncEventLog::new(64)),
        );
        (applier, ledger, store)
    }

    fn incoming(seq: i64, key: &str, ms: i64, origin: &str) -> ChangeRecord {
        ChangeRecord {
            id: seq,
            table_name: "teams".to_string(),
            record_key: key.to_string(),
            operation: Operation::Update,
            payload: Some(json!({"id": key, "at": ms})),
            origin_server_id: origin.to_string(),
            origin_change_id: seq,
            created_at_ms: ms,
            logical: 0,
        }
    }

    #[tokio::test]
    async fn test_apply_then_replay_is_absorbed() {
        let dir = tempdir().unwrap();
        let (applier, _ledger, store) = applier(dir.path());

        let rec = incoming(1, "254", 1000, "server-b");
        assert_eq!(applier.apply(&rec).await.unwrap(), ApplyOutcome::Applied);
        assert_eq!(
            applier.apply(&rec).await.unwrap(),
            ApplyOutcome::AlreadyKnown
        );
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_conflict_loser_suppressed_but_kept() {
        let dir = tempdir().unwrap();
        let (applier, ledger, store) = applier(dir.path());

        let newer = incoming(1, "254", 2000, "server-b");
        let older = incoming(1, "254", 1000, "server-c");

        assert_eq!(applier.apply(&newer).await.unwrap(), ApplyOutcome::Applied);
        assert_eq!(
            applier.apply(&older).await.unwrap(),
            ApplyOutcome::Suppressed {
                winner_origin: "server-b".to_string()
            }
        );

        // Store kept the winner
        let row = store.read("teams", "254").await.unwrap().unwrap();
        assert_eq!(row["at"], 2000);

        // Loser survives as unapplied history
        let history = ledger.history_for_key("teams", "254").await.unwrap();
        assert_eq!(history.len(), 2);
        assert!(history.iter().any(|e| !e.applied));
    }

    #[tokio::test]
    async fn test_failed_record_not_recorded_so_retry_works() {
        let dir = tempdir().unwrap();
        let (applier, ledger, _store) = applier(dir.path());

        // No payload on an update fails shape validation
        let mut bad = incoming(1, "254", 1000, "server-b");
        bad.payload = None;

        match applier.apply(&bad).await.unwrap() {
            ApplyOutcome::Failed { .. } => {}
            other => panic!("expected failure, got {:?}", other),
        }
        assert!(!ledger.contains("server-b", 1).await.unwrap());

        // A corrected delivery of the same identity now applies
        let fixed = incoming(1, "254", 1000, "server-b");
        assert_eq!(applier.apply(&fixed).await.unwrap(), ApplyOutcome::Applied);
    }

    #[tokio::test]
    async fn test_own_echo_ignored() {
        let dir = tempdir().unwrap();
        let (applier, ledger, _store) = applier(dir.path());

        let echo = incoming(1, "254", 1000, "server-a");
        assert_eq!(
            applier.apply(&echo).await.unwrap(),
            ApplyOutcome::AlreadyKnown
        );
        assert_eq!(ledger.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_observe_moves_local_clock_past_remote() {
        let dir = tempdir().unwrap();
        let (applier, _ledger, _store) = applier(dir.path());

        let future_ms = crate::clock::now_ms() + 60_000;
        let rec = incoming(1, "254", future_ms, "server-b");
        applier.apply(&rec).await.unwrap();

        let stamp = applier.clock().tick();
        assert!(stamp > crate::clock::HlcStamp::new(future_ms, 0));
    }
}
