//! Sync Event Log
//!
//! Bounded in-memory ring of recent sync activity: resolved conflicts,
//! skipped applies, pass outcomes, reachability flips, file transfers.
//! Backs the /sync/log endpoint and the status counters. Oldest events
//! fall off the front once the ring is full.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

/// What happened
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    ConflictResolved,
    ApplySkipped,
    PassCompleted,
    PassFailed,
    PeerUnreachable,
    PeerRecovered,
    CatchupCompleted,
    FileReplicated,
    FileDeleted,
    Degraded,
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EventKind::ConflictResolved => "conflict_resolved",
            EventKind::ApplySkipped => "apply_skipped",
            EventKind::PassCompleted => "pass_completed",
            EventKind::PassFailed => "pass_failed",
            EventKind::PeerUnreachable => "peer_unreachable",
            EventKind::PeerRecovered => "peer_recovered",
            EventKind::CatchupCompleted => "catchup_completed",
            EventKind::FileReplicated => "file_replicated",
            EventKind::FileDeleted => "file_deleted",
            EventKind::Degraded => "degraded",
        };
        write!(f, "{}", s)
    }
}

/// One recorded event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncEvent {
    pub at: chrono::DateTime<chrono::Utc>,
    pub kind: EventKind,
    pub detail: String,
}

/// Running totals since startup
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventCounters {
    pub conflicts_resolved: u64,
    pub applies_skipped: u64,
    pub passes_completed: u64,
    pub passes_failed: u64,
    pub files_replicated: u64,
}

/// Bounded event ring
pub struct SyncEventLog {
    events: RwLock<VecDeque<SyncEvent>>,
    capacity: usize,
    conflicts_resolved: AtomicU64,
    applies_skipped: AtomicU64,
    passes_completed: AtomicU64,
    passes_failed: AtomicU64,
    files_replicated: AtomicU64,
}

impl SyncEventLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            events: RwLock::new(VecDeque::with_capacity(capacity)),
            capacity,
            conflicts_resolved: AtomicU64::new(0),
            applies_skipped: AtomicU64::new(0),
            passes_completed: AtomicU64::new(0),
            passes_failed: AtomicU64::new(0),
            files_replicated: AtomicU64::new(0),
        }
    }

    /// Record an event, evicting the oldest if the ring is full
    pub async fn record(&self, kind: EventKind, detail: impl Into<String>) {
        match kind {
            EventKind::ConflictResolved => {
                self.conflicts_resolved.fetch_add(1, Ordering::Relaxed);
            }
            EventKind::ApplySkipped => {
                self.applies_skipped.fetch_add(1, Ordering::Relaxed);
            }
            EventKind::PassCompleted => {
                self.passes_completed.fetch_add(1, Ordering::Relaxed);
            }
            EventKind::PassFailed => {
                self.passes_failed.fetch_add(1, Ordering::Relaxed);
            }
            EventKind::FileReplicated => {
                self.files_replicated.fetch_add(1, Ordering::Relaxed);
            }
            _ => {}
        }

        let event = SyncEvent {
            at: chrono::Utc::now(),
            kind,
            detail: detail.into(),
        };

        let mut events = self.events.write().await;
        events.push_back(event);
        while events.len() > self.capacity {
            events.pop_front();
        }
    }

    /// Most recent events, newest first
    pub async fn recent(&self, limit: usize) -> Vec<SyncEvent> {
        let events = self.events.read().await;
        events.iter().rev().take(limit).cloned().collect()
    }

    /// Totals since startup
    pub fn counters(&self) -> EventCounters {
        EventCounters {
            conflicts_resolved: self.conflicts_resolved.load(Ordering::Relaxed),
            applies_skipped: self.applies_skipped.load(Ordering::Relaxed),
            passes_completed: self.passes_completed.load(Ordering::Relaxed),
            passes_failed: self.passes_failed.load(Ordering::Relaxed),
            files_replicated: self.files_replicated.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_ring_evicts_oldest() {
        let log = SyncEventLog::new(3);
        for i in 0..5 {
            log.record(EventKind::PassCompleted, format!("pass {}", i)).await;
        }

        let recent = log.recent(10).await;
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].detail, "pass 4");
        assert_eq!(recent[2].detail, "pass 2");

        // Counters still see everything
        assert_eq!(log.counters().passes_completed, 5);
    }

    #[tokio::test]
    async fn test_counters_by_kind() {
        let log = SyncEventLog::new(16);
        log.record(EventKind::ConflictResolved, "users:1").await;
        log.record(EventKind::ConflictResolved, "users:2").await;
        log.record(EventKind::ApplySkipped, "orders:9 bad shape").await;
        log.record(EventKind::PeerRecovered, "http://b:7655").await;

        let counters = log.counters();
        assert_eq!(counters.conflicts_resolved, 2);
        assert_eq!(counters.applies_skipped, 1);
        assert_eq!(counters.passes_completed, 0);
    }
}
