//! Out-of-Band Dispatcher
//!
//! The capture hook sits inside the host application's write path, so
//! everything here follows one rule: a sync problem must never turn
//! into a failed application write. Capture appends to the ledger,
//! posts a notice on a bounded queue and returns. A fixed pool of
//! workers turns notices into sync passes, coalescing bursts so a bulk
//! import triggers one round of passes instead of one per row. A full
//! queue drops the notice; the change itself is safe in the ledger and
//! rides the next scheduled pass.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;

use crate::clock::HlcClock;
use crate::ledger::{ChangeId, ChangeLedger, ChangeRecord, Operation};
use crate::synclog::{EventKind, SyncEventLog};

/// How many queued notices one wakeup absorbs at most
const COALESCE_LIMIT: u64 = 4096;

/// A committed mutation the host wants captured
#[derive(Debug, Clone)]
pub struct Change {
    pub table: String,
    pub key: String,
    pub operation: Operation,
    pub payload: Option<serde_json::Value>,
}

impl Change {
    pub fn insert(table: &str, key: &str, payload: serde_json::Value) -> Self {
        Self {
            table: table.to_string(),
            key: key.to_string(),
            operation: Operation::Insert,
            payload: Some(payload),
        }
    }

    pub fn update(table: &str, key: &str, payload: serde_json::Value) -> Self {
        Self {
            table: table.to_string(),
            key: key.to_string(),
            operation: Operation::Update,
            payload: Some(payload),
        }
    }

    pub fn delete(table: &str, key: &str) -> Self {
        Self {
            table: table.to_string(),
            key: key.to_string(),
            operation: Operation::Delete,
            payload: None,
        }
    }
}

/// Wakeup hint posted after a capture lands; carries identity only for
/// logging, workers re-read real state from the ledger and cursors
#[derive(Debug)]
struct ChangeNotice {
    change_id: ChangeId,
    table: String,
}

/// What the worker pool drives. Implemented by the engine; kept as a
/// trait so capture stays a message boundary instead of a call back
/// into engine internals.
#[async_trait::async_trait]
pub trait PassDriver: Send + Sync {
    /// Base URLs of peers eligible for a nudged pass
    async fn nudge_targets(&self) -> Vec<String>;

    /// Run one pass against the peer. The driver does its own locking
    /// and error handling; a nudged pass that loses the per-peer lock
    /// simply yields to the pass already running.
    async fn run_nudged_pass(&self, peer_url: &str);
}

/// Host-side capture handle. Clone freely; all clones feed one queue.
#[derive(Clone)]
pub struct CaptureHook {
    ledger: Arc<ChangeLedger>,
    clock: Arc<HlcClock>,
    tx: mpsc::Sender<ChangeNotice>,
    events: Arc<SyncEventLog>,
    dropped: Arc<AtomicU64>,
    failures: Arc<AtomicU64>,
}

impl CaptureHook {
    /// Capture one committed mutation. Never fails the caller: a ledger
    /// problem is logged and counted, and a full queue only means the
    /// change waits for the next scheduled pass instead of a nudge.
    pub async fn capture(&self, change: Change) -> Option<ChangeRecord> {
        let stamp = self.clock.tick();
        let record = match self
            .ledger
            .append(
                &change.table,
                &change.key,
                change.operation,
                change.payload,
                stamp,
            )
            .await
        {
            Ok(record) => record,
            Err(err) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                tracing::error!(
                    "change capture failed for {}/{}: {}",
                    change.table,
                    change.key,
                    err
                );
                self.events
                    .record(
                        EventKind::Degraded,
                        format!("capture failed for {}/{}: {}", change.table, change.key, err),
                    )
                    .await;
                return None;
            }
        };

        let notice = ChangeNotice {
            change_id: record.id,
            table: record.table_name.clone(),
        };
        match self.tx.try_send(notice) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(
                    "dispatch queue full, change {} waits for the next tick",
                    record.id
                );
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::trace!("dispatcher stopped, change {} waits for the next tick", record.id);
            }
        }
        Some(record)
    }

    /// Notices dropped because the queue was full
    pub fn dropped_notices(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Captures that failed to reach the ledger
    pub fn capture_failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }
}

/// The queue-draining half. Consumed by `start`.
pub struct Dispatcher {
    rx: mpsc::Receiver<ChangeNotice>,
    workers: usize,
}

/// Build a connected capture hook and dispatcher
pub fn pair(
    ledger: Arc<ChangeLedger>,
    clock: Arc<HlcClock>,
    events: Arc<SyncEventLog>,
    queue_capacity: usize,
    workers: usize,
) -> (CaptureHook, Dispatcher) {
    let (tx, rx) = mpsc::channel(queue_capacity.max(1));
    let hook = CaptureHook {
        ledger,
        clock,
        tx,
        events,
        dropped: Arc::new(AtomicU64::new(0)),
        failures: Arc::new(AtomicU64::new(0)),
    };
    let dispatcher = Dispatcher {
        rx,
        workers: workers.max(1),
    };
    (hook, dispatcher)
}

impl Dispatcher {
    /// Spawn the intake task and the worker pool. Intake collapses each
    /// burst of notices into at most one queued job per peer; workers
    /// pull jobs and run passes, several peers in parallel.
    pub fn start(
        self,
        driver: Arc<dyn PassDriver>,
        shutdown: watch::Receiver<bool>,
    ) -> Vec<JoinHandle<()>> {
        let (job_tx, job_rx) = mpsc::channel::<String>(self.workers * 8);
        let job_rx = Arc::new(Mutex::new(job_rx));
        let pending: Arc<Mutex<HashSet<String>>> = Arc::new(Mutex::new(HashSet::new()));

        let mut handles = Vec::with_capacity(self.workers + 1);

        let mut rx = self.rx;
        {
            let driver = Arc::clone(&driver);
            let pending = Arc::clone(&pending);
            let mut shutdown = shutdown.clone();
            handles.push(tokio::spawn(async move {
                loop {
                    let notice = tokio::select! {
                        _ = shutdown.changed() => break,
                        notice = rx.recv() => match notice {
                            Some(notice) => notice,
                            None => break,
                        },
                    };

                    let mut coalesced = 1u64;
                    while coalesced < COALESCE_LIMIT && rx.try_recv().is_ok() {
                        coalesced += 1;
                    }
                    tracing::debug!(
                        "dispatching {} captured change(s), first {} #{}",
                        coalesced,
                        notice.table,
                        notice.change_id
                    );

                    for url in driver.nudge_targets().await {
                        if !pending.lock().await.insert(url.clone()) {
                            continue;
                        }
                        if job_tx.try_send(url.clone()).is_err() {
                            pending.lock().await.remove(&url);
                        }
                    }
                }
                tracing::debug!("dispatch intake stopped");
            }));
        }

        for worker_id in 0..self.workers {
            let job_rx = Arc::clone(&job_rx);
            let pending = Arc::clone(&pending);
            let driver = Arc::clone(&driver);
            let mut shutdown = shutdown.clone();
            handles.push(tokio::spawn(async move {
                loop {
                    let job = {
                        let mut rx = job_rx.lock().await;
                        tokio::select! {
                            _ = shutdown.changed() => break,
                            job = rx.recv() => match job {
                                Some(job) => job,
                                None => break,
                            },
                        }
                    };
                    pending.lock().await.remove(&job);
                    tracing::trace!("dispatch worker {} nudging {}", worker_id, job);
                    driver.run_nudged_pass(&job).await;
                }
                tracing::debug!("dispatch worker {} stopped", worker_id);
            }));
        }

        handles
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;
    use tempfile::tempdir;

    struct RecordingDriver {
        targets: Vec<String>,
        calls: Mutex<Vec<String>>,
    }

    #[async_trait::async_trait]
    impl PassDriver for RecordingDriver {
        async fn nudge_targets(&self) -> Vec<String> {
            self.targets.clone()
        }

        async fn run_nudged_pass(&self, peer_url: &str) {
            self.calls.lock().await.push(peer_url.to_string());
        }
    }

    fn fixtures(dir: &std::path::Path, capacity: usize, workers: usize) -> (CaptureHook, Dispatcher) {
        let ledger = Arc::new(ChangeLedger::new(&dir.join("ledger.db"), "server-a").unwrap());
        pair(
            ledger,
            Arc::new(HlcClock::new()),
            Arc::new(SyncEventLog::new(16)),
            capacity,
            workers,
        )
    }

    #[tokio::test]
    async fn test_capture_survives_full_queue() {
        let dir = tempdir().unwrap();
        let (hook, _dispatcher) = fixtures(dir.path(), 1, 1);

        // Nothing drains the queue, so everything past the first notice drops
        for n in 0..3 {
            let record = hook
                .capture(Change::insert("teams", &format!("{n}"), json!({ "n": n })))
                .await;
            assert!(record.is_some());
        }
        assert_eq!(hook.dropped_notices(), 2);
        assert_eq!(hook.capture_failures(), 0);
    }

    #[tokio::test]
    async fn test_burst_coalesces_to_one_round_of_passes() {
        let dir = tempdir().unwrap();
        let (hook, dispatcher) = fixtures(dir.path(), 64, 2);

        // Queue the whole burst before the dispatcher starts
        for n in 0..10 {
            hook.capture(Change::update("scores", &format!("{n}"), json!({ "v": n })))
                .await;
        }

        let driver = Arc::new(RecordingDriver {
            targets: vec!["http://a:7655".to_string(), "http://b:7655".to_string()],
            calls: Mutex::new(Vec::new()),
        });
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handles = dispatcher.start(Arc::clone(&driver) as Arc<dyn PassDriver>, shutdown_rx);

        let mut calls = Vec::new();
        for _ in 0..100 {
            calls = driver.calls.lock().await.clone();
            if calls.len() >= 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        calls.sort();
        assert_eq!(calls, vec!["http://a:7655", "http://b:7655"]);

        shutdown_tx.send(true).unwrap();
        for handle in handles {
            tokio::time::timeout(Duration::from_secs(1), handle)
                .await
                .unwrap()
                .unwrap();
        }
    }
}
