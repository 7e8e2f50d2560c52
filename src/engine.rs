//! Sync Engine
//!
//! The explicitly constructed root of a node: owns the ledger, cursors,
//! peer registry, event log, application store and file replicator, and
//! runs the background loops that keep peers converged. Hosts build one
//! engine from a config and hold it; nothing in here is global state.
//!
//! A node whose application store is unavailable comes up degraded
//! instead of refusing to start: captures keep landing in the ledger,
//! peers can still pull, and incoming pushes are refused with a
//! retryable error until the store returns.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::clock::HlcClock;
use crate::config::MeshSyncConfig;
use crate::dispatch::{self, CaptureHook, Dispatcher, PassDriver};
use crate::error::{Error, Result};
use crate::executor::{MemoryStore, RecordStore, SqliteStore};
use crate::files::FileReplicator;
use crate::ledger::{ChangeId, ChangeLedger};
use crate::network::PeerClient;
use crate::state::{CursorStore, PeerRegistry, Reachability};
use crate::sync::wire::{
    CatchupStatus, ChangesResponse, PingResponse, PushRequest, PushResponse, SkippedRecord,
};
use crate::sync::{Applier, ApplyOutcome, CatchupDetector, PassKind, SyncSession};
use crate::synclog::{EventKind, SyncEventLog};

const EVENT_LOG_CAPACITY: usize = 512;
const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(15);

pub struct SyncEngine {
    config: MeshSyncConfig,
    server_id: String,
    started_at: Instant,
    clock: Arc<HlcClock>,
    ledger: Arc<ChangeLedger>,
    cursors: Arc<CursorStore>,
    registry: Arc<PeerRegistry>,
    events: Arc<SyncEventLog>,
    store: Arc<dyn RecordStore>,
    applier: Arc<Applier>,
    detector: CatchupDetector,
    replicator: Option<Arc<FileReplicator>>,
    capture: CaptureHook,
    dispatcher: Mutex<Option<Dispatcher>>,
    run_locks: RwLock<HashMap<String, Arc<Mutex<()>>>>,
    started: AtomicBool,
    degraded: AtomicBool,
    /// True when `store` is the in-memory stand-in for an application
    /// store that never came up; degraded mode is then permanent
    fallback_store: bool,
    shutdown_tx: watch::Sender<bool>,
}

impl SyncEngine {
    /// Build an engine from a validated configuration. Opens the ledger
    /// and state databases, registers configured peers, and connects to
    /// the application store, falling back to degraded mode when the
    /// store is unreachable.
    pub async fn new(config: MeshSyncConfig) -> Result<Arc<Self>> {
        config.validate()?;
        let server_id = config.node.id.clone();

        let clock = Arc::new(HlcClock::new());
        let ledger = Arc::new(ChangeLedger::new(&config.ledger_path(), &server_id)?);
        let cursors = Arc::new(CursorStore::new(config.cursors_path())?);
        let registry = Arc::new(PeerRegistry::new(
            server_id.clone(),
            config.sync.unreachable_after,
        ));
        let events = Arc::new(SyncEventLog::new(EVENT_LOG_CAPACITY));

        let (good, bad) = config.peer_urls();
        for url in &bad {
            tracing::warn!("ignoring malformed peer url {:?}", url);
        }
        for url in &good {
            registry.add_peer(url).await;
        }

        let degraded = AtomicBool::new(false);
        let mut fallback_store = false;
        let store: Arc<dyn RecordStore> = match SqliteStore::new(&config.database).await {
            Ok(store) => Arc::new(store),
            Err(err) => {
                tracing::error!(
                    "application store unavailable, starting degraded: {}",
                    err
                );
                events
                    .record(
                        EventKind::Degraded,
                        format!("application store unavailable: {}", err),
                    )
                    .await;
                degraded.store(true, Ordering::SeqCst);
                fallback_store = true;
                Arc::new(MemoryStore::new())
            }
        };

        let applier = Arc::new(Applier::new(
            Arc::clone(&ledger),
            Arc::clone(&store),
            Arc::clone(&clock),
            Arc::clone(&events),
        ));
        let detector = CatchupDetector::new(
            server_id.clone(),
            Arc::clone(&ledger),
            Arc::clone(&cursors),
            Arc::clone(&registry),
        );

        let replicator = if config.files.enabled {
            Some(Arc::new(FileReplicator::new(
                server_id.clone(),
                &config.files,
                config.file_index_path(),
                Arc::clone(&events),
            )?))
        } else {
            None
        };

        let (capture, dispatcher) = dispatch::pair(
            Arc::clone(&ledger),
            Arc::clone(&clock),
            Arc::clone(&events),
            config.sync.queue_capacity,
            config.sync.dispatch_workers,
        );

        let (shutdown_tx, _) = watch::channel(false);

        Ok(Arc::new(Self {
            config,
            server_id,
            started_at: Instant::now(),
            clock,
            ledger,
            cursors,
            registry,
            events,
            store,
            applier,
            detector,
            replicator,
            capture,
            dispatcher: Mutex::new(Some(dispatcher)),
            run_locks: RwLock::new(HashMap::new()),
            started: AtomicBool::new(false),
            degraded,
            fallback_store,
            shutdown_tx,
        }))
    }

    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    pub fn config(&self) -> &MeshSyncConfig {
        &self.config
    }

    pub fn ledger(&self) -> &ChangeLedger {
        &self.ledger
    }

    pub fn cursors(&self) -> &CursorStore {
        &self.cursors
    }

    pub fn registry(&self) -> &PeerRegistry {
        &self.registry
    }

    pub fn events(&self) -> &SyncEventLog {
        &self.events
    }

    pub fn replicator(&self) -> Option<&FileReplicator> {
        self.replicator.as_deref()
    }

    /// Handle for the host's write path. Clone freely.
    pub fn capture_hook(&self) -> CaptureHook {
        self.capture.clone()
    }

    pub fn store_backend(&self) -> &'static str {
        self.store.backend()
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    pub async fn healthy(&self) -> bool {
        !self.is_degraded() && matches!(self.store.health_check().await, Ok(true))
    }

    // ---- Wire operations ----

    pub async fn ping_response(&self) -> PingResponse {
        let stamp = self.clock.tick();
        PingResponse {
            server_id: self.server_id.clone(),
            healthy: self.healthy().await,
            time: stamp.physical_ms,
            logical: stamp.logical,
        }
    }

    /// Serve a page of this node's own changes. `limit` 0 means the
    /// whole range; catch-up passes rely on that.
    pub async fn export_changes(&self, since_id: ChangeId, limit: u32) -> Result<ChangesResponse> {
        let changes = self.ledger.changes_since(since_id, limit).await?;
        let server_max_id = self.ledger.export_head().await?;
        Ok(ChangesResponse {
            server_id: self.server_id.clone(),
            changes,
            server_max_id,
        })
    }

    /// Apply a pushed batch record by record. A record that fails stays
    /// out of the ledger and is reported back so the sender retries it;
    /// everything else acks.
    pub async fn receive_changes(&self, request: PushRequest) -> Result<PushResponse> {
        if self.is_degraded() {
            return Err(Error::State("application store unavailable".to_string()));
        }

        let mut applied = 0u64;
        let mut skipped = Vec::new();
        for record in &request.changes {
            match self.applier.apply(record).await? {
                ApplyOutcome::Applied
                | ApplyOutcome::AlreadyKnown
                | ApplyOutcome::Suppressed { .. } => applied += 1,
                ApplyOutcome::Failed { reason } => {
                    skipped.push(SkippedRecord::new(record, reason))
                }
            }
        }
        if !skipped.is_empty() {
            tracing::info!(
                "push from {}: applied {}, skipped {}",
                request.server_id,
                applied,
                skipped.len()
            );
        }

        Ok(PushResponse {
            applied,
            skipped,
            server_max_id: self.ledger.export_head().await?,
        })
    }

    pub async fn catchup_status(&self) -> Result<CatchupStatus> {
        self.detector.status().await
    }

    // ---- Pass scheduling ----

    fn peer_client(&self, url: &str) -> PeerClient {
        PeerClient::new(
            url,
            self.config.sync.auth_token.clone(),
            self.config.ping_timeout(),
            self.config.request_timeout(),
        )
    }

    fn session(&self, peer_url: &str) -> SyncSession {
        SyncSession::new(
            self.server_id.clone(),
            peer_url.to_string(),
            self.peer_client(peer_url),
            Arc::clone(&self.ledger),
            Arc::clone(&self.cursors),
            Arc::clone(&self.registry),
            Arc::clone(&self.events),
            Arc::clone(&self.applier),
            self.config.sync.max_batch,
            self.config.sync.bootstrap_max_changes as u64,
        )
    }

    async fn run_lock(&self, peer_url: &str) -> Arc<Mutex<()>> {
        if let Some(lock) = self.run_locks.read().await.get(peer_url) {
            return Arc::clone(lock);
        }
        let mut locks = self.run_locks.write().await;
        Arc::clone(
            locks
                .entry(peer_url.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(()))),
        )
    }

    /// Run one pass against one peer under the per-peer lock and the
    /// pass timeout. A caller who finds a pass already in flight yields
    /// to it instead of queueing.
    pub async fn run_peer_pass(&self, peer_url: &str, kind: PassKind) {
        let lock = self.run_lock(peer_url).await;
        let Ok(_guard) = lock.try_lock() else {
            tracing::trace!("pass against {} already in flight", peer_url);
            return;
        };

        let was = self
            .registry
            .get(peer_url)
            .await
            .map(|peer| peer.reachability);
        let session = self.session(peer_url);

        match timeout(self.config.pass_timeout(), session.run(kind)).await {
            Ok(Ok(outcome)) => {
                if was == Some(Reachability::Unreachable) {
                    self.events
                        .record(EventKind::PeerRecovered, peer_url.to_string())
                        .await;
                }
                tracing::debug!(
                    "pass against {}: pulled {}, pushed {}, suppressed {}, skipped {}/{}",
                    peer_url,
                    outcome.pulled,
                    outcome.pushed,
                    outcome.suppressed,
                    outcome.pull_skipped,
                    outcome.push_skipped
                );
            }
            Ok(Err(err)) => self.note_pass_error(peer_url, &err).await,
            Err(_) => {
                let err = Error::ConnectionTimeout(format!("pass against {}", peer_url));
                self.note_pass_error(peer_url, &err).await;
            }
        }
    }

    async fn note_pass_error(&self, peer_url: &str, err: &Error) {
        if !err.is_transient() && !err.is_structural() {
            // Local trouble during the exchange; says nothing about
            // whether the peer can be reached
            tracing::error!("pass against {} aborted: {}", peer_url, err);
            self.events
                .record(EventKind::PassFailed, format!("{}: {}", peer_url, err))
                .await;
            return;
        }

        let was = self
            .registry
            .get(peer_url)
            .await
            .map(|peer| peer.reachability);
        let now = self.registry.record_failure(peer_url, &err.to_string()).await;
        if now == Reachability::Unreachable && was != Some(Reachability::Unreachable) {
            tracing::warn!("peer {} marked unreachable: {}", peer_url, err);
            self.events
                .record(
                    EventKind::PeerUnreachable,
                    format!("{}: {}", peer_url, err),
                )
                .await;
        } else if err.is_structural() {
            tracing::error!("pass against {} aborted: {}", peer_url, err);
        } else {
            tracing::info!("pass against {} failed: {}", peer_url, err);
        }
    }

    /// Nudge passes on demand. Returns how many were requested.
    pub async fn request_run(self: &Arc<Self>, peer: Option<String>) -> usize {
        let targets: Vec<String> = match peer {
            Some(url) => vec![url.trim_end_matches('/').to_string()],
            None => self
                .registry
                .enabled_peers()
                .await
                .into_iter()
                .map(|peer| peer.url)
                .collect(),
        };
        for url in &targets {
            let engine = Arc::clone(self);
            let url = url.clone();
            tokio::spawn(async move {
                engine.run_peer_pass(&url, PassKind::Steady).await;
            });
        }
        targets.len()
    }

    // ---- Peer administration ----

    /// Register a peer at runtime and start syncing with it. Returns
    /// false when the URL is already present.
    pub async fn add_peer(self: &Arc<Self>, url: &str) -> bool {
        let url = url.trim_end_matches('/').to_string();
        if !self.registry.add_peer(&url).await {
            return false;
        }
        tracing::info!("peer {} added", url);
        if self.config.sync.enabled && self.started.load(Ordering::SeqCst) {
            self.spawn_steady_loop(url);
        }
        true
    }

    /// Drop a peer from the registry. Its steady loop exits on the next
    /// tick; ledger history and cursors are kept in case it returns.
    pub async fn remove_peer(&self, url: &str) -> bool {
        let url = url.trim_end_matches('/');
        let removed = self.registry.remove_peer(url).await.is_some();
        if removed {
            tracing::info!("peer {} removed", url);
        }
        removed
    }

    /// Pause or resume sync passes against one peer
    pub async fn set_peer_enabled(&self, url: &str, enabled: bool) -> bool {
        let url = url.trim_end_matches('/');
        let changed = self.registry.set_enabled(url, enabled).await;
        if changed {
            tracing::info!(
                "peer {} {}",
                url,
                if enabled { "enabled" } else { "disabled" }
            );
        }
        changed
    }

    // ---- Background loops ----

    /// Spawn the dispatcher, the per-peer steady loops, the catch-up
    /// evaluator, the file replication loop and the store health watch.
    /// Returns the task handles; tasks stop when `shutdown` is called.
    pub async fn start(self: &Arc<Self>) -> Result<Vec<JoinHandle<()>>> {
        let mut handles = Vec::new();

        if !self.config.sync.enabled {
            tracing::info!("sync disabled, running local-only");
            return Ok(handles);
        }

        if let Some(dispatcher) = self.dispatcher.lock().await.take() {
            let driver: Arc<dyn PassDriver> = self.clone();
            handles.extend(dispatcher.start(driver, self.shutdown_tx.subscribe()));
        }

        self.started.store(true, Ordering::SeqCst);
        let peers = self.registry.peers().await;
        for peer in &peers {
            handles.push(self.spawn_steady_loop(peer.url.clone()));
        }

        {
            let engine = Arc::clone(self);
            let mut shutdown = self.shutdown_tx.subscribe();
            handles.push(tokio::spawn(async move {
                let interval = engine.config.catchup_interval();
                loop {
                    tokio::select! {
                        _ = shutdown.changed() => return,
                        _ = tokio::time::sleep(interval) => {}
                    }
                    engine.catchup_round().await;
                }
            }));
        }

        if let Some(replicator) = &self.replicator {
            let engine = Arc::clone(self);
            let replicator = Arc::clone(replicator);
            let mut shutdown = self.shutdown_tx.subscribe();
            handles.push(tokio::spawn(async move {
                let interval = engine.config.file_interval();
                loop {
                    tokio::select! {
                        _ = shutdown.changed() => return,
                        _ = tokio::time::sleep(interval) => {}
                    }
                    engine.file_round(&replicator).await;
                }
            }));
        }

        {
            let engine = Arc::clone(self);
            let mut shutdown = self.shutdown_tx.subscribe();
            handles.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = shutdown.changed() => return,
                        _ = tokio::time::sleep(HEALTH_CHECK_INTERVAL) => {}
                    }
                    engine.check_store_health().await;
                }
            }));
        }

        tracing::info!(
            "sync engine started: {} peer(s), {} dispatch worker(s)",
            peers.len(),
            self.config.sync.dispatch_workers
        );
        Ok(handles)
    }

    /// Spawn the steady-cadence loop for one peer. The loop exits when
    /// the peer is removed from the registry or shutdown is signalled.
    fn spawn_steady_loop(self: &Arc<Self>, url: String) -> JoinHandle<()> {
        let engine = Arc::clone(self);
        let mut shutdown = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let base = engine.config.sync_interval();
            // Stagger first contact so restarted fleets do not all
            // probe at the same instant
            let start_delay = Duration::from_millis(rand::thread_rng().gen_range(0..=2000));
            tokio::select! {
                _ = shutdown.changed() => return,
                _ = tokio::time::sleep(start_delay) => {}
            }
            loop {
                let Some(peer) = engine.registry.get(&url).await else {
                    tracing::debug!("peer {} removed, stopping its sync loop", url);
                    return;
                };
                if peer.in_steady_cadence() {
                    engine.run_peer_pass(&url, PassKind::Steady).await;
                }
                let jitter_ms = (base.as_millis() / 5) as u64;
                let jitter =
                    Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms));
                tokio::select! {
                    _ = shutdown.changed() => return,
                    _ = tokio::time::sleep(base + jitter) => {}
                }
            }
        })
    }

    /// Evaluate every enabled peer, unreachable ones included, and run
    /// recovery passes where gaps exist.
    async fn catchup_round(&self) {
        for peer in self.registry.enabled_peers().await {
            if peer.reachability == Reachability::Unreachable {
                // Out of the steady cadence; this probe is its retry path
                tracing::info!("probing unreachable peer {}", peer.url);
                self.run_peer_pass(&peer.url, PassKind::CatchUp).await;
                continue;
            }
            let Some(peer_id) = peer.server_id.clone() else {
                // Never contacted; the steady loop's bootstrap covers it
                continue;
            };
            let head = peer.export_head.unwrap_or(0);
            match self.detector.behind(&peer_id, head).await {
                Ok(true) => {
                    tracing::info!("running catch-up pass against {} ({})", peer.url, peer_id);
                    self.run_peer_pass(&peer.url, PassKind::CatchUp).await;
                }
                Ok(false) => {}
                Err(err) => {
                    tracing::error!("catch-up evaluation for {} failed: {}", peer.url, err)
                }
            }
        }
    }

    async fn file_round(&self, replicator: &FileReplicator) {
        for peer in self.registry.steady_targets().await {
            let client = self.peer_client(&peer.url);
            match replicator.sync_with_peer(&client).await {
                Ok(outcome) if outcome.pulled + outcome.pushed + outcome.deleted > 0 => {
                    tracing::info!(
                        "file pass against {}: pulled {}, pushed {}, deleted {}",
                        peer.url,
                        outcome.pulled,
                        outcome.pushed,
                        outcome.deleted
                    );
                }
                Ok(_) => {}
                Err(err) if err.is_transient() => {
                    tracing::info!("file pass against {} failed: {}", peer.url, err)
                }
                Err(err) => {
                    tracing::error!("file pass against {} failed: {}", peer.url, err)
                }
            }
        }
    }

    async fn check_store_health(&self) {
        if self.fallback_store {
            return;
        }
        let healthy = matches!(self.store.health_check().await, Ok(true));
        let was_degraded = self.is_degraded();
        if !healthy && !was_degraded {
            self.degraded.store(true, Ordering::SeqCst);
            tracing::error!("application store failed its health check, entering degraded mode");
            self.events
                .record(EventKind::Degraded, "application store failed health check")
                .await;
        } else if healthy && was_degraded {
            self.degraded.store(false, Ordering::SeqCst);
            tracing::info!("application store recovered, leaving degraded mode");
        }
    }

    /// Signal every background task to stop
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }
}

#[async_trait::async_trait]
impl PassDriver for SyncEngine {
    async fn nudge_targets(&self) -> Vec<String> {
        self.registry
            .steady_targets()
            .await
            .into_iter()
            .map(|peer| peer.url)
            .collect()
    }

    async fn run_nudged_pass(&self, peer_url: &str) {
        self.run_peer_pass(peer_url, PassKind::Steady).await;
    }
}
