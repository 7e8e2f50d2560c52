//! HTTP Sync API
//!
//! The wire surface peers talk to: change pull/push, ping, catch-up
//! status and the file mirror endpoints, plus the operator endpoints
//! meshctl reads. Handlers stay thin; everything of substance lives in
//! the engine.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, Query, Request, State},
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::config::ApiConfig;
use crate::engine::SyncEngine;
use crate::error::{Error, Result};
use crate::ledger::ChangeId;
use crate::state::Peer;
use crate::sync::wire::{
    CatchupStatus, ChangesResponse, ManifestResponse, PeerAdminResponse, PeerRequest,
    PingResponse, PushRequest, PushResponse, RunRequest, RunResponse, StoreFileResponse,
    AUTH_HEADER, FILE_HASH_HEADER, FILE_MTIME_HEADER,
};
use crate::synclog::{EventCounters, SyncEvent};

/// Shared handler state
#[derive(Clone)]
pub struct ApiState {
    pub engine: Arc<SyncEngine>,
    pub auth_token: Option<String>,
}

/// HTTP server for the sync API
pub struct HttpServer {
    config: ApiConfig,
    state: ApiState,
}

impl HttpServer {
    pub fn new(config: ApiConfig, engine: Arc<SyncEngine>) -> Self {
        let auth_token = engine.config().sync.auth_token.clone();
        Self {
            config,
            state: ApiState { engine, auth_token },
        }
    }

    /// Create the router
    fn create_router(state: ApiState) -> Router {
        // Ping stays open so reachability probes work without a token
        let protected = Router::new()
            .route("/sync/changes", get(handle_pull).post(handle_push))
            .route("/sync/catchup/status", get(handle_catchup_status))
            .route("/sync/status", get(handle_status))
            .route("/sync/log", get(handle_log))
            .route("/sync/run", post(handle_run))
            .route("/sync/peers", get(handle_peers))
            .route("/sync/peers/add", post(handle_peer_add))
            .route("/sync/peers/remove", post(handle_peer_remove))
            .route("/sync/peers/enable", post(handle_peer_enable))
            .route("/sync/peers/disable", post(handle_peer_disable))
            .route("/files/manifest", get(handle_manifest))
            .route("/files/*path", get(handle_get_file).put(handle_put_file))
            .route_layer(middleware::from_fn_with_state(
                state.clone(),
                require_token,
            ));

        Router::new()
            .route("/sync/ping", get(handle_ping))
            .merge(protected)
            .with_state(state)
    }

    /// Bind the configured address and serve until shutdown
    pub async fn start(&self, shutdown: watch::Receiver<bool>) -> Result<()> {
        if !self.config.enabled {
            tracing::info!("sync API disabled");
            return Ok(());
        }

        let listener = tokio::net::TcpListener::bind(&self.config.bind_address)
            .await
            .map_err(|e| {
                Error::Network(format!("failed to bind {}: {}", self.config.bind_address, e))
            })?;
        tracing::info!("sync API listening on {}", self.config.bind_address);
        self.serve(listener, shutdown).await
    }

    /// Serve on an already-bound listener. Integration setups bind port
    /// 0 and need the chosen address before starting.
    pub async fn serve(
        &self,
        listener: tokio::net::TcpListener,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        let mut router = Self::create_router(self.state.clone());
        if self.config.cors_enabled {
            router = router.layer(CorsLayer::permissive());
        }
        let router = router.layer(TraceLayer::new_for_http());

        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                let _ = shutdown.changed().await;
            })
            .await
            .map_err(|e| Error::Network(format!("sync API server failed: {}", e)))
    }
}

// ============ Request/Response Types ============

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

#[derive(Debug, Deserialize)]
struct PullParams {
    #[serde(default)]
    since_id: ChangeId,
    #[serde(default = "default_pull_limit")]
    limit: u32,
}

fn default_pull_limit() -> u32 {
    500
}

#[derive(Debug, Deserialize)]
struct LogParams {
    #[serde(default = "default_log_limit")]
    limit: usize,
}

fn default_log_limit() -> usize {
    50
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub server_id: String,
    pub healthy: bool,
    pub degraded: bool,
    pub uptime_seconds: u64,
    pub store_backend: String,
    pub total_changes: i64,
    pub export_head: i64,
    /// Local changes not yet acknowledged by every identified peer
    pub unsynced_changes: i64,
    pub peers: Vec<PeerStatus>,
    pub counters: EventCounters,
}

/// Registry entry plus that peer's sync progress
#[derive(Debug, Serialize, Deserialize)]
pub struct PeerStatus {
    #[serde(flatten)]
    pub peer: Peer,
    /// Highest of the peer's changes applied locally
    pub pulled_to: Option<ChangeId>,
    /// Highest local change the peer has acknowledged
    pub pushed_to: Option<ChangeId>,
    /// Local changes this peer has not acknowledged yet
    pub pending: i64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LogResponse {
    pub events: Vec<SyncEvent>,
    pub counters: EventCounters,
}

/// Error wrapper that renders as a JSON error body
struct ApiError(Error);

type ApiResult<T> = std::result::Result<T, ApiError>;

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = match &self.0 {
            Error::AuthRejected(_) => (StatusCode::UNAUTHORIZED, "AUTH_REJECTED"),
            Error::Protocol(_) => (StatusCode::BAD_REQUEST, "BAD_REQUEST"),
            Error::HashMismatch { .. } => (StatusCode::BAD_REQUEST, "HASH_MISMATCH"),
            Error::State(_) => (StatusCode::SERVICE_UNAVAILABLE, "DEGRADED"),
            Error::ShuttingDown => (StatusCode::SERVICE_UNAVAILABLE, "SHUTTING_DOWN"),
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL"),
        };
        (
            status,
            Json(ErrorResponse {
                error: self.0.to_string(),
                code: code.to_string(),
            }),
        )
            .into_response()
    }
}

// ============ Middleware ============

async fn require_token(State(state): State<ApiState>, request: Request, next: Next) -> Response {
    if let Some(expected) = &state.auth_token {
        let provided = request
            .headers()
            .get(AUTH_HEADER)
            .and_then(|value| value.to_str().ok());
        if provided != Some(expected.as_str()) {
            return ApiError(Error::AuthRejected(
                "missing or invalid sync token".to_string(),
            ))
            .into_response();
        }
    }
    next.run(request).await
}

// ============ Handlers ============

async fn handle_ping(State(state): State<ApiState>) -> Json<PingResponse> {
    Json(state.engine.ping_response().await)
}

async fn handle_pull(
    State(state): State<ApiState>,
    Query(params): Query<PullParams>,
) -> ApiResult<Json<ChangesResponse>> {
    let response = state
        .engine
        .export_changes(params.since_id, params.limit)
        .await?;
    Ok(Json(response))
}

async fn handle_push(
    State(state): State<ApiState>,
    Json(request): Json<PushRequest>,
) -> ApiResult<Json<PushResponse>> {
    Ok(Json(state.engine.receive_changes(request).await?))
}

async fn handle_catchup_status(
    State(state): State<ApiState>,
) -> ApiResult<Json<CatchupStatus>> {
    Ok(Json(state.engine.catchup_status().await?))
}

/// Registry peers joined with their cursor progress
async fn peer_statuses(engine: &SyncEngine) -> Result<Vec<PeerStatus>> {
    let mut peers = Vec::new();
    for peer in engine.registry().peers().await {
        let (pulled_to, pushed_to) = match &peer.server_id {
            Some(id) => (
                engine.cursors().pulled_to(id).await?,
                engine.cursors().pushed_to(id).await?,
            ),
            None => (None, None),
        };
        let pending = engine
            .ledger()
            .pending_count(pushed_to.unwrap_or(0))
            .await?;
        peers.push(PeerStatus {
            peer,
            pulled_to,
            pushed_to,
            pending,
        });
    }
    Ok(peers)
}

async fn handle_status(State(state): State<ApiState>) -> ApiResult<Json<StatusResponse>> {
    let engine = &state.engine;
    let peers = peer_statuses(engine).await?;
    let identified = engine.registry().known_server_ids().await;
    Ok(Json(StatusResponse {
        server_id: engine.server_id().to_string(),
        healthy: engine.healthy().await,
        degraded: engine.is_degraded(),
        uptime_seconds: engine.uptime_seconds(),
        store_backend: engine.store_backend().to_string(),
        total_changes: engine.ledger().count().await?,
        export_head: engine.ledger().export_head().await?,
        unsynced_changes: engine.ledger().unsynced_count(&identified).await?,
        peers,
        counters: engine.events().counters(),
    }))
}

async fn handle_log(
    State(state): State<ApiState>,
    Query(params): Query<LogParams>,
) -> Json<LogResponse> {
    let events = state.engine.events().recent(params.limit).await;
    let counters = state.engine.events().counters();
    Json(LogResponse { events, counters })
}

async fn handle_run(
    State(state): State<ApiState>,
    Json(request): Json<RunRequest>,
) -> Json<RunResponse> {
    let requested = state.engine.request_run(request.peer).await;
    Json(RunResponse { requested })
}

async fn handle_peers(State(state): State<ApiState>) -> ApiResult<Json<Vec<PeerStatus>>> {
    Ok(Json(peer_statuses(&state.engine).await?))
}

async fn handle_peer_add(
    State(state): State<ApiState>,
    Json(request): Json<PeerRequest>,
) -> ApiResult<Json<PeerAdminResponse>> {
    let url = request.url.trim_end_matches('/').to_string();
    if !url.starts_with("http://") && !url.starts_with("https://") {
        return Err(Error::Protocol(format!(
            "peer url must be http(s), got {:?}",
            request.url
        ))
        .into());
    }
    let changed = state.engine.add_peer(&url).await;
    Ok(Json(PeerAdminResponse { url, changed }))
}

async fn handle_peer_remove(
    State(state): State<ApiState>,
    Json(request): Json<PeerRequest>,
) -> ApiResult<Json<PeerAdminResponse>> {
    let url = request.url.trim_end_matches('/').to_string();
    let changed = state.engine.remove_peer(&url).await;
    Ok(Json(PeerAdminResponse { url, changed }))
}

async fn handle_peer_enable(
    State(state): State<ApiState>,
    Json(request): Json<PeerRequest>,
) -> ApiResult<Json<PeerAdminResponse>> {
    let url = request.url.trim_end_matches('/').to_string();
    let changed = state.engine.set_peer_enabled(&url, true).await;
    Ok(Json(PeerAdminResponse { url, changed }))
}

async fn handle_peer_disable(
    State(state): State<ApiState>,
    Json(request): Json<PeerRequest>,
) -> ApiResult<Json<PeerAdminResponse>> {
    let url = request.url.trim_end_matches('/').to_string();
    let changed = state.engine.set_peer_enabled(&url, false).await;
    Ok(Json(PeerAdminResponse { url, changed }))
}

async fn handle_manifest(State(state): State<ApiState>) -> ApiResult<Json<ManifestResponse>> {
    let replicator = replicator_or_disabled(&state)?;
    Ok(Json(replicator.manifest().await?))
}

async fn handle_get_file(
    State(state): State<ApiState>,
    Path(path): Path<String>,
) -> ApiResult<Response> {
    let replicator = replicator_or_disabled(&state)?;
    match replicator.file_info(&path).await? {
        Some((abs_path, record)) => {
            let bytes = tokio::fs::read(&abs_path).await.map_err(Error::from)?;
            let mut response = bytes.into_response();
            if let Ok(value) = HeaderValue::from_str(&record.sha256) {
                response
                    .headers_mut()
                    .insert(HeaderName::from_static(FILE_HASH_HEADER), value);
            }
            response.headers_mut().insert(
                HeaderName::from_static(FILE_MTIME_HEADER),
                HeaderValue::from(record.mtime_ms),
            );
            Ok(response)
        }
        None => Ok((
            StatusCode::NOT_FOUND,
            Json(ErrorResponse {
                error: format!("no such file: {}", path),
                code: "NOT_FOUND".to_string(),
            }),
        )
            .into_response()),
    }
}

async fn handle_put_file(
    State(state): State<ApiState>,
    Path(path): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Json<StoreFileResponse>> {
    let replicator = replicator_or_disabled(&state)?;
    let sha256 = header_str(&headers, FILE_HASH_HEADER)
        .ok_or_else(|| Error::Protocol(format!("missing {} header", FILE_HASH_HEADER)))?;
    let mtime_ms = header_str(&headers, FILE_MTIME_HEADER)
        .and_then(|value| value.parse::<i64>().ok())
        .ok_or_else(|| Error::Protocol(format!("missing {} header", FILE_MTIME_HEADER)))?;

    let stored = replicator
        .store_incoming(&path, body, &sha256, mtime_ms)
        .await?;
    Ok(Json(StoreFileResponse { stored }))
}

// ============ Helpers ============

fn replicator_or_disabled(state: &ApiState) -> ApiResult<&crate::files::FileReplicator> {
    state
        .engine
        .replicator()
        .ok_or_else(|| ApiError(Error::Protocol("file replication disabled".to_string())))
}

fn header_str(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.to_string())
}
