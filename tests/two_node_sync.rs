//! Two-node exchange over real HTTP.
//!
//! Each test spins up complete engines with their own temp data dirs
//! and app databases, serves the sync API on an OS-assigned port, and
//! drives passes by hand so outcomes are deterministic.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tempfile::{tempdir, TempDir};
use tokio::net::TcpListener;

use meshsync::api::HttpServer;
use meshsync::config::{
    ApiConfig, DatabaseConfig, FilesConfig, LoggingConfig, MeshSyncConfig, NodeConfig, SyncConfig,
};
use meshsync::dispatch::Change;
use meshsync::engine::SyncEngine;
use meshsync::executor::{RecordStore, SqliteStore};
use meshsync::network::PeerClient;
use meshsync::sync::PassKind;

struct TestNode {
    engine: Arc<SyncEngine>,
    url: String,
    db_config: DatabaseConfig,
    _dir: TempDir,
}

impl TestNode {
    /// Open the app database the way the host application would
    async fn app_store(&self) -> SqliteStore {
        SqliteStore::new(&self.db_config).await.unwrap()
    }

    async fn app_row(&self, table: &str, key: &str) -> Option<serde_json::Value> {
        self.app_store().await.read(table, key).await.unwrap()
    }

    fn shared_root(&self) -> std::path::PathBuf {
        self.engine.replicator().unwrap().root().to_path_buf()
    }
}

fn node_config(id: &str, dir: &Path, peers: Vec<String>) -> MeshSyncConfig {
    MeshSyncConfig {
        node: NodeConfig {
            id: id.to_string(),
            data_dir: dir.join("data"),
            advertise_url: None,
        },
        database: DatabaseConfig {
            path: dir.join("app.db"),
            pool_size: 2,
            busy_timeout_ms: 5000,
            key_column: "id".to_string(),
        },
        sync: SyncConfig {
            peers,
            ..SyncConfig::default()
        },
        files: FilesConfig {
            enabled: false,
            root: dir.join("shared"),
            interval_secs: 3600,
            exclude: vec!["logs".to_string()],
            max_file_mb: 16,
        },
        api: ApiConfig::default(),
        logging: LoggingConfig::default(),
    }
}

async fn start_node(config: MeshSyncConfig, dir: TempDir, listener: TcpListener) -> TestNode {
    // The host application owns its schema; it exists before the
    // engine attaches
    let store = SqliteStore::new(&config.database).await.unwrap();
    store
        .execute_raw("CREATE TABLE teams (id TEXT PRIMARY KEY, name TEXT, score INTEGER)")
        .await
        .unwrap();
    drop(store);

    let addr = listener.local_addr().unwrap();
    let db_config = config.database.clone();
    let api_config = config.api.clone();
    let engine = SyncEngine::new(config).await.unwrap();

    let server = HttpServer::new(api_config, Arc::clone(&engine));
    let shutdown = engine.shutdown_signal();
    tokio::spawn(async move {
        let _ = server.serve(listener, shutdown).await;
    });

    TestNode {
        engine,
        url: format!("http://{}", addr),
        db_config,
        _dir: dir,
    }
}

/// Two nodes, each configured with the other as its only peer
async fn two_nodes(adjust: impl Fn(&mut MeshSyncConfig)) -> (TestNode, TestNode) {
    let listener_a = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let listener_b = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url_a = format!("http://{}", listener_a.local_addr().unwrap());
    let url_b = format!("http://{}", listener_b.local_addr().unwrap());

    let dir_a = tempdir().unwrap();
    let dir_b = tempdir().unwrap();
    let mut config_a = node_config("server-a", dir_a.path(), vec![url_b]);
    let mut config_b = node_config("server-b", dir_b.path(), vec![url_a]);
    adjust(&mut config_a);
    adjust(&mut config_b);

    let a = start_node(config_a, dir_a, listener_a).await;
    let b = start_node(config_b, dir_b, listener_b).await;
    (a, b)
}

fn peer_client(node: &TestNode) -> PeerClient {
    PeerClient::new(
        &node.url,
        None,
        Duration::from_millis(2000),
        Duration::from_secs(10),
    )
}

#[tokio::test]
async fn test_one_pass_converges_both_directions() {
    let (a, b) = two_nodes(|_| {}).await;

    a.engine
        .capture_hook()
        .capture(Change::insert(
            "teams",
            "254",
            json!({"id": "254", "name": "Cheesy Poofs", "score": 100}),
        ))
        .await
        .unwrap();
    b.engine
        .capture_hook()
        .capture(Change::insert(
            "teams",
            "118",
            json!({"id": "118", "name": "Robonauts", "score": 90}),
        ))
        .await
        .unwrap();

    // One pass run by A pulls B's change and pushes A's own
    a.engine.run_peer_pass(&b.url, PassKind::Steady).await;

    assert_eq!(a.engine.ledger().count().await.unwrap(), 2);
    assert_eq!(b.engine.ledger().count().await.unwrap(), 2);

    let row = a.app_row("teams", "118").await.unwrap();
    assert_eq!(row["name"], "Robonauts");
    let row = b.app_row("teams", "254").await.unwrap();
    assert_eq!(row["name"], "Cheesy Poofs");

    // Cursors moved to each other's heads
    assert_eq!(
        a.engine.cursors().pulled_to("server-b").await.unwrap(),
        Some(1)
    );
    assert_eq!(
        b.engine.cursors().pulled_to("server-a").await.unwrap(),
        None,
        "B never ran a pass, so B's pull cursor stays unset"
    );
}

#[tokio::test]
async fn test_conflicting_writes_pick_the_same_winner_everywhere() {
    let (a, b) = two_nodes(|_| {}).await;

    a.engine
        .capture_hook()
        .capture(Change::insert(
            "teams",
            "254",
            json!({"id": "254", "name": "Cheesy Poofs", "score": 100}),
        ))
        .await
        .unwrap();
    // Strictly later wall clock, so B's version must win on both nodes
    tokio::time::sleep(Duration::from_millis(20)).await;
    b.engine
        .capture_hook()
        .capture(Change::insert(
            "teams",
            "254",
            json!({"id": "254", "name": "Cheesy Poofs", "score": 999}),
        ))
        .await
        .unwrap();

    a.engine.run_peer_pass(&b.url, PassKind::Steady).await;

    let row_a = a.app_row("teams", "254").await.unwrap();
    let row_b = b.app_row("teams", "254").await.unwrap();
    assert_eq!(row_a["score"], 999);
    assert_eq!(row_b["score"], 999);

    // Both ledgers carry both versions; losing is not an error
    assert_eq!(a.engine.ledger().count().await.unwrap(), 2);
    assert_eq!(b.engine.ledger().count().await.unwrap(), 2);
}

#[tokio::test]
async fn test_repeated_passes_change_nothing() {
    let (a, b) = two_nodes(|_| {}).await;

    for i in 0..3 {
        a.engine
            .capture_hook()
            .capture(Change::insert(
                "teams",
                &format!("t{}", i),
                json!({"id": format!("t{}", i), "name": "x", "score": i}),
            ))
            .await
            .unwrap();
    }

    a.engine.run_peer_pass(&b.url, PassKind::Steady).await;
    let after_first = b.engine.ledger().count().await.unwrap();
    assert_eq!(after_first, 3);

    a.engine.run_peer_pass(&b.url, PassKind::Steady).await;
    a.engine.run_peer_pass(&b.url, PassKind::Steady).await;

    assert_eq!(b.engine.ledger().count().await.unwrap(), 3);
    assert_eq!(a.engine.ledger().count().await.unwrap(), 3);
    assert_eq!(
        a.engine.cursors().pushed_to("server-b").await.unwrap(),
        Some(3)
    );
}

#[tokio::test]
async fn test_paging_walks_the_whole_backlog() {
    // Tiny pages so a modest backlog spans several requests
    let (a, b) = two_nodes(|config| config.sync.max_batch = 4).await;

    for i in 0..11 {
        b.engine
            .capture_hook()
            .capture(Change::insert(
                "teams",
                &format!("r{}", i),
                json!({"id": format!("r{}", i), "name": "bulk", "score": i}),
            ))
            .await
            .unwrap();
    }

    a.engine.run_peer_pass(&b.url, PassKind::Steady).await;

    assert_eq!(a.engine.ledger().count().await.unwrap(), 11);
    assert_eq!(
        a.engine.cursors().pulled_to("server-b").await.unwrap(),
        Some(11)
    );
    assert!(a.app_row("teams", "r10").await.is_some());
}

#[tokio::test]
async fn test_catchup_pass_fills_an_exact_gap() {
    let (a, b) = two_nodes(|_| {}).await;

    for i in 0..3 {
        b.engine
            .capture_hook()
            .capture(Change::insert(
                "teams",
                &format!("g{}", i),
                json!({"id": format!("g{}", i), "name": "gap", "score": i}),
            ))
            .await
            .unwrap();
    }
    a.engine.run_peer_pass(&b.url, PassKind::Steady).await;
    assert_eq!(
        a.engine.cursors().pulled_to("server-b").await.unwrap(),
        Some(3)
    );

    // B writes two more, but A only hears about the second one through
    // a relay push, leaving a hole beyond A's cursor
    for i in 3..5 {
        b.engine
            .capture_hook()
            .capture(Change::insert(
                "teams",
                &format!("g{}", i),
                json!({"id": format!("g{}", i), "name": "gap", "score": i}),
            ))
            .await
            .unwrap();
    }
    let page = b.engine.export_changes(3, 10).await.unwrap();
    assert_eq!(page.changes.len(), 2);
    a.engine
        .receive_changes(meshsync::sync::wire::PushRequest {
            server_id: "server-c".to_string(),
            changes: vec![page.changes[1].clone()],
        })
        .await
        .unwrap();
    assert_eq!(
        a.engine
            .ledger()
            .missing_origin_ids("server-b", 0, 5)
            .await
            .unwrap(),
        vec![4]
    );

    a.engine.run_peer_pass(&b.url, PassKind::CatchUp).await;

    assert!(a
        .engine
        .ledger()
        .missing_origin_ids("server-b", 0, 5)
        .await
        .unwrap()
        .is_empty());
    assert!(a.app_row("teams", "g3").await.is_some());
    assert_eq!(
        a.engine.cursors().pulled_to("server-b").await.unwrap(),
        Some(5)
    );

    let status = a.engine.catchup_status().await.unwrap();
    let entry = status
        .peers
        .iter()
        .find(|p| p.peer_id == "server-b")
        .unwrap();
    assert_eq!(entry.missing_count, 0);
}

#[tokio::test]
async fn test_ping_is_open_but_changes_need_the_token() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}", listener.local_addr().unwrap());
    let dir = tempdir().unwrap();
    let mut config = node_config("server-a", dir.path(), vec![]);
    config.sync.auth_token = Some("sekrit".to_string());
    let node = start_node(config, dir, listener).await;

    let client = reqwest::Client::new();

    let response = client
        .get(format!("{}/sync/ping", url))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let response = client
        .get(format!("{}/sync/changes?since_id=0&limit=10", url))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401);

    let response = client
        .get(format!("{}/sync/changes?since_id=0&limit=10", url))
        .header("x-sync-token", "sekrit")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    node.engine.shutdown();
}

#[tokio::test]
async fn test_files_mirror_and_tombstone_deletes() {
    let (a, b) = two_nodes(|config| config.files.enabled = true).await;

    let report = a.shared_root().join("reports/daily.txt");
    std::fs::create_dir_all(report.parent().unwrap()).unwrap();
    std::fs::write(&report, b"totals: 42").unwrap();

    let replicator_a = a.engine.replicator().unwrap();
    let outcome = replicator_a.sync_with_peer(&peer_client(&b)).await.unwrap();
    assert_eq!(outcome.pushed, 1);

    let mirrored = b.shared_root().join("reports/daily.txt");
    assert_eq!(std::fs::read(&mirrored).unwrap(), b"totals: 42");

    // A deletes; B adopts the tombstone when it next syncs against A
    std::fs::remove_file(&report).unwrap();
    replicator_a.scan().await.unwrap();

    let replicator_b = b.engine.replicator().unwrap();
    let outcome = replicator_b.sync_with_peer(&peer_client(&a)).await.unwrap();
    assert_eq!(outcome.deleted, 1);
    assert!(!mirrored.exists());
}

#[tokio::test]
#[cfg_attr(not(feature = "integration"), ignore)]
async fn test_large_backlog_converges() {
    let (a, b) = two_nodes(|_| {}).await;

    for i in 0..1200 {
        let hook = if i % 2 == 0 {
            a.engine.capture_hook()
        } else {
            b.engine.capture_hook()
        };
        hook.capture(Change::insert(
            "teams",
            &format!("k{}", i),
            json!({"id": format!("k{}", i), "name": "load", "score": i}),
        ))
        .await
        .unwrap();
    }

    a.engine.run_peer_pass(&b.url, PassKind::Steady).await;

    assert_eq!(a.engine.ledger().count().await.unwrap(), 1200);
    assert_eq!(b.engine.ledger().count().await.unwrap(), 1200);
    assert!(a.app_row("teams", "k1199").await.is_some());
    assert!(b.app_row("teams", "k0").await.is_some());
}
