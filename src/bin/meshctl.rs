//! MeshCtl - Command line tool for inspecting MeshSync nodes
//!
//! Usage:
//!   meshctl status           - Show local node status
//!   meshctl peers            - Show configured peers and reachability
//!   meshctl peer add <url>   - Register a peer (also remove/enable/disable)
//!   meshctl catchup          - Show catch-up progress per peer
//!   meshctl log              - Show recent sync events
//!   meshctl sync             - Nudge sync passes now
//!   meshctl watch            - Live view (updates every second)

use clap::{Parser, Subcommand};
use serde::Deserialize;
use std::path::PathBuf;

/// MeshSync Node Control Tool
#[derive(Parser)]
#[command(name = "meshctl")]
#[command(about = "Inspect and nudge MeshSync nodes", long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "/etc/meshsync/meshsync.toml")]
    config: PathBuf,

    /// API endpoint to connect to (overrides config)
    #[arg(short, long)]
    endpoint: Option<String>,

    /// Sync token (overrides config)
    #[arg(short, long)]
    token: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show status of the local node
    Status,
    /// Show configured peers and their reachability
    Peers,

    /// Manage the peer set of a running node
    Peer {
        #[command(subcommand)]
        action: PeerAction,
    },
    /// Show catch-up progress per peer
    Catchup,
    /// Show recent sync events
    Log {
        /// Number of events to show
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },
    /// Nudge sync passes now
    Sync {
        /// Limit the nudge to one peer URL
        #[arg(long)]
        peer: Option<String>,
    },
    /// Show live sync activity (updates every second, Ctrl+C to exit)
    Watch,
}

#[derive(Subcommand)]
enum PeerAction {
    /// Register a new peer by base URL
    Add { url: String },
    /// Remove a peer from the registry
    Remove { url: String },
    /// Resume sync passes against a peer
    Enable { url: String },
    /// Pause sync passes against a peer
    Disable { url: String },
}

// ============ API Response Types ============

#[allow(dead_code)]
#[derive(Debug, Deserialize)]
struct StatusResponse {
    #[serde(default)]
    server_id: String,
    #[serde(default)]
    healthy: bool,
    #[serde(default)]
    degraded: bool,
    #[serde(default)]
    uptime_seconds: u64,
    #[serde(default)]
    store_backend: String,
    #[serde(default)]
    total_changes: i64,
    #[serde(default)]
    export_head: i64,
    #[serde(default)]
    unsynced_changes: i64,
    #[serde(default)]
    peers: Vec<PeerInfo>,
    #[serde(default)]
    counters: Counters,
}

#[allow(dead_code)]
#[derive(Debug, Deserialize)]
struct PeerInfo {
    #[serde(default)]
    url: String,
    #[serde(default)]
    server_id: Option<String>,
    #[serde(default = "unknown_state")]
    reachability: String,
    #[serde(default)]
    consecutive_failures: u32,
    #[serde(default)]
    sync_enabled: bool,
    #[serde(default)]
    export_head: Option<i64>,
    #[serde(default)]
    pending: i64,
    #[serde(default)]
    last_success: Option<String>,
}

fn unknown_state() -> String {
    "Unknown".to_string()
}

#[allow(dead_code)]
#[derive(Debug, Default, Deserialize)]
struct Counters {
    #[serde(default)]
    conflicts_resolved: u64,
    #[serde(default)]
    applies_skipped: u64,
    #[serde(default)]
    passes_completed: u64,
    #[serde(default)]
    passes_failed: u64,
    #[serde(default)]
    files_replicated: u64,
}

#[derive(Debug, Deserialize)]
struct CatchupResponse {
    #[serde(default)]
    server_id: String,
    #[serde(default)]
    peers: Vec<PeerCatchup>,
}

#[derive(Debug, Deserialize)]
struct PeerCatchup {
    #[serde(default)]
    peer_id: String,
    #[serde(default)]
    missing_count: u64,
}

#[derive(Debug, Deserialize)]
struct LogResponse {
    #[serde(default)]
    events: Vec<SyncEvent>,
}

#[derive(Debug, Deserialize)]
struct SyncEvent {
    #[serde(default)]
    at: String,
    #[serde(default)]
    kind: String,
    #[serde(default)]
    detail: String,
}

#[derive(Debug, Deserialize)]
struct RunResponse {
    #[serde(default)]
    requested: usize,
}

#[derive(Debug, Deserialize)]
struct PeerAdminResponse {
    #[serde(default)]
    url: String,
    #[serde(default)]
    changed: bool,
}

// ============ Config ============

#[derive(Debug, Default, Deserialize)]
struct Config {
    #[serde(default)]
    api: ApiConfig,
    #[serde(default)]
    sync: SyncSection,
}

#[derive(Debug, Deserialize, Default)]
struct ApiConfig {
    #[serde(default = "default_api_bind")]
    bind_address: String,
}

fn default_api_bind() -> String {
    "0.0.0.0:7655".to_string()
}

#[derive(Debug, Deserialize, Default)]
struct SyncSection {
    #[serde(default)]
    auth_token: Option<String>,
}

// ============ Main ============

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let file_config = if cli.config.exists() {
        std::fs::read_to_string(&cli.config)
            .ok()
            .and_then(|content| toml::from_str::<Config>(&content).ok())
            .unwrap_or_default()
    } else {
        Config::default()
    };

    let endpoint = match &cli.endpoint {
        Some(e) => e.clone(),
        None => {
            let addr = &file_config.api.bind_address;
            if addr.starts_with("0.0.0.0") {
                format!(
                    "http://127.0.0.1:{}",
                    addr.split(':').nth(1).unwrap_or("7655")
                )
            } else {
                format!("http://{}", addr)
            }
        }
    };
    let token = cli.token.clone().or(file_config.sync.auth_token);
    let ctl = Ctl::new(endpoint, token);

    let result = match &cli.command {
        Commands::Status => show_status(&ctl).await,
        Commands::Peers => show_peers(&ctl).await,
        Commands::Peer { action } => peer_admin(&ctl, action).await,
        Commands::Catchup => show_catchup(&ctl).await,
        Commands::Log { limit } => show_log(&ctl, *limit).await,
        Commands::Sync { peer } => nudge_sync(&ctl, peer.clone()).await,
        Commands::Watch => watch(&ctl).await,
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

/// Endpoint plus the optional sync token every request carries
struct Ctl {
    endpoint: String,
    token: Option<String>,
    client: reqwest::Client,
}

impl Ctl {
    fn new(endpoint: String, token: Option<String>) -> Self {
        Self {
            endpoint,
            token,
            client: reqwest::Client::new(),
        }
    }

    fn get(&self, path: &str) -> reqwest::RequestBuilder {
        self.authed(self.client.get(format!("{}{}", self.endpoint, path)))
    }

    fn post(&self, path: &str) -> reqwest::RequestBuilder {
        self.authed(self.client.post(format!("{}{}", self.endpoint, path)))
    }

    fn authed(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => builder.header("x-sync-token", token),
            None => builder,
        }
    }
}

async fn fetch_status(ctl: &Ctl) -> Result<StatusResponse, Box<dyn std::error::Error>> {
    let response = ctl.get("/sync/status").send().await?;
    if !response.status().is_success() {
        return Err(format!("API error: {}", response.status()).into());
    }
    Ok(response.json().await?)
}

// ============ Commands ============

async fn show_status(ctl: &Ctl) -> Result<(), Box<dyn std::error::Error>> {
    let status = fetch_status(ctl).await?;

    let health = if status.degraded {
        "\x1b[1;31mDEGRADED\x1b[0m"
    } else if status.healthy {
        "\x1b[1;32mHealthy\x1b[0m"
    } else {
        "\x1b[1;33mUnhealthy\x1b[0m"
    };

    println!();
    println!("Node Status");
    println!("===========");
    println!();
    println!("Server ID:    {}", status.server_id);
    println!("Health:       {}", health);
    println!("Store:        {}", status.store_backend);
    println!("Uptime:       {}", format_duration_secs(status.uptime_seconds));
    println!();
    println!("Ledger:");
    println!("  Changes:    {}", status.total_changes);
    println!("  Own Head:   {}", status.export_head);
    println!("  Unsynced:   {}", status.unsynced_changes);
    println!();
    println!("Totals:");
    println!("  Passes:     {} ok, {} failed", status.counters.passes_completed, status.counters.passes_failed);
    println!("  Conflicts:  {}", status.counters.conflicts_resolved);
    println!("  Skipped:    {}", status.counters.applies_skipped);
    println!("  Files:      {}", status.counters.files_replicated);
    println!();
    println!("Peers:        {}", status.peers.len());
    println!();

    Ok(())
}

async fn show_peers(ctl: &Ctl) -> Result<(), Box<dyn std::error::Error>> {
    let status = fetch_status(ctl).await?;

    println!();
    println!(
        "MeshSync Peers (meshctl v{})",
        env!("CARGO_PKG_VERSION")
    );
    println!("========================================");
    println!();

    if status.peers.is_empty() {
        println!("No peers configured.");
        println!();
        return Ok(());
    }

    println!(
        "{:<30} {:<15} {:<13} {:<9} {:<8} {:<8}",
        "URL", "SERVER ID", "STATE", "FAILURES", "HEAD", "PENDING"
    );
    println!("{}", "-".repeat(88));

    for peer in &status.peers {
        // Pad state to fixed width BEFORE adding color codes
        let state_padded = format!("{:<13}", peer.reachability);
        let state_colored = match peer.reachability.as_str() {
            "Healthy" => format!("\x1b[32m{}\x1b[0m", state_padded),
            "Unknown" => format!("\x1b[33m{}\x1b[0m", state_padded),
            "Unreachable" => format!("\x1b[31m{}\x1b[0m", state_padded),
            _ => state_padded,
        };

        let head = peer
            .export_head
            .map(|h| h.to_string())
            .unwrap_or_else(|| "-".to_string());

        println!(
            "{:<30} {:<15} {} {:<9} {:<8} {:<8}",
            peer.url,
            peer.server_id.as_deref().unwrap_or("-"),
            state_colored,
            peer.consecutive_failures,
            head,
            peer.pending
        );
    }
    println!();

    Ok(())
}

async fn show_catchup(ctl: &Ctl) -> Result<(), Box<dyn std::error::Error>> {
    let response = ctl.get("/sync/catchup/status").send().await?;
    if !response.status().is_success() {
        return Err(format!("API error: {}", response.status()).into());
    }
    let catchup: CatchupResponse = response.json().await?;

    println!();
    println!("Catch-Up Status for {}", catchup.server_id);
    println!("========================================");
    println!();

    if catchup.peers.is_empty() {
        println!("No peers contacted yet.");
        println!();
        return Ok(());
    }

    println!("{:<20} {:<10} {:<12}", "PEER", "MISSING", "STATE");
    println!("{}", "-".repeat(44));
    for peer in &catchup.peers {
        let state = if peer.missing_count == 0 {
            "\x1b[32mcaught up\x1b[0m"
        } else {
            "\x1b[33mbehind\x1b[0m"
        };
        println!("{:<20} {:<10} {}", peer.peer_id, peer.missing_count, state);
    }
    println!();

    Ok(())
}

async fn show_log(ctl: &Ctl, limit: usize) -> Result<(), Box<dyn std::error::Error>> {
    let response = ctl
        .get(&format!("/sync/log?limit={}", limit))
        .send()
        .await?;
    if !response.status().is_success() {
        return Err(format!("API error: {}", response.status()).into());
    }
    let log: LogResponse = response.json().await?;

    println!();
    if log.events.is_empty() {
        println!("No sync events recorded.");
        println!();
        return Ok(());
    }

    for event in &log.events {
        let kind_colored = match event.kind.as_str() {
            "pass_failed" | "peer_unreachable" | "degraded" => {
                format!("\x1b[31m{:<18}\x1b[0m", event.kind)
            }
            "conflict_resolved" | "apply_skipped" => {
                format!("\x1b[33m{:<18}\x1b[0m", event.kind)
            }
            _ => format!("\x1b[32m{:<18}\x1b[0m", event.kind),
        };
        // Timestamps come back RFC 3339; seconds precision is plenty here
        let at = event.at.get(..19).unwrap_or(&event.at);
        println!("{}  {}  {}", at, kind_colored, event.detail);
    }
    println!();

    Ok(())
}

async fn nudge_sync(ctl: &Ctl, peer: Option<String>) -> Result<(), Box<dyn std::error::Error>> {
    let body = match peer {
        Some(url) => serde_json::json!({ "peer": url }),
        None => serde_json::json!({}),
    };
    let response = ctl.post("/sync/run").json(&body).send().await?;
    if !response.status().is_success() {
        return Err(format!("API error: {}", response.status()).into());
    }
    let run: RunResponse = response.json().await?;

    if run.requested == 0 {
        println!("No eligible peers to sync with.");
    } else {
        println!("Requested {} sync pass(es).", run.requested);
    }

    Ok(())
}

async fn peer_admin(ctl: &Ctl, action: &PeerAction) -> Result<(), Box<dyn std::error::Error>> {
    let (path, url, verb) = match action {
        PeerAction::Add { url } => ("/sync/peers/add", url, "added"),
        PeerAction::Remove { url } => ("/sync/peers/remove", url, "removed"),
        PeerAction::Enable { url } => ("/sync/peers/enable", url, "enabled"),
        PeerAction::Disable { url } => ("/sync/peers/disable", url, "disabled"),
    };
    let response = ctl
        .post(path)
        .json(&serde_json::json!({ "url": url }))
        .send()
        .await?;
    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if body.is_empty() {
            return Err(format!("API error: {status}").into());
        }
        return Err(format!("API error: {status}: {body}").into());
    }
    let result: PeerAdminResponse = response.json().await?;

    if result.changed {
        println!("Peer {} {}.", result.url, verb);
    } else if matches!(action, PeerAction::Add { .. }) {
        println!("Peer {} is already configured.", result.url);
    } else {
        println!("Peer {} is not configured.", result.url);
    }

    Ok(())
}

// ============ Watch ============

async fn watch(ctl: &Ctl) -> Result<(), Box<dyn std::error::Error>> {
    let mut last_total: Option<i64> = None;
    let mut last_time = std::time::Instant::now();
    let mut changes_per_sec: f64 = 0.0;

    // Throughput history for graph (last 40 samples)
    let mut history: Vec<f64> = vec![0.0; 40];
    let mut peak: f64 = 10.0;
    let start_time = std::time::Instant::now();

    // Hide cursor
    print!("\x1b[?25l");

    let running = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        r.store(false, std::sync::atomic::Ordering::SeqCst);
    })?;

    while running.load(std::sync::atomic::Ordering::SeqCst) {
        // Clear screen and move cursor to top
        print!("\x1b[H\x1b[J");

        println!();
        println!("  \x1b[1;36mMeshSync Live Activity\x1b[0m");
        println!("  {}", "=".repeat(50));
        println!();

        match fetch_status(ctl).await {
            Ok(status) => {
                let now = std::time::Instant::now();
                let elapsed = now.duration_since(last_time).as_secs_f64();

                if let Some(prev) = last_total {
                    if elapsed > 0.0 && status.total_changes > prev {
                        changes_per_sec = (status.total_changes - prev) as f64 / elapsed;
                    } else if elapsed > 2.0 {
                        changes_per_sec *= 0.5;
                    }
                }
                last_total = Some(status.total_changes);
                last_time = now;

                history.remove(0);
                history.push(changes_per_sec);
                if changes_per_sec > peak {
                    peak = changes_per_sec * 1.2;
                }

                let health = if status.degraded {
                    "\x1b[1;31mDEGRADED\x1b[0m"
                } else {
                    "\x1b[1;32mhealthy\x1b[0m"
                };

                println!("  Node:     {}  [{}]", status.server_id, health);
                println!(
                    "  Ledger:   {} changes, own head {}, {} unsynced",
                    status.total_changes, status.export_head, status.unsynced_changes
                );
                println!(
                    "  Passes:   {} ok / {} failed  |  Conflicts: {}",
                    status.counters.passes_completed,
                    status.counters.passes_failed,
                    status.counters.conflicts_resolved
                );
                println!();

                println!("  \x1b[1mChanges absorbed (last 40s)\x1b[0m");
                draw_rate_graph(&history, peak);
                println!();

                println!("  \x1b[1mPeers\x1b[0m");
                println!("  {}", "-".repeat(50));
                for peer in &status.peers {
                    let state_char = match peer.reachability.as_str() {
                        "Healthy" => "\x1b[32m[OK]\x1b[0m",
                        "Unknown" => "\x1b[33m[??]\x1b[0m",
                        "Unreachable" => "\x1b[31m[XX]\x1b[0m",
                        _ => "[??]",
                    };
                    let head = peer
                        .export_head
                        .map(|h| h.to_string())
                        .unwrap_or_else(|| "-".to_string());
                    println!(
                        "  {} {:<28} {:<12} head: {}",
                        state_char,
                        peer.url,
                        peer.server_id.as_deref().unwrap_or("-"),
                        head
                    );
                }

                println!();
                let uptime_fmt = format_duration_secs(start_time.elapsed().as_secs());
                println!("  \x1b[2mSession: {} | Ctrl+C to exit\x1b[0m", uptime_fmt);
            }
            Err(e) => {
                println!("  \x1b[31mConnection Error: {}\x1b[0m", e);
                println!("  Is MeshSync running?");
                println!("  \x1b[2mCtrl+C to exit\x1b[0m");
            }
        }

        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
    }

    // Show cursor again
    print!("\x1b[?25h");
    println!();
    println!("Watch stopped.");

    Ok(())
}

/// Draw an ASCII graph of the change absorption rate
fn draw_rate_graph(history: &[f64], max_val: f64) {
    let graph_height = 5;
    let graph_width = history.len();

    for row in (0..graph_height).rev() {
        let threshold = (row as f64 / graph_height as f64) * max_val;

        if row == graph_height - 1 {
            print!("  {:>6.0} |", max_val);
        } else if row == 0 {
            print!("       0 |");
        } else {
            print!("         |");
        }

        for &val in history {
            if val >= threshold {
                print!("\x1b[32m#\x1b[0m");
            } else {
                print!(" ");
            }
        }
        println!("|");
    }

    print!("         +");
    print!("{}", "-".repeat(graph_width));
    println!("+");
}

/// Format seconds as a human-readable duration
fn format_duration_secs(secs: u64) -> String {
    if secs >= 3600 {
        format!("{}h {}m", secs / 3600, (secs % 3600) / 60)
    } else if secs >= 60 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}s", secs)
    }
}
