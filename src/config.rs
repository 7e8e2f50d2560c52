//! MeshSync Configuration
//!
//! This module provides configuration structures for the MeshSync
//! peer-to-peer synchronization engine.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Main MeshSync configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeshSyncConfig {
    /// Node-specific configuration
    pub node: NodeConfig,

    /// Application database configuration
    pub database: DatabaseConfig,

    /// Sync protocol configuration
    #[serde(default)]
    pub sync: SyncConfig,

    /// File replication configuration
    #[serde(default)]
    pub files: FilesConfig,

    /// API configuration
    #[serde(default)]
    pub api: ApiConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Node-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Unique server identifier (used in change origin stamps)
    pub id: String,

    /// Data directory for engine state storage
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// URL peers should use to reach this node (informational)
    #[serde(default)]
    pub advertise_url: Option<String>,
}

/// Application database configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DatabaseConfig {
    /// Path to the application SQLite database
    pub path: PathBuf,

    /// Connection pool size
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,

    /// SQLite busy timeout in milliseconds
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,

    /// Fallback key column for tables without a declared primary key
    #[serde(default = "default_key_column")]
    pub key_column: String,
}

impl DatabaseConfig {
    /// Connection URL for the application database
    pub fn url(&self) -> String {
        format!("sqlite://{}?mode=rwc", self.path.display())
    }
}

/// Sync protocol configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Enable outbound synchronization
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Peer base URLs (e.g. "http://10.0.0.2:7655")
    #[serde(default)]
    pub peers: Vec<String>,

    /// Steady-state sync interval in seconds
    #[serde(default = "default_sync_interval_secs")]
    pub interval_secs: u64,

    /// Catch-up evaluation interval in seconds
    #[serde(default = "default_catchup_interval_secs")]
    pub catchup_interval_secs: u64,

    /// Whole-pass timeout in seconds
    #[serde(default = "default_pass_timeout_secs")]
    pub pass_timeout_secs: u64,

    /// Maximum change records per request in steady passes
    #[serde(default = "default_max_batch")]
    pub max_batch: u32,

    /// Lookback window (in records) for peers that have never synced
    #[serde(default = "default_bootstrap_max_changes")]
    pub bootstrap_max_changes: u32,

    /// Dispatcher worker pool size
    #[serde(default = "default_dispatch_workers")]
    pub dispatch_workers: usize,

    /// Dispatcher queue capacity (notices beyond this are dropped)
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Consecutive contact failures before a peer is marked unreachable
    #[serde(default = "default_unreachable_after")]
    pub unreachable_after: u32,

    /// Liveness probe timeout in milliseconds
    #[serde(default = "default_ping_timeout_ms")]
    pub ping_timeout_ms: u64,

    /// Per-request timeout in seconds for pull/push calls
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Shared secret required in the x-sync-token header (None = open)
    #[serde(default)]
    pub auth_token: Option<String>,
}

/// File replication configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilesConfig {
    /// Enable file tree replication
    #[serde(default)]
    pub enabled: bool,

    /// Root of the replicated file tree
    #[serde(default)]
    pub root: PathBuf,

    /// Replication pass interval in seconds
    #[serde(default = "default_file_interval_secs")]
    pub interval_secs: u64,

    /// Path prefixes (relative to root) excluded from replication
    #[serde(default = "default_file_exclude")]
    pub exclude: Vec<String>,

    /// Maximum file size in megabytes (larger files are skipped)
    #[serde(default = "default_max_file_mb")]
    pub max_file_mb: u64,
}

/// API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Enable HTTP API
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// HTTP API bind address
    #[serde(default = "default_api_address")]
    pub bind_address: String,

    /// Enable CORS
    #[serde(default)]
    pub cors_enabled: bool,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, json)
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Log to file path (optional)
    pub file: Option<PathBuf>,
}

// Default value functions
fn default_pool_size() -> u32 {
    5
}

fn default_busy_timeout_ms() -> u64 {
    5000
}

fn default_key_column() -> String {
    "id".to_string()
}

fn default_sync_interval_secs() -> u64 {
    30
}

fn default_catchup_interval_secs() -> u64 {
    120
}

fn default_pass_timeout_secs() -> u64 {
    60
}

fn default_max_batch() -> u32 {
    500
}

fn default_bootstrap_max_changes() -> u32 {
    10_000
}

fn default_dispatch_workers() -> usize {
    2
}

fn default_queue_capacity() -> usize {
    1024
}

fn default_unreachable_after() -> u32 {
    3
}

fn default_ping_timeout_ms() -> u64 {
    2000
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_file_interval_secs() -> u64 {
    60
}

fn default_file_exclude() -> Vec<String> {
    vec!["logs".to_string()]
}

fn default_max_file_mb() -> u64 {
    256
}

fn default_true() -> bool {
    true
}

fn default_api_address() -> String {
    "0.0.0.0:7655".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/meshsync")
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            peers: Vec::new(),
            interval_secs: default_sync_interval_secs(),
            catchup_interval_secs: default_catchup_interval_secs(),
            pass_timeout_secs: default_pass_timeout_secs(),
            max_batch: default_max_batch(),
            bootstrap_max_changes: default_bootstrap_max_changes(),
            dispatch_workers: default_dispatch_workers(),
            queue_capacity: default_queue_capacity(),
            unreachable_after: default_unreachable_after(),
            ping_timeout_ms: default_ping_timeout_ms(),
            request_timeout_secs: default_request_timeout_secs(),
            auth_token: None,
        }
    }
}

impl Default for FilesConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            root: PathBuf::new(),
            interval_secs: default_file_interval_secs(),
            exclude: default_file_exclude(),
            max_file_mb: default_max_file_mb(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_address: default_api_address(),
            cors_enabled: false,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            file: None,
        }
    }
}

impl MeshSyncConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: MeshSyncConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML string
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: MeshSyncConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.node.id.is_empty() {
            return Err(crate::Error::Config("node.id cannot be empty".into()));
        }

        if self.database.path.as_os_str().is_empty() {
            return Err(crate::Error::Config("database.path cannot be empty".into()));
        }

        if self.sync.max_batch == 0 {
            return Err(crate::Error::Config("sync.max_batch must be at least 1".into()));
        }

        if self.sync.unreachable_after == 0 {
            return Err(crate::Error::Config(
                "sync.unreachable_after must be at least 1".into(),
            ));
        }

        if self.sync.dispatch_workers == 0 {
            return Err(crate::Error::Config(
                "sync.dispatch_workers must be at least 1".into(),
            ));
        }

        if self.files.enabled && self.files.root.as_os_str().is_empty() {
            return Err(crate::Error::Config(
                "files.root is required when files.enabled = true".into(),
            ));
        }

        Ok(())
    }

    /// Peer URLs that look usable; malformed entries are returned
    /// separately so the engine can log and skip them instead of refusing
    /// to start.
    pub fn peer_urls(&self) -> (Vec<String>, Vec<String>) {
        let mut good = Vec::new();
        let mut bad = Vec::new();
        for peer in &self.sync.peers {
            let trimmed = peer.trim_end_matches('/').to_string();
            if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
                good.push(trimmed);
            } else {
                bad.push(peer.clone());
            }
        }
        (good, bad)
    }

    /// Get the data directory path
    pub fn data_dir(&self) -> &PathBuf {
        &self.node.data_dir
    }

    /// Get the engine state directory path
    pub fn state_dir(&self) -> PathBuf {
        self.node.data_dir.join("state")
    }

    /// Path of the change ledger database
    pub fn ledger_path(&self) -> PathBuf {
        self.state_dir().join("ledger.db")
    }

    /// Path of the peer cursor database
    pub fn cursors_path(&self) -> PathBuf {
        self.state_dir().join("cursors.db")
    }

    /// Path of the file replication index database
    pub fn file_index_path(&self) -> PathBuf {
        self.state_dir().join("files.db")
    }

    /// Get steady-state sync interval as Duration
    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync.interval_secs)
    }

    /// Get catch-up evaluation interval as Duration
    pub fn catchup_interval(&self) -> Duration {
        Duration::from_secs(self.sync.catchup_interval_secs)
    }

    /// Get whole-pass timeout as Duration
    pub fn pass_timeout(&self) -> Duration {
        Duration::from_secs(self.sync.pass_timeout_secs)
    }

    /// Get liveness probe timeout as Duration
    pub fn ping_timeout(&self) -> Duration {
        Duration::from_millis(self.sync.ping_timeout_ms)
    }

    /// Get per-request timeout as Duration
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.sync.request_timeout_secs)
    }

    /// Get file replication interval as Duration
    pub fn file_interval(&self) -> Duration {
        Duration::from_secs(self.files.interval_secs)
    }

    /// Get application database connection URL
    pub fn database_url(&self) -> String {
        self.database.url()
    }

    /// Render a commented default configuration for `meshsync init`
    pub fn generate_default(node_id: &str) -> String {
        format!(
            r#"# MeshSync node configuration

[node]
id = "{node_id}"
data_dir = "/var/lib/meshsync"
# advertise_url = "http://this-host:7655"

[database]
path = "/var/lib/app/app.db"

[sync]
# Peer base URLs. Every node lists every other node.
peers = []
interval_secs = 30
catchup_interval_secs = 120
max_batch = 500
# auth_token = "shared-secret"

[files]
enabled = false
root = "/var/lib/app/files"
exclude = ["logs"]

[api]
bind_address = "0.0.0.0:7655"

[logging]
level = "info"
format = "pretty"
"#
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let toml = r#"
[node]
id = "server-a"
data_dir = "/var/lib/meshsync"

[database]
path = "/var/lib/app/app.db"

[sync]
peers = ["http://10.0.0.2:7655", "http://10.0.0.3:7655/"]
interval_secs = 15

[files]
enabled = true
root = "/var/lib/app/files"
"#;

        let config = MeshSyncConfig::from_str(toml).unwrap();
        assert_eq!(config.node.id, "server-a");
        assert_eq!(config.sync.peers.len(), 2);
        assert_eq!(config.sync.interval_secs, 15);
        assert_eq!(config.sync.max_batch, 500);
        assert!(config.files.enabled);

        let (good, bad) = config.peer_urls();
        assert_eq!(good.len(), 2);
        assert_eq!(good[1], "http://10.0.0.3:7655");
        assert!(bad.is_empty());
    }

    #[test]
    fn test_validate_rejects_missing_files_root() {
        let toml = r#"
[node]
id = "server-a"

[database]
path = "/var/lib/app/app.db"

[files]
enabled = true
"#;

        assert!(MeshSyncConfig::from_str(toml).is_err());
    }

    #[test]
    fn test_generated_default_parses() {
        let rendered = MeshSyncConfig::generate_default("server-a");
        let config: MeshSyncConfig = toml::from_str(&rendered).unwrap();
        assert_eq!(config.node.id, "server-a");
        assert!(!config.files.enabled);
    }
}
