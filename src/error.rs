//! MeshSync Error Types

use thiserror::Error;

/// Result type alias for MeshSync operations
pub type Result<T> = std::result::Result<T, Error>;

/// MeshSync error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // Change ledger errors
    #[error("Ledger error: {0}")]
    Ledger(String),

    #[error("Ledger record corrupted at id {id}: {reason}")]
    LedgerCorrupted { id: i64, reason: String },

    // Application database errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Apply failed for {table}/{key}: {reason}")]
    Apply {
        table: String,
        key: String,
        reason: String,
    },

    // Peer transport errors
    #[error("Network error: {0}")]
    Network(String),

    #[error("Connection failed to {url}: {reason}")]
    ConnectionFailed { url: String, reason: String },

    #[error("Connection timeout to {0}")]
    ConnectionTimeout(String),

    #[error("Peer {url} returned HTTP {status}")]
    PeerStatus { url: String, status: u16 },

    #[error("Peer unreachable: {0}")]
    PeerUnreachable(String),

    // Protocol errors
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Authentication rejected by {0}")]
    AuthRejected(String),

    // Engine state errors
    #[error("State error: {0}")]
    State(String),

    // File replication errors
    #[error("File replication error: {0}")]
    File(String),

    #[error("Content hash mismatch for {path}")]
    HashMismatch { path: String },

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Shutdown in progress")]
    ShuttingDown,
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Error::State(e.to_string())
    }
}

impl Error {
    /// Check whether this error is transient: the pass aborts and the
    /// next scheduled tick retries it.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Network(_)
            | Error::ConnectionFailed { .. }
            | Error::ConnectionTimeout(_)
            | Error::PeerUnreachable(_)
            | Error::HashMismatch { .. } => true,
            Error::PeerStatus { status, .. } => *status >= 500,
            _ => false,
        }
    }

    /// Check whether this error is structural: the peer answered but the
    /// exchange itself is broken (bad token, malformed frame). The pass
    /// aborts and the condition is logged at error level.
    pub fn is_structural(&self) -> bool {
        match self {
            Error::Protocol(_) | Error::AuthRejected(_) => true,
            Error::PeerStatus { status, .. } => (400..500).contains(status),
            _ => false,
        }
    }

    /// Check whether this error is a per-record apply failure rather than
    /// a whole-pass failure.
    pub fn is_apply(&self) -> bool {
        matches!(self, Error::Apply { .. } | Error::Database(_))
    }
}
