//! MeshSync - Peer-to-Peer Eventual Consistency Engine
//!
//! Keeps a fleet of independently-running application servers converged.
//! Each node owns its local SQLite database and file store outright;
//! changes are captured into a durable append-only ledger as they happen
//! and exchanged with every configured peer over HTTP, in both
//! directions, until all nodes have applied the same set.
//!
//! # Architecture
//!
//! There is no coordinator. Every node runs the same engine: local
//! writes always succeed, a dispatcher nudges sync passes out-of-band,
//! and conflicts are settled deterministically by hybrid logical clock
//! with the origin server id as tie-break. A node that was down for a
//! day, a week, or a month works out exactly which changes it is
//! missing and fetches them.
//!
//! # Features
//!
//! - Durable change ledger written in the same transaction as the data
//! - Bidirectional pull/push passes with per-peer cursors
//! - Deterministic last-writer-wins conflict resolution
//! - Exact gap detection for offline catch-up, however long the outage
//! - Hash-gated file replication with tombstoned deletes
//! - Peer health derived from real contact attempts only

pub mod api;
pub mod clock;
pub mod config;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod executor;
pub mod files;
pub mod ledger;
pub mod network;
pub mod state;
pub mod sync;
pub mod synclog;

pub use config::MeshSyncConfig;
pub use engine::SyncEngine;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::MeshSyncConfig;
    pub use crate::dispatch::{CaptureHook, Change};
    pub use crate::engine::SyncEngine;
    pub use crate::error::{Error, Result};
    pub use crate::ledger::{ChangeLedger, ChangeRecord, Operation};
    pub use crate::state::{PeerRegistry, Reachability};
    pub use crate::sync::{PassKind, PassOutcome};
}
