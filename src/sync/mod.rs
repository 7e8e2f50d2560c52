//! Sync Module
//!
//! The bidirectional exchange between peers: wire types, conflict
//! resolution, record application, per-peer pass sessions, and the
//! catch-up detector that closes gaps exactly.

pub mod wire;
mod apply;
mod catchup;
mod conflict;
mod session;

pub use apply::{Applier, ApplyOutcome};
pub use catchup::CatchupDetector;
pub use conflict::{resolve, Resolution};
pub use session::{PassKind, PassOutcome, SyncSession};
