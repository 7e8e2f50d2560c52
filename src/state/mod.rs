//! State Management Module
//!
//! Persistent sync progress (per-peer cursors) and the in-memory peer
//! registry with attempt-derived reachability.

mod cursors;
mod registry;

pub use cursors::{CursorStore, PeerCursor};
pub use registry::{Peer, PeerRegistry, Reachability};
