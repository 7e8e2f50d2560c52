//! Network Module
//!
//! Outbound HTTP to peers. The inbound side lives in the api module.

mod client;

pub use client::PeerClient;
