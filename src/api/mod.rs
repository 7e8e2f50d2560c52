//! HTTP API Module
//!
//! The REST surface peers and operators talk to.

mod http;

pub use http::{ApiState, HttpServer, LogResponse, PeerStatus, StatusResponse};
