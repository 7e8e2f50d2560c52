//! Peer Registry & Health
//!
//! Tracks every configured peer and its reachability. Health is derived
//! solely from the outcome of this node's own contact attempts: a peer is
//! Unknown until the first attempt completes, Healthy after a success,
//! and Unreachable after a configured streak of consecutive failures.
//! Nothing here ages out on wall time and nothing is learned from third
//! parties.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

/// Reachability of a peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Reachability {
    /// No contact attempt has completed yet
    Unknown,
    /// The most recent contact attempt succeeded
    Healthy,
    /// Too many consecutive attempts failed
    Unreachable,
}

impl std::fmt::Display for Reachability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Reachability::Unknown => write!(f, "UNKNOWN"),
            Reachability::Healthy => write!(f, "HEALTHY"),
            Reachability::Unreachable => write!(f, "UNREACHABLE"),
        }
    }
}

/// State of a single configured peer. Peers are identified by URL; the
/// server id is learned from the peer's own ping response, so a peer
/// reinstalled under the same URL is noticed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Peer {
    /// Base URL used to reach the peer
    pub url: String,
    /// Self-reported server id, learned on first successful contact
    pub server_id: Option<String>,
    /// Current reachability
    pub reachability: Reachability,
    /// Consecutive failed contact attempts
    pub consecutive_failures: u32,
    /// Whether this peer participates in sync passes
    pub sync_enabled: bool,
    /// Peer's own change sequence head, as last reported by it
    pub export_head: Option<i64>,
    /// When the last contact attempt finished (success or failure)
    pub last_attempt: Option<chrono::DateTime<chrono::Utc>>,
    /// When the last successful pass completed
    pub last_success: Option<chrono::DateTime<chrono::Utc>>,
    /// Error text of the most recent failure
    pub last_error: Option<String>,
    /// When the peer was registered
    pub added_at: chrono::DateTime<chrono::Utc>,
}

impl Peer {
    pub fn new(url: String) -> Self {
        Self {
            url,
            server_id: None,
            reachability: Reachability::Unknown,
            consecutive_failures: 0,
            sync_enabled: true,
            export_head: None,
            last_attempt: None,
            last_success: None,
            last_error: None,
            added_at: chrono::Utc::now(),
        }
    }

    /// Peers in the steady sync cadence: enabled and not unreachable.
    /// Unreachable peers are left to the catch-up detector.
    pub fn in_steady_cadence(&self) -> bool {
        self.sync_enabled && self.reachability != Reachability::Unreachable
    }
}

/// Registry of all configured peers
pub struct PeerRegistry {
    server_id: String,
    peers: RwLock<HashMap<String, Peer>>,
    unreachable_after: u32,
}

impl PeerRegistry {
    pub fn new(server_id: String, unreachable_after: u32) -> Self {
        Self {
            server_id,
            peers: RwLock::new(HashMap::new()),
            unreachable_after,
        }
    }

    /// Register a peer by URL. Returns false when the URL is already
    /// present; a changed URL is a different peer.
    pub async fn add_peer(&self, url: &str) -> bool {
        let mut peers = self.peers.write().await;
        if peers.contains_key(url) {
            return false;
        }
        peers.insert(url.to_string(), Peer::new(url.to_string()));
        true
    }

    /// Remove a peer
    pub async fn remove_peer(&self, url: &str) -> Option<Peer> {
        let mut peers = self.peers.write().await;
        peers.remove(url)
    }

    /// Get one peer's state
    pub async fn get(&self, url: &str) -> Option<Peer> {
        let peers = self.peers.read().await;
        peers.get(url).cloned()
    }

    /// Record a successful contact. Resets the failure streak and returns
    /// the peer to Healthy regardless of prior state; learns (or corrects)
    /// the peer's self-reported server id.
    pub async fn record_success(&self, url: &str, server_id: &str) {
        let mut peers = self.peers.write().await;
        if let Some(peer) = peers.get_mut(url) {
            if server_id == self.server_id {
                tracing::warn!(
                    "peer {} reports our own server id {}; peer list points back at this node",
                    url,
                    server_id
                );
            }
            match &peer.server_id {
                Some(known) if known != server_id => {
                    tracing::warn!(
                        "peer {} changed server id {} -> {}",
                        url,
                        known,
                        server_id
                    );
                    peer.server_id = Some(server_id.to_string());
                }
                None => {
                    tracing::info!("peer {} identified as {}", url, server_id);
                    peer.server_id = Some(server_id.to_string());
                }
                _ => {}
            }

            if peer.reachability == Reachability::Unreachable {
                tracing::info!("peer {} is reachable again", url);
            }
            peer.reachability = Reachability::Healthy;
            peer.consecutive_failures = 0;
            peer.last_attempt = Some(chrono::Utc::now());
            peer.last_error = None;
        }
    }

    /// Record a completed pass (apply + ack finished, cursors committed)
    pub async fn record_pass_complete(&self, url: &str) {
        let mut peers = self.peers.write().await;
        if let Some(peer) = peers.get_mut(url) {
            peer.last_success = Some(chrono::Utc::now());
        }
    }

    /// Remember the peer's self-reported change sequence head
    pub async fn note_export_head(&self, url: &str, head: i64) {
        let mut peers = self.peers.write().await;
        if let Some(peer) = peers.get_mut(url) {
            peer.export_head = Some(head);
        }
    }

    /// Record a failed contact attempt. Returns the peer's reachability
    /// after the failure is counted.
    pub async fn record_failure(&self, url: &str, error: &str) -> Reachability {
        let mut peers = self.peers.write().await;
        let Some(peer) = peers.get_mut(url) else {
            return Reachability::Unknown;
        };

        peer.consecutive_failures += 1;
        peer.last_attempt = Some(chrono::Utc::now());
        peer.last_error = Some(error.to_string());

        if peer.consecutive_failures >= self.unreachable_after
            && peer.reachability != Reachability::Unreachable
        {
            tracing::warn!(
                "peer {} unreachable after {} consecutive failures: {}",
                url,
                peer.consecutive_failures,
                error
            );
            peer.reachability = Reachability::Unreachable;
        }
        peer.reachability
    }

    /// Enable or disable a peer's participation in sync. Returns false
    /// when no peer with that URL is registered.
    pub async fn set_enabled(&self, url: &str, enabled: bool) -> bool {
        let mut peers = self.peers.write().await;
        match peers.get_mut(url) {
            Some(peer) => {
                peer.sync_enabled = enabled;
                true
            }
            None => false,
        }
    }

    /// All peers, ordered by URL for stable output
    pub async fn peers(&self) -> Vec<Peer> {
        let peers = self.peers.read().await;
        let mut all: Vec<Peer> = peers.values().cloned().collect();
        all.sort_by(|a, b| a.url.cmp(&b.url));
        all
    }

    /// Peers eligible for the steady cadence
    pub async fn steady_targets(&self) -> Vec<Peer> {
        self.peers()
            .await
            .into_iter()
            .filter(|p| p.in_steady_cadence())
            .collect()
    }

    /// Enabled peers regardless of reachability (catch-up evaluates these)
    pub async fn enabled_peers(&self) -> Vec<Peer> {
        self.peers()
            .await
            .into_iter()
            .filter(|p| p.sync_enabled)
            .collect()
    }

    /// Server ids of every peer that has identified itself
    pub async fn known_server_ids(&self) -> Vec<String> {
        let peers = self.peers.read().await;
        let mut ids: Vec<String> = peers
            .values()
            .filter(|p| p.sync_enabled)
            .filter_map(|p| p.server_id.clone())
            .collect();
        ids.sort();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_reachability_transitions() {
        let registry = PeerRegistry::new("server-a".to_string(), 3);
        registry.add_peer("http://b:7655").await;

        let peer = registry.get("http://b:7655").await.unwrap();
        assert_eq!(peer.reachability, Reachability::Unknown);

        registry.record_success("http://b:7655", "server-b").await;
        let peer = registry.get("http://b:7655").await.unwrap();
        assert_eq!(peer.reachability, Reachability::Healthy);
        assert_eq!(peer.server_id.as_deref(), Some("server-b"));

        // Two failures keep it healthy, the third flips it
        registry.record_failure("http://b:7655", "connect refused").await;
        registry.record_failure("http://b:7655", "connect refused").await;
        let peer = registry.get("http://b:7655").await.unwrap();
        assert_eq!(peer.reachability, Reachability::Healthy);
        assert_eq!(peer.consecutive_failures, 2);

        let after = registry.record_failure("http://b:7655", "connect refused").await;
        assert_eq!(after, Reachability::Unreachable);

        // One success revives it immediately
        registry.record_success("http://b:7655", "server-b").await;
        let peer = registry.get("http://b:7655").await.unwrap();
        assert_eq!(peer.reachability, Reachability::Healthy);
        assert_eq!(peer.consecutive_failures, 0);
    }

    #[tokio::test]
    async fn test_steady_cadence_excludes_unreachable() {
        let registry = PeerRegistry::new("server-a".to_string(), 1);
        registry.add_peer("http://b:7655").await;
        registry.add_peer("http://c:7655").await;

        registry.record_failure("http://b:7655", "timeout").await;
        let steady = registry.steady_targets().await;
        assert_eq!(steady.len(), 1);
        assert_eq!(steady[0].url, "http://c:7655");

        // Unreachable peers are still visible to catch-up
        assert_eq!(registry.enabled_peers().await.len(), 2);
    }

    #[tokio::test]
    async fn test_disabled_peer_excluded_everywhere() {
        let registry = PeerRegistry::new("server-a".to_string(), 3);
        registry.add_peer("http://b:7655").await;
        registry.record_success("http://b:7655", "server-b").await;

        assert!(registry.set_enabled("http://b:7655", false).await);
        assert!(registry.steady_targets().await.is_empty());
        assert!(registry.enabled_peers().await.is_empty());
        assert!(registry.known_server_ids().await.is_empty());

        assert!(!registry.set_enabled("http://nope:7655", false).await);
    }

    #[tokio::test]
    async fn test_remove_peer() {
        let registry = PeerRegistry::new("server-a".to_string(), 3);
        registry.add_peer("http://b:7655").await;

        let removed = registry.remove_peer("http://b:7655").await;
        assert_eq!(removed.map(|p| p.url), Some("http://b:7655".to_string()));
        assert!(registry.remove_peer("http://b:7655").await.is_none());
        assert!(registry.peers().await.is_empty());
    }
}
