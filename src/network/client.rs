//! Peer HTTP Client
//!
//! Outbound side of the wire contract. One client per configured peer,
//! all sharing a process-wide connection pool. Errors are mapped into
//! the transient/structural taxonomy here so callers can match on the
//! classification instead of transport details.

use std::time::Duration;

use bytes::Bytes;

use crate::error::{Error, Result};
use crate::ledger::ChangeId;
use crate::sync::wire::{
    ChangesResponse, ManifestResponse, PingResponse, PushRequest, PushResponse,
    StoreFileResponse, AUTH_HEADER, FILE_HASH_HEADER, FILE_MTIME_HEADER,
};

/// Shared HTTP client; per-request timeouts are set at the call sites
static HTTP_CLIENT: std::sync::LazyLock<reqwest::Client> = std::sync::LazyLock::new(|| {
    reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(5))
        .pool_idle_timeout(Duration::from_secs(90))
        .build()
        .expect("Failed to create HTTP client")
});

/// Client for one peer's sync API
pub struct PeerClient {
    base_url: String,
    token: Option<String>,
    ping_timeout: Duration,
    request_timeout: Duration,
}

impl PeerClient {
    pub fn new(
        base_url: &str,
        token: Option<String>,
        ping_timeout: Duration,
        request_timeout: Duration,
    ) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
            ping_timeout,
            request_timeout,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Probe the peer. Cheap, unauthenticated, learns the peer's id and clock.
    pub async fn ping(&self) -> Result<PingResponse> {
        let url = format!("{}/sync/ping", self.base_url);
        let response = self
            .request(HTTP_CLIENT.get(&url).timeout(self.ping_timeout), &url)
            .await?;
        decode_json(&url, response).await
    }

    /// Page of the peer's own changes after `since_id`
    pub async fn pull_changes(&self, since_id: ChangeId, limit: u32) -> Result<ChangesResponse> {
        let url = format!(
            "{}/sync/changes?since_id={}&limit={}",
            self.base_url, since_id, limit
        );
        let response = self
            .request(HTTP_CLIENT.get(&url).timeout(self.request_timeout), &url)
            .await?;
        decode_json(&url, response).await
    }

    /// Deliver a batch of local changes to the peer
    pub async fn push_changes(&self, request: &PushRequest) -> Result<PushResponse> {
        let url = format!("{}/sync/changes", self.base_url);
        let response = self
            .request(
                HTTP_CLIENT
                    .post(&url)
                    .timeout(self.request_timeout)
                    .json(request),
                &url,
            )
            .await?;
        decode_json(&url, response).await
    }

    /// The peer's file manifest
    pub async fn manifest(&self) -> Result<ManifestResponse> {
        let url = format!("{}/files/manifest", self.base_url);
        let response = self
            .request(HTTP_CLIENT.get(&url).timeout(self.request_timeout), &url)
            .await?;
        decode_json(&url, response).await
    }

    /// Fetch one file's content. None when the peer no longer has it.
    pub async fn fetch_file(&self, rel_path: &str) -> Result<Option<Bytes>> {
        let url = self.file_url(rel_path)?;
        let request = HTTP_CLIENT
            .get(url.clone())
            .timeout(self.request_timeout);
        let request = self.authed(request);

        let response = request
            .send()
            .await
            .map_err(|e| request_error(url.as_str(), e))?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = check_status(url.as_str(), response)?;
        let body = response
            .bytes()
            .await
            .map_err(|e| Error::Network(format!("reading {}: {}", url, e)))?;
        Ok(Some(body))
    }

    /// Upload one file with its content hash and source mtime
    pub async fn put_file(
        &self,
        rel_path: &str,
        content: Bytes,
        sha256: &str,
        mtime_ms: i64,
    ) -> Result<bool> {
        let url = self.file_url(rel_path)?;
        let request = HTTP_CLIENT
            .put(url.clone())
            .timeout(self.request_timeout)
            .header(FILE_HASH_HEADER, sha256)
            .header(FILE_MTIME_HEADER, mtime_ms)
            .body(content);

        let response = self.request(request, url.as_str()).await?;
        let stored: StoreFileResponse = decode_json(url.as_str(), response).await?;
        Ok(stored.stored)
    }

    /// Build /files/{path} with each segment percent-encoded
    fn file_url(&self, rel_path: &str) -> Result<reqwest::Url> {
        let mut url = reqwest::Url::parse(&self.base_url)
            .map_err(|e| Error::Network(format!("bad peer url {}: {}", self.base_url, e)))?;
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| Error::Network(format!("peer url {} cannot take a path", self.base_url)))?;
            segments.push("files");
            for part in rel_path.split('/').filter(|p| !p.is_empty()) {
                segments.push(part);
            }
        }
        Ok(url)
    }

    fn authed(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.header(AUTH_HEADER, token),
            None => request,
        }
    }

    async fn request(
        &self,
        request: reqwest::RequestBuilder,
        url: &str,
    ) -> Result<reqwest::Response> {
        let response = self
            .authed(request)
            .send()
            .await
            .map_err(|e| request_error(url, e))?;
        check_status(url, response)
    }
}

/// Map a transport error into the taxonomy
fn request_error(url: &str, e: reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::ConnectionTimeout(url.to_string())
    } else if e.is_connect() {
        Error::ConnectionFailed {
            url: url.to_string(),
            reason: e.to_string(),
        }
    } else {
        Error::Network(format!("{}: {}", url, e))
    }
}

/// Reject non-success statuses; auth failures are their own class
fn check_status(url: &str, response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
        return Err(Error::AuthRejected(url.to_string()));
    }
    if !status.is_success() {
        return Err(Error::PeerStatus {
            url: url.to_string(),
            status: status.as_u16(),
        });
    }
    Ok(response)
}

async fn decode_json<T: serde::de::DeserializeOwned>(
    url: &str,
    response: reqwest::Response,
) -> Result<T> {
    response
        .json::<T>()
        .await
        .map_err(|e| Error::Protocol(format!("bad response from {}: {}", url, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connection_refused_is_transient() {
        let client = PeerClient::new(
            "http://127.0.0.1:9",
            None,
            Duration::from_millis(300),
            Duration::from_millis(300),
        );

        let err = client.ping().await.unwrap_err();
        assert!(err.is_transient(), "got {:?}", err);
    }

    #[tokio::test]
    async fn test_file_url_encodes_segments() {
        let client = PeerClient::new(
            "http://127.0.0.1:7655/",
            None,
            Duration::from_secs(1),
            Duration::from_secs(1),
        );

        let url = client.file_url("uploads/match scores.csv").unwrap();
        assert_eq!(
            url.as_str(),
            "http://127.0.0.1:7655/files/uploads/match%20scores.csv"
        );
        assert_eq!(client.base_url(), "http://127.0.0.1:7655");
    }
}
