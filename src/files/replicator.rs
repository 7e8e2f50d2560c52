//! File replicator
//!
//! Scans the local tree, serves the manifest, and mirrors against one
//! peer at a time. Content only moves when hashes differ; the newer
//! modification time wins, with the lexically greater hash breaking
//! exact ties so both sides settle on the same content. Deletions win
//! against anything not strictly newer than the tombstone.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::UNIX_EPOCH;

use bytes::Bytes;
use walkdir::WalkDir;

use crate::clock;
use crate::config::FilesConfig;
use crate::error::{Error, Result};
use crate::files::index::FileIndex;
use crate::files::{always_excluded, clean_path, hash_bytes, TEMP_SUFFIX};
use crate::network::PeerClient;
use crate::sync::wire::{FileRecord, ManifestResponse};
use crate::synclog::{EventKind, SyncEventLog};

/// Tombstones older than this are pruned at scan time
const TOMBSTONE_RETENTION_MS: i64 = 30 * 24 * 60 * 60 * 1000;

/// What one local scan found
#[derive(Debug, Clone, Copy, Default)]
pub struct ScanSummary {
    /// Live files in the index after the scan
    pub files: usize,
    pub added: usize,
    pub modified: usize,
    pub deleted: usize,
}

/// What one mirror pass against one peer moved
#[derive(Debug, Clone, Default)]
pub struct FilePassOutcome {
    pub peer_url: String,
    pub pulled: u64,
    pub deleted: u64,
    pub pushed: u64,
    pub skipped: u64,
}

pub struct FileReplicator {
    server_id: String,
    root: PathBuf,
    exclude: Vec<String>,
    max_bytes: u64,
    index: FileIndex,
    events: Arc<SyncEventLog>,
}

impl FileReplicator {
    pub fn new(
        server_id: String,
        config: &FilesConfig,
        index_path: PathBuf,
        events: Arc<SyncEventLog>,
    ) -> Result<Self> {
        std::fs::create_dir_all(&config.root)?;
        Ok(Self {
            server_id,
            root: config.root.clone(),
            exclude: config.exclude.clone(),
            max_bytes: config.max_file_mb.saturating_mul(1024 * 1024),
            index: FileIndex::new(index_path)?,
            events,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Walk the tree and reconcile the index with what is on disk.
    /// Files are rehashed only when size or mtime moved; files that
    /// vanished become tombstones dated now.
    pub async fn scan(&self) -> Result<ScanSummary> {
        let mut summary = ScanSummary::default();
        let indexed: HashMap<String, FileRecord> = self
            .index
            .all()
            .await?
            .into_iter()
            .map(|f| (f.path.clone(), f))
            .collect();
        let mut seen: HashSet<String> = HashSet::new();

        for entry in WalkDir::new(&self.root)
            .into_iter()
            .filter_map(|e| e.ok())
        {
            if !entry.file_type().is_file() {
                continue;
            }
            let rel = match entry.path().strip_prefix(&self.root) {
                Ok(rel) => rel,
                Err(_) => continue,
            };
            let rel = match rel.to_str() {
                Some(rel) => rel.to_string(),
                None => {
                    tracing::warn!("skipping non-UTF-8 path under {}", self.root.display());
                    continue;
                }
            };
            if self.is_excluded(&rel) {
                continue;
            }

            let meta = match entry.metadata() {
                Ok(meta) => meta,
                Err(_) => continue,
            };
            if meta.len() > self.max_bytes {
                tracing::debug!("{} exceeds the size limit, not replicated", rel);
                continue;
            }
            let disk_mtime = mtime_ms(&meta);
            seen.insert(rel.clone());

            match indexed.get(&rel) {
                None => {
                    let sha256 = self.hash_file(&rel).await?;
                    self.index
                        .upsert(&FileRecord {
                            path: rel,
                            size: meta.len(),
                            mtime_ms: disk_mtime,
                            sha256,
                        })
                        .await?;
                    summary.added += 1;
                }
                Some(known) if known.size != meta.len() || known.mtime_ms != disk_mtime => {
                    let sha256 = self.hash_file(&rel).await?;
                    // A touched but unchanged file keeps its indexed stamp;
                    // replicated files carry their origin's mtime, not ours
                    if sha256 != known.sha256 {
                        self.index
                            .upsert(&FileRecord {
                                path: rel,
                                size: meta.len(),
                                mtime_ms: disk_mtime,
                                sha256,
                            })
                            .await?;
                        summary.modified += 1;
                    }
                }
                Some(_) => {}
            }
        }

        let now = clock::now_ms();
        for path in indexed.keys() {
            if seen.contains(path) {
                continue;
            }
            self.index.add_tombstone(path, now).await?;
            self.index.remove(path).await?;
            summary.deleted += 1;
            self.events
                .record(EventKind::FileDeleted, format!("{} deleted locally", path))
                .await;
        }

        self.index
            .prune_tombstones(now - TOMBSTONE_RETENTION_MS)
            .await?;
        summary.files = self.index.file_count().await? as usize;
        Ok(summary)
    }

    /// Manifest served to peers
    pub async fn manifest(&self) -> Result<ManifestResponse> {
        Ok(ManifestResponse {
            server_id: self.server_id.clone(),
            files: self.index.all().await?,
            tombstones: self.index.tombstones().await?,
        })
    }

    /// One mirror pass against one peer: fresh scan, pull what they have
    /// newer, honor their tombstones, push what we have newer. Transport
    /// errors abort the pass; per-file problems skip the file.
    pub async fn sync_with_peer(&self, client: &PeerClient) -> Result<FilePassOutcome> {
        self.scan().await?;
        let remote = client.manifest().await?;
        let mut outcome = FilePassOutcome {
            peer_url: client.base_url().to_string(),
            ..Default::default()
        };

        let local: HashMap<String, FileRecord> = self
            .index
            .all()
            .await?
            .into_iter()
            .map(|f| (f.path.clone(), f))
            .collect();

        for rf in &remote.files {
            let Some(path) = clean_path(&rf.path) else {
                outcome.skipped += 1;
                continue;
            };
            if self.is_excluded(&path) || rf.size > self.max_bytes {
                continue;
            }
            if let Some(deleted_at) = self.index.tombstone(&path).await? {
                if deleted_at >= rf.mtime_ms {
                    continue;
                }
            }
            if let Some(lf) = local.get(&path) {
                if lf.sha256 == rf.sha256 {
                    // Same content, adopt the later stamp so ties stay settled
                    if rf.mtime_ms > lf.mtime_ms {
                        self.index
                            .upsert(&FileRecord {
                                mtime_ms: rf.mtime_ms,
                                ..lf.clone()
                            })
                            .await?;
                    }
                    continue;
                }
                if !wins(rf, lf) {
                    continue;
                }
            }
            if self.fetch_one(client, &path, rf).await? {
                outcome.pulled += 1;
            } else {
                outcome.skipped += 1;
            }
        }

        for rt in &remote.tombstones {
            let Some(path) = clean_path(&rt.path) else {
                continue;
            };
            if self.is_excluded(&path) {
                continue;
            }
            match self.index.get(&path).await? {
                Some(lf) if lf.mtime_ms > rt.deleted_at_ms => {}
                Some(_) => {
                    self.remove_local(&path).await?;
                    self.index.add_tombstone(&path, rt.deleted_at_ms).await?;
                    outcome.deleted += 1;
                    self.events
                        .record(
                            EventKind::FileDeleted,
                            format!("{} (tombstone from {})", path, remote.server_id),
                        )
                        .await;
                }
                // Adopt unknown tombstones so stale third peers cannot
                // hand the file back later
                None => self.index.add_tombstone(&path, rt.deleted_at_ms).await?,
            }
        }

        let remote_files: HashMap<&str, &FileRecord> =
            remote.files.iter().map(|f| (f.path.as_str(), f)).collect();
        let remote_tombstones: HashMap<&str, i64> = remote
            .tombstones
            .iter()
            .map(|t| (t.path.as_str(), t.deleted_at_ms))
            .collect();

        for lf in self.index.all().await? {
            if let Some(&deleted_at) = remote_tombstones.get(lf.path.as_str()) {
                if deleted_at >= lf.mtime_ms {
                    continue;
                }
            }
            let push = match remote_files.get(lf.path.as_str()) {
                None => true,
                Some(&rf) => lf.sha256 != rf.sha256 && wins(&lf, rf),
            };
            if !push {
                continue;
            }

            let bytes = match tokio::fs::read(self.abs(&lf.path)).await {
                Ok(bytes) => bytes,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
                Err(err) => return Err(err.into()),
            };
            if hash_bytes(&bytes) != lf.sha256 {
                // Changed under us; the next scan re-stamps it
                continue;
            }
            if client
                .put_file(&lf.path, Bytes::from(bytes), &lf.sha256, lf.mtime_ms)
                .await?
            {
                outcome.pushed += 1;
            } else {
                outcome.skipped += 1;
            }
        }

        Ok(outcome)
    }

    /// Store a file a peer pushed to us. Returns false when the content
    /// lost to a local tombstone or a newer local version.
    pub async fn store_incoming(
        &self,
        raw_path: &str,
        bytes: Bytes,
        sha256: &str,
        mtime_ms: i64,
    ) -> Result<bool> {
        let Some(path) = clean_path(raw_path) else {
            return Err(Error::Protocol(format!("invalid file path {:?}", raw_path)));
        };
        if self.is_excluded(&path) || bytes.len() as u64 > self.max_bytes {
            return Ok(false);
        }
        if hash_bytes(&bytes) != sha256 {
            return Err(Error::HashMismatch { path });
        }

        if let Some(deleted_at) = self.index.tombstone(&path).await? {
            if deleted_at >= mtime_ms {
                return Ok(false);
            }
        }
        let incoming = FileRecord {
            path: path.clone(),
            size: bytes.len() as u64,
            mtime_ms,
            sha256: sha256.to_string(),
        };
        if let Some(lf) = self.index.get(&path).await? {
            if lf.sha256 == sha256 {
                if mtime_ms > lf.mtime_ms {
                    self.index.upsert(&incoming).await?;
                }
                return Ok(true);
            }
            if !wins(&incoming, &lf) {
                return Ok(false);
            }
        }

        self.write_atomic(&path, &bytes).await?;
        self.index.upsert(&incoming).await?;
        self.index.clear_tombstone(&path).await?;
        self.events
            .record(EventKind::FileReplicated, format!("{} received", path))
            .await;
        Ok(true)
    }

    /// Resolve a request path to the on-disk file and its index entry
    pub async fn file_info(&self, raw_path: &str) -> Result<Option<(PathBuf, FileRecord)>> {
        let Some(path) = clean_path(raw_path) else {
            return Ok(None);
        };
        let Some(record) = self.index.get(&path).await? else {
            return Ok(None);
        };
        let abs = self.abs(&path);
        match tokio::fs::metadata(&abs).await {
            Ok(_) => Ok(Some((abs, record))),
            Err(_) => Ok(None),
        }
    }

    async fn fetch_one(&self, client: &PeerClient, path: &str, rf: &FileRecord) -> Result<bool> {
        let Some(bytes) = client.fetch_file(path).await? else {
            return Ok(false);
        };
        if hash_bytes(&bytes) != rf.sha256 {
            tracing::warn!(
                "{} from {} did not match its manifest hash, skipping",
                path,
                client.base_url()
            );
            return Ok(false);
        }

        self.write_atomic(path, &bytes).await?;
        self.index
            .upsert(&FileRecord {
                path: path.to_string(),
                size: bytes.len() as u64,
                mtime_ms: rf.mtime_ms,
                sha256: rf.sha256.clone(),
            })
            .await?;
        self.index.clear_tombstone(path).await?;
        self.events
            .record(
                EventKind::FileReplicated,
                format!("{} from {}", path, client.base_url()),
            )
            .await;
        Ok(true)
    }

    /// Write through a temp file in the same directory, then rename
    async fn write_atomic(&self, rel: &str, bytes: &[u8]) -> Result<()> {
        let target = self.abs(rel);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let name = target
            .file_name()
            .ok_or_else(|| Error::File(format!("bad target path {}", target.display())))?;
        let mut tmp_name = name.to_os_string();
        tmp_name.push(TEMP_SUFFIX);
        let tmp = target.with_file_name(tmp_name);

        tokio::fs::write(&tmp, bytes).await?;
        if let Err(err) = tokio::fs::rename(&tmp, &target).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(err.into());
        }
        Ok(())
    }

    async fn remove_local(&self, path: &str) -> Result<()> {
        match tokio::fs::remove_file(self.abs(path)).await {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
        self.index.remove(path).await?;
        Ok(())
    }

    async fn hash_file(&self, rel: &str) -> Result<String> {
        let bytes = tokio::fs::read(self.abs(rel)).await?;
        Ok(hash_bytes(&bytes))
    }

    fn abs(&self, rel: &str) -> PathBuf {
        self.root.join(rel)
    }

    fn is_excluded(&self, rel: &str) -> bool {
        if always_excluded(rel) {
            return true;
        }
        self.exclude
            .iter()
            .any(|prefix| rel == prefix || rel.starts_with(&format!("{}/", prefix)))
    }
}

/// Deterministic winner between two versions of the same path
fn wins(a: &FileRecord, b: &FileRecord) -> bool {
    a.mtime_ms > b.mtime_ms || (a.mtime_ms == b.mtime_ms && a.sha256 > b.sha256)
}

fn mtime_ms(meta: &std::fs::Metadata) -> i64 {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn replicator(dir: &Path) -> FileReplicator {
        let config = FilesConfig {
            enabled: true,
            root: dir.join("tree"),
            interval_secs: 60,
            exclude: vec!["logs".to_string()],
            max_file_mb: 8,
        };
        FileReplicator::new(
            "server-a".to_string(),
            &config,
            dir.join("files.db"),
            Arc::new(SyncEventLog::new(64)),
        )
        .unwrap()
    }

    fn write(root: &Path, rel: &str, content: &str) {
        let path = root.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }

    #[tokio::test]
    async fn test_scan_tracks_adds_edits_and_deletes() {
        let dir = tempdir().unwrap();
        let rep = replicator(dir.path());
        let root = rep.root().to_path_buf();

        write(&root, "a.txt", "one");
        write(&root, "sub/b.txt", "two");
        write(&root, "logs/ignored.txt", "noise");
        write(&root, "app.db", "sqlite");

        let summary = rep.scan().await.unwrap();
        assert_eq!(summary.added, 2);
        assert_eq!(summary.files, 2);

        // Different length so the edit shows regardless of mtime granularity
        write(&root, "a.txt", "one but longer now");
        let summary = rep.scan().await.unwrap();
        assert_eq!(summary.modified, 1);

        std::fs::remove_file(root.join("sub/b.txt")).unwrap();
        let summary = rep.scan().await.unwrap();
        assert_eq!(summary.deleted, 1);
        assert_eq!(summary.files, 1);

        let manifest = rep.manifest().await.unwrap();
        assert_eq!(manifest.files.len(), 1);
        assert_eq!(manifest.files[0].path, "a.txt");
        assert_eq!(manifest.tombstones.len(), 1);
        assert_eq!(manifest.tombstones[0].path, "sub/b.txt");
    }

    #[tokio::test]
    async fn test_store_incoming_applies_version_rules() {
        let dir = tempdir().unwrap();
        let rep = replicator(dir.path());

        let newer = b"newer content";
        let older = b"older content";

        assert!(rep
            .store_incoming("docs/x.txt", Bytes::from_static(newer), &hash_bytes(newer), 2000)
            .await
            .unwrap());
        assert_eq!(
            std::fs::read(rep.root().join("docs/x.txt")).unwrap(),
            newer.to_vec()
        );

        // An older version loses and leaves the file alone
        assert!(!rep
            .store_incoming("docs/x.txt", Bytes::from_static(older), &hash_bytes(older), 1000)
            .await
            .unwrap());
        assert_eq!(
            std::fs::read(rep.root().join("docs/x.txt")).unwrap(),
            newer.to_vec()
        );

        // Identical content is an idempotent success
        assert!(rep
            .store_incoming("docs/x.txt", Bytes::from_static(newer), &hash_bytes(newer), 2000)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_tombstone_gates_incoming_writes() {
        let dir = tempdir().unwrap();
        let rep = replicator(dir.path());

        rep.index.add_tombstone("gone.txt", 5000).await.unwrap();

        let body = b"resurrected?";
        assert!(!rep
            .store_incoming("gone.txt", Bytes::from_static(body), &hash_bytes(body), 4000)
            .await
            .unwrap());

        // Strictly newer than the tombstone wins and clears it
        assert!(rep
            .store_incoming("gone.txt", Bytes::from_static(body), &hash_bytes(body), 6000)
            .await
            .unwrap());
        assert_eq!(rep.index.tombstone("gone.txt").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_store_incoming_rejects_bad_input() {
        let dir = tempdir().unwrap();
        let rep = replicator(dir.path());

        let body = b"content";
        let err = rep
            .store_incoming("../escape.txt", Bytes::from_static(body), &hash_bytes(body), 1000)
            .await
            .unwrap_err();
        assert!(err.is_structural());

        let err = rep
            .store_incoming("ok.txt", Bytes::from_static(body), "deadbeef", 1000)
            .await
            .unwrap_err();
        assert!(err.is_transient());

        // Excluded paths are refused without error
        assert!(!rep
            .store_incoming("logs/app.log", Bytes::from_static(body), &hash_bytes(body), 1000)
            .await
            .unwrap());
        assert!(!rep
            .store_incoming("data/app.db", Bytes::from_static(body), &hash_bytes(body), 1000)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_no_temp_files_left_behind() {
        let dir = tempdir().unwrap();
        let rep = replicator(dir.path());

        let body = b"payload";
        rep.store_incoming("a/b/c.bin", Bytes::from_static(body), &hash_bytes(body), 100)
            .await
            .unwrap();

        for entry in WalkDir::new(rep.root()).into_iter().filter_map(|e| e.ok()) {
            let name = entry.file_name().to_string_lossy();
            assert!(!name.ends_with(TEMP_SUFFIX), "left temp file {}", name);
        }
    }
}
