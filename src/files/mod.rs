//! File Replication Module
//!
//! Mirrors a configured file tree across peers. Content moves by hash
//! comparison against per-peer manifests, writes land atomically via a
//! temp file and rename, and deletions travel as explicit tombstones so
//! a removed file does not resurrect from a peer that still has it.

mod index;
mod replicator;

pub use index::FileIndex;
pub use replicator::{FilePassOutcome, FileReplicator, ScanSummary};

use sha2::{Digest, Sha256};

/// Suffix of in-flight temp files, never replicated
pub const TEMP_SUFFIX: &str = ".msync-tmp";

/// Database files are never replicated; each node owns its own
const DB_SUFFIXES: &[&str] = &[".db", ".db-wal", ".db-shm", ".sqlite", ".sqlite3"];

/// Hex SHA-256 of a byte slice
pub fn hash_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Normalize a manifest path to a safe relative form: forward slashes,
/// no empty segments, no traversal. Returns None for anything that
/// could escape the root.
pub fn clean_path(path: &str) -> Option<String> {
    if path.is_empty() || path.contains('\\') || path.contains('\0') {
        return None;
    }
    let mut segments = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" => continue,
            "." | ".." => return None,
            other => segments.push(other),
        }
    }
    if segments.is_empty() {
        return None;
    }
    Some(segments.join("/"))
}

/// Paths that never replicate regardless of configuration: hidden
/// entries, databases, and in-flight temp files
pub fn always_excluded(path: &str) -> bool {
    if path.split('/').any(|segment| segment.starts_with('.')) {
        return true;
    }
    let name = path.rsplit('/').next().unwrap_or(path);
    if name.ends_with(TEMP_SUFFIX) {
        return true;
    }
    DB_SUFFIXES.iter().any(|suffix| name.ends_with(suffix))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_path() {
        assert_eq!(clean_path("uploads/a.png"), Some("uploads/a.png".into()));
        assert_eq!(clean_path("/uploads//a.png"), Some("uploads/a.png".into()));
        assert_eq!(clean_path("../etc/passwd"), None);
        assert_eq!(clean_path("a/./b"), None);
        assert_eq!(clean_path("a\\b"), None);
        assert_eq!(clean_path(""), None);
        assert_eq!(clean_path("//"), None);
    }

    #[test]
    fn test_always_excluded() {
        assert!(always_excluded("app.db"));
        assert!(always_excluded("nested/app.db-wal"));
        assert!(always_excluded("uploads/photo.png.msync-tmp"));
        assert!(always_excluded(".env"));
        assert!(always_excluded(".git/config"));
        assert!(always_excluded("uploads/.DS_Store"));
        assert!(!always_excluded("uploads/photo.png"));
        assert!(!always_excluded("dbdump.txt"));
    }

    #[test]
    fn test_hash_bytes_is_hex_sha256() {
        // SHA-256 of the empty string
        assert_eq!(
            hash_bytes(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}
