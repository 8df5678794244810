//! Content-addressed build cache (spec §4.F).
//!
//! Backed by a flat directory keyed by fingerprint, one file per entry.
//! Writes go to a uniquely-named temp file in the same directory and are
//! renamed into place, so concurrent writers racing on the same fingerprint
//! tolerate each other (the last rename wins; `rename` within one filesystem
//! is atomic) — the `tokio::fs` + temp-file-then-rename idiom mirrors
//! `FileOptions`'s own file handling.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::error::Result;

/// `{ fingerprint, childImageID, timestamps }` (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub fingerprint: String,
    pub child_image_id: String,
    pub created_at_unix: u64,
}

/// Everything about a proposed Op that should feed the cache key: the
/// commit message (with EXPOSE's ports pre-sorted by the caller) and the
/// cache-relevant config projection, canonically serialised by the caller
/// before reaching [`fingerprint`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpProjection {
    pub commit_message: String,
    pub config_projection: serde_json::Value,
    pub tarsum: Option<String>,
}

/// `hash(parent || canonical(op-projection))` (spec §4.F). `serde_json` with
/// `BTreeMap`/sorted-key projections gives the deterministic, stable-order
/// serialisation the spec calls `canonical`.
pub fn fingerprint(parent_image_id: &str, projection: &OpProjection) -> Result<String> {
    let canonical = serde_json::to_vec(projection)
        .map_err(|e| crate::error::ErrorKind::io(format!("serializing cache projection: {e}")))?;
    let mut hasher = Sha256::new();
    hasher.update(parent_image_id.as_bytes());
    hasher.update(b"\0");
    hasher.update(&canonical);
    Ok(hex::encode(hasher.finalize()))
}

/// Filesystem-backed cache directory.
#[derive(Debug, Clone)]
pub struct FsCache {
    dir: PathBuf,
    disable_read: bool,
    disable_write: bool,
}

impl FsCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            disable_read: false,
            disable_write: false,
        }
    }

    /// `--no-cache`: disables reads only, writes still populate the cache.
    pub fn no_cache(mut self) -> Self {
        self.disable_read = true;
        self
    }

    /// `--reload-cache`: disables reads and also overwrites any existing
    /// entry unconditionally on write.
    pub fn reload_cache(mut self) -> Self {
        self.disable_read = true;
        self.disable_write = false;
        self
    }

    fn entry_path(&self, fp: &str) -> PathBuf {
        self.dir.join(fp)
    }

    /// `Get(parent, op-projection) -> childImageID?`. Read failures (missing
    /// file, corrupt entry) are treated as a miss, never an error (spec §7:
    /// "Read misses are not errors").
    pub async fn get(&self, parent_image_id: &str, projection: &OpProjection) -> Option<String> {
        if self.disable_read {
            return None;
        }
        let fp = fingerprint(parent_image_id, projection).ok()?;
        let path = self.entry_path(&fp);
        let bytes = tokio::fs::read(&path).await.ok()?;
        match serde_json::from_slice::<CacheEntry>(&bytes) {
            Ok(entry) => {
                debug!(fingerprint = %fp, child = %entry.child_image_id, "cache hit");
                Some(entry.child_image_id)
            }
            Err(e) => {
                warn!(fingerprint = %fp, "corrupt cache entry, treating as miss: {e}");
                None
            }
        }
    }

    /// `Put(parent, op-projection, childImageID)`. Failures are logged and
    /// swallowed (spec §7: "Write failures ... must never abort the build").
    pub async fn put(&self, parent_image_id: &str, projection: &OpProjection, child_image_id: &str) {
        if let Err(e) = self.try_put(parent_image_id, projection, child_image_id).await {
            warn!("failed to write build cache entry (continuing without it): {e}");
        }
    }

    async fn try_put(
        &self,
        parent_image_id: &str,
        projection: &OpProjection,
        child_image_id: &str,
    ) -> Result<()> {
        let fp = fingerprint(parent_image_id, projection)?;
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| crate::error::ErrorKind::io(format!("creating cache dir: {e}")))?;

        let entry = CacheEntry {
            fingerprint: fp.clone(),
            child_image_id: child_image_id.to_string(),
            created_at_unix: std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0),
        };
        let bytes = serde_json::to_vec(&entry)
            .map_err(|e| crate::error::ErrorKind::io(format!("serializing cache entry: {e}")))?;

        let tmp_path = self
            .dir
            .join(format!(".{}.{}.tmp", fp, uuid::Uuid::new_v4()));
        tokio::fs::write(&tmp_path, &bytes)
            .await
            .map_err(|e| crate::error::ErrorKind::io(format!("writing cache temp file: {e}")))?;

        let final_path = self.entry_path(&fp);
        tokio::fs::rename(&tmp_path, &final_path)
            .await
            .map_err(|e| crate::error::ErrorKind::io(format!("renaming cache entry into place: {e}")))?;

        debug!(fingerprint = %fp, child = %child_image_id, "cache entry written");
        Ok(())
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn projection(msg: &str) -> OpProjection {
        OpProjection {
            commit_message: msg.to_string(),
            config_projection: serde_json::json!({"env": ["a=1"]}),
            tarsum: None,
        }
    }

    #[tokio::test]
    async fn put_then_get_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FsCache::new(dir.path());
        let proj = projection("RUN true");
        cache.put("parent1", &proj, "child1").await;
        let got = cache.get("parent1", &proj).await;
        assert_eq!(got, Some("child1".to_string()));
    }

    #[tokio::test]
    async fn miss_on_unknown_fingerprint() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FsCache::new(dir.path());
        assert_eq!(cache.get("parent1", &projection("RUN true")).await, None);
    }

    #[tokio::test]
    async fn no_cache_disables_reads_but_not_writes() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FsCache::new(dir.path()).no_cache();
        let proj = projection("RUN true");
        cache.put("parent1", &proj, "child1").await;
        assert_eq!(cache.get("parent1", &proj).await, None);

        let plain = FsCache::new(dir.path());
        assert_eq!(plain.get("parent1", &proj).await, Some("child1".to_string()));
    }

    #[test]
    fn fingerprint_is_deterministic() {
        let proj = projection("RUN true");
        let a = fingerprint("parent1", &proj).unwrap();
        let b = fingerprint("parent1", &proj).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn fingerprint_differs_by_parent() {
        let proj = projection("RUN true");
        let a = fingerprint("parent1", &proj).unwrap();
        let b = fingerprint("parent2", &proj).unwrap();
        assert_ne!(a, b);
    }
}
