//! Object-store backed Push/Pull (spec §4.H), grounded on the
//! `aws-config`/`aws-sdk-s3` usage pattern in `infrasys/s3.rs`
//! (`aws_config::from_env().region(..).load().await` then
//! `S3Client::new(&config)`).

use std::io::Read;
use std::path::Path;
use std::time::Duration;

use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client as S3Client;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::daemon::DaemonClient;
use crate::error::{ErrorKind, Result};

/// A reference that encodes an object-store destination (spec §3 Artifact,
/// §6 Persisted state layout: `<bucket>/<name>/<digest>.tar`).
#[derive(Debug, Clone)]
pub struct ObjectStoreRef {
    pub bucket: String,
    pub name: String,
    pub tag: String,
}

impl ObjectStoreRef {
    /// Parses `objectstore://bucket/name:tag`.
    pub fn parse(reference: &str) -> Option<Self> {
        let rest = reference.strip_prefix("objectstore://")?;
        let (bucket, path) = rest.split_once('/')?;
        let (name, tag) = path.split_once(':').unwrap_or((path, "latest"));
        Some(Self {
            bucket: bucket.to_string(),
            name: name.to_string(),
            tag: tag.to_string(),
        })
    }

    fn digest_key(&self, digest: &str) -> String {
        format!("{}/{}.tar", self.name, digest)
    }

    fn tag_key(&self) -> String {
        format!("{}/{}.tar", self.name, self.tag)
    }
}

const MULTIPART_PART_SIZE: usize = 64 * 1024 * 1024;
const INNER_RETRY_ATTEMPTS: usize = 6;
const INNER_RETRY_DELAY: Duration = Duration::from_millis(400);

/// `digest = "sha256-" + hex(sha256(normalised tar stream))` (spec §3, §4.H).
pub fn compute_digest(tar_bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(tar_bytes);
    format!("sha256-{}", hex::encode(hasher.finalize()))
}

/// On-disk memoisation of `local image id -> digest` so repeated pushes of
/// an unchanged image skip re-exporting and re-hashing it (spec §6
/// Persisted state layout: `<cache-dir>/_digests/<imageID>`).
pub async fn cached_digest(cache_dir: &Path, image_id: &str) -> Option<String> {
    let path = digest_cache_path(cache_dir, image_id);
    tokio::fs::read_to_string(path).await.ok().map(|s| s.trim().to_string())
}

pub async fn store_digest(cache_dir: &Path, image_id: &str, digest: &str) -> Result<()> {
    tokio::fs::create_dir_all(cache_dir.join("_digests"))
        .await
        .map_err(|e| ErrorKind::io(format!("creating digest cache dir: {e}")))?;
    tokio::fs::write(digest_cache_path(cache_dir, image_id), digest)
        .await
        .map_err(|e| ErrorKind::io(format!("writing digest cache entry: {e}")))
}

fn digest_cache_path(cache_dir: &Path, image_id: &str) -> std::path::PathBuf {
    cache_dir.join("_digests").join(image_id.replace([':', '/'], "_"))
}

/// Rewrites the `repositories` entry of a `docker save`-format tar so it
/// names `(name, tag)` and/or the digest, preserving the embedded image id
/// (spec §4.H steps 1 and Pull).
pub fn rewrite_repositories_entry(tar_bytes: &[u8], name: &str, tags: &[&str]) -> Result<Vec<u8>> {
    let mut archive = tar::Archive::new(tar_bytes);
    let mut builder = tar::Builder::new(Vec::new());
    let mut image_id = None;

    for entry in archive.entries().map_err(|e| ErrorKind::io(format!("reading tar: {e}")))? {
        let mut entry = entry.map_err(|e| ErrorKind::io(format!("reading tar entry: {e}")))?;
        let path = entry.path().map_err(|e| ErrorKind::io(e.to_string()))?.to_path_buf();

        if path == Path::new("repositories") {
            let mut contents = String::new();
            entry.read_to_string(&mut contents).map_err(|e| ErrorKind::io(e.to_string()))?;
            let repos: serde_json::Value = serde_json::from_str(&contents)
                .map_err(|e| ErrorKind::io(format!("parsing repositories entry: {e}")))?;
            image_id = repos
                .as_object()
                .and_then(|m| m.values().next())
                .and_then(|tags_obj| tags_obj.as_object())
                .and_then(|m| m.values().next())
                .and_then(|v| v.as_str())
                .map(str::to_string);
            continue; // rebuilt below once we know the image id
        }

        let mut header = entry.header().clone();
        let size = header.size().map_err(|e| ErrorKind::io(e.to_string()))?;
        let mut contents = Vec::with_capacity(size as usize);
        entry.read_to_end(&mut contents).map_err(|e| ErrorKind::io(e.to_string()))?;
        builder
            .append_data(&mut header, path, contents.as_slice())
            .map_err(|e| ErrorKind::io(format!("rewriting tar entry: {e}")))?;
    }

    let image_id = image_id.ok_or_else(|| ErrorKind::io("source tar has no repositories entry".to_string()))?;
    let mut repos_map = serde_json::Map::new();
    let mut tag_map = serde_json::Map::new();
    for tag in tags {
        tag_map.insert((*tag).to_string(), serde_json::Value::String(image_id.clone()));
    }
    repos_map.insert(name.to_string(), serde_json::Value::Object(tag_map));
    let repos_json = serde_json::to_vec(&serde_json::Value::Object(repos_map))
        .map_err(|e| ErrorKind::io(e.to_string()))?;

    let mut header = tar::Header::new_gnu();
    header.set_size(repos_json.len() as u64);
    header.set_mode(0o644);
    header.set_mtime(0);
    header.set_cksum();
    builder
        .append_data(&mut header, "repositories", repos_json.as_slice())
        .map_err(|e| ErrorKind::io(format!("writing repositories entry: {e}")))?;

    builder.into_inner().map_err(|e| ErrorKind::io(format!("finalizing tar: {e}")))
}

/// `Push`: inspect, digest-cache lookup, HEAD-then-multipart-upload, then
/// COPY to the tag alias (spec §4.H steps 1-3).
pub async fn push(
    daemon: &dyn DaemonClient,
    s3: &S3Client,
    cache_dir: &Path,
    image_id: &str,
    object_ref: &ObjectStoreRef,
) -> Result<String> {
    let digest = match cached_digest(cache_dir, image_id).await {
        Some(d) => d,
        None => {
            let raw_tar = daemon.export_image(image_id).await?;
            let rewritten = rewrite_repositories_entry(&raw_tar, &object_ref.name, &[&object_ref.tag])?;
            let digest = compute_digest(&rewritten);
            store_digest(cache_dir, image_id, &digest).await?;
            upload_object(s3, &object_ref.bucket, &object_ref.digest_key(&digest), rewritten).await?;
            return copy_to_tag_alias(s3, object_ref, &digest).await.map(|_| digest);
        }
    };

    if !head_exists(s3, &object_ref.bucket, &object_ref.digest_key(&digest)).await? {
        let raw_tar = daemon.export_image(image_id).await?;
        let rewritten = rewrite_repositories_entry(&raw_tar, &object_ref.name, &[&object_ref.tag])?;
        upload_object(s3, &object_ref.bucket, &object_ref.digest_key(&digest), rewritten).await?;
    }
    copy_to_tag_alias(s3, object_ref, &digest).await?;
    Ok(digest)
}

/// Pull: download the tag object, rewrite its `repositories` entry to the
/// requested `(name, tag)` preserving the image id, and load it.
pub async fn pull(daemon: &dyn DaemonClient, s3: &S3Client, object_ref: &ObjectStoreRef) -> Result<String> {
    let bytes = download_object(s3, &object_ref.bucket, &object_ref.tag_key()).await?;
    let rewritten = rewrite_repositories_entry(&bytes, &object_ref.name, &[&object_ref.tag])?;
    daemon.load_image(rewritten).await
}

async fn head_exists(s3: &S3Client, bucket: &str, key: &str) -> Result<bool> {
    match s3.head_object().bucket(bucket).key(key).send().await {
        Ok(_) => Ok(true),
        Err(err) if is_not_found(&err) => Ok(false),
        Err(err) => Err(ErrorKind::collaborator("objectstore_head", err)),
    }
}

fn is_not_found<E: std::fmt::Debug>(err: &E) -> bool {
    format!("{err:?}").contains("NotFound") || format!("{err:?}").contains("404")
}

/// Outer retry around all AWS errors, inner delays up to 6 attempts with
/// linear backoff of 400ms (spec §4.H step 2).
async fn upload_object(s3: &S3Client, bucket: &str, key: &str, bytes: Vec<u8>) -> Result<()> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        match try_multipart_upload(s3, bucket, key, &bytes).await {
            Ok(()) => return Ok(()),
            Err(e) if attempt < INNER_RETRY_ATTEMPTS => {
                warn!(attempt, "object-store upload failed, retrying: {e}");
                tokio::time::sleep(INNER_RETRY_DELAY * attempt as u32).await;
            }
            Err(e) => return Err(e),
        }
    }
}

async fn try_multipart_upload(s3: &S3Client, bucket: &str, key: &str, bytes: &[u8]) -> Result<()> {
    if bytes.len() <= MULTIPART_PART_SIZE {
        s3.put_object()
            .bucket(bucket)
            .key(key)
            .body(ByteStream::from(bytes.to_vec()))
            .send()
            .await
            .map_err(|e| ErrorKind::collaborator("objectstore_put", e))?;
        return Ok(());
    }

    let create = s3
        .create_multipart_upload()
        .bucket(bucket)
        .key(key)
        .send()
        .await
        .map_err(|e| ErrorKind::collaborator("objectstore_create_multipart", e))?;
    let upload_id = create
        .upload_id
        .ok_or_else(|| ErrorKind::collaborator("objectstore_create_multipart", "no upload id"))?;

    let mut completed_parts = Vec::new();
    for (idx, chunk) in bytes.chunks(MULTIPART_PART_SIZE).enumerate() {
        let part_number = (idx + 1) as i32;
        let part = s3
            .upload_part()
            .bucket(bucket)
            .key(key)
            .upload_id(&upload_id)
            .part_number(part_number)
            .body(ByteStream::from(chunk.to_vec()))
            .send()
            .await
            .map_err(|e| ErrorKind::collaborator("objectstore_upload_part", e))?;
        completed_parts.push(
            aws_sdk_s3::types::CompletedPart::builder()
                .e_tag(part.e_tag.unwrap_or_default())
                .part_number(part_number)
                .build(),
        );
        debug!(part_number, "uploaded multipart chunk");
    }

    s3.complete_multipart_upload()
        .bucket(bucket)
        .key(key)
        .upload_id(&upload_id)
        .multipart_upload(
            aws_sdk_s3::types::CompletedMultipartUpload::builder()
                .set_parts(Some(completed_parts))
                .build(),
        )
        .send()
        .await
        .map_err(|e| ErrorKind::collaborator("objectstore_complete_multipart", e))?;
    Ok(())
}

async fn copy_to_tag_alias(s3: &S3Client, object_ref: &ObjectStoreRef, digest: &str) -> Result<()> {
    s3.copy_object()
        .bucket(&object_ref.bucket)
        .copy_source(format!("{}/{}", object_ref.bucket, object_ref.digest_key(digest)))
        .key(object_ref.tag_key())
        .send()
        .await
        .map_err(|e| ErrorKind::collaborator("objectstore_copy_alias", e))?;
    Ok(())
}

async fn download_object(s3: &S3Client, bucket: &str, key: &str) -> Result<Vec<u8>> {
    let output = s3
        .get_object()
        .bucket(bucket)
        .key(key)
        .send()
        .await
        .map_err(|e| ErrorKind::collaborator("objectstore_get", e))?;
    output
        .body
        .collect()
        .await
        .map(|data| data.into_bytes().to_vec())
        .map_err(|e| ErrorKind::collaborator("objectstore_get_body", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_object_store_ref() {
        let r = ObjectStoreRef::parse("objectstore://mybucket/myapp:v1").unwrap();
        assert_eq!(r.bucket, "mybucket");
        assert_eq!(r.name, "myapp");
        assert_eq!(r.tag, "v1");
    }

    #[test]
    fn digest_is_stable() {
        let a = compute_digest(b"hello");
        let b = compute_digest(b"hello");
        assert_eq!(a, b);
        assert!(a.starts_with("sha256-"));
    }
}
