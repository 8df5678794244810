//! In-memory [`DaemonClient`] for tests (spec §9: "define the capability set
//! ... and provide a mock").
//!
//! Ids are deterministic content hashes of the inputs that produced them, so
//! that two identical builds against the mock produce identical image ids —
//! exactly the property the cache idempotence tests in spec §8 rely on.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use crate::error::{ErrorKind, Result};
use crate::state::{HostConfig, State};

use super::{ContainerPurpose, DaemonClient, ImageInfo};

#[derive(Debug, Default)]
struct Inner {
    images: BTreeMap<String, ImageInfo>,
    containers: BTreeMap<String, String>,
    named_containers: BTreeMap<String, String>,
    /// `(container_id, path) -> last-uploaded tar bytes`, so
    /// `download_from_container` can hand back what `upload_to_container`
    /// staged (used by EXPORT/IMPORT round-trip tests).
    uploads: BTreeMap<(String, String), Vec<u8>>,
    removed_images: Vec<String>,
    removed_containers: Vec<String>,
    pulls: Vec<String>,
    tags: Vec<(String, String)>,
    pushes: Vec<String>,
    next_id: u64,
}

/// A deterministic, fully in-process stand-in for the Docker daemon.
#[derive(Debug, Default)]
pub struct MockDaemonClient {
    inner: Mutex<Inner>,
}

impl MockDaemonClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds a base image as if `docker pull` had already cached it locally.
    pub fn seed_image(&self, reference: &str, info: ImageInfo) {
        self.inner.lock().unwrap().images.insert(reference.to_string(), info);
    }

    pub fn pull_count(&self) -> usize {
        self.inner.lock().unwrap().pulls.len()
    }

    pub fn tags(&self) -> Vec<(String, String)> {
        self.inner.lock().unwrap().tags.clone()
    }

    /// Purely a function of `seed`: two builds that stage identical
    /// `(image_id, config)`/`(image_id, message)` content must derive the
    /// same id, which is the one property the mock exists to let the cache
    /// idempotence tests verify.
    fn next_id(prefix: &str, seed: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(seed.as_bytes());
        format!("{prefix}{}", hex::encode(hasher.finalize()))
    }
}

#[async_trait]
impl DaemonClient for MockDaemonClient {
    async fn inspect_image(&self, reference: &str) -> Result<Option<ImageInfo>> {
        Ok(self.inner.lock().unwrap().images.get(reference).cloned())
    }

    async fn pull_image(&self, reference: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.pulls.push(reference.to_string());
        inner.images.entry(reference.to_string()).or_insert_with(|| ImageInfo {
            id: format!("sha256:mock-{reference}"),
            ..Default::default()
        });
        Ok(())
    }

    async fn remove_image(&self, id: &str) -> Result<()> {
        self.inner.lock().unwrap().removed_images.push(id.to_string());
        Ok(())
    }

    async fn tag_image(&self, id: &str, reference: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.tags.push((id.to_string(), reference.to_string()));
        let info = inner.images.values().find(|i| i.id == id).cloned();
        if let Some(info) = info {
            inner.images.insert(reference.to_string(), info);
        }
        Ok(())
    }

    async fn push_image(&self, reference: &str) -> Result<()> {
        self.inner.lock().unwrap().pushes.push(reference.to_string());
        Ok(())
    }

    async fn create_container(&self, state: &State, _host_config: &HostConfig) -> Result<String> {
        let seed = format!("{}/{:?}", state.image_id, state.config);
        let id = Self::next_id("mockctr-", &seed);
        self.inner.lock().unwrap().containers.insert(id.clone(), state.image_id.clone());
        Ok(id)
    }

    async fn run_container(&self, id: &str, _attach: bool) -> Result<()> {
        if !self.inner.lock().unwrap().containers.contains_key(id) {
            return Err(ErrorKind::collaborator("run_container", format!("no such container {id}")));
        }
        Ok(())
    }

    async fn commit_container(&self, state: &State, message: &str) -> Result<String> {
        let seed = format!("{}/{message}", state.image_id);
        let id = Self::next_id("sha256:mockimg-", &seed);
        let info = ImageInfo {
            id: id.clone(),
            env: state.config.env.clone(),
            cmd: state.config.cmd.clone(),
            entrypoint: state.config.entrypoint.clone(),
            labels: state.config.labels.clone(),
            exposed_ports: state.config.exposed_ports.clone(),
            volumes: state.config.volumes.clone(),
            user: state.config.user.clone(),
            onbuild: Vec::new(),
        };
        self.inner.lock().unwrap().images.insert(id.clone(), info);
        Ok(id)
    }

    async fn remove_container(&self, id: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.containers.remove(id);
        inner.removed_containers.push(id.to_string());
        Ok(())
    }

    async fn upload_to_container(&self, id: &str, tar_stream: Vec<u8>, path: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.containers.contains_key(id) {
            return Err(ErrorKind::collaborator("upload_to_container", format!("no such container {id}")));
        }
        inner.uploads.insert((id.to_string(), path.to_string()), tar_stream);
        Ok(())
    }

    async fn download_from_container(&self, id: &str, path: &str) -> Result<Vec<u8>> {
        let inner = self.inner.lock().unwrap();
        inner
            .uploads
            .get(&(id.to_string(), path.to_string()))
            .cloned()
            .ok_or_else(|| ErrorKind::collaborator("download_from_container", format!("nothing staged at {id}:{path}")))
    }

    async fn resolve_host_path(&self, path: &str) -> Result<String> {
        Ok(path.to_string())
    }

    async fn export_image(&self, id: &str) -> Result<Vec<u8>> {
        let inner = self.inner.lock().unwrap();
        let info = inner
            .images
            .values()
            .find(|i| i.id == id)
            .cloned()
            .ok_or_else(|| ErrorKind::collaborator("export_image", format!("no such image {id}")))?;
        serde_json::to_vec(&(id, info.env, info.cmd))
            .map_err(|e| ErrorKind::collaborator("export_image", e))
    }

    async fn load_image(&self, tar_stream: Vec<u8>) -> Result<String> {
        let (id, _env, _cmd): (String, Vec<String>, Option<Vec<String>>) =
            serde_json::from_slice(&tar_stream)
                .map_err(|e| ErrorKind::collaborator("load_image", e))?;
        let mut inner = self.inner.lock().unwrap();
        inner.images.entry(id.clone()).or_insert_with(|| ImageInfo {
            id: id.clone(),
            ..Default::default()
        });
        Ok(id)
    }

    async fn ensure_container(&self, name: &str, image: &str, _purpose: ContainerPurpose) -> Result<String> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(id) = inner.named_containers.get(name) {
            return Ok(id.clone());
        }
        inner.next_id += 1;
        let id = format!("mockctr-named-{}-{}", name, inner.next_id);
        inner.named_containers.insert(name.to_string(), id.clone());
        inner.containers.insert(id.clone(), image.to_string());
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn commit_is_deterministic_given_same_inputs() {
        let client = MockDaemonClient::new();
        let state = State::new().with_image_id("sha256:base");
        let a = client.commit_container(&state, "RUN true").await.unwrap();
        let client2 = MockDaemonClient::new();
        let b = client2.commit_container(&state, "RUN true").await.unwrap();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn ensure_container_reuses_by_name() {
        let client = MockDaemonClient::new();
        let a = client.ensure_container("mount1", "busybox", ContainerPurpose::Mount).await.unwrap();
        let b = client.ensure_container("mount1", "busybox", ContainerPurpose::Mount).await.unwrap();
        assert_eq!(a, b);
    }
}
