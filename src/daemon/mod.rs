//! Daemon client contract (spec §6, §9: "Do not inline daemon calls").
//!
//! The engine only ever talks to the container daemon through this trait, so
//! that [`mock::MockDaemonClient`] can stand in during tests the same way the
//! teacher abstracts `docker_socket::get_or_init_default_docker_instance`
//! behind a narrow surface.

pub mod bollard_client;
pub mod mock;

use async_trait::async_trait;

use crate::error::Result;
use crate::state::{HostConfig, State};

pub use bollard_client::BollardDaemonClient;
pub use mock::MockDaemonClient;

/// Image metadata the engine needs after `InspectImage` (spec §4.E FROM).
#[derive(Debug, Clone, Default)]
pub struct ImageInfo {
    pub id: String,
    pub env: Vec<String>,
    pub cmd: Option<Vec<String>>,
    pub entrypoint: Option<Vec<String>>,
    pub labels: std::collections::BTreeMap<String, String>,
    pub exposed_ports: Vec<String>,
    pub volumes: Vec<String>,
    pub user: String,
    pub onbuild: Vec<String>,
}

/// Why a container is being created, so a mock or adapter can apply
/// different defaults (a mount-volume container never runs a process, for
/// instance).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerPurpose {
    Build,
    Mount,
    Export,
}

/// The capability set the engine consumes (spec §6). Implementations must
/// not assume any particular daemon transport; [`BollardDaemonClient`] is the
/// production adapter over the Docker Engine API.
#[async_trait]
pub trait DaemonClient: Send + Sync {
    async fn inspect_image(&self, reference: &str) -> Result<Option<ImageInfo>>;
    async fn pull_image(&self, reference: &str) -> Result<()>;
    async fn remove_image(&self, id: &str) -> Result<()>;
    async fn tag_image(&self, id: &str, reference: &str) -> Result<()>;
    async fn push_image(&self, reference: &str) -> Result<()>;

    async fn create_container(&self, state: &State, host_config: &HostConfig) -> Result<String>;
    async fn run_container(&self, id: &str, attach: bool) -> Result<()>;
    async fn commit_container(&self, state: &State, message: &str) -> Result<String>;
    async fn remove_container(&self, id: &str) -> Result<()>;

    async fn upload_to_container(&self, id: &str, tar_stream: Vec<u8>, path: &str) -> Result<()>;

    /// Downloads `path` out of a container as a tar stream (spec §4.H
    /// IMPORT: read back what an earlier EXPORT staged into the shared
    /// exports volume).
    async fn download_from_container(&self, id: &str, path: &str) -> Result<Vec<u8>>;

    async fn resolve_host_path(&self, path: &str) -> Result<String>;

    /// Exports `id` as a tar stream in the classic `docker save` layout
    /// (used by object-store Push, spec §4.H).
    async fn export_image(&self, id: &str) -> Result<Vec<u8>>;

    /// Loads a `docker save`-layout tar stream as an image, returning its id
    /// (used by object-store Pull, spec §4.H).
    async fn load_image(&self, tar_stream: Vec<u8>) -> Result<String>;

    /// `InspectImage` then `PullImage`+`InspectImage` on miss, per the FROM
    /// contract in spec §4.E.
    async fn ensure_image(&self, reference: &str, skip_local_lookup: bool) -> Result<ImageInfo> {
        if !skip_local_lookup {
            if let Some(info) = self.inspect_image(reference).await? {
                return Ok(info);
            }
        }
        self.pull_image(reference).await?;
        self.inspect_image(reference)
            .await?
            .ok_or_else(|| crate::error::ErrorKind::collaborator(
                "ensure_image",
                format!("Failed to inspect image after pull: {reference}"),
            ))
    }

    /// `EnsureContainer(name, config, purpose)`: finds a reusable container
    /// by name or creates it (spec §4.E MOUNT).
    async fn ensure_container(
        &self,
        name: &str,
        image: &str,
        purpose: ContainerPurpose,
    ) -> Result<String>;
}
