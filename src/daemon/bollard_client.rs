//! The production [`DaemonClient`] adapter over the Docker Engine API,
//! generalizing `super_docker_file.rs`'s use of `bollard` to the full
//! capability set the engine needs (spec §6).

use std::collections::HashMap;

use async_trait::async_trait;
use bollard::container::{Config as ContainerCreateConfig, CreateContainerOptions};
use bollard::image::{CommitContainerOptions, CreateImageOptions, PushImageOptions, TagImageOptions};
use bollard::models::HostConfig as BollardHostConfig;
use bollard::Docker;
use futures::StreamExt;
use tracing::{debug, instrument, warn};

use crate::error::{ErrorKind, Result};
use crate::state::{HostConfig, State};

use super::{ContainerPurpose, DaemonClient, ImageInfo};

/// Wraps a live `bollard::Docker` connection. Constructed from the CLI's
/// global `--host`/TLS options (spec §6).
#[derive(Debug, Clone)]
pub struct BollardDaemonClient {
    docker: Docker,
}

impl BollardDaemonClient {
    pub fn new(docker: Docker) -> Self {
        Self { docker }
    }

    /// Connects using `DOCKER_HOST`/TLS environment defaults, mirroring
    /// `docker_socket::get_or_init_default_docker_instance`.
    pub fn connect_with_defaults() -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| ErrorKind::collaborator("connect", e))?;
        Ok(Self { docker })
    }

    fn to_bollard_config(state: &State, host_config: &HostConfig) -> ContainerCreateConfig<String> {
        let cfg = &state.config;
        ContainerCreateConfig {
            image: Some(state.image_id.clone()),
            env: Some(cfg.env.clone()),
            labels: Some(cfg.labels.clone().into_iter().collect()),
            working_dir: if cfg.workdir.is_empty() {
                None
            } else {
                Some(cfg.workdir.clone())
            },
            cmd: cfg.cmd.clone(),
            entrypoint: cfg.entrypoint.clone(),
            exposed_ports: Some(
                cfg.exposed_ports
                    .iter()
                    .map(|p| (p.clone(), HashMap::new()))
                    .collect(),
            ),
            user: if cfg.user.is_empty() {
                None
            } else {
                Some(cfg.user.clone())
            },
            tty: Some(cfg.tty),
            open_stdin: Some(cfg.open_stdin),
            host_config: Some(BollardHostConfig {
                binds: Some(host_config.binds.clone()),
                volumes_from: Some(host_config.volumes_from.clone()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}

#[async_trait]
impl DaemonClient for BollardDaemonClient {
    #[instrument(skip(self))]
    async fn inspect_image(&self, reference: &str) -> Result<Option<ImageInfo>> {
        match self.docker.inspect_image(reference).await {
            Ok(image) => {
                let config = image.config.unwrap_or_default();
                Ok(Some(ImageInfo {
                    id: image.id.unwrap_or_default(),
                    env: config.env.unwrap_or_default(),
                    cmd: config.cmd,
                    entrypoint: config.entrypoint,
                    labels: config.labels.unwrap_or_default().into_iter().collect(),
                    exposed_ports: config
                        .exposed_ports
                        .unwrap_or_default()
                        .keys()
                        .cloned()
                        .collect(),
                    volumes: config
                        .volumes
                        .unwrap_or_default()
                        .keys()
                        .cloned()
                        .collect(),
                    user: config.user.unwrap_or_default(),
                    onbuild: config.on_build.unwrap_or_default(),
                }))
            }
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(None),
            Err(e) => Err(ErrorKind::collaborator("inspect_image", e)),
        }
    }

    #[instrument(skip(self))]
    async fn pull_image(&self, reference: &str) -> Result<()> {
        let options = Some(CreateImageOptions {
            from_image: reference.to_string(),
            ..Default::default()
        });
        let mut stream = self.docker.create_image(options, None, None);
        while let Some(progress) = stream.next().await {
            match progress {
                Ok(info) => {
                    if let Some(status) = info.status {
                        debug!(%status, "pull progress");
                    }
                }
                Err(e) => return Err(ErrorKind::collaborator("pull_image", e)),
            }
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn remove_image(&self, id: &str) -> Result<()> {
        self.docker
            .remove_image(id, None, None)
            .await
            .map_err(|e| ErrorKind::collaborator("remove_image", e))?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn tag_image(&self, id: &str, reference: &str) -> Result<()> {
        let (repo, tag) = split_reference(reference);
        let options = TagImageOptions { repo, tag };
        self.docker
            .tag_image(id, Some(options))
            .await
            .map_err(|e| ErrorKind::collaborator("tag_image", e))
    }

    #[instrument(skip(self))]
    async fn push_image(&self, reference: &str) -> Result<()> {
        let (repo, tag) = split_reference(reference);
        let options = Some(PushImageOptions { tag });
        let mut stream = self.docker.push_image(&repo, options, None, None);
        while let Some(progress) = stream.next().await {
            progress.map_err(|e| ErrorKind::collaborator("push_image", e))?;
        }
        Ok(())
    }

    #[instrument(skip(self, state))]
    async fn create_container(&self, state: &State, host_config: &HostConfig) -> Result<String> {
        let config = Self::to_bollard_config(state, host_config);
        let options: Option<CreateContainerOptions<String>> = None;
        let response = self
            .docker
            .create_container(options, config)
            .await
            .map_err(|e| ErrorKind::collaborator("create_container", e))?;
        Ok(response.id)
    }

    #[instrument(skip(self))]
    async fn run_container(&self, id: &str, attach: bool) -> Result<()> {
        self.docker
            .start_container::<String>(id, None)
            .await
            .map_err(|e| ErrorKind::collaborator("run_container", e))?;
        let wait_options = bollard::container::WaitContainerOptions {
            condition: "not-running".to_string(),
        };
        let mut stream = self.docker.wait_container(id, Some(wait_options));
        while let Some(result) = stream.next().await {
            match result {
                Ok(status) if status.status_code != 0 && !attach => {
                    warn!(exit_code = status.status_code, "container exited non-zero");
                    return Err(ErrorKind::collaborator(
                        "run_container",
                        format!("exit code {}", status.status_code),
                    ));
                }
                Ok(_) => {}
                Err(e) => return Err(ErrorKind::collaborator("run_container", e)),
            }
        }
        Ok(())
    }

    #[instrument(skip(self, state))]
    async fn commit_container(&self, state: &State, message: &str) -> Result<String> {
        let options = CommitContainerOptions {
            container: state.container_id.clone(),
            repo: String::new(),
            tag: String::new(),
            comment: message.to_string(),
            author: String::new(),
            pause: true,
            changes: String::new(),
        };
        let config = Self::to_bollard_config(state, &HostConfig::default());
        let response = self
            .docker
            .commit_container(options, config)
            .await
            .map_err(|e| ErrorKind::collaborator("commit_container", e))?;
        response
            .id
            .ok_or_else(|| ErrorKind::collaborator("commit_container", "no image id returned"))
    }

    #[instrument(skip(self))]
    async fn remove_container(&self, id: &str) -> Result<()> {
        self.docker
            .remove_container(id, None)
            .await
            .map_err(|e| ErrorKind::collaborator("remove_container", e))
    }

    #[instrument(skip(self, tar_stream))]
    async fn upload_to_container(&self, id: &str, tar_stream: Vec<u8>, path: &str) -> Result<()> {
        let options = bollard::container::UploadToContainerOptions {
            path: path.to_string(),
            no_overwrite_dir_non_dir: String::new(),
        };
        self.docker
            .upload_to_container(id, Some(options), tar_stream.into())
            .await
            .map_err(|e| ErrorKind::collaborator("upload_to_container", e))
    }

    #[instrument(skip(self))]
    async fn download_from_container(&self, id: &str, path: &str) -> Result<Vec<u8>> {
        let options = bollard::container::DownloadFromContainerOptions {
            path: path.to_string(),
        };
        let mut stream = self.docker.download_from_container(id, Some(options));
        let mut out = Vec::new();
        while let Some(chunk) = stream.next().await {
            out.extend_from_slice(&chunk.map_err(|e| ErrorKind::collaborator("download_from_container", e))?);
        }
        Ok(out)
    }

    async fn resolve_host_path(&self, path: &str) -> Result<String> {
        dunce::canonicalize(path)
            .map(|p| p.to_string_lossy().into_owned())
            .map_err(|e| ErrorKind::io(format!("resolving host path {path:?}: {e}")))
    }

    #[instrument(skip(self))]
    async fn export_image(&self, id: &str) -> Result<Vec<u8>> {
        let mut stream = self.docker.export_image(id);
        let mut out = Vec::new();
        while let Some(chunk) = stream.next().await {
            out.extend_from_slice(&chunk.map_err(|e| ErrorKind::collaborator("export_image", e))?);
        }
        Ok(out)
    }

    #[instrument(skip(self, tar_stream))]
    async fn load_image(&self, tar_stream: Vec<u8>) -> Result<String> {
        let options = bollard::image::ImportImageOptions { quiet: true };
        let body = futures::stream::once(async move { Ok::<_, std::io::Error>(bytes::Bytes::from(tar_stream)) });
        let mut stream = self.docker.import_image_stream(options, body, None);
        let mut last_id = None;
        while let Some(info) = stream.next().await {
            let info = info.map_err(|e| ErrorKind::collaborator("load_image", e))?;
            if let Some(id) = info.stream {
                last_id = Some(id.trim().to_string());
            }
        }
        last_id.ok_or_else(|| ErrorKind::collaborator("load_image", "no image id reported by daemon"))
    }

    #[instrument(skip(self))]
    async fn ensure_container(
        &self,
        name: &str,
        image: &str,
        purpose: ContainerPurpose,
    ) -> Result<String> {
        if let Ok(existing) = self.docker.inspect_container(name, None).await {
            if let Some(id) = existing.id {
                return Ok(id);
            }
        }
        let cmd = match purpose {
            ContainerPurpose::Build => None,
            ContainerPurpose::Mount | ContainerPurpose::Export => {
                Some(vec!["/bin/sh".to_string(), "-c".to_string(), "sleep infinity".to_string()])
            }
        };
        let config = ContainerCreateConfig {
            image: Some(image.to_string()),
            cmd,
            ..Default::default()
        };
        let options = Some(CreateContainerOptions {
            name: name.to_string(),
            platform: None,
        });
        let response = self
            .docker
            .create_container(options, config)
            .await
            .map_err(|e| ErrorKind::collaborator("ensure_container", e))?;
        Ok(response.id)
    }
}

fn split_reference(reference: &str) -> (String, String) {
    match reference.rsplit_once(':') {
        Some((repo, tag)) if !tag.contains('/') => (repo.to_string(), tag.to_string()),
        _ => (reference.to_string(), "latest".to_string()),
    }
}
