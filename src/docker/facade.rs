//! The engine abstraction handlers depend on, and its bollard implementation.

use std::pin::Pin;

use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{
    CreateContainerOptions, ListContainersOptions, LogsOptions, RemoveContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::image::{CreateImageOptions, ListImagesOptions, RemoveImageOptions};
use bollard::system::EventsOptions;
use bytes::Bytes;
use futures::{Stream, StreamExt, TryStreamExt};
use serde_json::{Value, json};

use super::connections::{self, ConnectionCounts, NETSTAT_COMMAND};
use super::demux;
use super::error::{DockerError, Result};
use super::types::{
    ContainerDetails, ContainerListItem, ContainerSpec, CreatedContainer, DockerEvent, ImageInfo,
    config_from_inspect,
};

/// Raw log bytes from a following log stream.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

/// Progress messages of an image pull, as the daemon reports them.
pub type JsonStream = Pin<Box<dyn Stream<Item = Result<Value>> + Send>>;

/// The daemon's event feed.
pub type EventStream = Pin<Box<dyn Stream<Item = Result<DockerEvent>> + Send>>;

/// Operations the gateway performs against the Docker daemon.
#[async_trait]
pub trait DockerFacade: Send + Sync {
    async fn ping(&self) -> Result<()>;

    /// List containers; `all` includes stopped ones.
    async fn list_containers(&self, all: bool) -> Result<Vec<ContainerListItem>>;

    /// Inspect without sampling connections.
    async fn inspect_container(&self, id: &str) -> Result<ContainerDetails>;

    async fn create_container(&self, spec: &ContainerSpec) -> Result<CreatedContainer>;

    /// Replace a container with one built from `spec`.
    ///
    /// Not atomic: the old container is removed before the new one is
    /// created. If creation fails the old config is recreated, and if that
    /// also fails the original is gone.
    async fn update_container(&self, id: &str, spec: &ContainerSpec) -> Result<CreatedContainer>;

    async fn remove_container(&self, id: &str) -> Result<()>;
    async fn start_container(&self, id: &str) -> Result<()>;
    async fn stop_container(&self, id: &str) -> Result<()>;
    async fn restart_container(&self, id: &str) -> Result<()>;

    /// The last `tail` lines of stdout and stderr, headers stripped.
    async fn logs(&self, id: &str, tail: usize) -> Result<String>;

    /// Follow the log from now on. Fails up front if the container is missing.
    async fn follow_logs(&self, id: &str) -> Result<ByteStream>;

    /// Run `command` through `/bin/sh -c` and capture stdout and stderr.
    async fn exec(&self, id: &str, command: &str) -> Result<String>;

    async fn list_images(&self) -> Result<Vec<ImageInfo>>;

    /// Start pulling `image`.
    ///
    /// Failures the daemon reports inside the progress stream arrive as
    /// `Ok` messages carrying an `error` field.
    async fn pull_image(&self, image: &str) -> Result<JsonStream>;

    /// Force-remove an image.
    async fn remove_image(&self, image: &str) -> Result<()>;

    async fn events(&self) -> Result<EventStream>;

    /// Inspect, adding connection counts while the container is running.
    async fn container_details(&self, id: &str) -> Result<ContainerDetails> {
        let mut details = self.inspect_container(id).await?;
        if details.state.running {
            match self.connections(&details.id).await {
                Ok(counts) => details.connections = Some(counts),
                Err(e) => {
                    tracing::warn!(container = %details.id, error = %e, "Connection sampling failed")
                }
            }
        }
        Ok(details)
    }

    /// Established TCP connections inside one container, by local port.
    async fn connections(&self, id: &str) -> Result<ConnectionCounts> {
        let output = self.exec(id, NETSTAT_COMMAND).await?;
        Ok(connections::parse_netstat(&output))
    }

    /// Connection counts summed over every running container.
    ///
    /// Containers that cannot be sampled are skipped.
    async fn all_connections(&self) -> Result<ConnectionCounts> {
        let mut total = ConnectionCounts::new();
        for container in self.list_containers(false).await? {
            match self.connections(&container.id).await {
                Ok(counts) => connections::merge(&mut total, counts),
                Err(e) => {
                    tracing::debug!(container = %container.id, error = %e, "Skipping connection sample")
                }
            }
        }
        Ok(total)
    }
}

/// [`DockerFacade`] over a bollard client.
pub struct BollardFacade {
    docker: Docker,
    host_volume_dir: String,
}

impl BollardFacade {
    /// Connect using the environment's defaults (`DOCKER_HOST` or the local socket).
    pub fn connect(host_volume_dir: impl Into<String>) -> Result<Self> {
        let docker =
            Docker::connect_with_local_defaults().map_err(|e| DockerError::Unavailable {
                reason: e.to_string(),
            })?;
        Ok(Self::with_client(docker, host_volume_dir))
    }

    pub fn with_client(docker: Docker, host_volume_dir: impl Into<String>) -> Self {
        Self {
            docker,
            host_volume_dir: host_volume_dir.into(),
        }
    }

    async fn create_from_spec(&self, spec: &ContainerSpec) -> Result<CreatedContainer> {
        spec.validate()?;
        let config = spec.to_engine_config(&self.host_volume_dir)?;
        let options = spec.name.as_ref().map(|name| CreateContainerOptions {
            name: name.clone(),
            platform: None,
        });
        let response = self.docker.create_container(options, config).await?;
        Ok(CreatedContainer {
            id: response.id,
            warnings: response.warnings,
        })
    }

    fn log_options(follow: bool, tail: &str) -> LogsOptions<String> {
        LogsOptions {
            follow,
            stdout: true,
            stderr: true,
            timestamps: false,
            tail: tail.to_string(),
            ..Default::default()
        }
    }
}

#[async_trait]
impl DockerFacade for BollardFacade {
    async fn ping(&self) -> Result<()> {
        self.docker
            .ping()
            .await
            .map(|_| ())
            .map_err(|e| DockerError::Unavailable {
                reason: e.to_string(),
            })
    }

    async fn list_containers(&self, all: bool) -> Result<Vec<ContainerListItem>> {
        let options = ListContainersOptions::<String> {
            all,
            ..Default::default()
        };
        let containers = self.docker.list_containers(Some(options)).await?;
        Ok(containers.into_iter().map(ContainerListItem::from).collect())
    }

    async fn inspect_container(&self, id: &str) -> Result<ContainerDetails> {
        let inspect = self.docker.inspect_container(id, None).await?;
        Ok(ContainerDetails::from_inspect(inspect))
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<CreatedContainer> {
        let created = self.create_from_spec(spec).await?;
        tracing::info!(id = %created.id, image = %spec.image, "Container created");
        Ok(created)
    }

    async fn update_container(&self, id: &str, spec: &ContainerSpec) -> Result<CreatedContainer> {
        spec.validate()?;
        let previous = self.docker.inspect_container(id, None).await?;
        let previous_name = previous
            .name
            .as_deref()
            .map(|n| n.trim_start_matches('/').to_string());

        self.docker.remove_container(id, None).await?;

        let mut spec = spec.clone();
        if spec.name.is_none() {
            spec.name = previous_name.clone();
        }

        match self.create_from_spec(&spec).await {
            Ok(created) => {
                tracing::info!(old = %id, new = %created.id, "Container updated");
                Ok(created)
            }
            Err(e) => {
                tracing::warn!(container = %id, error = %e, "Update failed, recreating previous container");
                let options = previous_name.map(|name| CreateContainerOptions {
                    name,
                    platform: None,
                });
                let rollback = match self
                    .docker
                    .create_container(options, config_from_inspect(&previous))
                    .await
                {
                    Ok(restored) => format!("recreated previous container as {}", restored.id),
                    Err(rollback_err) => {
                        tracing::error!(container = %id, error = %rollback_err, "Rollback failed, previous container lost");
                        format!("failed to recreate previous container: {}", rollback_err)
                    }
                };
                Err(DockerError::UpdateFailed {
                    reason: e.to_string(),
                    rollback,
                })
            }
        }
    }

    async fn remove_container(&self, id: &str) -> Result<()> {
        self.docker
            .remove_container(
                id,
                Some(RemoveContainerOptions {
                    v: false,
                    ..Default::default()
                }),
            )
            .await?;
        tracing::info!(container = %id, "Container removed");
        Ok(())
    }

    async fn start_container(&self, id: &str) -> Result<()> {
        self.docker
            .start_container::<String>(id, None)
            .await
            .map_err(DockerError::from)
    }

    async fn stop_container(&self, id: &str) -> Result<()> {
        self.docker
            .stop_container(id, None)
            .await
            .map_err(DockerError::from)
    }

    async fn restart_container(&self, id: &str) -> Result<()> {
        self.docker
            .restart_container(id, None)
            .await
            .map_err(DockerError::from)
    }

    async fn logs(&self, id: &str, tail: usize) -> Result<String> {
        let chunks: Vec<_> = self
            .docker
            .logs(id, Some(Self::log_options(false, &tail.to_string())))
            .try_collect()
            .await?;
        let mut raw = Vec::new();
        for chunk in chunks {
            raw.extend_from_slice(&chunk.into_bytes());
        }
        Ok(String::from_utf8_lossy(&demux::strip_lines(&raw)).into_owned())
    }

    async fn follow_logs(&self, id: &str) -> Result<ByteStream> {
        // The log endpoint only reports a missing container once polled
        self.docker.inspect_container(id, None).await?;
        let stream = self
            .docker
            .logs(id, Some(Self::log_options(true, "0")))
            .map(|item| item.map(|out| out.into_bytes()).map_err(DockerError::from));
        Ok(Box::pin(stream))
    }

    async fn exec(&self, id: &str, command: &str) -> Result<String> {
        let exec = self
            .docker
            .create_exec(
                id,
                CreateExecOptions {
                    cmd: Some(vec!["/bin/sh", "-c", command]),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    tty: Some(false),
                    ..Default::default()
                },
            )
            .await?;

        let mut raw = Vec::new();
        if let StartExecResults::Attached { mut output, .. } =
            self.docker.start_exec(&exec.id, None).await?
        {
            while let Some(chunk) = output.next().await {
                raw.extend_from_slice(&chunk?.into_bytes());
            }
        }
        Ok(String::from_utf8_lossy(demux::strip_header(&raw)).into_owned())
    }

    async fn list_images(&self) -> Result<Vec<ImageInfo>> {
        let images = self
            .docker
            .list_images(Some(ListImagesOptions::<String> {
                all: false,
                ..Default::default()
            }))
            .await?;
        Ok(images.into_iter().map(ImageInfo::from).collect())
    }

    async fn pull_image(&self, image: &str) -> Result<JsonStream> {
        if image.trim().is_empty() {
            return Err(DockerError::InvalidRequest("image is required".to_string()));
        }
        tracing::info!(image = %image, "Pulling image");
        let options = CreateImageOptions {
            from_image: image.to_string(),
            ..Default::default()
        };
        let stream = self
            .docker
            .create_image(Some(options), None, None)
            .map(|item| match item {
                Ok(info) => serde_json::to_value(info).map_err(|e| {
                    DockerError::Unavailable {
                        reason: format!("undecodable pull progress: {}", e),
                    }
                }),
                Err(bollard::errors::Error::DockerStreamError { error }) => Ok(json!({
                    "errorDetail": { "message": error },
                    "error": error,
                })),
                Err(e) => Err(DockerError::from(e)),
            });
        Ok(Box::pin(stream))
    }

    async fn remove_image(&self, image: &str) -> Result<()> {
        self.docker
            .remove_image(
                image,
                Some(RemoveImageOptions {
                    force: true,
                    ..Default::default()
                }),
                None,
            )
            .await?;
        tracing::info!(image = %image, "Image removed");
        Ok(())
    }

    async fn events(&self) -> Result<EventStream> {
        let stream = self
            .docker
            .events(None::<EventsOptions<String>>)
            .map(|item| item.map(DockerEvent::from).map_err(DockerError::from));
        Ok(Box::pin(stream))
    }
}
