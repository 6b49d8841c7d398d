//! Container runtime seam
//!
//! The container backend talks to Docker only through [`ContainerRuntime`],
//! so its lifecycle can be exercised without a daemon.

use async_trait::async_trait;
use bollard::container::{
    AttachContainerOptions, Config, CreateContainerOptions, InspectContainerOptions,
    KillContainerOptions, LogOutput, RemoveContainerOptions, StartContainerOptions, StatsOptions,
    WaitContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::{HostConfig, ResourcesUlimits};
use bollard::Docker;
use futures::stream::BoxStream;
use futures::StreamExt;
use std::collections::HashMap;
use std::path::PathBuf;
use tracing::{debug, info};

use crate::config::ContainerConfig;
use crate::error::{Error, Result};
use crate::sandbox::executor::ResourceUsage;

/// Mount point of the code directory inside the container
pub const CODE_MOUNT: &str = "/sandbox";

/// Everything needed to create one execution container
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub command: Vec<String>,
    pub env: Vec<String>,
    /// Host directory bound read-only at [`CODE_MOUNT`]
    pub code_dir: PathBuf,
    pub memory_bytes: u64,
    pub cpu_period: i64,
    pub cpu_quota: i64,
    pub network: String,
    pub user: String,
    pub pids_limit: i64,
    pub nofile: i64,
    pub nproc: i64,
    pub tmpfs_size: String,
}

/// The parts of container state the backend cares about
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ContainerState {
    pub running: bool,
    pub oom_killed: bool,
    pub exit_code: Option<i64>,
}

/// Container runtime operations
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn create(&self, spec: &ContainerSpec) -> Result<()>;

    /// Combined stdout/stderr, decoded lossily
    async fn attach(&self, name: &str) -> Result<BoxStream<'static, Result<String>>>;

    async fn start(&self, name: &str) -> Result<()>;

    /// Block until the container stops, returning its exit status
    async fn wait(&self, name: &str) -> Result<i64>;

    async fn inspect(&self, name: &str) -> Result<ContainerState>;

    async fn stats(&self, name: &str) -> Result<ResourceUsage>;

    async fn kill(&self, name: &str) -> Result<()>;

    async fn remove(&self, name: &str) -> Result<()>;

    async fn image_available(&self, image: &str) -> Result<bool>;

    async fn pull_image(&self, image: &str) -> Result<()>;
}

/// Docker runtime backed by bollard
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    /// Connect and ping the daemon
    pub async fn connect(config: &ContainerConfig) -> Result<Self> {
        let docker = match config.docker_host.as_deref() {
            Some(host) if host.starts_with("unix://") => {
                Docker::connect_with_unix(host, 120, bollard::API_DEFAULT_VERSION)
            }
            Some(host) => Docker::connect_with_http(host, 120, bollard::API_DEFAULT_VERSION),
            None => Docker::connect_with_local_defaults(),
        }
        .map_err(|e| Error::Container(format!("Failed to connect to Docker: {}", e)))?;

        docker
            .ping()
            .await
            .map_err(|e| Error::Container(format!("Docker ping failed: {}", e)))?;

        info!("Container runtime connected to Docker");
        Ok(DockerRuntime { docker })
    }

    fn host_config(spec: &ContainerSpec) -> HostConfig {
        let memory = i64::try_from(spec.memory_bytes).unwrap_or(i64::MAX);
        let ulimit = |name: &str, limit: i64| ResourcesUlimits {
            name: Some(name.to_string()),
            soft: Some(limit),
            hard: Some(limit),
        };

        HostConfig {
            memory: Some(memory),
            memory_swap: Some(memory),
            cpu_period: Some(spec.cpu_period),
            cpu_quota: Some(spec.cpu_quota),
            network_mode: Some(spec.network.clone()),
            readonly_rootfs: Some(true),
            security_opt: Some(vec!["no-new-privileges".to_string()]),
            cap_drop: Some(vec!["ALL".to_string()]),
            pids_limit: Some(spec.pids_limit),
            ulimits: Some(vec![ulimit("nofile", spec.nofile), ulimit("nproc", spec.nproc)]),
            binds: Some(vec![format!("{}:{}:ro", spec.code_dir.display(), CODE_MOUNT)]),
            tmpfs: Some(HashMap::from([(
                "/tmp".to_string(),
                format!("rw,noexec,nosuid,size={}", spec.tmpfs_size),
            )])),
            auto_remove: Some(false),
            ..Default::default()
        }
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn create(&self, spec: &ContainerSpec) -> Result<()> {
        let config = Config {
            image: Some(spec.image.clone()),
            cmd: Some(spec.command.clone()),
            env: Some(spec.env.clone()),
            user: Some(spec.user.clone()),
            working_dir: Some(CODE_MOUNT.to_string()),
            network_disabled: Some(spec.network == "none"),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            host_config: Some(Self::host_config(spec)),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: spec.name.as_str(),
            platform: None,
        };

        self.docker
            .create_container(Some(options), config)
            .await
            .map_err(|e| Error::Container(format!("Failed to create container: {}", e)))?;

        debug!(container = %spec.name, "Created container");
        Ok(())
    }

    async fn attach(&self, name: &str) -> Result<BoxStream<'static, Result<String>>> {
        let options = AttachContainerOptions::<String> {
            stdout: Some(true),
            stderr: Some(true),
            stream: Some(true),
            logs: Some(true),
            ..Default::default()
        };

        let attached = self
            .docker
            .attach_container(name, Some(options))
            .await
            .map_err(|e| Error::Container(format!("Failed to attach to container: {}", e)))?;

        let output = attached.output.filter_map(|item| async move {
            match item {
                Ok(LogOutput::StdOut { message })
                | Ok(LogOutput::StdErr { message })
                | Ok(LogOutput::Console { message }) => {
                    Some(Ok(String::from_utf8_lossy(&message).into_owned()))
                }
                Ok(LogOutput::StdIn { .. }) => None,
                Err(e) => Some(Err(Error::Container(format!("Output stream failed: {}", e)))),
            }
        });

        Ok(output.boxed())
    }

    async fn start(&self, name: &str) -> Result<()> {
        self.docker
            .start_container(name, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| Error::Container(format!("Failed to start container: {}", e)))
    }

    async fn wait(&self, name: &str) -> Result<i64> {
        let options = WaitContainerOptions {
            condition: "not-running",
        };
        let mut stream = self.docker.wait_container(name, Some(options));

        match stream.next().await {
            Some(Ok(response)) => Ok(response.status_code),
            // bollard reports a non-zero exit as an error carrying the code
            Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => Ok(code),
            Some(Err(e)) => Err(Error::Container(format!("Wait failed: {}", e))),
            None => Err(Error::Container("Container wait stream ended".to_string())),
        }
    }

    async fn inspect(&self, name: &str) -> Result<ContainerState> {
        let response = self
            .docker
            .inspect_container(name, None::<InspectContainerOptions>)
            .await?;

        let state = response.state.unwrap_or_default();
        Ok(ContainerState {
            running: state.running.unwrap_or(false),
            oom_killed: state.oom_killed.unwrap_or(false),
            exit_code: state.exit_code,
        })
    }

    async fn stats(&self, name: &str) -> Result<ResourceUsage> {
        let options = StatsOptions {
            stream: false,
            one_shot: true,
        };
        let mut stream = self.docker.stats(name, Some(options));

        match stream.next().await {
            Some(Ok(stats)) => Ok(ResourceUsage {
                memory_bytes: stats
                    .memory_stats
                    .max_usage
                    .or(stats.memory_stats.usage)
                    .unwrap_or(0),
                cpu_time_ns: stats.cpu_stats.cpu_usage.total_usage,
            }),
            Some(Err(e)) => Err(e.into()),
            None => Ok(ResourceUsage::default()),
        }
    }

    async fn kill(&self, name: &str) -> Result<()> {
        self.docker
            .kill_container(name, None::<KillContainerOptions<String>>)
            .await?;
        debug!(container = %name, "Killed container");
        Ok(())
    }

    async fn remove(&self, name: &str) -> Result<()> {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };

        self.docker
            .remove_container(name, Some(options))
            .await
            .map_err(|e| Error::Container(format!("Failed to remove container: {}", e)))?;

        debug!(container = %name, "Removed container");
        Ok(())
    }

    async fn image_available(&self, image: &str) -> Result<bool> {
        match self.docker.inspect_image(image).await {
            Ok(_) => Ok(true),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn pull_image(&self, image: &str) -> Result<()> {
        info!("Pulling Docker image: {}", image);

        let options = CreateImageOptions {
            from_image: image.to_string(),
            ..Default::default()
        };

        let mut stream = self.docker.create_image(Some(options), None, None);
        while let Some(result) = stream.next().await {
            match result {
                Ok(info) => {
                    if let Some(status) = info.status {
                        debug!("Pull status: {}", status);
                    }
                }
                Err(e) => {
                    return Err(Error::Container(format!("Failed to pull image: {}", e)));
                }
            }
        }

        info!("Image pulled successfully: {}", image);
        Ok(())
    }
}
