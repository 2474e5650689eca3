use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

use super::ContainerRuntime;
use crate::config::ServiceConfig;

/// Port the service listens on inside the container
const INTERNAL_PORT: u16 = 8000;

/// Manages the transcription service container through the docker CLI
pub struct DockerRuntime {
    container_name: String,
    image: String,
    host_port: u16,
    gpu: bool,
}

impl DockerRuntime {
    #[must_use]
    pub fn new(config: &ServiceConfig) -> Self {
        Self {
            container_name: config.container_name.clone(),
            image: config.image.clone(),
            host_port: config.host_port,
            gpu: config.gpu,
        }
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn is_running(&self) -> Result<bool> {
        let output = Command::new("docker")
            .args(["inspect", "-f", "{{.State.Running}}", &self.container_name])
            .output()
            .await
            .context("failed to invoke docker inspect")?;

        Ok(output.status.success()
            && String::from_utf8_lossy(&output.stdout).trim() == "true")
    }

    async fn start(&self) -> Result<()> {
        // A stale stopped container would collide on the name
        let removed = Command::new("docker")
            .args(["rm", "-f", &self.container_name])
            .output()
            .await
            .context("failed to invoke docker rm")?;
        debug!(success = removed.status.success(), "removed stale container");

        let publish = format!("{}:{INTERNAL_PORT}", self.host_port);
        let mut args = vec!["run", "-d", "--name", self.container_name.as_str()];
        if self.gpu {
            args.extend(["--gpus", "all"]);
        }
        args.extend(["-p", publish.as_str(), "--rm", self.image.as_str()]);

        info!(image = %self.image, port = self.host_port, "starting service container");

        let output = Command::new("docker")
            .args(&args)
            .output()
            .await
            .context("failed to invoke docker run")?;

        if !output.status.success() {
            bail!(
                "docker run failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let output = Command::new("docker")
            .args(["stop", &self.container_name])
            .output()
            .await
            .context("failed to invoke docker stop")?;

        if !output.status.success() {
            bail!(
                "docker stop failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        info!(container = %self.container_name, "service container stopped");
        Ok(())
    }
}
