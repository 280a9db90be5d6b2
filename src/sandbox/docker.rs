//! Stateless Docker executor: one throwaway container per call.

use async_trait::async_trait;
use bollard::Docker;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::container;
use super::{ExecutionError, ExecutionResult, ExecutorKind, Payload, SandboxExecutor};
use crate::config::DockerConfig;

/// Runs every payload in a brand new container that is removed afterwards.
///
/// Code payloads use the Python image, shell commands the shell image.
/// Nothing written by one call is visible to the next.
#[derive(Debug, Clone)]
pub struct DockerExecutor {
    id: String,
    config: DockerConfig,
}

impl DockerExecutor {
    /// Creates an executor. No container exists until `execute` is called.
    pub fn new(config: DockerConfig) -> Self {
        Self {
            id: format!("docker-{}", short_id()),
            config,
        }
    }

    fn image_for(&self, payload: &Payload) -> &str {
        match payload {
            Payload::Code(_) => &self.config.python_image,
            Payload::Command(_) => &self.config.shell_image,
        }
    }
}

/// Force-removes the container when dropped, so a cancelled call does not
/// leak it.
struct RemoveOnDrop {
    docker: Docker,
    container_id: Option<String>,
}

impl RemoveOnDrop {
    async fn remove_now(mut self) {
        if let Some(id) = self.container_id.take() {
            debug!("Removing container {}", id);
            if let Err(e) = container::remove(&self.docker, &id).await {
                warn!("Failed to remove container {}: {}", id, e);
            }
        }
    }
}

impl Drop for RemoveOnDrop {
    fn drop(&mut self) {
        if let Some(id) = self.container_id.take() {
            let docker = self.docker.clone();
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move {
                    if let Err(e) = container::remove(&docker, &id).await {
                        warn!("Failed to remove abandoned container {}: {}", id, e);
                    }
                });
            } else {
                warn!("No runtime to remove abandoned container {}", id);
            }
        }
    }
}

#[async_trait]
impl SandboxExecutor for DockerExecutor {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn kind(&self) -> ExecutorKind {
        ExecutorKind::Docker
    }

    async fn execute(
        &self,
        payload: &Payload,
        timeout: Duration,
    ) -> Result<ExecutionResult, ExecutionError> {
        let docker = container::connect().await?;
        let image = self.image_for(payload);
        container::ensure_image(&docker, image).await?;

        let name = format!("sandbox-oneshot-{}", short_id());
        let host_config = container::host_config(&self.config, Vec::new())?;
        // The container only needs to outlive the call.
        let config = container::idle_container_config(
            image,
            "/tmp",
            timeout + Duration::from_secs(30),
            None,
            host_config,
        );

        let container_id = container::create_and_start(&docker, &name, config).await?;
        let guard = RemoveOnDrop {
            docker: docker.clone(),
            container_id: Some(container_id.clone()),
        };

        info!("Running payload in one-shot container {}", name);
        let result = container::exec(
            &docker,
            &container_id,
            payload.argv(),
            "/tmp",
            timeout,
            &container::pid_file_path(),
        )
        .await;

        guard.remove_now().await;
        result
    }

    async fn terminate(&self) -> Result<(), ExecutionError> {
        // Containers never outlive a call.
        Ok(())
    }
}

fn short_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..8].to_string()
}
