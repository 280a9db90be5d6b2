//! Session-scoped Docker executor: one container kept alive and reused for
//! every call of a session.

use async_trait::async_trait;
use bollard::Docker;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

use super::container;
use super::{ExecutionError, ExecutionResult, ExecutorKind, Payload, SandboxExecutor};
use crate::config::DockerConfig;

/// How long the container's keep-alive process sleeps. The manager evicts
/// long before this; it only bounds containers leaked by a crashed host.
const KEEP_ALIVE: Duration = Duration::from_secs(24 * 60 * 60);

/// Stop grace used unless [`SessionDockerExecutor::with_stop_grace`] says otherwise.
const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(5);

#[derive(Default)]
struct ContainerSlot {
    docker: Option<Docker>,
    container_id: Option<String>,
    terminated: bool,
}

/// A long-lived container bound to one session.
///
/// The host `workspace_path` is bind-mounted at the configured container
/// workspace, so files survive between calls (and outlive the container on
/// the host side).
pub struct SessionDockerExecutor {
    name: String,
    session_id: String,
    config: DockerConfig,
    workspace_path: PathBuf,
    max_idle_seconds: u64,
    stop_grace: Duration,
    slot: AsyncMutex<ContainerSlot>,
    last_used: Mutex<Instant>,
    /// Pid file of the exec in flight, left set if its call was dropped.
    running_exec: Mutex<Option<String>>,
}

impl std::fmt::Debug for SessionDockerExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionDockerExecutor")
            .field("name", &self.name)
            .field("session_id", &self.session_id)
            .field("workspace_path", &self.workspace_path)
            .field("max_idle_seconds", &self.max_idle_seconds)
            .field("stop_grace", &self.stop_grace)
            .finish_non_exhaustive()
    }
}

impl SessionDockerExecutor {
    /// Creates an executor for `session_id`. The container starts lazily on
    /// first use, or eagerly through [`Self::ensure_started`].
    pub fn new(
        session_id: impl Into<String>,
        config: DockerConfig,
        workspace_path: impl Into<PathBuf>,
        max_idle_seconds: u64,
    ) -> Self {
        let session_id = session_id.into();
        let name = format!(
            "sandbox-{}-{}",
            container::sanitize_name(&session_id),
            &uuid::Uuid::new_v4().simple().to_string()[..8]
        );
        Self {
            name,
            session_id,
            config,
            workspace_path: workspace_path.into(),
            max_idle_seconds,
            stop_grace: DEFAULT_STOP_GRACE,
            slot: AsyncMutex::new(ContainerSlot::default()),
            last_used: Mutex::new(Instant::now()),
            running_exec: Mutex::new(None),
        }
    }

    /// How long the container gets to exit on terminate before it is killed.
    #[must_use]
    pub fn with_stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = grace;
        self
    }

    /// Stop grace in effect.
    pub fn stop_grace(&self) -> Duration {
        self.stop_grace
    }

    /// Injects a session and container id without starting anything.
    #[must_use]
    pub fn configure_for_testing(
        mut self,
        session_id: impl Into<String>,
        container_id: impl Into<String>,
    ) -> Self {
        self.session_id = session_id.into();
        self.slot.get_mut().container_id = Some(container_id.into());
        self
    }

    /// Session this container belongs to.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Host side of the workspace mount.
    pub fn workspace_path(&self) -> &Path {
        &self.workspace_path
    }

    /// Idle limit this executor was built with.
    pub fn max_idle_seconds(&self) -> u64 {
        self.max_idle_seconds
    }

    /// Time since the last call started or finished.
    pub fn idle_for(&self) -> Duration {
        self.last_used
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .elapsed()
    }

    /// True once `idle_for` passes `max_idle_seconds`.
    pub fn is_idle_expired(&self) -> bool {
        self.idle_for() > Duration::from_secs(self.max_idle_seconds)
    }

    /// Container id, if one was started or injected.
    pub async fn container_id(&self) -> Option<String> {
        self.slot.lock().await.container_id.clone()
    }

    fn running_exec(&self) -> std::sync::MutexGuard<'_, Option<String>> {
        self.running_exec
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn touch(&self) {
        *self.last_used.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    /// Starts the container if it is not running yet. Returns the daemon
    /// handle and container id.
    pub async fn ensure_started(&self) -> Result<(Docker, String), ExecutionError> {
        let mut slot = self.slot.lock().await;

        if slot.terminated {
            return Err(ExecutionError::terminated(&self.name));
        }

        if let Some(id) = slot.container_id.clone() {
            let docker = match slot.docker.clone() {
                Some(docker) => docker,
                None => {
                    let docker = container::connect().await?;
                    slot.docker = Some(docker.clone());
                    docker
                }
            };
            return Ok((docker, id));
        }

        info!(
            session_id = %self.session_id,
            "Starting session container {}", self.name
        );

        tokio::fs::create_dir_all(&self.workspace_path)
            .await
            .map_err(|e| {
                ExecutionError::container_failed(format!(
                    "Failed to create workspace {}: {e}",
                    self.workspace_path.display()
                ))
            })?;

        let docker = container::connect().await?;
        container::ensure_image(&docker, &self.config.image).await?;

        let host_path = self.workspace_path.to_str().ok_or_else(|| {
            ExecutionError::container_failed("Workspace path is not valid UTF-8")
        })?;
        let binds = vec![format!(
            "{}:{}:rw",
            host_path, self.config.container_workspace
        )];
        let host_config = container::host_config(&self.config, binds)?;
        let config = container::idle_container_config(
            &self.config.image,
            &self.config.container_workspace,
            KEEP_ALIVE,
            Some(&self.session_id),
            host_config,
        );

        let id = container::create_and_start(&docker, &self.name, config).await?;
        debug!("Session container {} is {}", self.name, id);

        slot.docker = Some(docker.clone());
        slot.container_id = Some(id.clone());
        self.touch();
        Ok((docker, id))
    }
}

#[async_trait]
impl SandboxExecutor for SessionDockerExecutor {
    fn id(&self) -> String {
        self.name.clone()
    }

    fn kind(&self) -> ExecutorKind {
        ExecutorKind::SessionDocker
    }

    async fn execute(
        &self,
        payload: &Payload,
        timeout: Duration,
    ) -> Result<ExecutionResult, ExecutionError> {
        let (docker, container_id) = self.ensure_started().await?;
        self.touch();
        let pid_file = container::pid_file_path();
        *self.running_exec() = Some(pid_file.clone());
        let result = container::exec(
            &docker,
            &container_id,
            payload.argv(),
            &self.config.container_workspace,
            timeout,
            &pid_file,
        )
        .await;
        self.running_exec().take();
        self.touch();
        result
    }

    async fn interrupt(&self) -> Result<(), ExecutionError> {
        let Some(pid_file) = self.running_exec().take() else {
            return Ok(());
        };
        let target = {
            let slot = self.slot.lock().await;
            slot.docker.clone().zip(slot.container_id.clone())
        };
        let Some((docker, container_id)) = target else {
            return Ok(());
        };
        info!(session_id = %self.session_id, "Killing interrupted exec in {}", self.name);
        container::kill_exec(&docker, &container_id, &pid_file).await
    }

    async fn terminate(&self) -> Result<(), ExecutionError> {
        let mut slot = self.slot.lock().await;
        slot.terminated = true;

        let Some(id) = slot.container_id.take() else {
            return Ok(());
        };

        let docker = match slot.docker.take() {
            Some(docker) => docker,
            None => container::connect().await?,
        };

        info!(session_id = %self.session_id, "Removing session container {}", self.name);
        if let Err(e) = container::stop(&docker, &id, self.stop_grace).await {
            warn!("Graceful stop of {} failed, forcing removal: {}", self.name, e);
        }
        container::remove(&docker, &id).await
    }

    async fn is_healthy(&self) -> bool {
        let slot = self.slot.lock().await;
        if slot.terminated {
            return false;
        }
        match (&slot.docker, &slot.container_id) {
            (Some(docker), Some(id)) => {
                let running = container::is_running(docker, id).await;
                if !running {
                    warn!(session_id = %self.session_id, "Session container {} is not running", id);
                }
                running
            }
            // Not started yet, or injected for tests
            _ => true,
        }
    }
}
