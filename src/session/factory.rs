//! Builders for per-session executors.
//!
//! Kept separate from the config-driven [`crate::factory::ExecutorFactory`] so
//! the session manager can be driven by a fake in tests.

use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, info};

use crate::config::{Config, ExecutionMode};
use crate::sandbox::{
    self, ExecutionError, LocalExecutor, MockExecutor, MockResponse, SandboxExecutor,
    SessionDockerExecutor,
};

/// Builds a ready-to-use executor for one session.
#[async_trait]
pub trait SessionExecutorFactory: Send + Sync {
    /// Creates (and starts) an executor for `session_id`.
    async fn create_session_executor(
        &self,
        session_id: &str,
        max_idle_seconds: u64,
    ) -> Result<Arc<dyn SandboxExecutor>, ExecutionError>;
}

/// Config-driven factory: session containers in docker mode, per-session
/// directories in local mode.
#[derive(Debug, Clone)]
pub struct DefaultSessionExecutorFactory {
    config: Config,
}

impl DefaultSessionExecutorFactory {
    /// Creates a factory for `config`.
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// Host directory used for `session_id`'s workspace.
    pub fn workspace_for(&self, session_id: &str) -> Result<PathBuf, ExecutionError> {
        let dir_name = sandbox::sanitize_name(session_id);
        let dir_name = if dir_name.is_empty() {
            "session".to_string()
        } else {
            dir_name
        };
        match self.config.execution.mode {
            ExecutionMode::Local => Ok(self.config.execution.work_dir.join(dir_name)),
            _ => self
                .config
                .docker
                .workspace_root()
                .map(|root| root.join(dir_name))
                .map_err(|e| ExecutionError::container_failed(format!("{e:#}"))),
        }
    }

    /// Removes containers left behind by an earlier process.
    pub async fn cleanup_orphaned(&self) -> Result<u32, ExecutionError> {
        if self.config.execution.mode != ExecutionMode::Docker {
            return Ok(0);
        }
        let removed = sandbox::cleanup_orphaned_containers().await?;
        if removed > 0 {
            info!("Removed {} orphaned sandbox containers", removed);
        }
        Ok(removed)
    }
}

#[async_trait]
impl SessionExecutorFactory for DefaultSessionExecutorFactory {
    async fn create_session_executor(
        &self,
        session_id: &str,
        max_idle_seconds: u64,
    ) -> Result<Arc<dyn SandboxExecutor>, ExecutionError> {
        if self.config.execution.mode == ExecutionMode::Remote {
            return Err(ExecutionError::unsupported("remote"));
        }
        let workspace = self.workspace_for(session_id)?;
        match self.config.execution.mode {
            ExecutionMode::Docker => {
                let executor = SessionDockerExecutor::new(
                    session_id,
                    self.config.docker.clone(),
                    workspace,
                    max_idle_seconds,
                )
                .with_stop_grace(self.config.timeouts.stop_grace());
                // Start now so provisioning failures surface to the manager.
                executor.ensure_started().await?;
                Ok(Arc::new(executor))
            }
            ExecutionMode::Local => {
                debug!(
                    "Local executor for session {} in {}",
                    session_id,
                    workspace.display()
                );
                Ok(Arc::new(LocalExecutor::new(workspace)))
            }
            ExecutionMode::Remote => Err(ExecutionError::unsupported("remote")),
        }
    }
}

/// One executor handed out by [`MockSessionExecutorFactory`].
#[derive(Debug, Clone)]
pub struct CreatedExecutor {
    /// Session it was created for.
    pub session_id: String,
    /// Idle limit it was created with.
    pub max_idle_seconds: u64,
    /// Shares counters with the executor the manager holds.
    pub executor: MockExecutor,
}

/// Fabricates mock executors; never touches a container runtime.
#[derive(Debug, Default)]
pub struct MockSessionExecutorFactory {
    responses: Vec<MockResponse>,
    delay: Option<Duration>,
    execution_delay: Option<Duration>,
    failures_remaining: AtomicUsize,
    attempts: AtomicUsize,
    next_id: AtomicUsize,
    created: Mutex<Vec<CreatedExecutor>>,
}

impl MockSessionExecutorFactory {
    /// Factory whose executors echo payloads back.
    pub fn new() -> Self {
        Self::default()
    }

    /// Executors return `responses` in order.
    #[must_use]
    pub fn with_responses(mut self, responses: Vec<MockResponse>) -> Self {
        self.responses = responses;
        self
    }

    /// Each creation sleeps first, to widen race windows in tests.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Executors take `delay` for every execute call.
    #[must_use]
    pub fn with_execution_delay(mut self, delay: Duration) -> Self {
        self.execution_delay = Some(delay);
        self
    }

    /// The next `n` creations fail as if Docker were down.
    pub fn fail_next(&self, n: usize) {
        self.failures_remaining.store(n, Ordering::SeqCst);
    }

    /// Creation attempts, failed ones included.
    pub fn attempt_count(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Successful creations.
    pub fn creation_count(&self) -> usize {
        self.created_executors().len()
    }

    /// Everything created so far, oldest first.
    pub fn created_executors(&self) -> Vec<CreatedExecutor> {
        self.created
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Executors created for `session_id`, oldest first.
    pub fn created_for(&self, session_id: &str) -> Vec<MockExecutor> {
        self.created_executors()
            .into_iter()
            .filter(|c| c.session_id == session_id)
            .map(|c| c.executor)
            .collect()
    }
}

#[async_trait]
impl SessionExecutorFactory for MockSessionExecutorFactory {
    async fn create_session_executor(
        &self,
        session_id: &str,
        max_idle_seconds: u64,
    ) -> Result<Arc<dyn SandboxExecutor>, ExecutionError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let should_fail = self
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if should_fail {
            return Err(ExecutionError::docker_unavailable("mock: daemon unreachable"));
        }

        let n = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let mut executor = MockExecutor::new(format!("mock-sandbox-{n}"), self.responses.clone())
            .configure_for_testing(format!("mock-container-{session_id}-{n}"));
        if let Some(delay) = self.execution_delay {
            executor = executor.with_delay(delay);
        }

        self.created
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(CreatedExecutor {
                session_id: session_id.to_string(),
                max_idle_seconds,
                executor: executor.clone(),
            });

        Ok(Arc::new(executor))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::{ExecutorKind, Payload};
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_mock_factory_fabricates_unique_ids() {
        let factory = MockSessionExecutorFactory::new();
        let a = factory.create_session_executor("s1", 1800).await.unwrap();
        let b = factory.create_session_executor("s2", 7200).await.unwrap();

        assert_ne!(a.id(), b.id());
        assert_eq!(a.kind(), ExecutorKind::Mock);
        assert_eq!(factory.creation_count(), 2);

        let created = factory.created_executors();
        assert_eq!(created[0].session_id, "s1");
        assert_eq!(created[0].max_idle_seconds, 1800);
        assert_eq!(created[1].max_idle_seconds, 7200);
        assert_eq!(created[1].executor.container_id(), "mock-container-s2-2");
    }

    #[tokio::test]
    async fn test_mock_factory_scripted_failures() {
        let factory = MockSessionExecutorFactory::new();
        factory.fail_next(1);
        assert!(factory.create_session_executor("s1", 60).await.is_err());
        assert!(factory.create_session_executor("s1", 60).await.is_ok());
        assert_eq!(factory.attempt_count(), 2);
        assert_eq!(factory.creation_count(), 1);
        assert_eq!(factory.created_for("s1").len(), 1);
    }

    #[tokio::test]
    async fn test_default_factory_local_mode() {
        let dir = tempdir().unwrap();
        let mut config = Config::default();
        config.execution.mode = ExecutionMode::Local;
        config.execution.work_dir = dir.path().to_path_buf();
        let factory = DefaultSessionExecutorFactory::new(config);

        let executor = factory.create_session_executor("chat/1", 60).await.unwrap();
        assert_eq!(executor.kind(), ExecutorKind::Local);

        let result = executor
            .execute(
                &Payload::Command("touch made.txt".to_string()),
                Duration::from_secs(10),
            )
            .await
            .unwrap();
        assert!(result.success());
        assert!(dir.path().join("chat-1").join("made.txt").exists());
    }

    #[tokio::test]
    async fn test_default_factory_remote_is_unsupported() {
        let mut config = Config::default();
        config.execution.mode = ExecutionMode::Remote;
        let factory = DefaultSessionExecutorFactory::new(config);
        let err = factory.create_session_executor("s1", 60).await.err().unwrap();
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_cleanup_orphaned_outside_docker_mode() {
        let mut config = Config::default();
        config.execution.mode = ExecutionMode::Local;
        let factory = DefaultSessionExecutorFactory::new(config);
        assert_eq!(factory.cleanup_orphaned().await.unwrap(), 0);
    }

    #[test]
    fn test_workspace_for_sanitizes() {
        let mut config = Config::default();
        config.docker.workspace_path = "/srv/ws".to_string();
        let factory = DefaultSessionExecutorFactory::new(config);
        assert_eq!(
            factory.workspace_for("../../etc").unwrap(),
            PathBuf::from("/srv/ws/..-..-etc")
        );
        assert_eq!(
            factory.workspace_for("///").unwrap(),
            PathBuf::from("/srv/ws/session")
        );
    }
}
