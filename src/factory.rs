//! Config-driven executor construction with a per-`(mode, work_dir)` cache.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, warn};

use crate::config::{Config, ExecutionMode};
use crate::error::LifecycleError;
use crate::sandbox::{DockerExecutor, LocalExecutor, SandboxExecutor, SessionDockerExecutor};

type CacheKey = (ExecutionMode, PathBuf);

/// Builds executors from configuration and hands out the same instance for
/// the same mode and work directory.
#[derive(Default)]
pub struct ExecutorFactory {
    cache: Mutex<HashMap<CacheKey, Arc<dyn SandboxExecutor>>>,
}

impl std::fmt::Debug for ExecutorFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutorFactory")
            .field("cached", &self.len())
            .finish()
    }
}

impl ExecutorFactory {
    /// Creates a factory with an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the executor for `config`, building one if none is cached or
    /// `force_new` is set. A forced build replaces the cached instance, and
    /// the replaced one is terminated in the background.
    ///
    /// An invalid config fails with [`LifecycleError::Config`]. Remote mode
    /// fails with [`LifecycleError::NotImplemented`]; it never falls back to
    /// another mode.
    pub fn create(
        &self,
        config: &Config,
        force_new: bool,
    ) -> Result<Arc<dyn SandboxExecutor>, LifecycleError> {
        let mode = config.execution.mode;
        let key = (mode, config.execution.work_dir.clone());

        if !force_new {
            if let Some(executor) = self.cache().get(&key) {
                return Ok(executor.clone());
            }
        }

        let executor = Self::build(config)?;
        debug!(
            "Built {} executor {} for {}",
            executor.kind(),
            executor.id(),
            key.1.display()
        );
        let replaced = self.cache().insert(key, executor.clone());
        if let Some(old) = replaced {
            retire(old);
        }
        Ok(executor)
    }

    fn build(config: &Config) -> Result<Arc<dyn SandboxExecutor>, LifecycleError> {
        config
            .validate()
            .map_err(|e| LifecycleError::config(format!("{e:#}")))?;
        let work_dir = &config.execution.work_dir;
        match config.execution.mode {
            ExecutionMode::Local => Ok(Arc::new(LocalExecutor::new(work_dir))),
            ExecutionMode::Docker if config.execution.session_enabled => {
                let session_id = work_dir
                    .file_name()
                    .map_or_else(|| "default".to_string(), |n| n.to_string_lossy().into_owned());
                Ok(Arc::new(SessionDockerExecutor::new(
                    session_id,
                    config.docker.clone(),
                    work_dir,
                    config.timeouts.idle_timeout_secs,
                )
                .with_stop_grace(config.timeouts.stop_grace())))
            }
            ExecutionMode::Docker => Ok(Arc::new(DockerExecutor::new(config.docker.clone()))),
            ExecutionMode::Remote => Err(LifecycleError::not_implemented("remote executor")),
        }
    }

    /// Drops every cached executor.
    pub fn clear(&self) {
        self.cache().clear();
    }

    /// Number of cached executors.
    pub fn len(&self) -> usize {
        self.cache().len()
    }

    /// True when nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn cache(&self) -> std::sync::MutexGuard<'_, HashMap<CacheKey, Arc<dyn SandboxExecutor>>> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Terminates an executor pushed out of the cache.
fn retire(executor: Arc<dyn SandboxExecutor>) {
    let id = executor.id();
    if let Ok(handle) = tokio::runtime::Handle::try_current() {
        handle.spawn(async move {
            if let Err(e) = executor.terminate().await {
                warn!("Failed to terminate replaced executor {}: {}", id, e);
            }
        });
    } else {
        warn!("No runtime to terminate replaced executor {}", id);
    }
}
