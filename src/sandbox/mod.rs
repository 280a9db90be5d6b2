//! Sandbox executors.
//!
//! A `SandboxExecutor` runs a shell command or a Python snippet somewhere
//! isolated (or not, for the local variant) and reports what happened.
//! Variants:
//! - `LocalExecutor`: host subprocess, development only
//! - `DockerExecutor`: fresh container per call, nothing survives
//! - `SessionDockerExecutor`: one container per session, reused across calls
//! - `MockExecutor`: scripted responses for tests

mod container;
mod docker;
mod error;
mod local;
mod mock;
mod session_docker;

pub use docker::DockerExecutor;
pub use error::ExecutionError;
pub use local::LocalExecutor;
pub use mock::{MockExecutor, MockResponse};
pub use session_docker::SessionDockerExecutor;

pub(crate) use container::sanitize_name;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Exit code reported when a call hits its hard timeout, as coreutils `timeout` does.
pub const TIMEOUT_EXIT_CODE: i64 = 124;

/// What to run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "source", rename_all = "lowercase")]
pub enum Payload {
    /// Shell command, run with `sh -c`.
    Command(String),
    /// Python source, run with `python3 -c`.
    Code(String),
}

impl Payload {
    /// The raw text of the payload.
    pub fn source(&self) -> &str {
        match self {
            Self::Command(s) | Self::Code(s) => s,
        }
    }

    /// Argument vector for a POSIX environment with Python available.
    pub fn argv(&self) -> Vec<String> {
        match self {
            Self::Command(cmd) => vec!["sh".to_string(), "-c".to_string(), cmd.clone()],
            Self::Code(code) => vec!["python3".to_string(), "-c".to_string(), code.clone()],
        }
    }
}

/// Outcome of one execute call. A non-zero `exit_code` is the payload's own
/// failure and is never retried.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
    /// Process exit code.
    pub exit_code: i64,
    /// Wall time of the call.
    pub duration: Duration,
    /// The call hit its hard timeout and was killed.
    pub timed_out: bool,
}

impl ExecutionResult {
    /// Result for a call killed at its hard timeout.
    pub fn timeout(limit: Duration, stdout: String, stderr: String) -> Self {
        let mut stderr = stderr;
        if !stderr.is_empty() && !stderr.ends_with('\n') {
            stderr.push('\n');
        }
        stderr.push_str(&format!(
            "Execution timed out after {} seconds",
            limit.as_secs()
        ));
        Self {
            stdout,
            stderr,
            exit_code: TIMEOUT_EXIT_CODE,
            duration: limit,
            timed_out: true,
        }
    }

    /// True when the payload exited zero within its time limit.
    pub fn success(&self) -> bool {
        self.exit_code == 0 && !self.timed_out
    }
}

/// Which executor variant is behind a trait object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExecutorKind {
    /// Host subprocess.
    Local,
    /// Stateless container per call.
    Docker,
    /// Long-lived per-session container.
    SessionDocker,
    /// Test double.
    Mock,
}

impl fmt::Display for ExecutorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local => write!(f, "local"),
            Self::Docker => write!(f, "docker"),
            Self::SessionDocker => write!(f, "session-docker"),
            Self::Mock => write!(f, "mock"),
        }
    }
}

/// Something that can run payloads.
///
/// Implementations must be safe to share, but callers are expected to
/// serialise `execute` calls against stateful variants.
#[async_trait]
pub trait SandboxExecutor: Send + Sync {
    /// Stable identifier (container id, fabricated id, or work dir tag).
    fn id(&self) -> String;

    /// The variant, for logging and assertions.
    fn kind(&self) -> ExecutorKind;

    /// Runs `payload`, killing it once `timeout` elapses.
    async fn execute(
        &self,
        payload: &Payload,
        timeout: Duration,
    ) -> Result<ExecutionResult, ExecutionError>;

    /// Releases the underlying resources. Calling it twice is harmless.
    async fn terminate(&self) -> Result<(), ExecutionError>;

    /// Whether the backing process or container is still usable.
    async fn is_healthy(&self) -> bool {
        true
    }

    /// Kills whatever an `execute` whose future was dropped left running,
    /// and returns once it is dead. Variants whose calls die with their
    /// future have nothing to do.
    async fn interrupt(&self) -> Result<(), ExecutionError> {
        Ok(())
    }
}

/// Removes every container this crate labelled as managed, returning how
/// many were removed. Meant for startup, after an unclean shutdown.
pub async fn cleanup_orphaned_containers() -> Result<u32, ExecutionError> {
    let docker = container::connect().await?;
    container::remove_managed(&docker).await
}
