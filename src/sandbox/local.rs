//! Host subprocess executor. No isolation; intended for development.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, info, warn};

use super::{ExecutionError, ExecutionResult, ExecutorKind, Payload, SandboxExecutor};

/// Runs payloads as child processes of this one, inside `work_dir`.
#[derive(Debug, Clone)]
pub struct LocalExecutor {
    id: String,
    work_dir: PathBuf,
}

impl LocalExecutor {
    /// Creates an executor rooted at `work_dir`. The directory is created on
    /// first use.
    pub fn new(work_dir: impl Into<PathBuf>) -> Self {
        let work_dir = work_dir.into();
        Self {
            id: format!("local-{}", short_id()),
            work_dir,
        }
    }

    /// Directory commands run in.
    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }
}

#[async_trait]
impl SandboxExecutor for LocalExecutor {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn kind(&self) -> ExecutorKind {
        ExecutorKind::Local
    }

    async fn execute(
        &self,
        payload: &Payload,
        timeout: Duration,
    ) -> Result<ExecutionResult, ExecutionError> {
        tokio::fs::create_dir_all(&self.work_dir)
            .await
            .map_err(|e| {
                ExecutionError::process_failed(format!(
                    "Failed to create work dir {}: {e}",
                    self.work_dir.display()
                ))
            })?;

        let argv = payload.argv();
        debug!("Local exec in {}: {:?}", self.work_dir.display(), argv[0]);

        let started = Instant::now();
        // kill_on_drop: a timed-out or cancelled call must not leak the child
        let mut child = tokio::process::Command::new(&argv[0])
            .args(&argv[1..])
            .current_dir(&self.work_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ExecutionError::process_failed(format!("Failed to spawn {}: {e}", argv[0])))?;

        // Output is collected outside the timed future so a timeout keeps
        // whatever the child wrote before it was killed.
        let mut stdout_pipe = child.stdout.take();
        let mut stderr_pipe = child.stderr.take();
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let run = async {
            let (out, err) = tokio::join!(
                drain(stdout_pipe.as_mut(), &mut stdout),
                drain(stderr_pipe.as_mut(), &mut stderr)
            );
            out?;
            err?;
            child.wait().await
        };

        let outcome = tokio::time::timeout(timeout, run).await;
        match outcome {
            Ok(Ok(status)) => Ok(ExecutionResult {
                stdout: String::from_utf8_lossy(&stdout).to_string(),
                stderr: String::from_utf8_lossy(&stderr).to_string(),
                exit_code: status.code().map_or(-1, i64::from),
                duration: started.elapsed(),
                timed_out: false,
            }),
            Ok(Err(e)) => Err(ExecutionError::process_failed(e.to_string())),
            Err(_) => {
                if let Err(e) = child.start_kill() {
                    debug!("Timed-out child already gone: {e}");
                }
                warn!(
                    "Local execution timed out after {}s, child killed",
                    timeout.as_secs()
                );
                Ok(ExecutionResult::timeout(
                    timeout,
                    String::from_utf8_lossy(&stdout).to_string(),
                    String::from_utf8_lossy(&stderr).to_string(),
                ))
            }
        }
    }

    async fn terminate(&self) -> Result<(), ExecutionError> {
        // The work dir belongs to the caller; nothing to release.
        info!("Local executor {} released", self.id);
        Ok(())
    }
}

/// Appends everything `pipe` yields to `buf`, chunk by chunk, so a
/// cancelled read leaves the bytes seen so far in place.
async fn drain<R>(pipe: Option<&mut R>, buf: &mut Vec<u8>) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
{
    let Some(pipe) = pipe else {
        return Ok(());
    };
    let mut chunk = [0u8; 4096];
    loop {
        let n = pipe.read(&mut chunk).await?;
        if n == 0 {
            return Ok(());
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

fn short_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..8].to_string()
}
