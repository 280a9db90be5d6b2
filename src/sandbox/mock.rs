//! Mock executor for testing.
//!
//! Returns predetermined responses and counts calls so lifecycle logic can be
//! exercised without a container runtime.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::{ExecutionError, ExecutionResult, ExecutorKind, Payload, SandboxExecutor};

/// A single scripted response.
#[derive(Debug, Clone)]
pub enum MockResponse {
    /// Exit zero with this stdout.
    Success(String),
    /// Exit with this code and stderr.
    Exit(i64, String),
    /// Fail with a transport error.
    Error(String),
    /// Behave as if the hard timeout was hit.
    Timeout,
}

/// A fake executor with fabricated ids.
///
/// Clones share counters, so a test can keep one clone for assertions while
/// the manager owns another.
#[derive(Debug, Clone)]
pub struct MockExecutor {
    id: String,
    container_id: String,
    /// Responses to return in order. Cycles if more calls than responses.
    responses: Arc<Vec<MockResponse>>,
    executions: Arc<AtomicUsize>,
    terminations: Arc<AtomicUsize>,
    interrupts: Arc<AtomicUsize>,
    healthy: Arc<AtomicBool>,
    fail_terminate: Arc<AtomicBool>,
    /// Each execute sleeps this long before answering.
    delay: Option<Duration>,
}

impl MockExecutor {
    /// Creates a mock that returns `responses` in order.
    pub fn new(id: impl Into<String>, responses: Vec<MockResponse>) -> Self {
        let id = id.into();
        Self {
            container_id: format!("mock-container-{id}"),
            id,
            responses: Arc::new(responses),
            executions: Arc::new(AtomicUsize::new(0)),
            terminations: Arc::new(AtomicUsize::new(0)),
            interrupts: Arc::new(AtomicUsize::new(0)),
            healthy: Arc::new(AtomicBool::new(true)),
            fail_terminate: Arc::new(AtomicBool::new(false)),
            delay: None,
        }
    }

    /// Makes every execute take `delay`, like a slow payload.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Creates a mock that echoes the payload back with exit code 0.
    pub fn echo(id: impl Into<String>) -> Self {
        Self::new(id, Vec::new())
    }

    /// Overrides the fabricated container id.
    #[must_use]
    pub fn configure_for_testing(mut self, container_id: impl Into<String>) -> Self {
        self.container_id = container_id.into();
        self
    }

    /// Fabricated container id.
    pub fn container_id(&self) -> &str {
        &self.container_id
    }

    /// Number of `execute` calls so far.
    pub fn execution_count(&self) -> usize {
        self.executions.load(Ordering::SeqCst)
    }

    /// Number of `terminate` calls so far.
    pub fn termination_count(&self) -> usize {
        self.terminations.load(Ordering::SeqCst)
    }

    /// Number of `interrupt` calls so far.
    pub fn interrupt_count(&self) -> usize {
        self.interrupts.load(Ordering::SeqCst)
    }

    /// Makes `is_healthy` report the given value.
    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    /// Makes `terminate` fail, as if the container was already gone.
    pub fn set_fail_terminate(&self, fail: bool) {
        self.fail_terminate.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl SandboxExecutor for MockExecutor {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn kind(&self) -> ExecutorKind {
        ExecutorKind::Mock
    }

    async fn execute(
        &self,
        payload: &Payload,
        timeout: Duration,
    ) -> Result<ExecutionResult, ExecutionError> {
        let count = self.executions.fetch_add(1, Ordering::SeqCst);
        if self.terminations.load(Ordering::SeqCst) > 0 {
            return Err(ExecutionError::terminated(&self.id));
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let ok = |stdout: String, stderr: String, exit_code| ExecutionResult {
            stdout,
            stderr,
            exit_code,
            duration: Duration::from_millis(1),
            timed_out: false,
        };

        if self.responses.is_empty() {
            return Ok(ok(payload.source().to_string(), String::new(), 0));
        }

        match &self.responses[count % self.responses.len()] {
            MockResponse::Success(out) => Ok(ok(out.clone(), String::new(), 0)),
            MockResponse::Exit(code, err) => Ok(ok(String::new(), err.clone(), *code)),
            MockResponse::Error(msg) => Err(ExecutionError::container_failed(msg.clone())),
            MockResponse::Timeout => Ok(ExecutionResult::timeout(
                timeout,
                String::new(),
                String::new(),
            )),
        }
    }

    async fn terminate(&self) -> Result<(), ExecutionError> {
        self.terminations.fetch_add(1, Ordering::SeqCst);
        if self.fail_terminate.load(Ordering::SeqCst) {
            return Err(ExecutionError::container_failed(format!(
                "No such container: {}",
                self.container_id
            )));
        }
        Ok(())
    }

    async fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst) && self.terminations.load(Ordering::SeqCst) == 0
    }

    async fn interrupt(&self) -> Result<(), ExecutionError> {
        self.interrupts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LIMIT: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn test_mock_echoes_by_default() {
        let mock = MockExecutor::echo("m1");
        let result = mock
            .execute(&Payload::Command("ls".to_string()), LIMIT)
            .await
            .unwrap();
        assert_eq!(result.stdout, "ls");
        assert!(result.success());
        assert_eq!(mock.execution_count(), 1);
    }

    #[tokio::test]
    async fn test_mock_cycles_responses() {
        let mock = MockExecutor::new(
            "m1",
            vec![
                MockResponse::Success("first".to_string()),
                MockResponse::Exit(2, "bad".to_string()),
            ],
        );
        let payload = Payload::Command(String::new());
        let r1 = mock.execute(&payload, LIMIT).await.unwrap();
        let r2 = mock.execute(&payload, LIMIT).await.unwrap();
        let r3 = mock.execute(&payload, LIMIT).await.unwrap();

        assert_eq!(r1.stdout, "first");
        assert_eq!(r2.exit_code, 2);
        assert_eq!(r2.stderr, "bad");
        assert_eq!(r3.stdout, "first"); // Cycles back
    }

    #[tokio::test]
    async fn test_mock_error_and_timeout() {
        let mock = MockExecutor::new(
            "m1",
            vec![
                MockResponse::Error("daemon gone".to_string()),
                MockResponse::Timeout,
            ],
        );
        let payload = Payload::Code("while True: pass".to_string());
        assert!(mock.execute(&payload, LIMIT).await.is_err());
        let timed_out = mock.execute(&payload, LIMIT).await.unwrap();
        assert!(timed_out.timed_out);
    }

    #[tokio::test]
    async fn test_mock_terminate_tracks_and_blocks() {
        let mock = MockExecutor::echo("m1");
        let observer = mock.clone();
        mock.terminate().await.unwrap();
        assert_eq!(observer.termination_count(), 1);
        assert!(!observer.is_healthy().await);
        let err = mock
            .execute(&Payload::Command("ls".to_string()), LIMIT)
            .await
            .unwrap_err();
        assert!(err.is_terminated());
    }

    #[tokio::test]
    async fn test_mock_delay_and_interrupt() {
        let mock = MockExecutor::echo("m1").with_delay(Duration::from_millis(200));
        let payload = Payload::Command("sleep".to_string());
        let cut_short =
            tokio::time::timeout(Duration::from_millis(20), mock.execute(&payload, LIMIT)).await;
        assert!(cut_short.is_err());

        mock.interrupt().await.unwrap();
        assert_eq!(mock.interrupt_count(), 1);
        assert_eq!(mock.execution_count(), 1);
    }

    #[tokio::test]
    async fn test_mock_fail_terminate() {
        let mock = MockExecutor::echo("m1").configure_for_testing("c-9");
        mock.set_fail_terminate(true);
        let err = mock.terminate().await.unwrap_err();
        assert!(err.to_string().contains("c-9"));
    }

    #[test]
    fn test_mock_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<MockExecutor>();
    }
}
