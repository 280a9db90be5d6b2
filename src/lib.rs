//! Per-session code execution sandboxes.
//!
//! Each conversational session gets at most one isolated sandbox (a Docker
//! container or, for development, a local process). [`SessionManager`]
//! creates sandboxes on demand, reuses them across calls, enforces per-user
//! [`UserQuota`]s, evicts idle and over-age sandboxes, and recreates evicted
//! ones while reporting what environment state was lost.
//!
//! ```no_run
//! use session_sandbox::{Config, Payload, SessionManager, UserQuota};
//!
//! # async fn run() -> Result<(), session_sandbox::LifecycleError> {
//! let manager = SessionManager::from_config(&Config::default())?;
//! let _sweeper = manager.spawn_configured_sweeper();
//!
//! let quota = UserQuota::for_registered();
//! let sandbox = manager.acquire("chat-42", Some("user-7"), &quota).await?;
//! let result = sandbox.execute(&Payload::Code("print(6 * 7)".into())).await?;
//! println!("{}", result.stdout);
//! # Ok(())
//! # }
//! ```

pub mod clock;
pub mod config;
pub mod error;
pub mod factory;
pub mod logging;
pub mod metrics;
pub mod quota;
pub mod sandbox;
pub mod session;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{Config, ExecutionMode};
pub use error::LifecycleError;
pub use factory::ExecutorFactory;
pub use metrics::MetricsSnapshot;
pub use quota::UserQuota;
pub use sandbox::{ExecutionError, ExecutionResult, Payload, SandboxExecutor};
pub use session::{
    CleanupReason, SandboxHandle, SandboxInfo, SandboxLifecycleService, SandboxState,
    SessionManager, SessionState, SweepReport,
};
