//! Per-session sandbox lifecycle.
//!
//! [`SessionManager`] maps each session to at most one live sandbox. It
//! enforces the caller's [`UserQuota`](crate::quota::UserQuota), evicts idle
//! and over-age sandboxes, and recreates evicted ones on the next request,
//! telling the caller what did not survive.

mod factory;
mod manager;
mod state;
mod store;
mod sweeper;
pub mod tracking;

pub use factory::{
    CreatedExecutor, DefaultSessionExecutorFactory, MockSessionExecutorFactory,
    SessionExecutorFactory,
};
pub use manager::{
    ManagerSettings, SandboxHandle, SessionManager, SessionManagerBuilder, SweepReport,
};
pub use state::{CleanupReason, SandboxInfo, SandboxState, SessionState};
pub use store::{FileStateStore, InMemoryStateStore, SandboxStateStore};
pub use sweeper::SweeperHandle;

use async_trait::async_trait;

use crate::error::LifecycleError;
use crate::quota::UserQuota;

/// What the tool layer needs from the lifecycle: a ready sandbox per session.
#[async_trait]
pub trait SandboxLifecycleService: Send + Sync {
    /// Returns the session's sandbox, creating or recreating it if needed.
    async fn ensure_available(
        &self,
        session_id: &str,
        user_id: Option<&str>,
        quota: &UserQuota,
    ) -> Result<SandboxInfo, LifecycleError>;

    /// Terminates and forgets the session's sandbox. True if one was live.
    async fn cleanup_by_session(&self, session_id: &str) -> bool;

    /// Live sandboxes held by `user_id`.
    fn count_user_sandboxes(&self, user_id: &str) -> usize;

    /// Read-only lookup; does not refresh activity or recreate.
    fn get_by_session(&self, session_id: &str) -> Option<SandboxInfo>;
}

#[async_trait]
impl SandboxLifecycleService for SessionManager {
    async fn ensure_available(
        &self,
        session_id: &str,
        user_id: Option<&str>,
        quota: &UserQuota,
    ) -> Result<SandboxInfo, LifecycleError> {
        SessionManager::ensure_available(self, session_id, user_id, quota).await
    }

    async fn cleanup_by_session(&self, session_id: &str) -> bool {
        SessionManager::cleanup_by_session(self, session_id).await
    }

    fn count_user_sandboxes(&self, user_id: &str) -> usize {
        SessionManager::count_user_sandboxes(self, user_id)
    }

    fn get_by_session(&self, session_id: &str) -> Option<SandboxInfo> {
        SessionManager::get_by_session(self, session_id)
    }
}
