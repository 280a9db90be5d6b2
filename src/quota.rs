//! Per-user resource ceilings.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Resource ceilings for one caller, derived from identity on every request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserQuota {
    /// Distinct sessions a user may hold. Hard cap, never evicted for.
    pub max_sessions: usize,
    /// Live sandboxes a user may hold. Soft cap, the oldest is evicted.
    pub max_sandboxes: usize,
    /// Seconds without activity before a sandbox becomes idle.
    pub sandbox_idle_timeout: u64,
    /// Seconds since creation after which a sandbox is always evicted.
    pub sandbox_max_duration: u64,
}

impl UserQuota {
    /// Quota for callers without an account.
    pub const fn for_anonymous() -> Self {
        Self {
            max_sessions: 3,
            max_sandboxes: 1,
            sandbox_idle_timeout: 1800,
            sandbox_max_duration: 7200,
        }
    }

    /// Quota for signed-in users.
    pub const fn for_registered() -> Self {
        Self {
            max_sessions: 50,
            max_sandboxes: 5,
            sandbox_idle_timeout: 7200,
            sandbox_max_duration: 28800,
        }
    }

    /// Picks the canonical quota for an identity.
    pub const fn for_identity(is_anonymous: bool) -> Self {
        if is_anonymous {
            Self::for_anonymous()
        } else {
            Self::for_registered()
        }
    }

    /// True when every ceiling of `self` is at most the matching one in `other`.
    pub fn is_within(&self, other: &Self) -> bool {
        self.max_sessions <= other.max_sessions
            && self.max_sandboxes <= other.max_sandboxes
            && self.sandbox_idle_timeout <= other.sandbox_idle_timeout
            && self.sandbox_max_duration <= other.sandbox_max_duration
    }

    /// Idle timeout as a `Duration`.
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.sandbox_idle_timeout)
    }

    /// Maximum lifetime as a `Duration`.
    pub fn max_duration(&self) -> Duration {
        Duration::from_secs(self.sandbox_max_duration)
    }
}

impl Default for UserQuota {
    fn default() -> Self {
        Self::for_anonymous()
    }
}
