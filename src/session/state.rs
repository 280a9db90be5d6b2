//! Sandbox records: the live view, the post-mortem snapshot, and the states
//! a session moves through.

use chrono::{DateTime, Utc};
use indexmap::IndexSet;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::quota::UserQuota;

/// Where a session's sandbox is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// First sandbox for the session is being started.
    Provisioning,
    /// Running and recently used.
    Active,
    /// Running but unused for longer than the idle timeout; next sweep evicts it.
    Idle,
    /// A replacement for an evicted sandbox is being started.
    Recreating,
    /// No sandbox; the last one was evicted or cleaned up.
    Terminated,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Provisioning => "provisioning",
            Self::Active => "active",
            Self::Idle => "idle",
            Self::Recreating => "recreating",
            Self::Terminated => "terminated",
        };
        f.write_str(s)
    }
}

/// Why a sandbox was terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CleanupReason {
    /// Unused for longer than the idle timeout.
    IdleTimeout,
    /// Alive for longer than the maximum duration.
    MaxDurationExceeded,
    /// The owning session was removed.
    ExplicitCleanup,
    /// Evicted to make room for a newer sandbox of the same user.
    QuotaExceeded,
    /// The container or process died underneath us.
    ContainerLost,
}

impl fmt::Display for CleanupReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::IdleTimeout => "idle timeout",
            Self::MaxDurationExceeded => "maximum duration exceeded",
            Self::ExplicitCleanup => "explicit cleanup",
            Self::QuotaExceeded => "sandbox quota exceeded",
            Self::ContainerLost => "container lost",
        };
        f.write_str(s)
    }
}

/// Live, in-memory description of a session's sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxInfo {
    /// Executor identifier (container name, fabricated id, ...).
    pub sandbox_id: String,
    /// Owning session.
    pub session_id: String,
    /// Owning user; `None` for anonymous callers without an id.
    pub user_id: Option<String>,
    /// False once terminated.
    pub is_active: bool,
    /// When the sandbox was provisioned.
    pub created_at: DateTime<Utc>,
    /// Last `ensure_available` or execute call.
    pub last_activity: DateTime<Utc>,
    /// This sandbox replaced an evicted one.
    pub is_recreated: bool,
    /// User-facing notice about what the replacement lost.
    pub recreation_message: Option<String>,
    /// Packages observed being installed, in order.
    pub installed_packages: IndexSet<String>,
    /// Files observed being written, in order.
    pub created_files: IndexSet<String>,
    /// Variables observed being exported.
    pub environment_variables: BTreeMap<String, String>,
}

impl SandboxInfo {
    /// A fresh, active sandbox record.
    pub fn new(
        sandbox_id: impl Into<String>,
        session_id: impl Into<String>,
        user_id: Option<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            sandbox_id: sandbox_id.into(),
            session_id: session_id.into(),
            user_id,
            is_active: true,
            created_at: now,
            last_activity: now,
            is_recreated: false,
            recreation_message: None,
            installed_packages: IndexSet::new(),
            created_files: IndexSet::new(),
            environment_variables: BTreeMap::new(),
        }
    }

    /// Seconds since the last activity (never negative).
    pub fn idle_seconds(&self, now: DateTime<Utc>) -> u64 {
        non_negative_secs(now - self.last_activity)
    }

    /// Seconds since creation (never negative).
    pub fn age_seconds(&self, now: DateTime<Utc>) -> u64 {
        non_negative_secs(now - self.created_at)
    }

    /// The eviction this sandbox is due for, if any. Lifetime is checked
    /// before idleness.
    pub fn expiry(&self, quota: &UserQuota, now: DateTime<Utc>) -> Option<CleanupReason> {
        if self.age_seconds(now) >= quota.sandbox_max_duration {
            Some(CleanupReason::MaxDurationExceeded)
        } else if self.idle_seconds(now) >= quota.sandbox_idle_timeout {
            Some(CleanupReason::IdleTimeout)
        } else {
            None
        }
    }

    /// `Active` or `Idle` depending on the last activity.
    pub fn state_at(&self, quota: &UserQuota, now: DateTime<Utc>) -> SessionState {
        if !self.is_active {
            SessionState::Terminated
        } else if self.idle_seconds(now) >= quota.sandbox_idle_timeout {
            SessionState::Idle
        } else {
            SessionState::Active
        }
    }
}

/// Snapshot written once when a sandbox is terminated and read once when the
/// session gets its next sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxState {
    /// Session the dead sandbox belonged to.
    pub session_id: String,
    /// Why it was terminated.
    pub cleanup_reason: CleanupReason,
    /// When it was terminated.
    pub cleaned_at: Option<DateTime<Utc>>,
    /// Packages it had installed.
    pub installed_packages: IndexSet<String>,
    /// Files it had written.
    pub created_files: IndexSet<String>,
    /// Variables it had exported.
    pub environment_variables: BTreeMap<String, String>,
}

impl SandboxState {
    /// Captures what is known about `info` at termination.
    pub fn capture(info: &SandboxInfo, reason: CleanupReason, at: DateTime<Utc>) -> Self {
        Self {
            session_id: info.session_id.clone(),
            cleanup_reason: reason,
            cleaned_at: Some(at),
            installed_packages: info.installed_packages.clone(),
            created_files: info.created_files.clone(),
            environment_variables: info.environment_variables.clone(),
        }
    }

    /// Notice shown to the user when this state is not carried over.
    pub fn recreation_message(&self) -> String {
        let packages = self.installed_packages.len();
        let files = self.created_files.len();
        let mut message = format!(
            "Your sandbox was recreated after {}; {} {} and {} {} from your previous session were not restored automatically.",
            self.cleanup_reason,
            packages,
            plural(packages, "package", "packages"),
            files,
            plural(files, "file", "files"),
        );
        if packages > 0 {
            let list: Vec<&str> = self.installed_packages.iter().map(String::as_str).collect();
            message.push_str(&format!(" Reinstall if needed: {}.", list.join(", ")));
        }
        if !self.environment_variables.is_empty() {
            let names: Vec<&str> = self
                .environment_variables
                .keys()
                .map(String::as_str)
                .collect();
            message.push_str(&format!(
                " Environment variables to set again: {}.",
                names.join(", ")
            ));
        }
        message
    }
}

/// Notice used when a sandbox is recreated but no snapshot was kept.
pub(crate) fn generic_recreation_message(reason: Option<CleanupReason>) -> String {
    match reason {
        Some(reason) => format!(
            "Your sandbox was recreated after {reason}; packages installed in the previous sandbox need to be reinstalled."
        ),
        None => "Your sandbox was recreated; packages installed in the previous sandbox need to be reinstalled.".to_string(),
    }
}

fn plural<'a>(n: usize, one: &'a str, many: &'a str) -> &'a str {
    if n == 1 {
        one
    } else {
        many
    }
}

fn non_negative_secs(delta: chrono::Duration) -> u64 {
    u64::try_from(delta.num_seconds()).unwrap_or(0)
}
