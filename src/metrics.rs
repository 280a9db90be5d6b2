//! Lifecycle counters and a scoped timer.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::debug;

use crate::session::CleanupReason;

/// Monotonic counters describing what the manager has done.
#[derive(Debug, Default)]
pub struct LifecycleMetrics {
    provisioned: AtomicU64,
    reused: AtomicU64,
    recreated: AtomicU64,
    provision_failures: AtomicU64,
    executions: AtomicU64,
    execution_timeouts: AtomicU64,
    evicted_idle: AtomicU64,
    evicted_max_duration: AtomicU64,
    evicted_quota: AtomicU64,
    evicted_lost: AtomicU64,
    cleaned_up: AtomicU64,
}

/// Point-in-time copy of [`LifecycleMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    /// Sandboxes provisioned, including recreations.
    pub provisioned: u64,
    /// `ensure_available` calls answered with an existing sandbox.
    pub reused: u64,
    /// Provisions that replaced an evicted sandbox.
    pub recreated: u64,
    /// Provisioning attempts that failed (each attempt counts).
    pub provision_failures: u64,
    /// Execute calls that reached an executor.
    pub executions: u64,
    /// Execute calls that hit their hard timeout.
    pub execution_timeouts: u64,
    /// Evictions for inactivity.
    pub evicted_idle: u64,
    /// Evictions for exceeding the lifetime limit.
    pub evicted_max_duration: u64,
    /// Evictions to make room under the sandbox quota.
    pub evicted_quota: u64,
    /// Sandboxes dropped because their container died.
    pub evicted_lost: u64,
    /// Explicit cleanups.
    pub cleaned_up: u64,
}

impl LifecycleMetrics {
    pub(crate) fn record_provisioned(&self, recreated: bool) {
        self.provisioned.fetch_add(1, Ordering::Relaxed);
        if recreated {
            self.recreated.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_reused(&self) {
        self.reused.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_provision_failure(&self) {
        self.provision_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_execution(&self, timed_out: bool) {
        self.executions.fetch_add(1, Ordering::Relaxed);
        if timed_out {
            self.execution_timeouts.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_termination(&self, reason: CleanupReason) {
        let counter = match reason {
            CleanupReason::IdleTimeout => &self.evicted_idle,
            CleanupReason::MaxDurationExceeded => &self.evicted_max_duration,
            CleanupReason::QuotaExceeded => &self.evicted_quota,
            CleanupReason::ContainerLost => &self.evicted_lost,
            CleanupReason::ExplicitCleanup => &self.cleaned_up,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Copies the current values.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            provisioned: self.provisioned.load(Ordering::Relaxed),
            reused: self.reused.load(Ordering::Relaxed),
            recreated: self.recreated.load(Ordering::Relaxed),
            provision_failures: self.provision_failures.load(Ordering::Relaxed),
            executions: self.executions.load(Ordering::Relaxed),
            execution_timeouts: self.execution_timeouts.load(Ordering::Relaxed),
            evicted_idle: self.evicted_idle.load(Ordering::Relaxed),
            evicted_max_duration: self.evicted_max_duration.load(Ordering::Relaxed),
            evicted_quota: self.evicted_quota.load(Ordering::Relaxed),
            evicted_lost: self.evicted_lost.load(Ordering::Relaxed),
            cleaned_up: self.cleaned_up.load(Ordering::Relaxed),
        }
    }
}

/// Logs how long a scope took when it is dropped.
#[derive(Debug)]
pub struct Timer {
    label: &'static str,
    started: Instant,
}

impl Timer {
    /// Starts timing `label`.
    pub fn start(label: &'static str) -> Self {
        Self {
            label,
            started: Instant::now(),
        }
    }

    /// Time since start.
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        debug!(
            timer = self.label,
            elapsed_ms = u64::try_from(self.elapsed().as_millis()).unwrap_or(u64::MAX),
            "timer finished"
        );
    }
}
