//! The session manager: admission, reuse, eviction and recreation of
//! per-session sandboxes.
//!
//! Locking:
//! - `registry` (std mutex) guards the session and user maps. It is never
//!   held across an await.
//! - Each session has an async lock held for the whole of `ensure_available`,
//!   eviction and cleanup of that session.
//! - Each live sandbox has an `exec_lock` that queues execute calls and that
//!   termination waits on. A cancelled call keeps the lock until its executor
//!   has been interrupted.
//!
//! Lock order is session lock, then registry, then a sandbox's info mutex.
//! A session waiting on another session's lock only ever waits on a live
//! sandbox's session, and a waiter's own session is never live, so waits
//! cannot form a cycle.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{oneshot, Mutex as AsyncMutex};
use tracing::{debug, info, warn};

use super::factory::{DefaultSessionExecutorFactory, SessionExecutorFactory};
use super::state::{
    generic_recreation_message, CleanupReason, SandboxInfo, SandboxState, SessionState,
};
use super::store::{InMemoryStateStore, SandboxStateStore};
use super::sweeper::{self, SweeperHandle};
use super::tracking::{self, EnvironmentChanges};
use crate::clock::{Clock, SystemClock};
use crate::config::{Config, TimeoutConfig};
use crate::error::LifecycleError;
use crate::metrics::{LifecycleMetrics, MetricsSnapshot, Timer};
use crate::quota::UserQuota;
use crate::sandbox::{ExecutionError, ExecutionResult, ExecutorKind, Payload, SandboxExecutor};

/// Provisioning attempts before giving up: the first try plus one retry.
const PROVISION_ATTEMPTS: u32 = 2;

/// Tunables that do not come from the per-request quota.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ManagerSettings {
    /// Hard limit for one execute call.
    pub exec_timeout: Duration,
    /// Pause before the provisioning retry.
    pub provision_retry_backoff: Duration,
    /// Interval used by [`SessionManager::spawn_configured_sweeper`].
    pub sweep_interval: Duration,
}

impl ManagerSettings {
    /// Settings taken from the `[timeouts]` section.
    pub fn from_config(timeouts: &TimeoutConfig) -> Self {
        Self {
            exec_timeout: timeouts.exec_timeout(),
            provision_retry_backoff: timeouts.provision_retry_backoff(),
            sweep_interval: timeouts.sweep_interval(),
        }
    }
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self::from_config(&TimeoutConfig::default())
    }
}

/// Outcome of one eviction sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Live sandboxes looked at.
    pub examined: usize,
    /// Sessions whose sandbox was terminated, with the reason.
    pub evicted: Vec<(String, CleanupReason)>,
    /// Expired sandboxes left alone because their session was busy.
    pub skipped_busy: usize,
}

/// A running sandbox and everything needed to use it safely.
struct LiveSandbox {
    info: Mutex<SandboxInfo>,
    executor: Arc<dyn SandboxExecutor>,
    exec_lock: Arc<AsyncMutex<()>>,
    terminated: AtomicBool,
}

impl LiveSandbox {
    fn new(info: SandboxInfo, executor: Arc<dyn SandboxExecutor>) -> Self {
        Self {
            info: Mutex::new(info),
            executor,
            exec_lock: Arc::new(AsyncMutex::new(())),
            terminated: AtomicBool::new(false),
        }
    }

    fn with_info<R>(&self, f: impl FnOnce(&mut SandboxInfo) -> R) -> R {
        let mut info = self.info.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut info)
    }

    fn info(&self) -> SandboxInfo {
        self.with_info(|info| info.clone())
    }

    fn touch(&self, now: DateTime<Utc>) {
        self.with_info(|info| info.last_activity = info.last_activity.max(now));
    }

    fn record(&self, changes: EnvironmentChanges) {
        self.with_info(|info| {
            info.installed_packages.extend(changes.packages);
            info.created_files.extend(changes.files);
            info.environment_variables.extend(changes.variables);
        });
    }
}

enum Slot {
    /// A sandbox is being started. `previous` is set when it replaces one.
    Provisioning {
        previous: Option<(CleanupReason, DateTime<Utc>)>,
    },
    Live(Arc<LiveSandbox>),
    Terminated {
        reason: CleanupReason,
        at: DateTime<Utc>,
    },
}

struct SessionRecord {
    user_id: Option<String>,
    /// Latest quota seen for the session; the sweep judges expiry by it.
    quota: UserQuota,
    slot: Slot,
}

#[derive(Default)]
struct Registry {
    sessions: HashMap<String, SessionRecord>,
    /// Sessions owned by each user, live or not, until cleaned up.
    user_sessions: HashMap<String, HashSet<String>>,
}

impl Registry {
    fn live(&self, session_id: &str) -> Option<Arc<LiveSandbox>> {
        match self.sessions.get(session_id).map(|r| &r.slot) {
            Some(Slot::Live(live)) => Some(live.clone()),
            _ => None,
        }
    }

    fn owned_by<'a>(
        &'a self,
        user_id: &'a str,
    ) -> impl Iterator<Item = (&'a String, &'a SessionRecord)> + 'a {
        let sessions = &self.sessions;
        self.user_sessions
            .get(user_id)
            .into_iter()
            .flatten()
            .filter_map(move |id| sessions.get_key_value(id))
    }

    fn live_count(&self, user_id: &str) -> usize {
        self.owned_by(user_id)
            .filter(|(_, r)| matches!(r.slot, Slot::Live(_)))
            .count()
    }

    /// Live plus reserved sandboxes: what admission has to count.
    fn committed_count(&self, user_id: &str) -> usize {
        self.owned_by(user_id)
            .filter(|(_, r)| matches!(r.slot, Slot::Live(_) | Slot::Provisioning { .. }))
            .count()
    }

    /// The user's live sandbox with the oldest `last_activity`. Ties go to
    /// the smaller session id so the choice is stable.
    fn least_recently_active(&self, user_id: &str) -> Option<String> {
        self.owned_by(user_id)
            .filter_map(|(id, r)| match &r.slot {
                Slot::Live(live) => Some((live.with_info(|i| i.last_activity), id)),
                _ => None,
            })
            .min()
            .map(|(_, id)| id.clone())
    }

    fn unregister(&mut self, session_id: &str, user_id: Option<&str>) {
        let Some(user_id) = user_id else { return };
        if let Some(sessions) = self.user_sessions.get_mut(user_id) {
            sessions.remove(session_id);
            if sessions.is_empty() {
                self.user_sessions.remove(user_id);
            }
        }
    }
}

/// What happens to the session's snapshot when its sandbox is released.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Snapshot {
    /// Keep it for the session's next sandbox.
    Save,
    /// The session is gone for good; drop any snapshot it has.
    Discard,
}

enum Admission {
    Reserved {
        owner: Option<String>,
        previous: Option<(CleanupReason, DateTime<Utc>)>,
    },
    Evict {
        owner: String,
        victim: String,
    },
}

/// Shared state behind [`SessionManager`] clones and the sweeper.
struct Inner {
    factory: Arc<dyn SessionExecutorFactory>,
    store: Arc<dyn SandboxStateStore>,
    clock: Arc<dyn Clock>,
    settings: ManagerSettings,
    registry: Mutex<Registry>,
    session_locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
    metrics: LifecycleMetrics,
}

/// Puts a session back the way it was if provisioning does not commit,
/// including when the provisioning future is dropped. An executor created
/// before that point is terminated in the background.
struct Reservation<'a> {
    inner: &'a Inner,
    session_id: &'a str,
    owner: Option<String>,
    previous: Option<(CleanupReason, DateTime<Utc>)>,
    executor: Option<Arc<dyn SandboxExecutor>>,
    armed: bool,
}

impl Reservation<'_> {
    fn hold(&mut self, executor: Arc<dyn SandboxExecutor>) {
        self.executor = Some(executor);
    }

    fn commit(mut self) {
        self.armed = false;
        self.executor = None;
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Some(executor) = self.executor.take() {
            let session_id = self.session_id.to_string();
            warn!(
                session_id = %session_id,
                sandbox_id = %executor.id(),
                "Provisioning abandoned, terminating its sandbox"
            );
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move {
                    if let Err(e) = executor.terminate().await {
                        warn!(session_id = %session_id, "Terminate of abandoned sandbox failed: {}", e);
                    }
                });
            } else {
                warn!(session_id = %session_id, "No runtime to terminate abandoned sandbox");
            }
        }
        let mut registry = self.inner.registry();
        match self.previous {
            Some((reason, at)) => {
                if let Some(record) = registry.sessions.get_mut(self.session_id) {
                    record.slot = Slot::Terminated { reason, at };
                }
            }
            None => {
                registry.sessions.remove(self.session_id);
                registry.unregister(self.session_id, self.owner.as_deref());
            }
        }
    }
}

impl Inner {
    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn session_lock(&self, session_id: &str) -> Arc<AsyncMutex<()>> {
        self.session_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(session_id.to_string())
            .or_default()
            .clone()
    }

    /// Drops lock entries nobody holds for sessions that no longer exist.
    fn prune_session_locks(&self) {
        let mut locks = self
            .session_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let registry = self.registry();
        locks.retain(|id, lock| {
            Arc::strong_count(lock) > 1 || registry.sessions.contains_key(id)
        });
    }

    async fn ensure_live(
        &self,
        session_id: &str,
        user_id: Option<&str>,
        quota: &UserQuota,
    ) -> Result<Arc<LiveSandbox>, LifecycleError> {
        let _timer = Timer::start("ensure_available");
        let lock = self.session_lock(session_id);
        let _guard = lock.lock().await;

        if let Some(live) = self.reuse(session_id, quota).await {
            return Ok(live);
        }

        loop {
            match self.admit(session_id, user_id, quota)? {
                Admission::Reserved { owner, previous } => {
                    return self.provision(session_id, owner, quota, previous).await;
                }
                Admission::Evict { owner, victim } => {
                    self.evict_for_quota(&owner, &victim, quota).await;
                }
            }
        }
    }

    /// Returns the session's sandbox if it can be used as is. A sandbox past
    /// its lifetime or whose executor died is terminated here instead.
    async fn reuse(&self, session_id: &str, quota: &UserQuota) -> Option<Arc<LiveSandbox>> {
        let live = {
            let mut registry = self.registry();
            let record = registry.sessions.get_mut(session_id)?;
            record.quota = *quota;
            match &record.slot {
                Slot::Live(live) => live.clone(),
                _ => return None,
            }
        };

        let now = self.clock.now();
        let info = live.info();
        if info.age_seconds(now) >= quota.sandbox_max_duration {
            self.terminate_locked(session_id, CleanupReason::MaxDurationExceeded)
                .await;
            return None;
        }
        if !live.executor.is_healthy().await {
            warn!(session_id, sandbox_id = %info.sandbox_id, "Sandbox is no longer healthy");
            self.terminate_locked(session_id, CleanupReason::ContainerLost)
                .await;
            return None;
        }

        if info.state_at(quota, now) == SessionState::Idle {
            debug!(session_id, sandbox_id = %info.sandbox_id, "Reviving idle sandbox");
        }
        live.touch(now);
        self.metrics.record_reused();
        debug!(session_id, sandbox_id = %info.sandbox_id, "Reusing sandbox");
        Some(live)
    }

    /// Quota checks and slot reservation, atomic under the registry lock.
    fn admit(
        &self,
        session_id: &str,
        user_id: Option<&str>,
        quota: &UserQuota,
    ) -> Result<Admission, LifecycleError> {
        let mut registry = self.registry();

        let (owner, previous) = match registry.sessions.get(session_id) {
            None => (user_id.map(String::from), None),
            Some(record) => match record.slot {
                Slot::Terminated { reason, at } => (record.user_id.clone(), Some((reason, at))),
                Slot::Live(_) | Slot::Provisioning { .. } => {
                    return Err(LifecycleError::resource_exhausted(format!(
                        "session {session_id} already has a sandbox starting"
                    )));
                }
            },
        };
        let is_new = previous.is_none();

        if let Some(owner) = owner.as_deref() {
            if is_new {
                let sessions = registry.user_sessions.get(owner).map_or(0, HashSet::len);
                if sessions >= quota.max_sessions {
                    return Err(LifecycleError::resource_exhausted(format!(
                        "user {owner} already has {sessions} sessions (limit {})",
                        quota.max_sessions
                    )));
                }
            }

            let sandboxes = registry.committed_count(owner);
            if sandboxes >= quota.max_sandboxes {
                return match registry.least_recently_active(owner) {
                    Some(victim) => Ok(Admission::Evict {
                        owner: owner.to_string(),
                        victim,
                    }),
                    None => Err(LifecycleError::resource_exhausted(format!(
                        "user {owner} has {sandboxes} sandboxes starting (limit {})",
                        quota.max_sandboxes
                    ))),
                };
            }
        }

        let record = registry
            .sessions
            .entry(session_id.to_string())
            .or_insert_with(|| SessionRecord {
                user_id: owner.clone(),
                quota: *quota,
                slot: Slot::Provisioning { previous: None },
            });
        record.quota = *quota;
        record.slot = Slot::Provisioning { previous };
        if let Some(owner) = owner.as_deref() {
            registry
                .user_sessions
                .entry(owner.to_string())
                .or_default()
                .insert(session_id.to_string());
        }

        Ok(Admission::Reserved { owner, previous })
    }

    /// Terminates `victim` if it is still `owner`'s least recently active
    /// sandbox once its session lock is held. Otherwise admission re-runs.
    async fn evict_for_quota(&self, owner: &str, victim: &str, quota: &UserQuota) {
        let lock = self.session_lock(victim);
        let _guard = lock.lock().await;

        let still_victim = {
            let registry = self.registry();
            registry.committed_count(owner) >= quota.max_sandboxes
                && registry.least_recently_active(owner).as_deref() == Some(victim)
        };
        if still_victim {
            info!(user_id = owner, session_id = victim, "Evicting sandbox to stay within quota");
            self.terminate_locked(victim, CleanupReason::QuotaExceeded)
                .await;
        }
    }

    async fn provision(
        &self,
        session_id: &str,
        owner: Option<String>,
        quota: &UserQuota,
        previous: Option<(CleanupReason, DateTime<Utc>)>,
    ) -> Result<Arc<LiveSandbox>, LifecycleError> {
        let mut reservation = Reservation {
            inner: self,
            session_id,
            owner: owner.clone(),
            previous,
            executor: None,
            armed: true,
        };

        info!(
            session_id,
            user_id = owner.as_deref().unwrap_or("-"),
            recreating = previous.is_some(),
            "Provisioning sandbox"
        );
        let executor = self.create_executor(session_id, quota).await?;
        reservation.hold(executor.clone());

        // Peek now and delete after commit, so an abandoned provisioning
        // leaves the snapshot for the next attempt.
        let snapshot = match self.store.peek(session_id).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(session_id, "Failed to read sandbox state: {:#}", e);
                None
            }
        };

        let now = self.clock.now();
        let mut info = SandboxInfo::new(executor.id(), session_id, owner.clone(), now);
        let recreated = previous.is_some() || snapshot.is_some();
        if recreated {
            info.is_recreated = true;
            info.recreation_message = Some(match &snapshot {
                Some(state) => state.recreation_message(),
                None => generic_recreation_message(previous.map(|(reason, _)| reason)),
            });
        }
        let sandbox_id = info.sandbox_id.clone();
        let live = Arc::new(LiveSandbox::new(info, executor));

        {
            let mut registry = self.registry();
            let record = registry
                .sessions
                .entry(session_id.to_string())
                .or_insert_with(|| SessionRecord {
                    user_id: owner,
                    quota: *quota,
                    slot: Slot::Provisioning { previous: None },
                });
            record.slot = Slot::Live(live.clone());
        }
        reservation.commit();

        if snapshot.is_some() {
            if let Err(e) = self.store.remove(session_id).await {
                warn!(session_id, "Failed to delete consumed sandbox state: {:#}", e);
            }
        }
        self.metrics.record_provisioned(recreated);
        info!(session_id, sandbox_id = %sandbox_id, recreated, "Sandbox ready");
        Ok(live)
    }

    /// Calls the factory, retrying once after the backoff.
    async fn create_executor(
        &self,
        session_id: &str,
        quota: &UserQuota,
    ) -> Result<Arc<dyn SandboxExecutor>, LifecycleError> {
        let mut attempt = 1;
        loop {
            let err = match self
                .factory
                .create_session_executor(session_id, quota.sandbox_idle_timeout)
                .await
            {
                Ok(executor) => return Ok(executor),
                Err(e) => e,
            };
            self.metrics.record_provision_failure();

            if let ExecutionError::Unsupported { backend } = &err {
                return Err(LifecycleError::not_implemented(format!(
                    "{backend} executor"
                )));
            }
            warn!(session_id, attempt, error = %err, "Sandbox provisioning failed");

            if attempt >= PROVISION_ATTEMPTS || !err.is_retryable() {
                return Err(LifecycleError::resource_exhausted(format!(
                    "could not start a sandbox for session {session_id}: {err}"
                )));
            }
            attempt += 1;
            tokio::time::sleep(self.settings.provision_retry_backoff).await;
        }
    }

    /// Marks the session's sandbox terminated and releases it. The caller
    /// holds the session lock. Returns false if nothing was live.
    async fn terminate_locked(&self, session_id: &str, reason: CleanupReason) -> bool {
        let now = self.clock.now();
        let live = {
            let mut registry = self.registry();
            let Some(record) = registry.sessions.get_mut(session_id) else {
                return false;
            };
            let Slot::Live(live) = &record.slot else {
                return false;
            };
            let live = live.clone();
            record.slot = Slot::Terminated { reason, at: now };
            live
        };
        self.release(&live, reason, now, Snapshot::Save).await;
        true
    }

    async fn release(
        &self,
        live: &LiveSandbox,
        reason: CleanupReason,
        now: DateTime<Utc>,
        snapshot: Snapshot,
    ) {
        live.terminated.store(true, Ordering::SeqCst);
        {
            // Let an in-flight execute finish before pulling the container.
            let _exec = live.exec_lock.lock().await;
            if let Err(e) = live.executor.terminate().await {
                warn!(
                    sandbox_id = %live.executor.id(),
                    "Terminate failed, treating sandbox as gone: {}", e
                );
            }
        }

        let info = live.with_info(|info| {
            info.is_active = false;
            info.clone()
        });
        if snapshot == Snapshot::Save {
            if let Err(e) = self
                .store
                .save(SandboxState::capture(&info, reason, now))
                .await
            {
                warn!(session_id = %info.session_id, "Failed to save sandbox state: {:#}", e);
            }
        }

        self.metrics.record_termination(reason);
        info!(
            session_id = %info.session_id,
            sandbox_id = %info.sandbox_id,
            reason = %reason,
            "Sandbox terminated"
        );
    }

    /// Terminates `live` only if it is still the session's current sandbox.
    async fn evict_if_current(&self, session_id: &str, live: &Arc<LiveSandbox>, reason: CleanupReason) {
        let lock = self.session_lock(session_id);
        let _guard = lock.lock().await;
        let current = self
            .registry()
            .live(session_id)
            .is_some_and(|current| Arc::ptr_eq(&current, live));
        if current {
            self.terminate_locked(session_id, reason).await;
        }
    }

    /// Forgets the session. With [`Snapshot::Discard`] any snapshot it left
    /// is deleted too.
    async fn cleanup(&self, session_id: &str, snapshot: Snapshot) -> bool {
        let cleaned = {
            let lock = self.session_lock(session_id);
            let _guard = lock.lock().await;

            let slot = {
                let mut registry = self.registry();
                match registry.sessions.remove(session_id) {
                    Some(record) => {
                        registry.unregister(session_id, record.user_id.as_deref());
                        Some(record.slot)
                    }
                    None => None,
                }
            };

            let cleaned = match slot {
                Some(Slot::Live(live)) => {
                    let now = self.clock.now();
                    self.release(&live, CleanupReason::ExplicitCleanup, now, snapshot)
                        .await;
                    true
                }
                _ => false,
            };
            if snapshot == Snapshot::Discard {
                if let Err(e) = self.store.remove(session_id).await {
                    warn!(session_id, "Failed to delete sandbox state: {:#}", e);
                }
            }
            cleaned
        };
        self.prune_session_locks();
        cleaned
    }

    async fn sweep_expired(&self) -> SweepReport {
        let _timer = Timer::start("sweep");
        let now = self.clock.now();
        let mut report = SweepReport::default();

        let candidates: Vec<String> = {
            let registry = self.registry();
            registry
                .sessions
                .iter()
                .filter_map(|(id, record)| match &record.slot {
                    Slot::Live(live) => Some((id, live, record.quota)),
                    _ => None,
                })
                .inspect(|_| report.examined += 1)
                .filter(|(_, live, quota)| live.with_info(|i| i.expiry(quota, now)).is_some())
                .map(|(id, _, _)| id.clone())
                .collect()
        };

        for session_id in candidates {
            let lock = self.session_lock(&session_id);
            let Ok(_guard) = lock.try_lock() else {
                debug!(session_id = %session_id, "Session busy, skipping sweep");
                report.skipped_busy += 1;
                continue;
            };

            // Re-check under the lock; the sandbox may have been used since.
            let now = self.clock.now();
            let due = {
                let registry = self.registry();
                registry.sessions.get(&session_id).and_then(|record| match &record.slot {
                    Slot::Live(live) => live.with_info(|i| i.expiry(&record.quota, now)),
                    _ => None,
                })
            };
            if let Some(reason) = due {
                if self.terminate_locked(&session_id, reason).await {
                    report.evicted.push((session_id, reason));
                }
            }
        }

        self.prune_session_locks();
        if !report.evicted.is_empty() || report.skipped_busy > 0 {
            info!(
                examined = report.examined,
                evicted = report.evicted.len(),
                skipped_busy = report.skipped_busy,
                "Sweep finished"
            );
        }
        report
    }
}

/// Owns every session's sandbox. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

impl fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let registry = self.inner.registry();
        f.debug_struct("SessionManager")
            .field("sessions", &registry.sessions.len())
            .field("users", &registry.user_sessions.len())
            .field("settings", &self.inner.settings)
            .finish_non_exhaustive()
    }
}

/// Builder for [`SessionManager`].
pub struct SessionManagerBuilder {
    factory: Arc<dyn SessionExecutorFactory>,
    store: Arc<dyn SandboxStateStore>,
    clock: Arc<dyn Clock>,
    settings: ManagerSettings,
}

impl SessionManagerBuilder {
    /// Where termination snapshots go. Defaults to memory.
    #[must_use]
    pub fn store(mut self, store: Arc<dyn SandboxStateStore>) -> Self {
        self.store = store;
        self
    }

    /// Clock used for activity and expiry. Defaults to the system clock.
    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Execute timeout and retry backoff.
    #[must_use]
    pub fn settings(mut self, settings: ManagerSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Finishes the manager.
    pub fn build(self) -> SessionManager {
        SessionManager {
            inner: Arc::new(Inner {
                factory: self.factory,
                store: self.store,
                clock: self.clock,
                settings: self.settings,
                registry: Mutex::new(Registry::default()),
                session_locks: Mutex::new(HashMap::new()),
                metrics: LifecycleMetrics::default(),
            }),
        }
    }
}

impl SessionManager {
    /// Starts a builder around `factory`.
    pub fn builder(factory: Arc<dyn SessionExecutorFactory>) -> SessionManagerBuilder {
        SessionManagerBuilder {
            factory,
            store: Arc::new(InMemoryStateStore::new()),
            clock: Arc::new(SystemClock),
            settings: ManagerSettings::default(),
        }
    }

    /// Manager with default store, clock and settings.
    pub fn new(factory: Arc<dyn SessionExecutorFactory>) -> Self {
        Self::builder(factory).build()
    }

    /// Manager backed by the config-driven executor factory. Fails with
    /// [`LifecycleError::Config`] if `config` does not validate.
    pub fn from_config(config: &Config) -> Result<Self, LifecycleError> {
        config
            .validate()
            .map_err(|e| LifecycleError::config(format!("{e:#}")))?;
        Ok(
            Self::builder(Arc::new(DefaultSessionExecutorFactory::new(config.clone())))
                .settings(ManagerSettings::from_config(&config.timeouts))
                .build(),
        )
    }

    /// Returns the session's sandbox, provisioning or recreating one if
    /// needed, and records activity.
    ///
    /// A user at `max_sandboxes` loses their least recently active sandbox.
    /// A user at `max_sessions` gets [`LifecycleError::ResourceExhausted`]
    /// for a new session.
    pub async fn ensure_available(
        &self,
        session_id: &str,
        user_id: Option<&str>,
        quota: &UserQuota,
    ) -> Result<SandboxInfo, LifecycleError> {
        let live = self.inner.ensure_live(session_id, user_id, quota).await?;
        Ok(live.info())
    }

    /// Like [`ensure_available`](Self::ensure_available), returning a handle
    /// that runs payloads in the sandbox.
    pub async fn acquire(
        &self,
        session_id: &str,
        user_id: Option<&str>,
        quota: &UserQuota,
    ) -> Result<SandboxHandle, LifecycleError> {
        let live = self.inner.ensure_live(session_id, user_id, quota).await?;
        Ok(SandboxHandle {
            session_id: session_id.to_string(),
            live,
            inner: self.inner.clone(),
        })
    }

    /// Runs `payload` in the session's sandbox. If the sandbox itself fails
    /// (not the payload), it is replaced and the payload is run once more.
    pub async fn execute(
        &self,
        session_id: &str,
        user_id: Option<&str>,
        quota: &UserQuota,
        payload: &Payload,
    ) -> Result<ExecutionResult, LifecycleError> {
        let handle = self.acquire(session_id, user_id, quota).await?;
        match handle.execute(payload).await {
            Err(LifecycleError::Execution(e)) if e.is_retryable() => {
                warn!(session_id, error = %e, "Sandbox failed during execute, replacing it");
                self.inner
                    .evict_if_current(session_id, &handle.live, CleanupReason::ContainerLost)
                    .await;
                let handle = self.acquire(session_id, user_id, quota).await?;
                handle.execute(payload).await
            }
            other => other,
        }
    }

    /// A handle to the session's live sandbox, without provisioning or
    /// touching its activity. Fails with [`LifecycleError::NotFound`] if the
    /// session has no live sandbox.
    pub fn handle(&self, session_id: &str) -> Result<SandboxHandle, LifecycleError> {
        let live = self
            .inner
            .registry()
            .live(session_id)
            .ok_or_else(|| LifecycleError::not_found(session_id))?;
        Ok(SandboxHandle {
            session_id: session_id.to_string(),
            live,
            inner: self.inner.clone(),
        })
    }

    /// Terminates and forgets the session, deleting any snapshot it left.
    /// True only if a sandbox was live, so a second call returns false.
    pub async fn cleanup_by_session(&self, session_id: &str) -> bool {
        self.inner.cleanup(session_id, Snapshot::Discard).await
    }

    /// Live sandboxes owned by `user_id`.
    pub fn count_user_sandboxes(&self, user_id: &str) -> usize {
        self.inner.registry().live_count(user_id)
    }

    /// The session's live sandbox, without touching its activity.
    pub fn get_by_session(&self, session_id: &str) -> Option<SandboxInfo> {
        let live = self.inner.registry().live(session_id)?;
        Some(live.info())
    }

    /// Where the session is in its lifecycle, or `None` if unknown.
    pub fn session_state(&self, session_id: &str) -> Option<SessionState> {
        let now = self.inner.clock.now();
        let registry = self.inner.registry();
        let record = registry.sessions.get(session_id)?;
        Some(match &record.slot {
            Slot::Provisioning { previous: None } => SessionState::Provisioning,
            Slot::Provisioning { previous: Some(_) } => SessionState::Recreating,
            Slot::Live(live) => live.with_info(|i| i.state_at(&record.quota, now)),
            Slot::Terminated { .. } => SessionState::Terminated,
        })
    }

    /// Why the session's last sandbox was terminated, while it has none.
    pub fn termination_reason(&self, session_id: &str) -> Option<CleanupReason> {
        let registry = self.inner.registry();
        match registry.sessions.get(session_id)?.slot {
            Slot::Terminated { reason, .. } => Some(reason),
            _ => None,
        }
    }

    /// Evicts idle and over-age sandboxes. Sessions whose lock is held are
    /// skipped and looked at again next time.
    pub async fn sweep_expired(&self) -> SweepReport {
        self.inner.sweep_expired().await
    }

    /// Sweeps every `interval` in the background. The task holds only a
    /// weak reference and ends once every manager clone is dropped.
    pub fn spawn_sweeper(&self, interval: Duration) -> SweeperHandle {
        let weak = Arc::downgrade(&self.inner);
        sweeper::spawn(interval, move || {
            let inner = weak.upgrade()?;
            Some(async move {
                inner.sweep_expired().await;
            })
        })
    }

    /// Sweeps at the configured `sweep_interval`.
    pub fn spawn_configured_sweeper(&self) -> SweeperHandle {
        self.spawn_sweeper(self.inner.settings.sweep_interval)
    }

    /// Cleans up every session, keeping snapshots so a restarted process
    /// can report what was lost. Returns how many sandboxes were live.
    pub async fn shutdown(&self) -> usize {
        let sessions: Vec<String> = self.inner.registry().sessions.keys().cloned().collect();
        let mut terminated = 0;
        for session_id in sessions {
            if self.inner.cleanup(&session_id, Snapshot::Save).await {
                terminated += 1;
            }
        }
        info!(terminated, "Session manager shut down");
        terminated
    }

    /// Counter values so far.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner.metrics.snapshot()
    }
}

/// A session's sandbox, obtained from [`SessionManager::acquire`].
///
/// Execute calls through any handle of the same sandbox run one at a time.
pub struct SandboxHandle {
    session_id: String,
    live: Arc<LiveSandbox>,
    inner: Arc<Inner>,
}

impl fmt::Debug for SandboxHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SandboxHandle")
            .field("session_id", &self.session_id)
            .field("sandbox_id", &self.live.executor.id())
            .finish_non_exhaustive()
    }
}

impl SandboxHandle {
    /// Session the sandbox belongs to.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Current view of the sandbox.
    pub fn info(&self) -> SandboxInfo {
        self.live.info()
    }

    /// Which executor backs the sandbox.
    pub fn executor_kind(&self) -> ExecutorKind {
        self.live.executor.kind()
    }

    /// Runs `payload` under the configured hard timeout.
    ///
    /// A timeout or non-zero exit comes back as an [`ExecutionResult`] and
    /// leaves the sandbox running. Fails with a terminated error once the
    /// sandbox has been evicted.
    ///
    /// Dropping the returned future interrupts the payload. The next call on
    /// the sandbox starts only after the interrupted one is dead.
    pub async fn execute(&self, payload: &Payload) -> Result<ExecutionResult, LifecycleError> {
        let exec = self.live.exec_lock.clone().lock_owned().await;
        if self.live.terminated.load(Ordering::SeqCst) {
            return Err(ExecutionError::terminated(self.live.executor.id()).into());
        }

        self.live.touch(self.inner.clock.now());
        let _timer = Timer::start("execute");

        // The call runs in its own task that owns the exec lock. If this
        // future is dropped, `_cancel_on_drop` goes with it and the task
        // interrupts the executor before letting go of the lock.
        let (_cancel_on_drop, cancelled) = oneshot::channel::<()>();
        let live = self.live.clone();
        let owned = payload.clone();
        let timeout = self.inner.settings.exec_timeout;
        let task = tokio::spawn(async move {
            let _exec = exec;
            tokio::select! {
                result = live.executor.execute(&owned, timeout) => Some(result),
                _ = cancelled => {
                    warn!(sandbox_id = %live.executor.id(), "Execute abandoned, interrupting payload");
                    if let Err(e) = live.executor.interrupt().await {
                        warn!(sandbox_id = %live.executor.id(), "Interrupt failed: {}", e);
                    }
                    None
                }
            }
        });

        let result = match task.await {
            Ok(Some(result)) => result?,
            Ok(None) => {
                return Err(ExecutionError::process_failed("execution was interrupted").into())
            }
            Err(e) => {
                return Err(
                    ExecutionError::process_failed(format!("execution task failed: {e}")).into(),
                )
            }
        };
        self.live.touch(self.inner.clock.now());
        self.inner.metrics.record_execution(result.timed_out);

        if result.success() {
            let changes = tracking::observe(payload);
            if !changes.is_empty() {
                debug!(
                    session_id = %self.session_id,
                    packages = changes.packages.len(),
                    files = changes.files.len(),
                    "Recorded environment changes"
                );
                self.live.record(changes);
            }
        } else if result.timed_out {
            warn!(session_id = %self.session_id, "Execution timed out");
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::ExecutionMode;
    use crate::sandbox::MockResponse;
    use crate::session::factory::MockSessionExecutorFactory;
    use futures_util::future::join_all;

    const ANON: UserQuota = UserQuota::for_anonymous();
    const REG: UserQuota = UserQuota::for_registered();

    struct Fixture {
        factory: Arc<MockSessionExecutorFactory>,
        clock: Arc<ManualClock>,
        store: Arc<InMemoryStateStore>,
        manager: SessionManager,
    }

    fn fixture_with(factory: MockSessionExecutorFactory) -> Fixture {
        let factory = Arc::new(factory);
        let clock = Arc::new(ManualClock::default());
        let store = Arc::new(InMemoryStateStore::new());
        let manager = SessionManager::builder(factory.clone())
            .clock(clock.clone())
            .store(store.clone())
            .settings(ManagerSettings {
                exec_timeout: Duration::from_secs(5),
                provision_retry_backoff: Duration::from_millis(1),
                sweep_interval: Duration::from_secs(60),
            })
            .build();
        Fixture {
            factory,
            clock,
            store,
            manager,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(MockSessionExecutorFactory::new())
    }

    fn cmd(s: &str) -> Payload {
        Payload::Command(s.to_string())
    }

    #[tokio::test]
    async fn test_reuse_returns_same_sandbox() {
        let f = fixture();
        let first = f.manager.ensure_available("s1", Some("u1"), &REG).await.unwrap();
        f.clock.advance_secs(10);
        let second = f.manager.ensure_available("s1", Some("u1"), &REG).await.unwrap();

        assert_eq!(first.sandbox_id, second.sandbox_id);
        assert!(second.last_activity > first.last_activity);
        assert!(!second.is_recreated);
        assert_eq!(f.factory.creation_count(), 1);
        assert_eq!(f.manager.metrics().reused, 1);
    }

    #[tokio::test]
    async fn test_factory_receives_quota_idle_timeout() {
        let f = fixture();
        f.manager.ensure_available("s1", Some("u1"), &ANON).await.unwrap();
        f.manager.ensure_available("s2", Some("u2"), &REG).await.unwrap();
        let created = f.factory.created_executors();
        assert_eq!(created[0].max_idle_seconds, 1800);
        assert_eq!(created[1].max_idle_seconds, 7200);
    }

    #[tokio::test]
    async fn test_anonymous_second_session_evicts_first() {
        let f = fixture();
        f.manager.ensure_available("s1", Some("a1"), &ANON).await.unwrap();
        f.manager.ensure_available("s2", Some("a1"), &ANON).await.unwrap();

        assert_eq!(f.manager.count_user_sandboxes("a1"), 1);
        assert!(f.manager.get_by_session("s1").is_none());
        assert_eq!(f.manager.session_state("s1"), Some(SessionState::Terminated));
        assert_eq!(
            f.manager.termination_reason("s1"),
            Some(CleanupReason::QuotaExceeded)
        );
        assert_eq!(f.factory.created_for("s1")[0].termination_count(), 1);
    }

    #[tokio::test]
    async fn test_session_cap_is_hard() {
        let f = fixture();
        for s in ["s1", "s2", "s3"] {
            f.manager.ensure_available(s, Some("a1"), &ANON).await.unwrap();
        }
        let err = f
            .manager
            .ensure_available("s4", Some("a1"), &ANON)
            .await
            .unwrap_err();
        assert!(err.is_resource_exhausted());
        // The live sandbox is untouched.
        assert!(f.manager.get_by_session("s3").is_some());

        // Known sessions still come back.
        f.manager.ensure_available("s1", Some("a1"), &ANON).await.unwrap();

        assert!(!f.manager.cleanup_by_session("s2").await);
        f.manager.ensure_available("s4", Some("a1"), &ANON).await.unwrap();
    }

    #[tokio::test]
    async fn test_users_without_id_are_not_counted() {
        let f = fixture();
        f.manager.ensure_available("s1", None, &ANON).await.unwrap();
        f.manager.ensure_available("s2", None, &ANON).await.unwrap();
        assert!(f.manager.get_by_session("s1").is_some());
        assert!(f.manager.get_by_session("s2").is_some());
    }

    #[tokio::test]
    async fn test_eviction_picks_least_recently_active() {
        let f = fixture();
        let quota = UserQuota {
            max_sandboxes: 3,
            ..REG
        };
        for s in ["s1", "s2", "s3"] {
            f.manager.ensure_available(s, Some("u1"), &quota).await.unwrap();
            f.clock.advance_secs(5);
        }
        // s1 becomes the most recent, leaving s2 oldest.
        f.manager.ensure_available("s1", Some("u1"), &quota).await.unwrap();
        f.manager.ensure_available("s4", Some("u1"), &quota).await.unwrap();

        assert!(f.manager.get_by_session("s2").is_none());
        assert!(f.manager.get_by_session("s1").is_some());
        assert_eq!(f.manager.count_user_sandboxes("u1"), 3);
    }

    #[tokio::test]
    async fn test_idle_sweep_then_recreate() {
        let f = fixture();
        let x = f.manager.ensure_available("s1", Some("a1"), &ANON).await.unwrap();
        assert!(x.is_active);

        f.clock.advance_secs(1801);
        assert_eq!(f.manager.session_state("s1"), Some(SessionState::Idle));
        let report = f.manager.sweep_expired().await;
        assert_eq!(report.examined, 1);
        assert_eq!(
            report.evicted,
            vec![("s1".to_string(), CleanupReason::IdleTimeout)]
        );

        let y = f.manager.ensure_available("s1", Some("a1"), &ANON).await.unwrap();
        assert_ne!(x.sandbox_id, y.sandbox_id);
        assert!(y.is_recreated);
        assert!(y
            .recreation_message
            .as_deref()
            .is_some_and(|m| m.contains("idle timeout")));
        assert_eq!(f.manager.metrics().recreated, 1);
    }

    #[tokio::test]
    async fn test_idle_sandbox_is_revived_before_sweep() {
        let f = fixture();
        let x = f.manager.ensure_available("s1", Some("a1"), &ANON).await.unwrap();
        f.clock.advance_secs(2000);
        let y = f.manager.ensure_available("s1", Some("a1"), &ANON).await.unwrap();
        assert_eq!(x.sandbox_id, y.sandbox_id);
        assert_eq!(f.manager.session_state("s1"), Some(SessionState::Active));
        assert!(f.manager.sweep_expired().await.evicted.is_empty());
    }

    #[tokio::test]
    async fn test_max_duration_applies_on_access() {
        let f = fixture();
        let x = f.manager.ensure_available("s1", Some("a1"), &ANON).await.unwrap();
        for _ in 0..7 {
            f.clock.advance_secs(1000);
            f.manager.ensure_available("s1", Some("a1"), &ANON).await.unwrap();
        }
        f.clock.advance_secs(200);
        let y = f.manager.ensure_available("s1", Some("a1"), &ANON).await.unwrap();

        assert_ne!(x.sandbox_id, y.sandbox_id);
        assert!(y
            .recreation_message
            .as_deref()
            .is_some_and(|m| m.contains("maximum duration exceeded")));
    }

    #[tokio::test]
    async fn test_sweep_reports_max_duration_first() {
        let f = fixture();
        f.manager.ensure_available("s1", Some("a1"), &ANON).await.unwrap();
        // Both limits are past; lifetime wins.
        f.clock.advance_secs(7200);
        let report = f.manager.sweep_expired().await;
        assert_eq!(
            report.evicted,
            vec![("s1".to_string(), CleanupReason::MaxDurationExceeded)]
        );
        assert_eq!(f.manager.metrics().evicted_max_duration, 1);
    }

    #[tokio::test]
    async fn test_sweep_skips_locked_session() {
        let f = fixture();
        f.manager.ensure_available("s1", Some("a1"), &ANON).await.unwrap();
        f.clock.advance_secs(1801);

        let lock = f.manager.inner.session_lock("s1");
        let guard = lock.lock().await;
        let report = f.manager.sweep_expired().await;
        assert_eq!(report.skipped_busy, 1);
        assert!(report.evicted.is_empty());
        drop(guard);

        assert_eq!(f.manager.sweep_expired().await.evicted.len(), 1);
    }

    #[tokio::test]
    async fn test_snapshot_written_and_consumed() {
        let f = fixture();
        let handle = f.manager.acquire("s1", Some("a1"), &ANON).await.unwrap();
        handle.execute(&cmd("pip install numpy pandas")).await.unwrap();
        handle.execute(&cmd("echo hi > notes.txt")).await.unwrap();

        f.clock.advance_secs(1801);
        f.manager.sweep_expired().await;
        let snapshot = f.store.peek("s1").await.unwrap().unwrap();
        assert_eq!(snapshot.cleanup_reason, CleanupReason::IdleTimeout);
        assert_eq!(snapshot.installed_packages.len(), 2);

        let info = f.manager.ensure_available("s1", Some("a1"), &ANON).await.unwrap();
        let message = info.recreation_message.unwrap();
        assert!(message.contains("2 packages and 1 file"));
        assert!(message.contains("numpy, pandas"));
        assert!(f.store.peek("s1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_provisioning_retries_once() {
        let f = fixture();
        f.factory.fail_next(1);
        f.manager.ensure_available("s1", Some("u1"), &REG).await.unwrap();
        assert_eq!(f.factory.attempt_count(), 2);
        assert_eq!(f.manager.metrics().provision_failures, 1);
    }

    #[tokio::test]
    async fn test_provisioning_gives_up_after_retry() {
        let f = fixture();
        f.factory.fail_next(2);
        let err = f
            .manager
            .ensure_available("s1", Some("u1"), &REG)
            .await
            .unwrap_err();
        assert!(err.is_resource_exhausted());
        assert_eq!(f.factory.attempt_count(), 2);
        assert_eq!(f.manager.session_state("s1"), None);
        assert_eq!(f.manager.count_user_sandboxes("u1"), 0);

        // The failed session did not use up a session slot.
        f.manager.ensure_available("s1", Some("u1"), &REG).await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_recreation_keeps_terminated_state() {
        let f = fixture();
        f.manager.ensure_available("s1", Some("a1"), &ANON).await.unwrap();
        f.clock.advance_secs(1801);
        f.manager.sweep_expired().await;

        f.factory.fail_next(2);
        assert!(f.manager.ensure_available("s1", Some("a1"), &ANON).await.is_err());
        assert_eq!(f.manager.session_state("s1"), Some(SessionState::Terminated));
        assert_eq!(
            f.manager.termination_reason("s1"),
            Some(CleanupReason::IdleTimeout)
        );
    }

    #[tokio::test]
    async fn test_remote_mode_is_not_implemented() {
        let mut config = Config::default();
        config.execution.mode = ExecutionMode::Remote;
        let manager = SessionManager::from_config(&config).unwrap();
        let err = manager
            .ensure_available("s1", Some("u1"), &REG)
            .await
            .unwrap_err();
        assert!(matches!(err, LifecycleError::NotImplemented { .. }));
        assert_eq!(manager.session_state("s1"), None);
    }

    #[tokio::test]
    async fn test_concurrent_calls_for_one_session_provision_once() {
        let f = fixture_with(MockSessionExecutorFactory::new().with_delay(Duration::from_millis(20)));
        let calls = (0..10).map(|_| f.manager.ensure_available("s1", Some("u1"), &REG));
        let results = join_all(calls).await;

        let ids: HashSet<String> = results
            .into_iter()
            .map(|r| r.unwrap().sandbox_id)
            .collect();
        assert_eq!(ids.len(), 1);
        assert_eq!(f.factory.creation_count(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_sessions_respect_sandbox_quota() {
        let f = fixture_with(MockSessionExecutorFactory::new().with_delay(Duration::from_millis(10)));
        let quota = UserQuota {
            max_sandboxes: 2,
            ..REG
        };
        let sessions: Vec<String> = (0..8).map(|i| format!("s{i}")).collect();
        let calls = sessions
            .iter()
            .map(|s| f.manager.ensure_available(s, Some("u1"), &quota));
        let results = join_all(calls).await;

        assert!(results.iter().any(Result::is_ok));
        for err in results.iter().filter_map(|r| r.as_ref().err()) {
            assert!(err.is_resource_exhausted());
        }
        assert!(f.manager.count_user_sandboxes("u1") <= 2);
    }

    #[tokio::test]
    async fn test_unhealthy_sandbox_is_replaced() {
        let f = fixture();
        let x = f.manager.ensure_available("s1", Some("u1"), &REG).await.unwrap();
        f.factory.created_for("s1")[0].set_healthy(false);

        let y = f.manager.ensure_available("s1", Some("u1"), &REG).await.unwrap();
        assert_ne!(x.sandbox_id, y.sandbox_id);
        assert!(y
            .recreation_message
            .as_deref()
            .is_some_and(|m| m.contains("container lost")));
        assert_eq!(f.manager.metrics().evicted_lost, 1);
    }

    #[tokio::test]
    async fn test_cleanup_is_idempotent() {
        let f = fixture();
        f.manager.ensure_available("s1", Some("u1"), &REG).await.unwrap();
        assert!(f.manager.cleanup_by_session("s1").await);
        assert!(!f.manager.cleanup_by_session("s1").await);
        assert_eq!(f.factory.created_for("s1")[0].termination_count(), 1);
        assert_eq!(f.manager.session_state("s1"), None);
        assert!(f.manager.inner.session_locks.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cleanup_tolerates_dead_container() {
        let f = fixture();
        f.manager.ensure_available("s1", Some("u1"), &REG).await.unwrap();
        f.factory.created_for("s1")[0].set_fail_terminate(true);
        assert!(f.manager.cleanup_by_session("s1").await);
        assert_eq!(f.manager.count_user_sandboxes("u1"), 0);
    }

    #[tokio::test]
    async fn test_handle_tracks_environment() {
        let f = fixture();
        let handle = f.manager.acquire("s1", Some("u1"), &REG).await.unwrap();
        f.clock.advance_secs(30);
        handle
            .execute(&cmd("pip install requests && export MODE=fast"))
            .await
            .unwrap();

        let info = handle.info();
        assert!(info.installed_packages.contains("requests"));
        assert_eq!(info.environment_variables.get("MODE").map(String::as_str), Some("fast"));
        assert_eq!(info.last_activity, f.clock.now());
        assert_eq!(f.manager.metrics().executions, 1);
    }

    #[tokio::test]
    async fn test_failed_payload_is_not_tracked_or_retried() {
        let f = fixture_with(
            MockSessionExecutorFactory::new()
                .with_responses(vec![MockResponse::Exit(1, "no such package".to_string())]),
        );
        let result = f
            .manager
            .execute("s1", Some("u1"), &REG, &cmd("pip install nope"))
            .await
            .unwrap();
        assert_eq!(result.exit_code, 1);
        assert_eq!(f.factory.creation_count(), 1);
        assert!(f.manager.get_by_session("s1").unwrap().installed_packages.is_empty());
    }

    #[tokio::test]
    async fn test_timeout_keeps_sandbox() {
        let f = fixture_with(
            MockSessionExecutorFactory::new().with_responses(vec![MockResponse::Timeout]),
        );
        let result = f
            .manager
            .execute("s1", Some("u1"), &REG, &cmd("sleep 999"))
            .await
            .unwrap();
        assert!(result.timed_out);
        assert!(f.manager.get_by_session("s1").is_some());
        assert_eq!(f.manager.metrics().execution_timeouts, 1);
    }

    #[tokio::test]
    async fn test_executor_failure_replaces_sandbox_once() {
        let f = fixture_with(
            MockSessionExecutorFactory::new()
                .with_responses(vec![MockResponse::Error("exec failed".to_string())]),
        );
        let err = f
            .manager
            .execute("s1", Some("u1"), &REG, &cmd("ls"))
            .await
            .unwrap_err();
        assert!(matches!(err, LifecycleError::Execution(_)));
        assert_eq!(f.factory.creation_count(), 2);
        assert_eq!(f.factory.created_for("s1")[0].termination_count(), 1);
    }

    #[tokio::test]
    async fn test_handle_fails_after_eviction() {
        let f = fixture();
        let handle = f.manager.acquire("s1", Some("a1"), &ANON).await.unwrap();
        f.manager.ensure_available("s2", Some("a1"), &ANON).await.unwrap();

        let err = handle.execute(&cmd("ls")).await.unwrap_err();
        assert!(matches!(err, LifecycleError::Execution(ref e) if e.is_terminated()));

        // Going through the manager recreates it.
        let result = f
            .manager
            .execute("s1", Some("a1"), &ANON, &cmd("ls"))
            .await
            .unwrap();
        assert_eq!(result.stdout, "ls");
    }

    #[tokio::test]
    async fn test_shutdown_terminates_everything() {
        let f = fixture();
        f.manager.ensure_available("s1", Some("u1"), &REG).await.unwrap();
        f.manager.ensure_available("s2", Some("u2"), &REG).await.unwrap();
        f.manager.ensure_available("s3", None, &ANON).await.unwrap();

        assert_eq!(f.manager.shutdown().await, 3);
        assert_eq!(f.manager.count_user_sandboxes("u1"), 0);
        assert_eq!(f.manager.metrics().cleaned_up, 3);
    }

    #[tokio::test]
    async fn test_background_sweeper_evicts() {
        let f = fixture();
        f.manager.ensure_available("s1", Some("a1"), &ANON).await.unwrap();
        f.clock.advance_secs(1801);

        let sweeper = f.manager.spawn_sweeper(Duration::from_millis(10));
        let mut evicted = false;
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            if f.manager.get_by_session("s1").is_none() {
                evicted = true;
                break;
            }
        }
        sweeper.shutdown().await;
        assert!(evicted);
        assert_eq!(f.manager.metrics().evicted_idle, 1);
    }

    #[tokio::test]
    async fn test_configured_sweeper_uses_settings_interval() {
        let clock = Arc::new(ManualClock::default());
        let manager = SessionManager::builder(Arc::new(MockSessionExecutorFactory::new()))
            .clock(clock.clone())
            .settings(ManagerSettings {
                sweep_interval: Duration::from_millis(10),
                ..ManagerSettings::default()
            })
            .build();
        manager.ensure_available("s1", Some("a1"), &ANON).await.unwrap();
        clock.advance_secs(1801);

        let sweeper = manager.spawn_configured_sweeper();
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            if manager.get_by_session("s1").is_none() {
                break;
            }
        }
        sweeper.shutdown().await;
        assert_eq!(
            manager.termination_reason("s1"),
            Some(CleanupReason::IdleTimeout)
        );
    }

    #[test]
    fn test_from_config_rejects_invalid_config() {
        let mut config = Config::default();
        config.timeouts.exec_timeout_secs = 0;
        let err = SessionManager::from_config(&config).unwrap_err();
        assert!(matches!(err, LifecycleError::Config { .. }));
        assert!(err.to_string().contains("exec_timeout_secs"));
    }

    #[test]
    fn test_from_config_takes_timeouts() {
        let mut config = Config::default();
        config.timeouts.exec_timeout_secs = 12;
        config.timeouts.sweep_interval_secs = 30;
        let manager = SessionManager::from_config(&config).unwrap();
        assert_eq!(manager.inner.settings.exec_timeout, Duration::from_secs(12));
        assert_eq!(manager.inner.settings.sweep_interval, Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_handle_for_live_session_only() {
        let f = fixture();
        let err = f.manager.handle("s1").unwrap_err();
        assert!(matches!(err, LifecycleError::NotFound { .. }));

        let info = f.manager.ensure_available("s1", Some("u1"), &REG).await.unwrap();
        f.clock.advance_secs(30);
        let handle = f.manager.handle("s1").unwrap();
        assert_eq!(handle.info().sandbox_id, info.sandbox_id);
        assert_eq!(handle.info().last_activity, info.last_activity);

        f.manager.cleanup_by_session("s1").await;
        assert!(f.manager.handle("s1").is_err());
    }

    // -------------------------------------------------------------------------
    // Cancellation and snapshot retention
    // -------------------------------------------------------------------------

    /// Memory store whose reads are slow, to hold provisioning mid-flight.
    struct SlowReadStore {
        states: InMemoryStateStore,
        delay: Duration,
    }

    #[async_trait::async_trait]
    impl SandboxStateStore for SlowReadStore {
        async fn save(&self, state: SandboxState) -> anyhow::Result<()> {
            self.states.save(state).await
        }

        async fn take(&self, session_id: &str) -> anyhow::Result<Option<SandboxState>> {
            tokio::time::sleep(self.delay).await;
            self.states.take(session_id).await
        }

        async fn peek(&self, session_id: &str) -> anyhow::Result<Option<SandboxState>> {
            tokio::time::sleep(self.delay).await;
            self.states.peek(session_id).await
        }
    }

    #[tokio::test]
    async fn test_abandoned_provisioning_terminates_sandbox_and_keeps_snapshot() {
        let factory = Arc::new(MockSessionExecutorFactory::new());
        let store = Arc::new(SlowReadStore {
            states: InMemoryStateStore::new(),
            delay: Duration::from_millis(200),
        });
        let manager = SessionManager::builder(factory.clone())
            .store(store.clone())
            .build();
        let mut earlier = SandboxInfo::new("old", "s1", Some("u1".to_string()), Utc::now());
        earlier.installed_packages.insert("numpy".to_string());
        store
            .states
            .save(SandboxState::capture(&earlier, CleanupReason::IdleTimeout, Utc::now()))
            .await
            .unwrap();

        let cut_short = tokio::time::timeout(
            Duration::from_millis(50),
            manager.ensure_available("s1", Some("u1"), &REG),
        )
        .await;
        assert!(cut_short.is_err());
        assert!(manager.get_by_session("s1").is_none());
        assert_eq!(manager.session_state("s1"), None);
        assert_eq!(manager.count_user_sandboxes("u1"), 0);

        let abandoned = factory.created_for("s1").remove(0);
        for _ in 0..50 {
            if abandoned.termination_count() > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(abandoned.termination_count(), 1);
        assert!(store.states.peek("s1").await.unwrap().is_some());

        let info = manager.ensure_available("s1", Some("u1"), &REG).await.unwrap();
        assert!(info.is_recreated);
        assert!(info.recreation_message.unwrap().contains("numpy"));
        assert!(store.states.is_empty());
    }

    #[tokio::test]
    async fn test_cleanup_discards_snapshots() {
        let f = fixture();
        for i in 0..10 {
            let session = format!("s{i}");
            let handle = f.manager.acquire(&session, Some("u1"), &REG).await.unwrap();
            handle.execute(&cmd("pip install flask")).await.unwrap();
            assert!(f.manager.cleanup_by_session(&session).await);
        }
        assert!(f.store.is_empty());
        assert_eq!(f.manager.metrics().cleaned_up, 10);
    }

    #[tokio::test]
    async fn test_cleanup_of_evicted_session_drops_its_snapshot() {
        let f = fixture();
        f.manager.ensure_available("s1", Some("a1"), &ANON).await.unwrap();
        f.clock.advance_secs(1801);
        f.manager.sweep_expired().await;
        assert_eq!(f.store.len(), 1);

        assert!(!f.manager.cleanup_by_session("s1").await);
        assert!(f.store.is_empty());
        assert_eq!(f.manager.session_state("s1"), None);
    }

    #[tokio::test]
    async fn test_cancelled_execute_is_interrupted_before_next_call() {
        let f = fixture_with(
            MockSessionExecutorFactory::new().with_execution_delay(Duration::from_millis(300)),
        );
        let handle = f.manager.acquire("s1", Some("u1"), &REG).await.unwrap();

        let cut_short =
            tokio::time::timeout(Duration::from_millis(30), handle.execute(&cmd("sleep 10"))).await;
        assert!(cut_short.is_err());

        let next = handle.execute(&cmd("echo next")).await.unwrap();
        assert_eq!(next.stdout, "echo next");

        let executor = &f.factory.created_for("s1")[0];
        assert_eq!(executor.interrupt_count(), 1);
        assert_eq!(executor.execution_count(), 2);
        assert!(f.manager.get_by_session("s1").is_some());
    }

    #[tokio::test]
    async fn test_completed_execute_is_not_interrupted() {
        let f = fixture();
        let handle = f.manager.acquire("s1", Some("u1"), &REG).await.unwrap();
        handle.execute(&cmd("true")).await.unwrap();
        assert_eq!(f.factory.created_for("s1")[0].interrupt_count(), 0);
    }
}
