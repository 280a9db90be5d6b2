//! Durable storage for termination snapshots, keyed by session id.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use super::state::SandboxState;

/// Where [`SandboxState`] snapshots live between a sandbox's death and the
/// session's next sandbox.
#[async_trait]
pub trait SandboxStateStore: Send + Sync {
    /// Stores `state`, replacing any earlier snapshot for the same session.
    async fn save(&self, state: SandboxState) -> Result<()>;

    /// Removes and returns the snapshot for `session_id`.
    async fn take(&self, session_id: &str) -> Result<Option<SandboxState>>;

    /// Returns the snapshot for `session_id` without removing it.
    async fn peek(&self, session_id: &str) -> Result<Option<SandboxState>>;

    /// Deletes the snapshot for `session_id`. True if there was one.
    async fn remove(&self, session_id: &str) -> Result<bool> {
        Ok(self.take(session_id).await?.is_some())
    }
}

/// Process-local store. Snapshots are lost on restart.
#[derive(Debug, Default)]
pub struct InMemoryStateStore {
    states: Mutex<HashMap<String, SandboxState>>,
}

impl InMemoryStateStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of snapshots held.
    pub fn len(&self) -> usize {
        self.states
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// True when no snapshots are held.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl SandboxStateStore for InMemoryStateStore {
    async fn save(&self, state: SandboxState) -> Result<()> {
        self.states
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(state.session_id.clone(), state);
        Ok(())
    }

    async fn take(&self, session_id: &str) -> Result<Option<SandboxState>> {
        Ok(self
            .states
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(session_id))
    }

    async fn peek(&self, session_id: &str) -> Result<Option<SandboxState>> {
        Ok(self
            .states
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(session_id)
            .cloned())
    }
}

/// One TOML file per session inside a directory. Survives restarts.
#[derive(Debug, Clone)]
pub struct FileStateStore {
    dir: PathBuf,
}

impl FileStateStore {
    /// Uses `dir`, creating it on first save.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Directory holding the snapshot files.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, session_id: &str) -> PathBuf {
        // Hex keeps arbitrary session ids filesystem-safe and collision-free.
        let encoded: String = session_id.bytes().map(|b| format!("{b:02x}")).collect();
        self.dir.join(format!("{encoded}.toml"))
    }

    async fn read(path: &Path) -> Result<Option<SandboxState>> {
        let content = match tokio::fs::read_to_string(path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("Failed to read state file: {}", path.display()))
            }
        };

        let state: SandboxState = toml::from_str(&content)
            .with_context(|| format!("Failed to parse state file: {}", path.display()))?;
        Ok(Some(state))
    }
}

#[async_trait]
impl SandboxStateStore for FileStateStore {
    async fn save(&self, state: SandboxState) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("Failed to create directory: {}", self.dir.display()))?;

        let path = self.path_for(&state.session_id);
        let content = toml::to_string_pretty(&state).context("Failed to serialize state")?;

        // Write then rename so a reader never sees half a file.
        let tmp = path.with_extension("toml.tmp");
        tokio::fs::write(&tmp, content)
            .await
            .with_context(|| format!("Failed to write state file: {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("Failed to move state file into place: {}", path.display()))?;

        Ok(())
    }

    async fn take(&self, session_id: &str) -> Result<Option<SandboxState>> {
        let path = self.path_for(session_id);
        let state = Self::read(&path).await?;
        if state.is_some() {
            tokio::fs::remove_file(&path)
                .await
                .with_context(|| format!("Failed to delete state file: {}", path.display()))?;
        }
        Ok(state)
    }

    async fn peek(&self, session_id: &str) -> Result<Option<SandboxState>> {
        Self::read(&self.path_for(session_id)).await
    }

    async fn remove(&self, session_id: &str) -> Result<bool> {
        let path = self.path_for(session_id);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => {
                Err(e).with_context(|| format!("Failed to delete state file: {}", path.display()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::state::{CleanupReason, SandboxInfo};
    use chrono::Utc;
    use tempfile::tempdir;

    fn snapshot(session: &str, reason: CleanupReason) -> SandboxState {
        let mut info = SandboxInfo::new("sbx", session, None, Utc::now());
        info.installed_packages.insert("numpy".to_string());
        info.created_files.insert("out.csv".to_string());
        info.environment_variables
            .insert("MODE".to_string(), "fast".to_string());
        SandboxState::capture(&info, reason, Utc::now())
    }

    #[tokio::test]
    async fn test_memory_take_reads_once() {
        let store = InMemoryStateStore::new();
        store
            .save(snapshot("s1", CleanupReason::IdleTimeout))
            .await
            .unwrap();
        assert_eq!(store.len(), 1);

        assert!(store.peek("s1").await.unwrap().is_some());
        assert!(store.take("s1").await.unwrap().is_some());
        assert!(store.take("s1").await.unwrap().is_none());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_memory_later_snapshot_supersedes() {
        let store = InMemoryStateStore::new();
        store
            .save(snapshot("s1", CleanupReason::IdleTimeout))
            .await
            .unwrap();
        store
            .save(snapshot("s1", CleanupReason::QuotaExceeded))
            .await
            .unwrap();
        let state = store.take("s1").await.unwrap().unwrap();
        assert_eq!(state.cleanup_reason, CleanupReason::QuotaExceeded);
    }

    #[tokio::test]
    async fn test_file_store_persists_snapshot() {
        let dir = tempdir().unwrap();
        let store = FileStateStore::new(dir.path().join("states"));
        let original = snapshot("chat/42", CleanupReason::MaxDurationExceeded);
        store.save(original.clone()).await.unwrap();

        // A second store over the same directory sees it, as after a restart.
        let reopened = FileStateStore::new(dir.path().join("states"));
        let loaded = reopened.peek("chat/42").await.unwrap().unwrap();
        assert_eq!(loaded, original);

        assert!(reopened.take("chat/42").await.unwrap().is_some());
        assert!(reopened.take("chat/42").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_remove_deletes_snapshot() {
        let memory = InMemoryStateStore::new();
        memory
            .save(snapshot("s1", CleanupReason::IdleTimeout))
            .await
            .unwrap();
        assert!(memory.remove("s1").await.unwrap());
        assert!(!memory.remove("s1").await.unwrap());
        assert!(memory.is_empty());

        let dir = tempdir().unwrap();
        let files = FileStateStore::new(dir.path());
        files
            .save(snapshot("s1", CleanupReason::IdleTimeout))
            .await
            .unwrap();
        assert!(files.remove("s1").await.unwrap());
        assert!(!files.remove("s1").await.unwrap());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_file_store_missing_session() {
        let dir = tempdir().unwrap();
        let store = FileStateStore::new(dir.path());
        assert!(store.peek("nope").await.unwrap().is_none());
        assert!(store.take("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_file_store_reports_corrupt_file() {
        let dir = tempdir().unwrap();
        let store = FileStateStore::new(dir.path());
        std::fs::write(store.path_for("s1"), "not = [valid").unwrap();
        let err = store.peek("s1").await.unwrap_err();
        assert!(format!("{err:#}").contains("Failed to parse state file"));
    }
}
