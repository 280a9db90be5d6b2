//! Configuration for sandbox execution.
//!
//! Loaded from `sandbox.toml`. Every field has a default so a missing file or
//! a partial file is always valid.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Default configuration file name.
pub const CONFIG_FILE: &str = "sandbox.toml";

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Execution mode and working directory.
    #[serde(default)]
    pub execution: ExecutionConfig,
    /// Docker images, workspace mounts, network and resources.
    #[serde(default)]
    pub docker: DockerConfig,
    /// Execution and lifecycle timeouts.
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    /// Log output settings.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Where sandboxed code runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    /// Plain subprocess on the host. Development only.
    Local,
    /// Docker containers.
    #[default]
    Docker,
    /// Remote execution service. Not implemented.
    Remote,
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local => write!(f, "local"),
            Self::Docker => write!(f, "docker"),
            Self::Remote => write!(f, "remote"),
        }
    }
}

impl FromStr for ExecutionMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "docker" => Ok(Self::Docker),
            "remote" => Ok(Self::Remote),
            _ => anyhow::bail!("Unknown execution mode: '{s}'. Supported: local, docker, remote"),
        }
    }
}

/// Execution mode selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Which executor backend to use.
    #[serde(default)]
    pub mode: ExecutionMode,

    /// Keep one container per session instead of one per call (docker mode).
    #[serde(default = "default_true")]
    pub session_enabled: bool,

    /// Working directory for the local executor.
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            mode: ExecutionMode::default(),
            session_enabled: true,
            work_dir: default_work_dir(),
        }
    }
}

/// Docker executor settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DockerConfig {
    /// Image used for session containers.
    #[serde(default = "default_image")]
    pub image: String,

    /// Image used by the stateless executor for code payloads.
    #[serde(default = "default_image")]
    pub python_image: String,

    /// Image used by the stateless executor for shell commands.
    #[serde(default = "default_shell_image")]
    pub shell_image: String,

    /// Host directory holding per-session workspaces (`~/` is expanded).
    #[serde(default = "default_workspace_path")]
    pub workspace_path: String,

    /// Mount point of the workspace inside the container.
    #[serde(default = "default_container_workspace")]
    pub container_workspace: String,

    /// Network configuration
    #[serde(default)]
    pub network: NetworkPolicy,

    /// Resource limits
    #[serde(default)]
    pub resources: ResourceConfig,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            image: default_image(),
            python_image: default_image(),
            shell_image: default_shell_image(),
            workspace_path: default_workspace_path(),
            container_workspace: default_container_workspace(),
            network: NetworkPolicy::default(),
            resources: ResourceConfig::default(),
        }
    }
}

impl DockerConfig {
    /// Host workspace root with `~/` expanded.
    pub fn workspace_root(&self) -> Result<PathBuf> {
        expand_path(&self.workspace_path).map(PathBuf::from)
    }
}

/// Network access for sandbox containers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NetworkPolicy {
    /// Default bridge network.
    #[default]
    AllowAll,
    /// No network at all.
    Deny,
}

impl fmt::Display for NetworkPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AllowAll => write!(f, "allow-all"),
            Self::Deny => write!(f, "deny"),
        }
    }
}

/// Container resource limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceConfig {
    /// Memory limit (e.g., "512m")
    #[serde(default = "default_memory")]
    pub memory: String,

    /// CPU limit (e.g., "1")
    #[serde(default = "default_cpus")]
    pub cpus: String,
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            memory: default_memory(),
            cpus: default_cpus(),
        }
    }
}

impl ResourceConfig {
    /// Memory limit in bytes.
    pub fn memory_bytes(&self) -> Result<i64> {
        parse_memory_limit(&self.memory)
    }

    /// CPU limit in nano-CPUs as Docker expects.
    #[allow(clippy::cast_possible_truncation)]
    pub fn nano_cpus(&self) -> Result<i64> {
        let cpus: f64 = self
            .cpus
            .parse()
            .with_context(|| format!("Invalid CPU limit: {}", self.cpus))?;
        if !cpus.is_finite() || cpus <= 0.0 {
            anyhow::bail!("Invalid CPU limit: {}", self.cpus);
        }
        Ok((cpus * 1_000_000_000.0) as i64)
    }
}

/// Timeouts, in seconds unless stated otherwise.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// Hard limit for a single execute call.
    #[serde(default = "default_exec_timeout")]
    pub exec_timeout_secs: u64,

    /// Idle limit for session containers built by `ExecutorFactory`.
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,

    /// Interval of the background eviction sweep.
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    /// Pause before the single provisioning retry, in milliseconds.
    #[serde(default = "default_retry_backoff")]
    pub provision_retry_backoff_ms: u64,

    /// Grace period given to a container on stop.
    #[serde(default = "default_stop_grace")]
    pub stop_grace_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            exec_timeout_secs: default_exec_timeout(),
            idle_timeout_secs: default_idle_timeout(),
            sweep_interval_secs: default_sweep_interval(),
            provision_retry_backoff_ms: default_retry_backoff(),
            stop_grace_secs: default_stop_grace(),
        }
    }
}

impl TimeoutConfig {
    /// Hard limit for a single execute call.
    pub fn exec_timeout(&self) -> Duration {
        Duration::from_secs(self.exec_timeout_secs)
    }

    /// Interval of the background eviction sweep.
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }

    /// Pause before the provisioning retry.
    pub fn provision_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.provision_retry_backoff_ms)
    }

    /// Time a session container gets to exit before it is killed.
    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_secs)
    }
}

/// Log output settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Enable debug level for this crate.
    #[serde(default)]
    pub verbose: bool,

    /// Emit JSON lines instead of human readable text.
    #[serde(default)]
    pub json: bool,

    /// Also write daily-rotated log files into this directory.
    #[serde(default)]
    pub directory: Option<PathBuf>,
}

// Default value functions
fn default_true() -> bool {
    true
}

fn default_work_dir() -> PathBuf {
    std::env::temp_dir().join("session-sandbox")
}

fn default_image() -> String {
    "python:3.11-slim".to_string()
}

fn default_shell_image() -> String {
    "alpine:3.19".to_string()
}

fn default_workspace_path() -> String {
    default_work_dir().join("workspaces").display().to_string()
}

fn default_container_workspace() -> String {
    "/workspace".to_string()
}

fn default_memory() -> String {
    "512m".to_string()
}

fn default_cpus() -> String {
    "1".to_string()
}

fn default_exec_timeout() -> u64 {
    60
}

fn default_idle_timeout() -> u64 {
    1800
}

fn default_sweep_interval() -> u64 {
    60
}

fn default_retry_backoff() -> u64 {
    500
}

fn default_stop_grace() -> u64 {
    5
}

impl Config {
    /// Load configuration from `dir/sandbox.toml`, using defaults if not found
    pub fn load(dir: &Path) -> Result<Self> {
        let config_path = dir.join(CONFIG_FILE);

        if !config_path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        Self::from_toml_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))
    }

    /// Parse configuration from TOML text.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would make every sandbox unusable.
    pub fn validate(&self) -> Result<()> {
        if self.timeouts.exec_timeout_secs == 0 {
            anyhow::bail!("timeouts.exec_timeout_secs must be greater than zero");
        }
        if !self.docker.container_workspace.starts_with('/') {
            anyhow::bail!(
                "docker.container_workspace must be an absolute path, got '{}'",
                self.docker.container_workspace
            );
        }
        self.docker.resources.memory_bytes()?;
        self.docker.resources.nano_cpus()?;
        Ok(())
    }
}

/// Expand ~ to home directory
pub(crate) fn expand_path(path: &str) -> Result<String> {
    if let Some(rest) = path.strip_prefix("~/") {
        let home = dirs::home_dir().context("Could not determine home directory")?;
        Ok(home.join(rest).display().to_string())
    } else {
        Ok(path.to_string())
    }
}

/// Parse memory limit string (e.g., "8g", "512m") to bytes
pub(crate) fn parse_memory_limit(limit: &str) -> Result<i64> {
    let limit = limit.trim().to_lowercase();

    if let Some(num) = limit.strip_suffix('g') {
        let gigs: i64 = num.parse().context("Invalid memory limit")?;
        Ok(gigs * 1024 * 1024 * 1024)
    } else if let Some(num) = limit.strip_suffix('m') {
        let megs: i64 = num.parse().context("Invalid memory limit")?;
        Ok(megs * 1024 * 1024)
    } else {
        limit.parse().context("Invalid memory limit")
    }
}
