//! Thin helpers over bollard shared by the Docker executors.

use bollard::container::{
    Config as ContainerConfig, CreateContainerOptions, InspectContainerOptions,
    ListContainersOptions, LogOutput, RemoveContainerOptions, StopContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::image::CreateImageOptions;
use bollard::service::HostConfig;
use bollard::Docker;
use futures_util::StreamExt;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::{ExecutionError, ExecutionResult, TIMEOUT_EXIT_CODE};
use crate::config::{DockerConfig, NetworkPolicy};

/// Label put on every container this crate creates.
pub(crate) const MANAGED_LABEL: &str = "session-sandbox.managed";
/// Label carrying the owning session id.
pub(crate) const SESSION_LABEL: &str = "session-sandbox.session";

/// Extra host-side slack on top of the in-container `timeout`.
const EXEC_GRACE: Duration = Duration::from_secs(2);

/// Runs the command (`$@`) in the background, records its pid in the file
/// named by `$0`, and waits for it. The pid file is gone once the exec ends.
const EXEC_WRAPPER: &str =
    r#""$@" & pid=$!; echo "$pid" > "$0"; wait "$pid"; rc=$?; rm -f "$0"; exit "$rc""#;

/// Kills the process recorded in the pid file `$0`. GNU `timeout` leads its
/// own process group, so the group goes first; busybox falls back to the pid.
const KILL_SCRIPT: &str = r#"pid=$(cat "$0" 2>/dev/null) || exit 0; kill -s KILL -- "-$pid" 2>/dev/null; kill -s KILL "$pid" 2>/dev/null; rm -f "$0""#;

/// Connects to the local daemon and checks it answers.
pub(crate) async fn connect() -> Result<Docker, ExecutionError> {
    let docker = Docker::connect_with_local_defaults().map_err(|e| {
        ExecutionError::docker_unavailable(format!("Failed to connect to Docker: {e}"))
    })?;

    docker.ping().await.map_err(|e| {
        ExecutionError::docker_unavailable(format!("Cannot ping Docker daemon: {e}"))
    })?;

    Ok(docker)
}

/// Pulls `image` unless it is already present.
pub(crate) async fn ensure_image(docker: &Docker, image: &str) -> Result<(), ExecutionError> {
    if docker.inspect_image(image).await.is_ok() {
        return Ok(());
    }

    info!("Pulling Docker image: {}", image);
    let mut stream = docker.create_image(
        Some(CreateImageOptions {
            from_image: image,
            ..Default::default()
        }),
        None,
        None,
    );

    while let Some(chunk) = stream.next().await {
        match chunk {
            Ok(output) => {
                if let Some(error) = output.error {
                    warn!("Docker pull error for {}: {}", image, error);
                    return Err(ExecutionError::image_not_found(image));
                }
            }
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => return Err(ExecutionError::image_not_found(image)),
            Err(e) => return Err(e.into()),
        }
    }

    Ok(())
}

/// Host configuration with resource limits, network policy and binds applied.
pub(crate) fn host_config(
    docker_config: &DockerConfig,
    binds: Vec<String>,
) -> Result<HostConfig, ExecutionError> {
    let resources = &docker_config.resources;
    let memory = resources
        .memory_bytes()
        .map_err(|e| ExecutionError::container_failed(format!("{e:#}")))?;
    let nano_cpus = resources
        .nano_cpus()
        .map_err(|e| ExecutionError::container_failed(format!("{e:#}")))?;

    let mut host_config = HostConfig {
        binds: (!binds.is_empty()).then_some(binds),
        memory: Some(memory),
        nano_cpus: Some(nano_cpus),
        // An init process so the keep-alive `sleep` honours SIGTERM on stop.
        init: Some(true),
        ..Default::default()
    };

    if docker_config.network == NetworkPolicy::Deny {
        host_config.network_mode = Some("none".to_string());
    }

    Ok(host_config)
}

/// A container that sleeps so commands can be exec'd into it.
pub(crate) fn idle_container_config(
    image: &str,
    working_dir: &str,
    keep_alive: Duration,
    session_id: Option<&str>,
    host_config: HostConfig,
) -> ContainerConfig<String> {
    let mut labels = HashMap::from([(MANAGED_LABEL.to_string(), "true".to_string())]);
    if let Some(session_id) = session_id {
        labels.insert(SESSION_LABEL.to_string(), session_id.to_string());
    }

    ContainerConfig {
        image: Some(image.to_string()),
        cmd: Some(vec![
            "sleep".to_string(),
            keep_alive.as_secs().max(1).to_string(),
        ]),
        working_dir: Some(working_dir.to_string()),
        labels: Some(labels),
        host_config: Some(host_config),
        ..Default::default()
    }
}

/// Creates and starts a named container, returning its id.
pub(crate) async fn create_and_start(
    docker: &Docker,
    name: &str,
    config: ContainerConfig<String>,
) -> Result<String, ExecutionError> {
    debug!("Creating container: {}", name);
    let created = docker
        .create_container(
            Some(CreateContainerOptions {
                name: name.to_string(),
                platform: None,
            }),
            config,
        )
        .await
        .map_err(|e| ExecutionError::container_failed(format!("Failed to create container: {e}")))?;

    debug!("Starting container {}", created.id);
    if let Err(e) = docker.start_container::<String>(&created.id, None).await {
        // Do not leave a created-but-dead container behind.
        let _ = remove(docker, &created.id).await;
        return Err(ExecutionError::container_failed(format!(
            "Failed to start container: {e}"
        )));
    }

    Ok(created.id)
}

/// A fresh in-container path for one exec's pid file.
pub(crate) fn pid_file_path() -> String {
    format!(
        "/tmp/.session-sandbox-exec-{}.pid",
        &uuid::Uuid::new_v4().simple().to_string()[..12]
    )
}

/// Kills an exec's process when dropped before the exec finished, so a
/// cancelled call does not keep running inside the container.
struct KillOnDrop {
    docker: Docker,
    container_id: String,
    pid_file: Option<String>,
}

impl KillOnDrop {
    fn disarm(mut self) {
        self.pid_file = None;
    }
}

impl Drop for KillOnDrop {
    fn drop(&mut self) {
        let Some(pid_file) = self.pid_file.take() else {
            return;
        };
        let docker = self.docker.clone();
        let container_id = std::mem::take(&mut self.container_id);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if let Err(e) = kill_exec(&docker, &container_id, &pid_file).await {
                    warn!("Failed to kill abandoned exec in {}: {}", container_id, e);
                }
            });
        } else {
            warn!("No runtime to kill abandoned exec in {}", container_id);
        }
    }
}

/// Runs `argv` inside a running container, bounded by `timeout`.
///
/// The command is wrapped in `timeout -s KILL` so it dies inside the
/// container on its own, and its pid is written to `pid_file` so
/// [`kill_exec`] can stop it early. Dropping this future kills it too.
pub(crate) async fn exec(
    docker: &Docker,
    container_id: &str,
    argv: Vec<String>,
    working_dir: &str,
    timeout: Duration,
    pid_file: &str,
) -> Result<ExecutionResult, ExecutionError> {
    let mut cmd = vec![
        "sh".to_string(),
        "-c".to_string(),
        EXEC_WRAPPER.to_string(),
        pid_file.to_string(),
        "timeout".to_string(),
        "-s".to_string(),
        "KILL".to_string(),
        timeout.as_secs().max(1).to_string(),
    ];
    cmd.extend(argv);

    let started = Instant::now();
    let exec = docker
        .create_exec(
            container_id,
            CreateExecOptions {
                cmd: Some(cmd),
                working_dir: Some(working_dir.to_string()),
                attach_stdout: Some(true),
                attach_stderr: Some(true),
                ..Default::default()
            },
        )
        .await
        .map_err(|e| ExecutionError::container_failed(format!("Failed to create exec: {e}")))?;
    let guard = KillOnDrop {
        docker: docker.clone(),
        container_id: container_id.to_string(),
        pid_file: Some(pid_file.to_string()),
    };

    let mut stdout = String::new();
    let mut stderr = String::new();

    let collect = async {
        match docker
            .start_exec(&exec.id, None)
            .await
            .map_err(|e| ExecutionError::container_failed(format!("Failed to start exec: {e}")))?
        {
            StartExecResults::Attached { mut output, .. } => {
                while let Some(chunk) = output.next().await {
                    match chunk {
                        Ok(LogOutput::StdOut { message } | LogOutput::Console { message }) => {
                            stdout.push_str(&String::from_utf8_lossy(&message));
                        }
                        Ok(LogOutput::StdErr { message }) => {
                            stderr.push_str(&String::from_utf8_lossy(&message));
                        }
                        Ok(LogOutput::StdIn { .. }) => {}
                        Err(e) => {
                            warn!("Error reading exec output: {}", e);
                        }
                    }
                }
                Ok::<(), ExecutionError>(())
            }
            StartExecResults::Detached => Err(ExecutionError::container_failed(
                "Exec was detached unexpectedly",
            )),
        }
    };

    let outcome = tokio::time::timeout(timeout + EXEC_GRACE, collect).await;
    match outcome {
        Ok(Ok(())) => guard.disarm(),
        Ok(Err(e)) => return Err(e),
        Err(_) => {
            warn!(
                "Exec in {} exceeded {}s on the host side",
                container_id,
                timeout.as_secs()
            );
            return Ok(ExecutionResult::timeout(timeout, stdout, stderr));
        }
    }
    let duration = started.elapsed();

    let inspect = docker
        .inspect_exec(&exec.id)
        .await
        .map_err(|e| ExecutionError::container_failed(format!("Failed to inspect exec: {e}")))?;
    let exit_code = inspect.exit_code.unwrap_or(-1);

    // 124 from coreutils, 137 when the KILL reached the child first
    if (exit_code == TIMEOUT_EXIT_CODE || exit_code == 137) && duration >= timeout {
        return Ok(ExecutionResult::timeout(timeout, stdout, stderr));
    }

    Ok(ExecutionResult {
        stdout,
        stderr,
        exit_code,
        duration,
        timed_out: false,
    })
}

/// Kills the process an [`exec`] recorded in `pid_file`, waiting until the
/// kill has run. Nothing happens if the exec already finished.
pub(crate) async fn kill_exec(
    docker: &Docker,
    container_id: &str,
    pid_file: &str,
) -> Result<(), ExecutionError> {
    let exec = docker
        .create_exec(
            container_id,
            CreateExecOptions {
                cmd: Some(vec![
                    "sh".to_string(),
                    "-c".to_string(),
                    KILL_SCRIPT.to_string(),
                    pid_file.to_string(),
                ]),
                attach_stdout: Some(true),
                attach_stderr: Some(true),
                ..Default::default()
            },
        )
        .await
        .map_err(|e| ExecutionError::container_failed(format!("Failed to create kill exec: {e}")))?;

    if let StartExecResults::Attached { mut output, .. } = docker
        .start_exec(&exec.id, None)
        .await
        .map_err(|e| ExecutionError::container_failed(format!("Failed to start kill exec: {e}")))?
    {
        while output.next().await.is_some() {}
    }
    debug!("Killed exec recorded in {} on {}", pid_file, container_id);
    Ok(())
}

/// Whether the container exists and is running.
pub(crate) async fn is_running(docker: &Docker, container_id: &str) -> bool {
    match docker
        .inspect_container(container_id, None::<InspectContainerOptions>)
        .await
    {
        Ok(info) => info
            .state
            .and_then(|state| state.running)
            .unwrap_or(false),
        Err(e) => {
            debug!("Inspect of {} failed: {}", container_id, e);
            false
        }
    }
}

/// Stops a container, giving it `grace` before the daemon kills it. A
/// container that is already stopped or gone is not an error.
pub(crate) async fn stop(
    docker: &Docker,
    container_id: &str,
    grace: Duration,
) -> Result<(), ExecutionError> {
    let t = i64::try_from(grace.as_secs()).unwrap_or(i64::MAX);
    match docker
        .stop_container(container_id, Some(StopContainerOptions { t }))
        .await
    {
        Ok(()) => Ok(()),
        Err(bollard::errors::Error::DockerResponseServerError {
            status_code: 304 | 404,
            ..
        }) => {
            debug!("Container {} already stopped", container_id);
            Ok(())
        }
        Err(e) => Err(ExecutionError::container_failed(format!(
            "Failed to stop container {container_id}: {e}"
        ))),
    }
}

/// Force-removes a container. A container that is already gone is not an error.
pub(crate) async fn remove(docker: &Docker, container_id: &str) -> Result<(), ExecutionError> {
    match docker
        .remove_container(
            container_id,
            Some(RemoveContainerOptions {
                force: true,
                v: false,
                ..Default::default()
            }),
        )
        .await
    {
        Ok(()) => Ok(()),
        Err(bollard::errors::Error::DockerResponseServerError {
            status_code: 404, ..
        }) => {
            debug!("Container {} already removed", container_id);
            Ok(())
        }
        Err(e) => Err(ExecutionError::container_failed(format!(
            "Failed to remove container {container_id}: {e}"
        ))),
    }
}

/// Removes every container carrying the managed label. Returns how many went.
pub(crate) async fn remove_managed(docker: &Docker) -> Result<u32, ExecutionError> {
    let filters = HashMap::from([(
        "label".to_string(),
        vec![format!("{MANAGED_LABEL}=true")],
    )]);
    let containers = docker
        .list_containers(Some(ListContainersOptions {
            all: true,
            filters,
            ..Default::default()
        }))
        .await?;

    let mut removed = 0;
    for id in containers.into_iter().filter_map(|c| c.id) {
        match remove(docker, &id).await {
            Ok(()) => removed += 1,
            Err(e) => warn!("Failed to remove orphaned container {}: {}", id, e),
        }
    }
    Ok(removed)
}

/// Docker container names allow `[a-zA-Z0-9_.-]`.
pub(crate) fn sanitize_name(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-') {
                c
            } else {
                '-'
            }
        })
        .take(40)
        .collect();
    cleaned.trim_matches('-').to_string()
}
