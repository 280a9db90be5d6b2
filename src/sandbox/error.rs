//! Domain-specific error types for sandbox executors.
//!
//! These are transport and provisioning failures. A command that runs and
//! exits non-zero is not an error; it is an `ExecutionResult`.

/// Errors that can occur while starting, using or stopping a sandbox.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ExecutionError {
    /// Docker daemon is not running or not accessible.
    #[error("Docker is not available: {message}")]
    DockerUnavailable {
        /// Underlying cause.
        message: String,
    },

    /// Container image was not found and could not be pulled.
    #[error("Container image not found: {image}")]
    ImageNotFound {
        /// Image reference.
        image: String,
    },

    /// Container is in an unrecoverable state (dead, removing, etc.).
    #[error("Container is unhealthy: {message}")]
    ContainerUnhealthy {
        /// What was observed.
        message: String,
    },

    /// Container operation failed (create, start, exec, etc.).
    #[error("Container operation failed: {message}")]
    ContainerFailed {
        /// Underlying cause.
        message: String,
    },

    /// Host subprocess could not be spawned or awaited.
    #[error("Process failed: {message}")]
    ProcessFailed {
        /// Underlying cause.
        message: String,
    },

    /// The sandbox was terminated before or while the call was waiting.
    #[error("Sandbox {sandbox_id} has been terminated")]
    SandboxTerminated {
        /// Identifier of the terminated sandbox.
        sandbox_id: String,
    },

    /// The requested backend exists in configuration but has no implementation.
    #[error("Executor backend not implemented: {backend}")]
    Unsupported {
        /// Backend name.
        backend: String,
    },
}

impl ExecutionError {
    /// Creates a `DockerUnavailable` error.
    pub fn docker_unavailable(message: impl Into<String>) -> Self {
        Self::DockerUnavailable {
            message: message.into(),
        }
    }

    /// Creates an `ImageNotFound` error.
    pub fn image_not_found(image: impl Into<String>) -> Self {
        Self::ImageNotFound {
            image: image.into(),
        }
    }

    /// Creates a `ContainerUnhealthy` error.
    pub fn container_unhealthy(message: impl Into<String>) -> Self {
        Self::ContainerUnhealthy {
            message: message.into(),
        }
    }

    /// Creates a `ContainerFailed` error.
    pub fn container_failed(message: impl Into<String>) -> Self {
        Self::ContainerFailed {
            message: message.into(),
        }
    }

    /// Creates a `ProcessFailed` error.
    pub fn process_failed(message: impl Into<String>) -> Self {
        Self::ProcessFailed {
            message: message.into(),
        }
    }

    /// Creates a `SandboxTerminated` error.
    pub fn terminated(sandbox_id: impl Into<String>) -> Self {
        Self::SandboxTerminated {
            sandbox_id: sandbox_id.into(),
        }
    }

    /// Creates an `Unsupported` error.
    pub fn unsupported(backend: impl Into<String>) -> Self {
        Self::Unsupported {
            backend: backend.into(),
        }
    }

    /// Returns true if this is a Docker unavailability error.
    pub fn is_docker_unavailable(&self) -> bool {
        matches!(self, Self::DockerUnavailable { .. })
    }

    /// Returns true if this is an image not found error.
    pub fn is_image_not_found(&self) -> bool {
        matches!(self, Self::ImageNotFound { .. })
    }

    /// Returns true if the sandbox was already terminated.
    pub fn is_terminated(&self) -> bool {
        matches!(self, Self::SandboxTerminated { .. })
    }

    /// Returns true if a fresh attempt with a new container might succeed.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Unsupported { .. } | Self::ImageNotFound { .. })
    }
}

impl From<bollard::errors::Error> for ExecutionError {
    fn from(err: bollard::errors::Error) -> Self {
        use bollard::errors::Error;

        match err {
            Error::DockerResponseServerError {
                status_code: 404,
                message,
            } => Self::container_failed(format!("not found: {message}")),
            Error::DockerResponseServerError { message, .. } => Self::container_failed(message),
            other => Self::docker_unavailable(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_docker_unavailable_error() {
        let err = ExecutionError::docker_unavailable("daemon not running");
        assert!(err.is_docker_unavailable());
        assert!(err.is_retryable());
        assert_eq!(
            err.to_string(),
            "Docker is not available: daemon not running"
        );
    }

    #[test]
    fn test_image_not_found_error() {
        let err = ExecutionError::image_not_found("python:3.11-slim");
        assert!(err.is_image_not_found());
        assert!(!err.is_retryable());
        assert_eq!(
            err.to_string(),
            "Container image not found: python:3.11-slim"
        );
    }

    #[test]
    fn test_container_unhealthy_error() {
        let err = ExecutionError::container_unhealthy("container is dead");
        assert_eq!(err.to_string(), "Container is unhealthy: container is dead");
    }

    #[test]
    fn test_container_failed_error() {
        let err = ExecutionError::container_failed("failed to start");
        assert!(err.is_retryable());
        assert_eq!(
            err.to_string(),
            "Container operation failed: failed to start"
        );
    }

    #[test]
    fn test_terminated_error() {
        let err = ExecutionError::terminated("sbx-1");
        assert!(err.is_terminated());
        assert_eq!(err.to_string(), "Sandbox sbx-1 has been terminated");
    }

    #[test]
    fn test_unsupported_is_not_retryable() {
        let err = ExecutionError::unsupported("remote");
        assert!(!err.is_retryable());
        assert!(!err.is_docker_unavailable());
    }

    #[test]
    fn test_server_error_maps_to_container_failed() {
        let err: ExecutionError = bollard::errors::Error::DockerResponseServerError {
            status_code: 500,
            message: "boom".to_string(),
        }
        .into();
        assert!(matches!(err, ExecutionError::ContainerFailed { .. }));
    }
}
