//! Errors surfaced by the lifecycle layer.

use crate::sandbox::ExecutionError;

/// Errors returned to callers of the session manager and executor factory.
#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    /// A hard quota was hit, or provisioning failed after its retry.
    /// The caller may try again later.
    #[error("Resources exhausted: {message}")]
    ResourceExhausted {
        /// What ran out.
        message: String,
    },

    /// The executor failed for a reason other than quota.
    #[error(transparent)]
    Execution(#[from] ExecutionError),

    /// A configured backend has no implementation.
    #[error("Not implemented: {feature}")]
    NotImplemented {
        /// The missing feature.
        feature: String,
    },

    /// No sandbox is registered for the session.
    #[error("No sandbox for session {session_id}")]
    NotFound {
        /// Session that was looked up.
        session_id: String,
    },

    /// Configuration could not be used.
    #[error("Configuration error: {message}")]
    Config {
        /// What is wrong.
        message: String,
    },
}

impl LifecycleError {
    /// Creates a `ResourceExhausted` error.
    pub fn resource_exhausted(message: impl Into<String>) -> Self {
        Self::ResourceExhausted {
            message: message.into(),
        }
    }

    /// Creates a `NotImplemented` error.
    pub fn not_implemented(feature: impl Into<String>) -> Self {
        Self::NotImplemented {
            feature: feature.into(),
        }
    }

    /// Creates a `NotFound` error.
    pub fn not_found(session_id: impl Into<String>) -> Self {
        Self::NotFound {
            session_id: session_id.into(),
        }
    }

    /// Creates a `Config` error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// True for conditions that may clear up on their own.
    pub fn is_retryable_later(&self) -> bool {
        matches!(self, Self::ResourceExhausted { .. })
    }

    /// Returns true if this is a quota or provisioning exhaustion.
    pub fn is_resource_exhausted(&self) -> bool {
        matches!(self, Self::ResourceExhausted { .. })
    }
}
