//! Error types for cluster teardown
//!
//! Errors are structured with fields so an operator can tell which resource
//! type, stage, or task stopped the run. The taxonomy follows how the
//! orchestrator reacts to each failure:
//!
//! - [`Error::Pending`] is recoverable and only drives another poll.
//! - [`Error::Delete`] is transient and is deduplicated by the error tracker.
//! - [`Error::List`] is fatal for its resource type (state is unobservable).
//! - [`Error::StageFailed`] aborts the whole pipeline.
//! - [`Error::Timeout`] enumerates what never converged within a deadline.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for teardown operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Resources of a type are known to still exist
    #[error("{count} {resource_type} pending")]
    Pending {
        /// Resource type still converging
        resource_type: String,
        /// Number of items not yet confirmed gone
        count: usize,
    },

    /// Listing a resource type failed
    #[error("failed to list {resource_type}: {message}")]
    List {
        /// Resource type being listed
        resource_type: String,
        /// Description of what failed
        message: String,
    },

    /// A single delete call failed
    #[error("failed to delete {resource_type} {key}: {message}")]
    Delete {
        /// Resource type being deleted
        resource_type: String,
        /// Stable key of the resource
        key: String,
        /// Description of what failed
        message: String,
    },

    /// A deadline-bound wait expired
    #[error("timed out waiting for {operation} ({} unconverged)", unconverged.len())]
    Timeout {
        /// Operation that was waiting
        operation: String,
        /// Keys of resources that never converged
        unconverged: Vec<String>,
    },

    /// Work was cancelled before it finished
    #[error("cancelled: {context}")]
    Cancelled {
        /// Where the cancellation was observed
        context: String,
    },

    /// A stage func returned a fatal error
    #[error("stage {stage} failed in {task}: {source}")]
    StageFailed {
        /// Name of the stage that failed
        stage: String,
        /// Name of the func inside the stage
        task: String,
        /// The fatal error
        source: Box<Error>,
    },

    /// Invalid metadata or options
    #[error("validation error: {message}")]
    Validation {
        /// Description of what's invalid
        message: String,
    },

    /// No destroyer registered for a platform
    #[error("no destroyer registered for platform {platform:?} (known: {})", known.join(", "))]
    UnsupportedPlatform {
        /// Requested platform name
        platform: String,
        /// Registered platform names
        known: Vec<String>,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "executor", "watcher")
        context: String,
    },
}

impl Error {
    /// Create a pending error for a resource type
    pub fn pending(resource_type: impl Into<String>, count: usize) -> Self {
        Self::Pending {
            resource_type: resource_type.into(),
            count,
        }
    }

    /// Create a listing error for a resource type
    pub fn list(resource_type: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::List {
            resource_type: resource_type.into(),
            message: msg.into(),
        }
    }

    /// Create a delete error for a single resource
    pub fn delete(
        resource_type: impl Into<String>,
        key: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Delete {
            resource_type: resource_type.into(),
            key: key.into(),
            message: msg.into(),
        }
    }

    /// Create a timeout error with no enumerated resources
    pub fn timeout(operation: impl Into<String>) -> Self {
        Self::Timeout {
            operation: operation.into(),
            unconverged: Vec::new(),
        }
    }

    /// Create a timeout error listing the resources that never converged
    pub fn timeout_with(operation: impl Into<String>, unconverged: Vec<String>) -> Self {
        Self::Timeout {
            operation: operation.into(),
            unconverged,
        }
    }

    /// Create a cancellation error
    pub fn cancelled(context: impl Into<String>) -> Self {
        Self::Cancelled {
            context: context.into(),
        }
    }

    /// Wrap a fatal error with the stage and task it came from
    pub fn stage_failed(stage: impl Into<String>, task: impl Into<String>, source: Error) -> Self {
        Self::StageFailed {
            stage: stage.into(),
            task: task.into(),
            source: Box::new(source),
        }
    }

    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
        }
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Whether this error only means "not converged yet, poll again"
    pub fn is_pending(&self) -> bool {
        matches!(self, Error::Pending { .. })
    }

    /// Whether this error is a Kubernetes 404
    ///
    /// Deleters map this to success so repeated deletes stay idempotent.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::Kube { source: kube::Error::Api(ae) } if ae.code == 404)
    }

    /// Get the resource type if this error is associated with one
    pub fn resource_type(&self) -> Option<&str> {
        match self {
            Error::Pending { resource_type, .. }
            | Error::List { resource_type, .. }
            | Error::Delete { resource_type, .. } => Some(resource_type),
            Error::StageFailed { source, .. } => source.resource_type(),
            _ => None,
        }
    }
}
