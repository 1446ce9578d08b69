//! Error taxonomy for the devnet orchestrator.

use std::time::Duration;

use miette::Diagnostic;
use thiserror::Error;

/// Result type alias using [`DevnetError`].
pub type DevnetResult<T> = Result<T, DevnetError>;

/// Errors reported by every orchestration step.
#[derive(Error, Diagnostic, Debug)]
pub enum DevnetError {
    /// The cluster configuration is invalid.
    #[error("Configuration error: {message}")]
    #[diagnostic(
        code(devnet::config),
        help("Check service names, dependencies and probe definitions")
    )]
    Config {
        /// The error message.
        message: String,
    },

    /// The container engine cannot be reached.
    #[error("Container engine unreachable: {message}")]
    #[diagnostic(
        code(devnet::engine::unreachable),
        help("Make sure the engine is running and DOCKER_HOST points at its socket")
    )]
    EngineUnreachable {
        /// The error message.
        message: String,
    },

    /// An engine object does not exist.
    #[error("{kind} not found: {name}")]
    #[diagnostic(code(devnet::engine::not_found))]
    NotFound {
        /// The object kind (container, network).
        kind: String,
        /// The object name or id.
        name: String,
    },

    /// An engine object with the same name already exists.
    #[error("{kind} already exists: {name}")]
    #[diagnostic(code(devnet::engine::already_exists))]
    AlreadyExists {
        /// The object kind (container, network).
        kind: String,
        /// The object name.
        name: String,
    },

    /// The engine reported an error executing a request.
    #[error("Engine operation failed: {message}")]
    #[diagnostic(code(devnet::engine::operation_failed))]
    OperationFailed {
        /// The error message.
        message: String,
    },

    /// A service failed to start or become healthy; created resources were rolled back.
    #[error(
        "Service '{service}' failed to start: {cause}{}",
        rollback_summary(.rollback)
    )]
    #[diagnostic(code(devnet::cluster::startup_failed))]
    StartupFailed {
        /// The service that failed.
        service: String,
        /// The underlying cause.
        #[source]
        cause: Box<DevnetError>,
        /// Rollback steps that failed; those resources may still exist.
        #[related]
        rollback: Vec<DevnetError>,
    },

    /// A readiness probe never succeeded within its timeout.
    #[error(
        "Timed out after {timeout:?} waiting for {target} ({})",
        .last_reason.as_deref().unwrap_or("no attempt completed")
    )]
    #[diagnostic(
        code(devnet::health::timeout),
        help("Raise the service's healthcheck timeout or inspect its logs")
    )]
    HealthTimeout {
        /// Description of the probe target.
        target: String,
        /// The timeout that elapsed.
        timeout: Duration,
        /// Reason reported by the last failed attempt.
        last_reason: Option<String>,
    },

    /// A probe raised a non-retryable error.
    #[error("Probe {target} failed: {message}")]
    #[diagnostic(code(devnet::health::probe_failed))]
    ProbeFailed {
        /// Description of the probe target.
        target: String,
        /// The error message.
        message: String,
    },

    /// One or more teardown steps failed after all steps were attempted.
    #[error("Teardown failed with {} error(s)", .errors.len())]
    #[diagnostic(
        code(devnet::cluster::teardown_failed),
        help("Remaining resources carry the devnet.cluster label and can be removed manually")
    )]
    TeardownFailed {
        /// Every failed step.
        #[related]
        errors: Vec<DevnetError>,
    },

    /// A lifecycle operation was called in the wrong phase.
    #[error("Invalid state: cannot {operation} while {state}")]
    #[diagnostic(code(devnet::cluster::invalid_state))]
    InvalidState {
        /// The attempted operation.
        operation: String,
        /// The current state.
        state: String,
    },

    /// The operation was cancelled; created resources were rolled back.
    #[error("Operation cancelled")]
    #[diagnostic(code(devnet::cancelled))]
    Cancelled,

    /// I/O error.
    #[error("I/O error: {0}")]
    #[diagnostic(code(devnet::io))]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    #[diagnostic(code(devnet::serialization))]
    Serialization(String),
}

impl DevnetError {
    /// Creates a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Creates a not-found error.
    pub fn not_found(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Creates an operation-failed error.
    pub fn operation_failed(message: impl Into<String>) -> Self {
        Self::OperationFailed {
            message: message.into(),
        }
    }

    /// Creates an invalid-state error.
    pub fn invalid_state(operation: impl Into<String>, state: impl ToString) -> Self {
        Self::InvalidState {
            operation: operation.into(),
            state: state.to_string(),
        }
    }

    /// Wraps a cause as the startup failure of `service`.
    pub fn startup_failed(service: impl Into<String>, cause: Self) -> Self {
        Self::StartupFailed {
            service: service.into(),
            cause: Box::new(cause),
            rollback: Vec::new(),
        }
    }

    /// Returns true if the object does not exist.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Returns true if a retry of the same engine request may succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::OperationFailed { .. } | Self::Io(_))
    }
}

fn rollback_summary(rollback: &[DevnetError]) -> String {
    if rollback.is_empty() {
        String::new()
    } else {
        format!(" (rollback left {} step(s) failed)", rollback.len())
    }
}

impl From<serde_json::Error> for DevnetError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for DevnetError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
