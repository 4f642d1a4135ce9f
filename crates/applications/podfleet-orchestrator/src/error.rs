//! Error types for the orchestrator

use podfleet_core::{ActionKind, GatewayError, GatewayErrorKind, PodId};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Orchestrator result type
pub type Result<T> = std::result::Result<T, OrchestratorError>;

/// Errors that can occur in the orchestrator
#[derive(Error, Debug)]
pub enum OrchestratorError {
    /// Provider gateway error (after retries, where retries apply)
    #[error("Gateway error: {0}")]
    Gateway(#[from] GatewayError),

    /// Pod already has an action in flight
    #[error("Pod {pod_id} already has a {in_flight} action in flight")]
    ActionConflict { pod_id: PodId, in_flight: ActionKind },

    /// Request rejected before any provider call
    #[error("Validation error: {0}")]
    Validation(String),

    /// Replacement pod never reached Running
    #[error("Pod {pod_id} not healthy after {after:?}")]
    HealthTimeout { pod_id: PodId, after: Duration },

    /// Pod unknown to the state store
    #[error("Pod {0} not found")]
    PodNotFound(PodId),

    /// HTTP client error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Workflow task ended without producing a run
    #[error("Workflow task failed: {0}")]
    Task(String),
}

impl OrchestratorError {
    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
}

/// Failure classification recorded on tickets and workflow items
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FailureKind {
    TransientNetwork,
    RateLimited,
    Provider,
    Auth,
    NotFound,
    Conflict,
    Validation,
    Timeout,
    Internal,
}

impl From<GatewayErrorKind> for FailureKind {
    fn from(kind: GatewayErrorKind) -> Self {
        match kind {
            GatewayErrorKind::TransientNetwork => Self::TransientNetwork,
            GatewayErrorKind::RateLimited => Self::RateLimited,
            GatewayErrorKind::Provider => Self::Provider,
            GatewayErrorKind::Auth => Self::Auth,
            GatewayErrorKind::NotFound => Self::NotFound,
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::TransientNetwork => "transient-network",
            Self::RateLimited => "rate-limited",
            Self::Provider => "provider",
            Self::Auth => "auth",
            Self::NotFound => "not-found",
            Self::Conflict => "conflict",
            Self::Validation => "validation",
            Self::Timeout => "timeout",
            Self::Internal => "internal",
        };
        f.write_str(s)
    }
}

/// A failure attributed to one ticket or workflow item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl ActionFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Whether the workflow issuing this action must stop issuing more
    pub fn is_fatal(&self) -> bool {
        self.kind == FailureKind::Auth
    }
}

impl From<&GatewayError> for ActionFailure {
    fn from(err: &GatewayError) -> Self {
        Self::new(err.kind().into(), err.to_string())
    }
}

impl From<&OrchestratorError> for ActionFailure {
    fn from(err: &OrchestratorError) -> Self {
        let kind = match err {
            OrchestratorError::Gateway(e) => e.kind().into(),
            OrchestratorError::ActionConflict { .. } => FailureKind::Conflict,
            OrchestratorError::Validation(_) | OrchestratorError::PodNotFound(_) => {
                FailureKind::Validation
            }
            OrchestratorError::HealthTimeout { .. } => FailureKind::Timeout,
            _ => FailureKind::Internal,
        };
        Self::new(kind, err.to_string())
    }
}

impl std::fmt::Display for ActionFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.kind, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conflict_maps_to_conflict_kind() {
        let err = OrchestratorError::ActionConflict {
            pod_id: PodId::new("p1"),
            in_flight: ActionKind::Stop,
        };
        let failure = ActionFailure::from(&err);
        assert_eq!(failure.kind, FailureKind::Conflict);
        assert!(failure.message.contains("p1"));
    }

    #[test]
    fn test_auth_is_fatal() {
        let failure = ActionFailure::from(&GatewayError::auth("invalid key"));
        assert!(failure.is_fatal());
        assert!(!ActionFailure::from(&GatewayError::provider("502")).is_fatal());
    }

    #[test]
    fn test_health_timeout_maps_to_timeout_kind() {
        let err = OrchestratorError::HealthTimeout {
            pod_id: PodId::new("p1-v2"),
            after: Duration::from_secs(300),
        };
        let failure = ActionFailure::from(&err);
        assert_eq!(failure.kind, FailureKind::Timeout);
        assert_eq!(failure.message, "Pod p1-v2 not healthy after 300s");
    }

    #[test]
    fn test_failure_display() {
        let failure = ActionFailure::new(FailureKind::Timeout, "replacement never became healthy");
        assert_eq!(
            failure.to_string(),
            "[timeout] replacement never became healthy"
        );
    }
}
