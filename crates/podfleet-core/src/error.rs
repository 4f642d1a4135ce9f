//! Error types for provider gateways
//!
//! Gateways never retry. They classify every failure into one of the variants
//! below and let the caller decide.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Failure returned by a [`ProviderGateway`](crate::ProviderGateway) call
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GatewayError {
    #[error("Network error: {0}")]
    TransientNetwork(String),

    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Pod not found: {0}")]
    NotFound(String),

    #[error("Rate limited by provider")]
    RateLimited { retry_after: Option<Duration> },

    #[error("Provider error: {0}")]
    Provider(String),
}

/// Coarse classification of a [`GatewayError`], used for backoff classes
/// and for reporting failures without carrying the message around.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GatewayErrorKind {
    TransientNetwork,
    Auth,
    NotFound,
    RateLimited,
    Provider,
}

impl GatewayError {
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::TransientNetwork(msg.into())
    }

    pub fn provider(msg: impl Into<String>) -> Self {
        Self::Provider(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn auth(msg: impl Into<String>) -> Self {
        Self::Auth(msg.into())
    }

    pub fn rate_limited(retry_after: Option<Duration>) -> Self {
        Self::RateLimited { retry_after }
    }

    pub fn kind(&self) -> GatewayErrorKind {
        match self {
            Self::TransientNetwork(_) => GatewayErrorKind::TransientNetwork,
            Self::Auth(_) => GatewayErrorKind::Auth,
            Self::NotFound(_) => GatewayErrorKind::NotFound,
            Self::RateLimited { .. } => GatewayErrorKind::RateLimited,
            Self::Provider(_) => GatewayErrorKind::Provider,
        }
    }

    /// Whether a caller may retry the call that produced this error
    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }

    /// Provider-suggested wait before the next attempt, if any
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

impl GatewayErrorKind {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::TransientNetwork | Self::RateLimited | Self::Provider
        )
    }
}

impl std::fmt::Display for GatewayErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::TransientNetwork => "transient-network",
            Self::Auth => "auth",
            Self::NotFound => "not-found",
            Self::RateLimited => "rate-limited",
            Self::Provider => "provider",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classes() {
        assert!(GatewayError::transient("reset").is_retryable());
        assert!(GatewayError::rate_limited(None).is_retryable());
        assert!(GatewayError::provider("502").is_retryable());
        assert!(!GatewayError::auth("bad key").is_retryable());
        assert!(!GatewayError::not_found("pod-1").is_retryable());
    }

    #[test]
    fn test_retry_after_only_for_rate_limit() {
        let err = GatewayError::rate_limited(Some(Duration::from_secs(3)));
        assert_eq!(err.retry_after(), Some(Duration::from_secs(3)));
        assert_eq!(GatewayError::provider("x").retry_after(), None);
    }

    #[test]
    fn test_kind_display() {
        assert_eq!(GatewayErrorKind::RateLimited.to_string(), "rate-limited");
        assert_eq!(GatewayError::auth("x").kind(), GatewayErrorKind::Auth);
    }
}
