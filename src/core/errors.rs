//! Risk engine error types
//!
//! Single error taxonomy shared by evaluation, model management and the
//! store boundary

use thiserror::Error;

/// Errors surfaced by the risk engine
#[derive(Debug, Error)]
pub enum RiskEngineError {
    /// Unknown customer, model or transaction
    #[error("Not found: {0}")]
    NotFound(String),

    /// Duplicate model id, double feedback, or an exhausted activation race
    #[error("Conflict: {0}")]
    Conflict(String),

    /// No active risk model could be resolved for scoring
    #[error("No active risk model available: {0}")]
    ModelUnavailable(String),

    /// Malformed transaction or model fields
    #[error("Validation error: {0}")]
    Validation(String),

    /// Embedding provider or vector index unavailable
    #[error("Upstream unavailable: {0}")]
    Upstream(String),

    /// Document store failure
    #[error("Storage error: {0}")]
    Storage(String),

    /// Change feed failure
    #[error("Change stream error: {0}")]
    ChangeStream(String),

    /// Serialization/deserialization failure
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type used throughout the engine
pub type Result<T> = std::result::Result<T, RiskEngineError>;

impl RiskEngineError {
    /// Errors that degrade gracefully instead of failing the evaluation
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Upstream(_) | Self::ChangeStream(_))
    }

    /// Errors worth retrying with backoff
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Storage(_) | Self::ChangeStream(_) | Self::Upstream(_)
        )
    }
}

impl From<serde_json::Error> for RiskEngineError {
    fn from(err: serde_json::Error) -> Self {
        RiskEngineError::Serialization(err.to_string())
    }
}

impl From<anyhow::Error> for RiskEngineError {
    fn from(err: anyhow::Error) -> Self {
        RiskEngineError::Storage(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = RiskEngineError::Storage("connection lost".to_string());
        assert_eq!(err.to_string(), "Storage error: connection lost");

        let err = RiskEngineError::Conflict("model already exists".to_string());
        assert_eq!(err.to_string(), "Conflict: model already exists");
    }

    #[test]
    fn test_from_anyhow() {
        let err: RiskEngineError = anyhow::anyhow!("connection reset").into();
        assert!(matches!(err, RiskEngineError::Storage(_)));
    }

    #[test]
    fn test_recoverable_classification() {
        assert!(RiskEngineError::Upstream("embedding down".into()).is_recoverable());
        assert!(!RiskEngineError::Conflict("double feedback".into()).is_recoverable());
        assert!(!RiskEngineError::Validation("flag > block".into()).is_retryable());
        assert!(RiskEngineError::Storage("timeout".into()).is_retryable());
    }
}
