//! Error types for the evaluation pipeline

use thiserror::Error;

/// Result type for pipeline operations
pub type EvalResult<T> = Result<T, EvalError>;

/// Error taxonomy for the evaluation pipeline
///
/// Variants map onto the propagation policy: only `Validation` surfaces
/// synchronously to submitters; everything else is recorded on the
/// evaluation record through the event pipeline or retried in place.
#[derive(Error, Debug, Clone)]
pub enum EvalError {
    /// Rejected input; never retried, surfaces to the caller
    #[error("Validation error: {0}")]
    Validation(String),

    /// Task stream enqueue failed; the submission is not accepted
    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    /// No sandbox available, or the orchestrator rejected for capacity
    #[error("Capacity exceeded: {0}")]
    Capacity(String),

    /// Orchestrator-level admission limit
    #[error("Quota exhausted: {0}")]
    QuotaExhausted(String),

    /// Transient orchestrator failure (network, 5xx)
    #[error("Orchestrator unavailable: {0}")]
    OrchestratorUnavailable(String),

    /// Permanent orchestrator rejection (4xx other than quota/capacity)
    #[error("Orchestrator rejected request: {0}")]
    OrchestratorRejected(String),

    /// Coordination store failure
    #[error("Coordination store error: {0}")]
    Coordination(String),

    /// Durable store failure
    #[error("Durable store error: {0}")]
    Storage(String),

    /// Event bus failure
    #[error("Event bus error: {0}")]
    Bus(String),

    /// Evaluation not found in the durable store
    #[error("Evaluation {0} not found")]
    NotFound(String),

    /// Evaluation already exists in the durable store
    #[error("Evaluation {0} already exists")]
    AlreadyExists(String),

    /// State-machine violation; the event is dropped, never applied
    #[error("Invalid state transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    /// Operation timed out
    #[error("Operation timed out")]
    Timeout,

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl EvalError {
    /// Whether the dispatcher may retry the failed operation
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EvalError::Capacity(_)
                | EvalError::QuotaExhausted(_)
                | EvalError::OrchestratorUnavailable(_)
                | EvalError::Coordination(_)
                | EvalError::Timeout
        )
    }

    /// Short class name recorded on failed evaluations and DLQ entries
    pub fn class(&self) -> &'static str {
        match self {
            EvalError::Validation(_) => "validation",
            EvalError::ServiceUnavailable(_) => "service_unavailable",
            EvalError::Capacity(_) => "capacity_exhausted",
            EvalError::QuotaExhausted(_) => "quota_exhausted",
            EvalError::OrchestratorUnavailable(_) => "orchestrator_unavailable",
            EvalError::OrchestratorRejected(_) => "orchestrator_rejected",
            EvalError::Coordination(_) => "coordination",
            EvalError::Storage(_) => "storage",
            EvalError::Bus(_) => "event_bus",
            EvalError::NotFound(_) => "not_found",
            EvalError::AlreadyExists(_) => "already_exists",
            EvalError::InvalidTransition { .. } => "invalid_transition",
            EvalError::Timeout => "timeout",
            EvalError::Internal(_) => "internal",
        }
    }
}

impl From<std::io::Error> for EvalError {
    fn from(err: std::io::Error) -> Self {
        EvalError::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for EvalError {
    fn from(err: serde_json::Error) -> Self {
        EvalError::Internal(format!("Serialization error: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(EvalError::Capacity("pool empty".to_string()).is_retryable());
        assert!(EvalError::QuotaExhausted("403".to_string()).is_retryable());
        assert!(EvalError::OrchestratorUnavailable("503".to_string()).is_retryable());
        assert!(EvalError::Timeout.is_retryable());

        assert!(!EvalError::Validation("bad runtime".to_string()).is_retryable());
        assert!(!EvalError::OrchestratorRejected("bad request".to_string()).is_retryable());
        assert!(!EvalError::InvalidTransition {
            from: "completed".to_string(),
            to: "running".to_string()
        }
        .is_retryable());
    }

    #[test]
    fn test_error_class_strings() {
        assert_eq!(EvalError::Capacity("x".to_string()).class(), "capacity_exhausted");
        assert_eq!(
            EvalError::ServiceUnavailable("x".to_string()).class(),
            "service_unavailable"
        );
        assert_eq!(
            EvalError::OrchestratorUnavailable("x".to_string()).class(),
            "orchestrator_unavailable"
        );
    }
}
