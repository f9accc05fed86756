//! Error taxonomy shared by every component of the core.
//!
//! Callers of the public operations receive a [`CoreError`]; the
//! [`CoreError::status_code`] mapping lets an external transport binding
//! turn each variant into a structured response.

use std::time::Duration;

use thiserror::Error;

/// Result alias used across the core.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors surfaced by the orchestration core
#[derive(Debug, Clone, Error, PartialEq)]
pub enum CoreError {
    #[error("Stage '{stage}' timed out after {timeout:?}")]
    StageTimeout { stage: String, timeout: Duration },

    #[error("Stage '{stage}' processor failed: {message}")]
    StageProcessorError { stage: String, message: String },

    #[error("Stage '{stage}' cannot run: dependency '{dependency}' did not succeed")]
    DependencyFailed { stage: String, dependency: String },

    #[error("Concurrency limit reached: {limit} executions already running")]
    Saturated { limit: usize },

    #[error("Resource unavailable: {requested} unit(s) of '{kind}' requested, {available} free")]
    ResourceUnavailable {
        kind: String,
        requested: u32,
        available: u32,
    },

    #[error("Unknown {kind}: {id}")]
    UnknownEntity { kind: &'static str, id: String },

    #[error("{kind} {id} is already resolved")]
    AlreadyResolved { kind: &'static str, id: String },

    #[error("Invalid definition: {0}")]
    InvalidDefinition(String),

    #[error("Invalid state transition for {kind} {id}: {from} -> {to}")]
    InvalidTransition {
        kind: &'static str,
        id: String,
        from: String,
        to: String,
    },
}

impl CoreError {
    pub fn unknown(kind: &'static str, id: impl ToString) -> Self {
        Self::UnknownEntity {
            kind,
            id: id.to_string(),
        }
    }

    pub fn already_resolved(kind: &'static str, id: impl ToString) -> Self {
        Self::AlreadyResolved {
            kind,
            id: id.to_string(),
        }
    }

    /// Whether a stage may be attempted again after this error.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::StageTimeout { .. } | Self::StageProcessorError { .. }
        )
    }

    /// HTTP-class status code for an external binding.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::UnknownEntity { .. } => 404,
            Self::Saturated { .. } | Self::AlreadyResolved { .. } | Self::InvalidTransition { .. } => 409,
            Self::InvalidDefinition(_) => 422,
            Self::ResourceUnavailable { .. } => 503,
            Self::StageTimeout { .. }
            | Self::StageProcessorError { .. }
            | Self::DependencyFailed { .. } => 500,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(CoreError::unknown("pipeline", "nope").status_code(), 404);
        assert_eq!(CoreError::Saturated { limit: 3 }.status_code(), 409);
        assert_eq!(CoreError::already_resolved("alert", "a1").status_code(), 409);
        assert_eq!(
            CoreError::InvalidDefinition("cycle".into()).status_code(),
            422
        );
    }

    #[test]
    fn test_only_stage_errors_are_retryable() {
        let timeout = CoreError::StageTimeout {
            stage: "ingest".into(),
            timeout: Duration::from_millis(10),
        };
        assert!(timeout.is_retryable());

        let dep = CoreError::DependencyFailed {
            stage: "output".into(),
            dependency: "security".into(),
        };
        assert!(!dep.is_retryable());
        assert!(!CoreError::Saturated { limit: 1 }.is_retryable());
    }
}
