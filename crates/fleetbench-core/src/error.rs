// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: Apache-2.0

//! Error taxonomy for the execution engine core (see spec §7).

use thiserror::Error;

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Error taxonomy carried in `ExecutionState.errors` and in step results.
#[derive(Error, Debug)]
pub enum EngineError {
    /// Invalid step configuration or missing required field. Fatal for that step.
    #[error("invalid configuration for step '{step_id}': {reason}")]
    ConfigError { step_id: String, reason: String },

    /// Definition-level failure. Fatal at submission.
    #[error("workflow validation failed: {0}")]
    ValidationError(String),

    /// Step executor returned an error. Behavior governed by the step's error policy.
    #[error("execution failed for step '{step_id}': {source}")]
    ExecutionError {
        step_id: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Step exceeded its timeout.
    #[error("step '{step_id}' timed out after {duration:?}")]
    TimeoutError {
        step_id: String,
        duration: std::time::Duration,
    },

    /// Pre-hook failure causes the scope to be skipped; post-hook failure is
    /// recorded and swallowed.
    #[error("hook error in {scope}: {reason}")]
    HookError { scope: String, reason: String },

    /// No suitable slaves, min count unmet, unknown slave id, or non-online
    /// slave selected manually. Fatal at submission.
    #[error("scheduling failed: {0}")]
    SchedulingError(String),

    /// Not an error per se but may trigger abort of the enclosing run.
    #[error("threshold breached: {metric} ({expression})")]
    ThresholdBreach { metric: String, expression: String },

    /// Detected by the reference resolver. Fatal at resolution.
    #[error("cycle detected resolving workflow reference: {0}")]
    CycleError(String),

    /// Sensitive value cannot be decrypted; field is left in stored form,
    /// execution continues.
    #[error("failed to decrypt value '{field}': {reason}")]
    DecryptionError { field: String, reason: String },

    /// Step or workflow not found.
    #[error("step '{0}' not found in workflow")]
    StepNotFound(String),

    /// Template rendering error.
    #[error("template rendering failed: {0}")]
    TemplateError(String),

    /// Context variable not found.
    #[error("context variable '{0}' not found")]
    ContextVariableNotFound(String),

    /// Invalid state transition.
    #[error("invalid state transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    /// IO error.
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    SerializationError(String),

    /// Generic error.
    #[error("{0}")]
    Other(String),
}

impl EngineError {
    pub fn config<S: Into<String>>(step_id: impl Into<String>, reason: S) -> Self {
        Self::ConfigError {
            step_id: step_id.into(),
            reason: reason.into(),
        }
    }

    pub fn validation<S: Into<String>>(msg: S) -> Self {
        Self::ValidationError(msg.into())
    }

    pub fn execution<E>(step_id: impl Into<String>, error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::ExecutionError {
            step_id: step_id.into(),
            source: Box::new(error),
        }
    }

    pub fn template<S: Into<String>>(msg: S) -> Self {
        Self::TemplateError(msg.into())
    }

    pub fn serialization<S: Into<String>>(msg: S) -> Self {
        Self::SerializationError(msg.into())
    }

    pub fn other<S: Into<String>>(msg: S) -> Self {
        Self::Other(msg.into())
    }

    /// Errors a retry-policy step error strategy considers worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::TimeoutError { .. } | Self::ExecutionError { .. }
        )
    }

    /// Errors that are fatal at submission time rather than scoped to a step.
    pub fn is_fatal_at_submission(&self) -> bool {
        matches!(
            self,
            Self::ValidationError(_) | Self::SchedulingError(_) | Self::CycleError(_)
        )
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        Self::SerializationError(err.to_string())
    }
}

impl From<serde_yaml::Error> for EngineError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::SerializationError(err.to_string())
    }
}

impl From<handlebars::RenderError> for EngineError {
    fn from(err: handlebars::RenderError) -> Self {
        Self::TemplateError(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = EngineError::validation("missing field");
        assert!(matches!(err, EngineError::ValidationError(_)));

        let err = EngineError::config("step-1", "missing url");
        assert!(matches!(err, EngineError::ConfigError { .. }));
    }

    #[test]
    fn test_is_retryable() {
        let timeout_err = EngineError::TimeoutError {
            step_id: "s1".into(),
            duration: std::time::Duration::from_secs(30),
        };
        assert!(timeout_err.is_retryable());

        let validation_err = EngineError::validation("test");
        assert!(!validation_err.is_retryable());
        assert!(validation_err.is_fatal_at_submission());
    }
}
