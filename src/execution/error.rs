//! Executor Errors

use std::time::Duration;

use thiserror::Error;

use crate::workflow::GraphError;

/// Why a run did not complete successfully.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExecutorError {
    /// The workflow graph could not be resolved; nothing ran.
    #[error("workflow has dependency errors: {0}")]
    Dependency(String),

    /// Unfinished steps remain but none is ready.
    #[error("no steps ready but {remaining} step(s) remain unexecuted")]
    Deadlock { remaining: usize },

    /// A step failed under the `fail` policy.
    #[error("step {step_id} failed: {message}")]
    StepFailed { step_id: String, message: String },

    #[error("workflow exceeded global timeout of {0:?}")]
    TimedOut(Duration),

    #[error("workflow cancelled")]
    Cancelled,

    #[error("scheduler error: {0}")]
    Graph(#[from] GraphError),
}

impl ExecutorError {
    /// Returns true if the run ended because of cancellation or timeout.
    pub fn is_interrupted(&self) -> bool {
        matches!(self, ExecutorError::Cancelled | ExecutorError::TimedOut(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = ExecutorError::StepFailed {
            step_id: "build".to_string(),
            message: "timeout waiting for completion".to_string(),
        };
        assert_eq!(err.to_string(), "step build failed: timeout waiting for completion");

        let err: ExecutorError = GraphError::AlreadyExecuted("a".to_string()).into();
        assert!(err.to_string().contains("already been marked"));
        assert!(!err.is_interrupted());
        assert!(ExecutorError::Cancelled.is_interrupted());
    }
}
