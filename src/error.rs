//! Error types for workflow execution
//!
//! A failure raised by a step's `run` function travels upward unchanged:
//! each level wraps it once, so the original message is always reachable
//! through [`Error::root_message`].

use thiserror::Error;

use crate::workflow::model::{ComponentKind, Status};

/// Error returned by a step's user-supplied `run` function.
pub type RunError = Box<dyn std::error::Error + Send + Sync>;

/// Error type for workflow execution
#[derive(Debug, Error)]
pub enum Error {
    /// A step's `run` function returned an error (or panicked)
    #[error("step '{step}' failed: {message}")]
    StepFailed { step: String, message: String },

    /// A step inside this work failed
    #[error("work '{work}' failed: {source}")]
    WorkFailed {
        work: String,
        #[source]
        source: Box<Error>,
    },

    /// A work inside this workflow failed
    #[error("workflow '{workflow}' failed: {source}")]
    WorkflowFailed {
        workflow: String,
        #[source]
        source: Box<Error>,
    },

    /// A child settled in a status its parent cannot continue from
    #[error("{kind} '{id}' did not complete (status: {status})")]
    Incomplete {
        kind: ComponentKind,
        id: String,
        status: Status,
    },

    /// Snapshot belongs to a different component
    #[error("{kind} snapshot mismatch: expected id '{expected}', found '{found}'")]
    SnapshotMismatch {
        kind: ComponentKind,
        expected: String,
        found: String,
    },

    /// A work's task ended without settling (panicked or cancelled)
    #[error("work '{work}' aborted: {message}")]
    Aborted { work: String, message: String },

    /// Storage backend error with context, raised by [`FileStorage`] and
    /// available to custom [`Storage`] implementations
    ///
    /// [`FileStorage`]: crate::storage::FileStorage
    /// [`Storage`]: crate::storage::Storage
    #[error("storage error: {0}")]
    Storage(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Filesystem error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Workflow definition could not be parsed
    #[error("invalid YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Workflow definition failed validation
    #[error("invalid workflow definition: {0}")]
    InvalidDefinition(String),
}

/// Result type for workflow operations
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Returns the message of the innermost error in a failure chain.
    ///
    /// For a workflow failure caused by a step this is the step's own
    /// message, exactly as the `run` function reported it.
    pub fn root_message(&self) -> String {
        match self {
            Error::StepFailed { message, .. } => message.clone(),
            Error::WorkFailed { source, .. } | Error::WorkflowFailed { source, .. } => {
                source.root_message()
            }
            other => other.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::StepFailed {
            step: "fetch".to_string(),
            message: "timeout".to_string(),
        };
        assert_eq!(err.to_string(), "step 'fetch' failed: timeout");

        let err = Error::Incomplete {
            kind: ComponentKind::Step,
            id: "s1".to_string(),
            status: Status::Paused,
        };
        assert_eq!(err.to_string(), "step 's1' did not complete (status: paused)");
    }

    #[test]
    fn test_root_message_walks_chain() {
        let err = Error::WorkflowFailed {
            workflow: "wf".to_string(),
            source: Box::new(Error::WorkFailed {
                work: "w1".to_string(),
                source: Box::new(Error::StepFailed {
                    step: "s1".to_string(),
                    message: "disk full".to_string(),
                }),
            }),
        };

        assert_eq!(err.root_message(), "disk full");
        assert_eq!(
            err.to_string(),
            "workflow 'wf' failed: work 'w1' failed: step 's1' failed: disk full"
        );
    }

    #[test]
    fn test_root_message_non_chain() {
        let err = Error::Storage("unreachable".to_string());
        assert_eq!(err.root_message(), "storage error: unreachable");
    }
}
