//! Error types for the orchestration engine.
//!
//! Expected outcomes of a transition (rejected, deferred, version
//! conflict) are *values*, not errors - see
//! [`crate::coordinator::TransitionOutcome`]. Only genuinely
//! unexpected failures surface through [`Error`].

use cadence_core::RunId;

/// The result type used throughout cadence-engine.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in engine operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A run was not found.
    #[error("run not found: {run_id}")]
    RunNotFound {
        /// The run ID that was not found.
        run_id: RunId,
    },

    /// A recurrence definition could not be evaluated.
    #[error("invalid recurrence definition for deployment {deployment_id}: {message}")]
    InvalidRecurrence {
        /// The deployment whose definition failed.
        deployment_id: String,
        /// Description of the failure.
        message: String,
    },

    /// A rule implementation violated the pipeline contract.
    #[error("rule defect in '{rule}': {message}")]
    RuleDefect {
        /// Name of the offending rule.
        rule: String,
        /// Description of the defect.
        message: String,
    },

    /// A storage operation failed.
    #[error("storage error: {message}")]
    Storage {
        /// Description of the storage failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// An error from cadence-core.
    #[error("core error: {0}")]
    Core(#[from] cadence_core::Error),
}

impl Error {
    /// Creates a new storage error.
    #[must_use]
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a new storage error with a source.
    #[must_use]
    pub fn storage_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Storage {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as StdError;

    #[test]
    fn run_not_found_display() {
        let err = Error::RunNotFound {
            run_id: RunId::generate(),
        };
        assert!(err.to_string().contains("run not found"));
    }

    #[test]
    fn invalid_recurrence_display() {
        let err = Error::InvalidRecurrence {
            deployment_id: "01J0000000000000000000000".into(),
            message: "invalid timezone: Mars/Olympus_Mons".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("invalid recurrence"));
        assert!(msg.contains("Mars/Olympus_Mons"));
    }

    #[test]
    fn storage_error_with_source() {
        let source = std::io::Error::new(std::io::ErrorKind::NotFound, "row vanished");
        let err = Error::storage_with_source("failed to load run", source);
        assert!(err.to_string().contains("storage error"));
        assert!(StdError::source(&err).is_some());
    }
}
