//! Error types for the Cascade pipeline engine.
//!
//! Build-time errors (duplicate names, unknown datasets, cycles, frozen
//! registry) abort pipeline construction before any cycle runs. Cycle-time
//! errors are isolated to the failing dataset, except for checkpoint
//! corruption and failure-threshold escalation, which are fatal to the run.

use thiserror::Error;

/// The primary error type for Cascade operations.
#[derive(Error, Debug)]
pub enum CascadeError {
    /// A dataset was registered under a name that already exists.
    #[error("dataset '{dataset}' is already registered")]
    DuplicateName { dataset: String },

    /// A dataset name could not be resolved.
    #[error("unknown dataset '{dataset}'")]
    UnknownDataset { dataset: String },

    /// The declared dependencies contain a cycle.
    #[error("cyclic dependency: {}", cycle.join(" -> "))]
    CyclicDependency { cycle: Vec<String> },

    /// Registration was attempted after the registry was frozen.
    #[error("registry is frozen, cannot register dataset '{dataset}'")]
    FrozenRegistry { dataset: String },

    /// A fail-update constraint rejected a batch.
    #[error(
        "constraint '{constraint}' failed for dataset '{dataset}': \
         {violations} of {total} rows violated"
    )]
    ConstraintFailed {
        dataset: String,
        constraint: String,
        violations: usize,
        total: usize,
    },

    /// A checkpoint advance moved backwards. Indicates checkpoint
    /// corruption; never silently repaired.
    #[error(
        "non-monotonic checkpoint for '{consumer}' over '{producer}': \
         recorded {recorded}, offered {offered}"
    )]
    NonMonotonicOffset {
        consumer: String,
        producer: String,
        recorded: u64,
        offered: u64,
    },

    /// A dataset's transform failed during evaluation.
    #[error("transform for dataset '{dataset}' failed: {message}")]
    TransformExecution { dataset: String, message: String },

    /// A dataset failed too many cycles in a row.
    #[error("dataset '{dataset}' failed {failures} consecutive cycles")]
    FailureThresholdExceeded { dataset: String, failures: usize },

    /// A cycle was requested while another cycle is still running.
    #[error("an evaluation cycle is already in progress")]
    CycleInProgress,

    /// Storage layer error.
    #[error("storage error: {message}")]
    Storage { message: String },

    /// Arrow error.
    #[error("arrow error: {message}")]
    Arrow { message: String },

    /// I/O error.
    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    /// Invalid argument.
    #[error("invalid argument: {message}")]
    InvalidArgument { message: String },

    /// Internal error (bug in the engine).
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl CascadeError {
    /// Create a duplicate-name error.
    pub fn duplicate_name(dataset: impl Into<String>) -> Self {
        Self::DuplicateName {
            dataset: dataset.into(),
        }
    }

    /// Create an unknown-dataset error.
    pub fn unknown_dataset(dataset: impl Into<String>) -> Self {
        Self::UnknownDataset {
            dataset: dataset.into(),
        }
    }

    /// Create a frozen-registry error.
    pub fn frozen_registry(dataset: impl Into<String>) -> Self {
        Self::FrozenRegistry {
            dataset: dataset.into(),
        }
    }

    /// Create a transform execution error.
    pub fn transform(dataset: impl Into<String>, message: impl Into<String>) -> Self {
        Self::TransformExecution {
            dataset: dataset.into(),
            message: message.into(),
        }
    }

    /// Create a storage error.
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }

    /// Create an invalid argument error.
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// True for errors that must stop the whole run rather than a single
    /// dataset's cycle.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::NonMonotonicOffset { .. } | Self::FailureThresholdExceeded { .. }
        )
    }
}

impl From<arrow::error::ArrowError> for CascadeError {
    fn from(err: arrow::error::ArrowError) -> Self {
        Self::Arrow {
            message: err.to_string(),
        }
    }
}

/// Result type alias for Cascade operations.
pub type Result<T> = std::result::Result<T, CascadeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages_name_datasets() {
        let err = CascadeError::unknown_dataset("orders_raw");
        assert!(err.to_string().contains("orders_raw"));

        let err = CascadeError::CyclicDependency {
            cycle: vec!["a".into(), "b".into(), "a".into()],
        };
        assert_eq!(err.to_string(), "cyclic dependency: a -> b -> a");
    }

    #[test]
    fn test_constraint_failed_carries_counts() {
        let err = CascadeError::ConstraintFailed {
            dataset: "orders".into(),
            constraint: "valid_id".into(),
            violations: 3,
            total: 10,
        };
        let msg = err.to_string();
        assert!(msg.contains("3 of 10"));
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_fatal_classification() {
        let err = CascadeError::NonMonotonicOffset {
            consumer: "a".into(),
            producer: "b".into(),
            recorded: 10,
            offered: 5,
        };
        assert!(err.is_fatal());
    }
}
