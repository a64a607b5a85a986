//! Structured error types for batch execution
//!
//! Provides typed error categorization for chunk processing, scheduling,
//! and result merging, with source chaining so callers can recover both
//! the original processor error and the attempt count.

use thiserror::Error;

use crate::job::PhaseError;

/// Result alias for batch operations
pub type BatchResult<T> = Result<T, BatchError>;

/// Main error type for batch execution
#[derive(Debug, Error)]
pub enum BatchError {
    /// A chunk's processor failed after exhausting its retries
    #[error("chunk {index} failed after {attempts} attempt(s)")]
    ChunkProcessing {
        index: usize,
        attempts: u32,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Fail-fast mode halted the batch after one chunk's terminal failure
    #[error("batch aborted: chunk {index} failed terminally and continue_on_error is off")]
    Aborted {
        index: usize,
        #[source]
        source: Box<BatchError>,
    },

    /// The job was cancelled before completion
    #[error("batch cancelled before completion")]
    Cancelled,

    /// A protocol call outside chunk processing (init/complete) failed after
    /// exhausting its retries
    #[error("{phase} call failed after {attempts} attempt(s)")]
    Protocol {
        phase: &'static str,
        attempts: u32,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error(transparent)]
    Merge(#[from] MergeError),

    #[error(transparent)]
    Phase(#[from] PhaseError),
}

impl BatchError {
    /// Build a `ChunkProcessing` error from the caller's processor error.
    pub fn chunk(index: usize, attempts: u32, source: anyhow::Error) -> Self {
        BatchError::ChunkProcessing {
            index,
            attempts,
            source: source.into(),
        }
    }

    /// Build a `Protocol` error from a failed init/complete call.
    pub fn protocol(phase: &'static str, attempts: u32, source: anyhow::Error) -> Self {
        BatchError::Protocol {
            phase,
            attempts,
            source: source.into(),
        }
    }

    /// Chunk index the error is tied to, if any.
    pub fn chunk_index(&self) -> Option<usize> {
        match self {
            BatchError::ChunkProcessing { index, .. } => Some(*index),
            BatchError::Aborted { index, .. } => Some(*index),
            _ => None,
        }
    }

    /// Attempt count carried by a `ChunkProcessing` error, walking through
    /// an `Aborted` wrapper if needed.
    pub fn attempts(&self) -> Option<u32> {
        match self {
            BatchError::ChunkProcessing { attempts, .. } => Some(*attempts),
            BatchError::Aborted { source, .. } => source.attempts(),
            BatchError::Protocol { attempts, .. } => Some(*attempts),
            _ => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, BatchError::Cancelled)
    }
}

/// Error from the default result-merge decision table
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MergeError {
    /// First result's shape has no default strategy
    #[error("no default merge strategy for {kind} results; supply a custom merge function")]
    NoStrategy { kind: &'static str },

    /// Results mix shapes the table cannot reconcile
    #[error("cannot merge {offending} result at position {index} into {first} results")]
    Mixed {
        first: &'static str,
        offending: &'static str,
        index: usize,
    },

    /// Nothing settled successfully, so there is nothing to merge
    #[error("result set is empty, nothing to merge")]
    Empty,

    /// A caller-supplied merge function reported a failure
    #[error("custom merge failed: {reason}")]
    Custom { reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[test]
    fn chunk_error_carries_index_and_attempts() {
        let err = BatchError::chunk(4, 3, anyhow!("connection refused"));
        assert_eq!(err.chunk_index(), Some(4));
        assert_eq!(err.attempts(), Some(3));
        assert!(err.to_string().contains("chunk 4"));
        assert!(err.to_string().contains("3 attempt"));
    }

    #[test]
    fn aborted_wraps_the_triggering_failure() {
        let inner = BatchError::chunk(1, 2, anyhow!("boom"));
        let err = BatchError::Aborted {
            index: 1,
            source: Box::new(inner),
        };
        assert_eq!(err.chunk_index(), Some(1));
        assert_eq!(err.attempts(), Some(2));
        let source = std::error::Error::source(&err);
        assert!(source.is_some());
    }

    #[test]
    fn source_chain_reaches_the_processor_error() {
        let err = BatchError::chunk(0, 1, anyhow!("original cause"));
        let source = std::error::Error::source(&err)
            .map(|s| s.to_string())
            .unwrap_or_default();
        assert!(source.contains("original cause"));
    }

    #[test]
    fn protocol_error_names_the_phase() {
        let err = BatchError::protocol("complete", 3, anyhow!("receiver gone"));
        assert_eq!(err.attempts(), Some(3));
        assert_eq!(err.chunk_index(), None);
        assert!(err.to_string().contains("complete call failed"));
    }

    #[test]
    fn merge_error_messages_name_the_shapes() {
        let err = MergeError::Mixed {
            first: "string",
            offending: "array",
            index: 2,
        };
        assert!(err.to_string().contains("string"));
        assert!(err.to_string().contains("array"));
        assert!(!BatchError::from(err).is_cancelled());
    }
}
