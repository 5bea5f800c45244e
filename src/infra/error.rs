//! Error types for the sequencer infrastructure

use thiserror::Error;

use crate::domain::{DirectoryId, LogId, MapIndex, Watermark};

/// Errors that can occur in the sequencer
#[derive(Error, Debug)]
pub enum SequencerError {
    /// Database error
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// No batch definition exists for this revision
    #[error("batch not found: {directory_id}@{revision}")]
    BatchNotFound {
        directory_id: DirectoryId,
        revision: u64,
    },

    /// A different batch definition was already written for this revision
    #[error("batch definition conflict: {directory_id}@{revision} already defined with different sources")]
    BatchConflict {
        directory_id: DirectoryId,
        revision: u64,
    },

    /// Directory unknown to a backend
    #[error("directory not found: {0}")]
    DirectoryNotFound(DirectoryId),

    /// Map revision not found
    #[error("map revision not found: {directory_id}@{revision}")]
    RevisionNotFound {
        directory_id: DirectoryId,
        revision: u64,
    },

    /// History is inconsistent (non-contiguous slices, duplicate leaves, ...)
    #[error("integrity violation: {0}")]
    IntegrityViolation(String),

    /// A signature or proof from a backend did not verify
    #[error("verification failed: {0}")]
    Verification(String),

    /// The call cannot proceed yet (e.g. an earlier revision is still pending)
    #[error("failed precondition: {0}")]
    FailedPrecondition(String),

    /// Backend temporarily unavailable
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// Caller cancelled the operation
    #[error("operation cancelled")]
    Cancelled,

    /// Operation did not finish in time
    #[error("deadline exceeded: {0}")]
    DeadlineExceeded(String),

    /// Invalid request arguments
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Sequenced leaf index already holds different data
    #[error("log leaf {index} already holds different data")]
    LeafConflict { index: u64 },

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Internal error
    #[error("internal error: {0}")]
    Internal(String),
}

/// Coarse classification used by retry loops and the API layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Try again later with the same arguments
    Transient,
    /// Non-deterministic history detected, needs operator attention
    Integrity,
    /// Backend returned unverifiable data
    Verification,
    /// Caller supplied bad input
    InvalidInput,
    /// Referenced resource does not exist
    NotFound,
    /// Caller cancelled or timed out
    Cancelled,
    /// Bug or misconfiguration
    Internal,
}

impl SequencerError {
    pub fn class(&self) -> ErrorClass {
        match self {
            SequencerError::Database(e) => {
                if super::retry::is_retryable_db_error(e) {
                    ErrorClass::Transient
                } else {
                    ErrorClass::Internal
                }
            }
            SequencerError::FailedPrecondition(_) | SequencerError::Unavailable(_) => {
                ErrorClass::Transient
            }
            SequencerError::BatchConflict { .. }
            | SequencerError::IntegrityViolation(_)
            | SequencerError::LeafConflict { .. } => ErrorClass::Integrity,
            SequencerError::Verification(_) => ErrorClass::Verification,
            SequencerError::InvalidArgument(_) => ErrorClass::InvalidInput,
            SequencerError::BatchNotFound { .. }
            | SequencerError::DirectoryNotFound(_)
            | SequencerError::RevisionNotFound { .. } => ErrorClass::NotFound,
            SequencerError::Cancelled | SequencerError::DeadlineExceeded(_) => {
                ErrorClass::Cancelled
            }
            SequencerError::Serialization(_)
            | SequencerError::Configuration(_)
            | SequencerError::Internal(_) => ErrorClass::Internal,
        }
    }

    /// Whether the same call may be retried immediately.
    ///
    /// Verification failures are not: the periodic driver re-runs the whole
    /// step on its next tick instead.
    pub fn is_retryable(&self) -> bool {
        matches!(self.class(), ErrorClass::Transient | ErrorClass::Cancelled)
    }
}

/// Result type for sequencer operations
pub type Result<T> = std::result::Result<T, SequencerError>;

/// Per-item mutation errors. Logged and excluded, never fatal to a revision.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MutationError {
    /// Payload could not be decoded
    #[error("malformed mutation at {log_id}/{watermark}: {reason}")]
    Malformed {
        log_id: LogId,
        watermark: Watermark,
        reason: String,
    },

    /// Candidate targets another index than the one it was grouped under
    #[error("mutation targets {actual}, grouped under {expected}")]
    WrongIndex { expected: MapIndex, actual: MapIndex },

    /// Candidate signature did not verify
    #[error("invalid signature on mutation for {0}")]
    InvalidSignature(MapIndex),

    /// Existing leaf value could not be decoded
    #[error("existing leaf for {index} is unreadable: {reason}")]
    CorruptLeaf { index: MapIndex, reason: String },

    /// Every candidate for the index was rejected
    #[error("no valid mutation for {0}")]
    NoValidCandidate(MapIndex),
}
