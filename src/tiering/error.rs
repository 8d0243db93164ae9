//! Error taxonomy for the tiering engine.
//!
//! [`StoreError`] is what index and bulk backends report; the retry helper
//! uses [`StoreError::is_transient`] to decide whether another attempt is
//! worth making. [`TierError`] is what the migration and retrieval paths
//! surface once retries are exhausted.

use std::time::Duration;
use thiserror::Error;

use crate::types::{InvalidRecord, RecordId};

/// Failure reported by an index or bulk store backend
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("store call timed out after {0:?}")]
    Timeout(Duration),

    #[error("corrupt data: {0}")]
    Corrupt(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("backend error: {0}")]
    Backend(String),
}

impl StoreError {
    /// Errors that may succeed on a later attempt
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_) | StoreError::Timeout(_))
    }
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;

        match err.kind() {
            ErrorKind::NotFound => StoreError::NotFound(err.to_string()),
            ErrorKind::AlreadyExists => StoreError::AlreadyExists(err.to_string()),
            ErrorKind::TimedOut
            | ErrorKind::Interrupted
            | ErrorKind::WouldBlock
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::ConnectionRefused => StoreError::Unavailable(err.to_string()),
            ErrorKind::InvalidInput | ErrorKind::InvalidData => {
                StoreError::InvalidInput(err.to_string())
            }
            _ => StoreError::Backend(err.to_string()),
        }
    }
}

/// Errors surfaced by the tiering engine
#[derive(Debug, Error)]
pub enum TierError {
    /// No index entry exists for the id
    #[error("record {0} not found")]
    NotFound(RecordId),

    /// Lost an optimistic-concurrency race.
    ///
    /// Never returned: the archiver turns a failed conditional update into
    /// `ArchiveOutcome::Skipped`. Kept so the label exists for callers that
    /// classify index outcomes themselves.
    #[error("record {0} changed tier concurrently")]
    ConditionFailed(RecordId),

    #[error("bulk write failed for record {id}: {source}")]
    BulkWriteFailed {
        id: RecordId,
        #[source]
        source: StoreError,
    },

    #[error("bulk verification failed for record {id}: {reason}")]
    BulkVerifyFailed { id: RecordId, reason: String },

    /// Pointer flip failed after the bulk copy was written; the copy is kept
    #[error("index update failed for record {id}: {source}")]
    IndexUpdateFailed {
        id: RecordId,
        #[source]
        source: StoreError,
    },

    /// Archived payload could not be fetched within the retry budget
    #[error("archived payload for record {id} is unavailable: {source}")]
    TierUnavailable {
        id: RecordId,
        #[source]
        source: StoreError,
    },

    /// Index could not be read or written within the retry budget
    #[error("index unavailable for record {id}: {source}")]
    IndexUnavailable {
        id: RecordId,
        #[source]
        source: StoreError,
    },

    /// `now - archive_after` falls outside the representable time range
    #[error("archive threshold {0} puts the sweep cutoff out of range")]
    CutoffOutOfRange(chrono::Duration),

    #[error("index scan failed: {0}")]
    ScanFailed(#[source] StoreError),

    #[error("record {0} already exists")]
    DuplicateId(RecordId),

    #[error("invalid record: {0}")]
    InvalidRecord(#[from] InvalidRecord),
}

impl TierError {
    /// Stable label for dead letters and metrics
    pub fn kind(&self) -> &'static str {
        match self {
            TierError::NotFound(_) => "not_found",
            TierError::ConditionFailed(_) => "condition_failed",
            TierError::BulkWriteFailed { .. } => "bulk_write_failed",
            TierError::BulkVerifyFailed { .. } => "bulk_verify_failed",
            TierError::IndexUpdateFailed { .. } => "index_update_failed",
            TierError::TierUnavailable { .. } => "tier_unavailable",
            TierError::IndexUnavailable { .. } => "index_unavailable",
            TierError::CutoffOutOfRange(_) => "cutoff_out_of_range",
            TierError::ScanFailed(_) => "scan_failed",
            TierError::DuplicateId(_) => "duplicate_id",
            TierError::InvalidRecord(_) => "invalid_record",
        }
    }
}
