//! Error types for etherfeed-sync

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("node unavailable: {0}")]
    NodeUnavailable(String),

    #[error("inconsistent block data at height {height}: {message}")]
    InconsistentBlockData { height: u64, message: String },

    #[error("trace unavailable for block {0}")]
    TraceUnavailable(u64),

    #[error("chain reorganization error: {0}")]
    Reorg(String),

    #[error("sink write failure: {0}")]
    SinkWrite(String),

    #[error("classification error: {0}")]
    Classification(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("generic error: {0}")]
    Generic(#[from] anyhow::Error),
}

impl SyncError {
    /// Transient errors are retried by the tracker; everything else is
    /// either handled internally (reorg, trace degradation) or fatal for
    /// the affected stream.
    pub fn is_transient(&self) -> bool {
        matches!(self, SyncError::NodeUnavailable(_))
    }
}

pub type SyncResult<T> = Result<T, SyncError>;
