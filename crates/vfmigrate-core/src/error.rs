use thiserror::Error;

use crate::tracker::TrackerError;
use crate::versioning::CacheError;
use crate::writer::SinkError;

#[derive(Error, Debug)]
pub enum PipelineError {
    /// A required input was absent where the pipeline's contract guarantees
    /// it. Never counted toward the skip limit.
    #[error("contract violation: {0}")]
    Contract(String),

    #[error("infrastructure failure after {attempts} attempt(s): {message}")]
    Infrastructure { attempts: u32, message: String },

    #[error("skip limit of {limit} exceeded after {skipped} item-level failures")]
    SkipLimitExceeded { limit: usize, skipped: usize },

    #[error("Tracker operation failed: {0}")]
    Tracker(#[from] TrackerError),

    #[error("Entity sink operation failed: {0}")]
    Sink(#[from] SinkError),

    #[error("Recency cache operation failed: {0}")]
    Cache(#[from] CacheError),

    #[cfg(feature = "runtime")]
    #[error("Database query failed: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("File I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV parsing error: {0}")]
    Csv(#[from] csv::Error),

    #[error("XML parsing error: {0}")]
    Xml(String),

    #[error("JSON serialization/deserialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl PipelineError {
    pub fn is_transient(&self) -> bool {
        match self {
            PipelineError::Tracker(err) => err.is_transient(),
            PipelineError::Sink(err) => err.is_transient(),
            PipelineError::Cache(err) => err.is_transient(),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
