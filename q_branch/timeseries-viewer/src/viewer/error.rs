//! Error taxonomy for the viewer engine.
//!
//! Stale events and empty viewport ranges are not errors: the former are
//! reported as `EventOutcome::Stale`, the latter reset to the full extent.

/// Errors surfaced by sources, the plot state and the session store.
#[derive(Debug, thiserror::Error)]
pub enum ViewerError {
    /// A selection referenced a series absent from the dataset schema.
    #[error("series '{0}' not found in dataset")]
    SeriesNotFound(String),

    #[error("too many subplots ({requested}), limit is {max}")]
    TooManySubplots { requested: usize, max: usize },

    #[error("subplot group {0} does not exist")]
    UnknownGroup(usize),

    /// A viewport change arrived while no selection is applied.
    #[error("no selection applied")]
    NoSelection,

    /// The token is unknown to the session store; the caller must re-issue
    /// a selection to rebuild its state.
    #[error("state not found for session '{0}'")]
    SessionExpired(String),

    #[error("column '{0}' missing from dataset")]
    MissingColumn(String),

    #[error("column '{column}' has unsupported type {data_type}")]
    UnsupportedColumn { column: String, data_type: String },

    #[error("unsupported dataset format: {0}")]
    UnsupportedFormat(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parquet error: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),

    #[error("Arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),

    #[error("background task failed: {0}")]
    Task(String),
}

impl ViewerError {
    /// Storage-level failures, as opposed to rejected requests.
    pub fn is_storage(&self) -> bool {
        matches!(
            self,
            ViewerError::Io(_) | ViewerError::Parquet(_) | ViewerError::Arrow(_)
        )
    }
}

pub type Result<T, E = ViewerError> = std::result::Result<T, E>;
