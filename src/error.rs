//! Error types for the preprocessing and search engine

use thiserror::Error;

/// Result type alias for preprocessing and search operations
pub type Result<T> = std::result::Result<T, PrepError>;

/// Main error type
#[derive(Error, Debug)]
pub enum PrepError {
    #[error("Data error: {0}")]
    DataError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Resource {resource} has no fitted entry for {key}")]
    ResourceNotFitted { resource: String, key: String },

    #[error("Dropped multiframe: {0}")]
    DroppedMultiframe(String),

    #[error("Column not found: {0}")]
    ColumnNotFound(String),

    #[error("Block not found: {0}")]
    BlockNotFound(String),

    #[error("Invalid shape: expected {expected}, got {actual}")]
    ShapeError { expected: String, actual: String },

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Custom code error: {0}")]
    CustomCodeError(String),

    #[error("Candidate evaluation failed: {0}")]
    CandidateError(String),

    #[error("Computation error: {0}")]
    ComputationError(String),
}

impl PrepError {
    pub(crate) fn not_fitted(resource: &str, key: &str) -> Self {
        PrepError::ResourceNotFitted {
            resource: resource.to_string(),
            key: key.to_string(),
        }
    }
}

impl From<polars::error::PolarsError> for PrepError {
    fn from(err: polars::error::PolarsError) -> Self {
        PrepError::DataError(err.to_string())
    }
}

impl From<serde_json::Error> for PrepError {
    fn from(err: serde_json::Error) -> Self {
        PrepError::SerializationError(err.to_string())
    }
}

impl From<ndarray::ShapeError> for PrepError {
    fn from(err: ndarray::ShapeError) -> Self {
        PrepError::ShapeError {
            expected: "valid shape".to_string(),
            actual: err.to_string(),
        }
    }
}
