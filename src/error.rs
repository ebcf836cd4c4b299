//! Error types for the pavement AI pipeline.
//!
//! One enum covers the whole crate so that errors compose across the
//! dataset, training, registry and serving layers without wrapper types.

use thiserror::Error;

/// Errors that can occur anywhere in the pipeline.
#[derive(Error, Debug)]
pub enum PavementError {
    /// Image bytes could not be decoded
    #[error("Failed to decode image: {0}")]
    Decode(String),

    /// Decoded image has unusable dimensions
    #[error("Invalid image dimensions: {0}")]
    Dimension(String),

    /// Not enough samples to assemble a dataset
    #[error("Insufficient data: {0}")]
    InsufficientData(String),

    /// A stratified split could not satisfy its constraints
    #[error("Stratification failed: {0}")]
    Stratification(String),

    /// Architecture spec names an unknown or invalid backbone
    #[error("Unsupported architecture: {0}")]
    UnsupportedArchitecture(String),

    /// Learned ensemble requested with too small a validation slice
    #[error("Insufficient validation data: {0}")]
    InsufficientValidationData(String),

    /// Training ended in a failed state (e.g. NaN loss)
    #[error("Training failed: {0}")]
    Training(String),

    /// Requested model version does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Registry refused to overwrite an existing version
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Configuration is invalid
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Model export failed (recorder or size budget)
    #[error("Export failed: {0}")]
    Export(String),

    /// Underlying I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for PavementError {
    fn from(err: serde_json::Error) -> Self {
        PavementError::Serialization(err.to_string())
    }
}

impl From<image::ImageError> for PavementError {
    fn from(err: image::ImageError) -> Self {
        PavementError::Decode(err.to_string())
    }
}

/// Convenience result type used throughout the crate.
pub type Result<T> = std::result::Result<T, PavementError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = PavementError::NotFound("model version v0042".to_string());
        assert_eq!(err.to_string(), "Not found: model version v0042");

        let err = PavementError::Dimension("1x1 below minimum side of 2".to_string());
        assert!(err.to_string().contains("Invalid image dimensions"));
    }

    #[test]
    fn test_from_io_error() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: PavementError = io.into();
        assert!(matches!(err, PavementError::Io(_)));
    }

    #[test]
    fn test_from_serde_error() {
        let json_err = serde_json::from_str::<serde_json::Value>("not json").unwrap_err();
        let err: PavementError = json_err.into();
        assert!(matches!(err, PavementError::Serialization(_)));
    }
}
