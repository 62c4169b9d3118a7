//! Error Handling Module
//!
//! Defines the error taxonomy for ISUP grading runs.
//! Uses thiserror for ergonomic error definitions.
//!
//! None of the domain errors are recovered locally: they abort the current
//! fold (or the whole run, when raised before training starts).

use std::path::PathBuf;

use thiserror::Error;

/// Main error type for grading operations
#[derive(Error, Debug)]
pub enum GradingError {
    /// Ordinal label outside the ISUP domain 0..=5
    #[error("Invalid ISUP grade {0}: expected a value in 0..=5")]
    InvalidGrade(i64),

    /// A fold id has no validation rows
    #[error("Fold {fold} has no validation examples (fold count {fold_count})")]
    EmptyFold { fold: usize, fold_count: usize },

    /// A provider subgroup is absent from a validation split
    #[error("Provider '{provider}' has no examples in this validation split")]
    InsufficientData { provider: String },

    /// No checkpoint was recorded for a fold
    #[error("No checkpoint found in '{0}'")]
    CheckpointNotFound(PathBuf),

    /// Error loading or processing a tile image
    #[error("Failed to load image at '{0}': {1}")]
    ImageLoad(PathBuf, String),

    /// Error with dataset operations
    #[error("Dataset error: {0}")]
    Dataset(String),

    /// Checkpoint save/load failure
    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    /// Tensor data could not be read back
    #[error("Tensor error: {0}")]
    Tensor(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// CSV read/write error
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Convenience Result type for grading operations
pub type Result<T> = std::result::Result<T, GradingError>;

impl From<serde_json::Error> for GradingError {
    fn from(err: serde_json::Error) -> Self {
        GradingError::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for GradingError {
    fn from(err: toml::de::Error) -> Self {
        GradingError::Config(err.to_string())
    }
}

impl From<toml::ser::Error> for GradingError {
    fn from(err: toml::ser::Error) -> Self {
        GradingError::Serialization(err.to_string())
    }
}

impl From<image::ImageError> for GradingError {
    fn from(err: image::ImageError) -> Self {
        GradingError::Dataset(err.to_string())
    }
}

/// Extension trait for adding context to errors
pub trait ResultExt<T> {
    /// Add context to an error
    fn context(self, msg: &str) -> Result<T>;

    /// Add context with a closure (lazy evaluation)
    fn with_context<F: FnOnce() -> String>(self, f: F) -> Result<T>;
}

impl<T, E: std::fmt::Debug> ResultExt<T> for std::result::Result<T, E> {
    fn context(self, msg: &str) -> Result<T> {
        self.map_err(|e| GradingError::Dataset(format!("{}: {:?}", msg, e)))
    }

    fn with_context<F: FnOnce() -> String>(self, f: F) -> Result<T> {
        self.map_err(|e| GradingError::Dataset(format!("{}: {:?}", f(), e)))
    }
}
