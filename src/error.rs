/// Error types shared by every pipeline stage.

use thiserror::Error;

/// Errors raised by the data pipeline.
///
/// "Nothing matched" outcomes (no pixels selected, no regions extracted,
/// an outlier spectrum) are never errors; they are empty results.
#[derive(Debug, Error)]
pub enum HappyError {
    /// Unsupported operation, unknown class name or malformed pipeline definition.
    #[error("configuration error: {0}")]
    Config(String),

    /// Two arrays that must line up do not.
    #[error("shape mismatch in {context}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        /// Where the mismatch was detected.
        context: String,
        /// Shape required by the operation.
        expected: Vec<usize>,
        /// Shape actually supplied.
        actual: Vec<usize>,
    },

    /// Required input (sample, reference cube, metadata) is absent.
    #[error("missing data: {0}")]
    MissingData(String),

    /// `apply`/`predict` called before `fit`.
    #[error("{0} has not been fitted")]
    NotFitted(String),

    /// Index beyond the available repeats/folds.
    #[error("{what} index {index} out of range (available: {len})")]
    OutOfRange {
        /// What was being indexed.
        what: &'static str,
        /// Requested index.
        index: usize,
        /// Number of available entries.
        len: usize,
    },

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Mask image decoding error.
    #[error("image error: {0}")]
    Image(#[from] image::ImageError),
}

impl HappyError {
    /// Creates a configuration error.
    pub fn config(reason: impl Into<String>) -> Self {
        Self::Config(reason.into())
    }

    /// Creates a shape mismatch error.
    pub fn shape_mismatch(context: impl Into<String>, expected: &[usize], actual: &[usize]) -> Self {
        Self::ShapeMismatch {
            context: context.into(),
            expected: expected.to_vec(),
            actual: actual.to_vec(),
        }
    }

    /// Creates a missing data error.
    pub fn missing(reason: impl Into<String>) -> Self {
        Self::MissingData(reason.into())
    }

    /// Creates a not-fitted error for the named component.
    pub fn not_fitted(component: impl Into<String>) -> Self {
        Self::NotFitted(component.into())
    }

    /// Whether a batch run may skip the current sample and carry on.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::ShapeMismatch { .. } | Self::MissingData(_) | Self::Io(_) | Self::Image(_)
        )
    }
}

/// Result type for pipeline operations.
pub type Result<T> = std::result::Result<T, HappyError>;
