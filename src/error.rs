//! Error types for the PGGAN trainer

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for this crate
pub type Result<T> = std::result::Result<T, PgganError>;

/// Main error type for the library
///
/// Configuration and resume errors are raised before the first training step;
/// numeric errors abort a run that is already in progress.
#[derive(Error, Debug)]
pub enum PgganError {
    /// Unknown adversarial loss selector
    #[error("Invalid/Unsupported GAN: {0}")]
    UnsupportedGan(String),

    /// A resolution option is not a power of two
    #[error("{name} must be a power of two, got {value}")]
    NotPowerOfTwo { name: &'static str, value: u32 },

    /// Target resolution is smaller than the first resolution
    #[error("target resolution {target} is below first resolution {first}")]
    TargetBelowFirst { first: u32, target: u32 },

    /// Any other invalid option value
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Checkpoint tag could not be parsed
    #[error("Malformed checkpoint tag '{0}', expected e.g. 128x128-fade_in-105000")]
    MalformedTag(String),

    /// A checkpoint artifact or run directory required for resuming is missing
    #[error("Missing resume artifact: {}", .0.display())]
    MissingArtifact(PathBuf),

    /// Non-finite or undefined value produced while training
    #[error("Numeric error: {0}")]
    Numeric(String),

    /// Tensor or array shape mismatch
    #[error("Shape error: {0}")]
    Shape(String),

    /// Failure reported by a network or data backend
    #[error("Backend error: {0}")]
    Backend(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// TOML deserialization error
    #[error("TOML parse error: {0}")]
    TomlDe(#[from] toml::de::Error),

    /// TOML serialization error
    #[error("TOML write error: {0}")]
    TomlSer(#[from] toml::ser::Error),

    /// CSV error
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// Image encoding error
    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    /// libtorch error
    #[cfg(feature = "tch")]
    #[error("Torch error: {0}")]
    Tch(#[from] tch::TchError),
}

impl PgganError {
    /// Whether the error belongs to the startup taxonomy (configuration or resume)
    pub fn is_startup_error(&self) -> bool {
        matches!(
            self,
            PgganError::UnsupportedGan(_)
                | PgganError::NotPowerOfTwo { .. }
                | PgganError::TargetBelowFirst { .. }
                | PgganError::Config(_)
                | PgganError::MalformedTag(_)
                | PgganError::MissingArtifact(_)
        )
    }
}

impl From<ndarray::ShapeError> for PgganError {
    fn from(err: ndarray::ShapeError) -> Self {
        PgganError::Shape(err.to_string())
    }
}
