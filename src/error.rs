//! Error handling for sl1-to-photon
//!
//! Stages return `anyhow` results so context can be layered on as an error
//! travels up the pipeline. The failure categories callers need to tell
//! apart live in [`ConvertError`] and can be recovered with [`find_convert_error`].

use anyhow::Context;
use std::path::{Path, PathBuf};

pub type Result<T> = anyhow::Result<T>;

/// Extension trait for Results to add context with file paths
pub trait ResultExt<T> {
    /// Add context with file path information
    fn with_path_context<P: AsRef<Path>>(self, operation: &str, path: P) -> Result<T>;

    /// Add context naming the pipeline stage that failed
    fn with_stage_context(self, stage: &str) -> Result<T>;
}

impl<T, E> ResultExt<T> for std::result::Result<T, E>
where
    E: Into<anyhow::Error> + Send + Sync + 'static,
{
    fn with_path_context<P: AsRef<Path>>(self, operation: &str, path: P) -> Result<T> {
        self.map_err(|e| e.into())
            .with_context(|| format!("Failed to {} file: {}", operation, path.as_ref().display()))
    }

    fn with_stage_context(self, stage: &str) -> Result<T> {
        self.map_err(|e| e.into())
            .with_context(|| format!("{} stage failed", stage))
    }
}

/// Specific error types for conversion operations
#[derive(Debug, thiserror::Error)]
pub enum ConvertError {
    #[error("Not a readable SL1 archive: {reason}")]
    Archive { reason: String },

    #[error("Archive does not contain {entry}")]
    MissingConfig { entry: String },

    #[error("Malformed configuration at line {line}: {content:?}")]
    ConfigParse { line: usize, content: String },

    #[error("Invalid value for configuration key '{key}': {reason}")]
    ProfileMapping { key: String, reason: String },

    #[error("No {label} thumbnail in archive")]
    ThumbnailNotFound { label: String },

    #[error("Thumbnail {label} could not be decoded: {reason}")]
    ThumbnailDecode { label: String, reason: String },

    #[error("Layer {index} ({}) failed to convert: {reason}", .path.display())]
    LayerConversion {
        index: usize,
        path: PathBuf,
        reason: String,
    },

    #[error("Layer encoding failed: {reason}")]
    Encode { reason: String },

    #[error("File {} already exists, use -f to overwrite", .path.display())]
    OutputCollision { path: PathBuf },
}

impl ConvertError {
    /// Whether the conversion may continue after this error
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ConvertError::ThumbnailNotFound { .. } | ConvertError::ThumbnailDecode { .. }
        )
    }
}

/// Find the typed conversion error anywhere in an error's context chain
pub fn find_convert_error(err: &anyhow::Error) -> Option<&ConvertError> {
    err.chain().find_map(|cause| cause.downcast_ref::<ConvertError>())
}
