//! Error types for ContentPipe.
//!
//! Each pipeline stage returns its own `thiserror` enum; [`ContentPipeError`]
//! covers configuration, filesystem, and URL validation failures shared by all
//! crates. App crates (cli) wrap everything with `color-eyre`.

use std::path::PathBuf;

use crate::canonical::UrlError;

/// Top-level error type for non-stage ContentPipe operations.
#[derive(Debug, thiserror::Error)]
pub enum ContentPipeError {
    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Data validation error (schema mismatch, invalid format, etc.).
    #[error("validation error: {message}")]
    Validation { message: String },

    /// A URL could not be canonicalized.
    #[error(transparent)]
    Url(#[from] UrlError),
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, ContentPipeError>;

impl ContentPipeError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}
