//! Error types shared across promptloom crates.
//!
//! Uses `thiserror` for ergonomic error definitions.

use thiserror::Error;

/// Raised by a registered source resolver.
///
/// The engine treats these as bugs in the caller's resolver and propagates
/// them out of `render` untouched.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SourceError {
    #[error("source '{source_name}' failed: {reason}")]
    Failed { source_name: String, reason: String },

    #[error("invalid arguments for source '{source_name}': {reason}")]
    InvalidArgs { source_name: String, reason: String },
}

impl SourceError {
    pub fn failed(source_name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Failed {
            source_name: source_name.into(),
            reason: reason.into(),
        }
    }

    pub fn invalid_args(source_name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidArgs {
            source_name: source_name.into(),
            reason: reason.into(),
        }
    }
}

/// Result type alias for resolver calls.
pub type SourceResult<T> = std::result::Result<T, SourceError>;
