//! Error kinds that callers may want to match on.
//!
//! Most operations return `anyhow::Result` and attach context as they go.
//! The variants here are the conditions worth recovering with
//! `err.downcast_ref::<kdf::Error>()`.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("{what} not found: {}", path.display())]
    NotFound { what: &'static str, path: PathBuf },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("'{tool}' failed: {message}")]
    ToolFailed { tool: String, message: String },
}

impl Error {
    pub fn not_found(what: &'static str, path: impl Into<PathBuf>) -> Self {
        Self::NotFound {
            what,
            path: path.into(),
        }
    }

    /// Returns true for any `NotFound` variant.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}
